// Copyright 2026 The rfbsession Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! VNC challenge/response authentication pieces.
//!
//! The session only transports the 16-byte challenge and response; the
//! accept/reject decision belongs to the embedder. This module supplies
//! the two halves most embedders want ready-made: a random challenge
//! source and the classic DES verification (RFC 6143 Section 7.2.2, with
//! the VNC bit-reversed key quirk).
//!
//! VNC Authentication is a legacy scheme; use it on trusted networks or
//! under an encrypted tunnel.

use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::Rng;

/// Source of the 16-byte challenge sent during security negotiation.
///
/// The provider can be swapped per session, but only before security
/// negotiation completes.
pub trait PasswordChallenge: Send + Sync {
    /// Produces a fresh 16-byte challenge.
    fn generate_challenge(&self) -> [u8; 16];
}

/// Default challenge provider: 16 random bytes per handshake.
#[derive(Debug, Default)]
pub struct RandomChallenge;

impl PasswordChallenge for RandomChallenge {
    fn generate_challenge(&self) -> [u8; 16] {
        let mut rng = rand::rng();
        let mut challenge = [0u8; 16];
        rng.fill(&mut challenge);
        challenge
    }
}

/// Verifies VNC challenge responses against a known password.
///
/// The client encrypts the challenge with DES using the password as key,
/// each key byte bit-reversed; the verifier re-encrypts the challenge the
/// same way and compares.
pub struct VncPasswordVerifier {
    password: String,
}

impl VncPasswordVerifier {
    /// Creates a verifier for the given password.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }

    /// Checks a client's 16-byte response against the challenge it was
    /// derived from.
    #[must_use]
    pub fn verify_response(&self, challenge: &[u8; 16], response: &[u8]) -> bool {
        response == self.encrypt_challenge(challenge)
    }

    /// Encrypts the challenge as two 8-byte DES ECB blocks under the
    /// bit-reversed password key.
    fn encrypt_challenge(&self, challenge: &[u8; 16]) -> [u8; 16] {
        // Password key: up to 8 bytes, zero padded, bits reversed.
        let mut key = [0u8; 8];
        for (slot, &byte) in key.iter_mut().zip(self.password.as_bytes().iter().take(8)) {
            *slot = reverse_bits(byte);
        }

        let cipher = Des::new_from_slice(&key).expect("8-byte key");

        let mut encrypted = [0u8; 16];
        for (chunk, out) in challenge.chunks_exact(8).zip(encrypted.chunks_exact_mut(8)) {
            let mut block = [0u8; 8];
            block.copy_from_slice(chunk);
            let mut block = block.into();
            cipher.encrypt_block(&mut block);
            out.copy_from_slice(&block);
        }
        encrypted
    }
}

/// Reverses the bits within a byte, the historical quirk of VNC's DES
/// key schedule.
fn reverse_bits(byte: u8) -> u8 {
    let mut result = 0u8;
    for i in 0..8 {
        if byte & (1 << i) != 0 {
            result |= 1 << (7 - i);
        }
    }
    result
}
