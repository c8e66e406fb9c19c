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

//! Error types for the session engine.

use std::io;
use thiserror::Error;

/// Errors raised by a VNC session or its embedder-facing API.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The underlying stream failed or ended unexpectedly.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// The peer sent an ill-formed or unsupported value at a position the
    /// protocol defines.
    #[error("unrecognized protocol element: {0}")]
    UnrecognizedProtocolElement(String),

    /// The intersection of offered and configured security types is empty.
    #[error("no supported authentication methods")]
    NoSupportedAuthenticationMethods,

    /// The embedder rejected the client's credentials.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// A self-consistency check failed (missing framebuffer, impossibly
    /// large count, ...).
    #[error("sanity check failed: {0}")]
    SanityCheck(String),

    /// The embedder misused the session API.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl SessionError {
    /// Returns true if the session never produced a usable connection
    /// (handshake-stage failures).
    #[must_use]
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Self::NoSupportedAuthenticationMethods | Self::AuthenticationFailed
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SessionError>;
