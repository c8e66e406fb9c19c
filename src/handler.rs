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

//! Embedder-facing session callbacks.

use crate::error::SessionError;
use crate::framebuffer::Framebuffer;
use crate::session::UpdateBatch;

/// Receives session notifications and answers its decisions.
///
/// Callbacks run synchronously on the session's reader or update task;
/// implementations must be thread-safe and quick. Every method has a
/// default so embedders implement only what they need.
pub trait SessionHandler: Send + Sync {
    /// A VNC authentication round completed; decide whether the 16-byte
    /// `response` is a valid encryption of `challenge`.
    ///
    /// [`VncPasswordVerifier`](crate::auth::VncPasswordVerifier) covers
    /// the standard check. The default rejects.
    fn password_provided(&self, _challenge: &[u8; 16], _response: &[u8; 16]) -> bool {
        false
    }

    /// The client sent its init message; `shared` is the shared-desktop
    /// flag.
    fn creating_desktop(&self, _shared: bool) {}

    /// The handshake completed and the session is running.
    fn connected(&self) {}

    /// The session failed before it finished connecting.
    fn connection_failed(&self, _error: &SessionError) {}

    /// A previously connected session ended.
    fn closed(&self) {}

    /// An update pass is about to capture from the pixel source.
    fn framebuffer_capturing(&self) {}

    /// An update pass is assembling rectangles for `framebuffer`.
    ///
    /// Return `true` to take over assembly: the engine skips its shadow
    /// cache diff and sends whatever the handler pushed into `update`.
    /// Return `false` (the default) for automatic change detection.
    fn framebuffer_updating(&self, _framebuffer: &Framebuffer, _update: &mut UpdateBatch) -> bool {
        false
    }

    /// An update pass finished; `sent_changes` reports whether a reply
    /// went out.
    fn framebuffer_updated(&self, _sent_changes: bool) {}

    /// The client pressed or released a key.
    fn key_changed(&self, _keysym: u32, _pressed: bool) {}

    /// The client moved the pointer or changed its buttons.
    fn pointer_changed(&self, _x: u16, _y: u16, _button_mask: u8) {}

    /// The client's clipboard changed.
    fn remote_clipboard_changed(&self, _text: &str) {}
}
