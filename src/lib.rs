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

//! # rfbsession
//!
//! A single-session RFB (Remote Framebuffer / VNC) server engine in pure
//! Rust. The embedder supplies an established bidirectional byte stream
//! and a pixel source; the session conducts the RFB 3.8 handshake
//! (RFC 6143), serves framebuffer updates, and reports input and
//! clipboard events back through a handler trait.
//!
//! ## Features
//!
//! - **RFB 3.8 handshake**: version negotiation, None or VNC
//!   challenge/response security, desktop initialization
//! - **Shadow-cache diffing**: line-granular change detection so
//!   incremental updates carry only what changed
//! - **Raw, CopyRect and DesktopSize encodings**, with the CopyRect
//!   fallback and resize advertisement handled for you
//! - **Rate-capped updates**: a signal-driven scheduler bounds reply
//!   frequency without busy idling
//! - **Transport-agnostic**: any `AsyncRead + AsyncWrite` stream — TCP,
//!   unix sockets, TLS, in-memory pipes
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rfbsession::{
//!     Framebuffer, FramebufferSource, PixelFormat, SessionHandler, SessionOptions, VncSession,
//! };
//!
//! struct Screen(Arc<Framebuffer>);
//!
//! impl FramebufferSource for Screen {
//!     fn capture(&self) -> rfbsession::Result<Arc<Framebuffer>> {
//!         Ok(Arc::clone(&self.0))
//!     }
//! }
//!
//! struct Printer;
//!
//! impl SessionHandler for Printer {
//!     fn key_changed(&self, keysym: u32, pressed: bool) {
//!         println!("key {keysym:#x} pressed={pressed}");
//!     }
//! }
//!
//! # async fn example(stream: tokio::io::DuplexStream) -> rfbsession::Result<()> {
//! let framebuffer = Arc::new(Framebuffer::new(1280, 720, PixelFormat::rgb888(), "demo"));
//! let session = VncSession::new(Arc::new(Printer));
//! session.set_framebuffer_source(Some(Arc::new(Screen(framebuffer))));
//! session.connect(stream, SessionOptions::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Your Application             │
//! │                                         │
//! │  • Owns the transport and accept loop   │
//! │  • Supplies framebuffers on capture     │
//! │  • Receives input events                │
//! └──────────────────┬──────────────────────┘
//!                    │
//!                    ▼
//! ┌─────────────────────────────────────────┐
//! │           VncSession (public)           │
//! │                                         │
//! │  reader task          scheduler task    │
//! │  • handshake          • rate cap        │
//! │  • dispatch           • capture + diff  │
//! └──────────┬─────────────────┬────────────┘
//!            ▼                 ▼
//!   ┌────────────────┐  ┌────────────────┐
//!   │ Wire codec     │  │ Shadow cache   │
//!   │ (big-endian)   │  │ (line diff)    │
//!   └────────────────┘  └────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod cache;
pub mod error;
pub mod framebuffer;
pub mod handler;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod translate;
pub mod wire;

// Re-exports
pub use auth::{PasswordChallenge, RandomChallenge, VncPasswordVerifier};
pub use cache::FramebufferCache;
pub use error::{Result, SessionError};
pub use framebuffer::{Framebuffer, FramebufferSource};
pub use handler::SessionHandler;
pub use protocol::{PixelFormat, Rect};
pub use scheduler::UpdateScheduler;
pub use session::{
    AuthenticationMethod, ManualUpdate, SessionOptions, UpdateBatch, UpdateRequest, VncSession,
    DEFAULT_MAX_UPDATE_RATE,
};

/// RFB protocol version served by this crate.
pub const PROTOCOL_VERSION: &str = protocol::PROTOCOL_VERSION;

/// Default VNC port, for embedders that listen on TCP.
pub const DEFAULT_PORT: u16 = 5900;
