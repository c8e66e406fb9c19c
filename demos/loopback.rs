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

//! Loopback VNC server example.
//!
//! The session engine is transport-agnostic, so the accept loop lives
//! here in the embedder: each accepted TCP stream gets its own
//! `VncSession` over a shared gradient framebuffer.
//!
//! Usage:
//!   cargo run --example loopback
//!   vncviewer localhost:5900

use std::error::Error;
use std::sync::Arc;

use tokio::net::TcpListener;

use rfbsession::{
    Framebuffer, FramebufferSource, PixelFormat, SessionHandler, SessionOptions, VncSession,
    DEFAULT_PORT,
};

const WIDTH: u16 = 800;
const HEIGHT: u16 = 600;

struct SharedScreen {
    framebuffer: Arc<Framebuffer>,
}

impl FramebufferSource for SharedScreen {
    fn capture(&self) -> rfbsession::Result<Arc<Framebuffer>> {
        Ok(Arc::clone(&self.framebuffer))
    }
}

struct PrintingHandler {
    peer: String,
}

impl SessionHandler for PrintingHandler {
    fn connected(&self) {
        println!("[{}] connected", self.peer);
    }

    fn closed(&self) {
        println!("[{}] closed", self.peer);
    }

    fn key_changed(&self, keysym: u32, pressed: bool) {
        let action = if pressed { "pressed" } else { "released" };
        println!("[{}] key {keysym:#06x} {action}", self.peer);
    }

    fn pointer_changed(&self, x: u16, y: u16, button_mask: u8) {
        if button_mask != 0 {
            println!("[{}] click at ({x}, {y}) buttons {button_mask:03b}", self.peer);
        }
    }

    fn remote_clipboard_changed(&self, text: &str) {
        println!(
            "[{}] clipboard: {}...",
            self.peer,
            text.chars().take(20).collect::<String>()
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    // Gradient test pattern in the server's native 32bpp format.
    let framebuffer = Arc::new(Framebuffer::new(
        WIDTH,
        HEIGHT,
        PixelFormat::rgb888(),
        "rfbsession loopback",
    ));
    let mut pixels = vec![0u8; usize::from(WIDTH) * usize::from(HEIGHT) * 4];
    for y in 0..usize::from(HEIGHT) {
        for x in 0..usize::from(WIDTH) {
            let offset = (y * usize::from(WIDTH) + x) * 4;
            pixels[offset] = 128; // B
            pixels[offset + 1] = (y * 255 / usize::from(HEIGHT)) as u8; // G
            pixels[offset + 2] = (x * 255 / usize::from(WIDTH)) as u8; // R
        }
    }
    framebuffer.update_region(&pixels, 0, 0, WIDTH, HEIGHT).await?;

    let listener = TcpListener::bind(("127.0.0.1", DEFAULT_PORT)).await?;
    println!("listening on 127.0.0.1:{DEFAULT_PORT} - connect with `vncviewer localhost`");

    loop {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        println!("[{addr}] accepted");

        let session = VncSession::new(Arc::new(PrintingHandler {
            peer: addr.to_string(),
        }));
        session.set_framebuffer_source(Some(Arc::new(SharedScreen {
            framebuffer: Arc::clone(&framebuffer),
        })));
        if let Err(err) = session.connect(stream, SessionOptions::default()) {
            eprintln!("[{addr}] failed to start session: {err}");
        }
        // The session's tasks run until the client disconnects; the
        // handle itself is not needed after connect.
        drop(session);
    }
}
