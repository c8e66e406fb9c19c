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

//! End-to-end session tests: a raw-byte RFB client on one end of an
//! in-memory duplex stream, the session engine on the other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use rfbsession::{
    AuthenticationMethod, Framebuffer, FramebufferSource, PixelFormat, Rect, SessionError,
    SessionHandler, SessionOptions, VncSession,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    CreatingDesktop(bool),
    Connected,
    ConnectionFailed,
    Closed,
    Capturing,
    Updated(bool),
    Key(u32, bool),
    Pointer(u16, u16, u8),
    Clipboard(String),
}

struct RecordingHandler {
    events: mpsc::UnboundedSender<Event>,
}

impl SessionHandler for RecordingHandler {
    fn password_provided(&self, _challenge: &[u8; 16], response: &[u8; 16]) -> bool {
        response[0] == 0x42
    }

    fn creating_desktop(&self, shared: bool) {
        let _ = self.events.send(Event::CreatingDesktop(shared));
    }

    fn connected(&self) {
        let _ = self.events.send(Event::Connected);
    }

    fn connection_failed(&self, _error: &SessionError) {
        let _ = self.events.send(Event::ConnectionFailed);
    }

    fn closed(&self) {
        let _ = self.events.send(Event::Closed);
    }

    fn framebuffer_capturing(&self) {
        let _ = self.events.send(Event::Capturing);
    }

    fn framebuffer_updated(&self, sent_changes: bool) {
        let _ = self.events.send(Event::Updated(sent_changes));
    }

    fn key_changed(&self, keysym: u32, pressed: bool) {
        let _ = self.events.send(Event::Key(keysym, pressed));
    }

    fn pointer_changed(&self, x: u16, y: u16, button_mask: u8) {
        let _ = self.events.send(Event::Pointer(x, y, button_mask));
    }

    fn remote_clipboard_changed(&self, text: &str) {
        let _ = self.events.send(Event::Clipboard(text.to_string()));
    }
}

struct StaticSource {
    framebuffer: Mutex<Arc<Framebuffer>>,
}

impl StaticSource {
    fn new(framebuffer: Arc<Framebuffer>) -> Self {
        Self {
            framebuffer: Mutex::new(framebuffer),
        }
    }

    fn replace(&self, framebuffer: Arc<Framebuffer>) {
        *self.framebuffer.lock().unwrap() = framebuffer;
    }
}

impl FramebufferSource for StaticSource {
    fn capture(&self) -> rfbsession::Result<Arc<Framebuffer>> {
        Ok(Arc::clone(&self.framebuffer.lock().unwrap()))
    }
}

struct TestSession {
    session: VncSession,
    source: Arc<StaticSource>,
    events: mpsc::UnboundedReceiver<Event>,
    client: DuplexStream,
}

fn start_session(framebuffer: Arc<Framebuffer>, options: SessionOptions) -> TestSession {
    let (client, server) = tokio::io::duplex(1 << 20);
    let (tx, events) = mpsc::unbounded_channel();
    let source = Arc::new(StaticSource::new(framebuffer));

    let session = VncSession::new(Arc::new(RecordingHandler { events: tx }));
    session.set_framebuffer_source(Some(Arc::clone(&source) as Arc<dyn FramebufferSource>));
    session.connect(server, options).unwrap();

    TestSession {
        session,
        source,
        events,
        client,
    }
}

async fn wait_for_event(events: &mut mpsc::UnboundedReceiver<Event>, want: &Event) {
    loop {
        let got = tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if got == *want {
            return;
        }
    }
}

async fn read_u8(client: &mut DuplexStream) -> u8 {
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).await.unwrap();
    buf[0]
}

async fn read_u16(client: &mut DuplexStream) -> u16 {
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    u16::from_be_bytes(buf)
}

async fn read_u32(client: &mut DuplexStream) -> u32 {
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    u32::from_be_bytes(buf)
}

async fn read_i32(client: &mut DuplexStream) -> i32 {
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    i32::from_be_bytes(buf)
}

async fn read_vec(client: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    client.read_exact(&mut buf).await.unwrap();
    buf
}

/// Runs the client side of a no-auth handshake and returns the
/// `ServerInit` contents.
async fn client_handshake(client: &mut DuplexStream) -> (u16, u16, String) {
    let banner = read_vec(client, 12).await;
    assert_eq!(&banner, b"RFB 003.008\n");
    client.write_all(b"RFB 003.008\n").await.unwrap();

    assert_eq!(read_u8(client).await, 1, "one security type offered");
    assert_eq!(read_u8(client).await, 1, "security type None");
    client.write_all(&[1]).await.unwrap();
    assert_eq!(read_u32(client).await, 0, "security result ok");

    client.write_all(&[1]).await.unwrap(); // shared flag

    let width = read_u16(client).await;
    let height = read_u16(client).await;
    let _format = read_vec(client, 16).await;
    let name_len = read_u32(client).await as usize;
    let name = String::from_utf8(read_vec(client, name_len).await).unwrap();
    (width, height, name)
}

async fn send_set_encodings(client: &mut DuplexStream, encodings: &[i32]) {
    let mut msg = vec![2u8, 0];
    msg.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
    for &encoding in encodings {
        msg.extend_from_slice(&encoding.to_be_bytes());
    }
    client.write_all(&msg).await.unwrap();
}

async fn send_update_request(client: &mut DuplexStream, incremental: bool, region: Rect) {
    let mut msg = vec![3u8, u8::from(incremental)];
    msg.extend_from_slice(&region.x.to_be_bytes());
    msg.extend_from_slice(&region.y.to_be_bytes());
    msg.extend_from_slice(&region.width.to_be_bytes());
    msg.extend_from_slice(&region.height.to_be_bytes());
    client.write_all(&msg).await.unwrap();
}

/// Nudges the session with a pointer event and waits for its callback,
/// proving every previously written message was dispatched.
async fn sync_dispatch(client: &mut DuplexStream, events: &mut mpsc::UnboundedReceiver<Event>) {
    client.write_all(&[5u8, 0, 0, 99, 0, 99]).await.unwrap();
    wait_for_event(events, &Event::Pointer(99, 99, 0)).await;
}

#[derive(Debug)]
struct WireRect {
    region: Rect,
    encoding: i32,
    payload: Vec<u8>,
}

/// Reads one `FramebufferUpdate` message; the client pixel format is
/// assumed to still be the 32bpp server native one.
async fn read_update(client: &mut DuplexStream) -> Vec<WireRect> {
    assert_eq!(read_u8(client).await, 0, "FramebufferUpdate type");
    read_u8(client).await; // padding
    let count = read_u16(client).await;

    let mut rects = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let region = Rect::new(
            read_u16(client).await,
            read_u16(client).await,
            read_u16(client).await,
            read_u16(client).await,
        );
        let encoding = read_i32(client).await;
        let payload_len = match encoding {
            0 => usize::from(region.width) * usize::from(region.height) * 4,
            1 => 4,
            -223 => 0,
            other => panic!("unexpected encoding {other}"),
        };
        let payload = read_vec(client, payload_len).await;
        rects.push(WireRect {
            region,
            encoding,
            payload,
        });
    }
    rects
}

async fn expect_eof(client: &mut DuplexStream) {
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
        .await
        .expect("timed out waiting for EOF")
        .unwrap();
    assert_eq!(read, 0, "expected the server to drop the stream");
}

#[tokio::test]
async fn handshake_without_auth_reaches_running() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());

    let (width, height, name) = client_handshake(&mut t.client).await;
    assert_eq!((width, height), (2, 2));
    assert_eq!(name, "t");

    wait_for_event(&mut t.events, &Event::CreatingDesktop(true)).await;
    wait_for_event(&mut t.events, &Event::Connected).await;
}

#[tokio::test]
async fn non_incremental_request_gets_one_raw_rectangle() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());
    client_handshake(&mut t.client).await;

    send_update_request(&mut t.client, false, Rect::new(0, 0, 2, 2)).await;

    let rects = read_update(&mut t.client).await;
    assert_eq!(rects.len(), 1);
    assert_eq!(rects[0].region, Rect::new(0, 0, 2, 2));
    assert_eq!(rects[0].encoding, 0);
    assert_eq!(rects[0].payload, vec![0u8; 16]);

    wait_for_event(&mut t.events, &Event::Capturing).await;
    wait_for_event(&mut t.events, &Event::Updated(true)).await;
}

#[tokio::test]
async fn incremental_request_sends_only_changed_lines() {
    let framebuffer = Arc::new(Framebuffer::new(8, 6, PixelFormat::rgb888(), "t"));
    let mut t = start_session(Arc::clone(&framebuffer), SessionOptions::default());
    client_handshake(&mut t.client).await;

    // Prime the shadow cache with a full update.
    send_update_request(&mut t.client, false, Rect::new(0, 0, 8, 6)).await;
    let rects = read_update(&mut t.client).await;
    assert_eq!(rects.len(), 1);
    assert_eq!(rects[0].region, Rect::new(0, 0, 8, 6));

    // Change row 3, columns 5..8.
    let pixels = [1u8, 2, 3, 0].repeat(3);
    framebuffer.update_region(&pixels, 5, 3, 3, 1).await.unwrap();

    send_update_request(&mut t.client, true, Rect::new(0, 0, 8, 6)).await;
    let rects = read_update(&mut t.client).await;

    // Line granularity: one full-request-width single-line rectangle.
    assert_eq!(rects.len(), 1);
    assert_eq!(rects[0].region, Rect::new(0, 3, 8, 1));
    assert_eq!(rects[0].encoding, 0);
    assert_eq!(&rects[0].payload[5 * 4..8 * 4], &pixels[..]);
    assert_eq!(&rects[0].payload[..5 * 4], &[0u8; 20]);

    // Nothing changed since: an incremental request stays unanswered.
    send_update_request(&mut t.client, true, Rect::new(0, 0, 8, 6)).await;
    wait_for_event(&mut t.events, &Event::Updated(false)).await;
}

#[tokio::test]
async fn copy_region_falls_back_to_raw_without_client_support() {
    let framebuffer = Arc::new(Framebuffer::new(32, 32, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());
    client_handshake(&mut t.client).await;
    wait_for_event(&mut t.events, &Event::Connected).await;

    send_set_encodings(&mut t.client, &[0]).await;
    sync_dispatch(&mut t.client, &mut t.events).await;

    let mut update = t.session.begin_update().await.unwrap();
    update.copy_region(Rect::new(10, 10, 5, 5), 0, 0);
    assert!(update.end().await.unwrap());

    // Source + target raw rectangles (area 50) beat their union (225).
    let rects = read_update(&mut t.client).await;
    assert_eq!(rects.len(), 2);
    assert_eq!(rects[0].region, Rect::new(0, 0, 5, 5));
    assert_eq!(rects[0].encoding, 0);
    assert_eq!(rects[1].region, Rect::new(10, 10, 5, 5));
    assert_eq!(rects[1].encoding, 0);
}

#[tokio::test]
async fn copy_region_uses_copyrect_when_announced() {
    let framebuffer = Arc::new(Framebuffer::new(32, 32, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());
    client_handshake(&mut t.client).await;
    wait_for_event(&mut t.events, &Event::Connected).await;

    send_set_encodings(&mut t.client, &[0, 1]).await;
    sync_dispatch(&mut t.client, &mut t.events).await;

    let mut update = t.session.begin_update().await.unwrap();
    update.copy_region(Rect::new(10, 10, 5, 5), 2, 3);
    assert!(update.end().await.unwrap());

    let rects = read_update(&mut t.client).await;
    assert_eq!(rects.len(), 1);
    assert_eq!(rects[0].region, Rect::new(10, 10, 5, 5));
    assert_eq!(rects[0].encoding, 1);
    assert_eq!(rects[0].payload, vec![0, 2, 0, 3]);
}

#[tokio::test]
async fn desktop_resize_prepends_a_pseudo_rectangle() {
    let small = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(Arc::clone(&small), SessionOptions::default());
    client_handshake(&mut t.client).await;
    wait_for_event(&mut t.events, &Event::Connected).await;

    send_set_encodings(&mut t.client, &[0, -223]).await;
    sync_dispatch(&mut t.client, &mut t.events).await;

    send_update_request(&mut t.client, false, Rect::new(0, 0, 2, 2)).await;
    let rects = read_update(&mut t.client).await;
    assert_eq!(rects.len(), 1, "geometry unchanged, no pseudo rectangle");

    // The source starts returning a larger screen.
    t.source
        .replace(Arc::new(Framebuffer::new(4, 4, PixelFormat::rgb888(), "t")));

    send_update_request(&mut t.client, false, Rect::new(0, 0, 4, 4)).await;
    let rects = read_update(&mut t.client).await;

    assert_eq!(rects.len(), 2);
    assert_eq!(rects[0].region, Rect::new(0, 0, 4, 4));
    assert_eq!(rects[0].encoding, -223);
    assert!(rects[0].payload.is_empty());
    // Content follows, clamped to the geometry the request was made
    // against.
    assert_eq!(rects[1].region, Rect::new(0, 0, 2, 2));
    assert_eq!(rects[1].encoding, 0);
}

#[tokio::test]
async fn oversized_batches_split_into_complete_messages() {
    let framebuffer = Arc::new(Framebuffer::new(4, 4, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());
    client_handshake(&mut t.client).await;
    wait_for_event(&mut t.events, &Event::Connected).await;

    let mut client = t.client;
    let reader = tokio::spawn(async move {
        let first = read_update(&mut client).await;
        let second = read_update(&mut client).await;
        (first.len(), second.len())
    });

    let mut update = t.session.begin_update().await.unwrap();
    for _ in 0..65535 {
        update.invalidate(Rect::new(0, 0, 1, 1));
    }
    assert!(update.end().await.unwrap());

    let (first, second) = reader.await.unwrap();
    assert_eq!(first, 65534);
    assert_eq!(second, 1);
}

#[tokio::test]
async fn password_handshake_accepts_a_valid_response() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(
        framebuffer,
        SessionOptions {
            authentication_method: AuthenticationMethod::Password,
        },
    );

    let banner = read_vec(&mut t.client, 12).await;
    assert_eq!(&banner, b"RFB 003.008\n");
    t.client.write_all(b"RFB 003.008\n").await.unwrap();

    assert_eq!(read_u8(&mut t.client).await, 1);
    assert_eq!(read_u8(&mut t.client).await, 2, "VNC auth offered");
    t.client.write_all(&[2]).await.unwrap();

    let challenge = read_vec(&mut t.client, 16).await;
    assert_eq!(challenge.len(), 16);
    let mut response = [0u8; 16];
    response[0] = 0x42; // the recording handler's accept marker
    t.client.write_all(&response).await.unwrap();

    assert_eq!(read_u32(&mut t.client).await, 0, "security result ok");
    t.client.write_all(&[0]).await.unwrap(); // shared flag off

    let width = read_u16(&mut t.client).await;
    assert_eq!(width, 2);

    wait_for_event(&mut t.events, &Event::CreatingDesktop(false)).await;
    wait_for_event(&mut t.events, &Event::Connected).await;
}

#[tokio::test]
async fn password_handshake_rejects_a_bad_response() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(
        framebuffer,
        SessionOptions {
            authentication_method: AuthenticationMethod::Password,
        },
    );

    read_vec(&mut t.client, 12).await;
    t.client.write_all(b"RFB 003.008\n").await.unwrap();
    read_vec(&mut t.client, 2).await; // count + type
    t.client.write_all(&[2]).await.unwrap();

    read_vec(&mut t.client, 16).await; // challenge
    t.client.write_all(&[0u8; 16]).await.unwrap();

    assert_eq!(read_u32(&mut t.client).await, 1, "security result failed");

    wait_for_event(&mut t.events, &Event::ConnectionFailed).await;
    expect_eof(&mut t.client).await;
}

#[tokio::test]
async fn non_matching_protocol_version_fails_the_handshake() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());

    read_vec(&mut t.client, 12).await;
    t.client.write_all(b"RFB 003.007\n").await.unwrap();

    assert_eq!(read_u8(&mut t.client).await, 0, "empty security offer");

    wait_for_event(&mut t.events, &Event::ConnectionFailed).await;
    expect_eof(&mut t.client).await;
}

#[tokio::test]
async fn unknown_message_type_closes_a_running_session() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());
    client_handshake(&mut t.client).await;
    wait_for_event(&mut t.events, &Event::Connected).await;

    t.client.write_all(&[99u8]).await.unwrap();

    wait_for_event(&mut t.events, &Event::Closed).await;
    expect_eof(&mut t.client).await;
}

#[tokio::test]
async fn input_and_clipboard_events_reach_the_handler() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());
    client_handshake(&mut t.client).await;

    // KeyEvent: pressed XK_a.
    t.client
        .write_all(&[4u8, 1, 0, 0, 0, 0, 0, 0x61])
        .await
        .unwrap();
    // PointerEvent: left button at (7, 9).
    t.client.write_all(&[5u8, 1, 0, 7, 0, 9]).await.unwrap();
    // ClientCutText: "hi".
    t.client
        .write_all(&[6u8, 0, 0, 0, 0, 0, 0, 2, b'h', b'i'])
        .await
        .unwrap();

    wait_for_event(&mut t.events, &Event::Key(0x61, true)).await;
    wait_for_event(&mut t.events, &Event::Pointer(7, 9, 1)).await;
    wait_for_event(&mut t.events, &Event::Clipboard("hi".to_string())).await;
}

#[tokio::test]
async fn bell_and_clipboard_messages_are_framed() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());
    client_handshake(&mut t.client).await;
    wait_for_event(&mut t.events, &Event::Connected).await;

    t.session.bell().await.unwrap();
    assert_eq!(read_u8(&mut t.client).await, 2);

    t.session.send_clipboard("hi").await.unwrap();
    assert_eq!(read_u8(&mut t.client).await, 3);
    read_vec(&mut t.client, 3).await; // padding
    assert_eq!(read_u32(&mut t.client).await, 2);
    assert_eq!(read_vec(&mut t.client, 2).await, b"hi");
}

#[tokio::test]
async fn challenge_provider_is_frozen_after_security() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());

    // Before the handshake the provider may still be swapped.
    t.session
        .set_password_challenge(Arc::new(rfbsession::RandomChallenge))
        .unwrap();

    client_handshake(&mut t.client).await;
    wait_for_event(&mut t.events, &Event::Connected).await;

    let err = t
        .session
        .set_password_challenge(Arc::new(rfbsession::RandomChallenge))
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidArgument(_)));
}

#[tokio::test]
async fn max_update_rate_rejects_non_positive_values() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let t = start_session(framebuffer, SessionOptions::default());

    assert_eq!(t.session.max_update_rate(), 15.0);
    assert!(t.session.set_max_update_rate(0.0).is_err());
    assert!(t.session.set_max_update_rate(-5.0).is_err());
    assert!(t.session.set_max_update_rate(f64::NAN).is_err());
    assert!(t.session.set_max_update_rate(f64::INFINITY).is_err());
    assert_eq!(t.session.max_update_rate(), 15.0, "rejected sets mutate nothing");

    t.session.set_max_update_rate(30.0).unwrap();
    assert_eq!(t.session.max_update_rate(), 30.0);
}

#[tokio::test]
async fn close_is_idempotent_and_drops_the_stream() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let mut t = start_session(framebuffer, SessionOptions::default());
    client_handshake(&mut t.client).await;
    wait_for_event(&mut t.events, &Event::Connected).await;

    t.session.close().await;
    t.session.close().await;

    wait_for_event(&mut t.events, &Event::Closed).await;
    expect_eof(&mut t.client).await;

    assert!(matches!(
        t.session.bell().await.unwrap_err(),
        SessionError::Transport(_)
    ));
}

#[tokio::test]
async fn double_connect_is_rejected() {
    let framebuffer = Arc::new(Framebuffer::new(2, 2, PixelFormat::rgb888(), "t"));
    let t = start_session(framebuffer, SessionOptions::default());

    let (_client, server) = tokio::io::duplex(1024);
    assert!(matches!(
        t.session.connect(server, SessionOptions::default()),
        Err(SessionError::InvalidArgument(_))
    ));
}
