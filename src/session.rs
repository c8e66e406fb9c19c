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

//! The VNC session engine.
//!
//! A [`VncSession`] owns one client connection over an embedder-provided
//! byte stream: it conducts the RFB 3.8 handshake, dispatches client
//! messages on a reader task, and assembles framebuffer-update replies on
//! a rate-capped scheduler task.
//!
//! # Protocol Flow
//!
//! 1. **Handshake**: version banner exchange, security negotiation,
//!    desktop initialization (`ServerInit`).
//! 2. **Message loop**: `SetPixelFormat`, `SetEncodings`,
//!    `FramebufferUpdateRequest`, key/pointer/clipboard events.
//! 3. **Updates**: each pending request is answered from the pixel
//!    source through the shadow-cache diff, as Raw/CopyRect rectangles
//!    plus a desktop-size pseudo rectangle when the geometry changed.
//!
//! Two locks order all shared state: the update lock (pending request,
//! rectangle batch, shadow cache binding, client format and geometry)
//! and the stream write lock (held across each whole outbound message).
//! The update lock is always taken before the write lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::{BufMut, BytesMut};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::auth::{PasswordChallenge, RandomChallenge};
use crate::cache::FramebufferCache;
use crate::error::{Result, SessionError};
use crate::framebuffer::{Framebuffer, FramebufferSource};
use crate::handler::SessionHandler;
use crate::protocol::{
    PixelFormat, Rect, ServerInit, CLIENT_MSG_CLIENT_CUT_TEXT, CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST,
    CLIENT_MSG_KEY_EVENT, CLIENT_MSG_POINTER_EVENT, CLIENT_MSG_SET_ENCODINGS,
    CLIENT_MSG_SET_PIXEL_FORMAT, ENCODING_COPYRECT, ENCODING_DESKTOP_SIZE, ENCODING_RAW,
    MAX_CUT_TEXT, MAX_ENCODING_COUNT, MAX_RECTS_PER_MESSAGE, SECURITY_RESULT_FAILED,
    SECURITY_RESULT_OK, SECURITY_TYPE_NONE, SECURITY_TYPE_VNC_AUTH, SERVER_MSG_BELL,
    SERVER_MSG_FRAMEBUFFER_UPDATE, SERVER_MSG_SERVER_CUT_TEXT,
};
use crate::scheduler::UpdateScheduler;
use crate::wire::{RfbInStream, RfbOutStream};

/// Default cap on update replies per second.
pub const DEFAULT_MAX_UPDATE_RATE: f64 = 15.0;

/// How the session authenticates clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthenticationMethod {
    /// No authentication; any client is accepted.
    #[default]
    None,
    /// VNC challenge/response; the embedder judges the response.
    Password,
}

/// Per-connection options passed to [`VncSession::connect`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Security type offered to the client.
    pub authentication_method: AuthenticationMethod,
}

/// A client's outstanding framebuffer update request.
///
/// At most one is pending per session; it is replaced on receipt and
/// cleared once a reply with at least one rectangle goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRequest {
    /// True when the client only wants changes since its last update.
    pub incremental: bool,
    /// Requested region, clamped to the framebuffer at receipt.
    pub region: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Fresh,
    VersionNegotiated,
    SecurityNegotiated,
    DesktopInitialized,
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum PendingRect {
    Raw(Rect),
    Copy { dst: Rect, src_x: u16, src_y: u16 },
    DesktopSize { width: u16, height: u16 },
}

/// Rectangles accumulating between the begin and end of one update.
///
/// Handed to [`SessionHandler::framebuffer_updating`] and exposed through
/// [`ManualUpdate`]; regions are clamped to the framebuffer on entry.
pub struct UpdateBatch {
    rects: Vec<PendingRect>,
    fb_width: u16,
    fb_height: u16,
    copyrect: bool,
}

impl UpdateBatch {
    fn new(framebuffer: &Framebuffer, copyrect: bool) -> Self {
        Self {
            rects: Vec::new(),
            fb_width: framebuffer.width(),
            fb_height: framebuffer.height(),
            copyrect,
        }
    }

    /// Queues a region to be re-sent as raw pixels.
    pub fn invalidate(&mut self, region: Rect) {
        let clamped = region.clamped(self.fb_width, self.fb_height);
        if !clamped.is_empty() {
            self.rects.push(PendingRect::Raw(clamped));
        }
    }

    /// Queues several regions at once.
    pub fn invalidate_many(&mut self, regions: &[Rect]) {
        for region in regions {
            self.invalidate(*region);
        }
    }

    /// Queues the entire framebuffer.
    pub fn invalidate_all(&mut self) {
        self.invalidate(Rect::new(0, 0, self.fb_width, self.fb_height));
    }

    /// Queues a copy of the region at `(src_x, src_y)` onto `target`.
    ///
    /// Uses CopyRect when the client announced it. Otherwise falls back
    /// to raw invalidation of whichever costs less area: the two disjoint
    /// source and target rectangles, or their union (ties go to the
    /// union).
    pub fn copy_region(&mut self, target: Rect, src_x: u16, src_y: u16) {
        let target = target.clamped(self.fb_width, self.fb_height);
        if target.is_empty() {
            return;
        }
        let src = Rect::new(src_x, src_y, target.width, target.height);
        if src.right() > u32::from(self.fb_width) || src.bottom() > u32::from(self.fb_height) {
            // Source outside the framebuffer: nothing to copy from.
            self.invalidate(target);
            return;
        }

        if self.copyrect {
            self.rects.push(PendingRect::Copy {
                dst: target,
                src_x,
                src_y,
            });
        } else if src.area() + target.area() < src.union(&target).area() {
            self.invalidate(src);
            self.invalidate(target);
        } else {
            self.invalidate(src.union(&target));
        }
    }

    /// Number of queued rectangles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rects.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn for_test(framebuffer: &Framebuffer) -> Self {
        Self::new(framebuffer, false)
    }

    #[cfg(test)]
    pub(crate) fn queued_regions(&self) -> Vec<Rect> {
        self.rects
            .iter()
            .filter_map(|rect| match rect {
                PendingRect::Raw(region) => Some(*region),
                _ => None,
            })
            .collect()
    }
}

/// A manual update in progress; holds the session's update lock.
///
/// Obtained from [`VncSession::begin_update`]. Queue rectangles, then
/// call [`end`](Self::end) to flush them as one reply (dropping the
/// guard without `end` discards the batch).
pub struct ManualUpdate<'a> {
    inner: &'a Arc<SessionInner>,
    state: MutexGuard<'a, UpdateState>,
    batch: UpdateBatch,
}

impl ManualUpdate<'_> {
    /// Queues a region to be re-sent as raw pixels.
    pub fn invalidate(&mut self, region: Rect) {
        self.batch.invalidate(region);
    }

    /// Queues several regions at once.
    pub fn invalidate_many(&mut self, regions: &[Rect]) {
        self.batch.invalidate_many(regions);
    }

    /// Queues the entire framebuffer.
    pub fn invalidate_all(&mut self) {
        self.batch.invalidate_all();
    }

    /// Queues a copy of `(src_x, src_y)` onto `target`; see
    /// [`UpdateBatch::copy_region`].
    pub fn copy_region(&mut self, target: Rect, src_x: u16, src_y: u16) {
        self.batch.copy_region(target, src_x, src_y);
    }

    /// Flushes the batch; returns whether at least one rectangle (a
    /// desktop-size pseudo rectangle included) was sent.
    pub async fn end(self) -> Result<bool> {
        let ManualUpdate {
            inner,
            mut state,
            batch,
        } = self;
        inner.end_update(&mut state, batch).await
    }
}

struct UpdateState {
    framebuffer: Option<Arc<Framebuffer>>,
    cache: Option<FramebufferCache>,
    client_format: PixelFormat,
    client_width: u16,
    client_height: u16,
    client_encodings: Vec<i32>,
    pending_request: Option<UpdateRequest>,
}

impl UpdateState {
    fn new() -> Self {
        Self {
            framebuffer: None,
            cache: None,
            client_format: PixelFormat::rgb888(),
            client_width: 0,
            client_height: 0,
            // Nothing is assumed about the client until SetEncodings
            // arrives; until then CopyRect and DesktopSize are withheld.
            client_encodings: Vec::new(),
            pending_request: None,
        }
    }

    fn supports(&self, encoding: i32) -> bool {
        self.client_encodings.contains(&encoding)
    }
}

type BoxedWriter = RfbOutStream<Box<dyn AsyncWrite + Send + Unpin>>;
type BoxedReader = RfbInStream<Box<dyn AsyncRead + Send + Unpin>>;

struct SessionInner {
    handler: Arc<dyn SessionHandler>,
    writer: Mutex<Option<BoxedWriter>>,
    update: Mutex<UpdateState>,
    source: StdMutex<Option<Arc<dyn FramebufferSource>>>,
    challenge: StdMutex<Arc<dyn PasswordChallenge>>,
    phase: StdMutex<Phase>,
    started: AtomicBool,
    max_update_rate: AtomicU64,
    scheduler: UpdateScheduler,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

fn transport_closed() -> SessionError {
    SessionError::Transport(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "session is not connected",
    ))
}

impl SessionInner {
    fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap() = phase;
    }

    /// Closes out one update: prepends the desktop-size pseudo rectangle
    /// when the client's view of the geometry is stale, encodes every
    /// queued rectangle, and flushes them under the stream write lock as
    /// complete messages of at most 65534 content rectangles each.
    async fn end_update(&self, state: &mut UpdateState, mut batch: UpdateBatch) -> Result<bool> {
        let Some(framebuffer) = state.framebuffer.clone() else {
            return Ok(false);
        };

        if (framebuffer.width() != state.client_width
            || framebuffer.height() != state.client_height)
            && state.supports(ENCODING_DESKTOP_SIZE)
        {
            batch.rects.insert(
                0,
                PendingRect::DesktopSize {
                    width: framebuffer.width(),
                    height: framebuffer.height(),
                },
            );
            state.client_width = framebuffer.width();
            state.client_height = framebuffer.height();
        }
        if batch.rects.is_empty() {
            return Ok(false);
        }

        let client_format = state.client_format;
        let dst_bpp = client_format.bytes_per_pixel();
        let mut encoded: Vec<(Rect, i32, Vec<u8>)> = Vec::with_capacity(batch.rects.len());
        {
            let data = framebuffer.data().read().await;
            for rect in &batch.rects {
                match *rect {
                    PendingRect::Raw(region) => {
                        let row_len = usize::from(region.width) * dst_bpp;
                        let mut payload = vec![0u8; row_len * usize::from(region.height)];
                        crate::translate::copy_rect(
                            &data,
                            framebuffer.width(),
                            framebuffer.stride(),
                            framebuffer.format(),
                            &region,
                            &mut payload,
                            region.width,
                            row_len,
                            &client_format,
                        )?;
                        encoded.push((region, ENCODING_RAW, payload));
                    }
                    PendingRect::Copy { dst, src_x, src_y } => {
                        let mut payload = Vec::with_capacity(4);
                        payload.extend_from_slice(&src_x.to_be_bytes());
                        payload.extend_from_slice(&src_y.to_be_bytes());
                        encoded.push((dst, ENCODING_COPYRECT, payload));
                    }
                    PendingRect::DesktopSize { width, height } => {
                        encoded.push((Rect::new(0, 0, width, height), ENCODING_DESKTOP_SIZE, Vec::new()));
                    }
                }
            }
        }

        let has_desktop_size = matches!(batch.rects.first(), Some(PendingRect::DesktopSize { .. }));

        let mut writer = self.writer.lock().await;
        let Some(out) = writer.as_mut() else {
            return Err(transport_closed());
        };
        let mut index = 0;
        let mut first = true;
        while index < encoded.len() {
            // The pseudo rectangle rides in the reserved slot of the
            // first message.
            let limit = if first && has_desktop_size {
                MAX_RECTS_PER_MESSAGE + 1
            } else {
                MAX_RECTS_PER_MESSAGE
            };
            let end = (index + limit).min(encoded.len());

            let mut msg = BytesMut::new();
            msg.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
            msg.put_u8(0); // padding
            msg.put_u16((end - index) as u16);
            for (region, encoding, payload) in &encoded[index..end] {
                region.write_to(&mut msg);
                msg.put_i32(*encoding);
                msg.put_slice(payload);
            }
            out.write_bytes(&msg);
            out.flush().await?;

            index = end;
            first = false;
        }
        drop(writer);

        state.pending_request = None;
        Ok(true)
    }
}

/// One update pass: capture, diff, flush. Runs as the scheduler action
/// and returns whether a reply went out.
async fn produce_update(inner: Arc<SessionInner>) -> bool {
    let mut state = inner.update.lock().await;
    if state.pending_request.is_none() {
        return false;
    }

    let source = inner.source.lock().unwrap().clone();
    if let Some(source) = source {
        inner.handler.framebuffer_capturing();
        match source.capture() {
            Ok(framebuffer) => state.framebuffer = Some(framebuffer),
            // Capture failures keep the previous frame; they do not tear
            // the session down.
            Err(err) => warn!("framebuffer capture failed, serving the previous frame: {err}"),
        }
    }
    let Some(framebuffer) = state.framebuffer.clone() else {
        return false;
    };

    let mut batch = UpdateBatch::new(&framebuffer, state.supports(ENCODING_COPYRECT));
    let handled = inner.handler.framebuffer_updating(&framebuffer, &mut batch);
    if !handled {
        let rebind = state
            .cache
            .as_ref()
            .map_or(true, |cache| !cache.is_bound_to(&framebuffer));
        if rebind {
            state.cache = Some(FramebufferCache::new(Arc::clone(&framebuffer)));
        }
        if let Some(request) = state.pending_request {
            if let Some(cache) = state.cache.as_mut() {
                cache.respond_to_update_request(&request, &mut batch).await;
            }
        }
    }

    match inner.end_update(&mut state, batch).await {
        Ok(sent) => {
            inner.handler.framebuffer_updated(sent);
            sent
        }
        Err(err) => {
            error!("failed to send framebuffer update: {err}");
            let _ = inner.shutdown.send(true);
            false
        }
    }
}

async fn handshake(
    inner: &Arc<SessionInner>,
    ins: &mut BoxedReader,
    options: &SessionOptions,
) -> Result<()> {
    // Version exchange.
    {
        let mut writer = inner.writer.lock().await;
        let Some(out) = writer.as_mut() else {
            return Err(transport_closed());
        };
        out.write_version(3, 8);
        out.flush().await?;
    }
    let (major, minor) = ins.read_version().await?;
    debug!("client protocol version {major}.{minor}");
    inner.set_phase(Phase::VersionNegotiated);

    // Security negotiation. Anything but 3.8 gets an empty offer, which
    // fails the handshake right after the count byte goes out.
    let offered: &[u8] = if (major, minor) == (3, 8) {
        match options.authentication_method {
            AuthenticationMethod::Password => &[SECURITY_TYPE_VNC_AUTH],
            AuthenticationMethod::None => &[SECURITY_TYPE_NONE],
        }
    } else {
        &[]
    };
    {
        let mut writer = inner.writer.lock().await;
        let Some(out) = writer.as_mut() else {
            return Err(transport_closed());
        };
        out.write_u8(offered.len() as u8);
        for &method in offered {
            out.write_u8(method);
        }
        out.flush().await?;
    }
    if offered.is_empty() {
        return Err(SessionError::NoSupportedAuthenticationMethods);
    }

    let selection = ins.read_u8().await?;
    if !offered.contains(&selection) {
        return Err(SessionError::UnrecognizedProtocolElement(format!(
            "security type {selection} was not offered"
        )));
    }

    let accepted = if selection == SECURITY_TYPE_VNC_AUTH {
        let challenge = inner.challenge.lock().unwrap().clone().generate_challenge();
        {
            let mut writer = inner.writer.lock().await;
            let Some(out) = writer.as_mut() else {
                return Err(transport_closed());
            };
            out.write_bytes(&challenge);
            out.flush().await?;
        }
        let mut response = [0u8; 16];
        ins.read_bytes(&mut response).await?;
        inner.handler.password_provided(&challenge, &response)
    } else {
        true
    };
    {
        let mut writer = inner.writer.lock().await;
        let Some(out) = writer.as_mut() else {
            return Err(transport_closed());
        };
        out.write_u32(if accepted {
            SECURITY_RESULT_OK
        } else {
            SECURITY_RESULT_FAILED
        });
        out.flush().await?;
    }
    if !accepted {
        return Err(SessionError::AuthenticationFailed);
    }
    // The password challenge provider is frozen from here on.
    inner.set_phase(Phase::SecurityNegotiated);

    // Desktop initialization.
    let shared = ins.read_u8().await?;
    inner.handler.creating_desktop(shared != 0);

    let source = inner
        .source
        .lock()
        .unwrap()
        .clone()
        .ok_or_else(|| SessionError::SanityCheck("no framebuffer source".to_string()))?;
    let framebuffer = source.capture()?;

    let init = ServerInit {
        framebuffer_width: framebuffer.width(),
        framebuffer_height: framebuffer.height(),
        pixel_format: *framebuffer.format(),
        name: framebuffer.name().to_string(),
    };
    {
        let mut state = inner.update.lock().await;
        state.client_format = *framebuffer.format();
        state.client_width = framebuffer.width();
        state.client_height = framebuffer.height();
        state.framebuffer = Some(framebuffer);
    }
    {
        let mut writer = inner.writer.lock().await;
        let Some(out) = writer.as_mut() else {
            return Err(transport_closed());
        };
        let mut buf = BytesMut::new();
        init.write_to(&mut buf);
        out.write_bytes(&buf);
        out.flush().await?;
    }
    inner.set_phase(Phase::DesktopInitialized);
    info!(
        "handshake complete: {}x{} \"{}\"",
        init.framebuffer_width, init.framebuffer_height, init.name
    );
    Ok(())
}

async fn dispatch_one(inner: &Arc<SessionInner>, ins: &mut BoxedReader) -> Result<()> {
    let msg_type = ins.read_u8().await?;
    match msg_type {
        CLIENT_MSG_SET_PIXEL_FORMAT => {
            ins.skip(3).await?;
            let format = ins.read_pixel_format().await?;
            if !format.is_valid() {
                return Err(SessionError::UnrecognizedProtocolElement(format!(
                    "unsupported pixel format ({}bpp, true_color={})",
                    format.bits_per_pixel, format.true_color
                )));
            }
            debug!(
                "client pixel format: {}bpp depth {} big_endian {}",
                format.bits_per_pixel, format.depth, format.big_endian
            );
            inner.update.lock().await.client_format = format;
        }
        CLIENT_MSG_SET_ENCODINGS => {
            ins.skip(1).await?;
            let count = usize::from(ins.read_u16().await?);
            if count > MAX_ENCODING_COUNT {
                return Err(SessionError::SanityCheck(format!(
                    "encoding count {count} exceeds limit {MAX_ENCODING_COUNT}"
                )));
            }
            let mut encodings = Vec::with_capacity(count);
            for _ in 0..count {
                encodings.push(ins.read_i32().await?);
            }
            debug!("client announced {count} encoding(s): {encodings:?}");
            inner.update.lock().await.client_encodings = encodings;
        }
        CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
            let incremental = ins.read_u8().await? != 0;
            let region = ins.read_rect().await?;

            let mut state = inner.update.lock().await;
            if let Some(framebuffer) = &state.framebuffer {
                let clamped = region.clamped(framebuffer.width(), framebuffer.height());
                if !clamped.is_empty() {
                    state.pending_request = Some(UpdateRequest {
                        incremental,
                        region: clamped,
                    });
                    drop(state);
                    inner.scheduler.signal();
                }
            }
        }
        CLIENT_MSG_KEY_EVENT => {
            let pressed = ins.read_u8().await? != 0;
            ins.skip(2).await?;
            let keysym = ins.read_u32().await?;
            inner.handler.key_changed(keysym, pressed);
        }
        CLIENT_MSG_POINTER_EVENT => {
            let button_mask = ins.read_u8().await?;
            let x = ins.read_u16().await?;
            let y = ins.read_u16().await?;
            inner.handler.pointer_changed(x, y, button_mask);
        }
        CLIENT_MSG_CLIENT_CUT_TEXT => {
            ins.skip(3).await?;
            let text = ins.read_string(MAX_CUT_TEXT).await?;
            inner.handler.remote_clipboard_changed(&text);
        }
        other => {
            return Err(SessionError::UnrecognizedProtocolElement(format!(
                "unknown client message type {other}"
            )));
        }
    }
    Ok(())
}

async fn drive<S>(inner: &Arc<SessionInner>, stream: S, options: SessionOptions) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut ins: BoxedReader = RfbInStream::new(Box::new(read_half));
    *inner.writer.lock().await = Some(RfbOutStream::new(Box::new(write_half)));

    handshake(inner, &mut ins, &options).await?;

    inner.set_phase(Phase::Running);
    inner.handler.connected();

    let action_inner = Arc::clone(inner);
    let rate_inner = Arc::clone(inner);
    inner.scheduler.start(
        move || produce_update(Arc::clone(&action_inner)),
        move || f64::from_bits(rate_inner.max_update_rate.load(Ordering::Relaxed)),
        false,
    );

    loop {
        dispatch_one(inner, &mut ins).await?;
    }
}

async fn run_session<S>(inner: Arc<SessionInner>, stream: S, options: SessionOptions)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut shutdown = inner.shutdown_rx.clone();
    let result = tokio::select! {
        _ = shutdown.changed() => Ok(()),
        result = drive(&inner, stream, options) => result,
    };

    // Teardown: stop the scheduler, drop the stream halves, fire exactly
    // one terminal notification.
    inner.scheduler.stop().await;
    *inner.writer.lock().await = None;
    let was_running = {
        let mut phase = inner.phase.lock().unwrap();
        let was = *phase == Phase::Running;
        *phase = Phase::Closed;
        was
    };
    match result {
        Ok(()) => inner.handler.closed(),
        Err(err) if was_running => {
            info!("session ended: {err}");
            inner.handler.closed();
        }
        Err(err) => {
            warn!("connection failed: {err}");
            inner.handler.connection_failed(&err);
        }
    }
}

/// A server-side VNC session over one embedder-provided byte stream.
///
/// Construct with a [`SessionHandler`], attach a
/// [`FramebufferSource`], then [`connect`](Self::connect) the stream.
/// The session owns two tasks from then on: a reader dispatching client
/// messages and the update scheduler answering update requests.
pub struct VncSession {
    inner: Arc<SessionInner>,
}

impl VncSession {
    /// Creates an unconnected session delivering notifications to
    /// `handler`.
    #[must_use]
    pub fn new(handler: Arc<dyn SessionHandler>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                handler,
                writer: Mutex::new(None),
                update: Mutex::new(UpdateState::new()),
                source: StdMutex::new(None),
                challenge: StdMutex::new(Arc::new(RandomChallenge)),
                phase: StdMutex::new(Phase::Fresh),
                started: AtomicBool::new(false),
                max_update_rate: AtomicU64::new(DEFAULT_MAX_UPDATE_RATE.to_bits()),
                scheduler: UpdateScheduler::new(),
                shutdown,
                shutdown_rx,
                reader: StdMutex::new(None),
            }),
        }
    }

    /// Starts the session over `stream`.
    ///
    /// Spawns the reader task, which performs the handshake and then
    /// dispatches client messages until the stream ends or
    /// [`close`](Self::close) is called. Must be called within a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::InvalidArgument`] if the session was
    /// already started.
    pub fn connect<S>(&self, stream: S, options: SessionOptions) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::InvalidArgument(
                "session was already started".to_string(),
            ));
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_session(inner, stream, options));
        *self.inner.reader.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Sets or clears the pixel source consulted on each update pass.
    pub fn set_framebuffer_source(&self, source: Option<Arc<dyn FramebufferSource>>) {
        *self.inner.source.lock().unwrap() = source;
    }

    /// Hints that the source contents changed; wakes the scheduler.
    pub fn framebuffer_changed(&self) {
        self.inner.scheduler.signal();
    }

    /// Current cap on update replies per second.
    #[must_use]
    pub fn max_update_rate(&self) -> f64 {
        f64::from_bits(self.inner.max_update_rate.load(Ordering::Relaxed))
    }

    /// Changes the update rate cap (frames per second).
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::InvalidArgument`], leaving the rate
    /// unchanged, unless `rate` is positive and finite.
    pub fn set_max_update_rate(&self, rate: f64) -> Result<()> {
        if !(rate > 0.0) || !rate.is_finite() {
            return Err(SessionError::InvalidArgument(format!(
                "max update rate must be a positive number, got {rate}"
            )));
        }
        self.inner
            .max_update_rate
            .store(rate.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Replaces the password challenge provider.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::InvalidArgument`] once security
    /// negotiation has completed; the provider is frozen from then on.
    pub fn set_password_challenge(&self, provider: Arc<dyn PasswordChallenge>) -> Result<()> {
        if self.inner.phase() >= Phase::SecurityNegotiated {
            return Err(SessionError::InvalidArgument(
                "password challenge provider is frozen after security negotiation".to_string(),
            ));
        }
        *self.inner.challenge.lock().unwrap() = provider;
        Ok(())
    }

    /// Begins a manual update, taking the session's update lock.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::SanityCheck`] before the session has a
    /// framebuffer.
    pub async fn begin_update(&self) -> Result<ManualUpdate<'_>> {
        let state = self.inner.update.lock().await;
        let Some(framebuffer) = state.framebuffer.clone() else {
            return Err(SessionError::SanityCheck(
                "no framebuffer to update".to_string(),
            ));
        };
        let batch = UpdateBatch::new(&framebuffer, state.supports(ENCODING_COPYRECT));
        Ok(ManualUpdate {
            inner: &self.inner,
            state,
            batch,
        })
    }

    /// Rings the client's bell.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::Transport`] when the session is not
    /// connected or the write fails.
    pub async fn bell(&self) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let Some(out) = writer.as_mut() else {
            return Err(transport_closed());
        };
        out.write_u8(SERVER_MSG_BELL);
        out.flush().await
    }

    /// Sends the local clipboard text to the client.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::Transport`] when the session is not
    /// connected or the write fails.
    pub async fn send_clipboard(&self, text: &str) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let Some(out) = writer.as_mut() else {
            return Err(transport_closed());
        };
        out.write_u8(SERVER_MSG_SERVER_CUT_TEXT);
        out.write_bytes(&[0u8; 3]);
        out.write_string(text);
        out.flush().await
    }

    /// Closes the session and waits for its tasks to exit.
    ///
    /// Idempotent. Unblocks any pending read by dropping the stream. May
    /// be called from a task spawned inside a handler callback.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        let handle = self.inner.reader.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        } else {
            self.inner.set_phase(Phase::Closed);
        }
    }
}
