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

//! Shadow-copy change detection for framebuffer updates.
//!
//! The cache keeps a private copy of the pixels the client last saw and,
//! on each update request, compares the live buffer against it one
//! scanline at a time. Line granularity keeps the comparison cheap and
//! maps naturally onto raw encoding's row-major layout; consecutive
//! changed lines coalesce into one rectangle, since every rectangle costs
//! a 12-byte header on the wire.

use std::sync::Arc;

use log::trace;

use crate::framebuffer::Framebuffer;
use crate::protocol::Rect;
use crate::session::{UpdateBatch, UpdateRequest};

/// Shadow copy of the last-sent pixels for one framebuffer instance.
///
/// Owned 1:1 by the session's update state and replaced wholesale when
/// the framebuffer instance changes.
pub struct FramebufferCache {
    framebuffer: Arc<Framebuffer>,
    cached: Vec<u8>,
    line_invalid: Vec<bool>,
}

impl FramebufferCache {
    /// Creates a zero-initialized shadow for `framebuffer`.
    #[must_use]
    pub fn new(framebuffer: Arc<Framebuffer>) -> Self {
        let bpp = framebuffer.format().bytes_per_pixel();
        let cached =
            vec![0u8; usize::from(framebuffer.width()) * usize::from(framebuffer.height()) * bpp];
        let line_invalid = vec![false; usize::from(framebuffer.height())];
        Self {
            framebuffer,
            cached,
            line_invalid,
        }
    }

    /// The framebuffer instance this shadow mirrors.
    #[must_use]
    pub fn framebuffer(&self) -> &Arc<Framebuffer> {
        &self.framebuffer
    }

    /// Whether this shadow belongs to exactly `framebuffer`.
    ///
    /// The shadow is only meaningful for the instance it was built from;
    /// the session replaces the cache on mismatch.
    #[must_use]
    pub fn is_bound_to(&self, framebuffer: &Arc<Framebuffer>) -> bool {
        Arc::ptr_eq(&self.framebuffer, framebuffer)
    }

    /// Diffs the requested region against the shadow and queues the
    /// changed area into `batch`.
    ///
    /// Incremental requests emit one rectangle per maximal run of changed
    /// scanlines, each as wide as the request region; non-incremental
    /// requests emit the whole clamped region. Either way the shadow is
    /// brought up to date with the live pixels. Returns true if any
    /// rectangle was queued.
    pub async fn respond_to_update_request(
        &mut self,
        request: &UpdateRequest,
        batch: &mut UpdateBatch,
    ) -> bool {
        let region = request
            .region
            .clamped(self.framebuffer.width(), self.framebuffer.height());
        if region.is_empty() {
            return false;
        }

        let bpp = self.framebuffer.format().bytes_per_pixel();
        let live_stride = self.framebuffer.stride();
        let shadow_stride = usize::from(self.framebuffer.width()) * bpp;
        let row_len = usize::from(region.width) * bpp;

        {
            let data = self.framebuffer.data().read().await;
            for row in 0..usize::from(region.height) {
                let y = usize::from(region.y) + row;
                let live_off = y * live_stride + usize::from(region.x) * bpp;
                let shadow_off = y * shadow_stride + usize::from(region.x) * bpp;

                let live = &data[live_off..live_off + row_len];
                let shadow = &mut self.cached[shadow_off..shadow_off + row_len];
                let changed = live != shadow;
                if changed {
                    shadow.copy_from_slice(live);
                }
                self.line_invalid[row] = changed;
            }
        }

        let before = batch.len();
        if request.incremental {
            let mut run_start: Option<u16> = None;
            for row in 0..region.height {
                if self.line_invalid[usize::from(row)] {
                    if run_start.is_none() {
                        run_start = Some(row);
                    }
                } else if let Some(start) = run_start.take() {
                    batch.invalidate(Rect::new(
                        region.x,
                        region.y + start,
                        region.width,
                        row - start,
                    ));
                }
            }
            // Flush the run still open at the last line.
            if let Some(start) = run_start {
                batch.invalidate(Rect::new(
                    region.x,
                    region.y + start,
                    region.width,
                    region.height - start,
                ));
            }
        } else {
            batch.invalidate(region);
        }

        let queued = batch.len() - before;
        trace!(
            "diff pass over ({},{} {}x{}): {} rectangle(s) queued",
            region.x,
            region.y,
            region.width,
            region.height,
            queued
        );
        queued > 0
    }
}
