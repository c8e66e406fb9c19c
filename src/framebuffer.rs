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

//! Framebuffer storage and the pixel source contract.

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, SessionError};
use crate::protocol::PixelFormat;

/// A rectangular array of pixel bytes with a row stride.
///
/// Geometry, pixel format, stride and name are immutable for a given
/// instance; only the pixel bytes change, behind the internal lock. A
/// source that needs different dimensions returns a replacement
/// `Framebuffer` instead.
pub struct Framebuffer {
    width: u16,
    height: u16,
    stride: usize,
    format: PixelFormat,
    name: String,
    data: RwLock<Vec<u8>>,
}

impl Framebuffer {
    /// Creates a zero-filled framebuffer with a tight stride.
    #[must_use]
    pub fn new(width: u16, height: u16, format: PixelFormat, name: impl Into<String>) -> Self {
        let stride = usize::from(width) * format.bytes_per_pixel();
        Self {
            width,
            height,
            stride,
            format,
            name: name.into(),
            data: RwLock::new(vec![0u8; stride * usize::from(height)]),
        }
    }

    /// Wraps an existing pixel buffer with an explicit stride.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::InvalidArgument`] if the stride is
    /// smaller than a row or the buffer shorter than `stride * height`.
    pub fn with_data(
        width: u16,
        height: u16,
        stride: usize,
        format: PixelFormat,
        name: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<Self> {
        if stride < usize::from(width) * format.bytes_per_pixel() {
            return Err(SessionError::InvalidArgument(format!(
                "stride {stride} is smaller than a {width}-pixel row"
            )));
        }
        if data.len() < stride * usize::from(height) {
            return Err(SessionError::InvalidArgument(format!(
                "buffer of {} bytes is smaller than stride {stride} x height {height}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            stride,
            format,
            name: name.into(),
            data: RwLock::new(data),
        })
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.height
    }

    /// Bytes between the start of one row and the next.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Native pixel format of the stored bytes.
    #[must_use]
    pub fn format(&self) -> &PixelFormat {
        &self.format
    }

    /// Desktop name advertised in `ServerInit`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The locked pixel bytes, `stride * height` long.
    #[must_use]
    pub fn data(&self) -> &RwLock<Vec<u8>> {
        &self.data
    }

    /// Copies tightly-packed rows in the framebuffer's own format into
    /// the region at `(x, y)`.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::InvalidArgument`] if the region falls
    /// outside the framebuffer or `pixels` is shorter than
    /// `width * height` pixels.
    pub async fn update_region(
        &self,
        pixels: &[u8],
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    ) -> Result<()> {
        let bpp = self.format.bytes_per_pixel();
        if u32::from(x) + u32::from(width) > u32::from(self.width)
            || u32::from(y) + u32::from(height) > u32::from(self.height)
        {
            return Err(SessionError::InvalidArgument(format!(
                "region ({x},{y} {width}x{height}) outside {}x{} framebuffer",
                self.width, self.height
            )));
        }
        let row_len = usize::from(width) * bpp;
        if pixels.len() < row_len * usize::from(height) {
            return Err(SessionError::InvalidArgument(format!(
                "pixel data of {} bytes is smaller than {width}x{height} region",
                pixels.len()
            )));
        }

        let mut data = self.data.write().await;
        for row in 0..usize::from(height) {
            let dst_off = (usize::from(y) + row) * self.stride + usize::from(x) * bpp;
            data[dst_off..dst_off + row_len]
                .copy_from_slice(&pixels[row * row_len..(row + 1) * row_len]);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Supplies screen contents to a session.
///
/// The session calls [`capture`](Self::capture) under its update lock
/// before assembling each reply. Returning the same `Arc` while the
/// screen geometry is unchanged keeps the session's shadow cache warm;
/// returning a new instance resets it (and, when the dimensions differ,
/// triggers a desktop-size rectangle for clients that understand one).
pub trait FramebufferSource: Send + Sync {
    /// Produces the current framebuffer.
    fn capture(&self) -> Result<Arc<Framebuffer>>;
}
