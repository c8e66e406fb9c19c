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

//! RFB protocol constants and wire structures.
//!
//! This module provides the building blocks for the session engine's wire
//! traffic: protocol version, message types, security handshake values,
//! encoding tags, the pixel format descriptor, and rectangle geometry.
//! The subset implemented here follows RFC 6143 (RFB 3.8).

use bytes::{BufMut, BytesMut};

use crate::error::{Result, SessionError};

/// The RFB protocol version string advertised by the server.
///
/// Exactly 12 bytes including the trailing newline, as the protocol
/// requires.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

// Client-to-Server Message Types

/// Message type: client changes the pixel format used for updates.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Message type: client announces the encodings it supports.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Message type: client requests a framebuffer update.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: client sends cut text (clipboard data).
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-Client Message Types

/// Message type: server sends a framebuffer update.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Message type: server rings the client's bell.
pub const SERVER_MSG_BELL: u8 = 2;

/// Message type: server sends cut text (clipboard data).
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Encoding Types

/// Encoding type: raw pixel data in the client's format, row-major.
pub const ENCODING_RAW: i32 = 0;

/// Encoding type: copy an already-displayed region to a new location.
///
/// The payload is the 4-byte big-endian source position.
pub const ENCODING_COPYRECT: i32 = 1;

/// Pseudo-encoding: desktop size change.
///
/// Carries no pixels; the rectangle geometry conveys the new framebuffer
/// extent.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

// Security Types

/// Security type: no authentication.
pub const SECURITY_TYPE_NONE: u8 = 1;

/// Security type: VNC challenge/response authentication.
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

// Security Results

/// Security result: handshake succeeded.
pub const SECURITY_RESULT_OK: u32 = 0;

/// Security result: handshake failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// Upper bound accepted for the `SetEncodings` count field.
///
/// Real clients announce a handful of encodings; anything above this is
/// treated as a corrupt stream.
pub const MAX_ENCODING_COUNT: usize = 511;

/// Upper bound accepted for inbound cut-text length.
pub const MAX_CUT_TEXT: usize = 0x00FF_FFFF;

/// Maximum content rectangles carried by one `FramebufferUpdate` message.
///
/// One slot below the 16-bit count limit, reserved for a prepended
/// desktop-size pseudo rectangle.
pub const MAX_RECTS_PER_MESSAGE: usize = 65534;

/// Describes how a pixel value maps to R/G/B channels.
///
/// Only true-color formats are supported; color-map formats are rejected
/// during dispatch. The serialized form is the protocol's 16-byte blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    /// Storage bits per pixel (8, 16 or 32).
    pub bits_per_pixel: u8,
    /// Significant color bits (sum of the channel widths).
    pub depth: u8,
    /// Byte order of multi-byte pixel words.
    pub big_endian: bool,
    /// True color (direct) versus color map.
    pub true_color: bool,
    /// Maximum red channel value.
    pub red_max: u16,
    /// Maximum green channel value.
    pub green_max: u16,
    /// Maximum blue channel value.
    pub blue_max: u16,
    /// Bit position of the least significant red bit.
    pub red_shift: u8,
    /// Bit position of the least significant green bit.
    pub green_shift: u8,
    /// Bit position of the least significant blue bit.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Standard little-endian 32bpp RGB888: red at bit 16, green at bit 8,
    /// blue at bit 0.
    #[must_use]
    pub fn rgb888() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_color: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Storage bytes per pixel, rounded up to the nearest byte.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel).div_ceil(8)
    }

    /// Checks that the format is one this server can translate: a
    /// true-color format with a supported storage width and non-zero
    /// channel maxes.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self.bits_per_pixel, 8 | 16 | 32)
            && self.true_color
            && self.red_max > 0
            && self.green_max > 0
            && self.blue_max > 0
    }

    /// Serializes the 16-byte pixel format blob.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(u8::from(self.big_endian));
        buf.put_u8(u8::from(self.true_color));
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Decodes a pixel format from its 16-byte serialized form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(SessionError::UnrecognizedProtocolElement(format!(
                "pixel format blob is {} bytes, expected 16",
                bytes.len()
            )));
        }
        Ok(Self {
            bits_per_pixel: bytes[0],
            depth: bytes[1],
            big_endian: bytes[2] != 0,
            true_color: bytes[3] != 0,
            red_max: u16::from_be_bytes([bytes[4], bytes[5]]),
            green_max: u16::from_be_bytes([bytes[6], bytes[7]]),
            blue_max: u16::from_be_bytes([bytes[8], bytes[9]]),
            red_shift: bytes[10],
            green_shift: bytes[11],
            blue_shift: bytes[12],
        })
    }
}

/// A rectangle in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

impl Rect {
    /// Creates a new rectangle.
    #[must_use]
    pub const fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// True if the rectangle covers no pixels.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Right edge (x + width).
    #[must_use]
    pub const fn right(&self) -> u32 {
        self.x as u32 + self.width as u32
    }

    /// Bottom edge (y + height).
    #[must_use]
    pub const fn bottom(&self) -> u32 {
        self.y as u32 + self.height as u32
    }

    /// Covered area in pixels.
    #[must_use]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersects the rectangle with the extent `(0, 0, width, height)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // min() bounds both edges to u16 range
    pub fn clamped(&self, width: u16, height: u16) -> Self {
        let x = self.x.min(width);
        let y = self.y.min(height);
        let right = self.right().min(u32::from(width)) as u16;
        let bottom = self.bottom().min(u32::from(height)) as u16;
        Self {
            x,
            y,
            width: right.saturating_sub(x),
            height: bottom.saturating_sub(y),
        }
    }

    /// Smallest rectangle covering both `self` and `other`.
    ///
    /// An empty operand contributes nothing.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // extents capped at u16::MAX
    pub fn union(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Self {
            x,
            y,
            width: (right - u32::from(x)).min(u32::from(u16::MAX)) as u16,
            height: (bottom - u32::from(y)).min(u32::from(u16::MAX)) as u16,
        }
    }

    /// Writes the 8-byte wire geometry (x, y, w, h as big-endian u16).
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
    }
}

/// The `ServerInit` message sent at the end of the handshake.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Framebuffer width in pixels.
    pub framebuffer_width: u16,
    /// Framebuffer height in pixels.
    pub framebuffer_height: u16,
    /// The server's native pixel format.
    pub pixel_format: PixelFormat,
    /// Desktop name shown by the client.
    pub name: String,
}

impl ServerInit {
    /// Serializes the message: width, height, 16-byte pixel format, then
    /// the length-prefixed name.
    #[allow(clippy::cast_possible_truncation)] // name length limited to u32 by the protocol
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_round_trip() {
        let format = PixelFormat {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: true,
            true_color: true,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        };

        let mut buf = BytesMut::new();
        format.write_to(&mut buf);
        assert_eq!(buf.len(), 16);

        let decoded = PixelFormat::from_bytes(&buf).unwrap();
        assert_eq!(decoded, format);
    }

    #[test]
    fn pixel_format_blob_layout() {
        let mut buf = BytesMut::new();
        PixelFormat::rgb888().write_to(&mut buf);
        assert_eq!(
            &buf[..],
            &[32, 24, 0, 1, 0, 255, 0, 255, 0, 255, 16, 8, 0, 0, 0, 0]
        );
    }

    #[test]
    fn pixel_format_rejects_short_blob() {
        assert!(PixelFormat::from_bytes(&[0u8; 15]).is_err());
    }

    #[test]
    fn pixel_format_validity() {
        assert!(PixelFormat::rgb888().is_valid());

        let mut zero_max = PixelFormat::rgb888();
        zero_max.green_max = 0;
        assert!(!zero_max.is_valid());

        let mut odd_width = PixelFormat::rgb888();
        odd_width.bits_per_pixel = 24;
        assert!(!odd_width.is_valid());
    }

    #[test]
    fn rect_clamp() {
        let rect = Rect::new(10, 10, 100, 100);
        assert_eq!(rect.clamped(50, 40), Rect::new(10, 10, 40, 30));
        assert!(rect.clamped(5, 5).is_empty());
        assert_eq!(rect.clamped(200, 200), rect);
    }

    #[test]
    fn rect_union() {
        let a = Rect::new(10, 10, 5, 5);
        let b = Rect::new(0, 0, 5, 5);
        assert_eq!(a.union(&b), Rect::new(0, 0, 15, 15));
        assert_eq!(a.union(&Rect::new(0, 0, 0, 0)), a);
    }

    #[test]
    fn rect_wire_geometry() {
        let mut buf = BytesMut::new();
        Rect::new(0x0102, 0x0304, 0x0506, 0x0708).write_to(&mut buf);
        assert_eq!(&buf[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn server_init_framing() {
        let init = ServerInit {
            framebuffer_width: 2,
            framebuffer_height: 2,
            pixel_format: PixelFormat::rgb888(),
            name: "t".to_string(),
        };
        let mut buf = BytesMut::new();
        init.write_to(&mut buf);
        // 2 + 2 + 16 + 4 + 1
        assert_eq!(buf.len(), 25);
        assert_eq!(&buf[..4], &[0, 2, 0, 2]);
        assert_eq!(&buf[20..24], &[0, 0, 0, 1]);
        assert_eq!(buf[24], b't');
    }
}
