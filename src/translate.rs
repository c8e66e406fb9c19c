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

//! Pixel translation between server and client formats.
//!
//! Raw encoding sends pixel bytes in whatever format the client last
//! negotiated, so every outbound rectangle passes through [`copy_rect`]:
//! a row-by-row memory copy when the two formats match, otherwise a
//! per-pixel decode through the source channel maxes/shifts and re-encode
//! into the destination layout.

use crate::error::{Result, SessionError};
use crate::protocol::{PixelFormat, Rect};

/// Copies `region` out of a source pixel buffer into the origin of a
/// destination buffer, converting the pixel format if needed.
///
/// `src` is `src_width` pixels wide with rows `src_stride` bytes apart;
/// the destination receives `region.width` pixels per row, rows
/// `dst_stride` bytes apart, starting at offset 0. Endianness of each
/// pixel word follows each format's flag.
///
/// # Errors
///
/// Fails with [`SessionError::InvalidArgument`] when the region falls
/// outside the source, either buffer is too small, or a format has an
/// unsupported storage width.
#[allow(clippy::too_many_arguments)] // mirrors the raw copy contract: full source and destination geometry
pub fn copy_rect(
    src: &[u8],
    src_width: u16,
    src_stride: usize,
    src_format: &PixelFormat,
    region: &Rect,
    dst: &mut [u8],
    dst_width: u16,
    dst_stride: usize,
    dst_format: &PixelFormat,
) -> Result<()> {
    if !src_format.is_valid() || !dst_format.is_valid() {
        return Err(SessionError::InvalidArgument(
            "unsupported pixel format".to_string(),
        ));
    }
    if region.is_empty() {
        return Ok(());
    }
    if region.right() > u32::from(src_width) || region.width > dst_width {
        return Err(SessionError::InvalidArgument(format!(
            "region {region:?} does not fit source width {src_width} / destination width {dst_width}"
        )));
    }

    let src_bpp = src_format.bytes_per_pixel();
    let dst_bpp = dst_format.bytes_per_pixel();
    let width = usize::from(region.width);
    let height = usize::from(region.height);

    let src_last_row = (usize::from(region.y) + height - 1) * src_stride;
    let src_end = src_last_row + (usize::from(region.x) + width) * src_bpp;
    if src_end > src.len() {
        return Err(SessionError::InvalidArgument(format!(
            "region {region:?} extends past the source buffer ({} > {})",
            src_end,
            src.len()
        )));
    }
    let dst_end = (height - 1) * dst_stride + width * dst_bpp;
    if dst_end > dst.len() {
        return Err(SessionError::InvalidArgument(format!(
            "destination buffer too small ({} < {})",
            dst.len(),
            dst_end
        )));
    }

    if src_format == dst_format {
        for row in 0..height {
            let src_off = (usize::from(region.y) + row) * src_stride + usize::from(region.x) * src_bpp;
            let dst_off = row * dst_stride;
            dst[dst_off..dst_off + width * src_bpp]
                .copy_from_slice(&src[src_off..src_off + width * src_bpp]);
        }
        return Ok(());
    }

    for row in 0..height {
        let src_off = (usize::from(region.y) + row) * src_stride + usize::from(region.x) * src_bpp;
        let dst_off = row * dst_stride;
        for col in 0..width {
            let value = read_pixel(&src[src_off + col * src_bpp..], src_bpp, src_format.big_endian);

            let r = (value >> src_format.red_shift) & u32::from(src_format.red_max);
            let g = (value >> src_format.green_shift) & u32::from(src_format.green_max);
            let b = (value >> src_format.blue_shift) & u32::from(src_format.blue_max);

            let r = r * u32::from(dst_format.red_max) / u32::from(src_format.red_max);
            let g = g * u32::from(dst_format.green_max) / u32::from(src_format.green_max);
            let b = b * u32::from(dst_format.blue_max) / u32::from(src_format.blue_max);

            let out =
                (r << dst_format.red_shift) | (g << dst_format.green_shift) | (b << dst_format.blue_shift);
            write_pixel(
                &mut dst[dst_off + col * dst_bpp..],
                dst_bpp,
                dst_format.big_endian,
                out,
            );
        }
    }
    Ok(())
}

fn read_pixel(bytes: &[u8], bpp: usize, big_endian: bool) -> u32 {
    match (bpp, big_endian) {
        (1, _) => u32::from(bytes[0]),
        (2, true) => u32::from(u16::from_be_bytes([bytes[0], bytes[1]])),
        (2, false) => u32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
        (4, true) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        (4, false) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => unreachable!("storage width validated by is_valid"),
    }
}

#[allow(clippy::cast_possible_truncation)] // narrowing to the format's storage width is the encoding
fn write_pixel(bytes: &mut [u8], bpp: usize, big_endian: bool, value: u32) {
    match (bpp, big_endian) {
        (1, _) => bytes[0] = value as u8,
        (2, true) => bytes[..2].copy_from_slice(&(value as u16).to_be_bytes()),
        (2, false) => bytes[..2].copy_from_slice(&(value as u16).to_le_bytes()),
        (4, true) => bytes[..4].copy_from_slice(&value.to_be_bytes()),
        (4, false) => bytes[..4].copy_from_slice(&value.to_le_bytes()),
        _ => unreachable!("storage width validated by is_valid"),
    }
}
