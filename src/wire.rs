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

//! Buffered I/O streams for RFB protocol communication.
//!
//! Reads and writes primitive values in network byte order over any
//! `AsyncRead`/`AsyncWrite` transport, plus the RFB composites the session
//! needs: the 12-byte version banner, length-prefixed strings, rectangle
//! geometry, and the 16-byte pixel format blob.
//!
//! Every read blocks until the requested byte count is delivered; EOF and
//! I/O failures surface as [`SessionError::Transport`]. Dropping the
//! streams drops the transport halves, which is how a closing session
//! unblocks a pending read.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SessionError};
use crate::protocol::{PixelFormat, Rect};

const DEFAULT_BUFFER_CAPACITY: usize = 8192;

/// Buffered input stream for reading RFB protocol data.
pub struct RfbInStream<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> RfbInStream<R> {
    /// Creates a new input stream with the default buffer capacity.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
        }
    }

    /// Fills the buffer until at least `n` bytes are available.
    async fn ensure_bytes(&mut self, n: usize) -> Result<()> {
        while self.buffer.len() < n {
            let bytes_read = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(SessionError::Transport)?;
            if bytes_read == 0 {
                return Err(SessionError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("expected {} bytes, got {}", n, self.buffer.len()),
                )));
            }
        }
        Ok(())
    }

    /// Reads a single byte.
    pub async fn read_u8(&mut self) -> Result<u8> {
        self.ensure_bytes(1).await?;
        Ok(self.buffer.get_u8())
    }

    /// Reads a 16-bit unsigned integer in network byte order.
    pub async fn read_u16(&mut self) -> Result<u16> {
        self.ensure_bytes(2).await?;
        Ok(self.buffer.get_u16())
    }

    /// Reads a 32-bit unsigned integer in network byte order.
    pub async fn read_u32(&mut self) -> Result<u32> {
        self.ensure_bytes(4).await?;
        Ok(self.buffer.get_u32())
    }

    /// Reads a 32-bit signed integer in network byte order.
    pub async fn read_i32(&mut self) -> Result<i32> {
        self.ensure_bytes(4).await?;
        Ok(self.buffer.get_i32())
    }

    /// Reads exactly `buf.len()` bytes.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.ensure_bytes(buf.len()).await?;
        self.buffer.copy_to_slice(buf);
        Ok(())
    }

    /// Skips `n` bytes (padding fields).
    pub async fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure_bytes(n).await?;
        self.buffer.advance(n);
        Ok(())
    }

    /// Reads and parses a 12-byte protocol version banner
    /// `"RFB xxx.yyy\n"`, returning `(major, minor)`.
    pub async fn read_version(&mut self) -> Result<(u32, u32)> {
        let mut banner = [0u8; 12];
        self.read_bytes(&mut banner).await?;
        parse_version(&banner)
    }

    /// Reads a length-prefixed UTF-8 string (32-bit big-endian length).
    ///
    /// Lengths above `max` fail with [`SessionError::SanityCheck`];
    /// invalid UTF-8 is replaced lossily.
    pub async fn read_string(&mut self, max: usize) -> Result<String> {
        let length = self.read_u32().await? as usize;
        if length > max {
            return Err(SessionError::SanityCheck(format!(
                "string length {length} exceeds limit {max}"
            )));
        }
        let mut bytes = vec![0u8; length];
        self.read_bytes(&mut bytes).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads rectangle geometry: four big-endian u16 fields.
    pub async fn read_rect(&mut self) -> Result<Rect> {
        let x = self.read_u16().await?;
        let y = self.read_u16().await?;
        let width = self.read_u16().await?;
        let height = self.read_u16().await?;
        Ok(Rect::new(x, y, width, height))
    }

    /// Reads a 16-byte pixel format blob.
    pub async fn read_pixel_format(&mut self) -> Result<PixelFormat> {
        let mut blob = [0u8; 16];
        self.read_bytes(&mut blob).await?;
        PixelFormat::from_bytes(&blob)
    }
}

/// Buffered output stream for writing RFB protocol data.
///
/// Writes are buffered; call [`flush`](Self::flush) to put them on the
/// wire. The session holds its write lock across a whole message so that
/// outbound messages never interleave.
pub struct RfbOutStream<W> {
    writer: W,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> RfbOutStream<W> {
    /// Creates a new output stream with the default buffer capacity.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
        }
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    /// Writes a 16-bit unsigned integer in network byte order.
    pub fn write_u16(&mut self, value: u16) {
        self.buffer.put_u16(value);
    }

    /// Writes a 32-bit unsigned integer in network byte order.
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.put_u32(value);
    }

    /// Writes a 32-bit signed integer in network byte order.
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.put_i32(value);
    }

    /// Writes a byte slice.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Writes the 12-byte protocol version banner for `major.minor`.
    pub fn write_version(&mut self, major: u32, minor: u32) {
        let banner = format!("RFB {major:03}.{minor:03}\n");
        self.buffer.extend_from_slice(banner.as_bytes());
    }

    /// Writes a length-prefixed UTF-8 string.
    #[allow(clippy::cast_possible_truncation)] // string lengths limited to u32 by the protocol
    pub fn write_string(&mut self, value: &str) {
        self.buffer.put_u32(value.len() as u32);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// Flushes all buffered data to the underlying writer.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.writer
                .write_all(&self.buffer)
                .await
                .map_err(SessionError::Transport)?;
            self.buffer.clear();
        }
        self.writer.flush().await.map_err(SessionError::Transport)
    }
}

fn parse_version(banner: &[u8; 12]) -> Result<(u32, u32)> {
    let malformed = || {
        SessionError::UnrecognizedProtocolElement(format!(
            "malformed protocol version banner {:?}",
            String::from_utf8_lossy(banner)
        ))
    };

    if &banner[0..4] != b"RFB " || banner[7] != b'.' || banner[11] != b'\n' {
        return Err(malformed());
    }
    let digits = |bytes: &[u8]| -> Result<u32> {
        let mut value = 0u32;
        for &b in bytes {
            if !b.is_ascii_digit() {
                return Err(malformed());
            }
            value = value * 10 + u32::from(b - b'0');
        }
        Ok(value)
    };
    Ok((digits(&banner[4..7])?, digits(&banner[8..11])?))
}
