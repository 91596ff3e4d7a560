//! Newline framing for inbound request streams.
//!
//! Bytes are accumulated in a `BytesMut` and split at each `\n`. Trailing
//! whitespace (including the `\r` of a CRLF terminator) is stripped from
//! every line. Lines longer than the configured limit are reported once
//! as [`Frame::Overflow`] and the remainder up to the next newline is
//! dropped. Each byte is searched for a newline at most once.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer size
const BUFFER_SIZE: usize = 8 * 1024;

/// One unit read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line with its terminator and trailing whitespace removed.
    Line(Bytes),
    /// A line exceeded the length limit and was dropped.
    Overflow,
}

/// Splits an async byte stream into newline-terminated frames.
pub struct LineReader<R> {
    reader: R,
    buffer: BytesMut,
    max_line_length: usize,
    /// Prefix of `buffer` already searched for a newline.
    scanned: usize,
    /// Dropping the tail of an over-long line.
    discarding: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line_length: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            max_line_length,
            scanned: 0,
            discarding: false,
        }
    }

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` at end of stream. An unterminated trailing
    /// line is returned as a final [`Frame::Line`].
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Ok(self.take_tail());
            }
        }
    }

    fn take_frame(&mut self) -> Option<Frame> {
        loop {
            let Some(offset) = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
            else {
                if self.discarding {
                    self.reset();
                } else if self.buffer.len() > self.max_line_length {
                    self.reset();
                    self.discarding = true;
                    return Some(Frame::Overflow);
                } else {
                    self.scanned = self.buffer.len();
                }
                return None;
            };

            let pos = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.buffer.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }

            line.truncate(pos);
            if line.len() > self.max_line_length {
                return Some(Frame::Overflow);
            }
            return Some(Frame::Line(trim_end(line)));
        }
    }

    /// Bytes left over once the stream has ended.
    fn take_tail(&mut self) -> Option<Frame> {
        if self.discarding || self.buffer.is_empty() {
            self.reset();
            self.discarding = false;
            return None;
        }
        let line = self.buffer.split();
        self.scanned = 0;
        Some(Frame::Line(trim_end(line)))
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}

fn trim_end(mut line: BytesMut) -> Bytes {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    line.truncate(end);
    line.freeze()
}
