//! Newline-delimited JSON framing
//!
//! Wire format: one UTF-8 JSON object per line, terminated by `\n`.
//! Partial lines stay buffered across reads. A line longer than
//! `MAX_LINE_LEN` is discarded up to its terminating newline.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::WireMessage;

/// Maximum allowed line length (64KB)
const MAX_LINE_LEN: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Accumulates bytes and yields complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Skipping the tail of an oversized line
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete line, without its terminator
    ///
    /// Returns `None` when no full line is buffered yet. Blank lines are
    /// skipped. A line that is not UTF-8 or is too long comes back as
    /// `MalformedFrame`; the buffer stays usable afterwards.
    pub fn next_line(&mut self) -> Option<Result<String>> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                if self.buf.len() > MAX_LINE_LEN {
                    self.buf.clear();
                    if !self.discarding {
                        self.discarding = true;
                        return Some(Err(Error::MalformedFrame(format!(
                            "Line exceeds {} bytes",
                            MAX_LINE_LEN
                        ))));
                    }
                }
                return None;
            };

            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > MAX_LINE_LEN {
                return Some(Err(Error::MalformedFrame(format!(
                    "Line exceeds {} bytes",
                    MAX_LINE_LEN
                ))));
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return Some(
                String::from_utf8(line)
                    .map_err(|_| Error::MalformedFrame("Line is not valid UTF-8".into())),
            );
        }
    }
}

/// Reads `WireMessage`s from a byte stream
pub struct FrameReader<R> {
    inner: R,
    lines: LineBuffer,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            lines: LineBuffer::new(),
        }
    }

    /// Read the next message
    ///
    /// `MalformedFrame` only costs the offending line; callers should log
    /// and keep reading. A zero-length read is `PeerDisconnected`.
    pub async fn read_frame(&mut self) -> Result<WireMessage> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(line) = self.lines.next_line() {
                let line = line?;
                return WireMessage::from_line(&line)
                    .map_err(|e| Error::MalformedFrame(format!("Invalid JSON: {}", e)));
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::PeerDisconnected);
            }
            self.lines.push(&chunk[..n]);
        }
    }
}

/// Write one message as a single line
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &WireMessage) -> Result<()> {
    let mut line = msg
        .to_line()
        .map_err(|e| Error::MalformedFrame(format!("Serialization failed: {}", e)))?;
    line.push('\n');

    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;

    Ok(())
}
