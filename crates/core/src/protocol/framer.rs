use crate::error::{ClientError, ParseErrorKind, Result};

use super::InboundUnit;
use super::response::ResponseHead;

/// Largest response head accepted before the blank line.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Waiting for a complete status line and header block.
    Head,
    /// `Content-Length` body with this many bytes still to come.
    Fixed { remaining: usize },
    /// Waiting for a chunk-size line.
    ChunkSize,
    /// Inside a chunk with this many bytes still to come.
    ChunkData { remaining: usize },
    /// Waiting for the CRLF that closes a chunk.
    ChunkEnd,
    /// After the `0` chunk, skipping trailer lines until the blank one.
    Trailers,
    /// No length information: the body ends when the connection does.
    UntilClose,
}

/// Incremental HTTP/1.1 response framer.
///
/// Bytes go in as they arrive from the socket, in pieces of any size;
/// [`InboundUnit`]s come out in order. Body bytes are surfaced as soon as
/// they are available: each read of an open-ended body becomes exactly
/// one [`InboundUnit::Body`].
///
/// Every response body ends with a `Body { last: true }` unit (empty when
/// the final bytes were already delivered), so consumers never need to
/// know which framing the camera chose.
#[derive(Debug)]
pub struct ResponseFramer {
    state: FrameState,
    buf: Vec<u8>,
}

impl ResponseFramer {
    pub fn new() -> Self {
        ResponseFramer {
            state: FrameState::Head,
            buf: Vec::new(),
        }
    }

    /// Feed freshly read bytes and collect the units they complete.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<InboundUnit>> {
        self.buf.extend_from_slice(data);
        let mut units = Vec::new();

        loop {
            match self.state {
                FrameState::Head => {
                    let Some(end) = find(&self.buf, b"\r\n\r\n") else {
                        if self.buf.len() > MAX_HEAD_LEN {
                            return Err(ClientError::Parse {
                                kind: ParseErrorKind::HeadTooLarge,
                            });
                        }
                        break;
                    };
                    let raw: Vec<u8> = self.buf.drain(..end + 4).collect();
                    let head = ResponseHead::parse(&String::from_utf8_lossy(&raw))?;
                    self.state = Self::body_state(&head);
                    tracing::trace!(status = head.status, state = ?self.state, "response head");
                    units.push(InboundUnit::Headers(head));

                    if self.state == FrameState::Head {
                        units.push(InboundUnit::Body {
                            data: Vec::new(),
                            last: true,
                        });
                    }
                }
                FrameState::Fixed { remaining } => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len());
                    let data: Vec<u8> = self.buf.drain(..take).collect();
                    let remaining = remaining - take;
                    let last = remaining == 0;
                    self.state = if last {
                        FrameState::Head
                    } else {
                        FrameState::Fixed { remaining }
                    };
                    units.push(InboundUnit::Body { data, last });
                }
                FrameState::ChunkSize => {
                    let Some(end) = find(&self.buf, b"\r\n") else {
                        break;
                    };
                    let line: Vec<u8> = self.buf.drain(..end + 2).collect();
                    let size = parse_chunk_size(&line[..end])?;
                    self.state = if size == 0 {
                        FrameState::Trailers
                    } else {
                        FrameState::ChunkData { remaining: size }
                    };
                }
                FrameState::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buf.len());
                    let data: Vec<u8> = self.buf.drain(..take).collect();
                    let remaining = remaining - take;
                    self.state = if remaining == 0 {
                        FrameState::ChunkEnd
                    } else {
                        FrameState::ChunkData { remaining }
                    };
                    units.push(InboundUnit::Body { data, last: false });
                }
                FrameState::ChunkEnd => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    self.buf.drain(..2);
                    self.state = FrameState::ChunkSize;
                }
                FrameState::Trailers => {
                    let Some(end) = find(&self.buf, b"\r\n") else {
                        break;
                    };
                    self.buf.drain(..end + 2);
                    if end == 0 {
                        self.state = FrameState::Head;
                        units.push(InboundUnit::Body {
                            data: Vec::new(),
                            last: true,
                        });
                    }
                }
                FrameState::UntilClose => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let data = std::mem::take(&mut self.buf);
                    units.push(InboundUnit::Body { data, last: false });
                }
            }
        }

        Ok(units)
    }

    /// The connection reached EOF.
    ///
    /// Closes an open-ended body. A body cut short of its declared framing
    /// yields [`InboundUnit::Other`], so whatever text arrived can still be
    /// delivered.
    pub fn finish(&mut self) -> Vec<InboundUnit> {
        let state = std::mem::replace(&mut self.state, FrameState::Head);
        self.buf.clear();
        match state {
            FrameState::UntilClose => vec![InboundUnit::Body {
                data: Vec::new(),
                last: true,
            }],
            FrameState::Head => Vec::new(),
            truncated => {
                tracing::debug!(state = ?truncated, "connection closed mid-body");
                vec![InboundUnit::Other]
            }
        }
    }

    fn body_state(head: &ResponseHead) -> FrameState {
        if (100..200).contains(&head.status) || head.status == 204 || head.status == 304 {
            return FrameState::Head;
        }
        if head.is_chunked() {
            return FrameState::ChunkSize;
        }
        match head.content_length() {
            Some(0) => FrameState::Head,
            Some(remaining) => FrameState::Fixed { remaining },
            None => FrameState::UntilClose,
        }
    }
}

impl Default for ResponseFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Chunk-size line: hex digits, optionally followed by `;extensions`.
fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let text = String::from_utf8_lossy(line);
    let digits = text.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(digits, 16).map_err(|_| ClientError::Parse {
        kind: ParseErrorKind::InvalidChunkSize,
    })
}
