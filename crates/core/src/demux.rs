//! Incremental response demultiplexer.
//!
//! Turns the [`InboundUnit`]s of one connection into logical outputs:
//! still images, raw MJPEG stream chunks, or text/XML/JSON messages.
//! Chunks arrive with arbitrary boundaries; outputs are emitted in the
//! order their inputs arrived, as [`DemuxEvent`]s returned from each call.
//!
//! ## Modes
//!
//! ```text
//! AwaitingHeaders --200 multipart, stream purpose--> MultipartPassthrough (until close)
//! AwaitingHeaders --200 multipart, other purpose---> TextAccumulate
//! AwaitingHeaders --200 image/jp*------------------> Image --last chunk--> AwaitingHeaders
//! AwaitingHeaders --200 anything else--------------> TextAccumulate
//! any             --non-200 head-------------------> AwaitingHeaders (body ignored)
//! ```
//!
//! ## Multipart text segmentation
//!
//! Alarm and event feeds are `multipart/x-mixed-replace` bodies that never
//! end. Each part carries its own `Content-Length:` which covers the part
//! body only, not the `--boundary` line and part headers. Once more text
//! than that length is buffered, the buffer is split at the next
//! `--boundary` at or after that offset. If no boundary has arrived yet
//! the whole buffer is delivered as is. That flush can split one part
//! across two messages when its body arrives in a later chunk; consumers
//! already tolerate it. Parts without a `Content-Length:` line are cut at
//! the next `--boundary` instead.
//!
//! Text that grows past the configured limit without completing a message
//! ends the connection with a [`DemuxEvent::ProcessingFault`].

use crate::protocol::{InboundUnit, ResponseHead};
use crate::scan::{extract_between, value_after};

/// Image buffer size used when a JPEG response has no `Content-Length`.
pub const FALLBACK_IMAGE_LEN: usize = 768_000;

/// Most text held for one message before the connection is dropped.
pub const MAX_TEXT_LEN: usize = 1024 * 1024;

const CONTENT_LENGTH_MARKER: &str = "Content-Length:";

/// Current parsing mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    AwaitingHeaders,
    Image,
    MultipartPassthrough,
    TextAccumulate,
}

/// Output of the demultiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    /// A response other than 200 arrived; its body is not demultiplexed.
    NonOkStatus(u16),
    /// The designated video stream started. Emitted once per connection.
    StreamStarted {
        content_type: String,
        boundary: String,
    },
    /// One inbound chunk of the video stream, unmodified.
    FrameChunk(Vec<u8>),
    /// A complete still image.
    SnapshotReady(Vec<u8>),
    /// A decoded text payload.
    MessageReady(String),
    /// The camera sent more image bytes than the buffer allows.
    SizeMismatch { expected: usize, received: usize },
    /// The body could not be processed.
    ProcessingFault(String),
    /// The connection should be closed.
    Close,
}

#[derive(Debug)]
enum Stream {
    AwaitingHeaders,
    Image {
        buf: Vec<u8>,
        expected: usize,
    },
    MultipartPassthrough,
    TextAccumulate {
        text: String,
        /// Trailing bytes of an incomplete UTF-8 sequence.
        pending: Vec<u8>,
        /// `Content-Length:` of the current multipart segment, once seen.
        expected: Option<usize>,
    },
}

/// Per-connection response state machine.
#[derive(Debug)]
pub struct ResponseDemultiplexer {
    camera: String,
    /// This connection carries the camera's designated video stream.
    stream_purpose: bool,
    stream_announced: bool,
    fallback_image_len: usize,
    fixed_image_buffer: bool,
    max_text_len: usize,
    content_type: String,
    boundary: String,
    stream: Stream,
}

impl ResponseDemultiplexer {
    pub fn new(camera: &str, stream_purpose: bool) -> Self {
        ResponseDemultiplexer {
            camera: camera.to_string(),
            stream_purpose,
            stream_announced: false,
            fallback_image_len: FALLBACK_IMAGE_LEN,
            fixed_image_buffer: false,
            max_text_len: MAX_TEXT_LEN,
            content_type: "empty".to_string(),
            boundary: String::new(),
            stream: Stream::AwaitingHeaders,
        }
    }

    /// Size of the image buffer for JPEGs without `Content-Length`, and
    /// whether image bodies are held to that size. A fixed buffer reports
    /// [`DemuxEvent::SizeMismatch`] when the camera sends more.
    pub fn with_image_buffer(mut self, fallback_len: usize, fixed: bool) -> Self {
        self.fallback_image_len = fallback_len;
        self.fixed_image_buffer = fixed;
        self
    }

    /// Largest text message buffered before the connection is dropped.
    pub fn with_text_limit(mut self, max_len: usize) -> Self {
        self.max_text_len = max_len;
        self
    }

    pub fn mode(&self) -> StreamMode {
        match self.stream {
            Stream::AwaitingHeaders => StreamMode::AwaitingHeaders,
            Stream::Image { .. } => StreamMode::Image,
            Stream::MultipartPassthrough => StreamMode::MultipartPassthrough,
            Stream::TextAccumulate { .. } => StreamMode::TextAccumulate,
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Bytes received for the current message (characters for text).
    pub fn received_bytes(&self) -> usize {
        match &self.stream {
            Stream::Image { buf, .. } => buf.len(),
            Stream::TextAccumulate { text, .. } => text.len(),
            _ => 0,
        }
    }

    /// Declared or guessed length of the current message, if known.
    pub fn expected_bytes(&self) -> Option<usize> {
        match &self.stream {
            Stream::Image { expected, .. } => Some(*expected),
            Stream::TextAccumulate { expected, .. } => *expected,
            _ => None,
        }
    }

    /// Dispatch one inbound unit.
    pub fn on_unit(&mut self, unit: InboundUnit) -> Vec<DemuxEvent> {
        match unit {
            InboundUnit::Headers(head) => self.on_headers(&head),
            InboundUnit::Body { data, last } => self.on_body(&data, last),
            InboundUnit::Other => self.on_other(),
        }
    }

    pub fn on_headers(&mut self, head: &ResponseHead) -> Vec<DemuxEvent> {
        if head.status != 200 {
            tracing::debug!(camera = %self.camera, status = head.status, "non-200 reply");
            self.stream = Stream::AwaitingHeaders;
            return vec![DemuxEvent::NonOkStatus(head.status)];
        }

        self.content_type = head.get_header("Content-Type").unwrap_or("empty").to_string();
        let mut events = Vec::new();

        if self.content_type.contains("multipart") {
            self.boundary = match extract_between(&self.content_type, "boundary=\"") {
                "" => extract_between(&self.content_type, "boundary=").trim().to_string(),
                quoted => quoted.to_string(),
            };

            if self.stream_purpose {
                if !self.stream_announced {
                    self.stream_announced = true;
                    tracing::info!(
                        camera = %self.camera,
                        content_type = %self.content_type,
                        boundary = %self.boundary,
                        "MJPEG stream started"
                    );
                    events.push(DemuxEvent::StreamStarted {
                        content_type: self.content_type.clone(),
                        boundary: self.boundary.clone(),
                    });
                }
                self.stream = Stream::MultipartPassthrough;
            } else {
                self.stream = Self::empty_text();
            }
        } else if self.content_type.starts_with("image/jp") {
            let expected = match head.content_length() {
                Some(len) if len > 0 => len,
                _ => {
                    tracing::debug!(
                        camera = %self.camera,
                        guess = self.fallback_image_len,
                        "image without Content-Length, guessing buffer size"
                    );
                    self.fallback_image_len
                }
            };
            // The declared length is untrusted; the buffer grows past this.
            self.stream = Stream::Image {
                buf: Vec::with_capacity(expected.min(self.fallback_image_len)),
                expected,
            };
        } else {
            self.stream = Self::empty_text();
        }

        events
    }

    pub fn on_body(&mut self, data: &[u8], last: bool) -> Vec<DemuxEvent> {
        let camera = &self.camera;

        match &mut self.stream {
            Stream::AwaitingHeaders => {
                tracing::trace!(camera = %camera, len = data.len(), "ignoring body outside a 200 reply");
                Vec::new()
            }
            Stream::MultipartPassthrough => {
                if data.is_empty() {
                    return Vec::new();
                }
                vec![DemuxEvent::FrameChunk(data.to_vec())]
            }
            Stream::Image { buf, expected } => {
                let expected = *expected;
                if self.fixed_image_buffer && buf.len() + data.len() > expected {
                    let received = buf.len() + data.len();
                    tracing::warn!(
                        camera = %camera,
                        expected,
                        received,
                        "camera sent more image bytes than Content-Length"
                    );
                    self.stream = Stream::AwaitingHeaders;
                    return vec![
                        DemuxEvent::SizeMismatch { expected, received },
                        DemuxEvent::Close,
                    ];
                }

                buf.extend_from_slice(data);
                if !last {
                    return Vec::new();
                }

                if buf.len() > expected {
                    tracing::debug!(camera = %camera, expected, received = buf.len(), "image larger than expected");
                }
                let image = std::mem::take(buf);
                self.stream = Stream::AwaitingHeaders;
                vec![DemuxEvent::SnapshotReady(image), DemuxEvent::Close]
            }
            Stream::TextAccumulate {
                text,
                pending,
                expected,
            } => {
                pending.extend_from_slice(data);
                decode_utf8_into(text, pending);

                let mut events = Vec::new();
                if last {
                    if !pending.is_empty() {
                        text.push_str(&String::from_utf8_lossy(pending));
                        pending.clear();
                    }
                } else if self.content_type.contains("multipart") {
                    match split_segments(text, expected, &self.boundary) {
                        Ok(messages) => {
                            events.extend(messages.into_iter().map(DemuxEvent::MessageReady))
                        }
                        Err(fault) => {
                            tracing::warn!(camera = %camera, error = %fault, "dropping alarm stream");
                            self.stream = Stream::AwaitingHeaders;
                            events.push(DemuxEvent::ProcessingFault(fault));
                            events.push(DemuxEvent::Close);
                            return events;
                        }
                    }
                }

                if text.len() > self.max_text_len {
                    let received = text.len();
                    tracing::warn!(
                        camera = %camera,
                        limit = self.max_text_len,
                        received,
                        "text reply too large, dropping connection"
                    );
                    self.stream = Stream::AwaitingHeaders;
                    events.push(DemuxEvent::ProcessingFault(format!(
                        "text reply exceeded {} bytes",
                        self.max_text_len
                    )));
                    events.push(DemuxEvent::Close);
                    return events;
                }

                if last && !text.is_empty() {
                    events.push(DemuxEvent::MessageReady(text.clone()));
                }
                events
            }
        }
    }

    /// A reply cut short before its declared body was complete.
    ///
    /// Some firmwares close the socket early on a status page; whatever
    /// text was gathered so far is forwarded as the message.
    pub fn on_other(&mut self) -> Vec<DemuxEvent> {
        match &self.stream {
            Stream::TextAccumulate { text, .. }
                if !text.is_empty() && !self.content_type.contains("image/jp") =>
            {
                tracing::trace!(camera = %self.camera, message = %text, "unframed reply");
                vec![DemuxEvent::MessageReady(text.clone())]
            }
            _ => Vec::new(),
        }
    }

    fn empty_text() -> Stream {
        Stream::TextAccumulate {
            text: String::new(),
            pending: Vec::new(),
            expected: None,
        }
    }
}

/// Decode as much of `pending` as forms complete UTF-8 into `text`,
/// keeping an incomplete trailing sequence for the next chunk.
fn decode_utf8_into(text: &mut String, pending: &mut Vec<u8>) {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&pending[start..]) {
            Ok(valid) => {
                text.push_str(valid);
                start = pending.len();
                break;
            }
            Err(err) => {
                let valid_end = start + err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&pending[start..valid_end]) {
                    text.push_str(valid);
                }
                match err.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        start = valid_end + len;
                    }
                    None => {
                        start = valid_end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..start);
}

/// Cut complete segments off the front of an alarm-stream buffer.
fn split_segments(
    text: &mut String,
    expected: &mut Option<usize>,
    boundary: &str,
) -> Result<Vec<String>, String> {
    let marker = format!("--{boundary}");
    let mut messages = Vec::new();

    loop {
        let next_part = find_from(text, &marker, 1);
        if expected.is_none() {
            let front = match next_part {
                Some(end) => &text[..end],
                None => text.as_str(),
            };
            *expected = segment_length(front)?;
        }
        let Some(length) = *expected else {
            // No length for this part: it ends where the next one begins.
            match next_part {
                Some(end) => {
                    let rest = text.split_off(end);
                    messages.push(std::mem::replace(text, rest));
                    continue;
                }
                None => break,
            }
        };
        if text.len() <= length {
            break;
        }

        // The boundary at the very start belongs to the current segment.
        match find_from(text, &marker, length.max(1)) {
            Some(pos) => {
                let rest = text.split_off(pos);
                let segment = std::mem::replace(text, rest);
                *expected = None;
                if !segment.is_empty() {
                    messages.push(segment);
                }
            }
            None => {
                messages.push(std::mem::take(text));
                *expected = None;
                break;
            }
        }
    }

    Ok(messages)
}

/// Position of `marker` at or after byte `from`.
fn find_from(text: &str, marker: &str, from: usize) -> Option<usize> {
    let start = floor_char_boundary(text, from);
    text[start..].find(marker).map(|pos| start + pos)
}

/// `Content-Length:` of the part in `segment`, if its line has fully
/// arrived.
fn segment_length(segment: &str) -> Result<Option<usize>, String> {
    let Some(begin) = segment.find(CONTENT_LENGTH_MARKER) else {
        return Ok(None);
    };
    let line = &segment[begin..];
    if !line.contains("\r\n") {
        return Ok(None);
    }
    let value = value_after(line, CONTENT_LENGTH_MARKER).trim();
    value
        .parse::<usize>()
        .map(Some)
        .map_err(|_| format!("invalid part Content-Length: {value:?}"))
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut index = index;
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
