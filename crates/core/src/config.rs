use std::time::Duration;

use crate::auth::Credentials;
use crate::demux::{FALLBACK_IMAGE_LEN, MAX_TEXT_LEN};

/// Camera client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub credentials: Credentials,
    /// Answer Digest challenges. When `false` a Digest challenge aborts.
    pub digest_allowed: bool,
    /// URL of the live video stream; its responses are forwarded raw.
    pub stream_url: Option<String>,
    /// URL whose connection is never closed for idleness.
    /// Falls back to `stream_url` when `None`.
    pub keep_open_url: Option<String>,
    /// Read-idle time after which a connection is handed to the idle policy.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Image buffer size when a JPEG response has no `Content-Length`.
    pub image_fallback_len: usize,
    /// Refuse images larger than their declared length instead of growing.
    pub fixed_image_buffer: bool,
    /// Largest text reply, or unterminated alarm part, kept in memory.
    /// Past it the connection is faulted and closed.
    pub max_text_len: usize,
}

impl ClientConfig {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            credentials: Credentials::new(username, password),
            ..Self::default()
        }
    }

    /// The URL the idle policy pins for this camera.
    pub fn pinned_url(&self) -> Option<&str> {
        self.keep_open_url.as_deref().or(self.stream_url.as_deref())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::new("", ""),
            digest_allowed: true,
            stream_url: None,
            keep_open_url: None,
            idle_timeout: Duration::from_secs(18),
            connect_timeout: Duration::from_millis(4500),
            image_fallback_len: FALLBACK_IMAGE_LEN,
            fixed_image_buffer: false,
            max_text_len: MAX_TEXT_LEN,
        }
    }
}
