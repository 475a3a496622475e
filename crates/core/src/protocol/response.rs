use crate::error::{ClientError, ParseErrorKind};

/// A parsed HTTP response head (RFC 9112 §4, §5).
///
/// ```text
/// HTTP-Version SP Status-Code SP Reason-Phrase CRLF
/// *(Header: Value CRLF)
/// CRLF
/// ```
///
/// Header lookup is case-insensitive; cameras are inconsistent about
/// `Content-Type` versus `content-type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Protocol version (expected: `HTTP/1.1` or `HTTP/1.0`).
    pub version: String,
    pub status: u16,
    pub reason: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received.
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        ResponseHead {
            version: "HTTP/1.1".to_string(),
            status,
            reason: String::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Parse a response head from its text representation.
    ///
    /// Expects the status line followed by header lines; parsing stops at
    /// the first blank line. Returns [`ClientError::Parse`] on malformed input.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let status_line = lines
            .find(|line| !line.trim().is_empty())
            .ok_or(ClientError::Parse {
                kind: ParseErrorKind::EmptyResponse,
            })?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default().to_string();
        let status = parts
            .next()
            .and_then(|code| code.trim().parse::<u16>().ok())
            .ok_or(ClientError::Parse {
                kind: ParseErrorKind::InvalidStatusLine,
            })?;
        let reason = parts.next().unwrap_or_default().trim().to_string();

        if !version.starts_with("HTTP/") {
            return Err(ClientError::Parse {
                kind: ParseErrorKind::InvalidStatusLine,
            });
        }

        let mut headers = Vec::new();

        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon_pos = line.find(':').ok_or(ClientError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;

            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();

            headers.push((name, value));
        }

        Ok(ResponseHead {
            version,
            status,
            reason,
            headers,
        })
    }

    /// Look up the first header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values of a repeated header, in order received.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// `Content-Length`, if present and numeric.
    pub fn content_length(&self) -> Option<usize> {
        self.get_header("Content-Length")
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.get_header("Transfer-Encoding")
            .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
    }
}
