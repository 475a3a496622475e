//! Error types for the camera client library.

use std::fmt;

/// Errors that can occur in the camera client library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse): malformed HTTP response heads or
///   chunk framing.
/// - **Transport**: [`Io`](Self::Io), [`ConnectTimeout`](Self::ConnectTimeout),
///   [`ConnectionClosed`](Self::ConnectionClosed).
/// - **Client**: [`NotStarted`](Self::NotStarted),
///   [`InvalidUrl`](Self::InvalidUrl).
///
/// Authentication outcomes are not errors at this level; they are reported
/// as [`AuthAbort`](crate::auth::AuthAbort) reasons.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The camera did not accept the TCP connection within the configured
    /// connect timeout.
    #[error("connect timeout to {0}")]
    ConnectTimeout(String),

    /// The connection was closed before the request could be written.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// [`CameraClient::start`](crate::CameraClient::start) has not been called.
    #[error("client not started")]
    NotStarted,

    /// The request URL could not be split into host, port and path.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Failed to parse an HTTP response from the camera.
    #[error("HTTP parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

/// Specific kind of HTTP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no status line).
    EmptyResponse,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// A chunk-size line of a chunked body was not valid hex.
    InvalidChunkSize,
    /// The response head grew past the framer's limit without a blank line.
    HeadTooLarge,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyResponse => write!(f, "empty response"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidChunkSize => write!(f, "invalid chunk size"),
            Self::HeadTooLarge => write!(f, "response head too large"),
        }
    }
}

/// Convenience alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;
