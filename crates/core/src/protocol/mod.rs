//! HTTP/1.1 client protocol pieces (RFC 9112).
//!
//! This module handles the text-based side of talking to a camera:
//! building requests, parsing response heads, and framing an unbounded
//! inbound byte stream into [`InboundUnit`]s.
//!
//! ## Response framing
//!
//! Camera endpoints use three body shapes:
//!
//! | Shape | Typical endpoint | Framing |
//! |-------|------------------|---------|
//! | `Content-Length: N` | snapshot JPEG, CGI replies | exactly N bytes |
//! | `Transfer-Encoding: chunked` | XML/JSON control replies | hex-sized chunks, `0` terminates |
//! | neither | MJPEG `multipart/x-mixed-replace`, alarm feeds | until the socket closes |
//!
//! Every body byte is surfaced as soon as it is read; nothing here waits
//! for a complete message.

pub mod framer;
pub mod request;
pub mod response;

pub use framer::ResponseFramer;
pub use request::HttpRequest;
pub use response::ResponseHead;

/// One unit of inbound traffic on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundUnit {
    /// Status line and headers of a response.
    Headers(ResponseHead),
    /// A piece of the body. `last` marks the end of the response body.
    Body { data: Vec<u8>, last: bool },
    /// The connection ended before the body its head announced was
    /// complete. Produced by [`ResponseFramer::finish`]; what arrived is
    /// handed on as is (see
    /// [`ResponseDemultiplexer::on_other`](crate::demux::ResponseDemultiplexer::on_other)).
    Other,
}
