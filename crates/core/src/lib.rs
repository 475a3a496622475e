//! Authenticated HTTP client core for IP cameras.
//!
//! Talks HTTP/1.1 to cameras over long-lived connections: answers Basic
//! and Digest challenges transparently, and splits arbitrarily chunked
//! response bodies into snapshots, MJPEG stream chunks and text/XML/JSON
//! messages. Connections are tracked per camera purpose so idle ones can
//! be closed while pinned alarm feeds stay up.
//!
//! The layers, bottom up:
//!
//! - [`scan`], [`auth::digest`]: pure helpers.
//! - [`protocol`]: request building and incremental response framing.
//! - [`auth`], [`demux`]: per-camera and per-connection state machines.
//! - [`registry`], [`idle`]: process-wide shared state.
//! - [`pipeline`], [`client`]: glue and the tokio connection driver.

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod demux;
pub mod error;
pub mod idle;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod scan;

pub use auth::{AuthAbort, AuthAction, AuthSession, AuthState, Credentials};
pub use client::{CameraClient, ClientEvent};
pub use config::ClientConfig;
pub use connection::Connection;
pub use demux::{DemuxEvent, ResponseDemultiplexer, StreamMode};
pub use error::{ClientError, Result};
pub use idle::{IdleDecision, IdlePolicy};
pub use pipeline::{SessionObserver, SessionStatus};
pub use registry::{CameraGroup, CameraGroupRegistry, CameraSession, ConnectionRegistry, PurposeKey};
