//! Process-wide connection and camera registries.
//!
//! - [`ConnectionRegistry`]: which connection currently serves each
//!   camera purpose (snapshot URL, stream URL, alarm feed URL), plus the
//!   last message received on it.
//! - [`CameraGroupRegistry`]: which camera sessions are online, and the
//!   group aggregators that query them together.
//!
//! Both are touched from every connection's driver task and from
//! background tasks, so both are `Clone` handles over
//! `Arc<parking_lot::RwLock<..>>`. Lookups dominate, and no lock is held
//! across an `.await`.

pub mod group;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::connection::Connection;

pub use group::{CameraGroup, CameraGroupRegistry, CameraSession};

/// Identity of a logical request: one camera, one purpose URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PurposeKey {
    pub camera_id: String,
    pub url: String,
}

impl PurposeKey {
    pub fn new(camera_id: &str, url: &str) -> Self {
        PurposeKey {
            camera_id: camera_id.to_string(),
            url: url.to_string(),
        }
    }
}

impl fmt::Display for PurposeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.camera_id, self.url)
    }
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub key: PurposeKey,
    pub connection: Connection,
    pub last_message: Option<String>,
}

#[derive(Debug)]
struct Entry {
    connection: Connection,
    /// Last message slot. Kept across connection replacement so waiters
    /// follow the purpose, not one socket.
    reply: watch::Sender<Option<String>>,
}

/// Thread-safe map from [`PurposeKey`] to the live connection serving it.
///
/// One entry per key; tracking a new connection replaces the old one
/// (last writer wins). Entries may outlive their connection: readers must
/// check [`Connection::is_open`] or compare identity.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<RwLock<HashMap<PurposeKey, Entry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the connection for `key`. Clears the stored message.
    pub fn track(&self, key: PurposeKey, connection: Connection) {
        let mut entries = self.entries.write();
        match entries.get_mut(&key) {
            Some(entry) => {
                tracing::trace!(%key, old = entry.connection.id(), new = connection.id(), "connection replaced");
                entry.connection = connection;
                entry.reply.send_replace(None);
            }
            None => {
                tracing::trace!(%key, connection = connection.id(), "connection tracked");
                let (reply, _) = watch::channel(None);
                entries.insert(key, Entry { connection, reply });
            }
        }
    }

    pub fn get(&self, key: &PurposeKey) -> Option<ConnectionHandle> {
        self.entries.read().get(key).map(|entry| ConnectionHandle {
            key: key.clone(),
            connection: entry.connection.clone(),
            last_message: entry.reply.borrow().clone(),
        })
    }

    /// Store the latest complete message for `key` and wake its waiters.
    ///
    /// Returns `false` when nothing is tracked under `key`.
    pub fn record_last_message(&self, key: &PurposeKey, message: &str) -> bool {
        match self.entries.read().get(key) {
            Some(entry) => {
                entry.reply.send_replace(Some(message.to_string()));
                true
            }
            None => false,
        }
    }

    /// Watch the last-message slot of `key`.
    pub fn subscribe(&self, key: &PurposeKey) -> Option<watch::Receiver<Option<String>>> {
        self.entries.read().get(key).map(|entry| entry.reply.subscribe())
    }

    /// Wait, without blocking the runtime, for a message on `key`.
    ///
    /// Resolves immediately if one is already stored. Returns `None` on
    /// timeout, or if `key` is untracked or dropped meanwhile.
    pub async fn wait_for_message(&self, key: &PurposeKey, timeout: Duration) -> Option<String> {
        let mut rx = self.subscribe(key)?;
        let waited = tokio::time::timeout(timeout, rx.wait_for(|message| message.is_some())).await;
        match waited {
            Ok(Ok(message)) => message.clone(),
            _ => None,
        }
    }

    pub fn remove(&self, key: &PurposeKey) -> Option<Connection> {
        self.entries.write().remove(key).map(|entry| entry.connection)
    }

    /// Whether the purpose has no live connection.
    pub fn is_stream_stopped(&self, key: &PurposeKey) -> bool {
        self.entries
            .read()
            .get(key)
            .is_none_or(|entry| !entry.connection.is_open())
    }

    /// Close and forget every connection of one camera.
    pub fn close_camera(&self, camera_id: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, entry| {
            if key.camera_id == camera_id {
                entry.connection.close();
                false
            } else {
                true
            }
        });
        let closed = before - entries.len();
        if closed > 0 {
            tracing::debug!(camera = camera_id, closed, "closed camera connections");
        }
        closed
    }

    /// Drop entries whose connection closed without leaving a reply.
    ///
    /// Entries with a pending waiter are kept, so a wait survives the gap
    /// between a 401 and its resend. Called before each new connection is
    /// tracked, which bounds the registry when a misbehaving camera makes
    /// the client open many short-lived connections.
    pub fn clean_stale(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.connection.is_open()
                || entry.reply.borrow().is_some()
                || entry.reply.receiver_count() > 0
        });
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = entries.len(), "removed stale connections");
        }
        removed
    }

    pub fn keys_for_camera(&self, camera_id: &str) -> Vec<PurposeKey> {
        self.entries
            .read()
            .keys()
            .filter(|key| key.camera_id == camera_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
