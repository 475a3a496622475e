//! Idle-timeout policy for camera connections.
//!
//! Every connection has a read-idle timer. When it fires the connection is
//! closed, unless it is the one currently registered under its camera's
//! pinned purpose (typically the alarm or event feed, which can stay
//! silent for hours).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::Connection;
use crate::registry::{ConnectionRegistry, PurposeKey};

/// What to do with a connection whose idle timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    KeepOpen,
    Close,
}

#[derive(Debug, Clone)]
pub struct IdlePolicy {
    registry: ConnectionRegistry,
    /// camera id -> pinned purpose URL.
    pinned: Arc<RwLock<HashMap<String, String>>>,
}

impl IdlePolicy {
    pub fn new(registry: ConnectionRegistry) -> Self {
        IdlePolicy {
            registry,
            pinned: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Pin `url` for `camera_id`. Replaces any previous pin.
    pub fn pin(&self, camera_id: &str, url: &str) {
        self.pinned
            .write()
            .insert(camera_id.to_string(), url.to_string());
    }

    pub fn unpin(&self, camera_id: &str) -> Option<String> {
        self.pinned.write().remove(camera_id)
    }

    pub fn pinned_key(&self, camera_id: &str) -> Option<PurposeKey> {
        self.pinned
            .read()
            .get(camera_id)
            .map(|url| PurposeKey::new(camera_id, url))
    }

    /// Decide on an idle timeout and apply it.
    ///
    /// The connection is kept only when the registry entry for the camera's
    /// pinned key holds this very instance; a URL match alone is not enough.
    pub fn on_idle_timeout(&self, connection: &Connection, key: &PurposeKey) -> IdleDecision {
        let pinned = self
            .pinned_key(&key.camera_id)
            .and_then(|pinned| self.registry.get(&pinned));

        if let Some(handle) = pinned
            && handle.connection.same_as(connection)
        {
            tracing::trace!(%key, connection = connection.id(), "idle on pinned connection, keeping open");
            return IdleDecision::KeepOpen;
        }

        tracing::debug!(%key, connection = connection.id(), "idle timeout, closing connection");
        connection.close();
        IdleDecision::Close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "/videostream.cgi";
    const SNAPSHOT: &str = "/snapshot.jpg";

    fn setup() -> (ConnectionRegistry, IdlePolicy) {
        let registry = ConnectionRegistry::new();
        let policy = IdlePolicy::new(registry.clone());
        policy.pin("cam1", STREAM);
        (registry, policy)
    }

    #[test]
    fn pinned_connection_stays_open() {
        let (registry, policy) = setup();
        let key = PurposeKey::new("cam1", STREAM);
        let conn = Connection::new();
        registry.track(key.clone(), conn.clone());

        assert_eq!(policy.on_idle_timeout(&conn, &key), IdleDecision::KeepOpen);
        assert!(conn.is_open());
    }

    #[test]
    fn other_purpose_closes() {
        let (registry, policy) = setup();
        let pinned = Connection::new();
        registry.track(PurposeKey::new("cam1", STREAM), pinned.clone());

        let key = PurposeKey::new("cam1", SNAPSHOT);
        let conn = Connection::new();
        registry.track(key.clone(), conn.clone());

        assert_eq!(policy.on_idle_timeout(&conn, &key), IdleDecision::Close);
        assert!(!conn.is_open());
        assert!(pinned.is_open());
    }

    #[test]
    fn replaced_connection_on_pinned_url_closes() {
        let (registry, policy) = setup();
        let key = PurposeKey::new("cam1", STREAM);
        let old = Connection::new();
        registry.track(key.clone(), old.clone());
        let new = Connection::new();
        registry.track(key.clone(), new.clone());

        // Same URL, different instance.
        assert_eq!(policy.on_idle_timeout(&old, &key), IdleDecision::Close);
        assert!(!old.is_open());
        assert!(new.is_open());
    }

    #[test]
    fn no_pin_closes() {
        let (registry, policy) = setup();
        let key = PurposeKey::new("cam2", STREAM);
        let conn = Connection::new();
        registry.track(key.clone(), conn.clone());

        assert_eq!(policy.on_idle_timeout(&conn, &key), IdleDecision::Close);
    }

    #[test]
    fn unpin_releases() {
        let (registry, policy) = setup();
        let key = PurposeKey::new("cam1", STREAM);
        let conn = Connection::new();
        registry.track(key.clone(), conn.clone());

        assert_eq!(policy.unpin("cam1").as_deref(), Some(STREAM));
        assert_eq!(policy.on_idle_timeout(&conn, &key), IdleDecision::Close);
    }
}
