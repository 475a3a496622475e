use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// A running camera session, as seen by group aggregators.
///
/// Implemented by the camera-session layer that owns the connections.
pub trait CameraSession: Send + Sync {
    fn camera_id(&self) -> &str;

    fn is_online(&self) -> bool;

    /// Most recent still image, if one has been captured.
    fn latest_snapshot(&self) -> Option<Vec<u8>>;

    /// Whether the camera currently reports motion.
    fn motion_detected(&self) -> bool {
        false
    }
}

/// A named set of cameras queried together (e.g. a multi-camera view).
///
/// Members are camera ids; a member only takes part in a query while its
/// session is registered and online.
#[derive(Debug)]
pub struct CameraGroup {
    name: String,
    members: RwLock<Vec<String>>,
}

impl CameraGroup {
    pub fn new(name: &str, members: &[&str]) -> Self {
        CameraGroup {
            name: name.to_string(),
            members: RwLock::new(members.iter().map(|m| m.to_string()).collect()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> Vec<String> {
        self.members.read().clone()
    }

    pub fn add_member(&self, camera_id: &str) {
        let mut members = self.members.write();
        if !members.iter().any(|m| m == camera_id) {
            members.push(camera_id.to_string());
        }
    }

    pub fn remove_member(&self, camera_id: &str) {
        self.members.write().retain(|m| m != camera_id);
    }

    /// Run `query` on every online member, in member order.
    pub fn fan_out<T>(
        &self,
        registry: &CameraGroupRegistry,
        query: impl Fn(&dyn CameraSession) -> T,
    ) -> Vec<(String, T)> {
        let members = self.members();
        members
            .into_iter()
            .filter_map(|id| {
                let session = registry.session(&id)?;
                if !session.is_online() {
                    return None;
                }
                let answer = query(session.as_ref());
                Some((id, answer))
            })
            .collect()
    }

    /// Members currently online.
    pub fn online_members(&self, registry: &CameraGroupRegistry) -> Vec<String> {
        self.fan_out(registry, |_| ())
            .into_iter()
            .map(|(id, ())| id)
            .collect()
    }
}

#[derive(Default)]
struct Inner {
    sessions: RwLock<HashMap<String, Arc<dyn CameraSession>>>,
    groups: RwLock<Vec<Arc<CameraGroup>>>,
}

/// Online camera sessions and the group aggregators over them.
///
/// Sessions register when they come online and unregister when disposed;
/// discovery tasks and connection drivers do both concurrently.
#[derive(Clone, Default)]
pub struct CameraGroupRegistry {
    inner: Arc<Inner>,
}

impl CameraGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an online session. Returns the session it replaced, if any.
    pub fn register_session(
        &self,
        camera_id: &str,
        session: Arc<dyn CameraSession>,
    ) -> Option<Arc<dyn CameraSession>> {
        let previous = self
            .inner
            .sessions
            .write()
            .insert(camera_id.to_string(), session);
        tracing::info!(camera = camera_id, replaced = previous.is_some(), "camera session online");
        previous
    }

    pub fn unregister_session(&self, camera_id: &str) -> Option<Arc<dyn CameraSession>> {
        let removed = self.inner.sessions.write().remove(camera_id);
        if removed.is_some() {
            tracing::info!(camera = camera_id, "camera session offline");
        }
        removed
    }

    pub fn session(&self, camera_id: &str) -> Option<Arc<dyn CameraSession>> {
        self.inner.sessions.read().get(camera_id).cloned()
    }

    pub fn online_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Add a group aggregator. Replaces a group with the same name.
    pub fn add_group(&self, group: Arc<CameraGroup>) {
        let mut groups = self.inner.groups.write();
        groups.retain(|g| g.name() != group.name());
        groups.push(group);
    }

    pub fn remove_group(&self, name: &str) -> Option<Arc<CameraGroup>> {
        let mut groups = self.inner.groups.write();
        let pos = groups.iter().position(|g| g.name() == name)?;
        Some(groups.remove(pos))
    }

    pub fn list_group_handlers(&self) -> Vec<Arc<CameraGroup>> {
        self.inner.groups.read().clone()
    }

    /// Groups that include `camera_id`.
    pub fn groups_of(&self, camera_id: &str) -> Vec<Arc<CameraGroup>> {
        self.inner
            .groups
            .read()
            .iter()
            .filter(|g| g.members.read().iter().any(|m| m == camera_id))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for CameraGroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraGroupRegistry")
            .field("online", &self.online_count())
            .field("groups", &self.inner.groups.read().len())
            .finish()
    }
}
