use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// A live connection handle stored in a [`SessionRegistry`].
///
/// Registries hand out clones of the payload, so implementations are expected
/// to be cheap `Arc`-backed handles.
pub trait SessionPayload: Clone + Send + Sync + 'static {
    /// Release the connection behind this handle. Must be idempotent.
    fn close(&self);
}

/// One registered session.
#[derive(Debug, Clone)]
pub struct Session<T> {
    pub session_id: String,
    /// Logical resource the session is bound to. Upstream sessions may
    /// connect before they know it.
    pub resource_id: Option<String>,
    pub payload: T,
}

/// Why a session left the registry. Passed to the removal hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Explicit `unregister` (usually a transport disconnect).
    Unregistered,
    /// Another session claimed the same resource id.
    Evicted,
    /// Registry teardown.
    Drained,
}

/// Behaviour switches that distinguish the upstream and downstream registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryPolicy {
    /// When false, a resource id has at most one owner and a new registration
    /// evicts the previous owner.
    pub allow_multiple_per_resource: bool,
    /// When true, the registry calls [`SessionPayload::close`] on every
    /// session it removes.
    pub close_on_remove: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session id must not be empty")]
    EmptySessionId,
    #[error("resource id must not be empty")]
    EmptyResourceId,
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Callback invoked for every removed session while the registry write lock
/// is still held. It must not call back into the same registry.
pub type RemovalHook<T> = Arc<dyn Fn(&Session<T>, RemovalReason) + Send + Sync>;

struct RegistryInner<T> {
    sessions: HashMap<String, Session<T>>,
    by_resource: HashMap<String, HashSet<String>>,
}

impl<T> RegistryInner<T> {
    fn index(&mut self, session_id: &str, resource_id: &str) {
        self.by_resource
            .entry(resource_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    fn unindex(&mut self, session_id: &str, resource_id: &str) {
        if let Some(set) = self.by_resource.get_mut(resource_id) {
            set.remove(session_id);
            if set.is_empty() {
                self.by_resource.remove(resource_id);
            }
        }
    }

    fn take(&mut self, session_id: &str) -> Option<Session<T>> {
        let session = self.sessions.remove(session_id)?;
        if let Some(ref rid) = session.resource_id {
            self.unindex(session_id, rid);
        }
        Some(session)
    }
}

/// Thread-safe bidirectional map between session ids and resource ids.
///
/// Every mutation runs under one write lock, so readers never see a session
/// without its resource index entry (or the reverse), and a single-owner
/// registry never shows two owners for the same resource.
pub struct SessionRegistry<T: SessionPayload> {
    inner: Arc<RwLock<RegistryInner<T>>>,
    policy: RegistryPolicy,
    on_remove: Option<RemovalHook<T>>,
}

impl<T: SessionPayload> Clone for SessionRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: self.policy,
            on_remove: self.on_remove.clone(),
        }
    }
}

impl<T: SessionPayload> SessionRegistry<T> {
    pub fn new(policy: RegistryPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                by_resource: HashMap::new(),
            })),
            policy,
            on_remove: None,
        }
    }

    /// Create a registry that runs `hook` for every removed session, before
    /// the write lock is released.
    pub fn with_removal_hook(policy: RegistryPolicy, hook: RemovalHook<T>) -> Self {
        let mut registry = Self::new(policy);
        registry.on_remove = Some(hook);
        registry
    }

    fn release(&self, session: &Session<T>, reason: RemovalReason) {
        if let Some(ref hook) = self.on_remove {
            hook(session, reason);
        }
        if self.policy.close_on_remove {
            session.payload.close();
        }
    }

    /// Insert a session, or overwrite the entry with the same session id.
    ///
    /// In a single-owner registry any other session already holding
    /// `resource_id` is evicted first: the removal hook runs, its payload is
    /// closed, and only then is the new mapping stored. The evicted session is
    /// returned.
    pub fn register(
        &self,
        session_id: &str,
        resource_id: Option<&str>,
        payload: T,
    ) -> Result<Option<Session<T>>, RegistryError> {
        if session_id.trim().is_empty() {
            return Err(RegistryError::EmptySessionId);
        }
        if let Some(rid) = resource_id {
            if rid.trim().is_empty() {
                return Err(RegistryError::EmptyResourceId);
            }
        }

        let mut inner = self.inner.write();

        // Overwriting our own entry is a rebind, not an eviction.
        if let Some(previous) = inner.take(session_id) {
            tracing::debug!(
                session_id,
                old_resource = ?previous.resource_id,
                "overwriting registered session"
            );
        }

        Ok(self.insert_locked(&mut inner, session_id, resource_id, payload))
    }

    /// Move an already registered session to `resource_id`.
    ///
    /// Follows the same eviction rule as [`register`](Self::register).
    pub fn bind_resource(
        &self,
        session_id: &str,
        resource_id: &str,
    ) -> Result<Option<Session<T>>, RegistryError> {
        if resource_id.trim().is_empty() {
            return Err(RegistryError::EmptyResourceId);
        }
        let mut inner = self.inner.write();
        let existing = inner
            .take(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        Ok(self.insert_locked(&mut inner, session_id, Some(resource_id), existing.payload))
    }

    fn insert_locked(
        &self,
        inner: &mut RegistryInner<T>,
        session_id: &str,
        resource_id: Option<&str>,
        payload: T,
    ) -> Option<Session<T>> {
        let evicted = match resource_id {
            Some(rid) if !self.policy.allow_multiple_per_resource => {
                let owner = inner
                    .by_resource
                    .get(rid)
                    .and_then(|set| set.iter().next().cloned());
                match owner.and_then(|old_id| inner.take(&old_id)) {
                    Some(old) => {
                        tracing::warn!(
                            resource_id = rid,
                            evicted_session = %old.session_id,
                            new_session = session_id,
                            "resource claimed by a new session, evicting previous owner"
                        );
                        self.release(&old, RemovalReason::Evicted);
                        Some(old)
                    }
                    None => None,
                }
            }
            _ => None,
        };

        if let Some(rid) = resource_id {
            inner.index(session_id, rid);
        }
        inner.sessions.insert(
            session_id.to_string(),
            Session {
                session_id: session_id.to_string(),
                resource_id: resource_id.map(str::to_string),
                payload,
            },
        );
        evicted
    }

    /// Remove a session. Unknown ids are a no-op.
    pub fn unregister(&self, session_id: &str) -> Option<Session<T>> {
        let mut inner = self.inner.write();
        let removed = inner.take(session_id)?;
        self.release(&removed, RemovalReason::Unregistered);
        Some(removed)
    }

    pub fn get_by_session_id(&self, session_id: &str) -> Option<T> {
        self.inner
            .read()
            .sessions
            .get(session_id)
            .map(|s| s.payload.clone())
    }

    /// Look up the owner of `resource_id`.
    ///
    /// Only meaningful for single-owner registries; a multi-owner registry
    /// always answers `None`.
    pub fn get_by_resource_id(&self, resource_id: &str) -> Option<T> {
        if self.policy.allow_multiple_per_resource {
            return None;
        }
        let inner = self.inner.read();
        let session_id = inner.by_resource.get(resource_id)?.iter().next()?;
        inner.sessions.get(session_id).map(|s| s.payload.clone())
    }

    /// Session id owning `resource_id` in a single-owner registry.
    pub fn session_id_for_resource(&self, resource_id: &str) -> Option<String> {
        if self.policy.allow_multiple_per_resource {
            return None;
        }
        self.inner
            .read()
            .by_resource
            .get(resource_id)
            .and_then(|set| set.iter().next().cloned())
    }

    /// All session ids bound to `resource_id`.
    pub fn session_ids_for_resource(&self, resource_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut ids: Vec<String> = inner
            .by_resource
            .get(resource_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn resource_id_for(&self, session_id: &str) -> Option<String> {
        self.inner
            .read()
            .sessions
            .get(session_id)
            .and_then(|s| s.resource_id.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.read().sessions.contains_key(session_id)
    }

    pub fn active_resource_ids(&self) -> HashSet<String> {
        self.inner.read().by_resource.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Copy of every mapping, for operational inspection.
    pub fn diagnostics(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        let mut sessions: Vec<SessionSummary> = inner
            .sessions
            .values()
            .map(|s| SessionSummary {
                session_id: s.session_id.clone(),
                resource_id: s.resource_id.clone(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        let resources = inner
            .by_resource
            .iter()
            .map(|(rid, ids)| (rid.clone(), ids.iter().cloned().collect()))
            .collect();
        RegistrySnapshot {
            count: sessions.len(),
            sessions,
            resources,
        }
    }

    /// Remove every session, running the removal hook and closing payloads.
    pub fn drain(&self) -> Vec<Session<T>> {
        let mut inner = self.inner.write();
        inner.by_resource.clear();
        let drained: Vec<Session<T>> = inner.sessions.drain().map(|(_, s)| s).collect();
        for session in &drained {
            self.release(session, RemovalReason::Drained);
        }
        drained
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub resource_id: Option<String>,
}

/// Point-in-time copy of a registry's contents.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub count: usize,
    pub sessions: Vec<SessionSummary>,
    pub resources: BTreeMap<String, BTreeSet<String>>,
}
