use std::collections::HashSet;

use crate::connection::ConnectionHandle;
use crate::registry::{RegistryError, RegistryPolicy, RegistrySnapshot, SessionRegistry};

/// Any number of clients may watch a resource. Client sockets are closed by
/// their own transport, except on drain.
const UPSTREAM_POLICY: RegistryPolicy = RegistryPolicy {
    allow_multiple_per_resource: true,
    close_on_remove: false,
};

/// Client-facing sessions. Each is bound to at most one resource id, which
/// may be learned after the connection opens.
#[derive(Clone)]
pub struct UpstreamSessionManager {
    registry: SessionRegistry<ConnectionHandle>,
}

impl Default for UpstreamSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamSessionManager {
    pub fn new() -> Self {
        Self {
            registry: SessionRegistry::new(UPSTREAM_POLICY),
        }
    }

    /// Track a newly connected client, optionally already bound.
    pub fn open(
        &self,
        resource_id: Option<&str>,
        connection: ConnectionHandle,
    ) -> Result<(), RegistryError> {
        let session_id = connection.id().to_string();
        self.registry.register(&session_id, resource_id, connection)?;
        Ok(())
    }

    /// Bind (or rebind) a client to `resource_id`.
    pub fn bind_resource(&self, session_id: &str, resource_id: &str) -> Result<(), RegistryError> {
        self.registry.bind_resource(session_id, resource_id)?;
        Ok(())
    }

    pub fn close(&self, session_id: &str) -> bool {
        self.registry.unregister(session_id).is_some()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.registry.contains(session_id)
    }

    pub fn resource_id_for(&self, session_id: &str) -> Option<String> {
        self.registry.resource_id_for(session_id)
    }

    /// Session ids of every client bound to `resource_id`, sorted.
    pub fn sessions_for_resource(&self, resource_id: &str) -> Vec<String> {
        self.registry.session_ids_for_resource(resource_id)
    }

    pub fn active_resource_ids(&self) -> HashSet<String> {
        self.registry.active_resource_ids()
    }

    pub fn count(&self) -> usize {
        self.registry.count()
    }

    pub fn diagnostics(&self) -> RegistrySnapshot {
        self.registry.diagnostics()
    }

    /// Remove and close every client session.
    pub fn drain(&self) -> usize {
        let drained = self.registry.drain();
        for session in &drained {
            session.payload.close();
        }
        drained.len()
    }
}
