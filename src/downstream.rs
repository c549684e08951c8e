use std::collections::HashSet;
use std::sync::Arc;

use crate::connection::ConnectionHandle;
use crate::correlator::CommandCorrelator;
use crate::registry::{
    RegistryError, RegistryPolicy, RegistrySnapshot, RemovalReason, Session, SessionRegistry,
};

/// At most one device per resource; the registry owns closing device sockets.
const DOWNSTREAM_POLICY: RegistryPolicy = RegistryPolicy {
    allow_multiple_per_resource: false,
    close_on_remove: true,
};

/// Device-facing sessions, keyed by session id and by resource id.
///
/// Registering a device for a resource that already has one evicts the old
/// device ("last writer wins"). Whenever a device session leaves the registry,
/// for whatever reason, its pending commands are failed before its socket is
/// closed and before any replacement becomes visible.
#[derive(Clone)]
pub struct DownstreamSessionManager {
    registry: SessionRegistry<ConnectionHandle>,
}

impl DownstreamSessionManager {
    pub fn new(correlator: CommandCorrelator) -> Self {
        let hook = Arc::new(
            move |session: &Session<ConnectionHandle>, reason: RemovalReason| {
                let failed = correlator.fail_session(&session.session_id);
                tracing::debug!(
                    session_id = %session.session_id,
                    resource_id = ?session.resource_id,
                    ?reason,
                    failed_requests = failed,
                    "device session removed"
                );
            },
        );
        Self {
            registry: SessionRegistry::with_removal_hook(DOWNSTREAM_POLICY, hook),
        }
    }

    /// Register a device session for `resource_id`.
    ///
    /// Returns the evicted previous owner, if any. It has already been closed
    /// and its pending requests failed.
    pub fn register(
        &self,
        resource_id: &str,
        connection: ConnectionHandle,
    ) -> Result<Option<ConnectionHandle>, RegistryError> {
        let session_id = connection.id().to_string();
        let evicted = self
            .registry
            .register(&session_id, Some(resource_id), connection)?;
        Ok(evicted.map(|s| s.payload))
    }

    pub fn unregister(&self, session_id: &str) -> Option<ConnectionHandle> {
        self.registry.unregister(session_id).map(|s| s.payload)
    }

    pub fn get_by_session_id(&self, session_id: &str) -> Option<ConnectionHandle> {
        self.registry.get_by_session_id(session_id)
    }

    pub fn get_by_resource_id(&self, resource_id: &str) -> Option<ConnectionHandle> {
        self.registry.get_by_resource_id(resource_id)
    }

    pub fn session_id_for_resource(&self, resource_id: &str) -> Option<String> {
        self.registry.session_id_for_resource(resource_id)
    }

    pub fn resource_id_for(&self, session_id: &str) -> Option<String> {
        self.registry.resource_id_for(session_id)
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

    /// Close every device session. Pending requests fail with
    /// `SessionClosed`.
    pub fn drain(&self) -> usize {
        self.registry.drain().len()
    }
}
