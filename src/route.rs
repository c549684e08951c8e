use std::collections::BTreeSet;

use serde::Serialize;

use crate::downstream::DownstreamSessionManager;
use crate::upstream::UpstreamSessionManager;

/// Why a route could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteErrorCode {
    NoResourceForSession,
    InvalidResourceId,
    NoDownstreamForResource,
    DownstreamSessionGone,
}

impl RouteErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteErrorCode::NoResourceForSession => "NO_RESOURCE_FOR_SESSION",
            RouteErrorCode::InvalidResourceId => "INVALID_RESOURCE_ID",
            RouteErrorCode::NoDownstreamForResource => "NO_DOWNSTREAM_FOR_RESOURCE",
            RouteErrorCode::DownstreamSessionGone => "DOWNSTREAM_SESSION_GONE",
        }
    }
}

impl std::fmt::Display for RouteErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RouteResolution {
    Success {
        downstream_session_id: String,
        resource_id: String,
    },
    Failure {
        error_code: RouteErrorCode,
        message: String,
    },
}

impl RouteResolution {
    fn failure(error_code: RouteErrorCode, message: String) -> Self {
        tracing::debug!(code = %error_code, %message, "route not resolved");
        RouteResolution::Failure {
            error_code,
            message,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RouteResolution::Success { .. })
    }
}

/// Routing state of one resource id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRoute {
    pub resource_id: String,
    pub upstream_sessions: Vec<String>,
    pub downstream_session: Option<String>,
    pub routable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDiagnostics {
    pub upstream_sessions: usize,
    pub downstream_sessions: usize,
    pub routable_resources: usize,
    pub resources: Vec<ResourceRoute>,
}

/// Maps client sessions to the device currently serving their resource.
///
/// Read-only over both registries; safe to call while sessions come and go.
#[derive(Clone)]
pub struct RouteResolver {
    upstream: UpstreamSessionManager,
    downstream: DownstreamSessionManager,
    peer_name: String,
}

impl RouteResolver {
    /// `peer_name` names the device-side program in user-facing messages.
    pub fn new(
        upstream: UpstreamSessionManager,
        downstream: DownstreamSessionManager,
        peer_name: impl Into<String>,
    ) -> Self {
        Self {
            upstream,
            downstream,
            peer_name: peer_name.into(),
        }
    }

    pub fn resolve(&self, upstream_session_id: &str) -> RouteResolution {
        match self.upstream.resource_id_for(upstream_session_id) {
            Some(resource_id) => self.resolve_by_resource_id(&resource_id),
            None if self.upstream.contains(upstream_session_id) => RouteResolution::failure(
                RouteErrorCode::NoResourceForSession,
                format!(
                    "Session {upstream_session_id} is not bound to a resource yet. \
                     Call bind_resource with the resource id shown by the {}.",
                    self.peer_name
                ),
            ),
            None => RouteResolution::failure(
                RouteErrorCode::NoResourceForSession,
                format!("Unknown client session {upstream_session_id}."),
            ),
        }
    }

    pub fn resolve_by_resource_id(&self, resource_id: &str) -> RouteResolution {
        if resource_id.trim().is_empty() {
            return RouteResolution::failure(
                RouteErrorCode::InvalidResourceId,
                "Resource id must not be empty.".to_string(),
            );
        }

        let Some(session_id) = self.downstream.session_id_for_resource(resource_id) else {
            return RouteResolution::failure(
                RouteErrorCode::NoDownstreamForResource,
                format!(
                    "No {} is connected for resource {resource_id}. \
                     Open the document and start the {} so it can connect.",
                    self.peer_name, self.peer_name
                ),
            );
        };

        // The owner may have been evicted or closed between the two lookups.
        match self.downstream.get_by_session_id(&session_id) {
            Some(conn) if !conn.is_closed() => RouteResolution::Success {
                downstream_session_id: session_id,
                resource_id: resource_id.to_string(),
            },
            _ => RouteResolution::failure(
                RouteErrorCode::DownstreamSessionGone,
                format!(
                    "The {} for resource {resource_id} disconnected. Reconnect it and retry.",
                    self.peer_name
                ),
            ),
        }
    }

    /// Routability of every resource known to either side.
    pub fn diagnostics(&self) -> RouteDiagnostics {
        let mut resource_ids: BTreeSet<String> =
            self.upstream.active_resource_ids().into_iter().collect();
        resource_ids.extend(self.downstream.active_resource_ids());

        let resources: Vec<ResourceRoute> = resource_ids
            .into_iter()
            .map(|resource_id| {
                let upstream_sessions = self.upstream.sessions_for_resource(&resource_id);
                let downstream_session = self
                    .downstream
                    .get_by_resource_id(&resource_id)
                    .filter(|conn| !conn.is_closed())
                    .map(|conn| conn.id().to_string());
                let routable = !upstream_sessions.is_empty() && downstream_session.is_some();
                ResourceRoute {
                    resource_id,
                    upstream_sessions,
                    downstream_session,
                    routable,
                }
            })
            .collect();

        RouteDiagnostics {
            upstream_sessions: self.upstream.count(),
            downstream_sessions: self.downstream.count(),
            routable_resources: resources.iter().filter(|r| r.routable).count(),
            resources,
        }
    }
}
