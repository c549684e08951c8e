//! The bridge service object.
//!
//! [`Bridge`] owns both session registries, the route resolver, the command
//! correlator and the command registry. Transports report connection
//! lifecycle and device frames to it; the dispatch side asks it for routes
//! and sends commands through it. One instance is built at startup and
//! cloned into every handler.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::connection::{ConnectionHandle, DEFAULT_OUTBOUND_CAPACITY};
use crate::correlator::{CommandCorrelator, PendingSummary, ResponseDisposition, DEFAULT_COMMAND_TIMEOUT};
use crate::dispatch::{CommandContext, CommandRegistry};
use crate::downstream::DownstreamSessionManager;
use crate::error::{CommandError, CorrelationError};
use crate::protocol::{parse_device_frame, DeviceFrame};
use crate::registry::{RegistryError, RegistrySnapshot};
use crate::route::{RouteDiagnostics, RouteResolution, RouteResolver};
use crate::upstream::UpstreamSessionManager;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runtime knobs, usually derived from [`crate::config::BridgeConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    pub default_timeout: Duration,
    /// Caller-supplied timeouts are clamped to this.
    pub max_timeout: Duration,
    pub outbound_capacity: usize,
    /// How user-facing messages name the device-side program.
    pub peer_name: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_timeout: Duration::from_secs(120),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            peer_name: "device plugin".to_string(),
        }
    }
}

/// Lifecycle notifications published by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    UpstreamOpened {
        session_id: String,
        resource_id: Option<String>,
    },
    UpstreamClosed {
        session_id: String,
    },
    ResourceBound {
        session_id: String,
        resource_id: String,
    },
    DownstreamOpened {
        session_id: String,
        resource_id: String,
    },
    DownstreamEvicted {
        session_id: String,
        resource_id: String,
        replaced_by: String,
    },
    DownstreamClosed {
        session_id: String,
        resource_id: Option<String>,
    },
    /// A device frame that was not a command reply.
    DeviceFrame {
        session_id: String,
        resource_id: Option<String>,
        frame: Value,
    },
}

/// What happened to a frame passed to [`Bridge::frame_received`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Completed a pending command.
    Resolved,
    /// A reply nobody was waiting for; dropped.
    Unmatched,
    /// Published as [`BridgeEvent::DeviceFrame`].
    Event,
    /// Not JSON; dropped.
    Invalid,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeDiagnostics {
    pub routes: RouteDiagnostics,
    pub upstream: RegistrySnapshot,
    pub downstream: RegistrySnapshot,
    pub pending_requests: Vec<PendingSummary>,
    pub commands: Vec<String>,
    pub passthrough: bool,
}

/// Counts of what [`Bridge::shutdown`] tore down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    pub upstream_sessions: usize,
    pub downstream_sessions: usize,
    pub failed_requests: usize,
}

struct BridgeInner {
    upstream: UpstreamSessionManager,
    downstream: DownstreamSessionManager,
    correlator: CommandCorrelator,
    resolver: RouteResolver,
    commands: CommandRegistry,
    settings: BridgeSettings,
    events_tx: broadcast::Sender<BridgeEvent>,
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new(settings: BridgeSettings, commands: CommandRegistry) -> Self {
        let correlator = CommandCorrelator::new();
        let upstream = UpstreamSessionManager::new();
        let downstream = DownstreamSessionManager::new(correlator.clone());
        let resolver =
            RouteResolver::new(upstream.clone(), downstream.clone(), settings.peer_name.clone());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BridgeInner {
                upstream,
                downstream,
                correlator,
                resolver,
                commands,
                settings,
                events_tx,
            }),
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.inner.settings
    }

    pub fn upstream(&self) -> &UpstreamSessionManager {
        &self.inner.upstream
    }

    pub fn downstream(&self) -> &DownstreamSessionManager {
        &self.inner.downstream
    }

    pub fn correlator(&self) -> &CommandCorrelator {
        &self.inner.correlator
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events_tx.subscribe()
    }

    fn publish(&self, event: BridgeEvent) {
        // No subscribers is fine.
        let _ = self.inner.events_tx.send(event);
    }

    /// Create a connection handle sized by the configured queue capacity.
    pub fn new_connection(&self, session_id: impl Into<String>) -> (ConnectionHandle, mpsc::Receiver<String>) {
        ConnectionHandle::new(session_id, self.inner.settings.outbound_capacity)
    }

    /// Clamp a caller-supplied timeout, falling back to the default.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let settings = &self.inner.settings;
        match requested {
            Some(t) if !t.is_zero() => t.min(settings.max_timeout),
            _ => settings.default_timeout,
        }
    }

    // ── upstream transport ─────────────────────────────────────────

    pub fn upstream_opened(
        &self,
        connection: ConnectionHandle,
        resource_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        let session_id = connection.id().to_string();
        self.inner.upstream.open(resource_id, connection)?;
        tracing::info!(session_id = %session_id, resource_id = ?resource_id, "client connected");
        self.publish(BridgeEvent::UpstreamOpened {
            session_id,
            resource_id: resource_id.map(str::to_string),
        });
        Ok(())
    }

    pub fn upstream_closed(&self, session_id: &str) {
        if self.inner.upstream.close(session_id) {
            tracing::info!(session_id, "client disconnected");
            self.publish(BridgeEvent::UpstreamClosed {
                session_id: session_id.to_string(),
            });
        }
    }

    pub fn bind_resource(&self, session_id: &str, resource_id: &str) -> Result<(), RegistryError> {
        self.inner.upstream.bind_resource(session_id, resource_id)?;
        tracing::info!(session_id, resource_id, "client bound to resource");
        self.publish(BridgeEvent::ResourceBound {
            session_id: session_id.to_string(),
            resource_id: resource_id.to_string(),
        });
        Ok(())
    }

    // ── downstream transport ───────────────────────────────────────

    /// Register a device connection, evicting any device already serving
    /// `resource_id`.
    pub fn downstream_opened(
        &self,
        resource_id: &str,
        connection: ConnectionHandle,
    ) -> Result<(), RegistryError> {
        let session_id = connection.id().to_string();
        let evicted = self.inner.downstream.register(resource_id, connection)?;
        if let Some(old) = evicted {
            self.publish(BridgeEvent::DownstreamEvicted {
                session_id: old.id().to_string(),
                resource_id: resource_id.to_string(),
                replaced_by: session_id.clone(),
            });
        }
        tracing::info!(session_id = %session_id, resource_id, "device connected");
        self.publish(BridgeEvent::DownstreamOpened {
            session_id,
            resource_id: resource_id.to_string(),
        });
        Ok(())
    }

    /// The device transport is gone. No-op if it was already evicted.
    pub fn downstream_closed(&self, session_id: &str) {
        let resource_id = self.inner.downstream.resource_id_for(session_id);
        if self.inner.downstream.unregister(session_id).is_some() {
            tracing::info!(session_id, resource_id = ?resource_id, "device disconnected");
            self.publish(BridgeEvent::DownstreamClosed {
                session_id: session_id.to_string(),
                resource_id,
            });
        }
    }

    /// Handle one text frame read from a device.
    pub fn frame_received(&self, session_id: &str, raw: &str) -> FrameDisposition {
        match parse_device_frame(raw) {
            Ok(DeviceFrame::Response {
                request_id,
                outcome,
            }) => {
                let disposition = self
                    .inner
                    .correlator
                    .handle_response(session_id, &request_id, outcome);
                match disposition {
                    ResponseDisposition::Resolved => FrameDisposition::Resolved,
                    ResponseDisposition::DuplicateOrUnknown => {
                        tracing::debug!(session_id, request_id = %request_id, "unmatched device reply");
                        FrameDisposition::Unmatched
                    }
                }
            }
            Ok(DeviceFrame::Other(frame)) => {
                self.publish(BridgeEvent::DeviceFrame {
                    session_id: session_id.to_string(),
                    resource_id: self.inner.downstream.resource_id_for(session_id),
                    frame,
                });
                FrameDisposition::Event
            }
            Err(e) => {
                tracing::debug!(session_id, error = %e, "ignoring malformed device frame");
                FrameDisposition::Invalid
            }
        }
    }

    // ── dispatch side ──────────────────────────────────────────────

    pub fn resolve_route(&self, upstream_session_id: &str) -> RouteResolution {
        self.inner.resolver.resolve(upstream_session_id)
    }

    pub fn resolve_resource(&self, resource_id: &str) -> RouteResolution {
        self.inner.resolver.resolve_by_resource_id(resource_id)
    }

    /// Send a command to a device session and wait for the reply.
    pub async fn send_command(
        &self,
        downstream_session_id: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CorrelationError> {
        let Some(connection) = self.inner.downstream.get_by_session_id(downstream_session_id) else {
            return Err(CorrelationError::SessionClosed {
                session_id: downstream_session_id.to_string(),
            });
        };
        let timeout = self.effective_timeout(timeout);
        self.inner
            .correlator
            .send_command(&connection, method, params, timeout)
            .await
    }

    /// Route a client command through the session's bound resource and run it.
    pub async fn execute(
        &self,
        upstream_session_id: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CommandError> {
        let route = self.resolve_route(upstream_session_id);
        self.execute_on(route, method, params, timeout).await
    }

    /// Run a command against whichever device currently serves `resource_id`.
    pub async fn execute_for_resource(
        &self,
        resource_id: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CommandError> {
        let route = self.resolve_resource(resource_id);
        self.execute_on(route, method, params, timeout).await
    }

    async fn execute_on(
        &self,
        route: RouteResolution,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CommandError> {
        let (downstream_session_id, resource_id) = match route {
            RouteResolution::Success {
                downstream_session_id,
                resource_id,
            } => (downstream_session_id, resource_id),
            RouteResolution::Failure {
                error_code,
                message,
            } => {
                return Err(CommandError::Route {
                    code: error_code,
                    message,
                })
            }
        };
        let ctx = CommandContext {
            bridge: self,
            downstream_session_id: &downstream_session_id,
            resource_id: &resource_id,
            timeout: self.effective_timeout(timeout),
        };
        self.inner.commands.dispatch(ctx, method, params).await
    }

    pub fn diagnostics(&self) -> BridgeDiagnostics {
        BridgeDiagnostics {
            routes: self.inner.resolver.diagnostics(),
            upstream: self.inner.upstream.diagnostics(),
            downstream: self.inner.downstream.diagnostics(),
            pending_requests: self.inner.correlator.diagnostics(),
            commands: self.inner.commands.names(),
            passthrough: self.inner.commands.passthrough(),
        }
    }

    /// Close every session and fail every pending command.
    pub fn shutdown(&self) -> ShutdownReport {
        // Device sessions first so their removal hook fails pending requests
        // with the right session id.
        let downstream_sessions = self.inner.downstream.drain();
        let failed_requests = self.inner.correlator.fail_all();
        let upstream_sessions = self.inner.upstream.drain();
        let report = ShutdownReport {
            upstream_sessions,
            downstream_sessions,
            failed_requests,
        };
        tracing::info!(
            upstream = report.upstream_sessions,
            downstream = report.downstream_sessions,
            failed_requests = report.failed_requests,
            "bridge shut down"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bridge() -> Bridge {
        Bridge::new(BridgeSettings::default(), CommandRegistry::with_builtins(true))
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> crate::protocol::CommandFrame {
        let raw = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame should be written")
            .expect("queue open");
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn effective_timeout_defaults_and_clamps() {
        let b = bridge();
        assert_eq!(b.effective_timeout(None), DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(b.effective_timeout(Some(Duration::ZERO)), DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(
            b.effective_timeout(Some(Duration::from_millis(500))),
            Duration::from_millis(500)
        );
        assert_eq!(
            b.effective_timeout(Some(Duration::from_secs(3600))),
            Duration::from_secs(120)
        );
    }

    #[tokio::test]
    async fn doc_42_scenario_end_to_end() {
        let b = bridge();
        let (u1, _urx) = b.new_connection("u1");
        b.upstream_opened(u1, None).unwrap();
        b.bind_resource("u1", "doc-42").unwrap();
        assert!(!b.resolve_route("u1").is_success());

        let (d1, mut d1_rx) = b.new_connection("d1");
        b.downstream_opened("doc-42", d1.clone()).unwrap();
        assert_eq!(
            b.resolve_route("u1"),
            RouteResolution::Success {
                downstream_session_id: "d1".into(),
                resource_id: "doc-42".into(),
            }
        );

        let b2 = b.clone();
        let call = tokio::spawn(async move {
            b2.send_command("d1", "ping", json!({}), Some(Duration::from_millis(5000)))
                .await
        });
        let frame = next_frame(&mut d1_rx).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let reply = json!({"requestId": frame.request_id, "result": {"pong": true}}).to_string();
        assert_eq!(b.frame_received("d1", &reply), FrameDisposition::Resolved);
        assert_eq!(call.await.unwrap(), Ok(json!({"pong": true})));

        let (d2, _d2_rx) = b.new_connection("d2");
        b.downstream_opened("doc-42", d2).unwrap();
        assert!(d1.is_closed());
        assert_eq!(
            b.resolve_route("u1"),
            RouteResolution::Success {
                downstream_session_id: "d2".into(),
                resource_id: "doc-42".into(),
            }
        );
    }

    #[tokio::test]
    async fn eviction_publishes_events_in_order() {
        let b = bridge();
        let mut events = b.subscribe_events();

        let (d1, _r1) = b.new_connection("d1");
        b.downstream_opened("doc-42", d1).unwrap();
        let (d2, _r2) = b.new_connection("d2");
        b.downstream_opened("doc-42", d2).unwrap();
        // d1's transport notices the close and reports it; already gone.
        b.downstream_closed("d1");

        assert!(matches!(
            events.recv().await.unwrap(),
            BridgeEvent::DownstreamOpened { ref session_id, .. } if session_id == "d1"
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            BridgeEvent::DownstreamEvicted {
                session_id: "d1".into(),
                resource_id: "doc-42".into(),
                replaced_by: "d2".into(),
            }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            BridgeEvent::DownstreamOpened { ref session_id, .. } if session_id == "d2"
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn execute_dispatches_through_route() {
        let b = bridge();
        let (u1, _urx) = b.new_connection("u1");
        b.upstream_opened(u1, Some("doc-42")).unwrap();
        let (d1, mut d1_rx) = b.new_connection("d1");
        b.downstream_opened("doc-42", d1).unwrap();

        let b2 = b.clone();
        let call = tokio::spawn(async move {
            b2.execute("u1", "create_rectangle", json!({"width": 10}), None)
                .await
        });
        let frame = next_frame(&mut d1_rx).await;
        assert_eq!(frame.method, "create_rectangle");
        assert_eq!(frame.params, json!({"width": 10}));

        let reply = json!({"requestId": frame.request_id, "result": {"id": "1:5"}}).to_string();
        b.frame_received("d1", &reply);
        assert_eq!(call.await.unwrap(), Ok(json!({"id": "1:5"})));
    }

    #[tokio::test]
    async fn execute_reports_route_failure() {
        let b = bridge();
        let (u1, _urx) = b.new_connection("u1");
        b.upstream_opened(u1, Some("doc-42")).unwrap();

        let err = b.execute("u1", "ping", json!({}), None).await.unwrap_err();
        assert_eq!(err.code(), "NO_DOWNSTREAM_FOR_RESOURCE");
    }

    #[tokio::test]
    async fn unknown_method_rejected_without_passthrough() {
        let b = Bridge::new(BridgeSettings::default(), CommandRegistry::with_builtins(false));
        let (d1, _rx) = b.new_connection("d1");
        b.downstream_opened("doc-42", d1).unwrap();

        let err = b
            .execute_for_resource("doc-42", "delete_everything", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::UnknownMethod("delete_everything".into()));
    }

    #[tokio::test]
    async fn send_to_unknown_session_is_session_closed() {
        let b = bridge();
        let err = b
            .send_command("ghost", "ping", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_CLOSED");
    }

    #[tokio::test]
    async fn non_reply_frames_become_events() {
        let b = bridge();
        let mut events = b.subscribe_events();
        let (d1, _rx) = b.new_connection("d1");
        b.downstream_opened("doc-42", d1).unwrap();
        let _ = events.recv().await;

        let raw = r#"{"type":"selection_changed","ids":["1:2"]}"#;
        assert_eq!(b.frame_received("d1", raw), FrameDisposition::Event);
        assert_eq!(
            events.recv().await.unwrap(),
            BridgeEvent::DeviceFrame {
                session_id: "d1".into(),
                resource_id: Some("doc-42".into()),
                frame: json!({"type": "selection_changed", "ids": ["1:2"]}),
            }
        );

        assert_eq!(b.frame_received("d1", "garbage"), FrameDisposition::Invalid);
        assert_eq!(
            b.frame_received("d1", r#"{"requestId":"nope","result":1}"#),
            FrameDisposition::Unmatched
        );
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let b = bridge();
        let (u1, _urx) = b.new_connection("u1");
        b.upstream_opened(u1.clone(), Some("doc-42")).unwrap();
        let (d1, mut d1_rx) = b.new_connection("d1");
        b.downstream_opened("doc-42", d1.clone()).unwrap();

        let b2 = b.clone();
        let call = tokio::spawn(async move { b2.send_command("d1", "ping", json!({}), None).await });
        next_frame(&mut d1_rx).await;

        let report = b.shutdown();
        assert_eq!(
            report,
            ShutdownReport {
                upstream_sessions: 1,
                downstream_sessions: 1,
                failed_requests: 0,
            }
        );
        assert!(u1.is_closed() && d1.is_closed());
        assert_eq!(
            call.await.unwrap().unwrap_err().code(),
            "SESSION_CLOSED"
        );
        assert_eq!(b.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn device_cannot_answer_another_devices_command() {
        let b = bridge();
        let (d1, mut d1_rx) = b.new_connection("d1");
        b.downstream_opened("doc-a", d1).unwrap();
        let (d2, _d2_rx) = b.new_connection("d2");
        b.downstream_opened("doc-b", d2).unwrap();

        let b2 = b.clone();
        let call = tokio::spawn(async move {
            b2.send_command("d1", "ping", json!({}), Some(Duration::from_secs(5)))
                .await
        });
        let frame = next_frame(&mut d1_rx).await;

        let forged = json!({"requestId": frame.request_id, "result": "from-d2"}).to_string();
        assert_eq!(b.frame_received("d2", &forged), FrameDisposition::Unmatched);
        assert_eq!(b.correlator().pending_for_session("d1"), 1);

        let reply = json!({"requestId": frame.request_id, "result": "from-d1"}).to_string();
        assert_eq!(b.frame_received("d1", &reply), FrameDisposition::Resolved);
        assert_eq!(call.await.unwrap(), Ok(json!("from-d1")));
    }
}
