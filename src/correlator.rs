//! Request/response correlation over device connections.
//!
//! Every command written to a device carries a fresh `requestId`. The caller
//! parks on a oneshot slot keyed by that id until the device answers, the
//! timeout fires, or the device session goes away. Whoever removes the entry
//! from the pending map is the one that completes it, so a late reply racing a
//! timeout is a harmless no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::connection::ConnectionHandle;
use crate::error::CorrelationError;
use crate::protocol::{CommandFrame, RemoteError};

/// Default per-command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type Completion = oneshot::Sender<Result<Value, CorrelationError>>;

/// An outstanding command awaiting its reply.
struct PendingRequest {
    session_id: String,
    method: String,
    created_at: Instant,
    completion: Completion,
}

/// What [`CommandCorrelator::handle_response`] did with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// The reply completed a waiting caller.
    Resolved,
    /// No caller was waiting: the request already timed out, was answered
    /// before, or never existed.
    DuplicateOrUnknown,
}

/// Snapshot of one pending request, for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PendingSummary {
    pub request_id: String,
    pub session_id: String,
    pub method: String,
    pub age_ms: u64,
}

type PendingMap = Mutex<HashMap<String, PendingRequest>>;

/// Removes the pending entry when the awaiting future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.lock().remove(self.request_id).is_some() {
            tracing::debug!(request_id = %self.request_id, "pending request abandoned");
        }
    }
}

#[derive(Clone, Default)]
pub struct CommandCorrelator {
    pending: Arc<PendingMap>,
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `method` to the device behind `session` and wait for its reply.
    ///
    /// The call fails with [`CorrelationError::Timeout`] if no reply arrives
    /// within `timeout`, and with [`CorrelationError::SessionClosed`] as soon
    /// as the session is closed or evicted. Dropping the returned future
    /// cancels the request and clears its pending entry.
    pub async fn send_command(
        &self,
        session: &ConnectionHandle,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CorrelationError> {
        let session_id = session.id().to_string();
        if session.is_closed() {
            return Err(CorrelationError::SessionClosed { session_id });
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&CommandFrame {
            request_id: request_id.clone(),
            method: method.to_string(),
            params,
        })
        .map_err(|e| CorrelationError::Encode(e.to_string()))?;

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                session_id: session_id.clone(),
                method: method.to_string(),
                created_at: Instant::now(),
                completion: tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: &request_id,
        };

        tracing::debug!(
            session_id = %session_id,
            request_id = %request_id,
            method,
            "sending command"
        );

        let closed = session.closed_token();
        let exchange = async {
            if session.send(frame).await.is_err() {
                return Err(CorrelationError::SessionClosed {
                    session_id: session_id.clone(),
                });
            }
            tokio::select! {
                biased;
                reply = &mut rx => reply.unwrap_or_else(|_| {
                    Err(CorrelationError::SessionClosed { session_id: session_id.clone() })
                }),
                _ = closed.cancelled() => Err(CorrelationError::SessionClosed {
                    session_id: session_id.clone(),
                }),
            }
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // If the entry is already gone, a reply or a session failure
                // claimed the slot just as the timer fired; that one wins.
                let still_pending = self.pending.lock().remove(&request_id).is_some();
                if !still_pending {
                    if let Ok(result) = rx.await {
                        return result;
                    }
                }
                tracing::debug!(
                    session_id = %session_id,
                    request_id = %request_id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "command timed out"
                );
                Err(CorrelationError::Timeout {
                    request_id: request_id.clone(),
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Complete the request identified by `request_id` with a reply read
    /// from `session_id`.
    ///
    /// Unknown, duplicate and late replies are logged and dropped, as are
    /// replies from a session other than the one the command was sent to;
    /// such a reply leaves the request pending for its own session.
    pub fn handle_response(
        &self,
        session_id: &str,
        request_id: &str,
        outcome: Result<Value, RemoteError>,
    ) -> ResponseDisposition {
        let pending = {
            let mut pending = self.pending.lock();
            let owner = pending.get(request_id).map(|p| p.session_id.clone());
            match owner {
                Some(owner) if owner == session_id => pending.remove(request_id),
                Some(owner) => {
                    tracing::debug!(
                        request_id,
                        session_id,
                        owner = %owner,
                        "dropping reply from a session that does not own the request"
                    );
                    return ResponseDisposition::DuplicateOrUnknown;
                }
                None => None,
            }
        };
        let Some(pending) = pending else {
            tracing::debug!(request_id, session_id, "dropping reply with no pending request");
            return ResponseDisposition::DuplicateOrUnknown;
        };
        tracing::debug!(
            request_id,
            session_id = %pending.session_id,
            method = %pending.method,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "command answered"
        );
        // The receiver may have been dropped by a cancelled caller; the entry
        // is gone either way.
        let _ = pending.completion.send(outcome.map_err(CorrelationError::Remote));
        ResponseDisposition::Resolved
    }

    /// Fail every request pending on `session_id` with `SessionClosed`.
    /// Returns how many were failed.
    pub fn fail_session(&self, session_id: &str) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = failed.len();
        for p in failed {
            let _ = p.completion.send(Err(CorrelationError::SessionClosed {
                session_id: session_id.to_string(),
            }));
        }
        if count > 0 {
            tracing::debug!(session_id, count, "failed pending requests for closed session");
        }
        count
    }

    /// Fail every pending request. Used on shutdown.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for p in drained {
            let _ = p.completion.send(Err(CorrelationError::SessionClosed {
                session_id: p.session_id.clone(),
            }));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_for_session(&self, session_id: &str) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|p| p.session_id == session_id)
            .count()
    }

    pub fn diagnostics(&self) -> Vec<PendingSummary> {
        let mut out: Vec<PendingSummary> = self
            .pending
            .lock()
            .iter()
            .map(|(id, p)| PendingSummary {
                request_id: id.clone(),
                session_id: p.session_id.clone(),
                method: p.method.clone(),
                age_ms: p.created_at.elapsed().as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        out
    }
}
