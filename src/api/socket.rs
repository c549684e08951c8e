use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{Sink, SinkExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionHandle;

/// Sole writer for one WebSocket.
///
/// Drains the connection's outbound queue onto the socket, sends keepalive
/// pings, and sends a close frame once `closed` is cancelled. Frames queued
/// before the cancel are still written ahead of the close frame. A failed
/// write cancels `closed` so the read loop stops too.
pub(super) async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<String>,
    closed: CancellationToken,
    ping_interval: Option<Duration>,
) where
    S: Sink<Message> + Unpin,
{
    let mut ping = ping_interval.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        closed.cancel();
                        return;
                    }
                }
                None => break,
            },
            _ = next_tick(&mut ping) => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    closed.cancel();
                    return;
                }
            }
        }
    }

    while let Ok(text) = outbound.try_recv() {
        if sink.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    let close_frame = CloseFrame {
        code: close_code::NORMAL,
        reason: "session closed".into(),
    };
    let _ = sink.send(Message::Close(Some(close_frame))).await;
    let _ = sink.flush().await;
}

async fn next_tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Text carried by a data frame. Binary frames count when they are UTF-8.
pub(super) fn text_payload(msg: &Message) -> Option<&str> {
    match msg {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(data) => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

/// Serialize `value` and queue it on `conn`. Returns false if the
/// connection is gone.
pub(super) async fn send_json<T: Serialize>(conn: &ConnectionHandle, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => conn.send(text).await.is_ok(),
        Err(e) => {
            tracing::error!(session_id = %conn.id(), error = %e, "failed to serialize outbound message");
            true
        }
    }
}
