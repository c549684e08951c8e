#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use docbridge::api::{self, AppState, RouterConfig};
use docbridge::bridge::{Bridge, BridgeSettings};
use docbridge::dispatch::CommandRegistry;
use docbridge::shutdown::ShutdownCoordinator;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A bridge served on an ephemeral local port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub bridge: Bridge,
    pub shutdown: ShutdownCoordinator,
}

impl TestServer {
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(BridgeSettings::default(), CommandRegistry::with_builtins(true)).await
}

pub async fn start_server_with(settings: BridgeSettings, commands: CommandRegistry) -> TestServer {
    let bridge = Bridge::new(settings, commands);
    let shutdown = ShutdownCoordinator::new();
    let state = AppState {
        bridge: bridge.clone(),
        shutdown: shutdown.clone(),
        ping_interval: None,
    };
    let app = api::router(state, RouterConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        bridge,
        shutdown,
    }
}

/// Connect a device socket for `resource` and wait until the bridge has
/// registered it.
pub async fn connect_device(server: &TestServer, resource: &str) -> WsStream {
    let before = server.bridge.downstream().session_id_for_resource(resource);
    let (ws, _) = connect_async(server.ws_url(&format!("/ws/device?resource={resource}")))
        .await
        .expect("device connect should succeed");
    wait_for(|| {
        let current = server.bridge.downstream().session_id_for_resource(resource);
        current.is_some() && current != before
    })
    .await;
    ws
}

/// Connect a client socket and return it with the session id from the
/// greeting message.
pub async fn connect_client(server: &TestServer, resource: Option<&str>) -> (WsStream, String) {
    let url = match resource {
        Some(r) => server.ws_url(&format!("/ws/client?resource={r}")),
        None => server.ws_url("/ws/client"),
    };
    let (mut ws, _) = connect_async(url)
        .await
        .expect("client connect should succeed");
    let greeting = recv_json(&mut ws).await;
    assert_eq!(greeting["connected"], true);
    let session_id = greeting["session_id"]
        .as_str()
        .expect("greeting carries a session id")
        .to_string();
    (ws, session_id)
}

/// Receive the next text message as JSON, skipping control frames.
pub async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text message, got {:?}", other),
        }
    }
}

pub async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send should succeed");
}

/// Read the next command frame on a device socket and reply with `result`.
/// Returns the command frame.
pub async fn answer_next_command(device: &mut WsStream, result: Value) -> Value {
    let frame = recv_json(device).await;
    let reply = serde_json::json!({
        "requestId": frame["requestId"],
        "result": result,
    });
    send_json(device, reply).await;
    frame
}

/// Wait for a close frame (or end of stream), skipping anything else.
/// Returns true if a close frame was seen.
pub async fn expect_close(ws: &mut WsStream) -> bool {
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return false,
            Err(_) => panic!("timeout waiting for close frame"),
        }
    }
}

/// Poll `cond` until it holds, panicking after a few seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
