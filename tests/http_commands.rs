//! HTTP surface: health, diagnostics and one-shot commands by resource id.

mod common;

use common::*;
use serde_json::{json, Value};

#[tokio::test]
async fn test_health() {
    let server = start_server().await;

    let resp = reqwest::get(server.http_url("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_post_command_round_trip() {
    let server = start_server().await;
    let mut device = connect_device(&server, "doc-42").await;

    let url = server.http_url("/resources/doc-42/commands");
    let request = tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .json(&json!({"method": "create_frame", "params": {"name": "Hero"}}))
            .send()
            .await
            .unwrap()
    });

    let frame = answer_next_command(&mut device, json!({"id": "12:1"})).await;
    assert_eq!(frame["method"], "create_frame");
    assert_eq!(frame["params"]["name"], "Hero");

    let resp = request.await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["id"], "12:1");
}

#[tokio::test]
async fn test_post_command_without_device_is_404() {
    let server = start_server().await;

    let resp = reqwest::Client::new()
        .post(server.http_url("/resources/doc-42/commands"))
        .json(&json!({"method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "no_downstream_for_resource");
}

#[tokio::test]
async fn test_post_command_timeout_is_504() {
    let server = start_server().await;
    let _device = connect_device(&server, "doc-42").await;

    let resp = reqwest::Client::new()
        .post(server.http_url("/resources/doc-42/commands"))
        .json(&json!({"method": "ping", "timeout_ms": 100}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "timeout");
}

#[tokio::test]
async fn test_diagnostics_lists_sessions_and_routes() {
    let server = start_server().await;
    let _device = connect_device(&server, "doc-42").await;
    let (_client, client_id) = connect_client(&server, Some("doc-42")).await;

    let body: Value = reqwest::get(server.http_url("/diagnostics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["upstream"]["count"], 1);
    assert_eq!(body["downstream"]["count"], 1);
    let route = &body["routes"]["resources"][0];
    assert_eq!(route["resource_id"], "doc-42");
    assert_eq!(route["routable"], true);
    assert_eq!(route["upstream_sessions"], json!([client_id]));
    assert!(body["commands"]
        .as_array()
        .unwrap()
        .contains(&json!("ping")));
}
