//! End-to-end echo correlation against a mock gateway socket.

use lchbot::config::WebSocketConfig;
use lchbot::rpc::RpcGateway;
use lchbot::transport::server::WsServer;
use lchbot::transport::Transport;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn transport_config(port: u16) -> WebSocketConfig {
    WebSocketConfig {
        host: "127.0.0.1".into(),
        port,
        path: "/".into(),
        token: String::new(),
        heartbeat_interval: 60_000,
        reconnect_interval: 100,
        max_reconnect_attempts: 0,
    }
}

#[tokio::test]
async fn call_round_trips_through_a_real_socket() {
    let server = WsServer::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_port().unwrap();

    let transport = Transport::new(transport_config(port));
    let rpc = RpcGateway::new(Duration::from_secs(5));
    rpc.set_send_fn(transport.sender());

    // Inbound payloads feed the gateway, like the orchestrator does.
    {
        let rpc = rpc.clone();
        transport.set_on_message(Arc::new(move |text| {
            let rpc = rpc.clone();
            Box::pin(async move {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    rpc.handle_response(&value);
                }
            })
        }));
    }
    let _transport_task = transport.start();

    let mut conn = server.accept().await.unwrap();

    let call_rpc = rpc.clone();
    let call = tokio::spawn(async move { call_rpc.call("get_login_info", json!({})).await });

    // The mock sees exactly the documented request shape.
    let request_text = conn.recv_text().await.unwrap().unwrap();
    let request: Value = serde_json::from_str(&request_text).unwrap();
    assert_eq!(request["action"], "get_login_info");
    assert_eq!(request["params"], json!({}));
    assert_eq!(request["echo"], "lchbot_1");

    conn.send_text(
        &json!({
            "status": "ok",
            "retcode": 0,
            "data": {"user_id": 42, "nickname": "B"},
            "echo": "lchbot_1"
        })
        .to_string(),
    )
    .await
    .unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status, "ok");
    assert_eq!(response.retcode, 0);
    assert_eq!(response.data["user_id"], 42);
    assert_eq!(response.data["nickname"], "B");
    assert_eq!(response.echo, "lchbot_1");
    assert_eq!(rpc.pending_count(), 0);

    transport.shutdown();
}

#[tokio::test]
async fn late_response_after_timeout_is_dropped() {
    let server = WsServer::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_port().unwrap();

    let transport = Transport::new(transport_config(port));
    let rpc = RpcGateway::new(Duration::from_millis(100));
    rpc.set_send_fn(transport.sender());
    let _sweeper = rpc.start_sweeper(Duration::from_millis(20));
    let _transport_task = transport.start();

    let mut conn = server.accept().await.unwrap();

    let call_rpc = rpc.clone();
    let call = tokio::spawn(async move { call_rpc.call("slow_thing", json!({})).await });

    let request_text = conn.recv_text().await.unwrap().unwrap();
    let request: Value = serde_json::from_str(&request_text).unwrap();
    let echo = request["echo"].as_str().unwrap().to_string();

    // The mock stalls past the deadline; the sweeper must fail the call.
    let result = call.await.unwrap();
    assert!(result.is_err());
    assert_eq!(rpc.pending_count(), 0);

    // A very late reply is consumed without effect.
    conn.send_text(
        &json!({"status": "ok", "retcode": 0, "data": null, "echo": echo}).to_string(),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rpc.pending_count(), 0);

    transport.shutdown();
}

#[tokio::test]
async fn concurrent_calls_resolve_to_their_own_echo() {
    let server = WsServer::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_port().unwrap();

    let transport = Transport::new(transport_config(port));
    let rpc = RpcGateway::new(Duration::from_secs(5));
    rpc.set_send_fn(transport.sender());
    {
        let rpc = rpc.clone();
        transport.set_on_message(Arc::new(move |text| {
            let rpc = rpc.clone();
            Box::pin(async move {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    rpc.handle_response(&value);
                }
            })
        }));
    }
    let _transport_task = transport.start();
    let mut conn = server.accept().await.unwrap();

    let first_rpc = rpc.clone();
    let first = tokio::spawn(async move { first_rpc.call("one", json!({"n": 1})).await });
    let second_rpc = rpc.clone();
    let second = tokio::spawn(async move { second_rpc.call("two", json!({"n": 2})).await });

    let mut echoes = Vec::new();
    for _ in 0..2 {
        let text = conn.recv_text().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        echoes.push((
            value["action"].as_str().unwrap().to_string(),
            value["echo"].as_str().unwrap().to_string(),
        ));
    }

    // Answer out of order: second call first.
    echoes.sort_by(|a, b| b.0.cmp(&a.0));
    for (action, echo) in &echoes {
        conn.send_text(
            &json!({
                "status": "ok",
                "retcode": 0,
                "data": {"for": action},
                "echo": echo
            })
            .to_string(),
        )
        .await
        .unwrap();
    }

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.data["for"], "one");
    assert_eq!(second.data["for"], "two");

    transport.shutdown();
}
