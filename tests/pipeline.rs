//! Inbound pipeline over a real socket pair: frames from a mock gateway
//! come out the far side as plugin dispatches and history rows.

use async_trait::async_trait;
use lchbot::ai::AiClient;
use lchbot::cache::ResponseCache;
use lchbot::config::{AiConfig, WebSocketConfig};
use lchbot::context::ContextStore;
use lchbot::event::MessageEvent;
use lchbot::metrics::BotMetrics;
use lchbot::outbound::OutboundQueue;
use lchbot::permissions::PermissionStore;
use lchbot::personality::PersonalitySystem;
use lchbot::plugins::{BotPlugin, PluginContext, PluginHost, PluginInfo};
use lchbot::ratelimit::{RateLimitConfig, RateLimiter};
use lchbot::rpc::RpcGateway;
use lchbot::sandbox::Sandbox;
use lchbot::stats::Statistics;
use lchbot::transport::server::WsServer;
use lchbot::transport::Transport;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct EchoPlugin {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BotPlugin for EchoPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "echo".into(),
            priority: 10,
            ..Default::default()
        }
    }

    async fn on_group_message(
        &self,
        event: &MessageEvent,
        ctx: &PluginContext,
    ) -> anyhow::Result<bool> {
        self.seen.lock().push(event.raw_message.clone());
        ctx.reply(event, &format!("echo: {}", event.raw_message));
        Ok(true)
    }
}

fn plugin_context(tmp: &TempDir, rpc: Arc<RpcGateway>) -> PluginContext {
    PluginContext {
        api: rpc,
        history: Arc::new(ContextStore::open(&tmp.path().join("ctx.db")).unwrap()),
        personalities: Arc::new(PersonalitySystem::new(None)),
        ai: Arc::new(AiClient::new(&AiConfig::default())),
        cache: Arc::new(ResponseCache::new(1024 * 1024, 3600, None)),
        limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
        metrics: Arc::new(BotMetrics::new()),
        stats: Arc::new(Statistics::new()),
        permissions: Arc::new(PermissionStore::open(&tmp.path().join("p.json")).unwrap()),
        queue: OutboundQueue::new(tmp.path()).unwrap(),
        masters: vec![],
    }
}

#[tokio::test]
async fn group_message_round_trips_to_a_reply_frame() {
    let tmp = TempDir::new().unwrap();
    let server = WsServer::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_port().unwrap();

    let transport = Transport::new(WebSocketConfig {
        host: "127.0.0.1".into(),
        port,
        path: "/onebot".into(),
        token: String::new(),
        heartbeat_interval: 60_000,
        reconnect_interval: 100,
        max_reconnect_attempts: 0,
    });
    let rpc = RpcGateway::new(Duration::from_secs(5));
    rpc.set_send_fn(transport.sender());

    let ctx = plugin_context(&tmp, rpc.clone());
    let history = ctx.history.clone();
    let host = PluginHost::new(ctx, Arc::new(Sandbox::new()), None);
    let seen = Arc::new(Mutex::new(Vec::new()));
    host.register_builtin(Arc::new(EchoPlugin { seen: seen.clone() }))
        .await
        .unwrap();

    // Minimal orchestrator wiring: echo → rpc, event → history + dispatch.
    {
        let rpc = rpc.clone();
        let host = host.clone();
        let history = history.clone();
        transport.set_on_message(Arc::new(move |text| {
            let rpc = rpc.clone();
            let host = host.clone();
            let history = history.clone();
            Box::pin(async move {
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    return;
                };
                if value.get("echo").is_some() {
                    rpc.handle_response(&value);
                    return;
                }
                if let Some(event) = lchbot::event::decode(&value) {
                    if let lchbot::event::EventBody::Message(msg) = &event.body {
                        if msg.is_group() {
                            let _ = history.append(
                                &msg.context_key(),
                                "user",
                                &msg.raw_message,
                                msg.sender.display_name(),
                                msg.user_id,
                            );
                        }
                        host.dispatch_message(msg).await;
                    }
                }
            })
        }));
    }
    let _task = transport.start();
    let mut conn = server.accept().await.unwrap();

    conn.send_text(
        &json!({
            "post_type": "message",
            "message_type": "group",
            "group_id": 77,
            "user_id": 5,
            "message_id": 900,
            "raw_message": "ping",
            "message": [{"type": "text", "data": {"text": "ping"}}],
            "sender": {"user_id": 5, "nickname": "tester"}
        })
        .to_string(),
    )
    .await
    .unwrap();

    // The plugin replied through the rpc gateway, back over the socket.
    let reply_text = conn.recv_text().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(&reply_text).unwrap();
    assert_eq!(reply["action"], "send_group_msg");
    assert_eq!(reply["params"]["group_id"], 77);
    assert_eq!(reply["params"]["message"], "echo: ping");
    assert!(reply["echo"].as_str().unwrap().starts_with("lchbot_"));

    assert_eq!(seen.lock().as_slice(), ["ping"]);
    let rows = history.recent("g_77", 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "ping");

    transport.shutdown();
}

#[tokio::test]
async fn outbound_queue_drains_to_the_wire() {
    let tmp = TempDir::new().unwrap();
    let server = WsServer::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_port().unwrap();

    let transport = Transport::new(WebSocketConfig {
        host: "127.0.0.1".into(),
        port,
        path: "/".into(),
        token: String::new(),
        heartbeat_interval: 60_000,
        reconnect_interval: 100,
        max_reconnect_attempts: 0,
    });
    let rpc = RpcGateway::new(Duration::from_secs(5));
    rpc.set_send_fn(transport.sender());

    let queue = OutboundQueue::new(tmp.path()).unwrap();
    {
        let api = rpc.clone();
        queue.set_send_group(Arc::new(move |message, target| {
            api.send_group_msg(target, message);
        }));
        let api = rpc.clone();
        queue.set_send_private(Arc::new(move |message, target| {
            api.send_private_msg(target, message);
        }));
    }

    // Two entries land in the file before the worker starts.
    queue
        .enqueue(&lchbot::outbound::QueueItem {
            action: "send_group_msg".into(),
            target_id: 31,
            message: "queued one".into(),
        })
        .unwrap();
    queue
        .enqueue(&lchbot::outbound::QueueItem {
            action: "send_private_msg".into(),
            target_id: 32,
            message: "queued two".into(),
        })
        .unwrap();

    let _transport_task = transport.start();
    let mut conn = server.accept().await.unwrap();
    let _queue_task = queue.start();

    let first: Value =
        serde_json::from_str(&conn.recv_text().await.unwrap().unwrap()).unwrap();
    let second: Value =
        serde_json::from_str(&conn.recv_text().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["action"], "send_group_msg");
    assert_eq!(first["params"]["group_id"], 31);
    assert_eq!(first["params"]["message"], "queued one");
    assert_eq!(second["action"], "send_private_msg");
    assert_eq!(second["params"]["user_id"], 32);

    assert_eq!(std::fs::read_to_string(queue.path()).unwrap(), "");

    queue.stop();
    transport.shutdown();
}
