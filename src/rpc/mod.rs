//! Echo-correlated RPC over the gateway socket.
//!
//! Every outbound call gets a monotone `lchbot_<n>` echo token. The
//! gateway echoes it back verbatim; we use it to resolve the pending
//! one-shot waiter. A sweeper fails anything past its deadline so no
//! future stays pending forever. Tokens are never reused.

pub mod segment;

use crate::error::{BotError, Result};
use crate::event::MessageSegment;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Response envelope from the gateway.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: String,
    pub retcode: i32,
    pub data: Value,
    pub echo: String,
}

pub type SendFn = Arc<dyn Fn(String) + Send + Sync>;

struct Pending {
    deadline: Instant,
    tx: oneshot::Sender<Result<ApiResponse>>,
}

pub struct RpcGateway {
    send: RwLock<Option<SendFn>>,
    pending: Mutex<HashMap<String, Pending>>,
    counter: AtomicU64,
    call_timeout: Duration,
}

impl RpcGateway {
    pub fn new(call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            send: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            call_timeout,
        })
    }

    /// Wire the outbound text path (normally `Transport::sender`).
    pub fn set_send_fn(&self, f: SendFn) {
        *self.send.write() = Some(f);
    }

    fn next_echo(&self) -> String {
        format!("lchbot_{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn send_request(&self, action: &str, params: Value, echo: &str) -> Result<()> {
        let payload = json!({
            "action": action,
            "params": params,
            "echo": echo,
        });
        let text = payload.to_string();
        let send = self.send.read().clone();
        match send {
            Some(f) => {
                tracing::debug!(action, echo, "rpc request");
                f(text);
                Ok(())
            }
            None => Err(BotError::TransportDisconnect(
                "no transport attached".into(),
            )),
        }
    }

    /// Issue a call and wait for the matching response or timeout.
    pub async fn call(&self, action: &str, params: Value) -> Result<ApiResponse> {
        let echo = self.next_echo();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            echo.clone(),
            Pending {
                deadline: Instant::now() + self.call_timeout,
                tx,
            },
        );

        if let Err(e) = self.send_request(action, params, &echo) {
            self.pending.lock().remove(&echo);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(BotError::RpcTimeout(echo)),
        }
    }

    /// Fire-and-forget call; the response (if any) is dropped when it
    /// arrives with no waiter.
    pub fn call_detached(&self, action: &str, params: Value) -> String {
        let echo = self.next_echo();
        if let Err(e) = self.send_request(action, params, &echo) {
            tracing::warn!(action, error = %e, "detached rpc dropped");
        }
        echo
    }

    /// Resolve a pending call from an inbound payload carrying `echo`.
    /// Returns true when the payload was an RPC response.
    pub fn handle_response(&self, value: &Value) -> bool {
        let Some(echo) = value.get("echo").and_then(Value::as_str) else {
            return false;
        };
        let pending = self.pending.lock().remove(echo);
        if let Some(p) = pending {
            let response = ApiResponse {
                status: value
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                retcode: value
                    .get("retcode")
                    .and_then(Value::as_i64)
                    .unwrap_or_default() as i32,
                data: value.get("data").cloned().unwrap_or(Value::Null),
                echo: echo.to_string(),
            };
            let _ = p.tx.send(Ok(response));
        }
        true
    }

    /// Fail every pending call past its deadline.
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<(String, Pending)> = {
            let mut pending = self.pending.lock();
            let keys: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.remove(&k).map(|p| (k, p)))
                .collect()
        };
        for (echo, p) in expired {
            tracing::warn!(echo, "rpc timed out");
            let _ = p.tx.send(Err(BotError::RpcTimeout(echo)));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Background sweeper; runs until the gateway is dropped.
    pub fn start_sweeper(self: &Arc<Self>, tick: Duration) -> tokio::task::JoinHandle<()> {
        let gateway = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                gateway.sweep();
            }
        })
    }

    // ── OneBot convenience surface ──────────────────────────────

    pub fn send_private_msg(&self, user_id: i64, message: &str) -> String {
        self.call_detached(
            "send_private_msg",
            json!({"user_id": user_id, "message": message, "auto_escape": false}),
        )
    }

    pub fn send_group_msg(&self, group_id: i64, message: &str) -> String {
        self.call_detached(
            "send_group_msg",
            json!({"group_id": group_id, "message": message, "auto_escape": false}),
        )
    }

    pub fn send_private_segments(&self, user_id: i64, message: &[MessageSegment]) -> String {
        self.call_detached(
            "send_private_msg",
            json!({"user_id": user_id, "message": segment::to_json(message)}),
        )
    }

    pub fn send_group_segments(&self, group_id: i64, message: &[MessageSegment]) -> String {
        self.call_detached(
            "send_group_msg",
            json!({"group_id": group_id, "message": segment::to_json(message)}),
        )
    }

    /// Send a group message quoting `reply_msg_id`.
    pub fn send_group_msg_reply(&self, group_id: i64, reply_msg_id: i32, message: &str) -> String {
        let segments = [segment::reply(reply_msg_id), segment::text(message)];
        self.send_group_segments(group_id, &segments)
    }

    pub fn send_private_msg_reply(&self, user_id: i64, reply_msg_id: i32, message: &str) -> String {
        let segments = [segment::reply(reply_msg_id), segment::text(message)];
        self.send_private_segments(user_id, &segments)
    }

    pub fn delete_msg(&self, message_id: i32) -> String {
        self.call_detached("delete_msg", json!({"message_id": message_id}))
    }

    pub fn set_group_ban(&self, group_id: i64, user_id: i64, duration_s: i64) -> String {
        self.call_detached(
            "set_group_ban",
            json!({"group_id": group_id, "user_id": user_id, "duration": duration_s}),
        )
    }

    pub fn set_group_kick(&self, group_id: i64, user_id: i64, reject_add_request: bool) -> String {
        self.call_detached(
            "set_group_kick",
            json!({"group_id": group_id, "user_id": user_id, "reject_add_request": reject_add_request}),
        )
    }

    pub fn set_friend_add_request(&self, flag: &str, approve: bool, remark: &str) -> String {
        let mut params = json!({"flag": flag, "approve": approve});
        if !remark.is_empty() {
            params["remark"] = json!(remark);
        }
        self.call_detached("set_friend_add_request", params)
    }

    pub fn set_group_add_request(
        &self,
        flag: &str,
        sub_type: &str,
        approve: bool,
        reason: &str,
    ) -> String {
        let mut params = json!({"flag": flag, "sub_type": sub_type, "approve": approve});
        if !reason.is_empty() {
            params["reason"] = json!(reason);
        }
        self.call_detached("set_group_add_request", params)
    }

    pub async fn get_login_info(&self) -> Result<ApiResponse> {
        self.call("get_login_info", json!({})).await
    }

    pub async fn get_group_member_list(&self, group_id: i64) -> Result<ApiResponse> {
        self.call("get_group_member_list", json!({"group_id": group_id}))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn capture() -> (SendFn, Arc<PlMutex<Vec<String>>>) {
        let sent: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = sent.clone();
        let f: SendFn = Arc::new(move |text| sink.lock().push(text));
        (f, sent)
    }

    #[tokio::test]
    async fn call_resolves_on_matching_echo() {
        let gateway = RpcGateway::new(Duration::from_secs(5));
        let (send, sent) = capture();
        gateway.set_send_fn(send);

        let gw = gateway.clone();
        let task = tokio::spawn(async move { gw.call("get_login_info", json!({})).await });

        // Wait for the request to hit the wire.
        let request: Value = loop {
            if let Some(text) = sent.lock().first().cloned() {
                break serde_json::from_str(&text).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(request["action"], "get_login_info");
        assert_eq!(request["echo"], "lchbot_1");

        let response = json!({
            "status": "ok",
            "retcode": 0,
            "data": {"user_id": 42, "nickname": "B"},
            "echo": "lchbot_1"
        });
        assert!(gateway.handle_response(&response));

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.retcode, 0);
        assert_eq!(result.data["user_id"], 42);
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn echo_tokens_are_monotone_and_unique() {
        let gateway = RpcGateway::new(Duration::from_secs(1));
        let (send, _sent) = capture();
        gateway.set_send_fn(send);
        let first = gateway.call_detached("a", json!({}));
        let second = gateway.call_detached("b", json!({}));
        assert_eq!(first, "lchbot_1");
        assert_eq!(second, "lchbot_2");
    }

    #[tokio::test]
    async fn sweep_fails_expired_calls() {
        let gateway = RpcGateway::new(Duration::from_millis(10));
        let (send, _sent) = capture();
        gateway.set_send_fn(send);

        let gw = gateway.clone();
        let task = tokio::spawn(async move { gw.call("slow_action", json!({})).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        gateway.sweep();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(BotError::RpcTimeout(_))));
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn response_without_waiter_is_still_consumed() {
        let gateway = RpcGateway::new(Duration::from_secs(1));
        assert!(gateway.handle_response(&json!({"echo": "lchbot_999", "retcode": 0})));
        assert!(!gateway.handle_response(&json!({"post_type": "message"})));
    }

    #[tokio::test]
    async fn call_without_transport_errors() {
        let gateway = RpcGateway::new(Duration::from_secs(1));
        let result = gateway.call("x", json!({})).await;
        assert!(matches!(result, Err(BotError::TransportDisconnect(_))));
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_helper_builds_reply_segment_first() {
        let gateway = RpcGateway::new(Duration::from_secs(1));
        let (send, sent) = capture();
        gateway.set_send_fn(send);

        gateway.send_group_msg_reply(77, 123, "pong");
        let request: Value = serde_json::from_str(&sent.lock()[0]).unwrap();
        let message = &request["params"]["message"];
        assert_eq!(message[0]["type"], "reply");
        assert_eq!(message[0]["data"]["id"], "123");
        assert_eq!(message[1]["type"], "text");
        assert_eq!(message[1]["data"]["text"], "pong");
    }
}
