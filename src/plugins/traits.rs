//! The plugin trait and the capability context handed to every handler.

use crate::ai::AiClient;
use crate::cache::ResponseCache;
use crate::context::ContextStore;
use crate::event::{MessageEvent, NoticeEvent, RequestEvent};
use crate::metrics::BotMetrics;
use crate::outbound::OutboundQueue;
use crate::permissions::PermissionStore;
use crate::personality::PersonalitySystem;
use crate::ratelimit::RateLimiter;
use crate::rpc::RpcGateway;
use crate::stats::Statistics;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub priority: i32,
}

impl Default for PluginInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: "1.0.0".into(),
            author: "Unknown".into(),
            description: String::new(),
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginOrigin {
    Builtin,
    Native,
    Scripted,
}

#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub info: PluginInfo,
    pub enabled: bool,
    pub origin: PluginOrigin,
    pub script_path: Option<PathBuf>,
    pub file_mtime: Option<SystemTime>,
}

/// Capabilities a plugin may use. Handed by reference into every hook;
/// plugins must treat the event data as read-only.
#[derive(Clone)]
pub struct PluginContext {
    pub api: Arc<RpcGateway>,
    pub history: Arc<ContextStore>,
    pub personalities: Arc<PersonalitySystem>,
    pub ai: Arc<AiClient>,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<BotMetrics>,
    pub stats: Arc<Statistics>,
    pub permissions: Arc<PermissionStore>,
    pub queue: Arc<OutboundQueue>,
    pub masters: Vec<i64>,
}

impl PluginContext {
    pub fn is_master(&self, user_id: i64) -> bool {
        self.masters.contains(&user_id)
    }

    /// Reply into the conversation the event came from.
    pub fn reply(&self, event: &MessageEvent, message: &str) {
        if event.is_group() {
            self.api.send_group_msg(event.group_id, message);
        } else {
            self.api.send_private_msg(event.user_id, message);
        }
    }

    /// Reply quoting the triggering message.
    pub fn reply_quoted(&self, event: &MessageEvent, message: &str) {
        if event.is_group() {
            self.api
                .send_group_msg_reply(event.group_id, event.message_id, message);
        } else {
            self.api
                .send_private_msg_reply(event.user_id, event.message_id, message);
        }
    }
}

/// One plugin, whatever its origin. Handlers return `Ok(true)` to mark
/// the event consumed and stop the dispatch walk.
#[async_trait]
pub trait BotPlugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    async fn on_load(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_unload(&self, _ctx: &PluginContext) {}

    async fn on_enable(&self, _ctx: &PluginContext) {}

    async fn on_disable(&self, _ctx: &PluginContext) {}

    async fn on_message(
        &self,
        _event: &MessageEvent,
        _ctx: &PluginContext,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn on_private_message(
        &self,
        _event: &MessageEvent,
        _ctx: &PluginContext,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn on_group_message(
        &self,
        _event: &MessageEvent,
        _ctx: &PluginContext,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn on_notice(&self, _event: &NoticeEvent, _ctx: &PluginContext) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn on_request(
        &self,
        _event: &RequestEvent,
        _ctx: &PluginContext,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }
}
