//! The scripted-plugin bridge.
//!
//! The interpreter itself lives outside this crate; [`ScriptRuntime`] is
//! the full host-to-script contract. The runtime's harness must expose a
//! base plugin class with the hook methods (`on_load`, `on_unload`,
//! `on_enable`, `on_disable`, `on_message`, `on_private_message`,
//! `on_group_message`, `on_notice`, `on_request`), `register_plugin`,
//! `reply` / `send_group_msg` / `send_private_msg` (which append to an
//! in-harness reply queue), `is_master`, and the master list. The host
//! drains that queue after every dispatch and forwards entries to the
//! file-backed outbound queue.

use super::traits::{BotPlugin, PluginContext, PluginInfo};
use crate::error::Result;
use crate::event::{MessageEvent, NoticeEvent, RequestEvent};
use crate::outbound::QueueItem;
use crate::rpc::segment;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptDescriptor {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub priority: i32,
}

/// One queued reply from the script harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptReply {
    /// `send_group_msg` or `send_private_msg`.
    pub action: String,
    pub target_id: i64,
    pub message: String,
}

/// Host-to-script contract. Implemented by the embedding application
/// around whatever interpreter it provides.
pub trait ScriptRuntime: Send + Sync {
    /// Extension (without the dot) of script files this runtime loads.
    fn file_extension(&self) -> &str;

    /// Inject the harness and evaluate a plugin's source under `name`.
    fn load_plugin(&self, name: &str, source: &str, masters: &[i64]) -> Result<()>;

    /// Drop the named plugin's registration inside the runtime.
    fn unload_plugin(&self, name: &str) -> Result<()>;

    /// Read back name/version/author/description/priority from the
    /// registered instance.
    fn descriptor(&self, name: &str) -> Result<ScriptDescriptor>;

    /// Run a lifecycle hook with no event payload.
    fn call_lifecycle(&self, name: &str, hook: &str) -> Result<()>;

    /// Run an event hook; `event_json` is the serialized event. Returns
    /// whether the script consumed the event.
    fn call_hook(&self, name: &str, hook: &str, event_json: &str) -> Result<bool>;

    /// Drain the plugin's queued replies.
    fn drain_replies(&self, name: &str) -> Result<Vec<ScriptReply>>;
}

/// The JSON object handed to script event hooks.
pub fn message_event_json(event: &MessageEvent) -> String {
    json!({
        "message_type": if event.is_group() { "group" } else { "private" },
        "sub_type": event.sub_type,
        "message_id": event.message_id,
        "user_id": event.user_id,
        "group_id": event.group_id,
        "raw_message": event.raw_message,
        "time": event.time,
        "self_id": event.self_id,
        "sender": {
            "user_id": event.sender.user_id,
            "nickname": event.sender.nickname,
            "card": event.sender.card,
            "role": event.sender.role,
        },
        "message": segment::to_json(&event.segments),
    })
    .to_string()
}

fn notice_event_json(event: &NoticeEvent) -> String {
    json!({
        "sub_type": event.sub_type,
        "group_id": event.group_id,
        "user_id": event.user_id,
        "operator_id": event.operator_id,
        "target_id": event.target_id,
        "duration": event.duration,
        "message_id": event.message_id,
    })
    .to_string()
}

fn request_event_json(event: &RequestEvent) -> String {
    json!({
        "sub_type": event.sub_type,
        "user_id": event.user_id,
        "group_id": event.group_id,
        "comment": event.comment,
        "flag": event.flag,
    })
    .to_string()
}

pub struct ScriptedPlugin {
    runtime: std::sync::Arc<dyn ScriptRuntime>,
    path: PathBuf,
    info: Mutex<PluginInfo>,
}

impl ScriptedPlugin {
    /// Read the source, run it through the runtime, and refresh the
    /// descriptor from the registered instance.
    pub fn load(
        runtime: std::sync::Arc<dyn ScriptRuntime>,
        path: &Path,
        masters: &[i64],
    ) -> Result<Self> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let source = std::fs::read_to_string(path)?;
        runtime.load_plugin(&stem, &source, masters)?;
        runtime.call_lifecycle(&stem, "on_load")?;

        let descriptor = runtime.descriptor(&stem)?;
        let info = PluginInfo {
            name: if descriptor.name.is_empty() {
                stem.clone()
            } else {
                descriptor.name
            },
            version: if descriptor.version.is_empty() {
                "1.0.0".into()
            } else {
                descriptor.version
            },
            author: if descriptor.author.is_empty() {
                "Script".into()
            } else {
                descriptor.author
            },
            description: descriptor.description,
            priority: descriptor.priority,
        };

        Ok(Self {
            runtime,
            path: path.to_path_buf(),
            info: Mutex::new(info),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn registered_name(&self) -> String {
        self.info.lock().name.clone()
    }

    /// Move drained harness replies onto the durable outbound queue.
    fn forward_replies(&self, ctx: &PluginContext) {
        let name = self.registered_name();
        let replies = match self.runtime.drain_replies(&name) {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "reply drain failed");
                return;
            }
        };
        for reply in replies {
            if reply.target_id <= 0 || reply.message.is_empty() {
                continue;
            }
            let item = QueueItem {
                action: reply.action,
                target_id: reply.target_id,
                message: reply.message,
            };
            if let Err(e) = ctx.queue.enqueue(&item) {
                tracing::error!(plugin = %name, error = %e, "reply enqueue failed");
            }
        }
    }

    fn run_hook(&self, hook: &str, event_json: &str, ctx: &PluginContext) -> anyhow::Result<bool> {
        let name = self.registered_name();
        let consumed = self.runtime.call_hook(&name, hook, event_json)?;
        self.forward_replies(ctx);
        Ok(consumed)
    }
}

#[async_trait]
impl BotPlugin for ScriptedPlugin {
    fn info(&self) -> PluginInfo {
        self.info.lock().clone()
    }

    async fn on_load(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        // Already loaded by `ScriptedPlugin::load`; nothing extra here.
        Ok(())
    }

    async fn on_unload(&self, _ctx: &PluginContext) {
        let name = self.registered_name();
        if let Err(e) = self.runtime.call_lifecycle(&name, "on_unload") {
            tracing::warn!(plugin = %name, error = %e, "on_unload hook failed");
        }
        if let Err(e) = self.runtime.unload_plugin(&name) {
            tracing::warn!(plugin = %name, error = %e, "runtime unload failed");
        }
    }

    async fn on_enable(&self, _ctx: &PluginContext) {
        let name = self.registered_name();
        let _ = self.runtime.call_lifecycle(&name, "on_enable");
    }

    async fn on_disable(&self, _ctx: &PluginContext) {
        let name = self.registered_name();
        let _ = self.runtime.call_lifecycle(&name, "on_disable");
    }

    async fn on_message(&self, event: &MessageEvent, ctx: &PluginContext) -> anyhow::Result<bool> {
        let payload = message_event_json(event);
        self.run_hook("on_message", &payload, ctx)
    }

    async fn on_private_message(
        &self,
        event: &MessageEvent,
        ctx: &PluginContext,
    ) -> anyhow::Result<bool> {
        let payload = message_event_json(event);
        self.run_hook("on_private_message", &payload, ctx)
    }

    async fn on_group_message(
        &self,
        event: &MessageEvent,
        ctx: &PluginContext,
    ) -> anyhow::Result<bool> {
        let payload = message_event_json(event);
        self.run_hook("on_group_message", &payload, ctx)
    }

    async fn on_notice(&self, event: &NoticeEvent, ctx: &PluginContext) -> anyhow::Result<bool> {
        self.run_hook("on_notice", &notice_event_json(event), ctx)
    }

    async fn on_request(&self, event: &RequestEvent, ctx: &PluginContext) -> anyhow::Result<bool> {
        self.run_hook("on_request", &request_event_json(event), ctx)
    }
}
