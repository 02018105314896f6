//! The orchestrator: one `Bot` value owns every subsystem and wires the
//! inbound flow.
//!
//! Inbound frame → JSON parse → echo? hand to the RPC gateway :
//! decode event → history append / member-list fetch / plugin dispatch.
//! Plugin dispatch runs on the receive task; only the group-member-list
//! RPC is detached so the receive loop keeps draining.

pub mod group_cache;

use crate::admin::{self, AdminState};
use crate::ai::AiClient;
use crate::cache::{ResponseCache, DEFAULT_MAX_BYTES, DEFAULT_TTL_SECS};
use crate::config::BotConfig;
use crate::context::ContextStore;
use crate::event::{self, EventBody, MetaKind};
use crate::metrics::BotMetrics;
use crate::outbound::OutboundQueue;
use crate::permissions::PermissionStore;
use crate::personality::PersonalitySystem;
use crate::plugins::{AiChatPlugin, PluginContext, PluginHost, ScriptRuntime};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::rpc::RpcGateway;
use crate::sandbox::Sandbox;
use crate::stats::Statistics;
use crate::trace::TraceSystem;
use crate::transport::Transport;
use group_cache::GroupMemberCache;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const RPC_SWEEP_TICK: Duration = Duration::from_secs(1);
const CACHE_MAINTENANCE_TICK: Duration = Duration::from_secs(300);
const LIMITER_CLEANUP_TICK: Duration = Duration::from_secs(60);
const SANDBOX_RESET_TICK: Duration = Duration::from_secs(60);

pub struct Bot {
    config: BotConfig,
    transport: Arc<Transport>,
    rpc: Arc<RpcGateway>,
    host: Arc<PluginHost>,
    history: Arc<ContextStore>,
    cache: Arc<ResponseCache>,
    queue: Arc<OutboundQueue>,
    metrics: Arc<BotMetrics>,
    group_cache: Arc<GroupMemberCache>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Bot {
    /// Build and wire every subsystem. Nothing runs until [`Bot::start`].
    pub async fn init(
        config: BotConfig,
        script_runtime: Option<Arc<dyn ScriptRuntime>>,
    ) -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(&config.data_dir);
        std::fs::create_dir_all(&data_dir)?;

        let metrics = Arc::new(BotMetrics::new());
        let traces = TraceSystem::new(1.0, "lchbot");
        let cache = Arc::new(ResponseCache::new(
            DEFAULT_MAX_BYTES,
            DEFAULT_TTL_SECS,
            Some(data_dir.join("response_cache.tsv")),
        ));
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let history = Arc::new(ContextStore::open(&data_dir.join("context.db"))?);
        let permissions = Arc::new(PermissionStore::open(Path::new("config/permissions.json"))?);
        let personalities = Arc::new(PersonalitySystem::new(Some(PathBuf::from(
            "config/personalities.json",
        ))));
        let stats = Arc::new(Statistics::new());
        let ai = Arc::new(AiClient::new(&config.ai));
        let queue = OutboundQueue::new(&data_dir)?;
        let sandbox = Arc::new(Sandbox::new());
        let rpc = RpcGateway::new(RPC_CALL_TIMEOUT);
        let transport = Transport::new(config.websocket.clone());
        let group_cache = Arc::new(GroupMemberCache::new());

        rpc.set_send_fn(transport.sender());
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

        let ctx = PluginContext {
            api: rpc.clone(),
            history: history.clone(),
            personalities: personalities.clone(),
            ai,
            cache: cache.clone(),
            limiter: limiter.clone(),
            metrics: metrics.clone(),
            stats: stats.clone(),
            permissions: permissions.clone(),
            queue: queue.clone(),
            masters: config.master_qq.clone(),
        };
        let host = PluginHost::new(ctx, sandbox.clone(), script_runtime);

        // Built-in AI plugin first, then the plugin directory.
        host.register_builtin(Arc::new(AiChatPlugin::new())).await?;
        let plugins_dir = PathBuf::from(&config.plugin.plugins_dir);
        host.load_directory(
            &plugins_dir,
            config.plugin.enable_scripted,
            config.plugin.enable_native,
        )
        .await?;
        for descriptor in host.descriptors() {
            tracing::info!(
                plugin = %descriptor.info.name,
                version = %descriptor.info.version,
                enabled = descriptor.enabled,
                "plugin registered"
            );
        }

        // Inbound wiring.
        {
            let rpc = rpc.clone();
            let host = host.clone();
            let history = history.clone();
            let metrics = metrics.clone();
            let traces = traces.clone();
            let group_cache = group_cache.clone();
            transport.set_on_message(Arc::new(move |payload| {
                let rpc = rpc.clone();
                let host = host.clone();
                let history = history.clone();
                let metrics = metrics.clone();
                let traces = traces.clone();
                let group_cache = group_cache.clone();
                Box::pin(async move {
                    handle_inbound(
                        &payload,
                        &rpc,
                        &host,
                        &history,
                        &metrics,
                        &traces,
                        &group_cache,
                    )
                    .await;
                })
            }));
        }
        {
            let rpc = rpc.clone();
            let metrics = metrics.clone();
            transport.set_on_open(Arc::new(move || {
                metrics.set_active_connections(1);
                // Identify ourselves as soon as the socket opens.
                rpc.call_detached("get_login_info", serde_json::json!({}));
            }));
        }

        // Admin surface.
        let admin_state = AdminState {
            host: host.clone(),
            cache: cache.clone(),
            limiter: limiter.clone(),
            traces: traces.clone(),
            metrics: metrics.clone(),
            sandbox: sandbox.clone(),
            permissions,
            personalities,
            stats,
            plugins_dir: plugins_dir.clone(),
        };

        let mut tasks = Vec::new();
        tasks.push(admin::serve(admin_state, config.admin_port).await?);
        tasks.push(rpc.start_sweeper(RPC_SWEEP_TICK));
        tasks.push(queue.start());
        tasks.push(cache.start_maintenance(CACHE_MAINTENANCE_TICK));
        tasks.push(limiter.start_cleanup(LIMITER_CLEANUP_TICK));
        tasks.push(sandbox.start_monitor(SANDBOX_RESET_TICK));
        tasks.push(host.start_hot_reload(
            plugins_dir,
            Duration::from_secs(config.plugin.hot_reload_interval_secs.max(1)),
        ));

        {
            let exporter_metrics = metrics.clone();
            let cache_stats = cache.clone();
            exporter_metrics.add_custom_collector(
                "cache",
                Box::new(move || {
                    let stats = cache_stats.stats();
                    format!(
                        "cache_hits_total {}\ncache_misses_total {}\ncache_evictions_total {}\n\
                         cache_size_bytes {}\ncache_entries {}\n",
                        stats.hits, stats.misses, stats.evictions, stats.total_bytes, stats.entry_count
                    )
                }),
            );
        }

        Ok(Self {
            config,
            transport,
            rpc,
            host,
            history,
            cache,
            queue,
            metrics,
            group_cache,
            tasks,
        })
    }

    /// Connect the transport and run until interrupted.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            host = %self.config.websocket.host,
            port = self.config.websocket.port,
            "starting gateway connection"
        );
        self.tasks.push(self.transport.start());

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");
        self.shutdown().await;
        Ok(())
    }

    /// Orderly shutdown: stop tickers and the admin listener, disconnect,
    /// unload plugins, flush the cache.
    pub async fn shutdown(&self) {
        self.queue.stop();
        self.transport.shutdown();
        self.metrics.set_active_connections(0);
        self.host.unload_all().await;
        if let Err(e) = self.cache.save_to_disk() {
            tracing::warn!(error = %e, "cache flush failed");
        }
        let _ = self.history.sweep(crate::context::DEFAULT_TTL_SECS);
        for task in &self.tasks {
            task.abort();
        }
        tracing::info!("shutdown complete");
    }

    pub fn rpc(&self) -> Arc<RpcGateway> {
        self.rpc.clone()
    }

    pub fn host(&self) -> Arc<PluginHost> {
        self.host.clone()
    }
}

/// One inbound payload off the gateway socket.
async fn handle_inbound(
    payload: &str,
    rpc: &Arc<RpcGateway>,
    host: &Arc<PluginHost>,
    history: &Arc<ContextStore>,
    metrics: &Arc<BotMetrics>,
    traces: &Arc<TraceSystem>,
    group_cache: &Arc<GroupMemberCache>,
) {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => {
            metrics.record_error("transport", "2004");
            tracing::warn!(error = %e, "inbound payload is not JSON");
            return;
        }
    };

    // RPC responses resolve their pending call and go no further.
    if value.get("echo").is_some() {
        rpc.handle_response(&value);
        return;
    }

    let Some(event) = event::decode(&value) else {
        return;
    };

    match &event.body {
        EventBody::Message(msg) => {
            let mut span = traces.start_span("handle_message");
            span.set_tag("context_key", msg.context_key());
            let sender_name = msg.sender.display_name().to_string();
            if msg.is_group() {
                tracing::info!(
                    group_id = msg.group_id,
                    user_id = msg.user_id,
                    sender = %sender_name,
                    message = %msg.raw_message,
                    "group message"
                );
                metrics.record_message("group", msg.group_id);
                fetch_group_members(rpc, group_cache, msg.group_id);
                if let Err(e) = history.append(
                    &msg.context_key(),
                    "user",
                    &msg.raw_message,
                    &sender_name,
                    msg.user_id,
                ) {
                    tracing::error!(error = %e, "history append failed");
                }
            } else {
                tracing::info!(
                    user_id = msg.user_id,
                    sender = %sender_name,
                    message = %msg.raw_message,
                    "private message"
                );
                metrics.record_message("private", 0);
            }
            let consumed = host.dispatch_message(msg).await;
            span.set_tag("consumed", consumed);
            span.finish();
        }
        EventBody::Notice(notice) => {
            host.dispatch_notice(notice).await;
        }
        EventBody::Request(request) => {
            host.dispatch_request(request).await;
        }
        EventBody::Meta(meta) => match meta.kind {
            MetaKind::Lifecycle => {
                tracing::info!(sub_type = %meta.sub_type, "lifecycle event");
            }
            // Heartbeats are observed, never dispatched.
            MetaKind::Heartbeat | MetaKind::Unknown => {}
        },
        EventBody::Unknown => {
            tracing::debug!(post_type = %event.post_type, "unhandled event type");
        }
    }
}

/// Fire-and-forget member-list fetch, once per group. Detached so the
/// receive loop keeps draining while the RPC is in flight.
fn fetch_group_members(rpc: &Arc<RpcGateway>, cache: &Arc<GroupMemberCache>, group_id: i64) {
    if !cache.mark_pending(group_id) {
        return;
    }
    let rpc = rpc.clone();
    let cache = cache.clone();
    tokio::spawn(async move {
        match rpc.get_group_member_list(group_id).await {
            Ok(response) if response.retcode == 0 => {
                let members: Vec<(i64, String)> = response
                    .data
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .filter_map(|member| {
                                let user_id = member.get("user_id")?.as_i64()?;
                                let card = member
                                    .get("card")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default();
                                let name = if card.is_empty() {
                                    member.get("nickname").and_then(Value::as_str)?
                                } else {
                                    card
                                };
                                if name.is_empty() {
                                    None
                                } else {
                                    Some((user_id, name.to_string()))
                                }
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                tracing::info!(group_id, count = members.len(), "group members cached");
                cache.set_members(group_id, members);
            }
            Ok(response) => {
                tracing::warn!(group_id, retcode = response.retcode, "member list rejected");
                cache.clear_pending(group_id);
            }
            Err(e) => {
                tracing::warn!(group_id, error = %e, "member list fetch failed");
                cache.clear_pending(group_id);
            }
        }
    });
}
