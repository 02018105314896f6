//! Management HTTP API.
//!
//! Local axum listener, one JSON body per route, CORS-permissive. This
//! surface shares no state with the gateway socket beyond the handles it
//! is given here.

use crate::cache::ResponseCache;
use crate::error::BotError;
use crate::metrics::BotMetrics;
use crate::permissions::PermissionStore;
use crate::personality::PersonalitySystem;
use crate::plugins::PluginHost;
use crate::ratelimit::RateLimiter;
use crate::sandbox::Sandbox;
use crate::stats::Statistics;
use crate::trace::TraceSystem;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AdminState {
    pub host: Arc<PluginHost>,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
    pub traces: Arc<TraceSystem>,
    pub metrics: Arc<BotMetrics>,
    pub sandbox: Arc<Sandbox>,
    pub permissions: Arc<PermissionStore>,
    pub personalities: Arc<PersonalitySystem>,
    pub stats: Arc<Statistics>,
    pub plugins_dir: PathBuf,
}

struct AdminError(StatusCode, String);

impl From<BotError> for AdminError {
    fn from(err: BotError) -> Self {
        let status = match &err {
            BotError::PluginLoad(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AdminError(status, err.to_string())
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({"error": self.1}))).into_response()
    }
}

const STATUS_PAGE: &str = "<!DOCTYPE html>\n<html><head><title>LCHBOT</title></head>\n\
<body><h1>LCHBOT</h1><p>running</p>\n\
<ul>\n\
<li><a href=\"/api/stats\">stats</a></li>\n\
<li><a href=\"/api/plugins\">plugins</a></li>\n\
<li><a href=\"/metrics\">metrics</a></li>\n\
<li><a href=\"/api/traces\">traces</a></li>\n\
</ul></body></html>\n";

pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/stats", get(api_stats))
        .route("/api/plugins", get(api_plugins))
        .route("/api/plugins/:name/enable", post(api_plugin_enable))
        .route("/api/plugins/:name/disable", post(api_plugin_disable))
        .route("/api/plugins/:name/reload", post(api_plugin_reload))
        .route("/api/groups", get(api_groups))
        .route("/api/personalities", get(api_personalities))
        .route("/api/reload", post(api_reload))
        .route("/api/metrics", get(api_metrics_summary))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/traces", get(api_traces))
        .route("/api/traces/jaeger", get(api_traces_jaeger))
        .route("/api/cache", get(api_cache))
        .route("/api/cache/clear", post(api_cache_clear))
        .route("/api/sandbox", get(api_sandbox))
        .route("/api/permissions", get(api_permissions))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the task is aborted.
pub async fn serve(state: AdminState, port: u16) -> crate::error::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(BotError::Io)?;
    let app = build_router(state);
    tracing::info!(port, "admin api listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "admin server stopped");
        }
    }))
}

async fn index() -> Html<&'static str> {
    Html(STATUS_PAGE)
}

async fn api_stats(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(json!({
        "total_calls": state.stats.total_api_calls(),
        "active_groups": state.stats.active_group_count(),
        "total_plugins": state.host.count(),
        "total_personalities": state.personalities.count(),
    }))
}

async fn api_plugins(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let plugins: Vec<serde_json::Value> = state
        .host
        .descriptors()
        .iter()
        .map(|d| {
            json!({
                "name": d.info.name,
                "version": d.info.version,
                "author": d.info.author,
                "description": d.info.description,
                "priority": d.info.priority,
                "enabled": d.enabled,
                "origin": format!("{:?}", d.origin),
            })
        })
        .collect();
    Json(json!({"plugins": plugins}))
}

async fn api_plugin_enable(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    state.host.set_enabled(&name, true).await?;
    Ok(Json(json!({"success": true})))
}

async fn api_plugin_disable(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    state.host.set_enabled(&name, false).await?;
    Ok(Json(json!({"success": true})))
}

async fn api_plugin_reload(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let descriptor = state
        .host
        .descriptors()
        .into_iter()
        .find(|d| d.info.name == name)
        .ok_or_else(|| AdminError(StatusCode::NOT_FOUND, format!("no such plugin: {name}")))?;
    let Some(path) = descriptor.script_path else {
        return Err(AdminError(
            StatusCode::BAD_REQUEST,
            "only scripted plugins reload".into(),
        ));
    };
    state.host.unload(&name).await?;
    state.host.load_scripted(&path).await?;
    Ok(Json(json!({"success": true})))
}

async fn api_groups(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let groups: Vec<serde_json::Value> = state
        .stats
        .group_calls()
        .into_iter()
        .map(|(id, calls)| {
            json!({
                "id": id,
                "personality": state.personalities.name_for_group(id),
                "calls": calls,
            })
        })
        .collect();
    Json(json!({"groups": groups}))
}

async fn api_personalities(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let personalities: Vec<serde_json::Value> = state
        .personalities
        .list()
        .into_iter()
        .map(|(id, name)| json!({"id": id, "name": name}))
        .collect();
    Json(json!({"personalities": personalities}))
}

async fn api_reload(State(state): State<AdminState>) -> Json<serde_json::Value> {
    state.host.reload_all_scripted(&state.plugins_dir).await;
    state.personalities.reload();
    Json(json!({"success": true, "message": "System reloaded"}))
}

async fn api_metrics_summary(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let cache = state.cache.stats();
    let traces = state.traces.stats();
    Json(json!({
        "uptime_seconds": state.metrics.uptime_secs(),
        "cache": {
            "hits": cache.hits,
            "misses": cache.misses,
            "entries": cache.entry_count,
            "bytes": cache.total_bytes,
            "hit_rate": cache.hit_rate(),
        },
        "traces": {
            "total_spans": traces.total_spans,
            "avg_duration_ms": traces.avg_duration_ms,
            "errors": traces.errors,
        },
    }))
}

async fn prometheus_metrics(State(state): State<AdminState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export(),
    )
        .into_response()
}

async fn api_traces(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let spans: Vec<serde_json::Value> = state
        .traces
        .recent(100)
        .into_iter()
        .map(|s| {
            json!({
                "traceId": s.trace_id,
                "spanId": s.span_id,
                "operationName": s.op_name,
                "startTime": s.start_us,
                "duration": s.end_us - s.start_us,
                "tags": s.tags,
            })
        })
        .collect();
    Json(json!({"spans": spans}))
}

async fn api_traces_jaeger(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(state.traces.export_jaeger())
}

async fn api_cache(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let stats = state.cache.stats();
    Json(json!({
        "hits": stats.hits,
        "misses": stats.misses,
        "evictions": stats.evictions,
        "expirations": stats.expirations,
        "total_bytes": stats.total_bytes,
        "entry_count": stats.entry_count,
        "hit_rate": stats.hit_rate(),
    }))
}

async fn api_cache_clear(State(state): State<AdminState>) -> Json<serde_json::Value> {
    state.cache.clear();
    Json(json!({"success": true}))
}

async fn api_sandbox(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let plugins: Vec<serde_json::Value> = state
        .sandbox
        .all_stats()
        .into_iter()
        .map(|s| {
            json!({
                "plugin": s.plugin,
                "enabled": s.enabled,
                "permissions": s.permissions,
                "memory_bytes": s.usage.memory_bytes,
                "cpu_time_us": s.usage.cpu_time_us,
                "network_requests": s.usage.network_requests,
                "file_operations": s.usage.file_operations,
                "messages_sent": s.usage.messages_sent,
                "violations": s.usage.violations,
            })
        })
        .collect();
    let violations: Vec<serde_json::Value> = state
        .sandbox
        .violation_log(100)
        .into_iter()
        .map(|(plugin, detail)| json!({"plugin": plugin, "detail": detail}))
        .collect();
    Json(json!({"plugins": plugins, "violations": violations}))
}

async fn api_permissions(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(state.permissions.snapshot())
}
