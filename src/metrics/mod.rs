//! Prometheus instruments for the runtime.
//!
//! One registry carries the standard metric set; exposition is the text
//! encoder's output with any registered custom-collector strings appended
//! verbatim.

use parking_lot::Mutex;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::collections::BTreeMap;
use std::time::Instant;

pub type CustomCollector = Box<dyn Fn() -> String + Send + Sync>;

pub struct BotMetrics {
    registry: Registry,
    start: Instant,

    uptime_seconds: IntGauge,
    active_connections: IntGauge,
    memory_bytes: Gauge,
    messages_total: IntCounterVec,
    ai_requests_total: IntCounterVec,
    ai_latency_seconds: Histogram,
    plugin_executions_total: IntCounterVec,
    rate_limited_total: IntCounterVec,
    errors_total: IntCounterVec,

    custom: Mutex<BTreeMap<String, CustomCollector>>,
}

impl BotMetrics {
    #[allow(clippy::missing_panics_doc)]
    pub fn new() -> Self {
        let registry = Registry::new();

        let uptime_seconds = IntGauge::new("lchbot_uptime_seconds", "Bot uptime in seconds")
            .expect("valid metric");
        let active_connections = IntGauge::new(
            "lchbot_active_connections",
            "Number of active WebSocket connections",
        )
        .expect("valid metric");
        let memory_bytes =
            Gauge::new("lchbot_memory_bytes", "Memory usage in bytes").expect("valid metric");
        let messages_total = IntCounterVec::new(
            Opts::new("lchbot_messages_total", "Total messages processed"),
            &["type", "group"],
        )
        .expect("valid metric");
        let ai_requests_total = IntCounterVec::new(
            Opts::new("lchbot_ai_requests_total", "Total AI API requests"),
            &["model", "status"],
        )
        .expect("valid metric");
        let ai_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("lchbot_ai_latency_seconds", "AI request latency")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        )
        .expect("valid metric");
        let plugin_executions_total = IntCounterVec::new(
            Opts::new("lchbot_plugin_executions_total", "Plugin execution count"),
            &["plugin", "status"],
        )
        .expect("valid metric");
        let rate_limited_total = IntCounterVec::new(
            Opts::new("lchbot_rate_limited_total", "Rate limited requests"),
            &["key"],
        )
        .expect("valid metric");
        let errors_total = IntCounterVec::new(
            Opts::new("lchbot_errors_total", "Total errors"),
            &["module", "code"],
        )
        .expect("valid metric");

        registry.register(Box::new(uptime_seconds.clone())).ok();
        registry.register(Box::new(active_connections.clone())).ok();
        registry.register(Box::new(memory_bytes.clone())).ok();
        registry.register(Box::new(messages_total.clone())).ok();
        registry.register(Box::new(ai_requests_total.clone())).ok();
        registry.register(Box::new(ai_latency_seconds.clone())).ok();
        registry
            .register(Box::new(plugin_executions_total.clone()))
            .ok();
        registry.register(Box::new(rate_limited_total.clone())).ok();
        registry.register(Box::new(errors_total.clone())).ok();

        Self {
            registry,
            start: Instant::now(),
            uptime_seconds,
            active_connections,
            memory_bytes,
            messages_total,
            ai_requests_total,
            ai_latency_seconds,
            plugin_executions_total,
            rate_limited_total,
            errors_total,
            custom: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record_message(&self, kind: &str, group_id: i64) {
        self.messages_total
            .with_label_values(&[kind, &group_id.to_string()])
            .inc();
    }

    pub fn record_ai_request(&self, model: &str, success: bool, latency_seconds: f64) {
        let status = if success { "success" } else { "failure" };
        self.ai_requests_total
            .with_label_values(&[model, status])
            .inc();
        self.ai_latency_seconds.observe(latency_seconds);
    }

    pub fn record_plugin_execution(&self, plugin: &str, success: bool) {
        let status = if success { "success" } else { "failure" };
        self.plugin_executions_total
            .with_label_values(&[plugin, status])
            .inc();
    }

    pub fn record_rate_limited(&self, key: &str) {
        self.rate_limited_total.with_label_values(&[key]).inc();
    }

    pub fn record_error(&self, module: &str, code: &str) {
        self.errors_total.with_label_values(&[module, code]).inc();
    }

    pub fn set_active_connections(&self, count: i64) {
        self.active_connections.set(count);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn add_custom_collector(&self, name: &str, collector: CustomCollector) {
        self.custom.lock().insert(name.to_string(), collector);
    }

    /// Prometheus text exposition plus custom collectors, verbatim.
    pub fn export(&self) -> String {
        self.uptime_seconds.set(self.uptime_secs() as i64);
        self.memory_bytes.set(memory_rss().unwrap_or(f64::NAN));

        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).unwrap_or_default();
        let mut out = String::from_utf8(buf).unwrap_or_default();
        for collector in self.custom.lock().values() {
            out.push_str(&collector());
        }
        out
    }
}

impl Default for BotMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size in bytes, where the platform exposes it.
pub fn memory_rss() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
