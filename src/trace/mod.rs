//! Span recorder with sampling and Jaeger-shaped export.
//!
//! Spans finish on drop (or explicitly); sampled spans land in a bounded
//! ring and go to the optional exporter callback. IDs come from one
//! StdRng seeded at startup: 32 lowercase hex chars for traces, 16 for
//! spans.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAX_RECENT_SPANS: usize = 10_000;

pub type SpanExporter = Box<dyn Fn(&SpanContext) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub op_name: String,
    pub start_us: i64,
    pub end_us: i64,
    pub tags: BTreeMap<String, String>,
    pub logs: Vec<(i64, String)>,
    pub sampled: bool,
}

struct Inner {
    rng: StdRng,
    recent: VecDeque<SpanContext>,
    exporter: Option<SpanExporter>,
    total_spans: u64,
    total_duration_us: i64,
    sample_rate: f64,
}

pub struct TraceSystem {
    inner: Mutex<Inner>,
    service_name: String,
}

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

impl TraceSystem {
    pub fn new(sample_rate: f64, service_name: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                rng: StdRng::from_entropy(),
                recent: VecDeque::new(),
                exporter: None,
                total_spans: 0,
                total_duration_us: 0,
                sample_rate: sample_rate.clamp(0.0, 1.0),
            }),
            service_name: service_name.to_string(),
        })
    }

    pub fn set_sample_rate(&self, rate: f64) {
        self.inner.lock().sample_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_exporter(&self, exporter: SpanExporter) {
        self.inner.lock().exporter = Some(exporter);
    }

    fn generate_id(&self, hex_len: usize) -> String {
        const HEX: &[u8] = b"0123456789abcdef";
        let mut inner = self.inner.lock();
        (0..hex_len)
            .map(|_| HEX[inner.rng.gen_range(0..16)] as char)
            .collect()
    }

    pub fn start_span(self: &Arc<Self>, op_name: &str) -> Span {
        self.start_span_with(op_name, None, None)
    }

    pub fn continue_span(
        self: &Arc<Self>,
        op_name: &str,
        trace_id: &str,
        parent_span_id: &str,
    ) -> Span {
        self.start_span_with(op_name, Some(trace_id.to_string()), Some(parent_span_id.to_string()))
    }

    fn start_span_with(
        self: &Arc<Self>,
        op_name: &str,
        trace_id: Option<String>,
        parent_span_id: Option<String>,
    ) -> Span {
        let trace_id = trace_id.unwrap_or_else(|| self.generate_id(32));
        let span_id = self.generate_id(16);
        let sampled = {
            let mut inner = self.inner.lock();
            let rate = inner.sample_rate;
            inner.rng.gen::<f64>() < rate
        };
        let mut tags = BTreeMap::new();
        tags.insert("service.name".to_string(), self.service_name.clone());
        Span {
            system: self.clone(),
            ctx: SpanContext {
                trace_id,
                span_id,
                parent_span_id,
                op_name: op_name.to_string(),
                start_us: now_us(),
                end_us: 0,
                tags,
                logs: Vec::new(),
                sampled,
            },
            finished: false,
        }
    }

    fn record(&self, ctx: SpanContext) {
        let mut inner = self.inner.lock();
        inner.total_spans += 1;
        inner.total_duration_us += ctx.end_us - ctx.start_us;
        if let Some(exporter) = &inner.exporter {
            exporter(&ctx);
        }
        inner.recent.push_back(ctx);
        while inner.recent.len() > MAX_RECENT_SPANS {
            inner.recent.pop_front();
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<SpanContext> {
        let inner = self.inner.lock();
        let skip = inner.recent.len().saturating_sub(limit);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    pub fn spans_for_trace(&self, trace_id: &str) -> Vec<SpanContext> {
        self.inner
            .lock()
            .recent
            .iter()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> TraceStats {
        let inner = self.inner.lock();
        let errors = inner
            .recent
            .iter()
            .filter(|s| s.tags.get("error").map(String::as_str) == Some("true"))
            .count() as u64;
        TraceStats {
            total_spans: inner.total_spans,
            avg_duration_ms: if inner.total_spans > 0 {
                (inner.total_duration_us as f64 / inner.total_spans as f64) / 1000.0
            } else {
                0.0
            },
            errors,
        }
    }

    /// Jaeger UI payload shape.
    pub fn export_jaeger(&self) -> Value {
        let inner = self.inner.lock();
        let spans: Vec<Value> = inner
            .recent
            .iter()
            .map(|s| {
                let mut span = json!({
                    "traceID": s.trace_id,
                    "spanID": s.span_id,
                    "operationName": s.op_name,
                    "startTime": s.start_us,
                    "duration": s.end_us - s.start_us,
                    "tags": s.tags,
                });
                if let Some(parent) = &s.parent_span_id {
                    span["parentSpanID"] = json!(parent);
                }
                if !s.logs.is_empty() {
                    span["logs"] = Value::Array(
                        s.logs
                            .iter()
                            .map(|(ts, msg)| json!({"timestamp": ts, "message": msg}))
                            .collect(),
                    );
                }
                span
            })
            .collect();
        json!({
            "data": [{
                "traceID": "mixed",
                "spans": spans,
                "processes": {"p1": {"serviceName": self.service_name}},
            }]
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceStats {
    pub total_spans: u64,
    pub avg_duration_ms: f64,
    pub errors: u64,
}

pub struct Span {
    system: Arc<TraceSystem>,
    ctx: SpanContext,
    finished: bool,
}

impl Span {
    pub fn trace_id(&self) -> &str {
        &self.ctx.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.ctx.span_id
    }

    pub fn set_tag(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.ctx.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn log(&mut self, message: &str) -> &mut Self {
        self.ctx.logs.push((now_us(), message.to_string()));
        self
    }

    pub fn set_error(&mut self, message: &str) -> &mut Self {
        self.ctx.tags.insert("error".into(), "true".into());
        self.ctx
            .tags
            .insert("error.message".into(), message.to_string());
        self
    }

    pub fn child(&self, op_name: &str) -> Span {
        self.system
            .continue_span(op_name, &self.ctx.trace_id, &self.ctx.span_id)
    }

    pub fn finish(mut self) {
        self.finish_inner();
    }

    fn finish_inner(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.ctx.end_us = now_us();
        if self.ctx.sampled {
            self.system.record(self.ctx.clone());
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_documented_shape() {
        let traces = TraceSystem::new(1.0, "lchbot");
        let span = traces.start_span("op");
        assert_eq!(span.trace_id().len(), 32);
        assert_eq!(span.span_id().len(), 16);
        assert!(span
            .trace_id()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn finished_sampled_spans_land_in_ring() {
        let traces = TraceSystem::new(1.0, "lchbot");
        let mut span = traces.start_span("handle_message");
        span.set_tag("group_id", 7).log("dispatching");
        span.finish();

        let recent = traces.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].op_name, "handle_message");
        assert_eq!(recent[0].tags["group_id"], "7");
        assert_eq!(recent[0].tags["service.name"], "lchbot");
        assert_eq!(recent[0].logs.len(), 1);
        assert!(recent[0].end_us >= recent[0].start_us);
    }

    #[test]
    fn zero_sample_rate_records_nothing() {
        let traces = TraceSystem::new(0.0, "lchbot");
        traces.start_span("dropped").finish();
        assert!(traces.recent(10).is_empty());
        // Totals still count nothing since the span was unsampled.
        assert_eq!(traces.stats().total_spans, 0);
    }

    #[test]
    fn child_shares_trace_and_links_parent() {
        let traces = TraceSystem::new(1.0, "lchbot");
        let parent = traces.start_span("parent");
        let trace_id = parent.trace_id().to_string();
        let parent_id = parent.span_id().to_string();
        let child = parent.child("child");
        assert_eq!(child.trace_id(), trace_id);
        child.finish();
        parent.finish();

        let spans = traces.spans_for_trace(&trace_id);
        assert_eq!(spans.len(), 2);
        let child_ctx = spans.iter().find(|s| s.op_name == "child").unwrap();
        assert_eq!(child_ctx.parent_span_id.as_deref(), Some(parent_id.as_str()));
        let parent_ctx = spans.iter().find(|s| s.op_name == "parent").unwrap();
        assert!(parent_ctx.parent_span_id.is_none());
    }

    #[test]
    fn drop_finishes_span() {
        let traces = TraceSystem::new(1.0, "lchbot");
        {
            let _span = traces.start_span("implicit");
        }
        assert_eq!(traces.recent(10).len(), 1);
    }

    #[test]
    fn exporter_callback_fires() {
        let traces = TraceSystem::new(1.0, "lchbot");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        traces.set_exporter(Box::new(move |ctx| sink.lock().push(ctx.op_name.clone())));
        traces.start_span("exported").finish();
        assert_eq!(seen.lock().as_slice(), ["exported"]);
    }

    #[test]
    fn jaeger_export_shape() {
        let traces = TraceSystem::new(1.0, "svc-name");
        let mut span = traces.start_span("op");
        span.log("note");
        span.finish();

        let value = traces.export_jaeger();
        let data = &value["data"][0];
        assert_eq!(data["processes"]["p1"]["serviceName"], "svc-name");
        let span = &data["spans"][0];
        assert_eq!(span["operationName"], "op");
        assert!(span["traceID"].as_str().unwrap().len() == 32);
        assert!(span["duration"].as_i64().unwrap() >= 0);
        assert_eq!(span["logs"][0]["message"], "note");
    }

    #[test]
    fn error_tag_counts_in_stats() {
        let traces = TraceSystem::new(1.0, "lchbot");
        let mut bad = traces.start_span("bad");
        bad.set_error("boom");
        bad.finish();
        traces.start_span("good").finish();
        let stats = traces.stats();
        assert_eq!(stats.total_spans, 2);
        assert_eq!(stats.errors, 1);
    }
}
