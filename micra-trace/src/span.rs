//! Span model: context (ids + baggage), live spans with tags and log
//! events, and finished-span reporting.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

/// Propagated identity of a span: trace id, span id and baggage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub baggage: BTreeMap<String, String>,
}

impl SpanContext {
    pub fn new_root() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().as_u128(),
            span_id: new_span_id(),
            baggage: BTreeMap::new(),
        }
    }

    /// A child context: same trace and baggage, fresh span id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: new_span_id(),
            baggage: self.baggage.clone(),
        }
    }
}

fn new_span_id() -> u64 {
    uuid::Uuid::new_v4().as_u128() as u64
}

#[derive(Debug)]
struct SpanInner {
    context: SpanContext,
    parent_span_id: Option<u64>,
    operation_name: String,
    tags: BTreeMap<String, Value>,
    logs: Vec<BTreeMap<String, Value>>,
    started: Instant,
    finished: bool,
}

/// A live span. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Span {
    inner: Arc<Mutex<SpanInner>>,
}

impl Span {
    pub(crate) fn new(operation_name: &str, parent: Option<&SpanContext>) -> Self {
        let (context, parent_span_id) = match parent {
            Some(parent) => (parent.child(), Some(parent.span_id)),
            None => (SpanContext::new_root(), None),
        };
        Self {
            inner: Arc::new(Mutex::new(SpanInner {
                context,
                parent_span_id,
                operation_name: operation_name.to_string(),
                tags: BTreeMap::new(),
                logs: Vec::new(),
                started: Instant::now(),
                finished: false,
            })),
        }
    }

    pub fn context(&self) -> SpanContext {
        self.inner.lock().unwrap().context.clone()
    }

    pub fn operation_name(&self) -> String {
        self.inner.lock().unwrap().operation_name.clone()
    }

    /// Set a tag; container values are stored as JSON strings.
    pub fn set_tag(&self, name: &str, value: Value) {
        let stored = match &value {
            Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
            _ => value,
        };
        self.inner.lock().unwrap().tags.insert(name.to_string(), stored);
    }

    /// Set a baggage item; values are string-coerced.
    pub fn set_baggage(&self, name: &str, value: &Value) {
        let coerced = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.inner
            .lock()
            .unwrap()
            .context
            .baggage
            .insert(name.to_string(), coerced);
    }

    pub fn get_baggage_item(&self, name: &str) -> Option<String> {
        self.inner.lock().unwrap().context.baggage.get(name).cloned()
    }

    pub fn log_kv(&self, key_values: BTreeMap<String, Value>) {
        self.inner.lock().unwrap().logs.push(key_values);
    }

    pub(crate) fn finish(&self) -> Option<FinishedSpan> {
        let mut inner = self.inner.lock().unwrap();
        if inner.finished {
            return None;
        }
        inner.finished = true;
        Some(FinishedSpan {
            trace_id: inner.context.trace_id,
            span_id: inner.context.span_id,
            parent_span_id: inner.parent_span_id,
            operation_name: inner.operation_name.clone(),
            baggage: inner.context.baggage.clone(),
            tags: inner.tags.clone(),
            logs: inner.logs.clone(),
            duration: inner.started.elapsed(),
        })
    }
}

/// Immutable record handed to the reporter when a span closes.
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    pub trace_id: u128,
    pub span_id: u64,
    pub parent_span_id: Option<u64>,
    pub operation_name: String,
    pub baggage: BTreeMap<String, String>,
    pub tags: BTreeMap<String, Value>,
    pub logs: Vec<BTreeMap<String, Value>>,
    pub duration: Duration,
}

/// Backend seam for finished spans.
pub trait SpanReporter: Send + Sync {
    fn report(&self, span: &FinishedSpan);

    /// Flush buffered spans at shutdown.
    fn close(&self) {}
}

/// Default reporter: drops everything.
pub struct NoopReporter;

impl SpanReporter for NoopReporter {
    fn report(&self, _span: &FinishedSpan) {}
}

/// Reporter that emits finished spans as structured log events.
pub struct LogReporter;

impl SpanReporter for LogReporter {
    fn report(&self, span: &FinishedSpan) {
        tracing::debug!(
            operation = %span.operation_name,
            trace_id = %format!("{:032x}", span.trace_id),
            span_id = %format!("{:016x}", span.span_id),
            duration_ms = span.duration.as_secs_f64() * 1000.0,
            tags = %serde_json::to_string(&span.tags).unwrap_or_default(),
            "span finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn child_keeps_trace_and_baggage() {
        let mut root = SpanContext::new_root();
        root.baggage.insert("k".into(), "v".into());
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.baggage.get("k").map(|s| s.as_str()), Some("v"));
    }

    #[test]
    fn container_tags_stored_as_json_strings() {
        let span = Span::new("op", None);
        span.set_tag("plain", json!(42));
        span.set_tag("container", json!({"a": 1}));
        let finished = span.finish().unwrap();
        assert_eq!(finished.tags["plain"], json!(42));
        assert_eq!(finished.tags["container"], json!("{\"a\":1}"));
    }

    #[test]
    fn baggage_values_string_coerced() {
        let span = Span::new("op", None);
        span.set_baggage("n", &json!(10));
        span.set_baggage("s", &json!("text"));
        assert_eq!(span.get_baggage_item("n").as_deref(), Some("10"));
        assert_eq!(span.get_baggage_item("s").as_deref(), Some("text"));
    }

    #[test]
    fn finish_is_idempotent() {
        let span = Span::new("op", None);
        assert!(span.finish().is_some());
        assert!(span.finish().is_none());
    }
}
