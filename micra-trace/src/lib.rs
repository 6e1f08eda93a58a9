//! Tracer adapter: span lifecycle, baggage, carrier inject/extract
//! and wrappers that trace request handlers and plain calls.
//!
//! The active span is tracked per task; the pipeline and the handler
//! wrappers establish the scope, so `get_active_span` inside a
//! handler sees the request span and the caller can inject it into
//! outbound headers.

pub mod carrier;
pub mod expr;
pub mod span;
pub mod wrap;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use micra_core::message::{Headers, StdResponse};

pub use span::{FinishedSpan, LogReporter, NoopReporter, Span, SpanContext, SpanReporter};
pub use wrap::{TraceOptions, trace_plain_call, wrap_request_handler};

tokio::task_local! {
    static ACTIVE_SPANS: RefCell<Vec<Span>>;
}

/// Instance-level trace options applied to every wrapped request.
#[derive(Debug, Clone, Deserialize)]
pub struct TracerOptions {
    #[serde(default)]
    pub request_tag_paras: HashMap<String, String>,
    #[serde(default)]
    pub request_baggage_paras: HashMap<String, String>,
    #[serde(default)]
    pub response_tag_paras: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub trace_all_exception: bool,
    #[serde(default)]
    pub trace_exceptions: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            request_tag_paras: HashMap::new(),
            request_baggage_paras: HashMap::new(),
            response_tag_paras: HashMap::new(),
            trace_all_exception: true,
            trace_exceptions: Vec::new(),
        }
    }
}

/// Detector for handler returns that are errors despite completing.
pub type ResponseErrorFn = Arc<dyn Fn(&StdResponse) -> Option<String> + Send + Sync>;

pub struct Tracer {
    service_name: String,
    reporter: Arc<dyn SpanReporter>,
    options: TracerOptions,
    response_error_fn: Option<ResponseErrorFn>,
}

impl Tracer {
    pub fn new(
        service_name: impl Into<String>,
        reporter: Arc<dyn SpanReporter>,
        options: TracerOptions,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            reporter,
            options,
            response_error_fn: None,
        }
    }

    /// Default tracer: spans and baggage work, nothing is reported.
    pub fn noop() -> Self {
        Self::new("noop", Arc::new(NoopReporter), TracerOptions::default())
    }

    pub fn with_response_error_fn(mut self, f: ResponseErrorFn) -> Self {
        self.response_error_fn = Some(f);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn options(&self) -> &TracerOptions {
        &self.options
    }

    pub(crate) fn response_error(&self, response: &StdResponse) -> Option<String> {
        self.response_error_fn.as_ref().and_then(|f| f(response))
    }

    /// Run a future with a fresh active-span stack.
    pub async fn in_scope<F: Future>(fut: F) -> F::Output {
        ACTIVE_SPANS.scope(RefCell::new(Vec::new()), fut).await
    }

    pub fn get_active_span(&self) -> Option<Span> {
        ACTIVE_SPANS
            .try_with(|stack| stack.borrow().last().cloned())
            .ok()
            .flatten()
    }

    /// Open a span without activating it.
    pub fn start_span(
        &self,
        operation_name: &str,
        child_of: Option<&SpanContext>,
        ignore_active_span: bool,
    ) -> Span {
        let active_context = if ignore_active_span {
            None
        } else {
            self.get_active_span().map(|span| span.context())
        };
        Span::new(operation_name, child_of.or(active_context.as_ref()))
    }

    /// Open a span and make it the active one until the scope closes.
    pub fn start_active_span(
        &self,
        operation_name: &str,
        child_of: Option<&SpanContext>,
        ignore_active_span: bool,
    ) -> Scope {
        let span = self.start_span(operation_name, child_of, ignore_active_span);
        let _ = ACTIVE_SPANS.try_with(|stack| stack.borrow_mut().push(span.clone()));
        Scope {
            span,
            reporter: Arc::clone(&self.reporter),
            closed: false,
        }
    }

    /// Set a tag on the given span, or the active one.
    pub fn set_tag(&self, name: &str, value: Value, span: Option<&Span>) {
        match span {
            Some(span) => span.set_tag(name, value),
            None => {
                if let Some(span) = self.get_active_span() {
                    span.set_tag(name, value);
                }
            }
        }
    }

    /// Set a baggage item on the given span, or the active one.
    pub fn set_baggage(&self, name: &str, value: &Value, span: Option<&Span>) {
        match span {
            Some(span) => span.set_baggage(name, value),
            None => {
                if let Some(span) = self.get_active_span() {
                    span.set_baggage(name, value);
                }
            }
        }
    }

    pub fn get_baggage(&self) -> BTreeMap<String, String> {
        self.get_active_span()
            .map(|span| span.context().baggage)
            .unwrap_or_default()
    }

    pub fn get_baggage_item(&self, name: &str, default: Option<&str>) -> Option<String> {
        self.get_active_span()
            .and_then(|span| span.get_baggage_item(name))
            .or_else(|| default.map(|s| s.to_string()))
    }

    /// Record a key/value log event on the active span.
    pub fn log_kv(&self, key_values: BTreeMap<String, Value>) {
        if let Some(span) = self.get_active_span() {
            span.log_kv(key_values);
        }
    }

    /// Inject the active span context into a call carrier.
    pub fn inject_to_call(&self, format: &str, headers: &mut Headers) {
        if format != carrier::HTTP_HEADERS {
            return;
        }
        if let Some(span) = self.get_active_span() {
            carrier::inject(&span.context(), headers);
        }
    }

    /// Extract an inbound span context from a call carrier.
    pub fn extract_from_call(&self, format: &str, headers: &Headers) -> Option<SpanContext> {
        if format != carrier::HTTP_HEADERS {
            return None;
        }
        carrier::extract(headers)
    }

    /// Flush the reporter; called at shutdown.
    pub fn close(&self) {
        self.reporter.close();
    }
}

/// Active-span guard: closing finishes the span, reports it and
/// restores the previous active span.
pub struct Scope {
    span: Span,
    reporter: Arc<dyn SpanReporter>,
    closed: bool,
}

impl Scope {
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = ACTIVE_SPANS.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack
                .iter()
                .rposition(|s| s.context().span_id == self.span.context().span_id)
            {
                stack.remove(pos);
            }
        });
        if let Some(finished) = self.span.finish() {
            self.reporter.report(&finished);
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close_inner();
    }
}
