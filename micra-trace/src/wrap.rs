//! Handler wrappers: every traced request runs inside a span opened
//! as a child of the inbound carrier context (or a new root), with
//! tag/baggage extractors applied from trace options.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use micra_core::Result;
use micra_core::message::{CallArgs, StdRequest};
use micra_core::service::HandlerFn;

use crate::carrier;
use crate::expr::{FieldExpr, MethodInfo, eval_request, eval_response, json_path};
use crate::{Tracer, TracerOptions};

/// Per-service trace options from the service config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceOptions {
    /// Field expression for the span operation name; defaults to the
    /// wrapped handler's registered name.
    #[serde(default)]
    pub operation_name_para: Option<String>,
    /// Per-call tag extractors, merged over the tracer's own.
    #[serde(default)]
    pub self_tag_paras: HashMap<String, String>,
    #[serde(default)]
    pub self_baggage_paras: HashMap<String, String>,
    #[serde(default)]
    pub self_resp_tag_paras: HashMap<String, String>,
    #[serde(default)]
    pub trace_all_exception: Option<bool>,
    #[serde(default)]
    pub trace_exceptions: Vec<String>,
}

impl TraceOptions {
    pub fn from_value(value: &Value) -> TraceOptions {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

fn merged_exprs(
    instance: &HashMap<String, String>,
    own: &HashMap<String, String>,
) -> Vec<(String, FieldExpr)> {
    let mut merged: HashMap<String, String> = instance.clone();
    for (k, v) in own {
        merged.insert(k.clone(), v.clone());
    }
    merged
        .into_iter()
        .map(|(name, expr)| (name, FieldExpr::parse(&expr)))
        .collect()
}

fn resolve_operation_expr(options: &TraceOptions, handler_name: &str) -> FieldExpr {
    // The wrapper hides the original function, so name lookups are
    // frozen to the registered handler name at wrap time.
    let raw = options
        .operation_name_para
        .clone()
        .unwrap_or_else(|| "name:".to_string());
    match raw.as_str() {
        "name:" => FieldExpr::Const(handler_name.to_string()),
        "short_name:" => FieldExpr::Const(
            handler_name
                .rsplit('.')
                .next()
                .unwrap_or(handler_name)
                .to_string(),
        ),
        _ => FieldExpr::parse(&raw),
    }
}

fn should_trace_error(
    tracer_options: &TracerOptions,
    options: &TraceOptions,
    error: &micra_core::MicraError,
) -> bool {
    let trace_all = options
        .trace_all_exception
        .unwrap_or(tracer_options.trace_all_exception);
    if trace_all {
        return true;
    }
    let listed = if options.trace_exceptions.is_empty() {
        &tracer_options.trace_exceptions
    } else {
        &options.trace_exceptions
    };
    let name = error_kind_name(error);
    listed.iter().any(|e| e == name)
}

fn error_kind_name(error: &micra_core::MicraError) -> &'static str {
    use micra_core::MicraError::*;
    match error {
        ConfigMissing(_) => "ConfigMissing",
        PluginNotFound(_) => "PluginNotFound",
        AdapterLoadFailure(_) => "AdapterLoadFailure",
        ServiceNotFound(_) => "ServiceNotFound",
        ServiceExists(_) => "ServiceExists",
        NoEnableInstance { .. } => "NoEnableInstance",
        TransportPreSend(_) => "TransportPreSend",
        TransportPostSend(_) => "TransportPostSend",
        Handler(_) => "Handler",
        EventEmitUnreachable(_) => "EventEmitUnreachable",
        Store(_) => "Store",
        Timeout(_) => "Timeout",
        Io(_) => "Io",
        Json(_) => "Json",
        Yaml(_) => "Yaml",
        Internal(_) => "Internal",
    }
}

fn error_log(error_text: String) -> BTreeMap<String, Value> {
    let mut log = BTreeMap::new();
    log.insert("event".to_string(), Value::String("error".to_string()));
    log.insert("error.object".to_string(), Value::String(error_text));
    log
}

/// Wrap a request handler so every invocation runs inside a span:
/// parent extracted from the first argument's headers, instance and
/// per-call extractors applied, errors tagged and logged.
pub fn wrap_request_handler(
    tracer: Arc<Tracer>,
    handler_name: &str,
    handler: HandlerFn,
    options: TraceOptions,
) -> HandlerFn {
    let operation_expr = resolve_operation_expr(&options, handler_name);
    let handler_name = handler_name.to_string();

    Arc::new(move |request: StdRequest, call: CallArgs| {
        let tracer = Arc::clone(&tracer);
        let handler = Arc::clone(&handler);
        let options = options.clone();
        let operation_expr = operation_expr.clone();
        let handler_name = handler_name.clone();

        Box::pin(Tracer::in_scope(async move {
            let info = MethodInfo::from_call(&handler_name, &request, &call);
            let operation_name = eval_request(&operation_expr, &info)
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "getNameError".to_string());

            // Child of the inbound context when one travelled in the
            // headers, a new root otherwise.
            let parent = carrier::extract(&request.headers);
            let scope = tracer.start_active_span(&operation_name, parent.as_ref(), true);

            let tracer_options = tracer.options().clone();
            for (name, expr) in
                merged_exprs(&tracer_options.request_tag_paras, &options.self_tag_paras)
            {
                if let Some(value) = eval_request(&expr, &info) {
                    scope.span().set_tag(&name, value);
                }
            }
            for (name, expr) in merged_exprs(
                &tracer_options.request_baggage_paras,
                &options.self_baggage_paras,
            ) {
                if let Some(value) = eval_request(&expr, &info) {
                    scope.span().set_baggage(&name, &value);
                }
            }

            match handler(request, call).await {
                Ok(response) => {
                    if let Some(error_text) = tracer.response_error(&response) {
                        scope.span().set_tag("error", Value::Bool(true));
                        scope.span().log_kv(error_log(error_text));
                    }
                    for (name, expr) in merged_exprs(
                        &tracer_options.response_tag_paras,
                        &options.self_resp_tag_paras,
                    ) {
                        if let Some(value) = eval_response(&expr, &response) {
                            scope.span().set_tag(&name, value);
                        }
                    }
                    scope.close();
                    Ok(response)
                }
                Err(error) => {
                    if should_trace_error(&tracer_options, &options, &error) {
                        scope.span().set_tag("error", Value::Bool(true));
                        scope.span().log_kv(error_log(error.to_string()));
                    }
                    scope.close();
                    Err(error)
                }
            }
        }))
    })
}

/// Trace a plain (non-request) call as a child of the active span.
/// Structurally the request wrapper minus carrier extraction; tag
/// extractors see the call arguments, response extractors the
/// returned value via `json:` paths.
pub async fn trace_plain_call<F>(
    tracer: &Tracer,
    operation_name: &str,
    options: &TraceOptions,
    call: &CallArgs,
    f: F,
) -> Result<Value>
where
    F: Future<Output = Result<Value>>,
{
    let scope = tracer.start_active_span(operation_name, None, false);

    let info = MethodInfo {
        name: operation_name.to_string(),
        short_name: operation_name
            .rsplit('.')
            .next()
            .unwrap_or(operation_name)
            .to_string(),
        request: None,
        args: call.args.clone(),
        kwargs: call.kwargs.clone(),
    };
    for (name, expr) in merged_exprs(&options.self_tag_paras, &HashMap::new()) {
        if let Some(value) = eval_request(&expr, &info) {
            scope.span().set_tag(&name, value);
        }
    }
    for (name, expr) in merged_exprs(&options.self_baggage_paras, &HashMap::new()) {
        if let Some(value) = eval_request(&expr, &info) {
            scope.span().set_baggage(&name, &value);
        }
    }

    match f.await {
        Ok(value) => {
            for (name, raw) in &options.self_resp_tag_paras {
                let expr = FieldExpr::parse(raw);
                if let FieldExpr::Json(path) = expr
                    && let Some(tag_value) = json_path(&value, &path)
                {
                    scope.span().set_tag(name, tag_value);
                }
            }
            scope.close();
            Ok(value)
        }
        Err(error) => {
            scope.span().set_tag("error", Value::Bool(true));
            scope.span().log_kv(error_log(error.to_string()));
            scope.close();
            Err(error)
        }
    }
}
