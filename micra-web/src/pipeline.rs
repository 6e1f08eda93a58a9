//! Per-service request pipeline. Layers wrap at registration time:
//! the interface check sits innermost around the handler, the tracer
//! span around that, and normalization/logging/error mapping
//! outermost. Bare handlers are never exposed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::error;

use micra_core::adapter::AdapterManager;
use micra_core::formatter::{
    InfCheck, InfKind, InfLogging, InfPayload, LogSide, ServerFormatter,
};
use micra_core::message::{
    CallArgs, Headers, Network, RawRequest, StdRequest, StdResponse, WireResponse,
    coerce_path_value, parse_query, uri_param_specs,
};
use micra_core::plugin::AdapterKind;
use micra_core::service::{HandlerFn, ServiceConfig};
use micra_core::MicraError;
use micra_trace::{TraceOptions, Tracer, wrap_request_handler};

pub struct ServicePipeline {
    service_id: String,
    config: Arc<ServiceConfig>,
    formatter: Option<Arc<dyn ServerFormatter>>,
    inf_logging: Option<Arc<dyn InfLogging>>,
    handler: HandlerFn,
    param_specs: Vec<(String, String)>,
}

impl ServicePipeline {
    /// Assemble the pipeline for one registered service.
    pub fn build(
        service_id: &str,
        config: Arc<ServiceConfig>,
        manager: &AdapterManager,
        tracer: Option<Arc<Tracer>>,
        raw_handler: HandlerFn,
    ) -> Self {
        let formatter = manager
            .get_opt(AdapterKind::ServerFormatter, config.formatter.as_deref())
            .and_then(|e| e.as_server_formatter());
        let inf_logging = manager
            .get_opt(AdapterKind::InfLogging, config.inf_logging.as_deref())
            .and_then(|e| e.as_inf_logging());

        let handler =
            wrap_service_handler(service_id, Arc::clone(&config), manager, tracer, raw_handler);

        Self {
            service_id: service_id.to_string(),
            param_specs: uri_param_specs(&config.uri),
            config,
            formatter,
            inf_logging,
            handler,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn config(&self) -> &Arc<ServiceConfig> {
        &self.config
    }

    /// Run one request through the full stack.
    pub async fn handle(&self, raw: RawRequest, path_params: &[(String, String)]) -> WireResponse {
        let trans = self.config.kv_type_trans_mapping.as_ref();
        let std_request = match &self.formatter {
            Some(formatter) => formatter.format_request(&raw, trans),
            None => Ok(passthrough_request(&raw, trans)),
        };
        let std_request = match std_request {
            Ok(request) => request,
            Err(e) => {
                error!(service = %self.service_id, error = %e, "request normalization failed");
                return self.exception_response(None, &e).await;
            }
        };

        // Positional args from the route, query params into kwargs.
        let mut call = CallArgs::default();
        for (name, kind) in &self.param_specs {
            if let Some((_, value)) = path_params.iter().find(|(n, _)| n == name) {
                call.args.push(coerce_path_value(value, kind));
            }
        }
        for (key, value) in &std_request.network.query {
            call.kwargs.insert(key.clone(), value.clone());
        }

        self.log(InfKind::Request, InfPayload::Request(&std_request))
            .await;

        match (self.handler)(std_request.clone(), call).await {
            Ok(response) => {
                self.log(InfKind::Back, InfPayload::Response(&response)).await;
                self.to_wire(&response)
            }
            Err(e) => {
                error!(service = %self.service_id, error = %e, "service handler exception");
                self.exception_response(Some(&std_request), &e).await
            }
        }
    }

    async fn exception_response(
        &self,
        request: Option<&StdRequest>,
        error: &MicraError,
    ) -> WireResponse {
        match &self.formatter {
            Some(formatter) => {
                let response = formatter.format_exception(request, error, &self.config);
                self.log(InfKind::Back, InfPayload::Response(&response)).await;
                formatter.to_wire(&response)
            }
            None => WireResponse {
                status: error.status_code(),
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: bytes::Bytes::from(
                    serde_json::to_vec(&json!({"error": error.to_string()})).unwrap_or_default(),
                ),
            },
        }
    }

    fn to_wire(&self, response: &StdResponse) -> WireResponse {
        match &self.formatter {
            Some(formatter) => formatter.to_wire(response),
            None => WireResponse {
                status: response.status(),
                headers: response
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                body: match &response.msg {
                    Value::Null => bytes::Bytes::new(),
                    Value::String(s) => bytes::Bytes::from(s.clone().into_bytes()),
                    other => bytes::Bytes::from(serde_json::to_vec(other).unwrap_or_default()),
                },
            },
        }
    }

    async fn log(&self, kind: InfKind, payload: InfPayload<'_>) {
        if let Some(logging) = &self.inf_logging {
            logging
                .log(LogSide::Server, kind, payload, &self.service_id)
                .await;
        }
    }
}

/// Compose the wrapping applied to every registered handler:
/// interface check and response formatting innermost, the tracer span
/// around them when enabled. Local-call registration uses the same
/// composition, so a handler behaves identically on both paths.
pub fn wrap_service_handler(
    service_id: &str,
    config: Arc<ServiceConfig>,
    manager: &AdapterManager,
    tracer: Option<Arc<Tracer>>,
    raw_handler: HandlerFn,
) -> HandlerFn {
    let formatter = manager
        .get_opt(AdapterKind::ServerFormatter, config.formatter.as_deref())
        .and_then(|e| e.as_server_formatter());
    let inf_check = manager
        .get_opt(AdapterKind::InfCheck, config.inf_check.as_deref())
        .and_then(|e| e.as_inf_check());

    let inner = wrap_check_and_format(raw_handler, inf_check, formatter, Arc::clone(&config));
    match (tracer, config.enable_tracer) {
        (Some(tracer), true) => {
            let options = config
                .trace_options
                .as_ref()
                .map(TraceOptions::from_value)
                .unwrap_or_default();
            wrap_request_handler(tracer, service_id, inner, options)
        }
        _ => inner,
    }
}

/// Innermost layer: interface check gate, then the handler, then
/// response normalization. A non-null verdict short-circuits and is
/// normalized the same way.
fn wrap_check_and_format(
    handler: HandlerFn,
    inf_check: Option<Arc<dyn InfCheck>>,
    formatter: Option<Arc<dyn ServerFormatter>>,
    config: Arc<ServiceConfig>,
) -> HandlerFn {
    Arc::new(move |request: StdRequest, call: CallArgs| {
        let handler = Arc::clone(&handler);
        let inf_check = inf_check.clone();
        let formatter = formatter.clone();
        let config = Arc::clone(&config);
        Box::pin(async move {
            let response = match &inf_check {
                Some(check) => match check.check(&request, &config).await {
                    Some(verdict) => verdict,
                    None => handler(request.clone(), call).await?,
                },
                None => handler(request.clone(), call).await?,
            };
            Ok(match &formatter {
                Some(formatter) => formatter.format_response(Some(&request), response),
                None => response,
            })
        }) as micra_core::service::HandlerFuture
    })
}

/// Minimal normalization used when no server formatter is
/// configured: the body stays opaque text.
fn passthrough_request(
    raw: &RawRequest,
    value_trans_mapping: Option<&HashMap<String, String>>,
) -> StdRequest {
    let headers: Headers = raw
        .headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect();
    StdRequest {
        network: Network {
            method: raw.method.clone(),
            host: raw.host.clone(),
            path: raw.path.clone(),
            ip: raw.ip.clone(),
            port: raw.port,
            query: parse_query(&raw.query_string, value_trans_mapping),
            url: raw.url.clone(),
        },
        headers,
        msg: if raw.body.is_empty() {
            Value::Null
        } else {
            Value::String(String::from_utf8_lossy(&raw.body).into_owned())
        },
    }
}

pub(crate) fn into_axum_response(wire: WireResponse) -> axum::response::Response {
    let mut builder = axum::http::Response::builder().status(wire.status);
    for (name, value) in &wire.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from(wire.body))
        .unwrap_or_else(|_| {
            axum::http::Response::builder()
                .status(500)
                .body(axum::body::Body::empty())
                .expect("static response")
        })
}
