//! Common HTTP caller formatter: maps the standard request shape to a
//! URL + headers + body, executes the transport and maps failures to
//! the `21007` / `31007` envelope codes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use micra_core::formatter::CallerFormatter;
use micra_core::message::{
    CallArgs, CallRequest, Headers, Network, StdRequest, StdResponse, format_uri,
};
use micra_core::service::ResolvedInstance;
use micra_core::{MicraError, Result, err_code};

/// Init config shared by the HTTP caller formatters.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpFormatterConfig {
    /// Request timeout seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Headers attached to every call; the request's own win.
    #[serde(default)]
    pub headers: Headers,
    /// Url scheme per platform protocol id, e.g.
    /// `{https: [https, https_with_ssl]}`.
    #[serde(default = "default_protocol_mapping")]
    pub protocol_mapping: HashMap<String, Vec<String>>,
}

fn default_timeout() -> f64 {
    60.0
}

fn default_protocol_mapping() -> HashMap<String, Vec<String>> {
    [("https".to_string(), vec!["https".to_string()])]
        .into_iter()
        .collect()
}

impl Default for HttpFormatterConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            headers: Headers::new(),
            protocol_mapping: default_protocol_mapping(),
        }
    }
}

impl HttpFormatterConfig {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

pub(crate) fn resolve_scheme(config: &HttpFormatterConfig, protocol: Option<&str>) -> &'static str {
    let protocol = protocol.unwrap_or("http");
    let https_ids = config
        .protocol_mapping
        .get("https")
        .cloned()
        .unwrap_or_default();
    if https_ids.iter().any(|id| id == protocol) {
        "https"
    } else {
        "http"
    }
}

pub(crate) fn build_url(
    config: &HttpFormatterConfig,
    instance: &ResolvedInstance,
    call: &CallArgs,
) -> Result<String> {
    let ip = instance.ip.as_deref().ok_or_else(|| {
        MicraError::TransportPreSend("instance has no address".to_string())
    })?;
    let scheme = resolve_scheme(config, instance.protocol.as_deref());
    let uri = format_uri(
        instance.uri.as_deref().unwrap_or(""),
        &call.args,
        Some(&call.kwargs),
    );
    let port = instance
        .port
        .map(|p| format!(":{}", p))
        .unwrap_or_default();
    Ok(format!(
        "{}://{}{}/{}",
        scheme,
        ip,
        port,
        uri.trim_start_matches('/')
    ))
}

pub(crate) fn request_method(request: &CallRequest) -> String {
    request
        .network
        .get("method")
        .and_then(|v| v.as_str())
        .unwrap_or("GET")
        .to_string()
}

pub(crate) fn request_body(msg: &Value) -> Option<Vec<u8>> {
    match msg {
        Value::Null => None,
        Value::String(s) => Some(s.clone().into_bytes()),
        other => serde_json::to_vec(other).ok(),
    }
}

/// A transport failure, split at the "bytes went out" boundary.
pub(crate) enum TransportFailure {
    /// Nothing was sent; maps to `21007`.
    Pre(String),
    /// The exchange started and failed (including non-success
    /// status); maps to `31007` with the observed status.
    Post(String, u16),
}

/// Execute one HTTP exchange. With `error_on_status`, a non-2xx reply
/// counts as a post-send failure.
pub(crate) async fn execute_http(
    client: &reqwest::Client,
    config: &HttpFormatterConfig,
    url: &str,
    std_request: &CallRequest,
    error_on_status: bool,
) -> std::result::Result<StdResponse, TransportFailure> {
    let method = reqwest::Method::from_bytes(request_method(std_request).as_bytes())
        .map_err(|e| TransportFailure::Pre(e.to_string()))?;

    let mut builder = client
        .request(method, url)
        .timeout(Duration::from_secs_f64(config.timeout));
    for (name, value) in std_request.headers.iter() {
        builder = builder.header(name, value);
    }
    if let Some(body) = request_body(&std_request.msg) {
        builder = builder.body(body);
    }

    let request = builder
        .build()
        .map_err(|e| TransportFailure::Pre(e.to_string()))?;
    let response = client
        .execute(request)
        .await
        .map_err(|e| TransportFailure::Post(e.to_string(), 500))?;

    let status = response.status().as_u16();
    if error_on_status && !response.status().is_success() {
        return Err(TransportFailure::Post(
            format!("Http status error [{}]", status),
            status,
        ));
    }

    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        headers.insert(name.as_str(), value.to_str().unwrap_or_default());
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| TransportFailure::Post(e.to_string(), status))?;

    let msg = if body.is_empty() {
        Value::Null
    } else if headers
        .get("content-type")
        .is_some_and(|ct| ct.starts_with("application/json"))
    {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    } else {
        Value::String(String::from_utf8_lossy(&body).into_owned())
    };

    Ok(StdResponse {
        network: micra_core::message::ResponseNetwork { status },
        headers,
        msg,
    })
}

/// Build the local-call standard request shared by the HTTP
/// formatters: network defaults for an in-process hop, config headers
/// underneath the request's own.
pub(crate) fn local_std_request(
    config: &HttpFormatterConfig,
    instance: &ResolvedInstance,
    request: CallRequest,
    call: &CallArgs,
) -> StdRequest {
    let uri = format_uri(instance.uri.as_deref().unwrap_or(""), &call.args, None);

    let mut network = Network {
        method: "GET".to_string(),
        host: "local".to_string(),
        path: uri,
        ip: "127.0.0.1".to_string(),
        port: 0,
        query: HashMap::new(),
        url: String::new(),
    };
    for (key, value) in &request.network {
        match key.as_str() {
            "method" => {
                if let Some(s) = value.as_str() {
                    network.method = s.to_string();
                }
            }
            "host" => {
                if let Some(s) = value.as_str() {
                    network.host = s.to_string();
                }
            }
            "path" => {
                if let Some(s) = value.as_str() {
                    network.path = s.to_string();
                }
            }
            "ip" => {
                if let Some(s) = value.as_str() {
                    network.ip = s.to_string();
                }
            }
            "port" => {
                if let Some(p) = value.as_u64() {
                    network.port = p as u16;
                }
            }
            "url" => {
                if let Some(s) = value.as_str() {
                    network.url = s.to_string();
                }
            }
            _ => {}
        }
    }

    StdRequest {
        network,
        headers: config.headers.merged_under(&request.headers),
        msg: request.msg,
    }
}

/// Common (non-envelope) HTTP caller formatter.
pub struct HttpCallerFormatter {
    config: HttpFormatterConfig,
    client: reqwest::Client,
}

impl HttpCallerFormatter {
    pub fn new(config: HttpFormatterConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn error_envelope(
        &self,
        code: &str,
        message: String,
        url: &str,
        status: u16,
    ) -> StdResponse {
        StdResponse {
            network: micra_core::message::ResponseNetwork { status },
            headers: Headers::new(),
            msg: json!({
                "errCode": code,
                "errMsg": message,
                "url": url,
            }),
        }
    }
}

#[async_trait]
impl CallerFormatter for HttpCallerFormatter {
    async fn format_remote_call_request(
        &self,
        _instance: &ResolvedInstance,
        request: CallRequest,
        _call: &CallArgs,
    ) -> Result<CallRequest> {
        Ok(CallRequest {
            network: request.network,
            headers: self.config.headers.merged_under(&request.headers),
            msg: request.msg,
        })
    }

    async fn call(
        &self,
        instance: &ResolvedInstance,
        std_request: &CallRequest,
        call: &CallArgs,
    ) -> StdResponse {
        let url = match build_url(&self.config, instance, call) {
            Ok(url) => url,
            Err(e) => return self.error_envelope(err_code::PRE_SEND, e.to_string(), "", 500),
        };

        match execute_http(&self.client, &self.config, &url, std_request, true).await {
            Ok(response) => response,
            Err(TransportFailure::Pre(message)) => {
                self.error_envelope(err_code::PRE_SEND, message, &url, 500)
            }
            Err(TransportFailure::Post(message, status)) => {
                self.error_envelope(err_code::POST_SEND, message, &url, status)
            }
        }
    }

    async fn format_local_call_request(
        &self,
        instance: &ResolvedInstance,
        request: CallRequest,
        call: &CallArgs,
    ) -> Result<StdRequest> {
        Ok(local_std_request(&self.config, instance, request, call))
    }

    async fn format_local_call_response(
        &self,
        response: StdResponse,
        _std_request: &StdRequest,
        _instance: &ResolvedInstance,
    ) -> StdResponse {
        response
    }

    async fn format_local_call_exception(
        &self,
        code: &str,
        err_msg: Option<&str>,
        error: &MicraError,
        _std_request: Option<&StdRequest>,
        instance: &ResolvedInstance,
    ) -> StdResponse {
        let message = err_msg
            .map(|m| m.to_string())
            .unwrap_or_else(|| error.to_string());
        self.error_envelope(
            code,
            message,
            instance.uri.as_deref().unwrap_or(""),
            500,
        )
    }
}
