//! Standard-envelope HTTP caller formatter. Outbound messages carry a
//! `head` with system coordinates and generated sequence numbers;
//! replies are normalized to the response envelope (request fields
//! echoed, `infType` 02, `errCode` 00000 on success).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use micra_core::formatter::{CallerFormatter, SerialNumberProvider};
use micra_core::message::{CallArgs, CallRequest, Headers, StdRequest, StdResponse};
use micra_core::plugin::AppIdentity;
use micra_core::service::ResolvedInstance;
use micra_core::{MicraError, Result, err_code};

use crate::http::{HttpFormatterConfig, TransportFailure, build_url, execute_http, local_std_request};
use crate::serial::serial_fix_str;

/// Init config: the HTTP transport settings plus serial-number wiring.
#[derive(Debug, Clone, Deserialize)]
pub struct StdEnvelopeConfig {
    #[serde(flatten)]
    pub http: HttpFormatterConfig,
    #[serde(default = "default_glob_id")]
    pub global_serial_number_id: String,
    #[serde(default = "default_sys_id")]
    pub sys_serial_number_id: String,
    #[serde(default = "default_inf_id")]
    pub inf_serial_number_id: String,
    #[serde(default)]
    pub global_serial_number_batch_size: u64,
    #[serde(default)]
    pub sys_serial_number_batch_size: u64,
    #[serde(default)]
    pub inf_serial_number_batch_size: u64,
}

fn default_glob_id() -> String {
    "globSeqNum".to_string()
}

fn default_sys_id() -> String {
    "sysSeqNum".to_string()
}

fn default_inf_id() -> String {
    "infSeqNum".to_string()
}

impl Default for StdEnvelopeConfig {
    fn default() -> Self {
        Self {
            http: HttpFormatterConfig::default(),
            global_serial_number_id: default_glob_id(),
            sys_serial_number_id: default_sys_id(),
            inf_serial_number_id: default_inf_id(),
            global_serial_number_batch_size: 0,
            sys_serial_number_batch_size: 0,
            inf_serial_number_batch_size: 0,
        }
    }
}

impl StdEnvelopeConfig {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

pub struct StdEnvelopeCallerFormatter {
    config: StdEnvelopeConfig,
    identity: AppIdentity,
    serial: Arc<dyn SerialNumberProvider>,
    client: reqwest::Client,
}

impl StdEnvelopeCallerFormatter {
    /// Build the formatter; serial batches are pre-fetched in the
    /// background when configured.
    pub fn new(
        config: StdEnvelopeConfig,
        identity: AppIdentity,
        serial: Arc<dyn SerialNumberProvider>,
    ) -> Self {
        let prefetch = [
            (
                config.global_serial_number_id.clone(),
                config.global_serial_number_batch_size,
            ),
            (
                config.sys_serial_number_id.clone(),
                config.sys_serial_number_batch_size,
            ),
            (
                config.inf_serial_number_id.clone(),
                config.inf_serial_number_batch_size,
            ),
        ];
        for (id, batch_size) in prefetch {
            if batch_size > 0 {
                let serial = Arc::clone(&serial);
                tokio::spawn(async move {
                    if let Err(e) = serial.cache_batch(&id, batch_size).await {
                        tracing::warn!(id = %id, error = %e, "serial batch prefetch failed");
                    }
                });
            }
        }
        Self {
            config,
            identity,
            serial,
            client: reqwest::Client::new(),
        }
    }

    fn sys_module(&self, network: &std::collections::HashMap<String, Value>) -> (String, String) {
        let sys = network
            .get("sysId")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.identity.sys_id)
            .to_string();
        let module = network
            .get("moduleId")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.identity.module_id)
            .to_string();
        (sys, module)
    }

    async fn next_serial(&self, id: &str) -> Result<String> {
        Ok(serial_fix_str(self.serial.next(id).await?, 10))
    }

    /// Fill the request head: system ids, interface type and the
    /// three sequence numbers, leaving caller-provided values alone.
    async fn fill_msg_head(&self, mut msg: Value, request: &CallRequest) -> Result<Value> {
        let Some(obj) = msg.as_object_mut() else {
            return Ok(msg);
        };

        let mut head = match obj.remove("head") {
            Some(Value::Object(head)) => head,
            _ => Map::new(),
        };

        if head_field(&head, "sysId").is_empty() {
            let (sys, module) = self.sys_module(&request.network);
            head.insert("sysId".to_string(), json!(format!("{}-{}", sys, module)));
        }
        if head_field(&head, "originSysId").is_empty() {
            let sys_id = head_field(&head, "sysId");
            head.insert("originSysId".to_string(), json!(sys_id));
        }
        if head_field(&head, "infType").is_empty() {
            head.insert("infType".to_string(), json!("01"));
        }

        let now = chrono::Local::now();
        let date = now.format("%Y%m%d").to_string();
        let datetime = now.format("%Y%m%d%H%M%S").to_string();
        let node = format!(
            "{}{}{}",
            self.identity.sys_id, self.identity.module_id, self.identity.server_id
        );

        if head_field(&head, "globSeqNum").is_empty() {
            let serial = self.next_serial(&self.config.global_serial_number_id).await?;
            head.insert("globSeqNum".to_string(), json!(format!("{}{}{}", node, date, serial)));
        }
        if head_field(&head, "sysSeqNum").is_empty() {
            let serial = self.next_serial(&self.config.sys_serial_number_id).await?;
            head.insert("sysSeqNum".to_string(), json!(format!("{}{}{}", node, date, serial)));
        }
        if head_field(&head, "infSeqNum").is_empty() {
            let serial = self.next_serial(&self.config.inf_serial_number_id).await?;
            head.insert(
                "infSeqNum".to_string(),
                json!(format!("{}{}{}", node, datetime, serial)),
            );
        }

        obj.insert("head".to_string(), Value::Object(head));
        Ok(msg)
    }

    fn exception_envelope(
        &self,
        code: &str,
        message: String,
        url: &str,
        real_status: u16,
        request: Option<&CallRequest>,
    ) -> StdResponse {
        let (sys, module) = request
            .map(|r| self.sys_module(&r.network))
            .unwrap_or_else(|| (self.identity.sys_id.clone(), self.identity.module_id.clone()));
        StdResponse {
            network: micra_core::message::ResponseNetwork { status: 200 },
            headers: Headers::new(),
            msg: json!({
                "head": {
                    "errCode": code,
                    "errMsg": message,
                    "errModule": format!("{}-{}", sys, module),
                },
                "body": {
                    "url": url,
                    "realStatus": real_status,
                }
            }),
        }
    }

    /// Normalize a reply to the response envelope against the request
    /// head.
    fn normalize_response(&self, mut response: StdResponse, request_msg: &Value) -> StdResponse {
        let req_head = request_msg.get("head").cloned().unwrap_or(json!({}));
        let mut head = response_head_template(&req_head);

        let status = response.status();
        let has_head = response.msg.get("head").is_some();
        if status < 200 || (status >= 300 && !has_head) {
            // Remote failure without a standard body.
            head.insert("errCode".to_string(), json!(err_code::POST_SEND));
            head.insert(
                "errMsg".to_string(),
                json!(format!("Http status error [{}]", status)),
            );
            response.network.status = 200;
            response.msg = json!({"body": response.msg});
        }

        if !response.msg.is_object() {
            response.msg = json!({});
        }
        let obj = response.msg.as_object_mut().expect("msg is an object");
        if let Some(Value::Object(resp_head)) = obj.remove("head") {
            for (k, v) in resp_head {
                head.insert(k, v);
            }
        }
        obj.insert("head".to_string(), Value::Object(head));
        response
    }
}

fn head_field(head: &Map<String, Value>, key: &str) -> String {
    head.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn response_head_template(req_head: &Value) -> Map<String, Value> {
    let echo = |key: &str, default: &str| -> Value {
        req_head
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| json!(s))
            .unwrap_or(json!(default))
    };
    let mut head = Map::new();
    head.insert("prdCode".to_string(), echo("prdCode", ""));
    head.insert("tranCode".to_string(), echo("tranCode", ""));
    head.insert("originSysId".to_string(), echo("originSysId", ""));
    head.insert("infType".to_string(), json!("02"));
    head.insert("tranMode".to_string(), echo("tranMode", "ONLINE"));
    head.insert("userId".to_string(), echo("userId", ""));
    head.insert("globSeqNum".to_string(), echo("globSeqNum", ""));
    head.insert("sysSeqNum".to_string(), echo("sysSeqNum", ""));
    head.insert("infSeqNum".to_string(), echo("infSeqNum", ""));
    head.insert("errCode".to_string(), json!(err_code::SUCCESS));
    head.insert("errMsg".to_string(), json!("Success"));
    head
}

#[async_trait]
impl CallerFormatter for StdEnvelopeCallerFormatter {
    async fn format_remote_call_request(
        &self,
        _instance: &ResolvedInstance,
        request: CallRequest,
        _call: &CallArgs,
    ) -> Result<CallRequest> {
        let headers = self.config.http.headers.merged_under(&request.headers);
        let msg = self.fill_msg_head(request.msg.clone(), &request).await?;
        Ok(CallRequest {
            network: request.network,
            headers,
            msg,
        })
    }

    async fn call(
        &self,
        instance: &ResolvedInstance,
        std_request: &CallRequest,
        call: &CallArgs,
    ) -> StdResponse {
        let url = match build_url(&self.config.http, instance, call) {
            Ok(url) => url,
            Err(e) => {
                let response = self.exception_envelope(
                    err_code::PRE_SEND,
                    e.to_string(),
                    "",
                    500,
                    Some(std_request),
                );
                return self.normalize_response(response, &std_request.msg);
            }
        };

        let response =
            match execute_http(&self.client, &self.config.http, &url, std_request, false).await {
                Ok(response) => response,
                Err(TransportFailure::Pre(message)) => {
                    self.exception_envelope(err_code::PRE_SEND, message, &url, 500, Some(std_request))
                }
                Err(TransportFailure::Post(message, status)) => self.exception_envelope(
                    err_code::POST_SEND,
                    message,
                    &url,
                    status,
                    Some(std_request),
                ),
            };
        self.normalize_response(response, &std_request.msg)
    }

    async fn format_local_call_request(
        &self,
        instance: &ResolvedInstance,
        request: CallRequest,
        call: &CallArgs,
    ) -> Result<StdRequest> {
        let msg = self.fill_msg_head(request.msg.clone(), &request).await?;
        let request = CallRequest { msg, ..request };
        Ok(local_std_request(&self.config.http, instance, request, call))
    }

    async fn format_local_call_response(
        &self,
        mut response: StdResponse,
        std_request: &StdRequest,
        _instance: &ResolvedInstance,
    ) -> StdResponse {
        if response.network.status == 0 {
            response.network.status = 200;
        }
        self.normalize_response(response, &std_request.msg)
    }

    async fn format_local_call_exception(
        &self,
        code: &str,
        err_msg: Option<&str>,
        error: &MicraError,
        std_request: Option<&StdRequest>,
        instance: &ResolvedInstance,
    ) -> StdResponse {
        let message = err_msg
            .map(|m| m.to_string())
            .unwrap_or_else(|| error.to_string());
        let response = self.exception_envelope(
            code,
            message,
            instance.uri.as_deref().unwrap_or(""),
            500,
            None,
        );
        let request_msg = std_request.map(|r| r.msg.clone()).unwrap_or(Value::Null);
        self.normalize_response(response, &request_msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MemorySerialNumbers;
    use std::collections::HashMap;

    fn identity() -> AppIdentity {
        AppIdentity {
            sys_id: "S0001".to_string(),
            module_id: "001".to_string(),
            server_id: "01".to_string(),
            app_name: "demo".to_string(),
        }
    }

    async fn formatter() -> StdEnvelopeCallerFormatter {
        StdEnvelopeCallerFormatter::new(
            StdEnvelopeConfig::default(),
            identity(),
            Arc::new(MemorySerialNumbers::new()),
        )
    }

    fn instance() -> ResolvedInstance {
        ResolvedInstance {
            is_local: true,
            handler: None,
            protocol: None,
            uri: Some("api/demo".to_string()),
            network: None,
            headers: None,
            metadata: HashMap::new(),
            ip: None,
            port: None,
            formatter: None,
            enable_tracer: false,
            tracer_inject_format: "http_headers".to_string(),
            inf_logging: None,
        }
    }

    #[tokio::test]
    async fn head_filled_with_identity_and_serials() {
        let formatter = formatter().await;
        let request = CallRequest {
            msg: json!({"body": {"x": 1}}),
            ..Default::default()
        };
        let formatted = formatter
            .format_remote_call_request(&instance(), request, &CallArgs::default())
            .await
            .unwrap();

        let head = &formatted.msg["head"];
        assert_eq!(head["sysId"], json!("S0001-001"));
        assert_eq!(head["originSysId"], json!("S0001-001"));
        assert_eq!(head["infType"], json!("01"));
        let glob = head["globSeqNum"].as_str().unwrap();
        assert!(glob.starts_with("S000100101"));
        assert!(glob.ends_with("0000000001"));
        let inf = head["infSeqNum"].as_str().unwrap();
        assert_eq!(inf.len(), "S000100101".len() + 14 + 10);
    }

    #[tokio::test]
    async fn caller_head_values_not_overwritten() {
        let formatter = formatter().await;
        let request = CallRequest {
            msg: json!({"head": {"sysId": "X9999-888", "globSeqNum": "FIXED"}, "body": {}}),
            ..Default::default()
        };
        let formatted = formatter
            .format_remote_call_request(&instance(), request, &CallArgs::default())
            .await
            .unwrap();
        assert_eq!(formatted.msg["head"]["sysId"], json!("X9999-888"));
        assert_eq!(formatted.msg["head"]["globSeqNum"], json!("FIXED"));
        assert_eq!(formatted.msg["head"]["originSysId"], json!("X9999-888"));
    }

    #[tokio::test]
    async fn response_envelope_echoes_request_head() {
        let formatter = formatter().await;
        let request_msg = json!({"head": {
            "tranCode": "T1", "originSysId": "S0001-001",
            "globSeqNum": "G1", "sysSeqNum": "S1", "infSeqNum": "I1",
        }});
        let response = StdResponse {
            msg: json!({"head": {}, "body": {"ok": true}}),
            ..Default::default()
        };
        let normalized = formatter.normalize_response(response, &request_msg);
        let head = &normalized.msg["head"];
        assert_eq!(head["errCode"], json!("00000"));
        assert_eq!(head["errMsg"], json!("Success"));
        assert_eq!(head["infType"], json!("02"));
        assert_eq!(head["tranMode"], json!("ONLINE"));
        assert_eq!(head["tranCode"], json!("T1"));
        assert_eq!(head["globSeqNum"], json!("G1"));
        assert_eq!(normalized.msg["body"]["ok"], json!(true));
    }

    #[tokio::test]
    async fn non_std_error_body_becomes_31007() {
        let formatter = formatter().await;
        let response = StdResponse {
            network: micra_core::message::ResponseNetwork { status: 502 },
            headers: Headers::new(),
            msg: json!("bad gateway"),
        };
        let normalized = formatter.normalize_response(response, &json!({}));
        assert_eq!(normalized.status(), 200);
        assert_eq!(normalized.msg["head"]["errCode"], json!("31007"));
        assert_eq!(normalized.msg["body"], json!("bad gateway"));
    }

    #[tokio::test]
    async fn local_exception_envelope_has_err_module() {
        let formatter = formatter().await;
        let error = MicraError::Handler("fail".to_string());
        let response = formatter
            .format_local_call_exception(err_code::PRE_SEND, None, &error, None, &instance())
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.msg["head"]["errCode"], json!("21007"));
        assert_eq!(response.msg["head"]["errModule"], json!("S0001-001"));
        assert_eq!(response.msg["body"]["realStatus"], json!(500));
    }
}
