//! Interface logging and interface check reference implementations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use micra_core::formatter::{InfCheck, InfKind, InfLogging, InfPayload, LogSide};
use micra_core::logger::Logger;
use micra_core::message::{StdRequest, StdResponse};
use micra_core::service::ServiceConfig;

/// Logs every interface message as one JSON line through a named
/// logger.
pub struct CommonInfLogging {
    logger: Arc<Logger>,
}

impl CommonInfLogging {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl InfLogging for CommonInfLogging {
    async fn log(&self, side: LogSide, kind: InfKind, payload: InfPayload<'_>, service_id: &str) {
        let rendered = match payload {
            InfPayload::Request(request) => serde_json::to_string(request),
            InfPayload::Response(response) => serde_json::to_string(response),
            InfPayload::Call(call) => serde_json::to_string(call),
        }
        .unwrap_or_default();
        self.logger.info(format!(
            "[INF:{}-{}] [service:{}] {}",
            side.as_str(),
            kind.as_str(),
            service_id,
            rendered
        ));
    }
}

/// Check config: required `msg.head` fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequiredHeadCheckConfig {
    #[serde(default)]
    pub required_head_fields: Vec<String>,
}

impl RequiredHeadCheckConfig {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Gate rejecting standard-envelope requests whose head misses
/// required fields; the verdict becomes the response.
pub struct RequiredHeadInfCheck {
    config: RequiredHeadCheckConfig,
}

impl RequiredHeadInfCheck {
    pub fn new(config: RequiredHeadCheckConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl InfCheck for RequiredHeadInfCheck {
    async fn check(
        &self,
        request: &StdRequest,
        _service_config: &ServiceConfig,
    ) -> Option<StdResponse> {
        let head = request.msg.get("head");
        for field in &self.config.required_head_fields {
            let present = head
                .and_then(|h| h.get(field))
                .and_then(|v| v.as_str())
                .is_some_and(|s| !s.is_empty());
            if !present {
                return Some(StdResponse {
                    network: micra_core::message::ResponseNetwork { status: 400 },
                    headers: Default::default(),
                    msg: json!({
                        "head": {
                            "errCode": "10001",
                            "errMsg": format!("head field [{}] is required", field),
                        }
                    }),
                });
            }
        }
        None
    }
}
