//! Server-side formatters: the common JSON codec and the
//! standard-envelope codec with its synthesized response head.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use micra_core::formatter::ServerFormatter;
use micra_core::message::{
    Headers, Network, RawRequest, StdRequest, StdResponse, WireResponse, parse_query,
};
use micra_core::plugin::AppIdentity;
use micra_core::service::ServiceConfig;
use micra_core::{MicraError, Result, err_code};

const JSON_CONTENT_TYPE: &str = "application/json;charset:utf-8;";

fn raw_to_network(
    raw: &RawRequest,
    value_trans_mapping: Option<&HashMap<String, String>>,
) -> Network {
    Network {
        method: raw.method.clone(),
        host: raw.host.clone(),
        path: raw.path.clone(),
        ip: raw.ip.clone(),
        port: raw.port,
        query: parse_query(&raw.query_string, value_trans_mapping),
        url: raw.url.clone(),
    }
}

fn raw_headers(raw: &RawRequest) -> Headers {
    raw.headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect()
}

fn wire_body(msg: &Value) -> bytes::Bytes {
    match msg {
        Value::Null => bytes::Bytes::new(),
        Value::String(s) => bytes::Bytes::from(s.clone().into_bytes()),
        other => bytes::Bytes::from(serde_json::to_vec(other).unwrap_or_default()),
    }
}

fn to_wire_json(response: &StdResponse) -> WireResponse {
    let mut headers: Vec<(String, String)> = response
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !response.headers.contains("content-type") {
        headers.push(("content-type".to_string(), JSON_CONTENT_TYPE.to_string()));
    }
    WireResponse {
        status: response.status(),
        headers,
        body: wire_body(&response.msg),
    }
}

/// Common codec: JSON body when declared, raw text otherwise; errors
/// surface as a flat `{errCode, errMsg}` object.
pub struct CommonServerFormatter;

impl ServerFormatter for CommonServerFormatter {
    fn format_request(
        &self,
        raw: &RawRequest,
        value_trans_mapping: Option<&HashMap<String, String>>,
    ) -> Result<StdRequest> {
        let headers = raw_headers(raw);
        let msg = if raw.body.is_empty() {
            Value::Null
        } else if headers
            .get("content-type")
            .is_some_and(|ct| ct.starts_with("application/json"))
        {
            serde_json::from_slice(&raw.body)?
        } else {
            Value::String(String::from_utf8_lossy(&raw.body).into_owned())
        };

        Ok(StdRequest {
            network: raw_to_network(raw, value_trans_mapping),
            headers,
            msg,
        })
    }

    fn format_response(&self, _request: Option<&StdRequest>, response: StdResponse) -> StdResponse {
        response
    }

    fn format_exception(
        &self,
        _request: Option<&StdRequest>,
        _error: &MicraError,
        _service_config: &ServiceConfig,
    ) -> StdResponse {
        StdResponse {
            network: micra_core::message::ResponseNetwork { status: 500 },
            headers: [("content-type", JSON_CONTENT_TYPE)].into_iter().collect(),
            msg: json!({
                "errCode": err_code::HANDLER,
                "errMsg": "other application failure",
            }),
        }
    }

    fn to_wire(&self, response: &StdResponse) -> WireResponse {
        to_wire_json(response)
    }
}

/// Standard-envelope codec: requests are `{head, body}` JSON; the
/// response head echoes request fields and carries the error code.
pub struct StdEnvelopeServerFormatter {
    identity: AppIdentity,
}

impl StdEnvelopeServerFormatter {
    pub fn new(identity: AppIdentity) -> Self {
        Self { identity }
    }

    fn response_head(&self, request: Option<&StdRequest>) -> Map<String, Value> {
        let req_head = request
            .map(|r| r.msg.get("head").cloned().unwrap_or(json!({})))
            .unwrap_or(json!({}));
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
}

impl ServerFormatter for StdEnvelopeServerFormatter {
    fn format_request(
        &self,
        raw: &RawRequest,
        value_trans_mapping: Option<&HashMap<String, String>>,
    ) -> Result<StdRequest> {
        let msg = if raw.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&raw.body)?
        };
        Ok(StdRequest {
            network: raw_to_network(raw, value_trans_mapping),
            headers: raw_headers(raw),
            msg,
        })
    }

    fn format_response(&self, request: Option<&StdRequest>, response: StdResponse) -> StdResponse {
        let mut head = self.response_head(request);
        if let Some(Value::Object(resp_head)) = response.msg.get("head").cloned() {
            for (k, v) in resp_head {
                head.insert(k, v);
            }
        }

        let mut msg = Map::new();
        msg.insert("head".to_string(), Value::Object(head));
        if let Some(body) = response.msg.get("body")
            && !body.is_null()
        {
            msg.insert("body".to_string(), body.clone());
        }

        let mut headers: Headers = [("content-type", JSON_CONTENT_TYPE)].into_iter().collect();
        headers = headers.merged_under(&response.headers);

        StdResponse {
            network: response.network,
            headers,
            msg: Value::Object(msg),
        }
    }

    fn format_exception(
        &self,
        request: Option<&StdRequest>,
        _error: &MicraError,
        service_config: &ServiceConfig,
    ) -> StdResponse {
        let mut head = self.response_head(request);
        let sys = service_config
            .sys_id
            .clone()
            .unwrap_or_else(|| self.identity.sys_id.clone());
        let module = service_config
            .module_id
            .clone()
            .unwrap_or_else(|| self.identity.module_id.clone());
        head.insert("errCode".to_string(), json!(err_code::HANDLER));
        head.insert("errMsg".to_string(), json!("other application failure"));
        head.insert("errModule".to_string(), json!(format!("{}-{}", sys, module)));

        StdResponse {
            network: micra_core::message::ResponseNetwork { status: 200 },
            headers: [("content-type", JSON_CONTENT_TYPE)].into_iter().collect(),
            msg: json!({"head": Value::Object(head)}),
        }
    }

    fn to_wire(&self, response: &StdResponse) -> WireResponse {
        to_wire_json(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn raw(body: &str, content_type: &str) -> RawRequest {
        RawRequest {
            method: "POST".to_string(),
            host: "127.0.0.1:8080".to_string(),
            path: "/api/demo".to_string(),
            ip: "10.0.0.5".to_string(),
            port: 41000,
            query_string: "a=1&n=2".to_string(),
            url: "http://127.0.0.1:8080/api/demo?a=1&n=2".to_string(),
            headers: vec![
                ("Content-Type".to_string(), content_type.to_string()),
                ("X-User".to_string(), "u1".to_string()),
            ],
            body: Bytes::from(body.to_string().into_bytes()),
        }
    }

    #[test]
    fn common_request_normalization() {
        let formatter = CommonServerFormatter;
        let mapping: HashMap<String, String> =
            [("n".to_string(), "int".to_string())].into_iter().collect();
        let request = formatter
            .format_request(&raw(r#"{"k": 1}"#, "application/json"), Some(&mapping))
            .unwrap();
        assert_eq!(request.network.method, "POST");
        assert_eq!(request.network.query["a"], json!("1"));
        assert_eq!(request.network.query["n"], json!(2));
        // Headers lowercased on ingress.
        assert_eq!(request.headers.get("x-user"), Some("u1"));
        assert_eq!(request.msg["k"], json!(1));
    }

    #[test]
    fn common_request_non_json_body_stays_text() {
        let formatter = CommonServerFormatter;
        let request = formatter.format_request(&raw("plain text", "text/plain"), None).unwrap();
        assert_eq!(request.msg, json!("plain text"));
    }

    #[test]
    fn common_malformed_json_is_an_error() {
        let formatter = CommonServerFormatter;
        let result = formatter.format_request(&raw("{broken", "application/json"), None);
        assert!(result.is_err());
    }

    #[test]
    fn common_exception_envelope() {
        let formatter = CommonServerFormatter;
        let response = formatter.format_exception(
            None,
            &MicraError::Handler("x".to_string()),
            &ServiceConfig::default(),
        );
        assert_eq!(response.status(), 500);
        assert_eq!(response.msg["errCode"], json!("21599"));
    }

    fn identity() -> AppIdentity {
        AppIdentity {
            sys_id: "S0001".to_string(),
            module_id: "001".to_string(),
            server_id: "01".to_string(),
            app_name: "demo".to_string(),
        }
    }

    fn std_request_with_head() -> StdRequest {
        StdRequest {
            msg: json!({"head": {
                "tranCode": "T9", "originSysId": "X-1", "globSeqNum": "G1",
            }, "body": {}}),
            ..Default::default()
        }
    }

    #[test]
    fn std_response_head_echoes_request() {
        let formatter = StdEnvelopeServerFormatter::new(identity());
        let response = StdResponse {
            msg: json!({"head": {"errCode": "00000"}, "body": {"fun": "f"}}),
            ..Default::default()
        };
        let formatted = formatter.format_response(Some(&std_request_with_head()), response);
        let head = &formatted.msg["head"];
        assert_eq!(head["tranCode"], json!("T9"));
        assert_eq!(head["originSysId"], json!("X-1"));
        assert_eq!(head["infType"], json!("02"));
        assert_eq!(head["errCode"], json!("00000"));
        assert_eq!(formatted.msg["body"]["fun"], json!("f"));
        assert_eq!(formatted.status(), 200);
    }

    #[test]
    fn std_exception_envelope_has_module() {
        let formatter = StdEnvelopeServerFormatter::new(identity());
        let config: ServiceConfig =
            serde_json::from_value(json!({"sys_id": "S0002", "module_id": "007"})).unwrap();
        let response = formatter.format_exception(
            Some(&std_request_with_head()),
            &MicraError::Handler("x".to_string()),
            &config,
        );
        assert_eq!(response.status(), 200);
        let head = &response.msg["head"];
        assert_eq!(head["errCode"], json!("21599"));
        assert_eq!(head["errModule"], json!("S0002-007"));
        assert_eq!(head["tranCode"], json!("T9"));
    }

    #[test]
    fn wire_serialization_defaults_content_type() {
        let formatter = CommonServerFormatter;
        let wire = formatter.to_wire(&StdResponse {
            msg: json!({"a": 1}),
            ..Default::default()
        });
        assert_eq!(wire.status, 200);
        assert!(
            wire.headers
                .iter()
                .any(|(k, v)| k == "content-type" && v.starts_with("application/json"))
        );
        assert_eq!(wire.body.as_ref(), br#"{"a":1}"#);
    }
}
