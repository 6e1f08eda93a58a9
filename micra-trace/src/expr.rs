//! Field expression language used by trace options to pull values
//! from inputs and outputs: `const:V`, `name:`, `short_name:`,
//! `args:N`, `kwargs:K`, `network:K`, `head:K`, `json:P`.

use std::collections::HashMap;

use serde_json::Value;

use micra_core::message::{CallArgs, StdRequest, StdResponse};

/// Parsed field expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldExpr {
    Const(String),
    Name,
    ShortName,
    Args(usize),
    Kwargs(String),
    Network(String),
    Head(String),
    Json(String),
}

impl FieldExpr {
    /// Parse `type:para`; a missing type means a constant.
    pub fn parse(expr: &str) -> FieldExpr {
        let Some(colon) = expr.find(':') else {
            return FieldExpr::Const(expr.trim().to_string());
        };
        if colon == 0 {
            return FieldExpr::Const(expr[1..].trim().to_string());
        }
        let kind = expr[..colon].trim();
        let para = expr[colon + 1..].trim();
        match kind {
            "const" => FieldExpr::Const(para.to_string()),
            "name" => FieldExpr::Name,
            "short_name" => FieldExpr::ShortName,
            "args" => para
                .parse::<usize>()
                .map(FieldExpr::Args)
                .unwrap_or_else(|_| FieldExpr::Const(String::new())),
            "kwargs" => FieldExpr::Kwargs(para.to_string()),
            "network" => FieldExpr::Network(para.to_string()),
            "head" => FieldExpr::Head(para.to_string()),
            "json" => FieldExpr::Json(para.to_string()),
            _ => FieldExpr::Const(String::new()),
        }
    }
}

/// Invocation record the request-side expressions evaluate against.
#[derive(Debug, Clone, Default)]
pub struct MethodInfo {
    pub name: String,
    pub short_name: String,
    pub request: Option<StdRequest>,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
}

impl MethodInfo {
    pub fn from_call(name: &str, request: &StdRequest, call: &CallArgs) -> Self {
        let short_name = name.rsplit('.').next().unwrap_or(name).to_string();
        Self {
            name: name.to_string(),
            short_name,
            request: Some(request.clone()),
            args: call.args.clone(),
            kwargs: call.kwargs.clone(),
        }
    }
}

/// Evaluate a request-side expression.
pub fn eval_request(expr: &FieldExpr, info: &MethodInfo) -> Option<Value> {
    match expr {
        FieldExpr::Const(v) => {
            if v.is_empty() {
                None
            } else {
                Some(Value::String(v.clone()))
            }
        }
        FieldExpr::Name => Some(Value::String(info.name.clone())),
        FieldExpr::ShortName => Some(Value::String(info.short_name.clone())),
        FieldExpr::Args(i) => info.args.get(*i).cloned(),
        FieldExpr::Kwargs(k) => info.kwargs.get(k).cloned(),
        FieldExpr::Network(k) => {
            let request = info.request.as_ref()?;
            network_field(request, k)
        }
        FieldExpr::Head(k) => {
            let request = info.request.as_ref()?;
            request
                .headers
                .get(k)
                .map(|v| Value::String(v.to_string()))
        }
        FieldExpr::Json(path) => json_path(&info.request.as_ref()?.msg, path),
    }
}

/// Evaluate a response-side expression.
pub fn eval_response(expr: &FieldExpr, response: &StdResponse) -> Option<Value> {
    match expr {
        FieldExpr::Const(v) => {
            if v.is_empty() {
                None
            } else {
                Some(Value::String(v.clone()))
            }
        }
        FieldExpr::Network(k) => match k.as_str() {
            "status" => Some(Value::from(response.network.status)),
            _ => None,
        },
        FieldExpr::Head(k) => response
            .headers
            .get(k)
            .map(|v| Value::String(v.to_string())),
        FieldExpr::Json(path) => json_path(&response.msg, path),
        _ => None,
    }
}

fn network_field(request: &StdRequest, key: &str) -> Option<Value> {
    match key {
        "method" => Some(Value::String(request.network.method.clone())),
        "host" => Some(Value::String(request.network.host.clone())),
        "path" => Some(Value::String(request.network.path.clone())),
        "ip" => Some(Value::String(request.network.ip.clone())),
        "port" => Some(Value::from(request.network.port)),
        "url" => Some(Value::String(request.network.url.clone())),
        other => request.network.query.get(other).cloned(),
    }
}

/// Minimal JSON-path resolver: `$.a.b[0].c` against a value; string
/// payloads are parsed as JSON first.
pub fn json_path(msg: &Value, path: &str) -> Option<Value> {
    let owned;
    let mut current = match msg {
        Value::String(s) => {
            owned = serde_json::from_str::<Value>(s).ok()?;
            &owned
        }
        other => other,
    };

    let path = path.trim_start_matches('$');
    for raw in path.split('.') {
        if raw.is_empty() {
            continue;
        }
        let mut segment = raw;
        let mut indexes = Vec::new();
        while let Some(open) = segment.find('[') {
            if !segment.ends_with(']') {
                break;
            }
            let inner = &segment[open + 1..segment.len() - 1];
            // Only the innermost bracket pair per segment is used.
            indexes.push(inner.parse::<usize>().ok()?);
            segment = &segment[..open];
        }
        if !segment.is_empty() {
            current = current.get(segment)?;
        }
        for index in indexes {
            current = current.get(index)?;
        }
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_info() -> MethodInfo {
        let request = StdRequest {
            headers: [("x-user", "u1")].into_iter().collect(),
            msg: json!({"head": {"tranCode": "T001"}, "body": {"items": [{"id": 7}]}}),
            ..Default::default()
        };
        MethodInfo {
            name: "demo.main_func".into(),
            short_name: "main_func".into(),
            request: Some(request),
            args: vec![json!("p1"), json!(10)],
            kwargs: [("k".to_string(), json!("v"))].into_iter().collect(),
        }
    }

    #[test]
    fn parse_variants() {
        assert_eq!(FieldExpr::parse("const:MyName"), FieldExpr::Const("MyName".into()));
        assert_eq!(FieldExpr::parse("name:"), FieldExpr::Name);
        assert_eq!(FieldExpr::parse("short_name:"), FieldExpr::ShortName);
        assert_eq!(FieldExpr::parse("args:1"), FieldExpr::Args(1));
        assert_eq!(FieldExpr::parse("kwargs:k"), FieldExpr::Kwargs("k".into()));
        assert_eq!(FieldExpr::parse("plain"), FieldExpr::Const("plain".into()));
        assert_eq!(FieldExpr::parse(":rest"), FieldExpr::Const("rest".into()));
    }

    #[test]
    fn eval_request_variants() {
        let info = sample_info();
        assert_eq!(
            eval_request(&FieldExpr::parse("name:"), &info),
            Some(json!("demo.main_func"))
        );
        assert_eq!(
            eval_request(&FieldExpr::parse("short_name:"), &info),
            Some(json!("main_func"))
        );
        assert_eq!(eval_request(&FieldExpr::parse("args:0"), &info), Some(json!("p1")));
        assert_eq!(eval_request(&FieldExpr::parse("kwargs:k"), &info), Some(json!("v")));
        assert_eq!(
            eval_request(&FieldExpr::parse("head:X-User"), &info),
            Some(json!("u1"))
        );
        assert_eq!(
            eval_request(&FieldExpr::parse("json:$.head.tranCode"), &info),
            Some(json!("T001"))
        );
        assert_eq!(
            eval_request(&FieldExpr::parse("json:$.body.items[0].id"), &info),
            Some(json!(7))
        );
        assert_eq!(eval_request(&FieldExpr::parse("json:$.missing"), &info), None);
    }

    #[test]
    fn eval_response_variants() {
        let response = StdResponse {
            msg: json!({"head": {"errCode": "00000"}}),
            ..Default::default()
        };
        assert_eq!(
            eval_response(&FieldExpr::parse("network:status"), &response),
            Some(json!(200))
        );
        assert_eq!(
            eval_response(&FieldExpr::parse("json:$.head.errCode"), &response),
            Some(json!("00000"))
        );
    }

    #[test]
    fn json_path_parses_string_payloads() {
        let msg = json!(r#"{"a": {"b": 2}}"#);
        assert_eq!(json_path(&msg, "$.a.b"), Some(json!(2)));
    }
}
