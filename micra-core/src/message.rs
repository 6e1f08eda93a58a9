//! Standard request/response shapes exchanged between the web layer,
//! the handler pipeline and the caller. Formatters translate between
//! these and whatever the transport speaks.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Case-insensitive header map; keys are lowercased on insert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `self` under `other`: keys present in `other` win.
    pub fn merged_under(&self, other: &Headers) -> Headers {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }
}

impl<S: AsRef<str>, V: Into<String>> FromIterator<(S, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (S, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Network side of a standard request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub query: HashMap<String, Value>,
    #[serde(default)]
    pub url: String,
}

/// Standard request handed to every service handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StdRequest {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub msg: Value,
}

/// Network side of a standard response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseNetwork {
    #[serde(default = "default_status")]
    pub status: u16,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponseNetwork {
    fn default() -> Self {
        Self { status: 200 }
    }
}

/// Standard response returned by handlers and the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StdResponse {
    #[serde(default)]
    pub network: ResponseNetwork,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub msg: Value,
}

impl StdResponse {
    pub fn with_status(status: u16) -> Self {
        Self {
            network: ResponseNetwork { status },
            ..Default::default()
        }
    }

    pub fn status(&self) -> u16 {
        self.network.status
    }
}

/// Transport-neutral inbound request, produced by the web adapter
/// before any formatter runs.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub method: String,
    pub host: String,
    pub path: String,
    pub ip: String,
    pub port: u16,
    pub query_string: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Transport-neutral outbound response, consumed by the web adapter.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Loose request shape accepted by the caller; missing parts are
/// filled from service defaults and instance metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub network: HashMap<String, Value>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub msg: Value,
}

/// Positional and named arguments flowing into a handler alongside
/// the standard request.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
}

impl CallArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: HashMap::new(),
        }
    }
}

/// Parse a query string into a typed value map.
///
/// `value_trans_mapping` maps parameter names to a coercion: `int`,
/// `number`, `bool`; everything else stays a string. Parameters
/// without `=` or without a name are skipped.
pub fn parse_query(
    query_string: &str,
    value_trans_mapping: Option<&HashMap<String, String>>,
) -> HashMap<String, Value> {
    let mut query = HashMap::new();
    if query_string.is_empty() {
        return query;
    }

    for param in query_string.split('&') {
        if param.is_empty() {
            continue;
        }
        let Some(eq) = param.find('=') else { continue };
        if eq == 0 {
            continue;
        }
        let name = &param[..eq];
        let raw = &param[eq + 1..];
        let value = match value_trans_mapping.and_then(|m| m.get(name)).map(|s| s.as_str()) {
            Some("int") => raw
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            Some("number") => raw
                .parse::<f64>()
                .ok()
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .unwrap_or_else(|| Value::String(raw.to_string())),
            Some("bool") => raw
                .parse::<bool>()
                .map(Value::Bool)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            _ => Value::String(raw.to_string()),
        };
        query.insert(name.to_string(), value);
    }

    query
}

fn value_to_path_segment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute `<name:type>` placeholders in a uri by position from
/// `args`, then append `kwargs` as a query string.
pub fn format_uri(uri: &str, args: &[Value], kwargs: Option<&HashMap<String, Value>>) -> String {
    let mut url = uri.to_string();
    if !args.is_empty() {
        let mut pos = 0usize;
        let segments: Vec<String> = uri
            .split('/')
            .map(|seg| {
                if seg.starts_with('<') && seg.ends_with('>') && pos < args.len() {
                    let filled = value_to_path_segment(&args[pos]);
                    pos += 1;
                    filled
                } else {
                    seg.to_string()
                }
            })
            .collect();
        url = segments.join("/");
    }

    if let Some(kwargs) = kwargs
        && !kwargs.is_empty()
    {
        let mut pairs: Vec<String> = kwargs
            .iter()
            .map(|(k, v)| format!("{}={}", k, value_to_path_segment(v)))
            .collect();
        pairs.sort();
        url = format!("{}?{}", url, pairs.join("&"));
    }

    url
}

/// Ordered `(name, type)` specs of the `<name:type>` placeholders in
/// a uri template; the type defaults to `string`.
pub fn uri_param_specs(uri: &str) -> Vec<(String, String)> {
    uri.split('/')
        .filter(|seg| seg.starts_with('<') && seg.ends_with('>'))
        .map(|seg| {
            let inner = &seg[1..seg.len() - 1];
            match inner.split_once(':') {
                Some((name, kind)) => (name.to_string(), kind.to_string()),
                None => (inner.to_string(), "string".to_string()),
            }
        })
        .collect()
}

/// Coerce a raw path value per a uri template type.
pub fn coerce_path_value(raw: &str, kind: &str) -> Value {
    match kind {
        "int" => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        "number" => raw
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| Value::String(raw.to_string())),
        _ => Value::String(raw.to_string()),
    }
}

/// Rewrite `<name:type>` placeholders to `{name}` axum path params.
pub fn uri_to_route(uri: &str) -> String {
    uri.split('/')
        .map(|seg| {
            if seg.starts_with('<') && seg.ends_with('>') {
                let inner = &seg[1..seg.len() - 1];
                let name = inner.split(':').next().unwrap_or(inner);
                format!("{{{}}}", name)
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
