use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A concrete service address as exchanged with the naming registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

impl Instance {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        let ip = ip.into();
        Self {
            instance_id: format!("{}:{}", ip, port),
            ip,
            port,
            metadata: HashMap::new(),
            healthy: true,
            weight: 1.0,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_serde() {
        let json = r#"{"ip":"10.0.0.1","port":8080}"#;
        let inst: Instance = serde_json::from_str(json).unwrap();
        assert!(inst.healthy);
        assert_eq!(inst.weight, 1.0);
        assert_eq!(inst.addr(), "10.0.0.1:8080");
    }

    #[test]
    fn new_derives_instance_id() {
        let inst = Instance::new("127.0.0.1", 9080);
        assert_eq!(inst.instance_id, "127.0.0.1:9080");
    }
}
