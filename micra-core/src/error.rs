use thiserror::Error;

/// Unified error type for the micra runtime.
#[derive(Error, Debug)]
pub enum MicraError {
    #[error("Config missing: {0}")]
    ConfigMissing(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Adapter load failure: {0}")]
    AdapterLoadFailure(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service id exists: {0}")]
    ServiceExists(String),

    #[error("No enabled instance of service [{service_name}] for id [{service_id}]")]
    NoEnableInstance {
        service_id: String,
        service_name: String,
    },

    #[error("Transport pre-send failure: {0}")]
    TransportPreSend(String),

    #[error("Transport post-send failure: {0}")]
    TransportPostSend(String),

    #[error("Handler failure: {0}")]
    Handler(String),

    #[error("Cluster event target not accepting events: {0}")]
    EventEmitUnreachable(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

/// Interface error codes preserved on the wire.
pub mod err_code {
    /// Success.
    pub const SUCCESS: &str = "00000";
    /// Caller failure before the request went out.
    pub const PRE_SEND: &str = "21007";
    /// Transport started but failed.
    pub const POST_SEND: &str = "31007";
    /// Unhandled exception inside a service handler.
    pub const HANDLER: &str = "21599";
}

impl MicraError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            MicraError::ServiceNotFound(_) => 404,
            MicraError::NoEnableInstance { .. } => 503,
            MicraError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Interface error code for the standard envelope.
    pub fn err_code(&self) -> &'static str {
        match self {
            MicraError::TransportPreSend(_) => err_code::PRE_SEND,
            MicraError::TransportPostSend(_) => err_code::POST_SEND,
            _ => err_code::HANDLER,
        }
    }
}

pub type Result<T> = std::result::Result<T, MicraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(MicraError::ServiceNotFound("x".into()).status_code(), 404);
        assert_eq!(
            MicraError::NoEnableInstance {
                service_id: "a".into(),
                service_name: "b".into()
            }
            .status_code(),
            503
        );
        assert_eq!(MicraError::Handler("x".into()).status_code(), 500);
        assert_eq!(MicraError::Timeout("x".into()).status_code(), 504);
    }

    #[test]
    fn test_err_codes() {
        assert_eq!(MicraError::TransportPreSend("x".into()).err_code(), "21007");
        assert_eq!(MicraError::TransportPostSend("x".into()).err_code(), "31007");
        assert_eq!(MicraError::Handler("x".into()).err_code(), "21599");
        assert_eq!(MicraError::Internal("x".into()).err_code(), "21599");
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            MicraError::ServiceNotFound("svc1".into()).to_string(),
            "Service not found: svc1"
        );
        assert_eq!(
            MicraError::NoEnableInstance {
                service_id: "id1".into(),
                service_name: "name1".into()
            }
            .to_string(),
            "No enabled instance of service [name1] for id [id1]"
        );
    }
}
