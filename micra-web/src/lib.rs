//! Web layer of the micra runtime: the server adapter contract with
//! its axum implementation, the per-service request pipeline, the
//! server-side formatters and the interface logging/check adapters.

pub mod axum_server;
pub mod formatter;
pub mod inf;
pub mod pipeline;

pub use axum_server::{AxumWebServer, LifecycleFn, WebServer};
pub use formatter::{CommonServerFormatter, StdEnvelopeServerFormatter};
pub use inf::{CommonInfLogging, RequiredHeadCheckConfig, RequiredHeadInfCheck};
pub use pipeline::{ServicePipeline, wrap_service_handler};
