//! Adapter contracts at the message seams: server-side and
//! caller-side codecs, interface logging, interface checks and the
//! serial number dependency of the standard-envelope codec.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{MicraError, Result};
use crate::message::{CallArgs, CallRequest, RawRequest, StdRequest, StdResponse, WireResponse};
use crate::service::{ResolvedInstance, ServiceConfig};

/// Bidirectional normalization between the hosting server's native
/// request/response objects and the standard message shape.
pub trait ServerFormatter: Send + Sync {
    /// Normalize the transport request; headers are lowercased, the
    /// query string parsed with the service's type mapping.
    fn format_request(
        &self,
        raw: &RawRequest,
        value_trans_mapping: Option<&HashMap<String, String>>,
    ) -> Result<StdRequest>;

    /// Normalize a handler return, merging protocol defaults.
    fn format_response(&self, request: Option<&StdRequest>, response: StdResponse) -> StdResponse;

    /// Canonical error envelope for a failed request.
    fn format_exception(
        &self,
        request: Option<&StdRequest>,
        error: &MicraError,
        service_config: &ServiceConfig,
    ) -> StdResponse;

    /// Serialize a standard response for the hosting server.
    fn to_wire(&self, response: &StdResponse) -> WireResponse;
}

/// Caller-side codec: builds outbound requests, executes the
/// transport, and normalizes local-call traffic through the same
/// shapes.
#[async_trait]
pub trait CallerFormatter: Send + Sync {
    async fn format_remote_call_request(
        &self,
        instance: &ResolvedInstance,
        request: CallRequest,
        call: &CallArgs,
    ) -> Result<CallRequest>;

    /// Execute the transport. Failures never surface as errors; they
    /// become error envelopes (`21007` pre-send, `31007` post-send).
    async fn call(
        &self,
        instance: &ResolvedInstance,
        std_request: &CallRequest,
        call: &CallArgs,
    ) -> StdResponse;

    async fn format_local_call_request(
        &self,
        instance: &ResolvedInstance,
        request: CallRequest,
        call: &CallArgs,
    ) -> Result<StdRequest>;

    async fn format_local_call_response(
        &self,
        response: StdResponse,
        std_request: &StdRequest,
        instance: &ResolvedInstance,
    ) -> StdResponse;

    async fn format_local_call_exception(
        &self,
        err_code: &str,
        err_msg: Option<&str>,
        error: &MicraError,
        std_request: Option<&StdRequest>,
        instance: &ResolvedInstance,
    ) -> StdResponse;
}

/// Which side of the wire an interface log entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSide {
    Server,
    Client,
}

impl LogSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSide::Server => "S",
            LogSide::Client => "C",
        }
    }
}

/// Request or response leg of an interface log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfKind {
    Request,
    Back,
}

impl InfKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfKind::Request => "R",
            InfKind::Back => "B",
        }
    }
}

/// The message being logged.
#[derive(Debug, Clone, Copy)]
pub enum InfPayload<'a> {
    Request(&'a StdRequest),
    Response(&'a StdResponse),
    /// Caller-side request before it goes over the wire.
    Call(&'a CallRequest),
}

/// Interface message logging adapter.
#[async_trait]
pub trait InfLogging: Send + Sync {
    async fn log(&self, side: LogSide, kind: InfKind, payload: InfPayload<'_>, service_id: &str);
}

/// Request gate. A non-null verdict short-circuits the pipeline and
/// becomes the response.
#[async_trait]
pub trait InfCheck: Send + Sync {
    async fn check(&self, request: &StdRequest, service_config: &ServiceConfig)
    -> Option<StdResponse>;
}

/// Monotonic per-id serial numbers for envelope sequence fields.
#[async_trait]
pub trait SerialNumberProvider: Send + Sync {
    async fn next(&self, id: &str) -> Result<u64>;

    /// Pre-fetch a batch so later `next` calls avoid round-trips.
    async fn cache_batch(&self, _id: &str, _batch_size: u64) -> Result<()> {
        Ok(())
    }
}
