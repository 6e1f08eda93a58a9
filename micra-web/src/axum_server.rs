//! Web server contract plus the axum-backed implementation hosting
//! the service pipelines.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{ConnectInfo, RawPathParams, Request};
use axum::routing::{MethodFilter, on};
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{error, info};

use micra_core::adapter::AdapterManager;
use micra_core::message::{RawRequest, uri_to_route};
use micra_core::service::{HandlerFn, ServiceConfig};
use micra_core::{MicraError, Result};
use micra_trace::Tracer;

use crate::pipeline::{ServicePipeline, into_axum_response};

/// Server lifecycle callback.
pub type LifecycleFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// HTTP listener hosting wrapped service handlers.
#[async_trait]
pub trait WebServer: Send + Sync {
    /// Register a handler under its route; the handler is wrapped
    /// with the full pipeline before exposure.
    async fn add_service(
        &self,
        handler: HandlerFn,
        service_uri: &str,
        service_config: Arc<ServiceConfig>,
    ) -> Result<()>;

    /// Serve until shutdown; runs `after_start` once listening and
    /// `before_stop` on the way down.
    async fn start(&self) -> Result<()>;

    /// Trigger graceful shutdown.
    fn stop(&self);
}

pub struct AxumWebServer {
    web_server_id: String,
    app_name: String,
    host: String,
    port: u16,
    manager: Arc<AdapterManager>,
    tracer: Option<Arc<Tracer>>,
    after_start: Option<LifecycleFn>,
    before_stop: Option<LifecycleFn>,
    router: std::sync::Mutex<Option<Router>>,
    shutdown: Arc<Notify>,
    bound: std::sync::Mutex<Option<SocketAddr>>,
}

impl AxumWebServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        web_server_id: impl Into<String>,
        app_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        manager: Arc<AdapterManager>,
        tracer: Option<Arc<Tracer>>,
        after_start: Option<LifecycleFn>,
        before_stop: Option<LifecycleFn>,
    ) -> Self {
        Self {
            web_server_id: web_server_id.into(),
            app_name: app_name.into(),
            host: host.into(),
            port,
            manager,
            tracer,
            after_start,
            before_stop,
            router: std::sync::Mutex::new(Some(Router::new())),
            shutdown: Arc::new(Notify::new()),
            bound: std::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.app_name
    }

    /// Address actually bound, once serving (port 0 resolves here).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap()
    }

    fn method_filter(method: &str) -> Option<MethodFilter> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(MethodFilter::GET),
            "POST" => Some(MethodFilter::POST),
            "PUT" => Some(MethodFilter::PUT),
            "DELETE" => Some(MethodFilter::DELETE),
            "PATCH" => Some(MethodFilter::PATCH),
            "HEAD" => Some(MethodFilter::HEAD),
            "OPTIONS" => Some(MethodFilter::OPTIONS),
            _ => None,
        }
    }
}

#[async_trait]
impl WebServer for AxumWebServer {
    async fn add_service(
        &self,
        handler: HandlerFn,
        service_uri: &str,
        service_config: Arc<ServiceConfig>,
    ) -> Result<()> {
        let service_id = service_config
            .service_name
            .clone()
            .unwrap_or_else(|| service_uri.to_string());
        let pipeline = Arc::new(ServicePipeline::build(
            &service_id,
            Arc::clone(&service_config),
            &self.manager,
            self.tracer.clone(),
            handler,
        ));

        let methods: Vec<String> = service_config
            .web_server
            .get(&self.web_server_id)
            .map(|w| w.methods.clone())
            .unwrap_or_else(|| vec!["GET".to_string()]);
        let mut filter: Option<MethodFilter> = None;
        for method in &methods {
            let Some(parsed) = Self::method_filter(method) else {
                return Err(MicraError::Internal(format!(
                    "unsupported http method [{}]",
                    method
                )));
            };
            filter = Some(match filter {
                Some(existing) => existing.or(parsed),
                None => parsed,
            });
        }
        let filter = filter.ok_or_else(|| {
            MicraError::Internal(format!("service [{}] lists no methods", service_id))
        })?;

        let route_handler = {
            let pipeline = Arc::clone(&pipeline);
            move |ConnectInfo(addr): ConnectInfo<SocketAddr>,
                  params: RawPathParams,
                  request: Request| {
                let pipeline = Arc::clone(&pipeline);
                async move {
                    let path_params: Vec<(String, String)> = params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();

                    let (parts, body) = request.into_parts();
                    let bytes = axum::body::to_bytes(body, usize::MAX)
                        .await
                        .unwrap_or_default();
                    let raw = RawRequest {
                        method: parts.method.to_string(),
                        host: parts
                            .headers
                            .get(http::header::HOST)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string(),
                        path: parts.uri.path().to_string(),
                        ip: addr.ip().to_string(),
                        port: addr.port(),
                        query_string: parts.uri.query().unwrap_or_default().to_string(),
                        url: parts.uri.to_string(),
                        headers: parts
                            .headers
                            .iter()
                            .map(|(k, v)| {
                                (k.to_string(), v.to_str().unwrap_or_default().to_string())
                            })
                            .collect(),
                        body: bytes,
                    };

                    into_axum_response(pipeline.handle(raw, &path_params).await)
                }
            }
        };

        let mut route = uri_to_route(service_uri);
        if !route.starts_with('/') {
            route = format!("/{}", route);
        }
        info!(
            service = %service_id,
            route = %route,
            methods = ?methods,
            "service registered on web server"
        );

        let mut router_slot = self.router.lock().unwrap();
        let router = router_slot.take().ok_or_else(|| {
            MicraError::Internal("web server already started".to_string())
        })?;
        *router_slot = Some(router.route(&route, on(filter, route_handler)));
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let router = self
            .router
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| MicraError::Internal("web server already started".to_string()))?;

        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        *self.bound.lock().unwrap() = Some(addr);
        info!(app = %self.app_name, addr = %addr, "web server listening");

        // Boot is aborted when the after-start hook fails (cluster
        // registration is wired through it).
        if let Some(after_start) = &self.after_start {
            after_start().await?;
        }

        let shutdown = Arc::clone(&self.shutdown);
        let serve_result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        })
        .await;

        if let Some(before_stop) = &self.before_stop {
            if let Err(e) = before_stop().await {
                error!(error = %e, "before-stop hook failed");
            }
        }
        info!(app = %self.app_name, "web server stopped");

        serve_result.map_err(MicraError::from)
    }

    fn stop(&self) {
        // notify_one keeps a permit, so a stop issued before the
        // shutdown future is polled still lands.
        self.shutdown.notify_one();
    }
}
