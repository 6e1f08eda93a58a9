use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use serde_json::{Value, json};

use micra_caller::{HttpCallerFormatter, HttpFormatterConfig, ServiceCaller};
use micra_core::adapter::AdapterManager;
use micra_core::instance::Instance;
use micra_core::logger::LoggerManager;
use micra_core::message::{CallArgs, CallRequest};
use micra_core::plugin::{
    AdapterEntry, AdapterKind, AppIdentity, BuildContext, PluginDescriptor, PluginRegistry,
};
use micra_core::service::{LocalService, RemoteServiceConfig, handler_fn};
use micra_naming::NamingRegistry;
use micra_trace::Tracer;

const FORMATTER_ID: &str = "httpCommon";

fn adapter_manager() -> Arc<AdapterManager> {
    let registry = PluginRegistry::new();
    registry.register("http_common_caller", |_, _, descriptor| {
        Ok(AdapterEntry::CallerFormatter(Arc::new(
            HttpCallerFormatter::new(HttpFormatterConfig::from_value(&descriptor.init)),
        )))
    });
    let manager = Arc::new(AdapterManager::new(Arc::new(registry)));

    let ctx = BuildContext {
        base_path: PathBuf::from("."),
        logger_manager: Arc::new(LoggerManager::new("logs")),
        identity: AppIdentity::default(),
    };
    manager
        .load(
            &ctx,
            AdapterKind::CallerFormatter,
            FORMATTER_ID,
            &PluginDescriptor::named("http_common_caller"),
        )
        .unwrap();
    manager
}

fn remote_config() -> RemoteServiceConfig {
    RemoteServiceConfig {
        formatter: Some(FORMATTER_ID.to_string()),
        uri: Some("api/demo".to_string()),
        ..Default::default()
    }
}

fn local_no_para_service() -> LocalService {
    LocalService {
        service_name: None,
        group_name: None,
        protocol: None,
        uri: Some("api/demo/no-para".to_string()),
        metadata: HashMap::new(),
        handler: handler_fn(|_req, _call| async {
            Ok(micra_core::message::StdResponse {
                msg: json!({"code": "00000", "fun": "main_func_no_para"}),
                ..Default::default()
            })
        }),
    }
}

#[tokio::test]
async fn local_call_no_params() {
    let caller = ServiceCaller::new(adapter_manager(), None, None, None);
    caller
        .add_remote_service("localDemoMainFuncNoPara", remote_config())
        .await
        .unwrap();
    caller.add_local_service("localDemoMainFuncNoPara", local_no_para_service());

    let request = CallRequest {
        msg: json!({"msg_body": "test main_func_no_para"}),
        ..Default::default()
    };
    let response = caller
        .async_call("localDemoMainFuncNoPara", request, CallArgs::default())
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.msg["code"], json!("00000"));
    assert_eq!(response.msg["fun"], json!("main_func_no_para"));
}

#[tokio::test]
async fn local_call_with_positional_args() {
    let caller = ServiceCaller::new(adapter_manager(), None, None, None);
    caller
        .add_remote_service("localDemoMainFuncWithArgs", remote_config())
        .await
        .unwrap();
    caller.add_local_service(
        "localDemoMainFuncWithArgs",
        LocalService {
            service_name: None,
            group_name: None,
            protocol: None,
            uri: Some("api/demo/with-args/<para1:string>/<para2:int>".to_string()),
            metadata: HashMap::new(),
            handler: handler_fn(|_req, call| async move {
                Ok(micra_core::message::StdResponse {
                    msg: json!({
                        "code": "00000",
                        "fun": "main_func_with_args",
                        "args": call.args,
                    }),
                    ..Default::default()
                })
            }),
        },
    );

    let response = caller
        .async_call(
            "localDemoMainFuncWithArgs",
            CallRequest::default(),
            CallArgs::positional(vec![json!("p1"), json!(10)]),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.msg["fun"], json!("main_func_with_args"));
    assert_eq!(response.msg["args"], json!(["p1", 10]));
}

#[tokio::test]
async fn local_handler_exception_becomes_21007() {
    let caller = ServiceCaller::new(adapter_manager(), None, None, None);
    caller
        .add_remote_service("localDemoMainFuncWithException", remote_config())
        .await
        .unwrap();
    caller.add_local_service(
        "localDemoMainFuncWithException",
        LocalService {
            service_name: None,
            group_name: None,
            protocol: None,
            uri: Some("api/demo/boom".to_string()),
            metadata: HashMap::new(),
            handler: handler_fn(|_req, _call| async {
                Err(micra_core::MicraError::Handler("expected failure".to_string()))
            }),
        },
    );

    let response = caller
        .async_call(
            "localDemoMainFuncWithException",
            CallRequest::default(),
            CallArgs::default(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    assert_eq!(response.msg["errCode"], json!("21007"));
}

#[tokio::test]
async fn unknown_service_id_raises() {
    let caller = ServiceCaller::new(adapter_manager(), None, None, None);
    let err = caller
        .async_call("nope", CallRequest::default(), CallArgs::default())
        .await
        .unwrap_err();
    assert!(matches!(err, micra_core::MicraError::ServiceNotFound(_)));
}

#[tokio::test]
async fn duplicate_remote_service_rejected() {
    let caller = ServiceCaller::new(adapter_manager(), None, None, None);
    caller.add_remote_service("dup", remote_config()).await.unwrap();
    let err = caller
        .add_remote_service("dup", remote_config())
        .await
        .unwrap_err();
    assert!(matches!(err, micra_core::MicraError::ServiceExists(_)));
}

// ── registry interaction ──

#[derive(Default)]
struct CountingNaming {
    lookups: AtomicUsize,
}

#[async_trait::async_trait]
impl NamingRegistry for CountingNaming {
    async fn add_instance(
        &self,
        _service_name: &str,
        _ip: &str,
        _port: u16,
        _group_name: Option<&str>,
        _metadata: Option<HashMap<String, Value>>,
        _extras: HashMap<String, Value>,
    ) -> bool {
        true
    }

    async fn remove_instance(
        &self,
        _service_name: &str,
        _group_name: Option<&str>,
        _ip: Option<&str>,
        _port: Option<u16>,
    ) -> bool {
        true
    }

    async fn list_instance(
        &self,
        _service_name: &str,
        _group_name: Option<&str>,
        _healthy_only: bool,
    ) -> micra_core::Result<Vec<Instance>> {
        Ok(Vec::new())
    }

    async fn get_instance(
        &self,
        _service_name: &str,
        _group_name: Option<&str>,
        _healthy_only: bool,
    ) -> micra_core::Result<Option<Instance>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    async fn add_subscribe(
        &self,
        _service_name: &str,
        _group_name: Option<&str>,
        _interval: Duration,
    ) {
    }

    async fn remove_subscribe(&self, _service_name: &str, _group_name: Option<&str>) {}
}

#[tokio::test]
async fn local_first_calls_skip_registry_lookup() {
    let naming = Arc::new(CountingNaming::default());
    let caller = ServiceCaller::new(
        adapter_manager(),
        None,
        Some(naming.clone() as Arc<dyn NamingRegistry>),
        None,
    );
    caller
        .add_remote_service("localFirst", remote_config())
        .await
        .unwrap();
    caller.add_local_service("localFirst", local_no_para_service());

    for _ in 0..2 {
        caller
            .async_call("localFirst", CallRequest::default(), CallArgs::default())
            .await
            .unwrap();
    }
    assert_eq!(naming.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn no_instance_from_registry_raises() {
    let naming = Arc::new(CountingNaming::default());
    let caller = ServiceCaller::new(
        adapter_manager(),
        None,
        Some(naming as Arc<dyn NamingRegistry>),
        None,
    );
    let config = RemoteServiceConfig {
        service_name: Some("remoteSvc".to_string()),
        ..remote_config()
    };
    caller.add_remote_service("remoteOnly", config).await.unwrap();

    let err = caller
        .async_call("remoteOnly", CallRequest::default(), CallArgs::default())
        .await
        .unwrap_err();
    assert!(matches!(err, micra_core::MicraError::NoEnableInstance { .. }));
}

// ── remote path against a real listener ──

async fn spawn_echo_server() -> SocketAddr {
    async fn with_args(
        Path((para1, para2)): Path<(String, i64)>,
    ) -> axum::Json<Value> {
        axum::Json(json!({
            "code": "00000",
            "fun": "main_func_with_args",
            "args": [para1, para2],
        }))
    }

    async fn boom() -> impl IntoResponse {
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"errCode": "21599"})),
        )
    }

    async fn echo_headers(headers: HeaderMap) -> axum::Json<Value> {
        let mut echoed = serde_json::Map::new();
        for (name, value) in &headers {
            echoed.insert(
                name.as_str().to_string(),
                json!(value.to_str().unwrap_or_default()),
            );
        }
        axum::Json(json!({"code": "00000", "headers": echoed}))
    }

    let router = Router::new()
        .route("/api/demo/{para1}/{para2}", post(with_args))
        .route("/api/boom", post(boom))
        .route("/api/echo-headers", post(echo_headers));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn fixed_remote(addr: SocketAddr, uri: &str) -> RemoteServiceConfig {
    RemoteServiceConfig {
        is_fixed_config: true,
        local_call_first: false,
        ip: Some(addr.ip().to_string()),
        port: Some(addr.port()),
        uri: Some(uri.to_string()),
        network: Some(
            [("method".to_string(), json!("POST"))]
                .into_iter()
                .collect(),
        ),
        ..remote_config()
    }
}

#[tokio::test]
async fn remote_call_with_positional_args() {
    let addr = spawn_echo_server().await;
    let caller = ServiceCaller::new(adapter_manager(), None, None, None);
    caller
        .add_remote_service(
            "remoteDemoMainFuncWithArgs",
            fixed_remote(addr, "api/demo/<para1:string>/<para2:int>"),
        )
        .await
        .unwrap();

    let response = caller
        .async_call(
            "remoteDemoMainFuncWithArgs",
            CallRequest::default(),
            CallArgs::positional(vec![json!("p1"), json!(10)]),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.msg["fun"], json!("main_func_with_args"));
    assert_eq!(response.msg["args"], json!(["p1", 10]));
}

#[tokio::test]
async fn remote_server_error_becomes_31007() {
    let addr = spawn_echo_server().await;
    let caller = ServiceCaller::new(adapter_manager(), None, None, None);
    caller
        .add_remote_service("remoteBoom", fixed_remote(addr, "api/boom"))
        .await
        .unwrap();

    let response = caller
        .async_call("remoteBoom", CallRequest::default(), CallArgs::default())
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    assert_eq!(response.msg["errCode"], json!("31007"));
}

#[tokio::test]
async fn remote_unreachable_becomes_post_send_error() {
    let caller = ServiceCaller::new(adapter_manager(), None, None, None);
    let config = RemoteServiceConfig {
        is_fixed_config: true,
        local_call_first: false,
        ip: Some("127.0.0.1".to_string()),
        // Reserved port nothing listens on.
        port: Some(9),
        uri: Some("api/x".to_string()),
        ..remote_config()
    };
    caller.add_remote_service("dead", config).await.unwrap();

    let response = caller
        .async_call("dead", CallRequest::default(), CallArgs::default())
        .await
        .unwrap();
    assert_eq!(response.msg["errCode"], json!("31007"));
}

#[tokio::test]
async fn tracer_context_injected_into_remote_headers() {
    let addr = spawn_echo_server().await;
    let tracer = Arc::new(Tracer::noop());
    let caller = ServiceCaller::new(adapter_manager(), Some(Arc::clone(&tracer)), None, None);

    let config = RemoteServiceConfig {
        enable_tracer: true,
        ..fixed_remote(addr, "api/echo-headers")
    };
    caller.add_remote_service("traced", config).await.unwrap();

    let response = Tracer::in_scope(async {
        let scope = tracer.start_active_span("caller_op", None, false);
        tracer.set_baggage("k", &json!("v"), None);
        let trace_id = scope.span().context().trace_id;
        let response = caller
            .async_call("traced", CallRequest::default(), CallArgs::default())
            .await
            .unwrap();
        scope.close();
        (trace_id, response)
    })
    .await;

    let (trace_id, response) = response;
    let headers = &response.msg["headers"];
    assert_eq!(headers["uberctx-k"], json!("v"));
    let trace_header = headers["uber-trace-id"].as_str().unwrap();
    assert!(trace_header.starts_with(&format!("{:032x}:", trace_id)));
}

#[tokio::test]
async fn settings_override_forces_remote_path() {
    let addr = spawn_echo_server().await;
    let caller = ServiceCaller::new(adapter_manager(), None, None, None);

    // Local handler present, but the per-call settings disable
    // local-first and point at the listener.
    caller
        .add_remote_service(
            "switchable",
            fixed_remote(addr, "api/demo/<para1:string>/<para2:int>"),
        )
        .await
        .unwrap();
    caller.add_local_service("switchable", local_no_para_service());

    let local = caller
        .async_call(
            "switchable",
            CallRequest::default(),
            CallArgs::positional(vec![json!("a"), json!(1)]),
        )
        .await
        .unwrap();
    assert_eq!(local.msg["fun"], json!("main_func_no_para"));

    let remote = caller
        .async_call_with_settings(
            "switchable",
            json!({"local_call_first": false}),
            CallRequest::default(),
            CallArgs::positional(vec![json!("a"), json!(1)]),
        )
        .await
        .unwrap();
    assert_eq!(remote.msg["fun"], json!("main_func_with_args"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_facade_blocks_on_the_async_call() {
    let caller = ServiceCaller::new(adapter_manager(), None, None, None);
    caller
        .add_remote_service("syncLocal", remote_config())
        .await
        .unwrap();
    caller.add_local_service("syncLocal", local_no_para_service());

    let response = caller
        .call("syncLocal", CallRequest::default(), CallArgs::default())
        .unwrap();
    assert_eq!(response.msg["fun"], json!("main_func_no_para"));
}
