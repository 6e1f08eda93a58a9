use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use micra_core::adapter::AdapterManager;
use micra_core::logger::LoggerManager;
use micra_core::message::StdResponse;
use micra_core::plugin::{
    AdapterEntry, AdapterKind, AppIdentity, BuildContext, PluginDescriptor, PluginRegistry,
};
use micra_core::service::{ServiceConfig, handler_fn};
use micra_web::{AxumWebServer, CommonServerFormatter, LifecycleFn, WebServer};

fn adapter_manager() -> Arc<AdapterManager> {
    let registry = PluginRegistry::new();
    registry.register("common_server", |_, _, _| {
        Ok(AdapterEntry::ServerFormatter(Arc::new(CommonServerFormatter)))
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
            AdapterKind::ServerFormatter,
            "commonJson",
            &PluginDescriptor::named("common_server"),
        )
        .unwrap();
    manager
}

fn service_config(value: Value) -> Arc<ServiceConfig> {
    Arc::new(serde_json::from_value(value).unwrap())
}

async fn wait_for_addr(server: &AxumWebServer) -> std::net::SocketAddr {
    for _ in 0..100 {
        if let Some(addr) = server.bound_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server did not bind");
}

#[tokio::test]
async fn serves_registered_service_end_to_end() {
    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let started_flag = Arc::clone(&started);
    let stopped_flag = Arc::clone(&stopped);

    let after_start: LifecycleFn = Arc::new(move || {
        let started = Arc::clone(&started_flag);
        Box::pin(async move {
            started.store(true, Ordering::SeqCst);
            Ok(())
        })
    });
    let before_stop: LifecycleFn = Arc::new(move || {
        let stopped = Arc::clone(&stopped_flag);
        Box::pin(async move {
            stopped.store(true, Ordering::SeqCst);
            Ok(())
        })
    });
    let server = Arc::new(AxumWebServer::new(
        "mainServer",
        "demo-app",
        "127.0.0.1",
        0,
        adapter_manager(),
        None,
        Some(after_start),
        Some(before_stop),
    ));

    let config = service_config(json!({
        "service_name": "demoService",
        "uri": "/api/demo/<para1:string>/<para2:int>",
        "formater": "commonJson",
        "web_server": {"mainServer": {"methods": ["POST"]}},
    }));
    server
        .add_service(
            handler_fn(|request, call| async move {
                Ok(StdResponse {
                    msg: json!({
                        "code": "00000",
                        "args": call.args,
                        "kwargs": call.kwargs,
                        "echo": request.msg,
                    }),
                    ..Default::default()
                })
            }),
            "/api/demo/<para1:string>/<para2:int>",
            config,
        )
        .await
        .unwrap();

    let serve_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };
    let addr = wait_for_addr(&server).await;
    assert!(started.load(Ordering::SeqCst));

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/demo/p1/10?k=v", addr))
        .header("content-type", "application/json")
        .body(r#"{"msg_body": "hello"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], json!("00000"));
    assert_eq!(body["args"], json!(["p1", 10]));
    assert_eq!(body["kwargs"]["k"], json!("v"));
    assert_eq!(body["echo"]["msg_body"], json!("hello"));

    // Wrong method is rejected by the route registration.
    let response = client
        .get(format!("http://{}/api/demo/p1/10", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 405);

    server.stop();
    serve_handle.await.unwrap().unwrap();
    assert!(stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn handler_exception_served_as_envelope() {
    let server = Arc::new(AxumWebServer::new(
        "mainServer",
        "demo-app",
        "127.0.0.1",
        0,
        adapter_manager(),
        None,
        None,
        None,
    ));

    let config = service_config(json!({
        "service_name": "boomService",
        "uri": "/api/boom",
        "formater": "commonJson",
        "web_server": {"mainServer": {"methods": ["POST"]}},
    }));
    server
        .add_service(
            handler_fn(|_request, _call| async {
                Err(micra_core::MicraError::Handler("expected".to_string()))
            }),
            "/api/boom",
            config,
        )
        .await
        .unwrap();

    let serve_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };
    let addr = wait_for_addr(&server).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/boom", addr))
        .body("{}")
        .header("content-type", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["errCode"], json!("21599"));

    server.stop();
    serve_handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_after_start_aborts_boot() {
    let failing_after_start: LifecycleFn = Arc::new(|| {
        Box::pin(async {
            Err(micra_core::MicraError::Internal(
                "cluster register failed".to_string(),
            ))
        })
    });
    let server = Arc::new(AxumWebServer::new(
        "mainServer",
        "demo-app",
        "127.0.0.1",
        0,
        adapter_manager(),
        None,
        Some(failing_after_start),
        None,
    ));

    let result = server.start().await;
    assert!(result.is_err());
}
