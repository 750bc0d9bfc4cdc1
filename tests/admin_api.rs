//! End-to-end admin surface over a live single-process server

use std::sync::Arc;
use std::time::Duration;
use swarmgate::orchestrator::Orchestrator;
use swarmgate::Config;

async fn running_server() -> (Arc<Orchestrator>, String) {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;

    let orchestrator = Orchestrator::new(config);
    let runner = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    orchestrator.wait_for_ready().await;
    let addr = orchestrator.local_addr().await.unwrap();
    (orchestrator, format!("http://{}", addr))
}

#[tokio::test]
async fn plugin_lifecycle_over_http() {
    let (orchestrator, base) = running_server().await;
    let client = reqwest::Client::new();

    // Register a monitoring plugin
    let response = client
        .post(format!("{}/plugins/register", base))
        .json(&serde_json::json!({
            "pluginConfig": {
                "id": "request-counter",
                "name": "Request Counter",
                "version": "1.2.0",
                "type": "monitoring"
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], serde_json::json!(true));

    // Duplicate registration conflicts
    let response = client
        .post(format!("{}/plugins/register", base))
        .json(&serde_json::json!({
            "pluginConfig": {
                "id": "request-counter",
                "name": "Request Counter",
                "version": "1.2.0",
                "type": "monitoring"
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    // Disallowed type is forbidden
    let response = client
        .post(format!("{}/plugins/register", base))
        .json(&serde_json::json!({
            "pluginConfig": {
                "id": "sneaky-security",
                "name": "Sneaky",
                "version": "1.0.0",
                "type": "security"
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Drive one request through the server so the plugin chain runs
    let response = client
        .get(format!("{}/does-not-exist", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Stats reflect the invocation
    tokio::time::sleep(Duration::from_millis(100)).await;
    let response = client
        .get(format!("{}/plugins/request-counter/stats", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["pluginId"], serde_json::json!("request-counter"));
    assert!(body["stats"]["invocations"].as_u64().unwrap() >= 1);

    // Registry health lists the plugin
    let response = client
        .get(format!("{}/health/plugins", base))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body["plugins"]["registry"]["total_plugins"],
        serde_json::json!(1)
    );

    // Unregister removes it from future chains
    let response = client
        .delete(format!("{}/plugins/request-counter", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{}/plugins/request-counter/stats", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    orchestrator.shutdown();
}

#[tokio::test]
async fn health_endpoint_reports_worker_identity() {
    let (orchestrator, base) = running_server().await;

    let response = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], serde_json::json!("ok"));
    assert_eq!(body["worker"], serde_json::json!("single"));

    orchestrator.shutdown();
}
