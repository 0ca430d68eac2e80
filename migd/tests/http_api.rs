use std::sync::Arc;
use std::time::Duration;

use common::{HandshakeMessage, PodRecord};
use migd::api::create_router;
use migd::fake::{ClusterCall, FakeCluster, ScriptedAgents};
use migd::orchestrator::{Orchestrator, OrchestratorSettings};
use migd::registry::PodRegistry;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::net::TcpListener;

async fn serve(cluster: FakeCluster) -> (String, Arc<PodRegistry>) {
    serve_with(
        cluster,
        ScriptedAgents::pushing(2),
        Duration::from_millis(200),
    )
    .await
}

async fn serve_with(
    cluster: FakeCluster,
    agents: ScriptedAgents,
    registration_timeout: Duration,
) -> (String, Arc<PodRegistry>) {
    let registry = Arc::new(PodRegistry::new());
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::new(cluster),
        Arc::new(agents),
        OrchestratorSettings {
            label: "mig-ready:true".to_string(),
            transfer_port: 2486,
            registration_timeout,
            push_timeout: Duration::from_secs(30),
        },
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, create_router(orchestrator))
            .await
            .unwrap();
    });
    (base, registry)
}

#[tokio::test]
async fn test_register_returns_created_then_ok() {
    let (base, _) = serve(FakeCluster::new()).await;
    let client = reqwest::Client::new();
    let msg = HandshakeMessage::register("web", "10.0.0.5");

    let resp = client
        .post(format!("{base}/register"))
        .json(&msg)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let record: PodRecord = resp.json().await.unwrap();
    assert_eq!(record.name, "web");
    assert!(!record.migration);

    let resp = client
        .post(format!("{base}/register"))
        .json(&msg)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let reply: HandshakeMessage = resp.json().await.unwrap();
    assert!(!reply.is_new);

    let pods: Vec<PodRecord> = client
        .get(format!("{base}/pods"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pods.len(), 1);
}

#[tokio::test]
async fn test_migrate_unknown_pod_is_not_found() {
    let cluster = FakeCluster::new();
    let (base, _) = serve(cluster.clone()).await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/migrate/ghost/node-a/node-b"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn test_failed_step_is_bad_gateway() {
    let cluster = FakeCluster::new().with_deployment("web", 1);
    cluster.fail_on("scale");
    let (base, registry) = serve(cluster).await;
    registry
        .register(HandshakeMessage::register("web", "10.0.0.5"))
        .await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/migrate/web/node-a/node-b"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["retryable"], true);
    assert_eq!(
        body["compensated"],
        serde_json::json!([
            "check_origin",
            "remove_origin_label",
            "add_destination_label"
        ])
    );
}

#[tokio::test]
async fn test_migrate_success() {
    let (base, registry) = serve(FakeCluster::new().with_deployment("web", 1)).await;
    registry
        .register(HandshakeMessage::register("web", "10.0.0.5"))
        .await;
    let dest = registry.clone();
    tokio::spawn(async move {
        while !dest.get("web").await.is_some_and(|r| r.migration) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        dest.register(HandshakeMessage::register("web", "10.0.1.7"))
            .await;
    });

    let resp = reqwest::Client::new()
        .post(format!("{base}/migrate/web/node-a/node-b"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["report"]["layers"], 2);
    assert_eq!(body["report"]["destination"], "10.0.1.7:2486");
}

#[tokio::test]
async fn test_cancel_without_migration_and_health() {
    let (base, _) = serve(FakeCluster::new()).await;
    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("{base}/migrate/web"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    for path in ["healthz", "ready"] {
        let resp = client.get(format!("{base}/{path}")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

async fn wait_until_idle(registry: &PodRegistry) {
    for _ in 0..400 {
        if !registry.get("web").await.unwrap().migration {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("migration flag was never cleared");
}

#[tokio::test]
async fn test_client_timeout_does_not_strand_migration() {
    let cluster = FakeCluster::new()
        .with_deployment("web", 1)
        .with_label("node-a", "mig-ready", "true");
    let (base, registry) = serve(cluster.clone()).await;
    registry
        .register(HandshakeMessage::register("web", "10.0.0.5"))
        .await;

    // no destination registers; the client gives up before the controller does
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let sent = client
        .post(format!("{base}/migrate/web/node-a/node-b"))
        .send()
        .await;
    assert!(sent.unwrap_err().is_timeout());

    wait_until_idle(&registry).await;
    assert_eq!(cluster.replicas("web"), 1);
    assert_eq!(
        cluster.label("node-a", "mig-ready").as_deref(),
        Some("true")
    );

    let resp = reqwest::Client::new()
        .delete(format!("{base}/migrate/web"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_during_push_after_client_left() {
    let cluster = FakeCluster::new()
        .with_deployment("web", 1)
        .with_label("node-a", "mig-ready", "true");
    let agents = ScriptedAgents::pushing(2);
    agents.delay_pushes(Duration::from_secs(30));
    let (base, registry) =
        serve_with(cluster.clone(), agents.clone(), Duration::from_secs(30)).await;
    registry
        .register(HandshakeMessage::register("web", "10.0.0.5"))
        .await;
    let dest = registry.clone();
    tokio::spawn(async move {
        while !dest.get("web").await.is_some_and(|r| r.migration) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        dest.register(HandshakeMessage::register("web", "10.0.1.7"))
            .await;
    });

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let sent = client
        .post(format!("{base}/migrate/web/node-a/node-b"))
        .send()
        .await;
    assert!(sent.is_err());
    while agents.pushes().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let resp = reqwest::Client::new()
        .delete(format!("{base}/migrate/web"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    wait_until_idle(&registry).await;
    assert!(
        !cluster
            .mutations()
            .iter()
            .any(|c| matches!(c, ClusterCall::DeletePods { .. }))
    );
    assert_eq!(cluster.replicas("web"), 1);
    assert_eq!(registry.get("web").await.unwrap().address, "10.0.0.5");
}
