use std::sync::{Arc, Once};
use std::time::Duration;

use common::{FailureKind, HandshakeMessage};
use migd::fake::{ClusterCall, FakeCluster, ScriptedAgents};
use migd::orchestrator::{MigrationError, MigrationStep, Orchestrator, OrchestratorSettings};
use migd::registry::PodRegistry;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .is_test(true)
            .try_init();
    });
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        label: "mig-ready:true".to_string(),
        transfer_port: 2486,
        registration_timeout: Duration::from_secs(2),
        push_timeout: Duration::from_secs(2),
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<PodRegistry>,
    cluster: FakeCluster,
    agents: ScriptedAgents,
}

fn harness() -> Harness {
    init_logging();
    let registry = Arc::new(PodRegistry::new());
    let cluster = FakeCluster::new()
        .with_deployment("web", 1)
        .with_label("node-a", "mig-ready", "true");
    let agents = ScriptedAgents::pushing(3);
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::new(cluster.clone()),
        Arc::new(agents.clone()),
        settings(),
    ));
    Harness {
        orchestrator,
        registry,
        cluster,
        agents,
    }
}

/// Plays the new replica's agent: registers as soon as the migration has begun.
fn spawn_destination(registry: Arc<PodRegistry>, address: &'static str) {
    tokio::spawn(async move {
        loop {
            if registry.get("web").await.is_some_and(|r| r.migration) {
                registry
                    .register(HandshakeMessage::register("web", address))
                    .await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
}

fn label_call(node: &str, value: Option<&str>) -> ClusterCall {
    ClusterCall::SetLabel {
        node: node.to_string(),
        key: "mig-ready".to_string(),
        value: value.map(str::to_string),
    }
}

fn scale_call(delta: i32) -> ClusterCall {
    ClusterCall::Scale {
        deployment: "web".to_string(),
        delta,
    }
}

#[tokio::test]
async fn test_end_to_end_migration() {
    let h = harness();
    let first = h
        .orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.0.5"))
        .await;
    assert!(first.is_new);

    spawn_destination(h.registry.clone(), "10.0.1.7");
    let report = h
        .orchestrator
        .migrate_pod("web", "node-a", "node-b")
        .await
        .unwrap();

    assert_eq!(
        report.steps,
        vec![
            MigrationStep::CheckOrigin,
            MigrationStep::RemoveOriginLabel,
            MigrationStep::AddDestinationLabel,
            MigrationStep::ScaleUp,
            MigrationStep::AwaitDestination,
            MigrationStep::PushLayers,
            MigrationStep::DeleteOriginPod,
        ]
    );
    assert_eq!(report.destination, "10.0.1.7:2486");
    assert_eq!(report.layers, 3);
    assert_eq!(report.replicas, 2);

    // scale-up strictly before deletion
    assert_eq!(
        h.cluster.mutations(),
        vec![
            label_call("node-a", None),
            label_call("node-b", Some("true")),
            scale_call(1),
            ClusterCall::DeletePods {
                deployment: "web".to_string(),
                node: "node-a".to_string(),
            },
        ]
    );
    assert_eq!(h.cluster.label("node-a", "mig-ready"), None);
    assert_eq!(
        h.cluster.label("node-b", "mig-ready").as_deref(),
        Some("true")
    );
    assert_eq!(
        h.agents.pushes(),
        vec![("10.0.0.5".to_string(), "10.0.1.7:2486".to_string())]
    );

    let record = h.registry.get("web").await.unwrap();
    assert!(!record.migration);
    assert_eq!(record.address, "10.0.1.7:2486");
    assert_eq!(record.destination, None);

    // a later restart of the migrated pod is an ordinary re-registration
    let again = h
        .orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.1.7:2486"))
        .await;
    assert!(!again.is_new);
    assert!(!again.is_mig);
}

#[tokio::test]
async fn test_unknown_pod_makes_no_cluster_calls() {
    let h = harness();
    let err = h
        .orchestrator
        .migrate_pod("ghost", "node-a", "node-b")
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::NotFound(ref n) if n == "ghost"));
    assert!(h.cluster.calls().is_empty());
    assert!(h.agents.pushes().is_empty());
}

#[tokio::test]
async fn test_empty_parameters_rejected_before_any_mutation() {
    let h = harness();
    h.orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.0.5"))
        .await;

    for (d, o, t) in [("", "node-a", "node-b"), ("web", "", "node-b"), ("web", "node-a", " ")] {
        let err = h.orchestrator.migrate_pod(d, o, t).await.unwrap_err();
        assert!(matches!(err, MigrationError::Invalid(_)), "{err}");
        assert_eq!(err.kind(), FailureKind::Fatal);
    }
    assert!(h.cluster.calls().is_empty());
    assert!(!h.registry.get("web").await.unwrap().migration);
}

#[tokio::test]
async fn test_malformed_label_rejected() {
    init_logging();
    let registry = Arc::new(PodRegistry::new());
    let cluster = FakeCluster::new();
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::new(cluster.clone()),
        Arc::new(ScriptedAgents::pushing(1)),
        OrchestratorSettings {
            label: "mig-ready".to_string(),
            ..settings()
        },
    ));
    registry
        .register(HandshakeMessage::register("web", "10.0.0.5"))
        .await;
    let err = orchestrator
        .migrate_pod("web", "node-a", "node-b")
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Invalid(_)));
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn test_second_migration_conflicts_while_first_runs() {
    let h = harness();
    h.orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.0.5"))
        .await;

    let first = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.migrate_pod("web", "node-a", "node-b").await })
    };
    while !h.registry.get("web").await.unwrap().migration {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let err = h
        .orchestrator
        .migrate_pod("web", "node-a", "node-c")
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Conflict(_)));
    assert_eq!(err.kind(), FailureKind::Retryable);

    // is_mig mirrors the in-flight migration
    let reply = h
        .orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.1.7"))
        .await;
    assert!(reply.is_mig);
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_scale_up_compensates_labels() {
    let h = harness();
    h.cluster.fail_on("scale");
    h.orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.0.5"))
        .await;

    let err = h
        .orchestrator
        .migrate_pod("web", "node-a", "node-b")
        .await
        .unwrap_err();
    match &err {
        MigrationError::Step {
            step, completed, ..
        } => {
            assert_eq!(*step, MigrationStep::ScaleUp);
            assert_eq!(
                completed,
                &vec![
                    MigrationStep::CheckOrigin,
                    MigrationStep::RemoveOriginLabel,
                    MigrationStep::AddDestinationLabel
                ]
            );
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(err.kind(), FailureKind::Retryable);

    assert_eq!(
        h.cluster.mutations(),
        vec![
            label_call("node-a", None),
            label_call("node-b", Some("true")),
            scale_call(1),
            label_call("node-b", None),
            label_call("node-a", Some("true")),
        ]
    );
    assert_eq!(
        h.cluster.label("node-a", "mig-ready").as_deref(),
        Some("true")
    );
    assert_eq!(h.cluster.label("node-b", "mig-ready"), None);
    assert!(!h.registry.get("web").await.unwrap().migration);
}

#[tokio::test]
async fn test_failed_push_keeps_origin_pod() {
    let h = harness();
    h.agents.fail_with("disk full");
    h.orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.0.5"))
        .await;
    spawn_destination(h.registry.clone(), "10.0.1.7");

    let err = h
        .orchestrator
        .migrate_pod("web", "node-a", "node-b")
        .await
        .unwrap_err();
    assert!(
        matches!(err, MigrationError::Step { step: MigrationStep::PushLayers, .. }),
        "{err}"
    );
    let calls = h.cluster.mutations();
    assert!(
        !calls
            .iter()
            .any(|c| matches!(c, ClusterCall::DeletePods { .. }))
    );
    assert_eq!(calls.last(), Some(&label_call("node-a", Some("true"))));
    assert_eq!(h.cluster.replicas("web"), 1);

    let record = h.registry.get("web").await.unwrap();
    assert!(!record.migration);
    assert_eq!(record.address, "10.0.0.5");
}

#[tokio::test]
async fn test_destination_never_registers() {
    init_logging();
    let registry = Arc::new(PodRegistry::new());
    let cluster = FakeCluster::new().with_deployment("web", 1);
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::new(cluster.clone()),
        Arc::new(ScriptedAgents::pushing(1)),
        OrchestratorSettings {
            registration_timeout: Duration::from_millis(100),
            ..settings()
        },
    ));
    registry
        .register(HandshakeMessage::register("web", "10.0.0.5"))
        .await;

    let err = orchestrator
        .migrate_pod("web", "node-a", "node-b")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Step {
            step: MigrationStep::AwaitDestination,
            ..
        }
    ));
    assert_eq!(err.kind(), FailureKind::Retryable);
    assert_eq!(cluster.replicas("web"), 1);
}

#[tokio::test]
async fn test_cancel_aborts_and_compensates() {
    let h = harness();
    h.orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.0.5"))
        .await;
    assert!(!h.orchestrator.cancel_migration("web").await);

    let running = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.migrate_pod("web", "node-a", "node-b").await })
    };
    // no destination ever registers, so the migration parks in the await step
    while !h.cluster.mutations().contains(&scale_call(1)) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.orchestrator.cancel_migration("web").await);

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Step {
            step: MigrationStep::AwaitDestination,
            ..
        }
    ));
    assert_eq!(err.kind(), FailureKind::Fatal);
    assert!(h.cluster.mutations().contains(&scale_call(-1)));
    assert!(h.agents.pushes().is_empty());
    assert!(!h.registry.get("web").await.unwrap().migration);
}

/// Polls until the pod's migration flag has been cleared.
async fn wait_for_rollback(registry: &PodRegistry) {
    for _ in 0..400 {
        if !registry.get("web").await.unwrap().migration {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("migration flag was never cleared");
}

#[tokio::test]
async fn test_dropped_caller_still_compensates() {
    let h = harness();
    h.orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.0.5"))
        .await;

    let caller = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.migrate_pod("web", "node-a", "node-b").await })
    };
    while !h.cluster.mutations().contains(&scale_call(1)) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    // the migration outlives its caller and can still be cancelled
    assert!(h.orchestrator.cancel_migration("web").await);
    wait_for_rollback(&h.registry).await;

    assert_eq!(h.cluster.replicas("web"), 1);
    assert_eq!(
        h.cluster.label("node-a", "mig-ready").as_deref(),
        Some("true")
    );
    assert_eq!(h.cluster.label("node-b", "mig-ready"), None);
    assert!(!h.orchestrator.cancel_migration("web").await);

    let restarted = h
        .orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.0.5"))
        .await;
    assert!(!restarted.is_mig);
}

#[tokio::test]
async fn test_dropped_caller_times_out_and_compensates() {
    init_logging();
    let registry = Arc::new(PodRegistry::new());
    let cluster = FakeCluster::new()
        .with_deployment("web", 1)
        .with_label("node-a", "mig-ready", "true");
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        Arc::new(cluster.clone()),
        Arc::new(ScriptedAgents::pushing(1)),
        OrchestratorSettings {
            registration_timeout: Duration::from_millis(200),
            ..settings()
        },
    ));
    registry
        .register(HandshakeMessage::register("web", "10.0.0.5"))
        .await;

    let caller = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.migrate_pod("web", "node-a", "node-b").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    caller.abort();

    wait_for_rollback(&registry).await;
    assert_eq!(cluster.replicas("web"), 1);
    assert_eq!(
        cluster.label("node-a", "mig-ready").as_deref(),
        Some("true")
    );

    // a retry is not blocked by the abandoned attempt
    let retry = orchestrator
        .migrate_pod("web", "node-a", "node-b")
        .await
        .unwrap_err();
    assert!(
        matches!(
            retry,
            MigrationError::Step {
                step: MigrationStep::AwaitDestination,
                ..
            }
        ),
        "{retry}"
    );
}

#[tokio::test]
async fn test_offline_origin_agent_stops_before_cluster_changes() {
    let h = harness();
    h.agents.go_offline();
    h.orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.0.5"))
        .await;

    let err = h
        .orchestrator
        .migrate_pod("web", "node-a", "node-b")
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            MigrationError::Step {
                step: MigrationStep::CheckOrigin,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(err.kind(), FailureKind::Retryable);
    assert!(h.cluster.mutations().is_empty());
    assert!(!h.registry.get("web").await.unwrap().migration);
}

#[tokio::test]
async fn test_destination_port_is_taken_from_registration() {
    let h = harness();
    h.orchestrator
        .register_pod(HandshakeMessage::register("web", "10.0.0.5:2486"))
        .await;
    spawn_destination(h.registry.clone(), "10.0.1.7:3999");

    let report = h
        .orchestrator
        .migrate_pod("web", "node-a", "node-b")
        .await
        .unwrap();
    assert_eq!(report.destination, "10.0.1.7:3999");
    assert_eq!(
        h.agents.pushes(),
        vec![("10.0.0.5:2486".to_string(), "10.0.1.7:3999".to_string())]
    );
    assert_eq!(h.registry.get("web").await.unwrap().address, "10.0.1.7:3999");
}
