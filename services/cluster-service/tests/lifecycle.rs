//! Lifecycle pipeline integration tests.
//!
//! Runs whole command sequences through the dispatcher against in-memory
//! host clusters with a paused clock.

use std::sync::Arc;
use std::time::Duration;

use fleet_cluster_service::{
    alert::AlertFanout,
    control_plane::{kubeconfig_for, DeclarationKind, MockConnector, MockControlPlane},
    descriptor::ChartConfig,
    dispatcher::Dispatcher,
    error::ServiceError,
    placement::{PlacementSelector, Thresholds},
    provisioner::Provisioner,
    readiness::{ReadinessConfig, ReadinessWatcher},
    secrets::StaticSecretStore,
    sessions::SessionRegistry,
    status::ProvisioningState,
};
use fleet_events::{
    ClusterCreate, ClusterPlanUpgrade, ClusterRef, ClusterTarget, LifecycleCommand,
    PlanUpgradeCluster, SubscriptionPlan,
};
use tokio::sync::watch;

struct Harness {
    host: Arc<MockControlPlane>,
    dispatcher: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
}

fn harness(host: MockControlPlane) -> Harness {
    let kubeconfig = kubeconfig_for("host-a", "https://host-a.test");
    let host = Arc::new(host);
    host.add_node("n1", "16", "32Gi");
    host.set_usage("n1", "2", "4Gi");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = Dispatcher::new(
        SessionRegistry::new(
            Arc::new(StaticSecretStore::default().with_kubeconfig("host-a", &kubeconfig)),
            Arc::new(MockConnector::new().with_host(&kubeconfig, host.clone())),
        ),
        PlacementSelector::new(Thresholds::default(), AlertFanout::default()),
        Provisioner::new(
            ChartConfig::default(),
            ReadinessWatcher::new(ReadinessConfig::default(), shutdown_rx),
        ),
        "fleet.test",
    );

    Harness {
        host,
        dispatcher,
        shutdown_tx,
    }
}

fn plan(name: &str, pods: u64) -> SubscriptionPlan {
    SubscriptionPlan {
        name: name.to_string(),
        pods,
        services: 5,
        config_maps: 10,
        persistent_volume_claims: 2,
        replication_controllers: 1,
        secrets: 10,
        load_balancers: 0,
        node_ports: 1,
    }
}

fn create(name: &str) -> LifecycleCommand {
    LifecycleCommand::Create(ClusterCreate {
        host_cluster_id: Some("host-a".to_string()),
        host_cluster_name: Some("eu-1".to_string()),
        host_cluster_ids: vec!["host-a".to_string()],
        subscription: plan("starter", 10),
        cluster: ClusterRef {
            id: format!("{name}-id"),
            name: name.to_string(),
            kube_version: "v1.30.2".to_string(),
        },
    })
}

fn target(name: &str) -> ClusterTarget {
    ClusterTarget {
        host_cluster_id: "host-a".to_string(),
        cluster_name: name.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_lifecycle() {
    let h = harness(MockControlPlane::new());

    let created = h.dispatcher.dispatch(&create("alpha")).await.unwrap();
    assert!(created.ready);
    assert_eq!(
        h.host.ingress("alpha-vcluster", "alpha").unwrap().host,
        "alpha.eu-1.fleet.test"
    );

    let status = h.dispatcher.status("host-a", "alpha").await.unwrap();
    assert_eq!(status.state, ProvisioningState::Ready);

    let stopped = h
        .dispatcher
        .dispatch(&LifecycleCommand::Stop(target("alpha")))
        .await
        .unwrap();
    assert_eq!(stopped.state, ProvisioningState::Stopped);

    let again = h
        .dispatcher
        .dispatch(&LifecycleCommand::Stop(target("alpha")))
        .await
        .unwrap();
    assert_eq!(again.message, "Cluster already stopped");

    let started = h
        .dispatcher
        .dispatch(&LifecycleCommand::Start(target("alpha")))
        .await
        .unwrap();
    assert_eq!(started.message, "Cluster started");

    let upgraded = h
        .dispatcher
        .dispatch(&LifecycleCommand::PlanUpgrade(ClusterPlanUpgrade {
            host_cluster_id: "host-a".to_string(),
            cluster: PlanUpgradeCluster::Record {
                name: "alpha".to_string(),
            },
            subscription: plan("growth", 50),
        }))
        .await
        .unwrap();
    assert_eq!(upgraded.message, "Plan changed to growth");
    let quotas = h.host.quotas("alpha-vcluster");
    assert_eq!(quotas.len(), 1);
    assert_eq!(quotas[0].name, "growth");
    assert_eq!(quotas[0].hard["pods"], "50");

    let deleted = h
        .dispatcher
        .dispatch(&LifecycleCommand::Delete(target("alpha")))
        .await
        .unwrap();
    assert_eq!(deleted.state, ProvisioningState::Deleting);
    assert!(!h.host.has_namespace("alpha-vcluster"));

    let gone = h
        .dispatcher
        .dispatch(&LifecycleCommand::Delete(target("alpha")))
        .await
        .unwrap();
    assert_eq!(gone.message, "Cluster already deleted");

    assert!(h.dispatcher.in_flight().is_empty());
    assert!(h.dispatcher.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_creates_for_one_name_converge_on_one_declaration() {
    let h = harness(MockControlPlane::new());

    let (create_a, create_b) = (create("alpha"), create("alpha"));
    let (first, second) = tokio::join!(
        h.dispatcher.dispatch(&create_a),
        h.dispatcher.dispatch(&create_b),
    );

    assert!(first.unwrap().ready);
    assert!(second.unwrap().ready);
    assert_eq!(h.host.declaration_count(DeclarationKind::VCluster), 1);
    assert_eq!(h.host.call_count("create", "VCluster"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_readiness_wait() {
    let h = harness(MockControlPlane::new().without_auto_converge());

    let shutdown_tx = h.shutdown_tx;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let _ = shutdown_tx.send(true);
    });

    let err = h.dispatcher.dispatch(&create("alpha")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Cancelled(_)), "{err}");
    assert!(h.dispatcher.in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_service_never_appears_is_negative_outcome() {
    let h = harness(MockControlPlane::new().without_auto_converge());

    let started = tokio::time::Instant::now();
    let outcome = h.dispatcher.dispatch(&create("alpha")).await.unwrap();
    assert!(!outcome.ready);
    assert_eq!(outcome.state, ProvisioningState::WaitingForService);
    assert!(started.elapsed() >= Duration::from_secs(600));
    assert_eq!(h.host.declaration_count(DeclarationKind::VCluster), 1);
    assert_eq!(h.host.call_count("list", "Pod"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_create_with_pending_pods_stays_not_ready() {
    let h = harness(MockControlPlane::new().with_pod_phase("Pending"));

    let first = h.dispatcher.dispatch(&create("alpha")).await.unwrap();
    assert_eq!(first.state, ProvisioningState::WaitingForPods);

    let second = h.dispatcher.dispatch(&create("alpha")).await.unwrap();
    assert_eq!(second.state, ProvisioningState::Updating);
    assert!(!second.ready);

    let status = h.dispatcher.status("host-a", "alpha").await.unwrap();
    assert_eq!(status.state, ProvisioningState::WaitingForPods);
}

#[tokio::test(start_paused = true)]
async fn test_status_while_deleting() {
    let h = harness(MockControlPlane::new().with_deletion_polls(5));
    h.dispatcher.dispatch(&create("alpha")).await.unwrap();

    h.dispatcher
        .dispatch(&LifecycleCommand::Delete(target("alpha")))
        .await
        .unwrap();

    let status = h.dispatcher.status("host-a", "alpha").await.unwrap();
    assert_eq!(status.status, "Terminating");
    assert_eq!(status.state, ProvisioningState::Deleting);
}
