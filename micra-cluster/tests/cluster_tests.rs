use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use micra_cluster::{
    ClusterConfig, ClusterCoordinator, ClusterHooks, EventContext, EventHandler,
};
use micra_store::{KvStore, MemoryKvStore};

fn node_config(server_id: &str, enable_event: bool) -> ClusterConfig {
    ClusterConfig {
        namespace: "TestNs".to_string(),
        sys_id: "S0001".to_string(),
        module_id: "001".to_string(),
        server_id: server_id.to_string(),
        app_name: format!("app-{}", server_id),
        expire: 0.3,
        heart_beat: 0.1,
        enable_event,
        event_interval: 0.05,
        event_each_get: 10,
    }
}

fn shared_store() -> Arc<dyn KvStore> {
    Arc::new(MemoryKvStore::new())
}

#[tokio::test]
async fn single_node_registers_and_owns_master() {
    let kv = shared_store();
    let node = ClusterCoordinator::new(kv, node_config("01", false), ClusterHooks::default());

    node.register_cluster().await.unwrap();
    assert!(node.registered());
    assert!(node.master());

    let master = node
        .get_cluster_master("TestNs", "S0001", "001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(master.server_id, "01");
    assert_eq!(master.app_name.as_deref(), Some("app-01"));

    node.deregister_cluster().await.unwrap();
    assert!(!node.registered());
    assert!(!node.master());
    node.shutdown();
}

#[tokio::test]
async fn three_node_election_single_master() {
    let kv = shared_store();
    let node1 = ClusterCoordinator::new(Arc::clone(&kv), node_config("01", false), ClusterHooks::default());
    let node2 = ClusterCoordinator::new(Arc::clone(&kv), node_config("02", false), ClusterHooks::default());
    let node3 = ClusterCoordinator::new(Arc::clone(&kv), node_config("03", false), ClusterHooks::default());

    node1.register_cluster().await.unwrap();
    node2.register_cluster().await.unwrap();
    node3.register_cluster().await.unwrap();

    // First registrant wins the race.
    assert!(node1.master());
    assert!(!node2.master());
    assert!(!node3.master());

    let list = node1.get_cluster_list("TestNs", None, None).await.unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list.iter().filter(|m| m.master).count(), 1);

    // Master leaves; within the lease window exactly one of the
    // others takes over.
    node1.deregister_cluster().await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let masters = [node2.master(), node3.master()];
    assert_eq!(
        masters.iter().filter(|m| **m).count(),
        1,
        "exactly one of the remaining nodes must own mastership"
    );

    for node in [&node1, &node2, &node3] {
        node.shutdown();
    }
}

#[tokio::test]
async fn lease_recreated_after_external_wipe() {
    let kv = shared_store();
    let node = ClusterCoordinator::new(Arc::clone(&kv), node_config("01", false), ClusterHooks::default());
    node.register_cluster().await.unwrap();

    // Simulate a store-side lease loss.
    kv.delete(&[
        "{$group=cluster_info$}{$TestNs$}{$S0001$}{$001$}{$01$}".to_string(),
        "{$group=cluster_master$}{$TestNs$}{$S0001$}{$001$}".to_string(),
    ])
    .await
    .unwrap();

    // The next heartbeat tick recreates both.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        kv.exists("{$group=cluster_info$}{$TestNs$}{$S0001$}{$001$}{$01$}")
            .await
            .unwrap()
    );
    assert!(node.master());
    node.shutdown();
}

#[tokio::test]
async fn hooks_fire_once_per_transition() {
    let kv = shared_store();
    let own_count = Arc::new(AtomicUsize::new(0));
    let lost_count = Arc::new(AtomicUsize::new(0));
    let register_count = Arc::new(AtomicUsize::new(0));

    fn counting_hook(counter: Arc<AtomicUsize>) -> micra_cluster::ClusterHook {
        Arc::new(move |_snapshot| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    let hooks = ClusterHooks {
        after_register: Some(counting_hook(Arc::clone(&register_count))),
        after_own_master: Some(counting_hook(Arc::clone(&own_count))),
        after_lost_master: Some(counting_hook(Arc::clone(&lost_count))),
        ..Default::default()
    };

    let node = ClusterCoordinator::new(kv, node_config("01", false), hooks);
    node.register_cluster().await.unwrap();

    // Several heartbeat periods pass; renewals must not re-fire
    // transition hooks.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(register_count.load(Ordering::SeqCst), 1);
    assert_eq!(own_count.load(Ordering::SeqCst), 1);
    assert_eq!(lost_count.load(Ordering::SeqCst), 0);

    node.deregister_cluster().await.unwrap();
    assert_eq!(lost_count.load(Ordering::SeqCst), 1);
    node.shutdown();
}

fn channel_handler(tx: mpsc::UnboundedSender<(EventContext, String, Value)>) -> EventHandler {
    Arc::new(move |context, event, paras| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send((context, event, paras));
        })
    })
}

#[tokio::test]
async fn emit_reaches_target_handler() {
    let kv = shared_store();
    let node_a = ClusterCoordinator::new(Arc::clone(&kv), node_config("0A", true), ClusterHooks::default());
    let node_b = ClusterCoordinator::new(Arc::clone(&kv), node_config("0B", true), ClusterHooks::default());

    node_a.register_cluster().await.unwrap();
    node_b.register_cluster().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    node_b.register_event("ev1", channel_handler(tx)).unwrap();

    node_a
        .emit("ev1", json!({"k": "v"}), "TestNs", "S0001", "001", "0B")
        .await
        .unwrap();

    let (context, event, paras) =
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(event, "ev1");
    assert_eq!(context.event_type, "emit");
    assert_eq!(context.from.server_id, "0A");
    assert_eq!(paras, json!({"k": "v"}));

    node_a.shutdown();
    node_b.shutdown();
}

#[tokio::test]
async fn emit_to_missing_inbox_fails() {
    let kv = shared_store();
    let node = ClusterCoordinator::new(kv, node_config("01", true), ClusterHooks::default());
    node.register_cluster().await.unwrap();

    let err = node
        .emit("ev1", json!(null), "TestNs", "S0001", "001", "99")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        micra_core::MicraError::EventEmitUnreachable(_)
    ));
    node.shutdown();
}

#[tokio::test]
async fn broadcast_reaches_all_nodes() {
    let kv = shared_store();
    let nodes: Vec<_> = ["0A", "0B", "0C"]
        .iter()
        .map(|id| ClusterCoordinator::new(Arc::clone(&kv), node_config(id, true), ClusterHooks::default()))
        .collect();
    for node in &nodes {
        node.register_cluster().await.unwrap();
    }

    let mut receivers = Vec::new();
    for node in &nodes {
        let (tx, rx) = mpsc::unbounded_channel();
        node.register_event("ev2", channel_handler(tx)).unwrap();
        receivers.push(rx);
    }

    nodes[0]
        .broadcast("ev2", json!([1, 2]), "TestNs", None, None)
        .await
        .unwrap();

    for rx in &mut receivers {
        let (context, event, paras) = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("broadcast must arrive within the poll interval")
            .unwrap();
        assert_eq!(event, "ev2");
        assert_eq!(context.event_type, "broadcast");
        assert_eq!(context.from.server_id, "0A");
        assert_eq!(paras, json!([1, 2]));
    }

    for node in &nodes {
        node.shutdown();
    }
}

#[tokio::test]
async fn duplicate_event_registration_rejected() {
    let kv = shared_store();
    let node = ClusterCoordinator::new(kv, node_config("01", true), ClusterHooks::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    node.register_event("ev", channel_handler(tx.clone())).unwrap();
    assert!(node.register_event("ev", channel_handler(tx)).is_err());
    node.deregister_event("ev");
    let (tx2, _rx2) = mpsc::unbounded_channel();
    node.register_event("ev", channel_handler(tx2)).unwrap();
    node.shutdown();
}
