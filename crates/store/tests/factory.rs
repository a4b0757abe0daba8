#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use orka_core::{CacheConfig, ErrorKind, Gvk, Object, PermissionResult, ResourceKey};
use orka_kubehub::mock::MockCluster;
use orka_store::WatcherFactory;
use tokio_util::sync::CancellationToken;

fn obj(name: &str, ns: &str) -> Object {
    Object::new(serde_json::json!({ "metadata": { "name": name, "namespace": ns } }))
}

fn cluster() -> Arc<MockCluster> {
    let c = MockCluster::new()
        .with_resource("", "v1", "ConfigMap", "configmaps", true)
        .with_resource("", "v1", "Pod", "pods", true)
        .with_resource("apps", "v1", "Deployment", "deployments", true);
    c.seed("configmaps", vec![obj("a", "ns1"), obj("b", "ns2")]);
    Arc::new(c)
}

fn factory(cluster: &Arc<MockCluster>) -> Arc<WatcherFactory> {
    Arc::new(WatcherFactory::new(cluster.clone(), CacheConfig::default(), CancellationToken::new()))
}

fn cm_key() -> ResourceKey {
    ResourceKey::parse("v1/ConfigMap").unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_touch_probes_and_watches_once() {
    let cluster = cluster();
    cluster.hold("configmaps");
    let f = factory(&cluster);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let f = f.clone();
        // Query parameters differ per caller but the kind is the same.
        let key = cm_key().in_namespace(format!("ns{}", i));
        tasks.push(tokio::spawn(async move { f.current(&key).await }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.release("configmaps");

    let mut watchers = Vec::new();
    for t in tasks {
        watchers.push(t.await.unwrap().unwrap());
    }
    assert!(watchers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(watchers[0].len(), 2);
    assert_eq!(cluster.probe_count("configmaps"), 3, "one review per verb, once");
    assert_eq!(cluster.watch_count("configmaps"), 1);
    assert_eq!(cluster.discover_count(), 1);
    assert_eq!(f.started(), 1);
    assert!(f.is_seen(&Gvk::new("", "v1", "ConfigMap")));
    assert_eq!(f.pending_slots(), 0);
}

#[tokio::test]
async fn repeat_access_uses_seen_fast_path() {
    let cluster = cluster();
    let f = factory(&cluster);
    let a = f.current(&cm_key()).await.unwrap();
    let b = f.current(&cm_key().named("a")).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cluster.probe_count("configmaps"), 3);
    assert_eq!(f.seen_kinds().len(), 1);
}

#[tokio::test]
async fn denied_kind_opens_no_watch_and_is_probed_again() {
    let cluster = cluster();
    cluster.grant("configmaps", PermissionResult { get: true, list: false, watch: false });
    let f = factory(&cluster);

    let err = f.current(&cm_key()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
    assert!(err.to_string().contains("get:true, list:false, watch:false"), "{}", err);
    assert_eq!(cluster.watch_count("configmaps"), 0);
    assert!(!f.is_seen(&Gvk::new("", "v1", "ConfigMap")));

    f.current(&cm_key()).await.unwrap_err();
    assert_eq!(cluster.probe_count("configmaps"), 6);
}

#[tokio::test]
async fn unknown_kind_fails_resolution() {
    let cluster = cluster();
    let f = factory(&cluster);
    let err = f.current(&ResourceKey::parse("example.com/v1/Widget").unwrap()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert_eq!(cluster.probe_count("widgets"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_interrupts_bootstrap() {
    let cluster = cluster();
    cluster.hold("configmaps");
    let f = factory(&cluster);

    let pending = {
        let f = f.clone();
        tokio::spawn(async move { f.current(&cm_key()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    f.shutdown();
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShuttingDown);
    assert!(!f.is_seen(&Gvk::new("", "v1", "ConfigMap")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_kind_does_not_block_other_kinds() {
    let cluster = cluster();
    cluster.hold("configmaps");
    let f = factory(&cluster);

    let stuck = {
        let f = f.clone();
        tokio::spawn(async move { f.current(&cm_key()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let pods = tokio::time::timeout(Duration::from_secs(1), f.current(&ResourceKey::parse("v1/Pod").unwrap())).await;
    assert!(pods.expect("pods blocked behind configmaps").is_ok());
    assert!(!stuck.is_finished());

    cluster.release("configmaps");
    stuck.await.unwrap().unwrap();
}

#[tokio::test]
async fn sync_timeout_is_transient_and_retry_reuses_stream() {
    let cluster = cluster();
    cluster.hold("configmaps");
    let config = CacheConfig { sync_timeout: Some(Duration::from_millis(50)), ..CacheConfig::default() };
    let f = WatcherFactory::new(cluster.clone(), config, CancellationToken::new());

    let err = f.current(&cm_key()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);

    cluster.release("configmaps");
    let w = f.current(&cm_key()).await.unwrap();
    assert!(w.is_synced());
    assert_eq!(cluster.watch_count("configmaps"), 1);
    // The second attempt started from scratch, including the permission probe.
    assert_eq!(cluster.probe_count("configmaps"), 6);
}

#[tokio::test]
async fn watcher_for_is_idempotent_per_resource() {
    let cluster = cluster();
    let f = factory(&cluster);
    let res = orka_core::ApiResourceInfo {
        gvk: Gvk::new("apps", "v1", "Deployment"),
        plural: "deployments".into(),
        namespaced: true,
    };
    let a = f.watcher_for(&res);
    let b = f.watcher_for(&res);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cluster.watch_count("deployments"), 1);

    // A stopped stream is replaced rather than handed out again.
    a.stop();
    tokio::time::timeout(Duration::from_secs(1), async {
        while a.is_running() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    let c = f.watcher_for(&res);
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(cluster.watch_count("deployments"), 2);
}

#[tokio::test]
async fn unknown_kinds_leave_no_slots_and_reuse_discovery() {
    let cluster = cluster();
    let f = factory(&cluster);
    let bogus = ResourceKey::parse("example.com/v1/Widget").unwrap();
    for _ in 0..3 {
        assert_eq!(f.current(&bogus).await.unwrap_err().kind(), ErrorKind::Resolution);
    }
    assert_eq!(f.pending_slots(), 0);
    assert_eq!(cluster.discover_count(), 1);

    // Denied kinds do not linger either.
    cluster.grant("pods", PermissionResult { get: false, list: true, watch: true });
    f.current(&ResourceKey::parse("v1/Pod").unwrap()).await.unwrap_err();
    assert_eq!(f.pending_slots(), 0);
}

#[tokio::test]
async fn seen_kind_with_ended_stream_is_bootstrapped_again() {
    let cluster = cluster();
    let f = factory(&cluster);
    let first = f.current(&cm_key()).await.unwrap();

    cluster.close_watches("configmaps");
    tokio::time::timeout(Duration::from_secs(1), async {
        while first.is_running() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    let second = f.current(&cm_key()).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.is_running());
    assert_eq!(second.len(), 2);
    assert_eq!(cluster.watch_count("configmaps"), 2);
    assert_eq!(cluster.probe_count("configmaps"), 6);
    assert!(Arc::ptr_eq(&second, &f.current(&cm_key()).await.unwrap()));
}

#[tokio::test]
async fn stopped_watchers_are_not_served_after_shutdown() {
    let cluster = cluster();
    let f = factory(&cluster);
    let w = f.current(&cm_key()).await.unwrap();
    f.shutdown();
    tokio::time::timeout(Duration::from_secs(1), async {
        while w.is_running() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(f.current(&cm_key()).await.unwrap_err().kind(), ErrorKind::ShuttingDown);
}
