use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use weft::backend::BackendType;
use weft::config::NetworkConfig;
use weft::lease::{EventType, LeaseAttrs};
use weft::manager::{Cursor, Manager};
use weft::registry::{
    Annotations, NodeApi, NodeRecord, NodeWatchPage, RegistryManager, DEFAULT_ANNOTATION_PREFIX,
};
use weft::test_utils::MemoryNodeRegistry;
use weft::{Error, Result};

fn config() -> NetworkConfig {
    NetworkConfig::from_json(r#"{"Network": "10.42.0.0/16", "Backend": {"Type": "host-gw"}}"#)
        .unwrap()
}

fn keys() -> Annotations {
    Annotations::new(DEFAULT_ANNOTATION_PREFIX).unwrap()
}

fn node(name: &str, cidr: &str, annotations: &[(String, &str)]) -> NodeRecord {
    NodeRecord {
        name: name.to_string(),
        version: 0,
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.clone(), (*v).to_string()))
            .collect(),
        pod_cidrs: vec![cidr.parse().unwrap()],
    }
}

fn managed_peer(name: &str, cidr: &str, public_ip: &str) -> NodeRecord {
    let a = keys();
    node(
        name,
        cidr,
        &[
            (a.subnet_managed, "true"),
            (a.backend_type, "host-gw"),
            (a.backend_public_ip, public_ip),
        ],
    )
}

fn attrs(public_ip: &str) -> LeaseAttrs {
    LeaseAttrs {
        public_ip: public_ip.parse().unwrap(),
        public_ipv6: None,
        backend_type: BackendType::HostGw,
        backend_data: Value::Null,
        backend_v6_data: Value::Null,
    }
}

fn manager(api: Arc<MemoryNodeRegistry>) -> RegistryManager {
    RegistryManager::new(api, config(), "node-a", DEFAULT_ANNOTATION_PREFIX).unwrap()
}

#[tokio::test]
async fn acquire_lease_annotates_own_node() {
    let api = Arc::new(MemoryNodeRegistry::new());
    api.upsert_node(node("node-a", "10.42.1.0/24", &[]));

    let sm = manager(api.clone());
    let lease = sm.acquire_lease(&attrs("192.168.0.1")).await.unwrap();

    assert_eq!(lease.subnet.to_string(), "10.42.1.0/24");
    assert!(lease.expiration.is_some());

    let a = keys();
    let stored = api.node("node-a").unwrap();
    assert_eq!(stored.annotations.get(&a.subnet_managed).unwrap(), "true");
    assert_eq!(
        stored.annotations.get(&a.backend_public_ip).unwrap(),
        "192.168.0.1"
    );
    assert_eq!(stored.annotations.get(&a.backend_type).unwrap(), "host-gw");
}

#[tokio::test]
async fn reacquire_with_same_attrs_does_not_write() {
    let api = Arc::new(MemoryNodeRegistry::new());
    api.upsert_node(node("node-a", "10.42.1.0/24", &[]));

    let sm = manager(api.clone());
    sm.acquire_lease(&attrs("192.168.0.1")).await.unwrap();
    let version_after_first = api.node("node-a").unwrap().version;

    sm.acquire_lease(&attrs("192.168.0.1")).await.unwrap();
    let version_after_second = api.node("node-a").unwrap().version;

    assert_eq!(version_after_first, version_after_second);
}

#[tokio::test]
async fn overwrite_annotation_forces_public_ip() {
    let a = keys();
    let api = Arc::new(MemoryNodeRegistry::new());
    api.upsert_node(node(
        "node-a",
        "10.42.1.0/24",
        &[(a.backend_public_ip_overwrite.clone(), "203.0.113.9")],
    ));

    let sm = manager(api.clone());
    let lease = sm.acquire_lease(&attrs("192.168.0.1")).await.unwrap();

    assert_eq!(lease.attrs.public_ip.to_string(), "203.0.113.9");
    let stored = api.node("node-a").unwrap();
    assert_eq!(
        stored.annotations.get(&a.backend_public_ip).unwrap(),
        "203.0.113.9"
    );
}

#[tokio::test]
async fn acquire_without_assigned_cidr_fails() {
    let api = Arc::new(MemoryNodeRegistry::new());
    api.upsert_node(NodeRecord {
        name: "node-a".to_string(),
        version: 0,
        annotations: BTreeMap::new(),
        pod_cidrs: Vec::new(),
    });

    let sm = manager(api);
    let err = sm.acquire_lease(&attrs("192.168.0.1")).await.unwrap_err();
    assert!(matches!(err, Error::CidrUnassigned { .. }));
}

#[tokio::test]
async fn snapshot_excludes_unmanaged_nodes() {
    let api = Arc::new(MemoryNodeRegistry::new());
    api.upsert_node(managed_peer("node-b", "10.42.2.0/24", "192.168.0.2"));
    api.upsert_node(node("node-c", "10.42.3.0/24", &[]));

    let sm = manager(api);
    let page = sm.watch_leases(None).await.unwrap();

    assert!(page.events.is_empty());
    assert_eq!(page.snapshot.len(), 1);
    assert_eq!(page.snapshot[0].subnet.to_string(), "10.42.2.0/24");
    assert!(page.cursor.is_some());
}

#[tokio::test]
async fn irrelevant_node_change_does_not_wake_watch() {
    let a = keys();
    let api = Arc::new(MemoryNodeRegistry::new());
    api.upsert_node(managed_peer("node-b", "10.42.2.0/24", "192.168.0.2"));

    let sm = manager(api.clone());
    let cursor = sm.watch_leases(None).await.unwrap().cursor.unwrap();

    // Touch an annotation no lease field is derived from.
    let mut peer = api.node("node-b").unwrap();
    peer.annotations
        .insert("example.io/heartbeat".to_string(), "1".to_string());
    api.upsert_node(peer);

    let waiting = tokio::time::timeout(Duration::from_millis(50), sm.watch_leases(Some(cursor)));
    assert!(waiting.await.is_err(), "suppressed event produced a page");

    // A lease-relevant change does wake it, and the suppressed event never
    // surfaces.
    let mut peer = api.node("node-b").unwrap();
    peer.annotations
        .insert(a.backend_public_ip.clone(), "192.168.0.20".to_string());
    api.upsert_node(peer);

    let page = sm.watch_leases(Some(cursor)).await.unwrap();
    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].event_type, EventType::Added);
    assert_eq!(
        page.events[0].lease.attrs.public_ip.to_string(),
        "192.168.0.20"
    );
}

#[tokio::test]
async fn node_deletion_emits_removed() {
    let api = Arc::new(MemoryNodeRegistry::new());
    api.upsert_node(managed_peer("node-b", "10.42.2.0/24", "192.168.0.2"));

    let sm = manager(api.clone());
    let cursor = sm.watch_leases(None).await.unwrap().cursor;

    api.remove_node("node-b");

    let page = sm.watch_leases(cursor).await.unwrap();
    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].event_type, EventType::Removed);
    assert_eq!(page.events[0].lease.subnet.to_string(), "10.42.2.0/24");
}

#[tokio::test]
async fn expired_cursor_falls_back_to_snapshot() {
    let api = Arc::new(MemoryNodeRegistry::new().with_retention(1));
    api.upsert_node(managed_peer("node-b", "10.42.2.0/24", "192.168.0.2"));
    api.upsert_node(managed_peer("node-c", "10.42.3.0/24", "192.168.0.3"));
    api.upsert_node(managed_peer("node-d", "10.42.4.0/24", "192.168.0.4"));

    let sm = manager(api);
    let page = sm.watch_leases(Some(Cursor(1))).await.unwrap();

    // History past cursor 1 is gone, so the store resyncs with a snapshot.
    assert!(page.events.is_empty());
    assert_eq!(page.snapshot.len(), 3);
    assert!(page.cursor.is_some());
}

/// Delegating registry that lands a concurrent edit on the node right
/// before the first patch, forcing a version conflict.
struct RacingRegistry {
    inner: Arc<MemoryNodeRegistry>,
    armed: AtomicBool,
}

#[async_trait]
impl NodeApi for RacingRegistry {
    async fn get_node(&self, name: &str) -> Result<NodeRecord> {
        self.inner.get_node(name).await
    }

    async fn list_nodes(&self) -> Result<(Vec<NodeRecord>, Cursor)> {
        self.inner.list_nodes().await
    }

    async fn watch_nodes(&self, cursor: Cursor) -> Result<NodeWatchPage> {
        self.inner.watch_nodes(cursor).await
    }

    async fn patch_node_annotations(
        &self,
        name: &str,
        expected_version: u64,
        annotations: BTreeMap<String, String>,
    ) -> Result<NodeRecord> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let mut record = self.inner.node(name).unwrap();
            record
                .annotations
                .insert("example.io/maintenance".to_string(), "draining".to_string());
            self.inner.upsert_node(record);
        }
        self.inner
            .patch_node_annotations(name, expected_version, annotations)
            .await
    }
}

#[tokio::test]
async fn acquire_retries_once_after_patch_conflict() {
    let inner = Arc::new(MemoryNodeRegistry::new());
    inner.upsert_node(node("node-a", "10.42.1.0/24", &[]));
    let api = Arc::new(RacingRegistry {
        inner: inner.clone(),
        armed: AtomicBool::new(true),
    });

    let sm = RegistryManager::new(api, config(), "node-a", DEFAULT_ANNOTATION_PREFIX).unwrap();
    let lease = sm.acquire_lease(&attrs("192.168.0.1")).await.unwrap();
    assert_eq!(lease.subnet.to_string(), "10.42.1.0/24");

    // The retry went through against the fresh version, and the concurrent
    // edit survived alongside the lease annotations.
    let a = keys();
    let stored = inner.node("node-a").unwrap();
    assert_eq!(stored.annotations.get(&a.subnet_managed).unwrap(), "true");
    assert_eq!(
        stored.annotations.get(&a.backend_public_ip).unwrap(),
        "192.168.0.1"
    );
    assert_eq!(
        stored.annotations.get("example.io/maintenance").unwrap(),
        "draining"
    );
}

#[tokio::test]
async fn stale_version_patch_is_rejected() {
    let api = Arc::new(MemoryNodeRegistry::new());
    api.upsert_node(node("node-a", "10.42.1.0/24", &[]));
    let version = api.node("node-a").unwrap().version;

    let err = api
        .patch_node_annotations("node-a", version + 5, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PatchConflict { .. }));
}
