// Node-registry-backed lease store.
//
// Each cluster member's lease is stored as a handful of string annotations
// on its own node record; the member's subnet itself comes from the
// orchestrator-owned CIDR field of that record. Lease validity is signalled
// by liveness of the record, so renewal is a no-op here.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde_json::Value;
use tracing::{info, warn};

use crate::backend::BackendType;
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::lease::{Event, EventType, Lease, LeaseAttrs};
use crate::manager::{Cursor, LeaseWatchResult, Manager};

pub const DEFAULT_ANNOTATION_PREFIX: &str = "overlay.weft.io/";

/// Acquired leases are stamped with a nominal day of validity; the record's
/// continued existence is what actually keeps the lease alive.
const LEASE_TTL_HOURS: i64 = 24;

/// Annotation keys under a validated prefix.
#[derive(Debug, Clone)]
pub struct Annotations {
    pub subnet_managed: String,
    pub backend_type: String,
    pub backend_data: String,
    pub backend_v6_data: String,
    pub backend_public_ip: String,
    pub backend_public_ipv6: String,
    pub backend_public_ip_overwrite: String,
    pub backend_public_ipv6_overwrite: String,
}

impl Annotations {
    pub fn new(prefix: &str) -> Result<Self> {
        if prefix.is_empty() || !prefix.ends_with('/') {
            return Err(Error::ConfigInvalid(format!(
                "annotation prefix {prefix:?} must end with '/'"
            )));
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-./".contains(c))
        {
            return Err(Error::ConfigInvalid(format!(
                "annotation prefix {prefix:?} contains invalid characters"
            )));
        }

        Ok(Self {
            subnet_managed: format!("{prefix}subnet-managed"),
            backend_type: format!("{prefix}backend-type"),
            backend_data: format!("{prefix}backend-data"),
            backend_v6_data: format!("{prefix}backend-v6-data"),
            backend_public_ip: format!("{prefix}backend-public-ip"),
            backend_public_ipv6: format!("{prefix}backend-public-ipv6"),
            backend_public_ip_overwrite: format!("{prefix}backend-public-ip-overwrite"),
            backend_public_ipv6_overwrite: format!("{prefix}backend-public-ipv6-overwrite"),
        })
    }
}

/// One member record in the backing registry.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub name: String,
    /// Store-assigned version, bumped on every write. Conditional patches
    /// compare against it.
    pub version: u64,
    pub annotations: BTreeMap<String, String>,
    /// Orchestrator-owned subnet assignment for this member.
    pub pod_cidrs: Vec<IpNet>,
}

impl NodeRecord {
    pub fn first_v4_cidr(&self) -> Option<Ipv4Net> {
        self.pod_cidrs.iter().find_map(|c| match c {
            IpNet::V4(n) => Some(*n),
            IpNet::V6(_) => None,
        })
    }

    pub fn first_v6_cidr(&self) -> Option<Ipv6Net> {
        self.pod_cidrs.iter().find_map(|c| match c {
            IpNet::V6(n) => Some(*n),
            IpNet::V4(_) => None,
        })
    }
}

/// A raw change to the node set.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Creation or modification; `old` is the prior state when known.
    Upserted {
        old: Option<NodeRecord>,
        new: NodeRecord,
    },
    Deleted(NodeRecord),
}

#[derive(Debug)]
pub struct NodeWatchPage {
    pub events: Vec<NodeEvent>,
    pub cursor: Cursor,
}

/// Raw client for the node registry. Implementations wrap the actual
/// orchestrator API; an in-memory one lives in `test_utils`.
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<NodeRecord>;

    /// Full node listing plus the cursor the listing is current as of.
    async fn list_nodes(&self) -> Result<(Vec<NodeRecord>, Cursor)>;

    /// Block until node events past `cursor` exist, then return them.
    /// Returns `Error::CursorExpired` when the store's history window has
    /// advanced past the cursor, and `Error::Cancelled` on store shutdown.
    async fn watch_nodes(&self, cursor: Cursor) -> Result<NodeWatchPage>;

    /// Set the given annotations on a node, leaving all other fields and
    /// annotations untouched. Fails with `Error::PatchConflict` if the
    /// record's version no longer equals `expected_version`.
    async fn patch_node_annotations(
        &self,
        name: &str,
        expected_version: u64,
        annotations: BTreeMap<String, String>,
    ) -> Result<NodeRecord>;
}

/// Lease store adapter over a node registry.
pub struct RegistryManager {
    api: Arc<dyn NodeApi>,
    config: NetworkConfig,
    node_name: String,
    annotations: Annotations,
}

impl RegistryManager {
    pub fn new(
        api: Arc<dyn NodeApi>,
        config: NetworkConfig,
        node_name: impl Into<String>,
        annotation_prefix: &str,
    ) -> Result<Self> {
        Ok(Self {
            api,
            config,
            node_name: node_name.into(),
            annotations: Annotations::new(annotation_prefix)?,
        })
    }

    fn is_managed(&self, node: &NodeRecord) -> bool {
        node.annotations
            .get(&self.annotations.subnet_managed)
            .is_some_and(|v| v == "true")
    }

    /// The annotations `acquire_lease` wants on our own record, plus the
    /// attrs as actually advertised (public addresses may be forced by the
    /// overwrite annotations).
    fn desired_annotations(
        &self,
        node: &NodeRecord,
        attrs: &LeaseAttrs,
    ) -> Result<(BTreeMap<String, String>, LeaseAttrs)> {
        let a = &self.annotations;
        let mut effective = attrs.clone();
        let mut desired = BTreeMap::new();

        desired.insert(a.backend_type.clone(), attrs.backend_type.to_string());
        desired.insert(
            a.backend_data.clone(),
            serde_json::to_string(&attrs.backend_data)?,
        );

        match node.annotations.get(&a.backend_public_ip_overwrite) {
            Some(ov) if !ov.is_empty() => {
                let forced: Ipv4Addr = ov.parse()?;
                if forced != attrs.public_ip {
                    info!(forced = %forced, "overriding public ip from node annotation");
                }
                effective.public_ip = forced;
            }
            _ => {}
        }
        desired.insert(a.backend_public_ip.clone(), effective.public_ip.to_string());

        if let Some(public_ipv6) = attrs.public_ipv6 {
            let mut effective_v6 = public_ipv6;
            match node.annotations.get(&a.backend_public_ipv6_overwrite) {
                Some(ov) if !ov.is_empty() => {
                    let forced = ov.parse()?;
                    if forced != public_ipv6 {
                        info!(forced = %forced, "overriding public ipv6 from node annotation");
                    }
                    effective_v6 = forced;
                }
                _ => {}
            }
            effective.public_ipv6 = Some(effective_v6);
            desired.insert(a.backend_public_ipv6.clone(), effective_v6.to_string());
            desired.insert(
                a.backend_v6_data.clone(),
                serde_json::to_string(&attrs.backend_v6_data)?,
            );
        }

        desired.insert(a.subnet_managed.clone(), "true".to_string());
        Ok((desired, effective))
    }

    fn own_lease(&self, node: &NodeRecord, attrs: LeaseAttrs) -> Result<Lease> {
        let subnet = match node.first_v4_cidr() {
            Some(subnet) => subnet,
            None if self.config.enable_ipv4 => {
                return Err(Error::CidrUnassigned {
                    name: node.name.clone(),
                })
            }
            None => Ipv4Net::default(),
        };
        let ipv6_subnet = node.first_v6_cidr();

        Ok(Lease {
            enable_ipv4: self.config.enable_ipv4,
            enable_ipv6: self.config.enable_ipv6 && ipv6_subnet.is_some(),
            subnet,
            ipv6_subnet,
            attrs,
            expiration: Some(Utc::now() + chrono::Duration::hours(LEASE_TTL_HOURS)),
        })
    }

    /// Translate a peer node record into its lease.
    fn node_to_lease(&self, node: &NodeRecord) -> Result<Lease> {
        let a = &self.annotations;
        let backend_type: BackendType = node
            .annotations
            .get(&a.backend_type)
            .map(String::as_str)
            .unwrap_or_default()
            .parse()?;

        let mut attrs = LeaseAttrs {
            public_ip: Ipv4Addr::UNSPECIFIED,
            public_ipv6: None,
            backend_type,
            backend_data: Value::Null,
            backend_v6_data: Value::Null,
        };
        let mut subnet = Ipv4Net::default();
        let mut ipv6_subnet = None;

        if self.config.enable_ipv4 {
            attrs.public_ip = node
                .annotations
                .get(&a.backend_public_ip)
                .ok_or_else(|| Error::StoreUnavailable(format!(
                    "node {:?} is managed but has no public ip annotation",
                    node.name
                )))?
                .parse()?;
            attrs.backend_data = json_annotation(node.annotations.get(&a.backend_data));
            subnet = node.first_v4_cidr().ok_or_else(|| Error::CidrUnassigned {
                name: node.name.clone(),
            })?;
        }

        if self.config.enable_ipv6 {
            if let Some(ip) = node.annotations.get(&a.backend_public_ipv6) {
                attrs.public_ipv6 = Some(ip.parse()?);
                attrs.backend_v6_data = json_annotation(node.annotations.get(&a.backend_v6_data));
            }
            ipv6_subnet = node.first_v6_cidr();
        }

        Ok(Lease {
            enable_ipv4: self.config.enable_ipv4,
            enable_ipv6: self.config.enable_ipv6 && ipv6_subnet.is_some(),
            subnet,
            ipv6_subnet,
            attrs,
            expiration: None,
        })
    }

    /// Whether a node modification touched anything lease-relevant. Changes
    /// to unrelated fields on the record must not ripple out as events.
    fn lease_fields_changed(&self, old: &NodeRecord, new: &NodeRecord) -> bool {
        let a = &self.annotations;
        let differs = |key: &String| old.annotations.get(key) != new.annotations.get(key);

        let mut changed = false;
        if self.config.enable_ipv4 {
            changed |=
                differs(&a.backend_data) || differs(&a.backend_type) || differs(&a.backend_public_ip);
        }
        if self.config.enable_ipv6 {
            changed |= differs(&a.backend_v6_data)
                || differs(&a.backend_type)
                || differs(&a.backend_public_ipv6);
        }
        changed
    }

    fn translate(&self, node_events: Vec<NodeEvent>) -> Vec<Event> {
        let mut out = Vec::new();

        for node_event in node_events {
            match node_event {
                NodeEvent::Upserted { old, new } => {
                    if !self.is_managed(&new) {
                        continue;
                    }
                    if let Some(old) = &old {
                        if self.is_managed(old) && !self.lease_fields_changed(old, &new) {
                            continue;
                        }
                    }
                    match self.node_to_lease(&new) {
                        Ok(lease) => out.push(Event {
                            event_type: EventType::Added,
                            lease,
                        }),
                        Err(err) => {
                            info!(node = %new.name, %err, "skipping node with unreadable lease");
                        }
                    }
                }
                NodeEvent::Deleted(node) => {
                    if !self.is_managed(&node) {
                        continue;
                    }
                    match self.node_to_lease(&node) {
                        Ok(lease) => out.push(Event {
                            event_type: EventType::Removed,
                            lease,
                        }),
                        Err(err) => {
                            info!(node = %node.name, %err, "skipping deleted node with unreadable lease");
                        }
                    }
                }
            }
        }

        out
    }

    async fn snapshot_page(&self) -> Result<LeaseWatchResult> {
        let (nodes, cursor) = self.api.list_nodes().await?;

        let mut snapshot = Vec::new();
        for node in nodes.iter().filter(|n| self.is_managed(n)) {
            match self.node_to_lease(node) {
                Ok(lease) => snapshot.push(lease),
                Err(err) => info!(node = %node.name, %err, "skipping node with unreadable lease"),
            }
        }

        Ok(LeaseWatchResult {
            events: Vec::new(),
            snapshot,
            cursor: Some(cursor),
        })
    }
}

fn json_annotation(raw: Option<&String>) -> Value {
    match raw {
        Some(s) if !s.is_empty() => serde_json::from_str(s).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

#[async_trait]
impl Manager for RegistryManager {
    fn network_config(&self) -> &NetworkConfig {
        &self.config
    }

    async fn acquire_lease(&self, attrs: &LeaseAttrs) -> Result<Lease> {
        let node = self.api.get_node(&self.node_name).await?;
        let (desired, effective) = self.desired_annotations(&node, attrs)?;
        let lease = self.own_lease(&node, effective)?;

        let current_matches = desired
            .iter()
            .all(|(k, v)| node.annotations.get(k) == Some(v));
        if current_matches {
            // Nothing to write; re-acquisition must not churn peers.
            return Ok(lease);
        }

        match self
            .api
            .patch_node_annotations(&self.node_name, node.version, desired)
            .await
        {
            Ok(_) => Ok(lease),
            Err(Error::PatchConflict { .. }) => {
                // Someone edited the record between our read and write.
                // Re-read and patch once more against the fresh version.
                warn!(node = %self.node_name, "lease patch conflicted, retrying");
                let node = self.api.get_node(&self.node_name).await?;
                let (desired, effective) = self.desired_annotations(&node, attrs)?;
                let lease = self.own_lease(&node, effective)?;
                self.api
                    .patch_node_annotations(&self.node_name, node.version, desired)
                    .await?;
                Ok(lease)
            }
            Err(err) => Err(err),
        }
    }

    async fn watch_leases(&self, cursor: Option<Cursor>) -> Result<LeaseWatchResult> {
        let Some(mut cursor) = cursor else {
            return self.snapshot_page().await;
        };

        loop {
            let page = match self.api.watch_nodes(cursor).await {
                Ok(page) => page,
                Err(Error::CursorExpired { cursor }) => {
                    warn!(cursor, "watch cursor fell behind, resyncing from snapshot");
                    return self.snapshot_page().await;
                }
                Err(err) => return Err(err),
            };

            cursor = page.cursor;
            let events = self.translate(page.events);
            if !events.is_empty() {
                return Ok(LeaseWatchResult {
                    events,
                    snapshot: Vec::new(),
                    cursor: Some(cursor),
                });
            }
            // Every node event on this page was lease-irrelevant; keep
            // waiting rather than hand the consumer an ambiguous empty page.
        }
    }
}
