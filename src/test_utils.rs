//! In-memory doubles for the node registry and the kernel route table,
//! shared between unit and integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::manager::Cursor;
use crate::registry::{NodeApi, NodeEvent, NodeRecord, NodeWatchPage};
use crate::routes::{Family, Route, RouteTable};

/// Node registry backed by a map and a bounded event log. Watches block on
/// a [`Notify`] until new events land; trimming the log lets tests exercise
/// the cursor-expiry path.
pub struct MemoryNodeRegistry {
    state: Mutex<RegistryState>,
    notify: Notify,
}

struct RegistryState {
    nodes: BTreeMap<String, NodeRecord>,
    log: VecDeque<(u64, NodeEvent)>,
    last_seq: u64,
    /// Highest sequence number discarded from the log.
    trimmed_to: u64,
    retain: usize,
    cancelled: bool,
    /// Pending injected watch failures.
    fail_watches: usize,
    list_calls: u64,
}

impl RegistryState {
    fn push_event(&mut self, event: NodeEvent) {
        self.last_seq += 1;
        self.log.push_back((self.last_seq, event));
        while self.log.len() > self.retain {
            if let Some((seq, _)) = self.log.pop_front() {
                self.trimmed_to = seq;
            }
        }
    }
}

impl Default for MemoryNodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNodeRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                nodes: BTreeMap::new(),
                log: VecDeque::new(),
                last_seq: 0,
                trimmed_to: 0,
                retain: usize::MAX,
                cancelled: false,
                fail_watches: 0,
                list_calls: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Cap the event log at `retain` entries so older cursors expire.
    pub fn with_retention(self, retain: usize) -> Self {
        self.state.lock().retain = retain;
        self
    }

    /// Create or replace a node record. The registry owns the version
    /// counter; whatever the caller set is overwritten.
    pub fn upsert_node(&self, mut record: NodeRecord) {
        {
            let mut state = self.state.lock();
            let old = state.nodes.get(&record.name).cloned();
            record.version = old.as_ref().map_or(1, |o| o.version + 1);
            state.nodes.insert(record.name.clone(), record.clone());
            state.push_event(NodeEvent::Upserted { old, new: record });
        }
        self.notify.notify_waiters();
    }

    pub fn remove_node(&self, name: &str) {
        {
            let mut state = self.state.lock();
            let Some(old) = state.nodes.remove(name) else {
                return;
            };
            state.push_event(NodeEvent::Deleted(old));
        }
        self.notify.notify_waiters();
    }

    /// Fail all pending and future watches with `Error::Cancelled`.
    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.notify.notify_waiters();
    }

    /// Make the next watch call fail with a transient store error. Any
    /// watch currently blocked is woken to take the failure.
    pub fn fail_next_watch(&self) {
        self.state.lock().fail_watches += 1;
        self.notify.notify_waiters();
    }

    /// Number of full listings served, for asserting a consumer did not
    /// fall back to a snapshot.
    pub fn list_count(&self) -> u64 {
        self.state.lock().list_calls
    }

    /// Current state of one node, for assertions.
    pub fn node(&self, name: &str) -> Option<NodeRecord> {
        self.state.lock().nodes.get(name).cloned()
    }
}

#[async_trait]
impl NodeApi for MemoryNodeRegistry {
    async fn get_node(&self, name: &str) -> Result<NodeRecord> {
        self.state
            .lock()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound {
                name: name.to_string(),
            })
    }

    async fn list_nodes(&self) -> Result<(Vec<NodeRecord>, Cursor)> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        let nodes = state.nodes.values().cloned().collect();
        Ok((nodes, Cursor(state.last_seq)))
    }

    async fn watch_nodes(&self, cursor: Cursor) -> Result<NodeWatchPage> {
        loop {
            // Register for wakeups before inspecting state, so an event
            // landing between the check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.cancelled {
                    return Err(Error::Cancelled);
                }
                if state.fail_watches > 0 {
                    state.fail_watches -= 1;
                    return Err(Error::StoreUnavailable(
                        "store temporarily unavailable".into(),
                    ));
                }
                if cursor.0 < state.trimmed_to {
                    return Err(Error::CursorExpired { cursor: cursor.0 });
                }

                let events: Vec<NodeEvent> = state
                    .log
                    .iter()
                    .filter(|(seq, _)| *seq > cursor.0)
                    .map(|(_, ev)| ev.clone())
                    .collect();
                if !events.is_empty() {
                    return Ok(NodeWatchPage {
                        events,
                        cursor: Cursor(state.last_seq),
                    });
                }
            }
            notified.await;
        }
    }

    async fn patch_node_annotations(
        &self,
        name: &str,
        expected_version: u64,
        annotations: BTreeMap<String, String>,
    ) -> Result<NodeRecord> {
        let patched = {
            let mut state = self.state.lock();
            let node = state
                .nodes
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NodeNotFound {
                    name: name.to_string(),
                })?;
            if node.version != expected_version {
                return Err(Error::PatchConflict {
                    name: name.to_string(),
                    expected: expected_version,
                    actual: node.version,
                });
            }

            let old = node.clone();
            let mut node = node;
            node.annotations.extend(annotations);
            node.version += 1;
            state.nodes.insert(name.to_string(), node.clone());
            state.push_event(NodeEvent::Upserted {
                old: Some(old),
                new: node.clone(),
            });
            node
        };
        self.notify.notify_waiters();
        Ok(patched)
    }
}

/// Route table backed by a plain vector. Duplicate adds are accepted, like
/// a kernel replace; deleting an absent route fails, like the kernel.
#[derive(Default)]
pub struct MemoryRouteTable {
    routes: Mutex<Vec<Route>>,
}

impl MemoryRouteTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drop every route, simulating external flushing of the table.
    pub fn flush(&self) {
        self.routes.lock().clear();
    }

    /// Insert a route behind the controller's back.
    pub fn insert_raw(&self, route: Route) {
        self.routes.lock().push(route);
    }

    pub fn routes(&self, family: Family) -> Vec<Route> {
        self.routes
            .lock()
            .iter()
            .copied()
            .filter(|r| r.family() == family)
            .collect()
    }
}

#[async_trait]
impl RouteTable for MemoryRouteTable {
    async fn add_route(&self, route: &Route) -> Result<()> {
        let mut routes = self.routes.lock();
        if !routes.contains(route) {
            routes.push(*route);
        }
        Ok(())
    }

    async fn del_route(&self, route: &Route) -> Result<()> {
        let mut routes = self.routes.lock();
        let Some(i) = routes.iter().position(|r| r == route) else {
            return Err(Error::RouteOp(format!(
                "no route to {} via {:?}",
                route.destination, route.gateway
            )));
        };
        routes.remove(i);
        Ok(())
    }

    async fn list_routes(&self, family: Family) -> Result<Vec<Route>> {
        Ok(self.routes(family))
    }
}
