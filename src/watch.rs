// Lease watch reconciliation - turns raw watch pages into a deduplicated,
// ordered stream of Added/Removed events, handling "fall-behind" snapshots
// by diffing against the previously-observed lease set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::lease::{Event, EventType, Lease};
use crate::manager::Manager;

/// Fixed backoff between retries after a transient watch failure.
pub const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Long-term watch of the network's subnet leases. Communicates
/// addition/removal batches on `tx`; events matching `own_lease` are never
/// emitted. Returns (dropping `tx`, which closes the consumer's channel)
/// on cancellation or when the consumer goes away; any other store error is
/// retried from the last known cursor after a fixed backoff.
pub async fn watch_leases(
    sm: Arc<dyn Manager>,
    own_lease: Option<Lease>,
    tx: mpsc::Sender<Vec<Event>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lw = LeaseWatcher::new(own_lease);
    let mut cursor = None;

    loop {
        let res = tokio::select! {
            _ = shutdown.changed() => {
                info!("shutdown signalled, closing lease event channel");
                return;
            }
            res = sm.watch_leases(cursor) => res,
        };

        let res = match res {
            Ok(res) => res,
            Err(err) if err.is_transient() => {
                error!(%err, "lease watch failed");
                tokio::select! {
                    _ = shutdown.changed() => return,
                    () = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                }
                continue;
            }
            Err(_) => {
                info!("watch cancelled, closing lease event channel");
                return;
            }
        };

        cursor = res.cursor;

        let batch = if res.events.is_empty() {
            lw.reset(res.snapshot)
        } else {
            lw.update(res.events)
        };

        if !batch.is_empty() && tx.send(batch).await.is_err() {
            // Consumer gone.
            return;
        }
    }
}

/// Diffing state for one watch: the previously-observed set of peer leases.
/// Owned exclusively by the watch loop.
pub struct LeaseWatcher {
    own_lease: Option<Lease>,
    leases: Vec<Lease>,
}

impl LeaseWatcher {
    pub fn new(own_lease: Option<Lease>) -> Self {
        Self {
            own_lease,
            leases: Vec::new(),
        }
    }

    /// The current cache of peer leases.
    pub fn leases(&self) -> &[Lease] {
        &self.leases
    }

    fn is_own(&self, lease: &Lease) -> bool {
        self.own_lease
            .as_ref()
            .is_some_and(|own| lease.same_subnets(own))
    }

    /// Snapshot-diff: reconcile a full snapshot against the cache, emitting
    /// Added for unknown leases and Removed for cache entries the snapshot
    /// no longer contains. The cache is replaced wholesale afterwards.
    pub fn reset(&mut self, snapshot: Vec<Lease>) -> Vec<Event> {
        let mut batch = Vec::new();
        let mut old = std::mem::take(&mut self.leases);

        for new_lease in &snapshot {
            if self.is_own(new_lease) {
                continue;
            }
            if let Some(i) = old.iter().position(|ol| ol.same_subnets(new_lease)) {
                // Already known, no event.
                old.remove(i);
            } else {
                batch.push(Event {
                    event_type: EventType::Added,
                    lease: new_lease.clone(),
                });
            }
        }

        // Everything left in the old cache is stale. A stale copy of our own
        // lease is purged without an event.
        for lease in old {
            if self.is_own(&lease) {
                continue;
            }
            batch.push(Event {
                event_type: EventType::Removed,
                lease,
            });
        }

        self.leases = snapshot;
        batch
    }

    /// Incremental-apply: fold raw events into the cache, suppressing any
    /// that refer to this node's own lease.
    pub fn update(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut batch = Vec::new();

        for event in events {
            if self.is_own(&event.lease) {
                continue;
            }
            match event.event_type {
                EventType::Added => batch.push(self.add(event.lease)),
                EventType::Removed => batch.push(self.remove(event.lease)),
            }
        }

        batch
    }

    fn add(&mut self, lease: Lease) -> Event {
        if let Some(i) = self.leases.iter().position(|l| l.same_subnets(&lease)) {
            self.leases[i] = lease.clone();
        } else {
            self.leases.push(lease.clone());
        }
        Event {
            event_type: EventType::Added,
            lease,
        }
    }

    fn remove(&mut self, lease: Lease) -> Event {
        if let Some(i) = self.leases.iter().position(|l| l.same_subnets(&lease)) {
            let removed = self.leases.remove(i);
            return Event {
                event_type: EventType::Removed,
                lease: removed,
            };
        }

        // The cache had already diverged; emit the removal anyway and let
        // the consumer converge.
        warn!(
            subnet = %lease.subnet,
            ipv6_subnet = ?lease.ipv6_subnet,
            "removed lease was not found in cache"
        );
        Event {
            event_type: EventType::Removed,
            lease,
        }
    }
}
