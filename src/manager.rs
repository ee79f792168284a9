// The lease-store-agnostic manager contract.

use async_trait::async_trait;

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::lease::{Event, Lease, LeaseAttrs};

/// Opaque resume token for a lease watch. A consumer holding a cursor can
/// resume where the previous call left off; a stale cursor makes the store
/// fall back to a full snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor(pub u64);

/// One page of watch results: either incremental events or a full snapshot,
/// never both. `events` being non-empty marks the page as incremental.
#[derive(Debug, Default)]
pub struct LeaseWatchResult {
    pub events: Vec<Event>,
    pub snapshot: Vec<Lease>,
    pub cursor: Option<Cursor>,
}

/// Contract every lease store adapter satisfies.
#[async_trait]
pub trait Manager: Send + Sync {
    /// The validated network configuration this store serves.
    fn network_config(&self) -> &NetworkConfig;

    /// Register this member's lease. Idempotent: re-acquiring with identical
    /// attributes must not write to the store or churn peers. The member's
    /// subnet is assigned by the store's backing registry, never computed
    /// here.
    async fn acquire_lease(&self, attrs: &LeaseAttrs) -> Result<Lease>;

    /// Return the next page of lease changes. `None` asks for an initial
    /// snapshot. Blocks until something is available; returns
    /// `Error::Cancelled` on store shutdown.
    async fn watch_leases(&self, cursor: Option<Cursor>) -> Result<LeaseWatchResult>;
}
