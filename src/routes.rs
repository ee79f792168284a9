// Route synchronization - converges kernel routing state with the set of
// peer leases learned from the watch.
//
// All kernel mutations are issued from a single task: the event loop and the
// periodic audit share one `select!`, so the route table never sees
// conflicting concurrent calls from this controller.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendType, RouteScheme};
use crate::error::Result;
use crate::lease::{Event, EventType};

/// How often the audit pass re-reads live kernel state to repair drift.
pub const ROUTE_AUDIT_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// One kernel route entry. Two routes are the same route only if
/// destination, gateway and output interface all agree; a route differing
/// only in link index (the physical link was recreated) is a different
/// route and gets replaced, not skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub link_index: u32,
}

impl Route {
    pub fn family(&self) -> Family {
        match self.destination {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }
}

/// The kernel route table boundary.
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Install a route. Adding a route that already exists identically must
    /// succeed, so audit re-installs never fail against a concurrent source.
    async fn add_route(&self, route: &Route) -> Result<()>;
    async fn del_route(&self, route: &Route) -> Result<()>;
    async fn list_routes(&self, family: Family) -> Result<Vec<Route>>;
}

/// Keeps a one-to-one correspondence between known peer leases and kernel
/// routes, and repairs drift on a timer.
pub struct RouteManager {
    backend_type: BackendType,
    scheme: RouteScheme,
    table: Arc<dyn RouteTable>,
    /// Managed route set: every route this controller believes it owns.
    routes: Vec<Route>,
    v6_routes: Vec<Route>,
    audit_period: Duration,
}

impl RouteManager {
    pub fn new(backend_type: BackendType, scheme: RouteScheme, table: Arc<dyn RouteTable>) -> Self {
        Self {
            backend_type,
            scheme,
            table,
            routes: Vec::new(),
            v6_routes: Vec::new(),
            audit_period: ROUTE_AUDIT_PERIOD,
        }
    }

    pub fn with_audit_period(mut self, period: Duration) -> Self {
        self.audit_period = period;
        self
    }

    /// Routes currently tracked for the given family.
    pub fn managed_routes(&self, family: Family) -> &[Route] {
        match family {
            Family::V4 => &self.routes,
            Family::V6 => &self.v6_routes,
        }
    }

    /// Event-consumption and audit loop. Events are applied serially;
    /// returns when the event channel closes or shutdown is signalled.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Vec<Event>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut audit = tokio::time::interval(self.audit_period);
        audit.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("route manager shutting down");
                    return;
                }
                batch = events.recv() => match batch {
                    Some(batch) => self.handle_events(&batch).await,
                    None => {
                        info!("lease event channel closed");
                        return;
                    }
                },
                _ = audit.tick() => self.audit().await,
            }
        }
    }

    /// Apply one batch of lease events to the kernel table.
    pub async fn handle_events(&mut self, batch: &[Event]) {
        for event in batch {
            let lease = &event.lease;
            if lease.attrs.backend_type != self.backend_type {
                warn!(
                    subnet = %lease.subnet,
                    backend = %lease.attrs.backend_type,
                    "ignoring lease of foreign backend type"
                );
                continue;
            }

            match event.event_type {
                EventType::Added => {
                    if lease.enable_ipv4 {
                        info!(subnet = %lease.subnet, via = %lease.attrs.public_ip, "subnet added");
                        let route = self.scheme.v4_route(lease);
                        self.apply_route(route).await;
                    }
                    if lease.enable_ipv6 {
                        if let Some(route) = self.scheme.v6_route(lease) {
                            info!(subnet = %route.destination, "ipv6 subnet added");
                            self.apply_route(route).await;
                        }
                    }
                }
                EventType::Removed => {
                    if lease.enable_ipv4 {
                        info!(subnet = %lease.subnet, "subnet removed");
                        let route = self.scheme.v4_route(lease);
                        self.remove_route(route).await;
                    }
                    if lease.enable_ipv6 {
                        if let Some(route) = self.scheme.v6_route(lease) {
                            info!(subnet = %route.destination, "ipv6 subnet removed");
                            self.remove_route(route).await;
                        }
                    }
                }
            }
        }
    }

    /// Install one implied route, replacing any conflicting kernel route to
    /// the same destination. The route joins the managed set before any
    /// kernel call, so an install failure is retried by the next audit pass
    /// rather than dropping the lease.
    async fn apply_route(&mut self, route: Route) {
        self.track(route);

        let existing = match self.table.list_routes(route.family()).await {
            Ok(list) => list
                .into_iter()
                .find(|r| r.destination == route.destination),
            Err(err) => {
                warn!(%err, "unable to list routes");
                None
            }
        };

        if let Some(current) = existing {
            if current == route {
                debug!(destination = %route.destination, "route already correct, skipping");
                return;
            }
            warn!(
                destination = %route.destination,
                old_gateway = ?current.gateway,
                new_gateway = ?route.gateway,
                "replacing existing route"
            );
            if let Err(err) = self.table.del_route(&current).await {
                error!(destination = %current.destination, %err, "error deleting stale route");
                return;
            }
            self.untrack(&current);
        }

        if let Err(err) = self.table.add_route(&route).await {
            // Stays in the managed set; the audit loop retries it.
            error!(destination = %route.destination, %err, "error adding route");
        }
    }

    /// Drop one implied route. The managed set entry goes away regardless
    /// of the kernel outcome; whatever state remains is picked up by a
    /// later audit pass.
    async fn remove_route(&mut self, route: Route) {
        self.untrack(&route);
        if let Err(err) = self.table.del_route(&route).await {
            error!(destination = %route.destination, %err, "error deleting route");
        }
    }

    /// Self-healing pass: re-install every managed route missing from the
    /// live table. Absence is expected after external interference or a
    /// restart, so re-installation is idempotent.
    pub async fn audit(&mut self) {
        self.audit_family(Family::V4).await;
        self.audit_family(Family::V6).await;
    }

    async fn audit_family(&mut self, family: Family) {
        let live = match self.table.list_routes(family).await {
            Ok(live) => live,
            Err(err) => {
                error!(%err, "error fetching route list, will retry next pass");
                return;
            }
        };

        let tracked: Vec<Route> = self.managed_routes(family).to_vec();
        for route in tracked {
            if live.contains(&route) {
                continue;
            }
            match self.table.add_route(&route).await {
                Ok(()) => info!(destination = %route.destination, gateway = ?route.gateway, "route recovered"),
                Err(err) => error!(destination = %route.destination, %err, "error recovering route"),
            }
        }
    }

    fn track(&mut self, route: Route) {
        let list = self.routes_mut(route.family());
        if !list.contains(&route) {
            list.push(route);
        }
    }

    fn untrack(&mut self, route: &Route) {
        self.routes_mut(route.family()).retain(|r| r != route);
    }

    fn routes_mut(&mut self, family: Family) -> &mut Vec<Route> {
        match family {
            Family::V4 => &mut self.routes,
            Family::V6 => &mut self.v6_routes,
        }
    }
}
