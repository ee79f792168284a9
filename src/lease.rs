// Core lease data structures.

use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::BackendType;

/// Metadata describing how to reach a lease's owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseAttrs {
    /// Publicly reachable address of the owning member.
    pub public_ip: Ipv4Addr,
    pub public_ipv6: Option<Ipv6Addr>,
    pub backend_type: BackendType,
    /// Opaque backend-specific payload, stored and relayed verbatim.
    #[serde(default)]
    pub backend_data: Value,
    #[serde(default)]
    pub backend_v6_data: Value,
}

/// One cluster member's exclusively-owned slice of the overlay address
/// space. Value data: no component mutates another node's lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub subnet: Ipv4Net,
    pub ipv6_subnet: Option<Ipv6Net>,
    pub attrs: LeaseAttrs,
    /// Set by the owner at acquisition; peers discovering the lease through
    /// the store may not see one. The node-registry backend signals validity
    /// through liveness of the backing record, not through this timestamp.
    pub expiration: Option<DateTime<Utc>>,
}

impl Lease {
    /// Subnet identity match, keyed on this lease's enabled address
    /// families: every family this lease enables must equal the other
    /// lease's corresponding subnet. A lease with neither family flagged is
    /// compared by its IPv4 subnet, for stores that do not record the flags.
    pub fn same_subnets(&self, other: &Lease) -> bool {
        match (self.enable_ipv4, self.enable_ipv6) {
            (true, false) | (false, false) => self.subnet == other.subnet,
            (false, true) => self.ipv6_subnet.is_some() && self.ipv6_subnet == other.ipv6_subnet,
            (true, true) => {
                self.subnet == other.subnet && self.ipv6_subnet == other.ipv6_subnet
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Removed,
}

/// A single change to the global lease set, as seen by watch consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub lease: Lease,
}
