// Backend selection - how a peer lease is turned into kernel route objects.
//
// The backend is chosen once at configuration time and never re-dispatched
// per event.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::lease::Lease;
use crate::routes::Route;

/// Discriminator carried in the network configuration and in every lease's
/// attributes. Peers running a different backend are ignored by the route
/// controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendType {
    /// Direct routing: peer subnets are reachable through the peer's public
    /// IP as a next-hop gateway on the external interface.
    #[default]
    HostGw,
    /// Tunnel encapsulation: peer subnets are routed into a local tunnel
    /// device, which handles delivery itself.
    Ipip,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostGw => write!(f, "host-gw"),
            Self::Ipip => write!(f, "ipip"),
        }
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host-gw" => Ok(Self::HostGw),
            "ipip" => Ok(Self::Ipip),
            other => Err(Error::UnknownBackend(other.to_string())),
        }
    }
}

/// Route-construction rule for the selected backend.
#[derive(Debug, Clone, Copy)]
pub enum RouteScheme {
    /// Destination = peer subnet, gateway = peer public IP, output = the
    /// external interface.
    HostGateway { link_index: u32 },
    /// Destination = peer subnet, no gateway, output = the tunnel device.
    Tunnel { link_index: u32 },
}

impl RouteScheme {
    pub fn for_backend(backend_type: BackendType, link_index: u32) -> Self {
        match backend_type {
            BackendType::HostGw => Self::HostGateway { link_index },
            BackendType::Ipip => Self::Tunnel { link_index },
        }
    }

    /// The IPv4 route implied by a peer lease.
    pub fn v4_route(&self, lease: &Lease) -> Route {
        match *self {
            Self::HostGateway { link_index } => Route {
                destination: IpNet::V4(lease.subnet),
                gateway: Some(IpAddr::V4(lease.attrs.public_ip)),
                link_index,
            },
            Self::Tunnel { link_index } => Route {
                destination: IpNet::V4(lease.subnet),
                gateway: None,
                link_index,
            },
        }
    }

    /// The IPv6 route implied by a peer lease, if the lease carries the
    /// necessary dual-stack fields.
    pub fn v6_route(&self, lease: &Lease) -> Option<Route> {
        let subnet = lease.ipv6_subnet?;
        match *self {
            Self::HostGateway { link_index } => {
                let gw = lease.attrs.public_ipv6?;
                Some(Route {
                    destination: IpNet::V6(subnet),
                    gateway: Some(IpAddr::V6(gw)),
                    link_index,
                })
            }
            Self::Tunnel { link_index } => Some(Route {
                destination: IpNet::V6(subnet),
                gateway: None,
                link_index,
            }),
        }
    }
}
