// Network configuration - parsing, defaulting and invariant validation.
//
// All invariants are checked at construction time; a config that parses is
// safe to allocate from. No lease is acquired and no watch is started before
// this succeeds.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;
use serde_json::Value;

use crate::backend::BackendType;
use crate::error::{Error, Result};
use crate::ip;

/// The overlay network range and per-host subnet sizing, immutable once
/// parsed.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
    pub network: Ipv4Net,
    pub ipv6_network: Option<Ipv6Net>,
    /// Lowest subnet base address leases may occupy.
    pub subnet_min: Ipv4Addr,
    /// Highest subnet base address leases may occupy.
    pub subnet_max: Ipv4Addr,
    pub subnet_len: u8,
    pub ipv6_subnet_min: Option<Ipv6Addr>,
    pub ipv6_subnet_max: Option<Ipv6Addr>,
    pub ipv6_subnet_len: u8,
    pub backend_type: BackendType,
    /// The raw Backend clause, handed to the backend untouched.
    pub backend: Value,
}

/// Wire shape of the configuration document.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "EnableIPv4", default = "default_true")]
    enable_ipv4: bool,
    #[serde(rename = "EnableIPv6", default)]
    enable_ipv6: bool,
    #[serde(rename = "Network")]
    network: Option<Ipv4Net>,
    #[serde(rename = "IPv6Network")]
    ipv6_network: Option<Ipv6Net>,
    #[serde(rename = "SubnetMin")]
    subnet_min: Option<Ipv4Addr>,
    #[serde(rename = "SubnetMax")]
    subnet_max: Option<Ipv4Addr>,
    #[serde(rename = "SubnetLen", default)]
    subnet_len: u8,
    #[serde(rename = "IPv6SubnetLen", default)]
    ipv6_subnet_len: u8,
    #[serde(rename = "IPv6SubnetMin")]
    ipv6_subnet_min: Option<Ipv6Addr>,
    #[serde(rename = "IPv6SubnetMax")]
    ipv6_subnet_max: Option<Ipv6Addr>,
    #[serde(rename = "Backend")]
    backend: Option<Value>,
}

fn default_true() -> bool {
    true
}

impl NetworkConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(s)?;

        let mut cfg = NetworkConfig {
            enable_ipv4: raw.enable_ipv4,
            enable_ipv6: raw.enable_ipv6,
            network: Ipv4Net::default(),
            ipv6_network: None,
            subnet_min: Ipv4Addr::UNSPECIFIED,
            subnet_max: Ipv4Addr::UNSPECIFIED,
            subnet_len: 0,
            ipv6_subnet_min: None,
            ipv6_subnet_max: None,
            ipv6_subnet_len: 0,
            backend_type: parse_backend_type(raw.backend.as_ref())?,
            backend: raw.backend.unwrap_or(Value::Null),
        };

        if cfg.enable_ipv4 {
            let network = raw
                .network
                .ok_or_else(|| Error::ConfigInvalid("Network is required".into()))?
                .trunc();
            cfg.network = network;

            cfg.subnet_len = if raw.subnet_len > 0 {
                // The subnet needs room for a tunnel and a bridge device on
                // each host.
                if raw.subnet_len > 30 {
                    return Err(Error::ConfigInvalid("SubnetLen must be less than /31".into()));
                }
                // The first subnet is never allocated, so splitting in two
                // would leave a single usable subnet.
                if raw.subnet_len < network.prefix_len() + 2 {
                    return Err(Error::ConfigInvalid(
                        "Network must be able to accommodate at least four subnets".into(),
                    ));
                }
                raw.subnet_len
            } else if network.prefix_len() > 28 {
                return Err(Error::ConfigInvalid(
                    "Network is too small. Minimum useful network prefix is /28".into(),
                ));
            } else if network.prefix_len() <= 22 {
                // Big enough to give each host a /24.
                24
            } else {
                // Split into four subnets.
                network.prefix_len() + 2
            };

            cfg.subnet_min = match raw.subnet_min {
                None => ip::v4_first_subnet(&network, cfg.subnet_len),
                Some(min) if network.contains(&min) => min,
                Some(_) => {
                    return Err(Error::ConfigInvalid(
                        "SubnetMin is not in the range of the Network".into(),
                    ))
                }
            };

            cfg.subnet_max = match raw.subnet_max {
                None => ip::v4_last_subnet(&network, cfg.subnet_len),
                Some(max) if network.contains(&max) => max,
                Some(_) => {
                    return Err(Error::ConfigInvalid(
                        "SubnetMax is not in the range of the Network".into(),
                    ))
                }
            };

            if !ip::v4_aligned(cfg.subnet_min, cfg.subnet_len) {
                return Err(Error::ConfigInvalid(format!(
                    "SubnetMin is not on a SubnetLen boundary: {}",
                    cfg.subnet_min
                )));
            }
            if !ip::v4_aligned(cfg.subnet_max, cfg.subnet_len) {
                return Err(Error::ConfigInvalid(format!(
                    "SubnetMax is not on a SubnetLen boundary: {}",
                    cfg.subnet_max
                )));
            }
        }

        if cfg.enable_ipv6 {
            let network = raw
                .ipv6_network
                .ok_or_else(|| Error::ConfigInvalid("IPv6Network is required".into()))?
                .trunc();
            cfg.ipv6_network = Some(network);

            cfg.ipv6_subnet_len = if raw.ipv6_subnet_len > 0 {
                if raw.ipv6_subnet_len > 126 {
                    return Err(Error::ConfigInvalid("IPv6SubnetLen must be less than /127".into()));
                }
                if raw.ipv6_subnet_len < network.prefix_len() + 2 {
                    return Err(Error::ConfigInvalid(
                        "IPv6Network must be able to accommodate at least four subnets".into(),
                    ));
                }
                raw.ipv6_subnet_len
            } else if network.prefix_len() > 124 {
                return Err(Error::ConfigInvalid(
                    "IPv6Network is too small. Minimum useful network prefix is /124".into(),
                ));
            } else if network.prefix_len() <= 62 {
                // Big enough to give each host a /64.
                64
            } else {
                network.prefix_len() + 2
            };

            let min = match raw.ipv6_subnet_min {
                None => ip::v6_first_subnet(&network, cfg.ipv6_subnet_len),
                Some(min) if network.contains(&min) => min,
                Some(_) => {
                    return Err(Error::ConfigInvalid(
                        "IPv6SubnetMin is not in the range of the IPv6Network".into(),
                    ))
                }
            };

            let max = match raw.ipv6_subnet_max {
                None => ip::v6_last_subnet(&network, cfg.ipv6_subnet_len),
                Some(max) if network.contains(&max) => max,
                Some(_) => {
                    return Err(Error::ConfigInvalid(
                        "IPv6SubnetMax is not in the range of the IPv6Network".into(),
                    ))
                }
            };

            if !ip::v6_aligned(min, cfg.ipv6_subnet_len) {
                return Err(Error::ConfigInvalid(format!(
                    "IPv6SubnetMin is not on a SubnetLen boundary: {min}"
                )));
            }
            if !ip::v6_aligned(max, cfg.ipv6_subnet_len) {
                return Err(Error::ConfigInvalid(format!(
                    "IPv6SubnetMax is not on a SubnetLen boundary: {max}"
                )));
            }

            cfg.ipv6_subnet_min = Some(min);
            cfg.ipv6_subnet_max = Some(max);
        }

        Ok(cfg)
    }
}

fn parse_backend_type(backend: Option<&Value>) -> Result<BackendType> {
    match backend.and_then(|b| b.get("Type")) {
        None => Ok(BackendType::default()),
        Some(Value::String(t)) => t.parse(),
        Some(_) => Err(Error::ConfigInvalid("Backend.Type must be a string".into())),
    }
}
