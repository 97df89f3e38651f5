//! Virtual network records and interface allocation.
//!
//! A network owns a subnet and a list of interface templates; interfaces
//! carry a UID that stays stable across reconciliations so a caller can
//! re-identify the interface it just reserved (reserve-then-observe).

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use unikit_common::config::RuntimeConfig;
use unikit_common::constants::NETWORK_KIND;
use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::validate_dns_label;
use unikit_store::{Store, StoredObject};

/// Observed state of a network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    /// Network is configured and reachable.
    Up,
    /// Network is configured but disabled.
    Down,
    /// State has not been observed.
    #[default]
    Unknown,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One guest-facing interface template owned by a network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Stable identifier assigned at reservation time.
    pub uid: uuid::Uuid,
    /// Address with prefix, e.g. `192.168.1.5/24`.
    pub cidr: String,
    /// Bare address.
    pub ip: String,
    /// MAC address of the guest interface.
    pub mac: String,
    /// Gateway the guest should route through.
    pub gateway: String,
    /// DNS servers handed to the guest.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    /// Hostname handed to the guest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// DNS search domain handed to the guest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Desired state of a network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Driver implementing the network, e.g. `bridge`.
    pub driver: String,
    /// Subnet in CIDR form, e.g. `172.88.0.0/16`.
    pub subnet: String,
    /// Gateway address inside the subnet.
    pub gateway: String,
    /// Dotted netmask, e.g. `255.255.255.0`.
    pub netmask: String,
    /// Interfaces reserved on this network.
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Observed state of a network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// Up/down/unknown.
    pub state: NetworkState,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

/// A named network with its spec/status pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// Unique network name.
    pub name: String,
    /// Desired state.
    pub spec: NetworkSpec,
    /// Observed state.
    pub status: NetworkStatus,
}

impl StoredObject for Network {
    const KIND: &'static str = "network";

    fn object_name(&self) -> &str {
        &self.name
    }

    fn to_documents(&self) -> Result<(Value, Value)> {
        Ok((
            serde_json::to_value(&self.spec)?,
            serde_json::to_value(&self.status)?,
        ))
    }

    fn from_documents(name: &str, spec: Value, status: Value) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            spec: serde_json::from_value(spec)?,
            status: if status.is_null() {
                NetworkStatus::default()
            } else {
                serde_json::from_value(status)?
            },
        })
    }
}

/// A parsed `--network` argument:
/// `name[:CIDR[:gw[:dns0[:dns1[:host[:domain]]]]]]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachRequest {
    /// Network to attach to.
    pub network: String,
    /// Requested address, optionally with a prefix.
    pub ip: Option<String>,
    /// Requested prefix length when the address carried one.
    pub prefix: Option<u8>,
    /// Gateway override.
    pub gateway: Option<String>,
    /// Up to two DNS servers.
    pub dns: Vec<String>,
    /// Hostname for the guest.
    pub hostname: Option<String>,
    /// Search domain for the guest.
    pub domain: Option<String>,
}

impl FromStr for AttachRequest {
    type Err = UnikitError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let network = parts.next().unwrap_or_default().to_string();
        if network.is_empty() {
            return Err(UnikitError::InvalidInput {
                message: format!("invalid network specification: {s}"),
            });
        }
        validate_dns_label(&network)?;

        let mut request = Self {
            network,
            ..Self::default()
        };

        if let Some(addr) = parts.next().filter(|p| !p.is_empty()) {
            let (ip, prefix) = match addr.split_once('/') {
                Some((ip, prefix)) => {
                    let prefix: u8 =
                        prefix.parse().map_err(|_| UnikitError::InvalidInput {
                            message: format!("invalid prefix length in {addr}"),
                        })?;
                    if prefix > 32 {
                        return Err(UnikitError::InvalidInput {
                            message: format!("invalid prefix length in {addr}"),
                        });
                    }
                    (ip, Some(prefix))
                }
                None => (addr, None),
            };
            let _: Ipv4Addr = ip.parse().map_err(|_| UnikitError::InvalidInput {
                message: format!("invalid address in network specification: {addr}"),
            })?;
            request.ip = Some(ip.to_string());
            request.prefix = prefix;
        }
        request.gateway = parts.next().filter(|p| !p.is_empty()).map(String::from);
        for dns in [parts.next(), parts.next()].into_iter().flatten() {
            if !dns.is_empty() {
                request.dns.push(dns.to_string());
            }
        }
        request.hostname = parts.next().filter(|p| !p.is_empty()).map(String::from);
        request.domain = parts.next().filter(|p| !p.is_empty()).map(String::from);

        if parts.next().is_some() {
            return Err(UnikitError::InvalidInput {
                message: format!("too many segments in network specification: {s}"),
            });
        }
        Ok(request)
    }
}

/// Converts a dotted netmask like `255.255.255.0` into a prefix length.
///
/// # Errors
///
/// Returns [`UnikitError::InvalidInput`] for non-contiguous or malformed
/// masks.
pub fn prefix_from_netmask(netmask: &str) -> Result<u8> {
    let addr: Ipv4Addr = netmask.parse().map_err(|_| UnikitError::InvalidInput {
        message: format!("invalid netmask: {netmask}"),
    })?;
    let bits = u32::from(addr);
    let prefix = bits.leading_ones();
    if bits.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(UnikitError::InvalidInput {
            message: format!("non-contiguous netmask: {netmask}"),
        });
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(prefix as u8)
}

/// Generates a locally administered unicast MAC address.
#[must_use]
pub fn random_mac() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut tail = [0u8; 5];
    rng.fill(&mut tail);
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2], tail[3], tail[4]
    )
}

/// Service owning the network store.
pub struct NetworkService {
    store: Store<Network>,
}

impl NetworkService {
    /// Opens the network store under the runtime directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the store directory cannot be created.
    pub fn open(config: &RuntimeConfig) -> Result<Self> {
        Ok(Self {
            store: Store::open(config.kind_dir(NETWORK_KIND))?,
        })
    }

    /// Creates a network; fails with `Conflict` if the name is taken.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` for duplicate names or any store error.
    pub fn create(&self, ctx: &Context, name: &str, spec: NetworkSpec) -> Result<Network> {
        validate_dns_label(name)?;
        if self.store.get(ctx, name).is_ok() {
            return Err(UnikitError::Conflict {
                message: format!("network {name} already exists"),
            });
        }
        let network = Network {
            name: name.to_string(),
            spec,
            status: NetworkStatus {
                state: NetworkState::Up,
                ..NetworkStatus::default()
            },
        };
        self.store.upsert(ctx, &network)
    }

    /// Fetches a network by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown names.
    pub fn get(&self, ctx: &Context, name: &str) -> Result<Network> {
        self.store.get(ctx, name)
    }

    /// Lists all networks.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub fn list(&self, ctx: &Context) -> Result<Vec<Network>> {
        self.store.list(ctx)
    }

    /// Persists spec changes to an existing network.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the network does not exist.
    pub fn update(&self, ctx: &Context, network: &Network) -> Result<Network> {
        let _ = self.store.get(ctx, &network.name)?;
        self.store.upsert(ctx, network)
    }

    /// Deletes a network by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the network does not exist.
    pub fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        self.store.delete(ctx, name)
    }

    /// Reserves an interface on a network and returns the observed form.
    ///
    /// The interface UID is allocated before the write so the caller can
    /// re-identify the reservation after the update lands.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown networks, `InvalidInput` for
    /// malformed addresses, or `Conflict` when the subnet is exhausted or
    /// the requested address is taken.
    pub fn attach(&self, ctx: &Context, request: &AttachRequest) -> Result<NetworkInterface> {
        let mut network = self.store.get(ctx, &request.network)?;

        let prefix = match request.prefix {
            Some(prefix) => prefix,
            None => prefix_from_netmask(&network.spec.netmask)?,
        };
        let ip = match &request.ip {
            Some(ip) => {
                let taken = network.spec.interfaces.iter().any(|i| i.ip == *ip);
                if taken {
                    return Err(UnikitError::Conflict {
                        message: format!("address {ip} already reserved on {}", network.name),
                    });
                }
                ip.clone()
            }
            None => next_free_ip(&network)?,
        };

        let interface = NetworkInterface {
            uid: uuid::Uuid::new_v4(),
            cidr: format!("{ip}/{prefix}"),
            ip,
            mac: random_mac(),
            gateway: request
                .gateway
                .clone()
                .unwrap_or_else(|| network.spec.gateway.clone()),
            dns: request.dns.clone(),
            hostname: request.hostname.clone(),
            domain: request.domain.clone(),
        };

        network.spec.interfaces.push(interface.clone());
        let observed = self.update(ctx, &network)?;
        tracing::debug!(network = %request.network, ip = %interface.ip, "interface reserved");
        observed
            .spec
            .interfaces
            .into_iter()
            .find(|i| i.uid == interface.uid)
            .ok_or_else(|| UnikitError::Backend {
                message: format!("reserved interface vanished from {}", request.network),
            })
    }

    /// Releases a previously reserved interface.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the network does not exist; releasing an
    /// already released interface is a no-op.
    pub fn detach(&self, ctx: &Context, network_name: &str, uid: uuid::Uuid) -> Result<()> {
        let mut network = self.store.get(ctx, network_name)?;
        let before = network.spec.interfaces.len();
        network.spec.interfaces.retain(|i| i.uid != uid);
        if network.spec.interfaces.len() != before {
            let _ = self.update(ctx, &network)?;
        }
        Ok(())
    }
}

/// Picks the lowest unreserved host address in the network's subnet.
fn next_free_ip(network: &Network) -> Result<String> {
    let (base, prefix) =
        network
            .spec
            .subnet
            .split_once('/')
            .ok_or_else(|| UnikitError::InvalidInput {
                message: format!("invalid subnet: {}", network.spec.subnet),
            })?;
    let base: Ipv4Addr = base.parse().map_err(|_| UnikitError::InvalidInput {
        message: format!("invalid subnet: {}", network.spec.subnet),
    })?;
    let prefix: u32 = prefix.parse().map_err(|_| UnikitError::InvalidInput {
        message: format!("invalid subnet: {}", network.spec.subnet),
    })?;
    if prefix >= 31 {
        return Err(UnikitError::InvalidInput {
            message: format!("subnet too small: {}", network.spec.subnet),
        });
    }

    let start = u32::from(base) + 1;
    let end = u32::from(base) | (u32::MAX >> prefix);
    for candidate in start..end {
        let addr = Ipv4Addr::from(candidate).to_string();
        if addr == network.spec.gateway {
            continue;
        }
        if network.spec.interfaces.iter().any(|i| i.ip == addr) {
            continue;
        }
        return Ok(addr);
    }
    Err(UnikitError::Conflict {
        message: format!("subnet {} exhausted", network.spec.subnet),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, NetworkService, Context) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RuntimeConfig::with_runtime_dir(dir.path());
        let service = NetworkService::open(&config).expect("open");
        (dir, service, Context::background())
    }

    fn kraft0_spec() -> NetworkSpec {
        NetworkSpec {
            driver: "bridge".into(),
            subnet: "192.168.1.0/24".into(),
            gateway: "192.168.1.1".into(),
            netmask: "255.255.255.0".into(),
            ..NetworkSpec::default()
        }
    }

    #[test]
    fn parse_minimal_request() {
        let request: AttachRequest = "kraft0".parse().expect("parse");
        assert_eq!(request.network, "kraft0");
        assert!(request.ip.is_none());
    }

    #[test]
    fn parse_full_request() {
        let request: AttachRequest = "kraft0:10.0.0.9/16:10.0.0.1:1.1.1.1:8.8.8.8:web:lan"
            .parse()
            .expect("parse");
        assert_eq!(request.ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(request.prefix, Some(16));
        assert_eq!(request.gateway.as_deref(), Some("10.0.0.1"));
        assert_eq!(request.dns, vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(request.hostname.as_deref(), Some("web"));
        assert_eq!(request.domain.as_deref(), Some("lan"));
    }

    #[test]
    fn parse_rejects_bad_address() {
        assert!("kraft0:not-an-ip".parse::<AttachRequest>().is_err());
        assert!("kraft0:10.0.0.9/40".parse::<AttachRequest>().is_err());
        assert!("".parse::<AttachRequest>().is_err());
    }

    #[test]
    fn netmask_to_prefix() {
        assert_eq!(prefix_from_netmask("255.255.255.0").expect("parse"), 24);
        assert_eq!(prefix_from_netmask("255.255.0.0").expect("parse"), 16);
        assert!(prefix_from_netmask("255.0.255.0").is_err());
        assert!(prefix_from_netmask("garbage").is_err());
    }

    #[test]
    fn attach_uses_network_netmask_when_request_has_no_prefix() {
        let (_dir, service, ctx) = service();
        let _ = service.create(&ctx, "kraft0", kraft0_spec()).expect("create");

        let request: AttachRequest = "kraft0:192.168.1.5".parse().expect("parse");
        let interface = service.attach(&ctx, &request).expect("attach");
        assert_eq!(interface.cidr, "192.168.1.5/24");
        assert_eq!(interface.gateway, "192.168.1.1");
        assert!(interface.mac.starts_with("02:"));
    }

    #[test]
    fn attach_allocates_distinct_addresses() {
        let (_dir, service, ctx) = service();
        let _ = service.create(&ctx, "kraft0", kraft0_spec()).expect("create");

        let request: AttachRequest = "kraft0".parse().expect("parse");
        let first = service.attach(&ctx, &request).expect("attach");
        let second = service.attach(&ctx, &request).expect("attach");
        assert_ne!(first.ip, second.ip);
        assert_ne!(first.uid, second.uid);
        // Gateway address is never handed out.
        assert_ne!(first.ip, "192.168.1.1");
        assert_ne!(second.ip, "192.168.1.1");
    }

    #[test]
    fn attach_rejects_taken_address() {
        let (_dir, service, ctx) = service();
        let _ = service.create(&ctx, "kraft0", kraft0_spec()).expect("create");

        let request: AttachRequest = "kraft0:192.168.1.5".parse().expect("parse");
        let _ = service.attach(&ctx, &request).expect("attach");
        assert!(matches!(
            service.attach(&ctx, &request),
            Err(UnikitError::Conflict { .. })
        ));
    }

    #[test]
    fn detach_releases_address() {
        let (_dir, service, ctx) = service();
        let _ = service.create(&ctx, "kraft0", kraft0_spec()).expect("create");
        let request: AttachRequest = "kraft0:192.168.1.5".parse().expect("parse");
        let interface = service.attach(&ctx, &request).expect("attach");

        service.detach(&ctx, "kraft0", interface.uid).expect("detach");
        let _ = service.attach(&ctx, &request).expect("address free again");
    }

    #[test]
    fn duplicate_network_create_conflicts() {
        let (_dir, service, ctx) = service();
        let _ = service.create(&ctx, "kraft0", kraft0_spec()).expect("create");
        assert!(matches!(
            service.create(&ctx, "kraft0", kraft0_spec()),
            Err(UnikitError::Conflict { .. })
        ));
    }
}
