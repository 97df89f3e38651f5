//! Host-to-guest port forwarding descriptors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::Protocol;

/// A single forwarded port in a machine spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Optional human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Host interface address the forward binds to.
    pub host_ip: String,
    /// Host-side port, 1-65535.
    pub host_port: u16,
    /// Guest-side port, 1-65535.
    pub machine_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Optional MAC address of the guest interface carrying this forward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}/{}",
            self.host_ip, self.host_port, self.machine_port, self.protocol
        )
    }
}

impl FromStr for Port {
    type Err = UnikitError;

    /// Parses Docker-style port syntax: `[hostIP:]hostPort:machinePort[/protocol]`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || UnikitError::InvalidInput {
            message: format!("invalid port specification: {s}"),
        };

        let (ports, protocol) = match s.split_once('/') {
            Some((ports, proto)) => (ports, proto.parse::<Protocol>()?),
            None => (s, Protocol::default()),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host_str, machine_str) = match parts.as_slice() {
            [host, machine] => ("0.0.0.0", *host, *machine),
            [ip, host, machine] => {
                let _: std::net::IpAddr = ip.parse().map_err(|_| invalid())?;
                (*ip, *host, *machine)
            }
            _ => return Err(invalid()),
        };

        let host_port: u16 = host_str.parse().map_err(|_| invalid())?;
        let machine_port: u16 = machine_str.parse().map_err(|_| invalid())?;
        if host_port == 0 || machine_port == 0 {
            return Err(invalid());
        }

        Ok(Self {
            name: None,
            host_ip: host_ip.to_string(),
            host_port,
            machine_port,
            protocol,
            mac_address: None,
        })
    }
}

impl Port {
    /// Whether two forwards contend for the same host endpoint.
    ///
    /// A wildcard bind (`0.0.0.0`) collides with every address on the same
    /// port and protocol.
    #[must_use]
    pub fn collides_with(&self, other: &Self) -> bool {
        self.host_port == other.host_port
            && self.protocol == other.protocol
            && (self.host_ip == other.host_ip
                || self.host_ip == "0.0.0.0"
                || other.host_ip == "0.0.0.0")
    }
}

/// Parses a list of CLI port strings.
///
/// # Errors
///
/// Returns the first parse failure.
pub fn parse_ports(specs: &[String]) -> Result<Vec<Port>> {
    specs.iter().map(|s| s.parse()).collect()
}

/// Finds the first collision between `candidate` ports and ports already
/// reserved by other machines.
#[must_use]
pub fn find_collision<'a>(candidate: &'a [Port], reserved: &'a [Port]) -> Option<(&'a Port, &'a Port)> {
    candidate.iter().find_map(|port| {
        reserved
            .iter()
            .find(|taken| port.collides_with(taken))
            .map(|taken| (port, taken))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_two_part_defaults() {
        let port: Port = "8080:80".parse().expect("parse");
        assert_eq!(port.host_ip, "0.0.0.0");
        assert_eq!(port.host_port, 8080);
        assert_eq!(port.machine_port, 80);
        assert_eq!(port.protocol, Protocol::Tcp);
    }

    #[test]
    fn parse_full_form() {
        let port: Port = "127.0.0.1:8080:80/tcp".parse().expect("parse");
        assert_eq!(port.host_ip, "127.0.0.1");
        assert_eq!(port.host_port, 8080);
        assert_eq!(port.machine_port, 80);
        assert_eq!(port.protocol, Protocol::Tcp);
    }

    #[test]
    fn parse_udp() {
        let port: Port = "53:53/udp".parse().expect("parse");
        assert_eq!(port.protocol, Protocol::Udp);
    }

    #[test]
    fn rejects_bad_forms() {
        assert!("80".parse::<Port>().is_err());
        assert!("0:80".parse::<Port>().is_err());
        assert!("80:0".parse::<Port>().is_err());
        assert!("nothost:80:80".parse::<Port>().is_err());
        assert!("80:80/icmp".parse::<Port>().is_err());
        assert!("1:2:3:4".parse::<Port>().is_err());
    }

    #[test]
    fn wildcard_collides_with_specific() {
        let wild: Port = "8080:80".parse().expect("parse");
        let bound: Port = "127.0.0.1:8080:80".parse().expect("parse");
        assert!(wild.collides_with(&bound));
        assert!(bound.collides_with(&wild));
    }

    #[test]
    fn different_protocols_do_not_collide() {
        let tcp: Port = "8080:80/tcp".parse().expect("parse");
        let udp: Port = "8080:80/udp".parse().expect("parse");
        assert!(!tcp.collides_with(&udp));
    }

    #[test]
    fn find_collision_reports_pair() {
        let candidate = vec!["127.0.0.1:8080:80".parse().expect("parse")];
        let reserved = vec!["9090:90".parse().expect("parse"), "8080:81".parse().expect("parse")];
        let (port, taken) = find_collision(&candidate, &reserved).expect("collision");
        assert_eq!(port.host_port, 8080);
        assert_eq!(taken.machine_port, 81);
    }
}
