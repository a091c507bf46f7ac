//! Core value types for tunnel configuration.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};
use crate::keys::{KeyPair, PrivateKey, PublicKey};

/// An allowed IP address or network in CIDR notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowedIp {
    network: IpNet,
}

impl AllowedIp {
    /// Creates a new allowed IP from an `IpNet`.
    ///
    /// Host bits are kept as given; the engine masks them itself.
    #[must_use]
    pub fn new(network: IpNet) -> Self {
        Self { network }
    }

    /// Returns the network.
    #[must_use]
    pub fn network(&self) -> &IpNet {
        &self.network
    }

    /// Creates an allowed IP from CIDR notation.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR notation is invalid.
    pub fn from_cidr(s: &str) -> Result<Self> {
        parse_cidr(s).map(Self::new)
    }

    /// Returns the CIDR string representation.
    #[must_use]
    pub fn to_cidr(&self) -> String {
        self.network.to_string()
    }

    /// Whether two ranges share at least one address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let a = self.network.trunc();
        let b = other.network.trunc();
        a.contains(&b.network()) || b.contains(&a.network())
    }
}

fn parse_cidr(s: &str) -> Result<IpNet> {
    s.trim()
        .parse::<IpNet>()
        .map_err(|e| TunnelError::InvalidCidr(format!("{s}: {e}")))
}

impl FromStr for AllowedIp {
    type Err = TunnelError;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_cidr(s)
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.network)
    }
}

/// The address assigned to the local end of the tunnel, e.g. `10.13.13.1/32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TunnelAddress {
    cidr: IpNet,
}

impl TunnelAddress {
    /// Creates a tunnel address.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` for unspecified, multicast or network-only
    /// (host bits all zero on a prefix shorter than the full width) addresses.
    pub fn new(cidr: IpNet) -> Result<Self> {
        let addr = cidr.addr();
        if addr.is_unspecified() || addr.is_multicast() {
            return Err(TunnelError::ConfigValidation(format!(
                "tunnel address {cidr} is not a unicast host address"
            )));
        }
        if cidr.prefix_len() < cidr.max_prefix_len() && addr == cidr.network() {
            return Err(TunnelError::ConfigValidation(format!(
                "tunnel address {cidr} is a network address, not a host address"
            )));
        }
        Ok(Self { cidr })
    }

    /// Parses a tunnel address from CIDR notation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCidr` on malformed input, `ConfigValidation` when the
    /// address cannot be assigned to an interface.
    pub fn from_cidr(s: &str) -> Result<Self> {
        Self::new(parse_cidr(s)?)
    }

    /// Returns the address with its prefix length.
    #[must_use]
    pub fn cidr(&self) -> &IpNet {
        &self.cidr
    }

    /// Returns the host address.
    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.cidr.addr()
    }
}

impl FromStr for TunnelAddress {
    type Err = TunnelError;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_cidr(s)
    }
}

impl TryFrom<String> for TunnelAddress {
    type Error = TunnelError;
    fn try_from(s: String) -> Result<Self> {
        Self::from_cidr(&s)
    }
}

impl From<TunnelAddress> for String {
    fn from(addr: TunnelAddress) -> Self {
        addr.cidr.to_string()
    }
}

impl fmt::Display for TunnelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cidr)
    }
}

/// A peer endpoint: DNS name or IP literal plus UDP port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEndpoint` for an empty host, a host containing
    /// whitespace, or port 0.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(TunnelError::InvalidEndpoint(format!("invalid host '{host}'")));
        }
        if port == 0 {
            return Err(TunnelError::InvalidEndpoint(format!("{host}: port must be 1-65535")));
        }
        Ok(Self { host, port })
    }

    /// Returns the host (DNS name or IP literal, without brackets).
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Endpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| TunnelError::InvalidEndpoint(format!("{s}: unterminated '['")))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| TunnelError::InvalidEndpoint(format!("{s}: missing port")))?;
            (host, port)
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| TunnelError::InvalidEndpoint(format!("{s}: missing port")))?;
            if host.contains(':') {
                return Err(TunnelError::InvalidEndpoint(format!(
                    "{s}: IPv6 hosts must be bracketed"
                )));
            }
            (host, port)
        };
        let port = port
            .parse::<u16>()
            .map_err(|e| TunnelError::InvalidEndpoint(format!("{s}: {e}")))?;
        Self::new(host, port)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = TunnelError;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A route through the tunnel interface.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Destination network.
    pub destination: IpNet,
    /// Interface the route points at.
    pub via_interface: String,
}

impl RouteSpec {
    /// Creates a route to `destination` through `via_interface`.
    #[must_use]
    pub fn new(destination: IpNet, via_interface: impl Into<String>) -> Self {
        Self {
            destination: destination.trunc(),
            via_interface: via_interface.into(),
        }
    }
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dev {}", self.destination, self.via_interface)
    }
}

/// A named keypair representing one end of a tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerIdentity {
    name: String,
    keypair: KeyPair,
}

impl PeerIdentity {
    /// Creates an identity from a name and keypair.
    #[must_use]
    pub fn new(name: impl Into<String>, keypair: KeyPair) -> Self {
        Self {
            name: name.into(),
            keypair,
        }
    }

    /// Returns the identity name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the private key.
    #[must_use]
    pub fn private_key(&self) -> &PrivateKey {
        self.keypair.private_key()
    }

    /// Returns the public key.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// Returns the keypair.
    #[must_use]
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }
}

/// Live status of a tunnel interface as reported by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStatus {
    /// Interface name.
    pub name: String,
    /// Interface's public key, if a private key is set.
    pub public_key: Option<PublicKey>,
    /// Listen port (if configured).
    pub listen_port: Option<u16>,
    /// Status of all peers.
    pub peers: Vec<PeerStatus>,
}

/// Live status of one peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Current endpoint (if known).
    pub endpoint: Option<String>,
    /// Configured allowed IPs.
    pub allowed_ips: Vec<AllowedIp>,
    /// Unix timestamp of last successful handshake.
    pub last_handshake: Option<u64>,
    /// Bytes received from this peer.
    pub rx_bytes: u64,
    /// Bytes transmitted to this peer.
    pub tx_bytes: u64,
    /// Persistent keepalive interval.
    pub persistent_keepalive: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("10.0.0.0/24", "10.0.0.128/25", true ; "subnet inside")]
    #[test_case("10.0.0.128/25", "10.0.0.0/24", true ; "supernet outside")]
    #[test_case("10.0.0.1/32", "10.0.0.1/32", true ; "identical host")]
    #[test_case("10.0.0.1/32", "10.0.0.2/32", false ; "adjacent hosts")]
    #[test_case("0.0.0.0/0", "192.168.1.0/24", true ; "default route")]
    #[test_case("10.0.0.0/8", "fd00::/8", false ; "mixed families")]
    #[test_case("10.0.0.5/24", "10.0.0.200/32", true ; "host bits ignored")]
    fn allowed_ip_overlap(a: &str, b: &str, expected: bool) {
        let a = AllowedIp::from_cidr(a).expect("valid cidr");
        let b = AllowedIp::from_cidr(b).expect("valid cidr");
        assert_eq!(a.overlaps(&b), expected);
    }

    #[test]
    fn allowed_ip_rejects_garbage() {
        assert!(matches!(
            AllowedIp::from_cidr("10.0.0.300/24"),
            Err(TunnelError::InvalidCidr(_))
        ));
        assert!(AllowedIp::from_cidr("10.0.0.1").is_err());
    }

    #[test]
    fn tunnel_address_accepts_host_cidr() {
        let addr = TunnelAddress::from_cidr("10.13.13.1/32").expect("valid");
        assert_eq!(addr.to_string(), "10.13.13.1/32");
        assert_eq!(addr.addr().to_string(), "10.13.13.1");
        assert!(TunnelAddress::from_cidr("10.13.13.1/24").is_ok());
    }

    #[test_case("0.0.0.0/32" ; "unspecified")]
    #[test_case("224.0.0.1/32" ; "multicast")]
    #[test_case("10.13.13.0/24" ; "network address")]
    fn tunnel_address_rejects(cidr: &str) {
        assert!(matches!(
            TunnelAddress::from_cidr(cidr),
            Err(TunnelError::ConfigValidation(_))
        ));
    }

    #[test_case("192.168.1.1:51820", "192.168.1.1", 51820 ; "ipv4")]
    #[test_case("vpn.example.com:443", "vpn.example.com", 443 ; "dns name")]
    #[test_case("[fd00::1]:51820", "fd00::1", 51820 ; "bracketed ipv6")]
    fn endpoint_parses(input: &str, host: &str, port: u16) {
        let endpoint: Endpoint = input.parse().expect("valid endpoint");
        assert_eq!(endpoint.host(), host);
        assert_eq!(endpoint.port(), port);
        assert_eq!(endpoint.to_string(), input);
    }

    #[test_case("server" ; "no port")]
    #[test_case("server:0" ; "port zero")]
    #[test_case("server:70000" ; "port out of range")]
    #[test_case("fd00::1:51820" ; "unbracketed ipv6")]
    #[test_case(":51820" ; "empty host")]
    fn endpoint_rejects(input: &str) {
        assert!(matches!(
            input.parse::<Endpoint>(),
            Err(TunnelError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn route_spec_truncates_destination() {
        let route = RouteSpec::new("10.20.1.7/16".parse().expect("cidr"), "wg0");
        assert_eq!(route.to_string(), "10.20.0.0/16 dev wg0");
    }

    #[test]
    fn endpoint_serde_as_string() {
        let endpoint: Endpoint = "server:51820".parse().expect("valid");
        let json = serde_json::to_string(&endpoint).expect("serialize");
        assert_eq!(json, "\"server:51820\"");
        let back: Endpoint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, endpoint);
    }
}
