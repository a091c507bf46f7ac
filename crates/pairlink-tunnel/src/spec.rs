//! Peer specs: the explicit input to one orchestration run.
//!
//! A spec names the interface, the local identity and address, the remote
//! peers, and any extra routes. It is loaded from TOML:
//!
//! ```toml
//! interface = "wg0"
//! identity = "server"
//! address = "10.13.13.1/32"
//! listen_port = 51820
//!
//! [[peers]]
//! name = "client"
//! identity = "client"
//! allowed_ips = ["10.13.13.2/32"]
//! ```

use std::path::Path;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};
use crate::keys::PublicKey;
use crate::keystore::validate_identity_name;
use crate::types::{AllowedIp, Endpoint, RouteSpec, TunnelAddress};

/// Linux limits interface names to 15 bytes.
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Everything needed to bring one tunnel interface up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSpec {
    /// Interface name, e.g. `wg0`.
    pub interface: String,
    /// Local identity name in the key store.
    pub identity: String,
    /// Address assigned to the interface.
    pub address: TunnelAddress,
    /// UDP listen port; omitted on a client that only dials out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    /// Remote peers, in order.
    #[serde(default)]
    pub peers: Vec<RemotePeerSpec>,
    /// Extra routes through the interface.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteEntry>,
}

/// One remote peer as written in a spec file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemotePeerSpec {
    /// Label used in logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Inline public key (base64).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    /// Identity in the local key store whose public key to use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Ranges routed to this peer.
    #[serde(default)]
    pub allowed_ips: Vec<AllowedIp>,
    /// Where to reach this peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    /// Persistent keepalive in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
}

/// Where a remote peer's public key comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKeySource<'a> {
    /// Given inline.
    Inline(&'a PublicKey),
    /// Read from the local key store.
    Identity(&'a str),
}

impl RemotePeerSpec {
    /// A peer with an inline key.
    #[must_use]
    pub fn with_key(public_key: PublicKey) -> Self {
        Self {
            name: None,
            public_key: Some(public_key),
            identity: None,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    /// A peer whose key is read from the key store.
    #[must_use]
    pub fn with_identity(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            name: Some(identity.clone()),
            public_key: None,
            identity: Some(identity),
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    /// Adds an allowed IP.
    #[must_use]
    pub fn allow(mut self, ip: AllowedIp) -> Self {
        self.allowed_ips.push(ip);
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the persistent keepalive.
    #[must_use]
    pub fn keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }

    /// Label for logs: the name, the identity, or the short key.
    #[must_use]
    pub fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.identity.clone())
            .or_else(|| self.public_key.map(|k| k.short()))
            .unwrap_or_else(|| "?".to_string())
    }

    /// Returns where the key comes from.
    ///
    /// # Errors
    ///
    /// `ConfigValidation` unless exactly one of `public_key` and `identity` is set.
    pub fn key_source(&self) -> Result<PeerKeySource<'_>> {
        match (&self.public_key, &self.identity) {
            (Some(key), None) => Ok(PeerKeySource::Inline(key)),
            (None, Some(identity)) => Ok(PeerKeySource::Identity(identity)),
            _ => Err(TunnelError::ConfigValidation(format!(
                "peer '{}' needs exactly one of public_key or identity",
                self.label()
            ))),
        }
    }
}

/// An extra route through the tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteEntry {
    /// Destination network.
    pub destination: IpNet,
}

impl PeerSpec {
    /// Creates a spec with no peers or routes.
    #[must_use]
    pub fn new(
        interface: impl Into<String>,
        identity: impl Into<String>,
        address: TunnelAddress,
    ) -> Self {
        Self {
            interface: interface.into(),
            identity: identity.into(),
            address,
            listen_port: None,
            peers: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Sets the listen port.
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Adds a remote peer.
    #[must_use]
    pub fn with_peer(mut self, peer: RemotePeerSpec) -> Self {
        self.peers.push(peer);
        self
    }

    /// Adds a route through the interface.
    #[must_use]
    pub fn with_route(mut self, destination: IpNet) -> Self {
        self.routes.push(RouteEntry { destination });
        self
    }

    /// Load a spec from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::ConfigValidation(format!(
                "failed to read peer spec '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse a spec from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or the spec fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let spec: Self = toml::from_str(content)
            .map_err(|e| TunnelError::ConfigValidation(format!("invalid peer spec: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Checks names and key sources.
    ///
    /// Peer-set invariants (non-empty, no overlap) are checked when the
    /// configuration is rendered.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        validate_interface_name(&self.interface)?;
        validate_identity_name(&self.identity)?;
        for peer in &self.peers {
            if let PeerKeySource::Identity(identity) = peer.key_source()? {
                validate_identity_name(identity)?;
                if identity == self.identity {
                    return Err(TunnelError::ConfigValidation(format!(
                        "peer '{}' refers to the local identity",
                        peer.label()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Routes to install, bound to this spec's interface.
    #[must_use]
    pub fn route_specs(&self) -> Vec<RouteSpec> {
        self.routes
            .iter()
            .map(|r| RouteSpec::new(r.destination, self.interface.clone()))
            .collect()
    }
}

/// Checks a network interface name.
///
/// # Errors
///
/// Returns `ConfigValidation` unless the name is 1–15 characters from
/// `[A-Za-z0-9_.-]`.
pub fn validate_interface_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME_LEN
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(TunnelError::ConfigValidation(format!(
            "invalid interface name '{name}': 1-{MAX_INTERFACE_NAME_LEN} characters from [A-Za-z0-9_.-]"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const SERVER: &str = r#"
interface = "wg0"
identity = "server"
address = "10.13.13.1/32"
listen_port = 51820

[[peers]]
name = "client"
public_key = "AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI="
allowed_ips = ["10.13.13.2/32"]
"#;

    const CLIENT: &str = r#"
interface = "wg0"
identity = "client"
address = "10.13.13.2/32"

[[peers]]
identity = "server"
allowed_ips = ["10.13.13.1/32", "10.20.0.0/16"]
endpoint = "server:51820"
persistent_keepalive = 25

[[routes]]
destination = "10.20.0.0/16"
"#;

    #[test]
    fn parses_server_spec() {
        let spec = PeerSpec::from_toml(SERVER).expect("valid spec");
        assert_eq!(spec.interface, "wg0");
        assert_eq!(spec.listen_port, Some(51820));
        assert_eq!(spec.peers.len(), 1);
        assert!(matches!(
            spec.peers[0].key_source().expect("source"),
            PeerKeySource::Inline(_)
        ));
        assert!(spec.route_specs().is_empty());
    }

    #[test]
    fn parses_client_spec() {
        let spec = PeerSpec::from_toml(CLIENT).expect("valid spec");
        assert_eq!(spec.listen_port, None);
        let peer = &spec.peers[0];
        assert_eq!(peer.key_source().expect("source"), PeerKeySource::Identity("server"));
        assert_eq!(peer.endpoint.as_ref().map(ToString::to_string).as_deref(), Some("server:51820"));
        assert_eq!(spec.route_specs()[0].to_string(), "10.20.0.0/16 dev wg0");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = PeerSpec::from_toml(&format!("{SERVER}\nprivate_key = \"x\"\n"));
        assert!(matches!(err, Err(TunnelError::ConfigValidation(_))));
    }

    #[test]
    fn rejects_malformed_address() {
        let text = SERVER.replace("10.13.13.1/32", "10.13.13.1");
        assert!(PeerSpec::from_toml(&text).is_err());
    }

    #[test]
    fn peer_needs_exactly_one_key_source() {
        let both = RemotePeerSpec {
            identity: Some("client".into()),
            ..RemotePeerSpec::with_key(PublicKey::from_bytes_array([2; 32]))
        };
        assert!(both.key_source().is_err());

        let neither = RemotePeerSpec {
            public_key: None,
            ..RemotePeerSpec::with_key(PublicKey::from_bytes_array([2; 32]))
        };
        assert!(neither.key_source().is_err());
    }

    #[test]
    fn peer_cannot_be_local_identity() {
        let spec = PeerSpec::new("wg0", "server", "10.0.0.1/32".parse().expect("addr"))
            .with_peer(RemotePeerSpec::with_identity("server"));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_keeps_spec_equal() {
        let spec = PeerSpec::from_toml(CLIENT).expect("valid spec");
        let text = toml::to_string(&spec).expect("serialize");
        assert_eq!(PeerSpec::from_toml(&text).expect("reparse"), spec);
    }

    #[test_case("" ; "empty")]
    #[test_case("averyveryverylongname" ; "too long")]
    #[test_case("wg 0" ; "space")]
    #[test_case("wg/0" ; "slash")]
    fn rejects_interface_names(name: &str) {
        assert!(validate_interface_name(name).is_err());
    }

    #[test]
    fn accepts_interface_names() {
        for name in ["wg0", "tun-peer_1", "a.b"] {
            validate_interface_name(name).expect("valid");
        }
    }
}
