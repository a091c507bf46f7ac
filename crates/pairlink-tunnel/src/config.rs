//! Tunnel configuration building, rendering and parsing.
//!
//! [`render`] validates identity, addressing and peer inputs into a
//! [`TunnelConfig`]. [`TunnelConfig::to_conf`] produces the INI-style text the
//! engine's `setconf` consumes and [`parse_conf`] reads it back.

use std::collections::HashSet;
use std::fmt::Write as FmtWrite;
use std::io::Write as IoWrite;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Result, TunnelError};
use crate::keys::{PrivateKey, PublicKey};
use crate::types::{AllowedIp, Endpoint, PeerIdentity, TunnelAddress};

const REDACTED: &str = "(hidden)";

/// One remote peer entry of a tunnel configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePeer {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Ranges this peer may send and receive for.
    pub allowed_ips: Vec<AllowedIp>,
    /// Where to reach the peer; only the initiating side has one.
    pub endpoint: Option<Endpoint>,
    /// Persistent keepalive interval in seconds.
    pub keepalive_seconds: Option<u16>,
}

impl RemotePeer {
    /// Creates a peer entry with the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            allowed_ips: Vec::new(),
            endpoint: None,
            keepalive_seconds: None,
        }
    }

    /// Adds an allowed IP.
    #[must_use]
    pub fn with_allowed_ip(mut self, ip: AllowedIp) -> Self {
        self.allowed_ips.push(ip);
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the persistent keepalive interval.
    #[must_use]
    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.keepalive_seconds = Some(seconds);
        self
    }
}

/// A validated tunnel configuration for one interface.
///
/// Built by [`render`]; holds exactly one local private key and at least one
/// remote peer, with no overlapping allowed IPs across peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelConfig {
    local: PeerIdentity,
    local_address: TunnelAddress,
    listen_port: Option<u16>,
    remote_peers: Vec<RemotePeer>,
}

impl TunnelConfig {
    /// Returns the local identity.
    #[must_use]
    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    /// Returns the local tunnel address.
    #[must_use]
    pub fn local_address(&self) -> &TunnelAddress {
        &self.local_address
    }

    /// Returns the listen port.
    #[must_use]
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    /// Returns the remote peers in declaration order.
    #[must_use]
    pub fn remote_peers(&self) -> &[RemotePeer] {
        &self.remote_peers
    }

    /// Renders the `setconf` file text.
    ///
    /// The local address is not part of the output; `setconf` rejects
    /// `Address` and the address is assigned through the network stack.
    #[must_use]
    pub fn to_conf(&self) -> String {
        write_conf(self, &self.local.private_key().to_base64())
    }

    /// Renders the file text with the private key hidden, for display.
    #[must_use]
    pub fn to_redacted_conf(&self) -> String {
        write_conf(self, REDACTED)
    }
}

fn write_conf(config: &TunnelConfig, private_key: &str) -> String {
    let mut output = String::new();

    output.push_str("[Interface]\n");
    let _ = writeln!(output, "PrivateKey = {private_key}");
    if let Some(port) = config.listen_port {
        let _ = writeln!(output, "ListenPort = {port}");
    }

    for peer in &config.remote_peers {
        output.push('\n');
        output.push_str("[Peer]\n");
        let _ = writeln!(output, "PublicKey = {}", peer.public_key.to_base64());

        let ips: Vec<String> = peer.allowed_ips.iter().map(AllowedIp::to_cidr).collect();
        let _ = writeln!(output, "AllowedIPs = {}", ips.join(", "));

        if let Some(ref endpoint) = peer.endpoint {
            let _ = writeln!(output, "Endpoint = {endpoint}");
        }
        if let Some(keepalive) = peer.keepalive_seconds {
            let _ = writeln!(output, "PersistentKeepalive = {keepalive}");
        }
    }

    output
}

fn invalid(message: impl Into<String>) -> TunnelError {
    TunnelError::ConfigValidation(message.into())
}

/// Builds a validated [`TunnelConfig`].
///
/// Pure: nothing is written or applied.
///
/// # Errors
///
/// Returns `ConfigValidation` naming the violated invariant when there are no
/// remote peers, a peer has no allowed IPs, two peers share a key or overlap
/// in allowed IPs, a peer uses the local public key, or a port/keepalive is 0.
pub fn render(
    local: PeerIdentity,
    local_address: TunnelAddress,
    listen_port: Option<u16>,
    remote_peers: Vec<RemotePeer>,
) -> Result<TunnelConfig> {
    if listen_port == Some(0) {
        return Err(invalid("listen port must be 1-65535"));
    }
    if remote_peers.is_empty() {
        return Err(invalid("at least one remote peer is required"));
    }

    let mut seen_keys = HashSet::new();
    for (idx, peer) in remote_peers.iter().enumerate() {
        let key = peer.public_key.short();
        if peer.public_key == *local.public_key() {
            return Err(invalid(format!("peer {idx} ({key}...) uses the local public key")));
        }
        if !seen_keys.insert(peer.public_key) {
            return Err(invalid(format!("peer {idx} ({key}...) is listed twice")));
        }
        if peer.allowed_ips.is_empty() {
            return Err(invalid(format!("peer {idx} ({key}...) has no allowed IPs")));
        }
        if peer.keepalive_seconds == Some(0) {
            return Err(invalid(format!(
                "peer {idx} ({key}...) keepalive must be positive; omit it to disable"
            )));
        }
    }

    for (i, a) in remote_peers.iter().enumerate() {
        for b in &remote_peers[i + 1..] {
            for ip_a in &a.allowed_ips {
                if let Some(ip_b) = b.allowed_ips.iter().find(|ip_b| ip_a.overlaps(ip_b)) {
                    return Err(invalid(format!(
                        "allowed IPs overlap between peers {}... ({ip_a}) and {}... ({ip_b})",
                        a.public_key.short(),
                        b.public_key.short(),
                    )));
                }
            }
        }
    }

    Ok(TunnelConfig {
        local,
        local_address,
        listen_port,
        remote_peers,
    })
}

/// The logical content of a parsed configuration file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedConf {
    /// Interface private key.
    pub private_key: PrivateKey,
    /// Listen port, if present.
    pub listen_port: Option<u16>,
    /// Peer sections in file order.
    pub peers: Vec<RemotePeer>,
}

impl ParsedConf {
    /// Whether this file carries the same logical fields as `config`.
    #[must_use]
    pub fn matches(&self, config: &TunnelConfig) -> bool {
        self.private_key == *config.local.private_key()
            && self.listen_port == config.listen_port
            && self.peers == config.remote_peers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

/// Parses the `setconf` file format.
///
/// # Errors
///
/// Returns `ParseError` with the offending line for malformed lines, unknown
/// sections, bad values, or a missing private/public key.
pub fn parse_conf(text: &str) -> Result<ParsedConf> {
    let mut section = Section::None;
    let mut private_key: Option<PrivateKey> = None;
    let mut listen_port: Option<u16> = None;
    let mut peers: Vec<RemotePeer> = Vec::new();
    let mut current_peer: Option<ParsedPeer> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_number = idx + 1;
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            if let Some(peer) = current_peer.take() {
                peers.push(peer.build(line_number)?);
            }
            section = match &line[1..line.len() - 1] {
                "Interface" => Section::Interface,
                "Peer" => {
                    current_peer = Some(ParsedPeer::default());
                    Section::Peer
                }
                other => {
                    return Err(parse_error(line_number, format!("unknown section: {other}")));
                }
            };
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(parse_error(line_number, format!("invalid line format: {line}")));
        };
        let key = key.trim();
        let value = value.trim();

        match section {
            Section::None => {
                return Err(parse_error(line_number, "key-value pair outside of section"));
            }
            Section::Interface => match key {
                "PrivateKey" => {
                    let key = PrivateKey::from_base64(value)
                        .map_err(|_| parse_error(line_number, "invalid PrivateKey"))?;
                    private_key = Some(key);
                }
                "ListenPort" => {
                    let port = value
                        .parse()
                        .map_err(|_| parse_error(line_number, "invalid ListenPort"))?;
                    listen_port = Some(port);
                }
                _ => {}
            },
            Section::Peer => {
                if let Some(ref mut peer) = current_peer {
                    peer.parse_key(key, value, line_number)?;
                }
            }
        }
    }

    if let Some(peer) = current_peer {
        peers.push(peer.build(text.lines().count())?);
    }

    let private_key =
        private_key.ok_or_else(|| parse_error(0, "missing PrivateKey in [Interface] section"))?;

    Ok(ParsedConf {
        private_key,
        listen_port,
        peers,
    })
}

fn parse_error(line: usize, message: impl Into<String>) -> TunnelError {
    TunnelError::ParseError {
        line,
        message: message.into(),
    }
}

#[derive(Default)]
struct ParsedPeer {
    public_key: Option<PublicKey>,
    allowed_ips: Vec<AllowedIp>,
    endpoint: Option<Endpoint>,
    keepalive_seconds: Option<u16>,
}

impl ParsedPeer {
    fn parse_key(&mut self, key: &str, value: &str, line_number: usize) -> Result<()> {
        match key {
            "PublicKey" => {
                let key = PublicKey::from_base64(value)
                    .map_err(|_| parse_error(line_number, "invalid PublicKey"))?;
                self.public_key = Some(key);
            }
            "AllowedIPs" => {
                for ip in value.split(',').map(str::trim).filter(|ip| !ip.is_empty()) {
                    let ip = AllowedIp::from_cidr(ip)
                        .map_err(|_| parse_error(line_number, format!("invalid AllowedIPs: {ip}")))?;
                    self.allowed_ips.push(ip);
                }
            }
            "Endpoint" => {
                let endpoint = value
                    .parse()
                    .map_err(|_| parse_error(line_number, format!("invalid Endpoint: {value}")))?;
                self.endpoint = Some(endpoint);
            }
            "PersistentKeepalive" => {
                // `off` is how `wg showconf` spells a disabled keepalive.
                self.keepalive_seconds = match value {
                    "off" | "0" => None,
                    v => Some(
                        v.parse()
                            .map_err(|_| parse_error(line_number, "invalid PersistentKeepalive"))?,
                    ),
                };
            }
            _ => {}
        }
        Ok(())
    }

    fn build(self, line_number: usize) -> Result<RemotePeer> {
        let public_key = self
            .public_key
            .ok_or_else(|| parse_error(line_number, "missing PublicKey in [Peer] section"))?;
        Ok(RemotePeer {
            public_key,
            allowed_ips: self.allowed_ips,
            endpoint: self.endpoint,
            keepalive_seconds: self.keepalive_seconds,
        })
    }
}

/// A rendered configuration written to an owner-only temporary file.
///
/// The file is removed when this value is dropped, so it lives only as long
/// as the engine needs it.
#[derive(Debug)]
pub struct RenderedConfigFile {
    file: NamedTempFile,
}

impl RenderedConfigFile {
    /// Writes `config` to a new `0600` file in the system temp directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created or written.
    pub fn write(config: &TunnelConfig) -> Result<Self> {
        Self::write_in(&std::env::temp_dir(), config)
    }

    /// Writes `config` to a new `0600` file in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created or written.
    pub fn write_in(dir: &Path, config: &TunnelConfig) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(".pairlink-")
            .suffix(".conf")
            .tempfile_in(dir)?;
        restrict_to_owner(file.path())?;
        file.write_all(config.to_conf().as_bytes())?;
        file.as_file().sync_all()?;
        Ok(Self { file })
    }

    /// Returns the path of the rendered file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Sets mode `0600` on `path`.
pub(crate) fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
