//! Command-line backend.
//!
//! Runs `ip` and `wg` to drive a kernel WireGuard device. Failures are
//! classified from the tools' stderr so the managers above can treat
//! "already there" and "already gone" as success.

use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use super::{BackendError, BackendErrorKind, BackendResult, NetworkStack, TunnelEngine};
use crate::keys::PublicKey;
use crate::types::{AllowedIp, InterfaceStatus, PeerStatus, RouteSpec, TunnelAddress};

const EXISTS_MARKERS: &[&str] = &["File exists", "already assigned", "already exists"];

const MISSING_MARKERS: &[&str] = &[
    "Cannot find device",
    "does not exist",
    "No such device",
    "No such process",
    "Cannot assign requested address",
];

/// Backend that shells out to `ip` and `wg`.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    ip_path: String,
    wg_path: String,
}

impl CommandBackend {
    /// Creates a backend using `ip` and `wg` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_paths("ip", "wg")
    }

    /// Creates a backend with explicit tool paths.
    #[must_use]
    pub fn with_paths(ip_path: impl Into<String>, wg_path: impl Into<String>) -> Self {
        Self {
            ip_path: ip_path.into(),
            wg_path: wg_path.into(),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> BackendResult<String> {
        trace!(program, args = ?args, "executing");

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                BackendError::new(
                    BackendErrorKind::Unavailable,
                    format!("failed to execute {program}: {e}"),
                )
            })?;

        check_output(program, args, &output)
    }

    async fn ip(&self, args: &[&str]) -> BackendResult<String> {
        self.run(&self.ip_path, args).await
    }

    async fn wg(&self, args: &[&str]) -> BackendResult<String> {
        self.run(&self.wg_path, args).await
    }
}

impl Default for CommandBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn check_output(program: &str, args: &[&str], output: &Output) -> BackendResult<String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(classify(program, args, output.status.code(), stderr.trim()))
}

fn classify(program: &str, args: &[&str], code: Option<i32>, stderr: &str) -> BackendError {
    let kind = if EXISTS_MARKERS.iter().any(|m| stderr.contains(m)) {
        BackendErrorKind::AlreadyExists
    } else if MISSING_MARKERS.iter().any(|m| stderr.contains(m)) {
        BackendErrorKind::NotFound
    } else {
        BackendErrorKind::Rejected
    };
    let status = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    BackendError::new(
        kind,
        format!("{program} {} exited with {status}: {stderr}", args.join(" ")),
    )
}

/// Parses `wg show <name> dump`.
///
/// The first line describes the interface (private key, public key, listen
/// port, fwmark); each following line is one peer (public key, preshared key,
/// endpoint, allowed ips, latest handshake, rx, tx, keepalive), tab separated.
fn parse_dump(name: &str, dump: &str) -> BackendResult<InterfaceStatus> {
    let bad = |msg: String| BackendError::rejected(format!("unexpected wg dump output: {msg}"));
    let mut lines = dump.lines().filter(|l| !l.trim().is_empty());

    let header = lines.next().ok_or_else(|| bad("empty".into()))?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() < 3 {
        return Err(bad(format!("interface line has {} fields", fields.len())));
    }
    let public_key = match fields[1] {
        "(none)" => None,
        key => Some(PublicKey::from_base64(key).map_err(|e| bad(e.to_string()))?),
    };
    let listen_port = match fields[2].parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    };

    let mut peers = Vec::new();
    for line in lines {
        let f: Vec<&str> = line.split('\t').collect();
        if f.len() < 8 {
            return Err(bad(format!("peer line has {} fields", f.len())));
        }
        let allowed_ips = match f[3] {
            "(none)" => Vec::new(),
            ips => ips
                .split(',')
                .map(AllowedIp::from_cidr)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| bad(e.to_string()))?,
        };
        peers.push(PeerStatus {
            public_key: PublicKey::from_base64(f[0]).map_err(|e| bad(e.to_string()))?,
            endpoint: (f[2] != "(none)").then(|| f[2].to_string()),
            allowed_ips,
            last_handshake: f[4].parse().ok().filter(|t| *t > 0),
            rx_bytes: f[5].parse().unwrap_or(0),
            tx_bytes: f[6].parse().unwrap_or(0),
            persistent_keepalive: f[7].parse().ok().filter(|k| *k > 0),
        });
    }

    Ok(InterfaceStatus {
        name: name.to_string(),
        public_key,
        listen_port,
        peers,
    })
}

#[async_trait]
impl TunnelEngine for CommandBackend {
    async fn create(&self, name: &str) -> BackendResult<()> {
        self.ip(&["link", "add", "dev", name, "type", "wireguard"])
            .await
            .map(drop)
    }

    async fn setconf(&self, name: &str, config_file: &Path) -> BackendResult<()> {
        let path = config_file.to_string_lossy();
        self.wg(&["setconf", name, &path]).await.map(drop)
    }

    async fn destroy(&self, name: &str) -> BackendResult<()> {
        self.ip(&["link", "delete", "dev", name]).await.map(drop)
    }

    async fn exists(&self, name: &str) -> BackendResult<bool> {
        match self.ip(&["link", "show", "dev", name]).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind == BackendErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn show(&self, name: &str) -> BackendResult<InterfaceStatus> {
        let dump = self.wg(&["show", name, "dump"]).await?;
        parse_dump(name, &dump)
    }
}

#[async_trait]
impl NetworkStack for CommandBackend {
    async fn link_up(&self, name: &str) -> BackendResult<()> {
        self.ip(&["link", "set", "dev", name, "up"]).await.map(drop)
    }

    async fn link_down(&self, name: &str) -> BackendResult<()> {
        self.ip(&["link", "set", "dev", name, "down"]).await.map(drop)
    }

    async fn add_address(&self, name: &str, address: &TunnelAddress) -> BackendResult<()> {
        let addr = address.to_string();
        self.ip(&["address", "add", &addr, "dev", name]).await.map(drop)
    }

    async fn del_address(&self, name: &str, address: &TunnelAddress) -> BackendResult<()> {
        let addr = address.to_string();
        self.ip(&["address", "del", &addr, "dev", name]).await.map(drop)
    }

    async fn add_route(&self, route: &RouteSpec) -> BackendResult<()> {
        let dest = route.destination.to_string();
        self.ip(&["route", "add", &dest, "dev", &route.via_interface])
            .await
            .map(drop)
    }

    async fn route_exists(&self, route: &RouteSpec) -> BackendResult<bool> {
        let dest = route.destination.to_string();
        match self
            .ip(&["route", "show", "exact", &dest, "dev", &route.via_interface])
            .await
        {
            Ok(listing) => Ok(route_listed(&listing)),
            Err(e) if e.kind == BackendErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn del_route(&self, route: &RouteSpec) -> BackendResult<()> {
        let dest = route.destination.to_string();
        self.ip(&["route", "del", &dest, "dev", &route.via_interface])
            .await
            .map(drop)
    }
}

/// `ip route show exact` prints nothing, and exits zero, when no route matches.
fn route_listed(listing: &str) -> bool {
    !listing.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("RTNETLINK answers: File exists", BackendErrorKind::AlreadyExists ; "route exists")]
    #[test_case("Cannot find device \"wg0\"", BackendErrorKind::NotFound ; "missing device")]
    #[test_case("RTNETLINK answers: No such process", BackendErrorKind::NotFound ; "missing route")]
    #[test_case("RTNETLINK answers: Cannot assign requested address", BackendErrorKind::NotFound ; "missing address")]
    #[test_case("RTNETLINK answers: Operation not permitted", BackendErrorKind::Rejected ; "permission")]
    fn classifies_stderr(stderr: &str, expected: BackendErrorKind) {
        let err = classify("ip", &["link", "add"], Some(2), stderr);
        assert_eq!(err.kind, expected);
        assert!(err.message.contains("exited with 2"));
    }

    #[test]
    fn empty_route_listing_means_absent() {
        assert!(!route_listed(""));
        assert!(!route_listed("\n"));
        assert!(route_listed("10.20.0.0/16 scope link \n"));
    }

    #[test]
    fn parses_dump_output() {
        let own = PublicKey::from_bytes_array([7u8; 32]).to_base64();
        let peer = PublicKey::from_bytes_array([9u8; 32]).to_base64();
        let dump = format!(
            "PRIVATE\t{own}\t51820\toff\n{peer}\t(none)\t203.0.113.5:51820\t10.13.13.2/32,10.20.0.0/16\t1700000000\t1024\t2048\t25\n"
        );

        let status = parse_dump("wg0", &dump).expect("parses");
        assert_eq!(status.listen_port, Some(51820));
        assert_eq!(status.public_key.map(|k| k.to_base64()), Some(own));
        assert_eq!(status.peers.len(), 1);

        let p = &status.peers[0];
        assert_eq!(p.endpoint.as_deref(), Some("203.0.113.5:51820"));
        assert_eq!(p.allowed_ips.len(), 2);
        assert_eq!(p.last_handshake, Some(1_700_000_000));
        assert_eq!((p.rx_bytes, p.tx_bytes), (1024, 2048));
        assert_eq!(p.persistent_keepalive, Some(25));
    }

    #[test]
    fn parses_dump_without_peers_or_handshake() {
        let dump = "(none)\t(none)\t0\toff\n";
        let status = parse_dump("wg0", dump).expect("parses");
        assert_eq!(status.public_key, None);
        assert_eq!(status.listen_port, None);
        assert!(status.peers.is_empty());
    }

    #[test]
    fn rejects_truncated_dump() {
        assert!(parse_dump("wg0", "").is_err());
        assert!(parse_dump("wg0", "a\tb\n").is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let backend = CommandBackend::with_paths("/nonexistent/ip", "/nonexistent/wg");
        let err = backend.create("pltest0").await.expect_err("cannot run");
        assert_eq!(err.kind, BackendErrorKind::Unavailable);
    }

    // Requires root and the WireGuard kernel module:
    // sudo cargo test -p pairlink-tunnel -- --ignored
    #[tokio::test]
    #[ignore = "requires root and WireGuard kernel module"]
    async fn create_show_destroy_roundtrip() {
        let backend = CommandBackend::new();
        backend.create("pltest1").await.expect("create");
        assert!(backend.exists("pltest1").await.expect("exists"));
        let status = backend.show("pltest1").await.expect("show");
        assert!(status.peers.is_empty());
        backend.destroy("pltest1").await.expect("destroy");
        assert!(!backend.exists("pltest1").await.expect("exists"));
    }
}
