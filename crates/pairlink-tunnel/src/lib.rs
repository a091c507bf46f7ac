//! Point-to-point tunnel orchestration.
//!
//! This crate provisions one end of a key-authenticated UDP tunnel:
//!
//! - [`KeyStore`] keeps a Curve25519 identity per name on disk
//! - [`render`] turns an identity, an address and remote peers into a
//!   validated [`TunnelConfig`]
//! - [`LifecycleManager`] and [`RoutingManager`] drive the tunnel engine and
//!   host network stack through the [`TunnelEngine`] and [`NetworkStack`]
//!   traits
//! - [`TunnelOrchestrator`] sequences all of the above with per-step
//!   timeouts and rollback
//!
//! # Example
//!
//! ```no_run
//! use pairlink_tunnel::{CommandBackend, OrchestratorConfig, PeerSpec, TunnelOrchestrator};
//!
//! # async fn run() -> pairlink_tunnel::Result<()> {
//! let spec = PeerSpec::from_file("/etc/pairlink/wg0.toml")?;
//! let orchestrator =
//!     TunnelOrchestrator::with_backend(OrchestratorConfig::default(), CommandBackend::new())?;
//! let report = orchestrator.ensure_up(spec.clone()).await?;
//! println!("{} up, public key {:?}", report.interface, report.public_key);
//! orchestrator.ensure_down(spec).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
mod keys;
pub mod keystore;
pub mod lifecycle;
pub mod orchestrator;
pub mod routing;
pub mod spec;
pub mod types;

pub use backend::{
    BackendError, BackendErrorKind, CommandBackend, FakeBackend, FakeOp, NetworkStack,
    TunnelEngine,
};
pub use config::{parse_conf, render, ParsedConf, RemotePeer, RenderedConfigFile, TunnelConfig};
pub use error::{Result, Step, TunnelError};
pub use keys::{KeyPair, PrivateKey, PublicKey, KEY_SIZE};
pub use keystore::{KeyStore, Provenance};
pub use lifecycle::{AppliedKeys, InterfaceHandle, InterfaceState, LifecycleManager};
pub use orchestrator::{OrchestratorConfig, TunnelOrchestrator, TunnelReport, TunnelStatus};
pub use routing::RoutingManager;
pub use spec::{PeerSpec, RemotePeerSpec, RouteEntry};
pub use types::{
    AllowedIp, Endpoint, InterfaceStatus, PeerIdentity, PeerStatus, RouteSpec, TunnelAddress,
};
