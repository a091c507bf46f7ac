//! Collaborator interfaces for the tunnel engine and the host network stack.
//!
//! The orchestration core never implements the tunnel protocol; it drives
//! these two traits. [`CommandBackend`] shells out to `ip` and `wg`;
//! [`FakeBackend`] keeps everything in memory for tests.

mod command;
mod fake;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use crate::types::{InterfaceStatus, RouteSpec, TunnelAddress};

pub use command::CommandBackend;
pub use fake::{FakeBackend, FakeOp, FakeSnapshot};

/// Classification of a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The object being added is already there.
    AlreadyExists,
    /// The object being removed or queried is not there.
    NotFound,
    /// The tool ran and refused the operation.
    Rejected,
    /// The tool could not be run at all.
    Unavailable,
}

/// A failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    /// What kind of failure this is.
    pub kind: BackendErrorKind,
    /// Tool output or description.
    pub message: String,
}

impl BackendError {
    /// Creates a backend error.
    #[must_use]
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for an `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::AlreadyExists, message)
    }

    /// Shorthand for a `NotFound` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    /// Shorthand for a `Rejected` error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Rejected, message)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BackendError {}

/// Result of a collaborator call.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// The external tunnel engine (`wg` plus the kernel module, or a userspace
/// implementation).
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Creates a tunnel device named `name`.
    ///
    /// Fails with `AlreadyExists` when a device of that name is present.
    async fn create(&self, name: &str) -> BackendResult<()>;

    /// Loads the rendered configuration file into the device, replacing its
    /// key, port and peer list.
    async fn setconf(&self, name: &str, config_file: &Path) -> BackendResult<()>;

    /// Removes the device. Fails with `NotFound` when it is absent.
    async fn destroy(&self, name: &str) -> BackendResult<()>;

    /// Whether any network device with this name exists.
    async fn exists(&self, name: &str) -> BackendResult<bool>;

    /// Reads back the live configuration and peer statistics.
    async fn show(&self, name: &str) -> BackendResult<InterfaceStatus>;
}

/// The host network stack, keyed by interface name.
#[async_trait]
pub trait NetworkStack: Send + Sync {
    /// Sets the link administratively up.
    async fn link_up(&self, name: &str) -> BackendResult<()>;

    /// Sets the link administratively down.
    async fn link_down(&self, name: &str) -> BackendResult<()>;

    /// Adds an address. Fails with `AlreadyExists` when already assigned.
    async fn add_address(&self, name: &str, address: &TunnelAddress) -> BackendResult<()>;

    /// Removes an address. Fails with `NotFound` when not assigned.
    async fn del_address(&self, name: &str, address: &TunnelAddress) -> BackendResult<()>;

    /// Adds a route. Fails with `AlreadyExists` when any route to the same
    /// destination exists, whichever device it goes through.
    async fn add_route(&self, route: &RouteSpec) -> BackendResult<()>;

    /// Whether this exact route, destination and device, is installed.
    async fn route_exists(&self, route: &RouteSpec) -> BackendResult<bool>;

    /// Removes a route. Fails with `NotFound` when absent.
    async fn del_route(&self, route: &RouteSpec) -> BackendResult<()>;
}
