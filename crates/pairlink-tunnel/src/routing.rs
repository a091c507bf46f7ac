//! Addresses and routes on tunnel interfaces.
//!
//! Every operation is idempotent: adding what is already there and removing
//! what is already gone both succeed. A route to the same destination through
//! another device is a conflict, not a match.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{BackendErrorKind, NetworkStack};
use crate::error::{Result, TunnelError};
use crate::lifecycle::{network_error, InterfaceHandle};
use crate::types::{RouteSpec, TunnelAddress};

/// Manages interface addresses and routes through the host network stack.
#[derive(Clone)]
pub struct RoutingManager {
    stack: Arc<dyn NetworkStack>,
}

impl RoutingManager {
    /// Creates a routing manager.
    #[must_use]
    pub fn new(stack: Arc<dyn NetworkStack>) -> Self {
        Self { stack }
    }

    /// Assigns `address` to the interface.
    ///
    /// # Errors
    ///
    /// `Routing` if the stack refuses, e.g. the address is in use elsewhere.
    pub async fn assign_address(
        &self,
        handle: &InterfaceHandle,
        address: &TunnelAddress,
    ) -> Result<()> {
        let name = handle.name();
        match self.stack.add_address(name, address).await {
            Ok(()) => debug!(interface = name, %address, "assigned address"),
            Err(e) if e.kind == BackendErrorKind::AlreadyExists => {
                debug!(interface = name, %address, "address already assigned");
            }
            Err(e) => return Err(network_error(name, &e)),
        }
        Ok(())
    }

    /// Removes `address` from the interface.
    ///
    /// # Errors
    ///
    /// `Routing` if the stack refuses for a reason other than absence.
    pub async fn remove_address(
        &self,
        handle: &InterfaceHandle,
        address: &TunnelAddress,
    ) -> Result<()> {
        let name = handle.name();
        match self.stack.del_address(name, address).await {
            Ok(()) => debug!(interface = name, %address, "removed address"),
            Err(e) if e.kind == BackendErrorKind::NotFound => {
                debug!(interface = name, %address, "address already removed");
            }
            Err(e) => return Err(network_error(name, &e)),
        }
        Ok(())
    }

    /// Installs `route`, which must point at this interface.
    ///
    /// # Errors
    ///
    /// `ConfigValidation` if the route names another interface, `Routing`
    /// if the stack refuses or another device already holds the destination.
    pub async fn install_route(&self, handle: &InterfaceHandle, route: &RouteSpec) -> Result<()> {
        check_interface(handle, route)?;
        match self.stack.add_route(route).await {
            Ok(()) => debug!(%route, "installed route"),
            Err(e) if e.kind == BackendErrorKind::AlreadyExists => {
                let ours = self
                    .stack
                    .route_exists(route)
                    .await
                    .map_err(|e| network_error(handle.name(), &e))?;
                if !ours {
                    return Err(TunnelError::Routing {
                        interface: handle.name().to_string(),
                        message: format!(
                            "conflicting route to {} already exists",
                            route.destination
                        ),
                    });
                }
                debug!(%route, "route already installed");
            }
            Err(e) => return Err(network_error(handle.name(), &e)),
        }
        Ok(())
    }

    /// Removes `route`.
    ///
    /// # Errors
    ///
    /// `ConfigValidation` if the route names another interface, `Routing`
    /// if the stack refuses for a reason other than absence.
    pub async fn remove_route(&self, handle: &InterfaceHandle, route: &RouteSpec) -> Result<()> {
        check_interface(handle, route)?;
        match self.stack.del_route(route).await {
            Ok(()) => debug!(%route, "removed route"),
            Err(e) if e.kind == BackendErrorKind::NotFound => {
                debug!(%route, "route already removed");
            }
            Err(e) => return Err(network_error(handle.name(), &e)),
        }
        Ok(())
    }
}

fn check_interface(handle: &InterfaceHandle, route: &RouteSpec) -> Result<()> {
    if route.via_interface == handle.name() {
        Ok(())
    } else {
        Err(TunnelError::ConfigValidation(format!(
            "route {route} does not go through {}",
            handle.name()
        )))
    }
}
