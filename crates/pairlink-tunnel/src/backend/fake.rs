//! In-memory backend for tests.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BackendError, BackendResult, NetworkStack, TunnelEngine};
use crate::config::{parse_conf, ParsedConf};
use crate::types::{InterfaceStatus, PeerStatus, RouteSpec, TunnelAddress};

/// Operations of the fake backend, used for failure and delay injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    /// `TunnelEngine::create`.
    Create,
    /// `TunnelEngine::setconf`.
    SetConf,
    /// `TunnelEngine::destroy`.
    Destroy,
    /// `NetworkStack::link_up`.
    LinkUp,
    /// `NetworkStack::link_down`.
    LinkDown,
    /// `NetworkStack::add_address`.
    AddAddress,
    /// `NetworkStack::del_address`.
    DelAddress,
    /// `NetworkStack::add_route`.
    AddRoute,
    /// `NetworkStack::del_route`.
    DelRoute,
}

#[derive(Debug, Clone, Default)]
struct FakeDevice {
    up: bool,
    addresses: Vec<TunnelAddress>,
    conf: Option<ParsedConf>,
}

#[derive(Debug, Default)]
struct FakeState {
    devices: HashMap<String, FakeDevice>,
    routes: BTreeSet<(String, String)>,
    failures: HashMap<FakeOp, BackendError>,
    delays: HashMap<FakeOp, Duration>,
    stalls: HashMap<FakeOp, Duration>,
    calls: Vec<FakeOp>,
}

/// A snapshot of everything the fake network holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeSnapshot {
    /// Device names with their up flag.
    pub devices: Vec<(String, bool)>,
    /// `(device, address)` pairs.
    pub addresses: Vec<(String, String)>,
    /// `(destination, device)` pairs.
    pub routes: Vec<(String, String)>,
}

/// An in-memory tunnel engine and network stack.
///
/// Mirrors the kernel's behavior closely enough for orchestration tests:
/// duplicate adds fail with `AlreadyExists`, removals of missing objects
/// fail with `NotFound`, routes are refused on a down link, and destroying
/// a device drops its addresses and routes.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    /// Creates an empty fake network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: FakeOp, error: BackendError) {
        self.state.lock().failures.insert(op, error);
    }

    /// Makes every call of `op` sleep for `delay` before doing anything.
    pub fn delay(&self, op: FakeOp, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    /// Makes every successful call of `op` sleep for `stall` after it has
    /// taken effect, like a tool that hangs before exiting.
    pub fn stall_after(&self, op: FakeOp, stall: Duration) {
        self.state.lock().stalls.insert(op, stall);
    }

    /// Adds a device not created through the engine, as another process would.
    pub fn add_foreign_device(&self, name: &str) {
        self.state
            .lock()
            .devices
            .insert(name.to_string(), FakeDevice::default());
    }

    /// Adds a route owned by someone else, e.g. the same destination via `eth0`.
    pub fn add_foreign_route(&self, destination: &str, device: &str) {
        self.state
            .lock()
            .routes
            .insert((destination.to_string(), device.to_string()));
    }

    /// Returns the operations called so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<FakeOp> {
        self.state.lock().calls.clone()
    }

    /// Number of times `op` was called.
    #[must_use]
    pub fn call_count(&self, op: FakeOp) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Whether a device exists.
    #[must_use]
    pub fn has_device(&self, name: &str) -> bool {
        self.state.lock().devices.contains_key(name)
    }

    /// The configuration last applied to a device.
    #[must_use]
    pub fn applied_conf(&self, name: &str) -> Option<ParsedConf> {
        self.state
            .lock()
            .devices
            .get(name)
            .and_then(|d| d.conf.clone())
    }

    /// Captures the full network state.
    #[must_use]
    pub fn snapshot(&self) -> FakeSnapshot {
        let state = self.state.lock();
        let mut devices: Vec<(String, bool)> = state
            .devices
            .iter()
            .map(|(name, d)| (name.clone(), d.up))
            .collect();
        devices.sort();
        let mut addresses: Vec<(String, String)> = state
            .devices
            .iter()
            .flat_map(|(name, d)| d.addresses.iter().map(move |a| (name.clone(), a.to_string())))
            .collect();
        addresses.sort();
        FakeSnapshot {
            devices,
            addresses,
            routes: state.routes.iter().cloned().collect(),
        }
    }

    /// Records the call, applies its delay, then returns an injected failure if any.
    async fn enter(&self, op: FakeOp) -> BackendResult<()> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(op);
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.state.lock().failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Applies the stall configured for `op` once it has succeeded.
    async fn leave<T>(&self, op: FakeOp, result: BackendResult<T>) -> BackendResult<T> {
        let stall = self.state.lock().stalls.get(&op).copied();
        if let (Some(stall), Ok(_)) = (stall, &result) {
            tokio::time::sleep(stall).await;
        }
        result
    }

    fn with_device<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FakeDevice) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(name)
            .ok_or_else(|| BackendError::not_found(format!("Cannot find device \"{name}\"")))?;
        f(device)
    }
}

fn route_key(route: &RouteSpec) -> (String, String) {
    (route.destination.to_string(), route.via_interface.clone())
}

#[async_trait]
impl TunnelEngine for FakeBackend {
    async fn create(&self, name: &str) -> BackendResult<()> {
        self.enter(FakeOp::Create).await?;
        let result = {
            let mut state = self.state.lock();
            if state.devices.contains_key(name) {
                Err(BackendError::already_exists("RTNETLINK answers: File exists"))
            } else {
                state.devices.insert(name.to_string(), FakeDevice::default());
                Ok(())
            }
        };
        self.leave(FakeOp::Create, result).await
    }

    async fn setconf(&self, name: &str, config_file: &Path) -> BackendResult<()> {
        self.enter(FakeOp::SetConf).await?;
        let text = std::fs::read_to_string(config_file)
            .map_err(|e| BackendError::rejected(format!("cannot read {}: {e}", config_file.display())))?;
        let conf = parse_conf(&text).map_err(|e| BackendError::rejected(e.to_string()))?;
        let result = self.with_device(name, |device| {
            device.conf = Some(conf);
            Ok(())
        });
        self.leave(FakeOp::SetConf, result).await
    }

    async fn destroy(&self, name: &str) -> BackendResult<()> {
        self.enter(FakeOp::Destroy).await?;
        let mut state = self.state.lock();
        if state.devices.remove(name).is_none() {
            return Err(BackendError::not_found(format!("Cannot find device \"{name}\"")));
        }
        state.routes.retain(|(_, dev)| dev != name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> BackendResult<bool> {
        Ok(self.has_device(name))
    }

    async fn show(&self, name: &str) -> BackendResult<InterfaceStatus> {
        self.with_device(name, |device| {
            let Some(conf) = device.conf.as_ref() else {
                return Ok(InterfaceStatus {
                    name: name.to_string(),
                    public_key: None,
                    listen_port: None,
                    peers: Vec::new(),
                });
            };
            Ok(InterfaceStatus {
                name: name.to_string(),
                public_key: Some(conf.private_key.public_key()),
                listen_port: conf.listen_port,
                peers: conf
                    .peers
                    .iter()
                    .map(|p| PeerStatus {
                        public_key: p.public_key,
                        endpoint: p.endpoint.as_ref().map(ToString::to_string),
                        allowed_ips: p.allowed_ips.clone(),
                        last_handshake: None,
                        rx_bytes: 0,
                        tx_bytes: 0,
                        persistent_keepalive: p.keepalive_seconds,
                    })
                    .collect(),
            })
        })
    }
}

#[async_trait]
impl NetworkStack for FakeBackend {
    async fn link_up(&self, name: &str) -> BackendResult<()> {
        self.enter(FakeOp::LinkUp).await?;
        let result = self.with_device(name, |device| {
            device.up = true;
            Ok(())
        });
        self.leave(FakeOp::LinkUp, result).await
    }

    async fn link_down(&self, name: &str) -> BackendResult<()> {
        self.enter(FakeOp::LinkDown).await?;
        self.with_device(name, |device| {
            device.up = false;
            Ok(())
        })?;
        // The kernel drops routes through a link that goes down.
        self.state.lock().routes.retain(|(_, dev)| dev != name);
        Ok(())
    }

    async fn add_address(&self, name: &str, address: &TunnelAddress) -> BackendResult<()> {
        self.enter(FakeOp::AddAddress).await?;
        self.with_device(name, |device| {
            if device.addresses.contains(address) {
                return Err(BackendError::already_exists("RTNETLINK answers: File exists"));
            }
            device.addresses.push(*address);
            Ok(())
        })
    }

    async fn del_address(&self, name: &str, address: &TunnelAddress) -> BackendResult<()> {
        self.enter(FakeOp::DelAddress).await?;
        self.with_device(name, |device| {
            let before = device.addresses.len();
            device.addresses.retain(|a| a != address);
            if device.addresses.len() == before {
                return Err(BackendError::not_found(
                    "RTNETLINK answers: Cannot assign requested address",
                ));
            }
            Ok(())
        })
    }

    async fn add_route(&self, route: &RouteSpec) -> BackendResult<()> {
        self.enter(FakeOp::AddRoute).await?;
        let up = self.with_device(&route.via_interface, |device| Ok(device.up))?;
        if !up {
            return Err(BackendError::rejected("RTNETLINK answers: Network is down"));
        }
        let result = {
            let mut state = self.state.lock();
            let destination = route.destination.to_string();
            // The kernel keys a plain route by destination, whatever device holds it.
            if state.routes.iter().any(|(dest, _)| *dest == destination) {
                Err(BackendError::already_exists("RTNETLINK answers: File exists"))
            } else {
                state.routes.insert(route_key(route));
                Ok(())
            }
        };
        self.leave(FakeOp::AddRoute, result).await
    }

    async fn route_exists(&self, route: &RouteSpec) -> BackendResult<bool> {
        Ok(self.state.lock().routes.contains(&route_key(route)))
    }

    async fn del_route(&self, route: &RouteSpec) -> BackendResult<()> {
        self.enter(FakeOp::DelRoute).await?;
        if !self.state.lock().routes.remove(&route_key(route)) {
            return Err(BackendError::not_found("RTNETLINK answers: No such process"));
        }
        Ok(())
    }
}
