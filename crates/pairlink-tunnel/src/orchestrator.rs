//! Tunnel orchestration.
//!
//! [`TunnelOrchestrator`] brings a tunnel up in a fixed order (load identity,
//! render, create, apply, raise, address, routes) and tears it down in
//! reverse. A failed bring-up undoes every step that completed.
//!
//! Runs for the same interface are serialized. Each run executes on its own
//! task, so dropping the caller's future never stops a step halfway; use a
//! [`CancellationToken`] to stop a run between steps.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{NetworkStack, TunnelEngine};
use crate::config::{render, RemotePeer, TunnelConfig};
use crate::error::{Result, Step, TunnelError};
use crate::keys::PublicKey;
use crate::keystore::{KeyStore, Provenance};
use crate::lifecycle::{AppliedKeys, InterfaceHandle, InterfaceState, LifecycleManager};
use crate::routing::RoutingManager;
use crate::spec::{validate_interface_name, PeerKeySource, PeerSpec};
use crate::types::{InterfaceStatus, PeerIdentity, RouteSpec, TunnelAddress};

/// Default time allowed for any single step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default directory for identity key files.
pub const DEFAULT_KEY_DIR: &str = "/var/lib/pairlink/keys";

/// Default directory for ownership records and rendered configuration.
pub const DEFAULT_STATE_DIR: &str = "/run/pairlink";

/// Default owner tag written into ownership records.
pub const DEFAULT_OWNER_TAG: &str = "pairlink";

/// Configuration for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Directory holding `<identity>.key` files.
    pub key_dir: PathBuf,
    /// Directory holding ownership records and transient rendered files.
    pub state_dir: PathBuf,
    /// Tag identifying interfaces created by this orchestrator.
    pub owner_tag: String,
    /// Time allowed for any single step.
    pub step_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from(DEFAULT_KEY_DIR),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            owner_tag: DEFAULT_OWNER_TAG.to_string(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a config with the given key and state directories.
    #[must_use]
    pub fn new(key_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the owner tag.
    #[must_use]
    pub fn with_owner_tag(mut self, tag: impl Into<String>) -> Self {
        self.owner_tag = tag.into();
        self
    }

    /// Sets the per-step timeout.
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` if the timeout is zero or the owner tag is
    /// empty.
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout.is_zero() {
            return Err(TunnelError::ConfigValidation(
                "step timeout must be positive".into(),
            ));
        }
        if self.owner_tag.trim().is_empty() {
            return Err(TunnelError::ConfigValidation(
                "owner tag cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelReport {
    /// Interface name.
    pub interface: String,
    /// Local public key, when the identity was loaded.
    pub public_key: Option<PublicKey>,
    /// Whether anything on the host changed.
    pub changed: bool,
    /// Steps completed, in order.
    pub steps: Vec<Step>,
}

impl TunnelReport {
    fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            public_key: None,
            changed: false,
            steps: Vec::new(),
        }
    }

    fn completed(&mut self, step: Step) {
        self.steps.push(step);
        self.changed = true;
    }
}

/// Combined view of what the orchestrator and the engine know about an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    /// Interface name.
    pub interface: String,
    /// Whether this orchestrator owns the interface.
    pub managed: bool,
    /// Lifecycle state as tracked by the orchestrator.
    pub state: InterfaceState,
    /// Whether the link is up, as tracked by the orchestrator.
    pub up: bool,
    /// Live engine state, when the device exists and can be queried.
    pub live: Option<InterfaceStatus>,
}

type Slot = Arc<AsyncMutex<Option<InterfaceHandle>>>;

/// Steps of a bring-up that have completed and must be undone on failure.
#[derive(Default)]
struct Progress {
    generated_identity: Option<String>,
    handle: Option<InterfaceHandle>,
    address: Option<TunnelAddress>,
    routes: Vec<RouteSpec>,
}

/// Brings tunnels up and down.
#[derive(Clone)]
pub struct TunnelOrchestrator {
    keystore: KeyStore,
    lifecycle: LifecycleManager,
    routing: RoutingManager,
    step_timeout: Duration,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl TunnelOrchestrator {
    /// Creates an orchestrator driving `engine` and `stack`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` if `config` is invalid.
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<dyn TunnelEngine>,
        stack: Arc<dyn NetworkStack>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            keystore: KeyStore::new(config.key_dir),
            lifecycle: LifecycleManager::new(
                engine,
                Arc::clone(&stack),
                config.state_dir,
                config.owner_tag,
            ),
            routing: RoutingManager::new(stack),
            step_timeout: config.step_timeout,
            slots: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Creates an orchestrator over one backend that is both engine and stack.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` if `config` is invalid.
    pub fn with_backend<B>(config: OrchestratorConfig, backend: B) -> Result<Self>
    where
        B: TunnelEngine + NetworkStack + 'static,
    {
        let backend = Arc::new(backend);
        Self::new(config, Arc::clone(&backend) as Arc<dyn TunnelEngine>, backend)
    }

    /// The key store used for local and peer identities.
    #[must_use]
    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    /// Renders the configuration `spec` would apply, without touching the host.
    ///
    /// The local identity is loaded, or generated if absent.
    ///
    /// # Errors
    ///
    /// Key store and validation errors, attributed to their step.
    pub fn render(&self, spec: &PeerSpec) -> Result<TunnelConfig> {
        spec.validate()?;
        let (identity, _) = self
            .keystore
            .get_or_create(&spec.identity)
            .map_err(|e| e.at_step(Step::LoadIdentity))?;
        self.render_config(identity, spec)
            .map_err(|e| e.at_step(Step::RenderConfig))
    }

    /// Brings the tunnel described by `spec` up.
    ///
    /// A tunnel already up with an identical spec is left alone. One up with
    /// a different spec is torn down and rebuilt.
    ///
    /// # Errors
    ///
    /// The first failing step's error, after everything completed so far has
    /// been rolled back.
    pub async fn ensure_up(&self, spec: PeerSpec) -> Result<TunnelReport> {
        self.ensure_up_with(spec, CancellationToken::new()).await
    }

    /// [`ensure_up`](Self::ensure_up) with a cancellation token checked
    /// between steps.
    ///
    /// # Errors
    ///
    /// As for `ensure_up`; `Cancelled` if the token fires mid-run.
    pub async fn ensure_up_with(
        &self,
        spec: PeerSpec,
        cancel: CancellationToken,
    ) -> Result<TunnelReport> {
        let this = self.clone();
        tokio::spawn(async move { this.run_up(spec, cancel).await })
            .await
            .map_err(|e| TunnelError::TaskFailed(e.to_string()))?
    }

    /// Tears the tunnel for `spec.interface` down. An absent tunnel is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// `InterfaceExists` (at `DestroyInterface`) if the device is not ours,
    /// or the first failing teardown step.
    pub async fn ensure_down(&self, spec: PeerSpec) -> Result<TunnelReport> {
        self.ensure_down_with(spec, CancellationToken::new()).await
    }

    /// [`ensure_down`](Self::ensure_down) with a cancellation token checked
    /// between steps.
    ///
    /// # Errors
    ///
    /// As for `ensure_down`; `Cancelled` if the token fires mid-run.
    pub async fn ensure_down_with(
        &self,
        spec: PeerSpec,
        cancel: CancellationToken,
    ) -> Result<TunnelReport> {
        let this = self.clone();
        tokio::spawn(async move { this.run_down(spec, cancel).await })
            .await
            .map_err(|e| TunnelError::TaskFailed(e.to_string()))?
    }

    /// Reports what is known about interface `name`.
    ///
    /// # Errors
    ///
    /// `ConfigValidation` for a bad name, `Routing` if the engine cannot be
    /// queried.
    pub async fn status(&self, name: &str) -> Result<TunnelStatus> {
        validate_interface_name(name)?;
        let slot = self.slot(name);
        let mut current = slot.lock().await;

        if current.is_none() && self.lifecycle.is_owned(name) {
            *current = self.lifecycle.adopt(name).await?;
        }

        let live = if self.lifecycle.exists(name).await? {
            match self.lifecycle.status(name).await {
                Ok(status) => Some(status),
                Err(e) => {
                    debug!(interface = name, error = %e, "engine cannot describe interface");
                    None
                }
            }
        } else {
            None
        };

        Ok(TunnelStatus {
            interface: name.to_string(),
            managed: current.is_some(),
            state: current
                .as_ref()
                .map_or(InterfaceState::Absent, InterfaceHandle::state),
            up: current.as_ref().is_some_and(InterfaceHandle::is_up),
            live,
        })
    }

    async fn run_up(&self, spec: PeerSpec, cancel: CancellationToken) -> Result<TunnelReport> {
        spec.validate()?;
        let interface = spec.interface.clone();
        let slot = self.slot(&interface);
        let mut current = slot.lock().await;
        let mut report = TunnelReport::new(&interface);

        if current.is_none() {
            *current = self
                .step(Step::CreateInterface, self.lifecycle.adopt(&interface))
                .await?;
        }

        let mut progress = Progress::default();
        let config = match self.prepare(&spec, &cancel, &mut progress, &mut report).await {
            Ok(config) => config,
            Err(err) => return Err(self.abort(&interface, progress, err).await),
        };

        // Keys are part of what is running: a peer identity regenerated since
        // the last run must reach the device even if the spec is unchanged.
        if let Some(handle) = current.as_ref() {
            if handle.is_configured()
                && handle.is_up()
                && handle.spec() == Some(&spec)
                && handle.keys() == Some(&AppliedKeys::of(&config))
            {
                debug!(interface = %interface, "tunnel already up with this spec");
                let mut unchanged = TunnelReport::new(&interface);
                unchanged.public_key = report.public_key;
                return Ok(unchanged);
            }
        }

        if let Some(mut previous) = current.take() {
            info!(
                interface = %interface,
                "replacing tunnel brought up with a different spec or keys"
            );
            let applied = previous.spec().cloned().unwrap_or_else(|| spec.clone());
            if let Err(err) = self
                .teardown(&mut previous, &applied, &cancel, &mut report)
                .await
            {
                if previous.state() != InterfaceState::Absent {
                    *current = Some(previous);
                }
                return Err(self.abort(&interface, progress, err).await);
            }
        }

        match self
            .bring_up(&spec, &config, &cancel, &mut progress, &mut report)
            .await
        {
            Ok(()) => {
                *current = progress.handle.take();
                info!(
                    interface = %interface,
                    public_key = ?report.public_key,
                    peers = spec.peers.len(),
                    "tunnel up"
                );
                Ok(report)
            }
            Err(err) => Err(self.abort(&interface, progress, err).await),
        }
    }

    /// Loads the identity and renders the configuration. Touches nothing
    /// but the key store, so an invalid spec never disturbs a running tunnel.
    async fn prepare(
        &self,
        spec: &PeerSpec,
        cancel: &CancellationToken,
        progress: &mut Progress,
        report: &mut TunnelReport,
    ) -> Result<TunnelConfig> {
        checkpoint(cancel, Step::LoadIdentity)?;
        let (identity, provenance) = self
            .step(Step::LoadIdentity, self.load_identity(&spec.identity))
            .await?;
        if provenance == Provenance::Generated {
            progress.generated_identity = Some(spec.identity.clone());
            report.changed = true;
        }
        report.public_key = Some(*identity.public_key());
        report.steps.push(Step::LoadIdentity);

        checkpoint(cancel, Step::RenderConfig)?;
        let config = self
            .render_config(identity, spec)
            .map_err(|e| e.at_step(Step::RenderConfig))?;
        report.steps.push(Step::RenderConfig);
        Ok(config)
    }

    async fn bring_up(
        &self,
        spec: &PeerSpec,
        config: &TunnelConfig,
        cancel: &CancellationToken,
        progress: &mut Progress,
        report: &mut TunnelReport,
    ) -> Result<()> {
        checkpoint(cancel, Step::CreateInterface)?;
        let created = match self
            .step(Step::CreateInterface, self.lifecycle.create(&spec.interface))
            .await
        {
            Ok(created) => created,
            Err(err) => {
                // A create cut short may still have made the device; it is
                // claimed in the record, so it can be removed here.
                self.undo(
                    Step::DestroyInterface,
                    self.lifecycle.abandon(&spec.interface),
                )
                .await;
                return Err(err);
            }
        };
        let handle = progress.handle.insert(created);
        report.completed(Step::CreateInterface);

        checkpoint(cancel, Step::ApplyConfig)?;
        self.step(Step::ApplyConfig, self.lifecycle.apply(handle, config))
            .await?;
        report.completed(Step::ApplyConfig);

        checkpoint(cancel, Step::SetUp)?;
        self.step(Step::SetUp, self.lifecycle.set_up(handle)).await?;
        report.completed(Step::SetUp);

        checkpoint(cancel, Step::AssignAddress)?;
        self.step(
            Step::AssignAddress,
            self.routing.assign_address(handle, &spec.address),
        )
        .await?;
        progress.address = Some(spec.address);
        report.completed(Step::AssignAddress);

        for route in spec.route_specs() {
            checkpoint(cancel, Step::InstallRoute)?;
            self.step(Step::InstallRoute, self.routing.install_route(handle, &route))
                .await?;
            progress.routes.push(route);
            report.completed(Step::InstallRoute);
        }

        if let Err(e) = self.lifecycle.record(handle, spec, config) {
            warn!(
                interface = %spec.interface,
                error = %e,
                "failed to record tunnel spec; a later run will rebuild the tunnel"
            );
        }
        Ok(())
    }

    async fn abort(&self, interface: &str, progress: Progress, err: TunnelError) -> TunnelError {
        warn!(interface, error = %err, "bring-up failed; rolling back");
        self.rollback(progress).await;
        err
    }

    async fn run_down(&self, spec: PeerSpec, cancel: CancellationToken) -> Result<TunnelReport> {
        validate_interface_name(&spec.interface)?;
        let interface = spec.interface.clone();
        let slot = self.slot(&interface);
        let mut current = slot.lock().await;
        let mut report = TunnelReport::new(&interface);

        let handle = match current.take() {
            Some(handle) => Some(handle),
            None => {
                self.step(Step::DestroyInterface, self.lifecycle.adopt(&interface))
                    .await?
            }
        };
        let Some(mut handle) = handle else {
            debug!(interface = %interface, "tunnel already down");
            return Ok(report);
        };

        let applied = handle.spec().cloned().unwrap_or(spec);
        match self
            .teardown(&mut handle, &applied, &cancel, &mut report)
            .await
        {
            Ok(()) => {
                info!(interface = %interface, "tunnel down");
                Ok(report)
            }
            Err(err) => {
                if handle.state() != InterfaceState::Absent {
                    *current = Some(handle);
                }
                Err(err)
            }
        }
    }

    /// Removes routes, address, link state and device, in that order.
    async fn teardown(
        &self,
        handle: &mut InterfaceHandle,
        applied: &PeerSpec,
        cancel: &CancellationToken,
        report: &mut TunnelReport,
    ) -> Result<()> {
        for route in applied.route_specs().iter().rev() {
            checkpoint(cancel, Step::RemoveRoute)?;
            self.step(Step::RemoveRoute, self.routing.remove_route(handle, route))
                .await?;
            report.completed(Step::RemoveRoute);
        }

        checkpoint(cancel, Step::RemoveAddress)?;
        self.step(
            Step::RemoveAddress,
            self.routing.remove_address(handle, &applied.address),
        )
        .await?;
        report.completed(Step::RemoveAddress);

        checkpoint(cancel, Step::SetDown)?;
        self.step(Step::SetDown, self.lifecycle.set_down(handle))
            .await?;
        report.completed(Step::SetDown);

        checkpoint(cancel, Step::DestroyInterface)?;
        self.step(Step::DestroyInterface, self.lifecycle.destroy(handle))
            .await?;
        report.completed(Step::DestroyInterface);
        Ok(())
    }

    /// Undoes completed steps in reverse order. Failures are logged, not
    /// returned, so that every remaining step still runs.
    async fn rollback(&self, mut progress: Progress) {
        if let Some(mut handle) = progress.handle.take() {
            for route in progress.routes.iter().rev() {
                self.undo(Step::RemoveRoute, self.routing.remove_route(&handle, route))
                    .await;
            }
            if let Some(address) = progress.address {
                self.undo(
                    Step::RemoveAddress,
                    self.routing.remove_address(&handle, &address),
                )
                .await;
            }
            if handle.is_up() {
                self.undo(Step::SetDown, self.lifecycle.set_down(&mut handle))
                    .await;
            }
            self.undo(Step::DestroyInterface, self.lifecycle.destroy(&mut handle))
                .await;
        }

        if let Some(identity) = progress.generated_identity {
            if let Err(e) = self.keystore.discard(&identity) {
                warn!(identity = %identity, error = %e, "rollback could not discard identity");
            }
        }
    }

    async fn undo<F>(&self, step: Step, fut: F)
    where
        F: Future<Output = Result<()>>,
    {
        if let Err(e) = self.step(step, fut).await {
            warn!(%step, error = %e, "rollback step failed");
        }
    }

    /// Runs one step under the step timeout, attributing failures to it.
    async fn step<T, F>(&self, step: Step, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Ok(result) = tokio::time::timeout(self.step_timeout, fut).await {
            result.map_err(|e| e.at_step(step))
        } else {
            let timeout_ms = u64::try_from(self.step_timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(%step, timeout_ms, "step timed out");
            Err(TunnelError::Timeout { step, timeout_ms })
        }
    }

    async fn load_identity(&self, name: &str) -> Result<(PeerIdentity, Provenance)> {
        let keystore = self.keystore.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || keystore.get_or_create(&name))
            .await
            .map_err(|e| TunnelError::TaskFailed(e.to_string()))?
    }

    fn render_config(&self, identity: PeerIdentity, spec: &PeerSpec) -> Result<TunnelConfig> {
        let peers = spec
            .peers
            .iter()
            .map(|peer| {
                let public_key = match peer.key_source()? {
                    PeerKeySource::Inline(key) => *key,
                    PeerKeySource::Identity(name) => self.keystore.load_public(name)?,
                };
                Ok(RemotePeer {
                    public_key,
                    allowed_ips: peer.allowed_ips.clone(),
                    endpoint: peer.endpoint.clone(),
                    keepalive_seconds: peer.persistent_keepalive,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        render(identity, spec.address, spec.listen_port, peers)
    }

    fn slot(&self, name: &str) -> Slot {
        Arc::clone(self.slots.lock().entry(name.to_string()).or_default())
    }
}

fn checkpoint(cancel: &CancellationToken, next: Step) -> Result<()> {
    if cancel.is_cancelled() {
        Err(TunnelError::Cancelled(next))
    } else {
        Ok(())
    }
}
