//! Interface lifecycle: create, configure, raise, lower, destroy.
//!
//! Every interface this manager creates gets an ownership record in
//! `<state_dir>/<name>.owner`. The record separates devices left behind by
//! an earlier run of ours (safe to replace) from devices some other tool
//! owns (never touched).

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BackendErrorKind, NetworkStack, TunnelEngine};
use crate::config::{RenderedConfigFile, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::keys::PublicKey;
use crate::keystore::create_private_dir;
use crate::spec::{validate_interface_name, PeerSpec};
use crate::types::InterfaceStatus;

const OWNER_EXTENSION: &str = "owner";

/// Where an interface is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceState {
    /// Destroyed, or never created.
    Absent,
    /// The device exists but has no configuration.
    Created,
    /// A rendered configuration has been applied.
    Configured,
}

/// Keys a tunnel was brought up with: the local public key and each peer's
/// key, in rendered order.
///
/// Two runs of the same spec can resolve different keys when an identity
/// was regenerated in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedKeys {
    /// Local public key.
    pub local: PublicKey,
    /// Remote peer keys.
    pub peers: Vec<PublicKey>,
}

impl AppliedKeys {
    /// Keys carried by a rendered configuration.
    #[must_use]
    pub fn of(config: &TunnelConfig) -> Self {
        Self {
            local: *config.local().public_key(),
            peers: config.remote_peers().iter().map(|p| p.public_key).collect(),
        }
    }
}

/// Exclusive handle to one interface created (or adopted) by this manager.
#[derive(Debug)]
pub struct InterfaceHandle {
    name: String,
    state: InterfaceState,
    up: bool,
    spec: Option<PeerSpec>,
    keys: Option<AppliedKeys>,
}

impl InterfaceHandle {
    fn claimed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: InterfaceState::Absent,
            up: false,
            spec: None,
            keys: None,
        }
    }

    /// Interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> InterfaceState {
        self.state
    }

    /// Whether a configuration has been applied.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.state == InterfaceState::Configured
    }

    /// Whether the link is administratively up.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.up
    }

    /// The spec the interface was fully brought up for, if any.
    #[must_use]
    pub fn spec(&self) -> Option<&PeerSpec> {
        self.spec.as_ref()
    }

    /// The keys the interface was fully brought up with, if any.
    #[must_use]
    pub fn keys(&self) -> Option<&AppliedKeys> {
        self.keys.as_ref()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OwnerRecord {
    owner: String,
    state: InterfaceState,
    up: bool,
    #[serde(default)]
    spec: Option<PeerSpec>,
    #[serde(default)]
    keys: Option<AppliedKeys>,
}

/// Drives the tunnel engine and link state for tunnel interfaces.
#[derive(Clone)]
pub struct LifecycleManager {
    engine: Arc<dyn TunnelEngine>,
    stack: Arc<dyn NetworkStack>,
    state_dir: PathBuf,
    owner_tag: String,
}

impl LifecycleManager {
    /// Creates a manager that records ownership under `state_dir`.
    #[must_use]
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        stack: Arc<dyn NetworkStack>,
        state_dir: impl Into<PathBuf>,
        owner_tag: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            stack,
            state_dir: state_dir.into(),
            owner_tag: owner_tag.into(),
        }
    }

    /// Creates the interface `name`.
    ///
    /// A device with that name left behind by an earlier run of this owner
    /// is destroyed and recreated. The ownership record is written before
    /// the engine is asked for the device, so a create interrupted after the
    /// engine acted still leaves a device this owner can remove.
    ///
    /// # Errors
    ///
    /// `InterfaceExists` if a device with that name exists and is not ours,
    /// `Routing` if the engine refuses, `Io` if the ownership record cannot
    /// be written.
    pub async fn create(&self, name: &str) -> Result<InterfaceHandle> {
        validate_interface_name(name)?;

        if self.exists(name).await? {
            if !self.is_owned(name) {
                return Err(TunnelError::InterfaceExists(name.to_string()));
            }
            warn!(interface = name, "removing stale interface left by a previous run");
            self.remove_device(name).await?;
        }

        let mut handle = InterfaceHandle::claimed(name);
        self.write_record(&handle)?;

        if let Err(e) = self.engine.create(name).await {
            if let Err(err) = self.remove_record(name) {
                warn!(interface = name, error = %err, "failed to remove ownership record");
            }
            return Err(if e.kind == BackendErrorKind::AlreadyExists {
                TunnelError::InterfaceExists(name.to_string())
            } else {
                network_error(name, &e)
            });
        }

        handle.state = InterfaceState::Created;
        if let Err(err) = self.write_record(&handle) {
            if let Err(e) = self.remove_device(name).await {
                warn!(interface = name, error = %e, "failed to remove unrecorded interface");
            }
            return Err(err);
        }

        info!(interface = name, "created interface");
        Ok(handle)
    }

    /// Cleans up after a create that failed or was cut short: removes the
    /// device if our record claims it, then the record. Devices not claimed
    /// by this owner are left alone.
    ///
    /// # Errors
    ///
    /// `Routing` if the engine refuses, `Io` if the record cannot be removed.
    pub async fn abandon(&self, name: &str) -> Result<()> {
        if !self.is_owned(name) {
            return Ok(());
        }
        debug!(interface = name, "abandoning interrupted create");
        self.remove_device(name).await
    }

    /// Pushes `config` into the interface.
    ///
    /// The rendered file lives in the state directory with mode `0600` and
    /// is removed as soon as the engine has read it. On failure the handle
    /// keeps its previous state.
    ///
    /// # Errors
    ///
    /// `Apply` if the engine rejects the configuration, `Io` if the
    /// ownership record cannot be rewritten.
    pub async fn apply(&self, handle: &mut InterfaceHandle, config: &TunnelConfig) -> Result<()> {
        if handle.state == InterfaceState::Absent {
            return Err(apply_error(&handle.name, "interface has been destroyed"));
        }

        let file = RenderedConfigFile::write_in(&self.state_dir, config)?;
        self.engine
            .setconf(&handle.name, file.path())
            .await
            .map_err(|e| apply_error(&handle.name, e.message))?;
        drop(file);

        handle.state = InterfaceState::Configured;
        self.write_record(handle)?;
        debug!(
            interface = %handle.name,
            peers = config.remote_peers().len(),
            "applied configuration"
        );
        Ok(())
    }

    /// Sets the link up. The interface must be configured.
    ///
    /// The ownership record is rewritten after the change, as it is by
    /// `apply` and `set_down`.
    ///
    /// # Errors
    ///
    /// `Routing` if the interface is not configured or the stack refuses.
    pub async fn set_up(&self, handle: &mut InterfaceHandle) -> Result<()> {
        if handle.state != InterfaceState::Configured {
            return Err(TunnelError::Routing {
                interface: handle.name.clone(),
                message: "cannot raise an interface before its configuration is applied".into(),
            });
        }
        self.stack
            .link_up(&handle.name)
            .await
            .map_err(|e| network_error(&handle.name, &e))?;
        handle.up = true;
        self.write_record(handle)?;
        debug!(interface = %handle.name, "link up");
        Ok(())
    }

    /// Sets the link down. A missing device counts as down.
    ///
    /// # Errors
    ///
    /// `Routing` if the stack refuses for another reason.
    pub async fn set_down(&self, handle: &mut InterfaceHandle) -> Result<()> {
        match self.stack.link_down(&handle.name).await {
            Ok(()) => debug!(interface = %handle.name, "link down"),
            Err(e) if e.kind == BackendErrorKind::NotFound => {
                debug!(interface = %handle.name, "link already gone");
            }
            Err(e) => return Err(network_error(&handle.name, &e)),
        }
        handle.up = false;
        if self.is_owned(&handle.name) {
            self.write_record(handle)?;
        }
        Ok(())
    }

    /// Destroys the interface and its ownership record. A missing device
    /// counts as destroyed.
    ///
    /// # Errors
    ///
    /// `Routing` if the engine refuses, `Io` if the record cannot be removed.
    pub async fn destroy(&self, handle: &mut InterfaceHandle) -> Result<()> {
        self.remove_device(&handle.name).await?;
        handle.state = InterfaceState::Absent;
        handle.up = false;
        handle.spec = None;
        handle.keys = None;
        info!(interface = %handle.name, "destroyed interface");
        Ok(())
    }

    /// Records that the interface is fully up for `spec` with the keys of
    /// `config`.
    ///
    /// A later process can [`adopt`](Self::adopt) the interface and compare
    /// spec and keys instead of rebuilding it.
    ///
    /// # Errors
    ///
    /// `Io` if the record cannot be written.
    pub fn record(
        &self,
        handle: &mut InterfaceHandle,
        spec: &PeerSpec,
        config: &TunnelConfig,
    ) -> Result<()> {
        handle.spec = Some(spec.clone());
        handle.keys = Some(AppliedKeys::of(config));
        self.write_record(handle)
    }

    /// Takes over an interface created by an earlier run of this owner.
    ///
    /// Returns `None` when no device exists; a leftover record for a vanished
    /// device is removed.
    ///
    /// # Errors
    ///
    /// `InterfaceExists` if the device exists and is not ours.
    pub async fn adopt(&self, name: &str) -> Result<Option<InterfaceHandle>> {
        validate_interface_name(name)?;
        let record = self.read_record(name);
        let owned = record.as_ref().is_some_and(|r| r.owner == self.owner_tag);

        if !self.exists(name).await? {
            if owned {
                debug!(interface = name, "removing record of vanished interface");
                self.remove_record(name)?;
            }
            return Ok(None);
        }

        match record {
            Some(record) if owned => {
                debug!(interface = name, state = ?record.state, "adopted interface");
                // A claim without a created state means the create was cut short.
                let state = match record.state {
                    InterfaceState::Absent => InterfaceState::Created,
                    state => state,
                };
                Ok(Some(InterfaceHandle {
                    name: name.to_string(),
                    state,
                    up: record.up,
                    spec: record.spec,
                    keys: record.keys,
                }))
            }
            _ => Err(TunnelError::InterfaceExists(name.to_string())),
        }
    }

    /// Reads the live state of an interface from the engine.
    ///
    /// # Errors
    ///
    /// `Routing` if the device does not exist or cannot be queried.
    pub async fn status(&self, name: &str) -> Result<InterfaceStatus> {
        self.engine
            .show(name)
            .await
            .map_err(|e| network_error(name, &e))
    }

    /// Whether a device named `name` exists.
    ///
    /// # Errors
    ///
    /// `Routing` if the engine cannot be queried.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        self.engine
            .exists(name)
            .await
            .map_err(|e| network_error(name, &e))
    }

    /// Whether the ownership record for `name` carries our owner tag.
    #[must_use]
    pub fn is_owned(&self, name: &str) -> bool {
        self.read_record(name)
            .is_some_and(|record| record.owner == self.owner_tag)
    }

    async fn remove_device(&self, name: &str) -> Result<()> {
        match self.engine.destroy(name).await {
            Ok(()) => {}
            Err(e) if e.kind == BackendErrorKind::NotFound => {
                debug!(interface = name, "interface already gone");
            }
            Err(e) => return Err(network_error(name, &e)),
        }
        self.remove_record(name)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{name}.{OWNER_EXTENSION}"))
    }

    fn read_record(&self, name: &str) -> Option<OwnerRecord> {
        let path = self.record_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read ownership record");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed ownership record");
                None
            }
        }
    }

    fn write_record(&self, handle: &InterfaceHandle) -> Result<()> {
        create_private_dir(&self.state_dir)?;
        let record = OwnerRecord {
            owner: self.owner_tag.clone(),
            state: handle.state,
            up: handle.up,
            spec: handle.spec.clone(),
            keys: handle.keys.clone(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| TunnelError::Io(std::io::Error::other(e)))?;
        fs::write(self.record_path(&handle.name), json)?;
        Ok(())
    }

    fn remove_record(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.record_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn network_error(interface: &str, err: &BackendError) -> TunnelError {
    TunnelError::Routing {
        interface: interface.to_string(),
        message: err.message.clone(),
    }
}

fn apply_error(interface: &str, message: impl Into<String>) -> TunnelError {
    TunnelError::Apply {
        interface: interface.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{FakeBackend, FakeOp};
    use crate::config::{render, RemotePeer};
    use crate::keys::{KeyPair, PublicKey};
    use crate::types::PeerIdentity;

    fn manager(fake: &FakeBackend, dir: &tempfile::TempDir, owner: &str) -> LifecycleManager {
        LifecycleManager::new(
            Arc::new(fake.clone()),
            Arc::new(fake.clone()),
            dir.path(),
            owner,
        )
    }

    fn config() -> TunnelConfig {
        let local = PeerIdentity::new("server", KeyPair::generate().expect("keygen"));
        let peer = RemotePeer::new(PublicKey::from_bytes_array([5; 32]))
            .with_allowed_ip("10.13.13.2/32".parse().expect("cidr"));
        render(local, "10.13.13.1/32".parse().expect("addr"), Some(51820), vec![peer])
            .expect("render")
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");

        let mut handle = lm.create("wg0").await.expect("create");
        assert_eq!(handle.state(), InterfaceState::Created);
        assert!(lm.is_owned("wg0"));

        let cfg = config();
        lm.apply(&mut handle, &cfg).await.expect("apply");
        assert!(handle.is_configured());
        assert!(fake.applied_conf("wg0").expect("conf").matches(&cfg));

        lm.set_up(&mut handle).await.expect("up");
        assert!(handle.is_up());

        lm.set_down(&mut handle).await.expect("down");
        lm.destroy(&mut handle).await.expect("destroy");
        assert_eq!(handle.state(), InterfaceState::Absent);
        assert!(!fake.has_device("wg0"));
        assert!(!lm.is_owned("wg0"));
    }

    #[tokio::test]
    async fn rendered_file_is_removed_after_apply() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");

        let mut handle = lm.create("wg0").await.expect("create");
        lm.apply(&mut handle, &config()).await.expect("apply");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "conf"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn foreign_interface_is_refused() {
        let fake = FakeBackend::new();
        fake.add_foreign_device("wg0");
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");

        let err = lm.create("wg0").await.expect_err("foreign");
        assert!(matches!(err, TunnelError::InterfaceExists(_)));
        assert!(matches!(lm.adopt("wg0").await, Err(TunnelError::InterfaceExists(_))));
        assert!(fake.has_device("wg0"));
        assert_eq!(fake.call_count(FakeOp::Destroy), 0);
    }

    #[tokio::test]
    async fn other_owner_tag_is_foreign() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        manager(&fake, &dir, "alice").create("wg0").await.expect("create");

        let err = manager(&fake, &dir, "bob").create("wg0").await.expect_err("foreign");
        assert!(matches!(err, TunnelError::InterfaceExists(_)));
    }

    #[tokio::test]
    async fn stale_interface_is_recreated() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");

        let _stale = lm.create("wg0").await.expect("create");

        let handle = lm.create("wg0").await.expect("recreate");
        assert_eq!(handle.state(), InterfaceState::Created);
        assert_eq!(fake.call_count(FakeOp::Destroy), 1);
        assert_eq!(fake.call_count(FakeOp::Create), 2);
    }

    #[tokio::test]
    async fn failed_apply_keeps_created_state() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");
        let mut handle = lm.create("wg0").await.expect("create");

        fake.fail_next(FakeOp::SetConf, BackendError::rejected("Invalid argument"));
        let err = lm.apply(&mut handle, &config()).await.expect_err("rejected");
        assert!(matches!(err, TunnelError::Apply { .. }));
        assert_eq!(handle.state(), InterfaceState::Created);
    }

    #[tokio::test]
    async fn set_up_requires_configuration() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");
        let mut handle = lm.create("wg0").await.expect("create");

        assert!(lm.set_up(&mut handle).await.is_err());
        assert_eq!(fake.call_count(FakeOp::LinkUp), 0);
    }

    #[tokio::test]
    async fn destroy_tolerates_missing_device() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");
        let mut handle = lm.create("wg0").await.expect("create");

        fake.destroy("wg0").await.expect("external delete");
        lm.set_down(&mut handle).await.expect("down tolerates");
        lm.destroy(&mut handle).await.expect("destroy tolerates");
        lm.destroy(&mut handle).await.expect("twice");
    }

    #[tokio::test]
    async fn adopt_restores_recorded_state() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");
        let spec = PeerSpec::new("wg0", "server", "10.13.13.1/32".parse().expect("addr"));

        let cfg = config();
        let mut handle = lm.create("wg0").await.expect("create");
        lm.apply(&mut handle, &cfg).await.expect("apply");
        lm.set_up(&mut handle).await.expect("up");
        lm.record(&mut handle, &spec, &cfg).expect("record");

        let adopted = lm.adopt("wg0").await.expect("adopt").expect("present");
        assert!(adopted.is_configured());
        assert!(adopted.is_up());
        assert_eq!(adopted.spec(), Some(&spec));
        assert_eq!(adopted.keys(), Some(&AppliedKeys::of(&cfg)));
    }

    #[tokio::test]
    async fn every_state_change_is_persisted() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");

        let mut handle = lm.create("wg0").await.expect("create");
        let recorded = |lm: &LifecycleManager| lm.read_record("wg0").expect("record");
        assert_eq!(recorded(&lm).state, InterfaceState::Created);

        lm.apply(&mut handle, &config()).await.expect("apply");
        assert_eq!(recorded(&lm).state, InterfaceState::Configured);
        assert!(!recorded(&lm).up);

        lm.set_up(&mut handle).await.expect("up");
        assert!(recorded(&lm).up);

        lm.set_down(&mut handle).await.expect("down");
        assert!(!recorded(&lm).up);
        assert_eq!(recorded(&lm).state, InterfaceState::Configured);
    }

    #[tokio::test]
    async fn failed_create_leaves_no_claim() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");

        fake.fail_next(FakeOp::Create, BackendError::rejected("Operation not supported"));
        let err = lm.create("wg0").await.expect_err("refused");
        assert!(matches!(err, TunnelError::Routing { .. }));
        assert!(!lm.is_owned("wg0"));
    }

    #[tokio::test]
    async fn interrupted_create_is_claimed_and_abandoned() {
        let fake = FakeBackend::new();
        fake.stall_after(FakeOp::Create, Duration::from_secs(2));
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");

        let cut_short =
            tokio::time::timeout(Duration::from_millis(100), lm.create("wg0")).await;
        assert!(cut_short.is_err());
        assert!(fake.has_device("wg0"));
        assert!(lm.is_owned("wg0"));

        let adopted = lm.adopt("wg0").await.expect("adopt").expect("present");
        assert_eq!(adopted.state(), InterfaceState::Created);

        lm.abandon("wg0").await.expect("abandon");
        assert!(!fake.has_device("wg0"));
        assert!(!lm.is_owned("wg0"));
    }

    #[tokio::test]
    async fn abandon_leaves_foreign_devices_alone() {
        let fake = FakeBackend::new();
        fake.add_foreign_device("wg0");
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");

        lm.abandon("wg0").await.expect("abandon");
        assert!(fake.has_device("wg0"));
        assert_eq!(fake.call_count(FakeOp::Destroy), 0);
    }

    #[tokio::test]
    async fn adopt_forgets_vanished_interface() {
        let fake = FakeBackend::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let lm = manager(&fake, &dir, "test");
        let _handle = lm.create("wg0").await.expect("create");
        fake.destroy("wg0").await.expect("external delete");

        assert!(lm.adopt("wg0").await.expect("adopt").is_none());
        assert!(!lm.is_owned("wg0"));
    }
}
