//! Persistent per-identity key storage.
//!
//! Each identity lives in `<dir>/<name>.key` as one line of base64 private key,
//! readable and writable by the owner only. Keys are stable across restarts so
//! peers never need to re-exchange public keys.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::restrict_to_owner;
use crate::error::{Result, TunnelError};
use crate::keys::{KeyPair, PrivateKey, PublicKey};
use crate::types::PeerIdentity;

const KEY_EXTENSION: &str = "key";

/// Whether `GetOrCreate` found the identity or made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// The identity file already existed.
    Loaded,
    /// A new keypair was generated and persisted by this call.
    Generated,
}

/// Directory-backed key store.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Creates a key store rooted at `dir`. The directory is created lazily.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the key file for `name`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` if `name` is not a valid identity name.
    pub fn key_path(&self, name: &str) -> Result<PathBuf> {
        validate_identity_name(name)?;
        Ok(self.dir.join(format!("{name}.{KEY_EXTENSION}")))
    }

    /// Loads the identity `name`, generating and persisting it if absent.
    ///
    /// # Errors
    ///
    /// `KeyGeneration` if the random source fails, `KeyStorage` if the file
    /// cannot be read, written, or secured.
    pub fn get_or_create(&self, name: &str) -> Result<(PeerIdentity, Provenance)> {
        let path = self.key_path(name)?;
        if let Some(identity) = self.load_from(name, &path)? {
            return Ok((identity, Provenance::Loaded));
        }

        let keypair = KeyPair::generate()?;
        match self.persist(name, &path, keypair.private_key(), false) {
            Ok(()) => {
                info!(
                    identity = name,
                    public_key = %keypair.public_key(),
                    "generated new identity"
                );
                Ok((PeerIdentity::new(name, keypair), Provenance::Generated))
            }
            // Another creator won the race; its key is the one to use.
            Err(PersistError::Exists) => {
                let identity = self.load_from(name, &path)?.ok_or_else(|| {
                    storage_error(name, "identity vanished while being created")
                })?;
                Ok((identity, Provenance::Loaded))
            }
            Err(PersistError::Failed(e)) => Err(e),
        }
    }

    /// Loads the identity `name` if it exists.
    ///
    /// # Errors
    ///
    /// `KeyStorage` if the file exists but cannot be read or secured.
    pub fn load(&self, name: &str) -> Result<Option<PeerIdentity>> {
        let path = self.key_path(name)?;
        self.load_from(name, &path)
    }

    /// Reads the public key of an existing identity without creating it.
    ///
    /// # Errors
    ///
    /// `ConfigValidation` if the identity does not exist, `KeyStorage` if it
    /// cannot be read.
    pub fn load_public(&self, name: &str) -> Result<PublicKey> {
        self.load(name)?
            .map(|identity| *identity.public_key())
            .ok_or_else(|| {
                TunnelError::ConfigValidation(format!(
                    "identity '{name}' not found in {}",
                    self.dir.display()
                ))
            })
    }

    /// Replaces the identity `name` with a freshly generated keypair.
    ///
    /// # Errors
    ///
    /// `KeyGeneration` or `KeyStorage` as for [`KeyStore::get_or_create`].
    pub fn regenerate(&self, name: &str) -> Result<PeerIdentity> {
        let path = self.key_path(name)?;
        let keypair = KeyPair::generate()?;
        match self.persist(name, &path, keypair.private_key(), true) {
            Ok(()) => {}
            Err(PersistError::Exists) => {
                return Err(storage_error(name, "unexpected conflict while replacing key"));
            }
            Err(PersistError::Failed(e)) => return Err(e),
        }
        warn!(
            identity = name,
            public_key = %keypair.public_key(),
            "regenerated identity; peers must be given the new public key"
        );
        Ok(PeerIdentity::new(name, keypair))
    }

    /// Deletes the identity `name`. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// `KeyStorage` if the file exists and cannot be removed.
    pub fn discard(&self, name: &str) -> Result<()> {
        let path = self.key_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(identity = name, "discarded identity");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(name, format!("remove {}: {e}", path.display()))),
        }
    }

    fn load_from(&self, name: &str, path: &Path) -> Result<Option<PeerIdentity>> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(name, format!("stat {}: {e}", path.display()))),
        };
        if !metadata.is_file() {
            return Err(storage_error(name, format!("{} is not a regular file", path.display())));
        }
        ensure_owner_only(name, path, &metadata)?;

        let content = fs::read_to_string(path)
            .map_err(|e| storage_error(name, format!("read {}: {e}", path.display())))?;
        let private = PrivateKey::from_base64(&content)
            .map_err(|e| storage_error(name, format!("corrupt key file {}: {e}", path.display())))?;
        Ok(Some(PeerIdentity::new(name, KeyPair::from_private_key(private))))
    }

    fn persist(
        &self,
        name: &str,
        path: &Path,
        key: &PrivateKey,
        overwrite: bool,
    ) -> std::result::Result<(), PersistError> {
        let fail = |msg: String| PersistError::Failed(storage_error(name, msg));

        create_private_dir(&self.dir)
            .map_err(|e| fail(format!("create {}: {e}", self.dir.display())))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| fail(format!("create temp file in {}: {e}", self.dir.display())))?;
        restrict_to_owner(tmp.path()).map_err(|e| fail(format!("chmod temp file: {e}")))?;
        writeln!(tmp, "{}", key.to_base64())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| fail(format!("write temp file: {e}")))?;

        if overwrite {
            tmp.persist(path)
                .map_err(|e| fail(format!("rename to {}: {}", path.display(), e.error)))?;
        } else {
            match tmp.persist_noclobber(path) {
                Ok(_) => {}
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                    return Err(PersistError::Exists);
                }
                Err(e) => {
                    return Err(fail(format!("link to {}: {}", path.display(), e.error)));
                }
            }
        }
        Ok(())
    }
}

enum PersistError {
    Exists,
    Failed(TunnelError),
}

fn storage_error(identity: &str, message: impl Into<String>) -> TunnelError {
    TunnelError::KeyStorage {
        identity: identity.to_string(),
        message: message.into(),
    }
}

#[cfg(unix)]
fn ensure_owner_only(name: &str, path: &Path, metadata: &fs::Metadata) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 == 0 {
        return Ok(());
    }
    warn!(
        identity = name,
        path = %path.display(),
        mode = %format!("{mode:o}"),
        "key file is accessible by others; restricting to 0600"
    );
    restrict_to_owner(path).map_err(|e| {
        storage_error(
            name,
            format!("{} has unsafe mode {mode:o} and cannot be fixed: {e}", path.display()),
        )
    })
}

#[cfg(not(unix))]
fn ensure_owner_only(_name: &str, _path: &Path, _metadata: &fs::Metadata) -> Result<()> {
    Ok(())
}

pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

/// Checks that `name` can be used as an identity file name.
///
/// # Errors
///
/// Returns `ConfigValidation` for empty names, `.`/`..`, or characters outside
/// `[A-Za-z0-9_.-]`.
pub fn validate_identity_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(TunnelError::ConfigValidation(format!(
            "invalid identity name '{name}': use letters, digits, '_', '-' or '.', not starting with '.'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KeyStore::new(dir.path().join("keys"));
        (dir, store)
    }

    #[test]
    fn get_or_create_is_stable() {
        let (_dir, store) = store();
        let (first, p1) = store.get_or_create("server").expect("create");
        let (second, p2) = store.get_or_create("server").expect("load");

        assert_eq!(p1, Provenance::Generated);
        assert_eq!(p2, Provenance::Loaded);
        assert_eq!(first.private_key().as_bytes(), second.private_key().as_bytes());
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn key_file_format_and_mode() {
        let (_dir, store) = store();
        let (identity, _) = store.get_or_create("server").expect("create");
        let path = store.key_path("server").expect("path");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content, format!("{}\n", identity.private_key().to_base64()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let dir_mode = fs::metadata(store.dir()).expect("metadata").permissions().mode();
            assert_eq!(dir_mode & 0o777, 0o700);
        }
    }

    #[cfg(unix)]
    #[test]
    fn loose_permissions_are_tightened() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = store();
        store.get_or_create("client").expect("create");
        let path = store.key_path("client").expect("path");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

        store.get_or_create("client").expect("load");
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_key_is_storage_error() {
        let (_dir, store) = store();
        create_private_dir(store.dir()).expect("mkdir");
        let path = store.key_path("server").expect("path");
        fs::write(&path, "not a key\n").expect("write");
        restrict_to_owner(&path).expect("chmod");

        assert!(matches!(
            store.get_or_create("server"),
            Err(TunnelError::KeyStorage { .. })
        ));
    }

    #[test]
    fn regenerate_replaces_key() {
        let (_dir, store) = store();
        let (old, _) = store.get_or_create("server").expect("create");
        let new = store.regenerate("server").expect("regenerate");
        assert_ne!(old.public_key(), new.public_key());

        let (loaded, provenance) = store.get_or_create("server").expect("load");
        assert_eq!(provenance, Provenance::Loaded);
        assert_eq!(loaded.public_key(), new.public_key());
    }

    #[test]
    fn load_public_does_not_create() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load_public("client"),
            Err(TunnelError::ConfigValidation(_))
        ));
        assert!(!store.key_path("client").expect("path").exists());

        let (client, _) = store.get_or_create("client").expect("create");
        assert_eq!(store.load_public("client").expect("load"), *client.public_key());
    }

    #[test]
    fn discard_is_idempotent() {
        let (_dir, store) = store();
        store.get_or_create("server").expect("create");
        store.discard("server").expect("discard");
        store.discard("server").expect("discard again");
        assert!(store.load("server").expect("load").is_none());
    }

    #[test]
    fn concurrent_creators_converge() {
        let (_dir, store) = store();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.get_or_create("shared").map(|(id, _)| *id.public_key()))
            })
            .collect();
        let keys: Vec<PublicKey> = handles
            .into_iter()
            .map(|h| h.join().expect("thread").expect("identity"))
            .collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }

    #[test_case("" ; "empty")]
    #[test_case(".." ; "parent")]
    #[test_case(".hidden" ; "dotfile")]
    #[test_case("a/b" ; "separator")]
    #[test_case("white space" ; "space")]
    fn rejects_bad_identity_names(name: &str) {
        assert!(matches!(
            validate_identity_name(name),
            Err(TunnelError::ConfigValidation(_))
        ));
    }

    #[test]
    fn accepts_ordinary_names() {
        for name in ["server", "client-1", "peer_a.b"] {
            validate_identity_name(name).expect("valid");
        }
    }
}
