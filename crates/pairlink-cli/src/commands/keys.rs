//! Identity commands: `pubkey` and `genkey`.

use std::io::Write;

use pairlink_tunnel::{KeyStore, Provenance};

use crate::error::CliError;
use crate::output::{KeyInfo, OutputFormat};

/// Identity command executor.
pub struct KeysCommand {
    store: KeyStore,
}

impl KeysCommand {
    /// Create an identity command over a key store.
    #[must_use]
    pub fn new(store: KeyStore) -> Self {
        Self { store }
    }

    /// Print an identity's public key, creating the identity if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity cannot be loaded or created.
    pub fn pubkey<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        identity: &str,
    ) -> Result<(), CliError> {
        let (peer, provenance) = self.store.get_or_create(identity)?;
        let info = KeyInfo {
            identity: identity.to_string(),
            public_key: *peer.public_key(),
            created: provenance == Provenance::Generated,
        };
        format.write(writer, &info)
    }

    /// Create an identity; with `force`, replace an existing one.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be generated or stored.
    pub fn genkey<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        identity: &str,
        force: bool,
    ) -> Result<(), CliError> {
        let info = if force {
            let peer = self.store.regenerate(identity)?;
            KeyInfo {
                identity: identity.to_string(),
                public_key: *peer.public_key(),
                created: true,
            }
        } else {
            let (peer, provenance) = self.store.get_or_create(identity)?;
            if provenance == Provenance::Loaded {
                return Err(CliError::Config(format!(
                    "identity '{identity}' already exists; use --force to replace it"
                )));
            }
            KeyInfo {
                identity: identity.to_string(),
                public_key: *peer.public_key(),
                created: true,
            }
        };
        format.write(writer, &info)
    }
}
