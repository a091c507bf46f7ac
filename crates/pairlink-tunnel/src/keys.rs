//! X25519 key material.
//!
//! Keys travel as standard base64 of their 32 raw bytes, the form `wg` reads
//! and prints. Private keys are held in an [`x25519_dalek::StaticSecret`],
//! which wipes its bytes on drop.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};

use crate::error::{Result, TunnelError};

/// Length of every key, in bytes.
pub const KEY_SIZE: usize = 32;

/// Number of base64 characters shown by [`PublicKey::short`].
const SHORT_LEN: usize = 8;

fn decode(text: &str) -> Result<[u8; KEY_SIZE]> {
    let raw = STANDARD.decode(text.trim())?;
    <[u8; KEY_SIZE]>::try_from(raw.as_slice())
        .map_err(|_| TunnelError::InvalidKeyLength(raw.len()))
}

/// Sets the bits X25519 ignores, matching what `wg genkey` writes.
fn clamp(mut bytes: [u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    bytes[0] &= 0b1111_1000;
    bytes[31] &= 0b0111_1111;
    bytes[31] |= 0b0100_0000;
    bytes
}

/// A peer's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Wraps 32 raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Standard base64, 44 characters.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Parses standard base64. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// `InvalidBase64` or `InvalidKeyLength`.
    pub fn from_base64(text: &str) -> Result<Self> {
        decode(text).map(Self)
    }

    /// First characters of the base64 form, for logs and tables.
    #[must_use]
    pub fn short(&self) -> String {
        self.to_base64().chars().take(SHORT_LEN).collect()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.short()).finish()
    }
}

impl FromStr for PublicKey {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s)
    }
}

impl TryFrom<String> for PublicKey {
    type Error = TunnelError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_base64(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_base64()
    }
}

/// A local private key. Not serializable; `Debug` never shows it.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Draws a fresh clamped key from the operating system RNG.
    ///
    /// # Errors
    ///
    /// `KeyGeneration` if the RNG fails.
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| TunnelError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_bytes_array(clamp(seed)))
    }

    /// Wraps 32 raw bytes as they are, without clamping.
    #[must_use]
    pub fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        self.0.as_bytes()
    }

    /// The matching public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(DalekPublic::from(&self.0).to_bytes())
    }

    /// Standard base64, the format of a key file.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.as_bytes())
    }

    /// Parses standard base64. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// `InvalidBase64` or `InvalidKeyLength`.
    pub fn from_base64(text: &str) -> Result<Self> {
        decode(text).map(Self::from_bytes_array)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes().ct_eq(other.as_bytes()).into()
    }
}

impl Eq for PrivateKey {}

/// A private key with its derived public key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a new pair.
    ///
    /// # Errors
    ///
    /// `KeyGeneration` if the RNG fails.
    pub fn generate() -> Result<Self> {
        Ok(Self::from_private_key(PrivateKey::generate()?))
    }

    /// Derives the public half of `private`.
    #[must_use]
    pub fn from_private_key(private: PrivateKey) -> Self {
        Self {
            public: private.public_key(),
            private,
        }
    }

    /// Private half.
    #[must_use]
    pub const fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Public half.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
