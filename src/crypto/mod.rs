//! Pluggable encryption for persisted records.
//!
//! Every record is serialized and then passed through a [`Codec`] before it
//! reaches a store, and decrypted before it is deserialized on the way back.
//! Exactly one codec is installed per broker through a [`CodecCell`] owned by
//! the composition root.

pub mod aes256;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use aes256::Aes256Codec;

/// Errors raised while installing or applying a codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("codec has not been installed")]
    NotInstalled,

    #[error("codec is already installed")]
    AlreadyInstalled,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("unknown encryption scheme: {0}")]
    UnknownScheme(String),
}

/// Encrypts and decrypts opaque byte payloads
pub trait Codec: Send + Sync + fmt::Debug {
    /// Encrypt a plaintext payload
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt a payload previously produced by [`Codec::encrypt`]
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Codec that passes bytes through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCodec;

impl NoopCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for NoopCodec {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }
}

/// Supported encryption schemes, as named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionScheme {
    #[serde(rename = "AES256")]
    Aes256,
    #[default]
    #[serde(rename = "NOOP")]
    Noop,
}

impl FromStr for EncryptionScheme {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AES256" => Ok(Self::Aes256),
            "NOOP" | "" => Ok(Self::Noop),
            other => Err(CryptoError::UnknownScheme(other.to_string())),
        }
    }
}

impl fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aes256 => write!(f, "AES256"),
            Self::Noop => write!(f, "NOOP"),
        }
    }
}

/// Build the codec selected by `scheme`.
///
/// `aes256_key` is only consulted for [`EncryptionScheme::Aes256`].
pub fn codec_for_scheme(
    scheme: EncryptionScheme,
    aes256_key: &str,
) -> Result<Arc<dyn Codec>, CryptoError> {
    match scheme {
        EncryptionScheme::Aes256 => Ok(Arc::new(Aes256Codec::new(aes256_key)?)),
        EncryptionScheme::Noop => Ok(Arc::new(NoopCodec::new())),
    }
}

/// Write-once holder for the broker's codec.
///
/// Installing twice, or reading before anything was installed, fails fast
/// instead of silently falling back to another codec.
#[derive(Debug, Default)]
pub struct CodecCell {
    inner: OnceLock<Arc<dyn Codec>>,
}

impl CodecCell {
    pub fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Install the codec. Only the first call succeeds.
    pub fn install(&self, codec: Arc<dyn Codec>) -> Result<(), CryptoError> {
        self.inner
            .set(codec)
            .map_err(|_| CryptoError::AlreadyInstalled)
    }

    /// Get the installed codec
    pub fn get(&self) -> Result<Arc<dyn Codec>, CryptoError> {
        self.inner.get().cloned().ok_or(CryptoError::NotInstalled)
    }

    pub fn is_installed(&self) -> bool {
        self.inner.get().is_some()
    }
}
