//! Key types, signature hashes and host key hashing.
//!
//! The controller never parses private key material. A configured key is a
//! [`Signer`]; agent keys arrive already parsed, see
//! [`AgentKey`](crate::ssh::agent::AgentKey).

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use wisp_platform::{WispError, WispResult};

/// Public key algorithms the controller can authenticate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// ssh-rsa
    Rsa,
    /// ssh-dss
    Dss,
    /// ecdsa-sha2-nistp256
    EcdsaP256,
    /// ecdsa-sha2-nistp384
    EcdsaP384,
    /// ecdsa-sha2-nistp521
    EcdsaP521,
}

impl KeyType {
    /// Parses an algorithm name. Returns `None` for unsupported types.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-rsa" => Some(KeyType::Rsa),
            "ssh-dss" => Some(KeyType::Dss),
            "ecdsa-sha2-nistp256" => Some(KeyType::EcdsaP256),
            "ecdsa-sha2-nistp384" => Some(KeyType::EcdsaP384),
            "ecdsa-sha2-nistp521" => Some(KeyType::EcdsaP521),
            _ => None,
        }
    }

    /// Algorithm name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            KeyType::Rsa => "ssh-rsa",
            KeyType::Dss => "ssh-dss",
            KeyType::EcdsaP256 => "ecdsa-sha2-nistp256",
            KeyType::EcdsaP384 => "ecdsa-sha2-nistp384",
            KeyType::EcdsaP521 => "ecdsa-sha2-nistp521",
        }
    }

    /// Hash the signature is computed over.
    pub fn signature_hash(&self) -> HashAlgorithm {
        match self {
            KeyType::Rsa | KeyType::Dss => HashAlgorithm::Sha1,
            KeyType::EcdsaP256 => HashAlgorithm::Sha256,
            KeyType::EcdsaP384 => HashAlgorithm::Sha384,
            KeyType::EcdsaP521 => HashAlgorithm::Sha512,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Digest used when signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

/// A private key able to produce SSH signatures.
///
/// Implementations return the raw signature; the codec wraps it in the
/// `string algorithm, string signature` envelope.
pub trait Signer: Send + Sync {
    /// Algorithm name, e.g. `ssh-rsa`.
    fn key_type(&self) -> &str;

    /// Public key blob in SSH wire format.
    fn public_key(&self) -> &[u8];

    /// Signs `data` using `hash`.
    fn sign(&self, data: &[u8], hash: HashAlgorithm) -> WispResult<Vec<u8>>;
}

/// Digest applied to the server host key before it reaches the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostHash {
    /// Pass the raw key through as hex.
    #[default]
    None,
    /// SHA-1 hex digest
    Sha1,
    /// SHA-256 hex digest
    Sha256,
    /// SHA-512 hex digest
    Sha512,
}

impl HostHash {
    /// Parses a configured hash name.
    pub fn from_name(name: &str) -> WispResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HostHash::Sha1),
            "sha256" => Ok(HostHash::Sha256),
            "sha512" => Ok(HostHash::Sha512),
            _ => Err(WispError::Config(format!(
                "Invalid host hash algorithm: {}",
                name
            ))),
        }
    }

    /// Hex string handed to the host verifier.
    pub fn digest_hex(&self, host_key: &[u8]) -> String {
        match self {
            HostHash::None => hex::encode(host_key),
            HostHash::Sha1 => hex::encode(Sha1::digest(host_key)),
            HostHash::Sha256 => hex::encode(Sha256::digest(host_key)),
            HostHash::Sha512 => hex::encode(Sha512::digest(host_key)),
        }
    }
}

/// OpenSSH-style fingerprint (`SHA256:<base64>`), used in log lines.
pub fn format_fingerprint(host_key: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(host_key)))
}
