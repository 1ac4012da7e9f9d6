//! Error taxonomy for pki-authority
//!
//! Every construction, issuance and revocation failure surfaces as one of these
//! variants. Validation failures are not errors; they are reported as data in a
//! [`Verdict`](crate::validation::Verdict).
//!
//! No variant ever carries key material or passphrase content.

use crate::serial_allocator::SerialNumber;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for certificate authority operations
#[derive(Error, Debug)]
pub enum CaError {
    #[error("Weak key parameters: {0}")]
    WeakParameter(String),

    #[error("Malformed key material: {0}")]
    KeyFormat(String),

    #[error("Private key authentication failed: passphrase missing or incorrect")]
    Authentication,

    #[error("Malformed certificate signing request: {0}")]
    RequestFormat(String),

    #[error("Certificate signing request failed proof of possession")]
    ProofOfPossession,

    #[error("Serial number {0} is already recorded in the registry")]
    DuplicateSerial(SerialNumber),

    #[error("Serial number {0} not found in the registry")]
    NotFound(SerialNumber),

    #[error("Certificate {0} is already revoked")]
    AlreadyRevoked(SerialNumber),

    #[error("Serial number allocation failed: {0}")]
    Allocation(String),

    #[error("Certificate authority is not initialized")]
    NotInitialized,

    #[error("Certificate authority is already initialized")]
    AlreadyInitialized,

    #[error("Invalid validity period: {0}")]
    InvalidValidity(String),

    #[error("Reset not confirmed: fingerprint does not match the root certificate")]
    ResetNotConfirmed,

    #[error("Timed out after {timeout:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Store corruption in {}: {reason}", path.display())]
    Corruption { path: PathBuf, reason: String },

    #[error("Invalid distinguished name: {0}")]
    Name(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

impl CaError {
    pub(crate) fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CaError::Corruption {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CaError>;
