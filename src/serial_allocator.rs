//! Serial Number Allocation
//!
//! Serials are 128-bit values built from two halves:
//!
//! ```text
//! [ 63 random bits | 64-bit persisted counter ]
//!   ^ top bit always clear so the DER INTEGER stays positive
//! ```
//!
//! The counter makes every serial unique for the lifetime of the store, the
//! random half makes the sequence unpredictable. The counter is incremented and
//! durably persisted under an exclusive file lock before the serial is handed
//! out, so a serial that reaches a caller is always on disk.

use crate::error::{CaError, Result};
use crate::file_lock::FileLock;
use crate::storage::{read_optional, write_atomic, PUBLIC_FILE_MODE};
use openssl::asn1::{Asn1Integer, Asn1IntegerRef};
use openssl::bn::BigNum;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const RANDOM_HIGH_MASK: u64 = 0x7fff_ffff_ffff_ffff;

/// Certificate serial number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(u128);

impl SerialNumber {
    pub fn new(value: u128) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u128 {
        self.0
    }

    fn compose(random_high: u64, counter: u64) -> Self {
        Self((u128::from(random_high & RANDOM_HIGH_MASK) << 64) | u128::from(counter))
    }

    /// Low 64 bits, i.e. the allocator counter value
    pub fn counter(&self) -> u64 {
        self.0 as u64
    }

    pub fn to_asn1_integer(&self) -> Result<Asn1Integer> {
        let bn = BigNum::from_slice(&self.0.to_be_bytes())?;
        Ok(bn.to_asn1_integer()?)
    }

    pub fn from_asn1_integer(integer: &Asn1IntegerRef) -> Result<Self> {
        let bn = integer.to_bn()?;
        if bn.is_negative() {
            return Err(CaError::Certificate("negative serial number".to_string()));
        }
        let bytes = bn.to_vec();
        if bytes.len() > 16 {
            return Err(CaError::Certificate(format!(
                "serial number is {} bytes wide, at most 16 supported",
                bytes.len()
            )));
        }
        let mut buf = [0u8; 16];
        buf[16 - bytes.len()..].copy_from_slice(&bytes);
        Ok(Self(u128::from_be_bytes(buf)))
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for SerialNumber {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim().trim_start_matches("0x");
        u128::from_str_radix(digits, 16)
            .map(SerialNumber)
            .map_err(|_| CaError::Certificate(format!("'{}' is not a hex serial number", s)))
    }
}

impl Serialize for SerialNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SerialNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AllocatorState {
    counter: u64,
    last_issued: Option<SerialNumber>,
}

/// Collision-free serial number source backed by a state file
#[derive(Debug, Clone)]
pub struct SerialAllocator {
    path: PathBuf,
    lock_timeout: Duration,
}

impl SerialAllocator {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate the next serial number
    ///
    /// # Errors
    /// * `LockTimeout` - another allocation held the lock for the whole wait
    /// * `Corruption` - the state file exists but cannot be parsed
    /// * `Allocation` - the new state could not be durably recorded
    pub fn next_serial(&self) -> Result<SerialNumber> {
        let _lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        let mut state = self.load_state()?;

        state.counter = state
            .counter
            .checked_add(1)
            .ok_or_else(|| CaError::Allocation("serial counter exhausted".to_string()))?;
        let serial = SerialNumber::compose(random_high()?, state.counter);
        state.last_issued = Some(serial);

        let data = serde_json::to_vec_pretty(&state)
            .map_err(|e| CaError::Allocation(format!("failed to encode state: {}", e)))?;
        write_atomic(&self.path, &data, PUBLIC_FILE_MODE)
            .map_err(|e| CaError::Allocation(format!("failed to persist state: {}", e)))?;

        tracing::debug!(%serial, counter = state.counter, "allocated serial number");
        Ok(serial)
    }

    /// Number of serials handed out so far
    pub fn issued_count(&self) -> Result<u64> {
        Ok(self.load_state()?.counter)
    }

    fn load_state(&self) -> Result<AllocatorState> {
        match read_optional(&self.path)? {
            None => Ok(AllocatorState::default()),
            Some(data) => serde_json::from_slice(&data)
                .map_err(|e| CaError::corruption(&self.path, format!("unreadable state: {}", e))),
        }
    }
}

fn random_high() -> Result<u64> {
    let mut bytes = [0u8; 8];
    openssl::rand::rand_bytes(&mut bytes)
        .map_err(|e| CaError::Allocation(format!("random source failed: {}", e)))?;
    Ok(u64::from_be_bytes(bytes) & RANDOM_HIGH_MASK)
}
