//! Certificate Registry
//!
//! Durable mapping serial number → [`RegistryEntry`], stored as one JSON
//! document. Entries live in an insertion-ordered vector with a serial index
//! beside it, so entries are looked up by key and never point at each other.
//!
//! Mutations take the registry file lock, re-read the current document, apply
//! the change and atomically replace the file. Reads never lock: they parse
//! whatever complete document is on disk and hand back a [`RegistrySnapshot`].

use crate::certificate::Certificate;
use crate::distinguished_name::DistinguishedName;
use crate::error::{CaError, Result};
use crate::file_lock::FileLock;
use crate::revocation::{RevocationLedger, RevocationReason};
use crate::serial_allocator::SerialNumber;
use crate::storage::{read_optional, write_atomic, PUBLIC_FILE_MODE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Active,
    Revoked,
}

/// Lifecycle record of one issued certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub serial_number: SerialNumber,
    pub subject: DistinguishedName,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CertificateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<RevocationReason>,
    pub fingerprint_sha256: String,
}

impl RegistryEntry {
    /// Active entry describing `cert`
    pub fn from_certificate(cert: &Certificate, issued_at: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            serial_number: cert.serial_number()?,
            subject: cert.subject()?,
            issued_at,
            expires_at: cert.not_after()?,
            status: CertificateStatus::Active,
            revoked_at: None,
            revocation_reason: None,
            fingerprint_sha256: cert.fingerprint_sha256()?,
        })
    }

    pub fn is_revoked(&self) -> bool {
        self.status == CertificateStatus::Revoked
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    entries: Vec<RegistryEntry>,
}

/// Internally consistent, point-in-time view of the registry
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    entries: Vec<RegistryEntry>,
    index: HashMap<SerialNumber, usize>,
}

impl RegistrySnapshot {
    fn from_entries(entries: Vec<RegistryEntry>, path: &Path) -> Result<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            if index.insert(entry.serial_number, position).is_some() {
                return Err(CaError::corruption(
                    path,
                    format!("serial {} appears more than once", entry.serial_number),
                ));
            }
            if entry.is_revoked()
                && (entry.revoked_at.is_none() || entry.revocation_reason.is_none())
            {
                return Err(CaError::corruption(
                    path,
                    format!(
                        "serial {} is revoked without a revocation time and reason",
                        entry.serial_number
                    ),
                ));
            }
        }
        Ok(Self { entries, index })
    }

    pub fn get(&self, serial: SerialNumber) -> Option<&RegistryEntry> {
        self.index.get(&serial).map(|&i| &self.entries[i])
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn revocation_ledger(&self) -> RevocationLedger {
        RevocationLedger::from_entries(&self.entries)
    }

    fn push(&mut self, entry: RegistryEntry) {
        self.index.insert(entry.serial_number, self.entries.len());
        self.entries.push(entry);
    }
}

/// File-backed certificate registry
#[derive(Debug, Clone)]
pub struct CertificateRegistry {
    path: PathBuf,
    lock_timeout: Duration,
}

impl CertificateRegistry {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a new entry
    ///
    /// # Errors
    /// * `DuplicateSerial` - the serial is already recorded
    /// * `LockTimeout` - the registry lock could not be taken in time
    /// * `Corruption` - the stored registry cannot be read
    pub fn record(&self, entry: RegistryEntry) -> Result<()> {
        let _lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        let mut snapshot = self.load()?;

        if snapshot.get(entry.serial_number).is_some() {
            return Err(CaError::DuplicateSerial(entry.serial_number));
        }
        let serial = entry.serial_number;
        snapshot.push(entry);
        self.store(&snapshot)?;

        tracing::debug!(%serial, "recorded registry entry");
        Ok(())
    }

    pub fn lookup(&self, serial: SerialNumber) -> Result<Option<RegistryEntry>> {
        Ok(self.load()?.get(serial).cloned())
    }

    /// Move an entry from Active to Revoked
    ///
    /// Not idempotent: a second call for the same serial fails.
    ///
    /// # Errors
    /// * `NotFound` - no entry with that serial
    /// * `AlreadyRevoked` - the entry is already revoked
    pub fn mark_revoked(
        &self,
        serial: SerialNumber,
        reason: RevocationReason,
        at: DateTime<Utc>,
    ) -> Result<RegistryEntry> {
        let _lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        let mut snapshot = self.load()?;

        let position = *snapshot
            .index
            .get(&serial)
            .ok_or(CaError::NotFound(serial))?;
        let entry = &mut snapshot.entries[position];
        if entry.status == CertificateStatus::Revoked {
            return Err(CaError::AlreadyRevoked(serial));
        }
        entry.status = CertificateStatus::Revoked;
        entry.revoked_at = Some(at);
        entry.revocation_reason = Some(reason);
        let updated = entry.clone();

        self.store(&snapshot)?;
        Ok(updated)
    }

    /// All entries ordered by issuance time, ties kept in insertion order
    pub fn list_all(&self) -> Result<Vec<RegistryEntry>> {
        let mut entries = self.load()?.entries;
        entries.sort_by_key(|entry| entry.issued_at);
        Ok(entries)
    }

    pub fn snapshot(&self) -> Result<RegistrySnapshot> {
        self.load()
    }

    fn load(&self) -> Result<RegistrySnapshot> {
        let data = match read_optional(&self.path)? {
            None => return Ok(RegistrySnapshot::default()),
            Some(data) => data,
        };
        let file: RegistryFile = serde_json::from_slice(&data).map_err(|e| {
            tracing::error!(path = %self.path.display(), error = %e, "registry is unreadable");
            CaError::corruption(&self.path, format!("unreadable registry: {}", e))
        })?;
        if file.version != REGISTRY_VERSION {
            return Err(CaError::corruption(
                &self.path,
                format!("unsupported registry version {}", file.version),
            ));
        }
        RegistrySnapshot::from_entries(file.entries, &self.path)
    }

    fn store(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            entries: snapshot.entries.clone(),
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|e| CaError::corruption(&self.path, format!("cannot encode registry: {}", e)))?;
        write_atomic(&self.path, &data, PUBLIC_FILE_MODE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> CertificateRegistry {
        CertificateRegistry::new(dir.path().join("registry.json"), Duration::from_secs(5))
    }

    fn entry(serial: u128, issued_at: DateTime<Utc>) -> RegistryEntry {
        RegistryEntry {
            serial_number: SerialNumber::new(serial),
            subject: DistinguishedName::common_name(format!("host{}", serial)),
            issued_at,
            expires_at: issued_at + ChronoDuration::days(30),
            status: CertificateStatus::Active,
            revoked_at: None,
            revocation_reason: None,
            fingerprint_sha256: format!("{:064x}", serial),
        }
    }

    #[test]
    fn test_record_and_lookup() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let e = entry(1, Utc::now());
        reg.record(e.clone()).unwrap();

        assert_eq!(reg.lookup(SerialNumber::new(1)).unwrap(), Some(e));
        assert_eq!(reg.lookup(SerialNumber::new(2)).unwrap(), None);
    }

    #[test]
    fn test_duplicate_serial_rejected() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.record(entry(7, Utc::now())).unwrap();
        assert!(matches!(
            reg.record(entry(7, Utc::now())),
            Err(CaError::DuplicateSerial(s)) if s == SerialNumber::new(7)
        ));
        assert_eq!(reg.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_mark_revoked_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.record(entry(3, Utc::now())).unwrap();

        let at = Utc::now();
        let revoked = reg
            .mark_revoked(SerialNumber::new(3), RevocationReason::KeyCompromise, at)
            .unwrap();
        assert_eq!(revoked.status, CertificateStatus::Revoked);
        assert_eq!(revoked.revoked_at, Some(at));

        assert!(matches!(
            reg.mark_revoked(SerialNumber::new(3), RevocationReason::Superseded, Utc::now()),
            Err(CaError::AlreadyRevoked(_))
        ));
        assert!(matches!(
            reg.mark_revoked(SerialNumber::new(4), RevocationReason::Superseded, Utc::now()),
            Err(CaError::NotFound(_))
        ));

        let stored = reg.lookup(SerialNumber::new(3)).unwrap().unwrap();
        assert_eq!(stored.revocation_reason, Some(RevocationReason::KeyCompromise));
    }

    #[test]
    fn test_list_all_orders_by_issuance_then_insertion() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let base = Utc::now();
        reg.record(entry(1, base + ChronoDuration::seconds(10))).unwrap();
        reg.record(entry(2, base)).unwrap();
        reg.record(entry(3, base)).unwrap();

        let order: Vec<_> = reg
            .list_all()
            .unwrap()
            .iter()
            .map(|e| e.serial_number.value())
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_concurrent_revocation_single_winner() {
        let dir = TempDir::new().unwrap();
        let reg = Arc::new(registry(&dir));
        reg.record(entry(42, Utc::now())).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    reg.mark_revoked(
                        SerialNumber::new(42),
                        RevocationReason::Superseded,
                        Utc::now(),
                    )
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let losers = results
            .iter()
            .filter(|r| matches!(r, Err(CaError::AlreadyRevoked(_))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(losers, 7);
    }

    #[test]
    fn test_corrupt_registry_is_surfaced_not_repaired() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        std::fs::write(reg.path(), b"{\"version\":1,\"entries\":[").unwrap();

        assert!(matches!(
            reg.lookup(SerialNumber::new(1)),
            Err(CaError::Corruption { .. })
        ));
        assert!(matches!(
            reg.record(entry(1, Utc::now())),
            Err(CaError::Corruption { .. })
        ));
        // Left untouched for recovery tooling
        assert_eq!(
            std::fs::read(reg.path()).unwrap(),
            b"{\"version\":1,\"entries\":["
        );
    }

    #[test]
    fn test_duplicate_serials_on_disk_are_corruption() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let e = entry(5, Utc::now());
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            entries: vec![e.clone(), e],
        };
        std::fs::write(reg.path(), serde_json::to_vec(&file).unwrap()).unwrap();
        assert!(matches!(reg.snapshot(), Err(CaError::Corruption { .. })));
    }

    #[test]
    fn test_revoked_entry_missing_details_is_corruption() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let damaged = RegistryEntry {
            status: CertificateStatus::Revoked,
            ..entry(9, Utc::now())
        };
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            entries: vec![damaged],
        };
        std::fs::write(reg.path(), serde_json::to_vec(&file).unwrap()).unwrap();

        assert!(matches!(reg.snapshot(), Err(CaError::Corruption { .. })));
        assert!(matches!(
            reg.lookup(SerialNumber::new(9)),
            Err(CaError::Corruption { .. })
        ));
    }

    #[test]
    fn test_snapshot_derives_ledger() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.record(entry(1, Utc::now())).unwrap();
        reg.record(entry(2, Utc::now())).unwrap();
        reg.mark_revoked(SerialNumber::new(2), RevocationReason::Superseded, Utc::now())
            .unwrap();

        let ledger = reg.snapshot().unwrap().revocation_ledger();
        assert!(ledger.contains(SerialNumber::new(2)));
        assert!(!ledger.contains(SerialNumber::new(1)));
    }
}
