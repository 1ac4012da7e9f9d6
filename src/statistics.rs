use crate::registry::{CertificateStatus, RegistryEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counts over the certificate registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Total number of recorded certificates, root included
    pub total: usize,
    /// Active and not yet expired
    pub active: usize,
    pub revoked: usize,
    /// Active but past notAfter
    pub expired: usize,
}

impl RegistryStats {
    /// Gather statistics for a set of registry entries
    ///
    /// # Example
    /// ```no_run
    /// use chrono::Utc;
    /// use pki_authority::registry::CertificateRegistry;
    /// use pki_authority::statistics::RegistryStats;
    /// use std::time::Duration;
    ///
    /// let registry = CertificateRegistry::new("data/ca/registry.json", Duration::from_secs(5));
    /// let stats = RegistryStats::gather(&registry.list_all()?, Utc::now());
    /// println!("Active certificates: {}", stats.active);
    /// # Ok::<(), pki_authority::error::CaError>(())
    /// ```
    pub fn gather<'a>(
        entries: impl IntoIterator<Item = &'a RegistryEntry>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total += 1;
            match entry.status {
                CertificateStatus::Revoked => stats.revoked += 1,
                CertificateStatus::Active if entry.is_expired_at(now) => stats.expired += 1,
                CertificateStatus::Active => stats.active += 1,
            }
        }
        stats
    }
}

/// Result of a full store integrity check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Registry entries whose stored certificate was checked
    pub certificates_checked: usize,
    /// Root private key is the key of the root certificate
    pub root_key_matches: bool,
    /// Revocation list present and signed by the root key
    pub revocation_list_valid: bool,
    /// One line per problem found
    pub problems: Vec<String>,
}

impl IntegrityReport {
    pub fn is_valid(&self) -> bool {
        self.root_key_matches && self.revocation_list_valid && self.problems.is_empty()
    }
}
