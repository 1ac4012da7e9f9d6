//! Revocation reasons, the derived revocation ledger, and the signed
//! revocation list artifact.
//!
//! The ledger is never edited directly. It is rebuilt from registry entries
//! whenever it is needed, so it always agrees with the registry it came from.

use crate::distinguished_name::DistinguishedName;
use crate::error::{CaError, Result};
use crate::key_material::KeyPair;
use crate::registry::{CertificateStatus, RegistryEntry};
use crate::serial_allocator::SerialNumber;
use crate::storage::{read_optional, write_atomic, PUBLIC_FILE_MODE};
use chrono::{DateTime, Utc};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKeyRef, Public};
use openssl::sign::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// RFC 5280 CRLReason codes
///
/// certificateHold and removeFromCRL are left out: revocation here is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    #[serde(rename = "cACompromise")]
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    PrivilegeWithdrawn,
    #[serde(rename = "aACompromise")]
    AaCompromise,
}

impl RevocationReason {
    /// Numeric CRLReason code
    pub fn code(&self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CaCompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
            RevocationReason::PrivilegeWithdrawn => 9,
            RevocationReason::AaCompromise => 10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "keyCompromise",
            RevocationReason::CaCompromise => "cACompromise",
            RevocationReason::AffiliationChanged => "affiliationChanged",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessationOfOperation",
            RevocationReason::PrivilegeWithdrawn => "privilegeWithdrawn",
            RevocationReason::AaCompromise => "aACompromise",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unspecified" => Ok(RevocationReason::Unspecified),
            "keyCompromise" => Ok(RevocationReason::KeyCompromise),
            "cACompromise" => Ok(RevocationReason::CaCompromise),
            "affiliationChanged" => Ok(RevocationReason::AffiliationChanged),
            "superseded" => Ok(RevocationReason::Superseded),
            "cessationOfOperation" => Ok(RevocationReason::CessationOfOperation),
            "privilegeWithdrawn" => Ok(RevocationReason::PrivilegeWithdrawn),
            "aACompromise" => Ok(RevocationReason::AaCompromise),
            "certificateHold" | "removeFromCRL" => Err(CaError::Certificate(format!(
                "revocation reason '{}' is not supported, revocation is permanent",
                s
            ))),
            other => Err(CaError::Certificate(format!(
                "unknown revocation reason '{}'",
                other
            ))),
        }
    }
}

/// One revoked certificate as seen by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedCertificate {
    pub serial_number: SerialNumber,
    pub reason: RevocationReason,
    pub revoked_at: DateTime<Utc>,
}

/// Set of revoked serials, derived from registry entries
#[derive(Debug, Clone, Default)]
pub struct RevocationLedger {
    revoked: BTreeMap<SerialNumber, RevokedCertificate>,
}

impl RevocationLedger {
    /// Collect the revoked entries
    ///
    /// Registry snapshots reject revoked entries without a revocation time, so
    /// the ledger built from a snapshot holds every revoked serial.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a RegistryEntry>) -> Self {
        let revoked = entries
            .into_iter()
            .filter(|entry| entry.status == CertificateStatus::Revoked)
            .filter_map(|entry| {
                let revoked_at = entry.revoked_at?;
                Some((
                    entry.serial_number,
                    RevokedCertificate {
                        serial_number: entry.serial_number,
                        reason: entry
                            .revocation_reason
                            .unwrap_or(RevocationReason::Unspecified),
                        revoked_at,
                    },
                ))
            })
            .collect();
        Self { revoked }
    }

    pub fn contains(&self, serial: SerialNumber) -> bool {
        self.revoked.contains_key(&serial)
    }

    pub fn get(&self, serial: SerialNumber) -> Option<&RevokedCertificate> {
        self.revoked.get(&serial)
    }

    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }

    /// Entries in ascending serial order
    pub fn iter(&self) -> impl Iterator<Item = &RevokedCertificate> {
        self.revoked.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RevocationListBody {
    issuer: String,
    this_update: DateTime<Utc>,
    next_update: DateTime<Utc>,
    entries: Vec<RevokedCertificate>,
}

/// Signed, regenerable revocation list written next to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationList {
    #[serde(flatten)]
    body: RevocationListBody,
    digest: String,
    signature: String,
}

impl RevocationList {
    /// Sign a list covering every ledger entry
    pub fn sign(
        issuer: &DistinguishedName,
        ledger: &RevocationLedger,
        this_update: DateTime<Utc>,
        next_update: DateTime<Utc>,
        key: &KeyPair,
    ) -> Result<Self> {
        let body = RevocationListBody {
            issuer: issuer.to_string(),
            this_update,
            next_update,
            entries: ledger.iter().cloned().collect(),
        };
        let digest = key.message_digest();
        let mut signer = Signer::new(digest, key.pkey())?;
        signer.update(&canonical_bytes(&body)?)?;
        let signature = signer.sign_to_vec()?;

        Ok(Self {
            body,
            digest: digest_name(digest)?,
            signature: hex::encode(signature),
        })
    }

    /// Check the list signature against the issuer public key
    pub fn verify(&self, issuer_public_key: &PKeyRef<Public>) -> Result<bool> {
        let digest = MessageDigest::from_name(&self.digest).ok_or_else(|| {
            CaError::Certificate(format!("unknown revocation list digest '{}'", self.digest))
        })?;
        let signature = match hex::decode(&self.signature) {
            Ok(signature) => signature,
            Err(_) => return Ok(false),
        };
        let mut verifier = Verifier::new(digest, issuer_public_key)?;
        verifier.update(&canonical_bytes(&self.body)?)?;
        Ok(verifier.verify(&signature).unwrap_or(false))
    }

    pub fn issuer(&self) -> &str {
        &self.body.issuer
    }

    pub fn this_update(&self) -> DateTime<Utc> {
        self.body.this_update
    }

    pub fn next_update(&self) -> DateTime<Utc> {
        self.body.next_update
    }

    pub fn entries(&self) -> &[RevokedCertificate] {
        &self.body.entries
    }

    pub fn contains(&self, serial: SerialNumber) -> bool {
        self.body.entries.iter().any(|e| e.serial_number == serial)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| CaError::Certificate(format!("failed to encode revocation list: {}", e)))?;
        write_atomic(path, &data, PUBLIC_FILE_MODE)?;
        Ok(())
    }

    /// Load a list, `None` when it has never been written
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match read_optional(path)? {
            None => Ok(None),
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| CaError::corruption(path, format!("unreadable revocation list: {}", e))),
        }
    }
}

fn canonical_bytes(body: &RevocationListBody) -> Result<Vec<u8>> {
    serde_json::to_vec(body)
        .map_err(|e| CaError::Certificate(format!("failed to encode revocation list: {}", e)))
}

fn digest_name(digest: MessageDigest) -> Result<String> {
    Ok(digest.type_().short_name()?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_material::KeyAlgorithm;
    use chrono::Duration;
    use tempfile::TempDir;

    fn entry(serial: u128, revoked: Option<RevocationReason>) -> RegistryEntry {
        let now = Utc::now();
        RegistryEntry {
            serial_number: SerialNumber::new(serial),
            subject: DistinguishedName::common_name(format!("host{}", serial)),
            issued_at: now,
            expires_at: now + Duration::days(1),
            status: if revoked.is_some() {
                CertificateStatus::Revoked
            } else {
                CertificateStatus::Active
            },
            revoked_at: revoked.map(|_| now),
            revocation_reason: revoked,
            fingerprint_sha256: String::new(),
        }
    }

    #[test]
    fn test_reason_text_forms() {
        assert_eq!(
            "keyCompromise".parse::<RevocationReason>().unwrap(),
            RevocationReason::KeyCompromise
        );
        assert_eq!(RevocationReason::CaCompromise.to_string(), "cACompromise");
        assert_eq!(
            serde_json::to_string(&RevocationReason::CaCompromise).unwrap(),
            "\"cACompromise\""
        );
        assert_eq!(RevocationReason::PrivilegeWithdrawn.code(), 9);
        assert!("certificateHold".parse::<RevocationReason>().is_err());
        assert!("bogus".parse::<RevocationReason>().is_err());
    }

    #[test]
    fn test_ledger_only_holds_revoked_in_serial_order() {
        let entries = vec![
            entry(30, Some(RevocationReason::Superseded)),
            entry(10, None),
            entry(20, Some(RevocationReason::KeyCompromise)),
        ];
        let ledger = RevocationLedger::from_entries(&entries);
        assert_eq!(ledger.len(), 2);
        assert!(!ledger.contains(SerialNumber::new(10)));
        let serials: Vec<_> = ledger.iter().map(|r| r.serial_number.value()).collect();
        assert_eq!(serials, vec![20, 30]);
        assert_eq!(
            ledger.get(SerialNumber::new(20)).unwrap().reason,
            RevocationReason::KeyCompromise
        );
    }

    #[test]
    fn test_signed_list_verifies_and_detects_tampering() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, 2048).unwrap();
        let entries = vec![entry(1, Some(RevocationReason::KeyCompromise))];
        let ledger = RevocationLedger::from_entries(&entries);
        let now = Utc::now();
        let list = RevocationList::sign(
            &DistinguishedName::common_name("Root"),
            &ledger,
            now,
            now + Duration::days(7),
            &key,
        )
        .unwrap();

        let public = key.public_key().unwrap();
        assert!(list.verify(&public).unwrap());
        assert!(list.contains(SerialNumber::new(1)));

        let mut tampered = list.clone();
        tampered.body.entries.clear();
        assert!(!tampered.verify(&public).unwrap());
    }

    #[test]
    fn test_list_survives_write_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("revocation_list.json");
        let key = KeyPair::generate(KeyAlgorithm::EcP384, 2048).unwrap();
        let now = Utc::now();
        let list = RevocationList::sign(
            &DistinguishedName::common_name("Root"),
            &RevocationLedger::default(),
            now,
            now + Duration::days(7),
            &key,
        )
        .unwrap();

        assert!(RevocationList::load(&path).unwrap().is_none());
        list.write(&path).unwrap();
        let loaded = RevocationList::load(&path).unwrap().unwrap();
        assert_eq!(loaded, list);
        assert!(loaded.verify(&key.public_key().unwrap()).unwrap());
    }
}
