//! Certificate validation against a trusted root.
//!
//! Checks run in a fixed order: format, chain, signature, validity window,
//! revocation. A certificate that cannot be decoded stops there; every other
//! check always runs and all failures are reported together.
//!
//! Validation never returns an error. The outcome is a [`Verdict`].

use crate::certificate::{verify_signature, Certificate};
use crate::revocation::RevocationLedger;
use crate::serial_allocator::SerialNumber;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FailureKind {
    MalformedCertificate,
    UntrustedIssuer,
    InvalidSignature,
    NotYetValid,
    Expired,
    Revoked,
}

/// Validation outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub valid: bool,
    pub failures: BTreeSet<FailureKind>,
    pub serial_number: Option<SerialNumber>,
    pub subject: Option<String>,
}

impl Verdict {
    fn malformed() -> Self {
        Self {
            valid: false,
            failures: BTreeSet::from([FailureKind::MalformedCertificate]),
            serial_number: None,
            subject: None,
        }
    }

    pub fn has(&self, kind: FailureKind) -> bool {
        self.failures.contains(&kind)
    }
}

/// Read-only validator over a revocation ledger snapshot
#[derive(Debug, Clone)]
pub struct ValidationEngine {
    ledger: RevocationLedger,
}

impl ValidationEngine {
    pub fn new(ledger: RevocationLedger) -> Self {
        Self { ledger }
    }

    /// Validate PEM or DER bytes at the current time
    pub fn validate(&self, cert_bytes: &[u8], trusted_root: &Certificate) -> Verdict {
        self.validate_at(cert_bytes, trusted_root, Utc::now())
    }

    pub fn validate_at(
        &self,
        cert_bytes: &[u8],
        trusted_root: &Certificate,
        now: DateTime<Utc>,
    ) -> Verdict {
        match Certificate::parse(cert_bytes) {
            Ok(cert) => self.validate_certificate_at(&cert, trusted_root, now),
            Err(e) => {
                tracing::debug!(error = %e, "certificate failed to decode");
                Verdict::malformed()
            }
        }
    }

    pub fn validate_certificate_at(
        &self,
        cert: &Certificate,
        trusted_root: &Certificate,
        now: DateTime<Utc>,
    ) -> Verdict {
        // Fields that do not decode make the certificate structurally unusable
        let (serial, subject, issuer, not_before, not_after) = match (
            cert.serial_number(),
            cert.subject(),
            cert.issuer(),
            cert.not_before(),
            cert.not_after(),
        ) {
            (Ok(serial), Ok(subject), Ok(issuer), Ok(not_before), Ok(not_after)) => {
                (serial, subject, issuer, not_before, not_after)
            }
            _ => return Verdict::malformed(),
        };

        let mut failures = BTreeSet::new();

        match trusted_root.subject() {
            Ok(root_subject) if root_subject == issuer => {}
            _ => {
                failures.insert(FailureKind::UntrustedIssuer);
            }
        }

        let signature_ok = trusted_root
            .public_key()
            .map(|key| verify_signature(cert, &key))
            .unwrap_or(false);
        if !signature_ok {
            failures.insert(FailureKind::InvalidSignature);
        }

        if now < not_before {
            failures.insert(FailureKind::NotYetValid);
        }
        if now > not_after {
            failures.insert(FailureKind::Expired);
        }

        if self.ledger.contains(serial) {
            failures.insert(FailureKind::Revoked);
        }

        tracing::debug!(%serial, %subject, ?failures, "validated certificate");
        Verdict {
            valid: failures.is_empty(),
            failures,
            serial_number: Some(serial),
            subject: Some(subject.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{build_self_signed, build_signed, Extensions};
    use crate::distinguished_name::{DistinguishedName, NameAttribute};
    use crate::key_material::{KeyAlgorithm, KeyPair};
    use crate::registry::{CertificateStatus, RegistryEntry};
    use crate::revocation::RevocationReason;
    use crate::signing_request::SigningRequestBuilder;
    use chrono::{Duration, TimeZone};

    struct Fixture {
        root: Certificate,
        leaf: Certificate,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let root_key = KeyPair::generate(KeyAlgorithm::EcP256, 2048).unwrap();
        let not_before = Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap();
        let root = build_self_signed(
            &DistinguishedName::common_name("Validation Root"),
            &root_key,
            SerialNumber::new(1),
            not_before,
            not_before + Duration::days(365),
            &Extensions::root_ca(),
        )
        .unwrap();

        let leaf_key = KeyPair::generate(KeyAlgorithm::EcP256, 2048).unwrap();
        let request = SigningRequestBuilder::new()
            .subject_common_name("leaf.example.com".to_string())
            .build(&leaf_key)
            .unwrap();
        let not_after = not_before + Duration::days(30);
        let leaf = build_signed(
            &request,
            &root,
            &root_key,
            SerialNumber::new(2),
            not_before,
            not_after,
            &Extensions::end_entity(&[]),
        )
        .unwrap();

        Fixture {
            root,
            leaf,
            not_before,
            not_after,
        }
    }

    fn engine() -> ValidationEngine {
        ValidationEngine::new(RevocationLedger::default())
    }

    #[test]
    fn test_valid_leaf() {
        let f = fixture();
        let verdict = engine().validate_at(&f.leaf.to_pem().unwrap(), &f.root, f.not_before);
        assert!(verdict.valid, "{:?}", verdict.failures);
        assert!(verdict.failures.is_empty());
        assert_eq!(verdict.serial_number, Some(SerialNumber::new(2)));
    }

    #[test]
    fn test_garbage_is_malformed_only() {
        let f = fixture();
        let verdict = engine().validate(b"definitely not a certificate", &f.root);
        assert!(!verdict.valid);
        assert_eq!(
            verdict.failures,
            BTreeSet::from([FailureKind::MalformedCertificate])
        );
    }

    #[test]
    fn test_validity_bounds_are_inclusive() {
        let f = fixture();
        let der = f.leaf.to_der().unwrap();

        assert!(engine().validate_at(&der, &f.root, f.not_after).valid);
        assert!(engine().validate_at(&der, &f.root, f.not_before).valid);

        let late = engine().validate_at(&der, &f.root, f.not_after + Duration::microseconds(1));
        assert_eq!(late.failures, BTreeSet::from([FailureKind::Expired]));

        let early = engine().validate_at(&der, &f.root, f.not_before - Duration::microseconds(1));
        assert_eq!(early.failures, BTreeSet::from([FailureKind::NotYetValid]));
    }

    #[test]
    fn test_foreign_root_reports_chain_and_signature() {
        let f = fixture();
        let other = fixture();
        let verdict = engine().validate_at(&f.leaf.to_der().unwrap(), &other.root, f.not_before);
        // Same subject name, different key
        assert_eq!(
            verdict.failures,
            BTreeSet::from([FailureKind::InvalidSignature])
        );

        let stranger_key = KeyPair::generate(KeyAlgorithm::EcP256, 2048).unwrap();
        let stranger = build_self_signed(
            &DistinguishedName::common_name("Someone Else"),
            &stranger_key,
            SerialNumber::new(9),
            f.not_before,
            f.not_after,
            &Extensions::root_ca(),
        )
        .unwrap();
        let verdict = engine().validate_at(&f.leaf.to_der().unwrap(), &stranger, f.not_before);
        assert!(verdict.has(FailureKind::UntrustedIssuer));
        assert!(verdict.has(FailureKind::InvalidSignature));
    }

    #[test]
    fn test_foreign_name_attributes_still_run_every_check() {
        let f = fixture();
        let foreign_key = KeyPair::generate(KeyAlgorithm::EcP256, 2048).unwrap();
        let foreign_subject = DistinguishedName::new()
            .with(NameAttribute::DomainComponent, "example")
            .with(NameAttribute::CommonName, "Foreign CA");
        let foreign = build_self_signed(
            &foreign_subject,
            &foreign_key,
            SerialNumber::new(77),
            f.not_before,
            f.not_after,
            &Extensions::root_ca(),
        )
        .unwrap();

        let verdict = engine().validate_at(&foreign.to_pem().unwrap(), &f.root, f.not_before);
        assert_eq!(
            verdict.failures,
            BTreeSet::from([FailureKind::UntrustedIssuer, FailureKind::InvalidSignature])
        );
        assert_eq!(verdict.subject.as_deref(), Some("DC=example,CN=Foreign CA"));
    }

    #[test]
    fn test_revoked_and_expired_aggregate() {
        let f = fixture();
        let entry = RegistryEntry {
            status: CertificateStatus::Revoked,
            revoked_at: Some(f.not_before),
            revocation_reason: Some(RevocationReason::KeyCompromise),
            ..RegistryEntry::from_certificate(&f.leaf, f.not_before).unwrap()
        };
        let engine = ValidationEngine::new(RevocationLedger::from_entries([&entry]));

        let verdict = engine.validate_at(
            &f.leaf.to_der().unwrap(),
            &f.root,
            f.not_after + Duration::days(1),
        );
        assert_eq!(
            verdict.failures,
            BTreeSet::from([FailureKind::Expired, FailureKind::Revoked])
        );
    }
}
