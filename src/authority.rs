//! Certificate Authority Service
//!
//! [`CertificateAuthority`] is the context object every operation goes through.
//! It owns the store layout, the registry and the serial allocator, and once the
//! root exists it holds the root key and certificate for the life of the value.
//!
//! ```text
//! Uninitialized ──init_root──▶ Initialized
//!       ▲                           │
//!       └──────── reset(fp) ────────┘   (destructive, needs the root fingerprint)
//! ```
//!
//! All operations take `&self`; wrap the authority in an `Arc` to share it
//! between threads. Root creation, serial allocation, registry writes and
//! revocation list publication are serialized through file locks, so several
//! handles or processes may also share one store. A handle opened before the
//! root existed must be reopened to pick it up.
//!
//! # Example
//! ```rust,no_run
//! use pki_authority::authority::CertificateAuthority;
//! use pki_authority::configs::CaConfig;
//! use pki_authority::distinguished_name::DistinguishedName;
//! use pki_authority::key_material::{KeyAlgorithm, KeyPair};
//! use pki_authority::signing_request::SigningRequestBuilder;
//! # fn example() -> pki_authority::error::Result<()> {
//! let ca = CertificateAuthority::open(&CaConfig::with_data_directory("data/ca"), None)?;
//! ca.init_root(
//!     &DistinguishedName::common_name("Test CA"),
//!     KeyAlgorithm::Rsa { bits: 2048 },
//!     3650,
//!     None,
//! )?;
//!
//! let key = KeyPair::generate(KeyAlgorithm::EcP256, 2048)?;
//! let csr = SigningRequestBuilder::new()
//!     .subject_common_name("test.example.com".to_string())
//!     .build(&key)?
//!     .to_pem()?;
//!
//! let request = ca.submit_request(&csr)?;
//! let cert = ca.issue(request, 30, None)?;
//! assert!(ca.validate(&cert.to_pem()?)?.valid);
//! # Ok(())
//! # }
//! ```

use crate::certificate::{build_self_signed, build_signed, verify_signature, Certificate, Extensions};
use crate::configs::CaConfig;
use crate::distinguished_name::DistinguishedName;
use crate::error::{CaError, Result};
use crate::file_lock::FileLock;
use crate::key_material::{strength_of, KeyAlgorithm, KeyPair};
use crate::registry::{CertificateRegistry, RegistryEntry};
use crate::revocation::{RevocationLedger, RevocationList, RevocationReason};
use crate::serial_allocator::{SerialAllocator, SerialNumber};
use crate::signing_request::CertificateSigningRequest;
use crate::statistics::{IntegrityReport, RegistryStats};
use crate::storage::{read_optional, write_atomic, StoreLayout, PRIVATE_FILE_MODE, PUBLIC_FILE_MODE};
use crate::validation::{ValidationEngine, Verdict};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use secrecy::SecretString;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Root key and certificate held while the authority is initialized
struct RootIdentity {
    key: KeyPair,
    certificate: Certificate,
    serial: SerialNumber,
}

pub struct CertificateAuthority {
    config: CaConfig,
    layout: StoreLayout,
    registry: CertificateRegistry,
    serials: SerialAllocator,
    root: RwLock<Option<Arc<RootIdentity>>>,
}

impl CertificateAuthority {
    /// Open the store named by `config`, loading the root identity if present
    ///
    /// `passphrase` unlocks an encrypted root key; it is ignored for a store that
    /// is not yet initialized.
    ///
    /// # Errors
    /// * `Authentication` - the root key is encrypted and the passphrase is missing or wrong
    /// * `Corruption` - only one of key and certificate exists, or they do not belong together
    pub fn open(config: &CaConfig, passphrase: Option<&SecretString>) -> Result<Self> {
        let layout = StoreLayout::new(&config.storage.data_directory);
        layout.ensure_directories()?;
        let lock_timeout = config.storage.lock_timeout();

        let ca = Self {
            registry: CertificateRegistry::new(layout.registry_path(), lock_timeout),
            serials: SerialAllocator::new(layout.serial_state_path(), lock_timeout),
            root: RwLock::new(None),
            config: config.clone(),
            layout,
        };

        let root = ca.load_root(passphrase)?;
        match &root {
            Some(identity) => tracing::info!(
                serial = %identity.serial,
                store = %ca.layout.root().display(),
                "opened initialized certificate authority"
            ),
            None => tracing::info!(
                store = %ca.layout.root().display(),
                "opened uninitialized certificate authority"
            ),
        }
        *ca.root_mut() = root.map(Arc::new);
        Ok(ca)
    }

    fn load_root(&self, passphrase: Option<&SecretString>) -> Result<Option<RootIdentity>> {
        let key_path = self.layout.root_key_path();
        let cert_path = self.layout.root_cert_path();
        let (key_pem, cert_pem) = match (read_optional(&key_path)?, read_optional(&cert_path)?) {
            (None, None) => return Ok(None),
            (Some(key), Some(cert)) => (key, cert),
            (None, Some(_)) => {
                return Err(CaError::corruption(key_path, "root certificate has no key"))
            }
            (Some(_), None) => {
                return Err(CaError::corruption(cert_path, "root key has no certificate"))
            }
        };

        let key = KeyPair::import_private(
            &key_pem,
            passphrase,
            self.config.policy.min_key_strength_bits,
        )?;
        let certificate = Certificate::from_pem(&cert_pem)
            .map_err(|e| CaError::corruption(&cert_path, e.to_string()))?;
        let certificate_public_key = certificate.public_key()?;
        if !key.matches_public_key(&certificate_public_key) {
            return Err(CaError::corruption(
                &cert_path,
                "root certificate does not match root key",
            ));
        }
        let serial = certificate.serial_number()?;
        Ok(Some(RootIdentity {
            key,
            certificate,
            serial,
        }))
    }

    pub fn config(&self) -> &CaConfig {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn registry(&self) -> &CertificateRegistry {
        &self.registry
    }

    pub fn is_initialized(&self) -> bool {
        self.root_ref().is_some()
    }

    /// Create the self-signed root and persist it
    ///
    /// # Errors
    /// * `AlreadyInitialized` - a root already exists for this store
    /// * `WeakParameter` - `algorithm` is below the configured minimum strength
    /// * `InvalidValidity` - `validity_days` is not positive
    /// * `LockTimeout` - another handle held the root lock for the whole wait
    pub fn init_root(
        &self,
        subject: &DistinguishedName,
        algorithm: KeyAlgorithm,
        validity_days: i64,
        passphrase: Option<&SecretString>,
    ) -> Result<Certificate> {
        let mut state = self.root_mut();
        if state.is_some() {
            return Err(CaError::AlreadyInitialized);
        }
        let key_path = self.layout.root_key_path();
        let cert_path = self.layout.root_cert_path();

        // Held until the root is recorded; other handles re-check the files under it
        let _lock = FileLock::acquire(&cert_path, self.config.storage.lock_timeout())?;
        if cert_path.exists() || key_path.exists() {
            tracing::info!(
                store = %self.layout.root().display(),
                "root already created by another handle"
            );
            return Err(CaError::AlreadyInitialized);
        }

        let not_before = now_seconds();
        let not_after = validity_end(not_before, validity_days)?;
        let key = KeyPair::generate(algorithm, self.config.policy.min_key_strength_bits)?;
        let serial = self.serials.next_serial()?;
        let certificate = build_self_signed(
            subject,
            &key,
            serial,
            not_before,
            not_after,
            &Extensions::root_ca(),
        )?;

        write_atomic(&key_path, &key.export_private(passphrase)?, PRIVATE_FILE_MODE)?;
        if let Err(e) = write_atomic(&cert_path, &certificate.to_pem()?, PUBLIC_FILE_MODE) {
            remove_quietly(&key_path);
            return Err(e.into());
        }
        let recorded = RegistryEntry::from_certificate(&certificate, not_before)
            .and_then(|entry| self.registry.record(entry));
        if let Err(e) = recorded {
            remove_quietly(&cert_path);
            remove_quietly(&key_path);
            return Err(e);
        }

        let identity = Arc::new(RootIdentity {
            key,
            certificate: certificate.clone(),
            serial,
        });
        self.publish_after_commit(&identity, serial);
        *state = Some(identity);

        tracing::info!(
            %serial,
            %subject,
            algorithm = %algorithm,
            protected = passphrase.is_some(),
            "initialized root certificate authority"
        );
        Ok(certificate)
    }

    /// Destroy the store and return to Uninitialized
    ///
    /// `confirmation` must be the SHA-256 fingerprint of the current root
    /// certificate (hex, case-insensitive).
    pub fn reset(&self, confirmation: &str) -> Result<()> {
        let mut state = self.root_mut();
        let identity = state.as_ref().ok_or(CaError::NotInitialized)?;
        let fingerprint = identity.certificate.fingerprint_sha256()?;
        if !fingerprint.eq_ignore_ascii_case(confirmation.trim()) {
            return Err(CaError::ResetNotConfirmed);
        }

        self.layout.wipe()?;
        self.layout.ensure_directories()?;
        *state = None;
        tracing::warn!(%fingerprint, "certificate authority store reset");
        Ok(())
    }

    /// Parse an incoming signing request and check it is acceptable
    ///
    /// # Errors
    /// * `RequestFormat` - not a well-formed request, or an unsupported key type
    /// * `ProofOfPossession` - the request signature does not verify
    /// * `WeakParameter` - the request key is below the configured minimum
    pub fn submit_request(&self, csr: &[u8]) -> Result<CertificateSigningRequest> {
        let request = CertificateSigningRequest::parse(csr)?;
        self.check_request_key(&request)?;
        tracing::debug!(subject = %request.subject(), "accepted signing request");
        Ok(request)
    }

    fn check_request_key(&self, request: &CertificateSigningRequest) -> Result<()> {
        let minimum = self.config.policy.min_key_strength_bits;
        match strength_of(request.public_key()) {
            None => Err(CaError::RequestFormat("unsupported public key type".to_string())),
            Some(bits) if bits < minimum => Err(CaError::WeakParameter(format!(
                "request key strength {} bits is below the minimum of {}",
                bits, minimum
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Sign `request` with the root, persist the certificate and record it
    ///
    /// With `extensions` set to `None` the default end-entity profile is used,
    /// carrying the subjectAltNames the request asked for.
    ///
    /// # Errors
    /// * `NotInitialized` - no root exists yet
    /// * `InvalidValidity` - `validity_days` is not positive, or the certificate
    ///   would outlive the root
    /// * `LockTimeout` / `Allocation` - no serial could be allocated
    pub fn issue(
        &self,
        request: CertificateSigningRequest,
        validity_days: i64,
        extensions: Option<Extensions>,
    ) -> Result<Certificate> {
        let root = self.root_identity()?;
        self.check_request_key(&request)?;

        let not_before = now_seconds();
        let not_after = validity_end(not_before, validity_days)?;
        let root_not_after = root.certificate.not_after()?;
        if not_after > root_not_after {
            return Err(CaError::InvalidValidity(format!(
                "certificate would expire at {}, after the issuing root ({})",
                not_after, root_not_after
            )));
        }

        let extensions =
            extensions.unwrap_or_else(|| Extensions::end_entity(request.requested_alt_names()));
        let serial = self.serials.next_serial()?;
        let certificate = build_signed(
            &request,
            &root.certificate,
            &root.key,
            serial,
            not_before,
            not_after,
            &extensions,
        )?;

        let cert_path = self.layout.certificate_path(serial);
        write_atomic(&cert_path, &certificate.to_pem()?, PUBLIC_FILE_MODE)?;
        let recorded = RegistryEntry::from_certificate(&certificate, not_before)
            .and_then(|entry| self.registry.record(entry));
        if let Err(e) = recorded {
            // Roll back the certificate file so the store holds no unrecorded certificate
            remove_quietly(&cert_path);
            return Err(e);
        }

        tracing::info!(%serial, subject = %request.subject(), %not_after, "issued certificate");
        Ok(certificate)
    }

    /// Revoke a certificate and regenerate the revocation list
    ///
    /// The registry change is the commit point. If the list cannot be rewritten
    /// afterwards the revocation still stands, the failure is logged and
    /// [`CertificateAuthority::regenerate_revocation_list`] brings the list up
    /// to date.
    ///
    /// # Errors
    /// * `NotFound` - unknown serial
    /// * `AlreadyRevoked` - revocation is not idempotent
    pub fn revoke(&self, serial: SerialNumber, reason: RevocationReason) -> Result<RegistryEntry> {
        let root = self.root_identity()?;
        if serial == root.serial {
            return Err(CaError::Certificate(
                "the root certificate cannot be revoked, reset the store instead".to_string(),
            ));
        }

        let entry = self.registry.mark_revoked(serial, reason, Utc::now())?;
        self.publish_after_commit(&root, serial);
        tracing::info!(%serial, %reason, subject = %entry.subject, "revoked certificate");
        Ok(entry)
    }

    /// Rebuild and rewrite the signed revocation list from the registry
    pub fn regenerate_revocation_list(&self) -> Result<RevocationList> {
        let root = self.root_identity()?;
        self.publish_revocation_list(&root)
    }

    fn publish_after_commit(&self, root: &RootIdentity, serial: SerialNumber) {
        if let Err(e) = self.publish_revocation_list(root) {
            tracing::error!(
                %serial,
                error = %e,
                "registry updated but revocation list was not republished"
            );
        }
    }

    // The snapshot is taken under the list lock, so the last writer always
    // publishes a ledger that includes every earlier revocation.
    fn publish_revocation_list(&self, root: &RootIdentity) -> Result<RevocationList> {
        let path = self.layout.revocation_list_path();
        let _lock = FileLock::acquire(&path, self.config.storage.lock_timeout())?;
        let ledger = self.registry.snapshot()?.revocation_ledger();
        let this_update = Utc::now();
        let next_update = this_update
            + Duration::try_days(self.config.policy.revocation_list_validity_days)
                .unwrap_or_else(|| Duration::days(7));
        let list = RevocationList::sign(
            &root.certificate.subject()?,
            &ledger,
            this_update,
            next_update,
            &root.key,
        )?;
        list.write(&path)?;
        tracing::debug!(revoked = ledger.len(), "published revocation list");
        Ok(list)
    }

    /// Last published revocation list, if any
    pub fn revocation_list(&self) -> Result<Option<RevocationList>> {
        RevocationList::load(&self.layout.revocation_list_path())
    }

    /// Revoked serials derived from the current registry contents
    pub fn revocation_ledger(&self) -> Result<RevocationLedger> {
        Ok(self.registry.snapshot()?.revocation_ledger())
    }

    pub fn root_certificate(&self) -> Result<Certificate> {
        Ok(self.root_identity()?.certificate.clone())
    }

    /// Fetch an issued certificate by serial
    pub fn certificate(&self, serial: SerialNumber) -> Result<Certificate> {
        let root = self.root_identity()?;
        if serial == root.serial {
            return Ok(root.certificate.clone());
        }
        if self.registry.lookup(serial)?.is_none() {
            return Err(CaError::NotFound(serial));
        }
        self.load_issued(serial)
    }

    fn load_issued(&self, serial: SerialNumber) -> Result<Certificate> {
        let path = self.layout.certificate_path(serial);
        let pem = read_optional(&path)?
            .ok_or_else(|| CaError::corruption(&path, "recorded certificate file is missing"))?;
        Certificate::from_pem(&pem).map_err(|e| CaError::corruption(&path, e.to_string()))
    }

    /// Validate a PEM or DER certificate against the root at the current time
    pub fn validate(&self, cert_bytes: &[u8]) -> Result<Verdict> {
        self.validate_at(cert_bytes, Utc::now())
    }

    pub fn validate_at(&self, cert_bytes: &[u8], now: DateTime<Utc>) -> Result<Verdict> {
        let root = self.root_identity()?;
        let engine = ValidationEngine::new(self.revocation_ledger()?);
        Ok(engine.validate_at(cert_bytes, &root.certificate, now))
    }

    pub fn statistics(&self) -> Result<RegistryStats> {
        Ok(RegistryStats::gather(
            self.registry.snapshot()?.entries(),
            Utc::now(),
        ))
    }

    /// Cross-check every stored artifact against the registry and the root
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        let root = self.root_identity()?;
        let root_public = root.certificate.public_key()?;
        let snapshot = self.registry.snapshot()?;
        let mut report = IntegrityReport {
            root_key_matches: root.key.matches_public_key(&root_public),
            ..IntegrityReport::default()
        };
        if !report.root_key_matches {
            report.problems.push("root key does not match root certificate".to_string());
        }

        for entry in snapshot.entries() {
            report.certificates_checked += 1;
            let serial = entry.serial_number;
            let cert = if serial == root.serial {
                root.certificate.clone()
            } else {
                match self.load_issued(serial) {
                    Ok(cert) => cert,
                    Err(e) => {
                        report.problems.push(format!("{}: {}", serial, e));
                        continue;
                    }
                }
            };

            if cert.fingerprint_sha256()? != entry.fingerprint_sha256 {
                report
                    .problems
                    .push(format!("{}: fingerprint differs from registry", serial));
            }
            if cert.serial_number()? != serial {
                report
                    .problems
                    .push(format!("{}: stored certificate carries another serial", serial));
            }
            if !verify_signature(&cert, &root_public) {
                report
                    .problems
                    .push(format!("{}: signature does not verify against root", serial));
            }
        }
        if snapshot.get(root.serial).is_none() {
            report
                .problems
                .push(format!("{}: root certificate is not recorded", root.serial));
        }

        let ledger = snapshot.revocation_ledger();
        match self.revocation_list()? {
            Some(list) => {
                let signed = list.verify(&root_public)?;
                let current = list.entries().len() == ledger.len()
                    && ledger.iter().all(|r| list.contains(r.serial_number));
                report.revocation_list_valid = signed && current;
                if !signed {
                    report.problems.push("revocation list signature is invalid".to_string());
                } else if !current {
                    report
                        .problems
                        .push("revocation list is out of date with the registry".to_string());
                }
            }
            None => report.problems.push("revocation list is missing".to_string()),
        }

        if report.is_valid() {
            tracing::info!(checked = report.certificates_checked, "store integrity verified");
        } else {
            tracing::warn!(problems = report.problems.len(), "store integrity check failed");
        }
        Ok(report)
    }

    fn root_identity(&self) -> Result<Arc<RootIdentity>> {
        self.root_ref().clone().ok_or(CaError::NotInitialized)
    }

    fn root_ref(&self) -> RwLockReadGuard<'_, Option<Arc<RootIdentity>>> {
        self.root.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn root_mut(&self) -> RwLockWriteGuard<'_, Option<Arc<RootIdentity>>> {
        self.root.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

fn validity_end(not_before: DateTime<Utc>, validity_days: i64) -> Result<DateTime<Utc>> {
    if validity_days <= 0 {
        return Err(CaError::InvalidValidity(format!(
            "validity must be at least one day, got {}",
            validity_days
        )));
    }
    Duration::try_days(validity_days)
        .and_then(|days| not_before.checked_add_signed(days))
        .ok_or_else(|| {
            CaError::InvalidValidity(format!("{} days is out of range", validity_days))
        })
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "rollback could not remove file");
    }
}
