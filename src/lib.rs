//! PKI Authority - File-backed Certificate Authority Library
//!
//! A Certificate Authority core that creates a self-signed root identity, issues
//! end-entity certificates against PKCS#10 signing requests, revokes them, and
//! validates certificates against the root. All cryptography and X.509/PKCS
//! encoding is done by OpenSSL.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed, CA=true, pathlen=0)
//!   └── End-entity certificate (signed by Root, CA=false)
//! ```
//!
//! The store is a plain directory:
//!
//! ```text
//! <data_directory>/
//!   ca/root_ca.key.pem     root private key, PKCS#8, mode 0600
//!   ca/root_ca.cert.pem    root certificate
//!   certs/<serial>.pem     issued certificates
//!   registry.json          lifecycle status of every certificate
//!   serial.json            serial allocator state
//!   revocation_list.json   signed list of revoked serials
//! ```
//!
//! Every file is replaced atomically. The registry and the serial allocator are
//! guarded by advisory file locks with a bounded wait, so one store can be
//! shared by several threads and processes.
//!
//! # Quick Start
//!
//! ```no_run
//! use pki_authority::authority::CertificateAuthority;
//! use pki_authority::configs::CaConfig;
//! use pki_authority::distinguished_name::DistinguishedName;
//! use pki_authority::key_material::{KeyAlgorithm, KeyPair};
//! use pki_authority::revocation::RevocationReason;
//! use pki_authority::signing_request::SigningRequestBuilder;
//! use pki_authority::validation::FailureKind;
//!
//! fn main() -> pki_authority::error::Result<()> {
//!     let ca = CertificateAuthority::open(&CaConfig::with_data_directory("data/ca"), None)?;
//!     if !ca.is_initialized() {
//!         ca.init_root(
//!             &"CN=Test CA,O=ACME Corp".parse::<DistinguishedName>()?,
//!             KeyAlgorithm::Rsa { bits: 4096 },
//!             3650,
//!             None,
//!         )?;
//!     }
//!
//!     // End entity side
//!     let key = KeyPair::generate(KeyAlgorithm::EcP256, 2048)?;
//!     let csr = SigningRequestBuilder::new()
//!         .subject_common_name("test.example.com".to_string())
//!         .build(&key)?
//!         .to_pem()?;
//!
//!     // CA side
//!     let request = ca.submit_request(&csr)?;
//!     let cert = ca.issue(request, 30, None)?;
//!     assert!(ca.validate(&cert.to_pem()?)?.valid);
//!
//!     ca.revoke(cert.serial_number()?, RevocationReason::KeyCompromise)?;
//!     assert!(ca.validate(&cert.to_pem()?)?.has(FailureKind::Revoked));
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`key_material`]: RSA / ECDSA key pairs, PKCS#8 export and import
//! - [`distinguished_name`]: ordered subject and issuer names
//! - [`certificate`]: certificate model, extensions, building and signature checks
//! - [`signing_request`]: PKCS#10 parsing with proof of possession, and a request builder
//! - [`serial_allocator`]: unique, unpredictable, durably recorded serial numbers
//! - [`registry`]: certificate lifecycle records
//! - [`revocation`]: revocation reasons, the derived ledger and the signed list
//! - [`authority`]: the CA context object tying everything together
//! - [`validation`]: chain, signature, validity window and revocation checks
//! - [`statistics`]: registry counts and integrity reports
//! - [`configs`]: TOML configuration
//!
//! # Error Handling
//!
//! Library operations return [`error::Result`], whose error type
//! [`error::CaError`] has one variant per failure kind. Validation failures are
//! not errors; they come back as data in a [`validation::Verdict`].

pub mod authority;
pub mod certificate;
pub mod configs;
pub mod distinguished_name;
pub mod error;
pub mod file_lock;
pub mod key_material;
pub mod registry;
pub mod revocation;
pub mod serial_allocator;
pub mod signing_request;
pub mod statistics;
pub mod storage;
pub mod validation;
