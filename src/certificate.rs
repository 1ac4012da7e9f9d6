//! Certificate Model
//!
//! In-memory X.509 v3 certificates plus the two ways this authority creates
//! them: self-signed (the root) and signed from a certificate signing request
//! (end entities).
//!
//! # Canonical Encoding
//! The signed bytes are the DER encoding of the TBSCertificate:
//! - fields in the fixed X.509 order (version, serial, algorithm, issuer,
//!   validity, subject, public key, extensions)
//! - name attributes in the order they were declared, never re-sorted
//! - extensions in the order they appear in [`Extensions`]
//!
//! DER is deterministic, so the same inputs always produce the same bytes and
//! any bit flip after signing makes [`verify_signature`] fail.
//!
//! # Example
//! ```rust,no_run
//! use chrono::{Duration, Utc};
//! use pki_authority::certificate::{build_self_signed, verify_signature, Extensions};
//! use pki_authority::distinguished_name::DistinguishedName;
//! use pki_authority::key_material::{KeyAlgorithm, KeyPair};
//! use pki_authority::serial_allocator::SerialNumber;
//! # fn example() -> pki_authority::error::Result<()> {
//! let key = KeyPair::generate(KeyAlgorithm::Rsa { bits: 2048 }, 2048)?;
//! let now = Utc::now();
//! let root = build_self_signed(
//!     &DistinguishedName::common_name("Example Root CA"),
//!     &key,
//!     SerialNumber::new(1),
//!     now,
//!     now + Duration::days(3650),
//!     &Extensions::root_ca(),
//! )?;
//! let public_key = key.public_key()?;
//! assert!(verify_signature(&root, &public_key));
//! # Ok(())
//! # }
//! ```

use crate::distinguished_name::DistinguishedName;
use crate::error::{CaError, Result};
use crate::key_material::KeyPair;
use crate::serial_allocator::SerialNumber;
use crate::signing_request::CertificateSigningRequest;
use chrono::{DateTime, TimeZone, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::pkey::{PKey, PKeyRef, Public};
use openssl::stack::Stack;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{GeneralName, X509Builder, X509Extension, X509NameRef, X509Ref, X509};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

// ================= Extensions =================

/// keyUsage bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsageFlag {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
}

/// extendedKeyUsage purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedKeyUsageFlag {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
}

/// subjectAltName entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    Dns(String),
    Email(String),
    Ip(IpAddr),
    Uri(String),
}

/// A single X.509 v3 extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateExtension {
    BasicConstraints { ca: bool, path_len: Option<u32> },
    KeyUsage(Vec<KeyUsageFlag>),
    ExtendedKeyUsage(Vec<ExtendedKeyUsageFlag>),
    SubjectAltName(Vec<SubjectAltName>),
    SubjectKeyIdentifier,
    AuthorityKeyIdentifier,
}

/// Ordered extension list; encoding order equals insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions(Vec<CertificateExtension>);

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, extension: CertificateExtension) -> Self {
        self.0.push(extension);
        self
    }

    pub fn push(&mut self, extension: CertificateExtension) {
        self.0.push(extension);
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertificateExtension> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Root CA profile: CA=true with pathlen 0, keyCertSign + cRLSign + digitalSignature
    pub fn root_ca() -> Self {
        Self::new()
            .with(CertificateExtension::BasicConstraints {
                ca: true,
                path_len: Some(0),
            })
            .with(CertificateExtension::KeyUsage(vec![
                KeyUsageFlag::KeyCertSign,
                KeyUsageFlag::CrlSign,
                KeyUsageFlag::DigitalSignature,
            ]))
            .with(CertificateExtension::SubjectKeyIdentifier)
    }

    /// End-entity profile used when the caller supplies no extensions
    pub fn end_entity(alt_names: &[SubjectAltName]) -> Self {
        let mut extensions = Self::new()
            .with(CertificateExtension::BasicConstraints {
                ca: false,
                path_len: None,
            })
            .with(CertificateExtension::KeyUsage(vec![
                KeyUsageFlag::DigitalSignature,
                KeyUsageFlag::KeyEncipherment,
            ]))
            .with(CertificateExtension::ExtendedKeyUsage(vec![
                ExtendedKeyUsageFlag::ServerAuth,
                ExtendedKeyUsageFlag::ClientAuth,
            ]));
        if !alt_names.is_empty() {
            extensions.push(CertificateExtension::SubjectAltName(alt_names.to_vec()));
        }
        extensions
            .with(CertificateExtension::SubjectKeyIdentifier)
            .with(CertificateExtension::AuthorityKeyIdentifier)
    }
}

// ================= Certificate =================

/// An immutable, signed X.509 certificate
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
}

impl Certificate {
    pub fn from_x509(x509: X509) -> Self {
        Self { x509 }
    }

    /// Decode PEM or DER, whichever the input looks like
    pub fn parse(data: &[u8]) -> Result<Self> {
        if looks_like_pem(data) {
            Self::from_pem(data)
        } else {
            Self::from_der(data)
        }
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        X509::from_pem(pem)
            .map(Self::from_x509)
            .map_err(|e| CaError::Certificate(format!("invalid PEM certificate: {}", e)))
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        X509::from_der(der)
            .map(Self::from_x509)
            .map_err(|e| CaError::Certificate(format!("invalid DER certificate: {}", e)))
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.x509.to_pem()?)
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.x509.to_der()?)
    }

    pub fn x509(&self) -> &X509Ref {
        &self.x509
    }

    pub fn serial_number(&self) -> Result<SerialNumber> {
        SerialNumber::from_asn1_integer(self.x509.serial_number())
    }

    pub fn subject(&self) -> Result<DistinguishedName> {
        DistinguishedName::from_x509_name(self.x509.subject_name())
    }

    pub fn issuer(&self) -> Result<DistinguishedName> {
        DistinguishedName::from_x509_name(self.x509.issuer_name())
    }

    pub fn not_before(&self) -> Result<DateTime<Utc>> {
        from_asn1_time(self.x509.not_before())
    }

    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        from_asn1_time(self.x509.not_after())
    }

    pub fn public_key(&self) -> Result<PKey<Public>> {
        Ok(self.x509.public_key()?)
    }

    /// Long name of the signature algorithm, e.g. `sha256WithRSAEncryption`
    pub fn signature_algorithm(&self) -> String {
        self.x509
            .signature_algorithm()
            .object()
            .nid()
            .long_name()
            .unwrap_or("unknown")
            .to_string()
    }

    pub fn signature_value(&self) -> &[u8] {
        self.x509.signature().as_slice()
    }

    pub fn subject_alt_names(&self) -> Vec<SubjectAltName> {
        self.x509
            .subject_alt_names()
            .map(collect_alt_names)
            .unwrap_or_default()
    }

    /// Lowercase hex SHA-256 over the DER encoding
    pub fn fingerprint_sha256(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.to_der()?)))
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let serial = self
            .serial_number()
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "<unreadable>".to_string());
        let subject = self
            .subject()
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "<unreadable>".to_string());
        f.debug_struct("Certificate")
            .field("serial_number", &serial)
            .field("subject", &subject)
            .finish()
    }
}

// ================= Building =================

/// Build a self-signed certificate where issuer == subject
///
/// # Errors
/// * `InvalidValidity` - `not_after` is not after `not_before`
/// * `Certificate` - an extension cannot be encoded, or an
///   authorityKeyIdentifier was requested (it has no meaning for a self-issued root)
pub fn build_self_signed(
    subject: &DistinguishedName,
    key_pair: &KeyPair,
    serial: SerialNumber,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    extensions: &Extensions,
) -> Result<Certificate> {
    if extensions
        .iter()
        .any(|e| *e == CertificateExtension::AuthorityKeyIdentifier)
    {
        return Err(CaError::Certificate(
            "authorityKeyIdentifier is not applicable to a self-signed certificate".to_string(),
        ));
    }

    let name = subject.to_x509_name()?;
    let public_key = key_pair.public_key()?;
    let mut builder = new_builder(serial, &name, &name, not_before, not_after, &public_key)?;
    apply_extensions(&mut builder, extensions, None)?;
    builder.sign(key_pair.pkey(), key_pair.message_digest())?;
    Ok(Certificate::from_x509(builder.build()))
}

/// Build a certificate for `request`, signed by the issuer
///
/// The request's self-signature is re-checked here, so a request can never be
/// turned into a certificate without proof of possession.
///
/// # Errors
/// * `ProofOfPossession` - the request signature does not verify
/// * `InvalidValidity` - `not_after` is not after `not_before`
/// * `Certificate` - issuer key and certificate do not belong together
pub fn build_signed(
    request: &CertificateSigningRequest,
    issuer_cert: &Certificate,
    issuer_key: &KeyPair,
    serial: SerialNumber,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    extensions: &Extensions,
) -> Result<Certificate> {
    if !request.verify_self_signature() {
        return Err(CaError::ProofOfPossession);
    }
    let issuer_public_key = issuer_cert.public_key()?;
    if !issuer_key.matches_public_key(&issuer_public_key) {
        return Err(CaError::Certificate(
            "issuer key does not match issuer certificate".to_string(),
        ));
    }

    let mut builder = new_builder(
        serial,
        request.x509_req().subject_name(),
        issuer_cert.x509().subject_name(),
        not_before,
        not_after,
        request.public_key(),
    )?;
    apply_extensions(&mut builder, extensions, Some(issuer_cert.x509()))?;
    builder.sign(issuer_key.pkey(), issuer_key.message_digest())?;
    Ok(Certificate::from_x509(builder.build()))
}

/// Check the certificate signature against the issuer's public key
///
/// OpenSSL verifies over the TBSCertificate bytes exactly as they were decoded,
/// so any modification of a parsed certificate is detected.
pub fn verify_signature(cert: &Certificate, issuer_public_key: &PKeyRef<Public>) -> bool {
    match cert.x509.verify(issuer_public_key) {
        Ok(valid) => valid,
        Err(e) => {
            tracing::debug!(error = %e, "signature verification errored");
            false
        }
    }
}

fn new_builder(
    serial: SerialNumber,
    subject: &X509NameRef,
    issuer: &X509NameRef,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    public_key: &PKeyRef<Public>,
) -> Result<X509Builder> {
    if not_after <= not_before {
        return Err(CaError::InvalidValidity(format!(
            "notAfter {} is not after notBefore {}",
            not_after, not_before
        )));
    }

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    builder.set_serial_number(&*serial.to_asn1_integer()?)?;
    builder.set_subject_name(subject)?;
    builder.set_issuer_name(issuer)?;
    builder.set_not_before(&*to_asn1_time(not_before)?)?;
    builder.set_not_after(&*to_asn1_time(not_after)?)?;
    // Must precede extensions: subjectKeyIdentifier hashes the public key
    builder.set_pubkey(public_key)?;
    Ok(builder)
}

fn apply_extensions(
    builder: &mut X509Builder,
    extensions: &Extensions,
    issuer: Option<&X509Ref>,
) -> Result<()> {
    for extension in extensions.iter() {
        let built = build_extension(builder, extension, issuer)?;
        builder.append_extension(built)?;
    }
    Ok(())
}

fn build_extension(
    builder: &X509Builder,
    extension: &CertificateExtension,
    issuer: Option<&X509Ref>,
) -> Result<X509Extension> {
    let built = match extension {
        CertificateExtension::BasicConstraints { ca, path_len } => {
            let mut bc = BasicConstraints::new();
            bc.critical();
            if *ca {
                bc.ca();
            }
            if let Some(len) = path_len {
                bc.pathlen(*len);
            }
            bc.build()?
        }
        CertificateExtension::KeyUsage(flags) => {
            if flags.is_empty() {
                return Err(CaError::Certificate("keyUsage has no bits set".to_string()));
            }
            let mut ku = KeyUsage::new();
            ku.critical();
            for flag in flags {
                match flag {
                    KeyUsageFlag::DigitalSignature => ku.digital_signature(),
                    KeyUsageFlag::NonRepudiation => ku.non_repudiation(),
                    KeyUsageFlag::KeyEncipherment => ku.key_encipherment(),
                    KeyUsageFlag::DataEncipherment => ku.data_encipherment(),
                    KeyUsageFlag::KeyAgreement => ku.key_agreement(),
                    KeyUsageFlag::KeyCertSign => ku.key_cert_sign(),
                    KeyUsageFlag::CrlSign => ku.crl_sign(),
                };
            }
            ku.build()?
        }
        CertificateExtension::ExtendedKeyUsage(purposes) => {
            if purposes.is_empty() {
                return Err(CaError::Certificate(
                    "extendedKeyUsage has no purposes".to_string(),
                ));
            }
            let mut eku = ExtendedKeyUsage::new();
            for purpose in purposes {
                match purpose {
                    ExtendedKeyUsageFlag::ServerAuth => eku.server_auth(),
                    ExtendedKeyUsageFlag::ClientAuth => eku.client_auth(),
                    ExtendedKeyUsageFlag::CodeSigning => eku.code_signing(),
                    ExtendedKeyUsageFlag::EmailProtection => eku.email_protection(),
                    ExtendedKeyUsageFlag::TimeStamping => eku.time_stamping(),
                    ExtendedKeyUsageFlag::OcspSigning => eku.other("OCSPSigning"),
                };
            }
            eku.build()?
        }
        CertificateExtension::SubjectAltName(names) => {
            if names.is_empty() {
                return Err(CaError::Certificate("subjectAltName is empty".to_string()));
            }
            let mut san = SubjectAlternativeName::new();
            for name in names {
                match name {
                    SubjectAltName::Dns(dns) => san.dns(dns),
                    SubjectAltName::Email(email) => san.email(email),
                    SubjectAltName::Ip(ip) => san.ip(&ip.to_string()),
                    SubjectAltName::Uri(uri) => san.uri(uri),
                };
            }
            san.build(&builder.x509v3_context(issuer, None))?
        }
        CertificateExtension::SubjectKeyIdentifier => {
            SubjectKeyIdentifier::new().build(&builder.x509v3_context(issuer, None))?
        }
        CertificateExtension::AuthorityKeyIdentifier => {
            let issuer = issuer.ok_or_else(|| {
                CaError::Certificate("authorityKeyIdentifier requires an issuer".to_string())
            })?;
            AuthorityKeyIdentifier::new()
                .keyid(true)
                .build(&builder.x509v3_context(Some(issuer), None))?
        }
    };
    Ok(built)
}

// ================= Helpers =================

pub(crate) fn collect_alt_names(names: Stack<GeneralName>) -> Vec<SubjectAltName> {
    names
        .iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                Some(SubjectAltName::Dns(dns.to_string()))
            } else if let Some(email) = name.email() {
                Some(SubjectAltName::Email(email.to_string()))
            } else if let Some(uri) = name.uri() {
                Some(SubjectAltName::Uri(uri.to_string()))
            } else {
                name.ipaddress().and_then(ip_from_bytes).map(SubjectAltName::Ip)
            }
        })
        .collect()
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

pub(crate) fn looks_like_pem(data: &[u8]) -> bool {
    data.iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| data[start..].starts_with(b"-----BEGIN"))
        .unwrap_or(false)
}

/// Convert to an ASN.1 time; sub-second precision is dropped
pub(crate) fn to_asn1_time(time: DateTime<Utc>) -> Result<Asn1Time> {
    Ok(Asn1Time::from_unix(time.timestamp())?)
}

pub(crate) fn from_asn1_time(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| CaError::Certificate(format!("time {} is out of range", time)))
}
