//! PKCS#10 certificate signing requests
//!
//! [`CertificateSigningRequest::parse`] is the only way to obtain a request from
//! untrusted bytes. It rejects anything that is not a well-formed request and
//! anything whose self-signature does not verify against the enclosed public
//! key (proof of possession).
//!
//! Of the extensions a requester may ask for, only subjectAltName is read. The
//! authority chooses every other extension itself.

use crate::certificate::{collect_alt_names, looks_like_pem, SubjectAltName};
use crate::distinguished_name::{DistinguishedName, NameAttribute};
use crate::error::{CaError, Result};
use crate::key_material::KeyPair;
use openssl::pkey::{PKey, PKeyRef, Public};
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Req, X509ReqRef, X509};

/// A parsed request whose proof of possession has been checked
pub struct CertificateSigningRequest {
    req: X509Req,
    subject: DistinguishedName,
    public_key: PKey<Public>,
    requested_alt_names: Vec<SubjectAltName>,
}

impl CertificateSigningRequest {
    /// Parse a PEM or DER request and verify its signature
    ///
    /// # Errors
    /// * `RequestFormat` - the bytes are not a PKCS#10 request or carry an
    ///   unsupported subject
    /// * `ProofOfPossession` - the signature does not verify with the enclosed key
    pub fn parse(data: &[u8]) -> Result<Self> {
        let parsed = if looks_like_pem(data) {
            X509Req::from_pem(data)
        } else {
            X509Req::from_der(data)
        };
        let req = parsed
            .map_err(|e| CaError::RequestFormat(format!("not a PKCS#10 request: {}", e)))?;
        Self::from_req(req)
    }

    fn from_req(req: X509Req) -> Result<Self> {
        let public_key = req
            .public_key()
            .map_err(|e| CaError::RequestFormat(format!("unreadable public key: {}", e)))?;
        let subject = DistinguishedName::from_x509_name(req.subject_name())
            .map_err(|e| CaError::RequestFormat(e.to_string()))?;
        if subject.is_empty() {
            return Err(CaError::RequestFormat("subject is empty".to_string()));
        }

        if !req.verify(&public_key).unwrap_or(false) {
            tracing::warn!(%subject, "signing request failed proof of possession");
            return Err(CaError::ProofOfPossession);
        }

        let requested_alt_names = requested_alt_names(&req);
        Ok(Self {
            req,
            subject,
            public_key,
            requested_alt_names,
        })
    }

    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    pub fn public_key(&self) -> &PKeyRef<Public> {
        &self.public_key
    }

    pub fn requested_alt_names(&self) -> &[SubjectAltName] {
        &self.requested_alt_names
    }

    /// Re-run the proof-of-possession check
    pub fn verify_self_signature(&self) -> bool {
        self.req.verify(&self.public_key).unwrap_or(false)
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.req.to_pem()?)
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.req.to_der()?)
    }

    pub(crate) fn x509_req(&self) -> &X509ReqRef {
        &self.req
    }
}

impl std::fmt::Debug for CertificateSigningRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSigningRequest")
            .field("subject", &self.subject.to_string())
            .field("requested_alt_names", &self.requested_alt_names)
            .finish()
    }
}

// Requested extensions are parsed by attaching them to a scratch certificate,
// which gives access to OpenSSL's typed subjectAltName decoder.
fn requested_alt_names(req: &X509ReqRef) -> Vec<SubjectAltName> {
    let extensions = match req.extensions() {
        Ok(extensions) => extensions,
        Err(_) => return Vec::new(),
    };
    if extensions.is_empty() {
        return Vec::new();
    }

    let scratch = X509::builder().and_then(|mut builder| {
        for extension in extensions {
            builder.append_extension(extension)?;
        }
        Ok(builder.build())
    });
    match scratch {
        Ok(cert) => cert
            .subject_alt_names()
            .map(collect_alt_names)
            .unwrap_or_default(),
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unreadable requested extensions");
            Vec::new()
        }
    }
}

/// Builder for signing requests, used by clients and tests
///
/// # Example
/// ```rust,no_run
/// use pki_authority::key_material::{KeyAlgorithm, KeyPair};
/// use pki_authority::signing_request::SigningRequestBuilder;
/// # fn example() -> pki_authority::error::Result<()> {
/// let key = KeyPair::generate(KeyAlgorithm::EcP256, 2048)?;
/// let request = SigningRequestBuilder::new()
///     .subject_common_name("api.example.com".to_string())
///     .organization("Example Corp".to_string())
///     .build(&key)?;
/// let pem = request.to_pem()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct SigningRequestBuilder {
    subject: DistinguishedName,
    alt_names: Vec<SubjectAltName>,
}

impl SigningRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: DistinguishedName) -> Self {
        self.subject = subject;
        self
    }

    pub fn subject_common_name(mut self, name: String) -> Self {
        self.subject.push(NameAttribute::CommonName, name);
        self
    }

    pub fn organization(mut self, org: String) -> Self {
        self.subject.push(NameAttribute::Organization, org);
        self
    }

    pub fn organizational_unit(mut self, ou: String) -> Self {
        self.subject.push(NameAttribute::OrganizationalUnit, ou);
        self
    }

    pub fn locality(mut self, locality: String) -> Self {
        self.subject.push(NameAttribute::Locality, locality);
        self
    }

    pub fn state(mut self, state: String) -> Self {
        self.subject.push(NameAttribute::State, state);
        self
    }

    pub fn country(mut self, country: String) -> Self {
        self.subject.push(NameAttribute::Country, country);
        self
    }

    pub fn email(mut self, email: String) -> Self {
        self.subject.push(NameAttribute::Email, email);
        self
    }

    pub fn alt_name(mut self, name: SubjectAltName) -> Self {
        self.alt_names.push(name);
        self
    }

    /// Sign the request with `key_pair`
    pub fn build(self, key_pair: &KeyPair) -> Result<CertificateSigningRequest> {
        let name = self.subject.to_x509_name()?;

        let mut builder = X509Req::builder()?;
        builder.set_version(0)?;
        builder.set_subject_name(&name)?;
        builder.set_pubkey(key_pair.pkey())?;

        if !self.alt_names.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for alt_name in &self.alt_names {
                match alt_name {
                    SubjectAltName::Dns(dns) => san.dns(dns),
                    SubjectAltName::Email(email) => san.email(email),
                    SubjectAltName::Ip(ip) => san.ip(&ip.to_string()),
                    SubjectAltName::Uri(uri) => san.uri(uri),
                };
            }
            let extension = san.build(&builder.x509v3_context(None))?;
            let mut stack = Stack::new()?;
            stack.push(extension)?;
            builder.add_extensions(&stack)?;
        }

        builder.sign(key_pair.pkey(), key_pair.message_digest())?;
        CertificateSigningRequest::from_req(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_material::KeyAlgorithm;
    use openssl::hash::MessageDigest;

    fn key() -> KeyPair {
        KeyPair::generate(KeyAlgorithm::EcP256, 2048).unwrap()
    }

    #[test]
    fn test_round_trip_through_pem() {
        let key = key();
        let request = SigningRequestBuilder::new()
            .subject_common_name("svc.example.com".to_string())
            .organization("Example".to_string())
            .alt_name(SubjectAltName::Dns("svc.example.com".to_string()))
            .alt_name(SubjectAltName::Ip("10.0.0.7".parse().unwrap()))
            .build(&key)
            .unwrap();

        let parsed = CertificateSigningRequest::parse(&request.to_pem().unwrap()).unwrap();
        assert_eq!(parsed.subject().to_string(), "CN=svc.example.com,O=Example");
        assert_eq!(
            parsed.requested_alt_names(),
            &[
                SubjectAltName::Dns("svc.example.com".to_string()),
                SubjectAltName::Ip("10.0.0.7".parse().unwrap()),
            ]
        );
        assert!(key.matches_public_key(parsed.public_key()));
    }

    #[test]
    fn test_der_input_accepted() {
        let request = SigningRequestBuilder::new()
            .subject_common_name("der".to_string())
            .build(&key())
            .unwrap();
        let parsed = CertificateSigningRequest::parse(&request.to_der().unwrap()).unwrap();
        assert!(parsed.requested_alt_names().is_empty());
    }

    #[test]
    fn test_garbage_is_format_error() {
        assert!(matches!(
            CertificateSigningRequest::parse(b"not a request"),
            Err(CaError::RequestFormat(_))
        ));
        assert!(matches!(
            CertificateSigningRequest::parse(b"-----BEGIN CERTIFICATE REQUEST-----\nAAAA\n-----END CERTIFICATE REQUEST-----\n"),
            Err(CaError::RequestFormat(_))
        ));
    }

    #[test]
    fn test_foreign_signature_fails_proof_of_possession() {
        let claimed = key();
        let signer = key();

        // Request carries one public key but is signed by another
        let name = DistinguishedName::common_name("victim").to_x509_name().unwrap();
        let mut builder = X509Req::builder().unwrap();
        builder.set_version(0).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_pubkey(claimed.pkey()).unwrap();
        builder.sign(signer.pkey(), MessageDigest::sha256()).unwrap();
        let pem = builder.build().to_pem().unwrap();

        assert!(matches!(
            CertificateSigningRequest::parse(&pem),
            Err(CaError::ProofOfPossession)
        ));
    }

    #[test]
    fn test_subject_with_serial_number_attribute_accepted() {
        let subject = DistinguishedName::common_name("device-17")
            .with(NameAttribute::SerialNumber, "SN-1234");
        let request = SigningRequestBuilder::new()
            .subject(subject.clone())
            .build(&key())
            .unwrap();

        let parsed = CertificateSigningRequest::parse(&request.to_pem().unwrap()).unwrap();
        assert_eq!(parsed.subject(), &subject);
        assert_eq!(parsed.subject().to_string(), "CN=device-17,serialNumber=SN-1234");
    }

    #[test]
    fn test_empty_subject_rejected() {
        let key = key();
        let mut builder = X509Req::builder().unwrap();
        builder.set_version(0).unwrap();
        builder.set_pubkey(key.pkey()).unwrap();
        builder.sign(key.pkey(), MessageDigest::sha256()).unwrap();
        let pem = builder.build().to_pem().unwrap();

        assert!(matches!(
            CertificateSigningRequest::parse(&pem),
            Err(CaError::RequestFormat(_))
        ));
    }
}
