//! Distinguished names with declaration-order semantics
//!
//! Attributes keep the order they were declared in. Two names are equal only if
//! they hold the same attributes, in the same order, with byte-identical values.
//! The order is carried unchanged into the DER encoding, so it is part of what
//! gets signed.

use crate::error::{CaError, Result};
use openssl::asn1::Asn1ObjectRef;
use openssl::nid::Nid;
use openssl::x509::{X509Name, X509NameRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name attribute types
///
/// Attributes without a dedicated variant are kept as [`NameAttribute::Other`],
/// holding the OpenSSL object text (long name, or dotted OID when OpenSSL has
/// no name for it), so any well-formed name round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameAttribute {
    #[serde(rename = "CN")]
    CommonName,
    #[serde(rename = "O")]
    Organization,
    #[serde(rename = "OU")]
    OrganizationalUnit,
    #[serde(rename = "L")]
    Locality,
    #[serde(rename = "ST")]
    State,
    #[serde(rename = "C")]
    Country,
    #[serde(rename = "emailAddress")]
    Email,
    #[serde(rename = "DC")]
    DomainComponent,
    #[serde(rename = "serialNumber")]
    SerialNumber,
    #[serde(rename = "title")]
    Title,
    #[serde(rename = "GN")]
    GivenName,
    #[serde(rename = "SN")]
    Surname,
    #[serde(rename = "other")]
    Other(String),
}

impl NameAttribute {
    fn nid(&self) -> Option<Nid> {
        let nid = match self {
            NameAttribute::CommonName => Nid::COMMONNAME,
            NameAttribute::Organization => Nid::ORGANIZATIONNAME,
            NameAttribute::OrganizationalUnit => Nid::ORGANIZATIONALUNITNAME,
            NameAttribute::Locality => Nid::LOCALITYNAME,
            NameAttribute::State => Nid::STATEORPROVINCENAME,
            NameAttribute::Country => Nid::COUNTRYNAME,
            NameAttribute::Email => Nid::PKCS9_EMAILADDRESS,
            NameAttribute::DomainComponent => Nid::DOMAINCOMPONENT,
            NameAttribute::SerialNumber => Nid::SERIALNUMBER,
            NameAttribute::Title => Nid::TITLE,
            NameAttribute::GivenName => Nid::GIVENNAME,
            NameAttribute::Surname => Nid::SURNAME,
            NameAttribute::Other(_) => return None,
        };
        Some(nid)
    }

    fn from_object(object: &Asn1ObjectRef) -> Self {
        match object.nid() {
            Nid::COMMONNAME => NameAttribute::CommonName,
            Nid::ORGANIZATIONNAME => NameAttribute::Organization,
            Nid::ORGANIZATIONALUNITNAME => NameAttribute::OrganizationalUnit,
            Nid::LOCALITYNAME => NameAttribute::Locality,
            Nid::STATEORPROVINCENAME => NameAttribute::State,
            Nid::COUNTRYNAME => NameAttribute::Country,
            Nid::PKCS9_EMAILADDRESS => NameAttribute::Email,
            Nid::DOMAINCOMPONENT => NameAttribute::DomainComponent,
            Nid::SERIALNUMBER => NameAttribute::SerialNumber,
            Nid::TITLE => NameAttribute::Title,
            Nid::GIVENNAME => NameAttribute::GivenName,
            Nid::SURNAME => NameAttribute::Surname,
            _ => NameAttribute::Other(object.to_string()),
        }
    }

    /// Short label used in the `CN=...,O=...` text form
    pub fn label(&self) -> &str {
        match self {
            NameAttribute::CommonName => "CN",
            NameAttribute::Organization => "O",
            NameAttribute::OrganizationalUnit => "OU",
            NameAttribute::Locality => "L",
            NameAttribute::State => "ST",
            NameAttribute::Country => "C",
            NameAttribute::Email => "emailAddress",
            NameAttribute::DomainComponent => "DC",
            NameAttribute::SerialNumber => "serialNumber",
            NameAttribute::Title => "title",
            NameAttribute::GivenName => "GN",
            NameAttribute::Surname => "SN",
            NameAttribute::Other(object) => object,
        }
    }
}

impl FromStr for NameAttribute {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CN" => Ok(NameAttribute::CommonName),
            "O" => Ok(NameAttribute::Organization),
            "OU" => Ok(NameAttribute::OrganizationalUnit),
            "L" => Ok(NameAttribute::Locality),
            "ST" => Ok(NameAttribute::State),
            "C" => Ok(NameAttribute::Country),
            "emailAddress" | "E" => Ok(NameAttribute::Email),
            "DC" => Ok(NameAttribute::DomainComponent),
            "serialNumber" => Ok(NameAttribute::SerialNumber),
            "title" => Ok(NameAttribute::Title),
            "GN" => Ok(NameAttribute::GivenName),
            "SN" => Ok(NameAttribute::Surname),
            oid if is_dotted_oid(oid) => Ok(NameAttribute::Other(oid.to_string())),
            other => Err(CaError::Name(format!("unknown attribute type '{}'", other))),
        }
    }
}

fn is_dotted_oid(s: &str) -> bool {
    s.contains('.')
        && s
            .split('.')
            .all(|arc| !arc.is_empty() && arc.bytes().all(|b| b.is_ascii_digit()))
}

/// Ordered set of (attribute, value) pairs
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistinguishedName {
    attributes: Vec<(NameAttribute, String)>,
}

impl DistinguishedName {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name holding only a common name
    pub fn common_name(cn: impl Into<String>) -> Self {
        Self::new().with(NameAttribute::CommonName, cn)
    }

    /// Append an attribute, returning self for chaining
    pub fn with(mut self, attribute: NameAttribute, value: impl Into<String>) -> Self {
        self.attributes.push((attribute, value.into()));
        self
    }

    pub fn push(&mut self, attribute: NameAttribute, value: impl Into<String>) {
        self.attributes.push((attribute, value.into()));
    }

    pub fn attributes(&self) -> &[(NameAttribute, String)] {
        &self.attributes
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// First value declared for `attribute`
    pub fn get(&self, attribute: NameAttribute) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(a, _)| *a == attribute)
            .map(|(_, v)| v.as_str())
    }

    /// Build the OpenSSL name, appending entries in declaration order
    pub fn to_x509_name(&self) -> Result<X509Name> {
        if self.attributes.is_empty() {
            return Err(CaError::Name("name has no attributes".to_string()));
        }
        let mut builder = X509Name::builder()?;
        for (attribute, value) in &self.attributes {
            if value.is_empty() {
                return Err(CaError::Name(format!("{} is empty", attribute.label())));
            }
            let appended = match attribute.nid() {
                Some(nid) => builder.append_entry_by_nid(nid, value),
                None => builder.append_entry_by_text(attribute.label(), value),
            };
            appended.map_err(|e| {
                CaError::Name(format!("failed to set {}: {}", attribute.label(), e))
            })?;
        }
        Ok(builder.build())
    }

    /// Read an OpenSSL name back, preserving entry order and every value byte
    pub fn from_x509_name(name: &X509NameRef) -> Result<Self> {
        let mut dn = Self::new();
        for entry in name.entries() {
            let attribute = NameAttribute::from_object(entry.object());
            let value = entry.data().to_string().map_err(|e| {
                CaError::Name(format!("{} value cannot be decoded: {}", attribute.label(), e))
            })?;
            dn.push(attribute, value);
        }
        Ok(dn)
    }
}

impl FromStr for DistinguishedName {
    type Err = CaError;

    /// Parse `CN=host,O=Org` (no escaping; values may not contain commas)
    fn from_str(s: &str) -> Result<Self> {
        let mut dn = Self::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| CaError::Name(format!("'{}' is not TYPE=value", part)))?;
            dn.push(key.trim().parse()?, value.trim());
        }
        if dn.is_empty() {
            return Err(CaError::Name("name has no attributes".to_string()));
        }
        Ok(dn)
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (attribute, value)) in self.attributes.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", attribute.label(), value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_order_sensitive() {
        let a = DistinguishedName::common_name("host").with(NameAttribute::Organization, "Acme");
        let b = DistinguishedName::new()
            .with(NameAttribute::Organization, "Acme")
            .with(NameAttribute::CommonName, "host");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_equality_is_case_preserving() {
        assert_ne!(
            DistinguishedName::common_name("Host"),
            DistinguishedName::common_name("host")
        );
    }

    #[test]
    fn test_parse_and_display() {
        let dn: DistinguishedName = "CN=test.example.com, O=Example Corp, C=US".parse().unwrap();
        assert_eq!(dn.get(NameAttribute::CommonName), Some("test.example.com"));
        assert_eq!(dn.get(NameAttribute::Country), Some("US"));
        assert_eq!(dn.to_string(), "CN=test.example.com,O=Example Corp,C=US");
    }

    #[test]
    fn test_parse_rejects_unknown_attribute() {
        assert!(matches!(
            "XX=1".parse::<DistinguishedName>(),
            Err(CaError::Name(_))
        ));
        assert!("".parse::<DistinguishedName>().is_err());
    }

    #[test]
    fn test_x509_name_preserves_order() {
        let dn = DistinguishedName::new()
            .with(NameAttribute::Country, "BR")
            .with(NameAttribute::Organization, "MenaceLabs")
            .with(NameAttribute::CommonName, "Root")
            .with(NameAttribute::Email, "pki@example.com");
        let name = dn.to_x509_name().unwrap();
        assert_eq!(DistinguishedName::from_x509_name(&name).unwrap(), dn);
    }

    #[test]
    fn test_unlisted_attributes_round_trip_in_order() {
        let mut builder = X509Name::builder().unwrap();
        builder.append_entry_by_text("DC", "example").unwrap();
        builder.append_entry_by_nid(Nid::PSEUDONYM, "ghost").unwrap();
        builder.append_entry_by_text("1.3.6.1.4.1.55555.1", "custom").unwrap();
        builder.append_entry_by_nid(Nid::COMMONNAME, "Foreign CA").unwrap();
        let name = builder.build();

        let dn = DistinguishedName::from_x509_name(&name).unwrap();
        let kinds: Vec<_> = dn.attributes().iter().map(|(a, _)| a.clone()).collect();
        assert_eq!(kinds[0], NameAttribute::DomainComponent);
        assert!(matches!(kinds[1], NameAttribute::Other(_)));
        assert_eq!(kinds[2], NameAttribute::Other("1.3.6.1.4.1.55555.1".to_string()));
        assert_eq!(kinds[3], NameAttribute::CommonName);

        let rebuilt = dn.to_x509_name().unwrap();
        assert_eq!(rebuilt.to_der().unwrap(), name.to_der().unwrap());
        assert_eq!(DistinguishedName::from_x509_name(&rebuilt).unwrap(), dn);
    }

    #[test]
    fn test_parse_accepts_dotted_oid() {
        let dn: DistinguishedName = "CN=svc,2.5.4.5=SN-1234".parse().unwrap();
        assert_eq!(dn.attributes()[1].0, NameAttribute::Other("2.5.4.5".to_string()));
        assert!("1..2=x".parse::<DistinguishedName>().is_err());
    }

    #[test]
    fn test_interior_nul_is_not_truncated() {
        let padded = DistinguishedName::common_name("host\0.evil.example");
        let name = padded.to_x509_name().unwrap();
        let decoded = DistinguishedName::from_x509_name(&name).unwrap();

        assert_eq!(decoded, padded);
        assert_ne!(decoded, DistinguishedName::common_name("host"));
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(DistinguishedName::new().to_x509_name().is_err());
    }
}
