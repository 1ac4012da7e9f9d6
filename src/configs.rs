use crate::distinguished_name::{DistinguishedName, NameAttribute};
use crate::key_material::MIN_KEY_STRENGTH_DEFAULT;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CaConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub root_ca_defaults: RootCADefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("data/ca")
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_min_key_strength")]
    pub min_key_strength_bits: u32,
    #[serde(default = "default_validity_days")]
    pub default_validity_days: i64,
    #[serde(default = "default_revocation_list_validity")]
    pub revocation_list_validity_days: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_key_strength_bits: default_min_key_strength(),
            default_validity_days: default_validity_days(),
            revocation_list_validity_days: default_revocation_list_validity(),
        }
    }
}

fn default_min_key_strength() -> u32 {
    MIN_KEY_STRENGTH_DEFAULT
}

fn default_validity_days() -> i64 {
    365
}

fn default_revocation_list_validity() -> i64 {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct RootCADefaults {
    #[serde(default = "default_root_ca_cn")]
    pub common_name: String,
    #[serde(default = "default_root_ca_org")]
    pub organization: String,
    #[serde(default = "default_root_ca_ou")]
    pub organizational_unit: String,
    #[serde(default = "default_root_ca_locality")]
    pub locality: String,
    #[serde(default = "default_root_ca_state")]
    pub state: String,
    #[serde(default = "default_root_ca_country")]
    pub country: String,
    #[serde(default = "default_root_ca_validity")]
    pub validity_days: i64,
    #[serde(default = "default_root_ca_key_bits")]
    pub key_bits: u32,
}

impl Default for RootCADefaults {
    fn default() -> Self {
        Self {
            common_name: default_root_ca_cn(),
            organization: default_root_ca_org(),
            organizational_unit: default_root_ca_ou(),
            locality: default_root_ca_locality(),
            state: default_root_ca_state(),
            country: default_root_ca_country(),
            validity_days: default_root_ca_validity(),
            key_bits: default_root_ca_key_bits(),
        }
    }
}

impl RootCADefaults {
    /// Subject for a root generated from these defaults; blank fields are skipped
    pub fn subject(&self) -> DistinguishedName {
        [
            (NameAttribute::CommonName, &self.common_name),
            (NameAttribute::Organization, &self.organization),
            (NameAttribute::OrganizationalUnit, &self.organizational_unit),
            (NameAttribute::Locality, &self.locality),
            (NameAttribute::State, &self.state),
            (NameAttribute::Country, &self.country),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .fold(DistinguishedName::new(), |dn, (attribute, value)| {
            dn.with(attribute, value.as_str())
        })
    }
}

fn default_root_ca_cn() -> String {
    "PKI Authority Root CA".to_string()
}

fn default_root_ca_org() -> String {
    "MenaceLabs".to_string()
}

fn default_root_ca_ou() -> String {
    "CY".to_string()
}

fn default_root_ca_locality() -> String {
    "Sao Jose dos Campos".to_string()
}

fn default_root_ca_state() -> String {
    "SP".to_string()
}

fn default_root_ca_country() -> String {
    "BR".to_string()
}

fn default_root_ca_validity() -> i64 {
    3650 // 10 years
}

fn default_root_ca_key_bits() -> u32 {
    4096
}

impl CaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: CaConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }

    /// Defaults everywhere except the store location
    pub fn with_data_directory(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.data_directory = path.into();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: CaConfig = toml::from_str("").unwrap();
        assert_eq!(config.storage.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.policy.min_key_strength_bits, 2048);
        assert_eq!(config.policy.default_validity_days, 365);
        assert_eq!(config.root_ca_defaults.validity_days, 3650);
    }

    #[test]
    fn test_partial_sections_override() {
        let config: CaConfig = toml::from_str(
            r#"
            [storage]
            data_directory = "/var/lib/ca"

            [policy]
            min_key_strength_bits = 3072

            [root_ca_defaults]
            common_name = "Acme Root"
            organizational_unit = ""
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.data_directory, PathBuf::from("/var/lib/ca"));
        assert_eq!(config.storage.lock_timeout_ms, 5000);
        assert_eq!(config.policy.min_key_strength_bits, 3072);
        assert_eq!(
            config.root_ca_defaults.subject().to_string(),
            "CN=Acme Root,O=MenaceLabs,L=Sao Jose dos Campos,ST=SP,C=BR"
        );
    }

    #[test]
    fn test_from_file_reports_missing_path() {
        let err = CaConfig::from_file("/nonexistent/config.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
