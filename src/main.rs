//! PKI Authority - bootstrap binary
//!
//! Opens the store named in `config.toml` (built-in defaults when the file is
//! absent), creates the root CA on first run, republishes the revocation list
//! and logs registry statistics and an integrity report.
//!
//! The root key passphrase, if any, is read from `CA_ROOT_KEY_PASSPHRASE`.
//! Argument parsing and interactive workflows belong to a front end built on
//! the library.

use anyhow::{Context, Result};
use pki_authority::authority::CertificateAuthority;
use pki_authority::configs::CaConfig;
use pki_authority::key_material::KeyAlgorithm;
use secrecy::SecretString;
use std::path::Path;
use tracing_subscriber::EnvFilter;

const CONFIG_PATH: &str = "config.toml";
const PASSPHRASE_ENV: &str = "CA_ROOT_KEY_PASSPHRASE";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = if Path::new(CONFIG_PATH).exists() {
        CaConfig::load()?
    } else {
        tracing::info!("{} not found, using built-in defaults", CONFIG_PATH);
        CaConfig::default()
    };
    let passphrase = std::env::var(PASSPHRASE_ENV).ok().map(SecretString::new);

    let ca = CertificateAuthority::open(&config, passphrase.as_ref())
        .context("Failed to open certificate authority store")?;

    if !ca.is_initialized() {
        let defaults = &config.root_ca_defaults;
        let root = ca
            .init_root(
                &defaults.subject(),
                KeyAlgorithm::Rsa {
                    bits: defaults.key_bits,
                },
                defaults.validity_days,
                passphrase.as_ref(),
            )
            .context("Failed to generate Root CA")?;
        tracing::info!(
            fingerprint = %root.fingerprint_sha256()?,
            "root CA created; keep the fingerprint, it confirms a reset"
        );
    }

    ca.regenerate_revocation_list()
        .context("Failed to publish revocation list")?;

    let stats = ca.statistics().context("Failed to read registry")?;
    tracing::info!(
        total = stats.total,
        active = stats.active,
        revoked = stats.revoked,
        expired = stats.expired,
        "registry statistics"
    );

    let report = ca
        .verify_integrity()
        .context("Failed to verify store integrity")?;
    for problem in &report.problems {
        tracing::warn!("{}", problem);
    }
    if !report.is_valid() {
        anyhow::bail!(
            "store integrity check failed with {} problem(s)",
            report.problems.len()
        );
    }
    Ok(())
}
