//! On-disk layout of a CA store and atomic file replacement.
//!
//! ```text
//! <data_directory>/
//!   ca/root_ca.key.pem     PKCS#8 PEM, owner-only
//!   ca/root_ca.cert.pem    root certificate PEM
//!   certs/<serial>.pem     issued certificates
//!   registry.json          certificate registry
//!   serial.json            serial allocator state
//!   revocation_list.json   signed revocation list
//! ```
//!
//! Every write goes to a staging file in the destination directory, is synced,
//! and is then renamed over the target. Readers see either the old file or the
//! new one, never a partial write.

use crate::serial_allocator::SerialNumber;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Owner read/write only
pub const PRIVATE_FILE_MODE: u32 = 0o600;
/// Owner read/write, world readable
pub const PUBLIC_FILE_MODE: u32 = 0o644;

const CA_DIR: &str = "ca";
const CERTS_DIR: &str = "certs";
const ROOT_KEY_FILE: &str = "root_ca.key.pem";
const ROOT_CERT_FILE: &str = "root_ca.cert.pem";
const REGISTRY_FILE: &str = "registry.json";
const SERIAL_FILE: &str = "serial.json";
const REVOCATION_LIST_FILE: &str = "revocation_list.json";

/// Paths of every artifact in a CA store
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the store directories if they are missing
    pub fn ensure_directories(&self) -> io::Result<()> {
        fs::create_dir_all(self.root.join(CA_DIR))?;
        fs::create_dir_all(self.root.join(CERTS_DIR))?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.root.join(CA_DIR).join(ROOT_KEY_FILE)
    }

    pub fn root_cert_path(&self) -> PathBuf {
        self.root.join(CA_DIR).join(ROOT_CERT_FILE)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn serial_state_path(&self) -> PathBuf {
        self.root.join(SERIAL_FILE)
    }

    pub fn revocation_list_path(&self) -> PathBuf {
        self.root.join(REVOCATION_LIST_FILE)
    }

    pub fn certificate_path(&self, serial: SerialNumber) -> PathBuf {
        self.root.join(CERTS_DIR).join(format!("{}.pem", serial))
    }

    /// Remove every artifact of the store; the directory itself is kept
    pub fn wipe(&self) -> io::Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Atomically replace `path` with `data`, applying `mode` on Unix
///
/// The staging file lives in the same directory as `path` so the final rename
/// never crosses a filesystem boundary. If anything fails before the rename the
/// staging file is removed when it goes out of scope.
pub fn write_atomic(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut staging = NamedTempFile::new_in(dir)?;
    staging.write_all(data)?;
    staging.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(staging.path(), fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    staging.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a file, mapping "does not exist" to `None`
pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
