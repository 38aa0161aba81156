//! Root CA used to sign leaf certificates for decrypted hosts.
//!
//! The pair lives in `<data dir>/ca/` as `detour-ca.crt` and `detour-ca.key`
//! and is created on first start. Clients must trust the certificate before
//! HTTPS redirection works; installing it is up to the operator, so only its
//! path is logged.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaManagerError;

const CERT_FILE: &str = "detour-ca.crt";
const KEY_FILE: &str = "detour-ca.key";

const COMMON_NAME: &str = "Detour Root CA";

/// Leaf certificates cached by the authority, one per decrypted host.
const LEAF_CACHE_SIZE: u64 = 1000;

/// Owner of the root CA files in one directory.
#[derive(Debug, Clone)]
pub struct CaManager {
    dir: PathBuf,
}

impl CaManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Uses `ca/` under the platform data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let dirs = directories::ProjectDirs::from("com", "detour", "Detour")
            .ok_or(CaManagerError::NoDataDir)?;
        Ok(Self::new(dirs.data_dir().join("ca")))
    }

    /// PEM certificate clients must trust.
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Both halves of the pair are on disk.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().is_file() && self.key_path().is_file()
    }

    /// Loads the pair, creating it first when absent, and returns the signing
    /// authority.
    ///
    /// A lone certificate or key is useless, so a half-written pair is
    /// replaced. Clients that trusted the old certificate must trust the new
    /// one.
    pub fn authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let has_cert = self.cert_path().is_file();
        let has_key = self.key_path().is_file();

        if has_cert != has_key {
            tracing::warn!(
                "Incomplete root CA in {:?}; generating a new one",
                self.dir
            );
        }
        if !(has_cert && has_key) {
            self.generate_ca()?;
        }

        self.load_authority()
    }

    /// Writes a fresh self-signed root, overwriting any existing pair.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.dir).map_err(|e| CaManagerError::io(&self.dir, e))?;

        let key_pair = KeyPair::generate().map_err(|e| CaManagerError::Generate(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CaManagerError::Generate(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generate(e.to_string()))?;

        write_private(&self.key_path(), key_pair.serialize_pem().as_bytes())?;
        fs::write(self.cert_path(), cert.pem())
            .map_err(|e| CaManagerError::io(self.cert_path(), e))?;

        tracing::info!("Generated root CA at {:?}", self.cert_path());
        Ok(())
    }

    /// Builds the signing authority from the stored pair.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();

        let cert_pem =
            fs::read_to_string(&cert_path).map_err(|e| CaManagerError::io(&cert_path, e))?;
        let key_pem =
            fs::read_to_string(&key_path).map_err(|e| CaManagerError::io(&key_path, e))?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Corrupt {
            path: key_path,
            reason: e.to_string(),
        })?;
        let issuer =
            Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| CaManagerError::Corrupt {
                path: cert_path,
                reason: e.to_string(),
            })?;

        Ok(RcgenAuthority::new(
            issuer,
            LEAF_CACHE_SIZE,
            default_provider(),
        ))
    }
}

/// Writes `contents` readable by the owner only, where the OS supports it.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), CaManagerError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options
        .open(path)
        .and_then(|mut file| file.write_all(contents))
        .map_err(|e| CaManagerError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(temp_dir: &TempDir) -> CaManager {
        CaManager::new(temp_dir.path().join("ca"))
    }

    #[test]
    fn file_names() {
        let manager = CaManager::new("/var/lib/detour/ca");
        assert_eq!(
            manager.cert_path(),
            PathBuf::from("/var/lib/detour/ca/detour-ca.crt")
        );
        assert_eq!(
            manager.key_path(),
            PathBuf::from("/var/lib/detour/ca/detour-ca.key")
        );
    }

    #[test]
    fn authority_creates_pair_once() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        assert!(!manager.ca_exists());

        assert!(manager.authority().is_ok());
        assert!(manager.ca_exists());
        let first = fs::read_to_string(manager.cert_path()).unwrap();
        assert!(first.starts_with("-----BEGIN CERTIFICATE-----"));

        assert!(manager.authority().is_ok());
        let second = fs::read_to_string(manager.cert_path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn lone_certificate_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        manager.generate_ca().unwrap();
        let original = fs::read_to_string(manager.cert_path()).unwrap();

        fs::remove_file(manager.key_path()).unwrap();
        assert!(manager.authority().is_ok());

        assert!(manager.ca_exists());
        assert_ne!(fs::read_to_string(manager.cert_path()).unwrap(), original);
    }

    #[test]
    fn corrupt_key_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        manager.generate_ca().unwrap();

        fs::write(manager.key_path(), "not a key").unwrap();
        match manager.load_authority() {
            Err(CaManagerError::Corrupt { path, .. }) => assert_eq!(path, manager.key_path()),
            other => panic!("expected corrupt key, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[test]
    fn key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        manager.generate_ca().unwrap();

        let mode = fs::metadata(manager.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
