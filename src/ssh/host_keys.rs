//! Host keys and trusted user CAs

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use russh::keys::ssh_key::certificate::CertType;
use russh::keys::ssh_key::{Algorithm, Certificate, EcdsaCurve, Fingerprint, HashAlg, LineEnding, PrivateKey, PublicKey};
use tracing::{info, warn};

use crate::error::{Result, SftpdError};

/// Host keys generated on first start when no key is configured
pub const DEFAULT_HOST_KEYS: &[&str] = &["id_rsa", "id_ecdsa", "id_ed25519"];

fn default_key_algorithm(path: &Path) -> Option<Algorithm> {
    match path.file_name()?.to_str()? {
        "id_rsa" => Some(Algorithm::Rsa { hash: None }),
        "id_ecdsa" => Some(Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        }),
        "id_ed25519" => Some(Algorithm::Ed25519),
        _ => None,
    }
}

fn resolve_key_path(config_dir: &Path, name: &str) -> PathBuf {
    let path = Path::new(name);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir.join(path)
    }
}

/// Generate a key pair and persist the private key readable by the owner
/// only.
pub fn generate_host_key(path: &Path, algorithm: Algorithm) -> Result<PrivateKey> {
    info!("generating host key {:?}, algorithm {}", path, algorithm);
    let key = PrivateKey::random(&mut OsRng, algorithm)
        .map_err(|e| SftpdError::Config(format!("unable to generate host key {:?}: {}", path, e)))?;
    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| SftpdError::Config(format!("unable to encode host key {:?}: {}", path, e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| SftpdError::Config(format!("unable to write host key {:?}: {}", path, e)))?;
    file.write_all(encoded.as_bytes())
        .map_err(|e| SftpdError::Config(format!("unable to write host key {:?}: {}", path, e)))?;
    Ok(key)
}

/// Resolve, generate missing default keys, then load every host key.
///
/// An empty list means the default keys inside `config_dir`. A missing
/// file is generated only when its name is one of the defaults.
pub fn check_and_load_host_keys(config_dir: &Path, host_keys: &[String]) -> Result<Vec<PrivateKey>> {
    let paths: Vec<PathBuf> = if host_keys.is_empty() {
        DEFAULT_HOST_KEYS.iter().map(|name| config_dir.join(name)).collect()
    } else {
        host_keys.iter().map(|name| resolve_key_path(config_dir, name)).collect()
    };

    for path in &paths {
        if path.exists() {
            continue;
        }
        if let Some(algorithm) = default_key_algorithm(path) {
            generate_host_key(path, algorithm)?;
        }
    }

    paths
        .iter()
        .map(|path| {
            let key = russh::keys::load_secret_key(path, None)
                .map_err(|e| SftpdError::Config(format!("unable to load host key {:?}: {}", path, e)))?;
            info!("host key {:?} loaded, type {}", path, key.algorithm());
            Ok(key)
        })
        .collect()
}

/// CA public keys trusted to sign user certificates
#[derive(Debug, Clone, Default)]
pub struct TrustedCaKeys {
    keys: Vec<PublicKey>,
}

impl TrustedCaKeys {
    /// Parse every CA file, relative paths are resolved against
    /// `config_dir`. Any missing or malformed file fails the whole load.
    pub fn load(config_dir: &Path, files: &[String]) -> Result<Self> {
        let mut keys = Vec::with_capacity(files.len());
        for name in files {
            let path = resolve_key_path(config_dir, name);
            let key = russh::keys::load_public_key(&path)
                .map_err(|e| SftpdError::Config(format!("unable to load trusted CA key {:?}: {}", path, e)))?;
            info!("trusted user CA key {:?} loaded", path);
            keys.push(key);
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_user_authority(&self, key: &PublicKey) -> bool {
        self.keys.iter().any(|k| k.key_data() == key.key_data())
    }

    /// Accept `cert` for `username`: a user certificate signed by a trusted
    /// CA, listing the user among its principals and currently valid.
    pub fn check_user_certificate(&self, cert: &Certificate, username: &str) -> Result<()> {
        if cert.cert_type() != CertType::User {
            warn!("certificate {:?} is not a user certificate", cert.key_id());
            return Err(SftpdError::PermissionDenied);
        }
        if !self.keys.iter().any(|k| k.key_data() == cert.signature_key()) {
            warn!("certificate {:?} is not signed by a trusted CA", cert.key_id());
            return Err(SftpdError::PermissionDenied);
        }
        if !cert.valid_principals().is_empty() && !cert.valid_principals().iter().any(|p| p == username) {
            warn!("certificate {:?} is not valid for user {:?}", cert.key_id(), username);
            return Err(SftpdError::PermissionDenied);
        }
        let fingerprints: Vec<Fingerprint> = self.keys.iter().map(|k| k.fingerprint(HashAlg::Sha256)).collect();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        cert.validate_at(now, &fingerprints).map_err(|e| {
            warn!("certificate {:?} rejected: {}", cert.key_id(), e);
            SftpdError::PermissionDenied
        })
    }
}
