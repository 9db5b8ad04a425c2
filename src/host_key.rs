//! Server identity key provisioning.

use crate::config::AgentConfig;
use crate::error::HostKeyError;
use russh::keys::ssh_key::{Algorithm, HashAlg, LineEnding};
use russh::keys::PrivateKey;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Used when neither `host_key` nor `host_key_file` is configured.
pub const FALLBACK_HOST_KEY_PATH: &str = "/tmp/taskgate-host.key";

/// Where the host key comes from, in order of precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeySource {
    Inline(String),
    File(PathBuf),
}

impl HostKeySource {
    pub fn from_config(agent: &AgentConfig) -> Self {
        if let Some(pem) = agent.host_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Self::Inline(pem.clone());
        }
        match &agent.host_key_file {
            Some(path) => Self::File(path.clone()),
            None => Self::File(PathBuf::from(FALLBACK_HOST_KEY_PATH)),
        }
    }
}

/// Return the server key, generating and persisting it on first use.
pub fn provision(source: &HostKeySource) -> Result<PrivateKey, HostKeyError> {
    match source {
        HostKeySource::Inline(pem) => {
            info!("Using host key from the config file");
            russh::keys::decode_secret_key(pem, None).map_err(|e| HostKeyError::Decode(e.to_string()))
        }
        HostKeySource::File(path) => load_or_generate(path),
    }
}

fn load_or_generate(path: &Path) -> Result<PrivateKey, HostKeyError> {
    if path.exists() {
        info!(path = %path.display(), "Using host key file");
        return russh::keys::load_secret_key(path, None).map_err(|e| HostKeyError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        });
    }

    let key = generate()?;
    write_key(path, &key)?;
    info!(path = %path.display(), "Host key did not exist, generated a new one");
    Ok(key)
}

fn generate() -> Result<PrivateKey, HostKeyError> {
    use russh::keys::ssh_key::rand_core::OsRng;

    PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| HostKeyError::Generate(e.to_string()))
}

fn write_key(path: &Path, key: &PrivateKey) -> Result<(), HostKeyError> {
    let write_err = |source| HostKeyError::Write {
        path: path.to_path_buf(),
        source,
    };

    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| HostKeyError::Generate(e.to_string()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(write_err)?;
    file.write_all(encoded.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    Ok(())
}

/// SHA-256 fingerprint in the usual `SHA256:...` form.
pub fn fingerprint(key: &PrivateKey) -> String {
    key.public_key().fingerprint(HashAlg::Sha256).to_string()
}
