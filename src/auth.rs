//! Public-key authentication against the merged authorized-keys sources.

use crate::config::{Config, ConfigStore, TaskProfile};
use russh::keys::ssh_key::authorized_keys::Entry;
use russh::keys::PublicKey;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info};

/// One place allowed keys are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    File(PathBuf),
    Inline(Vec<String>),
}

/// The ordered sources for a principal. A profile override replaces the
/// matching agent-level source instead of merging with it.
pub fn key_sources(config: &Config, profile: Option<&TaskProfile>) -> Vec<KeySource> {
    let agent = &config.agent;
    let mut sources = Vec::new();

    if let Some(system) = &agent.system_authorized_keys_file {
        if agent.authorized_keys_file.as_ref() != Some(system) {
            sources.push(KeySource::File(system.clone()));
        }
    }

    let file = profile
        .and_then(|p| p.authorized_keys_file.as_ref())
        .or(agent.authorized_keys_file.as_ref());
    if let Some(file) = file {
        sources.push(KeySource::File(file.clone()));
    }

    let inline = profile
        .and_then(|p| p.authorized_keys.as_ref())
        .unwrap_or(&agent.authorized_keys);
    if !inline.is_empty() {
        sources.push(KeySource::Inline(inline.clone()));
    }

    sources
}

/// Why a key check failed closed.
#[derive(Debug)]
enum KeyCheckError {
    Unreadable(PathBuf, std::io::Error),
    Malformed(String),
}

impl std::fmt::Display for KeyCheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreadable(path, e) => write!(f, "cannot read {}: {}", path.display(), e),
            Self::Malformed(line) => write!(f, "malformed authorized key line: {}", line),
        }
    }
}

fn read_source(source: &KeySource) -> Result<String, KeyCheckError> {
    match source {
        KeySource::Inline(lines) => {
            let mut data = lines.join("\n");
            data.push('\n');
            Ok(data)
        }
        KeySource::File(path) => read_keys_file(path),
    }
}

fn read_keys_file(path: &Path) -> Result<String, KeyCheckError> {
    match std::fs::read_to_string(path) {
        Ok(mut data) => {
            if !data.ends_with('\n') {
                data.push('\n');
            }
            Ok(data)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Authorized keys file does not exist, skipping");
            Ok(String::new())
        }
        Err(e) => Err(KeyCheckError::Unreadable(path.to_path_buf(), e)),
    }
}

fn key_is_listed(offered: &PublicKey, sources: &[KeySource]) -> Result<bool, KeyCheckError> {
    let mut material = String::new();
    for source in sources {
        material.push_str(&read_source(source)?);
    }

    let entries = material
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Entry::from_str(line).map_err(|_| KeyCheckError::Malformed(line.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    let matched = entries
        .iter()
        .find(|entry| entry.public_key().key_data() == offered.key_data());
    if let Some(entry) = matched {
        debug!(comment = entry.public_key().comment(), "Matched authorized key");
    }
    Ok(matched.is_some())
}

/// Decides whether an offered key may log in as a principal.
#[derive(Clone)]
pub struct Authenticator {
    config: Arc<ConfigStore>,
}

impl Authenticator {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }

    /// Run [`Authenticator::authenticate`] on the blocking pool, since it
    /// reads key files and may reload the config.
    pub async fn authenticate_on_blocking_pool(
        &self,
        remote: Option<SocketAddr>,
        username: &str,
        offered: &PublicKey,
    ) -> bool {
        let this = self.clone();
        let username = username.to_string();
        let offered = offered.clone();
        match tokio::task::spawn_blocking(move || this.authenticate(remote, &username, &offered)).await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Key check did not complete, rejecting");
                false
            }
        }
    }

    /// Blocking: reads the authorized keys sources on every call.
    pub fn authenticate(&self, remote: Option<SocketAddr>, username: &str, offered: &PublicKey) -> bool {
        let config = if self.config.current().agent.hot_reload {
            self.config.reload()
        } else {
            self.config.current()
        };

        if config.agent.loopback_auth_bypass {
            if let Some(addr) = remote.filter(|a| a.ip().is_loopback()) {
                info!(peer = %addr, user = username, "Loopback peer, skipping key check");
                return true;
            }
        }

        let profile = config.profile(username);
        let sources = key_sources(&config, profile);

        match key_is_listed(offered, &sources) {
            Ok(true) => true,
            Ok(false) => {
                info!(user = username, peer = ?remote, "Public key not authorized");
                false
            }
            Err(e) => {
                error!(user = username, peer = ?remote, error = %e, "Rejecting public key");
                false
            }
        }
    }
}
