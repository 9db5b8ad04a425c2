//! Agent configuration, task profiles and the hot-reloadable config store.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

pub const DEFAULT_PORT: u16 = 2222;
pub const DEFAULT_SANDBOXES_DIR: &str = "/tmp/taskgate/sandboxes";

/// Top-level configuration as read from the TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub profiles: HashMap<String, TaskProfile>,
    pub include: IncludeConfig,
}

/// The `[agent]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub addr: String,
    pub log_level: String,
    /// Read in addition to `authorized_keys_file` for every principal.
    pub system_authorized_keys_file: Option<PathBuf>,
    pub authorized_keys_file: Option<PathBuf>,
    pub authorized_keys: Vec<String>,
    /// Accept any key from a loopback peer.
    pub loopback_auth_bypass: bool,
    pub host_key_file: Option<PathBuf>,
    /// Inline private key in OpenSSH/PEM form. Takes precedence over `host_key_file`.
    pub host_key: Option<String>,
    pub sandboxes_directory: PathBuf,
    pub keep_sandboxes: usize,
    /// `KEY=VALUE` assignments, expanded against the session environment.
    pub environment: Vec<String>,
    pub environment_file: Option<PathBuf>,
    pub hot_reload: bool,
    /// Let principals without a profile open a shell as their own OS account.
    pub allow_unprofiled_sessions: bool,
    /// Optional HTTP listener exposing health and active sessions.
    pub admin_addr: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            log_level: "info".to_string(),
            system_authorized_keys_file: None,
            authorized_keys_file: None,
            authorized_keys: Vec::new(),
            loopback_auth_bypass: false,
            host_key_file: None,
            host_key: None,
            sandboxes_directory: PathBuf::from(DEFAULT_SANDBOXES_DIR),
            keep_sandboxes: 0,
            environment: Vec::new(),
            environment_file: None,
            hot_reload: false,
            allow_unprofiled_sessions: true,
            admin_addr: None,
        }
    }
}

impl AgentConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.addr.clone()))
    }

    pub fn admin_listen_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        match &self.admin_addr {
            Some(addr) => addr
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidAddress(addr.clone())),
            None => Ok(None),
        }
    }
}

/// A named execution policy selected by the connecting principal's name.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskProfile {
    /// Filled from the table key after loading.
    #[serde(skip)]
    pub name: String,
    /// Replaces the agent-level `authorized_keys_file` when set.
    pub authorized_keys_file: Option<PathBuf>,
    /// Replaces the agent-level `authorized_keys` when set.
    pub authorized_keys: Option<Vec<String>>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    /// 0 means unlimited.
    pub max_sessions: usize,
    /// Seconds; 0 means unlimited.
    pub timeout: u64,
    pub limits: ResourceLimits,
}

/// Per-profile rlimits applied to the child before exec.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimits {
    pub nofile: Option<u64>,
    pub fsize_kb: Option<u64>,
    pub mem_kb: Option<u64>,
    pub cpu_seconds: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.nofile.is_none()
            && self.fsize_kb.is_none()
            && self.mem_kb.is_none()
            && self.cpu_seconds.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IncludeConfig {
    pub files: Vec<String>,
}

impl Config {
    /// Load a config file plus everything its `[include]` globs match.
    ///
    /// Included files are applied in glob order: their `[agent]` keys
    /// override the ones already loaded and their profiles replace any
    /// profile of the same name.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let mut table = Self::read_table(path)?;
        let patterns = Self::decode(path, table.clone())?.include.files;

        for pattern in &patterns {
            let entries = glob::glob(pattern).map_err(|e| ConfigError::Include {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            for entry in entries {
                let file = entry.map_err(|e| ConfigError::Include {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
                debug!(file = %file.display(), "Including config file");
                let included = Self::read_table(&file)?;
                // Validate the include on its own so errors name the right file.
                Self::decode(&file, included.clone())?;
                merge_include(&mut table, included, &file);
            }
        }

        let mut config = Self::decode(path, table)?;
        config.finalize()?;
        Ok(config)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        let mut config: Config = toml::from_str(input)?;
        for (name, profile) in config.profiles.iter_mut() {
            profile.name = name.clone();
        }
        Ok(config)
    }

    fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        raw.parse::<toml::Table>().map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn decode(path: &Path, table: toml::Table) -> Result<Self, ConfigError> {
        toml::Value::Table(table)
            .try_into::<Self>()
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    fn finalize(&mut self) -> Result<(), ConfigError> {
        for (name, profile) in self.profiles.iter_mut() {
            profile.name = name.clone();
        }

        let root = &self.agent.sandboxes_directory;
        if root.as_os_str().is_empty() {
            return Err(ConfigError::MissingSandboxRoot);
        }
        if root.is_relative() {
            let cwd = std::env::current_dir().map_err(|source| ConfigError::Read {
                path: root.clone(),
                source,
            })?;
            self.agent.sandboxes_directory = cwd.join(root);
        }
        Ok(())
    }

    /// Exact-match lookup of the profile for a principal.
    pub fn profile(&self, username: &str) -> Option<&TaskProfile> {
        self.profiles.get(username)
    }
}

/// Overlay one included file onto the main table.
fn merge_include(table: &mut toml::Table, included: toml::Table, file: &Path) {
    for (key, value) in included {
        if key == "include" {
            warn!(file = %file.display(), "Nested includes are not followed");
            continue;
        }
        match value {
            toml::Value::Table(section) if key == "agent" || key == "profiles" => {
                if let Some(toml::Value::Table(target)) = table.get_mut(&key) {
                    for (name, value) in section {
                        target.insert(name, value);
                    }
                } else {
                    table.insert(key, toml::Value::Table(section));
                }
            }
            value => {
                table.insert(key, value);
            }
        }
    }
}

/// Where a fresh configuration comes from on hot reload.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Config, ConfigError>;
}

/// Re-reads the TOML file the agent was started with.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<Config, ConfigError> {
        Config::load_file(&self.path)
    }
}

/// Holds the current configuration snapshot and knows how to refresh it.
pub struct ConfigStore {
    current: RwLock<Arc<Config>>,
    source: Option<Box<dyn ConfigSource>>,
}

impl ConfigStore {
    pub fn new(config: Config, source: Option<Box<dyn ConfigSource>>) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            source,
        }
    }

    /// A store that never reloads.
    pub fn fixed(config: Config) -> Self {
        Self::new(config, None)
    }

    pub fn current(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Reload from the source. Errors keep the previous snapshot.
    pub fn reload(&self) -> Arc<Config> {
        let Some(source) = &self.source else {
            return self.current();
        };
        match source.load() {
            Ok(config) => {
                let config = Arc::new(config);
                match self.current.write() {
                    Ok(mut guard) => *guard = config.clone(),
                    Err(poisoned) => *poisoned.into_inner() = config.clone(),
                }
                debug!("Configuration reloaded");
                config
            }
            Err(e) => {
                warn!(error = %e, "Failed to reload config, keeping previous");
                self.current()
            }
        }
    }
}
