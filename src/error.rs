//! Error types shared across the agent.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or reloading the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid include pattern {pattern}: {reason}")]
    Include { pattern: String, reason: String },

    #[error("'sandboxes_directory' is required")]
    MissingSandboxRoot,

    #[error("invalid listen address {0}")]
    InvalidAddress(String),
}

/// Errors raised while provisioning the server identity key.
#[derive(Error, Debug)]
pub enum HostKeyError {
    #[error("failed to load host key from {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("failed to decode inline host key: {0}")]
    Decode(String),

    #[error("failed to generate host key: {0}")]
    Generate(String),

    #[error("failed to write host key to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Rejections from the session registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("profile {profile} reached its limit of {limit} concurrent sessions")]
    Capacity { profile: String, limit: usize },
}

/// Everything that can end a session before or while its command runs.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("you've successfully authenticated, but there is no command to run")]
    NoCommand,

    #[error("no task profile for user {0} and unrestricted shells are not allowed")]
    UnknownProfile(String),

    #[error("the agent runs as uid {current} and cannot run sessions as uid {requested}")]
    ImpersonationDenied { current: u32, requested: u32 },

    #[error("the agent runs as gid {current} and cannot run sessions as gid {requested}")]
    GroupSwitchDenied { current: u32, requested: u32 },

    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("unknown group {0}")]
    UnknownGroup(String),

    #[error("identity lookup failed: {0}")]
    Lookup(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("invalid sandbox name {0:?}")]
    InvalidSandboxName(String),

    #[error("failed to prepare sandbox {path}: {source}")]
    Sandbox {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set up agent forwarding: {0}")]
    Forwarding(#[source] std::io::Error),

    #[error("failed to allocate pty: {0}")]
    Pty(#[source] std::io::Error),

    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task timed out: it took longer than {0} sec and was killed")]
    Timeout(u64),

    #[error("failed to wait for the command: {0}")]
    Wait(#[source] std::io::Error),

    #[error("session aborted: {0}")]
    Aborted(String),
}

/// A line in the environment file that is not an assignment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: expected KEY=VALUE, got {content:?}")]
pub struct EnvFileError {
    pub line: usize,
    pub content: String,
}
