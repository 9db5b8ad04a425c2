//! taskgate - SSH task agent that runs profiled commands in per-session
//! sandbox directories.

#[cfg(not(target_os = "linux"))]
compile_error!("taskgate only works on Linux.");

pub mod agent;
pub mod auth;
pub mod config;
pub mod env;
pub mod error;
pub mod forwarding;
pub mod host_key;
pub mod http_server;
pub mod identity;
pub mod launcher;
pub mod sandbox;
pub mod ssh_server;
pub mod state;
