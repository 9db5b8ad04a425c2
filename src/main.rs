//! taskgate - SSH task agent.
//!
//! Usage:
//!   taskgate serve --config taskgate.toml      # Start the SSH agent
//!   taskgate host-key --config taskgate.toml   # Print the host key fingerprint

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskgate::agent::Agent;
use taskgate::config::{Config, ConfigSource, ConfigStore, FileSource};
use taskgate::host_key::{self, HostKeySource};
use taskgate::identity::HostIdentity;
use taskgate::ssh_server::SshServer;
use taskgate::state::SessionRegistry;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taskgate")]
#[command(about = "SSH task agent running profiled commands in sandboxes", version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the SSH agent
    Serve {
        /// Path to the TOML config file
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Print the host key fingerprint, generating the key if needed
    HostKey {
        /// Path to the TOML config file
        #[arg(long, short)]
        config: PathBuf,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    FileSource::new(path)
        .load()
        .with_context(|| format!("loading {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Serve { config } => {
            let loaded = load_config(&config)?;
            init_logging(&loaded.agent.log_level);
            serve(config, loaded).await
        }
        Commands::HostKey { config } => {
            let loaded = load_config(&config)?;
            init_logging(&loaded.agent.log_level);
            let key = host_key::provision(&HostKeySource::from_config(&loaded.agent))?;
            println!("{}", host_key::fingerprint(&key));
            Ok(())
        }
    }
}

async fn serve(path: PathBuf, config: Config) -> anyhow::Result<()> {
    let key = host_key::provision(&HostKeySource::from_config(&config.agent)).context("provisioning host key")?;
    info!(fingerprint = %host_key::fingerprint(&key), "Host key ready");

    let root = config.agent.sandboxes_directory.clone();
    tokio::task::spawn_blocking(move || std::fs::create_dir_all(&root))
        .await?
        .with_context(|| format!("creating {}", config.agent.sandboxes_directory.display()))?;

    let listen = config.agent.listen_addr()?;
    let admin = config.agent.admin_listen_addr()?;

    let store = Arc::new(ConfigStore::new(config, Some(Box::new(FileSource::new(path)))));
    let registry = Arc::new(SessionRegistry::default());
    let agent = Agent::new(store, registry.clone(), Arc::new(HostIdentity));

    if let Some(addr) = admin {
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = taskgate::http_server::run_server(addr, registry).await {
                warn!(error = %e, "Admin endpoint stopped");
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    let server = SshServer::new(agent, key);

    tokio::select! {
        result = server.serve(listener) => result.context("SSH server failed")?,
        _ = shutdown_signal() => info!("Shutting down"),
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
