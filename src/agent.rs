//! Session orchestration: profile, identity, registry admission, sandbox,
//! forwarding, environment and launch, with teardown on every exit path.

use crate::config::{Config, ConfigStore, TaskProfile};
use crate::env::EnvBuilder;
use crate::error::SessionError;
use crate::forwarding::{AgentConnector, AgentRelay};
use crate::identity::{self, Identity, IdentityProvider};
use crate::launcher::{self, ExitOutcome, LaunchRequest, PtyRequest, SessionIo, SessionOutput};
use crate::sandbox::{validate_sandbox_name, SandboxManager};
use crate::state::{SessionRecord, SessionRegistry};
use std::any::Any;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Instrument};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Caller-supplied variable that picks the sandbox name.
pub const SANDBOX_ENV: &str = "TASKGATE_SANDBOX";

/// Run when there is neither a profile nor a caller command.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// What the caller asked for on one channel.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub username: String,
    /// Empty for a shell request.
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub pty: Option<PtyRequest>,
    pub peer: Option<SocketAddr>,
}

/// Aborts a task when dropped.
pub struct AbortOnDrop(tokio::task::AbortHandle);

impl AbortOnDrop {
    pub fn new<T>(task: &tokio::task::JoinHandle<T>) -> Self {
        Self(task.abort_handle())
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Removes the session from the registry and sweeps old sandboxes, however
/// the session ends.
struct SessionGuard {
    id: String,
    registry: Arc<SessionRegistry>,
    sandboxes: SandboxManager,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.registry.remove(&self.id).is_some() {
            info!(session_id = %self.id, "Session removed");
        }
        let sandboxes = self.sandboxes.clone();
        let sweep = move || {
            let report = sandboxes.evict();
            if !report.removed.is_empty() || !report.failed.is_empty() {
                info!(
                    removed = report.removed.len(),
                    skipped = report.skipped.len(),
                    failed = report.failed.len(),
                    "Sandbox eviction finished"
                );
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(sweep);
            }
            Err(_) => sweep(),
        }
    }
}

/// Entrypoint plus caller command, else entrypoint plus profile command,
/// else the default shell for unprofiled principals.
pub fn command_vector(profile: Option<&TaskProfile>, requested: &[String]) -> Result<Vec<String>, SessionError> {
    let Some(profile) = profile else {
        if requested.is_empty() {
            return Ok(vec![DEFAULT_SHELL.to_string()]);
        }
        return Ok(requested.to_vec());
    };

    let tail = if requested.is_empty() {
        profile.command.as_slice()
    } else {
        requested
    };
    let argv: Vec<String> = profile.entrypoint.iter().chain(tail).cloned().collect();
    if argv.is_empty() {
        return Err(SessionError::NoCommand);
    }
    Ok(argv)
}

struct EnvContext<'a> {
    config: &'a Config,
    request: &'a SessionRequest,
    profile: Option<&'a TaskProfile>,
    identity: &'a Identity,
    session_id: &'a str,
    sandbox: &'a str,
    sandbox_dir: &'a Path,
    auth_sock: Option<&'a Path>,
}

/// Caller variables, then agent variables, then the account, then the env
/// file, then static assignments. Later entries win.
fn session_env(ctx: &EnvContext<'_>) -> Vec<(String, String)> {
    let mut env = EnvBuilder::new();
    for (key, value) in &ctx.request.env {
        env.set(key.as_str(), value.as_str());
    }

    env.set("TASKGATE_VERSION", VERSION)
        .set("TASKGATE_SESSION_ID", ctx.session_id)
        .set("TASKGATE_SANDBOX", ctx.sandbox)
        .set("TASKGATE_SANDBOX_DIR", ctx.sandbox_dir.display().to_string())
        .set("TASKGATE_USER", ctx.request.username.as_str());
    if let Some(profile) = ctx.profile {
        let command = if ctx.request.command.is_empty() {
            &profile.command
        } else {
            &ctx.request.command
        };
        env.set("TASKGATE_PROFILE", profile.name.as_str())
            .set("TASKGATE_SESSION_COMMAND", command.join(" "));
    }
    if ctx.request.pty.is_some() {
        env.set("TASKGATE_PTY", "1");
    }
    if let Some(sock) = ctx.auth_sock {
        env.set("SSH_AUTH_SOCK", sock.display().to_string());
    }

    env.set("USER", ctx.identity.user.as_str())
        .set("LOGNAME", ctx.identity.user.as_str())
        .set("HOME", ctx.identity.home.display().to_string());

    if let Some(file) = &ctx.config.agent.environment_file {
        env.load_file(file);
    }
    for assignment in &ctx.config.agent.environment {
        env.assign(assignment);
    }
    env.into_vars()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "session handler panicked".to_string()
    }
}

/// Runs sessions against the current configuration.
#[derive(Clone)]
pub struct Agent {
    config: Arc<ConfigStore>,
    registry: Arc<SessionRegistry>,
    identities: Arc<dyn IdentityProvider>,
}

impl Agent {
    pub fn new(config: Arc<ConfigStore>, registry: Arc<SessionRegistry>, identities: Arc<dyn IdentityProvider>) -> Self {
        Self {
            config,
            registry,
            identities,
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run one session to completion and return its exit status.
    ///
    /// Setup and execution errors, panics included, are written to the
    /// caller's stderr as `ERROR: <msg>` and yield status 1. Dropping the
    /// returned future kills the command and tears the session down.
    pub async fn run_session<C: AgentConnector>(&self, request: SessionRequest, forwarder: Option<C>, io: SessionIo) -> u32 {
        let output = io.output.clone();
        let agent = self.clone();
        let username = request.username.clone();

        let task = tokio::spawn(async move { agent.execute(request, forwarder, io).await });
        let _abort = AbortOnDrop::new(&task);

        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(SessionError::Aborted(panic_message(e.into_panic()))),
            Err(e) => Err(SessionError::Aborted(e.to_string())),
        };

        match result {
            Ok(outcome) => outcome.exit_status(),
            Err(e) => {
                error!(user = %username, error = %e, "Session failed");
                let message = format!("ERROR: {}\n", e).into_bytes();
                let _ = output.send(SessionOutput::Stderr(message)).await;
                1
            }
        }
    }

    async fn execute<C: AgentConnector>(
        &self,
        request: SessionRequest,
        forwarder: Option<C>,
        io: SessionIo,
    ) -> Result<ExitOutcome, SessionError> {
        let config = self.config.current();
        let profile = config.profile(&request.username).cloned();
        if profile.is_none() && !config.agent.allow_unprofiled_sessions {
            return Err(SessionError::UnknownProfile(request.username.clone()));
        }

        let identity = identity::resolve(self.identities.as_ref(), profile.as_ref(), &request.username)?;
        let argv = command_vector(profile.as_ref(), &request.command)?;

        let session_id = self.registry.next_id();
        let sandbox = request
            .env
            .iter()
            .rev()
            .find(|(key, _)| key == SANDBOX_ENV)
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| session_id.clone());
        validate_sandbox_name(&sandbox)?;

        let span = tracing::info_span!(
            "session",
            session_id = %session_id,
            sandbox = %sandbox,
            profile = profile.as_ref().map(|p| p.name.as_str()).unwrap_or("-"),
        );

        async move {
            let sandboxes = SandboxManager::new(
                config.agent.sandboxes_directory.clone(),
                config.agent.keep_sandboxes,
                self.registry.clone(),
            );

            let running = self.registry.admit(SessionRecord {
                id: session_id.clone(),
                sandbox: sandbox.clone(),
                profile: profile.as_ref().map(|p| p.name.clone()),
                max_sessions: profile.as_ref().map_or(0, |p| p.max_sessions),
                user: identity.user.clone(),
                uid: identity.uid,
                gid: identity.gid,
                created_at: Instant::now(),
            })?;
            let _guard = SessionGuard {
                id: session_id.clone(),
                registry: self.registry.clone(),
                sandboxes: sandboxes.clone(),
            };
            info!(running, user = %request.username, uid = identity.uid, gid = identity.gid, "Session admitted");

            let credentials = self
                .identities
                .is_privileged()
                .then_some((identity.uid, identity.gid));

            let sandbox_dir: PathBuf = {
                let sandboxes = sandboxes.clone();
                let name = sandbox.clone();
                tokio::task::spawn_blocking(move || sandboxes.ensure_sandbox(&name, credentials))
                    .await
                    .map_err(|e| SessionError::Aborted(e.to_string()))??
            };

            let relay = match forwarder {
                Some(connector) => Some(AgentRelay::open(credentials, connector).map_err(SessionError::Forwarding)?),
                None => None,
            };

            let env = session_env(&EnvContext {
                config: &config,
                request: &request,
                profile: profile.as_ref(),
                identity: &identity,
                session_id: &session_id,
                sandbox: &sandbox,
                sandbox_dir: &sandbox_dir,
                auth_sock: relay.as_ref().map(|r| r.socket_path()),
            });

            let timeout = profile
                .as_ref()
                .map(|p| p.timeout)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs);

            let outcome = launcher::launch(
                LaunchRequest {
                    argv,
                    env,
                    cwd: sandbox_dir,
                    credentials,
                    pty: request.pty.clone(),
                    timeout,
                    limits: profile.as_ref().map(|p| p.limits).unwrap_or_default(),
                },
                io,
            )
            .await;
            drop(relay);

            match &outcome {
                Ok(exit) => info!(exit_status = exit.exit_status(), "Session finished"),
                Err(e) => warn!(error = %e, "Session ended with an error"),
            }
            outcome
        }
        .instrument(span)
        .await
    }
}
