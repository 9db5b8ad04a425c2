//! SSH transport: public-key auth, session channel requests and output
//! pumping, on top of russh.

use crate::agent::{AbortOnDrop, Agent, SessionRequest};
use crate::auth::Authenticator;
use crate::forwarding::AgentConnector;
use crate::launcher::{PtyRequest, SessionIo, SessionOutput, WindowSize};
use futures_util::future::BoxFuture;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, ChannelStream, CryptoVec};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

/// Channel ids for stderr in `extended_data`.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Opens `auth-agent@openssh.com` channels back to the client.
pub struct SshAgentConnector {
    handle: Handle,
}

impl AgentConnector for SshAgentConnector {
    type Stream = ChannelStream<Msg>;

    fn connect(&self) -> BoxFuture<'static, io::Result<Self::Stream>> {
        let handle = self.handle.clone();
        Box::pin(async move {
            let channel = handle.channel_open_agent().await.map_err(io::Error::other)?;
            Ok(channel.into_stream())
        })
    }
}

/// Requests collected on a session channel before it starts running.
#[derive(Default)]
struct ChannelState {
    env: Vec<(String, String)>,
    pty: Option<PtyRequest>,
    forward_agent: bool,
    stdin: Option<mpsc::Sender<Vec<u8>>>,
    resize: Option<mpsc::Sender<WindowSize>>,
    task: Option<AbortOnDrop>,
}

/// Per-connection handler.
pub struct Connection {
    id: uuid::Uuid,
    peer: Option<SocketAddr>,
    agent: Agent,
    authenticator: Authenticator,
    username: Option<String>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl Connection {
    pub fn new(agent: Agent, authenticator: Authenticator, peer: Option<SocketAddr>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            peer,
            agent,
            authenticator,
            username: None,
            channels: HashMap::new(),
        }
    }

    fn start(&mut self, channel_id: ChannelId, command: Vec<String>, session: &mut Session) {
        let Some(username) = self.username.clone() else {
            warn!(conn = %self.id, "Session request before authentication");
            let _ = session.channel_failure(channel_id);
            return;
        };
        let state = self.channels.entry(channel_id).or_default();
        if state.task.is_some() {
            warn!(conn = %self.id, ?channel_id, "Channel already running a command");
            let _ = session.channel_failure(channel_id);
            return;
        }

        let (stdin_tx, stdin) = mpsc::channel(64);
        let (resize_tx, resize) = mpsc::channel(8);
        let (output, output_rx) = mpsc::channel(64);
        state.stdin = Some(stdin_tx);
        state.resize = Some(resize_tx);

        let handle = session.handle();
        let forwarder = state.forward_agent.then(|| SshAgentConnector {
            handle: handle.clone(),
        });
        let request = SessionRequest {
            username,
            command,
            env: state.env.clone(),
            pty: state.pty.clone(),
            peer: self.peer,
        };
        let agent = self.agent.clone();
        let span = tracing::info_span!("channel", conn = %self.id, channel = ?channel_id);

        let task = tokio::spawn(
            async move {
                let pump = tokio::spawn(pump_to_channel(handle.clone(), channel_id, output_rx));
                let status = agent
                    .run_session(request, forwarder, SessionIo { stdin, resize, output })
                    .await;
                if let Err(e) = pump.await {
                    debug!(error = %e, "Output pump ended abnormally");
                }
                let _ = handle.exit_status_request(channel_id, status).await;
                let _ = handle.eof(channel_id).await;
                let _ = handle.close(channel_id).await;
                debug!(exit_status = status, "Channel finished");
            }
            .instrument(span),
        );
        state.task = Some(AbortOnDrop::new(&task));
        let _ = session.channel_success(channel_id);
    }
}

async fn pump_to_channel(handle: Handle, channel_id: ChannelId, mut output: mpsc::Receiver<SessionOutput>) {
    while let Some(chunk) = output.recv().await {
        let sent = match chunk {
            SessionOutput::Stdout(data) => handle.data(channel_id, CryptoVec::from_slice(&data)).await,
            SessionOutput::Stderr(data) => {
                handle
                    .extended_data(channel_id, SSH_EXTENDED_DATA_STDERR, CryptoVec::from_slice(&data))
                    .await
            }
        };
        if sent.is_err() {
            debug!("Channel closed while sending output");
            break;
        }
    }
}

impl Handler for Connection {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let accepted = self
            .authenticator
            .authenticate_on_blocking_pool(self.peer, user, public_key)
            .await;
        if accepted {
            info!(conn = %self.id, peer = ?self.peer, user, "Authenticated");
            self.username = Some(user.to_string());
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
        debug!(conn = %self.id, channel = ?channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(conn = %self.id, term, cols = col_width, rows = row_height, "PTY request");
        let state = self.channels.entry(channel_id).or_default();
        state.pty = Some(PtyRequest {
            term: term.to_string(),
            size: window_size(col_width, row_height, pix_width, pix_height),
        });
        let _ = session.channel_success(channel_id);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(conn = %self.id, name = variable_name, "Env request");
        self.channels
            .entry(channel_id)
            .or_default()
            .env
            .push((variable_name.to_string(), variable_value.to_string()));
        Ok(())
    }

    async fn agent_request(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<bool, Self::Error> {
        debug!(conn = %self.id, "Agent forwarding requested");
        self.channels.entry(channel_id).or_default().forward_agent = true;
        Ok(true)
    }

    async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        self.start(channel_id, Vec::new(), session);
        Ok(())
    }

    async fn exec_request(&mut self, channel_id: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let line = String::from_utf8_lossy(data);
        debug!(conn = %self.id, command = %line, "Exec request");
        match shlex::split(&line) {
            Some(command) => self.start(channel_id, command, session),
            None => {
                warn!(conn = %self.id, command = %line, "Cannot parse exec command");
                let _ = session.channel_failure(channel_id);
            }
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = window_size(col_width, row_height, pix_width, pix_height);
        if let Some(state) = self.channels.get_mut(&channel_id) {
            if let Some(pty) = state.pty.as_mut() {
                pty.size = size;
            }
            if let Some(resize) = &state.resize {
                let _ = resize.try_send(size);
            }
        }
        Ok(())
    }

    async fn data(&mut self, channel_id: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        let stdin = self
            .channels
            .get(&channel_id)
            .and_then(|state| state.stdin.clone());
        if let Some(stdin) = stdin {
            if stdin.send(data.to_vec()).await.is_err() {
                debug!(conn = %self.id, "Command no longer reads input");
            }
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        debug!(conn = %self.id, channel = ?channel_id, "Channel closed");
        self.channels.remove(&channel_id);
        Ok(())
    }
}

fn window_size(cols: u32, rows: u32, pix_width: u32, pix_height: u32) -> WindowSize {
    let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
    WindowSize {
        cols: clamp(cols),
        rows: clamp(rows),
        pix_width: clamp(pix_width),
        pix_height: clamp(pix_height),
    }
}

/// The SSH listener and what every connection shares.
pub struct SshServer {
    config: Arc<russh::server::Config>,
    agent: Agent,
    authenticator: Authenticator,
}

impl SshServer {
    pub fn new(agent: Agent, host_key: PrivateKey) -> Self {
        let authenticator = Authenticator::new(agent.config().clone());
        let config = russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key],
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            agent,
            authenticator,
        }
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        info!(addr = ?listener.local_addr().ok(), "SSH server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let handler = Connection::new(self.agent.clone(), self.authenticator.clone(), Some(peer));
            let config = self.config.clone();
            debug!(peer = %peer, conn = %handler.id, "Accepted connection");

            tokio::spawn(async move {
                match russh::server::run_stream(config, stream, handler).await {
                    Ok(session) => {
                        if let Err(e) = session.await {
                            debug!(peer = %peer, error = %e, "SSH session ended with error");
                        }
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "SSH handshake failed"),
                }
            });
        }
    }
}
