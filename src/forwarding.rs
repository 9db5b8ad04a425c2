//! Local relay socket for SSH agent forwarding.

use futures_util::future::BoxFuture;
use nix::unistd::{chown, Gid, Uid};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

pub const SOCKET_NAME: &str = "listener.sock";

/// Opens a fresh stream to the caller's agent for each local client.
pub trait AgentConnector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> BoxFuture<'static, io::Result<Self::Stream>>;
}

/// A listening `SSH_AUTH_SOCK` endpoint. Dropping it stops the relay and
/// removes the directory holding the socket.
pub struct AgentRelay {
    dir: Option<TempDir>,
    socket: PathBuf,
    task: JoinHandle<()>,
}

impl AgentRelay {
    /// Bind the relay in a new private directory, owned by `owner` if given.
    /// Must be called inside a tokio runtime.
    pub fn open<C: AgentConnector>(owner: Option<(u32, u32)>, connector: C) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("auth-agent").tempdir()?;
        let socket = dir.path().join(SOCKET_NAME);
        let listener = UnixListener::bind(&socket)?;

        if let Some((uid, gid)) = owner {
            let (uid, gid) = (Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)));
            chown(dir.path(), uid, gid).map_err(io::Error::from)?;
            chown(socket.as_path(), uid, gid).map_err(io::Error::from)?;
        }

        info!(socket = %socket.display(), "Agent forwarding relay listening");
        let task = tokio::spawn(relay(listener, connector));
        Ok(Self {
            dir: Some(dir),
            socket,
            task,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

}

impl Drop for AgentRelay {
    fn drop(&mut self) {
        self.task.abort();
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(dir = %path.display(), error = %e, "Failed to remove agent relay directory");
            }
        }
    }
}

async fn relay<C: AgentConnector>(listener: UnixListener, connector: C) {
    // Dropping the set with this task aborts every live connection.
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut local, _) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Agent relay accept failed");
                        break;
                    }
                };
                let connect = connector.connect();
                conns.spawn(async move {
                    let mut remote = match connect.await {
                        Ok(remote) => remote,
                        Err(e) => {
                            warn!(error = %e, "Failed to open agent channel");
                            return;
                        }
                    };
                    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                        Ok((up, down)) => debug!(up, down, "Agent connection finished"),
                        Err(e) => debug!(error = %e, "Agent connection ended"),
                    }
                });
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
}
