//! Child process execution with pipe or pty I/O, rlimits and timeouts.

use crate::config::ResourceLimits;
use crate::error::SessionError;
use nix::pty::{openpty, Winsize};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::termios::Termios;
use nix::unistd::setsid;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, Winsize);
nix::ioctl_write_int_bad!(set_controlling_tty, libc::TIOCSCTTY);

/// How long output pumps may keep draining after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const READ_BUF: usize = 8192;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
    pub pix_width: u16,
    pub pix_height: u16,
}

impl WindowSize {
    fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pix_width,
            ws_ypixel: self.pix_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub size: WindowSize,
}

/// Everything needed to start one session's command.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub argv: Vec<String>,
    /// Added on top of the agent's own environment; later entries win.
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// uid/gid to switch to. `None` keeps the agent's identity.
    pub credentials: Option<(u32, u32)>,
    pub pty: Option<PtyRequest>,
    pub timeout: Option<Duration>,
    pub limits: ResourceLimits,
}

/// Bytes produced by the child, tagged by stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// The caller's side of a running session.
pub struct SessionIo {
    /// Caller input. Closing the sender is EOF.
    pub stdin: mpsc::Receiver<Vec<u8>>,
    pub resize: mpsc::Receiver<WindowSize>,
    pub output: mpsc::Sender<SessionOutput>,
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled(signal),
            (None, None) => Self::Exited(1),
        }
    }

    /// The value sent in the `exit-status` channel request.
    pub fn exit_status(&self) -> u32 {
        match *self {
            Self::Exited(code) => code as u32,
            Self::Signaled(signal) => 128 + signal as u32,
        }
    }
}

fn apply_limits(limits: &ResourceLimits) -> io::Result<()> {
    let set = |resource, value: u64| setrlimit(resource, value, value).map_err(io::Error::from);
    if let Some(n) = limits.nofile {
        set(Resource::RLIMIT_NOFILE, n)?;
    }
    if let Some(kb) = limits.fsize_kb {
        set(Resource::RLIMIT_FSIZE, kb.saturating_mul(1024))?;
    }
    if let Some(kb) = limits.mem_kb {
        set(Resource::RLIMIT_AS, kb.saturating_mul(1024))?;
    }
    if let Some(secs) = limits.cpu_seconds {
        set(Resource::RLIMIT_CPU, secs)?;
    }
    Ok(())
}

fn base_command(req: &LaunchRequest) -> Result<Command, SessionError> {
    let (program, args) = req.argv.split_first().ok_or(SessionError::NoCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(req.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&req.cwd)
        .kill_on_drop(true);

    if let Some((uid, gid)) = req.credentials {
        cmd.uid(uid).gid(gid);
    }
    Ok(cmd)
}

/// Run the command to completion, streaming I/O through `io`.
pub async fn launch(req: LaunchRequest, io: SessionIo) -> Result<ExitOutcome, SessionError> {
    info!(
        argv = ?req.argv,
        cwd = %req.cwd.display(),
        pty = req.pty.is_some(),
        timeout = ?req.timeout,
        "Launching command"
    );
    match req.pty.clone() {
        Some(pty) => launch_pty(&req, pty, io).await,
        None => launch_piped(&req, io).await,
    }
}

async fn launch_piped(req: &LaunchRequest, io: SessionIo) -> Result<ExitOutcome, SessionError> {
    let SessionIo { stdin, resize, output } = io;
    drop(resize);

    let mut cmd = base_command(req)?;
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let limits = req.limits;
    if !limits.is_empty() {
        // SAFETY: setrlimit is async-signal-safe and touches no shared state.
        unsafe {
            cmd.pre_exec(move || apply_limits(&limits));
        }
    }

    let mut child = cmd.spawn().map_err(|source| SessionError::Spawn {
        command: req.argv[0].clone(),
        source,
    })?;
    debug!(pid = ?child.id(), "Spawned child");

    let mut pumps = Vec::new();
    if let Some(out) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_output(out, output.clone(), SessionOutput::Stdout)));
    }
    if let Some(err) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_output(err, output, SessionOutput::Stderr)));
    }
    let feeder = child
        .stdin
        .take()
        .map(|child_stdin| tokio::spawn(pump_input(stdin, child_stdin, true)));

    let waited = wait_with_timeout(&mut child, req.timeout).await;
    drain(pumps).await;
    if let Some(feeder) = feeder {
        feeder.abort();
    }
    waited
}

async fn launch_pty(req: &LaunchRequest, pty: PtyRequest, io: SessionIo) -> Result<ExitOutcome, SessionError> {
    let SessionIo {
        stdin,
        mut resize,
        output,
    } = io;

    let winsize = pty.size.to_winsize();
    let pair = openpty(&winsize, None::<&Termios>).map_err(|e| SessionError::Pty(io::Error::from(e)))?;
    let master: OwnedFd = pair.master;

    let mut child = {
        let slave = pair.slave;
        let stdio = || slave.try_clone().map(Stdio::from).map_err(SessionError::Pty);

        let mut cmd = base_command(req)?;
        cmd.env("TERM", &pty.term)
            .stdin(stdio()?)
            .stdout(stdio()?)
            .stderr(stdio()?);
        let limits = req.limits;
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                setsid().map_err(io::Error::from)?;
                set_controlling_tty(0, 0).map_err(io::Error::from)?;
                apply_limits(&limits)
            });
        }
        // The slave must be closed here so reads from the master see EIO once
        // the child is gone.
        cmd.spawn().map_err(|source| SessionError::Spawn {
            command: req.argv[0].clone(),
            source,
        })?
    };
    debug!(pid = ?child.id(), term = %pty.term, "Spawned child on pty");

    let reader = master.try_clone().map_err(SessionError::Pty)?;
    let writer = master.try_clone().map_err(SessionError::Pty)?;
    let reader = tokio::fs::File::from_std(std::fs::File::from(reader));
    let writer = tokio::fs::File::from_std(std::fs::File::from(writer));

    let pumps = vec![tokio::spawn(pump_output(reader, output, SessionOutput::Stdout))];
    let feeder = tokio::spawn(pump_input(stdin, writer, false));
    let resizer = tokio::spawn(async move {
        while let Some(size) = resize.recv().await {
            let ws = size.to_winsize();
            // SAFETY: master is a valid pty fd for the lifetime of this task.
            if let Err(e) = unsafe { set_window_size(master.as_raw_fd(), &ws) } {
                warn!(error = %e, "Failed to resize pty");
            }
        }
    });

    let waited = wait_with_timeout(&mut child, req.timeout).await;
    drain(pumps).await;
    feeder.abort();
    resizer.abort();
    waited
}

async fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> Result<ExitOutcome, SessionError> {
    let Some(limit) = timeout else {
        let status = child.wait().await.map_err(SessionError::Wait)?;
        return Ok(ExitOutcome::from_status(status));
    };

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => Ok(ExitOutcome::from_status(status.map_err(SessionError::Wait)?)),
        Err(_) => {
            warn!(pid = ?child.id(), timeout_secs = limit.as_secs(), "Command timed out, killing it");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill timed out command");
            }
            Err(SessionError::Timeout(limit.as_secs()))
        }
    }
}

async fn drain(pumps: Vec<JoinHandle<()>>) {
    for pump in pumps {
        let abort = pump.abort_handle();
        if tokio::time::timeout(DRAIN_GRACE, pump).await.is_err() {
            debug!("Output still open after exit, abandoning it");
            abort.abort();
        }
    }
}

/// Copy child output to the caller. EIO from a pty master is end of stream.
async fn pump_output<R>(mut src: R, out: mpsc::Sender<SessionOutput>, tag: fn(Vec<u8>) -> SessionOutput)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if out.send(tag(buf[..n].to_vec())).await.is_err() {
                    debug!("Caller went away, dropping output");
                    break;
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => {
                warn!(error = %e, "Error reading command output");
                break;
            }
        }
    }
}

/// Copy caller input to the child. With `close_on_eof` the child's stdin is
/// closed when the caller signals EOF.
async fn pump_input<W>(mut input: mpsc::Receiver<Vec<u8>>, mut dst: W, close_on_eof: bool)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = input.recv().await {
        if let Err(e) = dst.write_all(&chunk).await {
            debug!(error = %e, "Command stopped accepting input");
            return;
        }
        if let Err(e) = dst.flush().await {
            debug!(error = %e, "Command stopped accepting input");
            return;
        }
    }
    if close_on_eof {
        let _ = dst.shutdown().await;
        drop(dst);
    } else {
        // A pty has no half-close; keep the writer until the session ends.
        std::future::pending::<()>().await;
    }
}
