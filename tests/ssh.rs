use russh::client;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use russh::{Channel, ChannelMsg};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use taskgate::agent::Agent;
use taskgate::config::{Config, ConfigStore};
use taskgate::identity::{HostIdentity, IdentityProvider};
use taskgate::ssh_server::SshServer;
use taskgate::state::SessionRegistry;
use tokio::net::TcpListener;

struct TrustAnyHost;

impl client::Handler for TrustAnyHost {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn new_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

fn me() -> String {
    HostIdentity.current().unwrap().user
}

/// Start an agent on an ephemeral loopback port that accepts any key.
async fn start_server(root: &Path, profiles: &str) -> SocketAddr {
    let toml = format!(
        "[agent]\nloopback_auth_bypass = true\nsandboxes_directory = {:?}\n{}",
        root.display().to_string(),
        profiles.replace("@ME@", &me()),
    );
    let config = Config::from_toml_str(&toml).unwrap();
    let agent = Agent::new(
        Arc::new(ConfigStore::fixed(config)),
        Arc::new(SessionRegistry::default()),
        Arc::new(HostIdentity),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SshServer::new(agent, new_key());
    tokio::spawn(server.serve(listener));
    addr
}

async fn open_channel(addr: SocketAddr, user: &str) -> (client::Handle<TrustAnyHost>, Channel<client::Msg>) {
    let mut session = client::connect(Arc::new(client::Config::default()), addr, TrustAnyHost)
        .await
        .unwrap();
    let key = PrivateKeyWithHashAlg::new(Arc::new(new_key()), None);
    let auth = session.authenticate_publickey(user, key).await.unwrap();
    assert!(auth.success());
    let channel = session.channel_open_session().await.unwrap();
    (session, channel)
}

#[derive(Debug, Default)]
struct Finished {
    status: Option<u32>,
    stdout: String,
    stderr: String,
}

async fn finish(channel: &mut Channel<client::Msg>) -> Finished {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut status = None;

    let collect = async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(20), collect)
        .await
        .expect("channel did not close");

    Finished {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }
}

#[tokio::test]
async fn exec_delivers_output_and_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), "").await;
    let (_session, mut channel) = open_channel(addr, &me()).await;

    channel
        .exec(true, "/bin/sh -c 'echo out; echo err >&2; exit 3'")
        .await
        .unwrap();
    let done = finish(&mut channel).await;

    assert_eq!(done.status, Some(3));
    assert_eq!(done.stdout, "out\n");
    assert_eq!(done.stderr, "err\n");
}

#[tokio::test]
async fn stdin_is_relayed_until_eof() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), "").await;
    let (_session, mut channel) = open_channel(addr, &me()).await;

    channel.exec(true, "/bin/cat").await.unwrap();
    channel.data(&b"hello over ssh"[..]).await.unwrap();
    channel.eof().await.unwrap();
    let done = finish(&mut channel).await;

    assert_eq!(done.status, Some(0));
    assert_eq!(done.stdout, "hello over ssh");
}

#[tokio::test]
async fn env_request_picks_the_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), "").await;
    let (_session, mut channel) = open_channel(addr, &me()).await;

    channel.set_env(false, "TASKGATE_SANDBOX", "named-box").await.unwrap();
    channel.exec(true, "/bin/pwd").await.unwrap();
    let done = finish(&mut channel).await;

    assert_eq!(done.status, Some(0), "stderr: {}", done.stderr);
    assert!(done.stdout.trim_end().ends_with("/named-box"), "{}", done.stdout);
    assert!(dir.path().join("named-box").is_dir());
}

#[tokio::test]
async fn timeout_is_reported_on_stderr_with_status_one() {
    let dir = tempfile::tempdir().unwrap();
    let profiles = r#"
[profiles.slow]
user = "@ME@"
command = ["/bin/sleep", "5"]
timeout = 1
"#;
    let addr = start_server(dir.path(), profiles).await;
    let (_session, mut channel) = open_channel(addr, "slow").await;

    channel.request_shell(true).await.unwrap();
    let done = finish(&mut channel).await;

    assert_eq!(done.status, Some(1));
    assert!(done.stderr.starts_with("ERROR: "), "{}", done.stderr);
    assert!(done.stderr.contains("timed out"), "{}", done.stderr);
}

#[tokio::test]
async fn pty_follows_window_changes() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), "").await;
    let (_session, mut channel) = open_channel(addr, &me()).await;

    channel
        .request_pty(false, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel
        .exec(true, "/bin/sh -c 'echo $TERM; sleep 1; stty size; exit 4'")
        .await
        .unwrap();
    channel.window_change(100, 40, 0, 0).await.unwrap();
    let done = finish(&mut channel).await;

    assert_eq!(done.status, Some(4));
    assert!(done.stdout.contains("xterm\r\n"), "{:?}", done.stdout);
    assert!(done.stdout.contains("40 100\r\n"), "{:?}", done.stdout);
    assert!(done.stderr.is_empty());
}
