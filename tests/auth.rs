use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::PrivateKey;
use std::net::SocketAddr;
use std::sync::Arc;
use taskgate::auth::Authenticator;
use taskgate::config::{Config, ConfigStore};

fn new_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

fn openssh(key: &PrivateKey) -> String {
    key.public_key().to_openssh().unwrap()
}

fn authenticator(toml: &str) -> Authenticator {
    let config = Config::from_toml_str(toml).unwrap();
    Authenticator::new(Arc::new(ConfigStore::fixed(config)))
}

fn remote() -> Option<SocketAddr> {
    Some("203.0.113.7:50000".parse().unwrap())
}

#[test]
fn merged_sources_accept_listed_keys_only() {
    let dir = tempfile::tempdir().unwrap();
    let (in_file, in_system, inline, stranger) = (new_key(), new_key(), new_key(), new_key());

    let keys_file = dir.path().join("authorized_keys");
    std::fs::write(
        &keys_file,
        format!("# team keys\n\ncommand=\"true\",no-pty {} ops@example\n", openssh(&in_file)),
    )
    .unwrap();
    let system_file = dir.path().join("system_keys");
    std::fs::write(&system_file, format!("{}\n", openssh(&in_system))).unwrap();

    let auth = authenticator(&format!(
        "[agent]\nsystem_authorized_keys_file = {:?}\nauthorized_keys_file = {:?}\nauthorized_keys = [{:?}]\n",
        system_file.display().to_string(),
        keys_file.display().to_string(),
        openssh(&inline),
    ));

    assert!(auth.authenticate(remote(), "anyone", in_file.public_key()));
    assert!(auth.authenticate(remote(), "anyone", in_system.public_key()));
    assert!(auth.authenticate(remote(), "anyone", inline.public_key()));
    assert!(!auth.authenticate(remote(), "anyone", stranger.public_key()));
}

#[test]
fn profile_inline_override_replaces_agent_keys() {
    let (agent_key, deploy_key) = (new_key(), new_key());
    let auth = authenticator(&format!(
        "[agent]\nauthorized_keys = [{:?}]\n[profiles.deploy]\ncommand = [\"true\"]\nauthorized_keys = [{:?}]\n",
        openssh(&agent_key),
        openssh(&deploy_key),
    ));

    assert!(auth.authenticate(remote(), "deploy", deploy_key.public_key()));
    assert!(!auth.authenticate(remote(), "deploy", agent_key.public_key()));
    assert!(auth.authenticate(remote(), "other", agent_key.public_key()));
    assert!(!auth.authenticate(remote(), "other", deploy_key.public_key()));
}

#[test]
fn missing_file_contributes_nothing() {
    let key = new_key();
    let auth = authenticator(&format!(
        "[agent]\nauthorized_keys_file = \"/nonexistent/taskgate/keys\"\nauthorized_keys = [{:?}]\n",
        openssh(&key),
    ));
    assert!(auth.authenticate(remote(), "anyone", key.public_key()));
}

#[test]
fn malformed_line_fails_closed() {
    let key = new_key();
    let auth = authenticator(&format!(
        "[agent]\nauthorized_keys = [\"this is not a key\", {:?}]\n",
        openssh(&key),
    ));
    assert!(!auth.authenticate(remote(), "anyone", key.public_key()));
}

#[test]
fn loopback_bypass() {
    let key = new_key();
    let bypass = authenticator("[agent]\nloopback_auth_bypass = true\n");
    assert!(bypass.authenticate(Some("127.0.0.1:4000".parse().unwrap()), "anyone", key.public_key()));
    assert!(bypass.authenticate(Some("[::1]:4000".parse().unwrap()), "anyone", key.public_key()));
    assert!(!bypass.authenticate(remote(), "anyone", key.public_key()));

    let strict = authenticator("[agent]\n");
    assert!(!strict.authenticate(Some("127.0.0.1:4000".parse().unwrap()), "anyone", key.public_key()));
}

#[test]
fn hot_reload_picks_up_new_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskgate.toml");
    let key = new_key();
    std::fs::write(&path, "[agent]\nhot_reload = true\nsandboxes_directory = \"/tmp/taskgate-test\"\n").unwrap();

    let config = Config::load_file(&path).unwrap();
    let store = Arc::new(ConfigStore::new(
        config,
        Some(Box::new(taskgate::config::FileSource::new(&path))),
    ));
    let auth = Authenticator::new(store);
    assert!(!auth.authenticate(remote(), "anyone", key.public_key()));

    std::fs::write(
        &path,
        format!(
            "[agent]\nhot_reload = true\nsandboxes_directory = \"/tmp/taskgate-test\"\nauthorized_keys = [{:?}]\n",
            openssh(&key)
        ),
    )
    .unwrap();
    assert!(auth.authenticate(remote(), "anyone", key.public_key()));
}

#[tokio::test]
async fn key_files_are_read_off_the_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let keys = dir.path().join("authorized_keys");
    let listed = new_key();
    std::fs::write(&keys, format!("{}\n", openssh(&listed))).unwrap();

    let auth = authenticator(&format!("[agent]\nauthorized_keys_file = {:?}\n", keys.display().to_string()));
    assert!(auth.authenticate_on_blocking_pool(remote(), "anyone", listed.public_key()).await);
    assert!(!auth.authenticate_on_blocking_pool(remote(), "anyone", new_key().public_key()).await);
}
