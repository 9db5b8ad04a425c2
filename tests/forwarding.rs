use futures_util::future::BoxFuture;
use std::io;
use taskgate::forwarding::{AgentConnector, AgentRelay};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UnixStream;

/// Stands in for the client's agent: replies "agent:" plus whatever it reads.
struct FakeAgent;

impl AgentConnector for FakeAgent {
    type Stream = DuplexStream;

    fn connect(&self) -> BoxFuture<'static, io::Result<DuplexStream>> {
        Box::pin(async {
            let (ours, mut theirs) = tokio::io::duplex(256);
            tokio::spawn(async move {
                let mut buf = [0u8; 32];
                if let Ok(n) = theirs.read(&mut buf).await {
                    let mut reply = b"agent:".to_vec();
                    reply.extend_from_slice(&buf[..n]);
                    let _ = theirs.write_all(&reply).await;
                }
            });
            Ok(ours)
        })
    }
}

#[tokio::test]
async fn endpoint_and_directory_gone_after_teardown() {
    let relay = AgentRelay::open(None, FakeAgent).unwrap();
    let socket = relay.socket_path().to_path_buf();
    let dir = socket.parent().unwrap().to_path_buf();
    assert!(socket.exists());
    assert!(dir.file_name().unwrap().to_string_lossy().starts_with("auth-agent"));

    let mut client = UnixStream::connect(&socket).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"agent:hi");

    drop(relay);

    assert!(!socket.exists());
    assert!(!dir.exists());
    assert!(UnixStream::connect(&socket).await.is_err());
}
