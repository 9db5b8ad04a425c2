//! Admin HTTP endpoint using Axum.

use crate::state::{SessionRegistry, SessionSummary};
use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Routes served on `admin_addr`.
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Serve the admin endpoint until the listener fails.
pub async fn run_server(addr: SocketAddr, registry: Arc<SessionRegistry>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Admin endpoint listening");
    axum::serve(listener, router(registry)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn list_sessions(State(registry): State<Arc<SessionRegistry>>) -> Json<Vec<SessionSummary>> {
    Json(registry.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CounterIdGenerator, SessionRecord};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn health_and_sessions() {
        let registry = Arc::new(SessionRegistry::new(Box::new(CounterIdGenerator::new("s"))));
        registry
            .admit(SessionRecord {
                id: registry.next_id(),
                sandbox: "box-a".into(),
                profile: Some("deploy".into()),
                max_sessions: 0,
                user: "alice".into(),
                uid: 1000,
                gid: 1000,
                created_at: Instant::now(),
            })
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(registry)).await });

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("OK"));

        let sessions = get(addr, "/sessions").await;
        let body = sessions.split("\r\n\r\n").nth(1).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed[0]["id"], "s000000");
        assert_eq!(parsed[0]["sandbox"], "box-a");
        assert_eq!(parsed[0]["profile"], "deploy");
    }
}
