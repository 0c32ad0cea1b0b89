//! Loopback HTTP stubs standing in for the Wings daemon and S3 endpoints.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::Router;
use everest_common::{DaemonNode, ServerRef};
use uuid::Uuid;

use crate::store::BackupStore;

pub const DAEMON_TOKEN: &str = "daemon-token";

#[derive(Debug, Clone)]
pub struct Hit {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct StubResponse {
    status: u16,
    delay: Duration,
}

impl StubResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            delay: Duration::ZERO,
        }
    }

    /// Record the hit immediately, answer after `delay`.
    pub fn delayed(status: u16, delay: Duration) -> Self {
        Self { status, delay }
    }
}

pub struct Stub {
    addr: SocketAddr,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl Stub {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }

    /// A server whose node points at this stub.
    pub fn server_ref(&self) -> ServerRef {
        ServerRef {
            id: 1,
            uuid: Uuid::new_v4(),
            node: DaemonNode {
                id: 1,
                scheme: "http".to_string(),
                fqdn: "127.0.0.1".to_string(),
                daemon_listen: self.port(),
                daemon_token: DAEMON_TOKEN.to_string(),
            },
        }
    }
}

/// Serve every request with the same status and record what was asked.
pub async fn spawn_stub(response: StubResponse) -> Stub {
    let hits = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&hits);
    let status = StatusCode::from_u16(response.status).unwrap();
    let delay = response.delay;

    let app = Router::new().fallback(move |req: Request| {
        let recorded = Arc::clone(&recorded);
        async move {
            recorded.lock().unwrap().push(Hit {
                method: req.method().to_string(),
                path: req.uri().path().to_string(),
                authorization: req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string()),
            });
            tokio::time::sleep(delay).await;
            status
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Stub { addr, hits }
}

/// A loopback port nothing is listening on.
pub async fn unused_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A server on a node nothing is listening on.
pub async fn unreachable_node() -> ServerRef {
    let port = unused_port().await;

    ServerRef {
        id: 1,
        uuid: Uuid::new_v4(),
        node: DaemonNode {
            id: 1,
            scheme: "http".to_string(),
            fqdn: "127.0.0.1".to_string(),
            daemon_listen: port,
            daemon_token: DAEMON_TOKEN.to_string(),
        },
    }
}

/// Temporary store with one node (pointing at `daemon_port`) and one server.
/// Returns the store, the server's row id and its uuid.
pub async fn seeded_store(daemon_port: u16) -> (BackupStore, i64, Uuid) {
    let store = BackupStore::open_temporary();
    let node = store
        .insert_node("http", "127.0.0.1", daemon_port, DAEMON_TOKEN)
        .await;
    let server_uuid = Uuid::new_v4();
    let server = store.insert_server(node, server_uuid).await;
    (store, server, server_uuid)
}
