//! Balancer registration client.
//!
//! When a balancer is configured the server announces itself with
//! `POST {host}/nodes`, carrying its version, listen port, weight and layer
//! summaries. The balancer answers `201 Created` with a heartbeat token and
//! a check interval; it then probes the node's health endpoint with that
//! token. The node forwards each probe through
//! [`crate::server::TileServer::handle_heartbeat`], and when no valid probe
//! arrives within three check intervals the registration is considered lost
//! and the client re-registers from scratch.
//!
//! Registration retries with bounded exponential backoff and every attempt
//! is interruptible by shutdown. Deregistration on close is best effort.

use crate::layer::LayerOptions;
use crate::server::{TileServer, VERSION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Balancer connection settings.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Balancer base URL, e.g. `http://10.0.0.5:8081`
    pub host: String,
    /// Relative share of traffic this node asks for
    pub node_weight: u32,
    /// Per-request timeout for registration calls
    pub request_timeout: Duration,
    /// First retry delay after a failed registration
    pub initial_backoff: Duration,
    /// Retry delay ceiling
    pub max_backoff: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:8081".to_string(),
            node_weight: 1,
            request_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Registration failures, all retried by the client loop.
#[derive(Debug, Error)]
enum RegisterError {
    #[error("balancer request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("balancer rejected registration with status {0}")]
    UnexpectedStatus(StatusCode),

    #[error("balancer grant is unusable: {0}")]
    InvalidGrant(&'static str),
}

/// Layer summary included in the registration body.
#[derive(Debug, Clone, Serialize)]
pub struct LayerDescriptor {
    /// Layer name
    pub name: String,
    /// Admission policy
    pub options: LayerOptions,
    /// Registered file variants
    pub routes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct NodeAnnouncement {
    id: String,
    version: &'static str,
    listen_port: u16,
    node_weight: u32,
    layers: Vec<LayerDescriptor>,
}

#[derive(Debug, Deserialize)]
struct RegistrationGrant {
    token: String,
    /// Heartbeat interval in milliseconds
    check_interval: u64,
}

struct BalancerShared {
    config: BalancerConfig,
    node_id: String,
    http: reqwest::Client,
    /// Token of the current registration; `None` between registrations
    token: Mutex<Option<String>>,
    heartbeat: Notify,
    cancel: CancellationToken,
}

impl BalancerShared {
    /// Validates a heartbeat token and, on match, re-arms the watch window.
    fn handle_heartbeat(&self, token: &str) -> bool {
        let current = self.token.lock().unwrap_or_else(|e| e.into_inner());
        match current.as_deref() {
            Some(expected) if expected == token => {
                self.heartbeat.notify_one();
                true
            }
            _ => {
                debug!("ignoring heartbeat with stale or unknown token");
                false
            }
        }
    }
}

/// Handle to the background registration task.
pub struct BalancerClient {
    shared: Arc<BalancerShared>,
    task: tokio::task::JoinHandle<()>,
}

impl BalancerClient {
    /// Starts the registration loop for an initialized server.
    pub fn spawn(server: TileServer, config: BalancerConfig) -> Self {
        let shared = Arc::new(BalancerShared {
            node_id: Uuid::new_v4().to_string(),
            http: reqwest::Client::new(),
            token: Mutex::new(None),
            heartbeat: Notify::new(),
            cancel: CancellationToken::new(),
            config,
        });
        let task = tokio::spawn(run(server, Arc::clone(&shared)));
        Self { shared, task }
    }

    /// Forwards a heartbeat probe. True when the token matched the current
    /// registration.
    pub fn handle_heartbeat(&self, token: &str) -> bool {
        self.shared.handle_heartbeat(token)
    }

    /// Stops the loop and deregisters, best effort.
    pub async fn shutdown(self) {
        self.shared.cancel.cancel();
        let _ = self.task.await;

        let registered = self
            .shared
            .token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if !registered {
            return;
        }
        let url = format!("{}/nodes/{}", self.shared.config.host, self.shared.node_id);
        let result = self
            .shared
            .http
            .delete(&url)
            .timeout(self.shared.config.request_timeout)
            .send()
            .await;
        match result {
            Ok(_) => debug!(node_id = %self.shared.node_id, "deregistered from balancer"),
            Err(err) => debug!(error = %err, "balancer deregistration failed; ignoring"),
        }
    }
}

impl std::fmt::Debug for BalancerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancerClient")
            .field("node_id", &self.shared.node_id)
            .field("host", &self.shared.config.host)
            .finish()
    }
}

/// Register, watch heartbeats, re-register on silence. Runs until shutdown.
async fn run(server: TileServer, shared: Arc<BalancerShared>) {
    loop {
        let grant = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            grant = register_with_backoff(&server, &shared) => grant,
        };

        *shared.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(grant.token);
        info!(
            host = %shared.config.host,
            check_interval_ms = grant.check_interval,
            "registered with balancer"
        );

        // The registration is considered lost after three silent intervals.
        let window = Duration::from_millis(grant.check_interval.saturating_mul(3).max(1));
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => return,
                _ = shared.heartbeat.notified() => continue,
                _ = tokio::time::sleep(window) => {
                    warn!(
                        window_ms = window.as_millis() as u64,
                        "no balancer heartbeat within window; re-registering"
                    );
                    break;
                }
            }
        }

        *shared.token.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Retries registration until it succeeds, doubling the delay up to the
/// configured ceiling.
async fn register_with_backoff(
    server: &TileServer,
    shared: &Arc<BalancerShared>,
) -> RegistrationGrant {
    let mut backoff = shared.config.initial_backoff;
    loop {
        match register_once(server, shared).await {
            Ok(grant) => return grant,
            Err(err) => {
                warn!(
                    host = %shared.config.host,
                    error = %err,
                    retry_in_ms = backoff.as_millis() as u64,
                    "balancer registration failed"
                );
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, shared.config.max_backoff);
            }
        }
    }
}

async fn register_once(
    server: &TileServer,
    shared: &Arc<BalancerShared>,
) -> Result<RegistrationGrant, RegisterError> {
    let body = NodeAnnouncement {
        id: shared.node_id.clone(),
        version: VERSION,
        listen_port: server.port(),
        node_weight: shared.config.node_weight,
        layers: server.layer_descriptors(),
    };
    let response = shared
        .http
        .post(format!("{}/nodes", shared.config.host))
        .timeout(shared.config.request_timeout)
        .json(&body)
        .send()
        .await?;

    if response.status() != StatusCode::CREATED {
        return Err(RegisterError::UnexpectedStatus(response.status()));
    }
    let grant: RegistrationGrant = response.json().await?;
    if grant.token.is_empty() {
        return Err(RegisterError::InvalidGrant("empty token"));
    }
    if grant.check_interval == 0 {
        return Err(RegisterError::InvalidGrant("zero check interval"));
    }
    Ok(grant)
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with_token(token: Option<&str>) -> BalancerShared {
        BalancerShared {
            config: BalancerConfig::default(),
            node_id: "node-1".to_string(),
            http: reqwest::Client::new(),
            token: Mutex::new(token.map(str::to_string)),
            heartbeat: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let max = Duration::from_secs(60);
        let mut backoff = Duration::from_secs(1);
        let mut observed = Vec::new();
        for _ in 0..8 {
            observed.push(backoff.as_secs());
            backoff = next_backoff(backoff, max);
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_heartbeat_token_match() {
        let shared = shared_with_token(Some("secret"));
        assert!(shared.handle_heartbeat("secret"));
        assert!(!shared.handle_heartbeat("stale"));
    }

    #[test]
    fn test_heartbeat_without_registration() {
        let shared = shared_with_token(None);
        assert!(!shared.handle_heartbeat("anything"));
    }

    #[test]
    fn test_announcement_wire_shape() {
        let body = NodeAnnouncement {
            id: "node-1".to_string(),
            version: "1.2.3",
            listen_port: 8080,
            node_weight: 5,
            layers: vec![LayerDescriptor {
                name: "basemap".to_string(),
                options: LayerOptions::default(),
                routes: vec!["tile.png".to_string()],
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["id"], "node-1");
        assert_eq!(json["listen_port"], 8080);
        assert_eq!(json["node_weight"], 5);
        assert_eq!(json["layers"][0]["name"], "basemap");
        assert_eq!(json["layers"][0]["routes"][0], "tile.png");
    }

    use crate::server::{ServerOptions, TileServer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal balancer double: answers every `POST /nodes` with a 201
    /// grant (counting them) and everything else with a 204.
    async fn spawn_balancer_stub(
        check_interval: u64,
        registrations: Arc<AtomicUsize>,
    ) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let registrations = Arc::clone(&registrations);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let response = if request.starts_with("POST") {
                        registrations.fetch_add(1, Ordering::SeqCst);
                        let body = format!(
                            r#"{{"token":"tok-1","check_interval":{check_interval}}}"#
                        );
                        format!(
                            "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\n\
                             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        "HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\
                         Connection: close\r\n\r\n"
                            .to_string()
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn client_for(addr: std::net::SocketAddr) -> BalancerClient {
        let server = TileServer::new(ServerOptions::default());
        BalancerClient::spawn(
            server,
            BalancerConfig {
                host: format!("http://{addr}"),
                ..BalancerConfig::default()
            },
        )
    }

    async fn wait_for_token(client: &BalancerClient) {
        for _ in 0..200 {
            if client.handle_heartbeat("tok-1") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client never accepted the heartbeat token");
    }

    #[tokio::test]
    async fn test_registers_against_local_balancer() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let addr = spawn_balancer_stub(60_000, Arc::clone(&registrations)).await;
        let client = client_for(addr);

        wait_for_token(&client).await;
        assert_eq!(registrations.load(Ordering::SeqCst), 1);
        assert!(!client.handle_heartbeat("wrong-token"));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_silence_triggers_one_reregistration() {
        let registrations = Arc::new(AtomicUsize::new(0));
        // 50ms interval, so the watch window is 150ms
        let addr = spawn_balancer_stub(50, Arc::clone(&registrations)).await;
        let client = client_for(addr);

        wait_for_token(&client).await;
        assert_eq!(registrations.load(Ordering::SeqCst), 1);

        // Heartbeats inside the window hold the registration
        for _ in 0..8 {
            assert!(client.handle_heartbeat("tok-1"));
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(registrations.load(Ordering::SeqCst), 1);

        // Going silent for longer than the window forces one re-registration
        let mut reregistered = false;
        for _ in 0..200 {
            if registrations.load(Ordering::SeqCst) == 2 {
                reregistered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reregistered, "expected a re-registration after heartbeat silence");

        // Resumed heartbeats hold the new registration; no further attempts
        wait_for_token(&client).await;
        for _ in 0..8 {
            client.handle_heartbeat("tok-1");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(registrations.load(Ordering::SeqCst), 2);

        client.shutdown().await;
    }

    #[test]
    fn test_grant_parses_from_json() {
        let grant: RegistrationGrant =
            serde_json::from_str(r#"{"token":"abc","check_interval":5000}"#).unwrap();
        assert_eq!(grant.token, "abc");
        assert_eq!(grant.check_interval, 5000);
    }
}
