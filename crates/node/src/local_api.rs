//! # Local API Client
//!
//! Minimal HTTP/1.1 client for the overlay daemon's control channel.
//!
//! ```text
//! LocalApiClient ──UnixStream──► tailscaled (--socket <path>)
//!      │
//!      ├─ GET /localapi/v0/status             readiness probe
//!      └─ GET /localapi/v0/whois?addr=ip:port peer identity
//! ```
//!
//! Every call opens a fresh connection, sends `Host: local-tailscaled.sock`
//! and is bounded by the client timeout. Non-2xx responses are errors.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::HOST;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::debug;

use tailgate_common::identity::{IdentityResolver, PeerIdentity, ResolveError};

// ════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// Virtual host the daemon expects on control-channel requests.
pub const LOCAL_API_HOST: &str = "local-tailscaled.sock";

pub const STATUS_PATH: &str = "/localapi/v0/status";
pub const WHOIS_PATH: &str = "/localapi/v0/whois";

/// Error bodies are truncated to this many characters.
const MAX_ERROR_BODY: usize = 256;

// ════════════════════════════════════════════════════════════════════════════
// ERROR TYPE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum LocalApiError {
    #[error("cannot connect to control socket {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control channel http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid control channel request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to decode {endpoint} response: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{endpoint} timed out after {timeout:?}")]
    Timeout {
        endpoint: &'static str,
        timeout: Duration,
    },
}

// ════════════════════════════════════════════════════════════════════════════
// RESPONSE TYPES
// ════════════════════════════════════════════════════════════════════════════

/// Subset of `/localapi/v0/status` this crate looks at.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusSummary {
    #[serde(rename = "BackendState", default)]
    pub backend_state: Option<String>,
}

/// Subset of `/localapi/v0/whois`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhoIsResponse {
    #[serde(rename = "Node", default)]
    pub node: Option<WhoIsNode>,
    #[serde(rename = "UserProfile", default)]
    pub user_profile: Option<UserProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhoIsNode {
    #[serde(rename = "Name", default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfile {
    #[serde(rename = "LoginName", default)]
    pub login_name: String,
    #[serde(rename = "DisplayName", default)]
    pub display_name: String,
}

// ════════════════════════════════════════════════════════════════════════════
// CLIENT
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct LocalApiClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl LocalApiClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    /// Fetches daemon status. Any 2xx answer means the daemon is serving;
    /// the body is decoded leniently.
    pub async fn status(&self) -> Result<StatusSummary, LocalApiError> {
        let body = self.get("status", STATUS_PATH.to_string()).await?;
        Ok(serde_json::from_slice(&body).unwrap_or_default())
    }

    /// Asks which node and user own the overlay address `addr`.
    pub async fn whois(&self, addr: SocketAddr) -> Result<WhoIsResponse, LocalApiError> {
        let encoded: String =
            url::form_urlencoded::byte_serialize(addr.to_string().as_bytes()).collect();
        let body = self
            .get("whois", format!("{}?addr={}", WHOIS_PATH, encoded))
            .await?;
        serde_json::from_slice(&body).map_err(|source| LocalApiError::Decode {
            endpoint: "whois",
            source,
        })
    }

    async fn get(&self, endpoint: &'static str, path_and_query: String) -> Result<Bytes, LocalApiError> {
        tokio::time::timeout(self.timeout, self.send(endpoint, path_and_query))
            .await
            .map_err(|_| LocalApiError::Timeout {
                endpoint,
                timeout: self.timeout,
            })?
    }

    async fn send(&self, endpoint: &'static str, path_and_query: String) -> Result<Bytes, LocalApiError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| LocalApiError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "control channel connection closed");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(path_and_query)
            .header(HOST, LOCAL_API_HOST)
            .body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            let text: String = text.trim().chars().take(MAX_ERROR_BODY).collect();
            return Err(LocalApiError::Status {
                endpoint,
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(body)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// IDENTITY RESOLVER
// ════════════════════════════════════════════════════════════════════════════

/// [`IdentityResolver`] backed by the daemon's whois endpoint.
#[derive(Debug, Clone)]
pub struct LocalApiResolver {
    client: LocalApiClient,
}

impl LocalApiResolver {
    pub fn new(client: LocalApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentityResolver for LocalApiResolver {
    async fn resolve(&self, peer_addr: SocketAddr) -> Result<PeerIdentity, ResolveError> {
        let whois = self
            .client
            .whois(peer_addr)
            .await
            .map_err(ResolveError::control_channel)?;
        identity_from_whois(peer_addr, whois)
    }
}

fn identity_from_whois(peer_addr: SocketAddr, whois: WhoIsResponse) -> Result<PeerIdentity, ResolveError> {
    let profile = whois
        .user_profile
        .ok_or(ResolveError::NoUserProfile(peer_addr))?;

    let login_name = profile.login_name.trim().to_string();
    if login_name.is_empty() {
        return Err(ResolveError::EmptyLogin(peer_addr));
    }

    let display_name = Some(profile.display_name.trim().to_string()).filter(|s| !s.is_empty());
    let node_name = whois
        .node
        .map(|n| n.name.trim_end_matches('.').to_string())
        .filter(|s| !s.is_empty());

    Ok(PeerIdentity {
        login_name,
        display_name,
        node_name,
        peer_addr,
    })
}
