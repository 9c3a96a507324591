//! # Authenticating Proxy
//!
//! Identity-injecting reverse proxy in front of the protected application.
//!
//! ## Request Flow
//! ```text
//! overlay peer ──► fallback handler
//!                      │
//!                      ├─ resolve(peer_addr) ──► IdentityResolver
//!                      │        │
//!                      │        └─ Err ──► 500, nothing forwarded
//!                      │
//!                      ├─ rewrite headers + uri
//!                      │
//!                      └─ forward ──► backend ──► response (status/body as-is)
//! ```
//!
//! ## Header Contract
//! - `X-Forwarded-Host`: original `Host` of the request (appended)
//! - `X-Origin-Host`: backend authority (appended)
//! - `X-Forwarded-For`: client IP (appended to any existing chain)
//! - `X-Tailscale-User`: resolved login, exactly one value; client-supplied
//!   values are dropped first
//!
//! Hop-by-hop headers are stripped in both directions. A request carrying
//! `Connection: upgrade` keeps its `Upgrade` header; when the backend answers
//! `101` with the same protocol, the two connections are spliced together.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::uri::{Authority, PathAndQuery, Scheme, Uri};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tracing::{debug, warn};

use tailgate_common::identity::{IdentityResolver, ResolveError};

// ════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

pub const USER_HEADER: HeaderName = HeaderName::from_static("x-tailscale-user");
pub const FORWARDED_HOST_HEADER: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const ORIGIN_HOST_HEADER: HeaderName = HeaderName::from_static("x-origin-host");
pub const FORWARDED_FOR_HEADER: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Body of the 500 returned when the control-channel lookup fails.
pub const LOOKUP_FAILED_MESSAGE: &str = "Your Tailscale works, but we failed to look you up.";

/// Body of the 500 returned when the lookup yields no usable login.
pub const UNIDENTIFIED_MESSAGE: &str = "failed to identify remote user";

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
#[error("invalid backend url {url:?}: {reason}")]
pub struct UpstreamError {
    pub url: String,
    pub reason: String,
}

/// Request-tier failure. Converted into a response; the listener keeps
/// serving.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The control-channel lookup failed.
    #[error(transparent)]
    Resolve(ResolveError),

    /// The lookup returned no profile or an empty login name.
    #[error("no login name for {0}")]
    EmptyLogin(SocketAddr),

    /// The backend could not be reached or broke the connection.
    #[error("backend request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// The backend switched protocols without being asked to, or to a
    /// different protocol than the one requested.
    #[error("backend switched to {offered:?} when {requested:?} was requested")]
    UpgradeMismatch {
        requested: Option<String>,
        offered: Option<String>,
    },

    /// The backend uri could not be built for this request.
    #[error("failed to rewrite request uri: {0}")]
    Rewrite(#[from] axum::http::Error),
}

impl From<ResolveError> for ProxyError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::EmptyLogin(addr) | ResolveError::NoUserProfile(addr) => {
                ProxyError::EmptyLogin(addr)
            }
            other => ProxyError::Resolve(other),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ProxyError::Resolve(_) => (StatusCode::INTERNAL_SERVER_ERROR, LOOKUP_FAILED_MESSAGE),
            ProxyError::EmptyLogin(_) => (StatusCode::INTERNAL_SERVER_ERROR, UNIDENTIFIED_MESSAGE),
            ProxyError::Upstream(_) | ProxyError::UpgradeMismatch { .. } => {
                (StatusCode::BAD_GATEWAY, "bad gateway")
            }
            ProxyError::Rewrite(_) => (StatusCode::INTERNAL_SERVER_ERROR, "bad request target"),
        };
        (status, body).into_response()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UPSTREAM
// ════════════════════════════════════════════════════════════════════════════

/// The fixed backend every authenticated request is forwarded to.
#[derive(Debug, Clone)]
pub struct Upstream {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
}

impl Upstream {
    /// Parses an absolute `http://host[:port][/base]` url.
    pub fn parse(raw: &str) -> Result<Self, UpstreamError> {
        let invalid = |reason: &str| UpstreamError {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = raw.parse().map_err(|_| invalid("not a uri"))?;
        let scheme = uri.scheme().cloned().ok_or_else(|| invalid("missing scheme"))?;
        if scheme != Scheme::HTTP {
            return Err(invalid("only http:// backends are supported"));
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("missing host"))?;

        let base_path = match uri.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };

        Ok(Self {
            scheme,
            authority,
            base_path,
            base_query: uri.query().map(str::to_string),
        })
    }

    /// `host:port` of the backend, as sent in `X-Origin-Host`.
    pub fn authority(&self) -> &str {
        self.authority.as_str()
    }

    /// Maps an incoming request uri onto the backend, keeping path and query.
    pub fn target_uri(&self, incoming: &Uri) -> Result<Uri, axum::http::Error> {
        let path = join_paths(&self.base_path, incoming.path());
        let query = match (self.base_query.as_deref(), incoming.query()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{}&{}", a, b)),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
            _ => None,
        };
        let path_and_query = match query {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        };

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(PathAndQuery::try_from(path_and_query)?)
            .build()
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// STATE
// ════════════════════════════════════════════════════════════════════════════

pub type HttpClient = Client<HttpConnector, Body>;

/// Shared state of the proxy router.
#[derive(Clone)]
pub struct ProxyState {
    resolver: Arc<dyn IdentityResolver>,
    upstream: Arc<Upstream>,
    client: HttpClient,
}

impl ProxyState {
    pub fn new(resolver: Arc<dyn IdentityResolver>, upstream: Upstream) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            resolver,
            upstream: Arc::new(upstream),
            client,
        }
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }
}

/// Router with a single catch-all route.
///
/// Must be served with `into_make_service_with_connect_info::<SocketAddr>()`
/// so the handler sees the peer address.
pub fn router(state: ProxyState) -> Router {
    Router::new().fallback(forward).with_state(state)
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLER
// ════════════════════════════════════════════════════════════════════════════

async fn forward(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request,
) -> Result<Response, ProxyError> {
    let identity = match state.resolver.resolve(peer).await {
        Ok(who) if !who.login_name.is_empty() => who,
        Ok(_) => {
            warn!(peer = %peer, "identity lookup returned an empty login");
            return Err(ProxyError::EmptyLogin(peer));
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "identity lookup failed");
            return Err(e.into());
        }
    };

    let upgrade = requested_upgrade(req.headers());
    let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();

    let original_host = parts
        .headers
        .get(header::HOST)
        .cloned()
        .or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    let target = state.upstream.target_uri(&parts.uri)?;
    debug!(
        user = %identity.login_name,
        method = %parts.method,
        path = %parts.uri.path(),
        "forwarding request"
    );

    let headers = &mut parts.headers;
    strip_hop_by_hop(headers);
    if let Some(protocol) = upgrade.clone() {
        restore_upgrade(headers, protocol);
    }
    if let Some(host) = original_host {
        headers.append(FORWARDED_HOST_HEADER, host);
    }
    if let Ok(origin) = HeaderValue::from_str(state.upstream.authority()) {
        headers.append(ORIGIN_HOST_HEADER, origin);
    }
    append_forwarded_for(headers, peer);
    set_user_header(headers, &identity.login_name)?;

    parts.uri = target;
    let upstream_req = Request::from_parts(parts, body);

    let response = match state.client.request(upstream_req).await {
        Ok(r) => r,
        Err(e) => {
            warn!(upstream = %state.upstream.authority(), error = %e, "backend request failed");
            return Err(e.into());
        }
    };

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        return switch_protocols(response, upgrade, client_upgrade, peer);
    }

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Body::new(body)))
}

// ────────────────────────────────────────────────────────────────────────────
// Protocol upgrades
// ────────────────────────────────────────────────────────────────────────────

/// Accepts the backend's `101` if it matches what the client asked for and
/// splices the two upgraded connections in a background task.
fn switch_protocols(
    mut response: hyper::Response<Incoming>,
    requested: Option<HeaderValue>,
    client: Option<OnUpgrade>,
    peer: SocketAddr,
) -> Result<Response, ProxyError> {
    let offered = response.headers().get(header::UPGRADE).cloned();
    let agreed = match (&requested, &offered) {
        (Some(r), Some(o)) => r.as_bytes().eq_ignore_ascii_case(o.as_bytes()),
        _ => false,
    };
    let (Some(protocol), Some(client), true) = (requested.clone(), client, agreed) else {
        let text = |v: Option<HeaderValue>| v.and_then(|v| v.to_str().ok().map(str::to_string));
        let err = ProxyError::UpgradeMismatch {
            requested: text(requested),
            offered: text(offered),
        };
        warn!(peer = %peer, error = %err, "refusing protocol switch");
        return Err(err);
    };

    let backend = hyper::upgrade::on(&mut response);
    tokio::spawn(splice(client, backend, peer));

    let (mut parts, _) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    restore_upgrade(&mut parts.headers, protocol);
    Ok(Response::from_parts(parts, Body::empty()))
}

async fn splice(client: OnUpgrade, backend: OnUpgrade, peer: SocketAddr) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(peer = %peer, error = %e, "protocol upgrade failed");
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((up, down)) => debug!(peer = %peer, bytes_up = up, bytes_down = down, "upgraded connection closed"),
        Err(e) => debug!(peer = %peer, error = %e, "upgraded connection ended"),
    }
}

/// The `Upgrade` protocol, when `Connection` carries the `upgrade` token.
fn requested_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

fn restore_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, protocol);
}

// ────────────────────────────────────────────────────────────────────────────
// Header helpers
// ────────────────────────────────────────────────────────────────────────────

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(FORWARDED_FOR_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let chain = if prior.is_empty() {
        ip
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(FORWARDED_FOR_HEADER, value);
    }
}

/// Replaces every client-supplied `X-Tailscale-User` with the resolved login.
fn set_user_header(headers: &mut HeaderMap, login: &str) -> Result<(), ProxyError> {
    let value = HeaderValue::from_str(login).map_err(|_| {
        ProxyError::Resolve(ResolveError::control_channel(InvalidLogin(login.to_string())))
    })?;
    headers.insert(USER_HEADER, value);
    Ok(())
}

#[derive(Debug, Error)]
#[error("login name {0:?} is not a valid header value")]
struct InvalidLogin(String);

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
