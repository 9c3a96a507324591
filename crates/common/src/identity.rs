//! # Peer Identity Resolution
//!
//! The [`IdentityResolver`] trait turns the remote address of an inbound
//! connection into a verified overlay principal. The production
//! implementation asks the overlay daemon over its local control channel;
//! [`MockIdentityResolver`] serves tests without a daemon.
//!
//! ## Contract
//!
//! - One call per inbound request. No caching.
//! - A resolution that succeeds but carries no login name is an error
//!   ([`ResolveError::EmptyLogin`]), never an anonymous identity.
//! - Implementations do not retry.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════
// PEER IDENTITY
// ════════════════════════════════════════════════════════════════════════════

/// A resolved principal for one inbound request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Login-style identity, e.g. `alice@example.com`. Never empty.
    pub login_name: String,
    /// Human-readable name from the user profile, if any.
    pub display_name: Option<String>,
    /// Overlay node name the request came from, if reported.
    pub node_name: Option<String>,
    /// The overlay address that was resolved.
    pub peer_addr: SocketAddr,
}

// ════════════════════════════════════════════════════════════════════════════
// ERROR TYPE
// ════════════════════════════════════════════════════════════════════════════

/// Why a peer could not be resolved. Always recoverable: the request fails,
/// the listener keeps serving.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The control-channel call itself failed.
    #[error("identity lookup failed: {0}")]
    ControlChannel(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The lookup succeeded but no user profile is bound to the address.
    #[error("no user profile for {0}")]
    NoUserProfile(SocketAddr),

    /// The user profile has an empty login name.
    #[error("empty login name for {0}")]
    EmptyLogin(SocketAddr),
}

impl ResolveError {
    pub fn control_channel(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ResolveError::ControlChannel(Box::new(err))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// RESOLVER TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Resolves the overlay principal behind a connection's remote address.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, peer_addr: SocketAddr) -> Result<PeerIdentity, ResolveError>;
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK RESOLVER
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum MockOutcome {
    Login(String),
    Empty,
    Fail(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MockLookupError(String);

/// Resolver with preconfigured answers keyed by peer IP.
///
/// Keys are IPs rather than socket addresses because client ports are
/// ephemeral. Unknown peers fail unless a default login is set.
#[derive(Debug, Default)]
pub struct MockIdentityResolver {
    outcomes: Mutex<HashMap<IpAddr, MockOutcome>>,
    default_login: Mutex<Option<String>>,
    calls: AtomicU64,
}

impl MockIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every unknown peer to `login`.
    pub fn with_default_login(login: &str) -> Self {
        let resolver = Self::new();
        *resolver.default_login.lock() = Some(login.to_string());
        resolver
    }

    pub fn allow(&self, ip: IpAddr, login: &str) {
        self.outcomes
            .lock()
            .insert(ip, MockOutcome::Login(login.to_string()));
    }

    /// The lookup succeeds with an empty login name.
    pub fn empty(&self, ip: IpAddr) {
        self.outcomes.lock().insert(ip, MockOutcome::Empty);
    }

    pub fn fail(&self, ip: IpAddr, message: &str) {
        self.outcomes
            .lock()
            .insert(ip, MockOutcome::Fail(message.to_string()));
    }

    /// Total number of `resolve` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityResolver for MockIdentityResolver {
    async fn resolve(&self, peer_addr: SocketAddr) -> Result<PeerIdentity, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let outcome = self.outcomes.lock().get(&peer_addr.ip()).cloned();
        let outcome = match outcome {
            Some(o) => o,
            None => match self.default_login.lock().clone() {
                Some(login) => MockOutcome::Login(login),
                None => MockOutcome::Fail(format!("unknown peer {}", peer_addr)),
            },
        };

        match outcome {
            MockOutcome::Login(login) if !login.is_empty() => Ok(PeerIdentity {
                login_name: login,
                display_name: None,
                node_name: None,
                peer_addr,
            }),
            MockOutcome::Login(_) | MockOutcome::Empty => Err(ResolveError::EmptyLogin(peer_addr)),
            MockOutcome::Fail(msg) => Err(ResolveError::control_channel(MockLookupError(msg))),
        }
    }
}
