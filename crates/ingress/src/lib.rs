//! # Tailgate Ingress
//!
//! The two HTTP surfaces of the gateway.
//!
//! ```text
//! overlay peer ──► :proxy_port ──► proxy ──► backend (X-Tailscale-User)
//! platform     ──► :PORT       ──► placeholder ("Welcome! Hello from ...")
//! ```
//!
//! ## Modules
//! - `proxy`: identity-injecting reverse proxy
//! - `placeholder`: static greeting on the public port
//! - `serve`: bind and graceful-shutdown helpers

pub mod placeholder;
pub mod proxy;
pub mod serve;

pub use proxy::{ProxyError, ProxyState, Upstream, UpstreamError};
pub use serve::{bind, serve_placeholder, serve_proxy};
