//! # Tailgate Common Crate
//!
//! Shared types for the gateway: persisted overlay state, the state store
//! and its backends, peer identity resolution, and configuration.
//!
//! ## Modules
//! - `state`: `StateBlob` and `JoinCredential` value types
//! - `store`: `StateStore` and the `StateBackend` trait
//! - `postgres_store`: Postgres backend (production)
//! - `sqlite_store`: SQLite backend (local runs, tests)
//! - `identity`: `IdentityResolver` trait and mock
//! - `config`: layered `GatewayConfig`
//!
//! ## Store Architecture
//! ```text
//! ┌──────────────────┐
//! │   StateStore     │  <- change detection, retention
//! └────────┬─────────┘
//!          │ dyn StateBackend
//!    ┌─────┴──────┐
//!    │            │
//! ┌──▼──────┐ ┌───▼─────┐
//! │Postgres │ │ SQLite  │
//! └─────────┘ └─────────┘
//! ```

pub mod config;
pub mod identity;
pub mod postgres_store;
pub mod sqlite_store;
pub mod state;
pub mod store;

pub use config::{load_env_file, redact_url, ConfigError, GatewayConfig};
pub use identity::{IdentityResolver, MockIdentityResolver, PeerIdentity, ResolveError};
pub use state::{JoinCredential, StateBlob};
pub use store::{open_backend, AppendOutcome, StateBackend, StateStore, StoreError};
