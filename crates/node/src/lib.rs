//! # Tailgate Node
//!
//! Everything that touches the overlay daemon: launching and supervising
//! it, talking to its control channel, and the bootstrap sequence that
//! restores the node's identity from the state store.
//!
//! ## Modules
//! - `local_api`: control-channel HTTP client and `LocalApiResolver`
//! - `readiness`: bounded poll-with-backoff
//! - `daemon`: `NetworkDaemon` trait, `TailscaleDaemon`, supervisor, mock
//! - `bootstrap`: `BootstrapSequencer` state machine
//! - `gateway`: process runtime (bootstrap, listeners, shutdown)
//! - `cli`: command line flags

pub mod bootstrap;
pub mod cli;
pub mod daemon;
pub mod gateway;
pub mod local_api;
pub mod readiness;

pub use bootstrap::{BootstrapError, BootstrapOutcome, BootstrapPhase, BootstrapSequencer};
pub use daemon::{DaemonFatal, DaemonHandle, MockDaemon, NetworkDaemon, TailscaleDaemon};
pub use local_api::{LocalApiClient, LocalApiResolver};
pub use readiness::{wait_until_ready, ReadinessPolicy};
