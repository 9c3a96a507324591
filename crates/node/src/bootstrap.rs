//! # Bootstrap Sequencer
//!
//! One-shot startup sequence that restores the node's overlay identity from
//! the state store, brings the daemon up, joins the network and persists any
//! state change.
//!
//! ## Phases
//!
//! ```text
//! Init
//!  └─► LoadState ──────────── ensure_schema + load_latest
//!       └─► MaterializeLocalFile (only when a non-empty blob was loaded)
//!            └─► ValidateCredentials ── no key and no state ⇒ fail, nothing spawned
//!                 └─► StartDaemon ───── supervised child
//!                      └─► AwaitReadiness ── bounded backoff on status
//!                           └─► JoinNetwork ── `up`, foreground
//!                                └─► ReadLocalFile
//!                                     └─► PersistIfChanged ── append_if_changed
//!                                          └─► Ready
//! ```
//!
//! Every failure is fatal and tagged with its phase. If the daemon was
//! already started it is shut down before the error is returned.
//!
//! ## Seams
//!
//! The sequencer talks to a [`StateStore`] (any backend) and a
//! `dyn` [`NetworkDaemon`], so the full sequence runs in tests with SQLite
//! in memory and [`MockDaemon`](crate::daemon::MockDaemon).

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use tailgate_common::state::{JoinCredential, StateBlob};
use tailgate_common::store::{AppendOutcome, StateStore, StoreError};

use crate::daemon::{DaemonError, DaemonHandle, NetworkDaemon};
use crate::readiness::{wait_until_ready, ReadinessPolicy, ReadinessReport};

// ════════════════════════════════════════════════════════════════════════════
// PHASE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    Init,
    LoadState,
    MaterializeLocalFile,
    ValidateCredentials,
    StartDaemon,
    AwaitReadiness,
    JoinNetwork,
    ReadLocalFile,
    PersistIfChanged,
    Ready,
}

impl BootstrapPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapPhase::Init => "init",
            BootstrapPhase::LoadState => "load_state",
            BootstrapPhase::MaterializeLocalFile => "materialize_local_file",
            BootstrapPhase::ValidateCredentials => "validate_credentials",
            BootstrapPhase::StartDaemon => "start_daemon",
            BootstrapPhase::AwaitReadiness => "await_readiness",
            BootstrapPhase::JoinNetwork => "join_network",
            BootstrapPhase::ReadLocalFile => "read_local_file",
            BootstrapPhase::PersistIfChanged => "persist_if_changed",
            BootstrapPhase::Ready => "ready",
        }
    }
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ERROR TYPE
// ════════════════════════════════════════════════════════════════════════════

/// Unrecoverable bootstrap failure.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no join credential and no persisted state; set TAILSCALE_AUTHKEY for the first run")]
    MissingCredentialOrState,

    #[error("state store failed during {phase}: {source}")]
    Store {
        phase: BootstrapPhase,
        #[source]
        source: StoreError,
    },

    #[error("local state file {path:?} failed during {phase}: {source}")]
    LocalFile {
        phase: BootstrapPhase,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start daemon: {0}")]
    DaemonStart(#[source] DaemonError),

    #[error("daemon not ready after {attempts} probes over {waited:?} (last error: {})", last_error.as_deref().unwrap_or("none"))]
    DaemonNotReady {
        attempts: u32,
        waited: Duration,
        last_error: Option<String>,
    },

    #[error("join failed with {status}: {stderr}")]
    JoinFailed { status: String, stderr: String },

    #[error("failed to run join command: {0}")]
    JoinSpawn(#[source] DaemonError),
}

impl BootstrapError {
    /// Phase in which the failure happened.
    pub fn phase(&self) -> BootstrapPhase {
        match self {
            BootstrapError::MissingCredentialOrState => BootstrapPhase::ValidateCredentials,
            BootstrapError::Store { phase, .. } | BootstrapError::LocalFile { phase, .. } => *phase,
            BootstrapError::DaemonStart(_) => BootstrapPhase::StartDaemon,
            BootstrapError::DaemonNotReady { .. } => BootstrapPhase::AwaitReadiness,
            BootstrapError::JoinFailed { .. } | BootstrapError::JoinSpawn(_) => {
                BootstrapPhase::JoinNetwork
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// OUTCOME
// ════════════════════════════════════════════════════════════════════════════

/// A node that reached `Ready`.
#[derive(Debug)]
pub struct BootstrapOutcome {
    /// The running, supervised daemon.
    pub daemon: DaemonHandle,
    /// A persisted blob was restored to the local file.
    pub restored: bool,
    pub readiness: ReadinessReport,
    pub persisted: AppendOutcome,
}

// ════════════════════════════════════════════════════════════════════════════
// SEQUENCER
// ════════════════════════════════════════════════════════════════════════════

pub struct BootstrapSequencer<'a> {
    store: &'a StateStore,
    daemon: &'a dyn NetworkDaemon,
    credential: Option<JoinCredential>,
    state_file: PathBuf,
    readiness: ReadinessPolicy,
    phase: BootstrapPhase,
}

impl<'a> BootstrapSequencer<'a> {
    pub fn new(
        store: &'a StateStore,
        daemon: &'a dyn NetworkDaemon,
        credential: Option<JoinCredential>,
        state_file: impl Into<PathBuf>,
        readiness: ReadinessPolicy,
    ) -> Self {
        Self {
            store,
            daemon,
            credential,
            state_file: state_file.into(),
            readiness,
            phase: BootstrapPhase::Init,
        }
    }

    fn enter(&mut self, phase: BootstrapPhase) {
        info!(from = %self.phase, to = %phase, "bootstrap phase");
        self.phase = phase;
    }

    /// Runs every phase in order.
    pub async fn run(mut self) -> Result<BootstrapOutcome, BootstrapError> {
        // ── LOAD_STATE ─────────────────────────────────────────────────
        self.enter(BootstrapPhase::LoadState);
        self.store.ensure_schema().await.map_err(|source| BootstrapError::Store {
            phase: BootstrapPhase::LoadState,
            source,
        })?;
        let loaded = self
            .store
            .load_latest()
            .await
            .map_err(|source| BootstrapError::Store {
                phase: BootstrapPhase::LoadState,
                source,
            })?
            .filter(|blob| !blob.is_empty());

        // ── MATERIALIZE_LOCAL_FILE ─────────────────────────────────────
        let restored = match &loaded {
            Some(blob) => {
                self.enter(BootstrapPhase::MaterializeLocalFile);
                write_state_file(&self.state_file, blob)
                    .await
                    .map_err(|source| BootstrapError::LocalFile {
                        phase: BootstrapPhase::MaterializeLocalFile,
                        path: self.state_file.clone(),
                        source,
                    })?;
                info!(len = blob.len(), path = %self.state_file.display(), "restored persisted state");
                true
            }
            None => false,
        };

        // ── VALIDATE_CREDENTIALS ───────────────────────────────────────
        self.enter(BootstrapPhase::ValidateCredentials);
        if self.credential.is_none() && loaded.is_none() {
            return Err(BootstrapError::MissingCredentialOrState);
        }

        // ── START_DAEMON ───────────────────────────────────────────────
        self.enter(BootstrapPhase::StartDaemon);
        let daemon = self
            .daemon
            .start()
            .await
            .map_err(BootstrapError::DaemonStart)?;

        match self.after_start().await {
            Ok((readiness, persisted)) => {
                self.enter(BootstrapPhase::Ready);
                Ok(BootstrapOutcome {
                    daemon,
                    restored,
                    readiness,
                    persisted,
                })
            }
            Err(e) => {
                warn!(phase = %e.phase(), error = %e, "bootstrap failed; stopping daemon");
                daemon.shutdown().await;
                Err(e)
            }
        }
    }

    async fn after_start(&mut self) -> Result<(ReadinessReport, AppendOutcome), BootstrapError> {
        // ── AWAIT_READINESS ────────────────────────────────────────────
        self.enter(BootstrapPhase::AwaitReadiness);
        let daemon = self.daemon;
        let readiness = wait_until_ready(&self.readiness, || daemon.probe())
            .await
            .map_err(|e| BootstrapError::DaemonNotReady {
                attempts: e.attempts,
                waited: e.waited,
                last_error: e.last_error,
            })?;

        // ── JOIN_NETWORK ───────────────────────────────────────────────
        self.enter(BootstrapPhase::JoinNetwork);
        daemon.join(self.credential.as_ref()).await.map_err(|e| match e {
            DaemonError::JoinFailed { status, stderr } => BootstrapError::JoinFailed { status, stderr },
            other => BootstrapError::JoinSpawn(other),
        })?;

        // ── READ_LOCAL_FILE ────────────────────────────────────────────
        self.enter(BootstrapPhase::ReadLocalFile);
        let current = tokio::fs::read(&self.state_file)
            .await
            .map(StateBlob::new)
            .map_err(|source| BootstrapError::LocalFile {
                phase: BootstrapPhase::ReadLocalFile,
                path: self.state_file.clone(),
                source,
            })?;

        // ── PERSIST_IF_CHANGED ─────────────────────────────────────────
        self.enter(BootstrapPhase::PersistIfChanged);
        let persisted = self
            .store
            .append_if_changed(&current)
            .await
            .map_err(|source| BootstrapError::Store {
                phase: BootstrapPhase::PersistIfChanged,
                source,
            })?;

        Ok((readiness, persisted))
    }
}

/// Writes `blob` verbatim, creating the parent directory. Mode `0600` on Unix.
async fn write_state_file(path: &Path, blob: &StateBlob) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(blob.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::MockDaemon;
    use tailgate_common::sqlite_store::SqliteBackend;

    fn store() -> StateStore {
        StateStore::new(Box::new(SqliteBackend::open_in_memory().expect("sqlite")), 5)
    }

    fn fast_readiness() -> ReadinessPolicy {
        ReadinessPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(BootstrapPhase::AwaitReadiness.to_string(), "await_readiness");
        assert_eq!(
            BootstrapError::MissingCredentialOrState.phase(),
            BootstrapPhase::ValidateCredentials
        );
    }

    #[tokio::test]
    async fn test_missing_credential_and_state_spawns_nothing() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = store();
        let daemon = MockDaemon::new();

        let err = BootstrapSequencer::new(&store, &daemon, None, dir.path().join("ts.state"), fast_readiness())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::MissingCredentialOrState));
        assert!(daemon.events().is_empty());
        assert!(!dir.path().join("ts.state").exists());
    }

    #[tokio::test]
    async fn test_state_file_mode_is_private() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("ts.state");
        write_state_file(&path, &StateBlob::from("S1")).await.expect("write");
        assert_eq!(std::fs::read(&path).expect("read"), b"S1");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_not_ready_is_distinct_error() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = store();
        let daemon = MockDaemon::new().failing_probes(u32::MAX);
        let key = JoinCredential::new("tskey-1");

        let err = BootstrapSequencer::new(&store, &daemon, key, dir.path().join("ts.state"), fast_readiness())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::DaemonNotReady { .. }));
        assert_eq!(err.phase(), BootstrapPhase::AwaitReadiness);
        assert!(!daemon.events().iter().any(|e| e.starts_with("join")));
    }
}
