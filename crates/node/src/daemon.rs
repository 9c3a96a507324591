//! # Overlay Daemon
//!
//! Launching, probing, joining and supervising the overlay daemon.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 dyn NetworkDaemon                            │
//! │   start() ──► DaemonHandle ◄── supervisor task               │
//! │   probe() ──► LocalApiClient::status()                       │
//! │   join()  ──► `tailscale --socket S up --hostname H [...]`   │
//! └──────────────────────────────────────────────────────────────┘
//!
//! supervisor task:
//!   child exits ──► restarts < max ? sleep(backoff), respawn
//!                                  : DaemonFatal ──► handle.fatal()
//!   shutdown / handle dropped ──► kill child
//! ```
//!
//! The daemon child is spawned with `kill_on_drop`, so it never outlives the
//! gateway process. Restarts reuse the on-disk state file.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tailgate_common::config::GatewayConfig;
use tailgate_common::state::JoinCredential;

use crate::local_api::{LocalApiClient, LocalApiError};

// ════════════════════════════════════════════════════════════════════════════
// ERROR TYPES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("join command exited with {status}: {stderr}")]
    JoinFailed { status: String, stderr: String },

    #[error(transparent)]
    LocalApi(#[from] LocalApiError),

    /// Test doubles report failures through this variant.
    #[error("{0}")]
    Other(String),
}

/// Supervisor escalation. The gateway cannot continue without its daemon.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DaemonFatal {
    #[error("daemon keeps exiting; restart budget of {budget} exhausted (last exit: {last_exit})")]
    RestartsExhausted { budget: u32, last_exit: String },

    #[error("daemon restart failed: {0}")]
    RestartSpawn(String),
}

// ════════════════════════════════════════════════════════════════════════════
// TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// The overlay daemon as seen by the bootstrap sequence.
#[async_trait]
pub trait NetworkDaemon: Send + Sync {
    /// Launches the daemon in the background under supervision.
    async fn start(&self) -> Result<DaemonHandle, DaemonError>;

    /// One readiness check against the control channel.
    async fn probe(&self) -> Result<(), DaemonError>;

    /// Joins the overlay network, in the foreground.
    async fn join(&self, credential: Option<&JoinCredential>) -> Result<(), DaemonError>;
}

// ════════════════════════════════════════════════════════════════════════════
// DAEMON SPEC
// ════════════════════════════════════════════════════════════════════════════

/// Binaries, paths and flags for both daemon commands.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub tailscaled_bin: PathBuf,
    pub tailscale_bin: PathBuf,
    pub socket_path: PathBuf,
    pub state_file: PathBuf,
    pub tun_mode: String,
    pub hostname: String,
}

impl DaemonSpec {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            tailscaled_bin: config.tailscaled_bin.clone(),
            tailscale_bin: config.tailscale_bin.clone(),
            socket_path: config.socket_path.clone(),
            state_file: config.state_file.clone(),
            tun_mode: config.tun_mode.clone(),
            hostname: config.hostname.clone(),
        }
    }

    /// `--socket S --state F --tun MODE`
    pub fn daemon_args(&self) -> Vec<OsString> {
        vec![
            "--socket".into(),
            self.socket_path.clone().into(),
            "--state".into(),
            self.state_file.clone().into(),
            "--tun".into(),
            self.tun_mode.clone().into(),
        ]
    }

    /// `--socket S up --hostname H [--authkey K]`
    pub fn join_args(&self, credential: Option<&JoinCredential>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--socket".into(),
            self.socket_path.clone().into(),
            "up".into(),
            "--hostname".into(),
            self.hostname.clone().into(),
        ];
        if let Some(key) = credential {
            args.push("--authkey".into());
            args.push(key.expose().into());
        }
        args
    }

    fn spawn_daemon(&self) -> Result<Child, DaemonError> {
        Command::new(&self.tailscaled_bin)
            .args(self.daemon_args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DaemonError::Spawn {
                program: self.tailscaled_bin.clone(),
                source,
            })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// RESTART POLICY
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed over the process lifetime.
    pub max_restarts: u32,
    /// Delay before the first restart; doubles for each later one.
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RestartPolicy {
    pub fn with_max_restarts(max_restarts: u32) -> Self {
        Self {
            max_restarts,
            ..Self::default()
        }
    }

    /// Delay before restart number `n` (1-based).
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DAEMON HANDLE / SUPERVISOR
// ════════════════════════════════════════════════════════════════════════════

/// Ownership of a running daemon.
///
/// Dropping the handle stops the supervisor, which kills the child.
#[derive(Debug)]
pub struct DaemonHandle {
    fatal_rx: Option<oneshot::Receiver<DaemonFatal>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    /// A handle with no process behind it. `fatal()` never resolves.
    pub fn detached() -> Self {
        Self {
            fatal_rx: None,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Supervises `child`, respawning it with `respawn` per `policy`.
    pub fn supervise<R>(child: Child, respawn: R, policy: RestartPolicy) -> Self
    where
        R: Fn() -> Result<Child, DaemonError> + Send + 'static,
    {
        let (fatal_tx, fatal_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(supervise_loop(child, respawn, policy, shutdown_rx, fatal_tx));
        Self {
            fatal_rx: Some(fatal_rx),
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Resolves when the supervisor gives up on the daemon. Cancel-safe.
    pub async fn fatal(&mut self) -> DaemonFatal {
        let Some(rx) = self.fatal_rx.as_mut() else {
            return std::future::pending().await;
        };
        let result = rx.await;
        self.fatal_rx = None;
        match result {
            Ok(fatal) => fatal,
            // supervisor ended without escalating (shutdown)
            Err(_) => std::future::pending().await,
        }
    }

    /// Stops the supervisor and waits for the daemon to be killed.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "daemon supervisor task failed");
            }
        }
    }
}

async fn supervise_loop<R>(
    mut child: Child,
    respawn: R,
    policy: RestartPolicy,
    mut shutdown_rx: oneshot::Receiver<()>,
    fatal_tx: oneshot::Sender<DaemonFatal>,
) where
    R: Fn() -> Result<Child, DaemonError> + Send + 'static,
{
    let mut restarts = 0u32;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                stop_child(&mut child).await;
                return;
            }
            status = child.wait() => {
                let last_exit = match status {
                    Ok(s) => s.to_string(),
                    Err(e) => format!("wait failed: {}", e),
                };
                warn!(exit = %last_exit, restarts, "daemon exited unexpectedly");

                if restarts >= policy.max_restarts {
                    error!(budget = policy.max_restarts, "daemon restart budget exhausted");
                    let _ = fatal_tx.send(DaemonFatal::RestartsExhausted {
                        budget: policy.max_restarts,
                        last_exit,
                    });
                    return;
                }

                restarts += 1;
                let delay = policy.delay_for(restarts);
                tokio::select! {
                    _ = &mut shutdown_rx => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                match respawn() {
                    Ok(c) => {
                        info!(restarts, delay_ms = delay.as_millis() as u64, "daemon restarted");
                        child = c;
                    }
                    Err(e) => {
                        error!(error = %e, "daemon restart failed");
                        let _ = fatal_tx.send(DaemonFatal::RestartSpawn(e.to_string()));
                        return;
                    }
                }
            }
        }
    }
}

async fn stop_child(child: &mut Child) {
    match child.kill().await {
        Ok(()) => info!("daemon stopped"),
        // already exited
        Err(e) => debug!(error = %e, "daemon kill"),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TAILSCALE DAEMON
// ════════════════════════════════════════════════════════════════════════════

/// Production [`NetworkDaemon`]: `tailscaled` plus the `tailscale` CLI.
#[derive(Debug, Clone)]
pub struct TailscaleDaemon {
    spec: DaemonSpec,
    local_api: LocalApiClient,
    restart: RestartPolicy,
}

impl TailscaleDaemon {
    pub fn new(spec: DaemonSpec, local_api: LocalApiClient, restart: RestartPolicy) -> Self {
        Self {
            spec,
            local_api,
            restart,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            DaemonSpec::from_config(config),
            LocalApiClient::new(config.socket_path.clone(), config.local_api_timeout()),
            RestartPolicy::with_max_restarts(config.daemon_max_restarts),
        )
    }
}

#[async_trait]
impl NetworkDaemon for TailscaleDaemon {
    async fn start(&self) -> Result<DaemonHandle, DaemonError> {
        let child = self.spec.spawn_daemon()?;
        info!(
            pid = child.id().unwrap_or_default(),
            socket = %self.spec.socket_path.display(),
            state_file = %self.spec.state_file.display(),
            "daemon started"
        );
        let spec = self.spec.clone();
        Ok(DaemonHandle::supervise(
            child,
            move || spec.spawn_daemon(),
            self.restart,
        ))
    }

    async fn probe(&self) -> Result<(), DaemonError> {
        let status = self.local_api.status().await?;
        debug!(backend_state = ?status.backend_state, "daemon status");
        Ok(())
    }

    async fn join(&self, credential: Option<&JoinCredential>) -> Result<(), DaemonError> {
        let output = Command::new(&self.spec.tailscale_bin)
            .args(self.spec.join_args(credential))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| DaemonError::Spawn {
                program: self.spec.tailscale_bin.clone(),
                source,
            })?;

        let redact = |bytes: &[u8]| {
            let text = String::from_utf8_lossy(bytes).trim().to_string();
            match credential {
                Some(key) => text.replace(key.expose(), "[REDACTED]"),
                None => text,
            }
        };
        let stdout = redact(&output.stdout);
        let stderr = redact(&output.stderr);
        for line in stdout.lines().chain(stderr.lines()) {
            info!(target: "tailgate_node::join", "{}", line);
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(DaemonError::JoinFailed {
                status: output.status.to_string(),
                stderr,
            })
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK DAEMON
// ════════════════════════════════════════════════════════════════════════════

type JoinHook = Box<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Scripted [`NetworkDaemon`] that records what was called.
#[derive(Default)]
pub struct MockDaemon {
    events: Mutex<Vec<String>>,
    failing_probes: Mutex<u32>,
    start_error: Mutex<Option<String>>,
    on_join: Option<JoinHook>,
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` probes fail.
    pub fn failing_probes(self, n: u32) -> Self {
        *self.failing_probes.lock() = n;
        self
    }

    pub fn failing_start(self, message: &str) -> Self {
        *self.start_error.lock() = Some(message.to_string());
        self
    }

    /// Runs on every `join`; an `Err` becomes a failed join.
    pub fn on_join<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        self.on_join = Some(Box::new(hook));
        self
    }

    /// Calls so far, e.g. `["start", "probe", "join(authkey)"]`.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }
}

#[async_trait]
impl NetworkDaemon for MockDaemon {
    async fn start(&self) -> Result<DaemonHandle, DaemonError> {
        self.record("start");
        match self.start_error.lock().clone() {
            Some(msg) => Err(DaemonError::Other(msg)),
            None => Ok(DaemonHandle::detached()),
        }
    }

    async fn probe(&self) -> Result<(), DaemonError> {
        self.record("probe");
        let mut remaining = self.failing_probes.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(DaemonError::Other("control socket not ready".to_string()));
        }
        Ok(())
    }

    async fn join(&self, credential: Option<&JoinCredential>) -> Result<(), DaemonError> {
        self.record(if credential.is_some() {
            "join(authkey)"
        } else {
            "join"
        });
        match &self.on_join {
            Some(hook) => hook().map_err(|stderr| DaemonError::JoinFailed {
                status: "exit status: 1".to_string(),
                stderr,
            }),
            None => Ok(()),
        }
    }
}
