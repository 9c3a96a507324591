//! # Gateway Runtime
//!
//! Wires the pieces together for one process lifetime.
//!
//! ```text
//! validate config
//!   └─► StateStore::connect ──► BootstrapSequencer::run ──► drop store
//!         └─► bind :proxy_port, :PORT
//!               └─► run until first of:
//!                     shutdown signal ──► Ok
//!                     daemon fatal   ──► Err
//!                     listener error ──► Err
//!               └─► drain listeners, stop daemon
//! ```
//!
//! Listeners are bound only after bootstrap reaches `Ready`, so the proxy
//! never answers while the node is still joining.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use tailgate_common::config::GatewayConfig;
use tailgate_common::store::StateStore;
use tailgate_ingress::{bind, serve_placeholder, serve_proxy, placeholder, ProxyState, Upstream};

use crate::bootstrap::BootstrapSequencer;
use crate::daemon::{NetworkDaemon, TailscaleDaemon};
use crate::local_api::{LocalApiClient, LocalApiResolver};
use crate::readiness::ReadinessPolicy;

/// Upper bound for draining in-flight requests after shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the gateway with the production daemon until `shutdown` resolves
/// or something fatal happens.
pub async fn run<S>(config: GatewayConfig, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    config.validate().context("invalid configuration")?;
    let daemon = TailscaleDaemon::from_config(&config);
    run_with_daemon(config, &daemon, shutdown).await
}

/// [`run`] with an arbitrary daemon implementation.
pub async fn run_with_daemon<S>(config: GatewayConfig, daemon: &dyn NetworkDaemon, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("DATABASE_URL is not set"))?;
    let public_port = config
        .public_port
        .ok_or_else(|| anyhow!("public port (PORT) is not set"))?;
    let upstream = Upstream::parse(&config.backend_url)?;

    info!(
        database = %config.redacted_database_url(),
        hostname = %config.hostname,
        proxy_port = config.proxy_port,
        public_port,
        backend = %config.backend_url,
        has_auth_key = config.auth_key.is_some(),
        "gateway starting"
    );

    // ── bootstrap ──────────────────────────────────────────────────────
    let outcome = {
        let store = StateStore::connect(database_url, config.state_retention)
            .await
            .context("connecting to state store")?;
        BootstrapSequencer::new(
            &store,
            daemon,
            config.auth_key.clone(),
            config.state_file.clone(),
            ReadinessPolicy::with_timeout(config.readiness_timeout()),
        )
        .run()
        .await
        .context("bootstrap failed")?
    };
    info!(
        restored = outcome.restored,
        persisted = ?outcome.persisted,
        ready_after_ms = outcome.readiness.waited.as_millis() as u64,
        "node ready"
    );
    let mut daemon_handle = outcome.daemon;

    // ── listeners ──────────────────────────────────────────────────────
    let resolver = Arc::new(LocalApiResolver::new(LocalApiClient::new(
        config.socket_path.clone(),
        config.local_api_timeout(),
    )));
    let proxy_listener = bind(config.proxy_port)
        .await
        .with_context(|| format!("binding proxy port {}", config.proxy_port))?;
    let public_listener = bind(public_port)
        .await
        .with_context(|| format!("binding public port {}", public_port))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let hostname = placeholder::system_hostname();

    let mut proxy_task: JoinHandle<io::Result<()>> = tokio::spawn(serve_proxy(
        proxy_listener,
        ProxyState::new(resolver, upstream),
        stopped(stop_rx.clone()),
    ));
    let mut public_task: JoinHandle<io::Result<()>> = tokio::spawn({
        let stop = stopped(stop_rx);
        async move { serve_placeholder(public_listener, &hostname, stop).await }
    });

    // ── run ────────────────────────────────────────────────────────────
    let result = tokio::select! {
        _ = shutdown => {
            info!("shutdown signal received");
            Ok(())
        }
        fatal = daemon_handle.fatal() => {
            error!(error = %fatal, "daemon supervisor gave up");
            Err(anyhow::Error::new(fatal).context("overlay daemon failed"))
        }
        res = &mut proxy_task => listener_exit("proxy", res),
        res = &mut public_task => listener_exit("placeholder", res),
    };

    // ── teardown ───────────────────────────────────────────────────────
    let _ = stop_tx.send(true);
    for (name, task) in [("proxy", proxy_task), ("placeholder", public_task)] {
        if task.is_finished() {
            continue;
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
            warn!(listener = name, "listener did not drain in time");
        }
    }
    daemon_handle.shutdown().await;
    info!("gateway stopped");

    result
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn listener_exit(name: &str, res: Result<io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(Ok(())) => Err(anyhow!("{} listener stopped unexpectedly", name)),
        Ok(Err(e)) => {
            error!(listener = name, error = %e, "listener failed");
            Err(anyhow::Error::new(e).context(format!("{} listener failed", name)))
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("{} listener panicked", name))),
    }
}
