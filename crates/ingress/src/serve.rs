//! Listener helpers shared by the proxy and the placeholder.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use crate::placeholder;
use crate::proxy::{self, ProxyState};

/// Binds `0.0.0.0:<port>`.
pub async fn bind(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
}

/// Serves the authenticating proxy until `shutdown` resolves, then drains
/// in-flight requests.
pub async fn serve_proxy<F>(listener: TcpListener, state: ProxyState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        listen_addr = %listener.local_addr()?,
        upstream = %state.upstream().authority(),
        "proxy listening"
    );
    let app = proxy::router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Serves the placeholder responder until `shutdown` resolves.
pub async fn serve_placeholder<F>(listener: TcpListener, hostname: &str, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(listen_addr = %listener.local_addr()?, hostname, "placeholder listening");
    axum::serve(listener, placeholder::router(hostname))
        .with_graceful_shutdown(shutdown)
        .await
}
