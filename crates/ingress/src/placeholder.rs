//! Public placeholder responder.
//!
//! The hosting platform routes its public port here and expects an HTTP
//! answer. Real traffic arrives over the overlay on the proxy port.

use std::fs;

use axum::response::IntoResponse;
use axum::Router;

const KERNEL_HOSTNAME: &str = "/proc/sys/kernel/hostname";

/// Router answering every method and path with the greeting.
pub fn router(hostname: &str) -> Router {
    let body = greeting(hostname);
    Router::new().fallback(move || {
        let body = body.clone();
        async move { body.into_response() }
    })
}

pub fn greeting(hostname: &str) -> String {
    format!("Welcome! Hello from {}", hostname)
}

/// `HOSTNAME`, then the kernel hostname, then `"localhost"`.
pub fn system_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string(KERNEL_HOSTNAME).ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
