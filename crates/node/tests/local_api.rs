//! LocalApiClient and LocalApiResolver against a fake control socket.

#![cfg(unix)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;

use tailgate_common::identity::{IdentityResolver, ResolveError};
use tailgate_node::local_api::{LocalApiClient, LocalApiError, LocalApiResolver, LOCAL_API_HOST};
use tailgate_node::readiness::{wait_until_ready, ReadinessPolicy};

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let reply = |status: StatusCode, body: &str| {
        let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
        *resp.status_mut() = status;
        Ok(resp)
    };

    if req.headers().get("host").and_then(|h| h.to_str().ok()) != Some(LOCAL_API_HOST) {
        return reply(StatusCode::BAD_REQUEST, "wrong host");
    }

    let query = req.uri().query().unwrap_or_default().to_string();
    match req.uri().path() {
        "/localapi/v0/status" => reply(StatusCode::OK, r#"{"BackendState":"Running"}"#),
        "/localapi/v0/whois" if query == "addr=100.64.0.1%3A41000" => reply(
            StatusCode::OK,
            r#"{"Node":{"Name":"laptop.example.ts.net."},
                "UserProfile":{"LoginName":"alice@example.com","DisplayName":"Alice"}}"#,
        ),
        "/localapi/v0/whois" if query.starts_with("addr=100.64.0.2") => reply(
            StatusCode::OK,
            r#"{"Node":{"Name":"tagged."},"UserProfile":{"LoginName":""}}"#,
        ),
        "/localapi/v0/whois" => reply(StatusCode::NOT_FOUND, "no match for IP:port"),
        _ => reply(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Serves the fake control channel on `path` until the test ends.
fn spawn_fake_daemon(path: &Path) {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(handle))
                    .await;
            });
        }
    });
}

fn socket_in(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("ts.sock")
}

fn client(path: &Path) -> LocalApiClient {
    LocalApiClient::new(path, Duration::from_secs(2))
}

fn peer(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_status() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = socket_in(&dir);
    spawn_fake_daemon(&path);

    let status = client(&path).status().await.unwrap();
    assert_eq!(status.backend_state.as_deref(), Some("Running"));
}

#[tokio::test]
async fn test_whois_decodes_profile() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = socket_in(&dir);
    spawn_fake_daemon(&path);

    let whois = client(&path).whois(peer("100.64.0.1:41000")).await.unwrap();
    let profile = whois.user_profile.unwrap();
    assert_eq!(profile.login_name, "alice@example.com");
    assert_eq!(whois.node.unwrap().name, "laptop.example.ts.net.");
}

#[tokio::test]
async fn test_whois_unknown_peer_is_status_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = socket_in(&dir);
    spawn_fake_daemon(&path);

    let err = client(&path).whois(peer("100.64.0.9:1")).await.unwrap_err();
    match err {
        LocalApiError::Status { status, body, .. } => {
            assert_eq!(status, 404);
            assert_eq!(body, "no match for IP:port");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_resolver() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = socket_in(&dir);
    spawn_fake_daemon(&path);
    let resolver = LocalApiResolver::new(client(&path));

    let who = resolver.resolve(peer("100.64.0.1:41000")).await.unwrap();
    assert_eq!(who.login_name, "alice@example.com");
    assert_eq!(who.display_name.as_deref(), Some("Alice"));
    assert_eq!(who.node_name.as_deref(), Some("laptop.example.ts.net"));

    assert!(matches!(
        resolver.resolve(peer("100.64.0.2:5000")).await,
        Err(ResolveError::EmptyLogin(_))
    ));
    assert!(matches!(
        resolver.resolve(peer("100.64.0.3:5000")).await,
        Err(ResolveError::ControlChannel(_))
    ));
}

#[tokio::test]
async fn test_readiness_waits_for_socket() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = socket_in(&dir);
    let api = client(&path);

    let late_path = path.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        spawn_fake_daemon(&late_path);
    });

    let policy = ReadinessPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        timeout: Duration::from_secs(5),
    };
    let report = wait_until_ready(&policy, || async { api.status().await.map(|_| ()) })
        .await
        .unwrap();
    assert!(report.attempts > 1);
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = socket_in(&dir);
    // Accepts connections but never replies.
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let api = LocalApiClient::new(&path, Duration::from_millis(100));
    assert!(matches!(
        api.status().await,
        Err(LocalApiError::Timeout { .. })
    ));
}
