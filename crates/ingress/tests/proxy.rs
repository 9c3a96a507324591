//! End-to-end tests for the authenticating proxy and the placeholder,
//! against real listeners on loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use tailgate_common::identity::{IdentityResolver, MockIdentityResolver, PeerIdentity, ResolveError};
use tailgate_ingress::proxy::{LOOKUP_FAILED_MESSAGE, UNIDENTIFIED_MESSAGE};
use tailgate_ingress::{serve_placeholder, serve_proxy, ProxyState, Upstream};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

// ────────────────────────────────────────────────────────────────────────────
// Backend fixture
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Seen {
    requests: Arc<Mutex<Vec<(String, String, HeaderMap)>>>,
}

impl Seen {
    fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn last_headers(&self) -> HeaderMap {
        self.requests.lock().unwrap().last().unwrap().2.clone()
    }

    fn last_target(&self) -> (String, String) {
        let guard = self.requests.lock().unwrap();
        let (method, uri, _) = guard.last().unwrap();
        (method.clone(), uri.clone())
    }
}

/// Records every request and answers `201` with a fixed body and header.
async fn spawn_backend() -> (SocketAddr, Seen) {
    let seen = Seen::default();
    let recorder = seen.clone();
    let app = Router::new().fallback(move |req: Request| {
        let recorder = recorder.clone();
        async move {
            recorder.requests.lock().unwrap().push((
                req.method().to_string(),
                req.uri().to_string(),
                req.headers().clone(),
            ));
            (
                StatusCode::CREATED,
                [("x-backend", "grafana")],
                "dashboard-body",
            )
                .into_response()
        }
    });

    let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, seen)
}

/// Reads one HTTP head, byte by byte so nothing past the blank line is consumed.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Answers every request with `101` to `websocket`, then echoes bytes.
/// Keeps the head of the last request it saw.
async fn spawn_upgrading_backend() -> (SocketAddr, Arc<Mutex<Option<String>>>) {
    let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let last_head = Arc::new(Mutex::new(None));
    let recorder = last_head.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let recorder = recorder.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                *recorder.lock().unwrap() = Some(head);
                stream
                    .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
                    .await
                    .unwrap();
                let mut buf = [0u8; 256];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, last_head)
}

/// Lookup that succeeds but carries no login, as for a tagged node.
struct BlankLoginResolver;

#[async_trait]
impl IdentityResolver for BlankLoginResolver {
    async fn resolve(&self, peer_addr: SocketAddr) -> Result<PeerIdentity, ResolveError> {
        Ok(PeerIdentity {
            login_name: String::new(),
            display_name: None,
            node_name: Some("tagged-node".to_string()),
            peer_addr,
        })
    }
}

struct RunningProxy {
    addr: SocketAddr,
    _stop: oneshot::Sender<()>,
}

async fn spawn_proxy(resolver: Arc<dyn IdentityResolver>, backend: SocketAddr) -> RunningProxy {
    let upstream = Upstream::parse(&format!("http://{}/", backend)).unwrap();
    let state = ProxyState::new(resolver, upstream);

    let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        serve_proxy(listener, state, async move {
            let _ = stopped.await;
        })
        .await
        .unwrap();
    });
    RunningProxy { addr, _stop: stop }
}

// ────────────────────────────────────────────────────────────────────────────
// Proxy
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_forwards_with_exactly_one_identity_header() {
    let (backend, seen) = spawn_backend().await;
    let resolver = Arc::new(MockIdentityResolver::new());
    resolver.allow(LOOPBACK, "alice@example.com");
    let proxy = spawn_proxy(resolver.clone(), backend).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{}/d/abc?orgId=1", proxy.addr))
        .header("x-tailscale-user", "mallory@evil.test")
        .header("x-custom", "kept")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 201);
    assert_eq!(resp.headers()["x-backend"], "grafana");
    assert_eq!(resp.text().await.unwrap(), "dashboard-body");

    assert_eq!(seen.count(), 1);
    assert_eq!(resolver.calls(), 1);

    let headers = seen.last_headers();
    let users: Vec<_> = headers.get_all("x-tailscale-user").iter().collect();
    assert_eq!(users, vec!["alice@example.com"]);
    assert_eq!(headers["x-custom"], "kept");
    assert_eq!(headers["x-forwarded-host"], proxy.addr.to_string().as_str());
    assert_eq!(headers["x-origin-host"], backend.to_string().as_str());
    assert_eq!(headers["x-forwarded-for"], "127.0.0.1");

    let (method, uri) = seen.last_target();
    assert_eq!(method, "GET");
    assert_eq!(uri, "/d/abc?orgId=1");
}

#[tokio::test]
async fn test_preserves_method_and_body() {
    let (backend, seen) = spawn_backend().await;
    let resolver = Arc::new(MockIdentityResolver::with_default_login("bob@example.com"));
    let proxy = spawn_proxy(resolver, backend).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{}/api/ds/query", proxy.addr))
        .body("{\"queries\":[]}")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 201);
    let (method, uri) = seen.last_target();
    assert_eq!(method, "POST");
    assert_eq!(uri, "/api/ds/query");
}

#[tokio::test]
async fn test_lookup_failure_is_500_and_not_forwarded() {
    let (backend, seen) = spawn_backend().await;
    let resolver = Arc::new(MockIdentityResolver::new());
    resolver.fail(LOOPBACK, "control socket closed");
    let proxy = spawn_proxy(resolver, backend).await;

    let resp = reqwest::get(format!("http://{}/", proxy.addr)).await.unwrap();

    assert_eq!(resp.status().as_u16(), 500);
    assert_eq!(resp.text().await.unwrap(), LOOKUP_FAILED_MESSAGE);
    assert_eq!(seen.count(), 0);
}

#[tokio::test]
async fn test_empty_login_is_500_and_not_forwarded() {
    let (backend, seen) = spawn_backend().await;
    let resolver = Arc::new(MockIdentityResolver::new());
    resolver.empty(LOOPBACK);
    let proxy = spawn_proxy(resolver, backend).await;

    let resp = reqwest::get(format!("http://{}/login", proxy.addr)).await.unwrap();

    assert_eq!(resp.status().as_u16(), 500);
    assert_eq!(resp.text().await.unwrap(), UNIDENTIFIED_MESSAGE);
    assert_eq!(seen.count(), 0);
}

#[tokio::test]
async fn test_blank_login_from_successful_lookup_is_500() {
    let (backend, seen) = spawn_backend().await;
    let proxy = spawn_proxy(Arc::new(BlankLoginResolver), backend).await;

    let resp = reqwest::get(format!("http://{}/d/abc", proxy.addr)).await.unwrap();

    assert_eq!(resp.status().as_u16(), 500);
    assert_eq!(resp.text().await.unwrap(), UNIDENTIFIED_MESSAGE);
    assert_eq!(seen.count(), 0);
}

#[tokio::test]
async fn test_websocket_upgrade_is_bridged() {
    let (backend, last_head) = spawn_upgrading_backend().await;
    let resolver = Arc::new(MockIdentityResolver::with_default_login("erin@example.com"));
    let proxy = spawn_proxy(resolver, backend).await;

    let mut conn = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET /api/live/ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\r\n",
        proxy.addr
    );
    conn.write_all(request.as_bytes()).await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), read_head(&mut conn))
        .await
        .unwrap()
        .to_ascii_lowercase();
    assert!(response.starts_with("http/1.1 101"), "{response}");
    assert!(response.contains("upgrade: websocket"), "{response}");

    let seen = last_head.lock().unwrap().clone().unwrap().to_ascii_lowercase();
    assert!(seen.starts_with("get /api/live/ws http/1.1"), "{seen}");
    assert!(seen.contains("connection: upgrade"), "{seen}");
    assert!(seen.contains("upgrade: websocket"), "{seen}");
    assert!(seen.contains("x-tailscale-user: erin@example.com"), "{seen}");

    conn.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_unrequested_protocol_switch_is_502() {
    let (backend, _) = spawn_upgrading_backend().await;
    let resolver = Arc::new(MockIdentityResolver::with_default_login("erin@example.com"));
    let proxy = spawn_proxy(resolver, backend).await;

    let resp = reqwest::get(format!("http://{}/api/live/ws", proxy.addr)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 502);

    let resp = reqwest::Client::new()
        .get(format!("http://{}/api/live/ws", proxy.addr))
        .header("connection", "upgrade")
        .header("upgrade", "h2c")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 502);
}

#[tokio::test]
async fn test_unreachable_backend_is_502() {
    // Grab a free port, then close it.
    let closed = {
        let l = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        l.local_addr().unwrap()
    };
    let resolver = Arc::new(MockIdentityResolver::with_default_login("carol@example.com"));
    let proxy = spawn_proxy(resolver, closed).await;

    let resp = reqwest::get(format!("http://{}/", proxy.addr)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 502);
}

#[tokio::test]
async fn test_listener_survives_failed_requests() {
    let (backend, seen) = spawn_backend().await;
    let resolver = Arc::new(MockIdentityResolver::new());
    resolver.empty(LOOPBACK);
    let proxy = spawn_proxy(resolver.clone(), backend).await;

    let first = reqwest::get(format!("http://{}/", proxy.addr)).await.unwrap();
    assert_eq!(first.status().as_u16(), 500);

    resolver.allow(LOOPBACK, "dave@example.com");
    let second = reqwest::get(format!("http://{}/", proxy.addr)).await.unwrap();
    assert_eq!(second.status().as_u16(), 201);
    assert_eq!(seen.count(), 1);
}

// ────────────────────────────────────────────────────────────────────────────
// Placeholder
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_placeholder_answers_any_path() {
    let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        serve_placeholder(listener, "web.1", async move {
            let _ = stopped.await;
        })
        .await
        .unwrap();
    });

    let client = reqwest::Client::new();
    for path in ["/", "/anything/at/all?x=1"] {
        let resp = client.get(format!("http://{}{}", addr, path)).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.text().await.unwrap(), "Welcome! Hello from web.1");
    }

    let resp = client.delete(format!("http://{}/x", addr)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}
