//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use forward_proxy::config::ProxyConfig;
use forward_proxy::lifecycle::Shutdown;
use forward_proxy::pool::{ConnectionPool, Destination, PoolStats};
use forward_proxy::{HttpServer, ProxyOrchestrator};

/// What an upstream saw for one request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A running mock upstream.
#[derive(Clone)]
pub struct Backend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl Backend {
    pub fn destination(&self) -> Destination {
        Destination::http("127.0.0.1", self.addr.port())
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn bind() -> (TcpListener, Backend) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = Backend {
        addr: listener.local_addr().unwrap(),
        connections: Arc::new(AtomicUsize::new(0)),
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    (listener, backend)
}

/// Keep-alive HTTP/1.1 upstream that answers with the request body and
/// records every request. Responses carry a hop-by-hop `Keep-Alive` header
/// and an `x-upstream: echo` marker.
pub async fn start_echo_backend() -> Backend {
    let (listener, backend) = bind().await;
    let state = backend.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            state.connections.fetch_add(1, Ordering::SeqCst);
            let requests = state.requests.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let requests = requests.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await?.to_bytes();
                        requests.lock().unwrap().push(RecordedRequest {
                            method: parts.method,
                            uri: parts.uri,
                            headers: parts.headers,
                            body: body.clone(),
                        });
                        let response = Response::builder()
                            .status(200)
                            .header("keep-alive", "timeout=5")
                            .header("x-upstream", "echo")
                            .body(Full::new(body))
                            .unwrap();
                        Ok::<_, hyper::Error>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    backend
}

/// Upstream that reads the start of each request, then drops the socket.
pub async fn start_reset_backend() -> Backend {
    let (listener, backend) = bind().await;
    let state = backend.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            state.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                drop(socket);
            });
        }
    });

    backend
}

/// Upstream that accepts requests and never answers.
pub async fn start_silent_backend() -> Backend {
    let (listener, backend) = bind().await;
    let state = backend.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            state.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    backend
}

/// Upstream whose chunked response body never ends: one `tick\n` chunk
/// every 20ms until the socket breaks.
pub async fn start_streaming_backend() -> Backend {
    let (listener, backend) = bind().await;
    let state = backend.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            state.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                    if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let head = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n";
                if socket.write_all(head).await.is_err() {
                    return;
                }
                loop {
                    if socket.write_all(b"5\r\ntick\n\r\n").await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            });
        }
    });

    backend
}

/// Config tuned for fast tests.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.timeouts.connect_ms = 1_000;
    config.timeouts.acquire_ms = 1_000;
    config.timeouts.attempt_ms = 2_000;
    config.timeouts.stream_idle_ms = 2_000;
    config.timeouts.request_secs = 10;
    config.retries.base_delay_ms = 1;
    config.retries.max_delay_ms = 10;
    config
}

/// A proxy server running on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: tokio::task::JoinHandle<()>,
    pub orchestrator: Arc<ProxyOrchestrator>,
}

/// Start the inbound server on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let shutdown = Shutdown::new();
    let server = HttpServer::new(config, shutdown.token()).unwrap();
    let orchestrator = server.orchestrator().clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_shutdown = shutdown.subscribe();

    let handle = tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    TestProxy {
        addr,
        shutdown,
        handle,
        orchestrator,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Poll until the pool reaches `expected` for `destination`.
pub async fn wait_for_stats(pool: &ConnectionPool, destination: &Destination, expected: PoolStats) {
    for _ in 0..200 {
        if pool.stats(destination) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "pool never reached {:?}, last seen {:?}",
        expected,
        pool.stats(destination)
    );
}
