//! Failure injection tests for the forwarding core.

use axum::body::Body;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use forward_proxy::forward::{FailureKind, ForwardRequest, RequestBody};
use forward_proxy::lifecycle::Shutdown;
use forward_proxy::pool::{ConnectionPool, IdleEvictor, PoolSettings, PoolStats};
use forward_proxy::{respond, ProxyError, ProxyOrchestrator};

mod common;

#[tokio::test]
async fn test_idempotent_get_fails_after_max_attempts() {
    let backend = common::start_reset_backend().await;
    let mut config = common::test_config();
    config.upstream.address = Some(backend.url());
    config.retries.max_retries = 2;
    let proxy = common::start_proxy(config).await;

    let res = common::client()
        .get(format!("http://{}/flaky", proxy.addr))
        .send()
        .await
        .expect("proxy unreachable");

    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(backend.connection_count(), 3, "max_retries + 1 attempts");

    proxy.shutdown.trigger();
}

#[tokio::test]
async fn test_concurrent_failing_gets_each_get_every_attempt() {
    let backend = common::start_reset_backend().await;
    let dest = backend.destination();
    let mut config = forward_proxy::ProxyConfig::default();
    config.retries.base_delay_ms = 1;
    config.retries.max_delay_ms = 5;
    let proxy = Arc::new(ProxyOrchestrator::new(&config));

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let proxy = proxy.clone();
            let dest = dest.clone();
            tokio::spawn(async move {
                let request = ForwardRequest::new(Method::GET, format!("/burst/{}", i).parse().unwrap());
                proxy.proxy(&dest, request, CancellationToken::new()).await
            })
        })
        .collect();

    for task in tasks {
        match task.await.unwrap() {
            Err(ProxyError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected outcome: {:?}", other.map(|r| r.status())),
        }
    }
    assert_eq!(backend.connection_count(), 60);
}

#[tokio::test]
async fn test_retry_recovers_when_upstream_comes_back() {
    // First connection is reset, later ones are served by the echo upstream.
    let echo = common::start_echo_backend().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let front = listener.local_addr().unwrap();
    let echo_addr = echo.addr;
    tokio::spawn(async move {
        let mut first = true;
        while let Ok((mut inbound, _)) = listener.accept().await {
            if first {
                first = false;
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut inbound, &mut buf).await;
                drop(inbound);
                continue;
            }
            tokio::spawn(async move {
                if let Ok(mut outbound) = tokio::net::TcpStream::connect(echo_addr).await {
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                }
            });
        }
    });

    let proxy = ProxyOrchestrator::new(&common::test_config());
    let dest = forward_proxy::Destination::http("127.0.0.1", front.port());
    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
    let request = ForwardRequest::new(Method::GET, "/recover".parse().unwrap())
        .with_headers(headers)
        .with_client_addr("192.0.2.7".parse().unwrap());

    let response = proxy
        .proxy(&dest, request, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let recorded = echo.recorded();
    assert_eq!(recorded.len(), 1);
    let chain: Vec<&str> = recorded[0]
        .headers
        .get_all("x-forwarded-for")
        .iter()
        .map(|v| v.to_str().unwrap())
        .collect();
    assert_eq!(chain, vec!["10.0.0.1, 192.0.2.7"], "client appended once across attempts");
}

#[tokio::test]
async fn test_streaming_post_reset_is_fatal_after_one_attempt() {
    let backend = common::start_reset_backend().await;
    let proxy = ProxyOrchestrator::new(&common::test_config());

    let chunks: Vec<Result<Bytes, std::io::Error>> =
        (0..32).map(|_| Ok(Bytes::from(vec![b'x'; 8192]))).collect();
    let request = ForwardRequest::new(Method::POST, "/upload".parse().unwrap())
        .with_body(RequestBody::streaming(Body::from_stream(futures_util::stream::iter(chunks))))
        .mark_idempotent();

    let err = proxy
        .proxy(&backend.destination(), request, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ProxyError::Fatal(_)), "got {:?}", err);
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(backend.connection_count(), 1);
    assert_eq!(proxy.pool().stats(&backend.destination()), PoolStats::default());
}

#[tokio::test]
async fn test_attempt_timeout_maps_to_gateway_timeout() {
    let backend = common::start_silent_backend().await;
    let mut config = common::test_config();
    config.timeouts.attempt_ms = 100;
    config.retries.max_retries = 1;
    let proxy = ProxyOrchestrator::new(&config);

    let request = ForwardRequest::new(Method::GET, "/slow".parse().unwrap());
    let err = proxy
        .proxy(&backend.destination(), request, CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        ProxyError::RetriesExhausted { attempts, last } => {
            assert_eq!(*attempts, 2);
            assert_eq!(last.kind, FailureKind::Timeout);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(respond(Err(err)).status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(backend.connection_count(), 2);
}

#[tokio::test]
async fn test_pool_exhaustion_returns_503() {
    let backend = common::start_streaming_backend().await;
    let dest = backend.destination();
    let mut config = common::test_config();
    config.pool.max_connections_per_destination = 1;
    config.timeouts.acquire_ms = 100;
    let proxy = ProxyOrchestrator::new(&config);

    // The first response holds the only connection while its body streams.
    let first = proxy
        .proxy(
            &dest,
            ForwardRequest::new(Method::GET, "/feed".parse().unwrap()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(proxy.pool().stats(&dest), PoolStats { in_use: 1, idle: 0 });

    let err = proxy
        .proxy(
            &dest,
            ForwardRequest::new(Method::GET, "/feed".parse().unwrap()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::PoolExhausted { .. }));

    let response = respond(Err(err));
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(backend.connection_count(), 1);

    drop(first);
    common::wait_for_stats(proxy.pool(), &dest, PoolStats::default()).await;
}

#[tokio::test]
async fn test_mid_stream_cancellation_releases_connection() {
    let backend = common::start_streaming_backend().await;
    let dest = backend.destination();
    let proxy = ProxyOrchestrator::new(&common::test_config());
    let cancel = CancellationToken::new();

    let response = proxy
        .proxy(
            &dest,
            ForwardRequest::new(Method::GET, "/feed".parse().unwrap()),
            cancel.clone(),
        )
        .await
        .unwrap();
    let mut body = response.into_body();

    for _ in 0..3 {
        let chunk = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(chunk.as_ref(), b"tick\n");
    }

    cancel.cancel();
    let mut aborted = false;
    while let Some(frame) = body.frame().await {
        aborted = frame.is_err();
    }
    assert!(aborted, "cancelled body ends with an error");
    common::wait_for_stats(proxy.pool(), &dest, PoolStats::default()).await;

    // The next request needs a fresh connection.
    let again = proxy
        .proxy(
            &dest,
            ForwardRequest::new(Method::GET, "/feed".parse().unwrap()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    drop(again);
    assert_eq!(backend.connection_count(), 2);
}

#[tokio::test]
async fn test_client_disconnect_mid_stream_releases_connection() {
    let backend = common::start_streaming_backend().await;
    let dest = backend.destination();
    let mut config = common::test_config();
    config.upstream.address = Some(backend.url());
    let proxy = common::start_proxy(config).await;

    let mut res = common::client()
        .get(format!("http://{}/feed", proxy.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let chunk = res.chunk().await.unwrap().unwrap();
    assert!(chunk.starts_with(b"tick"));
    assert_eq!(proxy.orchestrator.pool().stats(&dest).in_use, 1);

    drop(res);
    common::wait_for_stats(proxy.orchestrator.pool(), &dest, PoolStats::default()).await;

    proxy.shutdown.trigger();
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_stream() {
    let backend = common::start_streaming_backend().await;
    let dest = backend.destination();
    let mut config = common::test_config();
    config.upstream.address = Some(backend.url());
    let proxy = common::start_proxy(config).await;

    let mut res = common::client()
        .get(format!("http://{}/feed", proxy.addr))
        .send()
        .await
        .unwrap();
    assert!(res.chunk().await.unwrap().is_some());

    proxy.shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), proxy.handle)
        .await
        .expect("server drains once the stream is cancelled")
        .unwrap();

    // The relay stopped without a clean end of body.
    let mut ended_cleanly = false;
    loop {
        match res.chunk().await {
            Ok(Some(_)) => continue,
            Ok(None) => {
                ended_cleanly = true;
                break;
            }
            Err(_) => break,
        }
    }
    assert!(!ended_cleanly, "cancelled stream must not look complete");
    common::wait_for_stats(proxy.orchestrator.pool(), &dest, PoolStats::default()).await;
}

#[tokio::test]
async fn test_request_back_to_proxy_is_refused() {
    let mut config = common::test_config();
    config.upstream.address = None;
    let proxy = common::start_proxy(config).await;

    // reqwest sets Host to the proxy's own address.
    let res = tokio::time::timeout(
        Duration::from_secs(2),
        common::client().get(format!("http://{}/loop", proxy.addr)).send(),
    )
    .await
    .expect("refused without looping")
    .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    proxy.shutdown.trigger();
}

#[tokio::test]
async fn test_idle_connections_are_evicted() {
    let backend = common::start_echo_backend().await;
    let dest = backend.destination();
    let config = common::test_config();
    let pool = Arc::new(ConnectionPool::new(PoolSettings {
        max_per_destination: 4,
        connect_timeout: Duration::from_secs(1),
        idle_ttl: Duration::from_millis(150),
    }));
    let proxy = ProxyOrchestrator::with_pool(&config, pool.clone());

    let shutdown = Shutdown::new();
    let evictor = IdleEvictor::new(pool.clone(), Duration::from_millis(20), Duration::from_millis(150));
    let evictor_task = tokio::spawn(evictor.run(shutdown.subscribe()));

    let response = proxy
        .proxy(
            &dest,
            ForwardRequest::new(Method::GET, "/once".parse().unwrap()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    common::wait_for_stats(&pool, &dest, PoolStats { in_use: 0, idle: 1 }).await;

    common::wait_for_stats(&pool, &dest, PoolStats::default()).await;

    let response = proxy
        .proxy(
            &dest,
            ForwardRequest::new(Method::GET, "/twice".parse().unwrap()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(backend.connection_count(), 2, "evicted connection was not reused");

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), evictor_task)
        .await
        .expect("evictor exits on shutdown")
        .unwrap();
}
