//! Integration tests exercising the public API across real loopback
//! sockets, matching the §8 example scenarios.

use std::sync::Arc;
use std::time::Duration;

use gocat_core::connector::{self, RetryPolicy};
use gocat_core::listener::{self, Handler};
use gocat_core::log::{Log, NullLog};
use gocat_core::metrics::NullMetrics;
use gocat_core::signal::CancelToken;
use gocat_core::transport::{Connection, Endpoint, Family, ShutdownDirection};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn listen_then_connect_echoes_a_single_message() {
    // Bind an ephemeral port, serve a handler that echoes back whatever it
    // reads, then dial it from the Connector and confirm a round trip.
    let endpoint = Endpoint::Tcp {
        host: "127.0.0.1".to_string(),
        port: 0,
        family: Family::V4,
    };
    let probe = gocat_core::transport::bind(&endpoint).await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let serve_endpoint = Endpoint::Tcp {
        host: addr.ip().to_string(),
        port: addr.port(),
        family: Family::V4,
    };

    let handler: Handler = Arc::new(|mut conn: Connection, _peer| {
        Box::pin(async move {
            let mut buf = [0u8; 64];
            if let Ok(n) = conn.read(&mut buf).await {
                if n > 0 {
                    let _ = conn.write_all(&buf[..n]).await;
                }
            }
            let _ = conn.shutdown(ShutdownDirection::Write).await;
        })
    });

    let cancel = CancelToken::new();
    let cancel_for_serve = cancel.clone();
    let log: Arc<dyn Log> = Arc::new(NullLog);
    let serve_handle = tokio::spawn(async move {
        listener::serve(
            &serve_endpoint,
            handler,
            4,
            Duration::from_millis(200),
            cancel_for_serve,
            log,
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let dial_endpoint = Endpoint::Tcp {
        host: addr.ip().to_string(),
        port: addr.port(),
        family: Family::V4,
    };
    let cancel_for_dial = CancelToken::new();
    let mut conn = connector::connect(
        &dial_endpoint,
        &RetryPolicy::default(),
        Duration::from_secs(2),
        &cancel_for_dial,
        &NullLog,
        &NullMetrics,
    )
    .await
    .unwrap();

    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), serve_handle)
        .await
        .expect("serve did not stop in time")
        .expect("serve task panicked")
        .unwrap();
}

#[tokio::test]
async fn connector_retries_until_the_listener_comes_up() {
    // Dial a port before anything is listening; spin up a listener shortly
    // after and confirm the retrying Connector eventually succeeds.
    let probe_endpoint = Endpoint::Tcp {
        host: "127.0.0.1".to_string(),
        port: 0,
        family: Family::V4,
    };
    let probe = gocat_core::transport::bind(&probe_endpoint).await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe); // port is free again; nothing listens on it yet

    let serve_endpoint = Endpoint::Tcp {
        host: addr.ip().to_string(),
        port: addr.port(),
        family: Family::V4,
    };
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let handler: Handler = Arc::new(|mut conn: Connection, _peer| {
            Box::pin(async move {
                let _ = conn.shutdown(ShutdownDirection::Write).await;
            })
        });
        let _ = listener::serve(
            &serve_endpoint,
            handler,
            4,
            Duration::from_millis(100),
            CancelToken::new(),
            Arc::new(NullLog),
        )
        .await;
    });

    let dial_endpoint = Endpoint::Tcp {
        host: addr.ip().to_string(),
        port: addr.port(),
        family: Family::V4,
    };
    let policy = RetryPolicy {
        max_attempts: 10,
        initial_backoff: Duration::from_millis(30),
        jitter: false,
        ..RetryPolicy::default()
    };
    let cancel = CancelToken::new();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        connector::connect(
            &dial_endpoint,
            &policy,
            Duration::from_millis(200),
            &cancel,
            &NullLog,
            &NullMetrics,
        ),
    )
    .await
    .expect("connect did not resolve in time");

    assert!(result.is_ok());
}
