//! Relay (§4.6): a Listener composed with a per-connection outbound
//! Connector, wired through the Pipe engine (§4.3) with a direction mask.
//!
//! Grounded on `ztunnel`'s `Proxy` (`proxy.rs`, `other_examples` pack),
//! which composes an `Inbound` accept loop with an `Outbound` dialer through
//! a shared copy routine; here the Listener (`src/listener.rs`) plays
//! `Inbound` and the Connector (`src/connector.rs`) plays `Outbound`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connector::{self, RetryPolicy};
use crate::error::GocatError;
use crate::fields;
use crate::listener::{self, DEFAULT_SHUTDOWN_GRACE};
use crate::log::Log;
use crate::metrics::MetricsSink;
use crate::pipe::{self, PipeConfig};
use crate::signal::CancelToken;
use crate::transport::{Connection, Endpoint};

/// Which directions a relay session copies (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Bidirectional,
    ForwardOnly,
    ReverseOnly,
}

/// `RelayStats` (§3): aggregated, atomically-updated byte counters across
/// every session a relay has ever wired, monotonically non-decreasing.
#[derive(Debug, Default)]
pub struct RelayStats {
    forward_bytes: AtomicI64,
    reverse_bytes: AtomicI64,
}

impl RelayStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn forward_bytes(&self) -> i64 {
        self.forward_bytes.load(Ordering::Relaxed)
    }

    pub fn reverse_bytes(&self) -> i64 {
        self.reverse_bytes.load(Ordering::Relaxed)
    }

    fn add(&self, forward: u64, reverse: u64) {
        self.forward_bytes.fetch_add(forward as i64, Ordering::Relaxed);
        self.reverse_bytes.fetch_add(reverse as i64, Ordering::Relaxed);
    }
}

/// Configuration for one [`relay`] invocation.
pub struct RelayConfig {
    pub mode: RelayMode,
    pub concurrency_cap: usize,
    pub buffer_size: usize,
    pub read_slice: Duration,
    pub dial_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub shutdown_grace: Duration,
    /// `SO_KEEPALIVE` on both legs of every relayed session (§6 `defaults.keep_alive`).
    pub keep_alive: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Bidirectional,
            concurrency_cap: 0,
            buffer_size: pipe::DEFAULT_BUFFER_SIZE,
            read_slice: pipe::DEFAULT_READ_SLICE,
            dial_timeout: Duration::from_secs(10),
            // No retries by default for relay (§4.6): each accepted
            // connection gets one outbound dial attempt.
            retry_policy: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            keep_alive: false,
        }
    }
}

/// `relay(listen_endpoint, target_endpoint, mode, cancel) -> ()` (§4.6).
pub async fn relay(
    listen_endpoint: Endpoint,
    target_endpoint: Endpoint,
    config: RelayConfig,
    cancel: CancelToken,
    log: Arc<dyn Log>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<Arc<RelayStats>, GocatError> {
    let stats = RelayStats::new();
    let stats_for_handler = stats.clone();
    let target_endpoint = Arc::new(target_endpoint);
    let mode = config.mode;
    let buffer_size = config.buffer_size;
    let read_slice = config.read_slice;
    let dial_timeout = config.dial_timeout;
    let keep_alive = config.keep_alive;
    let retry_policy = Arc::new(config.retry_policy);
    let log_for_handler = log.clone();
    let metrics_for_handler = metrics.clone();

    let handler: listener::Handler = Arc::new(move |inbound: Connection, peer: SocketAddr| {
        let target_endpoint = target_endpoint.clone();
        let retry_policy = retry_policy.clone();
        let stats = stats_for_handler.clone();
        let log = log_for_handler.clone();
        let metrics = metrics_for_handler.clone();
        Box::pin(async move {
            handle_session(
                inbound,
                peer,
                &target_endpoint,
                &retry_policy,
                dial_timeout,
                mode,
                buffer_size,
                read_slice,
                keep_alive,
                stats,
                log,
                metrics,
            )
            .await;
        })
    });

    listener::serve(
        &listen_endpoint,
        handler,
        config.concurrency_cap,
        config.shutdown_grace,
        cancel,
        log,
    )
    .await?;

    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
async fn handle_session(
    mut inbound: Connection,
    peer: SocketAddr,
    target_endpoint: &Endpoint,
    retry_policy: &RetryPolicy,
    dial_timeout: Duration,
    mode: RelayMode,
    buffer_size: usize,
    read_slice: Duration,
    keep_alive: bool,
    stats: Arc<RelayStats>,
    log: Arc<dyn Log>,
    metrics: Arc<dyn MetricsSink>,
) {
    let session_cancel = CancelToken::new();
    if keep_alive {
        let _ = inbound.set_keepalive(true);
    }
    let outbound = match connector::connect(
        target_endpoint,
        retry_policy,
        dial_timeout,
        &session_cancel,
        log.as_ref(),
        metrics.as_ref(),
    )
    .await
    {
        Ok(conn) => {
            if keep_alive {
                let _ = conn.set_keepalive(true);
            }
            conn
        }
        Err(e) => {
            log.warn(
                "relay outbound dial failed; closing inbound connection",
                &fields![("peer", peer.to_string()), ("error", e.to_string())],
            );
            let _ = inbound
                .shutdown(crate::transport::ShutdownDirection::Both)
                .await;
            return;
        }
    };

    match mode {
        RelayMode::Bidirectional => {
            let pipe_config = PipeConfig::new(session_cancel, log.clone());
            let pipe_config = PipeConfig {
                buffer_size,
                read_slice,
                ..pipe_config
            };
            let outcome = pipe::run(inbound, outbound, pipe_config).await;
            stats.add(outcome.a_to_b_bytes, outcome.b_to_a_bytes);
        }
        RelayMode::ForwardOnly => {
            let (mut src, mut dst) = (inbound, outbound);
            let copied = pipe::run_with_buffer(&mut src, &mut dst, buffer_size)
                .await
                .unwrap_or(0);
            let _ = dst.shutdown(crate::transport::ShutdownDirection::Both).await;
            stats.add(copied, 0);
        }
        RelayMode::ReverseOnly => {
            let (mut src, mut dst) = (outbound, inbound);
            let copied = pipe::run_with_buffer(&mut src, &mut dst, buffer_size)
                .await
                .unwrap_or(0);
            let _ = dst.shutdown(crate::transport::ShutdownDirection::Both).await;
            stats.add(0, copied);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NullLog;
    use crate::metrics::NullMetrics;
    use crate::transport::{self, Family, ShutdownDirection};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server(addr: &str) -> SocketAddr {
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
            family: Family::V4,
        };
        let _ = addr;
        let listener = transport::bind(&endpoint).await.unwrap();
        let bound = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let accept = listener.accept(Duration::from_secs(5)).await;
                let (mut conn, _peer) = match accept {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = conn.shutdown(ShutdownDirection::Write).await;
                });
            }
        });
        bound
    }

    #[tokio::test]
    async fn relay_forwards_bidirectional_traffic_and_counts_bytes() {
        let echo_addr = echo_server("127.0.0.1:0").await;

        let listen_endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
            family: Family::V4,
        };
        let probe = transport::bind(&listen_endpoint).await.unwrap();
        let relay_addr = probe.local_addr().unwrap();
        drop(probe);

        let target_endpoint = Endpoint::Tcp {
            host: echo_addr.ip().to_string(),
            port: echo_addr.port(),
            family: Family::V4,
        };
        let listen_for_relay = Endpoint::Tcp {
            host: relay_addr.ip().to_string(),
            port: relay_addr.port(),
            family: Family::V4,
        };

        let cancel = CancelToken::new();
        let cancel_for_relay = cancel.clone();
        let log: Arc<dyn Log> = Arc::new(NullLog);
        let metrics: Arc<dyn MetricsSink> = Arc::new(NullMetrics);
        let relay_handle = tokio::spawn(async move {
            relay(
                listen_for_relay,
                target_endpoint,
                RelayConfig::default(),
                cancel_for_relay,
                log,
                metrics,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let client_endpoint = Endpoint::Tcp {
            host: relay_addr.ip().to_string(),
            port: relay_addr.port(),
            family: Family::V4,
        };
        let mut client = transport::dial(&client_endpoint, Duration::from_secs(2))
            .await
            .unwrap();
        client.write_all(b"PING\n").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING\n");

        client.shutdown(ShutdownDirection::Write).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(2), relay_handle)
            .await
            .expect("relay did not stop in time")
            .expect("relay task panicked")
            .unwrap();

        assert_eq!(stats.forward_bytes(), 5);
        assert_eq!(stats.reverse_bytes(), 5);
    }
}
