//! Listener (§4.5): bind, accept loop with a concurrency cap, per-connection
//! handler dispatch.
//!
//! The accept loop shape (re-armed per-iteration deadline, transient-error
//! backoff, graceful shutdown with a grace period) follows the same pattern
//! `thomas0903-lan-scan-rs`'s scanner uses for its worker loop (bounded
//! `Semaphore` + `JoinSet` + `CancellationToken`), generalised here to an
//! accept loop instead of a port-probe loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{AssertUnwindSafe, FutureExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::error::GocatError;
use crate::fields;
use crate::log::Log;
use crate::signal::CancelToken;
use crate::transport::{self, Connection, Endpoint, Listener as TransportListener};

/// Default per-accept-iteration deadline; re-armed every loop (§4.5).
const ACCEPT_DEADLINE: Duration = Duration::from_millis(500);
/// Backoff applied after a transient accept error, e.g. `EMFILE` (§4.5).
const TRANSIENT_ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// Default grace period before force-closing in-flight handlers (§4.5).
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A connection handler capability (§4.5): consumes one accepted
/// [`Connection`] and drives it to completion. Specified handlers include
/// pipe-to-stdio, pipe-to-spawned-process, and broadcast; the Listener does
/// not distinguish between them.
pub type Handler = Arc<dyn Fn(Connection, SocketAddr) -> BoxedHandlerFuture + Send + Sync>;
pub type BoxedHandlerFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// `serve(endpoint, handler, concurrency_cap, cancel) -> ()` (§4.5).
///
/// `concurrency_cap == 0` means unbounded (no semaphore acquired).
pub async fn serve(
    endpoint: &Endpoint,
    handler: Handler,
    concurrency_cap: usize,
    shutdown_grace: Duration,
    cancel: CancelToken,
    log: Arc<dyn Log>,
) -> Result<(), GocatError> {
    let listener = transport::bind(endpoint).await?;
    let semaphore = (concurrency_cap > 0).then(|| Arc::new(Semaphore::new(concurrency_cap)));
    let mut in_flight = JoinSet::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match &listener {
            TransportListener::Udp(socket) => {
                let mut buf = vec![0u8; 64 * 1024];
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = timeout(ACCEPT_DEADLINE, socket.recv_from(&mut buf)) => {
                        match res {
                            Err(_) => continue, // deadline elapsed, recheck cancellation
                            Ok(Ok((_n, _peer))) => {
                                // UDP dispatch is per-datagram; a full duplex
                                // Connection for this peer is out of scope for
                                // `serve`'s generic loop (see `relay.rs` for
                                // the UDP relay path). Datagram delivery to a
                                // handler is left to higher-level callers.
                                continue;
                            }
                            Ok(Err(e)) => {
                                log.warn("udp recv_from failed", &fields![("error", e.to_string())]);
                                tokio::time::sleep(TRANSIENT_ACCEPT_BACKOFF).await;
                            }
                        }
                    }
                }
            }
            _ => {
                // Acquire the concurrency-cap permit *before* accepting
                // (§4.5: "Acquire before dispatching a handler... If the
                // semaphore is full, accept is delayed; the pending incoming
                // TCP connection queues in the kernel backlog"). Holding the
                // accept call until a permit is free is what keeps
                // in-process state bounded; acquiring it inside the spawned
                // handler instead would accept unboundedly many connections
                // ahead of the cap.
                let permit = match &semaphore {
                    Some(sem) => {
                        let sem = sem.clone();
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            res = sem.acquire_owned() => match res {
                                Ok(permit) => Some(permit),
                                Err(_) => break, // semaphore closed; shutting down
                            },
                        }
                    }
                    None => None,
                };

                match timeout(ACCEPT_DEADLINE, listener.accept(ACCEPT_DEADLINE)).await {
                    Err(_) => continue, // no connection within the deadline; permit released, recheck cancellation
                    Ok(Ok((conn, peer))) => {
                        dispatch(conn, peer, &handler, permit, &mut in_flight, &log);
                    }
                    Ok(Err(GocatError::Timeout)) => continue,
                    Ok(Err(e)) if is_transient_accept_error(&e) => {
                        log.warn("transient accept error", &fields![("error", e.to_string())]);
                        tokio::time::sleep(TRANSIENT_ACCEPT_BACKOFF).await;
                    }
                    Ok(Err(e)) => {
                        log.error("fatal accept error; stopping listener", &fields![("error", e.to_string())]);
                        return Err(e);
                    }
                }
            }
        }
    }

    graceful_shutdown(in_flight, shutdown_grace, &log).await;
    Ok(())
}

fn dispatch(
    conn: Connection,
    peer: SocketAddr,
    handler: &Handler,
    permit: Option<OwnedSemaphorePermit>,
    in_flight: &mut JoinSet<()>,
    log: &Arc<dyn Log>,
) {
    let handler = handler.clone();
    let log = log.clone();
    in_flight.spawn(async move {
        // Held for the handler's lifetime; already acquired by the accept
        // loop before this connection was accepted (see `serve`).
        let _permit = permit;
        let fut = handler(conn, peer);
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            let message = panic_message(&panic);
            log.error(
                "connection handler panicked",
                &fields![("peer", peer.to_string()), ("panic", message.as_str())],
            );
        }
    });
}

async fn graceful_shutdown(mut in_flight: JoinSet<()>, grace: Duration, log: &Arc<dyn Log>) {
    match timeout(grace, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await
    {
        Ok(()) => {}
        Err(_) => {
            log.warn(
                "shutdown grace period elapsed; force-closing remaining handlers",
                &fields![("in_flight", in_flight.len() as i64)],
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
    }
}

/// Transient accept-loop errors (§4.5), e.g. the process hitting its open
/// file descriptor limit (`EMFILE`/`ENFILE`) — distinct from the Connector's
/// dial-level transient classification in [`GocatError::is_transient`].
fn is_transient_accept_error(err: &GocatError) -> bool {
    const EMFILE: i32 = 24;
    const ENFILE: i32 = 23;
    const ECONNABORTED: i32 = 103;
    match err {
        GocatError::Io(io_err) => matches!(
            io_err.raw_os_error(),
            Some(EMFILE) | Some(ENFILE) | Some(ECONNABORTED)
        ) || io_err.kind() == std::io::ErrorKind::ConnectionAborted,
        _ => false,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Aggregate forward/reverse byte counters for a Relay session (§3), and a
/// standalone connection counter usable by `serve` callers that want
/// visibility into how many handlers are currently in flight.
#[derive(Debug, Default)]
pub struct ActiveConnections {
    count: AtomicI64,
}

impl ActiveConnections {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
    pub fn decrement(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
    pub fn get(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NullLog;
    use crate::transport::Family;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn serve_dispatches_accepted_connections() {
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
            family: Family::V4,
        };
        let listener = transport::bind(&endpoint).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener); // free the port; serve() will rebind it

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let handler: Handler = Arc::new(move |mut conn: Connection, _peer: SocketAddr| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = conn.shutdown(crate::transport::ShutdownDirection::Write).await;
            })
        });

        let cancel = CancelToken::new();
        let cancel_for_serve = cancel.clone();
        let endpoint_for_serve = Endpoint::Tcp {
            host: addr.ip().to_string(),
            port: addr.port(),
            family: Family::V4,
        };
        let log: Arc<dyn Log> = Arc::new(NullLog);
        let serve_handle = tokio::spawn(async move {
            serve(
                &endpoint_for_serve,
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
        let mut client = transport::dial(&dial_endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        client.write_all(b"hi").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), serve_handle)
            .await
            .expect("serve did not stop in time")
            .expect("serve task panicked")
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
