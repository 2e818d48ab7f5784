//! Port Scanner (§4.7): bounded-parallelism TCP/UDP reachability probing
//! over an arbitrary port set against one host.
//!
//! The worker pool shape (a `Semaphore`-bounded `JoinSet` draining an
//! in-memory queue of ports, each worker independent) is carried over from
//! the teacher's `scan_targets_internal` (`thomas0903-lan-scan-rs`); the
//! per-result classification is rebuilt to the `Open`/`Closed`/`Filtered`
//! taxonomy of §3/§4.7 instead of the teacher's open-only banner-grab model.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::error::GocatError;
use crate::signal::CancelToken;
use crate::transport::Family;

/// One port-probe outcome (§3). `Filtered` means no response within the
/// deadline; `Closed` means explicit refusal; `Open` means a successful
/// handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanResult {
    pub port: u16,
    pub state: PortState,
    pub rtt: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProtocol {
    Tcp,
    Udp,
}

/// `ScanJob` (§3): the input to [`scan`].
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub target_host: String,
    pub ports: Vec<u16>,
    pub protocol: ScanProtocol,
    pub family: Family,
    pub per_port_timeout: Duration,
    pub concurrency: u32,
    pub report_closed: bool,
}

impl ScanJob {
    pub fn new(target_host: impl Into<String>, ports: impl Into<Vec<u16>>) -> Self {
        Self {
            target_host: target_host.into(),
            ports: ports.into(),
            protocol: ScanProtocol::Tcp,
            family: Family::Any,
            per_port_timeout: Duration::from_millis(500),
            concurrency: 500,
            report_closed: true,
        }
    }
}

/// `Summary` (§4.7): the scan's final tally.
#[derive(Debug, Clone, Copy, Default)]
pub struct Summary {
    pub total: u64,
    pub open: u64,
    pub closed: u64,
    pub filtered: u64,
    pub elapsed: Duration,
}

/// `scan(job, result_sink) -> Summary` (§4.7).
///
/// Emits every result through `result_sink` regardless of state; it is the
/// sink's responsibility to honour `job.report_closed` when deciding what to
/// display. Results may arrive out of port order (§4.7: "tie-break for
/// concurrent connects is irrelevant").
pub async fn scan<F>(job: ScanJob, result_sink: F) -> Result<Summary, GocatError>
where
    F: Fn(ScanResult) + Send + Sync + 'static,
{
    scan_with_cancel(job, result_sink, CancelToken::new()).await
}

/// As [`scan`], but observes a shared cancel token between ports (§4.7: "each
/// worker observes a shared cancel token between ports. In-flight connects
/// are aborted by deadline, not by cancellation").
pub async fn scan_with_cancel<F>(
    job: ScanJob,
    result_sink: F,
    cancel: CancelToken,
) -> Result<Summary, GocatError>
where
    F: Fn(ScanResult) + Send + Sync + 'static,
{
    let started = Instant::now();
    let total = job.ports.len() as u64;
    let concurrency = (job.concurrency.max(1) as usize).min(job.ports.len().max(1));
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let sink = Arc::new(result_sink);

    let open = Arc::new(AtomicU64::new(0));
    let closed = Arc::new(AtomicU64::new(0));
    let filtered = Arc::new(AtomicU64::new(0));

    let mut workers = JoinSet::new();
    for &port in &job.ports {
        if cancel.is_cancelled() {
            break;
        }
        let permit = semaphore.clone().acquire_owned().await.map_err(|_| {
            GocatError::Cancelled
        })?;
        let host = job.target_host.clone();
        let protocol = job.protocol;
        let family = job.family;
        let per_port_timeout = job.per_port_timeout;
        let sink = sink.clone();
        let open = open.clone();
        let closed = closed.clone();
        let filtered = filtered.clone();
        let cancel = cancel.clone();

        workers.spawn(async move {
            let _permit = permit;
            if cancel.is_cancelled() {
                return;
            }
            let result = match protocol {
                ScanProtocol::Tcp => probe_tcp(&host, port, family, per_port_timeout).await,
                ScanProtocol::Udp => probe_udp(&host, port, family, per_port_timeout).await,
            };
            match result.state {
                PortState::Open => open.fetch_add(1, Ordering::Relaxed),
                PortState::Closed => closed.fetch_add(1, Ordering::Relaxed),
                PortState::Filtered => filtered.fetch_add(1, Ordering::Relaxed),
            };
            sink(result);
        });
    }

    while workers.join_next().await.is_some() {}

    Ok(Summary {
        total,
        open: open.load(Ordering::Relaxed),
        closed: closed.load(Ordering::Relaxed),
        filtered: filtered.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
    })
}

/// One worker's TCP probe (§4.7 step 2): success -> `Open(rtt)`;
/// `ConnectionRefused` -> `Closed`; timeout or other network error ->
/// `Filtered`.
async fn probe_tcp(host: &str, port: u16, family: Family, deadline: Duration) -> ScanResult {
    let started = Instant::now();
    let addr = match resolve_one(host, port, family).await {
        Ok(addr) => addr,
        Err(_) => {
            return ScanResult {
                port,
                state: PortState::Filtered,
                rtt: None,
            }
        }
    };
    match timeout(deadline, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => ScanResult {
            port,
            state: PortState::Open,
            rtt: Some(started.elapsed()),
        },
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => ScanResult {
            port,
            state: PortState::Closed,
            rtt: None,
        },
        Ok(Err(_)) | Err(_) => ScanResult {
            port,
            state: PortState::Filtered,
            rtt: None,
        },
    }
}

/// One worker's UDP probe (§4.7 step 3): heuristic by nature — a zero-byte
/// datagram is sent and a read attempted with the deadline. A read success
/// means `Open`; an ICMP port-unreachable, surfaced as `ConnectionRefused`,
/// means `Closed`; a timeout means `Filtered`.
async fn probe_udp(host: &str, port: u16, family: Family, deadline: Duration) -> ScanResult {
    let started = Instant::now();
    let addr = match resolve_one(host, port, family).await {
        Ok(addr) => addr,
        Err(_) => {
            return ScanResult {
                port,
                state: PortState::Filtered,
                rtt: None,
            }
        }
    };
    let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(_) => {
            return ScanResult {
                port,
                state: PortState::Filtered,
                rtt: None,
            }
        }
    };
    if socket.connect(addr).await.is_err() {
        return ScanResult {
            port,
            state: PortState::Filtered,
            rtt: None,
        };
    }
    if socket.send(&[]).await.is_err() {
        return ScanResult {
            port,
            state: PortState::Filtered,
            rtt: None,
        };
    }
    let mut buf = [0u8; 1];
    match timeout(deadline, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => ScanResult {
            port,
            state: PortState::Open,
            rtt: Some(started.elapsed()),
        },
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => ScanResult {
            port,
            state: PortState::Closed,
            rtt: None,
        },
        Ok(Err(_)) | Err(_) => ScanResult {
            port,
            state: PortState::Filtered,
            rtt: None,
        },
    }
}

async fn resolve_one(host: &str, port: u16, family: Family) -> Result<SocketAddr, GocatError> {
    let lookup = format!("{host}:{port}");
    let mut addrs = tokio::net::lookup_host(&lookup)
        .await
        .map_err(|e| GocatError::ResolutionFailure(e.to_string()))?
        .filter(|a| match family {
            Family::Any => true,
            Family::V4 => a.is_ipv4(),
            Family::V6 => a.is_ipv6(),
        });
    addrs
        .next()
        .ok_or_else(|| GocatError::ResolutionFailure(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn scan_localhost_classifies_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        // Port 1 is a near-universal refused-connection target on loopback.
        let job = ScanJob {
            target_host: "127.0.0.1".to_string(),
            ports: vec![open_port, 1],
            protocol: ScanProtocol::Tcp,
            family: Family::V4,
            per_port_timeout: Duration::from_millis(500),
            concurrency: 4,
            report_closed: true,
        };

        let results = Arc::new(Mutex::new(Vec::new()));
        let results_clone = results.clone();
        let summary = scan(job, move |r| results_clone.lock().unwrap().push(r))
            .await
            .unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.open + summary.closed + summary.filtered, 2);
        let results = results.lock().unwrap();
        let open_result = results.iter().find(|r| r.port == open_port).unwrap();
        assert_eq!(open_result.state, PortState::Open);
        assert!(open_result.rtt.is_some());
    }

    #[tokio::test]
    async fn summary_invariant_holds_for_all_closed() {
        let job = ScanJob {
            target_host: "127.0.0.1".to_string(),
            ports: vec![1, 2, 3],
            protocol: ScanProtocol::Tcp,
            family: Family::V4,
            per_port_timeout: Duration::from_millis(300),
            concurrency: 3,
            report_closed: true,
        };
        let summary = scan(job, |_| {}).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.open + summary.closed + summary.filtered, 3);
    }
}
