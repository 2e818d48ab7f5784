//! The Pipe engine (§4.3) — the centrepiece of the crate.
//!
//! Grounded on `ztunnel`'s `copy_hbone` (`proxy.rs`): split each connection
//! into a read half and a write half with `tokio::io::split`, and drive one
//! copy loop per direction as an independent task rather than a single
//! `tokio::io::copy_bidirectional` call, so that a read-slice deadline and a
//! cancellation token can interleave between reads and each direction can be
//! isolated from a panic in the other (§9: task bodies wrapped in
//! panic-catching boundaries, never `process::exit`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::GocatError;
use crate::fields;
use crate::log::Log;
use crate::signal::CancelToken;
use crate::transport::Connection;

/// Default buffer size for a copy direction (§4.3).
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
/// Default read-slice deadline (§4.3, §5).
pub const DEFAULT_READ_SLICE: Duration = Duration::from_millis(100);

/// Live, concurrently-readable byte counters for one [`PipeSession`]'s two
/// directions (§3). Shared via `Arc` so a caller (e.g. the Relay, §4.6) can
/// poll it while the session is still running.
#[derive(Debug, Default)]
pub struct PipeStats {
    a_to_b_bytes: AtomicU64,
    b_to_a_bytes: AtomicU64,
}

impl PipeStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn a_to_b_bytes(&self) -> u64 {
        self.a_to_b_bytes.load(Ordering::Relaxed)
    }

    pub fn b_to_a_bytes(&self) -> u64 {
        self.b_to_a_bytes.load(Ordering::Relaxed)
    }
}

/// Configuration for one [`run`] invocation (§3 `PipeSession`, minus the
/// connections themselves).
pub struct PipeConfig {
    pub buffer_size: usize,
    pub read_slice: Duration,
    pub cancel: CancelToken,
    pub stats: Arc<PipeStats>,
    pub log: Arc<dyn Log>,
}

impl PipeConfig {
    pub fn new(cancel: CancelToken, log: Arc<dyn Log>) -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            read_slice: DEFAULT_READ_SLICE,
            cancel,
            stats: PipeStats::new(),
            log,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_read_slice(mut self, read_slice: Duration) -> Self {
        self.read_slice = read_slice;
        self
    }

    pub fn with_stats(mut self, stats: Arc<PipeStats>) -> Self {
        self.stats = stats;
        self
    }
}

/// How a [`PipeSession`] concluded (§4.3).
#[derive(Debug)]
pub enum Terminator {
    EofA,
    EofB,
    ErrorA(GocatError),
    ErrorB(GocatError),
    Cancelled,
}

#[derive(Debug)]
pub struct PipeOutcome {
    pub a_to_b_bytes: u64,
    pub b_to_a_bytes: u64,
    pub terminator: Terminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

enum DirectionEnd {
    Eof,
    Error(GocatError),
    Cancelled,
    Panicked(String),
}

/// Bidirectional copy between `a` and `b` until both directions end (§4.3).
pub async fn run(a: Connection, b: Connection, config: PipeConfig) -> PipeOutcome {
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let fwd = spawn_direction(
        a_read,
        b_write,
        config.buffer_size,
        config.read_slice,
        config.cancel.clone(),
        config.stats.clone(),
        Direction::AToB,
    );
    let rev = spawn_direction(
        b_read,
        a_write,
        config.buffer_size,
        config.read_slice,
        config.cancel.clone(),
        config.stats.clone(),
        Direction::BToA,
    );

    let (first, second) = race(fwd, rev, Side::A, Side::B, &config.log).await;

    let terminator = pick_terminator(first, second);
    PipeOutcome {
        a_to_b_bytes: config.stats.a_to_b_bytes(),
        b_to_a_bytes: config.stats.b_to_a_bytes(),
        terminator,
    }
}

/// Races two direction tasks to completion, preserving which finished first
/// (§4.3: "terminator reports the FIRST direction that ended abnormally, or
/// the direction that reached EOF first if both ended cleanly").
async fn race(
    fwd: JoinHandle<DirectionEnd>,
    rev: JoinHandle<DirectionEnd>,
    fwd_side: Side,
    rev_side: Side,
    log: &Arc<dyn Log>,
) -> ((Side, DirectionEnd), (Side, DirectionEnd)) {
    tokio::pin!(fwd);
    tokio::pin!(rev);

    let (first_side, first_res) = tokio::select! {
        res = &mut fwd => (fwd_side, res),
        res = &mut rev => (rev_side, res),
    };
    let first_end = join_result_to_end(first_res, log, first_side);

    let (second_side, second_res) = if first_side == fwd_side {
        (rev_side, rev.await)
    } else {
        (fwd_side, fwd.await)
    };
    let second_end = join_result_to_end(second_res, log, second_side);

    ((first_side, first_end), (second_side, second_end))
}

fn join_result_to_end(
    res: Result<DirectionEnd, tokio::task::JoinError>,
    log: &Arc<dyn Log>,
    side: Side,
) -> DirectionEnd {
    match res {
        Ok(end) => end,
        Err(join_err) => {
            let message = if join_err.is_panic() {
                "direction task panicked".to_string()
            } else {
                "direction task cancelled".to_string()
            };
            log.error(
                &message,
                &fields![("side", if side == Side::A { "a" } else { "b" })],
            );
            DirectionEnd::Panicked(message)
        }
    }
}

fn pick_terminator(first: (Side, DirectionEnd), second: (Side, DirectionEnd)) -> Terminator {
    let (first_side, first_end) = first;
    let (second_side, second_end) = second;
    match abnormal_terminator(first_side, first_end) {
        Ok(t) => t,
        Err(DirectionEnd::Cancelled) => match abnormal_terminator(second_side, second_end) {
            Ok(t) => t,
            Err(_) => Terminator::Cancelled,
        },
        Err(DirectionEnd::Eof) => {
            // First direction ended cleanly. Per §4.3 the terminator still
            // reports an abnormal *second* direction before falling back to
            // "the direction that reached EOF first if both ended cleanly".
            match abnormal_terminator(second_side, second_end) {
                Ok(t) => t,
                Err(_) => clean_eof_terminator(first_side),
            }
        }
        Err(_) => unreachable!("abnormal_terminator only returns Eof/Cancelled as clean"),
    }
}

/// Returns `Ok(terminator)` if `end` is abnormal (error or panic), else
/// `Err(end)` with the original clean end (`Eof` or `Cancelled`) for the
/// caller to fall back on.
fn abnormal_terminator(side: Side, end: DirectionEnd) -> Result<Terminator, DirectionEnd> {
    match end {
        DirectionEnd::Error(e) => Ok(match side {
            Side::A => Terminator::ErrorA(e),
            Side::B => Terminator::ErrorB(e),
        }),
        DirectionEnd::Panicked(msg) => Ok(match side {
            Side::A => Terminator::ErrorA(GocatError::Panic(msg)),
            Side::B => Terminator::ErrorB(GocatError::Panic(msg)),
        }),
        other => Err(other),
    }
}

fn clean_eof_terminator(side: Side) -> Terminator {
    match side {
        Side::A => Terminator::EofA,
        Side::B => Terminator::EofB,
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    AToB,
    BToA,
}

#[allow(clippy::too_many_arguments)]
fn spawn_direction<R, W>(
    reader: R,
    writer: W,
    buffer_size: usize,
    read_slice: Duration,
    cancel: CancelToken,
    stats: Arc<PipeStats>,
    direction: Direction,
) -> JoinHandle<DirectionEnd>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(copy_direction(
        reader,
        writer,
        buffer_size,
        read_slice,
        cancel,
        stats,
        direction,
    ))
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    read_slice: Duration,
    cancel: CancelToken,
    stats: Arc<PipeStats>,
    direction: Direction,
) -> DirectionEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        if cancel.is_cancelled() {
            let _ = writer.shutdown().await;
            return DirectionEnd::Cancelled;
        }

        let read_result = timeout(read_slice, reader.read(&mut buf)).await;
        let n = match read_result {
            Err(_) => continue, // read_slice elapsed; loop back to the cancel check
            Ok(Ok(0)) => {
                let _ = writer.shutdown().await;
                return DirectionEnd::Eof;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return DirectionEnd::Error(GocatError::Io(e)),
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            return DirectionEnd::Error(GocatError::Io(e));
        }
        if let Err(e) = writer.flush().await {
            return DirectionEnd::Error(GocatError::Io(e));
        }

        match direction {
            Direction::AToB => stats.a_to_b_bytes.fetch_add(n as u64, Ordering::Relaxed),
            Direction::BToA => stats.b_to_a_bytes.fetch_add(n as u64, Ordering::Relaxed),
        };
    }
}

/// Unidirectional copy (§4.3), used internally and by file-transfer callers.
pub async fn run_with_buffer<R, W>(
    src: &mut R,
    dst: &mut W,
    buffer_size: usize,
) -> Result<u64, GocatError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await.map_err(GocatError::Io)?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await.map_err(GocatError::Io)?;
        dst.flush().await.map_err(GocatError::Io)?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NullLog;
    use crate::transport::{bind, dial, Endpoint, Family};
    use std::time::Duration as StdDuration;

    async fn loopback_pair() -> (Connection, Connection) {
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
            family: Family::V4,
        };
        let listener = bind(&endpoint).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial_endpoint = Endpoint::Tcp {
            host: addr.ip().to_string(),
            port: addr.port(),
            family: Family::V4,
        };
        let accept_fut = listener.accept(StdDuration::from_secs(2));
        let dial_fut = dial(&dial_endpoint, StdDuration::from_secs(2));
        let (accepted, dialed) = tokio::join!(accept_fut, dial_fut);
        (accepted.unwrap().0, dialed.unwrap())
    }

    #[tokio::test]
    async fn empty_stream_from_a_yields_eof_a_while_b_to_a_completes() {
        let (mut a, b) = loopback_pair().await;
        a.shutdown(crate::transport::ShutdownDirection::Write)
            .await
            .unwrap();

        let cancel = CancelToken::new();
        let log: Arc<dyn Log> = Arc::new(NullLog);
        let config = PipeConfig::new(cancel, log).with_read_slice(Duration::from_millis(20));
        let outcome = tokio::time::timeout(Duration::from_secs(2), run(a, b, config))
            .await
            .expect("pipe did not finish");

        assert_eq!(outcome.a_to_b_bytes, 0);
        assert!(matches!(outcome.terminator, Terminator::EofA));
    }

    #[tokio::test]
    async fn cancellation_stops_both_directions() {
        let (a, b) = loopback_pair().await;
        let cancel = CancelToken::new();
        let log: Arc<dyn Log> = Arc::new(NullLog);
        let config = PipeConfig::new(cancel.clone(), log).with_read_slice(Duration::from_millis(20));

        let handle = tokio::spawn(run(a, b, config));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pipe did not finish in time")
            .expect("pipe task panicked");
        assert!(matches!(outcome.terminator, Terminator::Cancelled));
    }

    #[test]
    fn first_clean_eof_does_not_mask_a_later_abnormal_end() {
        // A reaches EOF first; B then hits a read error. §4.3: the
        // terminator must still report the abnormal direction.
        let first = (Side::A, DirectionEnd::Eof);
        let second = (Side::B, DirectionEnd::Error(GocatError::Timeout));
        match pick_terminator(first, second) {
            Terminator::ErrorB(GocatError::Timeout) => {}
            other => panic!("expected ErrorB(Timeout), got {other:?}"),
        }
    }

    #[test]
    fn both_directions_clean_report_the_first_to_reach_eof() {
        let first = (Side::B, DirectionEnd::Eof);
        let second = (Side::A, DirectionEnd::Eof);
        assert!(matches!(pick_terminator(first, second), Terminator::EofB));
    }

    #[tokio::test]
    async fn run_with_buffer_copies_all_bytes() {
        let (mut a, mut b) = loopback_pair().await;
        let payload = vec![7u8; 10_000];
        let writer_payload = payload.clone();
        let writer = tokio::spawn(async move {
            a.write_all(&writer_payload).await.unwrap();
            a.shutdown(crate::transport::ShutdownDirection::Write)
                .await
                .unwrap();
        });
        let copied = run_with_buffer(&mut b, &mut tokio::io::sink(), 4096)
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(copied, payload.len() as u64);
    }
}
