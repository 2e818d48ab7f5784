//! The CLI surface (§6): argument parsing and subcommand dispatch.
//!
//! Kept separate from `main.rs` so the parsing/dispatch logic is testable
//! without touching process exit codes or the installed tracing subscriber,
//! mirroring the teacher's `Cli` struct shape (`clap::Parser` derive) while
//! replacing its single scan-only command with the five §6 subcommands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::AsyncWriteExt;

use crate::address;
use crate::config::Config;
use crate::connector::{self, RetryPolicy};
use crate::error::GocatError;
use crate::fields;
use crate::listener::{self, Handler};
use crate::log::Log;
use crate::metrics::MetricsSink;
use crate::pipe;
use crate::relay::{self, RelayConfig, RelayMode};
use crate::scanner::{self, PortState, ScanJob, ScanProtocol};
use crate::signal::CancelToken;
use crate::transfer;
use crate::transport::{Endpoint, Family, TlsConfig};

#[derive(Debug, Parser)]
#[command(
    name = "gocat",
    version,
    about = "A netcat-class network utility: connect, listen, scan, relay, and transfer files over TCP/UDP/Unix/TLS."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Dial a remote endpoint and pipe it to stdio.
    Connect(ConnectArgs),
    /// Accept one connection (or, with --exec, many) and pipe each to stdio or a spawned process.
    Listen(ListenArgs),
    /// Probe a range of ports on a host for reachability.
    Scan(ScanArgs),
    /// Relay connections from a listen endpoint to a target endpoint.
    Proxy(ProxyArgs),
    /// Send or receive a framed file transfer.
    #[command(subcommand)]
    Transfer(TransferCommand),
}

#[derive(Debug, clap::Args)]
pub struct ConnectArgs {
    pub host: String,
    pub port: u16,
    #[arg(long)]
    pub udp: bool,
    #[arg(long)]
    pub ssl: bool,
    #[arg(long)]
    pub verify_cert: bool,
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,
    /// Per-attempt dial timeout; falls back to the config file, then 10s.
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
    /// Max dial attempts; falls back to the config file, then 1 (no retry).
    #[arg(long)]
    pub retry: Option<u32>,
    #[arg(short = '4', long = "ipv4")]
    pub ipv4: bool,
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,
    /// Accepted for CLI compatibility; dialing through a forward proxy is
    /// not implemented by this core (§4.4 names it as an optional, unspecified capability).
    #[arg(long)]
    pub proxy: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct ListenArgs {
    pub port: u16,
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,
    #[arg(long)]
    pub udp: bool,
    #[arg(long)]
    pub ssl: bool,
    #[arg(long)]
    pub ssl_cert: Option<PathBuf>,
    #[arg(long)]
    pub ssl_key: Option<PathBuf>,
    /// Shell command to spawn per accepted connection, wired to its stdio.
    #[arg(long)]
    pub exec: Option<String>,
    /// Pipe a single accepted connection to this process's stdio (classic
    /// single-shot listen). Ignored when --exec is set.
    #[arg(long)]
    pub interactive: bool,
    #[arg(long, default_value_t = 100)]
    pub max_conn: usize,
    #[arg(long)]
    pub keep_alive: bool,
}

#[derive(Debug, clap::Args)]
pub struct ScanArgs {
    pub host: String,
    /// Port range spec (`"80,443,8000-8010"`); falls back to --ports, then "1-1024".
    pub ports: Option<String>,
    #[arg(long = "ports")]
    pub ports_flag: Option<String>,
    #[arg(long, default_value_t = 500)]
    pub concurrency: u32,
    #[arg(long = "scan-timeout", value_parser = parse_duration, default_value = "500ms")]
    pub scan_timeout: Duration,
    #[arg(long)]
    pub udp: bool,
    /// Only print open ports (suppress closed/filtered).
    #[arg(long)]
    pub open: bool,
    #[arg(long)]
    pub verbose: bool,
    #[arg(short = '4', long = "ipv4")]
    pub ipv4: bool,
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliRelayMode {
    Bidirectional,
    ForwardOnly,
    ReverseOnly,
}

impl From<CliRelayMode> for RelayMode {
    fn from(m: CliRelayMode) -> Self {
        match m {
            CliRelayMode::Bidirectional => RelayMode::Bidirectional,
            CliRelayMode::ForwardOnly => RelayMode::ForwardOnly,
            CliRelayMode::ReverseOnly => RelayMode::ReverseOnly,
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct ProxyArgs {
    #[arg(long)]
    pub listen: String,
    #[arg(long)]
    pub target: Option<String>,
    /// Comma-separated backend list; only the first is dialed today (no
    /// load-balancing across backends in this core, see DESIGN.md).
    #[arg(long)]
    pub backends: Option<String>,
    #[arg(long, value_enum, default_value_t = CliRelayMode::Bidirectional)]
    pub mode: CliRelayMode,
    #[arg(long, default_value_t = 0)]
    pub max_conn: usize,
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    pub dial_timeout: Duration,
}

#[derive(Debug, Subcommand)]
pub enum TransferCommand {
    Send(TransferSendArgs),
    Receive(TransferReceiveArgs),
}

#[derive(Debug, clap::Args)]
pub struct TransferSendArgs {
    pub file: PathBuf,
    pub host: String,
    pub port: u16,
    /// Compute and announce MD5/SHA-256 checksums in the transfer header.
    #[arg(long)]
    pub checksum: bool,
}

#[derive(Debug, clap::Args)]
pub struct TransferReceiveArgs {
    pub port: u16,
    pub output: PathBuf,
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Resolve `-4`/`-6` against the config file's `network.ipv6` default (§6)
/// when neither flag is given.
fn family_from_flags(ipv4: bool, ipv6: bool, ipv6_default: Option<bool>) -> Result<Family, GocatError> {
    match (ipv4, ipv6) {
        (true, true) => Err(GocatError::Validation(
            "-4 and -6 are mutually exclusive".to_string(),
        )),
        (true, false) => Ok(Family::V4),
        (false, true) => Ok(Family::V6),
        (false, false) => Ok(match ipv6_default {
            Some(true) => Family::V6,
            Some(false) => Family::V4,
            None => Family::Any,
        }),
    }
}

/// Dispatch a parsed [`Cli`] to the corresponding library call. Returns the
/// [`GocatError`] whose [`GocatError::exit_code`] `main` maps to a process
/// exit status.
pub async fn run(
    cli: Cli,
    config: &Config,
    cancel: CancelToken,
    log: Arc<dyn Log>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<(), GocatError> {
    match cli.command {
        Command::Connect(args) => run_connect(args, config, cancel, log, metrics).await,
        Command::Listen(args) => run_listen(args, config, cancel, log).await,
        Command::Scan(args) => run_scan(args, config, cancel).await,
        Command::Proxy(args) => run_proxy(args, config, cancel, log, metrics).await,
        Command::Transfer(TransferCommand::Send(args)) => run_transfer_send(args).await,
        Command::Transfer(TransferCommand::Receive(args)) => run_transfer_receive(args).await,
    }
}

async fn run_connect(
    args: ConnectArgs,
    config: &Config,
    cancel: CancelToken,
    log: Arc<dyn Log>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<(), GocatError> {
    let family = family_from_flags(args.ipv4, args.ipv6, config.network.ipv6)?;
    let verify_peer = args.verify_cert || config.security.verify_cert.unwrap_or(false);
    let ca_file = args.ca_cert.or_else(|| config.security.ca_cert.clone());
    let endpoint = if args.ssl {
        Endpoint::TlsOverTcp {
            host: args.host,
            port: args.port,
            family,
            tls: TlsConfig {
                verify_peer,
                ca_file,
                ..TlsConfig::default()
            },
        }
    } else if args.udp {
        Endpoint::Udp {
            host: args.host,
            port: args.port,
            family,
        }
    } else {
        Endpoint::Tcp {
            host: args.host,
            port: args.port,
            family,
        }
    };

    let retry_policy = RetryPolicy {
        max_attempts: args.retry.or(config.defaults.retry).unwrap_or(1),
        ..RetryPolicy::default()
    };
    let timeout = args
        .timeout
        .or(config.defaults.timeout)
        .unwrap_or(Duration::from_secs(10));

    let conn = connector::connect(
        &endpoint,
        &retry_policy,
        timeout,
        &cancel,
        log.as_ref(),
        metrics.as_ref(),
    )
    .await?;
    if config.defaults.keep_alive {
        let _ = conn.set_keepalive(true);
    }
    let buffer_size = config.network.buffer_size.unwrap_or(pipe::DEFAULT_BUFFER_SIZE);

    pipe_to_stdio(conn, cancel, buffer_size).await
}

/// Pipe an established connection to this process's stdio (§4.5 handler "a").
async fn pipe_to_stdio(
    conn: crate::transport::Connection,
    cancel: CancelToken,
    buffer_size: usize,
) -> Result<(), GocatError> {
    let (mut read_half, mut write_half) = tokio::io::split(conn);
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let to_remote = async {
        let _ = pipe::run_with_buffer(&mut stdin, &mut write_half, buffer_size).await;
        let _ = write_half.shutdown().await;
    };
    let from_remote = async {
        let _ = pipe::run_with_buffer(&mut read_half, &mut stdout, buffer_size).await;
    };

    tokio::select! {
        _ = to_remote => {}
        _ = from_remote => {}
        _ = cancel.cancelled() => {}
    }
    Ok(())
}

async fn run_listen(
    args: ListenArgs,
    config: &Config,
    cancel: CancelToken,
    log: Arc<dyn Log>,
) -> Result<(), GocatError> {
    let family = Family::Any;
    let keep_alive = args.keep_alive || config.defaults.keep_alive;
    let buffer_size = config.network.buffer_size.unwrap_or(pipe::DEFAULT_BUFFER_SIZE);
    let endpoint = if args.ssl {
        Endpoint::TlsOverTcp {
            host: args.bind.clone(),
            port: args.port,
            family,
            tls: TlsConfig {
                server_cert: args.ssl_cert.clone(),
                server_key: args.ssl_key.clone(),
                ..TlsConfig::default()
            },
        }
    } else if args.udp {
        Endpoint::Udp {
            host: args.bind.clone(),
            port: args.port,
            family,
        }
    } else {
        Endpoint::Tcp {
            host: args.bind.clone(),
            port: args.port,
            family,
        }
    };

    if let Some(cmd) = args.exec {
        let handler = exec_handler(cmd, log.clone(), buffer_size, keep_alive);
        return listener::serve(
            &endpoint,
            handler,
            args.max_conn,
            listener::DEFAULT_SHUTDOWN_GRACE,
            cancel,
            log,
        )
        .await;
    }

    // Interactive single-connection mode (classic `nc -l`): bind, accept
    // exactly one connection, pipe it to stdio.
    let bound = crate::transport::bind(&endpoint).await?;
    let (conn, peer) = bound.accept(Duration::from_secs(3600)).await?;
    if keep_alive {
        let _ = conn.set_keepalive(true);
    }
    log.info("accepted connection", &fields![("peer", peer.to_string())]);
    pipe_to_stdio(conn, cancel, buffer_size).await
}

/// Wire an accepted connection to a spawned child process's stdio (§4.5
/// handler "b"): the process's stdin comes from the socket's read half, its
/// stdout and stderr both feed the socket's write half.
fn exec_handler(cmd: String, log: Arc<dyn Log>, buffer_size: usize, keep_alive: bool) -> Handler {
    Arc::new(move |conn, peer| {
        let cmd = cmd.clone();
        let log = log.clone();
        Box::pin(async move {
            if keep_alive {
                let _ = conn.set_keepalive(true);
            }
            if let Err(e) = run_exec_session(conn, cmd, buffer_size).await {
                log.warn(
                    "exec handler session failed",
                    &fields![("peer", peer.to_string()), ("error", e.to_string())],
                );
            }
        })
    })
}

async fn run_exec_session(
    conn: crate::transport::Connection,
    cmd: String,
    buffer_size: usize,
) -> Result<(), GocatError> {
    use tokio::process::Command;
    use tokio::sync::Mutex;

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&cmd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(GocatError::Io)?;

    let mut child_stdin = child.stdin.take().ok_or_else(|| {
        GocatError::Validation("failed to capture child stdin".to_string())
    })?;
    let mut child_stdout = child.stdout.take().ok_or_else(|| {
        GocatError::Validation("failed to capture child stdout".to_string())
    })?;
    let mut child_stderr = child.stderr.take().ok_or_else(|| {
        GocatError::Validation("failed to capture child stderr".to_string())
    })?;

    let (mut conn_read, conn_write) = tokio::io::split(conn);
    let conn_write = Arc::new(Mutex::new(conn_write));

    let to_child = async {
        let _ = pipe::run_with_buffer(&mut conn_read, &mut child_stdin, buffer_size).await;
        let _ = child_stdin.shutdown().await;
    };
    // stdout and stderr race into the same write half; each gets its own
    // reader task and a shared, mutex-serialized writer since a split
    // `WriteHalf` cannot itself be split again.
    let stdout_to_conn = copy_to_shared_writer(&mut child_stdout, &conn_write, buffer_size);
    let stderr_to_conn = copy_to_shared_writer(&mut child_stderr, &conn_write, buffer_size);

    tokio::join!(to_child, stdout_to_conn, stderr_to_conn);
    {
        let mut write_half = conn_write.lock().await;
        let _ = write_half.shutdown().await;
    }
    let _ = child.wait().await;
    Ok(())
}

/// Copy `src` into a write half shared with another concurrent copier,
/// serializing access with `dst`'s mutex so both streams interleave safely.
async fn copy_to_shared_writer<R, W>(
    mut src: R,
    dst: &Arc<tokio::sync::Mutex<W>>,
    buffer_size: usize,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = match tokio::io::AsyncReadExt::read(&mut src, &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut guard = dst.lock().await;
        if guard.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if guard.flush().await.is_err() {
            break;
        }
    }
}

async fn run_scan(args: ScanArgs, config: &Config, cancel: CancelToken) -> Result<(), GocatError> {
    let family = family_from_flags(args.ipv4, args.ipv6, config.network.ipv6)?;
    let spec = args
        .ports
        .or(args.ports_flag)
        .unwrap_or_else(|| "1-1024".to_string());
    let ports: Vec<u16> = address::parse_port_range(&spec)?.into_iter().collect();

    let job = ScanJob {
        target_host: args.host.clone(),
        ports,
        protocol: if args.udp { ScanProtocol::Udp } else { ScanProtocol::Tcp },
        family,
        per_port_timeout: args.scan_timeout,
        concurrency: args.concurrency,
        report_closed: !args.open,
    };

    let report_closed = job.report_closed;
    let verbose = args.verbose;
    let protocol_label = if args.udp { "udp" } else { "tcp" };
    let sink = move |result: scanner::ScanResult| {
        if result.state == PortState::Open || (report_closed && verbose) {
            let rtt = result
                .rtt
                .map(|d| format!("{:.1}ms", d.as_secs_f64() * 1000.0))
                .unwrap_or_else(|| "-".to_string());
            println!("{}/{protocol_label}\t{:?}\t{rtt}", result.port, result.state);
        }
    };

    let summary = scanner::scan_with_cancel(job, sink, cancel).await?;
    println!(
        "scanned {} ports: {} open, {} closed, {} filtered ({:.2}s)",
        summary.total,
        summary.open,
        summary.closed,
        summary.filtered,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}

async fn run_proxy(
    args: ProxyArgs,
    config: &Config,
    cancel: CancelToken,
    log: Arc<dyn Log>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<(), GocatError> {
    let (listen_host, listen_port) = address::split_host_port(&args.listen)?;
    let listen_endpoint = Endpoint::Tcp {
        host: listen_host,
        port: listen_port,
        family: Family::Any,
    };

    let target = match (&args.target, &args.backends) {
        (Some(t), _) => t.clone(),
        (None, Some(backends)) => backends
            .split(',')
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GocatError::Validation("empty --backends list".to_string()))?
            .to_string(),
        (None, None) => {
            return Err(GocatError::Validation(
                "proxy requires --target or --backends".to_string(),
            ))
        }
    };
    if args.backends.is_some() && args.target.is_none() {
        log.warn(
            "multiple --backends given; only the first is dialed (no load-balancing in this core)",
            &fields![("backends", target.as_str())],
        );
    }
    let (target_host, target_port) = address::split_host_port(&target)?;
    let target_endpoint = Endpoint::Tcp {
        host: target_host,
        port: target_port,
        family: Family::Any,
    };

    let relay_config = RelayConfig {
        mode: args.mode.into(),
        concurrency_cap: args.max_conn,
        dial_timeout: args.dial_timeout,
        buffer_size: config.network.buffer_size.unwrap_or(pipe::DEFAULT_BUFFER_SIZE),
        keep_alive: config.defaults.keep_alive,
        ..RelayConfig::default()
    };

    let stats = relay::relay(listen_endpoint, target_endpoint, relay_config, cancel, log, metrics).await?;
    println!(
        "relay stopped: forward_bytes={} reverse_bytes={}",
        stats.forward_bytes(),
        stats.reverse_bytes()
    );
    Ok(())
}

async fn run_transfer_send(args: TransferSendArgs) -> Result<(), GocatError> {
    let endpoint = Endpoint::Tcp {
        host: args.host,
        port: args.port,
        family: Family::Any,
    };
    let mut conn = crate::transport::dial(&endpoint, Duration::from_secs(10)).await?;
    let copied = transfer::send_file(&args.file, &mut conn, args.checksum).await?;
    println!("sent {copied} bytes");
    Ok(())
}

async fn run_transfer_receive(args: TransferReceiveArgs) -> Result<(), GocatError> {
    let endpoint = Endpoint::Tcp {
        host: args.bind,
        port: args.port,
        family: Family::Any,
    };
    let bound = crate::transport::bind(&endpoint).await?;
    let (mut conn, _peer) = bound.accept(Duration::from_secs(3600)).await?;
    let mut output = tokio::fs::File::create(&args.output).await.map_err(GocatError::Io)?;
    let header = transfer::receive(&mut conn, &mut output).await?;
    println!("received {} ({} bytes) -> {}", header.basename, header.size, args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_from_flags_rejects_both_flags() {
        assert!(family_from_flags(true, true, None).is_err());
    }

    #[test]
    fn family_from_flags_honours_explicit_flags_over_config_default() {
        assert_eq!(family_from_flags(true, false, Some(true)).unwrap(), Family::V4);
        assert_eq!(family_from_flags(false, true, Some(false)).unwrap(), Family::V6);
    }

    #[test]
    fn family_from_flags_falls_back_to_config_default_network_ipv6() {
        assert_eq!(family_from_flags(false, false, Some(true)).unwrap(), Family::V6);
        assert_eq!(family_from_flags(false, false, Some(false)).unwrap(), Family::V4);
        assert_eq!(family_from_flags(false, false, None).unwrap(), Family::Any);
    }
}
