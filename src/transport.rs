//! Transport abstraction (§3, §4.2): a uniform `Endpoint` → `Connection`
//! surface over TCP, UDP, Unix-domain, and TLS-wrapped TCP sockets.
//!
//! `Connection` is a single enum implementing `AsyncRead`/`AsyncWrite` by
//! delegating to whichever concrete socket backs it, mirroring the
//! `MaybeTlsStream<TcpStream>` pattern used for the same purpose in
//! `vector`'s `sinks::util::tcp` (`other_examples` pack). This lets the Pipe
//! engine (§4.3) call `tokio::io::split` generically instead of special-
//! casing each transport.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket, UnixListener, UnixStream};
use tokio::time::timeout;
use tokio_native_tls::{native_tls, TlsAcceptor, TlsConnector, TlsStream};

use crate::error::GocatError;

/// Address-family pin for resolution (§3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    #[default]
    Any,
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnixKind {
    Stream,
    Dgram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMinVersion {
    V1_2,
    V1_3,
}

/// TLS configuration (§3). Server fields are required iff TLS is used on a
/// listening side; enforced by [`Endpoint::validate`].
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub verify_peer: bool,
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub min_version: Option<TlsMinVersion>,
    pub server_cert: Option<PathBuf>,
    pub server_key: Option<PathBuf>,
}

/// A parsed, immutable network endpoint (§3).
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp {
        host: String,
        port: u16,
        family: Family,
    },
    Udp {
        host: String,
        port: u16,
        family: Family,
    },
    Unix {
        path: PathBuf,
        kind: UnixKind,
    },
    TlsOverTcp {
        host: String,
        port: u16,
        family: Family,
        tls: TlsConfig,
    },
}

impl Endpoint {
    /// Validate invariants from §3: port range (enforced by the address
    /// parser before an `Endpoint` is built, re-checked here), non-empty
    /// host, and server-field presence for listening TLS endpoints.
    pub fn validate_for_listen(&self) -> Result<(), GocatError> {
        if let Endpoint::TlsOverTcp { tls, .. } = self {
            if tls.server_cert.is_none() || tls.server_key.is_none() {
                return Err(GocatError::Validation(
                    "TLS listener requires server_cert and server_key".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Half-close direction for [`Connection::shutdown`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    Write,
    Both,
}

pin_project! {
    /// A bidirectional byte stream, uniform over TCP/UDP/Unix/TLS (§3).
    #[project = ConnectionProj]
    pub enum Connection {
        Tcp { #[pin] stream: TcpStream },
        Udp { #[pin] stream: UdpDuplex },
        Unix { #[pin] stream: UnixStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl Connection {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Connection::Tcp { stream } => stream.local_addr(),
            Connection::Udp { stream } => stream.socket.local_addr(),
            Connection::Unix { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets have no IP local address",
            )),
            Connection::Tls { stream } => stream.get_ref().get_ref().local_addr(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Connection::Tcp { stream } => stream.peer_addr(),
            Connection::Udp { stream } => stream.socket.peer_addr(),
            Connection::Unix { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets have no IP peer address",
            )),
            Connection::Tls { stream } => stream.get_ref().get_ref().peer_addr(),
        }
    }

    /// `SO_LINGER`; a no-op where the transport has no such concept.
    pub fn set_linger(&self, duration: Option<Duration>) -> io::Result<()> {
        match self {
            Connection::Tcp { stream } => {
                socket2::SockRef::from(stream).set_linger(duration)
            }
            Connection::Tls { stream } => {
                socket2::SockRef::from(stream.get_ref().get_ref()).set_linger(duration)
            }
            Connection::Udp { .. } | Connection::Unix { .. } => Ok(()),
        }
    }

    /// `SO_KEEPALIVE` (§6 `defaults.keep_alive`); a no-op where the
    /// transport has no such concept.
    pub fn set_keepalive(&self, enabled: bool) -> io::Result<()> {
        match self {
            Connection::Tcp { stream } => socket2::SockRef::from(stream).set_keepalive(enabled),
            Connection::Tls { stream } => {
                socket2::SockRef::from(stream.get_ref().get_ref()).set_keepalive(enabled)
            }
            Connection::Udp { .. } | Connection::Unix { .. } => Ok(()),
        }
    }

    /// `Write`: half-close, shutting down the write half and leaving reads
    /// live. `Both`: a true bidirectional close — the write-half FIN via the
    /// async trait, followed by a raw `SHUT_RDWR` on the underlying socket
    /// (the same `socket2::SockRef` route [`set_linger`] above uses) so the
    /// read half is closed too (§4.3 cancellation: "both connections have
    /// their read and write halves shut down before drop").
    pub async fn shutdown(&mut self, direction: ShutdownDirection) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let write_result = Pin::new(&mut *self).shutdown().await;
        match direction {
            ShutdownDirection::Write => write_result,
            ShutdownDirection::Both => {
                let raw_result = match self {
                    Connection::Tcp { stream } => socket2::SockRef::from(stream)
                        .shutdown(std::net::Shutdown::Both),
                    Connection::Tls { stream } => {
                        socket2::SockRef::from(stream.get_ref().get_ref())
                            .shutdown(std::net::Shutdown::Both)
                    }
                    Connection::Unix { stream } => socket2::SockRef::from(stream)
                        .shutdown(std::net::Shutdown::Both),
                    Connection::Udp { stream } => socket2::SockRef::from(&stream.socket)
                        .shutdown(std::net::Shutdown::Both),
                };
                write_result.and(raw_result)
            }
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProj::Tcp { stream } => stream.poll_read(cx, buf),
            ConnectionProj::Udp { stream } => stream.poll_read(cx, buf),
            ConnectionProj::Unix { stream } => stream.poll_read(cx, buf),
            ConnectionProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ConnectionProj::Tcp { stream } => stream.poll_write(cx, buf),
            ConnectionProj::Udp { stream } => stream.poll_write(cx, buf),
            ConnectionProj::Unix { stream } => stream.poll_write(cx, buf),
            ConnectionProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProj::Tcp { stream } => stream.poll_flush(cx),
            ConnectionProj::Udp { stream } => stream.poll_flush(cx),
            ConnectionProj::Unix { stream } => stream.poll_flush(cx),
            ConnectionProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ConnectionProj::Tcp { stream } => stream.poll_shutdown(cx),
            ConnectionProj::Udp { stream } => stream.poll_shutdown(cx),
            ConnectionProj::Unix { stream } => stream.poll_shutdown(cx),
            ConnectionProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

/// Adapts a connected [`UdpSocket`] to `AsyncRead`/`AsyncWrite` so it can
/// live inside [`Connection`] alongside the stream-oriented transports
/// (§4.2: "dial creates a connected UDP socket; reads return datagrams up
/// to buffer size").
pub struct UdpDuplex {
    socket: UdpSocket,
}

impl AsyncRead for UdpDuplex {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpDuplex {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A bound listener, uniform over TCP/Unix/TLS-over-TCP. UDP has no accept
/// loop (§4.5): it is handled directly by the caller via `recv_from`.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    TlsTcp(TcpListener, TlsAcceptor),
    Udp(UdpSocket),
}

impl Listener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr(),
            Listener::TlsTcp(l, _) => l.local_addr(),
            Listener::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix listeners have no IP local address",
            )),
            Listener::Udp(s) => s.local_addr(),
        }
    }

    /// Accept one connection (§4.5). TLS handshakes are performed here with
    /// `deadline`; on handshake failure the underlying TCP connection is
    /// closed before returning (§4.2).
    pub async fn accept(&self, deadline: Duration) -> Result<(Connection, SocketAddr), GocatError> {
        match self {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept().await.map_err(GocatError::from_connect_io)?;
                Ok((Connection::Tcp { stream }, addr))
            }
            Listener::Unix(l) => {
                let (stream, _addr) = l.accept().await.map_err(GocatError::from_connect_io)?;
                let placeholder: SocketAddr = "0.0.0.0:0".parse().expect("static addr");
                Ok((Connection::Unix { stream }, placeholder))
            }
            Listener::TlsTcp(l, acceptor) => {
                let (tcp, addr) = l.accept().await.map_err(GocatError::from_connect_io)?;
                match timeout(deadline, acceptor.accept(tcp)).await {
                    Ok(Ok(stream)) => Ok((Connection::Tls { stream }, addr)),
                    Ok(Err(e)) => Err(GocatError::TlsHandshakeFailure(e.to_string())),
                    Err(_) => Err(GocatError::Timeout),
                }
            }
            Listener::Udp(_) => Err(GocatError::Validation(
                "UDP listeners do not accept; use recv_from".to_string(),
            )),
        }
    }
}

/// `dial(endpoint, deadline) -> Connection` (§4.2).
pub async fn dial(endpoint: &Endpoint, deadline: Duration) -> Result<Connection, GocatError> {
    match endpoint {
        Endpoint::Tcp { host, port, family } => {
            let stream = dial_tcp(host, *port, *family, deadline).await?;
            Ok(Connection::Tcp { stream })
        }
        Endpoint::Udp { host, port, family } => {
            let socket = dial_udp(host, *port, *family).await?;
            Ok(Connection::Udp {
                stream: UdpDuplex { socket },
            })
        }
        Endpoint::Unix { path, kind } => {
            if *kind != UnixKind::Stream {
                return Err(GocatError::Validation(
                    "dial only supports stream-oriented unix sockets".to_string(),
                ));
            }
            let stream = timeout(deadline, UnixStream::connect(path))
                .await
                .map_err(|_| GocatError::Timeout)?
                .map_err(GocatError::from_connect_io)?;
            Ok(Connection::Unix { stream })
        }
        Endpoint::TlsOverTcp {
            host,
            port,
            family,
            tls,
        } => {
            let tcp = dial_tcp(host, *port, *family, deadline).await?;
            let connector = build_tls_connector(tls)?;
            match timeout(deadline, connector.connect(host, tcp)).await {
                Ok(Ok(stream)) => Ok(Connection::Tls { stream }),
                Ok(Err(e)) => Err(GocatError::TlsHandshakeFailure(e.to_string())),
                Err(_) => Err(GocatError::Timeout),
            }
        }
    }
}

async fn dial_tcp(
    host: &str,
    port: u16,
    family: Family,
    deadline: Duration,
) -> Result<TcpStream, GocatError> {
    let candidates = resolve(host, port, family).await?;
    let mut last_err = None;
    for addr in candidates {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(GocatError::Io)?;
        match timeout(deadline, socket.connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(GocatError::from_connect_io(e)),
            Err(_) => last_err = Some(GocatError::Timeout),
        }
    }
    Err(last_err.unwrap_or_else(|| GocatError::ResolutionFailure(host.to_string())))
}

async fn dial_udp(host: &str, port: u16, family: Family) -> Result<UdpSocket, GocatError> {
    let candidates = resolve(host, port, family).await?;
    let target = candidates
        .into_iter()
        .next()
        .ok_or_else(|| GocatError::ResolutionFailure(host.to_string()))?;
    let bind_addr = match target {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    };
    let socket = UdpSocket::bind(bind_addr).await.map_err(GocatError::Io)?;
    socket
        .connect(target)
        .await
        .map_err(GocatError::from_connect_io)?;
    Ok(socket)
}

/// Resolve `host:port`, honouring the family pin (§4.2): `V4`/`V6` restrict
/// to that family only; `Any` tries every candidate the resolver returns,
/// in order, leaving first-success-wins to the caller.
async fn resolve(host: &str, port: u16, family: Family) -> Result<Vec<SocketAddr>, GocatError> {
    let lookup = format!("{host}:{port}");
    let addrs = tokio::net::lookup_host(&lookup)
        .await
        .map_err(|e| GocatError::ResolutionFailure(e.to_string()))?;
    let filtered: Vec<SocketAddr> = addrs
        .filter(|a| match family {
            Family::Any => true,
            Family::V4 => a.is_ipv4(),
            Family::V6 => a.is_ipv6(),
        })
        .collect();
    if filtered.is_empty() {
        return Err(GocatError::ResolutionFailure(format!(
            "no {family:?} addresses for {host}"
        )));
    }
    Ok(filtered)
}

/// `bind(endpoint) -> Listener` (§4.2).
pub async fn bind(endpoint: &Endpoint) -> Result<Listener, GocatError> {
    endpoint.validate_for_listen()?;
    match endpoint {
        Endpoint::Tcp { host, port, .. } => {
            let listener = TcpListener::bind((host.as_str(), *port))
                .await
                .map_err(classify_bind_error)?;
            Ok(Listener::Tcp(listener))
        }
        Endpoint::Udp { host, port, .. } => {
            let socket = UdpSocket::bind((host.as_str(), *port))
                .await
                .map_err(classify_bind_error)?;
            Ok(Listener::Udp(socket))
        }
        Endpoint::Unix { path, kind } => {
            if *kind != UnixKind::Stream {
                return Err(GocatError::Validation(
                    "bind only supports stream-oriented unix sockets".to_string(),
                ));
            }
            remove_stale_socket(path).await?;
            let listener = UnixListener::bind(path).map_err(classify_bind_error)?;
            set_unix_permissions(path, 0o600);
            Ok(Listener::Unix(listener))
        }
        Endpoint::TlsOverTcp { host, port, tls, .. } => {
            let listener = TcpListener::bind((host.as_str(), *port))
                .await
                .map_err(classify_bind_error)?;
            let acceptor = build_tls_acceptor(tls)?;
            Ok(Listener::TlsTcp(listener, acceptor))
        }
    }
}

fn classify_bind_error(err: io::Error) -> GocatError {
    match err.kind() {
        io::ErrorKind::AddrInUse => GocatError::AddressInUse(err),
        io::ErrorKind::PermissionDenied => GocatError::Permission(err.to_string()),
        _ => GocatError::Validation(err.to_string()),
    }
}

/// Remove a stale Unix socket file iff it is not currently bound, probed by
/// attempting a connect (§4.2).
async fn remove_stale_socket(path: &Path) -> Result<(), GocatError> {
    if !path.exists() {
        return Ok(());
    }
    match UnixStream::connect(path).await {
        Ok(_) => Err(GocatError::AddressInUse(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("unix socket already bound: {}", path.display()),
        ))),
        Err(_) => {
            fs::remove_file(path).map_err(GocatError::Io)?;
            Ok(())
        }
    }
}

#[cfg(unix)]
fn set_unix_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(mode);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_unix_permissions(_path: &Path, _mode: u32) {}

fn build_tls_connector(tls: &TlsConfig) -> Result<TlsConnector, GocatError> {
    let mut builder = native_tls::TlsConnector::builder();
    if !tls.verify_peer {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    if let Some(ca_file) = &tls.ca_file {
        let pem = fs::read(ca_file).map_err(GocatError::Io)?;
        let cert = native_tls::Certificate::from_pem(&pem)
            .map_err(|e| GocatError::TlsHandshakeFailure(e.to_string()))?;
        builder.add_root_certificate(cert);
    }
    if let (Some(cert_path), Some(key_path)) = (&tls.client_cert, &tls.client_key) {
        let cert_pem = fs::read(cert_path).map_err(GocatError::Io)?;
        let key_pem = fs::read(key_path).map_err(GocatError::Io)?;
        let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
            .map_err(|e| GocatError::TlsHandshakeFailure(e.to_string()))?;
        builder.identity(identity);
    }
    if tls.min_version == Some(TlsMinVersion::V1_2) {
        builder.min_protocol_version(Some(native_tls::Protocol::Tlsv12));
    }
    let connector = builder
        .build()
        .map_err(|e| GocatError::TlsHandshakeFailure(e.to_string()))?;
    Ok(TlsConnector::from(connector))
}

fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, GocatError> {
    let cert_path = tls
        .server_cert
        .as_ref()
        .ok_or_else(|| GocatError::Validation("server_cert required".to_string()))?;
    let key_path = tls
        .server_key
        .as_ref()
        .ok_or_else(|| GocatError::Validation("server_key required".to_string()))?;
    let cert_pem = fs::read(cert_path).map_err(GocatError::Io)?;
    let key_pem = fs::read(key_path).map_err(GocatError::Io)?;
    let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
        .map_err(|e| GocatError::TlsHandshakeFailure(e.to_string()))?;
    let mut builder = native_tls::TlsAcceptor::builder(identity);
    if tls.min_version == Some(TlsMinVersion::V1_2) {
        builder.min_protocol_version(Some(native_tls::Protocol::Tlsv12));
    }
    let acceptor = builder
        .build()
        .map_err(|e| GocatError::TlsHandshakeFailure(e.to_string()))?;
    Ok(TlsAcceptor::from(acceptor))
}
