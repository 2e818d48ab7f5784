//! Error taxonomy shared by every component (§7).
//!
//! Kinds are matched on by calling code (the Connector's retry-vs-abort
//! decision, the Scanner's Closed/Filtered classification), so a flat
//! boxed error would not do; `thiserror` gives named, inspectable variants
//! and an `exit_code()` the CLI maps directly to a process exit status.

use std::io;
use std::net::AddrParseError;

use thiserror::Error;

/// One error kind per row of the §7 taxonomy table.
#[derive(Error, Debug)]
pub enum GocatError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(#[source] io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("network unreachable: {0}")]
    Unreachable(#[source] io::Error),

    #[error("dns resolution failed: {0}")]
    ResolutionFailure(String),

    #[error("tls handshake failed: {0}")]
    TlsHandshakeFailure(String),

    #[error("address already in use: {0}")]
    AddressInUse(#[source] io::Error),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("short read/write: {0}")]
    Short(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal panic: {0}")]
    Panic(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl GocatError {
    /// Classify a raw I/O error from `connect`/`accept` per §4.2's failure semantics.
    pub fn from_connect_io(err: io::Error) -> Self {
        // ENETUNREACH / EHOSTUNREACH on Unix; std's ErrorKind taxonomy does not
        // give every platform a stable variant for these, so fall back to the
        // raw OS error code rather than depend on recently-stabilised kinds.
        const ENETUNREACH: i32 = 101;
        const EHOSTUNREACH: i32 = 113;
        match err.kind() {
            io::ErrorKind::ConnectionRefused => GocatError::ConnectionRefused(err),
            io::ErrorKind::TimedOut => GocatError::Timeout,
            io::ErrorKind::AddrInUse => GocatError::AddressInUse(err),
            io::ErrorKind::PermissionDenied => GocatError::Permission(err.to_string()),
            _ if matches!(err.raw_os_error(), Some(ENETUNREACH) | Some(EHOSTUNREACH)) => {
                GocatError::Unreachable(err)
            }
            _ => GocatError::Io(err),
        }
    }

    /// True for kinds the Connector should retry (§4.4): refused, timeout, unreachable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GocatError::ConnectionRefused(_) | GocatError::Timeout | GocatError::Unreachable(_)
        )
    }

    /// Exit code per §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            GocatError::Validation(_) => 1,
            GocatError::Permission(_) => 3,
            GocatError::Cancelled => 130,
            _ => 2,
        }
    }

    /// A short, user-facing suggestion for well-known kinds (§7).
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            GocatError::ConnectionRefused(_) => {
                Some("is a server listening on that port?")
            }
            GocatError::Timeout => Some("check firewall rules or increase --timeout"),
            GocatError::ResolutionFailure(_) => Some("check the hostname and DNS configuration"),
            GocatError::TlsHandshakeFailure(_) => {
                Some("verify the certificate and --ca-cert configuration")
            }
            _ => None,
        }
    }
}

impl From<AddrParseError> for GocatError {
    fn from(e: AddrParseError) -> Self {
        GocatError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GocatError>;
