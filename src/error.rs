//! Error taxonomy (spec §7). Leaf error enums are `thiserror`-derived and
//! implement `std::error::Error`; only the binary entry point reaches for
//! `anyhow` to collapse configuration failures into a process exit code.

use thiserror::Error;

/// Failures that can occur while establishing a TCP (or TLS) connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection refused")]
    Refused,
    #[error("connect timed out")]
    TimedOut,
    #[error("no file descriptors available")]
    FdUnavailable,
    #[error("process file descriptor table is full")]
    FtabFull,
    #[error("requested local address is unavailable")]
    AddressUnavailable,
    #[error("connect failed for another reason")]
    Other,
}

/// Failures while reading or writing an established socket.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    #[error("connection reset by peer")]
    Reset,
    #[error("read failed")]
    ReadError,
    #[error("write failed")]
    WriteError,
}

/// Non-fatal and fatal conditions raised while decoding a reply.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("could not parse status line")]
    BadStatusLine,
    #[error("header line exceeded scratch buffer and was truncated")]
    LineTruncated,
    #[error("unrecognized transfer-encoding (diagnostic only)")]
    UnknownTransferEncoding,
}

/// The three watchdog timeouts, distinguished internally but mapped to a
/// single `client-timeout` stats bucket at the reporting boundary.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    #[error("connect timed out")]
    Connect,
    #[error("think time elapsed without a new request")]
    Think,
    #[error("reply did not arrive before the deadline")]
    Reply,
}

impl TimeoutKind {
    /// Stats boundary collapse: all three kinds count as one bucket.
    pub const STATS_BUCKET: &'static str = "client-timeout";
}

/// Resource exhaustion within this process.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    #[error("no ephemeral source ports remain in the configured range")]
    PortExhausted,
    #[error("allocation failed")]
    OutOfMemory,
}

/// Pre-flight configuration problems; fatal, reported before the reactor
/// starts.
#[derive(Debug, Error)]
#[error("bad argument: {0}")]
pub struct ConfigError(pub String);

/// The composite error kind attached to `CONN_FAILED`/`CONN_TIMEOUT` events
/// and to the stats collector's per-kind counters.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Io(#[from] IoErrorKind),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Timeout(#[from] TimeoutKind),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl CoreError {
    /// Name of the stats bucket this error rolls up into, matching the
    /// taxonomy in spec.md §7.
    pub fn bucket(&self) -> &'static str {
        match self {
            CoreError::Connect(ConnectError::Refused) => "refused",
            CoreError::Connect(ConnectError::TimedOut) => "timed-out",
            CoreError::Connect(ConnectError::FdUnavailable) => "fd-unavailable",
            CoreError::Connect(ConnectError::FtabFull) => "ftab-full",
            CoreError::Connect(ConnectError::AddressUnavailable) => "address-unavailable",
            CoreError::Connect(ConnectError::Other) => "other-connect",
            CoreError::Io(IoErrorKind::Reset) => "reset",
            CoreError::Io(IoErrorKind::ReadError) => "read-error",
            CoreError::Io(IoErrorKind::WriteError) => "write-error",
            CoreError::Protocol(ProtocolError::BadStatusLine) => "bad-status-line",
            CoreError::Protocol(ProtocolError::LineTruncated) => "line-truncated",
            CoreError::Protocol(ProtocolError::UnknownTransferEncoding) => {
                "unknown-transfer-encoding"
            }
            CoreError::Timeout(_) => TimeoutKind::STATS_BUCKET,
            CoreError::Resource(ResourceError::PortExhausted) => "port-exhausted",
            CoreError::Resource(ResourceError::OutOfMemory) => "out-of-memory",
        }
    }

    /// Best-effort mapping from a raw `errno` observed on a syscall to the
    /// connect-time taxonomy, ported from the `goto failure` paths in
    /// `core_connect`.
    pub fn from_connect_errno(errno: i32) -> Self {
        use nix::errno::Errno;
        let kind = match Errno::from_raw(errno) {
            Errno::ECONNREFUSED => ConnectError::Refused,
            Errno::ETIMEDOUT => ConnectError::TimedOut,
            Errno::EMFILE | Errno::ENFILE => ConnectError::FdUnavailable,
            Errno::EADDRNOTAVAIL => ConnectError::AddressUnavailable,
            _ => ConnectError::Other,
        };
        CoreError::Connect(kind)
    }
}
