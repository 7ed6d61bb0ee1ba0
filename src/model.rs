//! Data model (spec §3): `Connection`, `Call`, `Session`.
//!
//! Per Design Note 9, Calls live inside their owning Connection's arena —
//! `ConnKey`/`CallKey`/`SessionKey` are `Copy` slotmap keys, not pointers,
//! so the Call's back-reference to its Connection is non-owning for free,
//! with no reference cycle and no unsafe code.

use std::collections::VecDeque;
use std::time::Duration;

use slotmap::{new_key_type, SlotMap};

use crate::conn::parser::ParserState;

new_key_type! {
    pub struct ConnKey;
    pub struct CallKey;
    pub struct SessionKey;
}

/// Maximum header line length the parser's scratch buffer holds before
/// truncating, ported from `MAX_HDR_LINE_LEN` in `conn.h`.
pub const MAX_HDR_LINE_LEN: usize = 1024;

/// HTTP protocol version requested by the client. The server's actual reply
/// version is tracked separately on [`Reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Http10,
    Http11,
}

/// One of the four protocol-line constants selected in `core_send`,
/// depending on requested version and whether a Host header is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolLine {
    Http10,
    Http10NoHost,
    Http11,
    Http11NoHost,
}

impl ProtocolLine {
    pub fn select(version: ProtocolVersion, want_host: bool) -> Self {
        match (version, want_host) {
            (ProtocolVersion::Http10, true) => ProtocolLine::Http10,
            (ProtocolVersion::Http10, false) => ProtocolLine::Http10NoHost,
            (ProtocolVersion::Http11, true) => ProtocolLine::Http11,
            (ProtocolVersion::Http11, false) => ProtocolLine::Http11NoHost,
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            ProtocolLine::Http10 => HTTP10.as_bytes(),
            ProtocolLine::Http10NoHost => HTTP10_NOHOST.as_bytes(),
            ProtocolLine::Http11 => HTTP11.as_bytes(),
            ProtocolLine::Http11NoHost => HTTP11_NOHOST.as_bytes(),
        }
    }
}

/// HTTP/1.0 defaults to closing after one reply, so both variants advertise
/// keep-alive explicitly; HTTP/1.1 keeps it implicit. Dropping the Host
/// header says nothing about keep-alive, so the no-Host constants only
/// differ from their with-Host counterparts in what `core_send` appends
/// after them.
const HTTP10: &str = concat!(" HTTP/1.0\r\n", "User-Agent: httpburst/", env!("CARGO_PKG_VERSION"), "\r\nConnection: keep-alive\r\n");
const HTTP10_NOHOST: &str = concat!(" HTTP/1.0\r\n", "User-Agent: httpburst/", env!("CARGO_PKG_VERSION"), "\r\nConnection: keep-alive\r\n");
const HTTP11: &str = concat!(" HTTP/1.1\r\n", "User-Agent: httpburst/", env!("CARGO_PKG_VERSION"), "\r\n");
const HTTP11_NOHOST: &str = concat!(" HTTP/1.1\r\n", "User-Agent: httpburst/", env!("CARGO_PKG_VERSION"), "\r\n");

/// A request built as a small fixed vector of byte fragments, written with
/// a scatter-gather `writev`. Mirrors `call.h`'s `struct iovec iov[...]`.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Vec<u8>,
    pub uri: Vec<u8>,
    pub protocol_line: ProtocolLine,
    pub host_header: Option<Vec<u8>>,
    /// Up to four caller-supplied extra headers, verbatim.
    pub extra_headers: Vec<Vec<u8>>,
    pub body: Vec<u8>,
}

pub const MAX_EXTRA_HEADERS: usize = 4;

impl Request {
    pub fn new(method: impl Into<Vec<u8>>, uri: impl Into<Vec<u8>>, version: ProtocolVersion) -> Self {
        Request {
            method: method.into(),
            uri: uri.into(),
            protocol_line: ProtocolLine::select(version, true),
            host_header: None,
            extra_headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Build the scatter-gather fragment list in wire order: method, space,
    /// URI, protocol line, Host header, CRLF, extra headers, CRLF, body.
    pub fn fragments(&self) -> Vec<&[u8]> {
        let mut frags = Vec::with_capacity(8 + self.extra_headers.len());
        frags.push(self.method.as_slice());
        frags.push(b" ".as_slice());
        frags.push(self.uri.as_slice());
        frags.push(self.protocol_line.as_bytes());
        if let Some(host) = &self.host_header {
            frags.push(host.as_slice());
        }
        for h in &self.extra_headers {
            frags.push(h.as_slice());
        }
        frags.push(b"\r\n".as_slice());
        if !self.body.is_empty() {
            frags.push(self.body.as_slice());
        }
        frags
    }
}

/// Reply metadata accumulated by the parser (spec §3, §4.7).
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub status: u32,
    /// `0x10000*major + minor`, ported from `core.c`'s version encoding.
    pub version: u32,
    pub header_bytes: usize,
    pub content_bytes: usize,
    pub footer_bytes: usize,
}

/// One request/reply pair in flight on a connection (spec §3).
pub struct Call {
    pub id: u64,
    pub conn: ConnKey,
    pub request: Request,
    pub reply: Reply,
    /// Absolute deadline (seconds, `TimerWheel` epoch) after which this call
    /// is considered overdue; `None` means no per-call timeout configured.
    pub deadline: Option<f64>,
    /// Progress through the send-side fixed iovec, so partial writes can
    /// resume (ported from `req.iov_index`/`iov_saved`).
    pub send_fragment_index: usize,
    pub send_fragment_offset: usize,
    /// Clock reading (wheel epoch) at which the request finished sending,
    /// so [`crate::conn::recv_done`] can report a response-time sample.
    pub request_sent_at: Option<f64>,
}

impl Call {
    pub fn new(id: u64, conn: ConnKey, request: Request) -> Self {
        Call {
            id,
            conn,
            request,
            reply: Reply::default(),
            deadline: None,
            send_fragment_index: 0,
            send_fragment_offset: 0,
            request_sent_at: None,
        }
    }
}

/// Connection engine phases (spec §4.6), ported from `Conn_State` in
/// `conn.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Initial,
    Connecting,
    Connected,
    ReplyStatus,
    ReplyHeader,
    ReplyContinue,
    ReplyData,
    ReplyChunked,
    ReplyFooter,
    ReplyDone,
    Closing,
    Free,
}

/// Per-connection parser scratch: the accumulated header-line buffer plus
/// body-framing sub-state for the reply currently in flight.
pub struct ParserScratch {
    pub line: Vec<u8>,
    pub content_length: usize,
    pub is_chunked: bool,
    pub has_body: bool,
    pub state: ParserState,
}

impl Default for ParserScratch {
    fn default() -> Self {
        ParserScratch {
            line: Vec::with_capacity(128),
            content_length: usize::MAX,
            is_chunked: false,
            has_body: true,
            state: ParserState::Status,
        }
    }
}

/// One TCP (or TLS) socket to one (server, port) (spec §3).
pub struct Connection {
    pub state: ConnState,
    pub host: String,
    pub port: u16,
    /// Overrides the Host header independent of the connect target
    /// (`--server-name`).
    pub host_header_override: Option<String>,
    pub source_port: Option<u16>,
    /// Which `AddrPool` source entry `source_port` was acquired from, so
    /// `close` releases it back to the same bitmap it came from rather than
    /// whichever entry the round-robin cursor currently points at.
    pub source_entry: Option<usize>,
    pub socket: Option<crate::conn::Socket>,
    pub sendq: VecDeque<CallKey>,
    pub recvq: VecDeque<CallKey>,
    pub calls: SlotMap<CallKey, Call>,
    pub watchdog: Option<crate::clock::TimerHandle>,
    pub scratch: ParserScratch,
    pub owning_session: Option<SessionKey>,
    pub ref_count: u32,
    pub time_connect_start: f64,
    pub num_calls_completed: u32,
}

impl Connection {
    pub fn new(host: String, port: u16) -> Self {
        Connection {
            state: ConnState::Initial,
            host,
            port,
            host_header_override: None,
            source_port: None,
            source_entry: None,
            socket: None,
            sendq: VecDeque::new(),
            recvq: VecDeque::new(),
            calls: SlotMap::with_key(),
            watchdog: None,
            scratch: ParserScratch::default(),
            owning_session: None,
            ref_count: 1,
            time_connect_start: 0.0,
            num_calls_completed: 0,
        }
    }

    pub fn fqdname(&self) -> &str {
        self.host_header_override.as_deref().unwrap_or(&self.host)
    }
}

/// Optional grouping used by multi-call workloads (spec §3).
pub struct Session {
    pub failed: bool,
    pub connections: Vec<ConnKey>,
    pub ref_count: u32,
    /// Collaborator-private cookie, set by `--session-cookies`.
    pub cookie: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Session {
            failed: false,
            connections: Vec::new(),
            ref_count: 1,
            cookie: None,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call and per-connection reply/send watchdog deadlines are tracked in
/// wall-clock seconds relative to the shared [`crate::clock::TimerWheel`].
pub fn duration_to_secs(d: Duration) -> f64 {
    d.as_secs_f64()
}
