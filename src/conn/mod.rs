//! Connection Engine (spec §4.6), ported from `core_connect`/`core_send`/
//! `do_send`/`do_recv`/`core_close`/`set_active`/`conn_timeout` in `core.c`.
//!
//! Every entry point here takes `&mut Core` rather than threading the
//! individual collaborators (event bus, timer wheel, reactor, address pool)
//! through each call, per Design Note "Global mutable state": the whole
//! process-wide state is one value, passed explicitly, so the engine stays
//! free functions instead of methods tangled in borrow conflicts with the
//! slotmap that owns the `Connection` itself.

pub mod parser;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};

use crate::core::Core;
use crate::error::{CoreError, IoErrorKind};
use crate::event_bus::{EventArg, EventKind, Subject};
use crate::model::{CallKey, Connection, ConnKey, ConnState};
use crate::reactor::Interest;

/// Bytes read per `do_recv` syscall, ported from `core.c`'s `buf[8193]`.
const RECV_BUFFER: usize = 8192;

/// The connection's transport: a plain TCP stream, or (behind the `tls`
/// feature) a TLS session over one. Kept as a thin enum rather than a trait
/// object so `do_send`/`do_recv` can still reach the raw fd for reactor
/// registration without a second vtable indirection.
pub enum Socket {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(crate::tls::TlsStream),
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Socket::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Socket::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Socket::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.flush(),
        }
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Socket::Plain(s) => s.as_fd(),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.as_raw_socket().as_fd(),
        }
    }
}

pub fn new_connection(core: &mut Core, host: String, port: u16) -> ConnKey {
    let key = core.conns.insert(Connection::new(host, port));
    core.signal(EventKind::ConnNew, Subject::Conn(key), EventArg::None);
    key
}

/// Open the socket and drive the connect handshake. Ported from
/// `core_connect`.
pub fn connect(core: &mut Core, conn: ConnKey) -> Result<(), CoreError> {
    core.conns[conn].time_connect_start = core.clock.now_forced();
    core.signal(EventKind::ConnConnecting, Subject::Conn(conn), EventArg::None);
    if core.conns[conn].state >= ConnState::Closing {
        return Ok(());
    }

    let host = core.conns[conn].host.clone();
    let port = core.conns[conn].port;
    let addr = match core.addr_pool.resolve(&host, port) {
        Ok(addr) => addr,
        Err(_) => return fail(core, conn, CoreError::Connect(crate::error::ConnectError::Other)),
    };

    let fd = match socket::socket(AddressFamily::Inet, SockType::Stream, SockFlag::SOCK_NONBLOCK, None) {
        Ok(fd) => fd,
        Err(errno) => return fail(core, conn, CoreError::from_connect_errno(errno as i32)),
    };

    if core.config.transport.close_with_reset {
        if let Err(errno) = socket::setsockopt(&fd, sockopt::Linger, &libc::linger { l_onoff: 1, l_linger: 0 }) {
            return fail(core, conn, CoreError::from_connect_errno(errno as i32));
        }
    }
    if let Err(errno) = socket::setsockopt(&fd, sockopt::TcpNoDelay, &true) {
        return fail(core, conn, CoreError::from_connect_errno(errno as i32));
    }
    if let Err(errno) = socket::setsockopt(&fd, sockopt::SndBuf, &(core.config.transport.send_buffer as usize)) {
        return fail(core, conn, CoreError::from_connect_errno(errno as i32));
    }
    if let Err(errno) = socket::setsockopt(&fd, sockopt::RcvBuf, &(core.config.transport.recv_buffer as usize)) {
        return fail(core, conn, CoreError::from_connect_errno(errno as i32));
    }

    // Spec §4.6 "Socket options": hog mode always binds an ephemeral port
    // from the pool before connect; otherwise only bind if a non-default
    // source address was configured. Ported from `core_connect`'s bind
    // block: retry on `EADDRINUSE` with a freshly drawn port (the pool can
    // legitimately hand back a port the OS still has in its TIME_WAIT set);
    // any other errno, including `EADDRNOTAVAIL`, is fatal and not retried
    // (Design Note open question, resolved per SPEC_FULL.md §9).
    let needs_bind = core.config.transport.hog || core.addr_pool.has_sources();
    let mut bound_entry = None;
    if needs_bind {
        if let Some(entry) = core.addr_pool.next_source() {
            let src_ip = core.addr_pool.source_addr(entry);
            let std::net::IpAddr::V4(src_v4) = src_ip else {
                return fail(core, conn, CoreError::Connect(crate::error::ConnectError::Other));
            };
            loop {
                let myport = match core.addr_pool.acquire_port(entry) {
                    Ok(p) => p,
                    Err(_) => return fail(core, conn, CoreError::Resource(crate::error::ResourceError::PortExhausted)),
                };
                let sockaddr = SockaddrIn::from(std::net::SocketAddrV4::new(src_v4, myport));
                match socket::bind(fd.as_raw_fd(), &sockaddr) {
                    Ok(()) => {
                        bound_entry = Some((entry, myport));
                        break;
                    }
                    Err(nix::errno::Errno::EADDRINUSE) => {
                        core.addr_pool.release_port(entry, myport);
                        continue;
                    }
                    Err(errno) => {
                        core.addr_pool.release_port(entry, myport);
                        return fail(core, conn, CoreError::from_connect_errno(errno as i32));
                    }
                }
            }
        }
    }

    let sockaddr = match addr {
        std::net::SocketAddr::V4(v4) => SockaddrIn::from(v4),
        std::net::SocketAddr::V6(_) => {
            if let Some((entry, port)) = bound_entry {
                core.addr_pool.release_port(entry, port);
            }
            return fail(core, conn, CoreError::Connect(crate::error::ConnectError::Other));
        }
    };

    let connect_result = loop {
        match socket::connect(fd.as_raw_fd(), &sockaddr) {
            Err(nix::errno::Errno::EINTR) => continue,
            other => break other,
        }
    };

    match connect_result {
        Ok(()) => {
            finish_socket_setup(core, conn, fd, bound_entry);
            core.conns[conn].state = ConnState::Connected;
            let _ = core.reactor.register(core.conns[conn].socket.as_ref().unwrap(), conn, Interest::READABLE);
            let elapsed = core.clock.now_forced() - core.conns[conn].time_connect_start;
            core.signal(EventKind::ConnConnected, Subject::Conn(conn), EventArg::Seconds(elapsed));
            if let Err(e) = maybe_start_tls(core, conn) {
                return fail(core, conn, e);
            }
        }
        Err(nix::errno::Errno::EINPROGRESS) => {
            finish_socket_setup(core, conn, fd, bound_entry);
            core.conns[conn].state = ConnState::Connecting;
            let _ = core.reactor.register(core.conns[conn].socket.as_ref().unwrap(), conn, Interest::WRITABLE);
            if core.config.timing.timeout > 0.0 {
                let timeout = core.config.timing.timeout;
                let handle = core.clock.schedule(timeout, move |core: &mut Core| {
                    conn_timeout(core, conn);
                });
                core.conns[conn].watchdog = handle;
            }
        }
        Err(errno) => {
            if let Some((entry, port)) = bound_entry {
                core.addr_pool.release_port(entry, port);
            }
            return fail(core, conn, CoreError::from_connect_errno(errno as i32));
        }
    }
    Ok(())
}

fn finish_socket_setup(core: &mut Core, conn: ConnKey, fd: OwnedFd, bound_entry: Option<(usize, u16)>) {
    core.conns[conn].socket = Some(Socket::Plain(TcpStream::from(fd)));
    if let Some((entry, port)) = bound_entry {
        core.conns[conn].source_port = Some(port);
        core.conns[conn].source_entry = Some(entry);
    }
}

/// If `--ssl` is configured, wrap the now-connected plaintext socket in a TLS
/// session (spec §1's TLS-as-collaborator, given a minimal concrete binding
/// here). A no-op when `--ssl` was not requested; an error when it was but
/// the crate was built without the `tls` feature.
fn maybe_start_tls(core: &mut Core, conn: ConnKey) -> Result<(), CoreError> {
    if !core.config.transport.ssl {
        return Ok(());
    }
    #[cfg(feature = "tls")]
    {
        let host = core.conns[conn].fqdname().to_string();
        let ciphers = core.config.transport.ssl_ciphers.clone();
        let Some(Socket::Plain(tcp)) = core.conns[conn].socket.take() else {
            return Err(CoreError::Connect(crate::error::ConnectError::Other));
        };
        match crate::tls::TlsStream::connect(tcp, &host, ciphers.as_deref()) {
            Ok(tls) => {
                core.conns[conn].socket = Some(Socket::Tls(tls));
                let _ = core
                    .reactor
                    .reinterest(core.conns[conn].socket.as_ref().unwrap(), Interest::READABLE | Interest::WRITABLE);
                Ok(())
            }
            Err(_) => Err(CoreError::Connect(crate::error::ConnectError::Other)),
        }
    }
    #[cfg(not(feature = "tls"))]
    {
        Err(CoreError::Connect(crate::error::ConnectError::Other))
    }
}

/// Called when the reactor reports the connecting socket is writable:
/// `SO_ERROR` of zero means the handshake completed. Ported from
/// `core_loop`'s `S_CONNECTING` branch.
pub fn on_connect_writable(core: &mut Core, conn: ConnKey) {
    if let Some(handle) = core.conns[conn].watchdog.take() {
        let _ = core.clock.cancel(handle);
    }
    let err: i32 = socket::getsockopt(core.conns[conn].socket.as_ref().unwrap(), sockopt::SocketError).unwrap_or(0);
    if err != 0 {
        fail(core, conn, CoreError::from_connect_errno(err)).ok();
        return;
    }
    core.conns[conn].state = ConnState::Connected;
    let elapsed = core.clock.now_forced() - core.conns[conn].time_connect_start;
    core.signal(EventKind::ConnConnected, Subject::Conn(conn), EventArg::Seconds(elapsed));
    if !core.conns.contains_key(conn) || core.conns[conn].state >= ConnState::Closing {
        return;
    }
    if let Err(e) = maybe_start_tls(core, conn) {
        fail(core, conn, e).ok();
        return;
    }
    // The connect watchdog was just cancelled above; re-derive the
    // connection's watchdog from whatever call deadlines are already queued
    // (`core_send` set one on the sendq head before the handshake finished).
    set_active(core, conn);
    // A request may already have been queued while the handshake was in
    // flight (`issue_connection` calls `issue_call` right after `connect`
    // returns `EINPROGRESS`); resume sending it now instead of leaving the
    // socket armed for nothing.
    if !core.conns[conn].sendq.is_empty() {
        do_send(core, conn);
    } else {
        let _ = core.reactor.reinterest(core.conns[conn].socket.as_ref().unwrap(), Interest::READABLE);
    }
}

/// Enqueue `call` for sending on `conn`. Ported from `core_send`.
pub fn core_send(core: &mut Core, conn: ConnKey, call: CallKey) {
    core.signal(EventKind::CallIssue, Subject::Call(call), EventArg::None);

    let want_host = !core.config.protocol.no_host_hdr;
    if want_host && core.conns[conn].calls[call].request.host_header.is_none() {
        let host = core.conns[conn].fqdname().to_string();
        core.conns[conn].calls[call].request.host_header = Some(format!("Host: {host}\r\n").into_bytes());
    }

    let was_idle = core.conns[conn].sendq.is_empty();
    core.conns[conn].sendq.push_back(call);

    if was_idle {
        core.signal(EventKind::CallSendStart, Subject::Call(call), EventArg::None);
        if !core.conns.contains_key(conn) || core.conns[conn].state >= ConnState::Closing {
            return;
        }
        if core.config.timing.timeout > 0.0 {
            core.conns[conn].calls[call].deadline = Some(core.clock.now() + core.config.timing.timeout);
        }
        if core.conns[conn].state == ConnState::Connecting {
            set_active(core, conn);
            return;
        }
        arm_writable(core, conn);
    }
}

fn arm_writable(core: &mut Core, conn: ConnKey) {
    if core.conns[conn].socket.is_some() {
        let _ = core.reactor.reinterest(core.conns[conn].socket.as_ref().unwrap(), Interest::READABLE | Interest::WRITABLE);
    }
    set_active(core, conn);
}

/// Compute the minimum of the connection's in-flight deadlines and (re)arm
/// its single watchdog. A no-op if one is already scheduled; callers that
/// need the deadline recomputed (a call completed, changing which deadline
/// is now soonest) must cancel the existing watchdog first. Ported from
/// `set_active`.
fn set_active(core: &mut Core, conn: ConnKey) {
    if core.conns[conn].watchdog.is_some() {
        return;
    }
    let mut timeout = None;
    if let Some(&head) = core.conns[conn].sendq.front() {
        timeout = core.conns[conn].calls[head].deadline;
    }
    if let Some(&head) = core.conns[conn].recvq.front() {
        let d = core.conns[conn].calls[head].deadline;
        timeout = match (timeout, d) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (None, b) => b,
            (a, None) => a,
        };
    }
    if let Some(deadline) = timeout {
        let now = core.clock.now();
        let delay = (deadline - now).max(0.0);
        let handle = core.clock.schedule(delay, move |core: &mut Core| conn_timeout(core, conn));
        core.conns[conn].watchdog = handle;
    }
}

/// Write as much of the head-of-`sendq` call's request as the socket will
/// accept. Ported from `do_send`.
pub fn do_send(core: &mut Core, conn: ConnKey) {
    loop {
        let Some(&call) = core.conns[conn].sendq.front() else { return };

        let bytes: Vec<u8> = {
            let c = &core.conns[conn].calls[call];
            let start = c.send_fragment_index;
            let frags = c.request.fragments();
            let mut buf = Vec::new();
            for (i, frag) in frags.iter().enumerate().skip(start) {
                let slice = if i == start { &frag[c.send_fragment_offset..] } else { &frag[..] };
                buf.extend_from_slice(slice);
            }
            buf
        };

        core.signal(EventKind::CallSendRawData, Subject::Call(call), EventArg::RawData(&bytes));

        let stream = core.conns[conn].socket.as_mut().unwrap();
        match stream.write(&bytes) {
            Ok(0) => return,
            Ok(n) => {
                advance_send_cursor(core, conn, call, n);
                let done = core.conns[conn].calls[call].send_fragment_index >= core.conns[conn].calls[call].request.fragments().len();
                if !done {
                    if core.config.timing.timeout > 0.0 {
                        core.conns[conn].calls[call].deadline = Some(core.clock.now() + core.config.timing.timeout);
                    }
                    continue;
                }
                finish_send(core, conn, call);
                if core.conns[conn].state >= ConnState::Closing {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                fail(core, conn, CoreError::Io(io_error_kind(&e))).ok();
                return;
            }
        }
    }
}

fn advance_send_cursor(core: &mut Core, conn: ConnKey, call: CallKey, mut nsent: usize) {
    let c = &mut core.conns[conn].calls[call];
    let frags = c.request.fragments();
    while nsent > 0 && c.send_fragment_index < frags.len() {
        let remaining = frags[c.send_fragment_index].len() - c.send_fragment_offset;
        if nsent < remaining {
            c.send_fragment_offset += nsent;
            nsent = 0;
        } else {
            nsent -= remaining;
            c.send_fragment_index += 1;
            c.send_fragment_offset = 0;
        }
    }
}

fn finish_send(core: &mut Core, conn: ConnKey, call: CallKey) {
    core.conns[conn].sendq.pop_front();
    core.conns[conn].calls[call].request_sent_at = Some(core.clock.now());
    core.signal(EventKind::CallSendStop, Subject::Call(call), EventArg::None);
    if core.conns[conn].state >= ConnState::Closing {
        return;
    }

    core.conns[conn].recvq.push_back(call);
    let think = core.config.timing.timeout + core.config.timing.think_timeout;
    core.conns[conn].calls[call].deadline = if think > 0.0 { Some(core.clock.now() + think) } else { None };
    if core.conns[conn].state < ConnState::ReplyStatus {
        core.conns[conn].state = ConnState::ReplyStatus;
        core.conns[conn].scratch.state = parser::ParserState::Status;
    }
    // The watchdog armed for this call's send deadline is still ticking;
    // cancel it so `set_active` recomputes from the reply deadline instead
    // of leaving the stale one in place.
    if let Some(handle) = core.conns[conn].watchdog.take() {
        let _ = core.clock.cancel(handle);
    }
    set_active(core, conn);

    if let Some(&next) = core.conns[conn].sendq.front() {
        core.signal(EventKind::CallSendStart, Subject::Call(next), EventArg::None);
    } else if core.conns[conn].socket.is_some() {
        let _ = core.reactor.reinterest(core.conns[conn].socket.as_ref().unwrap(), Interest::READABLE);
    }
}

/// Read available reply bytes and feed them to the parser. Ported from
/// `do_recv`.
pub fn do_recv(core: &mut Core, conn: ConnKey) {
    loop {
        let mut buf = [0u8; RECV_BUFFER];
        let n = {
            let stream = core.conns[conn].socket.as_mut().unwrap();
            stream.read(&mut buf)
        };

        match n {
            Ok(0) => {
                let Some(&call) = core.conns[conn].recvq.front() else { return };
                if core.conns[conn].state == ConnState::ReplyData {
                    core.conns[conn].scratch.state = parser::ParserState::Done;
                    core.conns[conn].state = ConnState::ReplyDone;
                    recv_done(core, conn, call);
                } else {
                    fail(core, conn, CoreError::Io(IoErrorKind::Reset)).ok();
                }
                return;
            }
            Ok(n) => {
                process_received(core, conn, &buf[..n]);
                if !core.conns.contains_key(conn) || core.conns[conn].state >= ConnState::Closing {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                fail(core, conn, CoreError::Io(io_error_kind(&e))).ok();
                return;
            }
        }
    }
}

/// Drive the parser over one read's worth of bytes, looping over however
/// many replies it spans (pipelining, spec §8 scenario S6), and signal every
/// `CALL_RECV_*` occurrence the parser recorded once its borrow of `call`/
/// `scratch` has ended (module docs on [`parser::ReplyEvent`]).
fn process_received(core: &mut Core, conn: ConnKey, mut data: &[u8]) {
    loop {
        let Some(&call) = core.conns[conn].recvq.front() else { return };

        if core.conns[conn].state == ConnState::ReplyStatus {
            let think = core.config.timing.timeout + core.config.timing.think_timeout;
            core.conns[conn].calls[call].deadline = if think > 0.0 { Some(core.clock.now() + think) } else { None };
        }

        let mut events = Vec::new();
        data = {
            let conn_ref = &mut core.conns[conn];
            let call_ref = &mut conn_ref.calls[call];
            let scratch = &mut conn_ref.scratch;
            parser::process(call_ref, scratch, data, &mut events)
        };

        core.conns[conn].state = core.conns[conn].scratch.state.to_conn_state();
        emit_reply_events(core, call, events);

        if core.conns[conn].state == ConnState::ReplyDone {
            recv_done(core, conn, call);
            if !core.conns.contains_key(conn) || core.conns[conn].state >= ConnState::Closing {
                return;
            }
            core.conns[conn].state = ConnState::ReplyStatus;
            core.conns[conn].scratch.state = parser::ParserState::Status;
        }

        if data.is_empty() {
            break;
        }
    }

    if core.conns[conn].socket.is_some() && !core.conns[conn].recvq.is_empty() {
        let _ = core.reactor.reinterest(core.conns[conn].socket.as_ref().unwrap(), Interest::READABLE);
    }
}

/// Translate the parser's buffered [`parser::ReplyEvent`] log into real
/// `CALL_RECV_*` signals on the bus, in the order the parser produced them
/// (spec §5 ordering guarantee). `RecvStop` is not re-signalled here: the
/// caller (`recv_done`) signals it once the call has also been popped off
/// `recvq`, so collectors see queue state consistent with the event.
fn emit_reply_events(core: &mut Core, call: CallKey, events: Vec<parser::ReplyEvent>) {
    for event in events {
        match event {
            parser::ReplyEvent::RecvStart(status) => {
                core.signal(EventKind::CallRecvStart, Subject::Call(call), EventArg::StatusCode(status));
            }
            parser::ReplyEvent::RecvHdr(line) => {
                core.signal(EventKind::CallRecvHdr, Subject::Call(call), EventArg::Line(&line));
            }
            parser::ReplyEvent::RecvRawData(data) => {
                core.signal(EventKind::CallRecvRawData, Subject::Call(call), EventArg::RawData(&data));
            }
            parser::ReplyEvent::RecvData(data) => {
                core.signal(EventKind::CallRecvData, Subject::Call(call), EventArg::RawData(&data));
            }
            parser::ReplyEvent::RecvFooter(line) => {
                core.signal(EventKind::CallRecvFooter, Subject::Call(call), EventArg::Line(&line));
            }
            parser::ReplyEvent::RecvStop => {}
        }
    }
}

fn recv_done(core: &mut Core, conn: ConnKey, call: CallKey) {
    core.conns[conn].recvq.pop_front();
    core.conns[conn].num_calls_completed += 1;
    let sent_at = core.conns[conn].calls[call].request_sent_at;
    let elapsed = sent_at.map(|t| (core.clock.now() - t).max(0.0)).unwrap_or(0.0);
    core.signal(EventKind::CallRecvStop, Subject::Call(call), EventArg::Seconds(elapsed));
    core.signal(EventKind::CallDestroyed, Subject::Call(call), EventArg::None);
    core.call_ext.clear(call);
    core.conns[conn].calls.remove(call);
    core.continue_or_close(conn);
}

/// Ported from `conn_timeout`.
fn conn_timeout(core: &mut Core, conn: ConnKey) {
    core.conns[conn].watchdog = None;
    core.signal(EventKind::ConnTimeout, Subject::Conn(conn), EventArg::None);
    close(core, conn);
}

fn fail(core: &mut Core, conn: ConnKey, err: CoreError) -> Result<(), CoreError> {
    core.signal(EventKind::ConnFailed, Subject::Conn(conn), EventArg::Error(err));
    close(core, conn);
    Err(err)
}

fn io_error_kind(e: &std::io::Error) -> IoErrorKind {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => IoErrorKind::Reset,
        _ => IoErrorKind::ReadError,
    }
}

/// Close the socket, drop all queued calls, release the source port, and
/// signal `CONN_CLOSE`. Ported from `core_close`.
pub fn close(core: &mut Core, conn: ConnKey) {
    if core.conns[conn].state >= ConnState::Closing {
        return;
    }
    core.conns[conn].state = ConnState::Closing;

    if let Some(handle) = core.conns[conn].watchdog.take() {
        let _ = core.clock.cancel(handle);
    }

    // Every Call still queued on this connection is lost: signal its
    // destruction before the arena that owns it disappears (spec §8
    // invariant 1, `NEW` precedes `DESTROYED` for every Call).
    let orphaned: Vec<CallKey> = {
        let c = &mut core.conns[conn];
        c.sendq.drain(..).chain(c.recvq.drain(..)).collect()
    };
    for call in orphaned {
        core.signal(EventKind::CallDestroyed, Subject::Call(call), EventArg::None);
        core.call_ext.clear(call);
        core.conns[conn].calls.remove(call);
    }

    if let Some(stream) = core.conns[conn].socket.take() {
        let _ = core.reactor.deregister(&stream);
    }

    core.signal(EventKind::ConnClose, Subject::Conn(conn), EventArg::None);

    if let (Some(port), Some(entry)) = (core.conns[conn].source_port.take(), core.conns[conn].source_entry.take()) {
        core.addr_pool.release_port(entry, port);
    }

    core.signal(EventKind::ConnDestroyed, Subject::Conn(conn), EventArg::None);
    core.conn_ext.clear(conn);
    core.conns.remove(conn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;

    fn test_core() -> Core {
        let config = Config::parse_from(["httpburst", "--num-conns", "1", "--num-calls", "1"]);
        Core::new(config).unwrap()
    }

    /// A connect against a closed port should fail fast with a refused-style
    /// `CONN_FAILED`, not panic, and the connection arena slot must be gone
    /// afterwards (spec §8 invariant: every `CONN_NEW` is followed by either
    /// `CONN_CONNECTED` or `CONN_DESTROYED`, never left dangling).
    #[test]
    fn connect_to_closed_port_fails_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut core = test_core();
        let conn = new_connection(&mut core, "127.0.0.1".to_string(), port);
        let mut failed = false;
        for _ in 0..200 {
            if !core.conns.contains_key(conn) {
                failed = true;
                break;
            }
            core.tick().unwrap();
        }
        assert!(failed, "connection to a closed port should eventually fail");
    }

    /// A real loopback listener accepting one connection and replying with a
    /// fixed, content-length body should drive a call through to completion
    /// and report exactly one reply.
    #[test]
    fn full_roundtrip_against_loopback_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .unwrap();
        });

        let mut core = test_core();
        core.issue_connection().unwrap();
        for _ in 0..500 {
            if core.conns.is_empty() {
                break;
            }
            core.tick().unwrap();
        }
        server.join().unwrap();
        assert_eq!(core.stats.num_replies, 1);
        assert!(core.conns.is_empty());
    }
}
