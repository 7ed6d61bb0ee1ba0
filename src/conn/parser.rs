//! HTTP Response Parser (spec §4.7), ported from `http.c`.
//!
//! `process` consumes as much of a byte slice as belongs to the reply
//! currently in flight and returns the unconsumed tail length. Line assembly
//! lives in [`crate::model::ParserScratch`]; this module holds only the
//! decoding logic, so it can be unit tested against raw byte slices without
//! a socket or reactor.

use crate::model::{Call, ConnState, ParserScratch, MAX_HDR_LINE_LEN};

/// Sub-phases of reply parsing. A strict subset of [`crate::model::ConnState`]
/// concerned only with the bytes, not the surrounding connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Status,
    Header,
    /// Awaiting the real status line after a `100 Continue` interim reply.
    Continue,
    Data,
    Chunked,
    Footer,
    Done,
}

impl ParserState {
    pub fn to_conn_state(self) -> ConnState {
        match self {
            ParserState::Status => ConnState::ReplyStatus,
            ParserState::Header => ConnState::ReplyHeader,
            ParserState::Continue => ConnState::ReplyContinue,
            ParserState::Data => ConnState::ReplyData,
            ParserState::Chunked => ConnState::ReplyChunked,
            ParserState::Footer => ConnState::ReplyFooter,
            ParserState::Done => ConnState::ReplyDone,
        }
    }
}

/// One `CALL_RECV_*` occurrence the parser made progress on, one variant per
/// event kind named in spec §4.2. `process` appends these to a caller-owned
/// log instead of signalling an event bus directly: the caller holds
/// sub-borrows of the owning `Connection` (`call`, `scratch`) for the
/// duration of the call, and those must end before a `Core`-backed bus can
/// be signalled with `&mut Core`. Draining the log after `process` returns
/// keeps the two borrows from ever overlapping.
#[derive(Debug, Clone)]
pub enum ReplyEvent {
    RecvStart(u32),
    RecvHdr(Vec<u8>),
    RecvRawData(Vec<u8>),
    RecvData(Vec<u8>),
    RecvFooter(Vec<u8>),
    RecvStop,
}

/// Accumulate `chunk` into the scratch line buffer, returning the completed
/// line (CRLF stripped) once one is available. Ported from `get_line`.
fn get_line<'a>(scratch: &mut ParserScratch, buf: &'a [u8]) -> (Option<Vec<u8>>, &'a [u8]) {
    if buf.is_empty() {
        return (None, buf);
    }

    let eol = buf.iter().position(|&b| b == b'\n').map(|i| i + 1).unwrap_or(buf.len());
    let (chunk, rest) = buf.split_at(eol);

    let mut to_copy = chunk.len();
    if scratch.line.len() + to_copy >= MAX_HDR_LINE_LEN {
        log::warn!(
            "truncating header line from {} to {} bytes",
            scratch.line.len() + to_copy,
            MAX_HDR_LINE_LEN
        );
        to_copy = MAX_HDR_LINE_LEN - 1 - scratch.line.len();
    }
    scratch.line.extend_from_slice(&chunk[..to_copy]);

    let has_lf = scratch.line.last() == Some(&b'\n');
    let line_full = scratch.line.len() == MAX_HDR_LINE_LEN - 1;

    if has_lf || line_full {
        if scratch.line.last() == Some(&b'\n') {
            scratch.line.pop();
            if scratch.line.last() == Some(&b'\r') {
                scratch.line.pop();
            }
        }
        let line = std::mem::replace(&mut scratch.line, Vec::with_capacity(128));
        (Some(line), rest)
    } else {
        (None, rest)
    }
}

fn parse_status_line<'a>(call: &mut Call, scratch: &mut ParserScratch, buf: &'a [u8], events: &mut Vec<ReplyEvent>) -> &'a [u8] {
    scratch.is_chunked = false;
    scratch.content_length = usize::MAX;

    let (line, rest) = get_line(scratch, buf);
    let Some(line) = line else { return rest };

    call.reply.header_bytes += buf.len() - rest.len();
    if let Some((version, status)) = parse_status_fields(&line) {
        call.reply.version = version;
        call.reply.status = status;
    } else {
        call.reply.version = 0x10000;
        call.reply.status = 599;
        log::warn!("invalid status line `{}'", String::from_utf8_lossy(&line));
    }

    let status = call.reply.status;
    let is_head = call.request.method.eq_ignore_ascii_case(b"HEAD");

    if is_head {
        scratch.has_body = false;
    } else {
        scratch.has_body = true;
        match status / 100 {
            1 => {
                scratch.has_body = false;
                if status == 100 {
                    events.push(ReplyEvent::RecvStart(status));
                    scratch.state = ParserState::Continue;
                    return rest;
                }
            }
            2 | 3 => {
                if matches!(status, 204 | 205 | 304) {
                    scratch.has_body = false;
                }
            }
            4 | 5 => {}
            _ => log::warn!("bad status {status}"),
        }
    }
    events.push(ReplyEvent::RecvStart(status));
    scratch.state = ParserState::Header;
    rest
}

fn parse_status_fields(line: &[u8]) -> Option<(u32, u32)> {
    let s = std::str::from_utf8(line).ok()?;
    let rest = s.strip_prefix("HTTP/")?;
    let (ver, rest) = rest.split_once(' ')?;
    let (major, minor) = ver.split_once('.')?;
    let major: u32 = major.parse().ok()?;
    let minor: u32 = minor.parse().ok()?;
    let status_str = rest.trim_start();
    let status_digits: String = status_str.chars().take_while(|c| c.is_ascii_digit()).collect();
    let status: u32 = status_digits.parse().ok()?;
    Some((0x10000 * major + minor, status))
}

fn parse_headers<'a>(call: &mut Call, scratch: &mut ParserScratch, mut buf: &'a [u8], events: &mut Vec<ReplyEvent>) -> &'a [u8] {
    let buf_start = buf;
    loop {
        let (line, rest) = get_line(scratch, buf);
        buf = rest;
        let Some(line) = line else { break };

        if line.is_empty() {
            if scratch.has_body {
                if scratch.is_chunked {
                    scratch.content_length = 0;
                    scratch.state = ParserState::Chunked;
                } else {
                    scratch.state = ParserState::Data;
                }
            } else if scratch.state == ParserState::Continue {
                // The blank line ending a 100-Continue's (empty) header block
                // hands control back to the real status line that follows.
                scratch.state = ParserState::Status;
            } else {
                scratch.state = ParserState::Done;
            }
            break;
        }

        if let Some(rest_hdr) = strip_prefix_ci(&line, b"content-length:") {
            let digits: String = std::str::from_utf8(rest_hdr)
                .unwrap_or("")
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            scratch.content_length = digits.parse().unwrap_or(0);
            if scratch.content_length == 0 {
                scratch.has_body = false;
            }
        } else if let Some(rest_hdr) = strip_prefix_ci(&line, b"transfer-encoding:") {
            let value = std::str::from_utf8(rest_hdr).unwrap_or("").trim();
            if value.eq_ignore_ascii_case("chunked") {
                scratch.is_chunked = true;
            } else {
                log::warn!("unknown transfer encoding `{value}'");
            }
        }

        events.push(ReplyEvent::RecvHdr(line));
        if scratch.state.to_conn_state() >= ConnState::Closing {
            return buf;
        }
    }
    call.reply.header_bytes += buf_start.len() - buf.len();
    buf
}

fn strip_prefix_ci<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

fn parse_footers<'a>(call: &mut Call, scratch: &mut ParserScratch, mut buf: &'a [u8], events: &mut Vec<ReplyEvent>) -> &'a [u8] {
    let buf_start = buf;
    loop {
        let (line, rest) = get_line(scratch, buf);
        buf = rest;
        let Some(line) = line else { break };
        if line.is_empty() {
            scratch.state = ParserState::Done;
            break;
        }
        events.push(ReplyEvent::RecvFooter(line));
        if scratch.state.to_conn_state() >= ConnState::Closing {
            return buf;
        }
    }
    call.reply.footer_bytes += buf_start.len() - buf.len();
    buf
}

/// Consume as much body data as is available, bounded by the remaining
/// content length. Returns true once the body is fully consumed.
fn parse_data<'a>(call: &mut Call, scratch: &mut ParserScratch, buf: &'a [u8], events: &mut Vec<ReplyEvent>) -> (bool, &'a [u8]) {
    let bytes_needed = scratch.content_length - call.reply.content_bytes;
    let take = buf.len().min(bytes_needed);
    let (chunk, rest) = buf.split_at(take);
    events.push(ReplyEvent::RecvData(chunk.to_vec()));
    call.reply.content_bytes += take;
    (take == bytes_needed, rest)
}

fn xfer_chunked<'a>(call: &mut Call, scratch: &mut ParserScratch, mut buf: &'a [u8], events: &mut Vec<ReplyEvent>) -> &'a [u8] {
    while !buf.is_empty() && scratch.state.to_conn_state() < ConnState::Closing {
        if call.reply.content_bytes >= scratch.content_length {
            let (line, rest) = get_line(scratch, buf);
            buf = rest;
            let Some(line) = line else { return buf };
            if line.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(&line);
            let hex: String = text.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
            match usize::from_str_radix(&hex, 16) {
                Ok(0) => {
                    scratch.state = ParserState::Footer;
                    return buf;
                }
                Ok(len) => scratch.content_length += len,
                Err(_) => {
                    log::warn!("bad chunk line `{text}'");
                    continue;
                }
            }
        }
        let (_done, rest) = parse_data(call, scratch, buf, events);
        buf = rest;
    }
    buf
}

/// Drive the parser state machine over `buf`, processing as many reply
/// phases as the available bytes allow. Returns the unconsumed tail.
/// Appends every `CALL_RECV_*` occurrence to `events` in order; the caller
/// signals them once this call returns and its `call`/`scratch` borrows end.
pub fn process<'a>(call: &mut Call, scratch: &mut ParserScratch, buf: &'a [u8], events: &mut Vec<ReplyEvent>) -> &'a [u8] {
    events.push(ReplyEvent::RecvRawData(buf.to_vec()));

    let mut rest = buf;
    loop {
        rest = match scratch.state {
            ParserState::Status => parse_status_line(call, scratch, rest, events),
            ParserState::Header | ParserState::Continue => parse_headers(call, scratch, rest, events),
            ParserState::Footer => parse_footers(call, scratch, rest, events),
            ParserState::Data => {
                let (done, next) = parse_data(call, scratch, rest, events);
                if done && scratch.state.to_conn_state() < ConnState::Closing {
                    scratch.state = ParserState::Done;
                }
                next
            }
            ParserState::Chunked => xfer_chunked(call, scratch, rest, events),
            ParserState::Done => {
                events.push(ReplyEvent::RecvStop);
                return rest;
            }
        };
        if rest.is_empty() || scratch.state.to_conn_state() >= ConnState::Closing {
            break;
        }
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnKey, ProtocolVersion, Request};
    use slotmap::SlotMap;

    fn make_call(method: &str) -> Call {
        let mut keys: SlotMap<ConnKey, ()> = SlotMap::with_key();
        let conn = keys.insert(());
        Call::new(1, conn, Request::new(method, "/", ProtocolVersion::Http11))
    }

    #[test]
    fn content_length_reply() {
        let mut call = make_call("GET");
        let mut scratch = ParserScratch::default();
        let mut events = Vec::new();
        let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc";
        let rest = process(&mut call, &mut scratch, reply, &mut events);
        assert!(rest.is_empty());
        assert_eq!(call.reply.status, 200);
        assert_eq!(call.reply.content_bytes, 3);
        assert_eq!(scratch.state, ParserState::Done);
    }

    #[test]
    fn chunked_reply_with_one_chunk() {
        let mut call = make_call("GET");
        let mut scratch = ParserScratch::default();
        let mut events = Vec::new();
        let reply = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let rest = process(&mut call, &mut scratch, reply, &mut events);
        assert!(rest.is_empty());
        assert_eq!(call.reply.content_bytes, 3);
        assert_eq!(scratch.state, ParserState::Done);
    }

    #[test]
    fn chunked_reply_missing_trailing_crlf_still_completes() {
        let mut call = make_call("GET");
        let mut scratch = ParserScratch::default();
        let mut events = Vec::new();
        let reply = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0";
        let rest = process(&mut call, &mut scratch, reply, &mut events);
        assert!(rest.is_empty());
        assert_eq!(call.reply.content_bytes, 3);
        assert_eq!(scratch.state, ParserState::Footer);
    }

    #[test]
    fn head_request_has_no_body_even_with_content_length() {
        let mut call = make_call("HEAD");
        let mut scratch = ParserScratch::default();
        let mut events = Vec::new();
        let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let rest = process(&mut call, &mut scratch, reply, &mut events);
        assert!(rest.is_empty());
        assert_eq!(scratch.state, ParserState::Done);
        assert_eq!(call.reply.content_bytes, 0);
    }

    #[test]
    fn status_304_has_no_body() {
        let mut call = make_call("GET");
        let mut scratch = ParserScratch::default();
        let mut events = Vec::new();
        let reply = b"HTTP/1.1 304 Not Modified\r\n\r\n";
        let rest = process(&mut call, &mut scratch, reply, &mut events);
        assert!(rest.is_empty());
        assert_eq!(scratch.state, ParserState::Done);
    }

    #[test]
    fn continue_then_real_status() {
        let mut call = make_call("GET");
        let mut scratch = ParserScratch::default();
        let mut events = Vec::new();
        let reply = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let rest = process(&mut call, &mut scratch, reply, &mut events);
        assert!(rest.is_empty());
        assert_eq!(call.reply.status, 200);
        assert_eq!(call.reply.content_bytes, 2);
        assert_eq!(scratch.state, ParserState::Done);
    }

    #[test]
    fn malformed_status_line_defaults_to_599() {
        let mut call = make_call("GET");
        let mut scratch = ParserScratch::default();
        let mut events = Vec::new();
        let reply = b"not a status line\r\n\r\n";
        let rest = process(&mut call, &mut scratch, reply, &mut events);
        assert!(rest.is_empty());
        assert_eq!(call.reply.status, 599);
    }

    #[test]
    fn incremental_feed_across_read_boundaries() {
        let mut call = make_call("GET");
        let mut scratch = ParserScratch::default();
        let mut events = Vec::new();
        let first = b"HTTP/1.1 200 OK\r\nConte";
        let rest1 = process(&mut call, &mut scratch, first, &mut events);
        assert!(rest1.is_empty());
        assert_eq!(scratch.state, ParserState::Header);

        let second = b"nt-Length: 4\r\n\r\nwxyz";
        let rest2 = process(&mut call, &mut scratch, second, &mut events);
        assert!(rest2.is_empty());
        assert_eq!(call.reply.content_bytes, 4);
        assert_eq!(scratch.state, ParserState::Done);
    }
}
