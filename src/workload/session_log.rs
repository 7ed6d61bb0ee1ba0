//! Session-log generator for `--wsesslog`, ported from `wsesslog.c`'s
//! line-oriented parser (spec §6's session-log file format).
//!
//! The original drives whole sessions (bursts of concurrent calls with
//! think-time gaps between bursts) through the Session Controller. This
//! generator keeps the parsing faithful to the file format but flattens
//! the parsed bursts into one ordered stream of per-call URI/method/body,
//! since the surrounding session/burst concurrency machinery is out of
//! scope for this expansion's "concrete, if minimal" implementation.

use std::fs;
use std::io;
use std::path::Path;

use crate::model::Request;
use crate::workload::WorkloadGenerator;

/// One `URI [key=value ...]` entry parsed from the log.
#[derive(Debug, Clone, Default)]
pub struct LoggedCall {
    pub uri: Vec<u8>,
    pub method: Option<Vec<u8>>,
    pub think: Option<f64>,
    pub contents: Option<Vec<u8>>,
}

/// A non-indented line followed by zero or more indented continuation
/// lines, ported from the original's `BURST` linked list.
#[derive(Debug, Clone, Default)]
pub struct Burst {
    pub calls: Vec<LoggedCall>,
}

/// One blank-line-delimited session: an ordered list of bursts.
#[derive(Debug, Clone, Default)]
pub struct SessionTemplate {
    pub bursts: Vec<Burst>,
}

pub fn parse(text: &str) -> Result<Vec<SessionTemplate>, io::Error> {
    let mut sessions = Vec::new();
    let mut current = SessionTemplate::default();

    for raw_line in text.lines() {
        if raw_line.starts_with('#') {
            continue;
        }
        if raw_line.trim().is_empty() {
            if !current.bursts.is_empty() {
                sessions.push(std::mem::take(&mut current));
            }
            continue;
        }

        let indented = raw_line.starts_with(' ') || raw_line.starts_with('\t');
        let call = parse_call_line(raw_line.trim())?;

        if indented {
            let burst = current
                .bursts
                .last_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "continuation line before any burst"))?;
            burst.calls.push(call);
        } else {
            current.bursts.push(Burst { calls: vec![call] });
        }
    }
    if !current.bursts.is_empty() {
        sessions.push(current);
    }
    if sessions.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "session log has no sessions"));
    }
    Ok(sessions)
}

fn parse_call_line(line: &str) -> Result<LoggedCall, io::Error> {
    let mut tokens = line.split_whitespace();
    let uri = tokens
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty session-log line"))?
        .as_bytes()
        .to_vec();

    let mut call = LoggedCall { uri, ..Default::default() };
    let rest: Vec<&str> = tokens.collect();
    let rest = rest.join(" ");
    for (key, value) in split_key_value_pairs(&rest) {
        match key {
            "method" => call.method = Some(value.as_bytes().to_vec()),
            "think" => call.think = value.parse().ok(),
            "contents" => call.contents = Some(unescape(&value)),
            _ => {}
        }
    }
    Ok(call)
}

/// Split `key=value key2="quoted value" key3='also quoted'` honoring quotes
/// so spaces inside `contents=` don't split the token early.
fn split_key_value_pairs(rest: &str) -> Vec<(&str, String)> {
    let mut out = Vec::new();
    let bytes = rest.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b' ' {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            break;
        }
        let key = &rest[key_start..i];
        i += 1;
        let value_start = i;
        if i < bytes.len() && (bytes[i] == b'"' || bytes[i] == b'\'') {
            let quote = bytes[i];
            i += 1;
            let inner_start = i;
            while i < bytes.len() && bytes[i] != quote {
                i += 1;
            }
            out.push((key, rest[inner_start..i].to_string()));
            i = (i + 1).min(bytes.len());
        } else {
            while i < bytes.len() && bytes[i] != b' ' {
                i += 1;
            }
            out.push((key, rest[value_start..i].to_string()));
        }
    }
    out
}

/// Decode `\\`, `\n`, `\r`, `\t` escapes inside `contents=`, ported from
/// `wsesslog.c`'s character-at-a-time string scanner.
fn unescape(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('r') => out.push(b'\r'),
                Some('t') => out.push(b'\t'),
                Some('\\') => out.push(b'\\'),
                Some('\n') => {}
                Some(other) => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
                None => {}
            }
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    out
}

pub struct SessionLogGenerator {
    calls: Vec<LoggedCall>,
    next: usize,
}

impl SessionLogGenerator {
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_text(&text)
    }

    pub fn from_text(text: &str) -> io::Result<Self> {
        let sessions = parse(text)?;
        let calls: Vec<LoggedCall> = sessions.into_iter().flat_map(|s| s.bursts.into_iter().flat_map(|b| b.calls)).collect();
        Ok(SessionLogGenerator { calls, next: 0 })
    }
}

impl WorkloadGenerator for SessionLogGenerator {
    fn populate(&mut self, request: &mut Request) -> bool {
        let Some(call) = self.calls.get(self.next) else { return false };
        request.uri = call.uri.clone();
        if let Some(method) = &call.method {
            request.method = method.clone();
        }
        if let Some(contents) = &call.contents {
            request.body = contents.clone();
            request.extra_headers.push(format!("Content-Length: {}\r\n", request.body.len()).into_bytes());
        }
        self.next += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolVersion;

    #[test]
    fn parses_bursts_and_continuation_lines() {
        let text = "# comment\n/a.html\n  /b.gif\n  /c.gif\n\n/d.html\n";
        let sessions = parse(text).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].bursts.len(), 1);
        assert_eq!(sessions[0].bursts[0].calls.len(), 3);
        assert_eq!(sessions[1].bursts[0].calls.len(), 1);
    }

    #[test]
    fn parses_key_value_options() {
        let sessions = parse("/post.cgi method=POST think=1.5 contents=\"a=b\"\n").unwrap();
        let call = &sessions[0].bursts[0].calls[0];
        assert_eq!(call.method.as_deref(), Some(&b"POST"[..]));
        assert_eq!(call.think, Some(1.5));
        assert_eq!(call.contents.as_deref(), Some(&b"a=b"[..]));
    }

    #[test]
    fn contents_escapes_are_decoded() {
        let sessions = parse("/post.cgi contents=\"line1\\nline2\"\n").unwrap();
        assert_eq!(sessions[0].bursts[0].calls[0].contents.as_deref(), Some(&b"line1\nline2"[..]));
    }

    #[test]
    fn generator_sets_method_and_content_length() {
        let mut gen = SessionLogGenerator::from_text("/post.cgi method=POST contents=\"hi\"\n").unwrap();
        let mut req = Request::new("GET", "/", ProtocolVersion::Http11);
        assert!(gen.populate(&mut req));
        assert_eq!(req.method, b"POST");
        assert_eq!(req.body, b"hi");
        assert!(req.extra_headers.iter().any(|h| h.starts_with(b"Content-Length: 2")));
        assert!(!gen.populate(&mut req));
    }
}
