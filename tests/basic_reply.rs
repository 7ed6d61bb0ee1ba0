//! Scenario S1 (spec §8): a single request against a server replying with a
//! fixed `Content-Length` body completes with no errors, the expected
//! status code, and the expected body bytes.

mod util;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;

use httpburst::event_bus::{EventArg, EventKind};
use httpburst::Core;

#[test]
fn single_call_against_content_length_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET /a HTTP/1.1\r\n"));
        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc").unwrap();
    });

    let mut core = util::build_core(&[
        "--server", "127.0.0.1", "--port", &port.to_string(), "--uri", "/a", "--num-conns", "1", "--num-calls", "1",
    ]);

    let statuses: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let body: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let statuses = statuses.clone();
        core.events
            .register(EventKind::CallRecvStart, move |_: &mut Core, _, _, arg: &EventArg| {
                if let EventArg::StatusCode(s) = arg {
                    statuses.borrow_mut().push(*s);
                }
            })
            .unwrap();
    }
    {
        let body = body.clone();
        core.events
            .register(EventKind::CallRecvData, move |_: &mut Core, _, _, arg: &EventArg| {
                if let EventArg::RawData(data) = arg {
                    body.borrow_mut().extend_from_slice(data);
                }
            })
            .unwrap();
    }

    core.issue_connection().unwrap();
    for _ in 0..500 {
        if core.conns.is_empty() {
            break;
        }
        core.tick().unwrap();
    }
    server.join().unwrap();

    assert_eq!(*statuses.borrow(), vec![200]);
    assert_eq!(*body.borrow(), b"abc");
    assert_eq!(core.stats.num_replies, 1);
    assert_eq!(core.stats.total_errors(), 0);
    assert!(core.conns.is_empty());
}
