//! Scenario S4 (spec §8): a `100 Continue` interim reply is parsed and
//! discarded before the real status line, so a caller only ever sees one
//! completed call but two status-line parses along the way.

mod util;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;

use httpburst::event_bus::{EventArg, EventKind};
use httpburst::Core;

#[test]
fn continue_status_is_parsed_and_discarded() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).unwrap();
        stream
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
    });

    let mut core = util::build_core(&[
        "--server", "127.0.0.1", "--port", &port.to_string(), "--uri", "/a", "--num-conns", "1", "--num-calls", "1",
    ]);

    let statuses: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
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

    core.issue_connection().unwrap();
    for _ in 0..500 {
        if core.conns.is_empty() {
            break;
        }
        core.tick().unwrap();
    }
    server.join().unwrap();

    assert_eq!(*statuses.borrow(), vec![100, 200]);
    assert_eq!(core.stats.num_replies, 1);
    assert_eq!(core.stats.total_errors(), 0);
    assert!(core.conns.is_empty());
}
