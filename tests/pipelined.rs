//! Scenario S6 (spec §8): three requests pipelined onto one connection
//! complete in send order once the server replies with all three bodies
//! concatenated in a single packet.

mod util;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;

use httpburst::conn;
use httpburst::event_bus::{EventArg, EventKind};
use httpburst::Core;

#[test]
fn three_pipelined_calls_complete_in_send_order() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = stream.read(&mut buf[total..]).unwrap();
            total += n;
            let text = String::from_utf8_lossy(&buf[..total]);
            if text.matches("\r\n\r\n").count() >= 3 {
                break;
            }
        }
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nxHTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nyHTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nz",
            )
            .unwrap();
    });

    let mut core = util::build_core(&[
        "--server", "127.0.0.1", "--port", &port.to_string(), "--uri", "/a", "--num-conns", "1", "--num-calls", "3",
    ]);

    let order: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let order = order.clone();
        core.events
            .register(EventKind::CallRecvData, move |_: &mut Core, _, _, arg: &EventArg| {
                if let EventArg::RawData(data) = arg {
                    order.borrow_mut().push(data.to_vec());
                }
            })
            .unwrap();
    }

    let conn = conn::new_connection(&mut core, "127.0.0.1".to_string(), port);
    conn::connect(&mut core, conn).unwrap();
    core.issue_call(conn);
    core.issue_call(conn);
    core.issue_call(conn);

    for _ in 0..500 {
        if core.conns.is_empty() {
            break;
        }
        core.tick().unwrap();
    }
    server.join().unwrap();

    assert_eq!(*order.borrow(), vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
    assert_eq!(core.stats.num_replies, 3);
    assert!(core.conns.is_empty());
}
