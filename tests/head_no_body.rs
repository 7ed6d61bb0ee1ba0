//! Scenario S3 (spec §8): a HEAD reply carrying a non-zero Content-Length
//! but no body bytes completes as soon as the headers are parsed, and the
//! connection is left open rather than torn down.

mod util;

use std::cell::Cell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;

use httpburst::event_bus::{EventArg, EventKind};
use httpburst::Core;

#[test]
fn head_reply_completes_without_body_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HEAD /a HTTP/1.1\r\n"));
        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n").unwrap();
        // Keep the connection open a little longer than the client needs
        // to finish the call, so a premature close can't masquerade as
        // "the reply completed".
        std::thread::sleep(std::time::Duration::from_millis(50));
    });

    let mut core = util::build_core(&[
        "--server", "127.0.0.1", "--port", &port.to_string(), "--uri", "/a", "--method", "HEAD",
        "--num-conns", "1", "--num-calls", "1",
    ]);

    let data_bytes_seen = Rc::new(Cell::new(0usize));
    let recv_stop_fired = Rc::new(Cell::new(false));
    // The workload's `--num-calls 1` quota is satisfied the instant this
    // reply completes, so `Core::continue_or_close` closes the connection
    // later in that same `recv_done` call (spec §8 separately covers that
    // quota-driven teardown). What S3 actually asserts is narrower: at the
    // moment the reply itself finishes — the `CALL_RECV_STOP` signal, fired
    // before `continue_or_close` runs — the connection must still be open,
    // i.e. the HEAD response's lack of a body did not itself trigger a
    // close. Capture that snapshot from inside the handler rather than
    // after the loop, where the subsequent quota-driven close would already
    // have happened.
    let conn_open_at_recv_stop = Rc::new(Cell::new(false));
    {
        let data_bytes_seen = data_bytes_seen.clone();
        core.events
            .register(EventKind::CallRecvData, move |_: &mut Core, _, _, arg: &EventArg| {
                if let EventArg::RawData(data) = arg {
                    data_bytes_seen.set(data_bytes_seen.get() + data.len());
                }
            })
            .unwrap();
    }
    {
        let recv_stop_fired = recv_stop_fired.clone();
        let conn_open_at_recv_stop = conn_open_at_recv_stop.clone();
        core.events
            .register(EventKind::CallRecvStop, move |core: &mut Core, _, _, _: &EventArg| {
                recv_stop_fired.set(true);
                conn_open_at_recv_stop.set(!core.conns.is_empty());
            })
            .unwrap();
    }

    let conn = httpburst::conn::new_connection(&mut core, "127.0.0.1".to_string(), port);
    httpburst::conn::connect(&mut core, conn).unwrap();
    core.issue_call(conn);

    for _ in 0..500 {
        if recv_stop_fired.get() {
            break;
        }
        core.tick().unwrap();
    }
    server.join().unwrap();

    assert!(recv_stop_fired.get(), "HEAD reply should complete once headers are parsed");
    assert_eq!(data_bytes_seen.get(), 0, "a HEAD reply must not deliver body bytes");
    assert_eq!(core.stats.num_replies, 1);
    assert_eq!(core.stats.total_errors(), 0);
    assert!(
        conn_open_at_recv_stop.get(),
        "connection must still be open at the moment the HEAD reply completes"
    );
}
