//! Scenario S5 (spec §8): a server that accepts the connection but never
//! replies trips the per-call watchdog; the call is torn down without a
//! `RECV_STOP` and the `client-timeout` stat increments.

mod util;

use std::cell::Cell;
use std::net::TcpListener;
use std::rc::Rc;

use httpburst::event_bus::{EventArg, EventKind};
use httpburst::Core;

#[test]
fn watchdog_fires_when_reply_never_arrives() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        // Hold the connection open without replying, long enough for the
        // client's watchdog to fire first.
        std::thread::sleep(std::time::Duration::from_millis(400));
        drop(stream);
    });

    let mut core = util::build_core(&[
        "--server", "127.0.0.1", "--port", &port.to_string(), "--timeout", "0.1", "--num-conns", "1", "--num-calls", "1",
    ]);

    let recv_stop_fired = Rc::new(Cell::new(false));
    {
        let recv_stop_fired = recv_stop_fired.clone();
        core.events
            .register(EventKind::CallRecvStop, move |_: &mut Core, _, _, _: &EventArg| {
                recv_stop_fired.set(true);
            })
            .unwrap();
    }

    core.issue_connection().unwrap();
    for _ in 0..50 {
        if core.conns.is_empty() {
            break;
        }
        core.tick().unwrap();
    }
    server.join().unwrap();

    assert!(core.conns.is_empty(), "connection should have been closed by the watchdog");
    assert_eq!(core.stats.num_client_timeouts, 1);
    assert!(!recv_stop_fired.get(), "RECV_STOP must not fire for a call killed by the watchdog");
}
