//! Core (spec §2, §5), the process-wide context every collaborator borrows,
//! ported from the global statics in `httperf.c`/`core.c` (`param`, the fd
//! set, the connection hash table) collapsed into one owned struct instead
//! of file-scope mutable state.
//!
//! Per Design Note "Global mutable state", every engine function in
//! [`crate::conn`] takes `&mut Core` rather than threading each collaborator
//! through individually. `Core` also owns the event bus that those functions
//! signal into, which creates the self-referential borrow this module's
//! [`Core::signal`] exists to resolve (see [`crate::event_bus::EventBus::take_handlers`]).

use std::time::Duration;

use slotmap::SlotMap;

use crate::addr_pool::AddrPool;
use crate::clock::TimerWheel;
use crate::config::Config;
use crate::conn;
use crate::error::CoreError;
use crate::event_bus::{EventArg, EventBus, EventKind, Subject};
use crate::model::{Call, CallKey, Connection, ConnKey, Request, Session, SessionKey};
use crate::rate::RateGenerator;
use crate::reactor::Reactor;
use crate::registry::ExtensionSlots;
use crate::stats::BasicStatsCollector;
use crate::workload::WorkloadGenerator;

/// Hard ceiling on one `epoll_wait` call's timeout when nothing is armed on
/// the wheel, ported from `core_loop`'s hog-mode `select_timeout` duality
/// (spec §4.5): in the steady state the next timer deadline already bounds
/// the wait far tighter than this.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Core {
    pub config: Config,
    pub conns: SlotMap<ConnKey, Connection>,
    pub sessions: SlotMap<SessionKey, Session>,
    pub events: EventBus<Core>,
    pub clock: TimerWheel<Core>,
    pub addr_pool: AddrPool,
    pub reactor: Reactor,
    pub stats: BasicStatsCollector,
    pub rate_gen: Option<RateGenerator>,
    pub workload: Option<Box<dyn WorkloadGenerator>>,
    /// Collaborator-private per-entity state (spec §4.3's typed extension
    /// slots), e.g. `main.rs`'s `--print-request`/`--print-reply` byte
    /// buffers. Cleared whenever the owning entity is removed.
    pub call_ext: ExtensionSlots<CallKey>,
    pub conn_ext: ExtensionSlots<ConnKey>,
    next_call_id: u64,
    /// Total calls issued so far, compared against `config.workload.num_conns
    /// * config.workload.num_calls` to know when to stop creating new work.
    calls_issued: u64,
    stop_requested: bool,
}

impl Core {
    pub fn new(config: Config) -> Result<Self, crate::error::ConfigError> {
        let reactor = Reactor::new().map_err(|e| crate::error::ConfigError(e.to_string()))?;
        let mut core = Core {
            config,
            conns: SlotMap::with_key(),
            sessions: SlotMap::with_key(),
            events: EventBus::new(),
            clock: TimerWheel::new(),
            addr_pool: AddrPool::new(),
            reactor,
            stats: BasicStatsCollector::new(),
            rate_gen: None,
            workload: None,
            call_ext: ExtensionSlots::new(),
            conn_ext: ExtensionSlots::new(),
            next_call_id: 0,
            calls_issued: 0,
            stop_requested: false,
        };

        crate::stats::register(&mut core.events, |core: &mut Core| &mut core.stats)
            .map_err(|e| crate::error::ConfigError(e.to_string()))?;

        Ok(core)
    }

    /// Signal `kind` to every handler registered for it. Takes the handler
    /// list out of the bus first so the dispatch loop can pass `self` to
    /// each handler without a double borrow (see module docs and
    /// [`crate::event_bus::EventBus::take_handlers`]); a handler that
    /// signals a *different* kind mid-dispatch still reaches its listeners,
    /// which the lifecycle chaining in [`crate::conn`] (e.g. `CONN_FAILED`
    /// triggering `close`, which signals `CONN_CLOSE`/`CONN_DESTROYED`)
    /// depends on.
    pub fn signal(&mut self, kind: EventKind, subject: Subject, arg: EventArg) {
        let handlers = self.events.take_handlers(kind);
        for handler in &handlers {
            handler.handle(self, kind, subject, &arg);
        }
        self.events.restore_handlers(kind, handlers);
    }

    pub fn next_call_id(&mut self) -> u64 {
        self.next_call_id += 1;
        self.next_call_id
    }

    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    fn total_work(&self) -> u64 {
        self.config.workload.num_conns as u64 * self.config.workload.num_calls as u64
    }

    /// Build one request, asking the configured workload generator to fill
    /// in the URI/method/body, ported from `EV_CALL_NEW` dispatch to a
    /// `Load_Generator`'s handler.
    fn build_request(&mut self) -> Request {
        let version = self.config.http_version().unwrap_or(crate::model::ProtocolVersion::Http11);
        let want_host = !self.config.protocol.no_host_hdr;
        let mut request = Request::new(self.config.protocol.method.clone(), self.config.target.uri.clone(), version);
        request.protocol_line = crate::model::ProtocolLine::select(version, want_host);
        for header in &self.config.protocol.add_header {
            request.extra_headers.push(format!("{header}\r\n").into_bytes());
        }
        if let Some(gen) = self.workload.as_mut() {
            if !gen.populate(&mut request) {
                self.stop_requested = true;
            }
        }
        request
    }

    /// Open one new connection and issue its first call, ported from
    /// `core_connect` immediately followed by `call_new`/`core_send` in
    /// `httperf.c`'s main issuing loop.
    pub fn issue_connection(&mut self) -> Result<ConnKey, CoreError> {
        let host = self.config.target.server.clone();
        let port = self.config.target.port;
        let conn = conn::new_connection(self, host, port);
        if let Some(name) = self.config.target.server_name.clone() {
            self.conns[conn].host_header_override = Some(name);
        }
        conn::connect(self, conn)?;
        self.issue_call(conn);
        Ok(conn)
    }

    /// Create one call on `conn` and hand it to [`conn::core_send`], ported
    /// from `call_new`.
    pub fn issue_call(&mut self, conn: ConnKey) -> CallKey {
        let id = self.next_call_id();
        let request = self.build_request();
        self.signal(EventKind::CallNew, Subject::Conn(conn), EventArg::None);
        let call = self.conns[conn].calls.insert(Call::new(id, conn, request));
        self.calls_issued += 1;
        conn::core_send(self, conn, call);
        call
    }

    /// Called once a reply finishes on `conn`: pipeline another call on the
    /// same connection if it has not yet made its share of `--num-calls`,
    /// otherwise close it. In sequential (non-rate-driven) mode, a closed
    /// connection's slot is refilled with a fresh one if work remains,
    /// ported from the completion-driven half of `rate_generator_start`'s
    /// `rate_param <= 0.0` branch.
    ///
    /// A workload that pipelines several calls onto one connection up front
    /// (spec §8 scenario S6) can still have calls sitting in `sendq`/`recvq`
    /// when the global call quota is already exhausted by the time the
    /// first of them completes; closing here would destroy those in-flight
    /// calls out from under the parser, so this only closes once the
    /// connection itself has gone idle.
    pub(crate) fn continue_or_close(&mut self, conn: ConnKey) {
        if self.conns[conn].state >= crate::model::ConnState::Closing {
            return;
        }
        let conn_quota_met = self.conns[conn].num_calls_completed >= self.config.workload.num_calls;
        let global_quota_met = self.calls_issued >= self.total_work() || self.stop_requested;
        let conn_idle = self.conns[conn].sendq.is_empty() && self.conns[conn].recvq.is_empty();

        if !conn_quota_met && !global_quota_met {
            self.issue_call(conn);
            return;
        }
        if !conn_idle {
            return;
        }
        conn::close(self, conn);
        if self.rate_gen.is_none() && !self.stop_requested && self.calls_issued < self.total_work() {
            let _ = self.issue_connection();
        }
    }

    /// Drive the rate generator's self-rescheduling timer, ported from
    /// `rate_generator_start`/`tick`'s `while (now > rg->next_time)` loop
    /// (spec §4.8): each due tick creates `--burst-length` connections.
    pub fn drive_rate_generator(&mut self) {
        let Some(mut rg) = self.rate_gen.take() else { return };
        let now = self.clock.now();
        let mut delay = None;
        while let Some(d) = rg.advance(now) {
            delay = Some(d);
            if self.calls_issued >= self.total_work() || self.stop_requested {
                break;
            }
            for _ in 0..self.config.workload.burst_length {
                if self.calls_issued >= self.total_work() {
                    break;
                }
                let _ = self.issue_connection();
            }
        }
        if let Some(delay) = delay {
            if self.calls_issued < self.total_work() && !self.stop_requested {
                self.clock.schedule(delay, move |core: &mut Core| core.drive_rate_generator());
            }
        }
        self.rate_gen = Some(rg);
    }

    /// Issue the initial burst of sequential (non-timer-driven) connections,
    /// ported from `rate_generator_start`'s `else` branch for
    /// `rate_param <= 0`: all connections are created up front and new ones
    /// are only created as earlier ones finish (driven by `CallRecvStop`).
    pub fn drive_sequential(&mut self) {
        let max_parallel = self.config.workload.num_conns.min(self.config.workload.burst_length.max(1));
        for _ in 0..max_parallel {
            if self.calls_issued >= self.total_work() {
                break;
            }
            let _ = self.issue_connection();
        }
    }

    pub fn is_done(&self) -> bool {
        self.conns.is_empty() && (self.stop_requested || self.calls_issued >= self.total_work())
    }

    /// One iteration of the reactor loop, ported from `core_loop`'s body:
    /// refresh the clock, fire due timers, block on the multiplexer bounded
    /// by the next deadline, then dispatch every ready socket once per
    /// direction.
    pub fn tick(&mut self) -> Result<(), crate::reactor::ReactorError> {
        self.clock.refresh_clock();
        for slot in self.clock.take_due() {
            self.clock.set_firing(slot.handle);
            (slot.callback)(self);
            self.clock.clear_firing();
        }

        let timeout = self
            .clock
            .next_deadline()
            .map(|d| Duration::from_secs_f64(d.max(0.0)))
            .unwrap_or(MAX_POLL_INTERVAL)
            .min(MAX_POLL_INTERVAL);

        let ready = self.reactor.poll(Some(timeout))?;
        for readiness in ready {
            let conn = readiness.conn;
            if !self.conns.contains_key(conn) {
                continue;
            }
            if self.conns[conn].state == crate::model::ConnState::Connecting {
                if readiness.writable {
                    conn::on_connect_writable(self, conn);
                }
                continue;
            }
            if readiness.writable {
                conn::do_send(self, conn);
            }
            if self.conns.contains_key(conn) && readiness.readable {
                conn::do_recv(self, conn);
            }
        }
        Ok(())
    }

    /// Run until every connection has drained and no further work remains,
    /// ported from `core_loop`'s top-level `while (!...exiting)` loop.
    pub fn run(&mut self) -> Result<(), crate::reactor::ReactorError> {
        if let Some(rg) = self.rate_gen.as_mut() {
            let delay = rg.start(self.clock.now_forced());
            self.clock.schedule(delay, move |core: &mut Core| core.drive_rate_generator());
        } else {
            self.drive_sequential();
        }

        while !self.is_done() {
            self.tick()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;

    fn test_core() -> Core {
        let config = Config::parse_from(["httpburst", "--num-conns", "1", "--num-calls", "1"]);
        Core::new(config).unwrap()
    }

    #[test]
    fn signal_reaches_registered_handler() {
        let mut core = test_core();
        core.events
            .register(EventKind::ConnNew, |core: &mut Core, _, _, _: &EventArg| {
                core.stats.record_conn_issued();
            })
            .unwrap();
        core.signal(EventKind::ConnNew, Subject::None, EventArg::None);
        assert_eq!(core.stats.num_conns_issued, 1);
    }

    #[test]
    fn next_call_id_is_monotonic() {
        let mut core = test_core();
        let a = core.next_call_id();
        let b = core.next_call_id();
        assert!(b > a);
    }
}
