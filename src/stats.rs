//! Basic Stats Collector (spec §4.9), ported from `stat/basic.c`, minus its
//! histogram and printf-formatted report: percentile tables are explicitly
//! out of scope, so this keeps only counts plus sum/sum-of-squares, which is
//! enough for a caller to derive mean and variance.

use crate::error::CoreError;
use crate::event_bus::{EventArg, EventKind};

/// Running count, sum and sum-of-squares of a sampled quantity, the shape
/// every `_sum`/`_sum2` pair in `basic.c`'s static struct shares.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accumulator {
    pub count: u64,
    pub sum: f64,
    pub sum2: f64,
}

impl Accumulator {
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum2 += value * value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population variance, ported from `basic.c`'s `SQUARE(sum)/n` reports.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum2 / self.count as f64) - self.mean() * self.mean()
        }
    }
}

/// Per-`CoreError::bucket()` failure tally plus the connect/reply/transfer
/// accumulators, ported from `Stat_Basic`'s field list.
#[derive(Debug, Default)]
pub struct BasicStatsCollector {
    pub num_conns_issued: u64,
    pub num_connects: u64,
    pub num_replies: u64,
    pub num_calls_sent: u64,
    pub num_client_timeouts: u64,
    pub errors_by_bucket: std::collections::HashMap<&'static str, u64>,
    pub max_concurrent_conns: u32,
    active_conns: u32,

    pub conn_connect_time: Accumulator,
    pub call_response_time: Accumulator,
    pub req_bytes_sent: u64,
    pub hdr_bytes_received: u64,
    pub reply_bytes_received: u64,
    pub footer_bytes_received: u64,
}

impl BasicStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&mut self, err: &CoreError) {
        *self.errors_by_bucket.entry(err.bucket()).or_insert(0) += 1;
    }

    pub fn record_timeout(&mut self) {
        self.num_client_timeouts += 1;
    }

    pub fn record_conn_issued(&mut self) {
        self.num_conns_issued += 1;
        self.active_conns += 1;
        self.max_concurrent_conns = self.max_concurrent_conns.max(self.active_conns);
    }

    pub fn record_conn_closed(&mut self) {
        self.active_conns = self.active_conns.saturating_sub(1);
    }

    pub fn record_connect(&mut self, elapsed: f64) {
        self.num_connects += 1;
        self.conn_connect_time.observe(elapsed);
    }

    pub fn record_reply(&mut self, response_time: f64) {
        self.num_replies += 1;
        self.call_response_time.observe(response_time);
    }

    pub fn record_call_sent(&mut self, bytes: usize) {
        self.num_calls_sent += 1;
        self.req_bytes_sent += bytes as u64;
    }

    /// Total failures across every bucket, for the summary line.
    pub fn total_errors(&self) -> u64 {
        self.errors_by_bucket.values().sum()
    }
}

impl std::fmt::Display for BasicStatsCollector {
    /// Ported from `stat/basic.c`'s report, minus the histogram/percentile
    /// table (explicitly out of scope, spec §1): counters and totals only,
    /// no stack traces or internal state (spec §7 "user-visible failure").
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Total: connections {} requests {} replies {}", self.num_conns_issued, self.num_calls_sent, self.num_replies)?;
        writeln!(
            f,
            "Connection time [ms]: connect {:.1} max concurrent connections {}",
            self.conn_connect_time.mean() * 1000.0,
            self.max_concurrent_conns
        )?;
        writeln!(f, "Reply time [ms]: response {:.1}", self.call_response_time.mean() * 1000.0)?;
        writeln!(
            f,
            "Reply size [B]: header {:.1} content {:.1} footer {:.1}",
            self.hdr_bytes_received as f64 / self.num_replies.max(1) as f64,
            self.reply_bytes_received as f64 / self.num_replies.max(1) as f64,
            self.footer_bytes_received as f64 / self.num_replies.max(1) as f64,
        )?;
        writeln!(f, "Errors: total {} client-timo {}", self.total_errors(), self.num_client_timeouts)?;
        for (bucket, count) in {
            let mut entries: Vec<_> = self.errors_by_bucket.iter().collect();
            entries.sort_by_key(|(k, _)| **k);
            entries
        } {
            writeln!(f, "  {bucket}: {count}")?;
        }
        Ok(())
    }
}

/// Wire this collector into a context's event bus. `Ctx` only needs to
/// expose `&mut BasicStatsCollector`, so this works for `Core` or any
/// standalone test context with the same accessor.
pub fn register<Ctx: 'static>(
    events: &mut crate::event_bus::EventBus<Ctx>,
    stats: impl Fn(&mut Ctx) -> &mut BasicStatsCollector + Copy + 'static,
) -> Result<(), crate::event_bus::TooManyHandlersError> {
    events.register(EventKind::ConnConnecting, move |ctx: &mut Ctx, _, _, _: &EventArg| {
        stats(ctx).record_conn_issued();
    })?;
    events.register(EventKind::ConnClose, move |ctx: &mut Ctx, _, _, _: &EventArg| {
        stats(ctx).record_conn_closed();
    })?;
    events.register(EventKind::ConnConnected, move |ctx: &mut Ctx, _, _, arg: &EventArg| {
        if let EventArg::Seconds(elapsed) = arg {
            stats(ctx).record_connect(*elapsed);
        }
    })?;
    events.register(EventKind::ConnTimeout, move |ctx: &mut Ctx, _, _, _: &EventArg| {
        stats(ctx).record_timeout();
    })?;
    events.register(EventKind::ConnFailed, move |ctx: &mut Ctx, _, _, arg: &EventArg| {
        if let EventArg::Error(err) = arg {
            stats(ctx).record_error(err);
        }
    })?;
    events.register(EventKind::CallSendRawData, move |ctx: &mut Ctx, _, _, arg: &EventArg| {
        if let EventArg::RawData(bytes) = arg {
            stats(ctx).record_call_sent(bytes.len());
        }
    })?;
    events.register(EventKind::CallRecvHdr, move |ctx: &mut Ctx, _, _, arg: &EventArg| {
        if let EventArg::Line(line) = arg {
            stats(ctx).hdr_bytes_received += line.len() as u64 + 2;
        }
    })?;
    events.register(EventKind::CallRecvData, move |ctx: &mut Ctx, _, _, arg: &EventArg| {
        if let EventArg::RawData(data) = arg {
            stats(ctx).reply_bytes_received += data.len() as u64;
        }
    })?;
    events.register(EventKind::CallRecvFooter, move |ctx: &mut Ctx, _, _, arg: &EventArg| {
        if let EventArg::Line(line) = arg {
            stats(ctx).footer_bytes_received += line.len() as u64 + 2;
        }
    })?;
    events.register(EventKind::CallRecvStop, move |ctx: &mut Ctx, _, _, arg: &EventArg| {
        let elapsed = if let EventArg::Seconds(s) = arg { *s } else { 0.0 };
        stats(ctx).record_reply(elapsed);
    })?;
    Ok(())
}
