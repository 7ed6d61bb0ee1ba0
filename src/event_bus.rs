//! Event Bus (spec §4.2), ported from `event.c`/`event.h`.
//!
//! A fixed enumeration of event kinds; handlers register per kind and run
//! synchronously, in registration order, when the kind is signalled.

use crate::error::CoreError;
use crate::model::{CallKey, ConnKey, SessionKey};

/// Maximum handlers per event kind, ported from `MAX_NUM_OPS` in `event.c`.
pub const MAX_HANDLERS_PER_EVENT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum EventKind {
    PerfSample,
    HostnameLookupStart,
    HostnameLookupStop,
    SessNew,
    SessFailed,
    SessDestroyed,
    ConnNew,
    ConnConnecting,
    ConnConnected,
    ConnClose,
    ConnDestroyed,
    ConnFailed,
    ConnTimeout,
    CallNew,
    CallIssue,
    CallSendStart,
    CallSendRawData,
    CallSendStop,
    CallRecvStart,
    CallRecvHdr,
    CallRecvRawData,
    CallRecvData,
    CallRecvFooter,
    CallRecvStop,
    CallDestroyed,
}

pub const NUM_EVENT_KINDS: usize = EventKind::CallDestroyed as usize + 1;

/// The object a signalled event is about.
#[derive(Debug, Clone, Copy)]
pub enum Subject {
    Conn(ConnKey),
    Call(CallKey),
    Session(SessionKey),
    /// Used for events with no owning entity, e.g. `HostnameLookupStart`.
    None,
}

/// Generalizes the original's `Any_Type` union (spec Design Note): a sum
/// type whose variants cover every payload an event actually carries.
#[derive(Debug, Clone)]
pub enum EventArg<'a> {
    None,
    Errno(i32),
    /// The full typed error attached to `CONN_FAILED`, carrying enough to
    /// bucket it in a stats collector (spec §7's error taxonomy).
    Error(CoreError),
    StatusCode(u32),
    /// A single parsed header/footer line, borrowed for the duration of the
    /// handler call (mirrors the original's pointer-to-line-buffer arg).
    Line(&'a [u8]),
    /// A slice of raw bytes moving across the wire (send-raw/recv-raw).
    RawData(&'a [u8]),
    /// A sampling weight (used by `PerfSample`).
    Weight(f64),
    /// An elapsed-time sample, seconds (connect time, response time).
    Seconds(f64),
    Hostname(&'a str),
}

pub trait Handler<Ctx> {
    fn handle(&self, ctx: &mut Ctx, kind: EventKind, subject: Subject, arg: &EventArg);
}

impl<Ctx, F> Handler<Ctx> for F
where
    F: Fn(&mut Ctx, EventKind, Subject, &EventArg),
{
    fn handle(&self, ctx: &mut Ctx, kind: EventKind, subject: Subject, arg: &EventArg) {
        self(ctx, kind, subject, arg)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("sorry, attempted to register more than {MAX_HANDLERS_PER_EVENT} handlers for one event kind")]
pub struct TooManyHandlersError;

/// Fixed-size per-kind handler table. Handlers run synchronously, in
/// registration order; they must not re-enter the bus for the same event
/// instance.
pub struct EventBus<Ctx> {
    handlers: Vec<Vec<Box<dyn Handler<Ctx>>>>,
    signalling: Option<EventKind>,
}

impl<Ctx> Default for EventBus<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> EventBus<Ctx> {
    pub fn new() -> Self {
        let mut handlers = Vec::with_capacity(NUM_EVENT_KINDS);
        handlers.resize_with(NUM_EVENT_KINDS, Vec::new);
        EventBus {
            handlers,
            signalling: None,
        }
    }

    pub fn register(
        &mut self,
        kind: EventKind,
        handler: impl Handler<Ctx> + 'static,
    ) -> Result<(), TooManyHandlersError> {
        let slot = &mut self.handlers[kind as usize];
        if slot.len() >= MAX_HANDLERS_PER_EVENT {
            return Err(TooManyHandlersError);
        }
        slot.push(Box::new(handler));
        Ok(())
    }

    /// Invoke every handler registered for `kind`, in registration order.
    /// Usable whenever `Ctx` does not itself own this bus (e.g. in tests, or
    /// a collaborator with its own private event bus).
    pub fn signal(&mut self, ctx: &mut Ctx, kind: EventKind, subject: Subject, arg: EventArg) {
        debug_assert_ne!(
            self.signalling,
            Some(kind),
            "handlers must not re-enter the bus for the same event instance"
        );
        self.signalling = Some(kind);
        for handler in &self.handlers[kind as usize] {
            handler.handle(ctx, kind, subject, &arg);
        }
        self.signalling = None;
    }

    /// Remove and return the handler list for `kind`, leaving an empty list
    /// in its place. Pairs with [`Self::restore_handlers`].
    ///
    /// When `Ctx` itself owns the bus (our `Core`), `signal` above cannot be
    /// called directly: `ctx.events.signal(ctx, ...)` would need one borrow
    /// of `ctx.events` and a second, overlapping mutable borrow of all of
    /// `ctx` for the argument. Taking this kind's handlers out first (same
    /// two-phase trick as [`crate::clock::TimerWheel::take_due`]) leaves
    /// `ctx` free for the duration of the dispatch loop; other event kinds'
    /// handler lists are untouched, so a handler signalling a *different*
    /// kind mid-dispatch still reaches its listeners.
    pub(crate) fn take_handlers(&mut self, kind: EventKind) -> Vec<Box<dyn Handler<Ctx>>> {
        std::mem::take(&mut self.handlers[kind as usize])
    }

    pub(crate) fn restore_handlers(&mut self, kind: EventKind, handlers: Vec<Box<dyn Handler<Ctx>>>) {
        self.handlers[kind as usize] = handlers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn handlers_fire_in_registration_order() {
        let mut bus: EventBus<RefCell<Vec<i32>>> = EventBus::new();
        for i in 0..3 {
            bus.register(EventKind::CallNew, move |ctx: &mut RefCell<Vec<i32>>, _, _, _: &EventArg| {
                ctx.get_mut().push(i);
            })
            .unwrap();
        }
        let mut ctx = RefCell::new(Vec::new());
        bus.signal(&mut ctx, EventKind::CallNew, Subject::None, EventArg::None);
        assert_eq!(*ctx.get_mut(), vec![0, 1, 2]);
    }

    #[test]
    fn fifth_handler_is_rejected() {
        let mut bus: EventBus<()> = EventBus::new();
        for _ in 0..MAX_HANDLERS_PER_EVENT {
            bus.register(EventKind::ConnNew, |_: &mut (), _, _, _: &EventArg| {})
                .unwrap();
        }
        assert!(bus
            .register(EventKind::ConnNew, |_: &mut (), _, _, _: &EventArg| {})
            .is_err());
    }

    /// A self-owning context exercising the take/restore dispatch idiom that
    /// `Core::signal` uses: the bus lives inside the context it hands
    /// handlers a `&mut` reference to.
    struct SelfOwning {
        events: EventBus<SelfOwning>,
        log: Vec<&'static str>,
    }

    fn dispatch(ctx: &mut SelfOwning, kind: EventKind, subject: Subject, arg: EventArg) {
        let handlers = ctx.events.take_handlers(kind);
        for h in &handlers {
            h.handle(ctx, kind, subject, &arg);
        }
        ctx.events.restore_handlers(kind, handlers);
    }

    #[test]
    fn take_restore_supports_reentrant_dispatch_of_other_kinds() {
        let mut ctx = SelfOwning { events: EventBus::new(), log: Vec::new() };
        ctx.events
            .register(EventKind::ConnFailed, |ctx: &mut SelfOwning, _, _, _: &EventArg| {
                ctx.log.push("failed");
                dispatch(ctx, EventKind::ConnClose, Subject::None, EventArg::None);
            })
            .unwrap();
        ctx.events
            .register(EventKind::ConnClose, |ctx: &mut SelfOwning, _, _, _: &EventArg| {
                ctx.log.push("closed");
            })
            .unwrap();

        dispatch(&mut ctx, EventKind::ConnFailed, Subject::None, EventArg::None);
        assert_eq!(ctx.log, vec!["failed", "closed"]);
    }
}
