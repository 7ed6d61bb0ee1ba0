//! Clock & Timer Wheel (spec §4.1), ported from `timer.c`.
//!
//! `now()` returns a cached value refreshed once per reactor iteration by
//! the driver's `tick()`; `now_forced()` always reads the OS clock. Timers
//! are pooled in a typed arena so scheduling under load does not allocate
//! once warmed up.
//!
//! The wheel deliberately does not invoke callbacks itself: firing a timer
//! needs `&mut Ctx` (the surrounding [`crate::core::Core`]), which is where
//! the wheel itself lives, so driving happens in two phases —
//! [`TimerWheel::take_due`] removes and returns the due slots without
//! touching `Ctx`, and the caller (`Core::tick`) invokes each callback with
//! its own `&mut self` once the wheel is no longer borrowed.

use std::time::Instant;

use slotmap::{new_key_type, SlotMap};

/// Timer granularity, ported verbatim from `TIMER_INTERVAL` in `timer.h`.
pub const TIMER_INTERVAL: f64 = 1.0 / 1000.0;

new_key_type! {
    /// Handle returned by [`TimerWheel::schedule`]. Schedule only returns
    /// `None` on allocation failure; the caller must treat that as "the
    /// operation has no watchdog" and proceed.
    pub struct TimerHandle;
}

pub(crate) struct TimerSlot<Ctx> {
    pub handle: TimerHandle,
    pub callback: Box<dyn FnOnce(&mut Ctx)>,
}

struct Armed<Ctx> {
    deadline: Instant,
    callback: Box<dyn FnOnce(&mut Ctx)>,
}

pub struct TimerWheel<Ctx> {
    epoch: Instant,
    cached_now: f64,
    timers: SlotMap<TimerHandle, Armed<Ctx>>,
    /// Insertion order, to break deadline ties FIFO.
    order: Vec<TimerHandle>,
    /// Handle of the timer whose callback is currently executing, if any.
    firing: Option<TimerHandle>,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot cancel a timer while its own callback is executing")]
pub struct CancelActiveTimerError;

impl<Ctx> Default for TimerWheel<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> TimerWheel<Ctx> {
    pub fn new() -> Self {
        TimerWheel {
            epoch: Instant::now(),
            cached_now: 0.0,
            timers: SlotMap::with_key(),
            order: Vec::new(),
            firing: None,
        }
    }

    /// Cheap: returns the value cached by the last clock refresh.
    pub fn now(&self) -> f64 {
        self.cached_now
    }

    /// Unconditionally reads the OS clock.
    pub fn now_forced(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Refresh the cached clock. Called once per reactor iteration before
    /// `take_due`.
    pub fn refresh_clock(&mut self) {
        self.cached_now = self.now_forced();
    }

    /// Schedule `callback` to run no earlier than `delay` seconds from now.
    pub fn schedule(
        &mut self,
        delay: f64,
        callback: impl FnOnce(&mut Ctx) + 'static,
    ) -> Option<TimerHandle> {
        let deadline = self.epoch + std::time::Duration::from_secs_f64(delay.max(0.0));
        let handle = self.timers.insert(Armed {
            deadline,
            callback: Box::new(callback),
        });
        self.order.push(handle);
        Some(handle)
    }

    /// Cancel a previously scheduled timer. A no-op if it already fired.
    pub fn cancel(&mut self, handle: TimerHandle) -> Result<(), CancelActiveTimerError> {
        if self.firing == Some(handle) {
            return Err(CancelActiveTimerError);
        }
        self.timers.remove(handle);
        self.order.retain(|h| *h != handle);
        Ok(())
    }

    /// Delay until the next deadline, used by the reactor to bound its
    /// multiplexer wait.
    pub fn next_deadline(&self) -> Option<f64> {
        let now = self.epoch + std::time::Duration::from_secs_f64(self.cached_now);
        self.order
            .iter()
            .filter_map(|h| self.timers.get(*h))
            .map(|slot| slot.deadline.saturating_duration_since(now).as_secs_f64())
            .fold(None, |acc, d| Some(acc.map_or(d, |a: f64| a.min(d))))
    }

    /// Remove and return every timer whose deadline has passed, in
    /// insertion order. Does not touch `Ctx`; the caller invokes the
    /// callbacks afterwards, once this borrow of the wheel has ended.
    pub(crate) fn take_due(&mut self) -> Vec<TimerSlot<Ctx>> {
        let now = self.epoch + std::time::Duration::from_secs_f64(self.cached_now);
        let due: Vec<TimerHandle> = self
            .order
            .iter()
            .copied()
            .filter(|h| self.timers.get(*h).map(|s| s.deadline <= now).unwrap_or(false))
            .collect();

        let mut out = Vec::with_capacity(due.len());
        for handle in due {
            self.order.retain(|h| *h != handle);
            if let Some(slot) = self.timers.remove(handle) {
                out.push(TimerSlot {
                    handle,
                    callback: slot.callback,
                });
            }
        }
        out
    }

    /// Mark `handle` as the one currently firing, for the duration of its
    /// callback. Must be paired with [`Self::clear_firing`].
    pub(crate) fn set_firing(&mut self, handle: TimerHandle) {
        self.firing = Some(handle);
    }

    pub(crate) fn clear_firing(&mut self) {
        self.firing = None;
    }

    /// Number of timers currently armed (diagnostics/tests).
    pub fn armed_count(&self) -> usize {
        self.order.len()
    }

    /// Drive the wheel against a standalone `Ctx`, for use outside the full
    /// reactor loop (tests, and simple single-context callers).
    pub fn tick(&mut self, ctx: &mut Ctx) {
        self.refresh_clock();
        for slot in self.take_due() {
            self.set_firing(slot.handle);
            (slot.callback)(ctx);
            self.clear_firing();
        }
    }
}
