//! Reactor (spec §4.5), ported from the `select()`-based multiplexer loop
//! in `core_loop`, using a level-triggered `epoll` instead of `select`'s
//! O(maxfd) bitmask scan — same per-iteration contract (tick the wheel,
//! block bounded by the next deadline, dispatch every ready socket once
//! per direction), different primitive.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use bitflags::bitflags;
use rustix::event::epoll;

use crate::model::ConnKey;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b01;
        const WRITABLE = 0b10;
    }
}

impl Interest {
    fn to_epoll_flags(self) -> epoll::EventFlags {
        let mut flags = epoll::EventFlags::empty();
        if self.contains(Interest::READABLE) {
            flags |= epoll::EventFlags::IN;
        }
        if self.contains(Interest::WRITABLE) {
            flags |= epoll::EventFlags::OUT;
        }
        flags
    }
}

/// What the reactor observed ready on one socket this iteration.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub conn: ConnKey,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("epoll_create failed: {0}")]
    Create(#[source] std::io::Error),
    #[error("epoll_ctl failed: {0}")]
    Ctl(#[source] std::io::Error),
    #[error("epoll_wait failed: {0}")]
    Wait(#[source] std::io::Error),
}

/// Readiness multiplexer over a set of connection sockets. The reactor owns
/// no sockets; it only indexes raw fds back to the owning [`ConnKey`] so the
/// connection engine (spec §4.6) can dispatch without a linear scan.
pub struct Reactor {
    epoll_fd: OwnedFd,
    index: HashMap<RawFd, ConnKey>,
    interests: HashMap<RawFd, Interest>,
}

impl Reactor {
    pub fn new() -> Result<Self, ReactorError> {
        let epoll_fd = epoll::create(epoll::CreateFlags::CLOEXEC).map_err(|e| ReactorError::Create(e.into()))?;
        Ok(Reactor {
            epoll_fd,
            index: HashMap::new(),
            interests: HashMap::new(),
        })
    }

    /// Register `fd` for `interest`, owned by `conn`. Ported from
    /// `set_active`'s `FD_SET` plus `sd_to_conn` bookkeeping.
    pub fn register(&mut self, fd: impl AsFd, conn: ConnKey, interest: Interest) -> Result<(), ReactorError> {
        let raw = fd.as_fd().as_raw_fd();
        epoll::add(
            &self.epoll_fd,
            fd.as_fd(),
            epoll::EventData::new_u64(raw as u64),
            interest.to_epoll_flags(),
        )
        .map_err(|e| ReactorError::Ctl(e.into()))?;
        self.index.insert(raw, conn);
        self.interests.insert(raw, interest);
        Ok(())
    }

    /// Change the interest set for an already-registered fd.
    pub fn reinterest(&mut self, fd: impl AsFd, interest: Interest) -> Result<(), ReactorError> {
        let raw = fd.as_fd().as_raw_fd();
        epoll::modify(
            &self.epoll_fd,
            fd.as_fd(),
            epoll::EventData::new_u64(raw as u64),
            interest.to_epoll_flags(),
        )
        .map_err(|e| ReactorError::Ctl(e.into()))?;
        self.interests.insert(raw, interest);
        Ok(())
    }

    /// Drop `fd` from both interests before the caller closes it. Ported
    /// from `core_close`'s `FD_CLR` pair, which must run before the fd is
    /// reused by a later `socket()` call.
    pub fn deregister(&mut self, fd: impl AsFd) -> Result<(), ReactorError> {
        let raw = fd.as_fd().as_raw_fd();
        let _ = epoll::delete(&self.epoll_fd, fd.as_fd());
        self.index.remove(&raw);
        self.interests.remove(&raw);
        Ok(())
    }

    /// Block for at most `timeout` (the wheel's next deadline, already
    /// computed by the caller) and return every ready socket's readiness,
    /// resolved back to its owning [`ConnKey`].
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Vec<Readiness>, ReactorError> {
        let mut events = epoll::EventVec::with_capacity(self.index.len().max(16));
        epoll::wait(&self.epoll_fd, &mut events, timeout).map_err(|e| ReactorError::Wait(e.into()))?;

        let mut out = Vec::with_capacity(events.len());
        for event in events.iter() {
            let raw = event.data.u64() as RawFd;
            if let Some(&conn) = self.index.get(&raw) {
                let flags = event.flags;
                out.push(Readiness {
                    conn,
                    readable: flags.contains(epoll::EventFlags::IN),
                    writable: flags.contains(epoll::EventFlags::OUT),
                });
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
