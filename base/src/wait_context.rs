// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A small `epoll(7)` wrapper, in the same spirit as the upstream `base` crate's own
//! `WaitContext`/`EventToken` pair: callers tag each registered descriptor with a small `Copy`
//! token and get that token back (rather than a raw fd) when the descriptor becomes ready, so
//! dispatch code never has to re-derive "what is this fd for" from the fd value itself.

use std::marker::PhantomData;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::c_int;

use crate::descriptor::AsRawDescriptor;
use crate::descriptor::FromRawDescriptor;
use crate::descriptor::RawDescriptor;
use crate::descriptor::SafeDescriptor;
use crate::errno::errno_result;
use crate::errno::Result;

/// A type that can be packed into and recovered from the 64 bits epoll gives us back per event.
pub trait EventToken: Copy {
    fn as_raw_token(&self) -> u64;
    fn from_raw_token(data: u64) -> Self;
}

impl EventToken for u64 {
    fn as_raw_token(&self) -> u64 {
        *self
    }

    fn from_raw_token(data: u64) -> Self {
        data
    }
}

bitflags::bitflags! {
    /// Which readiness conditions a caller asked to be notified about; only used to report what
    /// fired, registration always asks for read-or-hangup (level-triggered, per the wire protocol
    /// design: partial frames / peer death must be observable even with nothing left to read).
    pub struct EventType: u32 {
        const Read = libc::EPOLLIN as u32;
        const Write = libc::EPOLLOUT as u32;
        const ReadWrite = (libc::EPOLLIN | libc::EPOLLOUT) as u32;
        const None = 0;
    }
}

#[derive(Debug)]
pub struct TriggeredEvent<T: EventToken> {
    pub token: T,
    pub is_readable: bool,
    pub is_writable: bool,
    pub is_hungup: bool,
}

/// A level-triggered epoll instance. Registrations are keyed by raw fd (one token per fd); the
/// daemon's event loop in §4.7 relies on level-triggering so that a client with more than one
/// buffered frame is seen again on the next `wait()` without re-arming anything.
pub struct WaitContext<T: EventToken> {
    epoll_fd: SafeDescriptor,
    token_type: PhantomData<T>,
}

impl<T: EventToken> WaitContext<T> {
    pub fn new() -> Result<WaitContext<T>> {
        // SAFETY: epoll_create1 does not touch any memory we own; the return value is checked.
        let ret = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ret < 0 {
            return errno_result();
        }
        Ok(WaitContext {
            // SAFETY: `ret` is a freshly created, uniquely owned fd.
            epoll_fd: unsafe { SafeDescriptor::from_raw_descriptor(ret) },
            token_type: PhantomData,
        })
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: Option<T>, events: EventType) -> Result<()> {
        let mut epoll_event = libc::epoll_event {
            events: events.bits() | libc::EPOLLHUP as u32 | libc::EPOLLERR as u32,
            u64: token.map(|t| t.as_raw_token()).unwrap_or(fd as u64),
        };
        // SAFETY: `epoll_event` is a valid, stack-owned struct and the return value is checked.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll_fd.as_raw_descriptor(),
                op,
                fd,
                &mut epoll_event as *mut libc::epoll_event,
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Adds `fd` to the interest list, to be reported back tagged with `token`.
    pub fn add(&self, fd: &dyn AsRawDescriptor, token: T) -> Result<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd.as_raw_descriptor(),
            Some(token),
            EventType::Read,
        )
    }

    /// Removes `fd` from the interest list. Must be called before the fd is closed: once closed,
    /// the kernel has already dropped the registration and a redundant `EPOLL_CTL_DEL` fails with
    /// `ENOENT`, which calling code should be prepared to ignore if it races a close.
    pub fn delete(&self, fd: &dyn AsRawDescriptor) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd.as_raw_descriptor(), None, EventType::None)
    }

    /// Blocks until at least one registered descriptor is ready, or `timeout` elapses.
    /// `timeout = None` blocks indefinitely, matching the daemon's use of `epoll_wait(..., -1)`
    /// for its event loop (§4.7): the loop has nothing else to do between events.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> Result<Vec<TriggeredEvent<T>>> {
        const MAX_EVENTS: usize = 32;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            // SAFETY: epoll_event is a plain old data struct; zero is a valid bit pattern.
            unsafe { mem::zeroed() };

        let timeout_millis = match timeout {
            Some(d) => d.as_millis().min(c_int::MAX as u128) as c_int,
            None => -1,
        };

        let ret = loop {
            // SAFETY: `events` is a valid buffer of `MAX_EVENTS` entries and the return value,
            // which is at most `MAX_EVENTS`, is checked before being used as a length.
            let ret = unsafe {
                libc::epoll_wait(
                    self.epoll_fd.as_raw_descriptor(),
                    events.as_mut_ptr(),
                    MAX_EVENTS as c_int,
                    timeout_millis,
                )
            };
            if ret < 0 {
                if crate::errno::Error::last().errno() == libc::EINTR {
                    continue;
                }
                return errno_result();
            }
            break ret;
        };

        Ok(events[..ret as usize]
            .iter()
            .map(|e| TriggeredEvent {
                token: T::from_raw_token(e.u64),
                is_readable: e.events & (libc::EPOLLIN as u32) != 0,
                is_writable: e.events & (libc::EPOLLOUT as u32) != 0,
                is_hungup: e.events & ((libc::EPOLLHUP | libc::EPOLLERR) as u32) != 0,
            })
            .collect())
    }

    /// Blocks indefinitely until at least one registered descriptor is ready.
    pub fn wait(&self) -> Result<Vec<TriggeredEvent<T>>> {
        self.wait_timeout(None)
    }
}
