// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The client gate: the one mutex + two condition variables guarding whether this process may
//! submit new GPU work right now. `await_lock` is the single entry point every gated driver hook
//! calls before doing real work; the background worker and idle releaser are the only other
//! threads that touch the gate's state, and always under the same mutex.

use std::sync::Arc;

use gpu_sched_proto::Message;
use gpu_sched_proto::MessageType;
use log::debug;
use sync::Condvar;
use sync::Mutex;

use crate::conn::Conn;
use crate::driver::DeviceContext;
use crate::driver::DriverApi;
use crate::error::Error;
use crate::error::Result;

pub struct GateState {
    pub own_lock: bool,
    pub need_lock: bool,
    pub did_work: bool,
    pub scheduler_on: bool,
    pub ctx: Option<DeviceContext>,
}

/// Guards the decision every gated driver hook must make: block until this process holds the GPU
/// lock, or until the scheduler has declared itself off (§4.2).
pub struct Gate {
    state: Mutex<GateState>,
    pub own_lock_cv: Condvar,
    pub release_early_cv: Condvar,
    conn: Arc<Conn>,
    driver: Arc<dyn DriverApi>,
}

impl Gate {
    /// `own_lock`/`scheduler_on` reflect the daemon's `REGISTER` reply, already known by the time
    /// the worker hands off to application threads (§4.3 step 4).
    pub fn new(own_lock: bool, scheduler_on: bool, conn: Arc<Conn>, driver: Arc<dyn DriverApi>) -> Gate {
        Gate {
            state: Mutex::new(GateState {
                own_lock,
                need_lock: false,
                did_work: false,
                scheduler_on,
                ctx: None,
            }),
            own_lock_cv: Condvar::new(),
            release_early_cv: Condvar::new(),
            conn,
            driver,
        }
    }

    pub fn lock(&self) -> sync::MutexGuard<GateState> {
        self.state.lock()
    }

    /// §4.2: the single blocking operation every gated GPU entry point calls first. Returns once
    /// this process holds the lock, or the scheduler has turned itself off.
    pub fn await_lock(&self) -> Result<()> {
        let mut guard = self.state.lock();

        if guard.ctx.is_none() {
            let ctx = self
                .driver
                .get_current_context()
                .map_err(|code| Error::Driver { call: "get_current_context", code })?;
            guard.ctx = Some(ctx);
        }

        while !guard.own_lock {
            if !guard.need_lock {
                guard.need_lock = true;
                let msg = Message::new(MessageType::ReqLock);
                if let Err(source) = self.conn.send(&msg) {
                    return Err(Error::Send { msg_type: "REQ_LOCK", source });
                }
                debug!("sent REQ_LOCK, parking on the gate until LOCK_OK or SCHED_OFF");
            }
            guard = self.own_lock_cv.wait(guard);
        }

        guard.did_work = true;
        self.release_early_cv.notify_all();
        Ok(())
    }

    pub fn captured_context(&self) -> Option<DeviceContext> {
        self.state.lock().ctx
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    use gpu_sched_proto::receive_message;

    use super::*;
    use crate::driver::FakeDriver;

    fn gate_with_pair(own_lock: bool, scheduler_on: bool) -> (Gate, UnixStream) {
        let (client_side, daemon_side) = UnixStream::pair().unwrap();
        let conn = Arc::new(Conn::new(client_side));
        let driver: Arc<dyn DriverApi> = Arc::new(FakeDriver::new(1024 * 1024));
        (Gate::new(own_lock, scheduler_on, conn, driver), daemon_side)
    }

    #[test]
    fn await_lock_returns_immediately_when_already_held() {
        let (gate, _daemon_side) = gate_with_pair(true, true);
        gate.await_lock().unwrap();
        assert!(gate.lock().did_work);
    }

    #[test]
    fn await_lock_sends_req_lock_exactly_once_for_concurrent_callers() {
        let (gate, mut daemon_side) = gate_with_pair(false, true);
        let gate = Arc::new(gate);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || gate.await_lock().unwrap())
            })
            .collect();

        // Give the threads a moment to pile up on the condvar before granting the lock.
        thread::sleep(Duration::from_millis(20));
        let req = receive_message(&mut daemon_side).unwrap().unwrap();
        assert_eq!(req.msg_type, MessageType::ReqLock);

        {
            let mut guard = gate.lock();
            guard.need_lock = false;
            guard.own_lock = true;
        }
        gate.own_lock_cv.notify_all();

        for h in handles {
            h.join().unwrap();
        }

        // No second REQ_LOCK should have been sent; the socket has nothing further queued.
        daemon_side.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        let err = std::io::Read::read(&mut daemon_side, &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn scheduler_off_unblocks_without_a_req_lock() {
        let (gate, _daemon_side) = gate_with_pair(true, false);
        gate.await_lock().unwrap();
    }
}
