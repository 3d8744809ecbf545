// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The client background worker (§4.3): owns the read half of the persistent connection to the
//! scheduler, runs the boot sequence (signal blocking, driver init, `REGISTER`), and then drives
//! the receive loop that translates inbound control messages into gate-state transitions.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use gpu_sched_proto::receive_message;
use gpu_sched_proto::Message;
use gpu_sched_proto::MessageType;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::conn::Conn;
use crate::driver::DriverApi;
use crate::error::Error;
use crate::error::Result;
use crate::gate::Gate;
use crate::rate::sync_and_reset_window;
use crate::rate::RateController;

/// Outcome of the boot-time `REGISTER` handshake (§4.3 step 4): the daemon's reply tells us both
/// the freshly assigned client id and whether the scheduler is currently on.
pub struct RegisterOutcome {
    pub client_id: u64,
    pub scheduler_on: bool,
}

/// Blocks every signal on the calling thread: signals belong to the host application, not to this
/// injected library's background threads (§4.3 step 1).
pub fn block_all_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Sends `REGISTER` and reads exactly one reply frame (§4.3 step 4). The reply is either
/// `SCHED_ON` or `SCHED_OFF` and carries the new client id hex-encoded in `data`.
pub fn register(stream: &mut UnixStream, pod_name: String, pod_namespace: String) -> Result<RegisterOutcome> {
    let req = Message::new(MessageType::Register).with_pod(pod_name, pod_namespace);
    gpu_sched_proto::send_message(stream, &req).map_err(|source| Error::Send {
        msg_type: "REGISTER",
        source,
    })?;

    let reply = receive_message(stream)
        .map_err(|_| Error::ProtocolDied)?
        .ok_or(Error::ProtocolDied)?;

    let scheduler_on = match reply.msg_type {
        MessageType::SchedOn => true,
        MessageType::SchedOff => false,
        other => return Err(Error::MalformedRegisterReply(format!("unexpected reply type {}", other))),
    };

    let client_id = u64::from_str_radix(reply.data.trim(), 16)
        .map_err(|_| Error::MalformedRegisterReply(reply.data.clone()))?;

    info!("registered with client id {:016x}, scheduler_on={}", client_id, scheduler_on);
    Ok(RegisterOutcome { client_id, scheduler_on })
}

/// The receive loop (§4.3): one message at a time, gate mutex held for each transition. Never
/// returns under normal operation; a read error or clean EOF from the daemon means the scheduler
/// died or evicted us, which is unrecoverable for this process (§9: no reconnect logic).
pub fn run(mut read_half: UnixStream, gate: Arc<Gate>, conn: Arc<Conn>, driver: Arc<dyn DriverApi>, rate: Arc<RateController>) -> ! {
    block_all_signals();
    loop {
        let msg = match receive_message(&mut read_half) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                error!("fatal: scheduler closed the connection");
                std::process::exit(1);
            }
            Err(e) => {
                error!("fatal: failed to read from scheduler: {}", e);
                std::process::exit(1);
            }
        };
        debug!("received {} from scheduler", msg.msg_type);

        match msg.msg_type {
            MessageType::LockOk => {
                let mut guard = gate.lock();
                guard.need_lock = false;
                guard.own_lock = true;
                guard.did_work = true;
                gate.own_lock_cv.notify_all();
                gate.release_early_cv.notify_all();
            }
            MessageType::DropLock => {
                let ctx = {
                    let mut guard = gate.lock();
                    if !guard.own_lock {
                        continue;
                    }
                    guard.own_lock = false;
                    guard.ctx
                };
                if let Some(ctx) = ctx {
                    if let Err(code) = sync_and_reset_window(driver.as_ref(), ctx, &rate) {
                        warn!("synchronize failed while draining for DROP_LOCK: {:?}", code);
                    }
                }
                let released = Message::new(MessageType::LockReleased);
                if let Err(e) = conn.send(&released) {
                    error!("fatal: failed to send LOCK_RELEASED to scheduler: {}", e);
                    std::process::exit(1);
                }
            }
            MessageType::SchedOn => {
                let mut guard = gate.lock();
                if !guard.scheduler_on {
                    guard.scheduler_on = true;
                    guard.need_lock = false;
                    guard.own_lock = false;
                }
            }
            MessageType::SchedOff => {
                let mut guard = gate.lock();
                if guard.scheduler_on {
                    guard.scheduler_on = false;
                    guard.own_lock = true;
                    guard.need_lock = false;
                    gate.own_lock_cv.notify_all();
                }
            }
            other => {
                warn!("ignoring unexpected message type {} from scheduler", other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    use gpu_sched_proto::send_message;

    use super::*;
    use crate::driver::FakeDriver;

    #[test]
    fn register_parses_id_and_scheduler_state() {
        let (mut client_side, mut daemon_side) = UnixStream::pair().unwrap();
        let daemon = thread::spawn(move || {
            let req = receive_message(&mut daemon_side).unwrap().unwrap();
            assert_eq!(req.msg_type, MessageType::Register);
            let reply = Message::new(MessageType::SchedOn).with_data(format!("{:016x}", 0xabcdu64));
            send_message(&mut daemon_side, &reply).unwrap();
        });

        let outcome = register(&mut client_side, "none".into(), "none".into()).unwrap();
        assert_eq!(outcome.client_id, 0xabcd);
        assert!(outcome.scheduler_on);
        daemon.join().unwrap();
    }

    #[test]
    fn drop_lock_drains_and_replies_with_lock_released() {
        let (client_side, mut daemon_side) = UnixStream::pair().unwrap();
        let read_half = client_side.try_clone().unwrap();
        let conn = Arc::new(Conn::new(client_side));
        let driver: Arc<dyn DriverApi> = Arc::new(FakeDriver::new(1024));
        let ctx = driver.get_current_context().unwrap();
        let rate = Arc::new(RateController::new());

        let gate = Arc::new(Gate::new(true, true, conn.clone(), driver.clone()));
        {
            let mut guard = gate.lock();
            guard.ctx = Some(ctx);
        }

        let gate2 = gate.clone();
        thread::spawn(move || run(read_half, gate2, conn, driver, rate));

        send_message(&mut daemon_side, &Message::new(MessageType::DropLock)).unwrap();
        let released = receive_message(&mut daemon_side).unwrap().unwrap();
        assert_eq!(released.msg_type, MessageType::LockReleased);

        for _ in 0..50 {
            if !gate.lock().own_lock {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("own_lock was never cleared after DROP_LOCK");
    }

    #[test]
    fn sched_off_unblocks_waiters_immediately() {
        let (client_side, mut daemon_side) = UnixStream::pair().unwrap();
        let read_half = client_side.try_clone().unwrap();
        let conn = Arc::new(Conn::new(client_side));
        let driver: Arc<dyn DriverApi> = Arc::new(FakeDriver::new(1024));
        let rate = Arc::new(RateController::new());

        let gate = Arc::new(Gate::new(false, true, conn.clone(), driver.clone()));
        let gate2 = gate.clone();
        thread::spawn(move || run(read_half, gate2, conn, driver, rate));

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.await_lock().unwrap())
        };
        // Drain the REQ_LOCK the waiter sent so the daemon side doesn't matter for this test.
        let _ = receive_message(&mut daemon_side);

        send_message(&mut daemon_side, &Message::new(MessageType::SchedOff)).unwrap();
        waiter.join().unwrap();
        assert!(!gate.lock().scheduler_on);
    }
}
