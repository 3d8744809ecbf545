// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The idle releaser (§4.4): a dedicated thread that voluntarily gives up the GPU lock after
//! `check_interval` of true idleness, so a process that briefly grabbed the lock and then went
//! quiet does not sit on it until the time quantum forces a `DROP_LOCK`.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use gpu_sched_proto::Message;
use gpu_sched_proto::MessageType;
use log::debug;
use log::error;
use log::warn;

use crate::conn::Conn;
use crate::driver::DriverApi;
use crate::gate::Gate;
use crate::rate::sync_and_reset_window;
use crate::rate::RateController;

/// Runs forever on its own thread. Holds the gate mutex across the entire wait (§5): a timed wait
/// on `release_early_cv` releases the mutex only while actually blocked, re-acquiring it the moment
/// the deadline or a signal fires, exactly like the daemon's time-quantum timer.
pub fn run(
    gate: Arc<Gate>,
    conn: Arc<Conn>,
    driver: Arc<dyn DriverApi>,
    rate: Arc<RateController>,
    check_interval: Duration,
    sync_fallback_threshold: Duration,
) -> ! {
    crate::worker::block_all_signals();

    // Once the utilization sensor fails once, downgrade to the sync-timing fallback permanently
    // for the rest of this process's lifetime (§7 error taxonomy item 6).
    let sensor_unavailable = AtomicBool::new(false);

    let mut guard = gate.lock();
    loop {
        guard.did_work = false;
        let deadline = Instant::now() + check_interval;

        guard = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                break guard;
            }
            let (new_guard, result) = gate.release_early_cv.wait_timeout(guard, remaining);
            guard = new_guard;
            if result.timed_out() {
                break guard;
            }
            if guard.did_work {
                // Work happened: this is a timer reset, not a spurious wakeup.
                break guard;
            }
            // Spurious wakeup with no work observed: resume waiting out the same deadline.
        };

        if guard.did_work {
            continue;
        }
        if !guard.scheduler_on || !guard.own_lock {
            continue;
        }

        let ctx = match guard.ctx {
            Some(ctx) => ctx,
            None => continue,
        };

        let busy = if !sensor_unavailable.load(Ordering::Relaxed) {
            match driver.utilization_percent(ctx) {
                Some(pct) => pct > 0,
                None => {
                    warn!("utilization sensor unavailable; downgrading to sync-timing fallback for the rest of this process");
                    sensor_unavailable.store(true, Ordering::Relaxed);
                    fallback_probe(driver.as_ref(), ctx, &rate, sync_fallback_threshold)
                }
            }
        } else {
            fallback_probe(driver.as_ref(), ctx, &rate, sync_fallback_threshold)
        };

        if busy {
            continue;
        }

        debug!("process idle for {:?}; releasing the GPU lock early", check_interval);
        if let Err(e) = conn.send(&Message::new(MessageType::LockReleased)) {
            error!("fatal: failed to send LOCK_RELEASED to scheduler: {}", e);
            std::process::exit(1);
        }
        guard.own_lock = false;
    }
}

/// Times a device synchronize and reports the device busy if it took at least
/// `sync_fallback_threshold`. A synchronize failure is treated conservatively as "busy" (we do not
/// want to release the lock out from under in-flight work we failed to observe draining).
fn fallback_probe(
    driver: &dyn DriverApi,
    ctx: crate::driver::DeviceContext,
    rate: &RateController,
    sync_fallback_threshold: Duration,
) -> bool {
    match sync_and_reset_window(driver, ctx, rate) {
        Ok(elapsed) => elapsed >= sync_fallback_threshold,
        Err(code) => {
            warn!("synchronize failed during idle probe (code {}); assuming busy", code);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use gpu_sched_proto::receive_message;

    use super::*;
    use crate::driver::FakeDriver;

    #[test]
    fn releases_after_idle_interval_with_clear_probes() {
        let (client_side, mut daemon_side) = UnixStream::pair().unwrap();
        let conn = Arc::new(Conn::new(client_side));
        let driver: Arc<dyn DriverApi> = Arc::new(FakeDriver::new(1024));
        driver.get_current_context().unwrap();

        let gate = Arc::new(Gate::new(true, true, conn.clone(), driver.clone()));
        // Capture the context and mark work done, as a real gated call would.
        gate.await_lock().unwrap();

        let rate = Arc::new(RateController::new());
        let gate2 = gate.clone();
        let check_interval = Duration::from_millis(30);
        thread::spawn(move || {
            run(gate2, conn, driver, rate, check_interval, Duration::from_millis(100))
        });

        let released = receive_message(&mut daemon_side).unwrap().unwrap();
        assert_eq!(released.msg_type, MessageType::LockReleased);
        // Poll rather than sleep-then-check to avoid a flaky race on slow CI machines.
        for _ in 0..50 {
            if !gate.lock().own_lock {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("own_lock was never cleared after LOCK_RELEASED");
    }

    #[test]
    fn does_not_release_while_device_is_reported_busy() {
        let (client_side, mut daemon_side) = UnixStream::pair().unwrap();
        let conn = Arc::new(Conn::new(client_side));
        let driver = Arc::new(FakeDriver::new(1024));
        driver.set_utilization(Some(50));
        let driver: Arc<dyn DriverApi> = driver;

        let gate = Arc::new(Gate::new(true, true, conn.clone(), driver.clone()));
        gate.await_lock().unwrap();

        let rate = Arc::new(RateController::new());
        thread::spawn(move || {
            run(gate, conn, driver, rate, Duration::from_millis(20), Duration::from_millis(100))
        });

        daemon_side.set_read_timeout(Some(Duration::from_millis(150))).unwrap();
        let result = receive_message(&mut daemon_side);
        assert!(result.is_err() || result.unwrap().is_none());
    }
}
