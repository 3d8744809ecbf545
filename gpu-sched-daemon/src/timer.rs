// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The time-quantum timer thread: enforces that no client holds the GPU lock for longer than
//! `quantum` before being asked to drop it.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use gpu_sched_proto::try_send_message_nonblocking;
use gpu_sched_proto::Message;
use gpu_sched_proto::MessageType;
use log::debug;
use log::warn;
use sync::Condvar;
use sync::Mutex;

use crate::state::SchedulerState;

/// Runs forever. Every iteration of the outer loop represents one "arming" of the timer: it either
/// elapses (and a `DROP_LOCK` is sent, or the iteration is a no-op if there is nothing to drop) or
/// is interrupted by a reset signal (`must_reset_timer`), in which case it re-arms from scratch.
pub fn run(state: Arc<Mutex<SchedulerState>>, timer_cv: Arc<Condvar>) {
    let mut guard = state.lock();
    loop {
        guard.must_reset_timer = false;
        let round_at_start = guard.scheduling_round;
        let deadline = Instant::now() + guard.quantum;

        let (new_guard, woke_on_reset) = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                break (guard, false);
            }
            let (new_guard, result) = timer_cv.wait_timeout(guard, remaining);
            guard = new_guard;
            if result.timed_out() {
                break (guard, false);
            }
            if guard.must_reset_timer {
                // A real reset (quantum change or a fresh scheduling round): re-arm from scratch.
                break (guard, true);
            }
            // Spurious wakeup with no reset requested: loop back and wait out the remainder of
            // the same deadline rather than losing it.
        };
        guard = new_guard;

        if woke_on_reset {
            // Signaled restart clears `drop_lock_sent`: a fresh scheduling round (or a quantum
            // change) means any earlier DROP_LOCK no longer describes the current holder.
            guard.drop_lock_sent = false;
            continue;
        }

        // The inner loop only exits early (without `must_reset_timer`) via a genuine timeout.
        if !guard.lock_held {
            continue;
        }
        if guard.drop_lock_sent {
            continue;
        }
        if guard.scheduling_round != round_at_start {
            // The holder already changed since we armed; the new holder gets a fresh quantum.
            continue;
        }

        let fd = match guard.requests.front().copied() {
            Some(fd) => fd,
            None => continue,
        };
        debug!("time quantum elapsed, sending DROP_LOCK to fd {}", fd);
        let send_result = match guard.clients.get_mut(&fd) {
            Some(client) => {
                let msg = Message::new(MessageType::DropLock).with_id(client.id);
                try_send_message_nonblocking(&mut client.stream, &msg)
            }
            None => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no client")),
        };

        match send_result {
            Ok(()) => {
                guard.drop_lock_sent = true;
            }
            Err(e) => {
                warn!("failed to send DROP_LOCK to fd {}: {}", fd, e);
                guard.evict(fd);
                guard.try_schedule();
                guard.drop_lock_sent = false;
            }
        }
    }
}
