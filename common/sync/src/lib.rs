// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin wrappers around `std::sync::Mutex`/`Condvar` that panic on a poisoned lock instead of
//! returning a `Result`. Every lock in this codebase (the daemon's global mutex, the client gate
//! mutex, the rate controller's mutex) guards state that the rest of the protocol depends on being
//! consistent; a poisoned lock means a prior panic already left that state in an unknown shape, so
//! there is nothing more useful to do than propagate the panic rather than let a caller quietly
//! `.unwrap_or_default()` past broken invariants.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Condvar as StdCondvar;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard as StdMutexGuard;
use std::sync::WaitTimeoutResult;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized> {
    inner: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(v: T) -> Self {
        Mutex {
            inner: StdMutex::new(v),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<T> {
        MutexGuard {
            inner: self.inner.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: StdMutexGuard<'a, T>,
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

#[derive(Debug, Default)]
pub struct Condvar {
    inner: StdCondvar,
}

impl Condvar {
    pub fn new() -> Self {
        Condvar {
            inner: StdCondvar::new(),
        }
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }

    /// Blocks until notified. Mirrors `pthread_cond_wait`.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        MutexGuard {
            inner: self
                .inner
                .wait(guard.inner)
                .unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Blocks until notified or `dur` elapses, whichever is first. Mirrors
    /// `pthread_cond_timedwait` with a relative duration; callers that need an absolute deadline
    /// (as the C implementation does, to avoid losing the remainder on spurious wakeups) recompute
    /// `deadline.saturating_duration_since(Instant::now())` and pass that in on each resumed wait.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        let (guard, result) = self
            .inner
            .wait_timeout(guard.inner, dur)
            .unwrap_or_else(|e| e.into_inner());
        (MutexGuard { inner: guard }, result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn single_thread_lock() {
        let m = Mutex::new(0);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn condvar_wakes_waiter() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let pair2 = pair.clone();

        let handle = thread::spawn(move || {
            let (lock, cvar) = &*pair2;
            let mut ready = lock.lock();
            *ready = true;
            cvar.notify_one();
        });

        let (lock, cvar) = &*pair;
        let mut ready = lock.lock();
        while !*ready {
            ready = cvar.wait(ready);
        }
        assert!(*ready);
        handle.join().unwrap();
    }

    #[test]
    fn condvar_wait_timeout_elapses() {
        let m = Mutex::new(());
        let cvar = Condvar::new();
        let guard = m.lock();
        let (_, result) = cvar.wait_timeout(guard, Duration::from_millis(10));
        assert!(result.timed_out());
    }
}
