// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The submission-rate controller (§4.5): bounds how many kernels this process dispatches between
//! forced synchronizes, so the daemon's time-quantum preemption is never blocked behind an
//! arbitrarily long backlog of already-submitted work.

use std::time::Duration;
use std::time::Instant;

use sync::Mutex;

use crate::driver::DeviceContext;
use crate::driver::DriverApi;
use crate::error::Error;
use crate::error::Result;

const MIN_WINDOW: u32 = 1;
const MAX_WINDOW: u32 = 2048;
const HARD_BACKOFF_THRESHOLD: Duration = Duration::from_secs(10);
const EASE_BACK_THRESHOLD: Duration = Duration::from_secs(1);

struct RateState {
    pending_window: u32,
    kern_since_sync: u32,
}

/// Guarded by its own mutex, independent of the gate mutex (§5): multiple application threads may
/// launch kernels concurrently and must see consistent `pending_window`/`kern_since_sync`
/// transitions.
pub struct RateController {
    state: Mutex<RateState>,
}

impl RateController {
    pub fn new() -> RateController {
        RateController {
            state: Mutex::new(RateState {
                pending_window: MIN_WINDOW,
                kern_since_sync: 0,
            }),
        }
    }

    pub fn pending_window(&self) -> u32 {
        self.state.lock().pending_window
    }

    /// Called after every gated kernel launch. Increments the counter and, once the window is
    /// exhausted, synchronizes the device and re-tunes the window from the observed latency.
    pub fn on_kernel_launched(&self, driver: &dyn DriverApi, ctx: DeviceContext) -> Result<()> {
        let should_sync = {
            let mut state = self.state.lock();
            state.kern_since_sync += 1;
            state.kern_since_sync >= state.pending_window
        };
        if !should_sync {
            return Ok(());
        }

        let start = Instant::now();
        driver
            .synchronize(ctx)
            .map_err(|code| Error::Driver { call: "synchronize", code })?;
        let elapsed = start.elapsed();

        let mut state = self.state.lock();
        state.pending_window = if elapsed >= HARD_BACKOFF_THRESHOLD {
            MIN_WINDOW
        } else if elapsed >= EASE_BACK_THRESHOLD {
            (state.pending_window / 2).max(MIN_WINDOW)
        } else {
            state.pending_window.saturating_mul(2).min(MAX_WINDOW)
        };
        state.kern_since_sync = 0;
        Ok(())
    }

    /// Unconditionally resets the window to its minimum. Only called from
    /// [`sync_and_reset_window`], never directly from the normal launch path above.
    fn reset(&self) {
        let mut state = self.state.lock();
        state.pending_window = MIN_WINDOW;
        state.kern_since_sync = 0;
    }
}

impl Default for RateController {
    fn default() -> RateController {
        RateController::new()
    }
}

/// The shared "synchronize and reset" helper (§4.5, §9 open questions): drains in-flight work on
/// the captured context and, as a side effect the original implementation has in both call sites,
/// unconditionally resets the rate controller's window. Called from the `DROP_LOCK` handler
/// (worker) and the idle releaser's fallback busy-probe — never from the normal per-launch path in
/// [`RateController::on_kernel_launched`], which tunes the window from its own independent sync.
pub fn sync_and_reset_window(
    driver: &dyn DriverApi,
    ctx: DeviceContext,
    rate: &RateController,
) -> Result<Duration> {
    let start = Instant::now();
    driver
        .synchronize(ctx)
        .map_err(|code| Error::Driver { call: "synchronize", code })?;
    let elapsed = start.elapsed();
    rate.reset();
    Ok(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::FakeDriver;

    #[test]
    fn window_grows_on_fast_syncs_and_shrinks_on_slow_ones() {
        let driver = FakeDriver::new(1024);
        let ctx = driver.get_current_context().unwrap();
        let rate = RateController::new();

        // pending_window starts at 1, so every launch forces a sync until it grows.
        for _ in 0..6 {
            rate.on_kernel_launched(&driver, ctx).unwrap();
        }
        assert!(rate.pending_window() > 1);

        driver.set_sync_latency(Duration::from_millis(0));
        let before = rate.pending_window();
        // Drain the window with small launches that don't force a sync.
        for _ in 0..(before as usize - 1) {
            rate.on_kernel_launched(&driver, ctx).unwrap();
        }
        assert_eq!(rate.pending_window(), before);

        driver.set_sync_latency(Duration::from_millis(1100));
        rate.on_kernel_launched(&driver, ctx).unwrap();
        assert_eq!(rate.pending_window(), (before / 2).max(1));
    }

    #[test]
    fn sync_and_reset_window_always_resets_regardless_of_latency() {
        let driver = FakeDriver::new(1024);
        let ctx = driver.get_current_context().unwrap();
        let rate = RateController::new();
        for _ in 0..6 {
            rate.on_kernel_launched(&driver, ctx).unwrap();
        }
        assert!(rate.pending_window() > 1);

        sync_and_reset_window(&driver, ctx, &rate).unwrap();
        assert_eq!(rate.pending_window(), 1);
    }
}
