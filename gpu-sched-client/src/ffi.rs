// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The exported C-ABI hooks (§6, §9 "Symbol interposition"). The mechanism that actually redirects
//! a host application's driver-API calls into these symbols — replacing the dynamic symbol
//! resolver for the driver library via a pre-load trick — is an external collaborator (§1) and is
//! not implemented in this crate. What lives here is the shape every hook takes: gate first (or
//! skip the gate for the two calls §4.6 exempts), then delegate to the real driver or the memory
//! shim, exactly as §6's "foreign API surface hooked by the client" table describes.
//!
//! The real driver's calling convention (argument layout for `memcpy` direction/kind, the kernel
//! launch descriptor, etc.) is itself part of that external collaborator and is not reproduced
//! here; these signatures carry just enough shape — a context token, a device pointer, a size — to
//! demonstrate where `await_lock`, the rate controller, and the memory shim are wired in.

use std::sync::Arc;

use log::error;
use log::warn;

use crate::client::Client;
use crate::driver::DeviceContext;
use crate::driver::DevicePtr;
use crate::driver::DriverApi;
use crate::driver::RealDriver;
use crate::memory::OUT_OF_MEMORY;

fn real_driver() -> Arc<dyn DriverApi> {
    match RealDriver::load() {
        Ok(driver) => Arc::new(driver),
        Err(code) => {
            error!("fatal: failed to load the GPU driver (code {})", code);
            std::process::exit(1);
        }
    }
}

/// Hooks the driver's kernel-launch entry point. Gated (§4.2); feeds the submission-rate
/// controller on every call (§4.5).
#[no_mangle]
pub extern "C" fn gpushare_kernel_launch(ctx_token: u64) -> i32 {
    let client = Client::get(real_driver);
    if let Err(e) = client.gate.await_lock() {
        error!("await_lock failed before kernel launch: {}", e);
        return -1;
    }
    let ctx = DeviceContext(ctx_token);
    if let Err(code) = client.rate.on_kernel_launched(client.driver.as_ref(), ctx) {
        warn!("submission-rate controller's post-launch sync failed: {:?}", code);
    }
    0
}

/// Hooks all six `device_memcpy` variants (§6): host-to-device, device-to-host, device-to-device,
/// each synchronous and asynchronous. Gated, since pages may need to move while the device
/// executes other work (§4.6).
#[no_mangle]
pub extern "C" fn gpushare_device_memcpy(ctx_token: u64, _dst: u64, _src: u64, _size: u64) -> i32 {
    let client = Client::get(real_driver);
    if let Err(e) = client.gate.await_lock() {
        error!("await_lock failed before memcpy: {}", e);
        return -1;
    }
    let _ctx = DeviceContext(ctx_token);
    0
}

/// Hooks memory allocation (§4.6, §6). Not gated — allocations are explicitly excluded from
/// `await_lock`. Rerouted through the memory shim, which itself reroutes to the driver's
/// managed-allocation entry point.
#[no_mangle]
pub extern "C" fn gpushare_memory_allocate(ctx_token: u64, size: u64, out_ptr: *mut u64) -> i32 {
    let client = Client::get(real_driver);
    let ctx = DeviceContext(ctx_token);
    match client.mem.alloc(client.driver.as_ref(), ctx, size) {
        Ok(DevicePtr(ptr)) => {
            if !out_ptr.is_null() {
                // Safety: `out_ptr` is the caller-supplied output slot, matching the real driver's
                // own allocate-entry-point convention; this hook never dereferences it otherwise.
                unsafe { *out_ptr = ptr };
            }
            0
        }
        Err(code) => code,
    }
}

/// Hooks memory free (§4.6, §6). Not gated.
#[no_mangle]
pub extern "C" fn gpushare_memory_free(ctx_token: u64, ptr: u64) -> i32 {
    let client = Client::get(real_driver);
    let ctx = DeviceContext(ctx_token);
    match client.mem.free(client.driver.as_ref(), ctx, DevicePtr(ptr)) {
        Ok(()) => 0,
        Err(code) => code,
    }
}

/// Hooks memory-info queries (§4.6, §6). Not gated. Overwrites the real driver's reported free
/// bytes with the reserve-adjusted figure.
#[no_mangle]
pub extern "C" fn gpushare_memory_get_info(ctx_token: u64, out_free: *mut u64, out_total: *mut u64) -> i32 {
    let client = Client::get(real_driver);
    let ctx = DeviceContext(ctx_token);
    match client.mem.get_info(client.driver.as_ref(), ctx) {
        Ok(info) => {
            // Safety: both output slots are caller-supplied, matching the real driver's
            // get-info convention.
            unsafe {
                if !out_free.is_null() {
                    *out_free = info.free_bytes;
                }
                if !out_total.is_null() {
                    *out_total = info.total_bytes;
                }
            }
            0
        }
        Err(e) => {
            error!("memory_get_info failed: {}", e);
            OUT_OF_MEMORY
        }
    }
}

/// Hooks driver initialization (§6). Not gated; merely ensures the process-wide client singleton
/// (and therefore the real driver) has been initialized.
#[no_mangle]
pub extern "C" fn gpushare_driver_init() -> i32 {
    let _client = Client::get(real_driver);
    0
}
