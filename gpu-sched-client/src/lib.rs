// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `libgpushare_client`: the in-process library injected into each GPU-using application (§1).
//! Transparently blocks work-submission calls while its process does not hold the GPU lock, adapts
//! its submission rate to bound preemption latency, and reports free device memory adjusted for a
//! fixed reserve under cooperative oversubscription.
//!
//! The actual symbol-interposition mechanism that gets this library loaded into a target process
//! ahead of the real driver is an external collaborator (§1, §9) and lives outside this crate; see
//! [`ffi`] for the exported hooks it would redirect into.

pub mod client;
pub mod conn;
pub mod config;
pub mod driver;
pub mod error;
pub mod ffi;
pub mod gate;
pub mod idle;
pub mod memory;
pub mod rate;
pub mod worker;

pub use client::Client;
pub use config::ClientConfig;
pub use error::Error;
pub use error::Result;
pub use gate::Gate;
pub use memory::MemoryShim;
pub use rate::RateController;
