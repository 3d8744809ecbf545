// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small system utility modules shared by the scheduler daemon, the injected client, and the CLI:
//! an errno-backed `Result`, owned-descriptor wrappers, and a level-triggered epoll wrapper for
//! the daemon's single-threaded event loop.

pub mod descriptor;
pub mod errno;
pub mod wait_context;

pub use descriptor::AsRawDescriptor;
pub use descriptor::FromRawDescriptor;
pub use descriptor::IntoRawDescriptor;
pub use descriptor::RawDescriptor;
pub use descriptor::SafeDescriptor;
pub use errno::errno_result;
pub use errno::Error;
pub use errno::Result;
pub use wait_context::EventToken;
pub use wait_context::EventType;
pub use wait_context::TriggeredEvent;
pub use wait_context::WaitContext;
