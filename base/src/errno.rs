// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A minimal errno-backed error type, in the same spirit as the upstream `base` crate's own
//! `errno` module: most of this codebase's syscalls are thin libc wrappers, and callers generally
//! want the raw `errno` value rather than a `std::io::Error` (which allocates a `backtrace`-style
//! string on platforms that support it).

use std::fmt;
use std::io;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error(i32);

impl Error {
    /// Constructs a new error from a raw errno value.
    pub fn new(errno: i32) -> Error {
        Error(errno)
    }

    /// Returns the last error raised by a libc call on this thread, as captured by `errno`.
    pub fn last() -> Error {
        Error(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Raw errno value of this error.
    pub fn errno(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "errno {} ({})", self.0, io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        io::Error::from_raw_os_error(e.0)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns `Err(Error::last())`, for use as the tail expression of a syscall wrapper.
pub fn errno_result<T>() -> Result<T> {
    Err(Error::last())
}

/// Retries `$e` while it fails with `EINTR`. Mirrors the `RETRY_INTR` macro used throughout the
/// originating C implementation: blocking syscalls are always retried transparently, since signal
/// interruption is not a real failure (see error handling design, category 3).
#[macro_export]
macro_rules! handle_eintr_errno {
    ($e:expr) => {{
        loop {
            match $e {
                -1 if $crate::errno::Error::last().errno() == libc::EINTR => continue,
                res => break res,
            }
        }
    }};
}
