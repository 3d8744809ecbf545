// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::IntoRawFd;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;

pub type RawDescriptor = RawFd;

pub trait AsRawDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor;
}

/// # Safety
/// Implementors must guarantee that the returned descriptor is valid for as long as `self` is not
/// dropped and that ownership is transferred to the caller.
pub unsafe trait FromRawDescriptor {
    /// # Safety
    /// `descriptor` must be a valid, open, uniquely-owned file descriptor.
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self;
}

pub trait IntoRawDescriptor {
    fn into_raw_descriptor(self) -> RawDescriptor;
}

impl AsRawDescriptor for File {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}

impl AsRawDescriptor for UnixListener {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}

impl AsRawDescriptor for UnixStream {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}

/// An owned file descriptor that closes on drop, with no knowledge of what kind of file it backs.
/// Used the same way crosvm's `SafeDescriptor` is: as the common currency type for "some fd I own"
/// when the call site doesn't care whether it is a socket, an eventfd, or a plain file.
#[derive(Debug)]
pub struct SafeDescriptor {
    descriptor: RawDescriptor,
}

impl AsRawDescriptor for SafeDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.descriptor
    }
}

unsafe impl FromRawDescriptor for SafeDescriptor {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self {
        SafeDescriptor { descriptor }
    }
}

impl IntoRawDescriptor for SafeDescriptor {
    fn into_raw_descriptor(mut self) -> RawDescriptor {
        let descriptor = self.descriptor;
        self.descriptor = -1;
        descriptor
    }
}

impl Drop for SafeDescriptor {
    fn drop(&mut self) {
        if self.descriptor >= 0 {
            // SAFETY: `descriptor` is uniquely owned by this struct and is only ever a valid,
            // open fd (or the sentinel -1 after `into_raw_descriptor`).
            let ret = unsafe { libc::close(self.descriptor) };
            if ret < 0 {
                log::warn!("failed to close fd {}: {}", self.descriptor, crate::errno::Error::last());
            }
        }
    }
}

impl From<File> for SafeDescriptor {
    fn from(f: File) -> Self {
        // SAFETY: `f.into_raw_fd()` yields a uniquely-owned, open fd.
        unsafe { SafeDescriptor::from_raw_descriptor(f.into_raw_fd()) }
    }
}
