// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The client's single persistent connection to the scheduler daemon. Reads happen exclusively on
//! the background worker thread (`worker::run`); writes are shared by the gate (`REQ_LOCK`), the
//! idle releaser (`LOCK_RELEASED`), and the worker itself (`LOCK_RELEASED` in reply to
//! `DROP_LOCK`), so the write half is guarded by its own mutex independent of the gate mutex.

use std::io;
use std::os::unix::net::UnixStream;

use gpu_sched_proto::Message;

pub struct Conn {
    write_half: sync::Mutex<UnixStream>,
}

impl Conn {
    pub fn new(write_half: UnixStream) -> Conn {
        Conn {
            write_half: sync::Mutex::new(write_half),
        }
    }

    pub fn send(&self, msg: &Message) -> io::Result<()> {
        let mut stream = self.write_half.lock();
        gpu_sched_proto::send_message(&mut stream, msg)
    }
}
