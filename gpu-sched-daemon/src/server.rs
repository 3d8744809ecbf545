// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The daemon's two threads: the single-threaded event loop over the listening socket and all
//! client connections, and the time-quantum timer. Both share one `sync::Mutex<SchedulerState>`.

use std::os::unix::io::RawFd;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::thread;

use base::AsRawDescriptor;
use base::EventToken;
use base::WaitContext;
use gpu_sched_proto::Message;
use gpu_sched_proto::MessageType;
use gpu_sched_proto::RecvOutcome;
use log::debug;
use log::error;
use log::info;
use log::warn;
use sync::Condvar;
use sync::Mutex;

use crate::error::Error;
use crate::error::Result;
use crate::state::ClientRecord;
use crate::state::SchedulerState;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Token {
    Listener,
    Client(RawFd),
}

impl EventToken for Token {
    fn as_raw_token(&self) -> u64 {
        match self {
            Token::Listener => u64::MAX,
            Token::Client(fd) => *fd as u64,
        }
    }

    fn from_raw_token(data: u64) -> Self {
        if data == u64::MAX {
            Token::Listener
        } else {
            Token::Client(data as RawFd)
        }
    }
}

pub struct Daemon {
    listener: UnixListener,
    wait_ctx: WaitContext<Token>,
    state: Arc<Mutex<SchedulerState>>,
    timer_cv: Arc<Condvar>,
}

impl Daemon {
    pub fn new(listener: UnixListener, state: Arc<Mutex<SchedulerState>>) -> Result<Daemon> {
        listener.set_nonblocking(true).map_err(Error::SetNonblocking)?;
        let wait_ctx = WaitContext::new().map_err(Error::WaitContext)?;
        wait_ctx
            .add(&listener, Token::Listener)
            .map_err(Error::WaitContext)?;
        Ok(Daemon {
            listener,
            wait_ctx,
            state,
            timer_cv: Arc::new(Condvar::new()),
        })
    }

    pub fn timer_cv(&self) -> Arc<Condvar> {
        self.timer_cv.clone()
    }

    pub fn state(&self) -> Arc<Mutex<SchedulerState>> {
        self.state.clone()
    }

    /// Spawns the time-quantum timer thread and returns its handle. The thread runs until the
    /// process exits; the daemon has no graceful-shutdown path (§5: cancellation is not supported,
    /// the daemon dies by signal).
    pub fn spawn_timer_thread(&self) -> thread::JoinHandle<()> {
        let state = self.state.clone();
        let timer_cv = self.timer_cv.clone();
        thread::spawn(move || crate::timer::run(state, timer_cv))
    }

    /// Runs the event loop forever. Never returns under normal operation.
    pub fn run(&mut self) -> ! {
        loop {
            let events = match self.wait_ctx.wait() {
                Ok(events) => events,
                Err(e) => {
                    error!("epoll wait failed: {}", e);
                    std::process::exit(1);
                }
            };

            let mut state = self.state.lock();
            for event in events {
                match event.token {
                    Token::Listener => self.accept_one(&mut state),
                    Token::Client(fd) => self.service_client(&mut state, fd, event.is_hungup),
                }
            }
            drop(state);
        }
    }

    fn accept_one(&self, state: &mut SchedulerState) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("failed to set accepted socket non-blocking: {}", e);
                        continue;
                    }
                    let fd = stream.as_raw_descriptor();
                    if let Err(e) = self.wait_ctx.add(&stream, Token::Client(fd)) {
                        warn!("failed to register new client fd {} with epoll: {}", fd, e);
                        continue;
                    }
                    state.accept_client(fd, stream);
                    debug!("accepted new client on fd {}", fd);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept() failed: {}", e);
                    break;
                }
            }
        }
    }

    fn service_client(&self, state: &mut SchedulerState, fd: RawFd, hungup: bool) {
        // Check for a pending message before checking for errors/hangup: gpusharectl sends one
        // control message and immediately closes its end, so a level-triggered epoll often reports
        // EPOLLIN and EPOLLHUP on the same event. Dispatching the message first means a
        // send-then-close peer is still served instead of silently evicted.
        let outcome = match state.clients.get_mut(&fd) {
            Some(client) => {
                gpu_sched_proto::try_receive_message_nonblocking(&mut client.stream)
            }
            None => return,
        };

        match outcome {
            Ok(RecvOutcome::Message(msg)) => self.dispatch(state, fd, msg),
            Ok(RecvOutcome::WouldBlock) => {
                if hungup {
                    self.evict(state, fd);
                }
            }
            Ok(RecvOutcome::Closed) | Ok(RecvOutcome::Dead) => self.evict(state, fd),
            Err(e) => {
                warn!("read error from client on fd {}: {}", fd, e);
                self.evict(state, fd);
            }
        }
    }

    fn dispatch(&self, state: &mut SchedulerState, fd: RawFd, msg: Message) {
        let is_registered = state.clients.get(&fd).map(|c| c.is_registered()).unwrap_or(false);
        debug!("received {} from fd {}", msg.msg_type, fd);

        let evicted = match msg.msg_type {
            MessageType::Register => {
                if !state.register(fd, msg.pod_name, msg.pod_namespace) {
                    self.evict(state, fd);
                }
                Vec::new()
            }
            MessageType::ReqLock => {
                if is_registered {
                    state.req_lock(fd)
                } else {
                    self.evict(state, fd);
                    Vec::new()
                }
            }
            MessageType::LockReleased => {
                if is_registered {
                    state.lock_released(fd)
                } else {
                    self.evict(state, fd);
                    Vec::new()
                }
            }
            MessageType::SetTq => {
                if state.set_tq(&msg.data) {
                    self.timer_cv.notify_all();
                }
                Vec::new()
            }
            MessageType::SchedOn => self.broadcast_if_changed(state, true),
            MessageType::SchedOff => self.broadcast_if_changed(state, false),
            MessageType::LockOk | MessageType::DropLock => {
                info!("ignoring client-originated {} on fd {}", msg.msg_type, fd);
                Vec::new()
            }
        };

        for client in evicted {
            self.unregister_fd(client);
        }
        if state.must_reset_timer {
            self.timer_cv.notify_all();
        }
    }

    fn broadcast_if_changed(&self, state: &mut SchedulerState, on: bool) -> Vec<ClientRecord> {
        match state.set_scheduler_on(on) {
            Some(fds) => state.broadcast_status(&fds),
            None => Vec::new(),
        }
    }

    fn evict(&self, state: &mut SchedulerState, fd: RawFd) {
        if let Some(client) = state.evict(fd) {
            self.unregister_fd(client);
            let evicted = state.try_schedule();
            for c in evicted {
                self.unregister_fd(c);
            }
            if state.must_reset_timer {
                self.timer_cv.notify_all();
            }
        }
    }

    fn unregister_fd(&self, client: ClientRecord) {
        if let Err(e) = self.wait_ctx.delete(&client.stream) {
            debug!("epoll delete failed (fd likely already gone): {}", e);
        }
        // `client.stream` (a `UnixStream`) drops here, closing the fd.
    }
}
