// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The scheduler's protocol state machine: client table, FCFS request queue, and the dispatch
//! logic for every inbound message type. Held behind one mutex shared by the event loop thread
//! and the time-quantum timer thread (`daemon::Daemon`).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use gpu_sched_proto::try_send_message_nonblocking;
use gpu_sched_proto::Message;
use gpu_sched_proto::MessageType;
use gpu_sched_proto::UNREGISTERED_ID;
use log::info;
use log::warn;

pub struct ClientRecord {
    pub stream: UnixStream,
    pub id: u64,
    pub pod_name: String,
    pub pod_namespace: String,
}

impl ClientRecord {
    fn new(stream: UnixStream) -> ClientRecord {
        ClientRecord {
            stream,
            id: UNREGISTERED_ID,
            pod_name: String::new(),
            pod_namespace: String::new(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.id != UNREGISTERED_ID
    }

    pub fn id_str(&self) -> String {
        if self.is_registered() {
            format!("{:016x}", self.id)
        } else {
            "<unregistered>".to_string()
        }
    }
}

/// Everything the scheduler protocol mutates. One instance, wrapped in `sync::Mutex` by the
/// caller, shared between the event loop and the timer thread.
pub struct SchedulerState {
    pub clients: HashMap<RawFd, ClientRecord>,
    pub requests: VecDeque<RawFd>,
    pub scheduler_on: bool,
    pub quantum: Duration,
    pub lock_held: bool,
    pub scheduling_round: u64,
    pub drop_lock_sent: bool,
    pub must_reset_timer: bool,
}

impl SchedulerState {
    pub fn new(scheduler_on: bool, quantum: Duration) -> SchedulerState {
        SchedulerState {
            clients: HashMap::new(),
            requests: VecDeque::new(),
            scheduler_on,
            quantum,
            lock_held: false,
            scheduling_round: 0,
            drop_lock_sent: false,
            must_reset_timer: false,
        }
    }

    pub fn accept_client(&mut self, fd: RawFd, stream: UnixStream) {
        self.clients.insert(fd, ClientRecord::new(stream));
    }

    /// Removes `fd`'s client record and any pending request for it. If `fd` was the current lock
    /// holder (head of the request queue), clears `lock_held` unconditionally, matching the
    /// original's `remove_req` semantics (set before the record is gone, regardless of whether the
    /// lock was actually held yet).
    pub fn evict(&mut self, fd: RawFd) -> Option<ClientRecord> {
        if self.requests.front() == Some(&fd) {
            self.lock_held = false;
        }
        self.requests.retain(|&f| f != fd);
        let removed = self.clients.remove(&fd);
        if let Some(c) = &removed {
            info!("removing client {}", c.id_str());
        }
        removed
    }

    /// Attempts to hand the lock to the head of the request queue, evicting any client whose send
    /// fails and moving on to the next head until one succeeds or the queue empties. Returns the
    /// clients evicted along the way so the caller can also drop their epoll registrations.
    pub fn try_schedule(&mut self) -> Vec<ClientRecord> {
        let mut evicted = Vec::new();
        loop {
            let fd = match self.requests.front() {
                Some(&fd) => fd,
                None => {
                    return evicted;
                }
            };
            let send_result = match self.clients.get_mut(&fd) {
                Some(client) => {
                    let msg = Message::new(MessageType::LockOk).with_id(client.id);
                    try_send_message_nonblocking(&mut client.stream, &msg)
                }
                None => {
                    // Stale request entry with no matching client; drop it and keep going.
                    self.requests.pop_front();
                    continue;
                }
            };
            match send_result {
                Ok(()) => {
                    self.scheduling_round += 1;
                    self.lock_held = true;
                    self.must_reset_timer = true;
                    return evicted;
                }
                Err(_) => {
                    if let Some(c) = self.evict(fd) {
                        evicted.push(c);
                    }
                }
            }
        }
    }

    /// Handles `REGISTER`: assigns a fresh id (rejecting the sentinel and any live collision),
    /// records pod identity, and replies with the current scheduler on/off state plus the new id
    /// hex-encoded in the reply's `data` field.
    pub fn register(&mut self, fd: RawFd, pod_name: String, pod_namespace: String) -> bool {
        let already_registered = match self.clients.get(&fd) {
            Some(c) => c.is_registered(),
            None => return false,
        };
        if already_registered {
            warn!("client on fd {} is already registered", fd);
            return false;
        }

        let mut id = gpu_sched_proto::generate_id();
        while self.clients.values().any(|c| c.id == id) {
            id = gpu_sched_proto::generate_id();
        }

        let reply_type = if self.scheduler_on {
            MessageType::SchedOn
        } else {
            MessageType::SchedOff
        };
        let reply = Message::new(reply_type)
            .with_id(id)
            .with_data(format!("{:016x}", id));

        let client = self.clients.get_mut(&fd).expect("checked above");
        let sent = try_send_message_nonblocking(&mut client.stream, &reply).is_ok();
        if sent {
            client.id = id;
            client.pod_name = pod_name;
            client.pod_namespace = pod_namespace;
            info!(
                "registered client {} (pod {}/{})",
                client.id_str(),
                client.pod_name,
                client.pod_namespace
            );
        }
        sent
    }

    /// `REQ_LOCK`: append to the request queue (deduping on fd) and try to schedule if the lock is
    /// free. A no-op while the scheduler is off.
    pub fn req_lock(&mut self, fd: RawFd) -> Vec<ClientRecord> {
        if !self.scheduler_on {
            return Vec::new();
        }
        if self.requests.contains(&fd) {
            warn!("client on fd {} already has a pending request", fd);
            return Vec::new();
        }
        self.requests.push_back(fd);
        if !self.lock_held {
            self.try_schedule()
        } else {
            Vec::new()
        }
    }

    /// `LOCK_RELEASED`: remove this client's request record (clearing `lock_held` if it was head)
    /// and try to schedule the next one. A no-op while the scheduler is off.
    pub fn lock_released(&mut self, fd: RawFd) -> Vec<ClientRecord> {
        if !self.scheduler_on {
            return Vec::new();
        }
        if self.requests.front() == Some(&fd) {
            self.lock_held = false;
        }
        self.requests.retain(|&f| f != fd);
        if !self.lock_held {
            self.try_schedule()
        } else {
            Vec::new()
        }
    }

    /// `SET_TQ`: parse `data` as a signed decimal. Any parseable value is accepted verbatim,
    /// including non-positive ones — the CLI is the only thing expected to validate positivity
    /// before sending (see the daemon crate's design notes on this).
    pub fn set_tq(&mut self, data: &str) -> bool {
        match data.trim().parse::<i64>() {
            Ok(secs) => {
                self.quantum = Duration::from_secs(secs.max(0) as u64);
                self.must_reset_timer = true;
                info!("time quantum changed to {}s", secs);
                true
            }
            Err(_) => {
                warn!("failed to parse SET_TQ value {:?}", data);
                false
            }
        }
    }

    /// `SCHED_ON`/`SCHED_OFF` from the CLI. Returns the list of currently-registered clients that
    /// should be sent the status broadcast, or `None` if the state did not actually change (a
    /// redundant on-while-on or off-while-off is a no-op, matching the source).
    pub fn set_scheduler_on(&mut self, on: bool) -> Option<Vec<RawFd>> {
        if self.scheduler_on == on {
            return None;
        }
        self.scheduler_on = on;
        if !on {
            self.requests.clear();
            self.lock_held = false;
        }
        Some(
            self.clients
                .iter()
                .filter(|(_, c)| c.is_registered())
                .map(|(&fd, _)| fd)
                .collect(),
        )
    }

    pub fn broadcast_status(&mut self, fds: &[RawFd]) -> Vec<ClientRecord> {
        let reply_type = if self.scheduler_on {
            MessageType::SchedOn
        } else {
            MessageType::SchedOff
        };
        let mut evicted = Vec::new();
        for &fd in fds {
            let send_result = match self.clients.get_mut(&fd) {
                Some(client) => {
                    let msg = Message::new(reply_type).with_id(client.id);
                    try_send_message_nonblocking(&mut client.stream, &msg)
                }
                None => continue,
            };
            if send_result.is_err() {
                if let Some(c) = self.evict(fd) {
                    evicted.push(c);
                }
            }
        }
        evicted
    }
}
