// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end tests driving a real `Daemon` over real Unix sockets: one listener thread, one timer
//! thread, and one or more client connections dialed in from the test itself. No mocking of the
//! transport or protocol layer.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gpu_sched_daemon::server::Daemon;
use gpu_sched_daemon::state::SchedulerState;
use gpu_sched_proto::receive_message;
use gpu_sched_proto::send_message;
use gpu_sched_proto::Message;
use gpu_sched_proto::MessageType;
use sync::Mutex;

fn start_daemon(quantum: Duration) -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    // Leak the tempdir so it outlives the daemon thread spawned below; these are short-lived test
    // processes, not long-running services, so the scratch directory is cleaned up by the OS.
    let dir = Box::leak(Box::new(dir));
    let path = dir.path().join("scheduler.sock");

    let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
    listener.set_nonblocking(true).unwrap();

    let state = Arc::new(Mutex::new(SchedulerState::new(true, quantum)));
    let mut daemon = Daemon::new(listener, state).unwrap();
    let _timer = daemon.spawn_timer_thread();
    thread::spawn(move || daemon.run());

    // Give the event loop thread a moment to enter its wait.
    thread::sleep(Duration::from_millis(20));
    path
}

fn register(stream: &mut UnixStream) -> Message {
    send_message(stream, &Message::new(MessageType::Register).with_pod("none", "none")).unwrap();
    receive_message(stream).unwrap().unwrap()
}

#[test]
fn single_client_gets_the_lock_and_is_preempted_after_one_quantum() {
    let path = start_daemon(Duration::from_millis(200));
    let mut client = UnixStream::connect(&path).unwrap();
    let reply = register(&mut client);
    assert_eq!(reply.msg_type, MessageType::SchedOn);

    send_message(&mut client, &Message::new(MessageType::ReqLock)).unwrap();
    client.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let lock_ok = receive_message(&mut client).unwrap().unwrap();
    assert_eq!(lock_ok.msg_type, MessageType::LockOk);

    client.set_read_timeout(Some(Duration::from_millis(800))).unwrap();
    let drop_lock = receive_message(&mut client).unwrap().unwrap();
    assert_eq!(drop_lock.msg_type, MessageType::DropLock);

    send_message(&mut client, &Message::new(MessageType::LockReleased)).unwrap();
}

#[test]
fn second_requester_waits_fcfs_behind_the_first() {
    let path = start_daemon(Duration::from_millis(150));

    let mut a = UnixStream::connect(&path).unwrap();
    register(&mut a);
    send_message(&mut a, &Message::new(MessageType::ReqLock)).unwrap();
    a.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(receive_message(&mut a).unwrap().unwrap().msg_type, MessageType::LockOk);

    let mut b = UnixStream::connect(&path).unwrap();
    register(&mut b);
    send_message(&mut b, &Message::new(MessageType::ReqLock)).unwrap();
    // B must not receive anything while A holds the lock.
    b.set_read_timeout(Some(Duration::from_millis(80))).unwrap();
    let err = receive_message(&mut b).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

    // A's quantum expires; it drains and releases.
    a.set_read_timeout(Some(Duration::from_millis(800))).unwrap();
    assert_eq!(receive_message(&mut a).unwrap().unwrap().msg_type, MessageType::DropLock);
    send_message(&mut a, &Message::new(MessageType::LockReleased)).unwrap();

    // B should now get the lock promptly.
    b.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    assert_eq!(receive_message(&mut b).unwrap().unwrap().msg_type, MessageType::LockOk);
}

#[test]
fn sched_off_broadcasts_and_empties_the_queue() {
    let path = start_daemon(Duration::from_secs(30));

    let mut a = UnixStream::connect(&path).unwrap();
    register(&mut a);
    send_message(&mut a, &Message::new(MessageType::ReqLock)).unwrap();
    a.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(receive_message(&mut a).unwrap().unwrap().msg_type, MessageType::LockOk);

    let mut ctl = UnixStream::connect(&path).unwrap();
    send_message(&mut ctl, &Message::new(MessageType::SchedOff)).unwrap();

    a.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    assert_eq!(receive_message(&mut a).unwrap().unwrap().msg_type, MessageType::SchedOff);
}

#[test]
fn dead_peer_eviction_promotes_the_next_queued_client() {
    let path = start_daemon(Duration::from_secs(30));

    let mut a = UnixStream::connect(&path).unwrap();
    register(&mut a);
    send_message(&mut a, &Message::new(MessageType::ReqLock)).unwrap();
    a.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(receive_message(&mut a).unwrap().unwrap().msg_type, MessageType::LockOk);

    let mut b = UnixStream::connect(&path).unwrap();
    register(&mut b);
    send_message(&mut b, &Message::new(MessageType::ReqLock)).unwrap();

    drop(a);

    b.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    assert_eq!(receive_message(&mut b).unwrap().unwrap().msg_type, MessageType::LockOk);
}
