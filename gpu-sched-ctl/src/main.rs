// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `gpusharectl`: a transient CLI that opens one connection to the scheduler daemon, sends a
//! single control message, and closes (§4.8, §6). All scheduler-mutating inputs are validated here
//! before they ever reach the wire — the daemon itself trusts a well-formed `SET_TQ` value
//! verbatim (§9 open questions).

mod error;

use std::os::unix::net::UnixStream;

use argh::FromArgs;
use error::Error;
use error::Result;
use gpu_sched_proto::Message;
use gpu_sched_proto::MessageType;

/// Configure the running gpushare-scheduler daemon.
#[derive(FromArgs)]
struct Args {
    /// set the time quantum, in seconds (must be positive)
    #[argh(option, short = 'T')]
    set_tq: Option<i64>,

    /// turn anti-thrash scheduling on or off ("on"/"off")
    #[argh(option, short = 'S')]
    anti_thrash: Option<String>,
}

fn connect() -> Result<UnixStream> {
    let path = gpu_sched_proto::socket_path();
    UnixStream::connect(&path).map_err(|source| Error::Connect { path, source })
}

fn send_and_close(msg: &Message, msg_type: &'static str) -> Result<()> {
    let mut stream = connect()?;
    gpu_sched_proto::send_message(&mut stream, msg).map_err(|source| Error::Send { msg_type, source })
}

fn set_tq(quantum_secs: i64) -> Result<()> {
    if quantum_secs <= 0 {
        return Err(Error::NonPositiveQuantum(quantum_secs));
    }
    let msg = Message::new(MessageType::SetTq).with_data(quantum_secs.to_string());
    send_and_close(&msg, "SET_TQ")
}

fn anti_thrash(value: &str) -> Result<()> {
    let msg_type = match value {
        "on" => MessageType::SchedOn,
        "off" => MessageType::SchedOff,
        _ => return Err(Error::InvalidAntiThrashValue(value.to_string())),
    };
    send_and_close(&Message::new(msg_type), "SCHED_ON/SCHED_OFF")
}

fn run(args: Args) -> Result<()> {
    match (args.set_tq, args.anti_thrash) {
        (Some(_), Some(_)) => Err(Error::ConflictingActions),
        (Some(quantum), None) => set_tq(quantum),
        (None, Some(value)) => anti_thrash(&value),
        (None, None) => Err(Error::NoAction),
    }
}

fn main() {
    let args: Args = argh::from_env();
    if let Err(e) = run(args) {
        eprintln!("gpusharectl: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;
    use std::thread;

    use gpu_sched_proto::receive_message;

    use super::*;

    #[test]
    fn rejects_non_positive_quantum_without_touching_the_network() {
        let err = set_tq(0).unwrap_err();
        assert!(matches!(err, Error::NonPositiveQuantum(0)));
        let err = set_tq(-5).unwrap_err();
        assert!(matches!(err, Error::NonPositiveQuantum(-5)));
    }

    #[test]
    fn rejects_unknown_anti_thrash_value() {
        let err = anti_thrash("maybe").unwrap_err();
        assert!(matches!(err, Error::InvalidAntiThrashValue(_)));
    }

    #[test]
    fn run_rejects_when_both_or_neither_action_given() {
        assert!(matches!(
            run(Args { set_tq: Some(5), anti_thrash: Some("on".into()) }),
            Err(Error::ConflictingActions)
        ));
        assert!(matches!(run(Args { set_tq: None, anti_thrash: None }), Err(Error::NoAction)));
    }

    // `GPUSHARE_SOCK_DIR` is process-wide state; serialize tests that touch it so they don't
    // stomp on each other when `cargo test` runs them on separate threads.
    static ENV_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn set_tq_sends_the_decimal_quantum_over_the_socket() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.sock");
        std::env::set_var("GPUSHARE_SOCK_DIR", dir.path());
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let msg = receive_message(&mut stream).unwrap().unwrap();
            assert_eq!(msg.msg_type, MessageType::SetTq);
            assert_eq!(msg.data, "5");
        });

        set_tq(5).unwrap();
        server.join().unwrap();
        std::env::remove_var("GPUSHARE_SOCK_DIR");
    }
}
