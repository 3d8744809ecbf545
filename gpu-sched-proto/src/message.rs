// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The fixed-size framed message exchanged between the scheduler daemon, clients, and the CLI.
//!
//! There is no length prefix and no escaping: every message is exactly [`FRAME_SIZE`] bytes on the
//! wire, so a reader always knows exactly how much to read, and a short read unambiguously means
//! the peer died mid-frame (see the transport's partial-read handling).

use std::mem;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Maximum length of a pod name/namespace, not counting the NUL terminator.
pub const POD_NAME_LEN_MAX: usize = 254;
pub const POD_NAMESPACE_LEN_MAX: usize = 254;

/// The `data` field must comfortably hold 16 hex characters plus a NUL terminator (the client id
/// `REGISTER` echoes back), or a decimal `SET_TQ` value.
pub const MSG_DATA_LEN: usize = 20;

/// Sentinel id for a client record that has connected but not yet completed `REGISTER`.
pub const UNREGISTERED_ID: u64 = 0xF00D_F00D_F00D_F00D;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    Register = 1,
    SchedOn = 2,
    SchedOff = 3,
    ReqLock = 4,
    LockOk = 5,
    DropLock = 6,
    LockReleased = 7,
    SetTq = 8,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<MessageType> {
        use MessageType::*;
        Some(match v {
            1 => Register,
            2 => SchedOn,
            3 => SchedOff,
            4 => ReqLock,
            5 => LockOk,
            6 => DropLock,
            7 => LockReleased,
            8 => SetTq,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            MessageType::Register => "REGISTER",
            MessageType::SchedOn => "SCHED_ON",
            MessageType::SchedOff => "SCHED_OFF",
            MessageType::ReqLock => "REQ_LOCK",
            MessageType::LockOk => "LOCK_OK",
            MessageType::DropLock => "DROP_LOCK",
            MessageType::LockReleased => "LOCK_RELEASED",
            MessageType::SetTq => "SET_TQ",
        };
        f.write_str(s)
    }
}

/// On-wire layout. `packed` is load-bearing: this must match byte-for-byte between every process
/// that speaks the protocol, with no compiler-inserted padding.
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C, packed)]
struct WireMessage {
    msg_type: u8,
    pod_name: [u8; POD_NAME_LEN_MAX],
    pod_namespace: [u8; POD_NAMESPACE_LEN_MAX],
    id: u64,
    data: [u8; MSG_DATA_LEN],
}

pub const FRAME_SIZE: usize = mem::size_of::<WireMessage>();

/// An in-memory, ergonomic view of a [`FRAME_SIZE`]-byte frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub msg_type: MessageType,
    pub pod_name: String,
    pub pod_namespace: String,
    pub id: u64,
    pub data: String,
}

fn zero_pad(s: &str, buf: &mut [u8]) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in &mut buf[n..] {
        *b = 0;
    }
}

fn read_nul_padded(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl Message {
    pub fn new(msg_type: MessageType) -> Message {
        Message {
            msg_type,
            pod_name: String::new(),
            pod_namespace: String::new(),
            id: 0,
            data: String::new(),
        }
    }

    pub fn with_id(mut self, id: u64) -> Message {
        self.id = id;
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Message {
        self.data = data.into();
        self
    }

    pub fn with_pod(mut self, pod_name: impl Into<String>, pod_namespace: impl Into<String>) -> Message {
        self.pod_name = pod_name.into();
        self.pod_namespace = pod_namespace.into();
        self
    }

    /// Encodes this message into a fresh [`FRAME_SIZE`]-byte buffer.
    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        let mut wire = WireMessage::new_zeroed();
        wire.msg_type = self.msg_type as u8;
        zero_pad(&self.pod_name, &mut wire.pod_name);
        zero_pad(&self.pod_namespace, &mut wire.pod_namespace);
        wire.id = self.id;
        zero_pad(&self.data, &mut wire.data);

        let mut out = [0u8; FRAME_SIZE];
        out.copy_from_slice(wire.as_bytes());
        out
    }

    /// Decodes a [`FRAME_SIZE`]-byte buffer. Fails only if the leading `type` byte is not one of
    /// the eight known message types; every other byte pattern decodes (possibly to empty
    /// strings), matching the permissive framing the daemon and client both rely on.
    pub fn from_bytes(buf: &[u8; FRAME_SIZE]) -> Option<Message> {
        let wire = WireMessage::read_from(buf.as_slice())?;
        let msg_type = MessageType::from_u8(wire.msg_type)?;
        Some(Message {
            msg_type,
            pod_name: read_nul_padded(&wire.pod_name),
            pod_namespace: read_nul_padded(&wire.pod_namespace),
            id: wire.id,
            data: read_nul_padded(&wire.data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_message() {
        let msg = Message::new(MessageType::ReqLock).with_id(42);
        let bytes = msg.to_bytes();
        let decoded = Message::from_bytes(&bytes).expect("decodes");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips_max_length_pod_identity() {
        let long_name = "a".repeat(POD_NAME_LEN_MAX);
        let long_ns = "b".repeat(POD_NAMESPACE_LEN_MAX);
        let msg = Message::new(MessageType::Register).with_pod(long_name.clone(), long_ns.clone());
        let decoded = Message::from_bytes(&msg.to_bytes()).expect("decodes");
        assert_eq!(decoded.pod_name, long_name);
        assert_eq!(decoded.pod_namespace, long_ns);
    }

    #[test]
    fn truncates_overlong_strings_instead_of_panicking() {
        let too_long = "x".repeat(POD_NAME_LEN_MAX + 50);
        let msg = Message::new(MessageType::Register).with_pod(too_long, "");
        let decoded = Message::from_bytes(&msg.to_bytes()).expect("decodes");
        assert_eq!(decoded.pod_name.len(), POD_NAME_LEN_MAX);
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut bytes = [0u8; FRAME_SIZE];
        bytes[0] = 0xFF;
        assert!(Message::from_bytes(&bytes).is_none());
    }

    #[test]
    fn register_reply_data_round_trips_as_hex_id() {
        let id: u64 = 0xdead_beef_1234_5678;
        let msg = Message::new(MessageType::SchedOn).with_data(format!("{:016x}", id));
        let decoded = Message::from_bytes(&msg.to_bytes()).expect("decodes");
        let parsed = u64::from_str_radix(&decoded.data, 16).expect("parses as hex");
        assert_eq!(parsed, id);
    }
}
