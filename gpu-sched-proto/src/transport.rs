// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Socket path resolution and the blocking read/write-loop helpers shared by every component that
//! speaks the wire protocol (the daemon, the injected client, and the CLI).

use std::env;
use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;

use crate::message::Message;
use crate::message::FRAME_SIZE;

pub const DEFAULT_SOCK_DIR: &str = "/var/run/gpushare";
const SOCK_FILE_NAME: &str = "scheduler.sock";

/// Directory mode: owner rwx, group/other execute-only — group/other may traverse to the socket
/// file by exact name but may not list the directory's contents.
pub const SOCK_DIR_MODE: u32 = 0o711;
/// Socket mode: owner rwx, group/other write-only — connecting to a stream socket requires write
/// permission on the socket file itself (see unix(7)).
pub const SOCK_FILE_MODE: u32 = 0o722;

/// Resolves the directory the scheduler socket lives in. Overridable via `GPUSHARE_SOCK_DIR` so
/// integration tests can run a daemon against a scratch directory instead of the real
/// `/var/run/gpushare`.
pub fn socket_dir() -> PathBuf {
    match env::var_os("GPUSHARE_SOCK_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(DEFAULT_SOCK_DIR),
    }
}

pub fn socket_path() -> PathBuf {
    socket_dir().join(SOCK_FILE_NAME)
}

/// Creates the socket directory (if absent) with [`SOCK_DIR_MODE`], unconditionally `chmod`-ing it
/// afterwards since directory creation is subject to the process umask and we need the exact
/// permissions regardless of it.
pub fn ensure_socket_dir(dir: &Path) -> io::Result<()> {
    match fs::create_dir(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }
    fs::set_permissions(dir, fs::Permissions::from_mode(SOCK_DIR_MODE))
}

/// Connects to the scheduler's socket.
pub fn connect(path: &Path) -> io::Result<UnixStream> {
    UnixStream::connect(path)
}

/// Writes a message to `stream`, looping over partial writes and transparently retrying signal
/// interruptions. Matches `write_whole()` in the originating implementation.
pub fn send_message(stream: &mut UnixStream, msg: &Message) -> io::Result<()> {
    write_whole(stream, &msg.to_bytes())
}

/// Reads exactly one message from `stream`, blocking until a full frame arrives. Returns `Ok(None)`
/// on a clean EOF with zero bytes read (no partial frame); a partial frame is reported as an
/// `UnexpectedEof` error, since it indicates a dead peer mid-message.
pub fn receive_message(stream: &mut UnixStream) -> io::Result<Option<Message>> {
    let mut buf = [0u8; FRAME_SIZE];
    let n = read_whole(stream, &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if n != FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "partial frame from peer",
        ));
    }
    Message::from_bytes(&buf)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown message type"))
        .map(Some)
}

fn write_whole<W: Write>(w: &mut W, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match w.write(&buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads until `buf` is full or EOF. Returns the number of bytes actually read, which is either
/// `buf.len()` (full frame) or less (peer closed mid-frame / before sending anything).
fn read_whole<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

/// Outcome of a single non-blocking receive attempt on the daemon's side of a client socket.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A complete, well-formed frame arrived.
    Message(Message),
    /// The socket had nothing to read right now; the caller's readiness notification was stale or
    /// shared with another event (level-triggered epoll can report this).
    WouldBlock,
    /// The peer closed its end cleanly, with no bytes pending.
    Closed,
    /// Fewer than a full frame's worth of bytes was available, or the frame's leading type byte
    /// was not recognized. Both are treated identically: the peer is dead or misbehaving and must
    /// be evicted, per the daemon's strict "no partial-frame retry" policy.
    Dead,
}

/// Attempts to read exactly one frame from a non-blocking socket without looping: the daemon's
/// event loop only calls this once per readiness notification (§4.1, §4.7). A short read that is
/// not a clean zero-byte close is never retried — it is surfaced as [`RecvOutcome::Dead`] so the
/// caller evicts the peer instead of risking the next read interleaving bytes from a new message.
pub fn try_receive_message_nonblocking(stream: &mut UnixStream) -> io::Result<RecvOutcome> {
    let mut buf = [0u8; FRAME_SIZE];
    match stream.read(&mut buf) {
        Ok(0) => Ok(RecvOutcome::Closed),
        Ok(n) if n == FRAME_SIZE => Ok(match Message::from_bytes(&buf) {
            Some(msg) => RecvOutcome::Message(msg),
            None => RecvOutcome::Dead,
        }),
        Ok(_) => Ok(RecvOutcome::Dead),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
            try_receive_message_nonblocking(stream)
        }
        Err(e) => Err(e),
    }
}

/// Sends one frame on a non-blocking socket with a single `write(2)` call. Per §9's design notes,
/// a short write here is treated as fatal to the peer rather than retried: this system only ever
/// sends frames small enough to fit a socket's send buffer in one call, so a short write means the
/// peer's receive buffer is in a pathological state.
pub fn try_send_message_nonblocking(stream: &mut UnixStream, msg: &Message) -> io::Result<()> {
    let bytes = msg.to_bytes();
    match stream.write(&bytes) {
        Ok(n) if n == bytes.len() => Ok(()),
        Ok(_) => Err(io::Error::new(io::ErrorKind::WriteZero, "short non-blocking write")),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
            try_send_message_nonblocking(stream, msg)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;
    use std::thread;

    use super::*;
    use crate::message::MessageType;

    #[test]
    fn round_trips_message_over_a_real_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let path2 = path.clone();
        let client = thread::spawn(move || {
            let mut stream = connect(&path2).unwrap();
            send_message(&mut stream, &Message::new(MessageType::ReqLock).with_id(7)).unwrap();
        });

        let (mut server_stream, _) = listener.accept().unwrap();
        let msg = receive_message(&mut server_stream).unwrap().unwrap();
        assert_eq!(msg.msg_type, MessageType::ReqLock);
        assert_eq!(msg.id, 7);

        client.join().unwrap();
    }

    #[test]
    fn clean_close_with_no_bytes_reports_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test2.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let path2 = path.clone();
        let client = thread::spawn(move || {
            let _ = connect(&path2).unwrap();
        });

        let (mut server_stream, _) = listener.accept().unwrap();
        assert!(receive_message(&mut server_stream).unwrap().is_none());
        client.join().unwrap();
    }
}
