// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The wire protocol shared by the scheduler daemon, the injected client, and the CLI: message
//! framing, socket path resolution, and the blocking transport helpers built on top of both.

pub mod id;
pub mod message;
pub mod transport;

pub use id::generate as generate_id;
pub use message::Message;
pub use message::MessageType;
pub use message::FRAME_SIZE;
pub use message::MSG_DATA_LEN;
pub use message::POD_NAMESPACE_LEN_MAX;
pub use message::POD_NAME_LEN_MAX;
pub use message::UNREGISTERED_ID;
pub use transport::connect;
pub use transport::ensure_socket_dir;
pub use transport::receive_message;
pub use transport::send_message;
pub use transport::socket_dir;
pub use transport::socket_path;
pub use transport::try_receive_message_nonblocking;
pub use transport::try_send_message_nonblocking;
pub use transport::RecvOutcome;
pub use transport::SOCK_DIR_MODE;
pub use transport::SOCK_FILE_MODE;
