// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use remain::sorted;
use thiserror::Error as ThisError;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("failed to connect to scheduler at {path}: {source}")]
    Connect {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("driver reported error {code} from {call}")]
    Driver { call: &'static str, code: i32 },
    #[error("malformed REGISTER reply: {0:?}")]
    MalformedRegisterReply(String),
    #[error("daemon closed the connection or sent a malformed frame")]
    ProtocolDied,
    #[error("failed to send {msg_type} to scheduler: {source}")]
    Send {
        msg_type: &'static str,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
