// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use remain::sorted;
use thiserror::Error as ThisError;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("--set-tq and --anti-thrash are mutually exclusive")]
    ConflictingActions,
    #[error("failed to connect to scheduler at {path}: {source}")]
    Connect {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("--anti-thrash must be \"on\" or \"off\", got {0:?}")]
    InvalidAntiThrashValue(String),
    #[error("exactly one of --set-tq or --anti-thrash must be given")]
    NoAction,
    #[error("--set-tq must be a positive integer, got {0}")]
    NonPositiveQuantum(i64),
    #[error("failed to send {msg_type} to scheduler: {source}")]
    Send {
        msg_type: &'static str,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
