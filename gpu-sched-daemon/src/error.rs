// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use remain::sorted;
use thiserror::Error as ThisError;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("failed to accept a connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to bind socket at {path}: {source}")]
    Bind {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create socket directory {path}: {source}")]
    CreateSocketDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("failed to set socket to non-blocking mode: {0}")]
    SetNonblocking(std::io::Error),
    #[error("failed to chmod socket at {path}: {source}")]
    SetSocketPermissions {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create epoll context: {0}")]
    WaitContext(base::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
