// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client-side configuration, resolved once per process from environment variables. See
//! `DaemonConfig` in the daemon crate for the mirror of this on the scheduler side.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_SYNC_FALLBACK_THRESHOLD: Duration = Duration::from_millis(100);
pub const DEFAULT_MEMORY_RESERVE_BYTES: u64 = 1536 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub sock_dir: PathBuf,
    pub debug_logging: bool,
    pub allow_single_oversub: bool,
    pub idle_check_interval: Duration,
    pub idle_sync_fallback_threshold: Duration,
    pub memory_reserve_bytes: u64,
}

impl ClientConfig {
    pub fn resolve() -> ClientConfig {
        let sock_dir = match env::var_os("GPUSHARE_SOCK_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(gpu_sched_proto::transport::DEFAULT_SOCK_DIR),
        };

        let debug_logging = env::var_os("GPUSHARE_DEBUG")
            .map(|v| !v.is_empty())
            .unwrap_or(false);

        let allow_single_oversub = env::var_os("GPUSHARE_ENABLE_SINGLE_OVERSUB")
            .map(|v| !v.is_empty())
            .unwrap_or(false);

        ClientConfig {
            sock_dir,
            debug_logging,
            allow_single_oversub,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            idle_sync_fallback_threshold: DEFAULT_IDLE_SYNC_FALLBACK_THRESHOLD,
            memory_reserve_bytes: DEFAULT_MEMORY_RESERVE_BYTES,
        }
    }
}

/// Pod identity to send in `REGISTER`: read from the cluster-scheduler environment when present,
/// matching §4.3's boot sequence, or `"none"`/`"none"` when running standalone.
pub fn pod_identity() -> (String, String) {
    if env::var_os("KUBERNETES_SERVICE_HOST").is_none() {
        return ("none".to_string(), "none".to_string());
    }

    let pod_name = env::var("HOSTNAME").unwrap_or_else(|_| "none".to_string());
    let pod_namespace = std::fs::read_to_string(
        "/var/run/secrets/kubernetes.io/serviceaccount/namespace",
    )
    .ok()
    .and_then(|contents| contents.lines().next().map(str::to_string))
    .unwrap_or_else(|| "none".to_string());

    (pod_name, pod_namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        assert_eq!(DEFAULT_IDLE_CHECK_INTERVAL, Duration::from_secs(5));
        assert_eq!(DEFAULT_IDLE_SYNC_FALLBACK_THRESHOLD, Duration::from_millis(100));
        assert_eq!(DEFAULT_MEMORY_RESERVE_BYTES, 1536 * 1024 * 1024);
    }
}
