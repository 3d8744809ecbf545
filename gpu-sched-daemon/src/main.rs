// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use gpu_sched_daemon::config::DaemonConfig;
use gpu_sched_daemon::error::Error;
use gpu_sched_daemon::server::Daemon;
use gpu_sched_daemon::state::SchedulerState;
use log::info;
use sync::Mutex;

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn bind_listener(cfg: &DaemonConfig) -> gpu_sched_daemon::error::Result<UnixListener> {
    gpu_sched_proto::ensure_socket_dir(&cfg.sock_dir).map_err(|source| Error::CreateSocketDir {
        path: cfg.sock_dir.clone(),
        source,
    })?;

    let path = cfg.sock_dir.join("scheduler.sock");
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }

    let listener = UnixListener::bind(&path).map_err(|source| Error::Bind {
        path: path.clone(),
        source,
    })?;

    std::fs::set_permissions(
        &path,
        std::fs::Permissions::from_mode(gpu_sched_proto::SOCK_FILE_MODE),
    )
    .map_err(|source| Error::SetSocketPermissions {
        path: path.clone(),
        source,
    })?;

    info!("listening on {}", path.display());
    Ok(listener)
}

fn main() {
    let cfg = DaemonConfig::resolve();
    init_logging(cfg.debug_logging);
    info!(
        "starting gpushare-scheduler: quantum={:?} scheduler_on={}",
        cfg.quantum, cfg.scheduler_on
    );

    let listener = match bind_listener(&cfg) {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("fatal: {}", e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(Mutex::new(SchedulerState::new(cfg.scheduler_on, cfg.quantum)));
    let mut daemon = match Daemon::new(listener, state) {
        Ok(daemon) => daemon,
        Err(e) => {
            log::error!("fatal: {}", e);
            std::process::exit(1);
        }
    };

    let _timer_handle = daemon.spawn_timer_thread();
    daemon.run();
}
