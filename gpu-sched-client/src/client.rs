// Copyright 2024 The gpushare Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-process singleton (§9 "Global mutable state"): bundles the gate, rate controller,
//! memory shim, and the connection to the scheduler into one lazily-initialized object, so every
//! hooked driver entry point can reach it through [`Client::get`] without threading state through
//! the foreign call sites by hand.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use log::info;
use once_cell::sync::OnceCell;

use crate::conn::Conn;
use crate::config::pod_identity;
use crate::config::ClientConfig;
use crate::driver::DriverApi;
use crate::error::Error;
use crate::error::Result;
use crate::gate::Gate;
use crate::memory::MemoryShim;
use crate::rate::RateController;
use crate::worker;

pub struct Client {
    pub gate: Arc<Gate>,
    pub rate: Arc<RateController>,
    pub mem: MemoryShim,
    pub driver: Arc<dyn DriverApi>,
    pub config: ClientConfig,
    pub client_id: u64,
}

static CLIENT: OnceCell<Client> = OnceCell::new();

impl Client {
    /// Connects, registers, and spawns the worker and idle-releaser threads. Only meant to be
    /// called once per process, from [`Client::get`]'s initializer.
    pub fn init(driver: Arc<dyn DriverApi>) -> Result<Client> {
        let config = ClientConfig::resolve();
        install_logger(config.debug_logging);

        driver
            .init()
            .map_err(|code| Error::Driver { call: "driver_init", code })?;

        let (pod_name, pod_namespace) = pod_identity();

        let sock_path = config.sock_dir.join("scheduler.sock");
        let mut stream = UnixStream::connect(&sock_path).map_err(|source| Error::Connect {
            path: sock_path.clone(),
            source,
        })?;

        let outcome = worker::register(&mut stream, pod_name, pod_namespace)?;

        let read_half = stream.try_clone().map_err(|source| Error::Connect {
            path: sock_path.clone(),
            source,
        })?;
        let conn = Arc::new(Conn::new(stream));

        // SCHED_ON reply -> own_lock=0, need_lock=0; SCHED_OFF reply -> own_lock=1, need_lock=0.
        let initial_own_lock = !outcome.scheduler_on;

        let gate = Arc::new(Gate::new(initial_own_lock, outcome.scheduler_on, conn.clone(), driver.clone()));
        let rate = Arc::new(RateController::new());
        let mem = MemoryShim::new(config.memory_reserve_bytes, config.allow_single_oversub);

        {
            let worker_gate = gate.clone();
            let worker_conn = conn.clone();
            let worker_driver = driver.clone();
            let worker_rate = rate.clone();
            std::thread::Builder::new()
                .name("gpushare-worker".into())
                .spawn(move || worker::run(read_half, worker_gate, worker_conn, worker_driver, worker_rate))
                .expect("failed to spawn gpushare worker thread");
        }

        {
            let idle_gate = gate.clone();
            let idle_conn = conn;
            let idle_driver = driver.clone();
            let idle_rate = rate.clone();
            let check_interval = config.idle_check_interval;
            let fallback_threshold = config.idle_sync_fallback_threshold;
            std::thread::Builder::new()
                .name("gpushare-idle".into())
                .spawn(move || crate::idle::run(idle_gate, idle_conn, idle_driver, idle_rate, check_interval, fallback_threshold))
                .expect("failed to spawn gpushare idle-releaser thread");
        }

        info!("gpushare client initialized (client id {:016x})", outcome.client_id);
        Ok(Client {
            gate,
            rate,
            mem,
            driver,
            config,
            client_id: outcome.client_id,
        })
    }

    /// Returns the process-wide singleton, initializing it on first call with `driver`. Subsequent
    /// calls ignore `driver` and return the already-initialized instance, matching the real
    /// library's "one initializer runs exactly once per process" design (§9).
    pub fn get(driver: impl FnOnce() -> Arc<dyn DriverApi>) -> &'static Client {
        CLIENT.get_or_init(|| match Client::init(driver()) {
            Ok(client) => client,
            Err(e) => {
                log::error!("fatal: failed to initialize gpushare client: {}", e);
                std::process::exit(1);
            }
        })
    }
}

fn install_logger(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    // Best-effort: a host application may already have installed its own global logger, in which
    // case this fails and we proceed without one rather than fighting over the global logger slot.
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).try_init();
}
