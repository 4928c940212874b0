// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    catalog::{
        db::{DeviceCatalog, DeviceSource},
        device::PingCheck,
        vendor::VendorRegistry,
    },
    cfg::config::ServiceConfig,
    counters::Counters,
    handler::dispatcher::{CommandHandler, LoopbackPeerClient, PeerClient},
    session::{
        SessionCtx, lock_ok,
        reaper::SessionReaper,
        registry::SessionRegistry,
        transport::{AddressRewriter, Connector, IdentityRewriter, SshConnector},
    },
};

/// Counter names every component contributes, registered up front so a
/// counters dump is complete even before the first request.
const STATIC_COUNTERS: &[&str] = &[
    "bulk_run.local",
    "bulk_run.remote",
    "device_info.mgmt_ip",
    "device_info.default_ip",
    "device_vendor.all_sessions",
    "device_vendor.unsupported_session",
    "session_reaper.reaped.all",
    "streamreader.wait_for_retry",
    "streamreader.overrun",
    "cli_session.setup",
    "cli_session.connected",
    "cli_session.failed",
    "cli_session.closed",
    "console_session.setup",
    "console_session.connected",
    "console_session.failed",
    "console_session.closed",
    "netconf_session.setup",
    "netconf_session.connected",
    "netconf_session.failed",
    "netconf_session.closed",
];

/// Pluggable seams of the service; the defaults are the production SSH
/// connector with identity address rewriting and a loopback peer.
pub struct ServiceParts {
    pub source: Arc<dyn DeviceSource>,
    pub connector: Arc<dyn Connector>,
    pub rewriter: Arc<dyn AddressRewriter>,
    pub peers: Option<Arc<dyn PeerClient>>,
}

impl ServiceParts {
    pub fn production(source: Arc<dyn DeviceSource>) -> Self {
        Self {
            source,
            connector: Arc::new(SshConnector),
            rewriter: Arc::new(IdentityRewriter),
            peers: None,
        }
    }
}

/// Owns every process-wide component and the background tasks, and
/// orchestrates graceful shutdown. Nothing here is a hidden singleton;
/// construction order is explicit.
pub struct Service {
    pub cfg: Arc<ServiceConfig>,
    pub counters: Arc<Counters>,
    pub vendors: Arc<VendorRegistry>,
    pub catalog: Arc<DeviceCatalog>,
    pub registry: Arc<SessionRegistry>,
    pub handler: Arc<CommandHandler>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    pub fn new(cfg: ServiceConfig, parts: ServiceParts) -> anyhow::Result<Arc<Self>> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);

        let counters = Arc::new(Counters::new());
        let vendors = Arc::new(VendorRegistry::new(counters.clone()));

        if let Some(path) = &cfg.device_vendors {
            let json = std::fs::read_to_string(path)?;
            vendors.load(&json)?;
            info!("loaded vendor configuration from {path:?}");
        }

        let catalog = Arc::new(DeviceCatalog::new(&cfg, parts.source, vendors.clone()));
        let registry = Arc::new(SessionRegistry::new());

        let ctx = SessionCtx {
            cfg: cfg.clone(),
            counters: counters.clone(),
            registry: registry.clone(),
            connector: parts.connector,
            ping: catalog.clone() as Arc<dyn PingCheck>,
            rewriter: parts.rewriter,
        };

        let handler = match parts.peers {
            Some(peers) => CommandHandler::new(ctx, catalog.clone(), peers),
            None => {
                let loopback = Arc::new(LoopbackPeerClient::new());
                let handler =
                    CommandHandler::new(ctx, catalog.clone(), loopback.clone());
                loopback.bind(&handler);
                handler
            },
        };

        for name in STATIC_COUNTERS {
            counters.register(name, 0);
        }
        let registry_for_gauge = registry.clone();
        counters.register_fn("sessions", move || registry_for_gauge.count() as i64);

        Ok(Arc::new(Self {
            cfg,
            counters,
            vendors,
            catalog,
            registry,
            handler,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns the periodic catalog refresh and the session reaper.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let catalog = self.catalog.clone();
        let cancel = self.cancel.clone();
        let refresh = tokio::spawn(async move {
            catalog.refresh_loop(cancel).await;
        });

        let reaper = SessionReaper::new(
            self.registry.clone(),
            self.counters.clone(),
            self.cfg.clone(),
        );
        let cancel = self.cancel.clone();
        let reap = tokio::spawn(async move {
            reaper.run(cancel).await;
        });

        let mut tasks = lock_ok(&self.tasks);
        tasks.push(refresh);
        tasks.push(reap);
    }

    /// Blocks until SIGINT or SIGTERM, then runs the clean shutdown.
    pub async fn run_until_shutdown(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    error!("signal handler failed: {e}");
                }
                info!("SIGINT received");
            },
            _ = sigterm.recv() => {
                info!("SIGTERM received");
            },
        }
        self.shutdown().await;
        Ok(())
    }

    /// Clean shutdown: stop the service tasks, give open sessions up to
    /// `exit_max_wait` to drain, then abort whatever is left.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.cancel.cancel();

        if !self.registry.wait_drained(self.cfg.exit_max_wait).await {
            warn!(
                "Timeout waiting for sessions, shutting down anyway ({} left)",
                self.registry.count()
            );
        }

        for task in lock_ok(&self.tasks).drain(..) {
            task.abort();
        }
        info!("Terminating");
    }
}
