// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cfg::config::ServiceConfig, counters::Counters, session::registry::SessionRegistry,
};

/// Periodic sweep closing idle and over-age sessions.
///
/// A session is accessed when a command begins executing and again when it
/// is released. It is freed when it has been idle past its idle timeout, or
/// unconditionally when it exceeds the max time since last access (which
/// happens when a command gets stuck). This keeps the service from holding
/// open stale connections to network devices.
pub struct SessionReaper {
    registry: Arc<SessionRegistry>,
    counters: Arc<Counters>,
    cfg: Arc<ServiceConfig>,
}

impl SessionReaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        counters: Arc<Counters>,
        cfg: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            registry,
            counters,
            cfg,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.session_reap_period) => {},
            }
            self.reap_once().await;
        }
    }

    /// One sweep over a snapshot of the registry keys. Returns how many
    /// sessions were closed.
    pub async fn reap_once(&self) -> usize {
        info!(
            "Session reaper woke up: session_count={}",
            self.registry.count()
        );
        let mut reaped = 0;
        for key in self.registry.keys() {
            // Sessions can close concurrently with the sweep.
            let Some(session) = self.registry.peek(&key) else {
                continue;
            };
            let core = session.core();
            let since_last_access = Instant::now().saturating_duration_since(core.last_access());
            let idle_timeout = core.idle_timeout().min(self.cfg.max_session_idle_timeout);

            if since_last_access > self.cfg.max_session_last_access_timeout
                || (!core.in_use() && since_last_access > idle_timeout)
            {
                info!(
                    "Reap session {key:?}, idle for {}s",
                    since_last_access.as_secs()
                );
                session.close().await;
                self.counters.increment("session_reaper.reaped.all");
                reaped += 1;
            }
        }
        info!(
            "Session reaper finished: session_count={}",
            self.registry.count()
        );
        reaped
    }
}
