// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::Arc,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use tracing::info;

use crate::{
    api::error::{Result, SessionError},
    session::CommandSession,
};

/// Stable identity of a live session.
pub type SessionKey = (u64, String, i32);

/// Process-global table of live sessions. Every open transport has exactly
/// one entry under its `(id, client_ip, client_port)` key; `close` removes
/// it.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<CommandSession>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates a session id. Ids are unique for the process lifetime.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, session: Arc<CommandSession>) {
        let key = session.core().key();
        info!("Created session key={key:?}");
        self.sessions.insert(key, session);
    }

    pub fn get(&self, id: u64, client_ip: &str, client_port: i32) -> Result<Arc<CommandSession>> {
        let key = (id, client_ip.to_string(), client_port);
        self.sessions
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| SessionError::lookup(format!("Session not found: {key:?}")))
    }

    pub fn remove(&self, key: &SessionKey) {
        self.sessions.remove(key);
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of the current keys; reap passes iterate this so entries can
    /// vanish concurrently.
    pub fn keys(&self) -> Vec<SessionKey> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn peek(&self, key: &SessionKey) -> Option<Arc<CommandSession>> {
        self.sessions.get(key).map(|e| e.value().clone())
    }

    /// Polls until the table is empty. Returns false if `timeout` passed
    /// with sessions still open.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let wait = async {
            while self.count() != 0 {
                info!("pending sessions: {}", self.count());
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
