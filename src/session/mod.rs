//! The session engine: stream reader, transports, session classes, the
//! process-global registry and the reaper.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cli;
pub mod console;
pub mod netconf;
pub mod reader;
pub mod reaper;
pub mod registry;
pub mod transport;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use regex::bytes::Regex;
use tokio::{sync::watch, time::Instant};

use crate::{
    api::{
        error::{Result, SessionError},
        types::SessionType,
    },
    catalog::device::{DeviceInfo, PingCheck},
    cfg::config::ServiceConfig,
    counters::Counters,
    session::{
        cli::CliSession,
        console::ConsoleSession,
        netconf::NetconfSession,
        registry::{SessionKey, SessionRegistry},
        transport::{AddressRewriter, Connector},
    },
};

/// Milliseconds spent blocked on the outside world (establishing the
/// transport, waiting for device bytes) during the current API call.
/// Reset at API-call boundaries on reused sessions.
#[derive(Debug, Default)]
pub struct CapturedTime {
    external_us: AtomicU64,
}

impl CapturedTime {
    pub fn add(&self, d: Duration) {
        self.external_us
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.external_us.store(0, Ordering::Relaxed);
    }

    pub fn external_ms(&self) -> u64 {
        self.external_us.load(Ordering::Relaxed) / 1000
    }
}

/// Control-plane lifecycle of a session, alongside the
/// disconnected/connected data-plane flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Create,
    Init,
    Run,
    Canceled,
    Stop,
}

/// The address a session actually connected to.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub ip: String,
    pub is_pingable: bool,
    pub port: u16,
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.ip, self.is_pingable, self.port)
    }
}

/// Options snapshot a session is constructed with; derived from the request
/// and immutable for the session's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub client_ip: String,
    pub client_port: i32,
    pub open_timeout: Duration,
    pub idle_timeout: Duration,
    pub username: String,
    pub password: String,
    pub console: Option<String>,
    pub command_prompts: HashMap<Vec<u8>, Vec<u8>>,
    pub clear_command: Option<String>,
    pub mgmt_ip: bool,
    pub ip_address: Option<String>,
    pub session_type: Option<SessionType>,
    pub pre_setup_commands: Vec<String>,
    pub failover_to_backup_ips: bool,
    /// Port override from the request's extra options.
    pub port_override: Option<u16>,
    pub subsystem: Option<String>,
    pub exec_command: Option<String>,
    /// Raw sessions bypass prompt formatting; the caller supplies the
    /// end-of-output regex per command.
    pub raw: bool,
    pub kick_shutdown: bool,
}

/// Shared service facilities a session needs: configuration, counters, the
/// registry it lives in, and the pluggable transport seams.
#[derive(Clone)]
pub struct SessionCtx {
    pub cfg: Arc<ServiceConfig>,
    pub counters: Arc<Counters>,
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<dyn Connector>,
    pub ping: Arc<dyn PingCheck>,
    pub rewriter: Arc<dyn AddressRewriter>,
}

/// State common to every session class: identity, liveness bookkeeping for
/// the reaper, the connected signal, and timing accumulators.
pub struct SessionCore {
    id: u64,
    kind_name: &'static str,
    devinfo: Arc<DeviceInfo>,
    opts: SessionOptions,
    ctx: SessionCtx,
    connected_tx: watch::Sender<bool>,
    last_access: Mutex<Instant>,
    in_use: AtomicU32,
    captured: Arc<CapturedTime>,
    open_time_ms: AtomicU64,
    exit_status: Mutex<Option<String>>,
    peer: Mutex<Option<PeerInfo>>,
    state: Mutex<SessionState>,
}

impl SessionCore {
    pub fn new(
        id: u64,
        kind_name: &'static str,
        ctx: SessionCtx,
        devinfo: Arc<DeviceInfo>,
        opts: SessionOptions,
    ) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            id,
            kind_name,
            devinfo,
            opts,
            ctx,
            connected_tx,
            last_access: Mutex::new(Instant::now()),
            in_use: AtomicU32::new(0),
            captured: Arc::new(CapturedTime::default()),
            open_time_ms: AtomicU64::new(0),
            exit_status: Mutex::new(None),
            peer: Mutex::new(None),
            state: Mutex::new(SessionState::Create),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock_ok(&self.state)
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = lock_ok(&self.state);
        tracing::debug!("{}: {:?} -> {state:?}", self.name(), *current);
        *current = state;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> SessionKey {
        (
            self.id,
            self.opts.client_ip.clone(),
            self.opts.client_port,
        )
    }

    pub fn name(&self) -> String {
        format!("{}[{}]", self.kind_name, self.devinfo.hostname())
    }

    pub fn hostname(&self) -> &str {
        self.devinfo.hostname()
    }

    pub fn devinfo(&self) -> &Arc<DeviceInfo> {
        &self.devinfo
    }

    pub fn opts(&self) -> &SessionOptions {
        &self.opts
    }

    pub fn ctx(&self) -> &SessionCtx {
        &self.ctx
    }

    pub fn captured(&self) -> &Arc<CapturedTime> {
        &self.captured
    }

    pub fn connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected_tx.send_replace(connected);
    }

    /// Waits until the data plane marks the session connected.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.connected_tx.subscribe();
        let wait = async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return Err(SessionError::connection("Session dropped while connecting"));
                }
            }
            Ok(())
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| {
                SessionError::connection_timeout("Timed out before session marked as connected")
            })?
    }

    pub fn touch(&self) {
        *lock_ok(&self.last_access) = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        *lock_ok(&self.last_access)
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Relaxed) > 0
    }

    pub fn idle_timeout(&self) -> Duration {
        self.opts.idle_timeout
    }

    /// Marks the session busy for the duration of a wire-touching
    /// operation; last-access is refreshed on entry and on release.
    pub fn enter(&self) -> InUseGuard<'_> {
        self.in_use.fetch_add(1, Ordering::Relaxed);
        self.touch();
        InUseGuard { core: self }
    }

    pub fn set_open_time_ms(&self, ms: u64) {
        self.open_time_ms.store(ms, Ordering::Relaxed);
    }

    pub fn open_time_ms(&self) -> u64 {
        self.open_time_ms.load(Ordering::Relaxed)
    }

    pub fn exit_status(&self) -> Option<String> {
        lock_ok(&self.exit_status).clone()
    }

    pub fn set_exit_status(&self, status: impl Into<String>) {
        *lock_ok(&self.exit_status) = Some(status.into());
    }

    pub fn peer_info(&self) -> Option<PeerInfo> {
        lock_ok(&self.peer).clone()
    }

    pub fn set_peer_info(&self, peer: PeerInfo) {
        *lock_ok(&self.peer) = Some(peer);
    }

    pub fn inc_counter(&self, suffix: &str) {
        self.ctx
            .counters
            .increment(&format!("{}.{suffix}", self.kind_name));
    }
}

pub struct InUseGuard<'a> {
    core: &'a SessionCore,
}

impl Drop for InUseGuard<'_> {
    fn drop(&mut self) {
        self.core.in_use.fetch_sub(1, Ordering::Relaxed);
        self.core.touch();
    }
}

pub(crate) fn lock_ok<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A live session of any class. Dispatch is a hand-written match so each
/// class keeps its own concrete state.
pub enum CommandSession {
    Cli(CliSession),
    Console(ConsoleSession),
    Netconf(NetconfSession),
}

impl CommandSession {
    pub fn core(&self) -> &SessionCore {
        match self {
            Self::Cli(s) => s.core(),
            Self::Console(s) => s.core(),
            Self::Netconf(s) => s.core(),
        }
    }

    /// Establishes the transport and runs the session's setup sequence,
    /// bounded by the open timeout. Failure leaves the session closable but
    /// unusable.
    pub async fn setup(&self) -> Result<()> {
        let core = self.core();
        let _guard = core.enter();
        core.inc_counter("setup");
        core.set_state(SessionState::Init);

        let started = Instant::now();
        let res = tokio::time::timeout(core.opts().open_timeout, async {
            match self {
                Self::Cli(s) => s.create_connection().await,
                Self::Console(s) => s.create_connection().await,
                Self::Netconf(s) => s.create_connection().await,
            }
        })
        .await;
        core.set_open_time_ms(started.elapsed().as_millis() as u64);

        let outcome = match res {
            Ok(inner) => inner,
            Err(_) => {
                let data = self.drain_for_diagnostics();
                Err(SessionError::connection_timeout(format!(
                    "Timeout during connection setup. Currently received data (last 200 char): \
                     {:?}",
                    String::from_utf8_lossy(&data[data.len().saturating_sub(200)..])
                )))
            },
        };
        match &outcome {
            Ok(()) => core.set_state(SessionState::Run),
            Err(_) => core.set_state(SessionState::Canceled),
        }
        outcome
    }

    /// Runs one command (possibly multiple lines) and returns the formatted
    /// output.
    pub async fn run_command(
        &self,
        command: &[u8],
        timeout: Option<Duration>,
        prompt_override: Option<&Regex>,
    ) -> Result<Vec<u8>> {
        let core = self.core();
        let _guard = core.enter();
        match self {
            Self::Cli(s) => s.run_command(command, timeout, prompt_override).await,
            Self::Console(s) => s.run_command(command, timeout, prompt_override).await,
            Self::Netconf(s) => s.run_command(command, timeout).await,
        }
    }

    /// Closes the session: removes it from the registry and tears the
    /// transport down. A second close is a no-op.
    pub async fn close(&self) {
        match self {
            Self::Cli(s) => s.close().await,
            Self::Console(s) => s.close().await,
            Self::Netconf(s) => s.close().await,
        }
        self.core().set_state(SessionState::Stop);
    }

    /// NETCONF sessions surface the stored peer hello once, on the first
    /// result of the session.
    pub fn take_capabilities(&self) -> Option<Vec<u8>> {
        match self {
            Self::Netconf(s) => s.take_server_hello(),
            _ => None,
        }
    }

    fn drain_for_diagnostics(&self) -> Vec<u8> {
        match self {
            Self::Cli(s) => s.reader().drain().to_vec(),
            Self::Console(s) => s.reader().drain().to_vec(),
            Self::Netconf(s) => s.reader().drain().to_vec(),
        }
    }
}
