// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::{
    api::{
        error::{InstanceOverloaded, Result, RpcError, SessionError, SessionException},
        types::{CommandResult, Device, SUCCESS_STATUS, Session, SessionType},
    },
    catalog::{db::DeviceCatalog, device::DeviceInfo, vendor::bytes_re},
    handler::{
        retry::{RetryPolicy, call_with_retry, default_retryable},
        validate,
    },
    session::{
        CommandSession, SessionCtx, SessionOptions, cli::CliSession, console::ConsoleSession,
        netconf::NetconfSession,
    },
};

/// A bulk request: each device with the commands to run on it.
pub type DeviceCommands = Vec<(Device, Vec<String>)>;
/// A bulk response: hostname to per-command results.
pub type BulkResults = HashMap<String, Vec<CommandResult>>;

/// Access to a peer instance of this service, used to distribute bulk
/// requests. The RPC transport behind it stays external.
#[allow(clippy::too_many_arguments)]
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn bulk_run_local(
        &self,
        chunk: DeviceCommands,
        timeout: Duration,
        open_timeout: Duration,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<BulkResults, RpcError>;
}

/// Peer client that loops back into the local handler. Stands in for a real
/// peer connection in single-instance deployments and tests.
#[derive(Default)]
pub struct LoopbackPeerClient {
    handler: OnceCell<std::sync::Weak<CommandHandler>>,
}

impl LoopbackPeerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, handler: &Arc<CommandHandler>) {
        let _ = self.handler.set(Arc::downgrade(handler));
    }
}

#[allow(clippy::too_many_arguments)]
#[async_trait]
impl PeerClient for LoopbackPeerClient {
    async fn bulk_run_local(
        &self,
        chunk: DeviceCommands,
        timeout: Duration,
        open_timeout: Duration,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<BulkResults, RpcError> {
        let handler = self
            .handler
            .get()
            .and_then(std::sync::Weak::upgrade)
            .ok_or_else(|| {
                RpcError::Session(SessionException {
                    message: "peer client not bound".to_string(),
                    code: crate::api::error::ErrorCode::Runtime,
                })
            })?;
        handler
            .bulk_run_local(
                chunk,
                timeout.as_secs(),
                open_timeout.as_secs(),
                client_ip,
                client_port,
                uuid,
            )
            .await
    }
}

/// Releases reserved bulk session slots on every exit path.
struct BulkReservation {
    counter: Arc<AtomicUsize>,
    n: usize,
}

impl BulkReservation {
    /// Reserves `n` slots unless that would exceed `limit`.
    fn try_reserve(counter: Arc<AtomicUsize>, n: usize, limit: usize) -> Option<Self> {
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current + n > limit {
                return None;
            }
            match counter.compare_exchange_weak(
                current,
                current + n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Self { counter, n }),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Drop for BulkReservation {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.n, Ordering::AcqRel);
    }
}

/// Implements the public operations of the service: single runs, bulk
/// fan-out with admission control, and persistent-session management.
pub struct CommandHandler {
    ctx: SessionCtx,
    catalog: Arc<DeviceCatalog>,
    peers: Arc<dyn PeerClient>,
    bulk_sessions: Arc<AtomicUsize>,
    retryable: OnceCell<Box<dyn Fn(&RpcError) -> bool + Send + Sync>>,
}

#[allow(clippy::too_many_arguments)]
impl CommandHandler {
    pub fn new(
        ctx: SessionCtx,
        catalog: Arc<DeviceCatalog>,
        peers: Arc<dyn PeerClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            catalog,
            peers,
            bulk_sessions: Arc::new(AtomicUsize::new(0)),
            retryable: OnceCell::new(),
        })
    }

    /// Widens the set of errors the remote bulk layer will retry on. Can be
    /// installed once, before requests are served.
    pub fn set_retryable_override<F>(&self, f: F)
    where F: Fn(&RpcError) -> bool + Send + Sync + 'static {
        let _ = self.retryable.set(Box::new(f));
    }

    pub fn ctx(&self) -> &SessionCtx {
        &self.ctx
    }

    pub fn bulk_session_count(&self) -> usize {
        self.bulk_sessions.load(Ordering::Relaxed)
    }

    /// Runs one command on one device over a short-lived session.
    pub async fn run(
        &self,
        command: &str,
        device: &Device,
        timeout_s: u64,
        open_timeout_s: u64,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<CommandResult, RpcError> {
        let uuid = ensure_uuid(uuid);
        validate::check_command(command).map_err(|e| wrap(e, &uuid))?;
        let mut results = self
            .run_commands(
                device,
                std::slice::from_ref(&command.to_string()),
                timeout_s,
                open_timeout_s,
                client_ip,
                client_port,
                &uuid,
            )
            .await
            .map_err(|(e, _)| wrap(e, &uuid))?;
        Ok(results.remove(0))
    }

    /// Runs commands on many devices. Small requests execute locally;
    /// anything at or above the load-balance threshold is chunked and
    /// forwarded to peer instances, with retry on overload.
    pub async fn bulk_run(
        self: &Arc<Self>,
        requests: DeviceCommands,
        timeout_s: u64,
        open_timeout_s: u64,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<BulkResults, RpcError> {
        let uuid = ensure_uuid(uuid);
        validate::check_bulk(&requests).map_err(|e| wrap(e, &uuid))?;
        let cfg = &self.ctx.cfg;

        if requests.len() < cfg.lb_threshold
            && self.bulk_session_count() < cfg.bulk_session_limit
        {
            self.ctx.counters.increment("bulk_run.local");
            return self
                .bulk_run_local(
                    requests,
                    timeout_s,
                    open_timeout_s,
                    client_ip,
                    client_port,
                    &uuid,
                )
                .await;
        }

        // Make sure the remote side still gets a sane command budget.
        let remote_timeout_s = timeout_s.saturating_sub(cfg.remote_call_overhead.as_secs());
        if remote_timeout_s <= 10 {
            return Err(wrap(
                SessionError::assertion(format!(
                    "timeout: '{timeout_s}' value too low for bulk_run"
                )),
                &uuid,
            ));
        }
        let call_timeout = Duration::from_secs(open_timeout_s + timeout_s);
        let policy = RetryPolicy {
            limit: cfg.bulk_retry_limit,
            delay_min_s: cfg.bulk_retry_delay_min,
            delay_max_s: cfg.bulk_retry_delay_max,
        };

        let mut tasks: JoinSet<BulkResults> = JoinSet::new();
        for chunk in requests.chunks(cfg.lb_threshold) {
            let chunk = chunk.to_vec();
            let this = Arc::clone(self);
            let client_ip = client_ip.to_string();
            let uuid = uuid.clone();
            self.ctx.counters.increment("bulk_run.remote");
            tasks.spawn(async move {
                this.bulk_run_remote(
                    chunk,
                    remote_timeout_s,
                    open_timeout_s,
                    call_timeout,
                    policy,
                    &client_ip,
                    client_port,
                    &uuid,
                )
                .await
            });
        }

        let mut all_results = BulkResults::new();
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(map) => all_results.extend(map),
                Err(e) => warn!("bulk chunk task failed: {e}"),
            }
        }
        Ok(all_results)
    }

    /// One forwarded chunk with retry. A chunk that exhausts its retries
    /// still contributes a complete per-device failure map, so the overall
    /// call never drops a device silently.
    #[allow(clippy::too_many_arguments)]
    async fn bulk_run_remote(
        self: Arc<Self>,
        chunk: DeviceCommands,
        remote_timeout_s: u64,
        open_timeout_s: u64,
        call_timeout: Duration,
        policy: RetryPolicy,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> BulkResults {
        let is_retryable = |e: &RpcError| match self.retryable.get() {
            Some(f) => f(e),
            None => default_retryable(e),
        };
        let peers = Arc::clone(&self.peers);
        let res = call_with_retry(policy, is_retryable, || {
            let chunk = chunk.clone();
            let peers = Arc::clone(&peers);
            async move {
                match tokio::time::timeout(
                    call_timeout,
                    peers.bulk_run_local(
                        chunk,
                        Duration::from_secs(remote_timeout_s),
                        Duration::from_secs(open_timeout_s),
                        client_ip,
                        client_port,
                        uuid,
                    ),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(RpcError::Session(SessionException {
                        message: "bulk_run remote call timed out".to_string(),
                        code: crate::api::error::ErrorCode::ConnectionTimeout,
                    })),
                }
            }
        })
        .await;

        match res {
            Ok(map) => map,
            Err(e) => chunk
                .iter()
                .map(|(device, commands)| {
                    (
                        device.hostname.clone(),
                        vec![CommandResult {
                            output: String::new(),
                            status: format!("bulk_run_remote failed: {e}"),
                            command: commands.first().cloned().unwrap_or_default(),
                            uuid: uuid.to_string(),
                            capabilities: None,
                        }],
                    )
                })
                .collect(),
        }
    }

    /// Executes a bulk request locally under admission control. Per-device
    /// failures are folded into the result map; this never raises for one
    /// bad device.
    pub async fn bulk_run_local(
        self: &Arc<Self>,
        requests: DeviceCommands,
        timeout_s: u64,
        open_timeout_s: u64,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<BulkResults, RpcError> {
        let uuid = ensure_uuid(uuid);
        validate::check_bulk(&requests).map_err(|e| wrap(e, &uuid))?;
        let cfg = &self.ctx.cfg;

        let n = requests.len();
        let Some(reservation) = BulkReservation::try_reserve(
            self.bulk_sessions.clone(),
            n,
            cfg.bulk_session_limit,
        ) else {
            return Err(RpcError::Overloaded(InstanceOverloaded {
                message: format!(
                    "Cannot handle {n} more devices, bulk session count: {}",
                    self.bulk_session_count()
                ),
            }));
        };

        let mut sorted = requests;
        sorted.sort_by(|a, b| a.0.hostname.cmp(&b.0.hostname));

        let jitter = cfg.bulk_run_jitter;
        let mut tasks: JoinSet<(String, Vec<CommandResult>)> = JoinSet::new();
        for (device, commands) in sorted {
            let this = Arc::clone(self);
            let client_ip = client_ip.to_string();
            let uuid = uuid.clone();
            tasks.spawn(async move {
                // Stagger session starts so a big request doesn't stampede.
                let delay = rand::rng().random_range(0.0..=jitter as f64);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;

                let hostname = device.hostname.clone();
                let results = match this
                    .run_commands(
                        &device,
                        &commands,
                        timeout_s,
                        open_timeout_s,
                        &client_ip,
                        client_port,
                        &uuid,
                    )
                    .await
                {
                    Ok(results) => results,
                    Err((e, failed_command)) => vec![CommandResult {
                        output: String::new(),
                        status: format!("run failed: {e}"),
                        command: failed_command,
                        uuid: uuid.clone(),
                        capabilities: None,
                    }],
                };
                (hostname, results)
            });
        }

        let mut map = BulkResults::new();
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok((hostname, results)) => {
                    map.insert(hostname, results);
                },
                Err(e) => warn!("bulk device task failed: {e}"),
            }
        }
        drop(reservation);
        Ok(map)
    }

    /// Opens a persistent session and returns its handle.
    pub async fn open_session(
        &self,
        device: &Device,
        open_timeout_s: u64,
        idle_timeout_s: u64,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<Session, RpcError> {
        self.open_session_impl(
            device,
            open_timeout_s,
            idle_timeout_s,
            client_ip,
            client_port,
            uuid,
            false,
        )
        .await
    }

    /// Opens a persistent raw session: prompt formatting is bypassed and
    /// each command supplies its own end-of-output regex.
    pub async fn open_raw_session(
        &self,
        device: &Device,
        open_timeout_s: u64,
        idle_timeout_s: u64,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<Session, RpcError> {
        self.open_session_impl(
            device,
            open_timeout_s,
            idle_timeout_s,
            client_ip,
            client_port,
            uuid,
            true,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_session_impl(
        &self,
        device: &Device,
        open_timeout_s: u64,
        idle_timeout_s: u64,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
        raw: bool,
    ) -> std::result::Result<Session, RpcError> {
        let uuid = ensure_uuid(uuid);
        let res: Result<Session> = async {
            validate::check_device(device)?;
            let mut opts = self.session_options(
                device,
                client_ip,
                client_port,
                open_timeout_s,
                idle_timeout_s,
            )?;
            opts.raw = raw;
            let devinfo = self.catalog.get(&device.hostname, true).await?;
            let session = self.build_session(&devinfo, opts)?;
            match session.setup().await {
                Ok(()) => Ok(Session {
                    id: session.core().id(),
                    name: session.core().hostname().to_string(),
                    hostname: device.hostname.clone(),
                }),
                Err(e) => {
                    let e = annotate(&session, e);
                    session.close().await;
                    Err(e)
                },
            }
        }
        .await;
        res.map_err(|e| wrap(e, &uuid))
    }

    /// Runs one command on a previously opened session.
    pub async fn run_session(
        &self,
        session: &Session,
        command: &str,
        timeout_s: u64,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<CommandResult, RpcError> {
        let uuid = ensure_uuid(uuid);
        let res: Result<CommandResult> = async {
            validate::check_session(session)?;
            validate::check_command(command)?;
            let live = self
                .ctx
                .registry
                .get(session.id, client_ip, client_port)?;
            // Reused sessions report only this call's blocked time.
            live.core().captured().reset();
            self.run_on_session(&live, command, timeout_s, &uuid, None)
                .await
        }
        .await;
        res.map_err(|e| wrap(e, &uuid))
    }

    /// Runs one command on a raw session; `prompt_regex` delimits the
    /// output.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_raw_session(
        &self,
        session: &Session,
        command: &str,
        prompt_regex: &str,
        timeout_s: u64,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<CommandResult, RpcError> {
        let uuid = ensure_uuid(uuid);
        let res: Result<CommandResult> = async {
            validate::check_session(session)?;
            validate::check_command(command)?;
            let re = bytes_re(&format!("(?P<prompt>{prompt_regex})"))?;
            let live = self
                .ctx
                .registry
                .get(session.id, client_ip, client_port)?;
            live.core().captured().reset();
            self.run_on_session(&live, command, timeout_s, &uuid, Some(&re))
                .await
        }
        .await;
        res.map_err(|e| wrap(e, &uuid))
    }

    pub async fn close_session(
        &self,
        session: &Session,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<(), RpcError> {
        let uuid = ensure_uuid(uuid);
        let res: Result<()> = async {
            validate::check_session(session)?;
            let live = self
                .ctx
                .registry
                .get(session.id, client_ip, client_port)?;
            live.close().await;
            Ok(())
        }
        .await;
        res.map_err(|e| wrap(e, &uuid))
    }

    pub async fn close_raw_session(
        &self,
        session: &Session,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<(), RpcError> {
        self.close_session(session, client_ip, client_port, uuid).await
    }

    pub fn get_counters(&self) -> std::collections::BTreeMap<String, i64> {
        self.ctx.counters.get_all()
    }

    pub fn get_regex_counters(
        &self,
        pattern: &str,
    ) -> std::result::Result<std::collections::BTreeMap<String, i64>, RpcError> {
        self.ctx
            .counters
            .get_matching(pattern)
            .map_err(|e| RpcError::Session(e.to_wire()))
    }

    // --- internals ---

    /// Opens a scoped session, runs every command, and always closes it.
    /// Errors come back with the command that was executing when they
    /// happened, so bulk callers can report it.
    #[allow(clippy::too_many_arguments)]
    async fn run_commands(
        &self,
        device: &Device,
        commands: &[String],
        timeout_s: u64,
        open_timeout_s: u64,
        client_ip: &str,
        client_port: i32,
        uuid: &str,
    ) -> std::result::Result<Vec<CommandResult>, (SessionError, String)> {
        validate::check_device(device).map_err(|e| (e, String::new()))?;
        let opts = self
            .session_options(device, client_ip, client_port, open_timeout_s, timeout_s)
            .map_err(|e| (e, String::new()))?;
        let devinfo = self
            .catalog
            .get(&device.hostname, true)
            .await
            .map_err(|e| (e, String::new()))?;
        let session = self
            .build_session(&devinfo, opts)
            .map_err(|e| (e, String::new()))?;

        let mut current = String::new();
        let run = async {
            session.setup().await?;
            let mut results = Vec::with_capacity(commands.len());
            for command in commands {
                current = command.clone();
                results.push(
                    self.run_on_session(&session, command, timeout_s, uuid, None)
                        .await?,
                );
            }
            Ok(results)
        }
        .await;
        session.close().await;
        run.map_err(|e| (annotate(&session, e), current))
    }

    async fn run_on_session(
        &self,
        session: &Arc<CommandSession>,
        command: &str,
        timeout_s: u64,
        uuid: &str,
        prompt_override: Option<&regex::bytes::Regex>,
    ) -> Result<CommandResult> {
        let output = session
            .run_command(
                command.as_bytes(),
                Some(Duration::from_secs(timeout_s)),
                prompt_override,
            )
            .await?;
        debug!(
            captured_ms = session.core().captured().external_ms(),
            open_ms = session.core().open_time_ms(),
            "command finished"
        );
        Ok(CommandResult {
            output: String::from_utf8_lossy(&output).into_owned(),
            status: session
                .core()
                .exit_status()
                .unwrap_or_else(|| SUCCESS_STATUS.to_string()),
            command: command.to_string(),
            uuid: uuid.to_string(),
            capabilities: session
                .take_capabilities()
                .map(|h| String::from_utf8_lossy(&h).into_owned()),
        })
    }

    fn session_options(
        &self,
        device: &Device,
        client_ip: &str,
        client_port: i32,
        open_timeout_s: u64,
        idle_timeout_s: u64,
    ) -> Result<SessionOptions> {
        let session_data = device.session_data.clone().unwrap_or_default();
        let port_override = match session_data.extra_options.get("port") {
            Some(p) => Some(p.parse::<u16>().map_err(|_| {
                SessionError::validation(format!("Invalid port option: {p:?}"))
            })?),
            None => None,
        };
        let kick_shutdown = session_data
            .extra_options
            .get("kick_shutdown")
            .is_some_and(|v| v == "true" || v == "1");

        Ok(SessionOptions {
            client_ip: client_ip.to_string(),
            client_port,
            open_timeout: Duration::from_secs(open_timeout_s),
            idle_timeout: Duration::from_secs(idle_timeout_s),
            username: device.username.clone(),
            password: device.password.clone().unwrap_or_default(),
            console: device.console.clone(),
            command_prompts: device
                .command_prompts
                .as_ref()
                .map(|m| {
                    m.iter()
                        .map(|(c, p)| (c.as_bytes().to_vec(), p.as_bytes().to_vec()))
                        .collect()
                })
                .unwrap_or_default(),
            clear_command: device.clear_command.clone(),
            mgmt_ip: device.mgmt_ip,
            ip_address: device.ip_address.clone(),
            session_type: device.session_type,
            pre_setup_commands: device.pre_setup_commands.clone(),
            failover_to_backup_ips: device.failover_to_backup_ips,
            port_override,
            subsystem: session_data.subsystem.clone(),
            exec_command: session_data.exec_command.clone(),
            raw: false,
            kick_shutdown,
        })
    }

    /// Selects the session class and registers the new session.
    fn build_session(
        &self,
        devinfo: &Arc<DeviceInfo>,
        opts: SessionOptions,
    ) -> Result<Arc<CommandSession>> {
        let id = self.ctx.registry.next_id();
        let session = if opts.console.is_some() {
            CommandSession::Console(ConsoleSession::new(
                id,
                self.ctx.clone(),
                devinfo.clone(),
                opts,
            )?)
        } else {
            match devinfo
                .vendor()
                .select_session_type(opts.session_type, &self.ctx.counters)
            {
                SessionType::SshCli => CommandSession::Cli(CliSession::new(
                    id,
                    self.ctx.clone(),
                    devinfo.clone(),
                    opts,
                )),
                SessionType::SshNetconf => CommandSession::Netconf(NetconfSession::new(
                    id,
                    self.ctx.clone(),
                    devinfo.clone(),
                    opts,
                )?),
            }
        };
        let session = Arc::new(session);
        self.ctx.registry.insert(session.clone());
        Ok(session)
    }
}

fn ensure_uuid(uuid: &str) -> String {
    if uuid.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        uuid.to_string()
    }
}

/// Converts a library error into the wire exception, stamping the request
/// uuid for cross-system debugging.
fn wrap(e: SessionError, uuid: &str) -> RpcError {
    RpcError::Session(SessionException {
        message: format!("{e} (DebugInfo: thrift_uuid={uuid})"),
        code: e.kind(),
    })
}

/// Attaches the session breadcrumbs a failure needs to be actionable: which
/// session, which peer, and whether that peer was even pingable.
fn annotate(session: &Arc<CommandSession>, e: SessionError) -> SessionError {
    let peer = session.core().peer_info();
    let mut msg = match &peer {
        Some(p) => format!("Failed (session: {}, peer: {p})", session.core().name()),
        None => format!("Failed (session: {}, peer: None)", session.core().name()),
    };
    if peer.as_ref().is_some_and(|p| !p.is_pingable) {
        msg.push_str(", IP used in this connection is not pingable");
    }
    e.with_context(msg)
}
