// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use once_cell::sync::Lazy;
use regex::bytes::{NoExpand, Regex};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex as AsyncMutex,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    api::error::{ErrorCode, Result, SessionError},
    catalog::device::{DeviceInfo, IpInfo, get_ip},
    session::{
        PeerInfo, SessionCore, SessionCtx, SessionOptions, lock_ok,
        reader::{BUFFER_LIMIT, ResponseMatch, StreamReader},
        transport::{ChannelMode, TransportControl},
    },
};

/// The prompt is at the end of the input, so the regex only searches this
/// much trailing data instead of the entire buffer.
pub const MAX_PROMPT_SIZE: usize = 100;

/// `<any>\x08` (backspace eating the previous char) and BEL.
static SPECIAL_CHAR_RE: Lazy<Regex> = Lazy::new(|| {
    regex::bytes::RegexBuilder::new(r".\x08|\x07")
        .unicode(false)
        .build()
        .expect("static pattern")
});

/// `\r+\n`, `\n\r+` and standalone `\r` all collapse to `\n`.
static NEWLINE_REPLACE_RE: Lazy<Regex> = Lazy::new(|| {
    regex::bytes::RegexBuilder::new(r"(\r+\n)|(\n\r+)|\r")
        .unicode(false)
        .build()
        .expect("static pattern")
});

/// Where the transport points: the device itself, or a console server in
/// front of it.
#[derive(Debug, Clone)]
pub enum Dest {
    Device,
    Console { server: String, port: u16 },
}

/// A command session doing prompt processing over an interactive SSH
/// channel.
pub struct CliSession {
    core: Arc<SessionCore>,
    reader: Arc<StreamReader>,
    writer: AsyncMutex<Option<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>>,
    control: AsyncMutex<Option<Box<dyn TransportControl>>>,
    feed_task: Mutex<Option<JoinHandle<()>>>,
    mode: ChannelMode,
    dest: Dest,
}

impl CliSession {
    pub fn new(
        id: u64,
        ctx: SessionCtx,
        devinfo: Arc<DeviceInfo>,
        opts: SessionOptions,
    ) -> Self {
        Self::with_parts(
            id,
            "cli_session",
            ctx,
            devinfo,
            opts,
            ChannelMode::Shell {
                term: "vt100".to_string(),
            },
            Dest::Device,
        )
    }

    pub(crate) fn with_parts(
        id: u64,
        kind_name: &'static str,
        ctx: SessionCtx,
        devinfo: Arc<DeviceInfo>,
        opts: SessionOptions,
        mode: ChannelMode,
        dest: Dest,
    ) -> Self {
        let core = Arc::new(SessionCore::new(id, kind_name, ctx, devinfo, opts));
        let reader = Arc::new(StreamReader::new(
            BUFFER_LIMIT,
            core.captured().clone(),
            core.ctx().counters.clone(),
        ));
        Self {
            core,
            reader,
            writer: AsyncMutex::new(None),
            control: AsyncMutex::new(None),
            feed_task: Mutex::new(None),
            mode,
            dest,
        }
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn reader(&self) -> &Arc<StreamReader> {
        &self.reader
    }

    /// Full connection bring-up: transport, connected signal, then the
    /// interactive setup sequence.
    pub async fn create_connection(&self) -> Result<()> {
        self.connect_transport().await?;
        self.core
            .wait_until_connected(self.core.opts().open_timeout)
            .await?;
        self.setup_connection().await
    }

    /// Resolves the connection candidates for this session.
    fn candidates(&self) -> Result<(Vec<IpInfo>, u16)> {
        let ctx = self.core.ctx();
        let opts = self.core.opts();
        match &self.dest {
            Dest::Device => {
                let ips = get_ip(
                    opts.ip_address.as_deref(),
                    opts.mgmt_ip,
                    self.core.devinfo(),
                    ctx.ping.as_ref(),
                    &ctx.counters,
                )?;
                let port = opts
                    .port_override
                    .unwrap_or_else(|| self.core.devinfo().vendor().port());
                Ok((ips, port))
            },
            Dest::Console { server, port } => Ok((
                vec![IpInfo {
                    addr: server.clone(),
                    is_pingable: ctx.ping.is_pingable(server),
                }],
                *port,
            )),
        }
    }

    /// Opens the transport, trying candidate addresses in order when
    /// failover is enabled.
    pub(crate) async fn connect_transport(&self) -> Result<()> {
        let (ip_list, port) = self.candidates()?;
        debug!("Order in which ips will be tried: {ip_list:?}");

        let res = if !self.core.opts().failover_to_backup_ips {
            // Use the first candidate only.
            let ip = &ip_list[0];
            self.core.set_peer_info(PeerInfo {
                ip: ip.addr.clone(),
                is_pingable: ip.is_pingable,
                port,
            });
            self.connect_to_ip(ip, port).await
        } else {
            let mut ips_tried: Vec<String> = Vec::new();
            let mut last_err = None;
            for ip in &ip_list {
                self.core.set_peer_info(PeerInfo {
                    ip: ip.addr.clone(),
                    is_pingable: ip.is_pingable,
                    port,
                });
                match self.connect_to_ip(ip, port).await {
                    Ok(()) => {
                        last_err = None;
                        break;
                    },
                    Err(e) => {
                        error!("Connection to {} failed: {e}", ip.addr);
                        ips_tried.push(ip.addr.clone());
                        last_err = Some(e);
                    },
                }
            }
            match last_err {
                None => Ok(()),
                Some(e) => {
                    Err(e.with_context(format!("IPs that failed to connect: {ips_tried:?}")))
                },
            }
        };

        match res {
            Ok(()) => {
                self.core.inc_counter("connected");
                info!("Connected: {:?}", self.core.peer_info());
                Ok(())
            },
            Err(e) => {
                error!("Connect failed: {e}");
                self.core.inc_counter("failed");
                Err(e)
            },
        }
    }

    async fn connect_to_ip(&self, ip: &IpInfo, port: u16) -> Result<()> {
        let ctx = self.core.ctx();
        let host = ctx.rewriter.rewrite(&ip.addr).await;
        let opts = self.core.opts();

        let started = Instant::now();
        let dialed = ctx
            .connector
            .dial(&crate::session::transport::DialTarget {
                host,
                port,
                username: opts.username.clone(),
                password: opts.password.clone(),
                mode: self.mode.clone(),
            })
            .await?;
        self.core.captured().add(started.elapsed());

        let (read_half, write_half) = tokio::io::split(dialed.stream);
        *self.writer.lock().await = Some(Box::new(write_half));
        *self.control.lock().await = Some(dialed.control);

        // Some devices don't send a newline before the first prompt, which
        // would break prompt matching. Injecting one normalizes all cases.
        self.reader.feed(b"\n");
        self.reader.set_timing_enabled(true);

        let reader = self.reader.clone();
        let core = self.core.clone();
        let task = tokio::spawn(async move {
            let mut stream = read_half;
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => reader.feed(&buf[..n]),
                    Err(e) => {
                        debug!("session stream read error: {e}");
                        break;
                    },
                }
            }
            core.set_exit_status("eof");
            core.set_connected(false);
            reader.feed_eof();
        });
        *lock_ok(&self.feed_task) = Some(task);

        self.core.set_connected(true);
        Ok(())
    }

    /// Interactive setup: wait for the first prompt, then send the device's
    /// pre-setup commands and the vendor's setup commands (e.g. disabling
    /// paging). Raw sessions skip all of it.
    pub(crate) async fn setup_connection(&self) -> Result<()> {
        if self.core.opts().raw {
            return Ok(());
        }
        self.wait_prompt(None, None).await?;
        let pre_setup = self.core.opts().pre_setup_commands.clone();
        for cmd in &pre_setup {
            debug!("Sending pre setup command: {cmd}");
            self.run_command(format!("{cmd}\n").as_bytes(), None, None)
                .await?;
        }
        let setup = self.core.devinfo().vendor().cli_setup().to_vec();
        for cmd in &setup {
            debug!("Sending setup command: {cmd}");
            self.run_command(format!("{cmd}\n").as_bytes(), None, None)
                .await?;
        }
        Ok(())
    }

    /// Waits for a prompt, searching only the trailing window of the
    /// buffer.
    pub(crate) async fn wait_prompt(
        &self,
        prompt_re: Option<&Regex>,
        timeout: Option<Duration>,
    ) -> Result<ResponseMatch> {
        let vendor_re = self.core.devinfo().vendor().prompt_re().clone();
        let re = prompt_re.unwrap_or(&vendor_re);
        self.reader
            .readuntil_re(re, timeout, Some(MAX_PROMPT_SIZE))
            .await
    }

    pub(crate) async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| SessionError::runtime("Not Connected"))?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Runs a command and returns the formatted response.
    pub async fn run_command(
        &self,
        command: &[u8],
        timeout: Option<Duration>,
        prompt_override: Option<&Regex>,
    ) -> Result<Vec<u8>> {
        if !self.core.connected() {
            return Err(SessionError::runtime("Not Connected")
                .with_context(format!("status: {:?}", self.core.exit_status())));
        }

        if self.core.opts().raw {
            return self.run_raw(command, timeout, prompt_override).await;
        }

        // There should be no data on the stream; drain any stale bytes so we
        // start from a sane state.
        let stale = self.reader.drain();
        if !stale.is_empty() {
            warn!("Stale data on session: {:?}", String::from_utf8_lossy(&stale));
        }

        let mut output: Vec<Vec<u8>> = Vec::new();
        for line in split_lines(command) {
            let cmdinfo = self.core.devinfo().get_command_info(
                &line,
                Some(&self.core.opts().command_prompts),
                self.core.opts().clear_command.as_deref(),
            )?;

            info!("RUN: {:?}", String::from_utf8_lossy(&cmdinfo.cmd));

            if let Some(precmd) = &cmdinfo.precmd {
                self.write_bytes(precmd).await?;
            }
            self.write_bytes(&cmdinfo.cmd).await?;

            let cmd_timeout = effective_timeout(
                timeout,
                self.core.devinfo().vendor().cmd_timeout(),
            );
            let prompt = prompt_override.unwrap_or(&cmdinfo.prompt_re);
            match self
                .reader
                .readuntil_re(prompt, Some(cmd_timeout), Some(MAX_PROMPT_SIZE))
                .await
            {
                Ok(resp) => output.push(format_output(&line, &resp)),
                Err(e) if e.kind() == ErrorCode::CommandExecutionTimeout => {
                    error!("Timeout waiting for command response");
                    let data = self.reader.drain();
                    let tail = &data[data.len().saturating_sub(200)..];
                    return Err(SessionError::command_timeout("Command Response Timeout")
                        .with_context(String::from_utf8_lossy(tail).into_owned()));
                },
                Err(e) => return Err(e),
            }
        }

        let mut joined = output.join(&b"\n"[..]);
        let end = joined.trim_ascii_end().len();
        joined.truncate(end);
        Ok(joined)
    }

    /// Raw mode: send the command as-is, wait for the caller's regex, and
    /// return the unformatted capture including the matched bytes.
    async fn run_raw(
        &self,
        command: &[u8],
        timeout: Option<Duration>,
        prompt_re: Option<&Regex>,
    ) -> Result<Vec<u8>> {
        let re = prompt_re.ok_or_else(|| {
            SessionError::validation("Raw sessions require an explicit prompt regex")
        })?;
        self.write_bytes(command).await?;
        let cmd_timeout =
            effective_timeout(timeout, self.core.devinfo().vendor().cmd_timeout());
        match self.reader.readuntil_re(re, Some(cmd_timeout), None).await {
            Ok(resp) => {
                let mut out = resp.data.to_vec();
                out.extend_from_slice(&resp.matched);
                Ok(out)
            },
            Err(e) if e.kind() == ErrorCode::CommandExecutionTimeout => {
                let data = self.reader.drain();
                let tail = &data[data.len().saturating_sub(200)..];
                Err(SessionError::command_timeout("Command Response Timeout")
                    .with_context(String::from_utf8_lossy(tail).into_owned()))
            },
            Err(e) => Err(e),
        }
    }

    pub async fn close(&self) {
        debug!("Closing session");
        self.core.ctx().registry.remove(&self.core.key());

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(control) = self.control.lock().await.take() {
            control.shutdown().await;
        }
        if let Some(task) = lock_ok(&self.feed_task).take() {
            task.abort();
        }
        self.core.set_connected(false);
        self.core.inc_counter("closed");
    }
}

fn effective_timeout(caller: Option<Duration>, vendor: Duration) -> Duration {
    match caller {
        Some(t) => t.min(vendor),
        None => vendor,
    }
}

/// Splits a command blob at line boundaries the way terminals see it: a
/// trailing newline does not produce an empty command.
pub(crate) fn split_lines(command: &[u8]) -> Vec<Vec<u8>> {
    let mut lines: Vec<Vec<u8>> = command
        .split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l).to_vec())
        .collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Removes backspace-eaten characters and bells, then normalizes all line
/// endings to `\n`.
pub fn fixup_whitespace(output: &[u8]) -> Vec<u8> {
    let out = SPECIAL_CHAR_RE.replace_all(output, &b""[..]);
    let out = NEWLINE_REPLACE_RE.replace_all(&out, &b"\n"[..]);
    out.trim_ascii().to_vec()
}

/// Formats command output as `<prompt> <command>\n<command-output>`.
///
/// The first command echo in the capture is replaced with the canonical
/// command string (redundant spaces removed), since some devices insert
/// backspaces or rewrap the echoed command.
pub fn format_output(cmd: &[u8], resp: &ResponseMatch) -> Vec<u8> {
    let cmd_words: Vec<&[u8]> = cmd.split(|b| b.is_ascii_whitespace()).filter(|w| !w.is_empty()).collect();

    let cmd_output = fixup_whitespace(&resp.data);

    let escaped: Vec<String> = cmd_words
        .iter()
        .map(|w| regex::escape(&String::from_utf8_lossy(w)))
        .collect();
    let echo_pattern = format!(r"^\s*{}([ \t]*\n)*", escaped.join(r"\s+"));

    let canonical = {
        let mut c = cmd_words.join(&b" "[..]);
        c.push(b'\n');
        c
    };

    let replaced = match regex::bytes::RegexBuilder::new(&echo_pattern)
        .multi_line(true)
        .unicode(false)
        .build()
    {
        Ok(re) => re.replacen(&cmd_output, 1, NoExpand(&canonical)).into_owned(),
        Err(_) => cmd_output,
    };

    let matched: &[u8] = &resp.matched;
    let mut out = matched.trim_ascii().to_vec();
    out.push(b' ');
    out.extend_from_slice(&replaced);
    out
}
