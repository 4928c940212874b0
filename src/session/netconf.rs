// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use once_cell::sync::Lazy;
use quick_xml::events::Event;
use tracing::{error, warn};

use crate::{
    api::error::{ErrorCode, Result, SessionError},
    catalog::device::DeviceInfo,
    session::{
        SessionCore, SessionCtx, SessionOptions, lock_ok,
        cli::{CliSession, Dest},
        reader::StreamReader,
        transport::ChannelMode,
    },
};

/// Legacy NETCONF end-of-message delimiter.
pub const DELIM: &[u8] = b"]]>]]>";

static DELIM_RE: Lazy<regex::bytes::Regex> =
    Lazy::new(|| regex::bytes::Regex::new(r"\]\]>\]\]>").expect("static pattern"));

/// Matches a base-protocol capability URI and captures its version tail.
static BASE_CAPABILITY_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::RegexBuilder::new(r"(netconf:base:[0-9]+\.[0-9]+)$")
        .case_insensitive(true)
        .build()
        .expect("static pattern")
});

pub const HELLO_MESSAGE: &[u8] = b"<?xml version=\"1.0\"?>
<nc:hello xmlns:nc=\"urn:ietf:params:xml:ns:netconf:base:1.0\">
  <nc:capabilities>
  <nc:capability>urn:ietf:params:xml:ns:netconf:base:1.0</nc:capability>
  </nc:capabilities>
</nc:hello>
";

/// A delimiter-framed NETCONF session over an SSH subsystem or exec
/// command. No pseudo-terminal is allocated.
pub struct NetconfSession {
    cli: CliSession,
    server_hello: std::sync::Mutex<Option<Vec<u8>>>,
}

impl NetconfSession {
    pub fn new(
        id: u64,
        ctx: SessionCtx,
        devinfo: Arc<DeviceInfo>,
        opts: SessionOptions,
    ) -> Result<Self> {
        // One of subsystem/exec command is required to start the NETCONF
        // service on the remote side; subsystem wins when both are set.
        let mode = if let Some(subsystem) = &opts.subsystem {
            ChannelMode::Subsystem(subsystem.clone())
        } else if let Some(cmd) = &opts.exec_command {
            ChannelMode::Exec(cmd.clone())
        } else {
            return Err(SessionError::runtime(
                "either subsystem or exec_command must be specified for netconf session",
            ));
        };
        let cli = CliSession::with_parts(
            id,
            "netconf_session",
            ctx,
            devinfo,
            opts,
            mode,
            Dest::Device,
        );
        Ok(Self {
            cli,
            server_hello: std::sync::Mutex::new(None),
        })
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        self.cli.core()
    }

    pub fn reader(&self) -> &Arc<StreamReader> {
        self.cli.reader()
    }

    pub async fn create_connection(&self) -> Result<()> {
        self.cli.connect_transport().await?;
        self.core()
            .wait_until_connected(self.core().opts().open_timeout)
            .await?;
        self.exchange_hello().await
    }

    /// Hello exchange: store the peer's hello for the first reply, advertise
    /// our base capability, and require a common base protocol version.
    async fn exchange_hello(&self) -> Result<()> {
        let resp = self.reader().readuntil_re(&DELIM_RE, None, None).await?;
        // The synthetic newline injected at connect (and any framing
        // whitespace) is not part of the peer's hello.
        let peer_hello = resp.data.trim_ascii().to_vec();

        self.send_framed(HELLO_MESSAGE).await?;

        let local = capability_set(HELLO_MESSAGE);
        let peer = capability_set(&peer_hello);
        if local.is_disjoint(&peer) {
            error!("No common netconf base capability: local={local:?} peer={peer:?}");
            return Err(SessionError::unsupported_device(format!(
                "No common netconf base version with device: device capabilities {peer:?}"
            )));
        }

        *lock_ok(&self.server_hello) = Some(peer_hello);
        Ok(())
    }

    async fn send_framed(&self, payload: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(payload.len() + DELIM.len() + 2);
        framed.push(b'\n');
        framed.extend_from_slice(payload);
        framed.extend_from_slice(DELIM);
        framed.push(b'\n');
        self.cli.write_bytes(&framed).await
    }

    pub async fn run_command(
        &self,
        command: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        if !self.core().connected() {
            return Err(SessionError::runtime("Not Connected"));
        }
        self.send_framed(command).await?;
        let cmd_timeout = timeout
            .map(|t| t.min(self.core().devinfo().vendor().cmd_timeout()))
            .unwrap_or_else(|| self.core().devinfo().vendor().cmd_timeout());
        match self
            .reader()
            .readuntil_re(&DELIM_RE, Some(cmd_timeout), None)
            .await
        {
            Ok(resp) => Ok(resp.data.trim_ascii().to_vec()),
            Err(e) if e.kind() == ErrorCode::CommandExecutionTimeout => {
                error!("Timeout waiting for command response");
                let data = self.reader().drain();
                let tail = &data[data.len().saturating_sub(200)..];
                Err(SessionError::command_timeout("Command Response Timeout")
                    .with_context(String::from_utf8_lossy(tail).into_owned()))
            },
            Err(e) => Err(e),
        }
    }

    /// The stored peer hello, handed out exactly once so only the first
    /// reply of the session carries it.
    pub fn take_server_hello(&self) -> Option<Vec<u8>> {
        lock_ok(&self.server_hello).take()
    }

    pub async fn close(&self) {
        self.cli.close().await;
    }
}

/// Extracts the set of advertised base-protocol versions from a hello
/// message. Capability URIs vary in prefix between implementations, so
/// elements are normalized to their `netconf:base:X.Y` tail.
pub fn capability_set(hello: &[u8]) -> BTreeSet<String> {
    let mut capabilities = BTreeSet::new();
    let mut reader = quick_xml::Reader::from_reader(hello);
    let mut buf = Vec::new();
    let mut in_capability = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                in_capability = e.name().as_ref().ends_with(b"capability");
            },
            Ok(Event::Text(t)) if in_capability => {
                let text = String::from_utf8_lossy(t.as_ref());
                let text = text.trim();
                if let Some(caps) = BASE_CAPABILITY_RE.captures(text)
                    && let Some(m) = caps.get(1)
                {
                    capabilities.insert(m.as_str().to_ascii_lowercase());
                }
            },
            Ok(Event::End(_)) => {
                in_capability = false;
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("failed to parse hello message: {e}");
                break;
            },
            Ok(_) => {},
        }
        buf.clear();
    }

    capabilities
}
