// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use command_runner_rs::{
    api::{
        error::{Result, SessionError},
        types::Device,
    },
    catalog::db::DeviceSource,
    catalog::device::{DeviceIp, DeviceRecordData},
    cfg::config::ServiceConfig,
    handler::dispatcher::{BulkResults, DeviceCommands, PeerClient},
    service::{Service, ServiceParts},
    session::transport::{
        AddressRewriter, Connector, DialTarget, Dialed, IdentityRewriter, TransportControl,
    },
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const VENDOR_JSON: &str = r#"{
  "vendor_config": {
    "mock": {
      "prompt_regex": ["[$#]"],
      "cli_setup": ["term len 0", "term width 511"]
    },
    "mock-console": {
      "prompt_regex": ["console#"],
      "cli_setup": []
    },
    "mock-netconf": {
      "prompt_regex": ["[$#]"],
      "session_type": "ssh-netconf"
    }
  }
}"#;

pub const PEER_HELLO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<hello xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
  <capabilities>
    <capability>urn:ietf:params:netconf:base:1.0</capability>
    <capability>urn:ietf:params:netconf:base:1.1</capability>
    <capability>urn:ietf:params:netconf:capability:validate:1.1</capability>
  </capabilities>
</hello>"#;

pub const PEER_HELLO_V11_ONLY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<hello xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
  <capabilities>
    <capability>urn:ietf:params:netconf:base:1.1</capability>
  </capabilities>
</hello>"#;

/// Behavior knobs for the scripted mock device behind the connector seam.
#[derive(Debug, Clone)]
pub struct MockOptions {
    pub prompt_delay: Duration,
    pub command_delay: Duration,
    /// Never send anything; connections appear dead.
    pub silent: bool,
    /// Refuse the dial outright.
    pub refuse: bool,
    /// Behave like a console server with a login handshake.
    pub console: bool,
    /// Behave like a NETCONF subsystem.
    pub netconf: bool,
    pub peer_hello: String,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            prompt_delay: Duration::ZERO,
            command_delay: Duration::ZERO,
            silent: false,
            refuse: false,
            console: false,
            netconf: false,
            peer_hello: PEER_HELLO.to_string(),
        }
    }
}

fn command_outputs() -> HashMap<&'static [u8], &'static [u8]> {
    let mut m: HashMap<&'static [u8], &'static [u8]> = HashMap::new();
    m.insert(b"en\n", b"en\n$");
    m.insert(b"term len 0\n", b"term len 0\n$");
    m.insert(b"term width 511\n", b"term width 511\n$");
    m.insert(b"test1\n", b"test1\nMock response for test1\n$");
    m.insert(
        b"show version\n",
        b"show version\nMock response for show version\n$",
    );
    m.insert(
        b"command timeout\n",
        b"command timeout\nMock response for command timeout",
    );
    m.insert(
        b"user prompt test\n",
        b"user prompt test\nTest for user prompts\n<<<User Magic Prompt>>>",
    );
    m
}

/// Connector producing an in-memory duplex transport with a scripted device
/// task on the far side.
pub struct MockConnector {
    pub opts: MockOptions,
}

struct NoopControl;

#[async_trait]
impl TransportControl for NoopControl {
    async fn shutdown(&self) {}
}

#[async_trait]
impl Connector for MockConnector {
    async fn dial(&self, _target: &DialTarget) -> Result<Dialed> {
        if self.opts.refuse {
            return Err(SessionError::connection("connection refused"));
        }
        let (local, remote) = tokio::io::duplex(1 << 16);
        let opts = self.opts.clone();
        tokio::spawn(async move {
            if opts.silent {
                run_silent_device(remote).await;
            } else if opts.netconf {
                run_netconf_device(remote, opts).await;
            } else if opts.console {
                run_console_device(remote, opts).await;
            } else {
                run_cli_device(remote, opts).await;
            }
        });
        Ok(Dialed {
            stream: Box::new(local),
            control: Box::new(NoopControl),
        })
    }
}

async fn run_silent_device(mut stream: DuplexStream) {
    let mut buf = [0u8; 1024];
    while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
}

/// Reads device input a byte at a time, dropping NAK (clear-line) bytes and
/// yielding complete lines including their newline.
async fn next_line(stream: &mut DuplexStream, pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = pending.drain(..=pos).collect();
            line.retain(|&b| b != 0x15);
            return Some(line);
        }
        let mut buf = [0u8; 1024];
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
        }
    }
}

async fn run_cli_device(mut stream: DuplexStream, opts: MockOptions) {
    tokio::time::sleep(opts.prompt_delay).await;
    if stream.write_all(b"\n$").await.is_err() {
        return;
    }
    let outputs = command_outputs();
    let mut pending = Vec::new();
    while let Some(line) = next_line(&mut stream, &mut pending).await {
        tokio::time::sleep(opts.command_delay).await;
        let response: Vec<u8> = match outputs.get(line.as_slice()) {
            Some(r) => r.to_vec(),
            None => {
                let mut echoed = line.clone();
                echoed.extend_from_slice(b"$");
                echoed
            },
        };
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

async fn run_console_device(mut stream: DuplexStream, opts: MockOptions) {
    tokio::time::sleep(opts.prompt_delay).await;
    if stream
        .write_all(b"\nLast login: Mon May  8 13:53:17 on ttyS0\r\nsomehost login: ")
        .await
        .is_err()
    {
        return;
    }

    let mut pending = Vec::new();
    // Username then password, no matter their values.
    if next_line(&mut stream, &mut pending).await.is_none() {
        return;
    }
    if stream.write_all(b"\nPassword: ").await.is_err() {
        return;
    }
    if next_line(&mut stream, &mut pending).await.is_none() {
        return;
    }
    if stream.write_all(b"\nconsole# ").await.is_err() {
        return;
    }

    while let Some(line) = next_line(&mut stream, &mut pending).await {
        let trimmed: Vec<u8> = line
            .iter()
            .copied()
            .filter(|&b| b != b'\r' && b != b'\n')
            .collect();
        let response: Vec<u8> = if trimmed.is_empty() {
            b"\nconsole# ".to_vec()
        } else if trimmed == b"exit" {
            if stream.write_all(b"\nsomehost login: ").await.is_err() {
                return;
            }
            continue;
        } else {
            let mut r = trimmed.clone();
            r.extend_from_slice(b"\nMock response for ");
            r.extend_from_slice(&trimmed);
            r.extend_from_slice(b"\nconsole# ");
            r
        };
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

async fn run_netconf_device(mut stream: DuplexStream, opts: MockOptions) {
    const DELIM: &[u8] = b"]]>]]>";

    tokio::time::sleep(opts.prompt_delay).await;
    let mut hello = opts.peer_hello.clone().into_bytes();
    hello.extend_from_slice(DELIM);
    if stream.write_all(&hello).await.is_err() {
        return;
    }

    let mut pending: Vec<u8> = Vec::new();
    let mut frames_seen = 0usize;
    loop {
        if let Some(pos) = find_delim(&pending, DELIM) {
            pending.drain(..pos + DELIM.len());
            frames_seen += 1;
            // The first frame is the client hello; answer the rest.
            if frames_seen > 1 {
                tokio::time::sleep(opts.command_delay).await;
                if stream
                    .write_all(b"<rpc-reply>ok</rpc-reply>]]>]]>")
                    .await
                    .is_err()
                {
                    return;
                }
            }
            continue;
        }
        let mut buf = [0u8; 1024];
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
        }
    }
}

fn find_delim(buf: &[u8], delim: &[u8]) -> Option<usize> {
    buf.windows(delim.len()).position(|w| w == delim)
}

/// Device source seeded with a fixed set of (hostname, vendor) pairs.
pub struct MockSource {
    pub entries: Vec<(String, String)>,
}

impl MockSource {
    pub fn with_hosts(hosts: &[&str]) -> Self {
        Self {
            entries: hosts
                .iter()
                .map(|h| (h.to_string(), "mock".to_string()))
                .collect(),
        }
    }

    fn record(hostname: &str, vendor: &str) -> DeviceRecordData {
        DeviceRecordData {
            hostname: hostname.to_string(),
            alias: Some(format!("{hostname}.alias")),
            pref_ips: vec![DeviceIp {
                name: "eth0".to_string(),
                addr: "10.1.1.1".to_string(),
                mgmt: false,
            }],
            ip: DeviceIp {
                name: "lo0".to_string(),
                addr: "10.0.0.1".to_string(),
                mgmt: true,
            },
            vendor: vendor.to_string(),
            role: "test".to_string(),
            ch_model: "mock-1".to_string(),
        }
    }
}

#[async_trait]
impl DeviceSource for MockSource {
    async fn fetch(
        &self,
        name_filter: Option<&regex::Regex>,
        hostname: Option<&str>,
    ) -> Result<Vec<DeviceRecordData>> {
        Ok(self
            .entries
            .iter()
            .filter(|(h, _)| hostname.is_none_or(|want| want == h))
            .filter(|(h, _)| name_filter.is_none_or(|f| f.is_match(h)))
            .map(|(h, v)| Self::record(h, v))
            .collect())
    }
}

/// Peer client that fabricates one successful result per device, optionally
/// failing the first calls with an overload.
pub struct MockPeer {
    pub calls: std::sync::atomic::AtomicUsize,
    pub overload_first: usize,
}

impl Default for MockPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeer {
    pub fn new() -> Self {
        Self {
            calls: std::sync::atomic::AtomicUsize::new(0),
            overload_first: 0,
        }
    }

    pub fn overloading(n: usize) -> Self {
        Self {
            calls: std::sync::atomic::AtomicUsize::new(0),
            overload_first: n,
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[allow(clippy::too_many_arguments)]
#[async_trait]
impl PeerClient for MockPeer {
    async fn bulk_run_local(
        &self,
        chunk: DeviceCommands,
        _timeout: Duration,
        _open_timeout: Duration,
        _client_ip: &str,
        _client_port: i32,
        uuid: &str,
    ) -> std::result::Result<BulkResults, command_runner_rs::api::error::RpcError> {
        let call = self
            .calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if call < self.overload_first {
            return Err(command_runner_rs::api::error::RpcError::Overloaded(
                command_runner_rs::api::error::InstanceOverloaded {
                    message: "peer overloaded".to_string(),
                },
            ));
        }
        Ok(chunk
            .into_iter()
            .map(|(device, commands)| {
                let results = commands
                    .into_iter()
                    .map(|command| command_runner_rs::api::types::CommandResult {
                        output: format!("{}: remote ok", device.hostname),
                        status: "success".to_string(),
                        command,
                        uuid: uuid.to_string(),
                        capabilities: None,
                    })
                    .collect();
                (device.hostname, results)
            })
            .collect())
    }
}

/// Builds a fully wired service against the mock device world.
pub fn mock_service(
    mock: MockOptions,
    hosts: Vec<(String, String)>,
    tweak: impl FnOnce(&mut ServiceConfig),
    peers: Option<Arc<dyn PeerClient>>,
) -> Arc<Service> {
    // Keep tests quick unless a test opts back in.
    let mut cfg = ServiceConfig {
        bulk_run_jitter: 0,
        bulk_retry_delay_min: 0,
        bulk_retry_delay_max: 0,
        ..ServiceConfig::default()
    };
    tweak(&mut cfg);

    let parts = ServiceParts {
        source: Arc::new(MockSource { entries: hosts }),
        connector: Arc::new(MockConnector { opts: mock }),
        rewriter: Arc::new(IdentityRewriter) as Arc<dyn AddressRewriter>,
        peers,
    };
    let service = Service::new(cfg, parts).expect("service builds");
    service.vendors.load(VENDOR_JSON).expect("vendor config loads");
    service
}

pub fn cli_hosts(hosts: &[&str]) -> Vec<(String, String)> {
    hosts
        .iter()
        .map(|h| (h.to_string(), "mock".to_string()))
        .collect()
}

pub fn test_device(hostname: &str) -> Device {
    Device {
        hostname: hostname.to_string(),
        username: "netbot".to_string(),
        password: Some("netpass".to_string()),
        ..Device::default()
    }
}
