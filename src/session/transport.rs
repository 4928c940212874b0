// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use async_ssh2_tokio::{AuthMethod, Client, ServerCheckMethod};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::api::error::{Result, SessionError};

/// Byte stream of an established session channel.
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionStream for T {}

/// How the channel is started once the SSH connection is up. The protocol
/// defines three ways to start a session: a regular shell (CLI), a
/// preconfigured subsystem, or an exec command (both used by NETCONF).
#[derive(Debug, Clone)]
pub enum ChannelMode {
    Shell { term: String },
    Subsystem(String),
    Exec(String),
}

/// Connection parameters for one dial attempt.
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mode: ChannelMode,
}

/// Handle kept for teardown of an established transport.
#[async_trait]
pub trait TransportControl: Send + Sync {
    async fn shutdown(&self);
}

/// Opens authenticated interactive channels to devices. The production
/// implementation speaks SSH; tests substitute an in-memory transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, target: &DialTarget) -> Result<Dialed>;
}

pub struct Dialed {
    pub stream: Box<dyn SessionStream>,
    pub control: Box<dyn TransportControl>,
}

/// Address rewrite hooks applied before dialing. The defaults are identity;
/// deployments with HTTP proxies or NAT override them.
#[async_trait]
pub trait AddressRewriter: Send + Sync {
    fn proxy_required(&self, _ip: &str) -> bool {
        false
    }

    fn proxy_url(&self, ip: &str) -> String {
        ip.to_string()
    }

    fn should_nat(&self, _ip: &str) -> bool {
        false
    }

    async fn translate_address(&self, ip: &str) -> String {
        ip.to_string()
    }

    /// Applies whichever rewrite is configured for this address.
    async fn rewrite(&self, ip: &str) -> String {
        if self.proxy_required(ip) {
            self.proxy_url(ip)
        } else if self.should_nat(ip) {
            self.translate_address(ip).await
        } else {
            ip.to_string()
        }
    }
}

/// The identity rewriter: addresses are dialed as-is.
pub struct IdentityRewriter;

#[async_trait]
impl AddressRewriter for IdentityRewriter {}

/// SSH connector. Host-key verification is disabled; without that the
/// connection setup fails for a lot of network equipment.
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn dial(&self, target: &DialTarget) -> Result<Dialed> {
        debug!("Connecting to: {}:{}", target.host, target.port);

        let client = Client::connect(
            (target.host.as_str(), target.port),
            &target.username,
            AuthMethod::with_password(&target.password),
            ServerCheckMethod::NoCheck,
        )
        .await
        .map_err(|e| {
            SessionError::connection(format!(
                "SSH connect to {}:{} failed: {e}",
                target.host, target.port
            ))
        })?;

        let channel = client
            .get_channel()
            .await
            .map_err(|e| SessionError::connection(format!("SSH channel open failed: {e}")))?;

        match &target.mode {
            ChannelMode::Shell { term } => {
                let modes: &[(russh::Pty, u32)] = &[];
                channel
                    .request_pty(false, term, 0, 0, 0, 0, modes)
                    .await
                    .map_err(|e| {
                        SessionError::connection(format!("pty request failed: {e}"))
                    })?;
                channel.request_shell(true).await.map_err(|e| {
                    SessionError::connection(format!("shell request failed: {e}"))
                })?;
            },
            ChannelMode::Subsystem(name) => {
                channel.request_subsystem(true, name).await.map_err(|e| {
                    SessionError::connection(format!("subsystem {name:?} denied: {e}"))
                })?;
            },
            ChannelMode::Exec(command) => {
                channel
                    .exec(true, command.as_bytes())
                    .await
                    .map_err(|e| {
                        SessionError::connection(format!("exec {command:?} failed: {e}"))
                    })?;
            },
        }

        Ok(Dialed {
            stream: Box::new(channel.into_stream()),
            control: Box::new(SshControl { client }),
        })
    }
}

struct SshControl {
    client: Client,
}

#[async_trait]
impl TransportControl for SshControl {
    async fn shutdown(&self) {
        let _ = self.client.disconnect().await;
    }
}
