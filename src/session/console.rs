// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::{
    api::error::{ErrorCode, Result, SessionError},
    catalog::device::DeviceInfo,
    session::{
        SessionCore, SessionCtx, SessionOptions,
        cli::{CliSession, Dest},
        reader::{ResponseMatch, StreamReader},
        transport::ChannelMode,
    },
};

/// How long to wait for each login-phase chunk before concluding the
/// console needs a nudge.
const CONSOLE_EXPECT_DELAY: Duration = Duration::from_secs(5);

/// The login regex: named alternatives for every kind of text a console can
/// show during login. `ignore` is listed first so noise like the previous
/// session's `Last login:` line never counts as a login prompt.
static CONSOLE_PROMPT_RE: Lazy<Regex> = Lazy::new(|| {
    let ignore = [
        r"Last login:[^\n]*",
        r" to cli \]",
        r"who is on this device\.\]\r\n",
        r"Press RETURN to get started\r\n",
    ]
    .map(|p| format!("({p})"))
    .join("|");
    let pattern = format!(
        "(?:(?P<ignore>{ignore})|(?P<login>[^\\n]*(?:[Ll]ogin|[Uu]sername):)|(?P<passwd>\\n[^\\n]*assword:)|(?P<interact>\\[[Yy]/[Nn]\\]\\??:?)|(?P<prompt>\\n[^\\n]*[#>]))\\s*$"
    );
    regex::bytes::RegexBuilder::new(&pattern)
        .unicode(false)
        .build()
        .expect("static pattern")
});

/// A command session running over a console server. The transport goes to
/// the console server's SSH endpoint; a login state machine brings the
/// attached device to a usable prompt before normal setup runs.
pub struct ConsoleSession {
    cli: CliSession,
}

impl ConsoleSession {
    pub fn new(
        id: u64,
        ctx: SessionCtx,
        devinfo: Arc<DeviceInfo>,
        opts: SessionOptions,
    ) -> Result<Self> {
        let console = opts
            .console
            .clone()
            .ok_or_else(|| SessionError::validation("Console session without console target"))?;
        let (server, port) = parse_console(&console)?;
        info!("console: {}:{port}", server);
        let cli = CliSession::with_parts(
            id,
            "console_session",
            ctx,
            devinfo,
            opts,
            ChannelMode::Shell {
                term: "vt100".to_string(),
            },
            Dest::Console { server, port },
        );
        Ok(Self { cli })
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
        self.login().await?;
        self.cli.setup_connection().await
    }

    pub async fn run_command(
        &self,
        command: &[u8],
        timeout: Option<Duration>,
        prompt_override: Option<&Regex>,
    ) -> Result<Vec<u8>> {
        self.cli.run_command(command, timeout, prompt_override).await
    }

    /// Waits for login-phase output; `None` means the console stayed silent
    /// for the whole expect delay.
    async fn expect(&self, re: &Regex, timeout: Duration) -> Result<Option<ResponseMatch>> {
        match self.reader().readuntil_re(re, Some(timeout), None).await {
            Ok(resp) => Ok(Some(resp)),
            Err(e) if e.kind() == ErrorCode::CommandExecutionTimeout => {
                info!("Timeout waiting for console output");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    /// Drives the console through its login handshake.
    ///
    /// Consoles are slow and noisy: ignorable banners get a bare carriage
    /// return, repeated login/password prompts mean the credentials were
    /// rejected, and a silent console gets one kickstart nudge before
    /// giving up.
    async fn login(&self) -> Result<()> {
        let opts = self.core().opts().clone();
        let login_timeout = self.core().ctx().cfg.console_login_timeout_s;

        let mut user_sent = false;
        let mut pass_sent = false;
        let mut kicked = false;
        let mut next_timeout = CONSOLE_EXPECT_DELAY;

        // A small delay to avoid having to match extraneous input.
        sleep(Duration::from_millis(100)).await;

        loop {
            let Some(resp) = self.expect(&CONSOLE_PROMPT_RE, next_timeout).await? else {
                if !kicked && !user_sent {
                    // Give a stuck console one chance to show a prompt.
                    debug!("kickstarting console");
                    kicked = true;
                    self.cli.write_bytes(b"\x15\r\n").await?;
                    continue;
                }
                return Err(SessionError::permission("Failed to login to console"));
            };
            next_timeout = CONSOLE_EXPECT_DELAY;

            if resp.group("ignore").is_some() {
                self.cli.write_bytes(b"\r").await?;
                // Let the console catch up.
                sleep(Duration::from_millis(200)).await;
            } else if resp.group("login").is_some() {
                if user_sent {
                    return Err(SessionError::permission(
                        "Failed to login: Login not expected",
                    ));
                }
                self.cli
                    .write_bytes(format!("{}\n", opts.username).as_bytes())
                    .await?;
                user_sent = true;
            } else if resp.group("passwd").is_some() {
                if pass_sent {
                    return Err(SessionError::permission(
                        "Failed to login: Password not expected",
                    ));
                }
                if opts.password.is_empty() {
                    return Err(SessionError::permission(
                        "Failed to login: Password not available",
                    ));
                }
                self.cli
                    .write_bytes(format!("{}\n", opts.password).as_bytes())
                    .await?;
                pass_sent = true;
                // The device now verifies the credentials; that can take far
                // longer than normal console chatter.
                next_timeout = login_timeout;
            } else if resp.group("interact").is_some() {
                self.cli.write_bytes(b"Y\r").await?;
            } else if resp.group("prompt").is_some() {
                self.cli.write_bytes(b"\r\n").await?;
                return Ok(());
            } else {
                return Err(SessionError::runtime("Console login matched no group"));
            }
        }
    }

    /// Logs the device shell out before dropping the console transport, so
    /// the next console user gets a login prompt instead of our shell.
    async fn logout(&self) {
        if !self.core().connected() {
            return;
        }
        let exit_cmd = self.core().devinfo().vendor().exit_command().to_string();
        if self
            .cli
            .write_bytes(format!("{exit_cmd}\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
        match self.expect(&CONSOLE_PROMPT_RE, CONSOLE_EXPECT_DELAY).await {
            Ok(Some(_)) => {},
            _ => {
                if self.core().opts().kick_shutdown {
                    debug!("kicking console shutdown");
                    if self.cli.write_bytes(b"\n").await.is_ok() {
                        let _ = self.expect(&CONSOLE_PROMPT_RE, CONSOLE_EXPECT_DELAY).await;
                    }
                }
            },
        }
    }

    pub async fn close(&self) {
        self.logout().await;
        self.cli.close().await;
    }
}

fn parse_console(console: &str) -> Result<(String, u16)> {
    let (server, port) = console.split_once(':').ok_or_else(|| {
        SessionError::validation(format!("Invalid console designator: {console:?}"))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        SessionError::validation(format!("Invalid console port in {console:?}"))
    })?;
    Ok((server.to_string(), port))
}
