// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Status string reported for commands that completed normally.
pub const SUCCESS_STATUS: &str = "success";

/// The session classes a vendor can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionType {
    #[serde(rename = "ssh-cli")]
    SshCli,
    #[serde(rename = "ssh-netconf")]
    SshNetconf,
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SshCli => write!(f, "ssh-cli"),
            Self::SshNetconf => write!(f, "ssh-netconf"),
        }
    }
}

/// Extra per-session request data (NETCONF channel selection, free-form
/// options such as a port override).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default)]
    pub extra_options: HashMap<String, String>,
    #[serde(default)]
    pub subsystem: Option<String>,
    #[serde(default)]
    pub exec_command: Option<String>,
}

/// A request target. `hostname` is the catalog key; everything else refines
/// how the session is opened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    /// `None` means the caller forgot the field; an empty string is a valid
    /// password for unprovisioned devices.
    #[serde(default)]
    pub password: Option<String>,
    /// Console designator `server:port`; forces a console session.
    #[serde(default)]
    pub console: Option<String>,
    /// Explicit address override, skipping catalog IP selection.
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub mgmt_ip: bool,
    /// Per-command prompt regex overrides, keyed by the exact command string.
    #[serde(default)]
    pub command_prompts: Option<HashMap<String, String>>,
    #[serde(default)]
    pub session_type: Option<SessionType>,
    #[serde(default)]
    pub session_data: Option<SessionData>,
    #[serde(default)]
    pub pre_setup_commands: Vec<String>,
    /// Overrides the vendor clear command; an empty string disables it.
    #[serde(default)]
    pub clear_command: Option<String>,
    #[serde(default)]
    pub failover_to_backup_ips: bool,
}

impl Device {
    pub fn from_hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }
}

/// Handle for a persistent session returned by `open_session`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub name: String,
    pub hostname: String,
}

/// One command's structured result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub output: String,
    pub status: String,
    pub command: String,
    #[serde(default)]
    pub uuid: String,
    /// Peer NETCONF hello, surfaced on the first reply of a NETCONF session.
    #[serde(default)]
    pub capabilities: Option<String>,
}
