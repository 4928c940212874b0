// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::Arc};

use regex::bytes::Regex;
use serde::Deserialize;

use crate::{
    api::error::{Result, SessionError},
    catalog::vendor::{Vendor, bytes_re},
    counters::Counters,
};

/// One candidate address of a device.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceIp {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub mgmt: bool,
}

/// An address picked for a connection attempt, tagged with its advisory
/// reachability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpInfo {
    pub addr: String,
    pub is_pingable: bool,
}

/// Raw catalog entry as produced by a device source.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRecordData {
    pub hostname: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub pref_ips: Vec<DeviceIp>,
    pub ip: DeviceIp,
    pub vendor: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub ch_model: String,
}

/// An abstraction to represent the network devices.
#[derive(Debug)]
pub struct DeviceInfo {
    hostname: String,
    alias: Option<String>,
    pref_ips: Vec<DeviceIp>,
    ip: DeviceIp,
    vendor: Arc<Vendor>,
    role: String,
    ch_model: String,
}

/// Everything needed to send one command line: the bytes to write, an
/// optional pre-command (normally the clear sequence), and the prompt that
/// ends its output.
#[derive(Debug)]
pub struct CommandInfo {
    pub cmd: Vec<u8>,
    pub precmd: Option<Vec<u8>>,
    pub prompt_re: Regex,
}

impl DeviceInfo {
    pub fn new(data: DeviceRecordData, vendor: Arc<Vendor>) -> Self {
        Self {
            hostname: data.hostname,
            alias: data.alias,
            pref_ips: data.pref_ips,
            ip: data.ip,
            vendor,
            role: data.role,
            ch_model: data.ch_model,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn vendor(&self) -> &Arc<Vendor> {
        &self.vendor
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn ch_model(&self) -> &str {
        &self.ch_model
    }

    pub fn default_ip(&self) -> &DeviceIp {
        &self.ip
    }

    pub fn pref_ips(&self) -> &[DeviceIp] {
        &self.pref_ips
    }

    fn is_question(cmd: &[u8]) -> bool {
        cmd.ends_with(b"?")
    }

    /// Resolves how one command line is sent and what ends its output.
    ///
    /// A user-supplied prompt override for the exact command wins; otherwise
    /// a trailing `?` with vendor autocomplete expects the partial command to
    /// be echoed after the prompt, and a normal command gets a newline and
    /// the vendor's base prompt.
    pub fn get_command_info(
        &self,
        cmd: &[u8],
        command_prompts: Option<&HashMap<Vec<u8>, Vec<u8>>>,
        clear_command: Option<&str>,
    ) -> Result<CommandInfo> {
        let mut cmd = cmd.trim_ascii().to_vec();

        let mut prompt_re = None;
        if let Some(prompts) = command_prompts
            && let Some(over) = prompts.get(&cmd)
        {
            let pattern = String::from_utf8_lossy(over);
            prompt_re = Some(bytes_re(&format!("(?P<prompt>{pattern})"))?);
            cmd.extend_from_slice(b"\n");
        }

        let prompt_re = match prompt_re {
            Some(re) => re,
            None => {
                if Self::is_question(&cmd) && self.vendor.autocomplete() {
                    // The device echoes the partial command back after the
                    // prompt; expect it as a trailer instead of a newline.
                    let partial = cmd[..cmd.len() - 1].trim_ascii();
                    let escaped = regex::escape(&String::from_utf8_lossy(partial));
                    self.vendor
                        .prompt_re_with_trailer(&format!(r"(?P<command>{escaped})[\x08\s]*"))?
                } else {
                    cmd.extend_from_slice(b"\n");
                    self.vendor.prompt_re().clone()
                }
            },
        };

        // A NAK by default clears any half-typed line; the per-device
        // override can replace it or, when empty, disable it.
        let precmd = match clear_command {
            Some("") => None,
            Some(c) => Some(c.as_bytes().to_vec()),
            None => {
                let c = self.vendor.clear_command();
                (!c.is_empty()).then(|| c.to_vec())
            },
        };

        Ok(CommandInfo {
            cmd,
            precmd,
            prompt_re,
        })
    }
}

/// Advisory reachability check. The default implementation assumes
/// everything is reachable; integrations override it with real data.
pub trait PingCheck: Send + Sync {
    fn is_pingable(&self, _addr: &str) -> bool {
        true
    }
}

/// Orders the connection candidates for a device.
///
/// An explicit address wins outright. With `use_mgmt` only MGMT-tagged
/// addresses survive. Otherwise candidates keep their input order but are
/// partitioned pingable-first, with the default address pulled to the front
/// of the non-pingable partition as the canonical fallback.
pub fn get_ip(
    ip_address: Option<&str>,
    use_mgmt: bool,
    devinfo: &DeviceInfo,
    ping: &dyn PingCheck,
    counters: &Counters,
) -> Result<Vec<IpInfo>> {
    if let Some(addr) = ip_address {
        return Ok(vec![IpInfo {
            addr: addr.to_string(),
            is_pingable: ping.is_pingable(addr),
        }]);
    }

    if use_mgmt {
        counters.increment("device_info.mgmt_ip");
    } else {
        counters.increment("device_info.default_ip");
    }

    let default_addr = devinfo.default_ip().addr.clone();
    let mut pingable = Vec::new();
    let mut non_pingable = Vec::new();

    let candidates = devinfo
        .pref_ips()
        .iter()
        // The default is appended separately; drop duplicates of it.
        .filter(|ip| ip.addr != default_addr)
        .chain(std::iter::once(devinfo.default_ip()));

    for ip in candidates {
        if ip.addr.is_empty() {
            continue;
        }
        if use_mgmt && !ip.mgmt {
            continue;
        }
        if ping.is_pingable(&ip.addr) {
            pingable.push(IpInfo {
                addr: ip.addr.clone(),
                is_pingable: true,
            });
        } else if ip.addr == default_addr {
            non_pingable.insert(0, IpInfo {
                addr: ip.addr.clone(),
                is_pingable: false,
            });
        } else {
            non_pingable.push(IpInfo {
                addr: ip.addr.clone(),
                is_pingable: false,
            });
        }
    }

    let mut result = pingable;
    result.append(&mut non_pingable);

    if result.is_empty() {
        if use_mgmt {
            return Err(SessionError::lookup(format!(
                "Request asked for mgmt_ip but no mgmt ip is found for {}",
                devinfo.hostname()
            )));
        }
        return Err(SessionError::lookup(format!(
            "No valid IP address was found for the device {}",
            devinfo.hostname()
        )));
    }

    Ok(result)
}
