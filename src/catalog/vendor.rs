// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use regex::bytes::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::warn;

use crate::{
    api::{
        error::{Result, SessionError},
        types::SessionType,
    },
    counters::Counters,
};

/// Compiles a byte regex the way device output must be matched: multi-line,
/// ASCII character classes.
pub fn bytes_re(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        .unicode(false)
        .build()
        .map_err(|e| SessionError::validation(format!("Invalid regex {pattern:?}: {e}")))
}

/// Mutable view of a vendor's settings; [`Vendor`] is the compiled,
/// shareable form.
#[derive(Debug, Clone)]
pub struct VendorSpec {
    pub name: String,
    pub cli_setup: Vec<String>,
    pub prompt_regex: Vec<String>,
    pub shell_prompts: Vec<String>,
    pub user_prompts: Vec<String>,
    pub bootstrap_prompts: Vec<String>,
    pub cmd_timeout: Duration,
    pub clear_command: Vec<u8>,
    pub exit_command: Option<String>,
    pub session_type: SessionType,
    pub supported_sessions: BTreeSet<SessionType>,
    pub autocomplete: bool,
    pub port: u16,
}

impl VendorSpec {
    pub fn defaults(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cli_setup: vec!["term len 0".to_string(), "term width 511".to_string()],
            prompt_regex: vec![r"[\w.]+[>#$]".to_string()],
            shell_prompts: Vec::new(),
            user_prompts: Vec::new(),
            bootstrap_prompts: Vec::new(),
            cmd_timeout: Duration::from_secs(30),
            clear_command: b"\x15".to_vec(),
            exit_command: None,
            session_type: SessionType::SshCli,
            supported_sessions: BTreeSet::from([SessionType::SshCli, SessionType::SshNetconf]),
            autocomplete: true,
            port: 22,
        }
    }

    fn apply(&mut self, update: &VendorConfigUpdate) {
        if let Some(v) = &update.cli_setup {
            self.cli_setup = v.clone();
        }
        if let Some(v) = &update.prompt_regex {
            self.prompt_regex = v.clone();
        }
        if let Some(v) = &update.shell_prompts {
            self.shell_prompts = v.clone();
        }
        if let Some(v) = &update.user_prompts {
            self.user_prompts = v.clone();
        }
        if let Some(v) = &update.bootstrap_prompts {
            self.bootstrap_prompts = v.clone();
        }
        if let Some(v) = update.cmd_timeout_sec {
            self.cmd_timeout = Duration::from_secs(v);
        }
        if let Some(v) = &update.clear_command {
            self.clear_command = v.clone().into_bytes();
        }
        if let Some(v) = &update.exit_command {
            self.exit_command = Some(v.clone());
        }
        if let Some(v) = &update.supported_sessions {
            self.supported_sessions = v.iter().copied().collect();
        }
        if let Some(v) = update.session_type {
            self.session_type = v;
            // The default session type must always be supported.
            self.supported_sessions.insert(v);
        }
        if let Some(v) = update.autocomplete {
            self.autocomplete = v;
        }
        if let Some(v) = update.port {
            self.port = v;
        }
    }
}

/// Per-vendor update block of the JSON vendor configuration file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct VendorConfigUpdate {
    pub cli_setup: Option<Vec<String>>,
    pub prompt_regex: Option<Vec<String>>,
    pub shell_prompts: Option<Vec<String>>,
    pub user_prompts: Option<Vec<String>>,
    pub bootstrap_prompts: Option<Vec<String>>,
    pub cmd_timeout_sec: Option<u64>,
    pub clear_command: Option<String>,
    pub exit_command: Option<String>,
    pub session_type: Option<SessionType>,
    pub supported_sessions: Option<Vec<SessionType>>,
    pub autocomplete: Option<bool>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct VendorConfigFile {
    vendor_config: HashMap<String, VendorConfigUpdate>,
}

/// A vendor record with its compiled base prompt regex.
#[derive(Debug)]
pub struct Vendor {
    spec: VendorSpec,
    prompt_re: Regex,
}

impl Vendor {
    pub fn from_spec(spec: VendorSpec) -> Result<Self> {
        let prompt_re = build_prompt_re(&spec, None)?;
        Ok(Self { spec, prompt_re })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn cli_setup(&self) -> &[String] {
        &self.spec.cli_setup
    }

    pub fn cmd_timeout(&self) -> Duration {
        self.spec.cmd_timeout
    }

    pub fn clear_command(&self) -> &[u8] {
        &self.spec.clear_command
    }

    pub fn exit_command(&self) -> &str {
        self.spec.exit_command.as_deref().unwrap_or("exit")
    }

    pub fn autocomplete(&self) -> bool {
        self.spec.autocomplete
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn spec(&self) -> &VendorSpec {
        &self.spec
    }

    /// The base prompt regex: the disjunction of all configured prompt
    /// fragments, anchored to the end of the received text.
    pub fn prompt_re(&self) -> &Regex {
        &self.prompt_re
    }

    /// Prompt regex with extra text expected after the prompt. Used for
    /// interactive commands where the partial command is echoed back.
    pub fn prompt_re_with_trailer(&self, trailer: &str) -> Result<Regex> {
        build_prompt_re(&self.spec, Some(trailer))
    }

    /// Picks a session class for the request. An unsupported hint falls back
    /// to the vendor default and is counted.
    pub fn select_session_type(
        &self,
        hint: Option<SessionType>,
        counters: &Counters,
    ) -> SessionType {
        counters.increment("device_vendor.all_sessions");
        match hint {
            Some(t) if self.spec.supported_sessions.contains(&t) => t,
            Some(t) => {
                warn!(
                    vendor = %self.spec.name,
                    "vendor does not support session {t}, using {}",
                    self.spec.session_type
                );
                counters.increment("device_vendor.unsupported_session");
                self.spec.session_type
            },
            None => self.spec.session_type,
        }
    }
}

/// Builds the grouped prompt regex. The prompt must start a line and be the
/// last text in the buffer; requiring the preceding newline greatly reduces
/// the odds of matching random output, and the synthetic newline injected at
/// connect guarantees one exists before the first prompt.
fn build_prompt_re(spec: &VendorSpec, trailer: Option<&str>) -> Result<Regex> {
    let mut fragments: Vec<&str> = Vec::new();
    fragments.extend(spec.prompt_regex.iter().map(String::as_str));
    fragments.extend(spec.shell_prompts.iter().map(String::as_str));
    fragments.extend(spec.user_prompts.iter().map(String::as_str));
    fragments.extend(spec.bootstrap_prompts.iter().map(String::as_str));

    let alternatives = fragments
        .iter()
        .map(|p| format!("({p})"))
        .collect::<Vec<_>>()
        .join("|");
    let trailer = trailer.unwrap_or("");
    bytes_re(&format!(r"[\n\r](?P<prompt>{alternatives})\s*{trailer}$"))
}

/// Holds vendor records, creating defaulted ones on demand.
pub struct VendorRegistry {
    vendors: DashMap<String, Arc<Vendor>>,
    counters: Arc<Counters>,
}

impl VendorRegistry {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            vendors: DashMap::new(),
            counters,
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Returns the vendor record, creating a default one on demand.
    pub fn get(&self, name: &str) -> Arc<Vendor> {
        if let Some(v) = self.vendors.get(name) {
            return v.clone();
        }
        let vendor = Arc::new(
            Vendor::from_spec(VendorSpec::defaults(name))
                .unwrap_or_else(|_| unreachable!("default vendor spec always compiles")),
        );
        self.vendors.insert(name.to_string(), vendor.clone());
        vendor
    }

    /// Applies a `{"vendor_config": {...}}` JSON document. Each updated
    /// vendor gets its prompt regex rebuilt; the record is swapped in
    /// atomically.
    pub fn load(&self, json: &str) -> Result<()> {
        let file: VendorConfigFile = serde_json::from_str(json)
            .map_err(|e| SessionError::validation(format!("Invalid vendor config: {e}")))?;
        for (name, update) in &file.vendor_config {
            let mut spec = self.get(name).spec.clone();
            spec.apply(update);
            let vendor = Arc::new(Vendor::from_spec(spec)?);
            self.vendors.insert(name.clone(), vendor);
        }
        Ok(())
    }
}
