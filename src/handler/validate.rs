// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::api::{
    error::{Result, SessionError},
    types::{Device, Session},
};

/// Input checks applied at the outer layer of every public operation,
/// before any work is attempted.
pub fn check_device(device: &Device) -> Result<()> {
    let mut missing = Vec::new();
    if device.hostname.is_empty() {
        missing.push("hostname");
    }
    if device.username.is_empty() {
        missing.push("username");
    }
    // Strictly check that the password is present, not that it is
    // non-empty: unprovisioned devices may accept an empty password.
    if device.password.is_none() {
        missing.push("password");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SessionError::validation(format!(
            "Following required Device fields are missing: {missing:?}"
        )))
    }
}

pub fn check_session(session: &Session) -> Result<()> {
    let mut missing = Vec::new();
    if session.id == 0 {
        missing.push("id");
    }
    if session.name.is_empty() {
        missing.push("name");
    }
    if session.hostname.is_empty() {
        missing.push("hostname");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SessionError::validation(format!(
            "Following required Session fields are missing: {missing:?}"
        )))
    }
}

pub fn check_command(command: &str) -> Result<()> {
    if command.is_empty() {
        return Err(SessionError::validation(
            "Required argument (command) cannot be empty.",
        ));
    }
    Ok(())
}

pub fn check_bulk(requests: &[(Device, Vec<String>)]) -> Result<()> {
    if requests.is_empty() {
        return Err(SessionError::validation(
            "Required argument (device_to_commands) cannot be empty.",
        ));
    }
    for (device, _) in requests {
        check_device(device)?;
    }
    Ok(())
}
