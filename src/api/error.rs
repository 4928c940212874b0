// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};

/// Numeric error taxonomy carried in results. The discriminants are the wire
/// codes and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 0,
    Validation = 1,
    Lookup = 2,
    Permission = 3,
    ConnectionTimeout = 4,
    Connection = 5,
    CommandExecutionTimeout = 6,
    CommandExecution = 7,
    StreamReader = 8,
    UnsupportedDevice = 9,
    UnsupportedCommand = 10,
    InstanceOverloaded = 11,
    Runtime = 12,
    Assertion = 13,
    Type = 14,
    Attribute = 15,
    NotImplemented = 16,
}

/// Library-level error. Layers append breadcrumbs to `context` instead of
/// re-wrapping, so the original message survives to the RPC boundary intact.
#[derive(Debug, Clone)]
pub struct SessionError {
    kind: ErrorCode,
    message: String,
    context: Vec<String>,
}

impl SessionError {
    pub fn new(kind: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn lookup(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Lookup, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Permission, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Connection, message)
    }

    pub fn connection_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionTimeout, message)
    }

    pub fn command_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CommandExecutionTimeout, message)
    }

    pub fn command_execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CommandExecution, message)
    }

    pub fn stream_reader(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StreamReader, message)
    }

    pub fn unsupported_device(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedDevice, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Runtime, message)
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Assertion, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotImplemented, message)
    }

    pub fn kind(&self) -> ErrorCode {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Append a breadcrumb. The original kind and message are preserved.
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context.push(ctx.into());
        self
    }

    pub fn to_wire(&self) -> SessionException {
        SessionException {
            message: self.to_string(),
            code: self.kind,
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for ctx in &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::connection_timeout(e.to_string()),
            _ => Self::connection(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Structured exception carried over the RPC surface.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct SessionException {
    pub message: String,
    pub code: ErrorCode,
}

/// Bulk admission-control rejection. Kept separate from [`SessionException`]
/// because the remote bulk layer treats it as retryable.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct InstanceOverloaded {
    pub message: String,
}

/// Error surface of the public dispatcher operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Session(#[from] SessionException),
    #[error(transparent)]
    Overloaded(#[from] InstanceOverloaded),
}

impl RpcError {
    pub fn session(&self) -> Option<&SessionException> {
        match self {
            Self::Session(e) => Some(e),
            Self::Overloaded(_) => None,
        }
    }
}
