// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// Every port of the configured range is either allocated or occupied.
    #[error("no port available in range {start}..{end}")]
    NoPortAvailable { start: u16, end: u16 },

    /// The shared state lock could not be taken in time. Retryable.
    #[error("timed out after {}ms waiting for the state lock", .0.as_millis())]
    AllocationTimeout(Duration),

    #[error("failed to bind listener on port {port}: {source}")]
    BindError {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("connection refused by {host}:{port}")]
    ConnectionRefused { host: String, port: u16 },

    #[error("failed to send to {host}:{port}: {reason}")]
    SendFailed {
        host: String,
        port: u16,
        reason: String,
    },

    /// The target of a termination is no longer running.
    #[error("process {0} is already gone")]
    ProcessAlreadyGone(u32),

    #[error("corrupt state file {}: {reason}", path.display())]
    RegistryCorrupt { path: PathBuf, reason: String },

    #[error("no process registered on port {0}")]
    UnknownPort(u16),

    #[error("no process registered with pid {0}")]
    UnknownPid(u32),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Errors a caller may reasonably retry without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HubError::AllocationTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
