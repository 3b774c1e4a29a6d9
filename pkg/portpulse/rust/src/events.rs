// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Append-only lifecycle log, one JSON object per line.

use crate::error::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Spawned,
    Registered,
    Listening,
    MessageReceived,
    MessageSent,
    SendFailed,
    Terminated,
    Released,
    StalePruned,
    Error,
}

impl EventKind {
    pub fn level(self) -> EventLevel {
        match self {
            EventKind::SendFailed | EventKind::StalePruned => EventLevel::Warn,
            EventKind::Error => EventLevel::Error,
            _ => EventLevel::Info,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Spawned => "spawned",
            EventKind::Registered => "registered",
            EventKind::Listening => "listening",
            EventKind::MessageReceived => "message-received",
            EventKind::MessageSent => "message-sent",
            EventKind::SendFailed => "send-failed",
            EventKind::Terminated => "terminated",
            EventKind::Released => "released",
            EventKind::StalePruned => "stale-pruned",
            EventKind::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub timestamp: String,
    pub pid: u32,
    #[serde(default)]
    pub port: Option<u16>,
    pub level: EventLevel,
    pub event: EventKind,
    pub message: String,
}

impl EventEntry {
    pub fn now(pid: u32, port: Option<u16>, event: EventKind, message: impl Into<String>) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string());
        Self {
            timestamp,
            pid,
            port,
            level: event.level(),
            event,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event and echo it through the logger.
    pub fn record(
        &self,
        pid: u32,
        port: Option<u16>,
        event: EventKind,
        message: impl Into<String>,
    ) -> Result<()> {
        let entry = EventEntry::now(pid, port, event, message);
        match entry.level {
            EventLevel::Info => info!("[{pid}] {event}: {}", entry.message),
            EventLevel::Warn => warn!("[{pid}] {event}: {}", entry.message),
            EventLevel::Error => error!("[{pid}] {event}: {}", entry.message),
        }
        self.append(&entry)
    }

    /// Like [`record`](Self::record) for callers that must not fail on a
    /// broken log file.
    pub fn note(&self, pid: u32, port: Option<u16>, event: EventKind, message: impl Into<String>) {
        if let Err(e) = self.record(pid, port, event, message) {
            warn!("[{pid}] could not write {}: {e}", self.path.display());
        }
    }

    pub fn append(&self, entry: &EventEntry) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Up to `n` entries, newest first. Lines that do not parse are skipped.
    pub fn recent_entries(&self, n: usize) -> Result<Vec<EventEntry>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(contents
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(n)
            .collect())
    }
}
