// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Hub configuration.
//!
//! Defaults can be overridden by an optional YAML file (`PORTPULSE_CONFIG_FILE`)
//! and then by individual `PORTPULSE_*` environment variables. Spawned workers
//! inherit the environment of their launcher, so a whole process tree resolves
//! the same configuration.

use crate::error::{HubError, Result};
use log::debug;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT_START: u16 = 5000;
pub const DEFAULT_PORT_END: u16 = 6000;
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_MAX_PARENTS: usize = 5;
pub const DEFAULT_MAX_CHILDREN: usize = 10;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_LOG_LEVEL: &str = "info";

const REGISTRY_FILE: &str = "registry.json";
const PORTS_FILE: &str = "ports.json";
const LOCK_FILE: &str = "state.lock";
const EVENTS_FILE: &str = "events.jsonl";

/// Half-open port interval `[start, end)` the allocator hands out from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start >= end {
            return Err(HubError::Config(format!(
                "empty port range {start}..{end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..self.end
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// On-disk shape of the optional YAML config file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    state_dir: Option<PathBuf>,
    port_start: Option<u16>,
    port_end: Option<u16>,
    lock_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    buffer_size: Option<usize>,
    max_parents: Option<usize>,
    max_children: Option<usize>,
    log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Directory holding the registry, allocation table, lock and event log.
    pub state_dir: PathBuf,
    pub port_range: PortRange,
    /// Upper bound on waiting for the shared state lock.
    pub lock_timeout: Duration,
    /// Upper bound on outbound connects and on reading one inbound message.
    pub connect_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
    /// Inbound read buffer; longer messages are truncated.
    pub buffer_size: usize,
    pub max_parents: usize,
    pub max_children: usize,
    pub log_level: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            state_dir: env::temp_dir().join("portpulse"),
            port_range: PortRange {
                start: DEFAULT_PORT_START,
                end: DEFAULT_PORT_END,
            },
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_parents: DEFAULT_MAX_PARENTS,
            max_children: DEFAULT_MAX_CHILDREN,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl HubConfig {
    /// Resolve the configuration: defaults, then `PORTPULSE_CONFIG_FILE`, then
    /// `PORTPULSE_*` variables.
    pub fn load() -> Result<Self> {
        let mut config = match env::var("PORTPULSE_CONFIG_FILE") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HubError::Config(format!("reading {}: {e}", path.display()))
        })?;
        let file: FileConfig = serde_yaml::from_str(&contents).map_err(|e| {
            HubError::Config(format!("parsing {}: {e}", path.display()))
        })?;
        debug!("loaded config file {}", path.display());

        let mut config = Self::default();
        if let Some(dir) = file.state_dir {
            config.state_dir = dir;
        }
        config.port_range = PortRange::new(
            file.port_start.unwrap_or(config.port_range.start),
            file.port_end.unwrap_or(config.port_range.end),
        )?;
        if let Some(ms) = file.lock_timeout_ms {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.stop_timeout_ms {
            config.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = file.buffer_size {
            config.buffer_size = size;
        }
        if let Some(n) = file.max_parents {
            config.max_parents = n;
        }
        if let Some(n) = file.max_children {
            config.max_children = n;
        }
        if let Some(level) = file.log_level {
            config.log_level = level;
        }
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = env::var("PORTPULSE_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        let start = parse_var("PORTPULSE_PORT_START")?.unwrap_or(self.port_range.start);
        let end = parse_var("PORTPULSE_PORT_END")?.unwrap_or(self.port_range.end);
        self.port_range = PortRange::new(start, end)?;
        if let Some(ms) = parse_var("PORTPULSE_LOCK_TIMEOUT_MS")? {
            self.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var("PORTPULSE_CONNECT_TIMEOUT_MS")? {
            self.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var("PORTPULSE_STOP_TIMEOUT_MS")? {
            self.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var("PORTPULSE_BUFFER_SIZE")? {
            self.buffer_size = size;
        }
        // PORTPULSE_LOG_LEVEL > RUST_LOG > file/default
        if let Ok(level) = env::var("PORTPULSE_LOG_LEVEL").or_else(|_| env::var("RUST_LOG")) {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(HubError::Config("buffer_size must be positive".into()));
        }
        if self.port_range.is_empty() {
            return Err(HubError::Config(format!(
                "empty port range {}",
                self.port_range
            )));
        }
        Ok(())
    }

    pub fn log_level(&self) -> log::Level {
        self.log_level.parse().unwrap_or(log::Level::Info)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join(REGISTRY_FILE)
    }

    pub fn ports_path(&self) -> PathBuf {
        self.state_dir.join(PORTS_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join(EVENTS_FILE)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| HubError::Config(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
