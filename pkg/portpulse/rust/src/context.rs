// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::allocator::PortAllocator;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::events::EventLog;
use crate::registry::{ProcessRegistry, Registry};
use crate::transport::Transport;

/// The shared-state collaborators every hub process works against.
#[derive(Debug, Clone)]
pub struct HubContext {
    pub config: HubConfig,
    pub allocator: PortAllocator,
    pub registry: ProcessRegistry,
    pub transport: Transport,
    pub events: EventLog,
}

impl HubContext {
    pub fn new(config: HubConfig) -> Self {
        Self {
            allocator: PortAllocator::from_config(&config),
            registry: ProcessRegistry::from_config(&config),
            transport: Transport::from_config(&config),
            events: EventLog::new(config.events_path()),
            config,
        }
    }

    /// Apply `change` to the registry and release the ports it returns, all
    /// under one acquisition of the state lock. A port is only ever freed
    /// together with the mapping that owned it, so it cannot change hands in
    /// between.
    pub fn deregister(&self, change: impl FnOnce(&mut Registry) -> Vec<u16>) -> Result<Vec<u16>> {
        let guard = self.registry.lock().acquire()?;
        let ports = self.registry.update_locked(&guard, change)?;
        self.allocator.release_locked(&guard, &ports)
    }

    /// Run `f` on the blocking pool. Anything that may wait on the state lock
    /// goes through here when called from async code, so the caller suspends
    /// instead of stalling its runtime.
    pub async fn with_state<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&HubContext) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let ctx = self.clone();
        tokio::task::spawn_blocking(move || f(&ctx))
            .await
            .map_err(|e| HubError::Io(std::io::Error::other(e)))?
    }
}
