// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::Result;
use crate::events::{EventEntry, EventLog};
use crate::process::ProcessControl;
use crate::registry::{ProcessRecord, ProcessRegistry, Role};
use std::fmt;
use std::sync::Arc;

/// Read-only view over the registry, the process table and the event log.
pub struct ProcessMonitor {
    registry: ProcessRegistry,
    events: EventLog,
    control: Arc<dyn ProcessControl>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub record: ProcessRecord,
    pub alive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Dashboard {
    pub parents: Vec<ProcessStatus>,
    pub children: Vec<ProcessStatus>,
    /// Newest first.
    pub recent: Vec<EventEntry>,
}

impl Dashboard {
    pub fn alive_count(&self) -> usize {
        self.parents.iter().chain(&self.children).filter(|s| s.alive).count()
    }

    pub fn dead_count(&self) -> usize {
        self.parents.len() + self.children.len() - self.alive_count()
    }
}

impl ProcessMonitor {
    pub fn new(
        registry: ProcessRegistry,
        events: EventLog,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            registry,
            events,
            control,
        }
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.control.is_alive(pid)
    }

    /// Registry joined with liveness plus the `recent` newest events.
    pub fn snapshot_dashboard(&self, recent: usize) -> Result<Dashboard> {
        let mut dashboard = Dashboard {
            recent: self.events.recent_entries(recent)?,
            ..Dashboard::default()
        };
        for record in self.registry.records()? {
            let status = ProcessStatus {
                alive: self.is_alive(record.pid),
                record,
            };
            match status.record.role {
                Role::Parent => dashboard.parents.push(status),
                Role::Child => dashboard.children.push(status),
            }
        }
        Ok(dashboard)
    }

    /// Registered processes that are no longer running.
    pub fn stale_records(&self) -> Result<Vec<ProcessRecord>> {
        Ok(self
            .registry
            .records()?
            .into_iter()
            .filter(|r| !self.is_alive(r.pid))
            .collect())
    }
}

impl fmt::Display for Dashboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<8} {:>8} {:>6} {:>8} {:<6} CHILDREN",
            "ROLE", "PID", "PORT", "PARENT", "STATUS"
        )?;
        for status in self.parents.iter().chain(&self.children) {
            let r = &status.record;
            let port = r.port.map_or_else(|| "-".to_string(), |p| p.to_string());
            let parent = r.parent_pid.map_or_else(|| "-".to_string(), |p| p.to_string());
            let children = if r.children.is_empty() {
                "-".to_string()
            } else {
                r.children
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            };
            writeln!(
                f,
                "{:<8} {:>8} {:>6} {:>8} {:<6} {children}",
                r.role.to_string(),
                r.pid,
                port,
                parent,
                if status.alive { "alive" } else { "dead" },
            )?;
        }
        writeln!(
            f,
            "{} parents, {} children, {} alive, {} dead",
            self.parents.len(),
            self.children.len(),
            self.alive_count(),
            self.dead_count()
        )?;
        if !self.recent.is_empty() {
            writeln!(f)?;
            writeln!(f, "Recent events:")?;
            for e in &self.recent {
                let port = e.port.map(|p| format!(":{p}")).unwrap_or_default();
                writeln!(f, "{} [{}{port}] {}: {}", e.timestamp, e.pid, e.event, e.message)?;
            }
        }
        Ok(())
    }
}
