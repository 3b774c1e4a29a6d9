// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Parent/child topology keyed by pid and port.
//!
//! [`Registry`] holds the pure data and its mutations. [`ProcessRegistry`]
//! wraps it in a [`SharedStore`] so that every mutation is a locked
//! load-mutate-save against `registry.json`.

use crate::config::HubConfig;
use crate::error::Result;
use crate::store::{LockGuard, SharedStore, StateLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Parent,
    Child,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Parent => write!(f, "parent"),
            Role::Child => write!(f, "child"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRecord {
    /// `None` for a placeholder created by a child that registered first.
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRecord {
    pub port: u16,
    /// `None` once the parent has been removed.
    pub parent_pid: Option<u32>,
}

/// Flattened view of one registered process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub pid: u32,
    pub port: Option<u16>,
    pub role: Role,
    pub parent_pid: Option<u32>,
    pub children: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Registry {
    port_to_pid: BTreeMap<u16, u32>,
    parents: BTreeMap<u32, ParentRecord>,
    children: BTreeMap<u32, ChildRecord>,
    parent_to_children: BTreeMap<u32, Vec<u32>>,
}

impl Registry {
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty() && self.children.is_empty() && self.port_to_pid.is_empty()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.parents.contains_key(&pid) || self.children.contains_key(&pid)
    }

    pub fn parent(&self, pid: u32) -> Option<&ParentRecord> {
        self.parents.get(&pid)
    }

    pub fn child(&self, pid: u32) -> Option<&ChildRecord> {
        self.children.get(&pid)
    }

    pub fn role_of(&self, pid: u32) -> Option<Role> {
        if self.parents.contains_key(&pid) {
            Some(Role::Parent)
        } else if self.children.contains_key(&pid) {
            Some(Role::Child)
        } else {
            None
        }
    }

    /// Record `pid` as listening on `port`: a parent when `parent_pid` is
    /// `None`, otherwise a child of `parent_pid`. Re-registering overwrites.
    pub fn register(&mut self, pid: u32, port: u16, parent_pid: Option<u32>) {
        // a port has one owner; whoever held it before is gone
        if let Some(owner) = self.port_to_pid.get(&port).copied()
            && owner != pid
        {
            self.forget(owner);
        }

        match parent_pid {
            None => {
                if self.children.contains_key(&pid) {
                    self.forget(pid);
                }
                let record = self.parents.entry(pid).or_default();
                let stale = record.port.replace(port).filter(|old| *old != port);
                self.parent_to_children.entry(pid).or_default();
                if let Some(old) = stale {
                    self.unmap_port(old, pid);
                }
            }
            Some(parent) => {
                if self.parents.contains_key(&pid) {
                    self.forget(pid);
                }
                let previous = self.children.insert(
                    pid,
                    ChildRecord {
                        port,
                        parent_pid: Some(parent),
                    },
                );
                if let Some(previous) = previous {
                    if previous.port != port {
                        self.unmap_port(previous.port, pid);
                    }
                    if let Some(old_parent) = previous.parent_pid
                        && old_parent != parent
                    {
                        self.detach_child(old_parent, pid);
                    }
                }
                self.parents.entry(parent).or_default();
                let siblings = self.parent_to_children.entry(parent).or_default();
                if !siblings.contains(&pid) {
                    siblings.push(pid);
                }
            }
        }
        self.port_to_pid.insert(port, pid);
    }

    pub fn lookup_pid_by_port(&self, port: u16) -> Option<u32> {
        self.port_to_pid.get(&port).copied()
    }

    pub fn lookup_port_by_pid(&self, pid: u32) -> Option<u16> {
        if let Some(port) = self.parents.get(&pid).and_then(|p| p.port) {
            return Some(port);
        }
        if let Some(child) = self.children.get(&pid) {
            return Some(child.port);
        }
        self.port_to_pid
            .iter()
            .find(|(_, owner)| **owner == pid)
            .map(|(port, _)| *port)
    }

    /// Children of `parent_pid` in registration order.
    pub fn children_of(&self, parent_pid: u32) -> Vec<u32> {
        self.parent_to_children
            .get(&parent_pid)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop whoever owns `port`. A removed parent's children stay registered
    /// but lose their parent link. Returns the removed pid.
    pub fn remove(&mut self, port: u16) -> Option<u32> {
        let pid = self.port_to_pid.remove(&port)?;
        self.forget(pid);
        Some(pid)
    }

    /// Drop `pid` from every index regardless of port. Returns whether
    /// anything referenced it.
    pub fn remove_pid(&mut self, pid: u32) -> bool {
        let known = self.contains(pid) || self.port_to_pid.values().any(|p| *p == pid);
        self.forget(pid);
        known
    }

    /// Drop `pid` and return the port still mapped to it. A port that was
    /// already handed to someone else is not reported.
    pub fn retire(&mut self, pid: u32) -> Option<u16> {
        let port = self
            .port_to_pid
            .iter()
            .find_map(|(port, owner)| (*owner == pid).then_some(*port));
        self.forget(pid);
        port
    }

    /// Drop a parent, all of its children and their ports. Returns the ports
    /// that were mapped.
    pub fn remove_parent_and_children(&mut self, parent_pid: u32) -> Vec<u16> {
        let mut doomed = self.parent_to_children.remove(&parent_pid).unwrap_or_default();
        for (pid, child) in &self.children {
            if child.parent_pid == Some(parent_pid) && !doomed.contains(pid) {
                doomed.push(*pid);
            }
        }
        doomed.push(parent_pid);

        let mut ports = Vec::new();
        self.port_to_pid.retain(|port, pid| {
            if doomed.contains(pid) {
                ports.push(*port);
                false
            } else {
                true
            }
        });
        for pid in &doomed {
            self.children.remove(pid);
        }
        self.parents.remove(&parent_pid);
        ports
    }

    pub fn records(&self) -> Vec<ProcessRecord> {
        let parents = self.parents.iter().map(|(pid, record)| ProcessRecord {
            pid: *pid,
            port: record.port,
            role: Role::Parent,
            parent_pid: None,
            children: self.children_of(*pid),
        });
        let children = self.children.iter().map(|(pid, record)| ProcessRecord {
            pid: *pid,
            port: Some(record.port),
            role: Role::Child,
            parent_pid: record.parent_pid,
            children: Vec::new(),
        });
        parents.chain(children).collect()
    }

    pub fn record(&self, pid: u32) -> Option<ProcessRecord> {
        self.records().into_iter().find(|r| r.pid == pid)
    }

    pub fn all_ports(&self) -> Vec<u16> {
        self.port_to_pid.keys().copied().collect()
    }

    /// Remove every record whose pid fails `is_alive` and return what was
    /// removed. Ports mapped to dead pids without a record go too.
    pub fn prune(&mut self, is_alive: impl Fn(u32) -> bool) -> Vec<ProcessRecord> {
        let dead: Vec<ProcessRecord> = self
            .records()
            .into_iter()
            .filter(|r| !is_alive(r.pid))
            .collect();
        for record in &dead {
            self.forget(record.pid);
        }
        let mut strays = Vec::new();
        self.port_to_pid.retain(|port, pid| {
            if is_alive(*pid) {
                true
            } else {
                strays.push(ProcessRecord {
                    pid: *pid,
                    port: Some(*port),
                    role: Role::Child,
                    parent_pid: None,
                    children: Vec::new(),
                });
                false
            }
        });
        dead.into_iter().chain(strays).collect()
    }

    fn forget(&mut self, pid: u32) {
        self.port_to_pid.retain(|_, owner| *owner != pid);

        if let Some(child) = self.children.remove(&pid) {
            if let Some(parent) = child.parent_pid {
                self.detach_child(parent, pid);
            }
        }
        if self.parents.remove(&pid).is_some() {
            for orphan in self.parent_to_children.remove(&pid).unwrap_or_default() {
                if let Some(record) = self.children.get_mut(&orphan) {
                    record.parent_pid = None;
                }
            }
        }
        for siblings in self.parent_to_children.values_mut() {
            siblings.retain(|c| *c != pid);
        }
    }

    fn detach_child(&mut self, parent: u32, child: u32) {
        let emptied = match self.parent_to_children.get_mut(&parent) {
            Some(siblings) => {
                siblings.retain(|c| *c != child);
                siblings.is_empty()
            }
            None => false,
        };
        // a placeholder only exists to hold children
        let placeholder = self.parents.get(&parent).is_some_and(|p| p.port.is_none());
        if emptied && placeholder {
            self.parents.remove(&parent);
            self.parent_to_children.remove(&parent);
        }
    }

    fn unmap_port(&mut self, port: u16, pid: u32) {
        if self.port_to_pid.get(&port) == Some(&pid) {
            self.port_to_pid.remove(&port);
        }
    }
}

/// [`Registry`] persisted in the state directory.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    store: SharedStore<Registry>,
}

impl ProcessRegistry {
    pub fn new(store: SharedStore<Registry>) -> Self {
        Self { store }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        let lock = StateLock::new(config.lock_path(), config.lock_timeout);
        Self::new(SharedStore::new(config.registry_path(), lock))
    }

    pub fn lock(&self) -> &StateLock {
        self.store.lock()
    }

    /// Apply `change` while the caller holds the state lock.
    pub fn update_locked<R>(
        &self,
        guard: &LockGuard,
        change: impl FnOnce(&mut Registry) -> R,
    ) -> Result<R> {
        self.store.update_locked(guard, change)
    }

    pub fn register(&self, pid: u32, port: u16, parent_pid: Option<u32>) -> Result<()> {
        self.store.update(|r| r.register(pid, port, parent_pid))
    }

    pub fn lookup_port_by_pid(&self, pid: u32) -> Result<Option<u16>> {
        Ok(self.snapshot()?.lookup_port_by_pid(pid))
    }

    pub fn lookup_pid_by_port(&self, port: u16) -> Result<Option<u32>> {
        Ok(self.snapshot()?.lookup_pid_by_port(port))
    }

    pub fn children_of(&self, parent_pid: u32) -> Result<Vec<u32>> {
        Ok(self.snapshot()?.children_of(parent_pid))
    }

    pub fn remove(&self, port: u16) -> Result<Option<u32>> {
        self.store.update(|r| r.remove(port))
    }

    pub fn remove_pid(&self, pid: u32) -> Result<bool> {
        self.store.update(|r| r.remove_pid(pid))
    }

    pub fn remove_parent_and_children(&self, parent_pid: u32) -> Result<Vec<u16>> {
        self.store.update(|r| r.remove_parent_and_children(parent_pid))
    }

    pub fn prune(&self, is_alive: impl Fn(u32) -> bool) -> Result<Vec<ProcessRecord>> {
        self.store.update(|r| r.prune(is_alive))
    }

    pub fn records(&self) -> Result<Vec<ProcessRecord>> {
        Ok(self.snapshot()?.records())
    }

    pub fn snapshot(&self) -> Result<Registry> {
        self.store.load()
    }

    /// Forget everything, including a corrupt file.
    pub fn reset(&self) -> Result<()> {
        self.store.reset()
    }
}
