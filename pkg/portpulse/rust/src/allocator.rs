// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::{HubConfig, PortRange};
use crate::error::{HubError, Result};
use crate::store::{LockGuard, SharedStore, StateLock};
use log::debug;
use std::collections::BTreeSet;
use std::net::TcpListener;

/// Ports handed out and not yet released, persisted as a flat JSON array.
pub type AllocationTable = BTreeSet<u16>;

/// Hands out unique ports from a range, coordinated across processes through
/// the shared allocation table.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    table: SharedStore<AllocationTable>,
}

impl PortAllocator {
    pub fn new(range: PortRange, table: SharedStore<AllocationTable>) -> Self {
        Self { range, table }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        let lock = StateLock::new(config.lock_path(), config.lock_timeout);
        Self::new(config.port_range, SharedStore::new(config.ports_path(), lock))
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Lowest port of the range that is neither in the table nor bound by
    /// anyone else. The port stays reserved until [`release`](Self::release).
    pub fn allocate(&self) -> Result<u16> {
        let range = self.range;
        self.table.try_update(|table| {
            for port in range.iter() {
                if table.contains(&port) {
                    continue;
                }
                if !is_port_free(port) {
                    debug!("port {port} is bound outside the table, skipping");
                    continue;
                }
                table.insert(port);
                return Ok(port);
            }
            Err(HubError::NoPortAvailable {
                start: range.start,
                end: range.end,
            })
        })
    }

    /// Returns whether the port was reserved. Releasing twice is harmless.
    pub fn release(&self, port: u16) -> Result<bool> {
        self.table.update(|table| table.remove(&port))
    }

    /// Release `ports` while the caller holds the state lock. Returns the ones
    /// that were reserved.
    pub fn release_locked(&self, guard: &LockGuard, ports: &[u16]) -> Result<Vec<u16>> {
        self.table.update_locked(guard, |table| {
            ports.iter().copied().filter(|port| table.remove(port)).collect()
        })
    }

    /// Forget every reservation.
    pub fn reset(&self) -> Result<()> {
        self.table.reset()
    }

    /// Reserved ports in ascending order.
    pub fn allocated(&self) -> Result<Vec<u16>> {
        Ok(self.table.load()?.into_iter().collect())
    }
}

/// Test bind on the loopback interface.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    fn allocator(dir: &Path, start: u16, end: u16) -> PortAllocator {
        let lock = StateLock::new(dir.join("state.lock"), Duration::from_secs(10));
        PortAllocator::new(
            PortRange::new(start, end).unwrap(),
            SharedStore::new(dir.join("ports.json"), lock),
        )
    }

    #[test]
    fn test_allocate_release_reuses_lowest() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path(), 41000, 41010);

        assert_eq!(alloc.allocate().unwrap(), 41000);
        assert_eq!(alloc.allocate().unwrap(), 41001);
        assert!(alloc.release(41000).unwrap());
        assert_eq!(alloc.allocate().unwrap(), 41000);
        assert_eq!(alloc.allocated().unwrap(), vec![41000, 41001]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path(), 41020, 41025);
        let port = alloc.allocate().unwrap();
        assert!(alloc.release(port).unwrap());
        assert!(!alloc.release(port).unwrap());
        assert!(!alloc.release(1).unwrap());
        assert!(alloc.allocated().unwrap().is_empty());
    }

    #[test]
    fn test_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path(), 41030, 41034);
        for _ in 0..4 {
            alloc.allocate().unwrap();
        }
        let err = alloc.allocate().unwrap_err();
        assert!(matches!(
            err,
            HubError::NoPortAvailable {
                start: 41030,
                end: 41034
            }
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_skips_port_bound_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = allocator(dir.path(), 41040, 41045);
        let _squatter = TcpListener::bind(("127.0.0.1", 41040)).unwrap();

        assert!(!is_port_free(41040));
        assert_eq!(alloc.allocate().unwrap(), 41041);
        assert_eq!(alloc.allocated().unwrap(), vec![41041]);
    }

    #[test]
    fn test_allocators_share_one_table() {
        let dir = tempfile::tempdir().unwrap();
        let a = allocator(dir.path(), 41050, 41055);
        let b = allocator(dir.path(), 41050, 41055);
        assert_eq!(a.allocate().unwrap(), 41050);
        assert_eq!(b.allocate().unwrap(), 41051);
        assert_eq!(a.allocated().unwrap(), b.allocated().unwrap());
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let root = root.clone();
                thread::spawn(move || {
                    let alloc = allocator(&root, 41100, 41140);
                    (0..4).map(|_| alloc.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        let unique: BTreeSet<u16> = all.iter().copied().collect();
        assert_eq!(all.len(), 32);
        assert_eq!(unique.len(), 32);
        assert_eq!(allocator(&root, 41100, 41140).allocated().unwrap().len(), 32);
    }

    #[test]
    fn test_allocate_times_out_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let lock = StateLock::new(dir.path().join("state.lock"), Duration::from_millis(50));
        let alloc = PortAllocator::new(
            PortRange::new(41150, 41155).unwrap(),
            SharedStore::new(dir.path().join("ports.json"), lock.clone()),
        );
        let _held = lock.acquire().unwrap();
        assert!(matches!(
            alloc.allocate(),
            Err(HubError::AllocationTimeout(_))
        ));
    }
}
