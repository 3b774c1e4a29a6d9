// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Lock-protected JSON state shared between processes.
//!
//! Every mutation is one unit: take the advisory lock, read the whole file,
//! apply the change, write it back through a temp file and rename, release.
//! Readers skip the lock since a rename never exposes a half-written file.
//!
//! The lock is an `flock` on a dedicated file, so it also serialises threads
//! of one process as long as each acquisition opens the file anew. Callers
//! must not nest acquisitions. Stores that share a lock file can be changed
//! together under one guard through the `*_locked` methods.

use crate::error::{HubError, Result};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct StateLock {
    path: PathBuf,
    timeout: Duration,
}

/// Held exclusive lock; released on drop.
pub struct LockGuard {
    path: PathBuf,
    _lock: Flock<File>,
}

impl StateLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Poll for the exclusive lock until the timeout elapses.
    pub fn acquire(&self) -> Result<LockGuard> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&self.path)?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        _lock: lock,
                    });
                }
                Err((_, Errno::EWOULDBLOCK)) | Err((_, Errno::EINTR)) => {}
                Err((_, errno)) => return Err(HubError::Io(errno.into())),
            }
            if Instant::now() >= deadline {
                debug!("gave up on {} after {:?}", self.path.display(), self.timeout);
                return Err(HubError::AllocationTimeout(self.timeout));
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }
}

/// A JSON document of type `T` guarded by a [`StateLock`].
#[derive(Debug, Clone)]
pub struct SharedStore<T> {
    path: PathBuf,
    lock: StateLock,
    _doc: PhantomData<fn() -> T>,
}

impl<T> SharedStore<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>, lock: StateLock) -> Self {
        Self {
            path: path.into(),
            lock,
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents. A missing or empty file reads as `T::default()`.
    pub fn load(&self) -> Result<T> {
        read_document(&self.path)
    }

    pub fn lock(&self) -> &StateLock {
        &self.lock
    }

    /// Apply `f` to the stored document and persist the result atomically.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let guard = self.lock.acquire()?;
        self.update_locked(&guard, f)
    }

    /// Like [`update`](Self::update) for changes that can fail; nothing is
    /// written when `f` returns an error.
    pub fn try_update<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let guard = self.lock.acquire()?;
        self.try_update_locked(&guard, f)
    }

    /// [`update`](Self::update) for a caller already holding this store's
    /// lock.
    pub fn update_locked<R>(&self, guard: &LockGuard, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.try_update_locked(guard, |doc| Ok(f(doc)))
    }

    pub fn try_update_locked<R>(
        &self,
        guard: &LockGuard,
        f: impl FnOnce(&mut T) -> Result<R>,
    ) -> Result<R> {
        debug_assert_eq!(guard.path, self.lock.path, "guard taken on another lock");
        let mut doc = read_document(&self.path)?;
        let out = f(&mut doc)?;
        write_document(&self.path, &doc)?;
        Ok(out)
    }

    /// Overwrite with `T::default()` without reading the current contents,
    /// so a corrupt file can be recovered.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.lock.acquire()?;
        write_document(&self.path, &T::default())
    }
}

fn read_document<T: Default + DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    if contents.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&contents).map_err(|e| HubError::RegistryCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let body = serde_json::to_vec_pretty(doc).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
