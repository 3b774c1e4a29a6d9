// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Worker processes as seen from whoever launched or tracks them.
//!
//! [`Launcher`] starts a worker and returns a [`ProcessHandle`] owning it;
//! [`ProcessControl`] acts on arbitrary pids found in the registry. Both have
//! OS implementations here and in-memory fakes for tests.

use crate::error::{HubError, Result};
use crate::registry::Role;
use async_trait::async_trait;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// What a launched worker should become.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub role: Role,
    /// Set for children only.
    pub parent_pid: Option<u32>,
    /// Children a parent spawns once it is listening.
    pub children: usize,
}

impl WorkerSpec {
    pub fn parent(children: usize) -> Self {
        Self {
            role: Role::Parent,
            parent_pid: None,
            children,
        }
    }

    pub fn child(parent_pid: u32) -> Self {
        Self {
            role: Role::Child,
            parent_pid: Some(parent_pid),
            children: 0,
        }
    }

    /// Arguments of the hidden `worker` subcommand.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["worker".to_string(), "--role".to_string(), self.role.to_string()];
        if let Some(parent) = self.parent_pid {
            args.push("--parent-pid".to_string());
            args.push(parent.to_string());
        }
        if self.children > 0 {
            args.push("--children".to_string());
            args.push(self.children.to_string());
        }
        args
    }
}

/// A launched worker. Dropping the handle does not kill the process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> u32;

    /// False once the exit has been observed.
    fn is_running(&mut self) -> bool;

    fn signal(&self, sig: Signal) -> Result<()>;

    /// Wait for exit and reap. Returns the exit code, `None` if killed by a
    /// signal.
    async fn wait(&mut self) -> Result<Option<i32>>;
}

pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn ProcessHandle>>;
}

pub trait ProcessControl: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// `ProcessAlreadyGone` when no such process exists.
    fn signal(&self, pid: u32, sig: Signal) -> Result<()>;
}

/// Signal-0 liveness check. On Linux an unreaped zombie counts as dead.
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // "<pid> (<comm>) <state> ..."; comm may itself contain parentheses
    stat.rfind(')')
        .and_then(|i| stat[i + 1..].trim_start().chars().next())
        .is_some_and(|state| state == 'Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

pub fn send_signal(pid: u32, sig: Signal) -> Result<()> {
    let raw = i32::try_from(pid).map_err(|_| HubError::ProcessAlreadyGone(pid))?;
    if raw <= 0 {
        return Err(HubError::ProcessAlreadyGone(pid));
    }
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(HubError::ProcessAlreadyGone(pid)),
        Err(e) => Err(HubError::Io(e.into())),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsControl;

impl ProcessControl for OsControl {
    fn is_alive(&self, pid: u32) -> bool {
        pid_is_alive(pid)
    }

    fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
        send_signal(pid, sig)
    }
}

/// Launches workers by re-executing a `portpulse` binary.
#[derive(Debug, Clone)]
pub struct OsLauncher {
    program: PathBuf,
}

impl OsLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl Launcher for OsLauncher {
    fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn ProcessHandle>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(spec.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        #[cfg(target_os = "linux")]
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                // a worker whose launcher dies shuts down like on a stop request
                nix::sys::prctl::set_pdeathsig(Signal::SIGTERM).map_err(std::io::Error::from)
            });
        }

        let child = cmd.spawn().map_err(|e| {
            HubError::Spawn(format!("{} {:?}: {e}", self.program.display(), spec.to_args()))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| HubError::Spawn("worker exited before reporting a pid".into()))?;
        info!("[{pid}] spawned {} worker", spec.role);
        Ok(Box::new(OsProcess {
            pid,
            child,
            reaped: false,
        }))
    }
}

pub struct OsProcess {
    pid: u32,
    child: Child,
    reaped: bool,
}

#[async_trait]
impl ProcessHandle for OsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("[{}] exited with {status}", self.pid);
                self.reaped = true;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("[{}] could not poll exit status: {e}", self.pid);
                false
            }
        }
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        if self.reaped {
            return Err(HubError::ProcessAlreadyGone(self.pid));
        }
        send_signal(self.pid, sig)
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        if !self.reaped {
            info!("[{}] exited with {status}", self.pid);
        }
        self.reaped = true;
        Ok(status.code())
    }
}
