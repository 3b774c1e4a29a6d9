// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portpulse::config::{HubConfig, PortRange};
use portpulse::context::HubContext;
use portpulse::events::{EventEntry, EventKind};
use portpulse::registry::{Registry, Role};
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const PORTS_PER_HUB: u16 = 20;

/// An isolated state directory plus a private port range.
pub struct Hub {
    dir: TempDir,
    start: u16,
}

impl Hub {
    pub fn new(start: u16) -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create state dir"),
            start,
        }
    }

    pub fn end(&self) -> u16 {
        self.start + PORTS_PER_HUB
    }

    /// Same settings the binary sees through `command`.
    pub fn context(&self) -> HubContext {
        HubContext::new(HubConfig {
            state_dir: self.dir.path().to_path_buf(),
            port_range: PortRange::new(self.start, self.end()).expect("valid range"),
            lock_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(2),
            ..HubConfig::default()
        })
    }

    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_portpulse"));
        cmd.args(args)
            .env_remove("PORTPULSE_CONFIG_FILE")
            .env("PORTPULSE_STATE_DIR", self.dir.path())
            .env("PORTPULSE_PORT_START", self.start.to_string())
            .env("PORTPULSE_PORT_END", self.end().to_string())
            .env("PORTPULSE_LOCK_TIMEOUT_MS", "5000")
            .env("PORTPULSE_CONNECT_TIMEOUT_MS", "1000")
            .env("PORTPULSE_STOP_TIMEOUT_MS", "2000")
            .env("PORTPULSE_LOG_LEVEL", "info");
        cmd
    }

    /// Run a one-shot subcommand to completion.
    pub fn run(&self, args: &[&str]) -> Output {
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .expect("failed to run portpulse");
        eprintln!("[portpulse {}] {}", args.join(" "), String::from_utf8_lossy(&output.stdout));
        output
    }

    /// Start `portpulse create` in the background.
    pub fn create(&self, parents: usize, children: usize) -> TreeHandle {
        let parents = parents.to_string();
        let children = children.to_string();
        let child = self
            .command(&["create", "--parents", &parents, "--children", &children])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start portpulse create");
        TreeHandle::capture(child)
    }

    pub fn registry(&self) -> Registry {
        self.context().registry.snapshot().expect("registry readable")
    }

    pub fn allocated(&self) -> Vec<u16> {
        self.context().allocator.allocated().expect("port table readable")
    }

    /// All events, oldest first.
    pub fn events(&self) -> Vec<EventEntry> {
        let mut entries = self
            .context()
            .events
            .recent_entries(usize::MAX)
            .expect("event log readable");
        entries.reverse();
        entries
    }

    pub fn has_event(&self, pid: u32, kind: EventKind, message: &str) -> bool {
        self.events()
            .iter()
            .any(|e| e.pid == pid && e.event == kind && e.message.contains(message))
    }

    /// Wait until `parents` parents are listening, each with `children`
    /// listening children. Returns the parent pids.
    pub fn wait_for_tree(&self, parents: usize, children: usize) -> Vec<u32> {
        let mut ready = Vec::new();
        let done = wait_until(DEFAULT_TIMEOUT, || {
            let registry = self.registry();
            let events = self.events();
            let listening = |pid: u32| {
                events
                    .iter()
                    .any(|e| e.pid == pid && e.event == EventKind::Listening)
            };
            let roots: Vec<u32> = registry
                .records()
                .into_iter()
                .filter(|r| r.role == Role::Parent && r.port.is_some())
                .map(|r| r.pid)
                .collect();
            let complete = roots.len() == parents
                && roots.iter().all(|&pid| {
                    let kids = registry.children_of(pid);
                    listening(pid) && kids.len() == children && kids.iter().all(|&c| listening(c))
                });
            if complete {
                ready = roots;
            }
            complete
        });
        assert!(done, "tree of {parents}x{children} did not come up");
        ready
    }
}

/// Handle to a running `portpulse create`.
pub struct TreeHandle {
    child: Child,
    log_lines: Arc<Mutex<Vec<String>>>,
    _reader_thread: std::thread::JoinHandle<()>,
    _stderr_thread: std::thread::JoinHandle<()>,
}

impl TreeHandle {
    fn capture(mut child: Child) -> Self {
        let stdout = child.stdout.take().expect("failed to capture stdout");
        let stderr = child.stderr.take().expect("failed to capture stderr");
        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines_clone = Arc::clone(&log_lines);
        let lines_clone2 = Arc::clone(&log_lines);

        // Workers inherit these pipes, so their log lines land here too.
        let reader_thread = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                eprintln!("[tree] {line}");
                lines_clone.lock().unwrap().push(line);
            }
        });
        let _stderr_thread = std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                eprintln!("[tree:err] {line}");
                lines_clone2.lock().unwrap().push(line);
            }
        });

        Self {
            child,
            log_lines,
            _reader_thread: reader_thread,
            _stderr_thread,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn send_signal(&self, sig: Signal) {
        signal::kill(Pid::from_raw(self.child.id() as i32), sig).expect("failed to signal create");
    }

    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        wait_until(timeout, || {
            self.log_lines
                .lock()
                .unwrap()
                .iter()
                .any(|l| l.contains(pattern))
        })
    }

    /// Wait for `create` to exit; kills it when the timeout passes.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait().expect("failed to check create status") {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed create");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

impl Drop for TreeHandle {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.send_signal(Signal::SIGTERM);
            self.wait_with_timeout(DEFAULT_TIMEOUT);
        }
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_for_exit(pid: u32) -> bool {
    wait_until(DEFAULT_TIMEOUT, || !portpulse::process::pid_is_alive(pid))
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
