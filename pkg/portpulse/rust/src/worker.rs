// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Runtime of one spawned parent or child.
//!
//! A worker reserves a port, registers itself, listens, and (for parents)
//! spawns its children. It then serves messages until cancelled, stops its
//! children, and gives everything back. Any failure before `Running` jumps
//! straight to teardown.

use crate::context::HubContext;
use crate::error::{HubError, Result};
use crate::events::EventKind;
use crate::process::{Launcher, ProcessHandle, WorkerSpec};
use crate::registry::Role;
use crate::shutdown::shutdown_all;
use crate::state::WorkerState;
use crate::transport::{Listener, Message};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const ALLOCATION_ATTEMPTS: u32 = 3;
const ALLOCATION_BACKOFF: Duration = Duration::from_millis(100);
const REAP_INTERVAL: Duration = Duration::from_millis(500);
const CHILD_READY_TIMEOUT: Duration = Duration::from_secs(5);
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct Worker {
    ctx: HubContext,
    spec: WorkerSpec,
    pid: u32,
    launcher: Arc<dyn Launcher>,
    state: WorkerState,
    port: Option<u16>,
    /// The registry maps `port` to this worker.
    registered: bool,
    children: Vec<Box<dyn ProcessHandle>>,
}

impl Worker {
    pub fn new(ctx: HubContext, spec: WorkerSpec, pid: u32, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            ctx,
            spec,
            pid,
            launcher,
            state: WorkerState::Allocating,
            port: None,
            registered: false,
            children: Vec::new(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Run to completion. Errors are the ones that prevented the worker from
    /// reaching `Running`; teardown has already happened when this returns.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let outcome = self.run_until_stopped(&token).await;
        if let Err(e) = &outcome {
            self.ctx
                .events
                .note(self.pid, self.port, EventKind::Error, e.to_string());
        }
        self.transition(WorkerState::Terminating)?;
        self.teardown().await;
        self.transition(WorkerState::Released)?;
        outcome
    }

    fn transition(&mut self, next: WorkerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(HubError::InvalidRequest(format!(
                "worker cannot go from {} to {next}",
                self.state
            )));
        }
        debug!("[{}] {} -> {next}", self.pid, self.state);
        self.state = next;
        Ok(())
    }

    async fn run_until_stopped(&mut self, token: &CancellationToken) -> Result<()> {
        let port = self.allocate(token).await?;
        self.port = Some(port);

        let (pid, parent_pid) = (self.pid, self.spec.parent_pid);
        self.ctx
            .with_state(move |ctx| ctx.registry.register(pid, port, parent_pid))
            .await?;
        self.registered = true;
        self.transition(WorkerState::Registered)?;
        let linkage = match self.spec.parent_pid {
            Some(parent) => format!("{} of {parent} on port {port}", self.spec.role),
            None => format!("{} on port {port}", self.spec.role),
        };
        self.ctx
            .events
            .note(self.pid, Some(port), EventKind::Registered, linkage);
        if token.is_cancelled() {
            return Ok(());
        }

        let listener = self.ctx.transport.bind(port).await?;
        self.transition(WorkerState::Listening)?;
        self.ctx.events.note(
            self.pid,
            Some(port),
            EventKind::Listening,
            format!("listening on {}:{port}", self.ctx.transport.host()),
        );
        if token.is_cancelled() {
            return Ok(());
        }

        self.transition(WorkerState::Running)?;
        if self.spec.role == Role::Parent {
            self.spawn_children(token).await;
        }
        self.serve(listener, token).await
    }

    async fn allocate(&self, token: &CancellationToken) -> Result<u16> {
        let mut attempt = 1;
        loop {
            match self.ctx.with_state(|ctx| ctx.allocator.allocate()).await {
                Ok(port) => return Ok(port),
                Err(e) if e.is_retryable() && attempt < ALLOCATION_ATTEMPTS => {
                    warn!("[{}] allocation attempt {attempt} failed: {e}", self.pid);
                    attempt += 1;
                    tokio::select! {
                        _ = token.cancelled() => return Err(e),
                        _ = tokio::time::sleep(ALLOCATION_BACKOFF) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Spawn children one after the other, each registered before the next
    /// is launched. A failed spawn is logged and the remaining siblings still
    /// start.
    async fn spawn_children(&mut self, token: &CancellationToken) {
        for n in 1..=self.spec.children {
            if token.is_cancelled() {
                break;
            }
            match self.launcher.launch(&WorkerSpec::child(self.pid)) {
                Ok(mut child) => {
                    self.ctx.events.note(
                        child.pid(),
                        None,
                        EventKind::Spawned,
                        format!("child {n}/{} of {}", self.spec.children, self.pid),
                    );
                    self.await_registration(child.as_mut(), token).await;
                    self.children.push(child);
                }
                Err(e) => self.ctx.events.note(
                    self.pid,
                    self.port,
                    EventKind::Error,
                    format!("child {n}/{} failed to spawn: {e}", self.spec.children),
                ),
            }
        }
    }

    async fn await_registration(&self, child: &mut dyn ProcessHandle, token: &CancellationToken) {
        let deadline = Instant::now() + CHILD_READY_TIMEOUT;
        loop {
            match self.ctx.registry.children_of(self.pid) {
                Ok(children) if children.contains(&child.pid()) => return,
                Ok(_) => {}
                Err(e) => {
                    warn!("[{}] cannot read registry: {e}", self.pid);
                    return;
                }
            }
            if !child.is_running() {
                warn!("[{}] child {} exited before registering", self.pid, child.pid());
                return;
            }
            if Instant::now() >= deadline {
                warn!("[{}] child {} did not register in time", self.pid, child.pid());
                return;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(CHILD_POLL_INTERVAL) => {}
            }
        }
    }

    async fn serve(&mut self, listener: Listener, token: &CancellationToken) -> Result<()> {
        let events = self.ctx.events.clone();
        let pid = self.pid;
        let port = listener.port();
        let on_message = move |msg: Message| {
            let from = msg
                .sender_pid
                .map_or_else(|| "unknown".to_string(), |p| p.to_string());
            events.note(
                pid,
                Some(port),
                EventKind::MessageReceived,
                format!("from {from}: {}", msg.payload),
            );
        };

        let serving = listener.serve(on_message, token.clone());
        tokio::pin!(serving);
        let mut reap = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                result = &mut serving => return result,
                _ = reap.tick() => self.reap_children(),
            }
        }
    }

    /// Collect children that exited on their own so they do not linger as
    /// zombies.
    fn reap_children(&mut self) {
        self.children.retain_mut(|child| {
            let running = child.is_running();
            if !running {
                debug!("[{}] child {} is gone", self.pid, child.pid());
            }
            running
        });
    }

    async fn teardown(&mut self) {
        if !self.children.is_empty() {
            info!("[{}] stopping {} children", self.pid, self.children.len());
            shutdown_all(&mut self.children, self.ctx.config.stop_timeout).await;
            self.children.clear();
        }

        let (pid, role) = (self.pid, self.spec.role);
        let deregistered = self
            .ctx
            .with_state(move |ctx| {
                ctx.deregister(|r| match role {
                    Role::Parent => r.remove_parent_and_children(pid),
                    Role::Child => r.retire(pid).into_iter().collect(),
                })
            })
            .await;
        let mut released = match deregistered {
            Ok(ports) => ports,
            Err(e) => {
                self.ctx.events.note(
                    self.pid,
                    self.port,
                    EventKind::Error,
                    format!("could not remove registry entry: {e}"),
                );
                Vec::new()
            }
        };
        // a reservation that never made it into the registry is still ours
        if let Some(port) = self.port.filter(|_| !self.registered) {
            match self.ctx.with_state(move |ctx| ctx.allocator.release(port)).await {
                Ok(true) => released.push(port),
                Ok(false) => debug!("[{}] port {port} was already free", self.pid),
                Err(e) => self.ctx.events.note(
                    self.pid,
                    Some(port),
                    EventKind::Error,
                    format!("could not release port {port}: {e}"),
                ),
            }
        }

        self.ctx.events.note(
            self.pid,
            self.port,
            EventKind::Terminated,
            format!("{} stopped", self.spec.role),
        );
        for port in released {
            self.ctx.events.note(
                self.pid,
                Some(port),
                EventKind::Released,
                format!("port {port} released"),
            );
        }
    }
}
