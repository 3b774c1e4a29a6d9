// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Operations on process trees driven from outside the tree: creating
//! parents, tearing processes down, routing messages and reconciling the
//! registry with the process table.
//!
//! Topology always comes from the registry. In-memory handles are only used
//! to wait for and reap the parents this orchestrator launched itself.

use crate::context::HubContext;
use crate::error::{HubError, Result};
use crate::events::EventKind;
use crate::process::{Launcher, ProcessControl, ProcessHandle, WorkerSpec};
use crate::registry::{ProcessRecord, Role};
use crate::shutdown::shutdown_all;
use crate::transport::{BroadcastReport, Message};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SIGKILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeReport {
    /// Pids of the parents that were launched.
    pub parents: Vec<u32>,
    /// Parents that could not be launched.
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited after SIGTERM.
    Stopped,
    /// Needed SIGKILL.
    Killed,
    /// Was not running any more.
    AlreadyGone,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeTeardown {
    pub stopped: Vec<(u32, Termination)>,
    pub released: Vec<u16>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub pruned: Vec<ProcessRecord>,
    pub released: Vec<u16>,
}

pub struct Orchestrator {
    ctx: HubContext,
    launcher: Arc<dyn Launcher>,
    control: Arc<dyn ProcessControl>,
    /// Attributed to events the orchestrator records.
    pid: u32,
}

impl Orchestrator {
    pub fn new(
        ctx: HubContext,
        launcher: Arc<dyn Launcher>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            ctx,
            launcher,
            control,
            pid: std::process::id(),
        }
    }

    pub fn context(&self) -> &HubContext {
        &self.ctx
    }

    fn validate_tree(&self, parents: usize, children: usize) -> Result<()> {
        let max_parents = self.ctx.config.max_parents;
        let max_children = self.ctx.config.max_children;
        if parents == 0 || parents > max_parents {
            return Err(HubError::InvalidRequest(format!(
                "number of parents must be between 1 and {max_parents}, got {parents}"
            )));
        }
        if children > max_children {
            return Err(HubError::InvalidRequest(format!(
                "children per parent must be at most {max_children}, got {children}"
            )));
        }
        Ok(())
    }

    /// Launch `parents` parents that each spawn `children` children, then
    /// wait until every parent has exited. On cancellation every tracked
    /// process is stopped and its state cleaned up.
    pub async fn create_tree(
        &self,
        parents: usize,
        children: usize,
        token: &CancellationToken,
    ) -> Result<TreeReport> {
        self.validate_tree(parents, children)?;

        let mut report = TreeReport::default();
        let mut handles: Vec<Box<dyn ProcessHandle>> = Vec::with_capacity(parents);
        for n in 1..=parents {
            match self.launcher.launch(&WorkerSpec::parent(children)) {
                Ok(handle) => {
                    self.ctx.events.note(
                        handle.pid(),
                        None,
                        EventKind::Spawned,
                        format!("parent {n}/{parents} with {children} children"),
                    );
                    report.parents.push(handle.pid());
                    handles.push(handle);
                }
                Err(e) => {
                    self.ctx.events.note(
                        self.pid,
                        None,
                        EventKind::Error,
                        format!("parent {n}/{parents} failed to spawn: {e}"),
                    );
                    report.failed += 1;
                }
            }
        }
        if handles.is_empty() {
            return Err(HubError::Spawn(format!("none of {parents} parents could be launched")));
        }

        let cancelled = {
            let join = async {
                for handle in handles.iter_mut() {
                    if let Err(e) = handle.wait().await {
                        warn!("[{}] wait failed: {e}", handle.pid());
                    }
                }
            };
            tokio::select! {
                _ = join => false,
                _ = token.cancelled() => true,
            }
        };

        if cancelled {
            info!("cancelled, stopping {} parents", handles.len());
            self.force_stop(&mut handles).await;
            report.cancelled = true;
        }
        Ok(report)
    }

    async fn force_stop(&self, handles: &mut [Box<dyn ProcessHandle>]) {
        let snapshot = match self.ctx.registry.snapshot() {
            Ok(s) => s,
            Err(e) => {
                warn!("registry unavailable during shutdown: {e}");
                Default::default()
            }
        };
        let parents: Vec<u32> = handles.iter().map(|h| h.pid()).collect();
        let children: Vec<u32> = parents.iter().flat_map(|p| snapshot.children_of(*p)).collect();

        shutdown_all(handles, self.ctx.config.stop_timeout).await;

        for child in children {
            if self.control.is_alive(child) {
                warn!("[{child}] outlived its parent, sending SIGKILL");
                let _ = self.control.signal(child, Signal::SIGKILL);
            }
        }
        for parent in parents {
            if let Err(e) = self.remove_tree(parent).await {
                warn!("[{parent}] cleanup failed: {e}");
            }
        }
    }

    /// Stop whoever listens on `port` and drop its registry entry.
    ///
    /// A worker deregisters itself on SIGTERM, and the port may be reused by
    /// the time the exit is observed, so cleanup goes by pid and frees the
    /// port only if that pid still owned it.
    pub async fn terminate_by_port(&self, port: u16) -> Result<Termination> {
        let pid = self
            .ctx
            .registry
            .lookup_pid_by_port(port)?
            .ok_or(HubError::UnknownPort(port))?;

        let outcome = self.stop_process(pid).await?;
        let released = self
            .ctx
            .with_state(move |ctx| ctx.deregister(|r| r.retire(pid).into_iter().collect()))
            .await?;
        for port in released {
            self.ctx
                .events
                .note(pid, Some(port), EventKind::Released, format!("port {port} released"));
        }
        self.ctx.events.note(
            pid,
            Some(port),
            EventKind::Terminated,
            format!("terminated via port {port} ({outcome:?})"),
        );
        Ok(outcome)
    }

    /// Stop every child of `parent_pid`, then the parent, then drop the whole
    /// subtree from the registry.
    pub async fn terminate_parent_tree(&self, parent_pid: u32) -> Result<TreeTeardown> {
        let snapshot = self.ctx.registry.snapshot()?;
        if snapshot.role_of(parent_pid) != Some(Role::Parent) {
            return Err(HubError::UnknownPid(parent_pid));
        }

        let mut teardown = TreeTeardown::default();
        for child in snapshot.children_of(parent_pid) {
            let outcome = self.stop_process(child).await?;
            teardown.stopped.push((child, outcome));
        }
        let outcome = self.stop_process(parent_pid).await?;
        teardown.stopped.push((parent_pid, outcome));

        teardown.released = self.remove_tree(parent_pid).await?;
        self.ctx.events.note(
            parent_pid,
            snapshot.lookup_port_by_pid(parent_pid),
            EventKind::Terminated,
            format!(
                "parent and {} children terminated",
                teardown.stopped.len() - 1
            ),
        );
        Ok(teardown)
    }

    async fn remove_tree(&self, parent_pid: u32) -> Result<Vec<u16>> {
        let released = self
            .ctx
            .with_state(move |ctx| ctx.deregister(|r| r.remove_parent_and_children(parent_pid)))
            .await?;
        for port in &released {
            self.ctx.events.note(
                parent_pid,
                Some(*port),
                EventKind::Released,
                format!("port {port} released"),
            );
        }
        Ok(released)
    }

    /// SIGTERM, wait up to the stop timeout, then SIGKILL.
    async fn stop_process(&self, pid: u32) -> Result<Termination> {
        match self.control.signal(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(HubError::ProcessAlreadyGone(_)) => {
                warn!("[{pid}] already gone");
                return Ok(Termination::AlreadyGone);
            }
            Err(e) => return Err(e),
        }
        if self.wait_for_exit(pid, self.ctx.config.stop_timeout).await {
            return Ok(Termination::Stopped);
        }

        warn!(
            "[{pid}] stop timeout ({}ms) reached, sending SIGKILL",
            self.ctx.config.stop_timeout.as_millis()
        );
        match self.control.signal(pid, Signal::SIGKILL) {
            Ok(()) | Err(HubError::ProcessAlreadyGone(_)) => {}
            Err(e) => return Err(e),
        }
        if !self.wait_for_exit(pid, SIGKILL_GRACE).await {
            warn!("[{pid}] still running after SIGKILL, giving up");
        }
        Ok(Termination::Killed)
    }

    async fn wait_for_exit(&self, pid: u32, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.control.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Deliver `payload` to `port`, attributed to `from_pid` when given.
    pub async fn send(&self, port: u16, payload: &str, from_pid: Option<u32>) -> Result<()> {
        let message = Message {
            payload: payload.to_string(),
            sender_pid: from_pid,
        };
        let source = from_pid.unwrap_or(self.pid);
        match self.ctx.transport.send(port, &message).await {
            Ok(()) => {
                self.ctx.events.note(
                    source,
                    Some(port),
                    EventKind::MessageSent,
                    format!("to port {port}: {payload}"),
                );
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .events
                    .note(source, Some(port), EventKind::SendFailed, e.to_string());
                Err(e)
            }
        }
    }

    /// Deliver to whatever port `to_pid` is registered on.
    pub async fn send_to_pid(&self, from_pid: u32, to_pid: u32, payload: &str) -> Result<()> {
        let port = self
            .ctx
            .registry
            .lookup_port_by_pid(to_pid)?
            .ok_or(HubError::UnknownPid(to_pid))?;
        debug!("[{from_pid}] resolved {to_pid} to port {port}");
        self.send(port, payload, Some(from_pid)).await
    }

    /// Send to every child of `parent_pid`, or to every registered process
    /// when no parent is given.
    pub async fn broadcast(
        &self,
        parent_pid: Option<u32>,
        payload: &str,
    ) -> Result<BroadcastReport> {
        let snapshot = self.ctx.registry.snapshot()?;
        let ports: Vec<u16> = match parent_pid {
            Some(parent) => {
                if snapshot.role_of(parent) != Some(Role::Parent) {
                    return Err(HubError::UnknownPid(parent));
                }
                snapshot
                    .children_of(parent)
                    .into_iter()
                    .filter_map(|child| snapshot.lookup_port_by_pid(child))
                    .collect()
            }
            None => snapshot.records().iter().filter_map(|r| r.port).collect(),
        };

        let message = Message {
            payload: payload.to_string(),
            sender_pid: parent_pid,
        };
        let source = parent_pid.unwrap_or(self.pid);
        let report = self.ctx.transport.broadcast(&ports, &message).await;
        for (port, err) in &report.failed {
            self.ctx
                .events
                .note(source, Some(*port), EventKind::SendFailed, err.to_string());
        }
        self.ctx.events.note(
            source,
            None,
            EventKind::MessageSent,
            format!(
                "broadcast delivered to {}/{} ports: {payload}",
                report.delivered.len(),
                ports.len()
            ),
        );
        Ok(report)
    }

    /// Drop registry entries of dead processes and release their ports.
    pub async fn cleanup_stale(&self) -> Result<CleanupReport> {
        let control = Arc::clone(&self.control);
        let report = self
            .ctx
            .with_state(move |ctx| {
                let mut pruned = Vec::new();
                let released = ctx.deregister(|r| {
                    pruned = r.prune(|pid| control.is_alive(pid));
                    pruned.iter().filter_map(|record| record.port).collect()
                })?;
                Ok(CleanupReport { pruned, released })
            })
            .await?;

        for record in &report.pruned {
            self.ctx.events.note(
                record.pid,
                record.port,
                EventKind::StalePruned,
                format!("{} {} is not running", record.role, record.pid),
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::process::fakes::{FakeControl, FakeProcesses};
    use tokio::sync::mpsc;

    /// On SIGTERM the target deregisters and frees its port the way a real
    /// worker does, and pid 555 immediately takes the port over.
    struct HandoverControl {
        ctx: HubContext,
        inner: FakeControl,
    }

    impl ProcessControl for HandoverControl {
        fn is_alive(&self, pid: u32) -> bool {
            self.inner.is_alive(pid)
        }

        fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
            self.inner.signal(pid, sig)?;
            if sig == Signal::SIGTERM
                && let Some(port) = self.ctx.registry.lookup_port_by_pid(pid)?
            {
                self.ctx.registry.remove_pid(pid)?;
                self.ctx.allocator.release(port)?;
                let reused = self.ctx.allocator.allocate()?;
                self.ctx.registry.register(555, reused, None)?;
            }
            Ok(())
        }
    }

    fn orchestrator(ctx: &HubContext, procs: &FakeProcesses) -> Orchestrator {
        Orchestrator::new(ctx.clone(), Arc::new(procs.launcher()), Arc::new(procs.control()))
    }

    /// Reserve a port and register `pid` on it like a worker would.
    fn spawn_fake(ctx: &HubContext, procs: &FakeProcesses, pid: u32, parent: Option<u32>) -> u16 {
        let port = ctx.allocator.allocate().unwrap();
        ctx.registry.register(pid, port, parent).unwrap();
        procs.add(pid);
        port
    }

    async fn listen(
        ctx: &HubContext,
    ) -> (u16, mpsc::UnboundedReceiver<Message>, CancellationToken) {
        let listener = ctx.transport.bind(0).await.unwrap();
        let port = listener.port();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let serve_token = token.clone();
        tokio::spawn(async move {
            listener
                .serve(
                    move |m| {
                        let _ = tx.send(m);
                    },
                    serve_token,
                )
                .await
        });
        (port, rx, token)
    }

    #[tokio::test]
    async fn test_create_tree_validates_limits() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43000, 43010);
        let procs = FakeProcesses::new();
        let orch = orchestrator(&ctx, &procs);
        let token = CancellationToken::new();

        for (parents, children) in [(0, 1), (6, 1), (1, 11)] {
            let err = orch.create_tree(parents, children, &token).await.unwrap_err();
            assert!(matches!(err, HubError::InvalidRequest(_)), "{parents}/{children}");
        }
        assert!(procs.launched().is_empty());
    }

    #[tokio::test]
    async fn test_create_tree_joins_parents() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43020, 43030);
        let procs = FakeProcesses::new();
        let exiting = procs.clone();
        let launcher = procs.launcher().on_launch(move |pid, _| {
            let procs = exiting.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                procs.kill(pid);
            });
            Ok(())
        });
        let orch = Orchestrator::new(ctx.clone(), Arc::new(launcher), Arc::new(procs.control()));

        let report = orch.create_tree(2, 3, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.parents.len(), 2);
        assert_eq!(report.failed, 0);
        assert!(!report.cancelled);
        for (_, spec) in procs.launched() {
            assert_eq!(spec, WorkerSpec::parent(3));
        }
    }

    #[tokio::test]
    async fn test_create_tree_cancel_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43040, 43050);
        let procs = FakeProcesses::new();
        let (hook_ctx, hook_procs) = (ctx.clone(), procs.clone());
        let launcher = procs.launcher().on_launch(move |pid, _| {
            // the parent registers itself and one child that ignores SIGTERM
            spawn_fake(&hook_ctx, &hook_procs, pid, None);
            spawn_fake(&hook_ctx, &hook_procs, pid + 5000, Some(pid));
            hook_procs.make_stubborn(pid + 5000);
            Ok(())
        });
        let orch = Orchestrator::new(ctx.clone(), Arc::new(launcher), Arc::new(procs.control()));

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let report = orch.create_tree(1, 1, &token).await.unwrap();

        assert!(report.cancelled);
        let parent = report.parents[0];
        assert!(!procs.alive(parent));
        assert!(!procs.alive(parent + 5000));
        assert!(procs.signals().contains(&(parent + 5000, Signal::SIGKILL)));
        assert!(ctx.registry.snapshot().unwrap().is_empty());
        assert!(ctx.allocator.allocated().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_tree_all_spawns_failing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43060, 43070);
        let procs = FakeProcesses::new();
        let orch = Orchestrator::new(
            ctx.clone(),
            Arc::new(procs.launcher().failing_for(Role::Parent)),
            Arc::new(procs.control()),
        );
        let err = orch.create_tree(2, 0, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HubError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_terminate_by_port() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43100, 43110);
        let procs = FakeProcesses::new();
        let orch = orchestrator(&ctx, &procs);
        spawn_fake(&ctx, &procs, 100, None);
        let port = spawn_fake(&ctx, &procs, 101, Some(100));

        assert_eq!(orch.terminate_by_port(port).await.unwrap(), Termination::Stopped);
        assert!(!procs.alive(101));
        assert_eq!(procs.signals(), vec![(101, Signal::SIGTERM)]);
        assert!(ctx.registry.children_of(100).unwrap().is_empty());
        assert!(!ctx.allocator.allocated().unwrap().contains(&port));
    }

    #[tokio::test]
    async fn test_terminate_by_port_leaves_a_reused_port_alone() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43180, 43190);
        let procs = FakeProcesses::new();
        let control = HandoverControl {
            ctx: ctx.clone(),
            inner: procs.control(),
        };
        let orch = Orchestrator::new(ctx.clone(), Arc::new(procs.launcher()), Arc::new(control));
        let port = spawn_fake(&ctx, &procs, 100, None);

        assert_eq!(orch.terminate_by_port(port).await.unwrap(), Termination::Stopped);

        let snapshot = ctx.registry.snapshot().unwrap();
        assert!(!snapshot.contains(100));
        assert_eq!(snapshot.lookup_pid_by_port(port), Some(555));
        assert!(snapshot.record(555).is_some());
        assert_eq!(ctx.allocator.allocated().unwrap(), vec![port]);
    }

    #[tokio::test]
    async fn test_terminate_by_port_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43120, 43130);
        let procs = FakeProcesses::new();
        let orch = orchestrator(&ctx, &procs);
        let port = spawn_fake(&ctx, &procs, 100, None);
        procs.make_stubborn(100);

        assert_eq!(orch.terminate_by_port(port).await.unwrap(), Termination::Killed);
        assert!(!procs.alive(100));
    }

    #[tokio::test]
    async fn test_terminate_gone_process_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43140, 43150);
        let procs = FakeProcesses::new();
        let orch = orchestrator(&ctx, &procs);
        let port = spawn_fake(&ctx, &procs, 100, None);
        procs.kill(100);

        assert_eq!(orch.terminate_by_port(port).await.unwrap(), Termination::AlreadyGone);
        assert!(ctx.registry.snapshot().unwrap().is_empty());
        assert!(ctx.allocator.allocated().unwrap().is_empty());

        let err = orch.terminate_by_port(port).await.unwrap_err();
        assert!(matches!(err, HubError::UnknownPort(p) if p == port));
    }

    #[tokio::test]
    async fn test_terminate_parent_tree() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43160, 43170);
        let procs = FakeProcesses::new();
        let orch = orchestrator(&ctx, &procs);
        spawn_fake(&ctx, &procs, 100, None);
        spawn_fake(&ctx, &procs, 101, Some(100));
        spawn_fake(&ctx, &procs, 102, Some(100));
        spawn_fake(&ctx, &procs, 200, None);

        let teardown = orch.terminate_parent_tree(100).await.unwrap();
        let order: Vec<u32> = teardown.stopped.iter().map(|(pid, _)| *pid).collect();
        assert_eq!(order, vec![101, 102, 100]);
        assert_eq!(teardown.released.len(), 3);
        for pid in [100, 101, 102] {
            assert!(!procs.alive(pid));
        }
        assert!(procs.alive(200));

        let snapshot = ctx.registry.snapshot().unwrap();
        assert!(!snapshot.contains(100) && !snapshot.contains(101) && !snapshot.contains(102));
        assert!(snapshot.contains(200));
        assert_eq!(ctx.allocator.allocated().unwrap().len(), 1);

        assert!(matches!(
            orch.terminate_parent_tree(101).await,
            Err(HubError::UnknownPid(101))
        ));
    }

    #[tokio::test]
    async fn test_send_to_pid() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43200, 43210);
        let procs = FakeProcesses::new();
        let orch = orchestrator(&ctx, &procs);
        let (port, mut rx, token) = listen(&ctx).await;
        ctx.registry.register(300, port, None).unwrap();

        orch.send_to_pid(42, 300, "hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Message::from_pid(42, "hello"));

        let err = orch.send_to_pid(42, 999, "nobody").await.unwrap_err();
        assert!(matches!(err, HubError::UnknownPid(999)));
        token.cancel();
    }

    #[tokio::test]
    async fn test_send_failure_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43220, 43230);
        let procs = FakeProcesses::new();
        let orch = orchestrator(&ctx, &procs);
        let port = ctx.transport.bind(0).await.unwrap().port();

        let err = orch.send(port, "lost", Some(7)).await.unwrap_err();
        assert!(matches!(err, HubError::ConnectionRefused { .. }));
        let last = &ctx.events.recent_entries(1).unwrap()[0];
        assert_eq!(last.event, EventKind::SendFailed);
        assert_eq!(last.pid, 7);
    }

    #[tokio::test]
    async fn test_broadcast_to_children() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43240, 43250);
        let procs = FakeProcesses::new();
        let orch = orchestrator(&ctx, &procs);

        let (parent_port, mut parent_rx, t0) = listen(&ctx).await;
        let (a, mut rx_a, t1) = listen(&ctx).await;
        let (b, mut rx_b, t2) = listen(&ctx).await;
        let dead = ctx.transport.bind(0).await.unwrap().port();
        ctx.registry.register(400, parent_port, None).unwrap();
        ctx.registry.register(401, a, Some(400)).unwrap();
        ctx.registry.register(402, b, Some(400)).unwrap();
        ctx.registry.register(403, dead, Some(400)).unwrap();

        let report = orch.broadcast(Some(400), "all").await.unwrap();
        assert_eq!(report.delivered, vec![a, b]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(rx_a.recv().await.unwrap(), Message::from_pid(400, "all"));
        assert_eq!(rx_b.recv().await.unwrap().payload, "all");
        assert!(parent_rx.try_recv().is_err());

        let everyone = orch.broadcast(None, "everyone").await.unwrap();
        assert_eq!(everyone.delivered.len(), 3);
        assert_eq!(parent_rx.recv().await.unwrap(), Message::new("everyone"));

        assert!(matches!(
            orch.broadcast(Some(401), "x").await,
            Err(HubError::UnknownPid(401))
        ));
        for t in [t0, t1, t2] {
            t.cancel();
        }
    }

    #[tokio::test]
    async fn test_cleanup_stale() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), 43260, 43270);
        let procs = FakeProcesses::new();
        let orch = orchestrator(&ctx, &procs);
        spawn_fake(&ctx, &procs, 100, None);
        let child_port = spawn_fake(&ctx, &procs, 101, Some(100));
        let dead_port = spawn_fake(&ctx, &procs, 102, Some(100));
        procs.kill(102);

        let report = orch.cleanup_stale().await.unwrap();
        assert_eq!(report.pruned.len(), 1);
        assert_eq!(report.pruned[0].pid, 102);
        assert_eq!(report.released, vec![dead_port]);
        assert_eq!(ctx.registry.children_of(100).unwrap(), vec![101]);
        assert!(ctx.allocator.allocated().unwrap().contains(&child_port));

        assert!(orch.cleanup_stale().await.unwrap().pruned.is_empty());
        let last = &ctx.events.recent_entries(1).unwrap()[0];
        assert_eq!(last.event, EventKind::StalePruned);
    }
}
