// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Command-line surface of the `portpulse` binary.

use crate::config::HubConfig;
use crate::context::HubContext;
use crate::monitor::ProcessMonitor;
use crate::orchestrator::{Orchestrator, Termination};
use crate::process::{OsControl, OsLauncher, ProcessControl, WorkerSpec};
use crate::registry::Role;
use crate::shutdown::signal_token;
use crate::worker::Worker;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "portpulse", version)]
#[command(about = "Spawn process trees on unique local ports and message between them")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create the state directory and reset the registry and port table
    Init {
        /// Reset even when registered processes are still running
        #[arg(long)]
        force: bool,
    },

    /// Spawn parents that each spawn children, and wait for them
    Create {
        #[arg(long, default_value_t = 1)]
        parents: usize,
        #[arg(long, default_value_t = 0)]
        children: usize,
    },

    /// Send a message to the process listening on a port
    Send {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        message: String,
        #[arg(long)]
        from_pid: Option<u32>,
    },

    /// Send a message from one registered process to another
    ChildMessage {
        #[arg(long)]
        from_pid: u32,
        #[arg(long)]
        to_pid: u32,
        #[arg(long)]
        message: String,
    },

    /// Send a message to the children of a parent, or to everyone
    Broadcast {
        #[arg(long)]
        message: String,
        /// Omit or pass 0 to reach every registered process
        #[arg(long)]
        parent_pid: Option<u32>,
    },

    /// Stop the process listening on a port
    TerminateChild {
        #[arg(long)]
        port: u16,
    },

    /// Stop a parent and all of its children
    TerminateParent {
        #[arg(long)]
        pid: u32,
    },

    /// Print the process table and recent events
    Monitor {
        /// Number of recent events to show
        #[arg(long, default_value_t = 10)]
        events: usize,
        /// Refresh every N seconds until interrupted
        #[arg(long)]
        watch: Option<u64>,
    },

    /// Drop registry entries of processes that are no longer running
    Cleanup,

    #[command(hide = true)]
    Worker {
        #[arg(long, value_enum)]
        role: WorkerRole,
        #[arg(long)]
        parent_pid: Option<u32>,
        #[arg(long, default_value_t = 0)]
        children: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkerRole {
    Parent,
    Child,
}

impl Command {
    /// Subcommands that run as a hub worker rather than a one-shot client.
    pub fn is_worker(&self) -> bool {
        matches!(self, Command::Worker { .. })
    }
}

fn worker_spec(role: WorkerRole, parent_pid: Option<u32>, children: usize) -> Result<WorkerSpec> {
    match (role, parent_pid) {
        (WorkerRole::Parent, None) => Ok(WorkerSpec::parent(children)),
        (WorkerRole::Child, Some(parent)) => Ok(WorkerSpec::child(parent)),
        (WorkerRole::Parent, Some(_)) => bail!("a parent worker takes no --parent-pid"),
        (WorkerRole::Child, None) => bail!("a child worker needs --parent-pid"),
    }
}

fn orchestrator(ctx: HubContext) -> Result<Orchestrator> {
    let launcher = OsLauncher::current_exe().context("locating the portpulse binary")?;
    Ok(Orchestrator::new(ctx, Arc::new(launcher), Arc::new(OsControl)))
}

pub async fn run(command: Command, config: HubConfig) -> Result<()> {
    let ctx = HubContext::new(config);
    match command {
        Command::Init { force } => init(&ctx, force),
        Command::Create { parents, children } => {
            let token = signal_token()?;
            let report = orchestrator(ctx)?
                .create_tree(parents, children, &token)
                .await?;
            let pids: Vec<String> = report.parents.iter().map(u32::to_string).collect();
            let ending = if report.cancelled { "stopped" } else { "exited" };
            println!(
                "ok: {} parents ({}) {ending}, {} failed to launch",
                report.parents.len(),
                pids.join(", "),
                report.failed
            );
            Ok(())
        }
        Command::Send {
            port,
            message,
            from_pid,
        } => {
            orchestrator(ctx)?.send(port, &message, from_pid).await?;
            println!("ok: sent to port {port}");
            Ok(())
        }
        Command::ChildMessage {
            from_pid,
            to_pid,
            message,
        } => {
            orchestrator(ctx)?
                .send_to_pid(from_pid, to_pid, &message)
                .await?;
            println!("ok: sent from {from_pid} to {to_pid}");
            Ok(())
        }
        Command::Broadcast {
            message,
            parent_pid,
        } => {
            let parent = parent_pid.filter(|pid| *pid != 0);
            let report = orchestrator(ctx)?.broadcast(parent, &message).await?;
            for (port, err) in &report.failed {
                println!("failed: port {port}: {err}");
            }
            println!(
                "ok: delivered to {} of {} ports",
                report.delivered.len(),
                report.delivered.len() + report.failed.len()
            );
            Ok(())
        }
        Command::TerminateChild { port } => {
            match orchestrator(ctx)?.terminate_by_port(port).await? {
                Termination::AlreadyGone => {
                    println!("ok: process on port {port} was already gone, entry removed")
                }
                outcome => println!("ok: process on port {port} {}", describe(outcome)),
            }
            Ok(())
        }
        Command::TerminateParent { pid } => {
            let teardown = orchestrator(ctx)?.terminate_parent_tree(pid).await?;
            for (pid, outcome) in &teardown.stopped {
                println!("  {pid}: {}", describe(*outcome));
            }
            println!(
                "ok: parent {pid} and {} children terminated, {} ports released",
                teardown.stopped.len() - 1,
                teardown.released.len()
            );
            Ok(())
        }
        Command::Monitor { events, watch } => {
            let monitor = ProcessMonitor::new(ctx.registry, ctx.events, Arc::new(OsControl));
            match watch {
                None => print!("{}", monitor.snapshot_dashboard(events)?),
                Some(secs) => {
                    let token = signal_token()?;
                    let period = Duration::from_secs(secs.max(1));
                    while !token.is_cancelled() {
                        println!("{}", monitor.snapshot_dashboard(events)?);
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tokio::time::sleep(period) => {}
                        }
                    }
                }
            }
            Ok(())
        }
        Command::Cleanup => {
            let report = orchestrator(ctx)?.cleanup_stale().await?;
            for record in &report.pruned {
                println!("  pruned {} {}", record.role, record.pid);
            }
            println!(
                "ok: {} stale entries removed, {} ports released",
                report.pruned.len(),
                report.released.len()
            );
            Ok(())
        }
        Command::Worker {
            role,
            parent_pid,
            children,
        } => {
            let spec = worker_spec(role, parent_pid, children)?;
            let token = signal_token()?;
            let launcher = OsLauncher::current_exe().context("locating the portpulse binary")?;
            Worker::new(ctx, spec, std::process::id(), Arc::new(launcher))
                .run(token)
                .await
                .with_context(|| {
                    format!("{} worker {} failed", Role::from(role), std::process::id())
                })?;
            Ok(())
        }
    }
}

fn describe(outcome: Termination) -> &'static str {
    match outcome {
        Termination::Stopped => "stopped",
        Termination::Killed => "killed after the stop timeout",
        Termination::AlreadyGone => "already gone",
    }
}

fn init(ctx: &HubContext, force: bool) -> Result<()> {
    let dir = &ctx.config.state_dir;
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let live: Vec<u32> = match ctx.registry.records() {
        Ok(records) => records
            .iter()
            .map(|r| r.pid)
            .filter(|pid| OsControl.is_alive(*pid))
            .collect(),
        // a corrupt registry is exactly what init is for
        Err(_) => Vec::new(),
    };
    if !live.is_empty() && !force {
        bail!(
            "{} registered processes are still running; terminate them first or pass --force",
            live.len()
        );
    }

    ctx.registry.reset().context("resetting the registry")?;
    ctx.allocator.reset().context("resetting the port table")?;
    println!(
        "ok: initialised {} (ports {})",
        dir.display(),
        ctx.allocator.range()
    );
    Ok(())
}

impl From<WorkerRole> for Role {
    fn from(role: WorkerRole) -> Self {
        match role {
            WorkerRole::Parent => Role::Parent,
            WorkerRole::Child => Role::Child,
        }
    }
}
