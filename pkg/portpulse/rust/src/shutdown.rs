// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::{HubError, Result};
use crate::process::ProcessHandle;
use log::{info, warn};
use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;

const SIGKILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Token cancelled on the first SIGTERM or SIGINT. Must be called from
/// within a runtime.
pub fn signal_token() -> Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
            _ = trigger.cancelled() => return,
        }
        trigger.cancel();
    });
    Ok(token)
}

/// Send SIGTERM to every running process, wait up to `stop_timeout`, then
/// SIGKILL stragglers.
pub async fn shutdown_all(processes: &mut [Box<dyn ProcessHandle>], stop_timeout: Duration) {
    for proc in processes.iter_mut() {
        if proc.is_running() {
            info!("[{}] sending SIGTERM", proc.pid());
            signal_quietly(&**proc, Signal::SIGTERM);
        }
    }

    let wait_all = async {
        for proc in processes.iter_mut() {
            if proc.is_running() {
                let _ = proc.wait().await;
            }
        }
    };

    if timeout(stop_timeout, wait_all).await.is_err() {
        warn!(
            "shutdown timeout ({}ms) reached, sending SIGKILL",
            stop_timeout.as_millis()
        );
        for proc in processes.iter_mut() {
            if proc.is_running() {
                info!("[{}] sending SIGKILL", proc.pid());
                signal_quietly(&**proc, Signal::SIGKILL);
            }
        }
        for proc in processes.iter_mut() {
            if proc.is_running() && timeout(SIGKILL_TIMEOUT, proc.wait()).await.is_err() {
                warn!("[{}] still running after SIGKILL, giving up", proc.pid());
            }
        }
    }
}

fn signal_quietly(proc: &dyn ProcessHandle, sig: Signal) {
    match proc.signal(sig) {
        Ok(()) | Err(HubError::ProcessAlreadyGone(_)) => {}
        Err(e) => warn!("[{}] failed to send {sig}: {e}", proc.pid()),
    }
}
