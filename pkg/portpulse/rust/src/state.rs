// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a port from the allocator.
    Allocating,
    /// Port reserved and recorded in the registry.
    Registered,
    /// Inbound listener bound.
    Listening,
    /// Serving messages; parents have spawned their children.
    Running,
    /// Stopping children and the listener.
    Terminating,
    /// Port released and registry entry removed.
    Released,
}

impl WorkerState {
    pub fn holds_port(self) -> bool {
        !matches!(self, WorkerState::Allocating | WorkerState::Released)
    }

    pub(crate) fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Allocating, Registered)
                | (Registered, Listening)
                | (Listening, Running)
                | (Running, Terminating)
                | (Terminating, Released)
                | (Allocating, Terminating)
                | (Registered, Terminating)
                | (Listening, Terminating)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Allocating => write!(f, "allocating"),
            WorkerState::Registered => write!(f, "registered"),
            WorkerState::Listening => write!(f, "listening"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Terminating => write!(f, "terminating"),
            WorkerState::Released => write!(f, "released"),
        }
    }
}
