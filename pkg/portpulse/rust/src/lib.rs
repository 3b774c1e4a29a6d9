// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

pub mod allocator;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod monitor;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod transport;
pub mod worker;

pub use error::{HubError, Result};
