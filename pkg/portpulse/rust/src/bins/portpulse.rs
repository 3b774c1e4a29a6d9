// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error};
use portpulse::cli::{self, Cli};
use portpulse::config::HubConfig;

// PR_SET_PDEATHSIG fires when the spawning thread exits, so workers must be
// launched from the main thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = HubConfig::load().context("loading configuration")?;
    simple_logger::init_with_level(config.log_level())?;
    debug!(
        "portpulse {} using {}",
        env!("CARGO_PKG_VERSION"),
        config.state_dir.display()
    );

    let is_worker = args.command.is_worker();
    if let Err(e) = cli::run(args.command, config).await {
        if is_worker {
            error!("{e:#}");
        }
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
