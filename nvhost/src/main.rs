// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;
mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;

use nvhost_sim::SimBench;
use workload::Workload;

/// nvhost - host1x command DMA on a simulated host
#[derive(Parser, Debug)]
#[command(name = "nvhost", version, about = "Run submission workloads against a simulated host1x")]
struct Args {
    /// Path to an INI config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Channel to submit to, by unit name
    #[arg(long, default_value = "gr3d")]
    channel: String,

    /// Number of submitting contexts
    #[arg(long, default_value_t = 2)]
    contexts: u32,

    /// Batches per context
    #[arg(long, default_value_t = 8)]
    batches: u32,

    /// Sync point increments per batch
    #[arg(long, default_value_t = 2)]
    incrs: u32,

    /// Make the first batch of context 0 hang so the watchdog has to recover
    #[arg(long)]
    hang: bool,

    /// Give every context a hardware context with save/restore programs
    #[arg(long)]
    hwctx: bool,

    /// Dump engine state after the run
    #[arg(long)]
    dump: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("nvhost - simulated host1x");

    let settings = config::load_config(args.config.as_deref());
    let bench = SimBench::start(settings.host.clone()).context("Failed to start simulated host")?;

    let load = Workload {
        channel: args.channel,
        contexts: args.contexts,
        batches: args.batches,
        incrs: args.incrs,
        hang: args.hang,
        hwctx: args.hwctx,
        submit_timeout_ms: settings.submit_timeout_ms,
        wait_timeout: Duration::from_millis(settings.wait_timeout_ms),
    };
    let report = workload::run(&bench, &load)?;
    report.log();

    if args.dump {
        bench.host().debug_dump(log::Level::Info);
    }

    bench.shutdown();
    info!("Done");
    Ok(())
}
