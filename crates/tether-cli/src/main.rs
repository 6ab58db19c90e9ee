//! Tether CLI - peer-to-peer file and byte transfer
//!
//! Two machines run Tether pointed at each other; either side can send
//! files or text and the other side stores what arrives.
//!
//! ## Quick Start
//!
//! ```bash
//! # On the receiving machine
//! tether listen --peer 192.168.1.10
//!
//! # On the sending machine
//! tether send ./document.pdf --peer 192.168.1.20
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use clap::Parser;

mod commands;

use commands::{Cli, Command};

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = commands::load_config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.transfer.worker_threads.max(1))
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Command::Listen(args) => commands::listen::run(args, config).await,
            Command::Send(args) => commands::send::run(args, config).await,
            Command::Config(args) => commands::config::run(&args, &config),
        }
    })
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,tether=info,tether_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
