//! Send command implementation.
//!
//! Sends files and/or a text payload to the peer, shows combined progress
//! and exits once every transfer has finished.

use std::io::{self, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;

use tether_core::config::{Config, SessionConfig};
use tether_core::file::format_size;
use tether_core::session::SessionManager;
use tether_core::transfer::{Payload, TransferInfo};

use super::SendArgs;

/// Name given to text payloads.
const TEXT_NAME: &str = "text";

/// Run the send command.
pub async fn run(args: SendArgs, config: Config) -> Result<()> {
    let mut payloads: Vec<Payload> = args.paths.iter().cloned().map(Payload::File).collect();
    if let Some(text) = &args.text {
        payloads.push(Payload::text(text));
    }
    if payloads.is_empty() {
        bail!("Nothing to send: give one or more files or --text");
    }

    let local_port = args.ports.port.unwrap_or(config.network.local_port);
    let remote_port = args.ports.peer_port.unwrap_or(config.network.remote_port);

    let session = SessionManager::new(SessionConfig::from(&config));
    session
        .setup(local_port, remote_port, Some(args.peer))
        .await
        .context("Failed to start session")?;

    if !args.quiet {
        println!();
        println!("Tether v{}", tether_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!("  Sending to {}:{}", args.peer, remote_port);
        println!();
    }

    let mut transfers = Vec::with_capacity(payloads.len());
    for (index, payload) in payloads.into_iter().enumerate() {
        let is_text = matches!(payload, Payload::Bytes(_));
        let mut description = payload
            .describe(u32::try_from(index).unwrap_or(u32::MAX))
            .await
            .context("Failed to prepare payload")?;
        if is_text {
            description.name = TEXT_NAME.to_string();
        }

        if !args.quiet {
            println!("  {} ({})", description.name, format_size(description.size));
        }
        transfers.push(session.send(payload, description).await?);
    }
    if !args.quiet {
        println!();
    }

    let results = wait_all(transfers, args.quiet).await;
    session.exit().await;

    let failed: Vec<&TransferInfo> = results.iter().filter(|info| info.failed).collect();
    if !args.quiet {
        for info in &results {
            if info.succeeded {
                println!(
                    "  Sent {} in {:.1}s",
                    info.description.name,
                    info.elapsed().as_secs_f64()
                );
            }
        }
    }
    for info in &failed {
        eprintln!(
            "  Failed to send {}: {}",
            info.description.name,
            info.error.as_deref().unwrap_or("unknown error")
        );
    }

    if !failed.is_empty() {
        bail!("{} of {} transfers failed", failed.len(), results.len());
    }
    Ok(())
}

/// Poll every transfer until all have finished, showing combined progress.
async fn wait_all(transfers: Vec<watch::Receiver<TransferInfo>>, quiet: bool) -> Vec<TransferInfo> {
    loop {
        let snapshot: Vec<TransferInfo> = transfers.iter().map(|rx| rx.borrow().clone()).collect();

        if !quiet {
            let sent: u64 = snapshot.iter().map(|info| info.bytes_transferred).sum();
            let total: u64 = snapshot.iter().map(|info| info.total_bytes).sum();
            let done = snapshot.iter().filter(|info| info.is_finished()).count();
            print!(
                "\r  [{}/{}] {} of {}    ",
                done,
                snapshot.len(),
                format_size(sent),
                format_size(total)
            );
            let _ = io::stdout().flush();
        }

        if snapshot.iter().all(TransferInfo::is_finished) {
            if !quiet {
                println!();
                println!();
            }
            return snapshot;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
