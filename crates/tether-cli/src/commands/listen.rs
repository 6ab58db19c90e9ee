//! Listen command implementation.
//!
//! Runs a session until Ctrl+C and prints every transfer that arrives.

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;

use tether_core::config::{Config, SessionConfig};
use tether_core::file::{format_size, Artifact};
use tether_core::session::SessionManager;
use tether_core::transfer::Received;

use super::ListenArgs;

/// Run the listen command.
pub async fn run(args: ListenArgs, config: Config) -> Result<()> {
    let mut session_config = SessionConfig::from(&config);
    if let Some(output) = args.output {
        session_config.download_dir = output;
    }
    let download_dir = session_config.download_dir.clone();

    let local_port = args.ports.port.unwrap_or(config.network.local_port);
    let remote_port = args.ports.peer_port.unwrap_or(config.network.remote_port);
    let peer = args.peer.or(config.network.remote_address);

    let session = SessionManager::new(session_config);
    let local_addr = session
        .setup(local_port, remote_port, peer)
        .await
        .context("Failed to start session")?;
    let mut updates = session.receive_updates();

    if !args.json {
        println!();
        println!("Tether v{}", tether_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!("  Listening on {}", local_addr);
        match peer {
            Some(ip) => println!("  Peer:        {}:{}", ip, remote_port),
            None => println!("  Peer:        (first to connect)"),
        }
        println!("  Saving to:   {}", download_dir.display());
        println!();
        println!("  Press Ctrl+C to stop.");
        println!();
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(received) => print_received(&received, args.json)?,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Display fell behind, {} transfers not shown", missed);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.exit().await;
    Ok(())
}

fn print_received(received: &Received, json: bool) -> Result<()> {
    let description = &received.description;

    if json {
        let artifact = match &received.artifact {
            Artifact::File(path) => serde_json::json!({ "file": path }),
            Artifact::Bytes(bytes) => serde_json::json!({ "bytes": bytes.len() }),
        };
        let line = serde_json::json!({
            "description": description,
            "artifact": artifact,
        });
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    match &received.artifact {
        Artifact::File(path) => println!(
            "  Received {} ({}) -> {}",
            description.name,
            format_size(description.size),
            path.display()
        ),
        Artifact::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => println!("  Received text: {}", text),
            Err(_) => println!("  Received {} of binary data", format_size(bytes.len() as u64)),
        },
    }
    Ok(())
}
