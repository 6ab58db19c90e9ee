//! CLI command definitions and handlers.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod listen;
pub mod send;

/// Load configuration with graceful fallback to defaults.
///
/// A missing file yields defaults; an unreadable or invalid one is reported
/// and ignored.
pub fn load_config() -> tether_core::config::Config {
    tether_core::config::Config::load().unwrap_or_else(|e| {
        tracing::warn!("Ignoring configuration file: {}", e);
        tether_core::config::Config::default()
    })
}

/// Tether - peer-to-peer file and byte transfer
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Wait for transfers from the peer
    Listen(ListenArgs),

    /// Send files or text to the peer
    Send(SendArgs),

    /// Inspect configuration
    Config(ConfigArgs),
}

/// Ports and peer address shared by `listen` and `send`
#[derive(Parser, Debug, Clone)]
pub struct PeerArgs {
    /// Local port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Port the peer listens on
    #[arg(long)]
    pub peer_port: Option<u16>,
}

/// Arguments for the listen command
#[derive(Parser, Debug)]
pub struct ListenArgs {
    #[command(flatten)]
    pub ports: PeerArgs,

    /// Peer address (learned from the first connection when omitted)
    #[arg(long, env = "TETHER_PEER")]
    pub peer: Option<IpAddr>,

    /// Output directory for received files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print each received transfer as a JSON line
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the send command
#[derive(Parser, Debug)]
pub struct SendArgs {
    /// Files to send
    pub paths: Vec<PathBuf>,

    /// Text to send as a byte payload
    #[arg(short, long)]
    pub text: Option<String>,

    /// Peer address
    #[arg(long, env = "TETHER_PEER")]
    pub peer: IpAddr,

    #[command(flatten)]
    pub ports: PeerArgs,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Config action
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen() {
        let cli = Cli::try_parse_from([
            "tether", "listen", "--port", "5000", "--peer-port", "6000", "--peer", "10.0.0.2",
        ])
        .unwrap();

        let Command::Listen(args) = cli.command else {
            panic!("expected listen");
        };
        assert_eq!(args.ports.port, Some(5000));
        assert_eq!(args.ports.peer_port, Some(6000));
        assert_eq!(args.peer, Some("10.0.0.2".parse().unwrap()));
        assert!(args.output.is_none());
    }

    #[test]
    fn test_parse_send() {
        let cli = Cli::try_parse_from([
            "tether", "send", "a.txt", "b.bin", "--text", "hi", "--peer", "192.168.1.4",
        ])
        .unwrap();

        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.paths, vec![PathBuf::from("a.txt"), PathBuf::from("b.bin")]);
        assert_eq!(args.text.as_deref(), Some("hi"));
        assert!(args.ports.port.is_none());
    }

    #[test]
    fn test_parse_rejects_bad_peer() {
        assert!(Cli::try_parse_from(["tether", "send", "a", "--peer", "not-an-ip"]).is_err());
    }

    #[test]
    fn test_parse_config_actions() {
        let cli = Cli::try_parse_from(["tether", "config", "path"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config(ConfigArgs {
                action: ConfigAction::Path
            })
        ));
    }
}
