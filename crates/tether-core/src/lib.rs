//! # Tether Core Library
//!
//! `tether-core` moves files and byte payloads between two fixed peers over a
//! small framed binary protocol on plain TCP.
//!
//! ## Features
//!
//! - **Tiny wire format**: 3-byte frame header, no delimiter scanning
//! - **Streaming**: files are chunked from disk and reassembled to disk
//! - **Resilient link**: a reconnecting dialer keeps a pool of ready connections
//! - **Concurrent sends**: every transfer gets its own pooled connection
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`connection`] - Listener, reconnecting dialer and connection pool
//! - [`mod@file`] - Chunking payloads into frames and reassembling them
//! - [`protocol`] - Frame codec and Description line codec
//! - [`session`] - Session manager and session registry
//! - [`transfer`] - Send driver, receive loop and progress records
//! - [`transport`] - One raw TCP connection
//!
//! ## Example
//!
//! ```rust,ignore
//! use tether_core::config::Config;
//! use tether_core::session::SessionManager;
//! use tether_core::transfer::Payload;
//!
//! let config = Config::load()?;
//! let session = SessionManager::new((&config).into());
//! session.setup(47100, 47100, Some("192.168.1.20".parse()?)).await?;
//!
//! let payload = Payload::File("report.pdf".into());
//! let description = payload.describe(0).await?;
//! let mut progress = session.send(payload, description).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod connection;
pub mod error;
pub mod file;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port for both the listener and the dialed peer
pub const DEFAULT_PORT: u16 = 47100;

/// Default size of one wire frame, header included
pub const DEFAULT_FRAME_SIZE: usize = 1024;

/// Default size of a single socket read
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 1024;

/// Default capacity of the outbound connection pool
pub const DEFAULT_POOL_CAPACITY: usize = 10;

/// Default delay between failed dial attempts (milliseconds)
pub const DEFAULT_DIAL_BACKOFF_MS: u64 = 500;

/// Default number of runtime worker threads
pub const DEFAULT_WORKER_THREADS: usize = 16;
