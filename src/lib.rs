//! # TFTP Tokio - Async TFTP Server
//!
//! An async-first TFTP server (RFC 1350 with RFC 2347/2348 option
//! negotiation) built on top of Tokio. The server moves bytes; where
//! they come from and where they go is up to the handlers you plug in,
//! so a filesystem, an object store, or a firmware blob in memory all
//! work the same way.
//!
//! ## Features
//!
//! - **Async-First Design**: one lightweight task per transfer, plus
//!   one for the listener
//! - **Stop-and-Wait Engine**: retransmission with per-round-trip
//!   deadlines and a pluggable backoff policy
//! - **Option Negotiation**: `blksize` up to 65464 bytes per block
//! - **Handler-Defined Storage**: byte-sink/byte-source callbacks
//!   instead of a built-in filesystem
//! - **Multihoming Aware**: per-packet destination addresses on the
//!   listener socket where the platform provides them
//! - **Observability**: integrated tracing and per-transfer counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tftp_tokio::{HandlerFuture, OutgoingTransfer, Server, ServerConfig};
//!
//! fn serve_firmware<'a>(
//!     filename: &'a str,
//!     transfer: &'a mut OutgoingTransfer,
//! ) -> HandlerFuture<'a> {
//!     Box::pin(async move {
//!         let image: &[u8] = b"...firmware bytes...";
//!         let _ = filename;
//!         transfer.write(image).await?;
//!         Ok(())
//!     })
//! }
//!
//! #[tokio::main]
//! async fn main() -> tftp_tokio::Result<()> {
//!     let server = Arc::new(
//!         Server::new()
//!             .read_handler(serve_firmware)
//!             .config(ServerConfig::new().retries(3)),
//!     );
//!     server.listen_and_serve("0.0.0.0:69").await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  Listener/Dispatcher │  Server: well-known port, session spawning
//! ├──────────────────────┤
//! │   State Machines     │  OutgoingTransfer, IncomingTransfer
//! ├──────────────────────┤
//! │  Session Transport   │  one ephemeral socket, TID lock, retries
//! ├──────────────────────┤
//! │     Wire Codec       │  RRQ/WRQ/DATA/ACK/OACK/ERROR
//! └──────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod retry;
pub mod server;
pub mod wire;

// Re-exports
pub use config::ServerConfig;
pub use error::{Result, TftpError};
pub use handler::{HandlerFuture, ReadHandler, WriteHandler};
pub use retry::BackoffFn;
pub use server::{IncomingTransfer, OutgoingTransfer, Server, TransferStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
