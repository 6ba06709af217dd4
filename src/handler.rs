//! Request handler seam
//!
//! The server hands incoming requests to user-supplied handlers: a
//! [`ReadHandler`] feeds payload into an [`OutgoingTransfer`], a
//! [`WriteHandler`] drains payload from an [`IncomingTransfer`]. The
//! traits are object-safe so the server can hold `Arc<dyn ReadHandler>`.
//!
//! A plain `fn` (or any matching closure) works directly thanks to the
//! blanket impls:
//!
//! ```rust
//! use tftp_tokio::{HandlerFuture, OutgoingTransfer};
//!
//! fn serve_greeting<'a>(
//!     filename: &'a str,
//!     transfer: &'a mut OutgoingTransfer,
//! ) -> HandlerFuture<'a> {
//!     Box::pin(async move {
//!         let _ = filename;
//!         transfer.write(b"hello\n").await?;
//!         Ok(())
//!     })
//! }
//! ```

use crate::error::Result;
use crate::server::{IncomingTransfer, OutgoingTransfer};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by handler methods
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Serves read requests by writing payload into the transfer.
///
/// Returning `Err` aborts the session: the peer receives an ERROR
/// packet (code 1) carrying the error's message.
pub trait ReadHandler: Send + Sync + 'static {
    fn serve_read<'a>(
        &'a self,
        filename: &'a str,
        transfer: &'a mut OutgoingTransfer,
    ) -> HandlerFuture<'a>;
}

/// Serves write requests by reading payload out of the transfer.
///
/// Returning `Err` aborts the session the same way; on `Ok` the server
/// completes the termination handshake itself.
pub trait WriteHandler: Send + Sync + 'static {
    fn serve_write<'a>(
        &'a self,
        filename: &'a str,
        transfer: &'a mut IncomingTransfer,
    ) -> HandlerFuture<'a>;
}

impl<F> ReadHandler for F
where
    F: for<'a> Fn(&'a str, &'a mut OutgoingTransfer) -> HandlerFuture<'a>,
    F: Send + Sync + 'static,
{
    fn serve_read<'a>(
        &'a self,
        filename: &'a str,
        transfer: &'a mut OutgoingTransfer,
    ) -> HandlerFuture<'a> {
        self(filename, transfer)
    }
}

impl<F> WriteHandler for F
where
    F: for<'a> Fn(&'a str, &'a mut IncomingTransfer) -> HandlerFuture<'a>,
    F: Send + Sync + 'static,
{
    fn serve_write<'a>(
        &'a self,
        filename: &'a str,
        transfer: &'a mut IncomingTransfer,
    ) -> HandlerFuture<'a> {
        self(filename, transfer)
    }
}
