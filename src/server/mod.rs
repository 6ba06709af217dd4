//! Listener and session dispatch
//!
//! The [`Server`] owns the well-known port. Every RRQ or WRQ it reads
//! becomes a session on a freshly bound ephemeral socket, running on
//! its own task; everything else arriving on the well-known port is
//! dropped. Shutdown stops the accept loop and then waits for the
//! in-flight sessions to reach their own terminal states.

mod conn;
mod receiver;
mod sender;
mod sock;

pub use conn::TransferStats;
pub use receiver::IncomingTransfer;
pub use sender::OutgoingTransfer;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler::{ReadHandler, WriteHandler};
use crate::retry::BackoffFn;
use crate::wire::constants::{DEFAULT_DATAGRAM_LEN, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::wire::{ErrorCode, Options, Packet};
use sock::RequestSocket;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Keep the options this server is willing to serve, in request order.
///
/// Only `blksize` within its legal range is accepted today; `timeout`
/// and `tsize` are recognized on the wire but never echoed. Both state
/// machines negotiate through this one function.
pub(crate) fn negotiate_options(requested: &Options) -> (Options, Option<usize>) {
    let mut accepted = Options::new();
    let mut block_size = None;
    for (name, value) in requested.iter() {
        if name == "blksize" {
            match value.parse::<usize>() {
                Ok(n) if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&n) => {
                    block_size = Some(n);
                    accepted.insert(name, value);
                }
                _ => debug!(value, "dropping unusable blksize option"),
            }
        }
    }
    (accepted, block_size)
}

/// Counts in-flight work so shutdown can wait for zero
#[derive(Default)]
struct TransferTracker {
    count: AtomicUsize,
    idle: Notify,
}

impl TransferTracker {
    fn begin(self: &Arc<Self>) -> TransferGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        TransferGuard(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking, so a guard dropped in between
            // still wakes us.
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct TransferGuard(Arc<TransferTracker>);

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// The TFTP server.
///
/// Construction is builder-style; the server itself is shared behind
/// an `Arc` so `shutdown` can be called while `serve` runs:
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tftp_tokio::{HandlerFuture, OutgoingTransfer, Server};
///
/// fn hello<'a>(_: &'a str, t: &'a mut OutgoingTransfer) -> HandlerFuture<'a> {
///     Box::pin(async move {
///         t.write(b"hello\n").await?;
///         Ok(())
///     })
/// }
///
/// #[tokio::main]
/// async fn main() -> tftp_tokio::Result<()> {
///     let server = Arc::new(Server::new().read_handler(hello));
///     server.listen_and_serve("0.0.0.0:69").await
/// }
/// ```
pub struct Server {
    read_handler: Option<Arc<dyn ReadHandler>>,
    write_handler: Option<Arc<dyn WriteHandler>>,
    config: ServerConfig,
    backoff: Option<BackoffFn>,
    quit: Notify,
    transfers: Arc<TransferTracker>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Server {
            read_handler: None,
            write_handler: None,
            config: ServerConfig::default(),
            backoff: None,
            quit: Notify::new(),
            transfers: Arc::new(TransferTracker::default()),
        }
    }

    /// Serve read requests with `handler`. Without one, read requests
    /// are answered with an ERROR packet.
    pub fn read_handler(mut self, handler: impl ReadHandler) -> Self {
        self.read_handler = Some(Arc::new(handler));
        self
    }

    /// Serve write requests with `handler`. Without one, write
    /// requests are answered with an ERROR packet.
    pub fn write_handler(mut self, handler: impl WriteHandler) -> Self {
        self.write_handler = Some(Arc::new(handler));
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Delay retransmissions by whatever `backoff` computes from the
    /// attempt count. Without one, timed-out flights retry immediately.
    pub fn backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Bind the well-known port and serve until [`shutdown`](Self::shutdown)
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> Result<()> {
        let socket = UdpSocket::bind(addr).await?;
        self.serve(socket).await
    }

    /// Serve on an already-bound socket until [`shutdown`](Self::shutdown).
    ///
    /// Read failures on the well-known socket are logged and swallowed;
    /// only shutdown ends the loop.
    pub async fn serve(&self, socket: UdpSocket) -> Result<()> {
        let socket = RequestSocket::new(socket)?;
        let local = socket.local_addr()?;
        info!(addr = %local, "TFTP server listening");

        // The listener counts as in-flight work too, so shutdown keeps
        // waiting until the loop below has actually exited.
        let serving = self.transfers.begin();
        let mut buf = vec![0u8; DEFAULT_DATAGRAM_LEN];
        loop {
            tokio::select! {
                _ = self.quit.notified() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, src, local_ip)) => self.dispatch(&buf[..len], src, local_ip).await,
                    Err(e) => warn!(error = %e, "listener receive failed"),
                },
            }
        }
        // Release the well-known port before waiting out the sessions.
        drop(socket);
        drop(serving);

        info!(addr = %local, "TFTP server draining transfers");
        self.transfers.wait_idle().await;
        Ok(())
    }

    /// Stop accepting requests and wait for every outstanding transfer
    /// to finish. Transfers are never cancelled; they complete or time
    /// out on their own.
    pub async fn shutdown(&self) {
        self.quit.notify_one();
        self.transfers.wait_idle().await;
    }

    async fn dispatch(&self, datagram: &[u8], src: SocketAddr, local_ip: Option<IpAddr>) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(peer = %src, error = %e, "dropping undecodable datagram");
                return;
            }
        };
        match packet {
            Packet::Rrq {
                filename,
                mode,
                opts,
            } => self.spawn_read(filename, mode, opts, src, local_ip).await,
            Packet::Wrq {
                filename,
                mode,
                opts,
            } => self.spawn_write(filename, mode, opts, src, local_ip).await,
            other => {
                debug!(peer = %src, kind = other.kind(), "dropping non-request packet on listener port");
            }
        }
    }

    async fn spawn_read(
        &self,
        filename: String,
        mode: String,
        opts: Options,
        src: SocketAddr,
        local_ip: Option<IpAddr>,
    ) {
        let socket = match bind_session_socket(src).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(peer = %src, error = %e, "failed to bind session socket");
                return;
            }
        };
        info!(peer = %src, filename = %filename, mode = %mode, "read request");
        let mut transfer = OutgoingTransfer::new(
            socket,
            src,
            mode,
            opts,
            local_ip,
            &self.config,
            self.backoff.clone(),
        );
        let handler = self.read_handler.clone();
        let guard = self.transfers.begin();
        tokio::spawn(async move {
            let _guard = guard;
            match handler {
                Some(handler) => match handler.serve_read(&filename, &mut transfer).await {
                    Ok(()) => {
                        if let Err(e) = transfer.finish().await {
                            warn!(peer = %transfer.peer_addr(), error = %e, "read transfer failed");
                        }
                    }
                    Err(e) => {
                        warn!(peer = %transfer.peer_addr(), error = %e, "read handler failed");
                        transfer
                            .abort(ErrorCode::FileNotFound, &e.to_string())
                            .await;
                    }
                },
                None => {
                    transfer
                        .abort(ErrorCode::FileNotFound, "server does not support read requests")
                        .await;
                }
            }
        });
    }

    async fn spawn_write(
        &self,
        filename: String,
        mode: String,
        opts: Options,
        src: SocketAddr,
        local_ip: Option<IpAddr>,
    ) {
        let socket = match bind_session_socket(src).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(peer = %src, error = %e, "failed to bind session socket");
                return;
            }
        };
        info!(peer = %src, filename = %filename, mode = %mode, "write request");
        let mut transfer = IncomingTransfer::new(
            socket,
            src,
            mode,
            opts,
            local_ip,
            &self.config,
            self.backoff.clone(),
        );
        let handler = self.write_handler.clone();
        let guard = self.transfers.begin();
        tokio::spawn(async move {
            let _guard = guard;
            match handler {
                Some(handler) => match handler.serve_write(&filename, &mut transfer).await {
                    Ok(()) => {
                        if let Err(e) = transfer.terminate().await {
                            warn!(peer = %transfer.peer_addr(), error = %e, "write transfer failed");
                        }
                    }
                    Err(e) => {
                        warn!(peer = %transfer.peer_addr(), error = %e, "write handler failed");
                        transfer
                            .abort(ErrorCode::FileNotFound, &e.to_string())
                            .await;
                    }
                },
                None => {
                    transfer
                        .abort(ErrorCode::FileNotFound, "server does not support write requests")
                        .await;
                }
            }
        });
    }
}

/// Bind the session's ephemeral socket on the address family the
/// request came in on
async fn bind_session_socket(peer: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    UdpSocket::bind(local).await
}
