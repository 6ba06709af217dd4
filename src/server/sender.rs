//! Sender state machine — serves read requests
//!
//! The read handler sees this as a byte sink: every `write` buffers
//! payload, and each time a full block accumulates with more payload
//! behind it, the block goes out as a DATA flight and the machine
//! waits for its ACK. The short (possibly empty) remainder becomes the
//! final block when the dispatcher calls `finish`.

use super::conn::{Conn, TransferStats};
use super::negotiate_options;
use crate::config::ServerConfig;
use crate::error::{Result, TftpError};
use crate::retry::BackoffFn;
use crate::wire::constants::{DEFAULT_BLOCK_SIZE, OP_DATA};
use crate::wire::{ErrorCode, Options, Packet};
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::debug;

/// An in-progress download, handed to the [`ReadHandler`](crate::ReadHandler)
pub struct OutgoingTransfer {
    conn: Conn,
    requested: Options,
    accepted: Options,
    mode: String,
    local_ip: Option<IpAddr>,
    /// Number of the next DATA flight
    block: u16,
    block_size: usize,
    /// Payload waiting for its flight, never longer than one block
    buf: Vec<u8>,
    scratch: BytesMut,
    negotiated: bool,
    closed: bool,
}

impl OutgoingTransfer {
    pub(crate) fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        mode: String,
        opts: Options,
        local_ip: Option<IpAddr>,
        config: &ServerConfig,
        backoff: Option<BackoffFn>,
    ) -> Self {
        OutgoingTransfer {
            conn: Conn::new(socket, peer, config, backoff),
            requested: opts,
            accepted: Options::new(),
            mode,
            local_ip,
            block: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            buf: Vec::with_capacity(DEFAULT_BLOCK_SIZE),
            scratch: BytesMut::new(),
            negotiated: false,
            closed: false,
        }
    }

    /// Append payload to the transfer, sending full blocks as they
    /// accumulate. Returns the number of bytes consumed, which is
    /// always `payload.len()` unless the transfer fails.
    pub async fn write(&mut self, payload: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(TftpError::Closed);
        }
        self.ensure_negotiated().await?;

        let mut written = 0;
        while written < payload.len() {
            if self.buf.len() == self.block_size {
                // A full block with payload behind it cannot be the
                // final one, so it is safe to put on the wire now.
                self.flush_block().await?;
            }
            let space = self.block_size - self.buf.len();
            let take = space.min(payload.len() - written);
            self.buf.extend_from_slice(&payload[written..written + take]);
            written += take;
        }
        Ok(written)
    }

    /// Transfer mode requested by the client (`octet`, `netascii`, ...).
    /// Forwarded as-is; the server does not interpret it.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Options this server accepted for the session
    pub fn options(&self) -> &Options {
        &self.accepted
    }

    /// Negotiated payload size per DATA block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer()
    }

    /// Local IP the original request was addressed to, when the
    /// platform exposes it
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    pub fn stats(&self) -> TransferStats {
        self.conn.stats.clone()
    }

    /// Flush the buffered remainder as the final block. A transfer
    /// whose length is an exact multiple of the block size gets one
    /// more zero-length block so the peer sees the end of the file.
    pub(crate) async fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Err(TftpError::Closed);
        }
        self.ensure_negotiated().await?;

        let exact_multiple = self.buf.len() == self.block_size;
        self.flush_block().await?;
        if exact_multiple {
            self.flush_block().await?;
        }
        self.closed = true;
        debug!(peer = %self.conn.peer(), "read transfer complete");
        Ok(())
    }

    /// End the session with an ERROR packet, sent best-effort
    pub(crate) async fn abort(&mut self, code: ErrorCode, message: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.send_error(code, message).await;
    }

    async fn ensure_negotiated(&mut self) -> Result<()> {
        if self.negotiated {
            return Ok(());
        }
        self.negotiated = true;

        let (accepted, block_size) = negotiate_options(&self.requested);
        if let Some(size) = block_size {
            self.block_size = size;
            self.buf.reserve(size);
            self.conn.set_block_size(size);
        }
        if accepted.is_empty() {
            // Nothing to acknowledge; the first DATA block doubles as
            // the answer to the request.
            return Ok(());
        }

        self.scratch.clear();
        Packet::Oack(accepted.clone()).encode(&mut self.scratch);
        let reply = match self.conn.exchange(&self.scratch[..], |_| true).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e).await),
        };
        match reply {
            Packet::Ack { block: 0 } => {
                debug!(peer = %self.conn.peer(), block_size = self.block_size, "options accepted");
                self.accepted = accepted;
                Ok(())
            }
            Packet::Ack { block } => {
                Err(self
                    .violation(format!("expected ACK of block 0 after OACK, got ACK {}", block))
                    .await)
            }
            other => {
                Err(self
                    .violation(format!("expected ACK after OACK, got {}", other.kind()))
                    .await)
            }
        }
    }

    /// Put the buffered payload on the wire and wait for its ACK
    async fn flush_block(&mut self) -> Result<()> {
        let block = self.block;
        let prev = block.wrapping_sub(1);

        self.scratch.clear();
        self.scratch.put_u16(OP_DATA);
        self.scratch.put_u16(block);
        self.scratch.extend_from_slice(&self.buf);

        let reply = match self
            .conn
            .exchange(&self.scratch[..], move |packet| match packet {
                // The peer re-ACKing the previous block never answers
                // this flight and must not trigger a retransmission.
                Packet::Ack { block } => *block != prev,
                _ => true,
            })
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e).await),
        };

        match reply {
            Packet::Ack { block: acked } if acked == block => {
                self.conn.stats.payload_bytes += self.buf.len() as u64;
                self.block = block.wrapping_add(1);
                self.buf.clear();
                Ok(())
            }
            Packet::Ack { block: acked } => {
                Err(self
                    .violation(format!(
                        "peer acknowledged block {} while block {} was in flight",
                        acked, block
                    ))
                    .await)
            }
            other => {
                Err(self
                    .violation(format!("expected ACK of block {}, got {}", block, other.kind()))
                    .await)
            }
        }
    }

    async fn violation(&mut self, message: String) -> TftpError {
        self.fail(TftpError::protocol(message)).await
    }

    /// Close the session over `err`, notifying the peer when it makes
    /// sense to: protocol violations get an ERROR packet, unresponsive
    /// or already-erroring peers get silence.
    async fn fail(&mut self, err: TftpError) -> TftpError {
        if !self.closed {
            self.closed = true;
            match &err {
                TftpError::Protocol { message } | TftpError::MalformedPacket { message } => {
                    let message = message.clone();
                    self.send_error(ErrorCode::IllegalOperation, &message).await;
                }
                _ => {}
            }
        }
        err
    }

    async fn send_error(&mut self, code: ErrorCode, message: &str) {
        self.scratch.clear();
        Packet::Error {
            code,
            message: message.to_string(),
        }
        .encode(&mut self.scratch);
        let _ = self.conn.send(&self.scratch[..]).await;
    }
}
