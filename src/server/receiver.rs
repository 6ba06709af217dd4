//! Receiver state machine — serves write requests
//!
//! The write handler sees this as a byte source: `read` hands out the
//! payload of the current DATA block and, once it is drained, sends
//! the ACK that solicits the next block. A payload shorter than the
//! block size marks the end of the stream; the dispatcher then drives
//! the termination handshake.

use super::conn::{Conn, TransferStats};
use super::negotiate_options;
use crate::config::ServerConfig;
use crate::error::{Result, TftpError};
use crate::retry::BackoffFn;
use crate::wire::constants::DEFAULT_BLOCK_SIZE;
use crate::wire::{ErrorCode, Options, Packet};
use bytes::{Buf, Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// An in-progress upload, handed to the [`WriteHandler`](crate::WriteHandler)
pub struct IncomingTransfer {
    conn: Conn,
    requested: Options,
    accepted: Options,
    mode: String,
    local_ip: Option<IpAddr>,
    /// Number of the most recently accepted DATA block; the next ACK
    /// carries this value
    block: u16,
    block_size: usize,
    /// Undelivered payload of block `block`
    pending: Bytes,
    /// The current block was shorter than `block_size`
    last_seen: bool,
    dally: bool,
    scratch: BytesMut,
    negotiated: bool,
    closed: bool,
}

impl IncomingTransfer {
    pub(crate) fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        mode: String,
        opts: Options,
        local_ip: Option<IpAddr>,
        config: &ServerConfig,
        backoff: Option<BackoffFn>,
    ) -> Self {
        IncomingTransfer {
            conn: Conn::new(socket, peer, config, backoff),
            requested: opts,
            accepted: Options::new(),
            mode,
            local_ip,
            block: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            pending: Bytes::new(),
            last_seen: false,
            dally: config.dally,
            scratch: BytesMut::new(),
            negotiated: false,
            closed: false,
        }
    }

    /// Pull payload out of the transfer. `Ok(0)` means the peer sent
    /// its final block and the stream is complete.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(TftpError::Closed);
        }
        self.ensure_negotiated().await?;

        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.advance(n);
                self.conn.stats.payload_bytes += n as u64;
                return Ok(n);
            }
            if self.last_seen {
                return Ok(0);
            }
            self.advance().await?;
        }
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

    /// Acknowledge the final block. When dallying is enabled the
    /// session lingers to re-ACK retransmissions of that block, in
    /// case the peer never hears the first ACK.
    pub(crate) async fn terminate(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.negotiated {
            // The handler never touched the stream; there is nothing
            // to acknowledge.
            return Ok(());
        }

        let block = self.block;
        self.scratch.clear();
        Packet::Ack { block }.encode(&mut self.scratch);

        if !self.dally {
            return self.conn.send(&self.scratch[..]).await;
        }
        for _ in 0..3 {
            let mut screen = |packet: &Packet| matches!(packet, Packet::Data { .. });
            match self.conn.round_trip(&self.scratch[..], &mut screen).await {
                // Silence: the peer heard the ACK and went away.
                Ok(None) => return Ok(()),
                // Final block again; the loop resends the ACK.
                Ok(Some(_)) => continue,
                Err(_) => return Ok(()),
            }
        }
        warn!(peer = %self.conn.peer(), "peer kept retransmitting its final block");
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

    /// Answer the request: an OACK when any option was accepted, a
    /// plain ACK of block 0 otherwise. Either way the reply that ends
    /// the flight is DATA block 1.
    async fn ensure_negotiated(&mut self) -> Result<()> {
        if self.negotiated {
            return Ok(());
        }
        self.negotiated = true;

        let (accepted, block_size) = negotiate_options(&self.requested);
        if let Some(size) = block_size {
            self.block_size = size;
            self.conn.set_block_size(size);
        }

        self.scratch.clear();
        if accepted.is_empty() {
            Packet::Ack { block: 0 }.encode(&mut self.scratch);
        } else {
            Packet::Oack(accepted.clone()).encode(&mut self.scratch);
        }

        let reply = match self
            .conn
            .exchange(&self.scratch[..], |packet| match packet {
                Packet::Data { block, .. } => *block == 1,
                _ => true,
            })
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e).await),
        };
        match reply {
            Packet::Data { payload, .. } => {
                if !accepted.is_empty() {
                    debug!(peer = %self.conn.peer(), block_size = self.block_size, "options accepted");
                    self.accepted = accepted;
                }
                self.block = 1;
                self.accept_block(payload);
                Ok(())
            }
            other => {
                Err(self
                    .violation(format!("expected DATA block 1, got {}", other.kind()))
                    .await)
            }
        }
    }

    /// ACK the current block and wait for the next one
    async fn advance(&mut self) -> Result<()> {
        let acked = self.block;
        let expected = acked.wrapping_add(1);

        self.scratch.clear();
        Packet::Ack { block: acked }.encode(&mut self.scratch);

        loop {
            let reply = match self
                .conn
                .exchange(&self.scratch[..], move |packet| match packet {
                    // Deliver the block we are waiting for and any
                    // retransmission of the one we just acknowledged;
                    // everything else in between is noise.
                    Packet::Data { block, .. } => *block == expected || *block == acked,
                    _ => true,
                })
                .await
            {
                Ok(reply) => reply,
                Err(e) => return Err(self.fail(e).await),
            };
            match reply {
                Packet::Data { block, payload } if block == expected => {
                    self.block = expected;
                    self.accept_block(payload);
                    return Ok(());
                }
                Packet::Data { .. } => {
                    // The peer missed our ACK and resent the previous
                    // block; going around the loop resends the ACK.
                    continue;
                }
                other => {
                    return Err(self
                        .violation(format!(
                            "expected DATA block {}, got {}",
                            expected,
                            other.kind()
                        ))
                        .await)
                }
            }
        }
    }

    fn accept_block(&mut self, payload: Bytes) {
        if payload.len() < self.block_size {
            self.last_seen = true;
        }
        self.pending = payload;
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
