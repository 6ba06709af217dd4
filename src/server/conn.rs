//! Per-session datagram transport
//!
//! Each transfer owns one ephemeral UDP socket wrapped in a [`Conn`].
//! A `Conn` does exactly one thing: send a datagram and wait for the
//! reply that answers it, enforcing the peer-address filter, the TID
//! lock, the round-trip deadline, and the retransmission budget.

use crate::config::ServerConfig;
use crate::error::{Result, TftpError};
use crate::retry::{Backoff, BackoffFn};
use crate::wire::constants::{DEFAULT_DATAGRAM_LEN, HEADER_LEN};
use crate::wire::Packet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

/// Counters kept by every transfer
#[derive(Debug, Default, Clone)]
pub struct TransferStats {
    /// Datagrams sent, retransmissions included
    pub packets_sent: u64,
    /// Datagrams accepted from the peer
    pub packets_received: u64,
    /// Flights that had to be retransmitted after a deadline expired
    pub retransmits: u64,
    /// Payload bytes moved through the user handler
    pub payload_bytes: u64,
}

pub(crate) struct Conn {
    socket: UdpSocket,
    peer: SocketAddr,
    tid: Option<u16>,
    timeout: Duration,
    retries: u32,
    retry: Backoff,
    recv_buf: Vec<u8>,
    pub(crate) stats: TransferStats,
}

impl Conn {
    pub(crate) fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        config: &ServerConfig,
        backoff: Option<BackoffFn>,
    ) -> Self {
        Conn {
            socket,
            peer,
            tid: None,
            timeout: config.timeout,
            retries: config.retries,
            retry: Backoff::new(backoff),
            recv_buf: vec![0; DEFAULT_DATAGRAM_LEN],
            stats: TransferStats::default(),
        }
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Regrow the receive buffer after `blksize` negotiation
    pub(crate) fn set_block_size(&mut self, block_size: usize) {
        self.recv_buf = vec![0; block_size + HEADER_LEN];
    }

    /// Send without waiting for an answer (ERROR packets, the plain
    /// final ACK). ERROR packets are never retransmitted.
    pub(crate) async fn send(&mut self, datagram: &[u8]) -> Result<()> {
        self.socket.send_to(datagram, self.peer).await?;
        self.stats.packets_sent += 1;
        Ok(())
    }

    /// One complete flight: send `datagram`, then deliver the reply.
    ///
    /// `screen` lets the caller skip packets that are valid but not an
    /// answer (duplicate ACKs, retransmitted DATA); skipped packets are
    /// dropped without restarting the flight. When the deadline passes
    /// the same datagram is retransmitted after the backoff delay, up
    /// to the configured number of retries.
    pub(crate) async fn exchange<F>(&mut self, datagram: &[u8], mut screen: F) -> Result<Packet>
    where
        F: FnMut(&Packet) -> bool,
    {
        self.retry.reset();
        loop {
            match self.round_trip(datagram, &mut screen).await? {
                Some(packet) => return Ok(packet),
                None if self.retry.count() < self.retries => {
                    self.stats.retransmits += 1;
                    self.retry.backoff().await;
                }
                None => {
                    return Err(TftpError::PeerUnresponsive {
                        attempts: self.retry.count() + 1,
                    })
                }
            }
        }
    }

    /// Send `datagram` and wait out one deadline for its answer.
    /// `Ok(None)` means the deadline expired.
    pub(crate) async fn round_trip<F>(
        &mut self,
        datagram: &[u8],
        screen: &mut F,
    ) -> Result<Option<Packet>>
    where
        F: FnMut(&Packet) -> bool,
    {
        self.socket.send_to(datagram, self.peer).await?;
        self.stats.packets_sent += 1;

        let deadline = Instant::now() + self.timeout;
        loop {
            let received = match timeout_at(deadline, self.socket.recv_from(&mut self.recv_buf)).await
            {
                Ok(received) => received?,
                Err(_) => return Ok(None),
            };
            let (len, from) = received;

            if from.ip() != self.peer.ip() {
                trace!(from = %from, "dropping datagram from foreign address");
                continue;
            }
            if let Some(tid) = self.tid {
                if from.port() != tid {
                    trace!(from = %from, tid, "dropping datagram from wrong TID");
                    continue;
                }
            }

            let packet = Packet::decode(&self.recv_buf[..len])?;

            // First accepted reply fixes the transfer ID; from here on
            // the session talks only to this port.
            self.tid = Some(from.port());
            self.peer = from;
            self.stats.packets_received += 1;

            if let Packet::Error { code, message } = &packet {
                return Err(TftpError::peer(*code, message.clone()));
            }
            if screen(&packet) {
                return Ok(Some(packet));
            }
            trace!(kind = packet.kind(), "skipping packet that does not answer this flight");
        }
    }
}
