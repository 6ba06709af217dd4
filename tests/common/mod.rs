//! Shared helpers for the TFTP integration tests
//!
//! The client side of every test is a scripted raw UDP socket: the
//! tests build datagrams with the crate's own codec and assert on the
//! exact packets the server puts on the wire.

#![allow(dead_code)]

use bytes::BytesMut;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tftp_tokio::wire::{Options, Packet};
use tftp_tokio::{
    HandlerFuture, IncomingTransfer, OutgoingTransfer, ReadHandler, Server, WriteHandler,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Outer guard so a broken server fails a test instead of hanging it
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut buf = BytesMut::new();
    packet.encode(&mut buf);
    buf.to_vec()
}

pub fn rrq(filename: &str, opts: Options) -> Vec<u8> {
    encode(&Packet::Rrq {
        filename: filename.to_string(),
        mode: "octet".to_string(),
        opts,
    })
}

pub fn wrq(filename: &str, opts: Options) -> Vec<u8> {
    encode(&Packet::Wrq {
        filename: filename.to_string(),
        mode: "octet".to_string(),
        opts,
    })
}

pub fn ack(block: u16) -> Vec<u8> {
    encode(&Packet::Ack { block })
}

pub fn data(block: u16, payload: &[u8]) -> Vec<u8> {
    encode(&Packet::Data {
        block,
        payload: bytes::Bytes::copy_from_slice(payload),
    })
}

pub fn blksize(value: &str) -> Options {
    let mut opts = Options::new();
    opts.insert("blksize", value);
    opts
}

/// Receive and decode one packet, failing the test after `RECV_TIMEOUT`
pub async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = vec![0u8; 65600];
    let (len, from) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a packet from the server")
        .expect("receive failed");
    let packet = Packet::decode(&buf[..len]).expect("server sent an undecodable datagram");
    (packet, from)
}

/// Expect silence on `socket` for `window`
pub async fn expect_silence(socket: &UdpSocket, window: Duration) {
    let mut buf = vec![0u8; 65600];
    if let Ok(received) = timeout(window, socket.recv_from(&mut buf)).await {
        let (len, from) = received.expect("receive failed");
        let packet = Packet::decode(&buf[..len]);
        panic!("expected silence, got {:?} from {}", packet, from);
    }
}

/// Bind a server on an OS-assigned loopback port and start serving
pub async fn spawn_server(server: Server) -> (SocketAddr, Arc<Server>, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let server = Arc::new(server);
    let handle = {
        let server = server.clone();
        tokio::spawn(async move {
            server.serve(socket).await.expect("server failed");
        })
    };
    (addr, server, handle)
}

/// Serves the same bytes for every filename
pub struct StaticReadHandler {
    pub content: Vec<u8>,
}

impl ReadHandler for StaticReadHandler {
    fn serve_read<'a>(
        &'a self,
        _filename: &'a str,
        transfer: &'a mut OutgoingTransfer,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            transfer.write(&self.content).await?;
            Ok(())
        })
    }
}

/// Like [`StaticReadHandler`], but reports what the request looked
/// like from inside the handler
pub struct RecordingReadHandler {
    pub content: Vec<u8>,
    pub requests: UnboundedSender<(String, String, Option<IpAddr>)>,
}

impl ReadHandler for RecordingReadHandler {
    fn serve_read<'a>(
        &'a self,
        filename: &'a str,
        transfer: &'a mut OutgoingTransfer,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let _ = self.requests.send((
                filename.to_string(),
                transfer.mode().to_string(),
                transfer.local_ip(),
            ));
            transfer.write(&self.content).await?;
            Ok(())
        })
    }
}

/// Reports transfer failures over a channel before propagating them
pub struct FailureReportingReadHandler {
    pub content: Vec<u8>,
    pub failures: UnboundedSender<String>,
}

impl ReadHandler for FailureReportingReadHandler {
    fn serve_read<'a>(
        &'a self,
        _filename: &'a str,
        transfer: &'a mut OutgoingTransfer,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Err(e) = transfer.write(&self.content).await {
                let _ = self.failures.send(e.to_string());
                return Err(e);
            }
            Ok(())
        })
    }
}

/// Collects every uploaded byte into shared memory
pub struct SinkWriteHandler {
    pub received: Arc<Mutex<Vec<u8>>>,
}

impl SinkWriteHandler {
    pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        (
            SinkWriteHandler {
                received: received.clone(),
            },
            received,
        )
    }
}

impl WriteHandler for SinkWriteHandler {
    fn serve_write<'a>(
        &'a self,
        _filename: &'a str,
        transfer: &'a mut IncomingTransfer,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let n = transfer.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                self.received.lock().unwrap().extend_from_slice(&buf[..n]);
            }
        })
    }
}
