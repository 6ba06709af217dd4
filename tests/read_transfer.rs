//! End-to-end read (RRQ) transfers against a live server

mod common;

use bytes::Bytes;
use common::*;
use tftp_tokio::wire::{ErrorCode, Options, Packet};
use tftp_tokio::Server;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_byte_file_no_options() {
    let handler = StaticReadHandler {
        content: b"abc".to_vec(),
    };
    let (addr, server, handle) = spawn_server(Server::new().read_handler(handler)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&rrq("foo", Options::new()), addr)
        .await
        .unwrap();

    let (packet, session) = recv_packet(&client).await;
    assert_ne!(
        session.port(),
        addr.port(),
        "DATA must come from an ephemeral session port"
    );
    assert_eq!(
        packet,
        Packet::Data {
            block: 1,
            payload: Bytes::from_static(b"abc"),
        }
    );

    client.send_to(&ack(1), session).await.unwrap();

    server.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_length_file_sends_one_empty_block() {
    let handler = StaticReadHandler {
        content: Vec::new(),
    };
    let (addr, server, handle) = spawn_server(Server::new().read_handler(handler)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&rrq("empty", Options::new()), addr)
        .await
        .unwrap();

    let (packet, session) = recv_packet(&client).await;
    assert_eq!(
        packet,
        Packet::Data {
            block: 1,
            payload: Bytes::new(),
        }
    );
    client.send_to(&ack(1), session).await.unwrap();

    server.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exact_multiple_gets_trailing_empty_block() {
    let content = vec![0x55u8; 512];
    let handler = StaticReadHandler {
        content: content.clone(),
    };
    let (addr, server, handle) = spawn_server(Server::new().read_handler(handler)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&rrq("aligned", Options::new()), addr)
        .await
        .unwrap();

    let (packet, session) = recv_packet(&client).await;
    let Packet::Data { block: 1, payload } = packet else {
        panic!("expected DATA block 1, got {:?}", packet);
    };
    assert_eq!(&payload[..], &content[..]);
    client.send_to(&ack(1), session).await.unwrap();

    let (packet, _) = recv_packet(&client).await;
    assert_eq!(
        packet,
        Packet::Data {
            block: 2,
            payload: Bytes::new(),
        }
    );
    client.send_to(&ack(2), session).await.unwrap();

    server.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blksize_negotiation_splits_on_larger_blocks() {
    let content: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    let handler = StaticReadHandler {
        content: content.clone(),
    };
    let (addr, server, handle) = spawn_server(Server::new().read_handler(handler)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&rrq("big", blksize("1024")), addr)
        .await
        .unwrap();

    let (packet, session) = recv_packet(&client).await;
    let Packet::Oack(opts) = packet else {
        panic!("expected OACK, got {:?}", packet);
    };
    assert_eq!(opts.get("blksize"), Some("1024"));
    client.send_to(&ack(0), session).await.unwrap();

    let (packet, _) = recv_packet(&client).await;
    let Packet::Data { block: 1, payload } = packet else {
        panic!("expected DATA block 1, got {:?}", packet);
    };
    assert_eq!(&payload[..], &content[..1024]);
    client.send_to(&ack(1), session).await.unwrap();

    let (packet, _) = recv_packet(&client).await;
    let Packet::Data { block: 2, payload } = packet else {
        panic!("expected DATA block 2, got {:?}", packet);
    };
    assert_eq!(&payload[..], &content[1024..]);
    client.send_to(&ack(2), session).await.unwrap();

    server.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_range_blksize_is_dropped_silently() {
    let handler = StaticReadHandler {
        content: b"tiny".to_vec(),
    };
    let (addr, server, handle) = spawn_server(Server::new().read_handler(handler)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&rrq("tiny", blksize("70000")), addr)
        .await
        .unwrap();

    // No option survives, so there is no OACK: the reply is DATA
    // block 1 at the default block size.
    let (packet, session) = recv_packet(&client).await;
    assert_eq!(
        packet,
        Packet::Data {
            block: 1,
            payload: Bytes::from_static(b"tiny"),
        }
    );
    client.send_to(&ack(1), session).await.unwrap();

    server.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_sees_filename_mode_and_local_ip() {
    let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
    let handler = RecordingReadHandler {
        content: b"x".to_vec(),
        requests: requests_tx,
    };
    let (addr, server, handle) = spawn_server(Server::new().read_handler(handler)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&rrq("config/boot.cfg", Options::new()), addr)
        .await
        .unwrap();

    let (_, session) = recv_packet(&client).await;
    client.send_to(&ack(1), session).await.unwrap();

    let (filename, mode, local_ip) = requests_rx.recv().await.unwrap();
    assert_eq!(filename, "config/boot.cfg");
    assert_eq!(mode, "octet");
    if cfg!(any(target_os = "linux", target_os = "macos")) {
        assert_eq!(local_ip, Some("127.0.0.1".parse().unwrap()));
    }

    server.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_without_handler_is_refused() {
    let (sink, _) = SinkWriteHandler::new();
    let (addr, server, handle) = spawn_server(Server::new().write_handler(sink)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&rrq("anything", Options::new()), addr)
        .await
        .unwrap();

    let (packet, _) = recv_packet(&client).await;
    assert_eq!(
        packet,
        Packet::Error {
            code: ErrorCode::FileNotFound,
            message: "server does not support read requests".to_string(),
        }
    );

    server.shutdown().await;
    handle.await.unwrap();
}
