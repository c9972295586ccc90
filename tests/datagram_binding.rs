//! Integration tests for UDP session binding and endpoint filtering

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::*;
use netplay_engine::core::packet::Packet;
use netplay_engine::protocol::handshake::{identity_packet, read_welcome};
use netplay_engine::service::server::{Server, ServerEvent};
use netplay_engine::service::session::SessionId;
use netplay_engine::transport::Transport;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};

const POSITION: i32 = 9;

/// Datagram in the client-to-server layout
fn tagged(session: i32, packet: Option<Packet>) -> Vec<u8> {
    let mut packet = packet.unwrap_or_default();
    packet.write_length();
    packet.insert_i32(session);
    packet.into_bytes()
}

fn position(value: i32) -> Packet {
    let mut packet = Packet::with_id(POSITION);
    packet.write_i32(value);
    packet
}

fn bound(events: &[ServerEvent]) -> bool {
    events.iter().any(|e| {
        matches!(
            e,
            ServerEvent::SessionConnected {
                transport: Transport::Datagram,
                ..
            }
        )
    })
}

/// Server that records every position update it dispatches
async fn recording_server() -> (Server, SocketAddr, Arc<Mutex<Vec<(SessionId, i32)>>>) {
    let (mut server, addr) = started_server(server_config(4)).await;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    server
        .register_handler(POSITION, move |_, session, packet| {
            sink.lock().unwrap().push((session, packet.read_i32()?));
            Ok(())
        })
        .unwrap();
    (server, addr, received)
}

/// Complete the handshake over a raw stream and return the assigned id
async fn raw_session(
    server: &mut Server,
    addr: SocketAddr,
    seen: &mut Vec<ServerEvent>,
) -> (TcpStream, i32) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let before = seen.len();
    pump_server_until(server, seen, |e| {
        e[before..].iter().any(|e| {
            matches!(
                e,
                ServerEvent::SessionConnected {
                    transport: Transport::Stream,
                    ..
                }
            )
        })
    })
    .await;

    let mut welcome = read_frame(&mut stream).await;
    welcome.read_i32().unwrap();
    let id = read_welcome(&mut welcome).unwrap().assigned_id;
    write_frame(&mut stream, identity_packet(id, "raw")).await;
    pump_server_until(server, seen, |e| {
        e.iter()
            .any(|e| matches!(e, ServerEvent::SessionEstablished { session, .. } if session.0 == id))
    })
    .await;
    (stream, id)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_first_datagram_binds_and_spoofed_source_is_rejected() {
    let (mut server, addr, received) = recording_server().await;
    let mut seen = Vec::new();
    let (_stream, id) = raw_session(&mut server, addr, &mut seen).await;

    let owner = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    owner.send_to(&tagged(id, None), addr).await.unwrap();
    pump_server_until(&mut server, &mut seen, bound).await;
    assert_eq!(
        server.context().session(SessionId(id)).unwrap().datagram_endpoint(),
        Some(owner.local_addr().unwrap())
    );

    owner.send_to(&tagged(id, Some(position(1))), addr).await.unwrap();
    intruder
        .send_to(&tagged(id, Some(position(666))), addr)
        .await
        .unwrap();
    owner.send_to(&tagged(id, Some(position(2))), addr).await.unwrap();

    pump_server_until(&mut server, &mut seen, |_| received.lock().unwrap().len() >= 2).await;
    // let a late intruder datagram land if it was going to
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.pump();

    let received = received.lock().unwrap().clone();
    assert_eq!(received, vec![(SessionId(id), 1), (SessionId(id), 2)]);
    assert!(server.metrics().datagrams_rejected >= 1);
    // the endpoint stays with the first sender
    assert_eq!(
        server.context().session(SessionId(id)).unwrap().datagram_endpoint(),
        Some(owner.local_addr().unwrap())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unusable_datagrams_are_dropped() {
    let (mut server, addr, received) = recording_server().await;
    let mut seen = Vec::new();
    let (_stream, id) = raw_session(&mut server, addr, &mut seen).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // shorter than a session tag
    socket.send_to(&[1, 2], addr).await.unwrap();
    // session id 0
    socket.send_to(&tagged(0, Some(position(5))), addr).await.unwrap();
    // slot that is not connected
    socket.send_to(&tagged(id + 1, Some(position(6))), addr).await.unwrap();
    // id outside the table
    socket.send_to(&tagged(1000, Some(position(7))), addr).await.unwrap();

    socket.send_to(&tagged(id, Some(position(8))), addr).await.unwrap();
    pump_server_until(&mut server, &mut seen, |_| !received.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.pump();

    // the first valid datagram both binds and is dispatched
    assert_eq!(received.lock().unwrap().as_slice(), &[(SessionId(id), 8)]);
    assert!(server.metrics().datagrams_rejected >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_udp_reaches_bound_endpoint_only() {
    let (mut server, addr, _) = recording_server().await;
    let mut seen = Vec::new();
    let (_stream, id) = raw_session(&mut server, addr, &mut seen).await;

    // unbound: silently dropped
    server
        .context()
        .send_udp(SessionId(id), position(1))
        .unwrap();
    assert_eq!(server.context().send_udp_to_all(&position(1)), 0);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&tagged(id, None), addr).await.unwrap();
    pump_server_until(&mut server, &mut seen, bound).await;

    server
        .context()
        .send_udp(SessionId(id), position(42))
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = tokio::time::timeout(TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for server datagram")
        .unwrap();
    assert_eq!(from, addr);

    let mut datagram = Packet::from_bytes(&buf[..n]);
    assert_eq!(datagram.read_i32().unwrap(), 8);
    assert_eq!(datagram.read_i32().unwrap(), POSITION);
    assert_eq!(datagram.read_i32().unwrap(), 42);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_udp_roundtrip() {
    let (mut server, addr) = started_server(server_config(4)).await;
    server
        .register_handler(POSITION, |ctx, session, packet| {
            let value = packet.read_i32()?;
            ctx.send_udp(session, position(value * 10))
        })
        .unwrap();

    let echoes = Arc::new(Mutex::new(Vec::new()));
    let sink = echoes.clone();
    let mut client = client_for(addr, "bob");
    client
        .register_handler(POSITION, move |_, packet| {
            sink.lock().unwrap().push(packet.read_i32()?);
            Ok(())
        })
        .unwrap();
    client.connect().unwrap();

    let (mut server_seen, mut client_seen) = (Vec::new(), Vec::new());
    pump_both_until(&mut server, &mut client, &mut server_seen, &mut client_seen, |s, _| {
        bound(s)
    })
    .await;

    // UDP is best-effort, so keep sending until an echo comes back
    let deadline = Instant::now() + TIMEOUT;
    while echoes.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "no UDP echo from the server");
        client.send_udp(position(4)).unwrap();
        server.pump();
        client.pump();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(echoes.lock().unwrap()[0], 40);
}

const BULK: i32 = 10;
/// Well past the TCP receive buffer default, well under any UDP limit
const BULK_SIZE: usize = 20_000;

fn bulk(body: &[u8]) -> Packet {
    let mut packet = Packet::with_id(BULK);
    packet.write_bytes(body);
    packet
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_datagram_is_dispatched_whole() {
    let (mut server, addr) = started_server(server_config(4)).await;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    server
        .register_handler(BULK, move |_, _, packet| {
            let body = packet.read_bytes(packet.unread_len())?;
            sink.lock().unwrap().push(body);
            Ok(())
        })
        .unwrap();

    let mut seen = Vec::new();
    let (_stream, id) = raw_session(&mut server, addr, &mut seen).await;

    let body: Vec<u8> = (0..BULK_SIZE).map(|i| (i % 251) as u8).collect();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&tagged(id, Some(bulk(&body))), addr)
        .await
        .unwrap();

    pump_server_until(&mut server, &mut seen, |_| !received.lock().unwrap().is_empty()).await;
    assert_eq!(received.lock().unwrap()[0], body);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_large_udp_roundtrip() {
    let (mut server, addr) = started_server(server_config(4)).await;
    server
        .register_handler(BULK, |ctx, session, packet| {
            let body = packet.read_bytes(packet.unread_len())?;
            ctx.send_udp(session, bulk(&body))
        })
        .unwrap();

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let sink = sizes.clone();
    let mut client = client_for(addr, "bob");
    client
        .register_handler(BULK, move |_, packet| {
            sink.lock().unwrap().push(packet.unread_len());
            Ok(())
        })
        .unwrap();
    client.connect().unwrap();

    let (mut server_seen, mut client_seen) = (Vec::new(), Vec::new());
    pump_both_until(&mut server, &mut client, &mut server_seen, &mut client_seen, |s, _| {
        bound(s)
    })
    .await;

    let body = vec![7u8; BULK_SIZE];
    let deadline = Instant::now() + TIMEOUT;
    while sizes.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "no large UDP echo from the server");
        client.send_udp(bulk(&body)).unwrap();
        server.pump();
        client.pump();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(sizes.lock().unwrap()[0], BULK_SIZE);
}
