//! Shared helpers for the loopback integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use netplay_engine::config::{ClientConfig, ServerConfig};
use netplay_engine::core::packet::Packet;
use netplay_engine::service::client::{ClientEvent, PeerConnection};
use netplay_engine::service::server::{Server, ServerEvent};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn server_config(max_sessions: usize) -> ServerConfig {
    ServerConfig {
        port: 0,
        max_sessions,
        ..ServerConfig::default()
    }
}

pub async fn started_server(config: ServerConfig) -> (Server, SocketAddr) {
    let mut server = Server::new(config).unwrap();
    let addr = server.start().await.unwrap();
    (server, addr)
}

pub fn client_for(addr: SocketAddr, name: &str) -> PeerConnection {
    PeerConnection::new(ClientConfig {
        address: addr.ip().to_string(),
        port: addr.port(),
        ..ClientConfig::new(name)
    })
    .unwrap()
}

/// Pump the server until `done` holds for everything seen so far
pub async fn pump_server_until<F>(server: &mut Server, seen: &mut Vec<ServerEvent>, mut done: F)
where
    F: FnMut(&[ServerEvent]) -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    loop {
        seen.extend(server.pump());
        if done(seen.as_slice()) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting on server; events so far: {seen:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Pump a server and one client together until `done` holds
pub async fn pump_both_until<F>(
    server: &mut Server,
    client: &mut PeerConnection,
    server_seen: &mut Vec<ServerEvent>,
    client_seen: &mut Vec<ClientEvent>,
    mut done: F,
) where
    F: FnMut(&[ServerEvent], &[ClientEvent]) -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    loop {
        server_seen.extend(server.pump());
        client_seen.extend(client.pump());
        if done(server_seen.as_slice(), client_seen.as_slice()) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out; server events: {server_seen:?}, client events: {client_seen:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Read one length-prefixed frame from a raw stream
pub async fn read_frame(stream: &mut TcpStream) -> Packet {
    let mut prefix = [0u8; 4];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut prefix))
        .await
        .expect("timed out reading frame length")
        .unwrap();
    let mut body = vec![0u8; i32::from_le_bytes(prefix) as usize];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut body))
        .await
        .expect("timed out reading frame body")
        .unwrap();
    Packet::from(body)
}

pub async fn write_frame(stream: &mut TcpStream, mut packet: Packet) {
    packet.write_length();
    stream.write_all(packet.as_bytes()).await.unwrap();
}

/// Wait for the peer to close a raw stream
pub async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
            .await
            .expect("timed out waiting for the server to close the stream")
            .unwrap_or(0);
        if n == 0 {
            return;
        }
    }
}
