//! # Datagram Channel
//!
//! Best-effort UDP, one length-prefixed packet per datagram.
//!
//! ## Server role
//! The server multiplexes every session over one shared socket. Each session's
//! channel starts unbound; the first datagram carrying that session's id binds
//! it to the datagram's source endpoint, and from then on only datagrams from
//! that exact host and port are accepted. Sending on an unbound channel is a
//! silent no-op.
//!
//! ## Client role
//! The client binds an ephemeral local port and prefixes every outgoing
//! datagram with its own session id so the server can demultiplex. Inbound
//! datagrams from anyone other than the server are ignored.
//!
//! ## Wire Format
//! ```text
//! client → server:  [session id: i32] [len: i32] [message id: i32] [payload...]
//! server → client:                    [len: i32] [message id: i32] [payload...]
//! ```
//! A `len` of zero (or no frame at all) carries no packet; the client's
//! binding datagram is exactly that.
//!
//! Both receive loops read into a `MAX_DATAGRAM_SIZE` buffer so no datagram
//! is ever truncated.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{LENGTH_PREFIX_SIZE, MAX_DATAGRAM_SIZE, MAX_PACKET_SIZE};
use crate::core::packet::Packet;
use crate::error::{constants, NetError, Result};
use crate::transport::{DisconnectReason, InboundSink, Transport};
use crate::utils::metrics::Metrics;

#[derive(Debug)]
enum Role {
    Server,
    Client {
        session_id: i32,
        cancel: CancellationToken,
    },
}

/// One logical UDP channel: a session's slice of the server socket, or a
/// client's own socket.
///
/// Sends go through a non-blocking std handle to the socket so they complete
/// synchronously on the caller's thread; receiving happens on a tokio task.
#[derive(Debug)]
pub struct DatagramChannel {
    socket: Arc<StdUdpSocket>,
    remote: Option<SocketAddr>,
    role: Role,
    metrics: Arc<Metrics>,
}

/// A datagram received by the server, with its session tag split off
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedDatagram {
    pub session_id: i32,
    pub packet: Option<Packet>,
}

impl DatagramChannel {
    /// Unbound server-side channel over the shared server socket
    pub fn for_session(socket: Arc<StdUdpSocket>, metrics: Arc<Metrics>) -> Self {
        Self {
            socket,
            remote: None,
            role: Role::Server,
            metrics,
        }
    }

    /// Open the client side: bind an ephemeral port, start receiving, and send
    /// the empty datagram that lets the server bind this endpoint.
    pub fn open(
        server: SocketAddr,
        session_id: i32,
        sink: Arc<dyn InboundSink>,
        runtime: &Handle,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let std_socket = StdUdpSocket::bind(local)?;
        std_socket.set_nonblocking(true)?;
        let sender = Arc::new(std_socket.try_clone()?);
        let receiver = {
            let _guard = runtime.enter();
            UdpSocket::from_std(std_socket)?
        };

        let cancel = CancellationToken::new();
        runtime.spawn(receive_from_server(
            receiver,
            server,
            cancel.clone(),
            sink,
            metrics.clone(),
        ));

        let channel = Self {
            socket: sender,
            remote: Some(server),
            role: Role::Client { session_id, cancel },
            metrics,
        };
        channel.send_data(Packet::new())?;
        debug!(server = %server, session_id, "Datagram channel opened");
        Ok(channel)
    }

    /// Bind a server-side channel to the endpoint of its first datagram
    pub fn bind(&mut self, endpoint: SocketAddr) {
        self.remote = Some(endpoint);
        self.metrics.datagram_bound();
    }

    pub fn is_bound(&self) -> bool {
        self.remote.is_some()
    }

    /// Endpoint this channel talks to, once known
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Whether a datagram from `from` belongs to this channel
    pub fn accepts(&self, from: SocketAddr) -> bool {
        self.remote == Some(from)
    }

    /// Send `packet` as one datagram.
    ///
    /// A server-side channel that has not been bound yet drops the packet and
    /// returns `Ok`. A full socket buffer drops the datagram as well; UDP
    /// delivery is best-effort either way.
    pub fn send_data(&self, mut packet: Packet) -> Result<()> {
        let Some(remote) = self.remote else {
            return Ok(());
        };

        packet.write_length();
        if let Role::Client { session_id, .. } = self.role {
            packet.insert_i32(session_id);
        }

        match self.socket.send_to(packet.as_bytes(), remote) {
            Ok(_) => {
                self.metrics.message_sent(packet.len() as u64);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(remote = %remote, "Socket busy, datagram dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forget the bound endpoint; a client channel also stops receiving
    pub fn disconnect(&mut self) {
        if let Role::Client { cancel, .. } = &self.role {
            cancel.cancel();
        }
        self.remote = None;
    }
}

impl Drop for DatagramChannel {
    fn drop(&mut self) {
        if let Role::Client { cancel, .. } = &self.role {
            cancel.cancel();
        }
    }
}

/// Split the length-prefixed frame that follows the current cursor.
///
/// `Ok(None)` means the datagram carries no packet.
pub fn decode_frame(datagram: &mut Packet) -> Result<Option<Packet>> {
    if datagram.unread_len() == 0 {
        return Ok(None);
    }

    let length = datagram.read_i32()?;
    if length < 0 {
        return Err(NetError::MalformedPacket(
            constants::ERR_NEGATIVE_FRAME_LENGTH.into(),
        ));
    }
    if length == 0 {
        return Ok(None);
    }

    let length = length as usize;
    if length > MAX_PACKET_SIZE {
        return Err(NetError::OversizedPacket(length));
    }
    Ok(Some(Packet::from(datagram.read_bytes(length)?)))
}

/// Decode a client-to-server datagram: session tag, then an optional frame
pub fn decode_tagged(bytes: &[u8]) -> Result<TaggedDatagram> {
    let mut datagram = Packet::from_bytes(bytes);
    let session_id = datagram.read_i32()?;
    let packet = decode_frame(&mut datagram)?;
    Ok(TaggedDatagram { session_id, packet })
}

/// Receive loop for the shared server socket.
///
/// Datagrams shorter than a session tag, or tagged with a non-positive id, are
/// dropped here; everything else goes to `deliver` for the binding check.
pub(crate) async fn receive_tagged<F>(
    socket: UdpSocket,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    deliver: F,
) where
    F: Fn(SocketAddr, TaggedDatagram) + Send + 'static,
{
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port-unreachable from a vanished client surfaces here
                    debug!(error = %e, "Datagram receive failed");
                    continue;
                }
            },
        };

        if n < LENGTH_PREFIX_SIZE {
            metrics.datagram_rejected();
            debug!(from = %from, bytes = n, "Dropping short datagram");
            continue;
        }

        match decode_tagged(&buffer[..n]) {
            Ok(tagged) if tagged.session_id > 0 => {
                if let Some(packet) = &tagged.packet {
                    metrics.message_received(packet.len() as u64);
                }
                deliver(from, tagged);
            }
            Ok(_) => {
                metrics.datagram_rejected();
                debug!(from = %from, "Dropping datagram without a session id");
            }
            Err(e) => {
                metrics.datagram_rejected();
                warn!(from = %from, error = %e, "Dropping malformed datagram");
            }
        }
    }
}

async fn receive_from_server(
    socket: UdpSocket,
    server: SocketAddr,
    cancel: CancellationToken,
    sink: Arc<dyn InboundSink>,
    metrics: Arc<Metrics>,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "Datagram receive failed");
                    continue;
                }
            },
        };

        if from != server {
            metrics.datagram_rejected();
            continue;
        }

        if n < LENGTH_PREFIX_SIZE {
            warn!(bytes = n, "Short datagram from server, closing channel");
            sink.on_closed(DisconnectReason::Malformed(
                constants::ERR_SHORT_DATAGRAM.to_string(),
            ));
            return;
        }

        let mut datagram = Packet::from_bytes(&buffer[..n]);
        match decode_frame(&mut datagram) {
            Ok(Some(packet)) => {
                metrics.message_received(packet.len() as u64);
                sink.on_packet(Transport::Datagram, packet);
            }
            Ok(None) => {}
            Err(e) => {
                metrics.datagram_rejected();
                warn!(error = %e, "Dropping malformed datagram");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(session_id: i32, message_id: Option<i32>) -> Vec<u8> {
        let mut packet = match message_id {
            Some(id) => Packet::with_id(id),
            None => Packet::new(),
        };
        packet.write_length();
        packet.insert_i32(session_id);
        packet.into_bytes()
    }

    #[test]
    fn test_binding_datagram_carries_no_packet() {
        let decoded = decode_tagged(&tagged(3, None)).unwrap();
        assert_eq!(decoded.session_id, 3);
        assert!(decoded.packet.is_none());

        // a bare tag binds too
        let decoded = decode_tagged(&7i32.to_le_bytes()).unwrap();
        assert_eq!(decoded.session_id, 7);
        assert!(decoded.packet.is_none());
    }

    #[test]
    fn test_tagged_datagram_with_payload() {
        let decoded = decode_tagged(&tagged(2, Some(11))).unwrap();
        assert_eq!(decoded.session_id, 2);
        let mut packet = decoded.packet.unwrap();
        assert_eq!(packet.read_i32().unwrap(), 11);
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut bytes = tagged(2, Some(11));
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            decode_tagged(&bytes),
            Err(NetError::BufferUnderrun { .. })
        ));
    }

    #[test]
    fn test_negative_frame_length_is_malformed() {
        let mut bytes = 1i32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&(-4i32).to_le_bytes());
        match decode_tagged(&bytes) {
            Err(NetError::MalformedPacket(message)) => {
                assert_eq!(message, constants::ERR_NEGATIVE_FRAME_LENGTH);
            }
            other => panic!("expected MalformedPacket, got {other:?}"),
        }
    }

    #[test]
    fn test_server_channel_binding() {
        let socket = Arc::new(StdUdpSocket::bind("127.0.0.1:0").unwrap());
        let mut channel = DatagramChannel::for_session(socket, Arc::new(Metrics::new()));
        let first: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        assert!(!channel.is_bound());
        assert!(!channel.accepts(first));
        // unbound send is a no-op
        channel.send_data(Packet::with_id(1)).unwrap();

        channel.bind(first);
        assert!(channel.accepts(first));
        assert!(!channel.accepts(other));
        assert_eq!(channel.endpoint(), Some(first));

        channel.disconnect();
        assert!(!channel.is_bound());
    }

    #[test]
    fn test_server_send_omits_session_tag() {
        let server = Arc::new(StdUdpSocket::bind("127.0.0.1:0").unwrap());
        let peer = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();

        let mut channel = DatagramChannel::for_session(server, Arc::new(Metrics::new()));
        channel.bind(peer.local_addr().unwrap());
        let mut packet = Packet::with_id(6);
        packet.write_bool(true);
        channel.send_data(packet).unwrap();

        let mut buf = [0u8; 64];
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(n, 9);
        assert_eq!(&buf[..4], &5i32.to_le_bytes());
        assert_eq!(&buf[4..8], &6i32.to_le_bytes());
        assert_eq!(buf[8], 1);
    }
}
