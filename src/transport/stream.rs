//! # Stream Channel
//!
//! One TCP connection, split into a reader task and a writer task.
//!
//! The reader pulls frames through a `FramedRead` with [`PacketCodec`], whose
//! read buffer starts at the configured receive size; every complete frame
//! goes to the channel's [`InboundSink`] in arrival order. The writer drains an unbounded queue of
//! outgoing packets through a `FramedWrite` with [`PacketCodec`], so `send`
//! never waits on the socket.
//!
//! ## States
//! `Disconnected → Connecting → Connected → Disconnected`. The last transition
//! is one-way: a channel is never reopened, a new one is built instead.
//!
//! `disconnect` is synchronous. It cancels both tasks and drops the outgoing
//! queue; anything the tasks were about to report is discarded.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::MAX_PACKET_SIZE;
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{NetError, Result};
use crate::transport::{DisconnectReason, InboundSink, Transport};
use crate::utils::metrics::Metrics;

/// Lifecycle of a [`StreamChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Length-prefixed TCP channel
#[derive(Debug)]
pub struct StreamChannel {
    state: ChannelState,
    outbound: Option<mpsc::UnboundedSender<Packet>>,
    cancel: Option<CancellationToken>,
    peer_addr: Option<SocketAddr>,
}

impl Default for StreamChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamChannel {
    /// A channel with no socket behind it
    pub fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            outbound: None,
            cancel: None,
            peer_addr: None,
        }
    }

    /// Wrap an accepted connection and start its I/O tasks on `runtime`
    pub fn attach(
        stream: TcpStream,
        sink: Arc<dyn InboundSink>,
        buffer_size: usize,
        runtime: &Handle,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        runtime.spawn(run_connection(
            stream,
            rx,
            cancel.clone(),
            sink,
            buffer_size,
            metrics,
        ));

        Ok(Self {
            state: ChannelState::Connected,
            outbound: Some(tx),
            cancel: Some(cancel),
            peer_addr: Some(peer),
        })
    }

    /// Start an outbound connection to `address:port`.
    ///
    /// Returns at once in the `Connecting` state. The sink's `on_open` fires
    /// when the connection is up, at which point the owner calls
    /// [`mark_connected`](Self::mark_connected); a failed attempt reports
    /// through `on_closed` instead.
    pub fn connect(
        address: String,
        port: u16,
        sink: Arc<dyn InboundSink>,
        buffer_size: usize,
        runtime: &Handle,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        runtime.spawn(async move {
            let connected = tokio::select! {
                _ = token.cancelled() => return,
                result = TcpStream::connect((address.as_str(), port)) => result,
            };

            let stream = match connected.and_then(|s| s.set_nodelay(true).map(|_| s)) {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(address = %address, port, error = %e, "Connection attempt failed");
                    sink.on_closed(DisconnectReason::Io(e.to_string()));
                    return;
                }
            };

            match stream.peer_addr() {
                Ok(peer) => sink.on_open(peer),
                Err(e) => {
                    sink.on_closed(DisconnectReason::Io(e.to_string()));
                    return;
                }
            }

            run_connection(stream, rx, token, sink, buffer_size, metrics).await;
        });

        Self {
            state: ChannelState::Connecting,
            outbound: Some(tx),
            cancel: Some(cancel),
            peer_addr: None,
        }
    }

    /// Record that a pending outbound connection reached `peer`
    pub fn mark_connected(&mut self, peer: SocketAddr) {
        if self.state == ChannelState::Connecting {
            self.state = ChannelState::Connected;
            self.peer_addr = Some(peer);
        }
    }

    /// Queue `packet` for transmission; the length prefix is added on the way out.
    ///
    /// A packet larger than `MAX_PACKET_SIZE` is refused here and the channel
    /// stays up.
    pub fn send(&self, packet: Packet) -> Result<()> {
        if self.state != ChannelState::Connected {
            return Err(NetError::NotConnected);
        }
        if packet.len() > MAX_PACKET_SIZE {
            return Err(NetError::OversizedPacket(packet.len()));
        }
        match &self.outbound {
            Some(tx) => tx.send(packet).map_err(|_| NetError::NotConnected),
            None => Err(NetError::NotConnected),
        }
    }

    /// Close the connection now; a no-op on a channel that is already closed
    pub fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.outbound = None;
        self.state = ChannelState::Disconnected;
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[instrument(skip_all, fields(peer = ?stream.peer_addr().ok()))]
async fn run_connection(
    stream: TcpStream,
    outbound: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
    sink: Arc<dyn InboundSink>,
    buffer_size: usize,
    metrics: Arc<Metrics>,
) {
    let (read_half, write_half) = stream.into_split();

    let reason = tokio::select! {
        _ = cancel.cancelled() => None,
        reason = read_loop(read_half, sink.as_ref(), buffer_size, &metrics) => Some(reason),
        result = write_loop(write_half, outbound, &metrics) => match result {
            // the sender was dropped by a local disconnect
            Ok(()) => None,
            Err(e) => Some(DisconnectReason::Io(e.to_string())),
        },
    };

    if let Some(reason) = reason {
        if !cancel.is_cancelled() {
            debug!(reason = %reason, "Stream closed");
            cancel.cancel();
            sink.on_closed(reason);
        }
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    sink: &dyn InboundSink,
    buffer_size: usize,
    metrics: &Metrics,
) -> DisconnectReason {
    let mut frames = FramedRead::with_capacity(read_half, PacketCodec, buffer_size);

    loop {
        match frames.next().await {
            Some(Ok(packet)) => {
                metrics.message_received(packet.len() as u64);
                sink.on_packet(Transport::Stream, packet);
            }
            None | Some(Err(NetError::ConnectionClosed)) => return DisconnectReason::RemoteClosed,
            Some(Err(NetError::Io(e))) => return DisconnectReason::Io(e.to_string()),
            Some(Err(e)) => {
                warn!(error = %e, "Dropping stream with unframeable data");
                return DisconnectReason::Malformed(e.to_string());
            }
        }
    }
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    metrics: &Metrics,
) -> Result<()> {
    let mut framed = FramedWrite::new(write_half, PacketCodec);
    while let Some(packet) = outbound.recv().await {
        let size = packet.len() as u64;
        framed.send(packet).await?;
        metrics.message_sent(size);
    }
    Ok(())
}
