//! # Peer Connection
//!
//! Client side of the engine: one stream channel and one datagram channel to a
//! single server, plus the session id the server assigned.
//!
//! Like the server, the client never runs handlers on I/O threads. Socket
//! tasks queue their results and [`PeerConnection::pump`] runs them on the
//! host's thread, returning the lifecycle events raised along the way.
//!
//! ## States
//! ```text
//! Disconnected ─connect─▶ Connecting ─tcp up─▶ Connected ─welcome─▶ AwaitingIdentity
//!      ▲                      │                    │                      │
//!      └──────── failure / disconnect (any state) ─┴──────────────────────┘
//! ```
//! Each call to `connect` starts a new attempt with its own generation; work
//! still queued from an earlier attempt is discarded when pumped.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, HANDSHAKE_MESSAGE_ID};
use crate::core::packet::Packet;
use crate::error::{constants, NetError, Result};
use crate::protocol::dispatcher::HandlerRegistry;
use crate::protocol::handshake;
use crate::transport::datagram::DatagramChannel;
use crate::transport::stream::StreamChannel;
use crate::transport::{DisconnectReason, InboundSink, Transport};
use crate::utils::main_thread::MainThreadQueue;
use crate::utils::metrics::{Metrics, MetricsSnapshot};

/// Handler for one client-side message id
pub type ClientHandler = dyn Fn(&mut PeerContext, &mut Packet) -> Result<()> + Send + Sync;

/// Where the client is in connecting to its server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    /// Welcome answered; the server has our name and id
    AwaitingIdentity,
}

/// Lifecycle notifications returned by [`PeerConnection::pump`]
#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    ConnectionFailed {
        error: NetError,
    },
    Welcome {
        message: String,
        assigned_id: i32,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    HandlerFailed {
        message_id: i32,
        error: NetError,
    },
}

/// Everything a client handler can see and change
pub struct PeerContext {
    config: ClientConfig,
    state: PeerState,
    assigned_id: i32,
    generation: u64,
    stream: StreamChannel,
    datagram: Option<DatagramChannel>,
    server_addr: Option<SocketAddr>,
    handlers: HandlerRegistry<ClientHandler>,
    events: Vec<ClientEvent>,
    queue: MainThreadQueue<PeerContext>,
    runtime: Handle,
    metrics: Arc<Metrics>,
}

impl PeerContext {
    /// Id assigned by the server, 0 until the welcome arrives
    pub fn assigned_id(&self) -> i32 {
        self.assigned_id
    }

    pub fn display_name(&self) -> &str {
        &self.config.display_name
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            PeerState::Connected | PeerState::AwaitingIdentity
        )
    }

    /// Resolved server address once the stream is up
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    pub fn send_tcp(&self, packet: Packet) -> Result<()> {
        self.stream.send(packet)
    }

    /// Send over UDP; fails with `NotConnected` before the welcome opens the channel
    pub fn send_udp(&self, packet: Packet) -> Result<()> {
        match &self.datagram {
            Some(datagram) if self.is_connected() => datagram.send_data(packet),
            _ => Err(NetError::NotConnected),
        }
    }

    /// Close both channels now
    pub fn disconnect(&mut self) {
        self.close(DisconnectReason::Local);
    }

    pub(crate) fn assign_id(&mut self, id: i32) {
        self.assigned_id = id;
    }

    pub(crate) fn open_datagram(&mut self) -> Result<()> {
        let server = self.server_addr.ok_or(NetError::NotConnected)?;
        let sink = Arc::new(PeerSink {
            queue: self.queue.clone(),
            generation: self.generation,
        });
        let channel = DatagramChannel::open(
            server,
            self.assigned_id,
            sink,
            &self.runtime,
            self.metrics.clone(),
        )?;
        self.datagram = Some(channel);
        Ok(())
    }

    pub(crate) fn mark_awaiting_identity(&mut self) {
        if self.state == PeerState::Connected {
            self.state = PeerState::AwaitingIdentity;
        }
    }

    pub(crate) fn emit(&mut self, event: ClientEvent) {
        self.events.push(event);
    }

    fn begin_attempt(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.assigned_id = 0;
        self.server_addr = None;

        let sink = Arc::new(PeerSink {
            queue: self.queue.clone(),
            generation: self.generation,
        });
        self.stream = StreamChannel::connect(
            self.config.address.clone(),
            self.config.port,
            sink,
            self.config.receive_buffer_size,
            &self.runtime,
            self.metrics.clone(),
        );
        self.state = PeerState::Connecting;
    }

    fn close(&mut self, reason: DisconnectReason) {
        let previous = self.state;
        self.stream.disconnect();
        if let Some(mut datagram) = self.datagram.take() {
            datagram.disconnect();
        }
        self.state = PeerState::Disconnected;
        self.generation = self.generation.wrapping_add(1);

        match previous {
            PeerState::Disconnected => {}
            PeerState::Connecting if reason != DisconnectReason::Local => {
                warn!(address = %self.config.address, port = self.config.port, reason = %reason, "Connection failed");
                self.events.push(ClientEvent::ConnectionFailed {
                    error: NetError::ConnectionFailed(reason.to_string()),
                });
            }
            PeerState::Connecting => {
                self.events.push(ClientEvent::Disconnected { reason });
            }
            PeerState::Connected | PeerState::AwaitingIdentity => {
                self.metrics.connection_closed();
                info!(reason = %reason, "Disconnected from server");
                self.events.push(ClientEvent::Disconnected { reason });
            }
        }
    }

    fn on_open(&mut self, generation: u64, peer: SocketAddr) {
        if generation != self.generation || self.state != PeerState::Connecting {
            return;
        }
        self.stream.mark_connected(peer);
        self.server_addr = Some(peer);
        self.state = PeerState::Connected;
        self.metrics.connection_established();
        info!(server = %peer, "Connected to server");
        self.events.push(ClientEvent::Connected);
    }

    fn on_closed(&mut self, generation: u64, reason: DisconnectReason) {
        if generation == self.generation {
            self.close(reason);
        }
    }

    fn dispatch(&mut self, generation: u64, transport: Transport, mut packet: Packet) {
        if generation != self.generation {
            debug!("Discarding packet from a previous connection");
            return;
        }

        let message_id = match packet.read_i32() {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Dropping packet without a message id");
                return;
            }
        };
        debug!(message_id, transport = %transport, "Dispatching packet");

        let handler = match self.handlers.lookup(message_id) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(error = %e, "Dropping packet");
                self.metrics.unknown_message();
                return;
            }
        };

        if let Err(error) = handler(self, &mut packet) {
            warn!(message_id, error = %error, "Handler failed");
            self.events.push(ClientEvent::HandlerFailed { message_id, error });
        }
    }
}

/// Forwards one connection attempt's channel activity onto the client's queue
struct PeerSink {
    queue: MainThreadQueue<PeerContext>,
    generation: u64,
}

impl InboundSink for PeerSink {
    fn on_packet(&self, transport: Transport, packet: Packet) {
        let generation = self.generation;
        self.queue
            .execute_on_main_thread(move |ctx| ctx.dispatch(generation, transport, packet));
    }

    fn on_closed(&self, reason: DisconnectReason) {
        let generation = self.generation;
        self.queue
            .execute_on_main_thread(move |ctx| ctx.on_closed(generation, reason));
    }

    fn on_open(&self, peer: SocketAddr) {
        let generation = self.generation;
        self.queue
            .execute_on_main_thread(move |ctx| ctx.on_open(generation, peer));
    }
}

/// Client connection to a single server
pub struct PeerConnection {
    context: PeerContext,
    queue: MainThreadQueue<PeerContext>,
}

impl PeerConnection {
    /// Build a disconnected client whose I/O runs on the current tokio runtime
    pub fn new(config: ClientConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| NetError::Validation(constants::ERR_NO_RUNTIME.into()))?;
        Self::with_runtime(config, runtime)
    }

    /// Build a disconnected client whose I/O runs on `runtime`.
    ///
    /// Use this when the host loop runs on a thread outside the runtime.
    pub fn with_runtime(config: ClientConfig, runtime: Handle) -> Result<Self> {
        let queue = MainThreadQueue::new();
        let mut handlers = HandlerRegistry::<ClientHandler>::new();
        handlers.register(HANDSHAKE_MESSAGE_ID, Arc::new(handshake::accept_welcome))?;

        Ok(Self {
            context: PeerContext {
                config,
                state: PeerState::Disconnected,
                assigned_id: 0,
                generation: 0,
                stream: StreamChannel::new(),
                datagram: None,
                server_addr: None,
                handlers,
                events: Vec::new(),
                queue: queue.clone(),
                runtime,
                metrics: Arc::new(Metrics::new()),
            },
            queue,
        })
    }

    /// Register the handler for message id `id`; id 0 belongs to the handshake
    pub fn register_handler<F>(&mut self, id: i32, handler: F) -> Result<()>
    where
        F: Fn(&mut PeerContext, &mut Packet) -> Result<()> + Send + Sync + 'static,
    {
        self.context.handlers.register(id, Arc::new(handler))
    }

    /// Start connecting to the configured server.
    ///
    /// The configuration is validated first and nothing touches the network if
    /// it is rejected. The outcome arrives later as `Connected` or
    /// `ConnectionFailed` from [`pump`](Self::pump).
    pub fn connect(&mut self) -> Result<()> {
        let problems = self.context.config.validate();
        if !problems.is_empty() {
            return Err(NetError::Validation(problems.join("; ")));
        }
        if self.context.state != PeerState::Disconnected {
            return Err(NetError::Validation(constants::ERR_ALREADY_CONNECTING.into()));
        }

        info!(
            address = %self.context.config.address,
            port = self.context.config.port,
            display_name = %self.context.config.display_name,
            "Connecting to server"
        );
        self.context.begin_attempt();
        Ok(())
    }

    /// Drop the current connection, if any, and connect again with the same
    /// identity. The server assigns a fresh id.
    pub fn reconnect(&mut self) -> Result<()> {
        self.context.disconnect();
        self.connect()
    }

    pub fn disconnect(&mut self) {
        self.context.disconnect();
    }

    pub fn send_tcp(&self, packet: Packet) -> Result<()> {
        self.context.send_tcp(packet)
    }

    pub fn send_udp(&self, packet: Packet) -> Result<()> {
        self.context.send_udp(packet)
    }

    /// Run all queued inbound work and return the events it raised
    pub fn pump(&mut self) -> Vec<ClientEvent> {
        self.queue.pump(&mut self.context);
        std::mem::take(&mut self.context.events)
    }

    pub fn assigned_id(&self) -> i32 {
        self.context.assigned_id
    }

    pub fn state(&self) -> PeerState {
        self.context.state
    }

    pub fn is_connected(&self) -> bool {
        self.context.is_connected()
    }

    pub fn context(&self) -> &PeerContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut PeerContext {
        &mut self.context
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.context.metrics.snapshot()
    }
}
