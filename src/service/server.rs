//! # Server
//!
//! Accepts TCP connections, assigns each one a session slot, and routes
//! inbound packets from both transports to registered handlers.
//!
//! ## Threading
//! The accept loop, every stream's I/O tasks, and the shared UDP receive loop
//! run on tokio. None of them touch the session table: each pushes a closure
//! onto the server's [`MainThreadQueue`], and [`Server::pump`] runs those
//! closures against the [`ServerContext`] on the host's thread. Allocation on
//! accept goes through the same queue, so the table never needs a lock.
//!
//! ## Usage
//! ```rust,no_run
//! use netplay_engine::config::ServerConfig;
//! use netplay_engine::service::server::{Server, ServerEvent};
//!
//! # async fn run() -> netplay_engine::error::Result<()> {
//! let mut server = Server::new(ServerConfig::default())?;
//! server.register_handler(1, |ctx, session, packet| {
//!     let text = packet.read_string()?;
//!     let mut reply = netplay_engine::core::packet::Packet::with_id(1);
//!     reply.write_str(&text);
//!     ctx.send_tcp_to_all_except(session, &reply);
//!     Ok(())
//! })?;
//! server.start().await?;
//!
//! loop {
//!     for event in server.pump() {
//!         if let ServerEvent::SessionEstablished { session, display_name } = event {
//!             println!("{display_name} joined as {session}");
//!         }
//!     }
//!     tokio::time::sleep(std::time::Duration::from_millis(16)).await;
//! }
//! # }
//! ```

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ServerConfig, HANDSHAKE_MESSAGE_ID};
use crate::core::packet::Packet;
use crate::error::{constants, NetError, Result};
use crate::protocol::dispatcher::HandlerRegistry;
use crate::protocol::handshake;
use crate::service::session::{Session, SessionId, SessionTable};
use crate::transport::datagram::{self, DatagramChannel, TaggedDatagram};
use crate::transport::stream::StreamChannel;
use crate::transport::{DisconnectReason, InboundSink, Transport};
use crate::utils::main_thread::MainThreadQueue;
use crate::utils::metrics::{Metrics, MetricsSnapshot};

/// Handler for one server-side message id
pub type ServerHandler =
    dyn Fn(&mut ServerContext, SessionId, &mut Packet) -> Result<()> + Send + Sync;

/// Lifecycle notifications returned by [`Server::pump`]
#[derive(Debug)]
pub enum ServerEvent {
    Started {
        local_addr: SocketAddr,
    },
    Stopped,
    /// Fired once when the stream is accepted and once when UDP binds
    SessionConnected {
        session: SessionId,
        transport: Transport,
    },
    SessionEstablished {
        session: SessionId,
        display_name: String,
    },
    SessionDisconnected {
        session: SessionId,
        reason: DisconnectReason,
    },
    /// A connection was refused, currently only for `ServerFull`
    Rejected {
        peer: SocketAddr,
        error: NetError,
    },
    /// The session has already been disconnected when this is raised
    ProtocolViolation {
        session: SessionId,
        error: NetError,
    },
    HandlerFailed {
        session: SessionId,
        message_id: i32,
        error: NetError,
    },
}

/// Everything a server handler can see and change.
///
/// Handlers get `&mut ServerContext`; the host reaches the same value through
/// [`Server::context`] between pumps.
pub struct ServerContext {
    config: ServerConfig,
    sessions: SessionTable,
    handlers: HandlerRegistry<ServerHandler>,
    events: Vec<ServerEvent>,
    queue: MainThreadQueue<ServerContext>,
    runtime: Option<Handle>,
    udp: Option<Arc<StdUdpSocket>>,
    metrics: Arc<Metrics>,
}

impl ServerContext {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Every occupied session slot
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.live()
    }

    pub fn send_tcp(&self, session: SessionId, packet: Packet) -> Result<()> {
        self.live_session(session)?.send_tcp(packet)
    }

    /// Send over UDP; a no-op until the session's datagram channel is bound
    pub fn send_udp(&self, session: SessionId, packet: Packet) -> Result<()> {
        self.live_session(session)?.send_udp(packet)
    }

    /// Send to every connected session, returning how many were queued
    pub fn send_tcp_to_all(&self, packet: &Packet) -> usize {
        self.broadcast(None, packet, Transport::Stream)
    }

    pub fn send_tcp_to_all_except(&self, except: SessionId, packet: &Packet) -> usize {
        self.broadcast(Some(except), packet, Transport::Stream)
    }

    /// Send to every session with a bound datagram channel
    pub fn send_udp_to_all(&self, packet: &Packet) -> usize {
        self.broadcast(None, packet, Transport::Datagram)
    }

    pub fn send_udp_to_all_except(&self, except: SessionId, packet: &Packet) -> usize {
        self.broadcast(Some(except), packet, Transport::Datagram)
    }

    /// Disconnect `session` and free its slot. Returns `false` if it was not live.
    pub fn disconnect(&mut self, session: SessionId) -> bool {
        self.disconnect_with(session, DisconnectReason::Local)
    }

    pub(crate) fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub(crate) fn emit(&mut self, event: ServerEvent) {
        self.events.push(event);
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn live_session(&self, id: SessionId) -> Result<&Session> {
        self.sessions
            .get(id)
            .filter(|s| s.is_connected())
            .ok_or(NetError::NotConnected)
    }

    fn broadcast(&self, except: Option<SessionId>, packet: &Packet, transport: Transport) -> usize {
        let mut sent = 0;
        for session in self.sessions.live() {
            if Some(session.id()) == except || !session.is_connected() {
                continue;
            }
            let result = match transport {
                Transport::Stream => session.send_tcp(packet.clone()),
                Transport::Datagram if session.datagram_endpoint().is_some() => {
                    session.send_udp(packet.clone())
                }
                Transport::Datagram => continue,
            };
            match result {
                Ok(()) => sent += 1,
                Err(e) => debug!(session = %session.id(), error = %e, "Broadcast send failed"),
            }
        }
        sent
    }

    fn disconnect_with(&mut self, session: SessionId, reason: DisconnectReason) -> bool {
        if !self.sessions.release(session) {
            return false;
        }
        self.metrics.connection_closed();
        info!(session = %session, reason = %reason, "Session disconnected");
        self.events
            .push(ServerEvent::SessionDisconnected { session, reason });
        true
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let (Some(runtime), Some(udp)) = (self.runtime.clone(), self.udp.clone()) else {
            // accepted just before stop(); dropping the stream closes it
            return;
        };

        let session = match self.sessions.allocate(peer) {
            Ok(session) => session,
            Err(error) => {
                warn!(peer = %peer, error = %error, "Rejecting connection");
                self.metrics.connection_rejected();
                self.events.push(ServerEvent::Rejected { peer, error });
                return;
            }
        };

        let generation = self
            .sessions
            .get(session)
            .map(Session::generation)
            .unwrap_or_default();
        let sink = Arc::new(SessionSink {
            queue: self.queue.clone(),
            session,
            generation,
        });

        let channel = match StreamChannel::attach(
            stream,
            sink,
            self.config.receive_buffer_size,
            &runtime,
            self.metrics.clone(),
        ) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to set up accepted stream");
                self.sessions.release(session);
                return;
            }
        };

        let datagram = DatagramChannel::for_session(udp, self.metrics.clone());
        let welcome = handshake::welcome_packet(&self.config.welcome_message, session.0);
        let Some(record) = self.sessions.get_mut(session) else {
            return;
        };
        record.attach(channel, datagram);
        let sent = record.send_tcp(welcome);
        record.mark_awaiting_identity();

        self.metrics.connection_established();
        info!(session = %session, peer = %peer, "Session connected");
        self.events.push(ServerEvent::SessionConnected {
            session,
            transport: Transport::Stream,
        });

        if let Err(e) = sent {
            warn!(session = %session, error = %e, "Failed to send welcome");
            self.disconnect_with(session, DisconnectReason::Io(e.to_string()));
        }
    }

    fn on_datagram(&mut self, from: SocketAddr, tagged: TaggedDatagram) {
        let session = SessionId(tagged.session_id);
        if !self.sessions.get(session).is_some_and(Session::is_connected) {
            debug!(session = %session, from = %from, "Dropping datagram for unknown session");
            return;
        }

        let mut newly_bound = false;
        let Some(record) = self.sessions.get_mut(session) else {
            return;
        };
        let generation = record.generation();
        let Some(channel) = record.datagram_mut() else {
            return;
        };

        if !channel.is_bound() {
            channel.bind(from);
            newly_bound = true;
        } else if !channel.accepts(from) {
            warn!(
                session = %session,
                from = %from,
                bound = ?channel.endpoint(),
                "Rejecting datagram from an endpoint the session is not bound to"
            );
            self.metrics.datagram_rejected();
            return;
        }

        if newly_bound {
            info!(session = %session, endpoint = %from, "Datagram channel bound");
            self.events.push(ServerEvent::SessionConnected {
                session,
                transport: Transport::Datagram,
            });
        }

        if let Some(packet) = tagged.packet {
            self.dispatch(session, generation, Transport::Datagram, packet);
        }
    }

    fn on_closed(&mut self, session: SessionId, generation: u64, reason: DisconnectReason) {
        if self.sessions.is_current(session, generation) {
            self.disconnect_with(session, reason);
        }
    }

    fn dispatch(
        &mut self,
        session: SessionId,
        generation: u64,
        transport: Transport,
        mut packet: Packet,
    ) {
        if !self.sessions.is_current(session, generation) {
            debug!(session = %session, "Discarding packet for a closed session");
            return;
        }

        let message_id = match packet.read_i32() {
            Ok(id) => id,
            Err(e) => {
                warn!(session = %session, error = %e, "Dropping packet without a message id");
                return;
            }
        };
        debug!(session = %session, message_id, transport = %transport, "Dispatching packet");

        let handler = match self.handlers.lookup(message_id) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(session = %session, error = %e, "Dropping packet");
                self.metrics.unknown_message();
                return;
            }
        };

        match handler(self, session, &mut packet) {
            Ok(()) => {}
            Err(error @ NetError::ProtocolViolation { .. }) => {
                error!(session = %session, error = %error, "Protocol violation");
                self.events
                    .push(ServerEvent::ProtocolViolation { session, error });
                self.disconnect_with(session, DisconnectReason::ProtocolViolation);
            }
            Err(error) => {
                warn!(session = %session, message_id, error = %error, "Handler failed");
                self.events.push(ServerEvent::HandlerFailed {
                    session,
                    message_id,
                    error,
                });
            }
        }
    }
}

/// Forwards one session's channel activity onto the server's queue
struct SessionSink {
    queue: MainThreadQueue<ServerContext>,
    session: SessionId,
    generation: u64,
}

impl InboundSink for SessionSink {
    fn on_packet(&self, transport: Transport, packet: Packet) {
        let (session, generation) = (self.session, self.generation);
        self.queue.execute_on_main_thread(move |ctx| {
            ctx.dispatch(session, generation, transport, packet);
        });
    }

    fn on_closed(&self, reason: DisconnectReason) {
        let (session, generation) = (self.session, self.generation);
        self.queue.execute_on_main_thread(move |ctx| {
            ctx.on_closed(session, generation, reason);
        });
    }
}

/// TCP + UDP session server
pub struct Server {
    context: ServerContext,
    queue: MainThreadQueue<ServerContext>,
    cancel: Option<CancellationToken>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Build a stopped server. The handshake handler is registered on id 0.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate_strict()?;

        let queue = MainThreadQueue::new();
        let mut handlers = HandlerRegistry::<ServerHandler>::new();
        handlers.register(HANDSHAKE_MESSAGE_ID, Arc::new(handshake::confirm_identity))?;

        Ok(Self {
            context: ServerContext {
                sessions: SessionTable::new(config.max_sessions),
                config,
                handlers,
                events: Vec::new(),
                queue: queue.clone(),
                runtime: None,
                udp: None,
                metrics: Arc::new(Metrics::new()),
            },
            queue,
            cancel: None,
            local_addr: None,
        })
    }

    /// Register the handler for message id `id`.
    ///
    /// Id 0 is taken by the handshake, so registering it fails with
    /// `DuplicateHandlerId`.
    pub fn register_handler<F>(&mut self, id: i32, handler: F) -> Result<()>
    where
        F: Fn(&mut ServerContext, SessionId, &mut Packet) -> Result<()> + Send + Sync + 'static,
    {
        self.context.handlers.register(id, Arc::new(handler))
    }

    /// Bind the TCP listener and the UDP socket and start accepting.
    ///
    /// Both sockets share one port; with port 0 the UDP socket takes whatever
    /// port the listener was given, and a fresh port is tried if that one is
    /// already taken for UDP. Returns the listener's address.
    #[instrument(skip(self), fields(address = %self.context.config.address, port = self.context.config.port))]
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.cancel.is_some() {
            return Err(NetError::Validation(constants::ERR_ALREADY_RUNNING.into()));
        }

        let (listener, std_udp) =
            bind_shared_port(&self.context.config.address, self.context.config.port).await?;
        let local_addr = listener.local_addr()?;

        std_udp.set_nonblocking(true)?;
        let udp_sender = Arc::new(std_udp.try_clone()?);
        let udp_receiver = UdpSocket::from_std(std_udp)?;

        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(listener, self.queue.clone(), cancel.clone()));

        let queue = self.queue.clone();
        tokio::spawn(datagram::receive_tagged(
            udp_receiver,
            cancel.clone(),
            self.context.metrics.clone(),
            move |from, tagged| {
                queue.execute_on_main_thread(move |ctx| ctx.on_datagram(from, tagged));
            },
        ));

        self.context.runtime = Some(Handle::current());
        self.context.udp = Some(udp_sender);
        self.cancel = Some(cancel);
        self.local_addr = Some(local_addr);

        info!(local_addr = %local_addr, max_sessions = self.context.config.max_sessions, "Server started");
        self.context
            .events
            .push(ServerEvent::Started { local_addr });
        Ok(local_addr)
    }

    /// Stop accepting, disconnect every session, and drop queued work.
    ///
    /// A no-op on a server that is not running.
    pub fn stop(&mut self) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        cancel.cancel();
        self.queue.clear();

        let live: Vec<SessionId> = self.context.sessions.live().map(Session::id).collect();
        for session in live {
            self.context
                .disconnect_with(session, DisconnectReason::ServerStopped);
        }

        self.context.runtime = None;
        self.context.udp = None;
        self.local_addr = None;

        info!("Server stopped");
        self.context.metrics.log_metrics();
        self.context.events.push(ServerEvent::Stopped);
    }

    /// Run all queued inbound work and return the events it raised.
    ///
    /// Call once per host tick from the thread that owns the server.
    pub fn pump(&mut self) -> Vec<ServerEvent> {
        self.queue.pump(&mut self.context);
        std::mem::take(&mut self.context.events)
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ServerContext {
        &mut self.context
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.context.metrics.snapshot()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

/// Listener attempts made for port 0 before giving up on finding a port free
/// for both TCP and UDP
const SHARED_PORT_ATTEMPTS: usize = 8;

/// Bind a TCP listener and a UDP socket to the same port.
///
/// A fixed port fails straight away if either bind fails. With port 0 the OS
/// picks the listener's port, which may already be held by someone else's UDP
/// socket; in that case the listener is dropped and another port is tried.
async fn bind_shared_port(address: &str, port: u16) -> Result<(TcpListener, StdUdpSocket)> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let listener = TcpListener::bind((address, port)).await?;
        let chosen = listener.local_addr()?.port();

        match StdUdpSocket::bind((address, chosen)) {
            Ok(udp) => return Ok((listener, udp)),
            Err(e)
                if port == 0
                    && e.kind() == std::io::ErrorKind::AddrInUse
                    && attempt < SHARED_PORT_ATTEMPTS =>
            {
                debug!(port = chosen, attempt, "UDP port taken, retrying with a new listener");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    queue: MainThreadQueue<ServerContext>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    queue.execute_on_main_thread(move |ctx| ctx.admit(stream, peer));
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                }
            },
        }
    }
}
