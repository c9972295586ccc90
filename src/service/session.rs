//! # Sessions
//!
//! Server-side record of each connected peer and the fixed-capacity table
//! that owns them.
//!
//! ## Lifecycle
//! ```text
//! Free ──accept──▶ Allocated ──welcome sent──▶ AwaitingIdentity ──id confirmed──▶ Established
//!   ▲                                                                                  │
//!   └──────────────────────────────── disconnect (any state) ──────────────────────────┘
//! ```
//! Slot ids are `1..=capacity`, handed out lowest-free-first. Every release
//! bumps the slot's generation so work queued for the previous occupant can be
//! told apart from work for the next one.

use std::fmt;
use std::net::SocketAddr;

use crate::core::packet::Packet;
use crate::error::{NetError, Result};
use crate::transport::datagram::DatagramChannel;
use crate::transport::stream::StreamChannel;

/// Server-assigned session identifier, always positive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub i32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a session slot is in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Free,
    Allocated,
    AwaitingIdentity,
    Established,
}

/// One slot of the session table
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    display_name: Option<String>,
    state: SessionState,
    stream: Option<StreamChannel>,
    datagram: Option<DatagramChannel>,
    generation: u64,
}

impl Session {
    fn free(id: SessionId) -> Self {
        Self {
            id,
            display_name: None,
            state: SessionState::Free,
            stream: None,
            datagram: None,
            generation: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Name confirmed by the handshake; `None` until the session is established
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Counter that changes every time the slot is released
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the stream channel is still up
    pub fn is_connected(&self) -> bool {
        self.stream.as_ref().is_some_and(StreamChannel::is_connected)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(StreamChannel::peer_addr)
    }

    /// Endpoint the datagram channel is bound to, if any
    pub fn datagram_endpoint(&self) -> Option<SocketAddr> {
        self.datagram.as_ref().and_then(DatagramChannel::endpoint)
    }

    pub fn send_tcp(&self, packet: Packet) -> Result<()> {
        match &self.stream {
            Some(stream) => stream.send(packet),
            None => Err(NetError::NotConnected),
        }
    }

    /// Send over UDP; silently dropped until the datagram channel is bound
    pub fn send_udp(&self, packet: Packet) -> Result<()> {
        match &self.datagram {
            Some(datagram) => datagram.send_data(packet),
            None => Err(NetError::NotConnected),
        }
    }

    pub(crate) fn attach(&mut self, stream: StreamChannel, datagram: DatagramChannel) {
        self.stream = Some(stream);
        self.datagram = Some(datagram);
    }

    pub(crate) fn datagram_mut(&mut self) -> Option<&mut DatagramChannel> {
        self.datagram.as_mut()
    }

    pub(crate) fn mark_awaiting_identity(&mut self) {
        if self.state == SessionState::Allocated {
            self.state = SessionState::AwaitingIdentity;
        }
    }

    pub(crate) fn establish(&mut self, display_name: String) {
        self.display_name = Some(display_name);
        self.state = SessionState::Established;
    }

    fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.disconnect();
        }
        if let Some(mut datagram) = self.datagram.take() {
            datagram.disconnect();
        }
        self.display_name = None;
        self.state = SessionState::Free;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Fixed-capacity table of sessions indexed by id
#[derive(Debug)]
pub struct SessionTable {
    slots: Vec<Session>,
}

impl SessionTable {
    /// Table with `capacity` free slots, ids `1..=capacity`
    pub fn new(capacity: usize) -> Self {
        let slots = (1..=capacity)
            .map(|id| Session::free(SessionId(id as i32)))
            .collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the lowest free slot for a connection from `peer`
    pub fn allocate(&mut self, peer: SocketAddr) -> Result<SessionId> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.state == SessionState::Free)
            .ok_or(NetError::ServerFull { peer })?;
        slot.state = SessionState::Allocated;
        Ok(slot.id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.index(id).map(|i| &self.slots[i])
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.index(id).map(move |i| &mut self.slots[i])
    }

    /// Whether `id` is occupied by the occupant that saw `generation`
    pub fn is_current(&self, id: SessionId, generation: u64) -> bool {
        self.get(id)
            .is_some_and(|s| s.state != SessionState::Free && s.generation == generation)
    }

    /// Tear down both channels and return the slot to the pool.
    ///
    /// Returns `false` if the slot was already free.
    pub fn release(&mut self, id: SessionId) -> bool {
        match self.get_mut(id) {
            Some(session) if session.state != SessionState::Free => {
                session.release();
                true
            }
            _ => false,
        }
    }

    /// Every slot that is not free
    pub fn live(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().filter(|s| s.state != SessionState::Free)
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    fn index(&self, id: SessionId) -> Option<usize> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        (index < self.slots.len()).then_some(index)
    }
}
