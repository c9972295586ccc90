//! Identity handshake carried on message id 0.
//!
//! ```text
//! server ──[0] { message: string, assigned_id: i32 }──▶ client
//! client ──empty udp tagged with assigned_id──────────▶ server
//! client ──[0] { echoed_id: i32, display_name: string }▶ server
//! ```
//!
//! The server confirms the session only if `echoed_id` matches the id it
//! assigned. Anything else is a protocol violation and the session is
//! dropped. The client accepts exactly one welcome per connection attempt.

use tracing::{info, instrument};

use crate::config::HANDSHAKE_MESSAGE_ID;
use crate::core::packet::Packet;
use crate::error::{constants, NetError, Result};
use crate::service::client::{ClientEvent, PeerContext};
use crate::service::server::{ServerContext, ServerEvent};
use crate::service::session::{SessionId, SessionState};

/// Server greeting with the id assigned to the new session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub message: String,
    pub assigned_id: i32,
}

/// Client reply that echoes the assigned id with the client's name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityReply {
    pub echoed_id: i32,
    pub display_name: String,
}

pub fn welcome_packet(message: &str, assigned_id: i32) -> Packet {
    let mut packet = Packet::with_id(HANDSHAKE_MESSAGE_ID);
    packet.write_str(message);
    packet.write_i32(assigned_id);
    packet
}

/// Read a welcome body; the message id must already be consumed
pub fn read_welcome(packet: &mut Packet) -> Result<Welcome> {
    let message = packet.read_string()?;
    let assigned_id = packet.read_i32()?;
    Ok(Welcome {
        message,
        assigned_id,
    })
}

pub fn identity_packet(echoed_id: i32, display_name: &str) -> Packet {
    let mut packet = Packet::with_id(HANDSHAKE_MESSAGE_ID);
    packet.write_i32(echoed_id);
    packet.write_str(display_name);
    packet
}

/// Read an identity reply body; the message id must already be consumed
pub fn read_identity(packet: &mut Packet) -> Result<IdentityReply> {
    let echoed_id = packet.read_i32()?;
    let display_name = packet.read_string()?;
    Ok(IdentityReply {
        echoed_id,
        display_name,
    })
}

/// Server-side id 0 handler
#[instrument(skip(ctx, packet))]
pub(crate) fn confirm_identity(
    ctx: &mut ServerContext,
    session: SessionId,
    packet: &mut Packet,
) -> Result<()> {
    let reply = read_identity(packet)?;

    let Some(record) = ctx.session_mut(session) else {
        return Err(NetError::NotConnected);
    };

    // a second reply on an established session is as wrong as a bad id
    if reply.echoed_id != session.0 || record.state() != SessionState::AwaitingIdentity {
        ctx.metrics().handshake_failed();
        return Err(NetError::ProtocolViolation {
            session,
            expected: session.0,
            received: reply.echoed_id,
            display_name: reply.display_name,
        });
    }

    record.establish(reply.display_name.clone());
    ctx.metrics().handshake_success();
    info!(session = %session, display_name = %reply.display_name, "Session established");
    ctx.emit(ServerEvent::SessionEstablished {
        session,
        display_name: reply.display_name,
    });
    Ok(())
}

/// Client-side id 0 handler
#[instrument(skip_all)]
pub(crate) fn accept_welcome(ctx: &mut PeerContext, packet: &mut Packet) -> Result<()> {
    let welcome = read_welcome(packet)?;

    if welcome.assigned_id <= 0 {
        return Err(NetError::MalformedPacket(constants::ERR_NON_POSITIVE_ID.into()));
    }
    if ctx.assigned_id() != 0 {
        return Err(NetError::MalformedPacket(constants::ERR_DUPLICATE_WELCOME.into()));
    }

    ctx.assign_id(welcome.assigned_id);
    ctx.open_datagram()?;
    ctx.send_tcp(identity_packet(welcome.assigned_id, ctx.display_name()))?;
    ctx.mark_awaiting_identity();

    info!(assigned_id = welcome.assigned_id, message = %welcome.message, "Welcome received");
    ctx.emit(ClientEvent::Welcome {
        message: welcome.message,
        assigned_id: welcome.assigned_id,
    });
    Ok(())
}
