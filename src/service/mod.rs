//! # Managers
//!
//! The application-facing orchestration layer: [`NetworkClient`] owns one
//! outbound connection to a configured server target;  [`NetworkServer`]
//! owns a growable set of inbound connections with accept and configure
//! hooks. Both dispatch every inbound packet to their registered handlers
//! with a [`PacketContext`] describing the delivering connection.

pub mod client;
pub mod server;

pub use client::NetworkClient;
pub use server::NetworkServer;

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error};

use crate::connection::{Connection, ConnectionState, PacketContext};
use crate::core::packet::Packet;
use crate::transport::local::LocalDelivery;
use crate::utils::metrics::Metrics;

/// Callback invoked for every inbound packet.
pub type PacketHandler = Arc<dyn Fn(&dyn Packet, &PacketContext) + Send + Sync>;

/// Callback invoked when a connection leaves the manager, solicited or not.
pub type DisconnectHandler = Arc<dyn Fn(&Connection) + Send + Sync>;

pub(crate) type HandlerList = Arc<RwLock<Vec<PacketHandler>>>;
pub(crate) type DisconnectList = Arc<RwLock<Vec<DisconnectHandler>>>;

/// Runs every registered packet handler, outside any framework lock.
pub(crate) fn dispatch(handlers: &HandlerList, packet: &dyn Packet, ctx: &PacketContext) {
    let snapshot: Vec<PacketHandler> = handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for handler in snapshot {
        handler(packet, ctx);
    }
}

pub(crate) fn notify_disconnect(handlers: &DisconnectList, connection: &Connection) {
    let snapshot: Vec<DisconnectHandler> = handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for handler in snapshot {
        handler(connection);
    }
}

/// Common inbound path for local deliveries on either side: decode if the
/// exchange runs in copy mode, then dispatch. A framing failure is fatal to
/// the delivering connection.
pub(crate) fn deliver_local(
    connection: &Connection,
    handlers: &HandlerList,
    metrics: &Metrics,
    delivery: LocalDelivery,
) {
    if connection.state() == ConnectionState::Closed {
        debug!(peer = %connection.remote_id(), "dropping delivery on closed connection");
        return;
    }
    match delivery {
        LocalDelivery::Shared(packet) => {
            metrics.frame_received(0);
            let ctx = PacketContext::new(connection.clone());
            dispatch(handlers, packet.as_ref(), &ctx);
        }
        LocalDelivery::Encoded(frame) => {
            metrics.frame_received(frame.payload.len() as u64);
            match connection.registry().decode(&frame) {
                Ok(Some(packet)) => {
                    let ctx = PacketContext::new(connection.clone());
                    dispatch(handlers, packet.as_ref(), &ctx);
                }
                Ok(None) => {
                    metrics.unknown_packet_id();
                }
                Err(e) => {
                    error!(
                        error = %e,
                        peer = %connection.remote_id(),
                        "fatal decode error on local delivery"
                    );
                    metrics.framing_error();
                    connection.force_close("framing error");
                }
            }
        }
    }
}
