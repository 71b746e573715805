//! # wirecast
//!
//! Typed packet messaging for Rust services: frame polymorphic messages
//! over an in-process loopback exchange or real TCP sockets, with
//! synchronizable completion handles for connect, send, and close.
//!
//! ## Architecture
//! - [`core`]: packet contract, payload codec, frame codec, id registry
//! - [`completion`]: `AsyncAction` / `AsyncResult` / `AsyncResultGroup`
//! - [`connection`]: the `UNCONNECTED → OPEN → CLOSED` state machine
//! - [`transport`]: local exchange and socket transports
//! - [`service`]: the client and server managers
//! - [`config`] / [`utils`]: configuration, logging, timeouts, metrics
//!
//! ## Example
//! ```no_run
//! use wirecast::{LocalExchange, NetworkClient, NetworkServer, Packet};
//! use wirecast::core::wire::{PayloadReader, PayloadWriter};
//!
//! #[derive(Debug, Default)]
//! struct Chat {
//!     text: String,
//! }
//!
//! impl Packet for Chat {
//!     fn write_data(&self, w: &mut PayloadWriter) -> wirecast::Result<()> {
//!         w.write_string(&self.text)
//!     }
//!     fn read_data(&mut self, r: &mut PayloadReader) -> wirecast::Result<()> {
//!         self.text = r.read_string()?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> wirecast::Result<()> {
//!     let exchange = LocalExchange::new();
//!
//!     let server = NetworkServer::local("chat", exchange.clone());
//!     server.add_mapping::<Chat>(1)?;
//!     server.add_packet_handler(|packet, ctx| {
//!         if let Some(chat) = packet.downcast_ref::<Chat>() {
//!             println!("{} says {}", ctx.sender(), chat.text);
//!         }
//!     });
//!     server.start_server();
//!
//!     let client = NetworkClient::local("alice", "chat", exchange);
//!     client.add_mapping::<Chat>(1)?;
//!     client.open_connection().wait();
//!     client.send_to_server(Chat { text: "hi".into() })?.wait();
//!     client.close_connection().wait();
//!     server.stop_server().wait();
//!     Ok(())
//! }
//! ```

pub mod completion;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod service;
pub mod target;
pub mod transport;
pub mod utils;

pub use completion::{AsyncAction, AsyncResult, AsyncResultGroup};
pub use connection::{Attachment, Connection, ConnectionState, PacketContext, Role};
pub use crate::core::codec::{Frame, FrameCodec};
pub use crate::core::packet::Packet;
pub use crate::core::registry::PacketRegistry;
pub use error::{Result, WireError};
pub use service::{NetworkClient, NetworkServer, PacketHandler};
pub use target::TargetId;
pub use transport::local::{DeliveryMode, LocalExchange};
