//! Transports.
//!
//! Two ways to carry frames between endpoints:
//! - [`local`]: in-process delivery through a shared exchange, simulating a
//!   network without sockets. Calls execute synchronously on the caller's
//!   thread.
//! - [`tcp`]: real sockets. Send, connect, and close return immediately; the
//!   I/O happens on transport-owned tokio tasks, one reader and one writer
//!   per connection. Frames sent on one connection are delivered in send
//!   order; nothing is guaranteed across connections.

pub mod local;
pub mod tcp;
