//! Connection lifecycle.
//!
//! A [`Connection`] is one addressable channel between a local identifier
//! and a remote identifier, carried by either a
//! [`LocalExchange`](crate::transport::local::LocalExchange) or a TCP
//! socket. Its state only moves forward:
//!
//! ```text
//! UNCONNECTED → OPEN → CLOSED
//! ```
//!
//! `CLOSED` is terminal — a closed connection accepts no further sends and
//! rejects re-open attempts. The state field is the single synchronization
//! point for the connection: every operation checks and transitions it under
//! the state lock, so a send can never race a concurrent close into a
//! half-torn-down transport.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::completion::{AsyncAction, AsyncResult};
use crate::core::packet::Packet;
use crate::core::registry::PacketRegistry;
use crate::error::{constants, Result, WireError};
use crate::target::TargetId;
use crate::transport::local::{DeliveryMode, LocalDelivery, LocalExchange};
use crate::transport::tcp::Outbound;
use crate::utils::metrics::Metrics;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created but not yet connected.
    Unconnected,
    /// Connected; sends are accepted.
    Open,
    /// Terminal. No further sends, no re-open.
    Closed,
}

impl ConnectionState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ConnectionState::Unconnected => "UNCONNECTED",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of the connection the local endpoint is acting as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The outbound side owned by a client manager.
    Client,
    /// The inbound side owned by a server manager.
    Server,
}

/// Opaque per-connection payload, set by the server's configure hook.
pub type Attachment = Arc<dyn Any + Send + Sync>;

pub(crate) enum Link {
    Local(Arc<LocalExchange>),
    Tcp {
        outbound: mpsc::UnboundedSender<Outbound>,
        reader: tokio::task::JoinHandle<()>,
    },
}

type ClosedHook = Box<dyn Fn(&Connection) + Send + Sync>;

struct ConnInner {
    local: TargetId,
    remote: TargetId,
    role: Role,
    state: Mutex<ConnectionState>,
    attachment: Mutex<Option<Attachment>>,
    registry: Arc<PacketRegistry>,
    metrics: Arc<Metrics>,
    link: Mutex<Option<Link>>,
    closed_hook: Mutex<Option<ClosedHook>>,
}

/// One addressable channel between a local and a remote endpoint.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    pub(crate) fn new(
        local: TargetId,
        remote: TargetId,
        role: Role,
        registry: Arc<PacketRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Connection {
            inner: Arc::new(ConnInner {
                local,
                remote,
                role,
                state: Mutex::new(ConnectionState::Unconnected),
                attachment: Mutex::new(None),
                registry,
                metrics,
                link: Mutex::new(None),
                closed_hook: Mutex::new(None),
            }),
        }
    }

    /// Local endpoint identity.
    pub fn local_id(&self) -> &TargetId {
        &self.inner.local
    }

    /// Remote endpoint identity.
    pub fn remote_id(&self) -> &TargetId {
        &self.inner.remote
    }

    /// Which side this connection is acting as.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// True while the connection accepts sends.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The opaque per-connection payload, if one was attached.
    pub fn attachment(&self) -> Option<Attachment> {
        lock(&self.inner.attachment).clone()
    }

    /// Typed view of the attachment.
    pub fn attachment_of<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.attachment().and_then(|a| a.downcast::<T>().ok())
    }

    /// Attaches an opaque payload, replacing any previous one. Typically
    /// called from a server's configure hook.
    pub fn set_attachment<T: Any + Send + Sync>(&self, value: T) {
        *lock(&self.inner.attachment) = Some(Arc::new(value));
    }

    pub(crate) fn registry(&self) -> Arc<PacketRegistry> {
        Arc::clone(&self.inner.registry)
    }

    pub(crate) fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub(crate) fn set_link(&self, link: Link) {
        let mut guard = lock(&self.inner.link);
        let closed = *lock(&self.inner.state) == ConnectionState::Closed;
        if closed {
            // Closed while the link was being wired up: tear it down instead
            // of storing it, or the writer task would never exit.
            drop(guard);
            if let Link::Tcp { outbound, reader } = link {
                let _ = outbound.send(Outbound::Shutdown(AsyncAction::pending()));
                reader.abort();
            }
            return;
        }
        *guard = Some(link);
    }

    pub(crate) fn set_closed_hook(&self, hook: impl Fn(&Connection) + Send + Sync + 'static) {
        *lock(&self.inner.closed_hook) = Some(Box::new(hook));
    }

    /// UNCONNECTED → OPEN. Returns false if the connection is no longer
    /// unconnected (e.g. it was closed while the connect was in flight).
    pub(crate) fn mark_open(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if *state != ConnectionState::Unconnected {
            return false;
        }
        *state = ConnectionState::Open;
        true
    }

    /// Sends `packet` on this connection.
    ///
    /// Outside `OPEN` this returns a quick-failed result without touching
    /// any transport. An unmapped packet type is a programmer error and is
    /// returned synchronously as `Err`. Everything else — transport write
    /// failures included — lands on the returned [`AsyncResult`]; a single
    /// failed send does not close the connection.
    pub fn send<P: Packet + Any>(&self, packet: P) -> Result<AsyncResult> {
        self.send_shared(Arc::new(packet))
    }

    pub(crate) fn send_shared(&self, packet: Arc<dyn Packet>) -> Result<AsyncResult> {
        {
            let state = lock(&self.inner.state);
            if *state != ConnectionState::Open {
                return Ok(AsyncResult::failed(WireError::InvalidState {
                    operation: "send",
                    state: state.name(),
                }));
            }
        }

        // Snapshot the transport handle; holding the link lock across
        // delivery would deadlock a handler that sends from the same thread.
        enum LinkRef {
            Local(Arc<LocalExchange>),
            Tcp(mpsc::UnboundedSender<Outbound>),
        }
        let link = {
            let guard = lock(&self.inner.link);
            match &*guard {
                Some(Link::Local(exchange)) => LinkRef::Local(Arc::clone(exchange)),
                Some(Link::Tcp { outbound, .. }) => LinkRef::Tcp(outbound.clone()),
                None => return Ok(AsyncResult::failed(WireError::ConnectionClosed)),
            }
        };

        match link {
            LinkRef::Local(exchange) => {
                let Some(endpoint) = exchange.lookup(&self.inner.remote) else {
                    // The peer endpoint is gone: unsolicited close.
                    exchange.deliver_unroutable(&self.inner.remote, &self.inner.local);
                    self.force_close(constants::ERR_PEER_REMOVED);
                    return Ok(AsyncResult::failed(WireError::Transport(
                        constants::ERR_PEER_REMOVED.into(),
                    )));
                };
                let delivery = match exchange.mode() {
                    DeliveryMode::PassThrough => {
                        self.inner.metrics.frame_sent(0);
                        LocalDelivery::Shared(packet)
                    }
                    DeliveryMode::CopyViaCodec => {
                        let frame = self.inner.registry.encode(packet.as_ref())?;
                        self.inner.metrics.frame_sent(frame.payload.len() as u64);
                        LocalDelivery::Encoded(frame)
                    }
                };
                endpoint.receive(self.inner.local.clone(), delivery);
                Ok(AsyncResult::succeeded())
            }
            LinkRef::Tcp(outbound) => {
                let frame = self.inner.registry.encode(packet.as_ref())?;
                let bytes = frame.payload.len() as u64;
                let result = AsyncResult::pending();
                if outbound
                    .send(Outbound::Frame(frame, result.clone()))
                    .is_err()
                {
                    result.complete_failure(WireError::Transport(
                        constants::ERR_WRITER_GONE.into(),
                    ));
                } else {
                    self.inner.metrics.frame_sent(bytes);
                }
                Ok(result)
            }
        }
    }

    /// Closes this connection, releasing its transport. Idempotent: closing
    /// a closed connection returns an already-done action. The returned
    /// action completes once teardown (socket flush and shutdown, or peer
    /// notification) has finished.
    pub fn close(&self) -> AsyncAction {
        self.shutdown(true)
    }

    /// Close initiated by the remote side; skips the notify-back.
    pub(crate) fn close_from_peer(&self) {
        self.shutdown(false);
    }

    /// Unsolicited close after a transport failure or framing error.
    pub(crate) fn force_close(&self, reason: &str) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        warn!(
            local = %self.inner.local,
            remote = %self.inner.remote,
            reason,
            "connection closed unexpectedly"
        );
        self.shutdown(true);
    }

    fn shutdown(&self, notify_peer: bool) -> AsyncAction {
        {
            let mut state = lock(&self.inner.state);
            if *state == ConnectionState::Closed {
                return AsyncAction::completed();
            }
            *state = ConnectionState::Closed;
        }

        let link = lock(&self.inner.link).take();
        let action = match link {
            None => AsyncAction::completed(),
            Some(Link::Local(exchange)) => {
                if notify_peer {
                    if let Some(peer) = exchange.lookup(&self.inner.remote) {
                        peer.peer_closed(self.inner.local.clone());
                    }
                }
                AsyncAction::completed()
            }
            Some(Link::Tcp { outbound, reader }) => {
                let action = AsyncAction::pending();
                if outbound.send(Outbound::Shutdown(action.clone())).is_err() {
                    // Writer already gone; nothing left to flush.
                    action.complete();
                }
                reader.abort();
                action
            }
        };

        debug!(local = %self.inner.local, remote = %self.inner.remote, "connection closed");

        let hook = lock(&self.inner.closed_hook).take();
        if let Some(hook) = hook {
            hook(self);
        }

        action
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-delivery metadata handed to packet handlers: which connection
/// delivered the packet and which side of it the local endpoint is.
pub struct PacketContext {
    connection: Connection,
}

impl PacketContext {
    pub(crate) fn new(connection: Connection) -> Self {
        PacketContext { connection }
    }

    /// The connection the packet arrived on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The remote endpoint that sent the packet.
    pub fn sender(&self) -> &TargetId {
        self.connection.remote_id()
    }

    /// Which side of the connection the local endpoint is acting as.
    pub fn role(&self) -> Role {
        self.connection.role()
    }

    /// True when the local side is the server.
    pub fn is_server(&self) -> bool {
        self.role() == Role::Server
    }

    /// True when the local side is the client.
    pub fn is_client(&self) -> bool {
        self.role() == Role::Client
    }

    /// The connection's opaque payload, if the configure hook attached one.
    pub fn attachment(&self) -> Option<Attachment> {
        self.connection.attachment()
    }

    /// Typed view of the connection's payload.
    pub fn attachment_of<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.connection.attachment_of::<T>()
    }
}

impl fmt::Debug for PacketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketContext")
            .field("sender", self.sender())
            .field("role", &self.role())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::core::wire::{PayloadReader, PayloadWriter};

    #[derive(Debug, Default)]
    struct Noop;

    impl Packet for Noop {
        fn write_data(&self, _writer: &mut PayloadWriter) -> Result<()> {
            Ok(())
        }

        fn read_data(&mut self, _reader: &mut PayloadReader) -> Result<()> {
            Ok(())
        }
    }

    fn connection() -> Connection {
        Connection::new(
            TargetId::local("a"),
            TargetId::local("b"),
            Role::Client,
            Arc::new(PacketRegistry::new()),
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn send_before_open_quick_fails() {
        let conn = connection();
        let result = conn.send(Noop).unwrap();
        assert!(result.is_done());
        assert!(!result.is_success());
        assert!(matches!(
            result.error().as_deref(),
            Some(WireError::InvalidState {
                operation: "send",
                state: "UNCONNECTED"
            })
        ));
    }

    #[test]
    fn send_after_close_quick_fails() {
        let conn = connection();
        assert!(conn.mark_open());
        conn.close();
        let result = conn.send(Noop).unwrap();
        assert!(result.is_done());
        assert!(!result.is_success());
    }

    #[test]
    fn state_never_moves_backwards() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Unconnected);
        assert!(conn.mark_open());
        assert_eq!(conn.state(), ConnectionState::Open);
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        // Closed is terminal: no transition back to open.
        assert!(!conn.mark_open());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn close_is_idempotent() {
        let conn = connection();
        conn.mark_open();
        let first = conn.close();
        let second = conn.close();
        assert!(first.is_done());
        assert!(second.is_done());
    }

    #[test]
    fn closed_hook_fires_once() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let conn = connection();
        conn.mark_open();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        conn.set_closed_hook(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        conn.close();
        conn.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attachment_round_trips() {
        let conn = connection();
        conn.set_attachment(String::from("player-7"));
        let value = conn.attachment_of::<String>().unwrap();
        assert_eq!(*value, "player-7");
        assert!(conn.attachment_of::<u32>().is_none());
    }
}
