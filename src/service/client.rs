//! Client manager.
//!
//! A [`NetworkClient`] owns exactly one [`Connection`] to one configured
//! server target. Opening, sending, and closing all return completion
//! handles; calling them out of order yields a quick-failed handle rather
//! than panicking, so callers treat every outcome uniformly.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tracing::{info, warn};

use crate::completion::{AsyncAction, AsyncResult};
use crate::config::{ClientConfig, NetworkConfig, TransportConfig};
use crate::connection::{Connection, Link, Role};
use crate::core::codec::FrameCodec;
use crate::core::packet::Packet;
use crate::core::registry::PacketRegistry;
use crate::error::{constants, Result, WireError};
use crate::service::{
    deliver_local, notify_disconnect, DisconnectList, HandlerList,
};
use crate::target::TargetId;
use crate::transport::local::{LocalDelivery, LocalEndpoint, LocalExchange};
use crate::transport::tcp;
use crate::utils::metrics::Metrics;

struct ClientInner {
    local_id: TargetId,
    server_id: TargetId,
    registry: Arc<PacketRegistry>,
    client_config: ClientConfig,
    transport_config: TransportConfig,
    exchange: Option<Arc<LocalExchange>>,
    connection: Mutex<Option<Connection>>,
    connecting: AtomicBool,
    handlers: HandlerList,
    disconnect_handlers: DisconnectList,
    metrics: Arc<Metrics>,
}

/// Manager for a single outbound connection to a configured server.
pub struct NetworkClient {
    inner: Arc<ClientInner>,
}

impl NetworkClient {
    /// Client for a network server, targeted by `config.client.address`.
    /// `name` is this endpoint's local identity in logs and contexts.
    pub fn new(name: impl Into<String>, config: NetworkConfig) -> Result<Self> {
        let server_id = TargetId::parse_network(&config.client.address)?;
        Ok(Self::build(
            TargetId::local(name),
            server_id,
            config,
            None,
        ))
    }

    /// Client for an in-process server reachable through `exchange`.
    pub fn local(
        name: impl Into<String>,
        server_name: impl Into<String>,
        exchange: Arc<LocalExchange>,
    ) -> Self {
        Self::local_with_config(name, server_name, exchange, NetworkConfig::default())
    }

    /// Like [`NetworkClient::local`] with explicit configuration.
    pub fn local_with_config(
        name: impl Into<String>,
        server_name: impl Into<String>,
        exchange: Arc<LocalExchange>,
        config: NetworkConfig,
    ) -> Self {
        Self::build(
            TargetId::local(name),
            TargetId::local(server_name),
            config,
            Some(exchange),
        )
    }

    fn build(
        local_id: TargetId,
        server_id: TargetId,
        config: NetworkConfig,
        exchange: Option<Arc<LocalExchange>>,
    ) -> Self {
        NetworkClient {
            inner: Arc::new(ClientInner {
                local_id,
                server_id,
                registry: Arc::new(PacketRegistry::new()),
                client_config: config.client,
                transport_config: config.transport,
                exchange,
                connection: Mutex::new(None),
                connecting: AtomicBool::new(false),
                handlers: Arc::new(RwLock::new(Vec::new())),
                disconnect_handlers: Arc::new(RwLock::new(Vec::new())),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }

    /// This client's local identity.
    pub fn local_id(&self) -> &TargetId {
        &self.inner.local_id
    }

    /// The configured server target.
    pub fn server_id(&self) -> &TargetId {
        &self.inner.server_id
    }

    /// Registers `P` under `id` on this client's registry. Must match the
    /// server's mapping for the same id.
    pub fn add_mapping<P: Packet + Default + Any>(&self, id: i32) -> Result<()> {
        self.inner.registry.add_mapping::<P>(id)
    }

    /// Registers `P` under `id` with an explicit factory.
    pub fn add_mapping_with<P, F>(&self, id: i32, factory: F) -> Result<()>
    where
        P: Packet + Any,
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.inner.registry.add_mapping_with(id, factory)
    }

    /// Registers a handler for inbound packets from the server.
    pub fn add_packet_handler(
        &self,
        handler: impl Fn(&dyn Packet, &crate::connection::PacketContext) + Send + Sync + 'static,
    ) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Registers a handler fired when the connection closes, solicited or
    /// not.
    pub fn add_disconnect_handler(
        &self,
        handler: impl Fn(&Connection) + Send + Sync + 'static,
    ) {
        self.inner
            .disconnect_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// The connection, once an open attempt has been made.
    pub fn connection(&self) -> Option<Connection> {
        lock(&self.inner.connection).clone()
    }

    /// True while the connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| c.is_open())
    }

    /// This client's transport counters.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Opens the connection to the configured server.
    ///
    /// For a local target this is a synchronous exchange lookup: the result
    /// is already done when it returns. For a network target the connect
    /// runs on a tokio task under the configured timeout; a failed attempt
    /// leaves the client unconnected and a later retry is allowed. Opening
    /// while already connected (or after close) quick-fails.
    pub fn open_connection(&self) -> AsyncResult {
        {
            let slot = lock(&self.inner.connection);
            if let Some(conn) = &*slot {
                return AsyncResult::failed(WireError::InvalidState {
                    operation: "connect",
                    state: conn.state().name(),
                });
            }
        }
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            return AsyncResult::failed(WireError::Transport(
                constants::ERR_CONNECT_IN_PROGRESS.into(),
            ));
        }
        match self.inner.exchange.clone() {
            Some(exchange) => self.open_local(exchange),
            None => self.open_network(),
        }
    }

    fn open_local(&self, exchange: Arc<LocalExchange>) -> AsyncResult {
        let inner = &self.inner;
        let conn = Connection::new(
            inner.local_id.clone(),
            inner.server_id.clone(),
            Role::Client,
            Arc::clone(&inner.registry),
            Arc::clone(&inner.metrics),
        );
        conn.set_link(Link::Local(Arc::clone(&exchange)));

        let endpoint: Arc<dyn LocalEndpoint> = Arc::new(ClientEndpoint {
            inner: Arc::downgrade(inner),
        });
        if let Err(e) = exchange.register(inner.local_id.clone(), endpoint) {
            inner.connecting.store(false, Ordering::SeqCst);
            return AsyncResult::failed(e);
        }

        // Visible before the attempt so a configure hook that answers
        // immediately finds the connection.
        *lock(&inner.connection) = Some(conn.clone());

        let Some(server) = exchange.lookup(&inner.server_id) else {
            *lock(&inner.connection) = None;
            exchange.unregister(&inner.local_id);
            inner.connecting.store(false, Ordering::SeqCst);
            return AsyncResult::failed(WireError::UnknownTarget(inner.server_id.to_string()));
        };

        match server.connection_attempt(inner.local_id.clone()) {
            Err(e) => {
                *lock(&inner.connection) = None;
                exchange.unregister(&inner.local_id);
                inner.connecting.store(false, Ordering::SeqCst);
                AsyncResult::failed(e)
            }
            Ok(()) => {
                conn.mark_open();
                let weak = Arc::downgrade(inner);
                conn.set_closed_hook(move |c| client_closed(&weak, c));
                inner.metrics.connection_established();
                inner.connecting.store(false, Ordering::SeqCst);
                info!(server = %inner.server_id, "connected to local server");
                AsyncResult::succeeded()
            }
        }
    }

    fn open_network(&self) -> AsyncResult {
        let inner = Arc::clone(&self.inner);
        let conn = Connection::new(
            inner.local_id.clone(),
            inner.server_id.clone(),
            Role::Client,
            Arc::clone(&inner.registry),
            Arc::clone(&inner.metrics),
        );
        *lock(&inner.connection) = Some(conn.clone());

        let result = AsyncResult::pending();
        let pending = result.clone();
        tokio::spawn(async move {
            let connected = async {
                let addr = tcp::resolve(&inner.server_id).await?;
                tcp::connect(
                    addr,
                    inner.client_config.connection_timeout,
                    inner.transport_config.nodelay,
                )
                .await
            }
            .await;

            match connected {
                Err(e) => {
                    warn!(server = %inner.server_id, error = %e, "connect failed");
                    *lock(&inner.connection) = None;
                    inner.connecting.store(false, Ordering::SeqCst);
                    pending.complete_failure(e);
                }
                Ok(stream) => {
                    let codec = FrameCodec::with_limit(inner.transport_config.max_payload_size);
                    let (outbound, reader) =
                        tcp::spawn_link(stream, codec, conn.clone(), Arc::clone(&inner.handlers));
                    conn.set_link(Link::Tcp { outbound, reader });
                    let weak = Arc::downgrade(&inner);
                    conn.set_closed_hook(move |c| client_closed(&weak, c));
                    if conn.mark_open() {
                        inner.metrics.connection_established();
                        inner.connecting.store(false, Ordering::SeqCst);
                        info!(server = %inner.server_id, "connected");
                        pending.complete_success();
                    } else {
                        // Closed while the connect was in flight.
                        conn.close();
                        inner.connecting.store(false, Ordering::SeqCst);
                        pending.complete_failure(WireError::ConnectionClosed);
                    }
                }
            }
        });
        result
    }

    /// Sends `packet` to the server. Quick-fails when no open connection
    /// exists; an unmapped packet type is returned synchronously as `Err`.
    pub fn send_to_server<P: Packet + Any>(&self, packet: P) -> Result<AsyncResult> {
        match self.connection() {
            None => Ok(AsyncResult::failed(WireError::InvalidState {
                operation: "send",
                state: "UNCONNECTED",
            })),
            Some(conn) => conn.send(packet),
        }
    }

    /// Closes the connection to the server. Idempotent; with no connection
    /// at all this returns an already-done action.
    pub fn close_connection(&self) -> AsyncAction {
        match self.connection() {
            None => AsyncAction::completed(),
            Some(conn) => conn.close(),
        }
    }
}

impl std::fmt::Debug for NetworkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkClient")
            .field("local", &self.inner.local_id)
            .field("server", &self.inner.server_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Teardown shared by the solicited and unsolicited close paths.
fn client_closed(weak: &Weak<ClientInner>, connection: &Connection) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if let Some(exchange) = &inner.exchange {
        exchange.unregister(&inner.local_id);
    }
    inner.metrics.connection_closed();
    notify_disconnect(&inner.disconnect_handlers, connection);
}

/// The client's receiver in a local exchange.
struct ClientEndpoint {
    inner: Weak<ClientInner>,
}

impl LocalEndpoint for ClientEndpoint {
    fn connection_attempt(&self, peer: TargetId) -> crate::error::Result<()> {
        Err(WireError::ConnectionRejected(format!(
            "client endpoint does not accept connections (from {peer})"
        )))
    }

    fn receive(&self, from: TargetId, delivery: LocalDelivery) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if from != inner.server_id {
            warn!(sender = %from, "dropping local delivery from unexpected sender");
            return;
        }
        let Some(conn) = lock(&inner.connection).clone() else {
            warn!(sender = %from, "dropping local delivery with no connection");
            return;
        };
        deliver_local(&conn, &inner.handlers, &inner.metrics, delivery);
    }

    fn peer_closed(&self, peer: TargetId) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if peer != inner.server_id {
            return;
        }
        let conn = lock(&inner.connection).clone();
        if let Some(conn) = conn {
            conn.close_from_peer();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
