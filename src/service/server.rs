//! Server manager.
//!
//! A [`NetworkServer`] owns a growable set of inbound [`Connection`]s keyed
//! by remote target. Before a connection is considered open, two ordered
//! extension points fire: the accept hook, which may decline the peer
//! outright, and the configure hook, which may attach a per-connection
//! payload retrievable later through the packet context.
//!
//! The socket variant runs one accept loop task plus a reader and writer
//! task per connection; tokio's reactor multiplexes readiness across all of
//! them, so a bounded number of worker threads services an arbitrary number
//! of connections.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::completion::{AsyncAction, AsyncResult, AsyncResultGroup};
use crate::config::NetworkConfig;
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

type AcceptHook = Arc<dyn Fn(&TargetId) -> bool + Send + Sync>;
type ConfigureHook = Arc<dyn Fn(&Connection) + Send + Sync>;

enum Lifecycle {
    Idle,
    Local,
    Network { shutdown: mpsc::Sender<()> },
}

struct ServerInner {
    local_id: TargetId,
    config: NetworkConfig,
    registry: Arc<PacketRegistry>,
    exchange: Option<Arc<LocalExchange>>,
    connections: RwLock<HashMap<TargetId, Connection>>,
    handlers: HandlerList,
    disconnect_handlers: DisconnectList,
    accept_hook: RwLock<Option<AcceptHook>>,
    configure_hook: RwLock<Option<ConfigureHook>>,
    lifecycle: Mutex<Lifecycle>,
    bound: Mutex<Option<SocketAddr>>,
    metrics: Arc<Metrics>,
}

/// Manager for a set of inbound connections.
pub struct NetworkServer {
    inner: Arc<ServerInner>,
}

impl NetworkServer {
    /// Socket server listening on `config.server.address`.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        let local_id = TargetId::parse_network(&config.server.address)?;
        Ok(Self::build(local_id, config, None))
    }

    /// In-process server reachable as `name` through `exchange`.
    pub fn local(name: impl Into<String>, exchange: Arc<LocalExchange>) -> Self {
        Self::local_with_config(name, exchange, NetworkConfig::default())
    }

    /// Like [`NetworkServer::local`] with explicit configuration.
    pub fn local_with_config(
        name: impl Into<String>,
        exchange: Arc<LocalExchange>,
        config: NetworkConfig,
    ) -> Self {
        Self::build(TargetId::local(name), config, Some(exchange))
    }

    fn build(
        local_id: TargetId,
        config: NetworkConfig,
        exchange: Option<Arc<LocalExchange>>,
    ) -> Self {
        NetworkServer {
            inner: Arc::new(ServerInner {
                local_id,
                config,
                registry: Arc::new(PacketRegistry::new()),
                exchange,
                connections: RwLock::new(HashMap::new()),
                handlers: Arc::new(RwLock::new(Vec::new())),
                disconnect_handlers: Arc::new(RwLock::new(Vec::new())),
                accept_hook: RwLock::new(None),
                configure_hook: RwLock::new(None),
                lifecycle: Mutex::new(Lifecycle::Idle),
                bound: Mutex::new(None),
                metrics: Arc::new(Metrics::new()),
            }),
        }
    }

    /// This server's identity.
    pub fn local_id(&self) -> &TargetId {
        &self.inner.local_id
    }

    /// Registers `P` under `id` on this server's registry. Must match the
    /// clients' mapping for the same id.
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

    /// Registers a handler for inbound packets from any client.
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

    /// Registers a handler fired whenever a client connection closes.
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

    /// Installs the accept check. Returning false declines the peer: the
    /// connection never opens and its socket is closed immediately.
    pub fn set_accept_hook(&self, hook: impl Fn(&TargetId) -> bool + Send + Sync + 'static) {
        *self
            .inner
            .accept_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Installs the configure step, run on acceptance before the connection
    /// is considered open. Typically attaches the per-connection payload.
    pub fn set_configure_hook(&self, hook: impl Fn(&Connection) + Send + Sync + 'static) {
        *self
            .inner
            .configure_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// True while the server is accepting connections.
    pub fn is_running(&self) -> bool {
        !matches!(*lock(&self.inner.lifecycle), Lifecycle::Idle)
    }

    /// The address the listener actually bound, once running. Useful with a
    /// configured port of 0.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.bound)
    }

    /// This server's transport counters.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// True when a connection to `target` exists, open or closing.
    pub fn has_connection_to(&self, target: &TargetId) -> bool {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(target)
    }

    /// True when an open connection to `target` exists.
    pub fn has_open_connection_to(&self, target: &TargetId) -> bool {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .is_some_and(Connection::is_open)
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of the current connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Starts accepting connections. For a local server this registers the
    /// endpoint synchronously; for a socket server the returned result
    /// completes once the listener is bound. Starting a running server
    /// quick-fails.
    pub fn start_server(&self) -> AsyncResult {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return AsyncResult::failed(WireError::Transport(
                constants::ERR_SERVER_RUNNING.into(),
            ));
        }

        match self.inner.exchange.clone() {
            Some(exchange) => {
                let endpoint: Arc<dyn LocalEndpoint> = Arc::new(ServerEndpoint {
                    inner: Arc::downgrade(&self.inner),
                });
                if let Err(e) = exchange.register(self.inner.local_id.clone(), endpoint) {
                    return AsyncResult::failed(e);
                }
                *lifecycle = Lifecycle::Local;
                info!(id = %self.inner.local_id, "local server registered");
                AsyncResult::succeeded()
            }
            None => {
                let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
                *lifecycle = Lifecycle::Network {
                    shutdown: shutdown_tx,
                };
                drop(lifecycle);

                let result = AsyncResult::pending();
                let pending = result.clone();
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    run_listener(inner, shutdown_rx, pending).await;
                });
                result
            }
        }
    }

    /// Stops the server: forcibly closes every open connection, then
    /// releases the listening socket or exchange registration. The returned
    /// action completes when every connection has finished teardown.
    /// Stopping an idle server is a no-op.
    pub fn stop_server(&self) -> AsyncAction {
        let lifecycle = {
            let mut guard = lock(&self.inner.lifecycle);
            std::mem::replace(&mut *guard, Lifecycle::Idle)
        };

        let connections: Vec<Connection> = {
            let mut guard = self
                .inner
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            guard.drain().map(|(_, conn)| conn).collect()
        };
        let teardowns: Vec<AsyncAction> = connections.iter().map(Connection::close).collect();

        match lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Local => {
                if let Some(exchange) = &self.inner.exchange {
                    exchange.unregister(&self.inner.local_id);
                }
                info!(id = %self.inner.local_id, "local server unregistered");
            }
            Lifecycle::Network { shutdown } => {
                let _ = shutdown.try_send(());
                *lock(&self.inner.bound) = None;
            }
        }

        AsyncAction::all(teardowns)
    }

    /// Sends `packet` to the client at `target`. Quick-fails when no such
    /// connection is tracked.
    pub fn send_to_client<P: Packet + Any>(
        &self,
        packet: P,
        target: &TargetId,
    ) -> Result<AsyncResult> {
        let conn = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned();
        match conn {
            None => Ok(AsyncResult::failed(WireError::UnknownTarget(
                target.to_string(),
            ))),
            Some(conn) => conn.send(packet),
        }
    }

    /// Sends `packet` to every tracked client, returning a group over the
    /// per-connection results. The connection set is snapshotted first, so
    /// accepts and closes racing the fan-out do not disturb the iteration.
    pub fn send_to_all_clients<P: Packet + Any>(&self, packet: P) -> Result<AsyncResultGroup> {
        let connections = self.connections();
        let shared: Arc<dyn Packet> = Arc::new(packet);
        let mut results = Vec::with_capacity(connections.len());
        for conn in connections {
            results.push(conn.send_shared(Arc::clone(&shared))?);
        }
        Ok(AsyncResultGroup::new(results))
    }
}

impl std::fmt::Debug for NetworkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkServer")
            .field("local", &self.inner.local_id)
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Accept loop: bind, report the outcome on `pending`, then serve until the
/// shutdown signal arrives.
async fn run_listener(
    inner: Arc<ServerInner>,
    mut shutdown_rx: mpsc::Receiver<()>,
    pending: AsyncResult,
) {
    let listener = match TcpListener::bind(inner.config.server.address.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %inner.config.server.address, error = %e, "failed to bind listener");
            *lock(&inner.lifecycle) = Lifecycle::Idle;
            pending.complete_failure(e.into());
            return;
        }
    };
    match listener.local_addr() {
        Ok(addr) => {
            *lock(&inner.bound) = Some(addr);
            info!(address = %addr, "listening");
        }
        Err(e) => {
            warn!(error = %e, "listener has no local address");
        }
    }
    pending.complete_success();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(id = %inner.local_id, "server shutting down");
                return;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        accept_client(&inner, stream, addr);
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
}

/// Runs the ordered accept hooks for one inbound socket and, on acceptance,
/// wires up its connection.
fn accept_client(inner: &Arc<ServerInner>, stream: TcpStream, addr: SocketAddr) {
    let peer = TargetId::from(addr);

    if connection_count(inner) >= inner.config.server.max_connections {
        warn!(peer = %peer, "{}", constants::ERR_AT_CAPACITY);
        inner.metrics.connection_rejected();
        return;
    }
    if !run_accept_hook(inner, &peer) {
        // Dropping the stream closes the socket before the peer ever
        // reaches OPEN.
        warn!(peer = %peer, "connection attempt rejected");
        inner.metrics.connection_rejected();
        return;
    }
    if let Err(e) = stream.set_nodelay(inner.config.transport.nodelay) {
        warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
    }

    let conn = Connection::new(
        inner.local_id.clone(),
        peer.clone(),
        Role::Server,
        Arc::clone(&inner.registry),
        Arc::clone(&inner.metrics),
    );
    let weak = Arc::downgrade(inner);
    let tracked = peer.clone();
    conn.set_closed_hook(move |c| server_closed(&weak, &tracked, c));

    {
        let mut connections = inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if connections.contains_key(&peer) {
            warn!(peer = %peer, "duplicate connection attempt");
            inner.metrics.connection_rejected();
            return;
        }
        connections.insert(peer.clone(), conn.clone());
    }

    let codec = FrameCodec::with_limit(inner.config.transport.max_payload_size);
    let (outbound, reader) = tcp::spawn_link(stream, codec, conn.clone(), Arc::clone(&inner.handlers));
    conn.set_link(Link::Tcp { outbound, reader });

    run_configure_hook(inner, &conn);
    if conn.mark_open() {
        inner.metrics.connection_established();
        info!(peer = %peer, "client connected");
    }
}

/// Local (in-process) accept path, mirroring [`accept_client`].
fn attempt_local(inner: &Arc<ServerInner>, peer: TargetId) -> Result<()> {
    let Some(exchange) = inner.exchange.clone() else {
        return Err(WireError::Internal(
            "local endpoint without an exchange".into(),
        ));
    };

    if connection_count(inner) >= inner.config.server.max_connections {
        inner.metrics.connection_rejected();
        return Err(WireError::ConnectionRejected(
            constants::ERR_AT_CAPACITY.into(),
        ));
    }
    if !run_accept_hook(inner, &peer) {
        warn!(peer = %peer, "connection attempt rejected");
        inner.metrics.connection_rejected();
        return Err(WireError::ConnectionRejected(format!(
            "{peer} declined by accept hook"
        )));
    }

    let conn = Connection::new(
        inner.local_id.clone(),
        peer.clone(),
        Role::Server,
        Arc::clone(&inner.registry),
        Arc::clone(&inner.metrics),
    );
    conn.set_link(Link::Local(exchange));
    let weak = Arc::downgrade(inner);
    let tracked = peer.clone();
    conn.set_closed_hook(move |c| server_closed(&weak, &tracked, c));

    {
        let mut connections = inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if connections.contains_key(&peer) {
            inner.metrics.connection_rejected();
            return Err(WireError::ConnectionRejected(format!(
                "{peer} is already connected"
            )));
        }
        connections.insert(peer.clone(), conn.clone());
    }

    run_configure_hook(inner, &conn);
    conn.mark_open();
    inner.metrics.connection_established();
    info!(peer = %peer, "client connected");
    Ok(())
}

fn connection_count(inner: &ServerInner) -> usize {
    inner
        .connections
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .len()
}

fn run_accept_hook(inner: &ServerInner, peer: &TargetId) -> bool {
    let hook = inner
        .accept_hook
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    hook.map_or(true, |hook| hook(peer))
}

fn run_configure_hook(inner: &ServerInner, conn: &Connection) {
    let hook = inner
        .configure_hook
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(hook) = hook {
        hook(conn);
    }
}

/// Teardown shared by the solicited and unsolicited close paths.
fn server_closed(weak: &Weak<ServerInner>, peer: &TargetId, connection: &Connection) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    inner
        .connections
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(peer);
    inner.metrics.connection_closed();
    notify_disconnect(&inner.disconnect_handlers, connection);
}

/// The server's receiver in a local exchange.
struct ServerEndpoint {
    inner: Weak<ServerInner>,
}

impl LocalEndpoint for ServerEndpoint {
    fn connection_attempt(&self, peer: TargetId) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(WireError::UnknownTarget("server is gone".into()));
        };
        attempt_local(&inner, peer)
    }

    fn receive(&self, from: TargetId, delivery: LocalDelivery) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let conn = inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&from)
            .cloned();
        let Some(conn) = conn else {
            warn!(sender = %from, "dropping local delivery from unknown peer");
            return;
        };
        deliver_local(&conn, &inner.handlers, &inner.metrics, delivery);
    }

    fn peer_closed(&self, peer: TargetId) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let conn = inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .cloned();
        if let Some(conn) = conn {
            conn.close_from_peer();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
