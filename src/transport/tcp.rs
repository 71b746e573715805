//! Socket transport.
//!
//! Each socket-backed connection runs two transport-owned tasks: a writer
//! draining an ordered outbound queue (send order on one connection is
//! delivery order) and a reader decoding inbound frames and handing packets
//! to the manager's dispatch. A write failure fails only the send it
//! belonged to; a read failure, end-of-stream, or framing error forces the
//! connection closed.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use crate::completion::{AsyncAction, AsyncResult};
use crate::connection::{Connection, PacketContext};
use crate::core::codec::{Frame, FrameCodec};
use crate::error::{Result, WireError};
use crate::service::HandlerList;
use crate::target::TargetId;
use crate::utils::timeout::with_timeout_error;

/// Work items for a connection's writer task.
pub(crate) enum Outbound {
    /// Write one frame, then complete the result.
    Frame(Frame, AsyncResult),
    /// Flush, shut the sink down, complete the action, and exit.
    Shutdown(AsyncAction),
}

/// Resolves a network target to a connectable address.
pub(crate) async fn resolve(target: &TargetId) -> Result<SocketAddr> {
    match target {
        TargetId::Network { host, port } => {
            let mut addrs = lookup_host((host.as_str(), *port)).await?;
            addrs
                .next()
                .ok_or_else(|| WireError::UnknownTarget(target.to_string()))
        }
        TargetId::Local(_) => Err(WireError::UnknownTarget(format!(
            "{target} is not a network target"
        ))),
    }
}

/// Opens a TCP connection to `addr` under `timeout`.
pub(crate) async fn connect(
    addr: SocketAddr,
    timeout: Duration,
    nodelay: bool,
) -> Result<TcpStream> {
    let stream = with_timeout_error(
        async { TcpStream::connect(addr).await.map_err(WireError::from) },
        timeout,
    )
    .await?;
    stream.set_nodelay(nodelay)?;
    Ok(stream)
}

/// Spawns the writer and reader tasks for one socket-backed connection.
/// Returns the outbound queue and the reader handle for the connection's
/// transport link.
pub(crate) fn spawn_link(
    stream: TcpStream,
    codec: FrameCodec,
    connection: Connection,
    handlers: HandlerList,
) -> (mpsc::UnboundedSender<Outbound>, JoinHandle<()>) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let (mut sink, mut source) = Framed::new(stream, codec).split();

    tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            match item {
                Outbound::Frame(frame, result) => match sink.send(frame).await {
                    Ok(()) => {
                        result.complete_success();
                    }
                    Err(e) => {
                        warn!(error = %e, "frame write failed");
                        result.complete_failure(e);
                    }
                },
                Outbound::Shutdown(action) => {
                    if let Err(e) = sink.close().await {
                        debug!(error = %e, "error shutting down transport sink");
                    }
                    action.complete();
                    break;
                }
            }
        }
    });

    let reader = tokio::spawn(async move {
        let registry = connection.registry();
        let metrics = connection.metrics();
        loop {
            match source.next().await {
                Some(Ok(frame)) => {
                    metrics.frame_received(frame.payload.len() as u64);
                    match registry.decode(&frame) {
                        Ok(Some(packet)) => {
                            let ctx = PacketContext::new(connection.clone());
                            crate::service::dispatch(&handlers, packet.as_ref(), &ctx);
                        }
                        Ok(None) => {
                            metrics.unknown_packet_id();
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                peer = %connection.remote_id(),
                                "fatal decode error on inbound frame"
                            );
                            metrics.framing_error();
                            connection.force_close("framing error");
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, peer = %connection.remote_id(), "transport read failed");
                    connection.force_close("read error");
                    break;
                }
                None => {
                    debug!(peer = %connection.remote_id(), "peer closed the connection");
                    connection.force_close("end of stream");
                    break;
                }
            }
        }
    });

    (outbound_tx, reader)
}
