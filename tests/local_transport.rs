#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end client/server scenarios over the in-process exchange.
//! Local transport calls run synchronously on the caller's thread, so every
//! assertion here can be made immediately after the triggering call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use wirecast::core::wire::{PayloadReader, PayloadWriter};
use wirecast::{
    ConnectionState, DeliveryMode, LocalExchange, NetworkClient, NetworkServer, Packet, TargetId,
    WireError,
};

#[derive(Debug, Default, Clone, PartialEq)]
struct TestPacket {
    data: Vec<u8>,
}

impl TestPacket {
    fn new(data: &[u8]) -> Self {
        TestPacket {
            data: data.to_vec(),
        }
    }
}

impl Packet for TestPacket {
    fn write_data(&self, writer: &mut PayloadWriter) -> wirecast::Result<()> {
        writer.write_i32(self.data.len() as i32);
        writer.write_bytes(&self.data);
        Ok(())
    }

    fn read_data(&mut self, reader: &mut PayloadReader) -> wirecast::Result<()> {
        let len = reader.read_i32()?;
        self.data = reader.read_bytes(len as usize)?.to_vec();
        Ok(())
    }
}

/// A packet with a field deliberately left out of the wire format.
#[derive(Debug, Default)]
struct TaggedPacket {
    data: Vec<u8>,
    /// Not serialized; survives pass-through delivery only.
    local_tag: usize,
}

impl Packet for TaggedPacket {
    fn write_data(&self, writer: &mut PayloadWriter) -> wirecast::Result<()> {
        writer.write_i32(self.data.len() as i32);
        writer.write_bytes(&self.data);
        Ok(())
    }

    fn read_data(&mut self, reader: &mut PayloadReader) -> wirecast::Result<()> {
        let len = reader.read_i32()?;
        self.data = reader.read_bytes(len as usize)?.to_vec();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct UnknownToServer;

impl Packet for UnknownToServer {
    fn write_data(&self, _writer: &mut PayloadWriter) -> wirecast::Result<()> {
        Ok(())
    }

    fn read_data(&mut self, _reader: &mut PayloadReader) -> wirecast::Result<()> {
        Ok(())
    }
}

type Received = Arc<Mutex<Vec<TestPacket>>>;

fn recording_server(name: &str, exchange: Arc<LocalExchange>) -> (NetworkServer, Received) {
    let server = NetworkServer::local(name, exchange);
    server.add_mapping::<TestPacket>(5).unwrap();
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    server.add_packet_handler(move |packet, _ctx| {
        if let Some(p) = packet.downcast_ref::<TestPacket>() {
            sink.lock().unwrap().push(p.clone());
        }
    });
    (server, received)
}

fn connected_client(name: &str, server: &str, exchange: Arc<LocalExchange>) -> NetworkClient {
    let client = NetworkClient::local(name, server, exchange);
    client.add_mapping::<TestPacket>(5).unwrap();
    let opened = client.open_connection();
    assert!(opened.is_done());
    assert!(opened.is_success());
    client
}

#[test]
fn client_packet_reaches_server_byte_for_byte() {
    let exchange = LocalExchange::new();
    let (server, received) = recording_server("srv", exchange.clone());
    assert!(server.start_server().is_success());

    let client = connected_client("alice", "srv", exchange);
    let sent = TestPacket::new(&[32, 67, 123, 231, 193, 5]);
    let result = client.send_to_server(sent.clone()).unwrap();
    assert!(result.is_done());
    assert!(result.is_success());

    let received = received.lock().unwrap();
    assert_eq!(received.as_slice(), &[sent]);
}

#[test]
fn rejected_connection_leaves_no_trace() {
    let exchange = LocalExchange::new();
    let (server, _received) = recording_server("srv", exchange.clone());
    server.set_accept_hook(|_| false);
    assert!(server.start_server().is_success());

    let client = NetworkClient::local("mallory", "srv", exchange);
    client.add_mapping::<TestPacket>(5).unwrap();
    let opened = client.open_connection();
    assert!(opened.is_done());
    assert!(!opened.is_success());
    assert!(matches!(
        opened.error().as_deref(),
        Some(WireError::ConnectionRejected(_))
    ));
    assert_eq!(server.connection_count(), 0);
    assert!(!client.is_connected());
    assert!(client.connection().is_none());
    assert_eq!(server.metrics().snapshot().connections_rejected, 1);
}

#[test]
fn packets_arrive_in_send_order() {
    let exchange = LocalExchange::new();
    let (server, received) = recording_server("srv", exchange.clone());
    server.start_server();

    let client = connected_client("alice", "srv", exchange);
    let a = TestPacket::new(b"A");
    let b = TestPacket::new(b"B");
    client.send_to_server(a.clone()).unwrap();
    client.send_to_server(b.clone()).unwrap();

    assert_eq!(received.lock().unwrap().as_slice(), &[a, b]);
}

#[test]
fn server_replies_through_the_packet_context() {
    let exchange = LocalExchange::new();
    let server = NetworkServer::local("srv", exchange.clone());
    server.add_mapping::<TestPacket>(5).unwrap();
    server.add_packet_handler(|packet, ctx| {
        assert!(ctx.is_server());
        if let Some(p) = packet.downcast_ref::<TestPacket>() {
            let mut echoed = p.data.clone();
            echoed.reverse();
            ctx.connection()
                .send(TestPacket { data: echoed })
                .unwrap();
        }
    });
    server.start_server();

    let client = NetworkClient::local("alice", "srv", exchange);
    client.add_mapping::<TestPacket>(5).unwrap();
    let replies: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    client.add_packet_handler(move |packet, ctx| {
        assert!(ctx.is_client());
        if let Some(p) = packet.downcast_ref::<TestPacket>() {
            sink.lock().unwrap().push(p.clone());
        }
    });
    client.open_connection();

    client.send_to_server(TestPacket::new(&[1, 2, 3])).unwrap();
    assert_eq!(
        replies.lock().unwrap().as_slice(),
        &[TestPacket::new(&[3, 2, 1])]
    );
}

#[test]
fn configure_hook_attaches_the_connection_payload() {
    struct Player {
        name: &'static str,
    }

    let exchange = LocalExchange::new();
    let server = NetworkServer::local("srv", exchange.clone());
    server.add_mapping::<TestPacket>(5).unwrap();
    server.set_configure_hook(|conn| {
        conn.set_attachment(Player { name: "alice" });
    });

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    server.add_packet_handler(move |_packet, ctx| {
        let player = ctx.attachment_of::<Player>().expect("payload attached");
        assert_eq!(player.name, "alice");
        counter.fetch_add(1, Ordering::SeqCst);
    });
    server.start_server();

    let client = connected_client("alice", "srv", exchange);
    client.send_to_server(TestPacket::new(b"hi")).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn close_is_observed_by_the_server() {
    let exchange = LocalExchange::new();
    let (server, _received) = recording_server("srv", exchange.clone());
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    server.add_disconnect_handler(move |_conn| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    server.start_server();

    let client = connected_client("alice", "srv", exchange);
    let alice = TargetId::local("alice");
    assert!(server.has_connection_to(&alice));
    assert!(server.has_open_connection_to(&alice));

    let closed = client.close_connection();
    assert!(closed.is_done());
    assert!(!server.has_connection_to(&alice));
    assert_eq!(server.connection_count(), 0);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn send_on_closed_connection_quick_fails() {
    let exchange = LocalExchange::new();
    let (server, received) = recording_server("srv", exchange.clone());
    server.start_server();

    let client = connected_client("alice", "srv", exchange);
    client.close_connection();

    let result = client.send_to_server(TestPacket::new(b"late")).unwrap();
    assert!(result.is_done());
    assert!(!result.is_success());
    assert!(matches!(
        result.error().as_deref(),
        Some(WireError::InvalidState {
            operation: "send",
            state: "CLOSED"
        })
    ));
    // The transport was never touched.
    assert!(received.lock().unwrap().is_empty());
}

#[test]
fn reopening_a_closed_client_quick_fails() {
    let exchange = LocalExchange::new();
    let (server, _received) = recording_server("srv", exchange.clone());
    server.start_server();

    let client = connected_client("alice", "srv", exchange);
    client.close_connection();
    assert_eq!(
        client.connection().unwrap().state(),
        ConnectionState::Closed
    );

    let reopened = client.open_connection();
    assert!(reopened.is_done());
    assert!(!reopened.is_success());
}

#[test]
fn stop_server_closes_every_client() {
    let exchange = LocalExchange::new();
    let (server, _received) = recording_server("srv", exchange.clone());
    server.start_server();

    let alice = connected_client("alice", "srv", exchange.clone());
    let bob = connected_client("bob", "srv", exchange.clone());
    let alice_drops = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&alice_drops);
    alice.add_disconnect_handler(move |_conn| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(server.connection_count(), 2);

    let stopped = server.stop_server();
    assert!(stopped.is_done());
    assert!(!server.is_running());
    assert_eq!(server.connection_count(), 0);
    assert!(!alice.is_connected());
    assert!(!bob.is_connected());
    assert_eq!(alice_drops.load(Ordering::SeqCst), 1);

    // The name is free again: a fresh client can no longer reach it.
    let late = NetworkClient::local("carol", "srv", exchange);
    let opened = late.open_connection();
    assert!(opened.is_done());
    assert!(!opened.is_success());
    assert!(matches!(
        opened.error().as_deref(),
        Some(WireError::UnknownTarget(_))
    ));
}

#[test]
fn duplicate_client_name_cannot_register() {
    let exchange = LocalExchange::new();
    let (server, _received) = recording_server("srv", exchange.clone());
    server.start_server();

    let _first = connected_client("alice", "srv", exchange.clone());
    let second = NetworkClient::local("alice", "srv", exchange);
    second.add_mapping::<TestPacket>(5).unwrap();
    let opened = second.open_connection();
    assert!(opened.is_done());
    assert!(!opened.is_success());
}

#[test]
fn pass_through_hands_over_the_same_instance() {
    let exchange = LocalExchange::with_mode(DeliveryMode::PassThrough);
    assert_eq!(exchange.mode(), DeliveryMode::PassThrough);

    let server = NetworkServer::local("srv", exchange.clone());
    server.add_mapping::<TaggedPacket>(7).unwrap();
    let tags = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&tags);
    server.add_packet_handler(move |packet, _ctx| {
        if let Some(p) = packet.downcast_ref::<TaggedPacket>() {
            sink.lock().unwrap().push(p.local_tag);
        }
    });
    server.start_server();

    let client = NetworkClient::local("alice", "srv", exchange);
    client.add_mapping::<TaggedPacket>(7).unwrap();
    client.open_connection();
    client
        .send_to_server(TaggedPacket {
            data: vec![1],
            local_tag: 99,
        })
        .unwrap();

    // The unserialized field survives: the receiver saw the sent instance.
    assert_eq!(tags.lock().unwrap().as_slice(), &[99]);
}

#[test]
fn copy_mode_loses_fields_outside_the_wire_format() {
    let exchange = LocalExchange::with_mode(DeliveryMode::CopyViaCodec);

    let server = NetworkServer::local("srv", exchange.clone());
    server.add_mapping::<TaggedPacket>(7).unwrap();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    server.add_packet_handler(move |packet, _ctx| {
        if let Some(p) = packet.downcast_ref::<TaggedPacket>() {
            sink.lock().unwrap().push((p.data.clone(), p.local_tag));
        }
    });
    server.start_server();

    let client = NetworkClient::local("alice", "srv", exchange);
    client.add_mapping::<TaggedPacket>(7).unwrap();
    client.open_connection();
    client
        .send_to_server(TaggedPacket {
            data: vec![4, 5],
            local_tag: 99,
        })
        .unwrap();

    // Serialized data round-trips; the tag matches real network behavior
    // and is reset to its default.
    assert_eq!(observed.lock().unwrap().as_slice(), &[(vec![4, 5], 0)]);
}

#[test]
fn unknown_packet_id_is_skipped_not_fatal() {
    let exchange = LocalExchange::new();
    let (server, received) = recording_server("srv", exchange.clone());
    server.start_server();

    let client = NetworkClient::local("alice", "srv", exchange);
    client.add_mapping::<TestPacket>(5).unwrap();
    client.add_mapping::<UnknownToServer>(9).unwrap();
    client.open_connection();

    // The server has no mapping for id 9: the frame is dropped, counted,
    // and the connection stays usable.
    let result = client.send_to_server(UnknownToServer).unwrap();
    assert!(result.is_success());
    assert!(received.lock().unwrap().is_empty());
    assert_eq!(server.metrics().snapshot().unknown_packet_ids, 1);
    assert!(client.is_connected());

    let follow_up = TestPacket::new(b"still here");
    client.send_to_server(follow_up.clone()).unwrap();
    assert_eq!(received.lock().unwrap().as_slice(), &[follow_up]);
}

#[test]
fn unmapped_packet_type_is_a_synchronous_error() {
    let exchange = LocalExchange::new();
    let (server, _received) = recording_server("srv", exchange.clone());
    server.start_server();

    let client = NetworkClient::local("alice", "srv", exchange);
    client.add_mapping::<TestPacket>(5).unwrap();
    client.open_connection();

    let err = client
        .send_to_server(UnknownToServer)
        .expect_err("no mapping registered");
    assert!(matches!(err, WireError::UnmappedPacketType(_)));
}

#[test]
fn broadcast_reaches_every_client() {
    let exchange = LocalExchange::new();
    let server = NetworkServer::local("srv", exchange.clone());
    server.add_mapping::<TestPacket>(5).unwrap();
    server.start_server();

    let mut inboxes = Vec::new();
    let mut clients = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let client = NetworkClient::local(name, "srv", exchange.clone());
        client.add_mapping::<TestPacket>(5).unwrap();
        let inbox: Received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        client.add_packet_handler(move |packet, _ctx| {
            if let Some(p) = packet.downcast_ref::<TestPacket>() {
                sink.lock().unwrap().push(p.clone());
            }
        });
        assert!(client.open_connection().is_success());
        inboxes.push(inbox);
        clients.push(client);
    }

    let news = TestPacket::new(b"to everyone");
    let group = server.send_to_all_clients(news.clone()).unwrap();
    assert!(group.is_done());
    assert_eq!(group.len(), 3);
    assert_eq!(group.success_count(), 3);
    assert_eq!(group.failure_count(), 0);

    for inbox in &inboxes {
        assert_eq!(inbox.lock().unwrap().as_slice(), &[news.clone()]);
    }

    // An empty server broadcasts to nobody, immediately done.
    server.stop_server();
    server.start_server();
    let group = server.send_to_all_clients(news).unwrap();
    assert!(group.is_done());
    assert!(group.is_empty());
}

#[test]
fn metrics_count_frames_both_ways() {
    let exchange = LocalExchange::new();
    let (server, _received) = recording_server("srv", exchange.clone());
    server.start_server();

    let client = connected_client("alice", "srv", exchange);
    client.send_to_server(TestPacket::new(b"one")).unwrap();
    client.send_to_server(TestPacket::new(b"two")).unwrap();

    let client_stats = client.metrics().snapshot();
    assert_eq!(client_stats.frames_sent, 2);
    assert_eq!(client_stats.connections_total, 1);

    let server_stats = server.metrics().snapshot();
    assert_eq!(server_stats.frames_received, 2);
    assert_eq!(server_stats.connections_active, 1);
}
