//! In-process loopback transport.
//!
//! A [`LocalExchange`] is a directory mapping target identifiers to packet
//! receivers, used to compose a client and server in one process without
//! sockets — primarily for tests and single-process deployments. It is an
//! injectable object, never a process-wide singleton: every test can build
//! an isolated instance.
//!
//! Delivery policy is chosen per exchange:
//! - [`DeliveryMode::PassThrough`] hands the sent packet instance itself to
//!   the receiver. Fastest; receivers see the identical instance. Handlers
//!   only ever get a shared reference, so the instance cannot be mutated
//!   after delivery.
//! - [`DeliveryMode::CopyViaCodec`] serializes with the sender's registry
//!   and deserializes with the receiver's, faithfully reproducing a real
//!   socket: any field not covered by `write_data`/`read_data` is lost.
//!
//! Deliveries to a target with no registered receiver are never silently
//! dropped: they are logged and handed to a default receiver so misrouted
//! traffic stays observable.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::codec::Frame;
use crate::core::packet::Packet;
use crate::error::{Result, WireError};
use crate::target::TargetId;

/// Per-exchange delivery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Hand the exact packet instance to the receiver.
    PassThrough,
    /// Serialize and immediately deserialize into a fresh instance,
    /// matching real network behavior.
    #[default]
    CopyViaCodec,
}

/// One in-process delivery.
pub(crate) enum LocalDelivery {
    /// Pass-through: the sender's instance, shared.
    Shared(Arc<dyn Packet>),
    /// Copy mode: the encoded frame, decoded with the receiver's registry.
    Encoded(Frame),
}

/// A party reachable through the exchange. Implemented by the managers.
pub(crate) trait LocalEndpoint: Send + Sync {
    /// A peer asks to open a connection to this endpoint.
    fn connection_attempt(&self, peer: TargetId) -> Result<()>;

    /// A packet delivery from `from`.
    fn receive(&self, from: TargetId, delivery: LocalDelivery);

    /// The peer at `peer` closed its side.
    fn peer_closed(&self, peer: TargetId);
}

type DefaultReceiver = Box<dyn Fn(&TargetId, &TargetId) + Send + Sync>;

/// Process-local directory of packet receivers keyed by target identifier.
pub struct LocalExchange {
    mode: DeliveryMode,
    endpoints: RwLock<HashMap<TargetId, Arc<dyn LocalEndpoint>>>,
    default_receiver: RwLock<Option<DefaultReceiver>>,
}

impl LocalExchange {
    /// Creates an exchange with the default (copy-via-codec) delivery mode.
    pub fn new() -> Arc<Self> {
        Self::with_mode(DeliveryMode::default())
    }

    /// Creates an exchange with an explicit delivery mode.
    pub fn with_mode(mode: DeliveryMode) -> Arc<Self> {
        Arc::new(LocalExchange {
            mode,
            endpoints: RwLock::new(HashMap::new()),
            default_receiver: RwLock::new(None),
        })
    }

    /// This exchange's delivery policy.
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// True when `id` currently has a registered receiver.
    pub fn is_registered(&self, id: &TargetId) -> bool {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Replaces the default receiver invoked for unroutable deliveries.
    /// The callback receives `(target, sender)`.
    pub fn set_default_receiver(
        &self,
        receiver: impl Fn(&TargetId, &TargetId) + Send + Sync + 'static,
    ) {
        *self
            .default_receiver
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(receiver));
    }

    pub(crate) fn register(&self, id: TargetId, endpoint: Arc<dyn LocalEndpoint>) -> Result<()> {
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(&id) {
            return Err(WireError::Transport(format!(
                "local target {id} is already registered"
            )));
        }
        endpoints.insert(id, endpoint);
        Ok(())
    }

    pub(crate) fn unregister(&self, id: &TargetId) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub(crate) fn lookup(&self, id: &TargetId) -> Option<Arc<dyn LocalEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Surfaces a delivery whose target has no receiver.
    pub(crate) fn deliver_unroutable(&self, to: &TargetId, from: &TargetId) {
        warn!(target = %to, sender = %from, "no receiver registered for local target");
        let receiver = self
            .default_receiver
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(receiver) = receiver.as_ref() {
            receiver(to, from);
        }
    }
}

impl std::fmt::Debug for LocalExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered = self
            .endpoints
            .read()
            .map(|e| e.len())
            .unwrap_or(0);
        f.debug_struct("LocalExchange")
            .field("mode", &self.mode)
            .field("registered", &registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Mutex;

    #[test]
    fn unroutable_deliveries_reach_the_default_receiver() {
        let exchange = LocalExchange::new();
        let seen: Arc<Mutex<Vec<(TargetId, TargetId)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        exchange.set_default_receiver(move |to, from| {
            sink.lock().unwrap().push((to.clone(), from.clone()));
        });

        let to = TargetId::local("nobody");
        let from = TargetId::local("sender");
        exchange.deliver_unroutable(&to, &from);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(to, from)]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        struct Sink;
        impl LocalEndpoint for Sink {
            fn connection_attempt(&self, _peer: TargetId) -> Result<()> {
                Ok(())
            }
            fn receive(&self, _from: TargetId, _delivery: LocalDelivery) {}
            fn peer_closed(&self, _peer: TargetId) {}
        }

        let exchange = LocalExchange::new();
        let id = TargetId::local("svc");
        exchange.register(id.clone(), Arc::new(Sink)).unwrap();
        assert!(exchange.register(id.clone(), Arc::new(Sink)).is_err());
        assert!(exchange.is_registered(&id));
        exchange.unregister(&id);
        assert!(!exchange.is_registered(&id));
    }
}
