//! Packet-id mapping registry.
//!
//! Maps small integer wire ids to packet types and their zero-argument
//! factories. Both sides of a logical connection must carry the same
//! id-to-type mapping or decoding fails. Mappings are additive only: they
//! are registered at manager setup time and never removed, so in-flight
//! decodes never race a removal.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::RwLock;

use tracing::warn;

use crate::core::codec::Frame;
use crate::core::packet::Packet;
use crate::core::wire::{PayloadReader, PayloadWriter};
use crate::error::{constants, Result, WireError};

type Factory = Box<dyn Fn() -> Box<dyn Packet> + Send + Sync>;

struct Mapping {
    name: &'static str,
    factory: Factory,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<i32, Mapping>,
    by_type: HashMap<TypeId, i32>,
}

/// Registry of `(id, packet type, factory)` triples shared by the managers
/// and their connections.
#[derive(Default)]
pub struct PacketRegistry {
    inner: RwLock<Inner>,
}

impl PacketRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `P` under `id`, constructing inbound instances with
    /// `P::default()`. Fails with [`WireError::DuplicateMapping`] when `id`
    /// is already registered.
    pub fn add_mapping<P>(&self, id: i32) -> Result<()>
    where
        P: Packet + Default + Any,
    {
        self.add_mapping_with(id, P::default)
    }

    /// Registers `P` under `id` with an explicit zero-argument factory.
    pub fn add_mapping_with<P, F>(&self, id: i32, factory: F) -> Result<()>
    where
        P: Packet + Any,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| WireError::Internal(constants::ERR_REGISTRY_WRITE_LOCK.into()))?;
        if inner.by_id.contains_key(&id) {
            return Err(WireError::DuplicateMapping(id));
        }
        inner.by_id.insert(
            id,
            Mapping {
                name: std::any::type_name::<P>(),
                factory: Box::new(move || Box::new(factory())),
            },
        );
        inner.by_type.insert(TypeId::of::<P>(), id);
        Ok(())
    }

    /// True when `id` has a registered mapping.
    pub fn contains_id(&self, id: i32) -> bool {
        self.inner
            .read()
            .map(|inner| inner.by_id.contains_key(&id))
            .unwrap_or(false)
    }

    /// The wire id registered for `P`, if any.
    pub fn id_for<P: Packet + Any>(&self) -> Option<i32> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.by_type.get(&TypeId::of::<P>()).copied())
    }

    /// Serializes `packet` into a frame. Fails with
    /// [`WireError::UnmappedPacketType`] when the packet's runtime type has
    /// no registered mapping — a programmer error, reported synchronously.
    pub fn encode(&self, packet: &dyn Packet) -> Result<Frame> {
        let id = {
            let inner = self
                .inner
                .read()
                .map_err(|_| WireError::Internal(constants::ERR_REGISTRY_READ_LOCK.into()))?;
            *inner
                .by_type
                .get(&packet.packet_type())
                .ok_or_else(|| WireError::UnmappedPacketType(packet.type_name().to_string()))?
        };
        let mut writer = PayloadWriter::new();
        packet.write_data(&mut writer)?;
        Ok(Frame {
            id,
            payload: writer.into_bytes(),
        })
    }

    /// Reconstructs a packet from `frame`.
    ///
    /// An unknown id is not fatal: the frame is dropped so an older endpoint
    /// tolerates types it does not know, and the skip is surfaced with a
    /// warning. Returns `Ok(None)` in that case. A payload that does not
    /// match the declared length — underrun or trailing bytes after
    /// `read_data` — is a framing error, fatal to the delivering connection.
    pub fn decode(&self, frame: &Frame) -> Result<Option<Box<dyn Packet>>> {
        let mut instance = {
            let inner = self
                .inner
                .read()
                .map_err(|_| WireError::Internal(constants::ERR_REGISTRY_READ_LOCK.into()))?;
            match inner.by_id.get(&frame.id) {
                Some(mapping) => (mapping.factory)(),
                None => {
                    warn!(
                        id = frame.id,
                        bytes = frame.payload.len(),
                        "dropping frame with unknown packet id"
                    );
                    return Ok(None);
                }
            }
        };
        let mut reader = PayloadReader::new(frame.payload.clone());
        instance.read_data(&mut reader)?;
        if reader.remaining() > 0 {
            return Err(WireError::Framing(format!(
                "{} trailing bytes after decoding packet id {}",
                reader.remaining(),
                frame.id
            )));
        }
        Ok(Some(instance))
    }

    /// Diagnostic name of the type mapped to `id`.
    pub fn name_of(&self, id: i32) -> Option<&'static str> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.by_id.get(&id).map(|m| m.name))
    }
}

impl std::fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.read().map(|i| i.by_id.len()).unwrap_or(0);
        f.debug_struct("PacketRegistry")
            .field("mappings", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use bytes::Bytes;

    #[derive(Debug, Default, PartialEq)]
    struct Greeting {
        text: String,
    }

    impl Packet for Greeting {
        fn write_data(&self, writer: &mut PayloadWriter) -> Result<()> {
            writer.write_string(&self.text)
        }

        fn read_data(&mut self, reader: &mut PayloadReader) -> Result<()> {
            self.text = reader.read_string()?;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Unregistered;

    impl Packet for Unregistered {
        fn write_data(&self, _writer: &mut PayloadWriter) -> Result<()> {
            Ok(())
        }

        fn read_data(&mut self, _reader: &mut PayloadReader) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let registry = PacketRegistry::new();
        registry.add_mapping::<Greeting>(1).unwrap();
        assert!(matches!(
            registry.add_mapping::<Greeting>(1),
            Err(WireError::DuplicateMapping(1))
        ));
    }

    #[test]
    fn encode_decode_round_trip() {
        let registry = PacketRegistry::new();
        registry.add_mapping::<Greeting>(5).unwrap();

        let frame = registry
            .encode(&Greeting {
                text: "hello".into(),
            })
            .unwrap();
        assert_eq!(frame.id, 5);

        let decoded = registry.decode(&frame).unwrap().unwrap();
        let greeting = decoded.downcast_ref::<Greeting>().unwrap();
        assert_eq!(greeting.text, "hello");
    }

    #[test]
    fn unmapped_type_fails_encode() {
        let registry = PacketRegistry::new();
        assert!(matches!(
            registry.encode(&Unregistered),
            Err(WireError::UnmappedPacketType(_))
        ));
    }

    #[test]
    fn unknown_id_is_skipped() {
        let registry = PacketRegistry::new();
        let frame = Frame {
            id: 42,
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        assert!(registry.decode(&frame).unwrap().is_none());
    }

    #[test]
    fn trailing_bytes_are_fatal() {
        let registry = PacketRegistry::new();
        registry.add_mapping::<Greeting>(5).unwrap();

        let mut frame = registry
            .encode(&Greeting { text: "hi".into() })
            .unwrap();
        let mut padded = frame.payload.to_vec();
        padded.push(0xFF);
        frame.payload = Bytes::from(padded);

        assert!(matches!(
            registry.decode(&frame),
            Err(WireError::Framing(_))
        ));
    }

    #[test]
    fn truncated_payload_is_fatal() {
        let registry = PacketRegistry::new();
        registry.add_mapping::<Greeting>(5).unwrap();

        let frame = registry
            .encode(&Greeting {
                text: "truncate me".into(),
            })
            .unwrap();
        let truncated = Frame {
            id: frame.id,
            payload: frame.payload.slice(..frame.payload.len() - 2),
        };
        assert!(matches!(
            registry.decode(&truncated),
            Err(WireError::Framing(_))
        ));
    }

    #[test]
    fn custom_factory_is_used() {
        let registry = PacketRegistry::new();
        registry
            .add_mapping_with(9, || Greeting {
                text: "factory".into(),
            })
            .unwrap();
        assert_eq!(registry.id_for::<Greeting>(), Some(9));
        assert_eq!(registry.name_of(9), Some(std::any::type_name::<Greeting>()));
    }
}
