//! The typed message contract.
//!
//! A [`Packet`] is a self-describing message. `write_data` serializes its
//! fields; `read_data` populates an already-constructed (typically
//! default-constructed) instance from a reader positioned at the payload
//! start. The framework never inspects packet content, only identity: the
//! concrete type's `TypeId` keys the encode path in the
//! [`PacketRegistry`](crate::core::registry::PacketRegistry).

use std::any::{Any, TypeId};
use std::fmt;

use crate::core::wire::{PayloadReader, PayloadWriter};
use crate::error::Result;

/// Upcast helper so `dyn Packet` values expose their concrete type.
pub trait AsAny {
    /// The value as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// The concrete type's name, for diagnostics.
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A typed, self-describing message carried over a connection.
pub trait Packet: AsAny + Send + Sync + fmt::Debug {
    /// Serializes this packet's fields.
    fn write_data(&self, writer: &mut PayloadWriter) -> Result<()>;

    /// Populates this instance from a reader bounded to the payload.
    fn read_data(&mut self, reader: &mut PayloadReader) -> Result<()>;
}

impl dyn Packet + '_ {
    /// The concrete runtime type of this packet.
    pub fn packet_type(&self) -> TypeId {
        self.as_any().type_id()
    }

    /// Typed view of this packet, if it is a `P`.
    pub fn downcast_ref<P: Packet + Any>(&self) -> Option<&P> {
        self.as_any().downcast_ref::<P>()
    }
}
