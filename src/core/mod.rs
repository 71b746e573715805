//! # Core Protocol Components
//!
//! Low-level packet contract, payload codec, frame codec, and the id
//! registry.
//!
//! ## Wire Format
//! ```text
//! [Id(4, i32)] [Length(4, i32)] [Payload(N)]
//! ```
//!
//! There is deliberately no version byte and no checksum in the frame; the
//! id is resolved against the [`registry::PacketRegistry`] on the receiving
//! side, and unknown ids are skipped rather than treated as fatal.
//!
//! ## Safety
//! - Maximum payload size enforced before allocation (default 16MB)
//! - Declared lengths validated against the buffered bytes
//! - Length mismatches after decode are fatal to the delivering connection

pub mod codec;
pub mod packet;
pub mod registry;
pub mod wire;
