//! # Error Types
//!
//! Error handling for the messaging framework.
//!
//! This module defines every error that can surface from framing, connection
//! management, and the manager APIs.
//!
//! ## Error Categories
//! - **I/O Errors**: socket and file system failures
//! - **Framing Errors**: malformed or truncated frames, length mismatches
//! - **Registry Errors**: duplicate or missing packet-id mappings
//! - **Connection Errors**: state violations, rejections, unexpected closes
//!
//! Errors tied to a single asynchronous operation (one send, one connect
//! attempt) are never thrown across threads; they are captured on that
//! operation's [`AsyncResult`](crate::completion::AsyncResult). Only
//! programmer errors — registering a duplicate packet id, sending a packet
//! type with no mapping — are returned synchronously to the caller.
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common cases.
pub mod constants {
    /// Registry lock errors
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on packet registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on packet registry";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECT_IN_PROGRESS: &str = "Connection attempt already in progress";
    pub const ERR_TIMEOUT: &str = "Operation timed out";

    /// Transport errors
    pub const ERR_WRITER_GONE: &str = "Transport writer task is no longer running";
    pub const ERR_PEER_REMOVED: &str = "Local peer endpoint was removed";

    /// Server lifecycle errors
    pub const ERR_SERVER_RUNNING: &str = "Server is already running";
    pub const ERR_SERVER_STOPPED: &str = "Server is not running";
    pub const ERR_AT_CAPACITY: &str = "Server connection limit reached";
}

/// Primary error type for all framework operations.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("packet id {0} is already mapped")]
    DuplicateMapping(i32),

    #[error("no mapping registered for packet type {0}")]
    UnmappedPacketType(String),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("{operation} not valid while connection is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Type alias for Results using WireError
pub type Result<T> = std::result::Result<T, WireError>;
