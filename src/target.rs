//! Endpoint identity.
//!
//! A [`TargetId`] names one endpoint of a connection. Local identifiers are
//! process-unique names used by the in-process exchange; network identifiers
//! are host/port pairs resolved to a socket address at connect time.
//! Identifiers are immutable and compared by kind plus value — a local and a
//! network identifier never compare equal.

use std::fmt;
use std::net::SocketAddr;

use crate::error::{Result, WireError};

/// Identity of a connectable endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetId {
    /// A process-unique name dispatched through a
    /// [`LocalExchange`](crate::transport::local::LocalExchange).
    Local(String),
    /// A host/port pair reachable over TCP.
    Network {
        /// Hostname or IP literal.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl TargetId {
    /// Builds a local identifier.
    pub fn local(name: impl Into<String>) -> Self {
        TargetId::Local(name.into())
    }

    /// Builds a network identifier.
    pub fn network(host: impl Into<String>, port: u16) -> Self {
        TargetId::Network {
            host: host.into(),
            port,
        }
    }

    /// Parses the `host:port` address form used in configuration files.
    pub fn parse_network(address: &str) -> Result<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| WireError::Config(format!("invalid address '{address}': missing port")))?;
        if host.is_empty() {
            return Err(WireError::Config(format!(
                "invalid address '{address}': empty host"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| WireError::Config(format!("invalid address '{address}': bad port")))?;
        Ok(TargetId::network(host, port))
    }

    /// Returns true for the local (in-process) kind.
    pub fn is_local(&self) -> bool {
        matches!(self, TargetId::Local(_))
    }

    /// Returns true for the network kind.
    pub fn is_network(&self) -> bool {
        matches!(self, TargetId::Network { .. })
    }
}

impl From<SocketAddr> for TargetId {
    fn from(addr: SocketAddr) -> Self {
        TargetId::Network {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::Local(name) => write!(f, "local:{name}"),
            TargetId::Network { host, port } => write!(f, "{host}:{port}"),
        }
    }
}
