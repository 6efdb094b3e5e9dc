use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Data channel stream identifier, unique per endpoint pair.
pub type ChannelId = u16;

/// EndpointId names one side of the in-process peer pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointId {
    Local,
    Remote,
}

impl EndpointId {
    /// the endpoint on the other side of the pair
    pub fn peer(&self) -> EndpointId {
        match self {
            EndpointId::Local => EndpointId::Remote,
            EndpointId::Remote => EndpointId::Local,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Local => write!(f, "local"),
            EndpointId::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TransportContext {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl TransportContext {
    /// the same four tuple seen from the receiving side
    pub fn reversed(&self) -> Self {
        Self {
            local_addr: self.peer_addr,
            peer_addr: self.local_addr,
        }
    }
}

/// TaggedBytesMut is one datagram together with the time it was produced and its addressing.
#[derive(Debug, Clone)]
pub struct TaggedBytesMut {
    pub now: Instant,
    pub transport: TransportContext,
    pub message: BytesMut,
}
