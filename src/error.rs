use crate::types::{ChannelId, EndpointId};
use std::time::Duration;
use thiserror::Error;

/// Error is the taxonomy surfaced by every peerlink operation.
#[derive(Debug, Error)]
pub enum Error {
    /// operation called out of sequence
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// malformed or unusable ICE candidate
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// send attempted on a channel that is not open
    #[error("channel {0:?} is not open")]
    ChannelNotOpen(Option<ChannelId>),

    /// description exchange rejected by either side
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// ICE never completed within the bounded interval
    #[error("connectivity not established within {0:?}")]
    ConnectivityTimeout(Duration),

    /// the endpoint task is gone, usually because the pair was closed
    #[error("endpoint {0} is closed")]
    EndpointClosed(EndpointId),

    /// the relay has no live mailbox for the endpoint
    #[error("signaling relay has no route to {0}")]
    SignalingUnavailable(EndpointId),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] shared::error::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub(crate) fn invalid_candidate(msg: impl Into<String>) -> Self {
        Self::InvalidCandidate(msg.into())
    }

    pub(crate) fn negotiation_failed(msg: impl Into<String>) -> Self {
        Self::NegotiationFailed(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(shared::error::Error::Other(msg.into()))
    }

    /// local protocol faults that move the pair to failed
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            Error::InvalidState(_) | Error::InvalidCandidate(_) | Error::NegotiationFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
