use crate::endpoint::candidate::RTCIceCandidateInit;
use crate::endpoint::state::RTCPeerConnectionState;
use crate::types::{ChannelId, EndpointId};
use bytes::BytesMut;
use sctp::PayloadProtocolIdentifier;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum DataChannelMessageType {
    None,
    Control,
    Binary,
    Text,
}

pub(crate) fn to_data_message_type(ppid: PayloadProtocolIdentifier) -> DataChannelMessageType {
    match ppid {
        PayloadProtocolIdentifier::Dcep => DataChannelMessageType::Control,
        PayloadProtocolIdentifier::String | PayloadProtocolIdentifier::StringEmpty => {
            DataChannelMessageType::Text
        }
        PayloadProtocolIdentifier::Binary | PayloadProtocolIdentifier::BinaryEmpty => {
            DataChannelMessageType::Binary
        }
        _ => DataChannelMessageType::None,
    }
}

pub(crate) fn to_ppid(message_type: DataChannelMessageType, length: usize) -> PayloadProtocolIdentifier {
    match message_type {
        DataChannelMessageType::Text => {
            if length > 0 {
                PayloadProtocolIdentifier::String
            } else {
                PayloadProtocolIdentifier::StringEmpty
            }
        }
        DataChannelMessageType::Binary => {
            if length > 0 {
                PayloadProtocolIdentifier::Binary
            } else {
                PayloadProtocolIdentifier::BinaryEmpty
            }
        }
        _ => PayloadProtocolIdentifier::Dcep,
    }
}

/// ChannelHandle identifies a data channel to the router and the orchestrator.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelHandle {
    pub endpoint_id: EndpointId,
    pub channel_id: ChannelId,
    pub label: String,
    pub ordered: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DataChannelEvent {
    Open,
    Message { is_string: bool, data: BytesMut },
    Close,
    Error(String),
}

/// PeerEvent is everything a PeerEndpoint reports to its owner.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PeerEvent {
    /// a locally gathered candidate to be trickled to the peer
    IceCandidate(RTCIceCandidateInit),
    /// gathering finished; consumers must not rely on seeing it
    IceGatheringComplete,
    ConnectionStateChange(RTCPeerConnectionState),
    /// the peer opened a channel; delivered once per channel
    ChannelAnnounced(ChannelHandle),
    DataChannel(ChannelId, DataChannelEvent),
}
