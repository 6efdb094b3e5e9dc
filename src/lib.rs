#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub(crate) mod certificate;
pub mod configs;
pub(crate) mod data_channel;
pub(crate) mod description;
pub(crate) mod endpoint;
pub(crate) mod error;
pub(crate) mod messages;
pub(crate) mod metrics;
pub(crate) mod orchestrator;
pub(crate) mod router;
pub(crate) mod signal;
pub(crate) mod transport;
pub(crate) mod types;

pub use certificate::{RTCCertificate, RTCDtlsFingerprint};
pub use configs::{endpoint_config::EndpointConfig, session_config::SessionConfig};
pub use data_channel::{DataChannelConfig, RTCDataChannelState, DEFAULT_LABEL};
pub use description::{RTCSdpType, RTCSessionDescription};
pub use endpoint::{
    candidate::{RTCIceCandidate, RTCIceCandidateInit, RTCIceCandidateType, RTCIceParameters},
    state::{RTCIceGatheringState, RTCPeerConnectionState, RTCSignalingState},
    PeerEndpoint,
};
pub use error::{Error, Result};
pub use messages::{ChannelHandle, DataChannelEvent, PeerEvent};
pub use orchestrator::{NegotiationState, Orchestrator};
pub use router::{MessageLog, MessageRouter};
pub use signal::{InProcessRelay, Relay, RelayInbox, SignalMessage};
pub use transport::LoopbackNetwork;
pub use types::{ChannelId, EndpointId, TaggedBytesMut, TransportContext};
