use std::fmt;

/// PeerConnectionState indicates the state of a PeerEndpoint.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RTCPeerConnectionState {
    /// nothing negotiated yet, channels may still be created
    #[default]
    New,
    /// an offer was created or received and connectivity is pending
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl fmt::Display for RTCPeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RTCPeerConnectionState::New => "new",
            RTCPeerConnectionState::Negotiating => "negotiating",
            RTCPeerConnectionState::Connected => "connected",
            RTCPeerConnectionState::Closed => "closed",
            RTCPeerConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl RTCPeerConnectionState {
    /// closed and failed endpoints accept no further negotiation input
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
        )
    }
}

/// SignalingState indicates where the endpoint is in the offer/answer exchange.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RTCSignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

impl fmt::Display for RTCSignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RTCSignalingState::Stable => "stable",
            RTCSignalingState::HaveLocalOffer => "have-local-offer",
            RTCSignalingState::HaveRemoteOffer => "have-remote-offer",
        };
        write!(f, "{s}")
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RTCIceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

impl fmt::Display for RTCIceGatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RTCIceGatheringState::New => "new",
            RTCIceGatheringState::Gathering => "gathering",
            RTCIceGatheringState::Complete => "complete",
        };
        write!(f, "{s}")
    }
}
