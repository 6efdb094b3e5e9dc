use crate::error::{Error, Result};
use crate::types::ChannelId;
use datachannel::message::message_channel_open::{ChannelType, DataChannelOpen};
use sctp::ReliabilityType;
use std::fmt;

pub const DEFAULT_LABEL: &str = "messaging-channel";

/// DataChannelConfig can be used to configure properties of the underlying
/// channel such as data reliability.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataChannelConfig {
    pub label: String,
    pub protocol: String,
    pub ordered: bool,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_owned(),
            protocol: String::new(),
            ordered: true,
            max_packet_life_time: None,
            max_retransmits: None,
        }
    }
}

impl DataChannelConfig {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn with_max_retransmits(mut self, max_retransmits: Option<u16>) -> Self {
        self.max_retransmits = max_retransmits;
        self
    }

    pub fn with_max_packet_life_time(mut self, max_packet_life_time: Option<u16>) -> Self {
        self.max_packet_life_time = max_packet_life_time;
        self
    }

    fn channel_type(&self) -> (ChannelType, u32) {
        match (self.max_retransmits, self.max_packet_life_time, self.ordered) {
            (Some(rexmit), _, true) => (ChannelType::PartialReliableRexmit, rexmit as u32),
            (Some(rexmit), _, false) => {
                (ChannelType::PartialReliableRexmitUnordered, rexmit as u32)
            }
            (None, Some(millis), true) => (ChannelType::PartialReliableTimed, millis as u32),
            (None, Some(millis), false) => {
                (ChannelType::PartialReliableTimedUnordered, millis as u32)
            }
            (None, None, true) => (ChannelType::Reliable, 0),
            (None, None, false) => (ChannelType::ReliableUnordered, 0),
        }
    }

    fn from_open(open: &DataChannelOpen) -> Self {
        let parameter = open.reliability_parameter.min(u16::MAX as u32) as u16;
        let (ordered, max_retransmits, max_packet_life_time) = match open.channel_type {
            ChannelType::Reliable => (true, None, None),
            ChannelType::ReliableUnordered => (false, None, None),
            ChannelType::PartialReliableRexmit => (true, Some(parameter), None),
            ChannelType::PartialReliableRexmitUnordered => (false, Some(parameter), None),
            ChannelType::PartialReliableTimed => (true, None, Some(parameter)),
            ChannelType::PartialReliableTimedUnordered => (false, None, Some(parameter)),
        };

        Self {
            label: String::from_utf8_lossy(&open.label).into_owned(),
            protocol: String::from_utf8_lossy(&open.protocol).into_owned(),
            ordered,
            max_packet_life_time,
            max_retransmits,
        }
    }
}

/// DataChannelState indicates the state of a data channel.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RTCDataChannelState {
    /// the channel waits for the transport or for the peer's acknowledgement
    #[default]
    Connecting,
    Open,
    /// a local close was requested and the stream reset is in flight
    Closing,
    Closed,
    Errored,
}

impl fmt::Display for RTCDataChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RTCDataChannelState::Connecting => "connecting",
            RTCDataChannelState::Open => "open",
            RTCDataChannelState::Closing => "closing",
            RTCDataChannelState::Closed => "closed",
            RTCDataChannelState::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

/// RTCDataChannel is the per-stream state kept by a PeerEndpoint.
#[derive(Debug, Clone)]
pub(crate) struct RTCDataChannel {
    id: Option<ChannelId>,
    config: DataChannelConfig,
    state: RTCDataChannelState,
    negotiated_locally: bool,
}

impl RTCDataChannel {
    /// a channel requested through create_data_channel; its id is assigned
    /// once the transport role is known
    pub(crate) fn new(config: DataChannelConfig) -> Self {
        Self {
            id: None,
            config,
            state: RTCDataChannelState::Connecting,
            negotiated_locally: true,
        }
    }

    /// a channel opened by the peer with a DATA_CHANNEL_OPEN on `id`
    pub(crate) fn accept(id: ChannelId, open: &DataChannelOpen) -> Self {
        Self {
            id: Some(id),
            config: DataChannelConfig::from_open(open),
            state: RTCDataChannelState::Open,
            negotiated_locally: false,
        }
    }

    pub(crate) fn id(&self) -> Option<ChannelId> {
        self.id
    }

    pub(crate) fn label(&self) -> &str {
        &self.config.label
    }

    pub(crate) fn ordered(&self) -> bool {
        self.config.ordered
    }

    pub(crate) fn state(&self) -> RTCDataChannelState {
        self.state
    }

    pub(crate) fn negotiated_locally(&self) -> bool {
        self.negotiated_locally
    }

    pub(crate) fn assign_id(&mut self, id: ChannelId) {
        self.id = Some(id);
    }

    /// open_message builds the DATA_CHANNEL_OPEN announcing this channel
    pub(crate) fn open_message(&self) -> DataChannelOpen {
        let (channel_type, reliability_parameter) = self.config.channel_type();
        DataChannelOpen {
            channel_type,
            priority: 0,
            reliability_parameter,
            label: self.config.label.as_bytes().to_vec(),
            protocol: self.config.protocol.as_bytes().to_vec(),
        }
    }

    /// handle_ack returns true when the acknowledgement opened the channel
    pub(crate) fn handle_ack(&mut self) -> Result<bool> {
        match self.state {
            RTCDataChannelState::Connecting => {
                self.state = RTCDataChannelState::Open;
                Ok(true)
            }
            RTCDataChannelState::Open => Ok(false),
            state => Err(Error::invalid_state(format!(
                "unexpected DATA_CHANNEL_ACK on {state} channel {:?}",
                self.id
            ))),
        }
    }

    /// reliability maps the channel's delivery guarantees onto SCTP stream parameters
    pub(crate) fn reliability(&self) -> (bool, ReliabilityType, u32) {
        let unordered = !self.config.ordered;
        match (self.config.max_retransmits, self.config.max_packet_life_time) {
            (Some(rexmit), _) => (unordered, ReliabilityType::Rexmit, rexmit as u32),
            (None, Some(millis)) => (unordered, ReliabilityType::Timed, millis as u32),
            (None, None) => (unordered, ReliabilityType::Reliable, 0),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == RTCDataChannelState::Open
    }

    /// begin_close returns true when a reset must be sent for this channel
    pub(crate) fn begin_close(&mut self) -> bool {
        match self.state {
            RTCDataChannelState::Open => {
                self.state = RTCDataChannelState::Closing;
                true
            }
            RTCDataChannelState::Connecting => {
                self.state = RTCDataChannelState::Closed;
                false
            }
            _ => false,
        }
    }

    /// handle_reset returns true when the channel transitioned to closed
    pub(crate) fn handle_reset(&mut self) -> bool {
        match self.state {
            RTCDataChannelState::Closed | RTCDataChannelState::Errored => false,
            _ => {
                self.state = RTCDataChannelState::Closed;
                true
            }
        }
    }

    pub(crate) fn set_errored(&mut self) {
        self.state = RTCDataChannelState::Errored;
    }

    /// unbinds the channel from its stream so a new round can renegotiate it
    pub(crate) fn rewind(&mut self) {
        self.id = None;
        self.state = RTCDataChannelState::Connecting;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_open_message_reliability() {
        let tests = vec![
            (DataChannelConfig::default(), ChannelType::Reliable, 0),
            (
                DataChannelConfig::default().with_ordered(false),
                ChannelType::ReliableUnordered,
                0,
            ),
            (
                DataChannelConfig::default().with_max_retransmits(Some(3)),
                ChannelType::PartialReliableRexmit,
                3,
            ),
            (
                DataChannelConfig::default()
                    .with_ordered(false)
                    .with_max_packet_life_time(Some(500)),
                ChannelType::PartialReliableTimedUnordered,
                500,
            ),
        ];

        for (config, channel_type, parameter) in tests {
            let open = RTCDataChannel::new(config.clone()).open_message();
            assert_eq!(open.channel_type, channel_type);
            assert_eq!(open.reliability_parameter, parameter);
            assert_eq!(open.label, DEFAULT_LABEL.as_bytes());

            let accepted = RTCDataChannel::accept(1, &open);
            assert_eq!(accepted.config, config);
            assert_eq!(accepted.reliability().0, !config.ordered);
            assert!(accepted.is_open());
            assert!(!accepted.negotiated_locally());
        }
    }

    #[test]
    fn test_stream_reliability() {
        let channel = RTCDataChannel::new(DataChannelConfig::default());
        assert_eq!(channel.reliability(), (false, ReliabilityType::Reliable, 0));

        let channel = RTCDataChannel::new(
            DataChannelConfig::default()
                .with_ordered(false)
                .with_max_retransmits(Some(2))
                .with_max_packet_life_time(Some(100)),
        );
        assert_eq!(channel.reliability(), (true, ReliabilityType::Rexmit, 2));

        let channel = RTCDataChannel::new(
            DataChannelConfig::default().with_max_packet_life_time(Some(250)),
        );
        assert_eq!(channel.reliability(), (false, ReliabilityType::Timed, 250));
    }

    #[test]
    fn test_channel_lifecycle() -> Result<()> {
        let mut channel = RTCDataChannel::new(DataChannelConfig::default());
        assert_eq!(channel.state(), RTCDataChannelState::Connecting);
        assert_eq!(channel.id(), None);

        channel.assign_id(0);
        assert!(channel.handle_ack()?);
        assert!(!channel.handle_ack()?);
        assert!(channel.is_open());

        assert!(channel.begin_close());
        assert_eq!(channel.state(), RTCDataChannelState::Closing);
        assert!(channel.handle_reset());
        assert!(!channel.handle_reset());
        assert!(channel.handle_ack().is_err());

        channel.rewind();
        assert_eq!(channel.id(), None);
        assert_eq!(channel.state(), RTCDataChannelState::Connecting);
        Ok(())
    }
}
