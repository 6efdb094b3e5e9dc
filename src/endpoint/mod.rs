pub(crate) mod agent;
pub mod candidate;
pub mod state;
pub(crate) mod transport;

use crate::certificate::RTCDtlsFingerprint;
use crate::configs::endpoint_config::EndpointConfig;
use crate::data_channel::{DataChannelConfig, RTCDataChannel, RTCDataChannelState};
use crate::description::{
    extract_connection_role, extract_fingerprint, extract_ice_details,
    have_application_media_section, populate_sdp, RTCSdpType, RTCSessionDescription,
    DATA_CHANNEL_MID,
};
use crate::error::{Error, Result};
use crate::messages::{
    to_data_message_type, to_ppid, ChannelHandle, DataChannelEvent, DataChannelMessageType,
    PeerEvent,
};
use crate::types::{ChannelId, EndpointId, TaggedBytesMut, TransportContext};
use agent::IceAgent;
use bytes::BytesMut;
use candidate::{RTCIceCandidate, RTCIceCandidateInit, RTCIceParameters};
use datachannel::message::{message_channel_ack::DataChannelAck, Message};
use log::{debug, info, trace, warn};
use sctp::PayloadProtocolIdentifier;
use sdp::util::ConnectionRole;
use shared::marshal::{Marshal, Unmarshal};
use state::{RTCIceGatheringState, RTCPeerConnectionState, RTCSignalingState};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use transport::{Transport, TransportEvent, DCEP_RELIABILITY};

/// PeerEndpoint is one side of a peer-to-peer data connection. It owns the
/// offer/answer state, the gathered and received candidates, the ICE agent
/// and every data channel bound to the connection.
///
/// It performs no I/O: datagrams are fed in with [`PeerEndpoint::handle_read`],
/// check pacing with [`PeerEndpoint::handle_timeout`], and everything it wants
/// to emit is drained with [`PeerEndpoint::poll_transmit`] and
/// [`PeerEndpoint::poll_event`].
pub struct PeerEndpoint {
    id: EndpointId,
    config: Arc<EndpointConfig>,
    host_addrs: Vec<SocketAddr>,

    connection_state: RTCPeerConnectionState,
    signaling_state: RTCSignalingState,
    gathering_state: RTCIceGatheringState,

    pending_local_description: Option<RTCSessionDescription>,
    local_description: Option<RTCSessionDescription>,
    remote_description: Option<RTCSessionDescription>,
    remote_ice_parameters: Option<RTCIceParameters>,
    remote_fingerprint: Option<RTCDtlsFingerprint>,

    local_candidates: Vec<RTCIceCandidate>,
    remote_candidates: Vec<RTCIceCandidate>,
    pending_candidates: Vec<(RTCIceCandidate, Option<String>)>,
    agent: IceAgent,
    transport: Option<Transport>,

    data_channels: Vec<RTCDataChannel>,

    events: VecDeque<PeerEvent>,
}

impl PeerEndpoint {
    /// creates an endpoint that gathers one host candidate per address in `host_addrs`
    pub fn new(id: EndpointId, config: Arc<EndpointConfig>, host_addrs: Vec<SocketAddr>) -> Self {
        let agent = Self::new_agent(&config);
        Self {
            id,
            config,
            host_addrs,

            connection_state: RTCPeerConnectionState::New,
            signaling_state: RTCSignalingState::Stable,
            gathering_state: RTCIceGatheringState::New,

            pending_local_description: None,
            local_description: None,
            remote_description: None,
            remote_ice_parameters: None,
            remote_fingerprint: None,

            local_candidates: vec![],
            remote_candidates: vec![],
            pending_candidates: vec![],
            agent,
            transport: None,

            data_channels: vec![],

            events: VecDeque::new(),
        }
    }

    fn new_agent(config: &EndpointConfig) -> IceAgent {
        IceAgent::new(
            RTCIceParameters::generate(),
            config.check_interval,
            config.max_binding_requests,
        )
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.connection_state
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.signaling_state
    }

    pub fn ice_gathering_state(&self) -> RTCIceGatheringState {
        self.gathering_state
    }

    pub fn local_description(&self) -> Option<&RTCSessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&RTCSessionDescription> {
        self.remote_description.as_ref()
    }

    /// the fingerprint the peer advertised for its certificate
    pub fn remote_fingerprint(&self) -> Option<&RTCDtlsFingerprint> {
        self.remote_fingerprint.as_ref()
    }

    pub fn local_candidates(&self) -> &[RTCIceCandidate] {
        &self.local_candidates
    }

    /// every accepted remote candidate, including those still waiting for the
    /// remote description
    pub fn remote_candidates(&self) -> Vec<RTCIceCandidate> {
        self.remote_candidates
            .iter()
            .chain(self.pending_candidates.iter().map(|(c, _)| c))
            .cloned()
            .collect()
    }

    pub fn selected_candidate_pair(&self) -> Option<TransportContext> {
        self.agent.selected_pair()
    }

    pub fn data_channel_state(&self, channel_id: ChannelId) -> Option<RTCDataChannelState> {
        self.data_channel(channel_id).map(|c| c.state())
    }

    /// channel_handle describes a channel that has been given a stream id
    pub fn channel_handle(&self, channel_id: ChannelId) -> Option<ChannelHandle> {
        self.data_channel(channel_id).map(|c| ChannelHandle {
            endpoint_id: self.id,
            channel_id,
            label: c.label().to_owned(),
            ordered: c.ordered(),
        })
    }

    fn data_channel(&self, channel_id: ChannelId) -> Option<&RTCDataChannel> {
        self.data_channels
            .iter()
            .find(|c| c.id() == Some(channel_id))
    }

    fn data_channel_mut(&mut self, channel_id: ChannelId) -> Option<&mut RTCDataChannel> {
        self.data_channels
            .iter_mut()
            .find(|c| c.id() == Some(channel_id))
    }

    fn fingerprints(&self) -> Vec<RTCDtlsFingerprint> {
        self.config
            .certificates
            .iter()
            .flat_map(|c| c.get_fingerprints())
            .collect()
    }

    fn ensure_not_terminal(&self, operation: &str) -> Result<()> {
        if self.connection_state.is_terminal() {
            Err(Error::invalid_state(format!(
                "{operation} on {} endpoint {}",
                self.connection_state, self.id
            )))
        } else {
            Ok(())
        }
    }

    fn set_connection_state(&mut self, state: RTCPeerConnectionState) {
        if self.connection_state == state {
            return;
        }
        info!(
            "endpoint {} connection state {} -> {}",
            self.id, self.connection_state, state
        );
        self.connection_state = state;
        self.push_event(PeerEvent::ConnectionStateChange(state));
    }

    fn push_event(&mut self, event: PeerEvent) {
        if self.connection_state != RTCPeerConnectionState::Closed {
            self.events.push_back(event);
        }
    }

    /// create_offer starts a negotiation round with this endpoint as offerer
    pub fn create_offer(&mut self) -> Result<RTCSessionDescription> {
        if self.connection_state != RTCPeerConnectionState::New {
            return Err(Error::invalid_state(format!(
                "create_offer on {} endpoint {}, reset it first",
                self.connection_state, self.id
            )));
        }

        let d = populate_sdp(
            &self.fingerprints(),
            self.agent.local_parameters(),
            ConnectionRole::Actpass,
        )?;
        let offer = RTCSessionDescription::offer(d.marshal())?;

        self.agent.set_controlling(true);
        self.pending_local_description = Some(offer.clone());
        self.set_connection_state(RTCPeerConnectionState::Negotiating);
        info!("endpoint {} created offer", self.id);
        Ok(offer)
    }

    /// create_answer answers the remote offer accepted by set_remote_description
    pub fn create_answer(&mut self) -> Result<RTCSessionDescription> {
        self.ensure_not_terminal("create_answer")?;
        if self.signaling_state != RTCSignalingState::HaveRemoteOffer {
            return Err(Error::invalid_state(format!(
                "create_answer requires a remote offer, signaling state is {}",
                self.signaling_state
            )));
        }
        if self.pending_local_description.is_some() {
            return Err(Error::invalid_state("answer already created"));
        }

        let d = populate_sdp(
            &self.fingerprints(),
            self.agent.local_parameters(),
            ConnectionRole::Active,
        )?;
        let answer = RTCSessionDescription::answer(d.marshal())?;

        self.pending_local_description = Some(answer.clone());
        info!("endpoint {} created answer", self.id);
        Ok(answer)
    }

    /// set_local_description applies a description this endpoint created and
    /// starts candidate gathering
    pub fn set_local_description(&mut self, desc: RTCSessionDescription) -> Result<()> {
        self.ensure_not_terminal("set_local_description")?;
        if self.local_description.is_some() {
            return Err(Error::invalid_state(
                "local description already set in this negotiation round",
            ));
        }

        let next_state = match (desc.sdp_type, self.signaling_state) {
            (RTCSdpType::Offer, RTCSignalingState::Stable) => RTCSignalingState::HaveLocalOffer,
            (RTCSdpType::Answer, RTCSignalingState::HaveRemoteOffer) => RTCSignalingState::Stable,
            (sdp_type, signaling_state) => {
                return Err(Error::invalid_state(format!(
                    "cannot set local {sdp_type} in signaling state {signaling_state}"
                )))
            }
        };
        if self.pending_local_description.as_ref() != Some(&desc) {
            return Err(Error::invalid_state(
                "local description was not created by this endpoint",
            ));
        }

        self.pending_local_description = None;
        self.local_description = Some(desc);
        self.signaling_state = next_state;
        debug!(
            "endpoint {} set local description, signaling state {}",
            self.id, self.signaling_state
        );

        self.gather_candidates();
        Ok(())
    }

    fn gather_candidates(&mut self) {
        self.gathering_state = RTCIceGatheringState::Gathering;
        let ufrag = self.agent.local_parameters().username_fragment.clone();

        for addr in self.host_addrs.clone() {
            let candidate = RTCIceCandidate::host(addr);
            if self.local_candidates.iter().any(|c| c.same_path(&candidate)) {
                continue;
            }
            debug!("endpoint {} gathered {}", self.id, candidate);
            self.agent.add_local_candidate(candidate.clone());
            self.push_event(PeerEvent::IceCandidate(
                candidate.to_json(DATA_CHANNEL_MID, &ufrag),
            ));
            self.local_candidates.push(candidate);
        }

        self.gathering_state = RTCIceGatheringState::Complete;
        self.push_event(PeerEvent::IceGatheringComplete);
    }

    /// set_remote_description validates and applies the peer's description
    pub fn set_remote_description(&mut self, mut desc: RTCSessionDescription) -> Result<()> {
        self.ensure_not_terminal("set_remote_description")?;
        if self.remote_description.is_some() {
            return Err(Error::invalid_state(
                "remote description already set in this negotiation round",
            ));
        }

        let next_state = match (desc.sdp_type, self.signaling_state) {
            (RTCSdpType::Offer, RTCSignalingState::Stable)
                if self.pending_local_description.is_none() =>
            {
                RTCSignalingState::HaveRemoteOffer
            }
            (RTCSdpType::Answer, RTCSignalingState::HaveLocalOffer) => RTCSignalingState::Stable,
            (RTCSdpType::Unspecified, _) => {
                return Err(Error::negotiation_failed("description has no type"))
            }
            (sdp_type, signaling_state) => {
                return Err(Error::invalid_state(format!(
                    "cannot set remote {sdp_type} in signaling state {signaling_state}"
                )))
            }
        };

        let parsed = desc.parsed()?;
        if !have_application_media_section(&parsed) {
            return Err(Error::negotiation_failed(
                "description has no webrtc-datachannel application section",
            ));
        }
        let (ice_parameters, candidates) =
            extract_ice_details(&parsed).map_err(|err| match err {
                Error::InvalidCandidate(msg) => Error::negotiation_failed(msg),
                err => err,
            })?;
        let fingerprint = extract_fingerprint(&parsed)?;
        match (desc.sdp_type, extract_connection_role(&parsed)) {
            (RTCSdpType::Answer, ConnectionRole::Active | ConnectionRole::Passive) => {}
            (RTCSdpType::Offer, ConnectionRole::Actpass | ConnectionRole::Active | ConnectionRole::Passive) => {}
            (sdp_type, role) => {
                return Err(Error::negotiation_failed(format!(
                    "unsupported setup role {role} in remote {sdp_type}"
                )))
            }
        }

        desc.parsed = Some(parsed);
        if desc.sdp_type == RTCSdpType::Offer {
            self.agent.set_controlling(false);
            self.set_connection_state(RTCPeerConnectionState::Negotiating);
        }
        self.remote_description = Some(desc);
        self.remote_fingerprint = Some(fingerprint);
        self.signaling_state = next_state;
        self.remote_ice_parameters = Some(ice_parameters.clone());
        self.agent.set_remote_parameters(ice_parameters.clone());
        debug!(
            "endpoint {} set remote description, signaling state {}",
            self.id, self.signaling_state
        );

        for candidate in candidates {
            self.accept_remote_candidate(candidate);
        }
        for (candidate, ufrag) in std::mem::take(&mut self.pending_candidates) {
            match ufrag {
                Some(ufrag) if ufrag != ice_parameters.username_fragment => {
                    debug!(
                        "endpoint {} drops buffered candidate {} of stale ufrag {}",
                        self.id, candidate, ufrag
                    );
                }
                _ => self.accept_remote_candidate(candidate),
            }
        }
        Ok(())
    }

    /// add_ice_candidate takes a candidate trickled by the peer. Duplicates and
    /// the end-of-candidates marker are no-ops; candidates arriving before the
    /// remote description are buffered.
    pub fn add_ice_candidate(&mut self, init: RTCIceCandidateInit) -> Result<()> {
        self.ensure_not_terminal("add_ice_candidate")?;
        if init.is_end_of_candidates() {
            debug!("endpoint {} end of remote candidates", self.id);
            return Ok(());
        }

        let candidate = RTCIceCandidate::unmarshal(&init.candidate)?;
        let ufrag = init
            .username_fragment
            .clone()
            .or_else(|| candidate.ufrag().map(str::to_owned));

        match &self.remote_ice_parameters {
            Some(parameters) => {
                if let Some(ufrag) = &ufrag {
                    if *ufrag != parameters.username_fragment {
                        warn!(
                            "endpoint {} ignores candidate {} of stale ufrag {}",
                            self.id, candidate, ufrag
                        );
                        return Ok(());
                    }
                }
                self.accept_remote_candidate(candidate);
            }
            None => {
                if self
                    .pending_candidates
                    .iter()
                    .any(|(c, _)| c.same_path(&candidate))
                {
                    debug!("endpoint {} ignores duplicate {}", self.id, candidate);
                } else {
                    debug!("endpoint {} buffers {}", self.id, candidate);
                    self.pending_candidates.push((candidate, ufrag));
                }
            }
        }
        Ok(())
    }

    fn accept_remote_candidate(&mut self, candidate: RTCIceCandidate) {
        if self
            .remote_candidates
            .iter()
            .any(|c| c.same_path(&candidate))
        {
            debug!("endpoint {} ignores duplicate {}", self.id, candidate);
            return;
        }
        debug!("endpoint {} adds remote {}", self.id, candidate);
        self.agent.add_remote_candidate(candidate.clone());
        self.remote_candidates.push(candidate);
    }

    /// create_data_channel registers a locally opened channel; it is announced
    /// to the peer once connectivity is established
    pub fn create_data_channel(&mut self, config: DataChannelConfig) -> Result<()> {
        if self.connection_state != RTCPeerConnectionState::New {
            return Err(Error::invalid_state(format!(
                "data channels must be created before negotiation, endpoint {} is {}",
                self.id, self.connection_state
            )));
        }
        info!(
            "endpoint {} created data channel '{}' (ordered: {})",
            self.id, config.label, config.ordered
        );
        self.data_channels.push(RTCDataChannel::new(config));
        Ok(())
    }

    /// the side whose `a=setup` is active acts as DTLS client and owns even stream ids
    fn is_dtls_client(&self) -> bool {
        match (&self.local_description, &self.remote_description) {
            (Some(local), _) if local.sdp_type == RTCSdpType::Answer => local
                .parsed
                .as_ref()
                .map(|d| extract_connection_role(d) != ConnectionRole::Passive)
                .unwrap_or(true),
            (_, Some(remote)) => remote
                .parsed
                .as_ref()
                .map(|d| extract_connection_role(d) == ConnectionRole::Passive)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn on_pair_selected(&mut self, now: Instant, pair: TransportContext) -> Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let is_client = self.is_dtls_client();
        info!(
            "endpoint {} selected {} -> {}, securing as DTLS {}",
            self.id,
            pair.local_addr,
            pair.peer_addr,
            if is_client { "client" } else { "server" }
        );
        let remote_fingerprint = self
            .remote_fingerprint
            .clone()
            .ok_or_else(|| Error::invalid_state("pair selected without a remote fingerprint"))?;

        self.transport = Some(Transport::new(
            now,
            pair,
            is_client,
            remote_fingerprint,
            &self.config.certificates,
        )?);
        self.process_transport_events(now)
    }

    fn process_transport_events(&mut self, now: Instant) -> Result<()> {
        while let Some(event) = self.transport.as_mut().and_then(|t| t.poll_event()) {
            match event {
                TransportEvent::Connected => self.on_transport_connected(now)?,
                TransportEvent::Message {
                    stream_id,
                    ppi,
                    payload,
                } => match to_data_message_type(ppi) {
                    DataChannelMessageType::Control => self.handle_dcep(now, stream_id, payload)?,
                    DataChannelMessageType::Text | DataChannelMessageType::Binary => {
                        self.handle_data(stream_id, ppi, payload)
                    }
                    DataChannelMessageType::None => warn!(
                        "endpoint {} drops message with unsupported ppi on stream {}",
                        self.id, stream_id
                    ),
                },
                TransportEvent::StreamReset(stream_id) => self.handle_stream_reset(stream_id),
                TransportEvent::Failed(reason) => self.fail(&reason),
            }
        }
        Ok(())
    }

    fn on_transport_connected(&mut self, now: Instant) -> Result<()> {
        info!("endpoint {} transport connected", self.id);
        self.set_connection_state(RTCPeerConnectionState::Connected);

        let mut next_stream_id: ChannelId = if self.is_dtls_client() { 0 } else { 1 };
        let mut opens = vec![];
        for channel in self.data_channels.iter_mut() {
            if channel.negotiated_locally()
                && channel.id().is_none()
                && channel.state() == RTCDataChannelState::Connecting
            {
                channel.assign_id(next_stream_id);
                opens.push((next_stream_id, channel.reliability(), channel.open_message()));
                next_stream_id += 2;
            }
        }

        for (stream_id, reliability, open) in opens {
            debug!(
                "endpoint {} sends DATA_CHANNEL_OPEN on stream {}",
                self.id, stream_id
            );
            self.transport_mut(stream_id)?
                .open_stream(stream_id, reliability)?;
            self.send_dcep(now, stream_id, Message::DataChannelOpen(open))?;
        }
        Ok(())
    }

    fn transport_mut(&mut self, stream_id: ChannelId) -> Result<&mut Transport> {
        self.transport
            .as_mut()
            .filter(|t| t.is_connected())
            .ok_or(Error::ChannelNotOpen(Some(stream_id)))
    }

    fn send_dcep(&mut self, now: Instant, stream_id: ChannelId, message: Message) -> Result<()> {
        let payload = message.marshal()?;
        self.transport_mut(stream_id)?.write(
            now,
            stream_id,
            PayloadProtocolIdentifier::Dcep,
            &payload,
            DCEP_RELIABILITY,
        )
    }

    /// send_text queues `text` on an open channel
    pub fn send_text(&mut self, channel_id: ChannelId, text: &str) -> Result<()> {
        if self.connection_state != RTCPeerConnectionState::Connected {
            return Err(Error::ChannelNotOpen(Some(channel_id)));
        }
        let reliability = match self.data_channel(channel_id) {
            Some(channel) if channel.is_open() => channel.reliability(),
            _ => return Err(Error::ChannelNotOpen(Some(channel_id))),
        };

        let ppi = to_ppid(DataChannelMessageType::Text, text.len());
        // empty messages carry a single zero byte, RFC 8831 section 6.6
        let payload: &[u8] = if text.is_empty() { &[0u8] } else { text.as_bytes() };
        trace!(
            "endpoint {} sends {} bytes on stream {}",
            self.id,
            text.len(),
            channel_id
        );
        self.transport_mut(channel_id)?
            .write(Instant::now(), channel_id, ppi, payload, reliability)
    }

    /// close_data_channel resets the channel's stream; `Close` is emitted once
    /// the peer answers with its own reset
    pub fn close_data_channel(&mut self, channel_id: ChannelId) -> Result<()> {
        let id = self.id;
        let channel = self
            .data_channel_mut(channel_id)
            .ok_or_else(|| Error::invalid_state(format!("unknown data channel {channel_id}")))?;
        let send_reset = channel.begin_close();
        let closed = channel.state() == RTCDataChannelState::Closed;
        info!("endpoint {} closing data channel {}", id, channel_id);

        if send_reset {
            let now = Instant::now();
            self.transport_mut(channel_id)?
                .close_stream(now, channel_id)?;
            self.process_transport_events(now)?;
        } else if closed {
            self.push_event(PeerEvent::DataChannel(channel_id, DataChannelEvent::Close));
        }
        Ok(())
    }

    /// handle_read processes one datagram received on one of the endpoint's addresses
    pub fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.connection_state.is_terminal() {
            trace!(
                "endpoint {} is {}, drop datagram",
                self.id,
                self.connection_state
            );
            return Ok(());
        }

        if stun::message::is_message(&msg.message) {
            if let Some(pair) = self
                .agent
                .handle_stun(msg.now, msg.transport, &msg.message)?
            {
                self.on_pair_selected(msg.now, pair)?;
            }
            return Ok(());
        }

        match self.agent.selected_pair() {
            Some(selected) if selected == msg.transport => {}
            Some(_) => {
                warn!(
                    "endpoint {} drops datagram outside the selected pair from {}",
                    self.id, msg.transport.peer_addr
                );
                return Ok(());
            }
            None => {
                warn!(
                    "endpoint {} drops datagram before connectivity from {}",
                    self.id, msg.transport.peer_addr
                );
                return Ok(());
            }
        }

        if let Some(transport) = self.transport.as_mut() {
            transport.handle_read(msg.now, msg.message)?;
        }
        self.process_transport_events(msg.now)
    }

    fn handle_dcep(&mut self, now: Instant, stream_id: ChannelId, payload: BytesMut) -> Result<()> {
        let mut buf = &payload[..];
        match Message::unmarshal(&mut buf) {
            Ok(Message::DataChannelOpen(open)) => {
                if self.data_channel(stream_id).is_some() {
                    warn!(
                        "endpoint {} ignores DATA_CHANNEL_OPEN for existing stream {}",
                        self.id, stream_id
                    );
                    return Ok(());
                }
                let channel = RTCDataChannel::accept(stream_id, &open);
                info!(
                    "endpoint {} accepted data channel '{}' on stream {}",
                    self.id,
                    channel.label(),
                    stream_id
                );
                let handle = ChannelHandle {
                    endpoint_id: self.id,
                    channel_id: stream_id,
                    label: channel.label().to_owned(),
                    ordered: channel.ordered(),
                };
                self.data_channels.push(channel);
                self.send_dcep(now, stream_id, Message::DataChannelAck(DataChannelAck {}))?;
                self.push_event(PeerEvent::ChannelAnnounced(handle));
            }
            Ok(Message::DataChannelAck(_)) => {
                let id = self.id;
                let opened = match self.data_channel_mut(stream_id) {
                    Some(channel) => channel.handle_ack(),
                    None => {
                        warn!(
                            "endpoint {} drops DATA_CHANNEL_ACK for unknown stream {}",
                            id, stream_id
                        );
                        return Ok(());
                    }
                };
                match opened {
                    Ok(true) => {
                        info!("endpoint {} data channel {} open", id, stream_id);
                        self.push_event(PeerEvent::DataChannel(stream_id, DataChannelEvent::Open));
                    }
                    Ok(false) => debug!("endpoint {} duplicate ack on {}", id, stream_id),
                    Err(err) => warn!("endpoint {}: {}", id, err),
                }
            }
            Err(err) => {
                warn!(
                    "endpoint {} malformed DCEP message on stream {}: {}",
                    self.id, stream_id, err
                );
                if let Some(channel) = self.data_channel_mut(stream_id) {
                    channel.set_errored();
                    self.push_event(PeerEvent::DataChannel(
                        stream_id,
                        DataChannelEvent::Error(err.to_string()),
                    ));
                }
            }
        }
        Ok(())
    }

    fn handle_data(&mut self, stream_id: ChannelId, ppi: PayloadProtocolIdentifier, payload: BytesMut) {
        match self.data_channel(stream_id) {
            Some(channel) if channel.is_open() => {}
            Some(channel) => {
                warn!(
                    "endpoint {} drops message on {} channel {}",
                    self.id,
                    channel.state(),
                    stream_id
                );
                return;
            }
            None => {
                warn!(
                    "endpoint {} drops message on stream {} with no channel attached",
                    self.id, stream_id
                );
                return;
            }
        }

        let is_string = to_data_message_type(ppi) == DataChannelMessageType::Text;
        let data = match ppi {
            PayloadProtocolIdentifier::StringEmpty | PayloadProtocolIdentifier::BinaryEmpty => {
                BytesMut::new()
            }
            _ => payload,
        };
        trace!(
            "endpoint {} received {} bytes on stream {}",
            self.id,
            data.len(),
            stream_id
        );
        self.push_event(PeerEvent::DataChannel(
            stream_id,
            DataChannelEvent::Message { is_string, data },
        ));
    }

    fn handle_stream_reset(&mut self, stream_id: ChannelId) {
        let id = self.id;
        let Some(channel) = self.data_channel_mut(stream_id) else {
            debug!("endpoint {} reset on unknown stream {}", id, stream_id);
            return;
        };
        if !channel.handle_reset() {
            return;
        }

        info!("endpoint {} data channel {} closed", id, stream_id);
        self.push_event(PeerEvent::DataChannel(stream_id, DataChannelEvent::Close));
    }

    /// handle_timeout paces connectivity checks and detects ICE failure
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.connection_state.is_terminal() {
            return Ok(());
        }
        self.agent.handle_timeout(now)?;
        if self.connection_state == RTCPeerConnectionState::Negotiating && self.agent.is_failed()
        {
            warn!("endpoint {} exhausted every candidate pair", self.id);
            self.set_connection_state(RTCPeerConnectionState::Failed);
            return Ok(());
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.handle_timeout(now)?;
        }
        self.process_transport_events(now)
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.connection_state.is_terminal() {
            return None;
        }
        let transport = self.transport.as_ref().and_then(|t| t.poll_timeout());
        match (self.agent.poll_timeout(), transport) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.agent
            .poll_transmit()
            .or_else(|| self.transport.as_mut().and_then(|t| t.poll_transmit()))
    }

    pub fn poll_event(&mut self) -> Option<PeerEvent> {
        self.events.pop_front()
    }

    /// fail moves the endpoint to failed, e.g. when its peer rejected a description
    pub fn fail(&mut self, reason: &str) {
        if self.connection_state.is_terminal() {
            return;
        }
        warn!("endpoint {} failed: {}", self.id, reason);
        self.set_connection_state(RTCPeerConnectionState::Failed);
    }

    /// reset discards the negotiation round so that a new offer can be created
    pub fn reset(&mut self) -> Result<()> {
        if self.connection_state == RTCPeerConnectionState::Closed {
            return Err(Error::invalid_state(format!(
                "reset on closed endpoint {}",
                self.id
            )));
        }
        info!("endpoint {} reset", self.id);

        self.agent = Self::new_agent(&self.config);
        self.signaling_state = RTCSignalingState::Stable;
        self.gathering_state = RTCIceGatheringState::New;
        self.pending_local_description = None;
        self.local_description = None;
        self.remote_description = None;
        self.remote_ice_parameters = None;
        self.remote_fingerprint = None;
        self.local_candidates.clear();
        self.remote_candidates.clear();
        self.pending_candidates.clear();
        self.transport = None;

        self.data_channels.retain(|c| c.negotiated_locally());
        for channel in self.data_channels.iter_mut() {
            channel.rewind();
        }

        self.set_connection_state(RTCPeerConnectionState::New);
        Ok(())
    }

    /// close force-closes every channel, telling the peer with stream resets,
    /// and silences the endpoint
    pub fn close(&mut self) {
        if self.connection_state == RTCPeerConnectionState::Closed {
            return;
        }
        info!("endpoint {} closing", self.id);

        let mut resets = vec![];
        for channel in self.data_channels.iter_mut() {
            if let Some(channel_id) = channel.id() {
                if channel.state() == RTCDataChannelState::Open {
                    resets.push(channel_id);
                }
            }
            channel.handle_reset();
        }
        while self.agent.poll_transmit().is_some() {}
        let now = Instant::now();
        for channel_id in resets {
            let reset = self
                .transport_mut(channel_id)
                .and_then(|t| t.close_stream(now, channel_id));
            if let Err(err) = reset {
                debug!("endpoint {} skips reset of {}: {}", self.id, channel_id, err);
            }
        }

        self.events.clear();
        self.connection_state = RTCPeerConnectionState::Closed;
    }
}
