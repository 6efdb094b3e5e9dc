use crate::certificate::{RTCCertificate, RTCDtlsFingerprint};
use crate::error::{Error, Result};
use crate::types::{ChannelId, TaggedBytesMut, TransportContext};
use bytes::BytesMut;
use dtls::config::{ClientAuthType, ConfigBuilder, ExtendedMasterSecretType};
use dtls::endpoint::EndpointEvent as DtlsEvent;
use log::{debug, error, trace, warn};
use sctp::{
    Association, AssociationHandle, ClientConfig, DatagramEvent, EndpointEvent, Event, Payload,
    PayloadProtocolIdentifier, ReliabilityType, StreamEvent,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// DCEP messages always travel ordered and reliable.
pub(crate) const DCEP_RELIABILITY: (bool, ReliabilityType, u32) =
    (false, ReliabilityType::Reliable, 0);

const MAX_TIMEOUT: Duration = Duration::from_secs(86400);

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransportEvent {
    /// the SCTP association on top of the secured DTLS connection is established
    Connected,
    Message {
        stream_id: ChannelId,
        ppi: PayloadProtocolIdentifier,
        payload: BytesMut,
    },
    /// the stream was reset by either side and is no longer usable
    StreamReset(ChannelId),
    Failed(String),
}

/// Transport carries the data plane of one endpoint over its selected candidate
/// pair: a DTLS connection authenticated against the fingerprint of the remote
/// description, with an SCTP association riding on its application data.
pub(crate) struct Transport {
    pair: TransportContext,
    is_client: bool,
    last_activity: Instant,

    // DTLS
    dtls_endpoint: dtls::endpoint::Endpoint,
    secured: bool,

    // SCTP
    sctp_endpoint: sctp::Endpoint,
    sctp_associations: HashMap<AssociationHandle, Association>,
    streams: HashSet<ChannelId>,

    failed: bool,
    internal_buffer: Vec<u8>,
    transmits: VecDeque<TaggedBytesMut>,
    events: VecDeque<TransportEvent>,
}

impl Transport {
    /// new starts the data plane on `pair`; the DTLS client sends its first flight right away
    pub(crate) fn new(
        now: Instant,
        pair: TransportContext,
        is_client: bool,
        remote_fingerprint: RTCDtlsFingerprint,
        certificates: &[RTCCertificate],
    ) -> Result<Self> {
        let handshake_config = Arc::new(
            ConfigBuilder::default()
                .with_certificates(
                    certificates
                        .iter()
                        .map(|c| c.dtls_certificate.clone())
                        .collect(),
                )
                .with_extended_master_secret(ExtendedMasterSecretType::Require)
                .with_client_auth(ClientAuthType::RequireAnyClientCert)
                // self-signed certificates are authenticated by fingerprint instead of a chain
                .with_insecure_skip_verify(true)
                .with_verify_peer_certificate(Some(Arc::new(
                    move |certs: &[Vec<u8>], _: &[rustls::Certificate]| {
                        let Some(der) = certs.first() else {
                            return Err(shared::error::Error::ErrNoCertificates);
                        };
                        remote_fingerprint
                            .matches(der)
                            .map_err(|_| shared::error::Error::ErrFingerprintMismatch)
                    },
                )))
                .build(is_client, if is_client { Some(pair.peer_addr) } else { None })?,
        );

        let sctp_server_config = Arc::new(sctp::ServerConfig::default());
        let internal_buffer = vec![0u8; sctp_server_config.transport.max_message_size() as usize];

        let mut transport = Self {
            pair,
            is_client,
            last_activity: now,

            dtls_endpoint: dtls::endpoint::Endpoint::new(if is_client {
                None
            } else {
                Some(Arc::clone(&handshake_config))
            }),
            secured: false,

            sctp_endpoint: sctp::Endpoint::new(
                Arc::new(sctp::EndpointConfig::default()),
                if is_client {
                    None
                } else {
                    Some(sctp_server_config)
                },
            ),
            sctp_associations: HashMap::new(),
            streams: HashSet::new(),

            failed: false,
            internal_buffer,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        };

        if is_client {
            debug!("dtls connect to {}", pair.peer_addr);
            transport
                .dtls_endpoint
                .connect(pair.peer_addr, handshake_config, None)?;
            transport.flush_dtls();
        }
        Ok(transport)
    }

    pub(crate) fn is_secured(&self) -> bool {
        self.secured
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.secured && !self.failed && !self.sctp_associations.is_empty()
    }

    /// handle_read takes a non-STUN datagram received on the selected pair
    pub(crate) fn handle_read(&mut self, now: Instant, message: BytesMut) -> Result<()> {
        if self.failed {
            trace!("transport failed, drop {} bytes", message.len());
            return Ok(());
        }
        self.last_activity = now;

        let read = self.dtls_endpoint.read(
            now,
            self.pair.peer_addr,
            Some(self.pair.local_addr.ip()),
            None,
            message,
        );
        let events = match read {
            Ok(events) => events,
            Err(err) => {
                error!("dtls read from {} with error {}", self.pair.peer_addr, err);
                if !self.secured || err == shared::error::Error::ErrAlertFatalOrClose {
                    self.fail(format!("dtls: {err}"));
                    return Ok(());
                }
                self.flush_dtls();
                return Err(err.into());
            }
        };

        for event in events {
            match event {
                DtlsEvent::HandshakeComplete => self.on_handshake_complete(now)?,
                DtlsEvent::ApplicationData(data) => self.handle_sctp(now, data)?,
            }
        }
        self.flush_dtls();
        Ok(())
    }

    fn on_handshake_complete(&mut self, now: Instant) -> Result<()> {
        if self.secured {
            return Ok(());
        }
        debug!(
            "dtls handshake with {} complete, peer certificate verified",
            self.pair.peer_addr
        );
        self.secured = true;

        if self.is_client {
            let (ch, conn) = self
                .sctp_endpoint
                .connect(ClientConfig::default(), self.pair.peer_addr)
                .map_err(|err| Error::protocol(format!("sctp connect: {err}")))?;
            debug!("sctp association {} initiated", ch.0);
            self.sctp_associations.insert(ch, conn);
            self.drive(now)?;
        }
        Ok(())
    }

    fn handle_sctp(&mut self, now: Instant, data: BytesMut) -> Result<()> {
        trace!("recv sctp {} bytes from {}", data.len(), self.pair.peer_addr);
        let handle_result = self.sctp_endpoint.handle(
            now,
            self.pair.peer_addr,
            Some(self.pair.local_addr.ip()),
            None,
            data.freeze(),
        );
        if let Some((ch, event)) = handle_result {
            match event {
                DatagramEvent::NewAssociation(conn) => {
                    debug!("sctp association {} accepted", ch.0);
                    self.sctp_associations.insert(ch, conn);
                }
                DatagramEvent::AssociationEvent(event) => {
                    if let Some(conn) = self.sctp_associations.get_mut(&ch) {
                        conn.handle_event(event);
                    }
                }
            }
        }
        self.drive(now)
    }

    /// drive drains association events and hands its packets to DTLS
    fn drive(&mut self, now: Instant) -> Result<()> {
        let mut endpoint_events: Vec<(AssociationHandle, EndpointEvent)> = vec![];
        let mut outgoing = vec![];

        for (ch, conn) in self.sctp_associations.iter_mut() {
            while let Some(event) = conn.poll() {
                match event {
                    Event::Connected => {
                        debug!("sctp association {} established", ch.0);
                        self.events.push_back(TransportEvent::Connected);
                    }
                    Event::AssociationLost { reason } => {
                        warn!("sctp association {} lost: {}", ch.0, reason);
                        self.events
                            .push_back(TransportEvent::Failed(format!("sctp: {reason}")));
                    }
                    Event::Stream(StreamEvent::Opened) => {
                        while let Some(stream) = conn.accept_stream() {
                            debug!("sctp stream {} opened by peer", stream.stream_identifier());
                            self.streams.insert(stream.stream_identifier());
                        }
                    }
                    Event::Stream(StreamEvent::Readable { id }) => {
                        let mut stream = conn.stream(id)?;
                        while let Some(chunks) = stream.read_sctp()? {
                            let n = chunks.read(&mut self.internal_buffer)?;
                            self.events.push_back(TransportEvent::Message {
                                stream_id: id,
                                ppi: chunks.ppi,
                                payload: BytesMut::from(&self.internal_buffer[0..n]),
                            });
                        }
                    }
                    _ => {}
                }
            }

            // a reset unregisters the stream on both sides without an event
            let reset: Vec<ChannelId> = self
                .streams
                .iter()
                .copied()
                .filter(|id| conn.stream(*id).is_err())
                .collect();
            for id in reset {
                debug!("sctp stream {} reset", id);
                self.streams.remove(&id);
                self.events.push_back(TransportEvent::StreamReset(id));
            }

            while let Some(event) = conn.poll_endpoint_event() {
                endpoint_events.push((*ch, event));
            }
            while let Some(x) = conn.poll_transmit(now) {
                outgoing.push(x);
            }
        }

        for (ch, event) in endpoint_events {
            self.sctp_endpoint.handle_event(ch, event); // handle drain event
            self.sctp_associations.remove(&ch);
        }

        for transmit in outgoing {
            if let Payload::RawEncode(raw_data) = transmit.payload {
                for raw in raw_data {
                    self.dtls_endpoint.write(self.pair.peer_addr, &raw)?;
                }
            }
        }
        self.flush_dtls();
        Ok(())
    }

    fn flush_dtls(&mut self) {
        while let Some(transmit) = self.dtls_endpoint.poll_transmit() {
            self.transmits.push_back(TaggedBytesMut {
                now: transmit.now,
                transport: self.pair,
                message: transmit.payload,
            });
        }
    }

    fn association_mut(&mut self) -> Result<&mut Association> {
        self.sctp_associations
            .values_mut()
            .next()
            .ok_or_else(|| Error::invalid_state("sctp association is not established"))
    }

    /// open_stream registers a locally opened stream
    pub(crate) fn open_stream(
        &mut self,
        stream_id: ChannelId,
        reliability: (bool, ReliabilityType, u32),
    ) -> Result<()> {
        let (unordered, rel_type, rel_val) = reliability;
        let conn = self.association_mut()?;
        let mut stream = conn.open_stream(stream_id, PayloadProtocolIdentifier::Dcep)?;
        stream.set_reliability_params(unordered, rel_type, rel_val)?;
        self.streams.insert(stream_id);
        Ok(())
    }

    /// write sends one message on an open stream
    pub(crate) fn write(
        &mut self,
        now: Instant,
        stream_id: ChannelId,
        ppi: PayloadProtocolIdentifier,
        payload: &[u8],
        reliability: (bool, ReliabilityType, u32),
    ) -> Result<()> {
        if payload.len() > self.internal_buffer.len() {
            return Err(Error::Protocol(
                shared::error::Error::ErrOutboundPacketTooLarge,
            ));
        }
        let (unordered, rel_type, rel_val) = reliability;
        {
            let conn = self.association_mut()?;
            let mut stream = conn.stream(stream_id)?;
            stream.set_reliability_params(unordered, rel_type, rel_val)?;
            stream.write_with_ppi(payload, ppi)?;
        }
        self.drive(now)
    }

    /// close_stream resets the outgoing stream; StreamReset follows once the peer answers
    pub(crate) fn close_stream(&mut self, now: Instant, stream_id: ChannelId) -> Result<()> {
        {
            let conn = self.association_mut()?;
            let mut stream = conn.stream(stream_id)?;
            stream.stop()?;
        }
        self.drive(now)
    }

    pub(crate) fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.failed {
            return Ok(());
        }

        let remotes: Vec<_> = self.dtls_endpoint.get_connections_keys().copied().collect();
        for remote in remotes {
            if let Err(err) = self.dtls_endpoint.handle_timeout(remote, now) {
                debug!("dtls handle_timeout for {} with error {}", remote, err);
            }
        }
        self.flush_dtls();

        for conn in self.sctp_associations.values_mut() {
            conn.handle_timeout(now);
        }
        self.drive(now)
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        if self.failed {
            return None;
        }

        let far = self.last_activity + MAX_TIMEOUT;
        let mut eto = far;
        if !self.secured {
            for remote in self.dtls_endpoint.get_connections_keys() {
                let _ = self.dtls_endpoint.poll_timeout(*remote, &mut eto);
            }
        }
        for conn in self.sctp_associations.values() {
            if let Some(timeout) = conn.poll_timeout() {
                if timeout < eto {
                    eto = timeout;
                }
            }
        }

        if eto < far {
            Some(eto)
        } else {
            None
        }
    }

    pub(crate) fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.transmits.pop_front()
    }

    pub(crate) fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    /// fail tears down the DTLS connection, letting the peer know with an alert
    fn fail(&mut self, reason: String) {
        if self.failed {
            return;
        }
        warn!("transport to {} failed: {}", self.pair.peer_addr, reason);
        self.failed = true;
        let _ = self.dtls_endpoint.close(self.pair.peer_addr);
        self.flush_dtls();
        self.events.push_back(TransportEvent::Failed(reason));
    }
}
