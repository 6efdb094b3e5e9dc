use crate::configs::endpoint_config::EndpointConfig;
use crate::data_channel::DataChannelConfig;
use crate::description::{RTCSdpType, RTCSessionDescription};
use crate::endpoint::state::RTCPeerConnectionState;
use crate::endpoint::PeerEndpoint;
use crate::error::{Error, Result};
use crate::messages::{ChannelHandle, DataChannelEvent, PeerEvent};
use crate::metrics::Metrics;
use crate::signal::{Relay, RelayInbox, SignalMessage};
use crate::transport::LoopbackNetwork;
use crate::types::{ChannelId, EndpointId, TaggedBytesMut};
use bytes::BytesMut;
use log::{debug, info, trace, warn};
use opentelemetry::KeyValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// PeerCommand is a request to the task owning one PeerEndpoint.
pub(crate) enum PeerCommand {
    CreateDataChannel {
        config: DataChannelConfig,
        response_tx: oneshot::Sender<Result<()>>,
    },
    CreateOffer {
        response_tx: oneshot::Sender<Result<RTCSessionDescription>>,
    },
    CreateAnswer {
        response_tx: oneshot::Sender<Result<RTCSessionDescription>>,
    },
    SetLocalDescription {
        description: RTCSessionDescription,
        response_tx: oneshot::Sender<Result<()>>,
    },
    SendText {
        channel_id: ChannelId,
        text: String,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Fail {
        reason: String,
    },
    Close {
        response_tx: oneshot::Sender<()>,
    },
}

/// PeerNotification is what an endpoint task reports to the orchestrator.
#[derive(Debug)]
pub(crate) enum PeerNotification {
    DescriptionApplied {
        sdp_type: RTCSdpType,
        result: Result<()>,
    },
    CandidateRejected(Error),
    ConnectionStateChange(RTCPeerConnectionState),
    ChannelOpen(ChannelHandle),
    ChannelAnnounced(ChannelHandle),
    ChannelClosed(ChannelId),
    ChannelError(ChannelId, String),
    Message {
        channel_id: ChannelId,
        is_string: bool,
        data: BytesMut,
    },
}

pub(crate) type NotificationSender = mpsc::UnboundedSender<(EndpointId, PeerNotification)>;

/// PeerHandle is the orchestrator's way to talk to an endpoint task.
#[derive(Clone)]
pub(crate) struct PeerHandle {
    id: EndpointId,
    command_tx: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    pub(crate) fn id(&self) -> EndpointId {
        self.id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> PeerCommand,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(command(response_tx))
            .map_err(|_| Error::EndpointClosed(self.id))?;
        response_rx
            .await
            .map_err(|_| Error::EndpointClosed(self.id))?
    }

    pub(crate) async fn create_data_channel(&self, config: DataChannelConfig) -> Result<()> {
        self.request(|response_tx| PeerCommand::CreateDataChannel {
            config,
            response_tx,
        })
        .await
    }

    pub(crate) async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.request(|response_tx| PeerCommand::CreateOffer { response_tx })
            .await
    }

    pub(crate) async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.request(|response_tx| PeerCommand::CreateAnswer { response_tx })
            .await
    }

    pub(crate) async fn set_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<()> {
        self.request(|response_tx| PeerCommand::SetLocalDescription {
            description,
            response_tx,
        })
        .await
    }

    pub(crate) async fn send_text(&self, channel_id: ChannelId, text: String) -> Result<()> {
        self.request(|response_tx| PeerCommand::SendText {
            channel_id,
            text,
            response_tx,
        })
        .await
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let _ = self.command_tx.send(PeerCommand::Fail {
            reason: reason.into(),
        });
    }

    pub(crate) async fn close(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(PeerCommand::Close { response_tx })
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }
}

/// PeerTask owns one PeerEndpoint and every I/O resource it is wired to.
struct PeerTask {
    endpoint: PeerEndpoint,
    addrs: Vec<SocketAddr>,
    network: LoopbackNetwork,
    relay: Arc<dyn Relay>,
    notification_tx: NotificationSender,
    metrics: Arc<Metrics>,
}

/// spawn_peer binds the endpoint's host addresses, opens its relay mailbox
/// and starts the task driving it
pub(crate) fn spawn_peer(
    id: EndpointId,
    config: Arc<EndpointConfig>,
    network: LoopbackNetwork,
    relay: Arc<dyn Relay>,
    notification_tx: NotificationSender,
    metrics: Arc<Metrics>,
) -> (PeerHandle, JoinHandle<()>) {
    let (packet_tx, packet_rx) = mpsc::unbounded_channel();
    let addrs: Vec<SocketAddr> = config
        .host_ips()
        .iter()
        .map(|ip| network.bind(*ip, packet_tx.clone()))
        .collect();
    let inbox = relay.register(id);
    let endpoint = PeerEndpoint::new(id, config, addrs.clone());

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let task = PeerTask {
        endpoint,
        addrs,
        network,
        relay,
        notification_tx,
        metrics,
    };
    let join_handle = tokio::spawn(task.run(command_rx, packet_rx, inbox));

    (PeerHandle { id, command_tx }, join_handle)
}

impl PeerTask {
    fn id(&self) -> EndpointId {
        self.endpoint.id()
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<PeerCommand>,
        mut packet_rx: mpsc::UnboundedReceiver<TaggedBytesMut>,
        mut inbox: RelayInbox,
    ) {
        info!("endpoint {} task started on {:?}", self.id(), self.addrs);
        let mut inbox_open = true;

        loop {
            self.flush();

            let timeout = self.endpoint.poll_timeout();
            let deadline = timeout
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(tokio::time::Instant::now);

            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command) {
                                break;
                            }
                        }
                        None => {
                            debug!("endpoint {} lost its owner", self.id());
                            self.endpoint.close();
                            self.flush();
                            break;
                        }
                    }
                }
                Some(packet) = packet_rx.recv() => {
                    if let Err(err) = self.endpoint.handle_read(packet) {
                        warn!("endpoint {} handle_read: {}", self.id(), err);
                    }
                }
                message = inbox.recv(), if inbox_open => {
                    match message {
                        Some(message) => self.handle_signal(message),
                        None => {
                            debug!("endpoint {} relay mailbox closed", self.id());
                            inbox_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if timeout.is_some() => {
                    if let Err(err) = self.endpoint.handle_timeout(Instant::now()) {
                        warn!("endpoint {} handle_timeout: {}", self.id(), err);
                    }
                }
            }
        }

        for addr in &self.addrs {
            self.network.unbind(addr);
        }
        self.relay.unregister(self.id());
        info!("endpoint {} task stopped", self.id());
    }

    /// returns false once the task must stop
    fn handle_command(&mut self, command: PeerCommand) -> bool {
        match command {
            PeerCommand::CreateDataChannel {
                config,
                response_tx,
            } => {
                let _ = response_tx.send(self.endpoint.create_data_channel(config));
            }
            PeerCommand::CreateOffer { response_tx } => {
                let _ = response_tx.send(self.endpoint.create_offer());
            }
            PeerCommand::CreateAnswer { response_tx } => {
                let _ = response_tx.send(self.endpoint.create_answer());
            }
            PeerCommand::SetLocalDescription {
                description,
                response_tx,
            } => {
                let _ = response_tx.send(self.endpoint.set_local_description(description));
            }
            PeerCommand::SendText {
                channel_id,
                text,
                response_tx,
            } => {
                let _ = response_tx.send(self.endpoint.send_text(channel_id, &text));
            }
            PeerCommand::Fail { reason } => self.endpoint.fail(&reason),
            PeerCommand::Close { response_tx } => {
                self.endpoint.close();
                self.flush();
                let _ = response_tx.send(());
                return false;
            }
        }
        true
    }

    fn handle_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::Description { description } => {
                let sdp_type = description.sdp_type;
                debug!("endpoint {} received remote {}", self.id(), sdp_type);
                let result = self.endpoint.set_remote_description(description);
                self.notify(PeerNotification::DescriptionApplied { sdp_type, result });
            }
            SignalMessage::Candidate { candidate } => {
                trace!("endpoint {} received {}", self.id(), candidate.candidate);
                if let Err(err) = self.endpoint.add_ice_candidate(candidate) {
                    if self.endpoint.connection_state().is_terminal() {
                        debug!("endpoint {} ignores late candidate: {}", self.id(), err);
                    } else {
                        self.notify(PeerNotification::CandidateRejected(err));
                    }
                }
            }
        }
    }

    /// flush hands queued datagrams to the network and queued events to the
    /// relay or the orchestrator
    fn flush(&mut self) {
        while let Some(transmit) = self.endpoint.poll_transmit() {
            self.network.send(transmit);
        }

        while let Some(event) = self.endpoint.poll_event() {
            match event {
                PeerEvent::IceCandidate(candidate) => {
                    self.metrics.record_candidate_count(
                        1,
                        &[KeyValue::new("endpoint", self.id().to_string())],
                    );
                    let to = self.id().peer();
                    if let Err(err) = self.relay.send(to, SignalMessage::Candidate { candidate }) {
                        warn!("endpoint {} candidate not relayed: {}", self.id(), err);
                    }
                }
                PeerEvent::IceGatheringComplete => {
                    debug!("endpoint {} gathering complete", self.id());
                }
                PeerEvent::ConnectionStateChange(state) => {
                    self.notify(PeerNotification::ConnectionStateChange(state));
                }
                PeerEvent::ChannelAnnounced(handle) => {
                    self.notify(PeerNotification::ChannelAnnounced(handle));
                }
                PeerEvent::DataChannel(channel_id, DataChannelEvent::Open) => {
                    if let Some(handle) = self.endpoint.channel_handle(channel_id) {
                        self.notify(PeerNotification::ChannelOpen(handle));
                    }
                }
                PeerEvent::DataChannel(channel_id, DataChannelEvent::Message { is_string, data }) => {
                    self.notify(PeerNotification::Message {
                        channel_id,
                        is_string,
                        data,
                    });
                }
                PeerEvent::DataChannel(channel_id, DataChannelEvent::Close) => {
                    self.notify(PeerNotification::ChannelClosed(channel_id));
                }
                PeerEvent::DataChannel(channel_id, DataChannelEvent::Error(reason)) => {
                    self.notify(PeerNotification::ChannelError(channel_id, reason));
                }
            }
        }
    }

    fn notify(&self, notification: PeerNotification) {
        if self
            .notification_tx
            .send((self.id(), notification))
            .is_err()
        {
            trace!("endpoint {} has no listener", self.id());
        }
    }
}
