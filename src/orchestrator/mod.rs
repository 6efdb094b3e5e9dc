pub(crate) mod peer;

use crate::configs::session_config::SessionConfig;
use crate::description::RTCSdpType;
use crate::endpoint::state::RTCPeerConnectionState;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::router::{MessageLog, MessageRouter};
use crate::signal::{InProcessRelay, Relay, SignalMessage};
use crate::transport::LoopbackNetwork;
use crate::types::EndpointId;
use log::{debug, error, info, warn};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use peer::{spawn_peer, PeerHandle, PeerNotification};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// NegotiationState tracks the handshake of the endpoint pair.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    #[default]
    Idle,
    OfferCreated,
    /// the offer is set as local description on the offerer and as remote
    /// description on the answerer
    OfferExchanged,
    AnswerCreated,
    AnswerExchanged,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferCreated => "offer-created",
            NegotiationState::OfferExchanged => "offer-exchanged",
            NegotiationState::AnswerCreated => "answer-created",
            NegotiationState::AnswerExchanged => "answer-exchanged",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Default, Debug)]
struct PairState {
    negotiation: NegotiationState,
    connected: bool,
    connecting: bool,
    /// bumped by every connect; a guard only releases its own attempt
    attempt: u64,
}

impl PairState {
    fn advance(&mut self, negotiation: NegotiationState) {
        if self.negotiation != NegotiationState::Closed {
            debug!("pair {} -> {}", self.negotiation, negotiation);
            self.negotiation = negotiation;
        }
    }
}

/// ConnectGuard releases the connect slot of the pair however `connect` ends;
/// a connect dropped before recording its outcome leaves the pair failed.
struct ConnectGuard {
    pair: Arc<Mutex<PairState>>,
    attempt: u64,
    settled: bool,
}

impl ConnectGuard {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        let mut pair = self.pair.lock();
        if pair.attempt != self.attempt {
            return;
        }
        pair.connecting = false;
        if !self.settled {
            warn!("connect abandoned before completion");
            pair.connected = false;
            pair.advance(NegotiationState::Failed);
        }
    }
}

/// Round is one negotiation attempt: both endpoint tasks and the task
/// dispatching their notifications.
struct Round {
    local: PeerHandle,
    remote: PeerHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Round {
    fn peer(&self, id: EndpointId) -> &PeerHandle {
        match id {
            EndpointId::Local => &self.local,
            EndpointId::Remote => &self.remote,
        }
    }

    async fn shutdown(self) {
        self.local.close().await;
        self.remote.close().await;
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!("round task ended abnormally: {}", err);
            }
        }
    }
}

/// Orchestrator owns the local/remote endpoint pair and drives it from two
/// fresh endpoints to a bidirectional open data channel.
pub struct Orchestrator {
    config: SessionConfig,
    relay: Arc<dyn Relay>,
    network: LoopbackNetwork,
    router: Arc<MessageRouter>,
    metrics: Arc<Metrics>,
    pair: Arc<Mutex<PairState>>,
    round: Mutex<Option<Round>>,
}

impl Orchestrator {
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::with_relay(config, InProcessRelay::new())
    }

    /// with_relay signals through `relay`, e.g. an InProcessRelay configured for
    /// duplicate, lossy or corrupting delivery
    pub fn with_relay(config: SessionConfig, relay: impl Relay + 'static) -> Result<Self> {
        Self::with_shared_relay(config, Arc::new(relay))
    }

    pub fn with_shared_relay(config: SessionConfig, relay: Arc<dyn Relay>) -> Result<Self> {
        if config.endpoint_config.host_ips().is_empty() {
            return Err(Error::invalid_state("endpoint config has no host address"));
        }
        let metrics = Arc::new(Metrics::new(config.meter.clone()));
        Ok(Self {
            relay,
            network: LoopbackNetwork::new(),
            router: Arc::new(MessageRouter::new(Arc::clone(&metrics))),
            metrics,
            pair: Arc::new(Mutex::new(PairState::default())),
            round: Mutex::new(None),
            config,
        })
    }

    pub fn state(&self) -> NegotiationState {
        self.pair.lock().negotiation
    }

    /// is_connected is true from the end of a successful connect until a
    /// channel closes or the pair is closed
    pub fn is_connected(&self) -> bool {
        self.pair.lock().connected
    }

    /// message_log is a snapshot of what `endpoint_id` received so far
    pub fn message_log(&self, endpoint_id: EndpointId) -> MessageLog {
        self.router.log(endpoint_id)
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// connect negotiates a new round between fresh endpoints and returns once
    /// the local channel is open and the remote one announced.
    ///
    /// Fails with `InvalidState` while a round is in flight or connected. After
    /// a failure or close, calling it again is the recovery path.
    pub async fn connect(&self) -> Result<()> {
        let attempt = {
            let mut pair = self.pair.lock();
            if pair.connecting {
                return Err(Error::invalid_state("connect while a negotiation is in flight"));
            }
            match pair.negotiation {
                NegotiationState::Idle | NegotiationState::Failed | NegotiationState::Closed => {}
                state => {
                    return Err(Error::invalid_state(format!("connect on {state} pair")));
                }
            }
            pair.connecting = true;
            pair.attempt += 1;
            pair.attempt
        };
        let mut guard = ConnectGuard {
            pair: Arc::clone(&self.pair),
            attempt,
            settled: false,
        };

        let previous = self.round.lock().take();
        if let Some(previous) = previous {
            info!("tearing down previous round");
            previous.shutdown().await;
        }
        self.router.detach_all();
        {
            let mut pair = self.pair.lock();
            pair.negotiation = NegotiationState::Idle;
            pair.connected = false;
        }

        info!("connect: negotiating a new round");
        self.metrics.record_negotiation_count(1, &[]);
        let start = Instant::now();

        let (mut progress, local, remote) = self.spawn_round();
        let timeout = self.config.connectivity_timeout;
        let result = match tokio::time::timeout(
            timeout,
            self.negotiate(&local, &remote, &mut progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectivityTimeout(timeout)),
        };

        match result {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                {
                    let mut pair = self.pair.lock();
                    pair.advance(NegotiationState::Connected);
                    pair.connected = pair.negotiation == NegotiationState::Connected;
                }
                guard.settle();
                info!("connect: pair connected in {} ms", elapsed);
                self.metrics.record_negotiation_time(elapsed, &[]);
                Ok(())
            }
            Err(err) => {
                error!("connect failed: {}", err);
                {
                    let mut pair = self.pair.lock();
                    pair.connected = false;
                    pair.advance(NegotiationState::Failed);
                }
                guard.settle();
                self.metrics.record_negotiation_failure_count(
                    1,
                    &[KeyValue::new("error", err.to_string())],
                );
                local.fail(err.to_string());
                remote.fail(err.to_string());
                if matches!(err, Error::ConnectivityTimeout(_)) {
                    let round = self.round.lock().take();
                    if let Some(round) = round {
                        round.shutdown().await;
                    }
                    self.router.detach_all();
                }
                Err(err)
            }
        }
    }

    fn spawn_round(&self) -> (Progress, PeerHandle, PeerHandle) {
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(3);
        let mut spawn = |id| {
            let (handle, task) = spawn_peer(
                id,
                Arc::clone(&self.config.endpoint_config),
                self.network.clone(),
                Arc::clone(&self.relay),
                notification_tx.clone(),
                Arc::clone(&self.metrics),
            );
            tasks.push(task);
            handle
        };
        let local = spawn(EndpointId::Local);
        let remote = spawn(EndpointId::Remote);
        drop(notification_tx);

        tasks.push(tokio::spawn(dispatch(
            notification_rx,
            progress_tx,
            Arc::clone(&self.router),
            Arc::clone(&self.pair),
        )));

        *self.round.lock() = Some(Round {
            local: local.clone(),
            remote: remote.clone(),
            tasks,
        });

        (
            Progress {
                rx: progress_rx,
                local_open: false,
                remote_announced: false,
            },
            local,
            remote,
        )
    }

    async fn negotiate(
        &self,
        local: &PeerHandle,
        remote: &PeerHandle,
        progress: &mut Progress,
    ) -> Result<()> {
        local
            .create_data_channel(self.config.data_channel_config.clone())
            .await?;

        let offer = local.create_offer().await?;
        info!("connect: {} created offer", local.id());
        self.advance(NegotiationState::OfferCreated);
        local.set_local_description(offer.clone()).await?;
        self.relay.send(
            remote.id(),
            SignalMessage::Description { description: offer },
        )?;
        progress
            .description_applied(remote.id(), RTCSdpType::Offer)
            .await?;
        self.advance(NegotiationState::OfferExchanged);

        let answer = remote.create_answer().await?;
        info!("connect: {} created answer", remote.id());
        self.advance(NegotiationState::AnswerCreated);
        remote.set_local_description(answer.clone()).await?;
        self.relay.send(
            local.id(),
            SignalMessage::Description {
                description: answer,
            },
        )?;
        progress
            .description_applied(local.id(), RTCSdpType::Answer)
            .await?;
        self.advance(NegotiationState::AnswerExchanged);

        progress.channels_open().await
    }

    fn advance(&self, negotiation: NegotiationState) {
        self.pair.lock().advance(negotiation);
    }

    /// send_message sends `text` from `endpoint_id` to its peer; empty text is a no-op
    pub async fn send_message(&self, endpoint_id: EndpointId, text: &str) -> Result<()> {
        let peer = self
            .round
            .lock()
            .as_ref()
            .map(|round| round.peer(endpoint_id).clone());
        self.router.send(endpoint_id, text, peer.as_ref()).await
    }

    /// close force-closes both endpoints and their channels; message logs are kept
    pub async fn close(&self) {
        {
            let mut pair = self.pair.lock();
            pair.negotiation = NegotiationState::Closed;
            pair.connected = false;
            pair.connecting = false;
        }
        self.router.detach_all();
        let round = self.round.lock().take();
        if let Some(round) = round {
            info!("closing endpoint pair");
            round.shutdown().await;
        }
    }
}

/// Progress is the orchestrator's view of one round's notifications.
struct Progress {
    rx: mpsc::UnboundedReceiver<(EndpointId, PeerNotification)>,
    local_open: bool,
    remote_announced: bool,
}

impl Progress {
    /// next returns the next notification, failing on faults of either endpoint
    async fn next(&mut self) -> Result<(EndpointId, PeerNotification)> {
        let (id, notification) = self
            .rx
            .recv()
            .await
            .ok_or_else(|| Error::invalid_state("endpoint tasks stopped during negotiation"))?;
        match notification {
            PeerNotification::CandidateRejected(err) => return Err(err),
            PeerNotification::ConnectionStateChange(RTCPeerConnectionState::Failed) => {
                return Err(Error::negotiation_failed(format!(
                    "connectivity checks failed on {id}"
                )));
            }
            PeerNotification::ConnectionStateChange(RTCPeerConnectionState::Closed) => {
                return Err(Error::EndpointClosed(id));
            }
            PeerNotification::ChannelOpen(_) if id == EndpointId::Local => {
                self.local_open = true;
            }
            PeerNotification::ChannelAnnounced(_) if id == EndpointId::Remote => {
                self.remote_announced = true;
            }
            _ => {}
        }
        Ok((id, notification))
    }

    async fn description_applied(&mut self, at: EndpointId, expected: RTCSdpType) -> Result<()> {
        loop {
            if let (id, PeerNotification::DescriptionApplied { sdp_type, result }) =
                self.next().await?
            {
                if id == at && sdp_type == expected {
                    return result;
                }
            }
        }
    }

    async fn channels_open(&mut self) -> Result<()> {
        while !(self.local_open && self.remote_announced) {
            self.next().await?;
        }
        Ok(())
    }
}

/// dispatch applies endpoint notifications to the router and the pair state,
/// then forwards them to whoever is negotiating
async fn dispatch(
    mut notification_rx: mpsc::UnboundedReceiver<(EndpointId, PeerNotification)>,
    progress_tx: mpsc::UnboundedSender<(EndpointId, PeerNotification)>,
    router: Arc<MessageRouter>,
    pair: Arc<Mutex<PairState>>,
) {
    while let Some((id, notification)) = notification_rx.recv().await {
        match &notification {
            PeerNotification::Message {
                channel_id,
                is_string,
                data,
            } => {
                router.on_message(id, *channel_id, *is_string, data.clone());
                continue;
            }
            PeerNotification::ChannelOpen(handle) | PeerNotification::ChannelAnnounced(handle) => {
                router.attach(handle.clone());
            }
            PeerNotification::ChannelClosed(channel_id) => {
                info!("{} data channel {} closed", id, channel_id);
                router.detach(id, *channel_id);
                let mut pair = pair.lock();
                pair.connected = false;
                if pair.negotiation == NegotiationState::Connected {
                    pair.negotiation = NegotiationState::Closed;
                }
            }
            PeerNotification::ChannelError(channel_id, reason) => {
                warn!("{} data channel {} errored: {}", id, channel_id, reason);
                router.detach(id, *channel_id);
            }
            PeerNotification::ConnectionStateChange(RTCPeerConnectionState::Failed) => {
                let mut pair = pair.lock();
                if pair.negotiation == NegotiationState::Connected {
                    pair.connected = false;
                    pair.negotiation = NegotiationState::Failed;
                }
            }
            _ => {}
        }
        let _ = progress_tx.send((id, notification));
    }
    debug!("round dispatcher stopped");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_negotiation_state_string() {
        let tests = vec![
            (NegotiationState::Idle, "idle"),
            (NegotiationState::OfferExchanged, "offer-exchanged"),
            (NegotiationState::AnswerExchanged, "answer-exchanged"),
            (NegotiationState::Connected, "connected"),
            (NegotiationState::Closed, "closed"),
        ];

        for (state, expected_string) in tests {
            assert_eq!(state.to_string(), expected_string);
        }
    }

    #[test]
    fn test_closed_pair_does_not_advance() {
        let mut pair = PairState::default();
        pair.advance(NegotiationState::OfferCreated);
        assert_eq!(pair.negotiation, NegotiationState::OfferCreated);

        pair.negotiation = NegotiationState::Closed;
        pair.advance(NegotiationState::Failed);
        assert_eq!(pair.negotiation, NegotiationState::Closed);
    }

    #[test]
    fn test_abandoned_connect_releases_pair() {
        let pair = Arc::new(Mutex::new(PairState {
            negotiation: NegotiationState::OfferCreated,
            connecting: true,
            attempt: 2,
            ..Default::default()
        }));

        // a guard of an earlier attempt leaves the current one alone
        drop(ConnectGuard {
            pair: Arc::clone(&pair),
            attempt: 1,
            settled: false,
        });
        assert!(pair.lock().connecting);
        assert_eq!(pair.lock().negotiation, NegotiationState::OfferCreated);

        drop(ConnectGuard {
            pair: Arc::clone(&pair),
            attempt: 2,
            settled: false,
        });
        assert!(!pair.lock().connecting);
        assert_eq!(pair.lock().negotiation, NegotiationState::Failed);

        {
            let mut pair = pair.lock();
            pair.negotiation = NegotiationState::Connected;
            pair.connecting = true;
        }
        let mut guard = ConnectGuard {
            pair: Arc::clone(&pair),
            attempt: 2,
            settled: false,
        };
        guard.settle();
        drop(guard);
        assert!(!pair.lock().connecting);
        assert_eq!(pair.lock().negotiation, NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_close_before_connect() -> Result<()> {
        let orchestrator = Orchestrator::new(SessionConfig::new()?)?;
        orchestrator.close().await;
        assert_eq!(orchestrator.state(), NegotiationState::Closed);
        assert!(!orchestrator.is_connected());
        assert!(orchestrator.message_log(EndpointId::Local).is_empty());
        Ok(())
    }
}
