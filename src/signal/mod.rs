use crate::description::RTCSessionDescription;
use crate::endpoint::candidate::RTCIceCandidateInit;
use crate::error::{Error, Result};
use crate::types::EndpointId;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// SignalMessage is what crosses the relay, in the JSON shape browsers use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    #[serde(rename = "description")]
    Description { description: RTCSessionDescription },
    #[serde(rename = "candidate")]
    Candidate { candidate: RTCIceCandidateInit },
}

/// Relay carries signaling between endpoints. Delivery is asynchronous and at
/// least once; candidates may be reordered or lost.
pub trait Relay: Send + Sync {
    /// register opens the mailbox of `id`, replacing a previous one
    fn register(&self, id: EndpointId) -> RelayInbox;

    /// unregister closes the mailbox of `id`; its inbox then drains and ends
    fn unregister(&self, id: EndpointId);

    fn send(&self, to: EndpointId, message: SignalMessage) -> Result<()>;
}

type CandidateFilter = Box<dyn Fn(EndpointId, &RTCIceCandidateInit) -> bool + Send + Sync>;
type DescriptionFilter = Box<dyn Fn(EndpointId, &RTCSessionDescription) -> bool + Send + Sync>;

/// InProcessRelay serializes every message to JSON and hands it to the
/// recipient's mailbox, as a signaling server would.
#[derive(Default)]
pub struct InProcessRelay {
    mailboxes: Mutex<HashMap<EndpointId, mpsc::UnboundedSender<String>>>,
    duplicate_candidates: bool,
    candidate_filter: Option<CandidateFilter>,
    description_corruption: Option<DescriptionFilter>,
}

impl InProcessRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// deliver every candidate twice
    pub fn with_duplicate_candidates(mut self, duplicate_candidates: bool) -> Self {
        self.duplicate_candidates = duplicate_candidates;
        self
    }

    /// only candidates for which `filter(recipient, candidate)` holds are delivered
    pub fn with_candidate_filter(
        mut self,
        filter: impl Fn(EndpointId, &RTCIceCandidateInit) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.candidate_filter = Some(Box::new(filter));
        self
    }

    /// descriptions for which `corrupt(recipient, description)` holds arrive
    /// with an unparseable sdp
    pub fn with_description_corruption(
        mut self,
        corrupt: impl Fn(EndpointId, &RTCSessionDescription) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.description_corruption = Some(Box::new(corrupt));
        self
    }
}

impl Relay for InProcessRelay {
    fn register(&self, id: EndpointId) -> RelayInbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.lock().insert(id, tx);
        RelayInbox::new(id, rx)
    }

    fn unregister(&self, id: EndpointId) {
        self.mailboxes.lock().remove(&id);
    }

    fn send(&self, to: EndpointId, mut message: SignalMessage) -> Result<()> {
        let copies = match &mut message {
            SignalMessage::Candidate { candidate } => {
                if let Some(filter) = &self.candidate_filter {
                    if !filter(to, candidate) {
                        debug!("relay drops candidate '{}' to {}", candidate.candidate, to);
                        return Ok(());
                    }
                }
                if self.duplicate_candidates {
                    2
                } else {
                    1
                }
            }
            SignalMessage::Description { description } => {
                if let Some(corrupt) = &self.description_corruption {
                    if corrupt(to, description) {
                        debug!("relay corrupts {} to {}", description.sdp_type, to);
                        description.sdp = format!("corrupted\r\n{}", description.sdp);
                        description.parsed = None;
                    }
                }
                1
            }
        };

        let text = serde_json::to_string(&message)?;
        let mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes.get(&to).ok_or(Error::SignalingUnavailable(to))?;
        for _ in 0..copies {
            trace!("relay to {}: {}", to, text);
            mailbox
                .send(text.clone())
                .map_err(|_| Error::SignalingUnavailable(to))?;
        }
        Ok(())
    }
}

/// RelayInbox is the receiving end of one endpoint's mailbox.
pub struct RelayInbox {
    id: EndpointId,
    rx: mpsc::UnboundedReceiver<String>,
}

impl RelayInbox {
    /// new wraps the receiving half a relay delivers serialized messages to
    pub fn new(id: EndpointId, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { id, rx }
    }

    /// recv returns the next well-formed message, or None once the relay is gone
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        loop {
            let text = self.rx.recv().await?;
            match serde_json::from_str::<SignalMessage>(&text) {
                Ok(message) => return Some(message),
                Err(err) => warn!("relay inbox of {} drops malformed message: {}", self.id, err),
            }
        }
    }
}
