use super::candidate::{compute_priority, RTCIceCandidate, RTCIceCandidateType, RTCIceParameters};
use crate::error::{Error, Result};
use crate::types::{TaggedBytesMut, TransportContext};
use bytes::BytesMut;
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use stun::attributes::{
    ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING, ATTR_PRIORITY, ATTR_USERNAME, ATTR_USE_CANDIDATE,
};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{
    Message, Setter, TransactionId, BINDING_REQUEST, BINDING_SUCCESS, CLASS_REQUEST,
    CLASS_SUCCESS_RESPONSE, METHOD_BINDING,
};
use stun::textattrs::TextAttribute;
use stun::xoraddr::XorMappedAddress;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CandidatePairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
struct CandidatePair {
    local: SocketAddr,
    remote: SocketAddr,
    priority: u64,
    state: CandidatePairState,
    binding_requests: u16,
}

impl CandidatePair {
    fn transport(&self) -> TransportContext {
        TransportContext {
            local_addr: self.local,
            peer_addr: self.remote,
        }
    }
}

/// IceAgent runs connectivity checks over the candidate pairs of one
/// negotiation round and selects the pair the data plane rides on.
pub(crate) struct IceAgent {
    controlling: bool,
    tie_breaker: u64,
    local_parameters: RTCIceParameters,
    remote_parameters: Option<RTCIceParameters>,
    local_candidates: Vec<RTCIceCandidate>,
    remote_candidates: Vec<RTCIceCandidate>,
    pairs: Vec<CandidatePair>,
    selected_pair: Option<TransportContext>,
    transactions: HashMap<[u8; 12], (SocketAddr, SocketAddr)>,
    check_interval: Duration,
    max_binding_requests: u16,
    next_check: Option<Instant>,
    transmits: VecDeque<TaggedBytesMut>,
}

impl IceAgent {
    pub(crate) fn new(
        local_parameters: RTCIceParameters,
        check_interval: Duration,
        max_binding_requests: u16,
    ) -> Self {
        Self {
            controlling: false,
            tie_breaker: rand::random::<u64>(),
            local_parameters,
            remote_parameters: None,
            local_candidates: vec![],
            remote_candidates: vec![],
            pairs: vec![],
            selected_pair: None,
            transactions: HashMap::new(),
            check_interval,
            max_binding_requests,
            next_check: None,
            transmits: VecDeque::new(),
        }
    }

    pub(crate) fn set_controlling(&mut self, controlling: bool) {
        self.controlling = controlling;
    }

    pub(crate) fn is_controlling(&self) -> bool {
        self.controlling
    }

    pub(crate) fn local_parameters(&self) -> &RTCIceParameters {
        &self.local_parameters
    }

    pub(crate) fn set_remote_parameters(&mut self, remote_parameters: RTCIceParameters) {
        self.remote_parameters = Some(remote_parameters);
        self.schedule_checks();
    }

    pub(crate) fn selected_pair(&self) -> Option<TransportContext> {
        self.selected_pair
    }

    pub(crate) fn owns(&self, local_addr: SocketAddr) -> bool {
        self.local_candidates.iter().any(|c| c.addr() == local_addr)
    }

    pub(crate) fn add_local_candidate(&mut self, candidate: RTCIceCandidate) {
        if self.local_candidates.iter().any(|c| c.same_path(&candidate)) {
            return;
        }
        for remote in &self.remote_candidates {
            if candidate.is_compatible(remote) {
                Self::push_pair(&mut self.pairs, self.controlling, &candidate, remote);
            }
        }
        self.local_candidates.push(candidate);
        self.schedule_checks();
    }

    /// returns false when the candidate duplicates a known path
    pub(crate) fn add_remote_candidate(&mut self, candidate: RTCIceCandidate) -> bool {
        if self
            .remote_candidates
            .iter()
            .any(|c| c.same_path(&candidate) || c.addr() == candidate.addr())
        {
            return false;
        }
        for local in &self.local_candidates {
            if local.is_compatible(&candidate) {
                Self::push_pair(&mut self.pairs, self.controlling, local, &candidate);
            }
        }
        self.remote_candidates.push(candidate);
        self.schedule_checks();
        true
    }

    fn push_pair(
        pairs: &mut Vec<CandidatePair>,
        controlling: bool,
        local: &RTCIceCandidate,
        remote: &RTCIceCandidate,
    ) {
        if pairs
            .iter()
            .any(|p| p.local == local.addr() && p.remote == remote.addr())
        {
            return;
        }
        let (g, d) = if controlling {
            (local.priority as u64, remote.priority as u64)
        } else {
            (remote.priority as u64, local.priority as u64)
        };
        // RFC 8445 section 6.1.2.3
        let priority = (1 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d);

        trace!("new candidate pair {} -> {}", local.addr(), remote.addr());
        pairs.push(CandidatePair {
            local: local.addr(),
            remote: remote.addr(),
            priority,
            state: CandidatePairState::Waiting,
            binding_requests: 0,
        });
        pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    fn schedule_checks(&mut self) {
        if self.next_check.is_none()
            && self.selected_pair.is_none()
            && self.remote_parameters.is_some()
            && !self.pairs.is_empty()
        {
            self.next_check = Some(Instant::now());
        }
    }

    /// every pair exhausted its checks without one being selected
    pub(crate) fn is_failed(&self) -> bool {
        self.selected_pair.is_none()
            && !self.pairs.is_empty()
            && self
                .pairs
                .iter()
                .all(|p| p.state == CandidatePairState::Failed)
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        if self.selected_pair.is_some() {
            None
        } else {
            self.next_check
        }
    }

    pub(crate) fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.selected_pair.is_some() || self.remote_parameters.is_none() {
            self.next_check = None;
            return Ok(());
        }
        match self.next_check {
            Some(next_check) if now >= next_check => {}
            _ => return Ok(()),
        }

        let mut targets = vec![];
        for pair in self.pairs.iter_mut() {
            match pair.state {
                CandidatePairState::Failed | CandidatePairState::Succeeded => continue,
                CandidatePairState::Waiting | CandidatePairState::InProgress => {}
            }
            if pair.binding_requests >= self.max_binding_requests {
                debug!(
                    "candidate pair {} -> {} failed after {} binding requests",
                    pair.local, pair.remote, pair.binding_requests
                );
                pair.state = CandidatePairState::Failed;
                continue;
            }
            pair.binding_requests += 1;
            pair.state = CandidatePairState::InProgress;
            targets.push(pair.transport());
        }

        for transport in targets {
            self.send_binding_request(now, transport)?;
        }

        self.next_check = if self
            .pairs
            .iter()
            .any(|p| p.state == CandidatePairState::Waiting || p.state == CandidatePairState::InProgress)
        {
            Some(now + self.check_interval)
        } else {
            None
        };
        Ok(())
    }

    fn send_binding_request(&mut self, now: Instant, transport: TransportContext) -> Result<()> {
        let remote_parameters = self
            .remote_parameters
            .as_ref()
            .ok_or_else(|| Error::invalid_state("remote ICE parameters are not known"))?;

        let mut request = Message::new();
        request.build(&[
            Box::new(BINDING_REQUEST),
            Box::new(TransactionId::new()),
            Box::new(TextAttribute::new(
                ATTR_USERNAME,
                format!(
                    "{}:{}",
                    remote_parameters.username_fragment, self.local_parameters.username_fragment
                ),
            )),
        ])?;
        let priority = compute_priority(RTCIceCandidateType::Prflx, 1);
        request.add(ATTR_PRIORITY, &priority.to_be_bytes());
        if self.controlling {
            request.add(ATTR_ICE_CONTROLLING, &self.tie_breaker.to_be_bytes());
            request.add(ATTR_USE_CANDIDATE, &[]);
        } else {
            request.add(ATTR_ICE_CONTROLLED, &self.tie_breaker.to_be_bytes());
        }
        let integrity =
            MessageIntegrity::new_short_term_integrity(remote_parameters.password.clone());
        integrity.add_to(&mut request)?;
        FINGERPRINT.add_to(&mut request)?;

        trace!(
            "binding request {:?} sent {} -> {}",
            request.transaction_id,
            transport.local_addr,
            transport.peer_addr
        );
        self.transactions.insert(
            request.transaction_id.0,
            (transport.local_addr, transport.peer_addr),
        );
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport,
            message: BytesMut::from(&request.raw[..]),
        });
        Ok(())
    }

    /// handle_stun processes one STUN datagram and returns the pair when it
    /// was selected by this message
    pub(crate) fn handle_stun(
        &mut self,
        now: Instant,
        transport: TransportContext,
        raw: &[u8],
    ) -> Result<Option<TransportContext>> {
        let mut message = Message {
            raw: raw.to_vec(),
            ..Default::default()
        };
        message.decode()?;

        if message.typ.method != METHOD_BINDING {
            warn!(
                "drop unsupported STUN message type {} from {}",
                message.typ, transport.peer_addr
            );
            return Ok(None);
        }

        if message.typ.class == CLASS_REQUEST {
            self.handle_binding_request(now, transport, message)
        } else if message.typ.class == CLASS_SUCCESS_RESPONSE {
            self.handle_binding_success(transport, message)
        } else {
            debug!(
                "ignore STUN message type {} from {}",
                message.typ, transport.peer_addr
            );
            Ok(None)
        }
    }

    fn handle_binding_request(
        &mut self,
        now: Instant,
        transport: TransportContext,
        mut request: Message,
    ) -> Result<Option<TransportContext>> {
        let username = TextAttribute::get_from_as(&request, ATTR_USERNAME)?;
        let (target, _) = username
            .text
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("malformed USERNAME '{}'", username.text)))?;
        if target != self.local_parameters.username_fragment {
            return Err(Error::protocol(format!(
                "binding request for unknown ufrag '{target}'"
            )));
        }
        if !request.contains(ATTR_PRIORITY) {
            return Err(Error::protocol("binding request without PRIORITY"));
        }
        let peer_controlling = request.contains(ATTR_ICE_CONTROLLING);
        if peer_controlling == request.contains(ATTR_ICE_CONTROLLED) {
            return Err(Error::protocol(
                "binding request must carry exactly one of ICE-CONTROLLING and ICE-CONTROLLED",
            ));
        }

        let integrity =
            MessageIntegrity::new_short_term_integrity(self.local_parameters.password.clone());
        integrity.check(&mut request)?;

        let mut response = Message::new();
        response.build(&[
            Box::new(BINDING_SUCCESS),
            Box::new(request.transaction_id),
            Box::new(XorMappedAddress {
                ip: transport.peer_addr.ip(),
                port: transport.peer_addr.port(),
            }),
        ])?;
        let integrity =
            MessageIntegrity::new_short_term_integrity(self.local_parameters.password.clone());
        integrity.add_to(&mut response)?;
        FINGERPRINT.add_to(&mut response)?;
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport,
            message: BytesMut::from(&response.raw[..]),
        });

        if self.remote_parameters.is_none() {
            debug!(
                "answered binding request from {} before remote description",
                transport.peer_addr
            );
            return Ok(None);
        }

        if !self
            .remote_candidates
            .iter()
            .any(|c| c.addr() == transport.peer_addr)
        {
            debug!("peer reflexive candidate {}", transport.peer_addr);
            self.add_remote_candidate(RTCIceCandidate::peer_reflexive(transport.peer_addr));
        }

        if peer_controlling == self.controlling {
            warn!(
                "ICE role conflict with {}, both sides {}",
                transport.peer_addr,
                if self.controlling {
                    "controlling"
                } else {
                    "controlled"
                }
            );
            return Ok(None);
        }

        if !self.controlling
            && request.contains(ATTR_USE_CANDIDATE)
            && self.selected_pair.is_none()
        {
            return Ok(self.select(transport));
        }
        Ok(None)
    }

    fn handle_binding_success(
        &mut self,
        transport: TransportContext,
        mut response: Message,
    ) -> Result<Option<TransportContext>> {
        let Some((local, remote)) = self.transactions.remove(&response.transaction_id.0) else {
            debug!(
                "drop binding response with unknown transaction from {}",
                transport.peer_addr
            );
            return Ok(None);
        };
        let remote_parameters = self
            .remote_parameters
            .as_ref()
            .ok_or_else(|| Error::invalid_state("remote ICE parameters are not known"))?;
        let integrity =
            MessageIntegrity::new_short_term_integrity(remote_parameters.password.clone());
        integrity.check(&mut response)?;

        let pair_transport = TransportContext {
            local_addr: local,
            peer_addr: remote,
        };
        if let Some(pair) = self
            .pairs
            .iter_mut()
            .find(|p| p.local == local && p.remote == remote)
        {
            pair.state = CandidatePairState::Succeeded;
        }
        debug!("candidate pair {} -> {} succeeded", local, remote);

        if self.controlling && self.selected_pair.is_none() {
            Ok(self.select(pair_transport))
        } else {
            Ok(None)
        }
    }

    fn select(&mut self, transport: TransportContext) -> Option<TransportContext> {
        if !self.owns(transport.local_addr) {
            warn!(
                "cannot select pair on unknown local address {}",
                transport.local_addr
            );
            return None;
        }
        debug!(
            "selected candidate pair {} -> {}",
            transport.local_addr, transport.peer_addr
        );
        self.selected_pair = Some(transport);
        self.next_check = None;
        self.transactions.clear();
        Some(transport)
    }

    pub(crate) fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.transmits.pop_front()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_agent(controlling: bool, addr: &str) -> (IceAgent, RTCIceCandidate) {
        let mut agent = IceAgent::new(
            RTCIceParameters::generate(),
            Duration::from_millis(10),
            3,
        );
        agent.set_controlling(controlling);
        let candidate = RTCIceCandidate::host(addr.parse().unwrap());
        agent.add_local_candidate(candidate.clone());
        (agent, candidate)
    }

    /// delivers every queued datagram of `from` into `to`
    fn pump(from: &mut IceAgent, to: &mut IceAgent) -> Result<Option<TransportContext>> {
        let mut selected = None;
        while let Some(transmit) = from.poll_transmit() {
            if let Some(pair) =
                to.handle_stun(transmit.now, transmit.transport.reversed(), &transmit.message)?
            {
                selected = Some(pair);
            }
        }
        Ok(selected)
    }

    #[test]
    fn test_agents_select_pair() -> Result<()> {
        let (mut offerer, offerer_candidate) = new_agent(true, "127.0.0.1:4000");
        let (mut answerer, answerer_candidate) = new_agent(false, "127.0.0.1:5000");
        offerer.set_remote_parameters(answerer.local_parameters().clone());
        answerer.set_remote_parameters(offerer.local_parameters().clone());
        assert!(offerer.add_remote_candidate(answerer_candidate.clone()));
        assert!(answerer.add_remote_candidate(offerer_candidate.clone()));
        assert!(!answerer.add_remote_candidate(offerer_candidate.clone()));

        let now = offerer.poll_timeout().unwrap();
        offerer.handle_timeout(now)?;
        let answerer_selected = pump(&mut offerer, &mut answerer)?;
        let offerer_selected = pump(&mut answerer, &mut offerer)?;

        let expected = TransportContext {
            local_addr: offerer_candidate.addr(),
            peer_addr: answerer_candidate.addr(),
        };
        assert_eq!(offerer_selected, Some(expected));
        assert_eq!(answerer_selected, Some(expected.reversed()));
        assert_eq!(offerer.poll_timeout(), None);
        Ok(())
    }

    #[test]
    fn test_controlled_waits_for_nomination() -> Result<()> {
        let (mut offerer, offerer_candidate) = new_agent(true, "127.0.0.1:4000");
        let (mut answerer, answerer_candidate) = new_agent(false, "127.0.0.1:5000");
        offerer.set_remote_parameters(answerer.local_parameters().clone());
        answerer.set_remote_parameters(offerer.local_parameters().clone());
        offerer.add_remote_candidate(answerer_candidate);
        answerer.add_remote_candidate(offerer_candidate);

        let now = answerer.poll_timeout().unwrap();
        answerer.handle_timeout(now)?;
        // a non-nominating check selects nothing on the controlling side
        assert_eq!(pump(&mut answerer, &mut offerer)?, None);
        // and its success response only marks the pair succeeded
        assert_eq!(pump(&mut offerer, &mut answerer)?, None);
        assert_eq!(answerer.selected_pair(), None);
        Ok(())
    }

    #[test]
    fn test_wrong_password_rejected() -> Result<()> {
        let (mut offerer, _) = new_agent(true, "127.0.0.1:4000");
        let (mut answerer, answerer_candidate) = new_agent(false, "127.0.0.1:5000");
        let mut wrong = answerer.local_parameters().clone();
        wrong.password = RTCIceParameters::generate().password;
        offerer.set_remote_parameters(wrong);
        offerer.add_remote_candidate(answerer_candidate);

        let now = offerer.poll_timeout().unwrap();
        offerer.handle_timeout(now)?;
        assert!(pump(&mut offerer, &mut answerer).is_err());
        Ok(())
    }

    #[test]
    fn test_pairs_fail_after_max_requests() -> Result<()> {
        let (mut offerer, _) = new_agent(true, "127.0.0.1:4000");
        offerer.set_remote_parameters(RTCIceParameters::generate());
        offerer.add_remote_candidate(RTCIceCandidate::host("127.0.0.1:6000".parse().unwrap()));
        // incompatible family forms no pair
        offerer.add_remote_candidate(RTCIceCandidate::host("[::1]:6000".parse().unwrap()));

        let mut now = offerer.poll_timeout().unwrap();
        for _ in 0..4 {
            offerer.handle_timeout(now)?;
            now += Duration::from_millis(10);
        }
        let mut sent = 0;
        while offerer.poll_transmit().is_some() {
            sent += 1;
        }
        assert_eq!(sent, 3);
        assert!(offerer.is_failed());
        assert_eq!(offerer.poll_timeout(), None);
        Ok(())
    }
}
