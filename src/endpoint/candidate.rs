use crate::error::{Error, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

pub(crate) const CANDIDATE_PREFIX: &str = "candidate:";
pub(crate) const COMPONENT_RTP: u16 = 1;

const TYPE_PREFERENCE_HOST: u32 = 126;
const TYPE_PREFERENCE_PRFLX: u32 = 110;
const TYPE_PREFERENCE_SRFLX: u32 = 100;
const TYPE_PREFERENCE_RELAY: u32 = 0;
const LOCAL_PREFERENCE: u32 = 65535;

/// RTCIceParameters holds the ICE username fragment and password of one
/// negotiation round.
#[derive(Default, Debug, Clone, Eq, PartialEq)]
pub struct RTCIceParameters {
    pub username_fragment: String,
    pub password: String,
}

impl RTCIceParameters {
    pub(crate) fn generate() -> Self {
        let rng = SystemRandom::new();

        let mut user = [0u8; 9];
        let _ = rng.fill(&mut user);
        let mut password = [0u8; 18];
        let _ = rng.fill(&mut password);

        Self {
            username_fragment: BASE64_STANDARD.encode(&user[..]),
            password: BASE64_STANDARD.encode(&password[..]),
        }
    }

    pub fn valid(&self) -> bool {
        self.username_fragment.len() >= 4
            && self.username_fragment.len() <= 256
            && self.password.len() >= 22
            && self.password.len() <= 256
    }
}

/// ICEProtocol indicates the transport protocol type that is used in the
/// ice.URL structure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RTCIceProtocol {
    Udp,
    Tcp,
}

impl FromStr for RTCIceProtocol {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_lowercase().as_str() {
            "udp" => Ok(RTCIceProtocol::Udp),
            "tcp" => Ok(RTCIceProtocol::Tcp),
            _ => Err(Error::invalid_candidate(format!("unknown protocol '{raw}'"))),
        }
    }
}

impl fmt::Display for RTCIceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RTCIceProtocol::Udp => write!(f, "udp"),
            RTCIceProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// ICECandidateType represents the type of the ICE candidate used.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RTCIceCandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl RTCIceCandidateType {
    fn preference(&self) -> u32 {
        match self {
            RTCIceCandidateType::Host => TYPE_PREFERENCE_HOST,
            RTCIceCandidateType::Prflx => TYPE_PREFERENCE_PRFLX,
            RTCIceCandidateType::Srflx => TYPE_PREFERENCE_SRFLX,
            RTCIceCandidateType::Relay => TYPE_PREFERENCE_RELAY,
        }
    }
}

impl FromStr for RTCIceCandidateType {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "host" => Ok(RTCIceCandidateType::Host),
            "srflx" => Ok(RTCIceCandidateType::Srflx),
            "prflx" => Ok(RTCIceCandidateType::Prflx),
            "relay" => Ok(RTCIceCandidateType::Relay),
            _ => Err(Error::invalid_candidate(format!(
                "unknown candidate type '{raw}'"
            ))),
        }
    }
}

impl fmt::Display for RTCIceCandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RTCIceCandidateType::Host => write!(f, "host"),
            RTCIceCandidateType::Srflx => write!(f, "srflx"),
            RTCIceCandidateType::Prflx => write!(f, "prflx"),
            RTCIceCandidateType::Relay => write!(f, "relay"),
        }
    }
}

/// ICECandidateInit is used to serialize ice candidates, in the same shape
/// browsers hand them to the signaling layer.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RTCIceCandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl RTCIceCandidateInit {
    /// the empty candidate marks the end of a gathering generation
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// ICECandidate represents one network path usable for connectivity, as
/// carried by `a=candidate` lines (RFC 8839 section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RTCIceCandidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: RTCIceProtocol,
    pub priority: u32,
    pub address: IpAddr,
    pub port: u16,
    pub typ: RTCIceCandidateType,
    pub related_address: Option<SocketAddr>,
    pub extensions: Vec<(String, String)>,
}

impl RTCIceCandidate {
    /// host candidate for a locally bound address
    pub(crate) fn host(addr: SocketAddr) -> Self {
        Self::new(addr, RTCIceCandidateType::Host)
    }

    /// peer reflexive candidate learned from an inbound connectivity check
    pub(crate) fn peer_reflexive(addr: SocketAddr) -> Self {
        Self::new(addr, RTCIceCandidateType::Prflx)
    }

    fn new(addr: SocketAddr, typ: RTCIceCandidateType) -> Self {
        let protocol = RTCIceProtocol::Udp;
        Self {
            foundation: compute_foundation(typ, addr.ip(), protocol),
            component: COMPONENT_RTP,
            protocol,
            priority: compute_priority(typ, COMPONENT_RTP),
            address: addr.ip(),
            port: addr.port(),
            typ,
            related_address: None,
            extensions: vec![("generation".to_owned(), "0".to_owned())],
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// two candidates describe the same path regardless of foundation or priority
    pub(crate) fn same_path(&self, other: &RTCIceCandidate) -> bool {
        self.component == other.component
            && self.protocol == other.protocol
            && self.address == other.address
            && self.port == other.port
            && self.typ == other.typ
    }

    /// a pair can carry traffic when protocol and address family match
    pub(crate) fn is_compatible(&self, remote: &RTCIceCandidate) -> bool {
        self.component == remote.component
            && self.protocol == RTCIceProtocol::Udp
            && remote.protocol == RTCIceProtocol::Udp
            && self.address.is_ipv4() == remote.address.is_ipv4()
    }

    /// marshal returns the attribute value without the `candidate:` prefix
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.typ
        );
        if let Some(related_address) = &self.related_address {
            val += format!(
                " raddr {} rport {}",
                related_address.ip(),
                related_address.port()
            )
            .as_str();
        }
        for (key, value) in &self.extensions {
            val += format!(" {key} {value}").as_str();
        }
        val
    }

    /// unmarshal parses a candidate attribute value, with or without the `candidate:` prefix
    pub fn unmarshal(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let raw = raw.strip_prefix(CANDIDATE_PREFIX).unwrap_or(raw);
        let split: Vec<&str> = raw.split_whitespace().collect();
        if split.len() < 8 {
            return Err(Error::invalid_candidate(format!(
                "attribute not long enough to be ICE candidate ({})",
                split.len()
            )));
        }

        let foundation = split[0].to_owned();
        let component: u16 = split[1]
            .parse()
            .map_err(|_| Error::invalid_candidate(format!("invalid component '{}'", split[1])))?;
        if component == 0 {
            return Err(Error::invalid_candidate("component must be positive"));
        }
        let protocol = RTCIceProtocol::from_str(split[2])?;
        let priority: u32 = split[3]
            .parse()
            .map_err(|_| Error::invalid_candidate(format!("invalid priority '{}'", split[3])))?;
        let address: IpAddr = split[4].parse().map_err(|_| {
            Error::invalid_candidate(format!("unresolvable address '{}'", split[4]))
        })?;
        let port: u16 = split[5]
            .parse()
            .map_err(|_| Error::invalid_candidate(format!("invalid port '{}'", split[5])))?;
        if split[6] != "typ" {
            return Err(Error::invalid_candidate(format!(
                "expected 'typ' but found '{}'",
                split[6]
            )));
        }
        let typ = RTCIceCandidateType::from_str(split[7])?;

        let mut related_ip: Option<IpAddr> = None;
        let mut related_port: Option<u16> = None;
        let mut extensions = vec![];
        let rest = &split[8..];
        if rest.len() % 2 != 0 {
            return Err(Error::invalid_candidate(
                "candidate extensions must be key value pairs",
            ));
        }
        for pair in rest.chunks(2) {
            match pair[0] {
                "raddr" => {
                    related_ip = Some(pair[1].parse().map_err(|_| {
                        Error::invalid_candidate(format!("invalid raddr '{}'", pair[1]))
                    })?);
                }
                "rport" => {
                    related_port = Some(pair[1].parse().map_err(|_| {
                        Error::invalid_candidate(format!("invalid rport '{}'", pair[1]))
                    })?);
                }
                key => extensions.push((key.to_owned(), pair[1].to_owned())),
            }
        }
        let related_address = match (related_ip, related_port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            (None, None) => None,
            _ => {
                return Err(Error::invalid_candidate(
                    "raddr and rport must be given together",
                ))
            }
        };

        Ok(Self {
            foundation,
            component,
            protocol,
            priority,
            address,
            port,
            typ,
            related_address,
            extensions,
        })
    }

    /// the ufrag extension, when the sender tagged the candidate with its generation
    pub fn ufrag(&self) -> Option<&str> {
        self.extensions
            .iter()
            .find(|(key, _)| key == "ufrag")
            .map(|(_, value)| value.as_str())
    }

    /// to_json returns the browser `RTCIceCandidateInit` shape
    /// <https://w3c.github.io/webrtc-pc/#dom-rtcicecandidate-tojson>
    pub fn to_json(&self, sdp_mid: &str, username_fragment: &str) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("{}{}", CANDIDATE_PREFIX, self.marshal()),
            sdp_mid: Some(sdp_mid.to_owned()),
            sdp_mline_index: Some(0),
            username_fragment: Some(username_fragment.to_owned()),
        }
    }
}

impl FromStr for RTCIceCandidate {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        RTCIceCandidate::unmarshal(raw)
    }
}

impl fmt::Display for RTCIceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.marshal())
    }
}

/// priority = 2^24 * type preference + 2^8 * local preference + (256 - component)
pub(crate) fn compute_priority(typ: RTCIceCandidateType, component: u16) -> u32 {
    (1 << 24) * typ.preference() + (1 << 8) * LOCAL_PREFERENCE + (256 - component as u32)
}

fn compute_foundation(typ: RTCIceCandidateType, ip: IpAddr, protocol: RTCIceProtocol) -> String {
    let mut h = Sha256::new();
    h.update(typ.to_string().as_bytes());
    h.update(ip.to_string().as_bytes());
    h.update(protocol.to_string().as_bytes());
    let hashed = h.finalize();
    hex::encode(&hashed[..4])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ice_parameters_generate() {
        let params = RTCIceParameters::generate();
        assert!(params.valid(), "{params:?}");
        assert_ne!(params, RTCIceParameters::generate());
    }

    #[test]
    fn test_candidate_unmarshal() -> Result<()> {
        let tests = vec![
            (
                "candidate:842163049 1 udp 1677729535 192.0.2.3 54400 typ srflx raddr 10.0.0.1 rport 9 generation 0",
                RTCIceCandidateType::Srflx,
                "192.0.2.3:54400",
                Some("10.0.0.1:9"),
            ),
            (
                "1 1 UDP 2130706431 127.0.0.1 5000 typ host",
                RTCIceCandidateType::Host,
                "127.0.0.1:5000",
                None,
            ),
            (
                "4 1 udp 16777215 ::1 3478 typ relay raddr ::1 rport 1 ufrag abcd",
                RTCIceCandidateType::Relay,
                "[::1]:3478",
                Some("[::1]:1"),
            ),
        ];

        for (raw, typ, addr, related) in tests {
            let candidate = RTCIceCandidate::unmarshal(raw)?;
            assert_eq!(candidate.typ, typ, "{raw}");
            assert_eq!(candidate.addr().to_string(), addr, "{raw}");
            assert_eq!(
                candidate.related_address.map(|a| a.to_string()),
                related.map(|r| r.to_owned()),
                "{raw}"
            );
        }
        Ok(())
    }

    #[test]
    fn test_candidate_unmarshal_invalid() {
        let tests = vec![
            "",
            "candidate:1 1 udp",
            "1 x udp 1 127.0.0.1 5000 typ host",
            "1 0 udp 1 127.0.0.1 5000 typ host",
            "1 1 sctp 1 127.0.0.1 5000 typ host",
            "1 1 udp -1 127.0.0.1 5000 typ host",
            "1 1 udp 1 abc.local 5000 typ host",
            "1 1 udp 1 127.0.0.1 70000 typ host",
            "1 1 udp 1 127.0.0.1 5000 type host",
            "1 1 udp 1 127.0.0.1 5000 typ nat",
            "1 1 udp 1 127.0.0.1 5000 typ host raddr",
            "1 1 udp 1 127.0.0.1 5000 typ srflx raddr 10.0.0.1 generation 0",
        ];

        for raw in tests {
            let result = RTCIceCandidate::unmarshal(raw);
            assert!(
                matches!(result, Err(Error::InvalidCandidate(_))),
                "expected InvalidCandidate for '{raw}', got {result:?}"
            );
        }
    }

    #[test]
    fn test_candidate_marshal_parse_back() -> Result<()> {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let candidate = RTCIceCandidate::host(addr);
        assert_eq!(candidate.priority, 2130706431);

        let init = candidate.to_json("0", "ufrag");
        assert!(init.candidate.starts_with(CANDIDATE_PREFIX));
        let parsed = RTCIceCandidate::unmarshal(&init.candidate)?;
        assert_eq!(parsed, candidate);
        assert!(parsed.same_path(&candidate));
        Ok(())
    }

    #[test]
    fn test_candidate_compatibility() {
        let v4 = RTCIceCandidate::host("127.0.0.1:1000".parse().unwrap());
        let v4_other = RTCIceCandidate::host("127.0.0.2:2000".parse().unwrap());
        let v6 = RTCIceCandidate::host("[::1]:1000".parse().unwrap());
        let mut tcp = v4_other.clone();
        tcp.protocol = RTCIceProtocol::Tcp;

        assert!(v4.is_compatible(&v4_other));
        assert!(!v4.is_compatible(&v6));
        assert!(!v4.is_compatible(&tcp));
    }

    #[test]
    fn test_candidate_init_json() -> serde_json::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".to_owned(),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_string(&init)?;
        assert_eq!(
            json,
            r#"{"candidate":"candidate:1 1 udp 1 127.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}"#
        );
        assert_eq!(serde_json::from_str::<RTCIceCandidateInit>(&json)?, init);
        assert!(RTCIceCandidateInit::default().is_end_of_candidates());
        Ok(())
    }
}
