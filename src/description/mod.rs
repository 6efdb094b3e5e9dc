pub(crate) mod sdp_type;

use crate::certificate::RTCDtlsFingerprint;
use crate::endpoint::candidate::{RTCIceCandidate, RTCIceParameters};
use crate::error::{Error, Result};
use sdp::description::common::{Address, ConnectionInformation};
use sdp::description::media::{MediaName, RangedPort};
use sdp::description::session::{ATTR_KEY_CONNECTION_SETUP, ATTR_KEY_GROUP, ATTR_KEY_MID};
use sdp::util::ConnectionRole;
use sdp::{MediaDescription, SessionDescription};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

pub use sdp_type::RTCSdpType;

pub(crate) const MEDIA_SECTION_APPLICATION: &str = "application";
pub(crate) const DATA_CHANNEL_FORMAT: &str = "webrtc-datachannel";
pub(crate) const DATA_CHANNEL_MID: &str = "0";
pub(crate) const SCTP_PORT: u16 = 5000;
pub(crate) const MAX_MESSAGE_SIZE: u32 = 262144;

/// SessionDescription is used to expose local and remote session descriptions.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct RTCSessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: RTCSdpType,

    pub sdp: String,

    /// This will never be initialized by callers, internal use only
    #[serde(skip)]
    pub(crate) parsed: Option<SessionDescription>,
}

impl PartialEq for RTCSessionDescription {
    fn eq(&self, other: &Self) -> bool {
        self.sdp_type == other.sdp_type && self.sdp == other.sdp
    }
}

impl RTCSessionDescription {
    /// Given SDP representing an answer, wrap it in an RTCSessionDescription
    /// that can be given to a PeerEndpoint.
    pub fn answer(sdp: String) -> Result<RTCSessionDescription> {
        let mut desc = RTCSessionDescription {
            sdp,
            sdp_type: RTCSdpType::Answer,
            parsed: None,
        };

        let parsed = desc.unmarshal()?;
        desc.parsed = Some(parsed);

        Ok(desc)
    }

    /// Given SDP representing an offer, wrap it in an RTCSessionDescription
    /// that can be given to a PeerEndpoint.
    pub fn offer(sdp: String) -> Result<RTCSessionDescription> {
        let mut desc = RTCSessionDescription {
            sdp,
            sdp_type: RTCSdpType::Offer,
            parsed: None,
        };

        let parsed = desc.unmarshal()?;
        desc.parsed = Some(parsed);

        Ok(desc)
    }

    /// Unmarshal is a helper to deserialize the sdp
    pub fn unmarshal(&self) -> Result<SessionDescription> {
        let mut reader = Cursor::new(self.sdp.as_bytes());
        let parsed = SessionDescription::unmarshal(&mut reader)
            .map_err(|err| Error::negotiation_failed(format!("malformed sdp: {err}")))?;
        Ok(parsed)
    }

    /// parsed returns the cached parse result or parses the sdp, e.g. after
    /// the description crossed the relay as JSON.
    pub(crate) fn parsed(&self) -> Result<SessionDescription> {
        match &self.parsed {
            Some(parsed) => Ok(parsed.clone()),
            None => self.unmarshal(),
        }
    }
}

pub(crate) struct AddDataMediaSectionParams {
    mid_value: String,
    ice_params: RTCIceParameters,
    dtls_role: ConnectionRole,
}

pub(crate) fn add_data_media_section(
    d: SessionDescription,
    dtls_fingerprints: &[RTCDtlsFingerprint],
    params: AddDataMediaSectionParams,
) -> SessionDescription {
    let mut media = MediaDescription {
        media_name: MediaName {
            media: MEDIA_SECTION_APPLICATION.to_owned(),
            port: RangedPort {
                value: 9,
                range: None,
            },
            protos: vec!["UDP".to_owned(), "DTLS".to_owned(), "SCTP".to_owned()],
            formats: vec![DATA_CHANNEL_FORMAT.to_owned()],
        },
        media_title: None,
        connection_information: Some(ConnectionInformation {
            network_type: "IN".to_owned(),
            address_type: "IP4".to_owned(),
            address: Some(Address {
                address: "0.0.0.0".to_owned(),
                ttl: None,
                range: None,
            }),
        }),
        bandwidth: vec![],
        encryption_key: None,
        attributes: vec![],
    }
    .with_value_attribute(
        ATTR_KEY_CONNECTION_SETUP.to_owned(),
        params.dtls_role.to_string(),
    )
    .with_value_attribute(ATTR_KEY_MID.to_owned(), params.mid_value)
    .with_property_attribute("sendrecv".to_owned())
    .with_value_attribute("sctp-port".to_owned(), SCTP_PORT.to_string())
    .with_value_attribute("max-message-size".to_owned(), MAX_MESSAGE_SIZE.to_string())
    .with_ice_credentials(
        params.ice_params.username_fragment,
        params.ice_params.password,
    );

    for f in dtls_fingerprints {
        media = media.with_fingerprint(f.algorithm.clone(), f.value.to_uppercase());
    }

    d.with_media(media)
}

/// populate_sdp serializes an endpoint's negotiation state into an SDP with a
/// single bundled data channel section. Candidates are trickled separately.
pub(crate) fn populate_sdp(
    dtls_fingerprints: &[RTCDtlsFingerprint],
    ice_params: &RTCIceParameters,
    connection_role: ConnectionRole,
) -> Result<SessionDescription> {
    if dtls_fingerprints.is_empty() {
        return Err(Error::negotiation_failed("no certificate fingerprint"));
    }

    let d = SessionDescription::new_jsep_session_description(false);
    let params = AddDataMediaSectionParams {
        mid_value: DATA_CHANNEL_MID.to_owned(),
        ice_params: ice_params.clone(),
        dtls_role: connection_role,
    };
    let d = add_data_media_section(d, dtls_fingerprints, params);

    Ok(d
        .with_value_attribute("ice-options".to_owned(), "trickle".to_owned())
        .with_value_attribute(
            ATTR_KEY_GROUP.to_owned(),
            format!("BUNDLE {DATA_CHANNEL_MID}"),
        ))
}

pub(crate) fn get_mid_value(media: &MediaDescription) -> Option<&String> {
    for attr in &media.attributes {
        if attr.key == ATTR_KEY_MID {
            return attr.value.as_ref();
        }
    }
    None
}

pub(crate) fn have_application_media_section(desc: &SessionDescription) -> bool {
    for m in &desc.media_descriptions {
        if m.media_name.media == MEDIA_SECTION_APPLICATION
            && m.media_name.formats.iter().any(|f| f == DATA_CHANNEL_FORMAT)
        {
            return true;
        }
    }

    false
}

pub(crate) fn extract_fingerprint(desc: &SessionDescription) -> Result<RTCDtlsFingerprint> {
    let mut fingerprints: Vec<String> = vec![];

    if let Some(fingerprint) = desc.attribute("fingerprint") {
        fingerprints.push(fingerprint.to_owned());
    }

    for m in &desc.media_descriptions {
        if let Some(fingerprint) = m.attribute("fingerprint").and_then(|o| o) {
            fingerprints.push(fingerprint.to_owned());
        }
    }

    if fingerprints.is_empty() {
        return Err(Error::negotiation_failed(
            "session description has no fingerprint",
        ));
    }

    for m in 1..fingerprints.len() {
        if fingerprints[m] != fingerprints[0] {
            return Err(Error::negotiation_failed(
                "session description has conflicting fingerprints",
            ));
        }
    }

    RTCDtlsFingerprint::try_from(&fingerprints[0][..])
}

/// extract_ice_details returns the remote ICE credentials and any candidates
/// embedded in the description.
pub(crate) fn extract_ice_details(
    desc: &SessionDescription,
) -> Result<(RTCIceParameters, Vec<RTCIceCandidate>)> {
    let mut candidates = vec![];
    let mut remote_pwds: Vec<String> = vec![];
    let mut remote_ufrags: Vec<String> = vec![];

    if let Some(ufrag) = desc.attribute("ice-ufrag") {
        remote_ufrags.push(ufrag.to_owned());
    }
    if let Some(pwd) = desc.attribute("ice-pwd") {
        remote_pwds.push(pwd.to_owned());
    }

    for m in &desc.media_descriptions {
        if let Some(ufrag) = m.attribute("ice-ufrag").and_then(|o| o) {
            remote_ufrags.push(ufrag.to_owned());
        }
        if let Some(pwd) = m.attribute("ice-pwd").and_then(|o| o) {
            remote_pwds.push(pwd.to_owned());
        }

        for a in &m.attributes {
            if a.key == "candidate" {
                if let Some(value) = &a.value {
                    candidates.push(RTCIceCandidate::unmarshal(value)?);
                }
            }
        }
    }

    if remote_ufrags.is_empty() {
        return Err(Error::negotiation_failed(
            "session description is missing ice-ufrag",
        ));
    } else if remote_pwds.is_empty() {
        return Err(Error::negotiation_failed(
            "session description is missing ice-pwd",
        ));
    }

    for m in 1..remote_ufrags.len() {
        if remote_ufrags[m] != remote_ufrags[0] {
            return Err(Error::negotiation_failed(
                "session description has conflicting ice-ufrag",
            ));
        }
    }

    for m in 1..remote_pwds.len() {
        if remote_pwds[m] != remote_pwds[0] {
            return Err(Error::negotiation_failed(
                "session description has conflicting ice-pwd",
            ));
        }
    }

    let params = RTCIceParameters {
        username_fragment: remote_ufrags[0].clone(),
        password: remote_pwds[0].clone(),
    };
    if !params.valid() {
        return Err(Error::negotiation_failed(
            "session description has invalid ice credentials",
        ));
    }

    Ok((params, candidates))
}

/// extract_connection_role returns the `a=setup` role of the data section
pub(crate) fn extract_connection_role(desc: &SessionDescription) -> ConnectionRole {
    for m in &desc.media_descriptions {
        if let Some(role) = m.attribute(ATTR_KEY_CONNECTION_SETUP).and_then(|o| o) {
            return role.into();
        }
    }
    ConnectionRole::Unspecified
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::certificate::RTCCertificate;

    fn new_offer(role: ConnectionRole) -> Result<(RTCIceParameters, RTCSessionDescription)> {
        let certificate = RTCCertificate::generate()?;
        let ice_params = RTCIceParameters::generate();
        let d = populate_sdp(&certificate.get_fingerprints(), &ice_params, role)?;
        let offer = RTCSessionDescription::offer(d.marshal())?;
        Ok((ice_params, offer))
    }

    #[test]
    fn test_populate_sdp_round_trip() -> Result<()> {
        let (ice_params, offer) = new_offer(ConnectionRole::Actpass)?;
        let parsed = offer.parsed()?;

        assert!(have_application_media_section(&parsed));
        assert_eq!(parsed.media_descriptions.len(), 1);
        assert_eq!(
            get_mid_value(&parsed.media_descriptions[0]).map(|s| s.as_str()),
            Some(DATA_CHANNEL_MID)
        );
        assert_eq!(extract_connection_role(&parsed), ConnectionRole::Actpass);

        let (remote_params, candidates) = extract_ice_details(&parsed)?;
        assert_eq!(remote_params, ice_params);
        assert!(candidates.is_empty());

        let fingerprint = extract_fingerprint(&parsed)?;
        assert_eq!(fingerprint.algorithm, "sha-256");
        Ok(())
    }

    #[test]
    fn test_extract_embedded_candidates() -> Result<()> {
        let (_, offer) = new_offer(ConnectionRole::Active)?;
        let mut parsed = offer.parsed()?;
        let media = parsed.media_descriptions.remove(0).with_value_attribute(
            "candidate".to_owned(),
            "1 1 udp 2130706431 127.0.0.1 5000 typ host".to_owned(),
        );
        parsed.media_descriptions.push(media);

        let (_, candidates) = extract_ice_details(&parsed)?;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].addr().to_string(), "127.0.0.1:5000");
        Ok(())
    }

    #[test]
    fn test_session_level_attributes() -> Result<()> {
        let certificate = RTCCertificate::generate()?;
        let fingerprint = certificate.get_fingerprints()[0].clone();
        let ice_params = RTCIceParameters::generate();
        let d = SessionDescription::new_jsep_session_description(false)
            .with_fingerprint(
                fingerprint.algorithm.clone(),
                fingerprint.value.to_uppercase(),
            )
            .with_value_attribute("ice-ufrag".to_owned(), ice_params.username_fragment.clone())
            .with_value_attribute("ice-pwd".to_owned(), ice_params.password.clone());

        assert_eq!(extract_fingerprint(&d)?, fingerprint);
        let (remote_params, _) = extract_ice_details(&d)?;
        assert_eq!(remote_params, ice_params);

        // a media section must agree with the session level
        let d = d.with_media(
            MediaDescription::new_jsep_media_description(
                MEDIA_SECTION_APPLICATION.to_owned(),
                vec![],
            )
            .with_ice_credentials("other".to_owned(), ice_params.password.clone()),
        );
        assert!(matches!(
            extract_ice_details(&d),
            Err(Error::NegotiationFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn test_malformed_sdp() {
        let result = RTCSessionDescription::offer("not an sdp".to_owned());
        assert!(matches!(result, Err(Error::NegotiationFailed(_))));
    }

    #[test]
    fn test_missing_fingerprint() -> Result<()> {
        let ice_params = RTCIceParameters::generate();
        assert!(populate_sdp(&[], &ice_params, ConnectionRole::Actpass).is_err());

        let d = SessionDescription::new_jsep_session_description(false);
        assert!(matches!(
            extract_fingerprint(&d),
            Err(Error::NegotiationFailed(_))
        ));
        assert!(matches!(
            extract_ice_details(&d),
            Err(Error::NegotiationFailed(_))
        ));
        assert!(!have_application_media_section(&d));
        Ok(())
    }

    #[test]
    fn test_session_description_json() -> Result<()> {
        let tests = vec![
            (
                RTCSessionDescription {
                    sdp_type: RTCSdpType::Offer,
                    sdp: "sdp".to_owned(),
                    parsed: None,
                },
                r#"{"type":"offer","sdp":"sdp"}"#,
            ),
            (
                RTCSessionDescription {
                    sdp_type: RTCSdpType::Answer,
                    sdp: "sdp".to_owned(),
                    parsed: None,
                },
                r#"{"type":"answer","sdp":"sdp"}"#,
            ),
        ];

        for (desc, expected_string) in tests {
            let desc_data = serde_json::to_string(&desc)?;
            assert_eq!(desc_data, expected_string, "string is not expected");

            let sd = serde_json::from_str::<RTCSessionDescription>(&desc_data)?;
            assert_eq!(sd, desc);
        }
        Ok(())
    }
}
