use crate::error::Error;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// The role a session description plays in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A session description: kind tag plus the opaque textual SDP payload.
///
/// Round-trips losslessly through the engine's native description type via
/// [SessionDescription::from_engine] / [SessionDescription::to_engine]. The
/// `empty` value stands in for "no description set" in accessors, which never
/// fail just because nothing has been negotiated yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind,
            sdp: sdp.into(),
        }
    }

    /// The unset description returned when the engine has none.
    pub fn empty() -> Self {
        SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sdp.is_empty()
    }

    /// Translates into the engine's native type. The engine re-parses the
    /// payload here, so malformed text fails without touching connection
    /// state.
    pub(crate) fn to_engine(&self) -> Result<RTCSessionDescription, Error> {
        let result = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(self.sdp.clone()),
            SdpKind::Rollback => {
                let mut desc = RTCSessionDescription::default();
                desc.sdp_type = RTCSdpType::Rollback;
                return Ok(desc);
            }
        };
        result.map_err(|e| Error::SdpTranslation(e.to_string()))
    }

    pub(crate) fn from_engine(desc: &RTCSessionDescription) -> Self {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            _ => SdpKind::Rollback,
        };
        SessionDescription {
            kind,
            sdp: desc.sdp.clone(),
        }
    }

    pub(crate) fn from_engine_opt(desc: Option<RTCSessionDescription>) -> Self {
        match desc {
            Some(desc) => SessionDescription::from_engine(&desc),
            None => SessionDescription::empty(),
        }
    }
}

/// A single ICE candidate as carried over the application's signaling
/// channel: the candidate attribute plus its media-description anchors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
}

impl IceCandidate {
    /// Local syntactic validation using the engine's ICE grammar. Succeeding
    /// here does not guarantee the connection will accept the candidate, only
    /// that the attribute parses.
    pub fn validate(&self) -> Result<(), Error> {
        let raw = self
            .candidate
            .strip_prefix("candidate:")
            .unwrap_or(&self.candidate);
        if raw.is_empty() {
            return Err(Error::SdpParse("empty candidate".into()));
        }
        webrtc::ice::candidate::candidate_base::unmarshal_candidate(raw)
            .map(|_| ())
            .map_err(|e| Error::SdpParse(e.to_string()))
    }

    pub(crate) fn to_engine(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate.clone(),
            sdp_mid: Some(self.sdp_mid.clone()),
            sdp_mline_index: Some(self.sdp_mline_index),
            username_fragment: None,
        }
    }

    pub(crate) fn from_engine(candidate: &RTCIceCandidate) -> Result<Self, Error> {
        let init = candidate
            .to_json()
            .map_err(|e| Error::SdpParse(e.to_string()))?;
        Ok(IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid.unwrap_or_default(),
            sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const HOST_CANDIDATE: &str =
        "candidate:4234997325 1 udp 2043278322 192.168.0.56 44323 typ host generation 0";

    #[test]
    fn valid_host_candidate_parses() {
        let candidate = IceCandidate {
            candidate: HOST_CANDIDATE.to_string(),
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
        };
        assert!(candidate.validate().is_ok());
    }

    #[test]
    fn garbage_candidate_is_a_parse_error() {
        let candidate = IceCandidate {
            candidate: "not a candidate at all".to_string(),
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
        };
        assert!(matches!(candidate.validate(), Err(Error::SdpParse(_))));
    }

    #[test]
    fn empty_candidate_is_a_parse_error() {
        let candidate = IceCandidate {
            candidate: String::new(),
            sdp_mid: String::new(),
            sdp_mline_index: 0,
        };
        assert!(matches!(candidate.validate(), Err(Error::SdpParse(_))));
    }

    #[test]
    fn empty_description_round_trips() {
        let empty = SessionDescription::empty();
        assert!(empty.is_empty());
        let json = serde_json::to_string(&empty).unwrap();
        let back: SessionDescription = serde_json::from_str(&json).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn malformed_offer_fails_translation() {
        let desc = SessionDescription::new(SdpKind::Offer, "v=nonsense");
        assert!(matches!(desc.to_engine(), Err(Error::SdpTranslation(_))));
    }

    #[test]
    fn rollback_translates_without_payload() {
        let desc = SessionDescription::new(SdpKind::Rollback, "");
        let engine = desc.to_engine().unwrap();
        assert_eq!(engine.sdp_type, RTCSdpType::Rollback);
    }
}
