//! Session descriptions exchanged during offer/answer negotiation.
//!
//! The JSON form mirrors the browser/WebRTC `RTCSessionDescription`
//! (`{"type": "offer", "sdp": "..."}`) so descriptions produced by the
//! negotiation engine can be relayed without translation. The `sdp` body is
//! opaque to this crate.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// The role of a session description in the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Proposal sent by the initiating peer.
    Offer,
    /// Provisional answer.
    Pranswer,
    /// Final answer to an offer.
    Answer,
    /// Cancels the current negotiation.
    Rollback,
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SdpKind::Offer => "offer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Answer => "answer",
            SdpKind::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// A session description produced or consumed by the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Engine-specific description body.
    pub sdp: String,
}

impl SessionDescription {
    /// Creates an offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Creates an answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Serializes to compact JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a description from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            ProtocolError::InvalidPayload(format!("not a session description: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_json_shape() {
        let desc = SessionDescription::offer("v=0\r\n");
        let value: serde_json::Value = serde_json::from_str(&desc.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0\r\n");
    }

    #[test]
    fn test_parse_browser_style_description() {
        let json = r#"{"sdp":"v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n","type":"answer"}"#;
        let desc = SessionDescription::from_json(json).unwrap();
        assert_eq!(desc.kind, SdpKind::Answer);
        assert!(desc.sdp.starts_with("v=0"));
    }

    #[test]
    fn test_parse_unknown_kind() {
        let json = r#"{"type":"bogus","sdp":""}"#;
        let result = SessionDescription::from_json(json);
        assert!(matches!(result, Err(ProtocolError::InvalidPayload(_))));
    }

    #[test]
    fn test_parse_missing_sdp() {
        let result = SessionDescription::from_json(r#"{"type":"offer"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(SdpKind::Offer.to_string(), "offer");
        assert_eq!(SdpKind::Answer.to_string(), "answer");
    }
}
