//! Wire messages exchanged with the rendezvous service.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier handed out by the rendezvous service.
///
/// The service may issue either a string or an integer; the JSON
/// shape is kept so replies address peers exactly as the service knows them.
/// Integers may be negative. Fractional numbers are not ids: a frame carrying
/// one fails to decode and is dropped with a warning by the signaling reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(PeerIdRepr);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
enum PeerIdRepr {
    Number(u64),
    Signed(i64),
    Text(String),
}

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(PeerIdRepr::Text(id.into()))
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        Self(PeerIdRepr::Number(value))
    }
}

impl From<i64> for PeerId {
    fn from(value: i64) -> Self {
        match u64::try_from(value) {
            Ok(n) => Self(PeerIdRepr::Number(n)),
            Err(_) => Self(PeerIdRepr::Signed(value)),
        }
    }
}

/// Reads an id typed by a person: anything that parses as an integer becomes
/// the integer id the service would have issued, everything else is text.
impl FromStr for PeerId {
    type Err = Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = raw.parse::<u64>() {
            return Ok(n.into());
        }
        if let Ok(n) = raw.parse::<i64>() {
            return Ok(n.into());
        }
        Ok(raw.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            PeerIdRepr::Number(n) => write!(f, "{n}"),
            PeerIdRepr::Signed(n) => write!(f, "{n}"),
            PeerIdRepr::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename_all = "camelCase")]
    AssignPeerId {
        #[serde(default)]
        assigned_peer_id: Option<PeerId>,
    },
    #[serde(rename_all = "camelCase")]
    SessionOffer {
        sender_peer_id: PeerId,
        target_peer_id: PeerId,
        session_description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    SessionAnswer {
        sender_peer_id: PeerId,
        target_peer_id: PeerId,
        session_description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    NewIceCandidate {
        sender_peer_id: PeerId,
        target_peer_id: PeerId,
        #[serde(alias = "iceCandidate")]
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::AssignPeerId { .. } => "AssignPeerId",
            SignalingMessage::SessionOffer { .. } => "SessionOffer",
            SignalingMessage::SessionAnswer { .. } => "SessionAnswer",
            SignalingMessage::NewIceCandidate { .. } => "NewIceCandidate",
        }
    }

    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::AssignPeerId { .. } => None,
            SignalingMessage::SessionOffer { sender_peer_id, .. }
            | SignalingMessage::SessionAnswer { sender_peer_id, .. }
            | SignalingMessage::NewIceCandidate { sender_peer_id, .. } => Some(sender_peer_id),
        }
    }

    pub fn target(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::AssignPeerId { .. } => None,
            SignalingMessage::SessionOffer { target_peer_id, .. }
            | SignalingMessage::SessionAnswer { target_peer_id, .. }
            | SignalingMessage::NewIceCandidate { target_peer_id, .. } => Some(target_peer_id),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Application message carried over a data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Binary(value)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Text(text) => f.write_str(text),
            Payload::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}
