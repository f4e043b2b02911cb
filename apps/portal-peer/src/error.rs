use thiserror::Error;

use crate::protocol::PeerId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("cannot assign an absent peer id")]
    InvalidPeerIdAssignment,
    #[error("message addressed to {target} but local peer id is {}", display_local(.local))]
    MisdirectedMessage {
        local: Option<PeerId>,
        target: PeerId,
    },
    #[error("session answer from unknown remote peer {0}")]
    UnknownPeerForAnswer(PeerId),
    #[error("ice candidate from unknown remote peer {0}")]
    UnknownPeerForCandidate(PeerId),
    #[error("no remote peer {0} is tracked")]
    UnknownPeer(PeerId),
    #[error("negotiation with {peer} failed: {reason}")]
    NegotiationFailure { peer: PeerId, reason: String },
    #[error("signaling transport error: {0}")]
    Signaling(String),
    #[error("peer layer is not running")]
    LayerStopped,
}

impl PeerError {
    pub fn negotiation(peer: &PeerId, reason: impl ToString) -> Self {
        PeerError::NegotiationFailure {
            peer: peer.clone(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure only abandons the offending message or operation.
    /// Everything except an invalid identity assignment is recovered locally.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PeerError::InvalidPeerIdAssignment)
    }

    /// Peer the failure concerns, when there is one.
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            PeerError::MisdirectedMessage { .. }
            | PeerError::InvalidPeerIdAssignment
            | PeerError::Signaling(_)
            | PeerError::LayerStopped => None,
            PeerError::UnknownPeerForAnswer(peer)
            | PeerError::UnknownPeerForCandidate(peer)
            | PeerError::UnknownPeer(peer)
            | PeerError::NegotiationFailure { peer, .. } => Some(peer),
        }
    }
}

fn display_local(local: &Option<PeerId>) -> String {
    local
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unassigned".into())
}

pub type PeerResult<T> = Result<T, PeerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misdirected_message_names_both_ids() {
        let err = PeerError::MisdirectedMessage {
            local: Some("b".into()),
            target: "c".into(),
        };
        assert_eq!(
            err.to_string(),
            "message addressed to c but local peer id is b"
        );
        let unassigned = PeerError::MisdirectedMessage {
            local: None,
            target: "c".into(),
        };
        assert!(unassigned.to_string().ends_with("unassigned"));
    }

    #[test]
    fn only_identity_assignment_is_a_hard_failure() {
        assert!(!PeerError::InvalidPeerIdAssignment.is_recoverable());
        assert!(PeerError::UnknownPeerForAnswer("a".into()).is_recoverable());
        assert!(PeerError::negotiation(&"a".into(), "boom").is_recoverable());
    }
}
