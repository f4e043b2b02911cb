use tracing::debug;

use crate::engine::PeerCore;
use crate::error::PeerResult;
use crate::protocol::SignalingMessage;

/// Dispatches one inbound signaling message. Addressed messages are checked
/// against the local id before anything else happens.
pub fn route(core: &mut PeerCore, message: SignalingMessage) -> PeerResult<()> {
    debug!(
        target = "portal",
        kind = message.kind(),
        sender = ?message.sender(),
        "signaling message"
    );
    if let Some(target) = message.target() {
        core.check_recipient(target)?;
    }

    match message {
        SignalingMessage::AssignPeerId { assigned_peer_id } => {
            core.accept_assignment(assigned_peer_id).map(|_| ())
        }
        SignalingMessage::SessionOffer {
            sender_peer_id,
            target_peer_id,
            session_description,
        } => {
            core.handle_offer(sender_peer_id, target_peer_id, session_description)
        }
        SignalingMessage::SessionAnswer {
            sender_peer_id,
            session_description,
            ..
        } => core.handle_answer(sender_peer_id, session_description),
        SignalingMessage::NewIceCandidate {
            sender_peer_id,
            candidate,
            ..
        } => core.handle_candidate(sender_peer_id, candidate),
    }
}
