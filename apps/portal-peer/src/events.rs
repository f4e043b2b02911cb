//! Notifications published to upstream consumers of the layer.

use serde::{Serialize, Serializer};

use crate::error::PeerError;
use crate::peer::ChannelReadiness;
use crate::protocol::{Payload, PeerId};

pub use portal_bus::{BusError, Observer, Subscription};

pub type EventBus = portal_bus::EventBus<PeerEvent>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum PeerEvent {
    #[serde(rename_all = "camelCase")]
    LocalIdentityAssigned { local_peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    ApplicationData { peer: PeerId, payload: Payload },
    #[serde(rename_all = "camelCase")]
    ChannelStateChanged {
        peer: PeerId,
        readiness: ChannelReadiness,
    },
    #[serde(rename_all = "camelCase")]
    PeerClosed { peer: PeerId },
    /// A failure the layer recovered from by abandoning one message or step.
    #[serde(rename_all = "camelCase")]
    Fault {
        peer: Option<PeerId>,
        #[serde(serialize_with = "serialize_display")]
        error: PeerError,
    },
}

fn serialize_display<S: Serializer>(error: &PeerError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}
