//! Peer connection layer: identity assignment, offer/answer negotiation,
//! candidate exchange and data channel delivery between peers introduced by a
//! rendezvous service.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod layer;
pub mod link;
pub mod mock;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod signaling;
pub mod telemetry;

pub use config::{PeerConfig, SignalingEndpoint};
pub use engine::{OfferPending, PeerCore};
pub use error::{PeerError, PeerResult};
pub use events::{EventBus, Observer, PeerEvent, Subscription};
pub use layer::PeerLayer;
pub use peer::{ChannelReadiness, ConnectionState, Delivery};
pub use protocol::{IceCandidate, Payload, PeerId, SessionDescription, SignalingMessage};
