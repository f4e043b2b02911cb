//! Seam between the peer layer and the connectivity primitive.
//!
//! A [`Connector`] opens one [`Link`] per remote peer. Callbacks raised by the
//! primitive (candidates, state changes, inbound channels, channel traffic) are
//! reported as [`LinkEvent`]s through the [`LinkContext`] handed to the
//! connector, tagged with the peer and the connection generation so that the
//! coordinator can drop events from a connection that has since been replaced.
//! Completed negotiation steps travel the same way.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::peer::{ChannelReadiness, StepOutcome};
use crate::protocol::{IceCandidate, Payload, PeerId, SessionDescription};

pub mod rtc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("{0}")]
    Primitive(String),
    #[error("unsupported session description type {0}")]
    UnsupportedDescription(String),
    #[error("timed out")]
    TimedOut,
    #[error("link closed")]
    Closed,
}

impl LinkError {
    pub fn primitive(err: impl fmt::Display) -> Self {
        LinkError::Primitive(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl ChannelId {
    pub fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Aggregate connectivity state reported by the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum LinkEventKind {
    /// A locally gathered candidate; `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidate>),
    StateChanged(LinkState),
    NegotiationNeeded,
    /// A channel opened by the remote side.
    InboundChannel(Arc<dyn Channel>),
    ChannelOpened(ChannelId),
    ChannelClosed(ChannelId),
    ChannelMessage(ChannelId, Payload),
    /// A queued negotiation step of this connection completed.
    StepFinished(StepOutcome),
}

impl fmt::Debug for LinkEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEventKind::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            LinkEventKind::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            LinkEventKind::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            LinkEventKind::InboundChannel(channel) => f
                .debug_tuple("InboundChannel")
                .field(&channel.label())
                .finish(),
            LinkEventKind::ChannelOpened(id) => f.debug_tuple("ChannelOpened").field(id).finish(),
            LinkEventKind::ChannelClosed(id) => f.debug_tuple("ChannelClosed").field(id).finish(),
            LinkEventKind::ChannelMessage(id, payload) => f
                .debug_tuple("ChannelMessage")
                .field(id)
                .field(&payload.len())
                .finish(),
            LinkEventKind::StepFinished(outcome) => f.debug_tuple("StepFinished").field(outcome).finish(),
        }
    }
}

#[derive(Debug)]
pub struct LinkEvent {
    pub peer: PeerId,
    pub generation: u64,
    pub kind: LinkEventKind,
}

/// Reporting handle given to a backend for one connection.
#[derive(Clone, Debug)]
pub struct LinkContext {
    peer: PeerId,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkContext {
    pub fn new(peer: PeerId, generation: u64, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            peer,
            generation,
            events,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: LinkEventKind) {
        let event = LinkEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            kind,
        };
        if self.events.send(event).is_err() {
            tracing::trace!(
                target = "portal",
                peer = %self.peer,
                "link event dropped; coordinator gone"
            );
        }
    }
}

pub struct LinkRequest {
    pub remote: PeerId,
    pub role: Role,
    pub ice_servers: Vec<String>,
    /// Label of the channel the initiator will open once connected.
    pub channel_label: String,
    pub context: LinkContext,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, request: LinkRequest) -> Result<Arc<dyn Link>, LinkError>;
}

/// One connection to one remote peer.
#[async_trait]
pub trait Link: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;
    /// Creates an answer and applies it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;
    async fn apply_remote_description(&self, description: SessionDescription) -> Result<(), LinkError>;
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;
    async fn open_channel(&self, label: &str) -> Result<Arc<dyn Channel>, LinkError>;
    async fn close(&self);
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn label(&self) -> String;
    fn readiness(&self) -> ChannelReadiness;
    async fn send(&self, payload: &Payload) -> Result<(), LinkError>;
    async fn close(&self);
}
