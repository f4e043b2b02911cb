//! Per-peer state: one arena entry bundles a peer's connection, its data
//! channel and the messages waiting to go out on it.

mod channel;
mod connection;
mod steps;

use std::collections::BTreeMap;

use tracing::{debug, error, warn};

pub use channel::{ChannelReadiness, DataChannel, SendQueue};
pub use connection::{Connection, ConnectionState};
pub use steps::{Step, StepKind, StepOutcome};

use crate::link::LinkError;
use crate::protocol::{Payload, PeerId};

/// Outcome of one delivery attempt for a peer's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// No open channel yet; everything stays queued.
    Deferred,
    /// The channel was open and this many messages went out.
    Flushed(usize),
    /// The channel is closing or closed; messages stay queued.
    Held(ChannelReadiness),
    /// Readiness could not be determined; nothing was attempted.
    Abandoned,
    /// A transmit failed part way; the failed message is still at the front.
    Interrupted { sent: usize, error: LinkError },
}

pub struct RemotePeer {
    id: PeerId,
    pub connection: Option<Connection>,
    pub channel: Option<DataChannel>,
    pub queue: SendQueue,
}

impl RemotePeer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            connection: None,
            channel: None,
            queue: SendQueue::default(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn readiness(&self) -> Option<ChannelReadiness> {
        self.channel.as_ref().map(DataChannel::readiness)
    }

    /// Transmits queued messages in order while the channel is open. A message
    /// leaves the queue only after it was handed to the channel.
    pub async fn flush(&mut self) -> Delivery {
        let Some(channel) = self.channel.as_mut() else {
            debug!(target = "portal", peer = %self.id, queued = self.queue.len(), "no channel yet; deferring");
            return Delivery::Deferred;
        };
        channel.refresh();
        match channel.readiness() {
            ChannelReadiness::Connecting => {
                debug!(target = "portal", peer = %self.id, queued = self.queue.len(), "channel connecting; deferring");
                Delivery::Deferred
            }
            readiness @ (ChannelReadiness::Closing | ChannelReadiness::Closed) => {
                warn!(
                    target = "portal",
                    peer = %self.id,
                    readiness = ?readiness,
                    queued = self.queue.len(),
                    "channel not open; message kept queued"
                );
                Delivery::Held(readiness)
            }
            ChannelReadiness::Unknown => {
                error!(target = "portal", peer = %self.id, "channel readiness unknown; delivery abandoned");
                Delivery::Abandoned
            }
            ChannelReadiness::Open => {
                let handle = channel.handle().clone();
                let mut sent = 0;
                while let Some(payload) = self.queue.front() {
                    if let Err(error) = handle.send(payload).await {
                        warn!(target = "portal", peer = %self.id, error = %error, sent, "transmit failed");
                        return Delivery::Interrupted { sent, error };
                    }
                    self.queue.pop_front();
                    sent += 1;
                }
                debug!(target = "portal", peer = %self.id, sent, "flushed send queue");
                Delivery::Flushed(sent)
            }
        }
    }
}

/// Every remote peer this process has tried to reach or been contacted by,
/// keyed by id. Iteration is ordered by id.
#[derive(Default)]
pub struct PeerArena {
    peers: BTreeMap<PeerId, RemotePeer>,
}

impl PeerArena {
    pub fn get(&self, id: &PeerId) -> Option<&RemotePeer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut RemotePeer> {
        self.peers.get_mut(id)
    }

    pub fn entry(&mut self, id: &PeerId) -> &mut RemotePeer {
        self.peers
            .entry(id.clone())
            .or_insert_with(|| RemotePeer::new(id.clone()))
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<RemotePeer> {
        self.peers.remove(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether any peer currently has an open data channel.
    pub fn any_open(&self) -> bool {
        self.peers
            .values()
            .any(|peer| peer.readiness().is_some_and(ChannelReadiness::is_open))
    }
}
