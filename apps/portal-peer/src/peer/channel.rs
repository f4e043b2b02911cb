use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;

use crate::link::Channel;
use crate::protocol::Payload;

/// Readiness of a data channel as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelReadiness {
    Connecting,
    Open,
    Closing,
    Closed,
    /// The primitive reported something this layer does not model.
    Unknown,
}

impl ChannelReadiness {
    /// Readiness only moves forward. `Unknown` may resolve to any known state.
    pub fn can_advance_to(self, next: ChannelReadiness) -> bool {
        use ChannelReadiness::*;
        match (self, next) {
            (Unknown, Unknown) => false,
            (Unknown, _) => true,
            (Connecting, Open | Closing | Closed) => true,
            (Open, Closing | Closed) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }

    pub fn is_open(self) -> bool {
        self == ChannelReadiness::Open
    }
}

pub struct DataChannel {
    handle: Arc<dyn Channel>,
    label: String,
    readiness: ChannelReadiness,
}

impl DataChannel {
    pub fn new(handle: Arc<dyn Channel>) -> Self {
        let label = handle.label();
        let readiness = handle.readiness();
        Self {
            handle,
            label,
            readiness,
        }
    }

    pub fn handle(&self) -> &Arc<dyn Channel> {
        &self.handle
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn readiness(&self) -> ChannelReadiness {
        self.readiness
    }

    /// Records `next` if it is a forward move. Returns whether anything changed.
    pub fn advance(&mut self, next: ChannelReadiness) -> bool {
        if self.readiness.can_advance_to(next) {
            self.readiness = next;
            true
        } else {
            false
        }
    }

    /// Pulls the primitive's current readiness in, forward moves only.
    pub fn refresh(&mut self) -> bool {
        let observed = self.handle.readiness();
        self.advance(observed)
    }
}

/// Outbound messages waiting for an open channel, oldest first.
#[derive(Debug, Default)]
pub struct SendQueue {
    items: VecDeque<Payload>,
}

impl SendQueue {
    pub fn push(&mut self, payload: Payload) {
        self.items.push_back(payload);
    }

    pub fn front(&self) -> Option<&Payload> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<Payload> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}
