use tracing::{info, warn};

use crate::error::{PeerError, PeerResult};
use crate::events::{EventBus, PeerEvent};
use crate::protocol::PeerId;

/// Holds the id the rendezvous service assigned to this process.
pub struct IdentityRegistrar {
    current: Option<PeerId>,
    bus: EventBus,
}

impl IdentityRegistrar {
    pub fn new(bus: EventBus) -> Self {
        Self { current: None, bus }
    }

    pub fn current_id(&self) -> Option<&PeerId> {
        self.current.as_ref()
    }

    pub fn is_local(&self, peer: &PeerId) -> bool {
        self.current.as_ref() == Some(peer)
    }

    /// Validates and stores an assignment, then announces it.
    ///
    /// An absent id is rejected before anything is touched, so a failed call
    /// leaves the previously held id in place.
    pub fn accept_assignment(&mut self, id: Option<PeerId>) -> PeerResult<PeerId> {
        let id = id.ok_or(PeerError::InvalidPeerIdAssignment)?;
        match self.current.replace(id.clone()) {
            Some(previous) => warn!(
                target = "portal",
                previous = %previous,
                current = %id,
                "reassigned local peer id"
            ),
            None => info!(target = "portal", current = %id, "assigned local peer id"),
        }
        self.bus.publish(PeerEvent::LocalIdentityAssigned {
            local_peer_id: id.clone(),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recording_bus() -> (EventBus, Arc<Mutex<Vec<PeerEvent>>>) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _ = bus.on_event(move |event| sink.lock().push(event.clone()));
        (bus, seen)
    }

    #[test]
    fn assignment_sets_id_and_emits_one_event() {
        let (bus, seen) = recording_bus();
        let mut registrar = IdentityRegistrar::new(bus);
        assert_eq!(registrar.current_id(), None);

        registrar.accept_assignment(Some("p1".into())).unwrap();

        assert_eq!(registrar.current_id(), Some(&PeerId::from("p1")));
        assert_eq!(
            *seen.lock(),
            vec![PeerEvent::LocalIdentityAssigned {
                local_peer_id: "p1".into()
            }]
        );
    }

    #[test]
    fn absent_id_is_rejected_without_touching_state() {
        let (bus, seen) = recording_bus();
        let mut registrar = IdentityRegistrar::new(bus);
        registrar.accept_assignment(Some("keep".into())).unwrap();

        let err = registrar.accept_assignment(None).unwrap_err();

        assert_eq!(err, PeerError::InvalidPeerIdAssignment);
        assert_eq!(registrar.current_id(), Some(&PeerId::from("keep")));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn reassignment_keeps_latest_id() {
        let (bus, seen) = recording_bus();
        let mut registrar = IdentityRegistrar::new(bus);
        registrar.accept_assignment(Some("first".into())).unwrap();
        registrar.accept_assignment(Some("second".into())).unwrap();

        assert!(registrar.is_local(&"second".into()));
        assert!(!registrar.is_local(&"first".into()));
        assert_eq!(seen.lock().len(), 2);
    }
}
