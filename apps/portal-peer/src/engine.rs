//! State owner of the peer layer.
//!
//! [`PeerCore`] holds the identity, the peer arena and the collaborators. Every
//! method runs to completion against `&mut self`, so per-peer state is never
//! touched from two places at once. Link work that may take a while runs in
//! each connection's step worker; its results come back through
//! [`PeerCore::handle_link_event`], so one slow peer never holds up another.
//! The layer's coordinator task is the only caller in production; tests drive
//! it directly.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::PeerConfig;
use crate::error::{PeerError, PeerResult};
use crate::events::{EventBus, PeerEvent};
use crate::identity::IdentityRegistrar;
use crate::link::{
    Channel, ChannelId, Connector, LinkContext, LinkEvent, LinkEventKind, LinkRequest, LinkState,
    Role,
};
use crate::peer::{
    ChannelReadiness, Connection, ConnectionState, DataChannel, Delivery, PeerArena, Step,
    StepKind, StepOutcome,
};
use crate::protocol::{IceCandidate, Payload, PeerId, SessionDescription, SignalingMessage};
use crate::router;
use crate::signaling::SignalingTransport;

/// Completes once the offer of a [`PeerCore::connect_to_peer`] call went out
/// to the rendezvous service, or negotiation failed before it could.
#[must_use = "the offer outcome is only observable through `sent`"]
pub struct OfferPending {
    peer: PeerId,
    pending: oneshot::Receiver<PeerResult<()>>,
}

impl OfferPending {
    pub async fn sent(self) -> PeerResult<()> {
        let Self { peer, pending } = self;
        pending.await.unwrap_or_else(|_| {
            Err(PeerError::negotiation(
                &peer,
                "connection closed before the offer was sent",
            ))
        })
    }
}

pub struct PeerCore {
    config: PeerConfig,
    identity: IdentityRegistrar,
    peers: PeerArena,
    bus: EventBus,
    signaling: Arc<dyn SignalingTransport>,
    connector: Arc<dyn Connector>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    root: CancellationToken,
    next_generation: u64,
    /// Step workers and channel closes still winding down.
    retiring: Vec<JoinHandle<()>>,
}

impl PeerCore {
    /// `link_events` receives every callback raised by links this core opens,
    /// and every finished negotiation step; feed them back through
    /// [`PeerCore::handle_link_event`]. Cancelling `root` aborts every
    /// in-flight negotiation step.
    pub fn new(
        config: PeerConfig,
        bus: EventBus,
        signaling: Arc<dyn SignalingTransport>,
        connector: Arc<dyn Connector>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
        root: CancellationToken,
    ) -> Self {
        Self {
            config,
            identity: IdentityRegistrar::new(bus.clone()),
            peers: PeerArena::default(),
            bus,
            signaling,
            connector,
            link_events,
            root,
            next_generation: 0,
            retiring: Vec::new(),
        }
    }

    pub fn local_peer_id(&self) -> Option<&PeerId> {
        self.identity.current_id()
    }

    pub fn has_active_peer(&self) -> bool {
        self.peers.any_open()
    }

    pub fn peers(&self) -> &PeerArena {
        &self.peers
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn handle_signal(&mut self, message: SignalingMessage) -> PeerResult<()> {
        router::route(self, message)
    }

    pub fn accept_assignment(&mut self, id: Option<PeerId>) -> PeerResult<PeerId> {
        self.identity.accept_assignment(id)
    }

    /// Rejects messages not addressed to this process. While no id is held
    /// nothing can be addressed to us.
    pub fn check_recipient(&self, target: &PeerId) -> PeerResult<()> {
        if self.identity.is_local(target) {
            Ok(())
        } else {
            Err(PeerError::MisdirectedMessage {
                local: self.identity.current_id().cloned(),
                target: target.clone(),
            })
        }
    }

    /// Logs a locally recovered failure and tells observers about it.
    pub fn report(&self, error: PeerError) {
        if error.is_recoverable() {
            warn!(target = "portal", error = %error, "abandoned signaling operation");
        } else {
            error!(target = "portal", error = %error, "rejected signaling operation");
        }
        self.bus.publish(PeerEvent::Fault {
            peer: error.peer().cloned(),
            error,
        });
    }

    /// Starts negotiating with `target` as the initiating side. The returned
    /// [`OfferPending`] resolves once the offer has been sent.
    pub fn connect_to_peer(&mut self, target: PeerId) -> PeerResult<OfferPending> {
        let local = self.require_local(&target)?;
        self.install_connection(&target, &local, Role::Initiator);
        let (waiter, pending) = oneshot::channel();
        self.connection_mut(&target)?.await_offer(waiter);
        self.initiate_offer(&target)?;
        Ok(OfferPending {
            peer: target,
            pending,
        })
    }

    pub(crate) fn handle_offer(
        &mut self,
        sender: PeerId,
        local: PeerId,
        description: SessionDescription,
    ) -> PeerResult<()> {
        self.install_connection(&sender, &local, Role::Responder);
        let connection = self.connection_mut(&sender)?;
        connection.transition(&sender, ConnectionState::NegotiatingRemoteOffer);
        connection.set_remote_description(description.clone());
        connection.push(Step::AnswerOffer(description));
        info!(target = "portal", peer = %sender, "session offer received");
        Ok(())
    }

    pub(crate) fn handle_answer(
        &mut self,
        sender: PeerId,
        description: SessionDescription,
    ) -> PeerResult<()> {
        let Some(connection) = self
            .peers
            .get_mut(&sender)
            .and_then(|peer| peer.connection.as_mut())
        else {
            return Err(PeerError::UnknownPeerForAnswer(sender));
        };

        connection.set_remote_description(description.clone());
        connection.push(Step::ApplyAnswer(description));
        let held = connection.take_pending_candidates();
        if !held.is_empty() {
            debug!(target = "portal", peer = %sender, count = held.len(), "applying held candidates");
        }
        for candidate in held {
            connection.push(Step::AddCandidate(candidate));
        }
        Ok(())
    }

    pub(crate) fn handle_candidate(
        &mut self,
        sender: PeerId,
        candidate: IceCandidate,
    ) -> PeerResult<()> {
        let Some(connection) = self
            .peers
            .get_mut(&sender)
            .and_then(|peer| peer.connection.as_mut())
        else {
            return Err(PeerError::UnknownPeerForCandidate(sender));
        };

        if !connection.merge_candidate(&candidate) {
            trace!(target = "portal", peer = %sender, "duplicate remote candidate");
            return Ok(());
        }
        if connection.remote_description().is_none() {
            debug!(target = "portal", peer = %sender, "holding candidate until remote description is applied");
            connection.hold_candidate(candidate);
            return Ok(());
        }
        connection.push(Step::AddCandidate(candidate));
        Ok(())
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent {
            peer,
            generation,
            kind,
        } = event;
        if self.connection(&peer).map(Connection::generation) != Some(generation) {
            trace!(target = "portal", peer = %peer, generation, event = ?kind, "ignoring event from replaced connection");
            return;
        }

        match kind {
            LinkEventKind::LocalCandidate(Some(candidate)) => self.send_local_candidate(&peer, candidate),
            LinkEventKind::LocalCandidate(None) => {
                debug!(target = "portal", peer = %peer, "local candidate gathering complete");
            }
            LinkEventKind::StateChanged(state) => self.on_link_state(&peer, state),
            LinkEventKind::NegotiationNeeded => self.on_negotiation_needed(&peer),
            LinkEventKind::InboundChannel(handle) => {
                info!(target = "portal", peer = %peer, label = %handle.label(), "remote peer opened a data channel");
                self.install_channel(&peer, handle).await;
            }
            LinkEventKind::ChannelOpened(id) => {
                self.on_channel_readiness(&peer, id, ChannelReadiness::Open).await;
            }
            LinkEventKind::ChannelClosed(id) => {
                self.on_channel_readiness(&peer, id, ChannelReadiness::Closed).await;
            }
            LinkEventKind::ChannelMessage(_, payload) => {
                trace!(target = "portal", peer = %peer, len = payload.len(), "application data");
                self.bus.publish(PeerEvent::ApplicationData { peer, payload });
            }
            LinkEventKind::StepFinished(outcome) => self.on_step(&peer, outcome).await,
        }
    }

    /// Requests the data channel towards `target` unless one exists or is
    /// already on its way. Without a connection this only logs.
    pub fn create_channel(&mut self, target: &PeerId) {
        let Some(record) = self.peers.get_mut(target) else {
            error!(target = "portal", peer = %target, "cannot create data channel for an unknown peer");
            return;
        };
        let Some(connection) = record.connection.as_mut() else {
            error!(target = "portal", peer = %target, "cannot create data channel without a connection");
            return;
        };
        if record.channel.is_some() {
            trace!(target = "portal", peer = %target, "data channel already present");
            return;
        }
        let Some(local) = self.identity.current_id() else {
            error!(target = "portal", peer = %target, "cannot name a data channel before a local id is assigned");
            return;
        };
        if !connection.request_channel() {
            trace!(target = "portal", peer = %target, "data channel already requested");
            return;
        }

        let label = self.config.channel_label(local, target);
        debug!(target = "portal", peer = %target, label = %label, "opening data channel");
        connection.push(Step::OpenChannel(label));
    }

    /// Queues `payload` for `target` and tries to deliver the queue.
    pub async fn send(&mut self, target: PeerId, payload: Payload) -> PeerResult<Delivery> {
        let Some(record) = self.peers.get_mut(&target) else {
            return Err(PeerError::UnknownPeer(target));
        };
        record.queue.push(payload);
        Ok(self.deliver(&target).await)
    }

    /// Queues `payload` for every tracked peer and tries each queue in turn.
    pub async fn broadcast(&mut self, payload: Payload) -> Vec<(PeerId, Delivery)> {
        let targets = self.peers.ids();
        if targets.is_empty() {
            debug!(target = "portal", "broadcast with no tracked peers");
        }
        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            if let Some(record) = self.peers.get_mut(&target) {
                record.queue.push(payload.clone());
            }
            let delivery = self.deliver(&target).await;
            outcomes.push((target, delivery));
        }
        outcomes
    }

    pub fn disconnect(&mut self, target: PeerId) -> PeerResult<()> {
        if !self.peers.contains(&target) {
            return Err(PeerError::UnknownPeer(target));
        }
        self.teardown(&target, ConnectionState::Closed);
        Ok(())
    }

    /// Tears down every peer and waits for their links and channels to close.
    pub async fn close_all(&mut self) {
        for peer in self.peers.ids() {
            self.teardown(&peer, ConnectionState::Closed);
        }
        for task in std::mem::take(&mut self.retiring) {
            if let Err(err) = task.await {
                error!(target = "portal", error = %err, "closing task failed");
            }
        }
    }

    fn require_local(&self, target: &PeerId) -> PeerResult<PeerId> {
        self.identity
            .current_id()
            .cloned()
            .ok_or_else(|| PeerError::negotiation(target, "no local peer id assigned yet"))
    }

    fn connection(&self, peer: &PeerId) -> Option<&Connection> {
        self.peers.get(peer).and_then(|record| record.connection.as_ref())
    }

    fn connection_mut(&mut self, peer: &PeerId) -> PeerResult<&mut Connection> {
        self.peers
            .get_mut(peer)
            .and_then(|record| record.connection.as_mut())
            .ok_or_else(|| PeerError::UnknownPeer(peer.clone()))
    }

    /// Starts a fresh connection to `remote` and makes it the peer's
    /// connection. A previous connection and its channel are closed; queued
    /// messages stay.
    fn install_connection(&mut self, remote: &PeerId, local: &PeerId, role: Role) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let request = LinkRequest {
            remote: remote.clone(),
            role,
            ice_servers: self.config.ice_servers.clone(),
            channel_label: self.config.channel_label(local, remote),
            context: LinkContext::new(remote.clone(), generation, self.link_events.clone()),
        };
        let connection = Connection::start(
            Arc::clone(&self.connector),
            request,
            self.root.child_token(),
            self.config.negotiation_timeout,
        );

        let record = self.peers.entry(remote);
        let previous = record.connection.replace(connection);
        let stale_channel = record.channel.take();

        if let Some(mut previous) = previous {
            warn!(
                target = "portal",
                peer = %remote,
                previous_generation = previous.generation(),
                generation,
                "replacing existing connection"
            );
            if let Some(worker) = previous.shut(remote, ConnectionState::Closed) {
                self.retire(worker);
            }
        }
        if let Some(channel) = stale_channel {
            warn!(target = "portal", peer = %remote, label = channel.label(), "closing data channel of replaced connection");
            self.close_channel(channel.handle().clone());
        }
        debug!(target = "portal", peer = %remote, generation, role = ?role, "connection created");
    }

    fn initiate_offer(&mut self, target: &PeerId) -> PeerResult<()> {
        let connection = self.connection_mut(target)?;
        connection.transition(target, ConnectionState::NegotiatingLocalOffer);
        connection.push(Step::CreateOffer);
        Ok(())
    }

    async fn on_step(&mut self, peer: &PeerId, outcome: StepOutcome) {
        match outcome {
            StepOutcome::LinkReady => debug!(target = "portal", peer = %peer, "link open"),
            StepOutcome::OfferCreated(offer) => self.send_offer(peer, offer),
            StepOutcome::AnswerCreated(answer) => self.send_answer(peer, answer),
            StepOutcome::AnswerApplied => self.on_answer_applied(peer),
            StepOutcome::CandidateAdded => {
                trace!(target = "portal", peer = %peer, "remote candidate applied");
            }
            StepOutcome::ChannelCreated(handle) => self.install_channel(peer, handle).await,
            StepOutcome::Failed { step, error } => self.on_step_failed(peer, step, error),
        }
    }

    fn send_offer(&mut self, peer: &PeerId, offer: SessionDescription) {
        let Some(local) = self.identity.current_id().cloned() else {
            return;
        };
        let Ok(connection) = self.connection_mut(peer) else {
            return;
        };
        connection.set_local_description(offer.clone());

        info!(target = "portal", peer = %peer, "sending session offer");
        self.signaling.send(&SignalingMessage::SessionOffer {
            sender_peer_id: local,
            target_peer_id: peer.clone(),
            session_description: offer,
        });
        if let Ok(connection) = self.connection_mut(peer) {
            connection.resolve_offer(Ok(()));
        }
    }

    fn send_answer(&mut self, peer: &PeerId, answer: SessionDescription) {
        let Some(local) = self.identity.current_id().cloned() else {
            return;
        };
        let Ok(connection) = self.connection_mut(peer) else {
            return;
        };
        connection.set_local_description(answer.clone());

        info!(target = "portal", peer = %peer, "answering session offer");
        self.signaling.send(&SignalingMessage::SessionAnswer {
            sender_peer_id: local,
            target_peer_id: peer.clone(),
            session_description: answer,
        });
    }

    fn on_answer_applied(&mut self, peer: &PeerId) {
        let Ok(connection) = self.connection_mut(peer) else {
            return;
        };
        // A renegotiation on a live link completes without a new state report.
        if connection.state() == ConnectionState::NegotiatingLocalOffer
            && connection.link_state() == LinkState::Connected
        {
            connection.transition(peer, ConnectionState::Connected);
        }
        debug!(target = "portal", peer = %peer, "applied session answer");
    }

    /// Abandons the failed step only; the connection keeps its other work.
    fn on_step_failed(&mut self, peer: &PeerId, step: StepKind, error: PeerError) {
        let Ok(connection) = self.connection_mut(peer) else {
            return;
        };
        let waiter = match step {
            StepKind::Open | StepKind::Offer => connection.take_offer_waiter(),
            StepKind::Answer | StepKind::ApplyAnswer => {
                connection.clear_remote_description();
                None
            }
            StepKind::OpenChannel => {
                connection.channel_request_failed();
                None
            }
            StepKind::Candidate => None,
        };

        match waiter {
            Some(waiter) => {
                warn!(target = "portal", peer = %peer, error = %error, "connection attempt failed");
                let _ = waiter.send(Err(error));
            }
            None => self.report(error),
        }
        if step == StepKind::Open {
            self.teardown(peer, ConnectionState::Failed);
        }
    }

    fn send_local_candidate(&self, peer: &PeerId, candidate: IceCandidate) {
        let Some(local) = self.identity.current_id() else {
            warn!(target = "portal", peer = %peer, "no local peer id; local candidate dropped");
            return;
        };
        trace!(target = "portal", peer = %peer, candidate = %candidate.candidate, "sending local candidate");
        self.signaling.send(&SignalingMessage::NewIceCandidate {
            sender_peer_id: local.clone(),
            target_peer_id: peer.clone(),
            candidate,
        });
    }

    fn on_link_state(&mut self, peer: &PeerId, state: LinkState) {
        let Ok(connection) = self.connection_mut(peer) else {
            return;
        };
        connection.set_link_state(state);
        debug!(target = "portal", peer = %peer, state = ?state, "link state");

        match state {
            LinkState::New | LinkState::Connecting => {}
            LinkState::Connected => {
                connection.transition(peer, ConnectionState::Connected);
                let live = connection.state() == ConnectionState::Connected;
                if live && connection.role() == Role::Initiator {
                    self.create_channel(peer);
                }
            }
            LinkState::Disconnected => {
                connection.transition(peer, ConnectionState::Disconnected);
            }
            LinkState::Failed => self.teardown(peer, ConnectionState::Failed),
            LinkState::Closed => self.teardown(peer, ConnectionState::Closed),
        }
    }

    fn on_negotiation_needed(&mut self, peer: &PeerId) {
        let Some(state) = self.connection(peer).map(Connection::state) else {
            return;
        };
        if !matches!(state, ConnectionState::New | ConnectionState::Connected) {
            trace!(target = "portal", peer = %peer, state = ?state, "negotiation already in progress");
            return;
        }
        if self.identity.current_id().is_none() {
            return;
        }
        debug!(target = "portal", peer = %peer, "renegotiating");
        if let Err(err) = self.initiate_offer(peer) {
            self.report(err);
        }
    }

    async fn install_channel(&mut self, peer: &PeerId, handle: Arc<dyn Channel>) {
        let Some(record) = self.peers.get_mut(peer) else {
            self.close_channel(handle);
            return;
        };
        let channel = DataChannel::new(handle);
        let readiness = channel.readiness();
        info!(target = "portal", peer = %peer, label = channel.label(), readiness = ?readiness, "data channel installed");

        if let Some(previous) = record.channel.replace(channel) {
            warn!(target = "portal", peer = %peer, previous = previous.label(), "replacing existing data channel");
            self.close_channel(previous.handle().clone());
        }
        self.bus.publish(PeerEvent::ChannelStateChanged {
            peer: peer.clone(),
            readiness,
        });
        if readiness.is_open() && self.has_queued(peer) {
            self.deliver(peer).await;
        }
    }

    async fn on_channel_readiness(&mut self, peer: &PeerId, id: ChannelId, next: ChannelReadiness) {
        let Some(channel) = self
            .peers
            .get_mut(peer)
            .and_then(|record| record.channel.as_mut())
        else {
            return;
        };
        if channel.handle().id() != id {
            trace!(target = "portal", peer = %peer, channel = %id, "readiness of a replaced channel");
            return;
        }
        if !channel.advance(next) {
            return;
        }
        info!(target = "portal", peer = %peer, label = channel.label(), readiness = ?next, "data channel readiness");
        self.bus.publish(PeerEvent::ChannelStateChanged {
            peer: peer.clone(),
            readiness: next,
        });
        if next.is_open() && self.has_queued(peer) {
            self.deliver(peer).await;
        }
    }

    fn has_queued(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|record| !record.queue.is_empty())
    }

    async fn deliver(&mut self, peer: &PeerId) -> Delivery {
        let Some(record) = self.peers.get_mut(peer) else {
            return Delivery::Abandoned;
        };
        let before = record.readiness();
        let delivery = record.flush().await;
        let after = record.readiness();
        if let Some(readiness) = after.filter(|now| Some(*now) != before) {
            self.bus.publish(PeerEvent::ChannelStateChanged {
                peer: peer.clone(),
                readiness,
            });
        }
        delivery
    }

    fn retire(&mut self, task: JoinHandle<()>) {
        self.retiring.retain(|task| !task.is_finished());
        self.retiring.push(task);
    }

    fn close_channel(&mut self, handle: Arc<dyn Channel>) {
        self.retire(tokio::spawn(async move { handle.close().await }));
    }

    fn teardown(&mut self, peer: &PeerId, end: ConnectionState) {
        let Some(mut record) = self.peers.remove(peer) else {
            return;
        };
        if let Some(worker) = record
            .connection
            .as_mut()
            .and_then(|connection| connection.shut(peer, end))
        {
            self.retire(worker);
        }
        if let Some(channel) = record.channel.take() {
            self.close_channel(channel.handle().clone());
        }
        let discarded = record.queue.clear();
        if discarded > 0 {
            warn!(target = "portal", peer = %peer, discarded, "discarded queued messages");
        }
        info!(target = "portal", peer = %peer, state = ?end, "peer torn down");
        self.bus.publish(PeerEvent::PeerClosed { peer: peer.clone() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockChannel, MockConnector, MockSignaling, MockStep};
    use parking_lot::Mutex;
    use std::time::Duration;

    /// How long the link event stream has to stay quiet before `pump` stops.
    const QUIET: Duration = Duration::from_millis(20);

    struct Harness {
        core: PeerCore,
        signaling: Arc<MockSignaling>,
        connector: Arc<MockConnector>,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        events: Arc<Mutex<Vec<PeerEvent>>>,
    }

    impl Harness {
        fn new() -> Self {
            let bus = EventBus::new();
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            let _ = bus.on_event(move |event: &PeerEvent| sink.lock().push(event.clone()));
            let (signaling, _inbound) = MockSignaling::new();
            let connector = MockConnector::new();
            let (tx, link_events) = mpsc::unbounded_channel();
            let core = PeerCore::new(
                PeerConfig::default(),
                bus,
                signaling.clone(),
                connector.clone(),
                tx,
                CancellationToken::new(),
            );
            Self {
                core,
                signaling,
                connector,
                link_events,
                events,
            }
        }

        fn assigned(local: &str) -> Self {
            let mut harness = Self::new();
            harness.core.accept_assignment(Some(local.into())).unwrap();
            harness.events.lock().clear();
            harness
        }

        /// Feeds link callbacks and finished steps back into the core until
        /// the workers go quiet.
        async fn pump(&mut self) {
            while let Ok(Some(event)) = tokio::time::timeout(QUIET, self.link_events.recv()).await {
                self.core.handle_link_event(event).await;
            }
        }

        async fn signal(&mut self, message: SignalingMessage) -> PeerResult<()> {
            let result = self.core.handle_signal(message);
            self.pump().await;
            result
        }

        async fn connect(&mut self, target: &str) -> PeerResult<()> {
            let pending = self.core.connect_to_peer(target.into())?;
            self.pump().await;
            pending.sent().await
        }

        fn connection(&self, peer: &str) -> &Connection {
            self.core.connection(&peer.into()).unwrap()
        }

        fn faults(&self) -> Vec<PeerError> {
            self.events
                .lock()
                .iter()
                .filter_map(|event| match event {
                    PeerEvent::Fault { error, .. } => Some(error.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    fn offer(sender: &str, target: &str) -> SignalingMessage {
        SignalingMessage::SessionOffer {
            sender_peer_id: sender.into(),
            target_peer_id: target.into(),
            session_description: SessionDescription::offer(format!("offer-from-{sender}")),
        }
    }

    fn answer(sender: &str, target: &str) -> SignalingMessage {
        SignalingMessage::SessionAnswer {
            sender_peer_id: sender.into(),
            target_peer_id: target.into(),
            session_description: SessionDescription::answer(format!("answer-from-{sender}")),
        }
    }

    fn candidate(sender: &str, target: &str, line: &str) -> SignalingMessage {
        SignalingMessage::NewIceCandidate {
            sender_peer_id: sender.into(),
            target_peer_id: target.into(),
            candidate: IceCandidate::new(line),
        }
    }

    fn offer_to(local: &str, target: &str) -> SignalingMessage {
        SignalingMessage::SessionOffer {
            sender_peer_id: local.into(),
            target_peer_id: target.into(),
            session_description: SessionDescription::offer(format!("mock-offer-{target}")),
        }
    }

    fn is_negotiation_failure_for(error: &PeerError, peer: &str) -> bool {
        matches!(error, PeerError::NegotiationFailure { .. }) && error.peer() == Some(&PeerId::from(peer))
    }

    #[tokio::test]
    async fn connect_sends_offer_and_moves_to_local_offer() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();

        let connection = h.connection("b");
        assert_eq!(connection.state(), ConnectionState::NegotiatingLocalOffer);
        assert_eq!(connection.role(), Role::Initiator);
        assert_eq!(
            connection.local_description(),
            Some(&SessionDescription::offer("mock-offer-b"))
        );
        assert_eq!(h.signaling.sent(), vec![offer_to("a", "b")]);
        let link = h.connector.link_for(&"b".into()).unwrap();
        assert_eq!(link.channel_label, "dataChannel-a-b");
    }

    #[tokio::test]
    async fn connect_without_identity_fails() {
        let mut h = Harness::new();
        assert!(matches!(
            h.core.connect_to_peer("b".into()),
            Err(PeerError::NegotiationFailure { .. })
        ));
        assert!(h.core.peers().is_empty());
    }

    #[tokio::test]
    async fn offer_failure_is_reported_to_caller() {
        let mut h = Harness::assigned("a");
        h.connector.fail(MockStep::Offer);
        let err = h.connect("b").await.unwrap_err();
        assert_eq!(err.peer(), Some(&PeerId::from("b")));
        assert!(h.signaling.sent().is_empty());
        assert!(h.faults().is_empty());
    }

    #[tokio::test]
    async fn link_open_failure_drops_the_attempt() {
        let mut h = Harness::assigned("a");
        h.connector.fail(MockStep::Open);
        let err = h.connect("b").await.unwrap_err();
        assert!(is_negotiation_failure_for(&err, "b"));
        assert!(h.core.peers().is_empty());
        assert!(h.events.lock().contains(&PeerEvent::PeerClosed { peer: "b".into() }));
    }

    #[tokio::test]
    async fn responder_applies_offer_and_answers() {
        let mut h = Harness::assigned("b");
        h.signal(offer("a", "b")).await.unwrap();

        let connection = h.connection("a");
        assert_eq!(connection.state(), ConnectionState::NegotiatingRemoteOffer);
        assert_eq!(
            connection.remote_description(),
            Some(&SessionDescription::offer("offer-from-a"))
        );
        assert_eq!(
            connection.local_description(),
            Some(&SessionDescription::answer("mock-answer-a"))
        );
        let link = h.connector.link_for(&"a".into()).unwrap();
        assert_eq!(link.local_descriptions(), vec![SessionDescription::answer("mock-answer-a")]);
        assert_eq!(
            h.signaling.sent(),
            vec![SignalingMessage::SessionAnswer {
                sender_peer_id: "b".into(),
                target_peer_id: "a".into(),
                session_description: SessionDescription::answer("mock-answer-a"),
            }]
        );
    }

    #[tokio::test]
    async fn misdirected_offer_creates_nothing() {
        let mut h = Harness::assigned("b");
        let err = h.core.handle_signal(offer("a", "c")).unwrap_err();
        assert_eq!(
            err,
            PeerError::MisdirectedMessage {
                local: Some("b".into()),
                target: "c".into()
            }
        );
        assert!(!h.core.peers().contains(&"a".into()));
        assert!(h.connector.links().is_empty());
    }

    #[tokio::test]
    async fn misdirected_answer_and_candidate_leave_the_connection_alone() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        let link = h.connector.link_for(&"b".into()).unwrap();
        let misdirected = PeerError::MisdirectedMessage {
            local: Some("a".into()),
            target: "z".into(),
        };

        assert_eq!(h.signal(answer("b", "z")).await.unwrap_err(), misdirected);
        assert_eq!(h.signal(candidate("b", "z", "c1")).await.unwrap_err(), misdirected);

        let connection = h.connection("b");
        assert_eq!(connection.state(), ConnectionState::NegotiatingLocalOffer);
        assert!(connection.remote_description().is_none());
        assert!(connection.candidates().is_empty());
        assert!(link.remote_descriptions().is_empty());
        assert!(link.candidates().is_empty());
        assert_eq!(h.connector.links().len(), 1);
    }

    #[tokio::test]
    async fn answer_and_candidate_for_unknown_peer_mutate_nothing() {
        let mut h = Harness::assigned("a");
        assert_eq!(
            h.signal(answer("z", "a")).await.unwrap_err(),
            PeerError::UnknownPeerForAnswer("z".into())
        );
        assert_eq!(
            h.signal(candidate("z", "a", "c1")).await.unwrap_err(),
            PeerError::UnknownPeerForCandidate("z".into())
        );
        assert!(h.core.peers().is_empty());
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        let link = h.connector.link_for(&"b".into()).unwrap();

        h.signal(candidate("b", "a", "c1")).await.unwrap();
        h.signal(candidate("b", "a", "c1")).await.unwrap();
        assert!(link.candidates().is_empty());

        h.signal(answer("b", "a")).await.unwrap();
        assert_eq!(link.remote_descriptions(), vec![SessionDescription::answer("answer-from-b")]);
        assert_eq!(link.candidates(), vec![IceCandidate::new("c1")]);

        h.signal(candidate("b", "a", "c2")).await.unwrap();
        assert_eq!(link.candidates().len(), 2);
        assert_eq!(h.connection("b").candidates().len(), 2);
    }

    #[tokio::test]
    async fn remote_offer_failure_abandons_only_that_peer() {
        let mut h = Harness::assigned("b");
        h.connector.fail(MockStep::RemoteDescription);

        h.signal(offer("a", "b")).await.unwrap();

        let faults = h.faults();
        assert_eq!(faults.len(), 1);
        assert!(is_negotiation_failure_for(&faults[0], "a"));
        assert!(h.signaling.sent().is_empty());
        assert!(h.core.peers().contains(&"a".into()));

        h.connect("c").await.unwrap();
        assert_eq!(h.signaling.sent(), vec![offer_to("b", "c")]);
    }

    #[tokio::test]
    async fn answer_creation_failure_abandons_only_that_step() {
        let mut h = Harness::assigned("b");
        h.connector.fail(MockStep::Answer);

        h.signal(offer("a", "b")).await.unwrap();

        let faults = h.faults();
        assert_eq!(faults.len(), 1);
        assert!(is_negotiation_failure_for(&faults[0], "a"));
        let link = h.connector.link_for(&"a".into()).unwrap();
        assert_eq!(link.remote_descriptions(), vec![SessionDescription::offer("offer-from-a")]);
        assert!(h.signaling.sent().is_empty());
        assert_eq!(
            h.connection("a").state(),
            ConnectionState::NegotiatingRemoteOffer
        );

        link.report_state(LinkState::Connected);
        h.pump().await;
        assert_eq!(h.connection("a").state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn remote_candidate_failure_is_reported_and_negotiation_goes_on() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        h.signal(answer("b", "a")).await.unwrap();
        h.connector.fail(MockStep::Candidate);

        h.signal(candidate("b", "a", "c1")).await.unwrap();

        let faults = h.faults();
        assert_eq!(faults.len(), 1);
        assert!(is_negotiation_failure_for(&faults[0], "b"));
        assert_eq!(h.connection("b").candidates(), &[IceCandidate::new("c1")]);

        h.connect("c").await.unwrap();
        assert!(h.signaling.sent().contains(&offer_to("a", "c")));
        let link = h.connector.link_for(&"b".into()).unwrap();
        link.report_state(LinkState::Connected);
        h.pump().await;
        assert_eq!(link.channels().len(), 1);
    }

    #[tokio::test]
    async fn stalled_step_leaves_other_peers_running() {
        let mut h = Harness::assigned("a");
        h.connector.stall(MockStep::Answer);

        h.signal(offer("slow", "a")).await.unwrap();
        let connected = tokio::time::timeout(Duration::from_secs(2), h.connect("b")).await;

        assert_eq!(connected.expect("stalled peer held up another"), Ok(()));
        assert_eq!(h.signaling.sent(), vec![offer_to("a", "b")]);
        assert_eq!(
            h.connection("slow").state(),
            ConnectionState::NegotiatingRemoteOffer
        );
        assert_eq!(h.core.send("b".into(), "m".into()).await.unwrap(), Delivery::Deferred);

        let slow = h.connector.link_for(&"slow".into()).unwrap();
        h.core.disconnect("slow".into()).unwrap();
        h.pump().await;
        assert!(slow.is_closed());
    }

    #[tokio::test]
    async fn local_candidates_are_addressed_to_the_remote() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        h.signaling.take_sent();
        let link = h.connector.link_for(&"b".into()).unwrap();

        link.emit(LinkEventKind::LocalCandidate(Some(IceCandidate::new("local-1"))));
        link.emit(LinkEventKind::LocalCandidate(None));
        h.pump().await;

        assert_eq!(
            h.signaling.sent(),
            vec![SignalingMessage::NewIceCandidate {
                sender_peer_id: "a".into(),
                target_peer_id: "b".into(),
                candidate: IceCandidate::new("local-1"),
            }]
        );
    }

    #[tokio::test]
    async fn first_connected_creates_exactly_one_channel() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        let link = h.connector.link_for(&"b".into()).unwrap();

        link.report_state(LinkState::Connected);
        link.report_state(LinkState::Connected);
        h.pump().await;

        assert_eq!(link.channels().len(), 1);
        assert_eq!(link.channels()[0].label(), "dataChannel-a-b");
        assert_eq!(h.connection("b").state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnected_link_can_come_back() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        let link = h.connector.link_for(&"b".into()).unwrap();
        link.report_state(LinkState::Connected);
        h.pump().await;

        link.report_state(LinkState::Disconnected);
        h.pump().await;
        assert_eq!(h.connection("b").state(), ConnectionState::Disconnected);
        assert!(h.core.peers().contains(&"b".into()));

        link.report_state(LinkState::Connected);
        h.pump().await;
        assert_eq!(h.connection("b").state(), ConnectionState::Connected);
        assert_eq!(link.channels().len(), 1);
        assert!(!link.is_closed());
    }

    #[tokio::test]
    async fn responder_waits_for_inbound_channel() {
        let mut h = Harness::assigned("b");
        h.signal(offer("a", "b")).await.unwrap();
        let link = h.connector.link_for(&"a".into()).unwrap();

        link.report_state(LinkState::Connected);
        h.pump().await;
        assert!(link.channels().is_empty());

        let inbound = link.remote_channel("dataChannel-a-b");
        h.pump().await;
        link.open(&inbound);
        link.emit(LinkEventKind::ChannelMessage(inbound.id(), "hi".into()));
        h.pump().await;

        assert!(h.core.has_active_peer());
        assert!(h.events.lock().contains(&PeerEvent::ApplicationData {
            peer: "a".into(),
            payload: "hi".into(),
        }));
    }

    #[tokio::test]
    async fn queue_flushes_when_channel_opens() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        let link = h.connector.link_for(&"b".into()).unwrap();

        assert_eq!(h.core.send("b".into(), "m1".into()).await.unwrap(), Delivery::Deferred);
        link.report_state(LinkState::Connected);
        h.pump().await;
        let channel = link.channels()[0].clone();
        assert_eq!(h.core.send("b".into(), "m2".into()).await.unwrap(), Delivery::Deferred);
        assert!(channel.sent().is_empty());

        link.open(&channel);
        h.pump().await;

        assert_eq!(channel.sent(), vec![Payload::from("m1"), Payload::from("m2")]);
        assert!(h.core.peers().get(&"b".into()).unwrap().queue.is_empty());
        assert!(h.events.lock().contains(&PeerEvent::ChannelStateChanged {
            peer: "b".into(),
            readiness: ChannelReadiness::Open,
        }));
    }

    #[tokio::test]
    async fn send_to_untracked_peer_fails() {
        let mut h = Harness::assigned("a");
        assert_eq!(
            h.core.send("ghost".into(), "m".into()).await.unwrap_err(),
            PeerError::UnknownPeer("ghost".into())
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_every_tracked_peer() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        h.connect("c").await.unwrap();
        let link_b = h.connector.link_for(&"b".into()).unwrap();
        link_b.report_state(LinkState::Connected);
        h.pump().await;
        let channel_b = link_b.channels()[0].clone();
        link_b.open(&channel_b);
        h.pump().await;

        let outcomes = h.core.broadcast("hello".into()).await;

        assert_eq!(
            outcomes,
            vec![
                (PeerId::from("b"), Delivery::Flushed(1)),
                (PeerId::from("c"), Delivery::Deferred),
            ]
        );
        assert_eq!(channel_b.sent(), vec![Payload::from("hello")]);
        assert_eq!(h.core.peers().get(&"c".into()).unwrap().queue.len(), 1);
    }

    #[tokio::test]
    async fn failed_link_tears_peer_down() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        h.core.send("b".into(), "pending".into()).await.unwrap();
        let link = h.connector.link_for(&"b".into()).unwrap();

        link.report_state(LinkState::Failed);
        h.pump().await;

        assert!(!h.core.peers().contains(&"b".into()));
        assert!(link.is_closed());
        assert!(h.events.lock().contains(&PeerEvent::PeerClosed { peer: "b".into() }));
    }

    #[tokio::test]
    async fn replaced_connection_events_are_ignored() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        let first = h.connector.link_for(&"b".into()).unwrap();
        h.connect("b").await.unwrap();
        let second = h.connector.link_for(&"b".into()).unwrap();
        assert!(first.is_closed());
        assert_ne!(first.generation(), second.generation());

        first.report_state(LinkState::Failed);
        h.pump().await;
        assert!(h.core.peers().contains(&"b".into()));
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn inbound_channel_replaces_existing_one() {
        let mut h = Harness::assigned("b");
        h.signal(offer("a", "b")).await.unwrap();
        let link = h.connector.link_for(&"a".into()).unwrap();
        let first = link.remote_channel("first");
        let second = link.remote_channel("second");
        h.pump().await;

        assert!(first.is_closed());
        let record = h.core.peers().get(&"a".into()).unwrap();
        assert_eq!(record.channel.as_ref().unwrap().label(), "second");
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn create_channel_without_connection_does_nothing() {
        let mut h = Harness::assigned("a");
        h.core.create_channel(&"b".into());
        h.pump().await;
        assert!(h.core.peers().is_empty());
        assert!(h.connector.links().is_empty());
    }

    #[tokio::test]
    async fn channel_open_failure_becomes_fault() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        h.connector.fail(MockStep::OpenChannel);
        let link = h.connector.link_for(&"b".into()).unwrap();
        link.report_state(LinkState::Connected);
        h.pump().await;

        assert_eq!(h.faults().len(), 1);
        assert!(h.core.peers().get(&"b".into()).unwrap().channel.is_none());
    }

    #[tokio::test]
    async fn disconnect_discards_queue_and_announces() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        h.core.send("b".into(), "never".into()).await.unwrap();

        h.core.disconnect("b".into()).unwrap();

        assert!(h.core.peers().is_empty());
        assert_eq!(
            h.core.disconnect("b".into()).unwrap_err(),
            PeerError::UnknownPeer("b".into())
        );
        assert!(h.events.lock().contains(&PeerEvent::PeerClosed { peer: "b".into() }));
    }

    #[tokio::test]
    async fn close_all_waits_for_links_to_close() {
        let mut h = Harness::assigned("a");
        h.connect("b").await.unwrap();
        h.signal(offer("c", "a")).await.unwrap();
        let links = h.connector.links();

        h.core.close_all().await;

        assert!(h.core.peers().is_empty());
        assert!(links.iter().all(|link| link.is_closed()));
    }

    #[tokio::test]
    async fn open_channel_installed_late_flushes_immediately() {
        let mut h = Harness::assigned("b");
        h.signal(offer("a", "b")).await.unwrap();
        h.core.send("a".into(), "early".into()).await.unwrap();
        let link = h.connector.link_for(&"a".into()).unwrap();

        let channel = MockChannel::new("dataChannel-a-b", ChannelReadiness::Open);
        link.emit(LinkEventKind::InboundChannel(channel.clone()));
        h.pump().await;

        assert_eq!(channel.sent(), vec![Payload::from("early")]);
    }
}
