use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::steps::{Step, StepQueue};
use crate::error::{PeerError, PeerResult};
use crate::link::{Connector, LinkError, LinkRequest, LinkState, Role};
use crate::protocol::{IceCandidate, PeerId, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    NegotiatingLocalOffer,
    NegotiatingRemoteOffer,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == next || self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed | Closed) => true,
            (New, NegotiatingLocalOffer | NegotiatingRemoteOffer) => true,
            (NegotiatingLocalOffer | NegotiatingRemoteOffer, Connected | Disconnected) => true,
            (Connected, Disconnected | NegotiatingLocalOffer) => true,
            (Disconnected, Connected) => true,
            _ => false,
        }
    }
}

/// Cancellation and deadline applied to every negotiation step of one
/// connection.
#[derive(Clone)]
pub struct StepGuard {
    peer: PeerId,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl StepGuard {
    pub fn new(peer: PeerId, cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            peer,
            cancel,
            timeout,
        }
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub async fn run<T, F>(&self, step: &'static str, fut: F) -> PeerResult<T>
    where
        F: Future<Output = Result<T, LinkError>>,
    {
        let bounded = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .unwrap_or(Err(LinkError::TimedOut)),
                None => fut.await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PeerError::negotiation(&self.peer, format!("{step}: cancelled"))),
            result = bounded => result.map_err(|err| PeerError::negotiation(&self.peer, format!("{step}: {err}"))),
        }
    }
}

/// Negotiation state of one connection attempt. The link itself lives in the
/// connection's step worker; this side only records what was asked of it and
/// what came back.
pub struct Connection {
    steps: StepQueue,
    worker: Option<JoinHandle<()>>,
    role: Role,
    generation: u64,
    state: ConnectionState,
    link_state: LinkState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    pending_candidates: Vec<IceCandidate>,
    channel_requested: bool,
    offer_waiter: Option<oneshot::Sender<PeerResult<()>>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Spawns the step worker, which opens the link through `connector`.
    pub fn start(
        connector: Arc<dyn Connector>,
        request: LinkRequest,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        let role = request.role;
        let generation = request.context.generation();
        let guard = StepGuard::new(request.remote.clone(), cancel.clone(), timeout);
        let (steps, worker) = StepQueue::spawn(connector, request, guard);
        Self {
            steps,
            worker: Some(worker),
            role,
            generation,
            state: ConnectionState::New,
            link_state: LinkState::New,
            local_description: None,
            remote_description: None,
            candidates: Vec::new(),
            pending_candidates: Vec::new(),
            channel_requested: false,
            offer_waiter: None,
            cancel,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn set_link_state(&mut self, state: LinkState) {
        self.link_state = state;
    }

    /// Queues a step behind every step already queued for this connection.
    pub fn push(&self, step: Step) {
        self.steps.push(step);
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn set_local_description(&mut self, description: SessionDescription) {
        self.local_description = Some(description);
    }

    /// The remote description most recently queued for application.
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn set_remote_description(&mut self, description: SessionDescription) {
        self.remote_description = Some(description);
    }

    pub fn clear_remote_description(&mut self) {
        self.remote_description = None;
    }

    pub fn candidates(&self) -> &[IceCandidate] {
        &self.candidates
    }

    /// Adds a remote candidate to the exchanged set; `false` if already known.
    pub fn merge_candidate(&mut self, candidate: &IceCandidate) -> bool {
        if self.candidates.contains(candidate) {
            return false;
        }
        self.candidates.push(candidate.clone());
        true
    }

    /// Holds a candidate until a remote description has been queued.
    pub fn hold_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    /// Marks the data channel as requested; `false` if it already was.
    pub fn request_channel(&mut self) -> bool {
        !std::mem::replace(&mut self.channel_requested, true)
    }

    pub fn channel_request_failed(&mut self) {
        self.channel_requested = false;
    }

    /// Registers who to tell once the pending offer went out or failed.
    pub fn await_offer(&mut self, waiter: oneshot::Sender<PeerResult<()>>) {
        self.offer_waiter = Some(waiter);
    }

    pub fn resolve_offer(&mut self, result: PeerResult<()>) {
        if let Some(waiter) = self.offer_waiter.take() {
            let _ = waiter.send(result);
        }
    }

    pub fn take_offer_waiter(&mut self) -> Option<oneshot::Sender<PeerResult<()>>> {
        self.offer_waiter.take()
    }

    pub fn transition(&mut self, peer: &PeerId, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!(
                target = "portal",
                peer = %peer,
                from = ?self.state,
                to = ?next,
                "ignored connection transition"
            );
            return false;
        }
        debug!(target = "portal", peer = %peer, from = ?self.state, to = ?next, "connection state");
        self.state = next;
        true
    }

    /// Cancels in-flight steps and moves to `end` unless already terminal.
    /// Returns the worker, which closes the link on its way out.
    pub fn shut(&mut self, peer: &PeerId, end: ConnectionState) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        self.transition(peer, end);
        self.worker.take()
    }
}
