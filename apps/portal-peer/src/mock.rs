//! In-memory stand-ins for the rendezvous connection and the connectivity
//! primitive. They record what the layer asks of them and let a test drive
//! callbacks by hand.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::PeerResult;
use crate::link::{
    Channel, ChannelId, Connector, Link, LinkContext, LinkError, LinkEventKind, LinkRequest,
    LinkState, Role,
};
use crate::peer::ChannelReadiness;
use crate::protocol::{IceCandidate, Payload, PeerId, SessionDescription, SignalingMessage};
use crate::signaling::{InboundSignals, SignalingTransport};

pub struct MockSignaling {
    inbound: mpsc::UnboundedSender<SignalingMessage>,
    sent: Mutex<Vec<SignalingMessage>>,
    connected: AtomicBool,
    connect_calls: AtomicUsize,
}

impl MockSignaling {
    pub fn new() -> (Arc<Self>, InboundSignals) {
        let (inbound, signals) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            inbound,
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
        });
        (transport, signals)
    }

    /// Feeds a message as if the rendezvous service had sent it.
    pub fn deliver(&self, message: SignalingMessage) {
        let _ = self.inbound.send(message);
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

impl SignalingTransport for MockSignaling {
    fn connect(&self) -> PeerResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) {
        self.sent.lock().push(message.clone());
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Link operations that can be told to fail or to never finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    Open,
    Offer,
    Answer,
    RemoteDescription,
    Candidate,
    OpenChannel,
}

#[derive(Default)]
struct Script {
    failing: HashSet<MockStep>,
    stalled: HashSet<MockStep>,
}

type SharedScript = Arc<Mutex<Script>>;

async fn gate(script: &SharedScript, step: MockStep) -> Result<(), LinkError> {
    let (failing, stalled) = {
        let script = script.lock();
        (script.failing.contains(&step), script.stalled.contains(&step))
    };
    if stalled {
        std::future::pending::<()>().await;
    }
    if failing {
        return Err(LinkError::Primitive(format!("injected {step:?} failure")));
    }
    Ok(())
}

#[derive(Default)]
pub struct MockConnector {
    links: Mutex<Vec<Arc<MockLink>>>,
    script: SharedScript,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, step: MockStep) {
        self.script.lock().failing.insert(step);
    }

    /// Makes `step` hang on every link until the caller gives up on it.
    pub fn stall(&self, step: MockStep) {
        self.script.lock().stalled.insert(step);
    }

    /// Every link opened so far, oldest first.
    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().clone()
    }

    /// Most recent link opened towards `peer`.
    pub fn link_for(&self, peer: &PeerId) -> Option<Arc<MockLink>> {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|link| &link.remote == peer)
            .cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, request: LinkRequest) -> Result<Arc<dyn Link>, LinkError> {
        gate(&self.script, MockStep::Open).await?;
        let link = Arc::new(MockLink {
            remote: request.remote,
            role: request.role,
            ice_servers: request.ice_servers,
            channel_label: request.channel_label,
            context: request.context,
            script: Arc::clone(&self.script),
            remote_descriptions: Mutex::new(Vec::new()),
            local_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.links.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

pub struct MockLink {
    pub remote: PeerId,
    pub role: Role,
    pub ice_servers: Vec<String>,
    pub channel_label: String,
    context: LinkContext,
    script: SharedScript,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    local_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    closed: AtomicBool,
}

impl MockLink {
    pub fn generation(&self) -> u64 {
        self.context.generation()
    }

    /// Raises a callback as the primitive would.
    pub fn emit(&self, kind: LinkEventKind) {
        self.context.emit(kind);
    }

    pub fn report_state(&self, state: LinkState) {
        self.emit(LinkEventKind::StateChanged(state));
    }

    /// Marks `channel` open and raises the open callback.
    pub fn open(&self, channel: &Arc<MockChannel>) {
        channel.set_readiness(ChannelReadiness::Open);
        self.emit(LinkEventKind::ChannelOpened(channel.id()));
    }

    /// Simulates the remote side opening a channel towards us.
    pub fn remote_channel(&self, label: &str) -> Arc<MockChannel> {
        let channel = MockChannel::new(label, ChannelReadiness::Connecting);
        self.emit(LinkEventKind::InboundChannel(channel.clone()));
        channel
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local_descriptions.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// Channels opened locally through [`Link::open_channel`].
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for MockLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        gate(&self.script, MockStep::Offer).await?;
        let offer = SessionDescription::offer(format!("mock-offer-{}", self.remote));
        self.local_descriptions.lock().push(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        gate(&self.script, MockStep::Answer).await?;
        let answer = SessionDescription::answer(format!("mock-answer-{}", self.remote));
        self.local_descriptions.lock().push(answer.clone());
        Ok(answer)
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<(), LinkError> {
        gate(&self.script, MockStep::RemoteDescription).await?;
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        gate(&self.script, MockStep::Candidate).await?;
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn Channel>, LinkError> {
        gate(&self.script, MockStep::OpenChannel).await?;
        let channel = MockChannel::new(label, ChannelReadiness::Connecting);
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockChannel {
    id: ChannelId,
    label: String,
    readiness: Mutex<ChannelReadiness>,
    sent: Mutex<Vec<Payload>>,
    fail_after: Mutex<Option<usize>>,
    closed: AtomicBool,
}

impl MockChannel {
    pub fn new(label: &str, readiness: ChannelReadiness) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::next(),
            label: label.to_string(),
            readiness: Mutex::new(readiness),
            sent: Mutex::new(Vec::new()),
            fail_after: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_readiness(&self, readiness: ChannelReadiness) {
        *self.readiness.lock() = readiness;
    }

    /// Accepts `count` more sends, then fails every following one.
    pub fn fail_sends_after(&self, count: usize) {
        *self.fail_after.lock() = Some(self.sent.lock().len() + count);
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn readiness(&self) -> ChannelReadiness {
        *self.readiness.lock()
    }

    async fn send(&self, payload: &Payload) -> Result<(), LinkError> {
        let mut sent = self.sent.lock();
        if let Some(limit) = *self.fail_after.lock() {
            if sent.len() >= limit {
                return Err(LinkError::Primitive("injected send failure".into()));
            }
        }
        sent.push(payload.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut readiness = self.readiness.lock();
        if readiness.can_advance_to(ChannelReadiness::Closed) {
            *readiness = ChannelReadiness::Closed;
        }
    }
}
