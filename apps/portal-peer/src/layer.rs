//! Public handle of the peer connection layer.
//!
//! [`PeerLayer`] is cheap to clone. [`PeerLayer::fire_up`] spawns one
//! coordinator task that owns the [`PeerCore`] and serially handles inbound
//! signaling, link callbacks and commands issued through the handle. The
//! coordinator never waits on a negotiation step; those run in per-connection
//! workers and report back as link events.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::PeerConfig;
use crate::engine::{OfferPending, PeerCore};
use crate::error::{PeerError, PeerResult};
use crate::events::{EventBus, Observer, PeerEvent, Subscription};
use crate::link::rtc::RtcConnector;
use crate::link::{Connector, LinkEvent};
use crate::peer::Delivery;
use crate::protocol::{Payload, PeerId};
use crate::signaling::{InboundSignals, SignalingTransport, WebSocketSignaling};

enum Command {
    Connect {
        target: PeerId,
        reply: oneshot::Sender<PeerResult<OfferPending>>,
    },
    Send {
        target: PeerId,
        payload: Payload,
        reply: oneshot::Sender<PeerResult<Delivery>>,
    },
    Broadcast {
        payload: Payload,
        reply: oneshot::Sender<Vec<(PeerId, Delivery)>>,
    },
    Disconnect {
        target: PeerId,
        reply: oneshot::Sender<PeerResult<()>>,
    },
}

#[derive(Debug, Clone, Default)]
struct Status {
    local_peer_id: Option<PeerId>,
    active: bool,
}

struct Parts {
    inbound: InboundSignals,
    connector: Arc<dyn Connector>,
}

struct Inner {
    config: PeerConfig,
    bus: EventBus,
    signaling: Arc<dyn SignalingTransport>,
    parts: Mutex<Option<Parts>>,
    commands: RwLock<Option<mpsc::UnboundedSender<Command>>>,
    status: Arc<RwLock<Status>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct PeerLayer {
    inner: Arc<Inner>,
}

impl PeerLayer {
    /// Layer talking to the configured rendezvous service over a websocket and
    /// connecting peers with WebRTC.
    pub fn new(config: PeerConfig) -> Self {
        let (signaling, inbound) = WebSocketSignaling::new(config.signaling.clone());
        Self::with_parts(config, signaling, inbound, Arc::new(RtcConnector::new()))
    }

    pub fn with_parts(
        config: PeerConfig,
        signaling: Arc<dyn SignalingTransport>,
        inbound: InboundSignals,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                bus: EventBus::new(),
                signaling,
                parts: Mutex::new(Some(Parts { inbound, connector })),
                commands: RwLock::new(None),
                status: Arc::new(RwLock::new(Status::default())),
                shutdown: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    /// Starts the coordinator and begins connecting to the rendezvous
    /// service. Returns once the connection attempt is under way. Calling it
    /// again does nothing.
    pub fn fire_up(&self) -> PeerResult<()> {
        let Some(Parts { inbound, connector }) = self.inner.parts.lock().take() else {
            debug!(target = "portal", "peer layer already started");
            return Ok(());
        };

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let core = PeerCore::new(
            self.inner.config.clone(),
            self.inner.bus.clone(),
            Arc::clone(&self.inner.signaling),
            connector,
            link_tx,
            self.inner.shutdown.child_token(),
        );
        let coordinator = Coordinator {
            core,
            signals: inbound,
            link_events: link_rx,
            commands: command_rx,
            shutdown: self.inner.shutdown.clone(),
            status: Arc::clone(&self.inner.status),
        };
        *self.inner.commands.write() = Some(command_tx);
        *self.inner.task.lock() = Some(tokio::spawn(coordinator.run()));

        self.inner.signaling.connect()
    }

    /// Stops the coordinator, closing every peer. Waits for it to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.commands.write().take();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(target = "portal", error = %err, "coordinator task failed");
            }
        }
    }

    /// Starts negotiating with `target`. Returns once the offer has been
    /// handed to the rendezvous service.
    pub async fn connect_to_peer(&self, target: impl Into<PeerId>) -> PeerResult<()> {
        let target = target.into();
        let pending = self
            .request(|reply| Command::Connect { target, reply })
            .await??;
        pending.sent().await
    }

    pub async fn send(&self, target: impl Into<PeerId>, payload: impl Into<Payload>) -> PeerResult<Delivery> {
        let (target, payload) = (target.into(), payload.into());
        self.request(|reply| Command::Send {
            target,
            payload,
            reply,
        })
        .await?
    }

    /// Attempts delivery to every tracked peer, returning each outcome.
    pub async fn broadcast(&self, payload: impl Into<Payload>) -> PeerResult<Vec<(PeerId, Delivery)>> {
        let payload = payload.into();
        self.request(|reply| Command::Broadcast { payload, reply })
            .await
    }

    pub async fn disconnect(&self, target: impl Into<PeerId>) -> PeerResult<()> {
        let target = target.into();
        self.request(|reply| Command::Disconnect { target, reply })
            .await?
    }

    pub fn register_observer(&self, observer: Arc<dyn Observer<PeerEvent>>) -> u64 {
        self.inner.bus.register_observer(observer)
    }

    pub fn on_event<F>(&self, callback: F) -> Subscription<PeerEvent>
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on_event(callback)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.bus.subscribe()
    }

    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.inner.status.read().local_peer_id.clone()
    }

    /// Whether any peer currently has an open data channel.
    pub fn has_active_peer(&self) -> bool {
        self.inner.status.read().active
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> PeerResult<T> {
        let sender = self
            .inner
            .commands
            .read()
            .clone()
            .ok_or(PeerError::LayerStopped)?;
        let (reply, response) = oneshot::channel();
        sender
            .send(build(reply))
            .map_err(|_| PeerError::LayerStopped)?;
        response.await.map_err(|_| PeerError::LayerStopped)
    }
}

struct Coordinator {
    core: PeerCore,
    signals: InboundSignals,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    status: Arc<RwLock<Status>>,
}

impl Coordinator {
    async fn run(mut self) {
        info!(target = "portal", "peer layer started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(message) = self.signals.recv() => {
                    if let Err(err) = self.core.handle_signal(message) {
                        self.core.report(err);
                    }
                }
                Some(event) = self.link_events.recv() => {
                    self.core.handle_link_event(event).await;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => break,
                },
            }
            self.refresh_status();
        }
        self.core.close_all().await;
        self.refresh_status();
        info!(target = "portal", "peer layer stopped");
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Connect { target, reply } => {
                let result = self.core.connect_to_peer(target);
                let _ = reply.send(result);
            }
            Command::Send {
                target,
                payload,
                reply,
            } => {
                let result = self.core.send(target, payload).await;
                let _ = reply.send(result);
            }
            Command::Broadcast { payload, reply } => {
                let outcomes = self.core.broadcast(payload).await;
                let _ = reply.send(outcomes);
            }
            Command::Disconnect { target, reply } => {
                let result = self.core.disconnect(target);
                let _ = reply.send(result);
            }
        }
    }

    fn refresh_status(&self) {
        let mut status = self.status.write();
        status.local_peer_id = self.core.local_peer_id().cloned();
        status.active = self.core.has_active_peer();
    }
}
