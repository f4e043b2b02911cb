//! Duplex connection to the rendezvous service.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::{SIGNALING_SUBPROTOCOL, SignalingEndpoint};
use crate::error::{PeerError, PeerResult};
use crate::protocol::SignalingMessage;

/// Decoded inbound messages, in arrival order.
pub type InboundSignals = mpsc::UnboundedReceiver<SignalingMessage>;

pub trait SignalingTransport: Send + Sync {
    /// Starts connecting. Returns once the attempt is under way; repeated calls
    /// are no-ops.
    fn connect(&self) -> PeerResult<()>;

    /// Serializes and transmits `message`. While disconnected the message is
    /// logged and dropped.
    fn send(&self, message: &SignalingMessage);

    fn is_connected(&self) -> bool;
}

type Outbound = Arc<RwLock<Option<mpsc::UnboundedSender<String>>>>;

pub struct WebSocketSignaling {
    endpoint: SignalingEndpoint,
    inbound: mpsc::UnboundedSender<SignalingMessage>,
    outbound: Outbound,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketSignaling {
    pub fn new(endpoint: SignalingEndpoint) -> (Arc<Self>, InboundSignals) {
        let (inbound, signals) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            endpoint,
            inbound,
            outbound: Arc::new(RwLock::new(None)),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        (transport, signals)
    }
}

impl SignalingTransport for WebSocketSignaling {
    fn connect(&self) -> PeerResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let request = match build_request(&self.endpoint) {
            Ok(request) => request,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let url = self.endpoint.url();
        let inbound = self.inbound.clone();
        let outbound = Arc::clone(&self.outbound);
        let handle = tokio::spawn(run_socket(url, request, inbound, outbound));
        self.tasks.lock().push(handle);
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) {
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                error!(target = "portal", kind = message.kind(), error = %err, "failed to encode signaling message");
                return;
            }
        };
        let guard = self.outbound.read();
        match guard.as_ref() {
            Some(tx) if tx.send(text).is_ok() => {
                trace!(target = "portal", event = "ws_out", kind = message.kind(), "queued signaling message");
            }
            _ => warn!(
                target = "portal",
                kind = message.kind(),
                "signaling transport not connected; message dropped"
            ),
        }
    }

    fn is_connected(&self) -> bool {
        self.outbound.read().is_some()
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

fn build_request(endpoint: &SignalingEndpoint) -> PeerResult<Request> {
    let url = Url::parse(&endpoint.url())
        .map_err(|err| PeerError::Signaling(format!("invalid rendezvous address: {err}")))?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| PeerError::Signaling(format!("invalid websocket request: {err}")))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SIGNALING_SUBPROTOCOL),
    );
    Ok(request)
}

async fn run_socket(
    url: String,
    request: Request,
    inbound: mpsc::UnboundedSender<SignalingMessage>,
    outbound: Outbound,
) {
    let (stream, _) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(err) => {
            error!(target = "portal", url = %url, error = %err, "failed to reach rendezvous service");
            return;
        }
    };
    info!(target = "portal", url = %url, "connected to rendezvous service");

    let (mut sink, mut source) = stream.split();
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<String>();
    *outbound.write() = Some(send_tx);

    let writer = tokio::spawn(async move {
        while let Some(text) = send_rx.recv().await {
            if let Err(err) = sink.send(Message::Text(text)).await {
                warn!(target = "portal", error = %err, "signaling write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                trace!(target = "portal", event = "ws_in", len = text.len());
                dispatch(&text, &inbound);
            }
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => dispatch(&text, &inbound),
                Err(_) => warn!(target = "portal", "dropping non utf-8 signaling frame"),
            },
            Ok(Message::Close(frame)) => {
                debug!(target = "portal", frame = ?frame, "rendezvous service closed the connection");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target = "portal", error = %err, "signaling read failed");
                break;
            }
        }
    }

    outbound.write().take();
    writer.abort();
    info!(target = "portal", url = %url, "disconnected from rendezvous service");
}

fn dispatch(text: &str, inbound: &mpsc::UnboundedSender<SignalingMessage>) {
    match SignalingMessage::decode(text) {
        Ok(message) => {
            if inbound.send(message).is_err() {
                trace!(target = "portal", "inbound signaling receiver dropped");
            }
        }
        Err(err) => warn!(target = "portal", error = %err, "dropping undecodable signaling frame"),
    }
}
