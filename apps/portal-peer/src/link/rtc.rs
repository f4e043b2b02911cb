//! [`Connector`] backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace};
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{
    Channel, ChannelId, Connector, Link, LinkContext, LinkError, LinkEventKind, LinkRequest,
    LinkState, Role,
};
use crate::peer::ChannelReadiness;
use crate::protocol::{IceCandidate, Payload, SdpKind, SessionDescription};

pub struct RtcConnector {
    api: API,
}

impl Default for RtcConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RtcConnector {
    pub fn new() -> Self {
        Self {
            api: APIBuilder::new().build(),
        }
    }
}

#[async_trait]
impl Connector for RtcConnector {
    async fn open(&self, request: LinkRequest) -> Result<Arc<dyn Link>, LinkError> {
        let LinkRequest {
            remote,
            role,
            ice_servers,
            channel_label,
            context,
        } = request;

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .into_iter()
                .map(|url| RTCIceServer {
                    urls: vec![url],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(LinkError::primitive)?,
        );
        install_connection_handlers(&pc, &context);

        // The SCTP transport is only negotiated when a channel exists at offer
        // time, so the initiator creates its channel up front and hands it over
        // once the connection reports connected.
        let pending = match role {
            Role::Initiator => {
                let dc = pc
                    .create_data_channel(
                        &channel_label,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await
                    .map_err(LinkError::primitive)?;
                Some(RtcChannel::attach(dc, &context))
            }
            Role::Responder => None,
        };

        debug!(
            target = "portal",
            peer = %remote,
            generation = context.generation(),
            role = ?role,
            "created rtc peer connection"
        );
        Ok(Arc::new(RtcLink {
            pc,
            context,
            pending_channel: Mutex::new(pending),
        }))
    }
}

fn install_connection_handlers(pc: &Arc<RTCPeerConnection>, context: &LinkContext) {
    let ctx = context.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let ctx = ctx.clone();
        Box::pin(async move {
            let candidate = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => Some(from_rtc_candidate(init)),
                    Err(err) => {
                        debug!(target = "portal", peer = %ctx.peer(), error = %err, "unserializable local candidate");
                        return;
                    }
                },
                None => None,
            };
            ctx.emit(LinkEventKind::LocalCandidate(candidate));
        })
    }));

    let ctx = context.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let ctx = ctx.clone();
        Box::pin(async move {
            if let Some(state) = map_connection_state(state) {
                ctx.emit(LinkEventKind::StateChanged(state));
            }
        })
    }));

    let ctx = context.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let ctx = ctx.clone();
        Box::pin(async move {
            ctx.emit(LinkEventKind::NegotiationNeeded);
        })
    }));

    let ctx = context.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let ctx = ctx.clone();
        Box::pin(async move {
            info!(target = "portal", peer = %ctx.peer(), label = dc.label(), "received data channel");
            let channel = RtcChannel::attach(dc, &ctx);
            ctx.emit(LinkEventKind::InboundChannel(channel));
        })
    }));

    let peer = context.peer().clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        trace!(target = "portal", peer = %peer, state = %state, "signaling state");
        Box::pin(async {})
    }));

    let peer = context.peer().clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        trace!(target = "portal", peer = %peer, state = %state, "ice gathering state");
        Box::pin(async {})
    }));
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::Unspecified => None,
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, LinkError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            return Err(LinkError::UnsupportedDescription("rollback".into()));
        }
    };
    parsed.map_err(LinkError::primitive)
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, LinkError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(LinkError::UnsupportedDescription("unspecified".into()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    context: LinkContext,
    pending_channel: Mutex<Option<Arc<RtcChannel>>>,
}

impl RtcLink {
    async fn applied_local_description(&self) -> Result<SessionDescription, LinkError> {
        let description = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| LinkError::Primitive("local description missing after apply".into()))?;
        from_rtc_description(description)
    }
}

#[async_trait]
impl Link for RtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let offer = self.pc.create_offer(None).await.map_err(LinkError::primitive)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(LinkError::primitive)?;
        self.applied_local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        let answer = self.pc.create_answer(None).await.map_err(LinkError::primitive)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(LinkError::primitive)?;
        self.applied_local_description().await
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<(), LinkError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(LinkError::primitive)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(LinkError::primitive)
    }

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn Channel>, LinkError> {
        let pending = self.pending_channel.lock().take();
        if let Some(channel) = pending {
            if channel.label == label {
                return Ok(channel);
            }
            debug!(
                target = "portal",
                peer = %self.context.peer(),
                expected = label,
                found = %channel.label,
                "pre-negotiated channel label differs; opening a new channel"
            );
        }
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(LinkError::primitive)?;
        Ok(RtcChannel::attach(dc, &self.context))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target = "portal", peer = %self.context.peer(), error = %err, "peer connection close failed");
        }
    }
}

struct RtcChannel {
    id: ChannelId,
    label: String,
    inner: Arc<RTCDataChannel>,
}

impl RtcChannel {
    fn attach(dc: Arc<RTCDataChannel>, context: &LinkContext) -> Arc<Self> {
        let id = ChannelId::next();
        let label = dc.label().to_string();

        let ctx = context.clone();
        dc.on_open(Box::new(move || {
            ctx.emit(LinkEventKind::ChannelOpened(id));
            Box::pin(async {})
        }));

        let ctx = context.clone();
        dc.on_close(Box::new(move || {
            ctx.emit(LinkEventKind::ChannelClosed(id));
            Box::pin(async {})
        }));

        let ctx = context.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let payload = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => Payload::Text(text),
                    Err(_) => Payload::Binary(msg.data),
                }
            } else {
                Payload::Binary(msg.data)
            };
            ctx.emit(LinkEventKind::ChannelMessage(id, payload));
            Box::pin(async {})
        }));

        Arc::new(Self {
            id,
            label,
            inner: dc,
        })
    }
}

#[async_trait]
impl Channel for RtcChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn readiness(&self) -> ChannelReadiness {
        match self.inner.ready_state() {
            RTCDataChannelState::Connecting => ChannelReadiness::Connecting,
            RTCDataChannelState::Open => ChannelReadiness::Open,
            RTCDataChannelState::Closing => ChannelReadiness::Closing,
            RTCDataChannelState::Closed => ChannelReadiness::Closed,
            RTCDataChannelState::Unspecified => ChannelReadiness::Unknown,
        }
    }

    async fn send(&self, payload: &Payload) -> Result<(), LinkError> {
        let result = match payload {
            Payload::Text(text) => self.inner.send_text(text.clone()).await,
            Payload::Binary(bytes) => self.inner.send(&Bytes::clone(bytes)).await,
        };
        result.map(|_| ()).map_err(LinkError::primitive)
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close().await {
            debug!(target = "portal", label = %self.label, error = %err, "data channel close failed");
        }
    }
}
