//! `webrtc` crate adapter

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use t7_core::{IceServer, ReadyState, TransportError};
use t7_protocol::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{DataStream, PeerConnection, PeerConnector, PeerEvent, PeerState, StreamEvent};

fn rtc_error(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::WebRtc(format!("{}: {}", context, e))
}

/// Creates peer connections backed by the `webrtc` crate
///
/// The crate does not report ICE candidate errors, so connections made
/// here never raise [`PeerEvent::IceCandidateError`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcConnector;

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), TransportError>
    {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| rtc_error("Failed to register codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| rtc_error("Failed to register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| rtc_error("Failed to create peer connection", e))?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        wire_peer(&pc, events_tx);

        tracing::debug!("Created peer connection with {} ICE servers", ice_servers.len());
        Ok((Arc::new(RtcPeer { pc }), events_rx))
    }
}

fn wire_peer(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let state = match s {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
        };
        let _ = tx.send(PeerEvent::StateChanged(state));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let _ = tx.send(PeerEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = events.clone();
        Box::pin(async move {
            tracing::debug!("Peer opened data channel {:?}", dc.label());
            let (_, stream_events) = wire_stream(&dc);
            let stream: Arc<dyn DataStream> = Arc::new(RtcDataStream::new(dc.clone()));
            // surfaced only once open, together with everything it received
            let slot = std::sync::Mutex::new(Some(stream_events));
            dc.on_open(Box::new(move || {
                if let Some(events) = slot.lock().ok().and_then(|mut s| s.take()) {
                    let _ = tx.send(PeerEvent::StreamOpened { stream, events });
                }
                Box::pin(async {})
            }));
        })
    }));
}

fn wire_stream(
    dc: &Arc<RTCDataChannel>,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    mpsc::UnboundedReceiver<StreamEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = message_tx.send(StreamEvent::Message(msg.data));
        Box::pin(async {})
    }));

    let close_tx = tx.clone();
    dc.on_close(Box::new(move || {
        let _ = close_tx.send(StreamEvent::Closed);
        Box::pin(async {})
    }));

    (tx, rx)
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| rtc_error("Failed to create offer", e))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| rtc_error("Failed to set local description", e))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let desc = match desc.kind {
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpKind::Rollback => {
                return Err(TransportError::WebRtc(
                    "Rollback descriptions are not supported".to_string(),
                ))
            }
        }
        .map_err(|e| rtc_error("Invalid remote description", e))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| rtc_error("Failed to set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| rtc_error("Failed to add ICE candidate", e))
    }

    async fn create_data_stream(
        &self,
        label: &str,
    ) -> Result<(Arc<dyn DataStream>, mpsc::UnboundedReceiver<StreamEvent>), TransportError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| rtc_error("Failed to create data channel", e))?;
        let (tx, rx) = wire_stream(&dc);
        dc.on_open(Box::new(move || {
            let _ = tx.send(StreamEvent::Open);
            Box::pin(async {})
        }));

        Ok((Arc::new(RtcDataStream::new(dc)), rx))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Error closing peer connection: {}", e);
        }
    }
}

struct RtcDataStream {
    label: String,
    dc: Arc<RTCDataChannel>,
}

impl RtcDataStream {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self {
            label: dc.label().to_string(),
            dc,
        }
    }
}

#[async_trait]
impl DataStream for RtcDataStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        match self.dc.ready_state() {
            RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
                ReadyState::Connecting
            }
            RTCDataChannelState::Open => ReadyState::Open,
            RTCDataChannelState::Closing => ReadyState::Closing,
            RTCDataChannelState::Closed => ReadyState::Closed,
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| rtc_error("Failed to send on data channel", e))
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            tracing::debug!("Error closing data channel {:?}: {}", self.label, e);
        }
    }
}
