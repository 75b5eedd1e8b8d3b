//! Peer adapter
//!
//! Thin wrapper over the webrtc-rs engine. This is the only module that
//! touches engine types; everything above it speaks in terms of
//! [`Peer`], [`TrackHandle`] and [`PeerState`].

use crate::config::{IceServerConfig, WebRtcConfig};
use crate::webrtc::sdp::MediaKind;
use crate::webrtc::WebRtcError;
use log::{info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

pub use webrtc::rtp::packet::Packet as RtpPacket;

/// Connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        }
    }
}

/// Sender half of a local egress track.
///
/// Packets pushed here are written to the underlying RTP track by a
/// dedicated writer task, so the send path never awaits the engine.
#[derive(Clone)]
pub struct TrackHandle {
    pub(crate) kind: MediaKind,
    pub(crate) tx: mpsc::UnboundedSender<Packet>,
}

impl TrackHandle {
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Queue one packet for transmission. Errors (writer gone) are
    /// intentionally dropped; a closing peer tears the channel down.
    pub fn send(&self, packet: Packet) {
        let _ = self.tx.send(packet);
    }
}

/// Split a `listen` config value into address and network.
pub(crate) fn parse_listen(listen: &str) -> (String, String) {
    match listen.split_once('/') {
        Some((addr, net)) => (addr.to_string(), net.to_string()),
        None => (listen.to_string(), "udp".to_string()),
    }
}

fn listen_port(address: &str) -> Option<u16> {
    address.rsplit(':').next()?.parse().ok()
}

/// Factory for peer connections.
///
/// Holds up to two engine instances: a server API pinned to the
/// configured listen port (passive side, answers offers) and a client
/// API with default settings (active side, initiates). With no listen
/// address the same instance serves both roles.
pub struct PeerFactory {
    server_api: Arc<API>,
    client_api: Arc<API>,
    default_ice: Vec<RTCIceServer>,
}

impl PeerFactory {
    pub fn new(cfg: &WebRtcConfig) -> Result<Self, WebRtcError> {
        let (address, network) = parse_listen(&cfg.listen);

        let mut server_settings = SettingEngine::default();
        if !address.is_empty() {
            if network == "tcp" {
                // webrtc-rs has no ICE-TCP listener; the port is still
                // honoured, over UDP
                warn!("listen network tcp is not supported, serving {} over udp", address);
            }
            let port = listen_port(&address)
                .ok_or_else(|| WebRtcError::EngineInternal(format!("bad listen address: {}", cfg.listen)))?;
            let udp = EphemeralUDP::new(port, port)
                .map_err(|e| WebRtcError::EngineInternal(format!("listen port: {}", e)))?;
            server_settings.set_udp_network(UDPNetwork::Ephemeral(udp));
            info!("webrtc listen on {}", cfg.listen);
        } else if let Some([min, max]) = cfg.filters.udp_ports {
            let udp = EphemeralUDP::new(min, max)
                .map_err(|e| WebRtcError::EngineInternal(format!("udp_ports: {}", e)))?;
            server_settings.set_udp_network(UDPNetwork::Ephemeral(udp));
        }

        let server_api = Arc::new(build_api(server_settings)?);
        let client_api = if address.is_empty() {
            Arc::clone(&server_api)
        } else {
            Arc::new(build_api(SettingEngine::default())?)
        };

        Ok(Self {
            server_api,
            client_api,
            default_ice: cfg.ice_servers.iter().map(ice_server).collect(),
        })
    }

    /// Create a peer. `active` selects the initiating (client) engine;
    /// passive peers answer remote offers. Caller-provided ICE servers
    /// replace the configured defaults for this peer only.
    pub async fn create(
        &self,
        active: bool,
        ice_servers: Option<&[IceServerConfig]>,
    ) -> Result<Peer, WebRtcError> {
        let ice_servers = match ice_servers {
            Some(servers) => servers.iter().map(ice_server).collect(),
            None => self.default_ice.clone(),
        };
        let config = RTCConfiguration { ice_servers, ..Default::default() };

        let api = if active { &self.client_api } else { &self.server_api };
        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| WebRtcError::EngineInternal(format!("create peer: {}", e)))?;

        Ok(Peer { pc: Arc::new(pc) })
    }
}

fn build_api(settings: SettingEngine) -> Result<API, WebRtcError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| WebRtcError::EngineInternal(format!("register codecs: {}", e)))?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| WebRtcError::EngineInternal(format!("register interceptors: {}", e)))?;

    Ok(APIBuilder::new()
        .with_setting_engine(settings)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn ice_server(cfg: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: cfg.urls.clone(),
        username: cfg.username.clone().unwrap_or_default(),
        credential: cfg.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// One peer connection behind the adapter surface
pub struct Peer {
    pc: Arc<RTCPeerConnection>,
}

impl Peer {
    pub async fn set_remote_offer(&self, sdp: &str) -> Result<(), WebRtcError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| WebRtcError::OfferInvalid(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| WebRtcError::OfferInvalid(e.to_string()))
    }

    /// Produce the local answer without waiting for ICE gathering;
    /// candidates trickle through the `on_ice_candidate` callback.
    pub async fn create_local_answer(&self) -> Result<String, WebRtcError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| WebRtcError::EngineInternal(format!("create answer: {}", e)))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| WebRtcError::EngineInternal(format!("set local description: {}", e)))?;
        Ok(answer.sdp)
    }

    /// Produce an answer containing the full candidate set: blocks until
    /// the engine reports ICE gathering complete.
    pub async fn create_complete_answer(&self) -> Result<String, WebRtcError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| WebRtcError::EngineInternal(format!("create answer: {}", e)))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| WebRtcError::EngineInternal(format!("set local description: {}", e)))?;
        let _ = gather_complete.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| WebRtcError::EngineInternal("no local description".to_string()))?;
        Ok(local.sdp)
    }

    pub fn on_connection_state(&self, callback: impl Fn(PeerState) + Send + Sync + 'static) {
        self.pc.on_peer_connection_state_change(Box::new(move |state| {
            callback(PeerState::from(state));
            Box::pin(async {})
        }));
    }

    /// Local ICE candidates in attribute value form (`candidate:...`);
    /// `None` marks end of gathering.
    pub fn on_ice_candidate(&self, callback: impl Fn(Option<String>) + Send + Sync + 'static) {
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let value =
                candidate.map(|c| c.to_json().map(|j| j.candidate).unwrap_or_default());
            callback(value);
            Box::pin(async {})
        }));
    }

    /// Create a local egress track and its writer task. Must run after
    /// the remote offer is applied so the engine pairs the track with an
    /// offered transceiver.
    pub async fn new_local_track(&self, kind: MediaKind) -> Result<TrackHandle, WebRtcError> {
        let capability = match kind {
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                rtcp_feedback: vec![],
            },
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };

        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4()),
            "streamgate".to_string(),
        ));
        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| WebRtcError::EngineInternal(format!("add track: {}", e)))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = track.write_rtp(&packet).await {
                    warn!("rtp write failed: {}", e);
                }
            }
        });

        Ok(TrackHandle { kind, tx })
    }

    /// Forward every remote track into `tx`, recording video SSRCs for
    /// later keyframe requests.
    pub fn forward_remote_tracks(
        &self,
        tx: mpsc::UnboundedSender<(MediaKind, Packet)>,
        video_ssrcs: Arc<Mutex<Vec<u32>>>,
    ) {
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let video_ssrcs = Arc::clone(&video_ssrcs);
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => {
                        video_ssrcs.lock().unwrap().push(track.ssrc());
                        MediaKind::Video
                    }
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => return,
                };
                tokio::spawn(async move {
                    loop {
                        match track.read_rtp().await {
                            Ok((packet, _)) => {
                                if tx.send((kind, packet)).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                });
            })
        }));
    }

    /// Ask the remote sender of `media_ssrc` for a keyframe.
    pub async fn write_pli(&self, media_ssrc: u32) -> Result<(), WebRtcError> {
        let pli = PictureLossIndication { sender_ssrc: 0, media_ssrc };
        self.pc
            .write_rtcp(&[Box::new(pli)])
            .await
            .map(|_| ())
            .map_err(|e| WebRtcError::EngineInternal(format!("pli: {}", e)))
    }

    pub async fn add_remote_candidate(&self, candidate: &str) -> Result<(), WebRtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| WebRtcError::EngineInternal(format!("add candidate: {}", e)))
    }

    pub async fn close(&self) -> Result<(), WebRtcError> {
        self.pc
            .close()
            .await
            .map_err(|e| WebRtcError::EngineInternal(format!("close: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;

    #[test]
    fn parse_listen_splits_network_suffix() {
        assert_eq!(parse_listen(":8555"), (":8555".to_string(), "udp".to_string()));
        assert_eq!(parse_listen(":8555/tcp"), (":8555".to_string(), "tcp".to_string()));
        assert_eq!(parse_listen(""), (String::new(), "udp".to_string()));
    }

    #[test]
    fn factory_builds_with_defaults() {
        let factory = PeerFactory::new(&WebRtcConfig::default()).unwrap();
        assert_eq!(factory.default_ice.len(), 1);
    }

    #[tokio::test]
    async fn factory_creates_passive_peer() {
        let mut cfg = WebRtcConfig::default();
        cfg.listen = String::new();
        let factory = PeerFactory::new(&cfg).unwrap();
        let peer = factory.create(false, None).await.unwrap();
        peer.close().await.unwrap();
    }
}
