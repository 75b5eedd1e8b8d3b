//! Per-peer connection state
//!
//! A [`Connection`] owns the session's identity, mediates RTP between
//! the stream graph and the peer adapter, and carries the pause gate:
//! the single point in the egress path where a suspended session drops
//! packets. Identity fields are immutable after creation; `paused` is
//! the only mutable public state.

use crate::config::FiltersConfig;
use crate::webrtc::candidates::filter_candidate;
use crate::webrtc::peer::{Peer, PeerState, RtpPacket, TrackHandle};
use crate::webrtc::sdp::{self, Direction, Media, MediaKind};
use crate::webrtc::WebRtcError;
use log::warn;
use rand::RngCore;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Connection role, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Egress: the server sends media to this peer
    PassiveConsumer,
    /// Ingress: this peer sends media to the server
    PassiveProducer,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::PassiveConsumer => "passive consumer",
            Mode::PassiveProducer => "passive producer",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which signaling channel created the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ws,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ws => "ws",
            Protocol::Http => "http",
        }
    }
}

/// 32 lower-case hex characters from 16 cryptographically random bytes
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Immutable identity captured at creation time
pub struct ConnectionParams {
    pub id: u32,
    pub mode: Mode,
    pub protocol: Protocol,
    pub stream_source: String,
    pub viewer_id: String,
    pub client_ip: String,
    pub user_agent: String,
    pub start_paused: bool,
}

type KeyframeHook = Arc<dyn Fn() + Send + Sync>;

pub struct Connection {
    pub id: u32,
    pub session_id: String,
    pub viewer_id: String,
    pub stream_source: String,
    pub client_ip: String,
    pub user_agent: String,
    pub protocol: Protocol,
    pub mode: Mode,
    paused: AtomicBool,
    peer: Peer,
    medias: Mutex<Vec<Media>>,
    senders: Mutex<Vec<TrackHandle>>,
    ingress: Mutex<Option<mpsc::UnboundedReceiver<(MediaKind, RtpPacket)>>>,
    remote_video_ssrcs: Arc<Mutex<Vec<u32>>>,
    keyframe_hook: Mutex<Option<KeyframeHook>>,
}

impl Connection {
    pub fn new(peer: Peer, params: ConnectionParams) -> Arc<Self> {
        let remote_video_ssrcs = Arc::new(Mutex::new(Vec::new()));
        let ingress = if params.mode == Mode::PassiveProducer {
            let (tx, rx) = mpsc::unbounded_channel();
            peer.forward_remote_tracks(tx, Arc::clone(&remote_video_ssrcs));
            Some(rx)
        } else {
            None
        };

        Arc::new(Self {
            id: params.id,
            session_id: new_session_id(),
            viewer_id: params.viewer_id,
            stream_source: params.stream_source,
            client_ip: params.client_ip,
            user_agent: params.user_agent,
            protocol: params.protocol,
            mode: params.mode,
            paused: AtomicBool::new(params.start_paused),
            peer,
            medias: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            ingress: Mutex::new(ingress),
            remote_video_ssrcs,
            keyframe_hook: Mutex::new(None),
        })
    }

    /// Apply the remote offer; derives the media list as a side effect.
    pub async fn set_offer(&self, sdp: &str) -> Result<(), WebRtcError> {
        *self.medias.lock().unwrap() = sdp::parse_medias(sdp);
        self.peer.set_remote_offer(sdp).await
    }

    pub async fn get_answer(&self) -> Result<String, WebRtcError> {
        self.peer.create_local_answer().await
    }

    /// Answer with the full candidate set: gathered candidates filtered,
    /// manual candidate lines folded in.
    pub async fn get_complete_answer(
        &self,
        extra: &[String],
        filters: &FiltersConfig,
    ) -> Result<String, WebRtcError> {
        let answer = self.peer.create_complete_answer().await?;
        let extra: Vec<String> = extra
            .iter()
            .filter(|c| filter_candidate(filters, c))
            .cloned()
            .collect();
        Ok(sdp::fold_candidates(&answer, &extra, |c| filter_candidate(filters, c)))
    }

    pub fn medias(&self) -> Vec<Media> {
        self.medias.lock().unwrap().clone()
    }

    /// Create one egress track per media this side sends. Called by the
    /// stream graph when the connection joins as a consumer.
    pub async fn bind_consumer_tracks(&self) -> Result<usize, WebRtcError> {
        let medias = self.medias();
        let mut bound = 0;
        for media in medias.iter().filter(|m| m.direction == Direction::Sendonly) {
            let handle = self.peer.new_local_track(media.kind).await?;
            self.senders.lock().unwrap().push(handle);
            bound += 1;
        }
        Ok(bound)
    }

    /// The pause gate. Drops the packet with no downstream side effects
    /// while the connection is paused.
    pub fn send_rtp(&self, kind: MediaKind, packet: &RtpPacket) {
        if self.paused.load(Ordering::Relaxed) {
            return;
        }
        let senders = self.senders.lock().unwrap();
        for handle in senders.iter().filter(|h| h.kind() == kind) {
            handle.send(packet.clone());
        }
    }

    /// Suspend egress. Idempotent; tracks stay open.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Clear the pause flag and prime the decoder: one keyframe request
    /// per video track, even when the connection was not paused (a
    /// caller asking to resume may be recovering from packet loss).
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        let hook = self.keyframe_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            let video_tracks = self
                .senders
                .lock()
                .unwrap()
                .iter()
                .filter(|h| h.kind() == MediaKind::Video)
                .count();
            for _ in 0..video_tracks {
                hook();
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Install the keyframe-request callback. Captured by the stream
    /// graph at join time; holds no owned stream reference.
    pub fn set_keyframe_hook(&self, hook: KeyframeHook) {
        *self.keyframe_hook.lock().unwrap() = Some(hook);
    }

    /// Hand the ingress packet flow to the stream graph (producer only;
    /// yields once).
    pub fn take_ingress(&self) -> Option<mpsc::UnboundedReceiver<(MediaKind, RtpPacket)>> {
        self.ingress.lock().unwrap().take()
    }

    /// Ask the remote producer for a keyframe on every video track it
    /// sends us.
    pub async fn request_keyframe(&self) {
        let ssrcs = self.remote_video_ssrcs.lock().unwrap().clone();
        for ssrc in ssrcs {
            if let Err(e) = self.peer.write_pli(ssrc).await {
                warn!("conn {} keyframe request failed: {}", self.id, e);
            }
        }
    }

    pub fn on_state_change(&self, callback: impl Fn(PeerState) + Send + Sync + 'static) {
        self.peer.on_connection_state(callback);
    }

    pub fn on_local_candidate(&self, callback: impl Fn(Option<String>) + Send + Sync + 'static) {
        self.peer.on_ice_candidate(callback);
    }

    pub async fn add_remote_candidate(&self, candidate: &str) -> Result<(), WebRtcError> {
        self.peer.add_remote_candidate(candidate).await
    }

    pub async fn close(&self) -> Result<(), WebRtcError> {
        self.peer.close().await
    }

    #[cfg(test)]
    pub(crate) fn push_sender(&self, handle: TrackHandle) {
        self.senders.lock().unwrap().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;
    use crate::webrtc::peer::PeerFactory;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn params(id: u32, mode: Mode, start_paused: bool) -> ConnectionParams {
        ConnectionParams {
            id,
            mode,
            protocol: Protocol::Ws,
            stream_source: "cam1".to_string(),
            viewer_id: String::new(),
            client_ip: "127.0.0.1".to_string(),
            user_agent: String::new(),
            start_paused,
        }
    }

    async fn new_conn(mode: Mode, start_paused: bool) -> Arc<Connection> {
        let mut cfg = WebRtcConfig::default();
        cfg.listen = String::new();
        let factory = PeerFactory::new(&cfg).unwrap();
        let peer = factory.create(false, None).await.unwrap();
        Connection::new(peer, params(1, mode, start_paused))
    }

    fn test_sender(kind: MediaKind) -> (TrackHandle, mpsc::UnboundedReceiver<RtpPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TrackHandle { kind, tx }, rx)
    }

    #[test]
    fn session_ids_are_32_hex_and_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = new_session_id();
            assert_eq!(id.len(), 32);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            assert!(seen.insert(id));
        }
    }

    fn test_packet() -> RtpPacket {
        RtpPacket {
            payload: bytes::Bytes::from_static(&[0x00, 0x01, 0x02]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pause_gate_drops_packets() {
        let conn = new_conn(Mode::PassiveConsumer, false).await;
        let (handle, mut rx) = test_sender(MediaKind::Video);
        conn.push_sender(handle);

        conn.send_rtp(MediaKind::Video, &test_packet());
        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.payload.as_ref(), &[0x00, 0x01, 0x02]);

        conn.pause();
        conn.send_rtp(MediaKind::Video, &test_packet());
        conn.send_rtp(MediaKind::Video, &test_packet());
        assert!(rx.try_recv().is_err());

        conn.resume();
        conn.send_rtp(MediaKind::Video, &test_packet());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn initial_pause_drops_first_packet() {
        let conn = new_conn(Mode::PassiveConsumer, true).await;
        let (handle, mut rx) = test_sender(MediaKind::Video);
        conn.push_sender(handle);

        assert!(conn.is_paused());
        conn.send_rtp(MediaKind::Video, &RtpPacket::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pause_and_resume_are_idempotent() {
        let conn = new_conn(Mode::PassiveConsumer, false).await;
        conn.pause();
        conn.pause();
        assert!(conn.is_paused());
        conn.resume();
        conn.resume();
        assert!(!conn.is_paused());
        conn.pause();
        conn.resume();
        conn.pause();
        assert!(conn.is_paused());
    }

    #[tokio::test]
    async fn resume_requests_one_keyframe_per_video_track() {
        let conn = new_conn(Mode::PassiveConsumer, false).await;
        let (video1, _rx1) = test_sender(MediaKind::Video);
        let (video2, _rx2) = test_sender(MediaKind::Video);
        let (audio, _rx3) = test_sender(MediaKind::Audio);
        conn.push_sender(video1);
        conn.push_sender(video2);
        conn.push_sender(audio);

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        conn.set_keyframe_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        conn.pause();
        conn.resume();
        assert_eq!(count.load(Ordering::Relaxed), 2);

        // resume while already running still primes the decoder
        conn.resume();
        assert_eq!(count.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn producer_exposes_ingress_once() {
        let conn = new_conn(Mode::PassiveProducer, false).await;
        assert!(conn.take_ingress().is_some());
        assert!(conn.take_ingress().is_none());
    }
}
