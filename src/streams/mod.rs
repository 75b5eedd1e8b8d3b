//! Stream graph
//!
//! Named streams connect producers (ingress peers) to consumers (egress
//! peers). The graph owns the membership lists; connections never hold a
//! stream pointer, they get callbacks captured at join time. Streams are
//! declared in configuration and live for the process lifetime.

use crate::webrtc::connection::Connection;
use crate::webrtc::peer::RtpPacket;
use crate::webrtc::sdp::MediaKind;
use crate::webrtc::WebRtcError;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Directory of configured streams
pub struct Streams {
    map: HashMap<String, Arc<Stream>>,
}

impl Streams {
    pub fn from_config(entries: &HashMap<String, String>) -> Self {
        let map = entries
            .iter()
            .map(|(name, source)| {
                debug!("stream {} <- {}", name, source);
                (name.clone(), Stream::new(name.clone()))
            })
            .collect();
        Self { map }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Stream>> {
        self.map.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// One named stream and its members
pub struct Stream {
    pub name: String,
    consumers: RwLock<Vec<Arc<Connection>>>,
    producers: RwLock<Vec<Arc<Connection>>>,
}

impl Stream {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            consumers: RwLock::new(Vec::new()),
            producers: RwLock::new(Vec::new()),
        })
    }

    /// Attach an egress connection. Binds its sender tracks and installs
    /// the keyframe callback used by resume priming. Fails when the
    /// offer carries nothing this stream could send to.
    pub async fn add_consumer(self: &Arc<Self>, conn: Arc<Connection>) -> Result<(), WebRtcError> {
        let bound = conn.bind_consumer_tracks().await?;
        if bound == 0 {
            return Err(WebRtcError::AddConsumerFailed(
                "offer has no receiving media".to_string(),
            ));
        }

        let stream = Arc::downgrade(self);
        conn.set_keyframe_hook(Arc::new(move || {
            if let Some(stream) = stream.upgrade() {
                tokio::spawn(async move { stream.request_keyframe().await });
            }
        }));

        self.consumers.write().unwrap().push(conn);
        info!("stream {}: consumer added ({} tracks)", self.name, bound);
        Ok(())
    }

    /// Attach an ingress connection and pump its RTP into the fan-out.
    pub fn add_producer(self: &Arc<Self>, conn: Arc<Connection>) {
        if let Some(mut ingress) = conn.take_ingress() {
            let stream = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((kind, packet)) = ingress.recv().await {
                    stream.publish(kind, &packet);
                }
            });
        }
        self.producers.write().unwrap().push(conn);
        info!("stream {}: producer added", self.name);
    }

    /// Fan one packet out to every consumer. Each connection applies its
    /// own pause gate.
    pub fn publish(&self, kind: MediaKind, packet: &RtpPacket) {
        let consumers = self.consumers.read().unwrap();
        for conn in consumers.iter() {
            conn.send_rtp(kind, packet);
        }
    }

    pub fn remove_consumer(&self, conn_id: u32) {
        self.consumers.write().unwrap().retain(|c| c.id != conn_id);
        debug!("stream {}: consumer {} removed", self.name, conn_id);
    }

    pub fn remove_producer(&self, conn_id: u32) {
        self.producers.write().unwrap().retain(|c| c.id != conn_id);
        debug!("stream {}: producer {} removed", self.name, conn_id);
    }

    /// Ask every producer for a keyframe. Producers may coalesce
    /// concurrent requests; consumers are responsible only for asking.
    pub async fn request_keyframe(&self) {
        let producers: Vec<Arc<Connection>> = self.producers.read().unwrap().clone();
        for producer in producers {
            producer.request_keyframe().await;
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().unwrap().len()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.read().unwrap().len()
    }
}
