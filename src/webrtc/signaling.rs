//! Signaling front end
//!
//! Two entry points share one body: the asynchronous WebSocket transport
//! (trickle ICE, answer first) and the synchronous HTTP exchange (one
//! round trip, complete answer). Both create a [`Connection`], attach it
//! to a stream, and register it before the answer leaves the process, so
//! a client holding the session id can immediately address it.

use crate::config::IceServerConfig;
use crate::streams::Stream;
use crate::transport::ws_server::WsMessage;
use crate::web::shared::AppState;
use crate::webrtc::candidates::{candidate_lines, filter_candidate};
use crate::webrtc::connection::{Connection, ConnectionParams, Mode, Protocol};
use crate::webrtc::peer::PeerState;
use crate::webrtc::{sdp, WebRtcError};
use axum::http::{header, HeaderMap};
use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Resolve the client address: proxy headers first, then the socket.
///
/// Priority: first `X-Forwarded-For` entry, `X-Real-IP`, the `for=`
/// parameter of RFC 7239 `Forwarded` (quotes and IPv6 brackets
/// stripped), and finally the remote address host.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if !xff.is_empty() {
            return xff.split(',').next().unwrap_or(xff).trim().to_string();
        }
    }

    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !xri.is_empty() {
            return xri.trim().to_string();
        }
    }

    if let Some(forwarded) = headers.get("forwarded").and_then(|v| v.to_str().ok()) {
        if let Some(idx) = forwarded.find("for=") {
            let mut part = &forwarded[idx + 4..];
            if let Some(end) = part.find(';') {
                part = &part[..end];
            }
            let part = part.trim().trim_matches('"');
            if let Some(stripped) = part.strip_prefix('[') {
                if let Some(end) = stripped.find(']') {
                    return stripped[..end].to_string();
                }
            }
            return part.to_string();
        }
    }

    remote.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

/// Offer carried by the async transport
pub struct AsyncOffer {
    pub sdp: String,
    pub ice_servers: Option<Vec<IceServerConfig>>,
    /// v2 envelope (`webrtc` message) vs v1 raw-SDP (`webrtc/offer`)
    pub v2: bool,
}

/// Handle one offer arriving over the WebSocket transport.
///
/// Performs the full exchange: peer creation, stream attachment, answer
/// emission and registration. Local ICE candidates trickle out on
/// `outbound` once the answer has been written (the latch keeps
/// candidate messages from overtaking it).
pub async fn async_exchange(
    state: &Arc<AppState>,
    query: &HashMap<String, String>,
    user_agent: String,
    client_ip: String,
    offer: AsyncOffer,
    outbound: &mpsc::UnboundedSender<WsMessage>,
) -> Result<Arc<Connection>, WebRtcError> {
    let (stream, mode) = if let Some(name) = query.get("src") {
        debug!("new consumer for {}", name);
        (state.streams.get(name).ok_or(WebRtcError::StreamNotFound)?, Mode::PassiveConsumer)
    } else if let Some(name) = query.get("dst") {
        debug!("new producer for {}", name);
        (state.streams.get(name).ok_or(WebRtcError::StreamNotFound)?, Mode::PassiveProducer)
    } else {
        return Err(WebRtcError::StreamNotFound);
    };

    let peer = state
        .peers
        .create(false, offer.ice_servers.as_deref())
        .await
        .map_err(|e| {
            error!("peer creation failed: {}", e);
            e
        })?;

    let start_paused = query.get("paused").map(|v| v == "true").unwrap_or(false);
    let conn = Connection::new(
        peer,
        ConnectionParams {
            id: state.registry.allocate_id(),
            mode,
            protocol: Protocol::Ws,
            stream_source: stream.name.clone(),
            viewer_id: query.get("viewer_id").cloned().unwrap_or_default(),
            client_ip,
            user_agent,
            start_paused,
        },
    );
    if start_paused {
        info!("session {} starting paused", conn.session_id);
    }

    install_close_handler(&conn, state, &stream);

    // answer-before-candidates: gathered candidates queue on a channel
    // and a single forwarder drains it once the latch opens, preserving
    // discovery order
    let (latch_tx, latch_rx) = watch::channel(false);
    let (cand_tx, mut cand_rx) = mpsc::unbounded_channel::<String>();
    conn.on_local_candidate(move |candidate| {
        if let Some(candidate) = candidate {
            let _ = cand_tx.send(candidate);
        }
    });
    {
        let outbound = outbound.clone();
        let filters = state.config.webrtc.filters.clone();
        let mut latch = latch_rx;
        tokio::spawn(async move {
            if latch.wait_for(|sent| *sent).await.is_err() {
                return;
            }
            while let Some(candidate) = cand_rx.recv().await {
                if !filter_candidate(&filters, &candidate) {
                    continue;
                }
                debug!("local candidate: {}", candidate);
                if outbound.send(WsMessage::new("webrtc/candidate", json!(candidate))).is_err() {
                    break;
                }
            }
        });
    }

    conn.set_offer(&offer.sdp).await.map_err(|e| {
        warn!("offer rejected: {}", e);
        e
    })?;

    match mode {
        Mode::PassiveConsumer => {
            if let Err(e) = stream.add_consumer(Arc::clone(&conn)).await {
                debug!("add consumer: {}", e);
                let _ = conn.close().await;
                return Err(e);
            }
        }
        Mode::PassiveProducer => stream.add_producer(Arc::clone(&conn)),
    }

    let answer = match conn.get_answer().await {
        Ok(answer) => answer,
        Err(e) => {
            error!("answer failed: {}", e);
            let _ = conn.close().await;
            return Err(e);
        }
    };

    // visible in the registry before the client can see the session id
    if let Err(e) = state.registry.register(&conn) {
        let _ = conn.close().await;
        return Err(e);
    }
    info!(
        "conn {} tracked: {} over {}, session {}, viewer {:?}, ip {}",
        conn.id,
        conn.mode,
        conn.protocol.as_str(),
        conn.session_id,
        conn.viewer_id,
        conn.client_ip
    );
    debug!("conn {} user agent: {}", conn.id, conn.user_agent);

    if offer.v2 {
        let _ = outbound.send(WsMessage::new(
            "webrtc",
            json!({"type": "answer", "sdp": answer, "session_id": conn.session_id}),
        ));
    } else {
        let _ = outbound.send(WsMessage::new("webrtc/answer", json!(answer)));
        let _ = outbound.send(WsMessage::new("webrtc/session", json!(conn.session_id)));
    }
    let _ = latch_tx.send(true);

    // advertise manually configured candidates over the same channel
    let filters = &state.config.webrtc.filters;
    for line in candidate_lines(&state.config.webrtc.candidates) {
        if filter_candidate(filters, &line) {
            let _ = outbound.send(WsMessage::new("webrtc/candidate", json!(line)));
        }
    }

    Ok(conn)
}

/// Handle one offer arriving over synchronous HTTP. No trickle: the
/// answer carries the complete, filtered candidate set. The role is
/// inferred from the offered media directions.
pub async fn sync_exchange(
    state: &Arc<AppState>,
    query: &HashMap<String, String>,
    user_agent: String,
    client_ip: String,
    offer: &str,
) -> Result<(Arc<Connection>, String), WebRtcError> {
    let name = query.get("src").ok_or(WebRtcError::StreamNotFound)?;
    let stream = state.streams.get(name).ok_or(WebRtcError::StreamNotFound)?;

    let medias = sdp::parse_medias(offer);
    let mode = if sdp::is_consumer(&medias) {
        Mode::PassiveConsumer
    } else {
        Mode::PassiveProducer
    };

    let peer = state.peers.create(false, None).await.map_err(|e| {
        error!("peer creation failed: {}", e);
        e
    })?;

    let conn = Connection::new(
        peer,
        ConnectionParams {
            id: state.registry.allocate_id(),
            mode,
            protocol: Protocol::Http,
            stream_source: stream.name.clone(),
            viewer_id: query.get("viewer_id").cloned().unwrap_or_default(),
            client_ip,
            user_agent,
            start_paused: query.get("paused").map(|v| v == "true").unwrap_or(false),
        },
    );

    install_close_handler(&conn, state, &stream);

    conn.set_offer(offer).await.map_err(|e| {
        warn!("offer rejected: {}", e);
        e
    })?;

    match mode {
        Mode::PassiveConsumer => {
            if let Err(e) = stream.add_consumer(Arc::clone(&conn)).await {
                warn!("add consumer: {}", e);
                let _ = conn.close().await;
                return Err(e);
            }
        }
        Mode::PassiveProducer => stream.add_producer(Arc::clone(&conn)),
    }

    let answer = match conn
        .get_complete_answer(
            &candidate_lines(&state.config.webrtc.candidates),
            &state.config.webrtc.filters,
        )
        .await
    {
        Ok(answer) => answer,
        Err(e) => {
            error!("answer failed: {}", e);
            let _ = conn.close().await;
            return Err(e);
        }
    };

    if let Err(e) = state.registry.register(&conn) {
        let _ = conn.close().await;
        return Err(e);
    }
    info!(
        "conn {} tracked: {} over {}, session {}, ip {}",
        conn.id,
        conn.mode,
        conn.protocol.as_str(),
        conn.session_id,
        conn.client_ip
    );
    debug!("conn {} user agent: {}", conn.id, conn.user_agent);

    Ok((conn, answer))
}

/// Teardown path shared by both entry points: the first CLOSED report
/// removes the connection from the registry and from its stream.
fn install_close_handler(conn: &Arc<Connection>, state: &Arc<AppState>, stream: &Arc<Stream>) {
    let weak = Arc::downgrade(conn);
    let state = Arc::clone(state);
    let stream = Arc::clone(stream);
    conn.on_state_change(move |peer_state| {
        if peer_state != PeerState::Closed {
            return;
        }
        if let Some(conn) = weak.upgrade() {
            state.registry.unregister(&conn);
            match conn.mode {
                Mode::PassiveConsumer => stream.remove_consumer(conn.id),
                Mode::PassiveProducer => stream.remove_producer(conn.id),
            }
            info!("conn {} closed, session {} released", conn.id, conn.session_id);
        }
    });
}

/// Read the User-Agent header, empty when absent.
pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn remote() -> Option<SocketAddr> {
        Some("203.0.113.9:41641".parse().unwrap())
    }

    #[test]
    fn forwarded_for_takes_first_entry() {
        let h = headers(&[("x-forwarded-for", "10.1.1.1, 10.2.2.2, 10.3.3.3")]);
        assert_eq!(client_ip(&h, remote()), "10.1.1.1");
    }

    #[test]
    fn real_ip_beats_forwarded() {
        let h = headers(&[
            ("x-real-ip", "10.9.9.9"),
            ("forwarded", "for=10.1.1.1"),
        ]);
        assert_eq!(client_ip(&h, remote()), "10.9.9.9");
    }

    #[test]
    fn rfc7239_for_with_quotes_and_brackets() {
        let h = headers(&[("forwarded", "for=\"[::1]:1234\"")]);
        assert_eq!(client_ip(&h, remote()), "::1");
    }

    #[test]
    fn rfc7239_for_cut_at_semicolon() {
        let h = headers(&[("forwarded", "for=10.1.1.1;proto=https")]);
        assert_eq!(client_ip(&h, remote()), "10.1.1.1");
    }

    #[test]
    fn falls_back_to_remote_host() {
        assert_eq!(client_ip(&HeaderMap::new(), remote()), "203.0.113.9");
        assert_eq!(client_ip(&HeaderMap::new(), None), "");
    }
}
