//! WebSocket message transport
//!
//! Envelope codec and dispatch loop for the async signaling channel.
//! Every frame is a JSON envelope `{"type": ..., "value": ...}`. Offer
//! handling is delegated to the signaling front end; the connection it
//! creates stays bound to this socket for remote-candidate delivery.

use crate::config::IceServerConfig;
use crate::web::shared::AppState;
use crate::webrtc::connection::{Connection, Mode};
use crate::webrtc::signaling::{self, AsyncOffer};
use crate::webrtc::WebRtcError;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Wire envelope for the message transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub value: Value,
}

impl WsMessage {
    pub fn new(msg_type: &str, value: Value) -> Self {
        Self { msg_type: msg_type.to_string(), value }
    }
}

/// v2 offer payload carried inside a `webrtc` envelope
#[derive(Debug, Deserialize)]
struct OfferEnvelope {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: Option<String>,
    sdp: String,
    #[serde(default)]
    ice_servers: Option<Vec<IceServerConfig>>,
}

/// Drive one signaling socket until the peer hangs up.
pub async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    query: HashMap<String, String>,
    user_agent: String,
    client_ip: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // writer task: everything outbound funnels through one channel so
    // the exchange body and the candidate forwarder cannot interleave
    // partial frames
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else { continue };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // the connection negotiated on this socket, once an offer lands
    let mut conn: Option<Arc<Connection>> = None;

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let text_str: &str = text.as_ref();
                let msg: WsMessage = match serde_json::from_str(text_str) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("bad transport message: {}", e);
                        continue;
                    }
                };
                match msg.msg_type.as_str() {
                    "webrtc" => {
                        let envelope: OfferEnvelope = match serde_json::from_value(msg.value) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("bad offer envelope: {}", e);
                                let err = WebRtcError::BadRequest(e.to_string());
                                let _ = tx.send(WsMessage::new("error", json!(err.to_string())));
                                continue;
                            }
                        };
                        let offer = AsyncOffer {
                            sdp: envelope.sdp,
                            ice_servers: envelope.ice_servers,
                            v2: true,
                        };
                        match signaling::async_exchange(
                            &state,
                            &query,
                            user_agent.clone(),
                            client_ip.clone(),
                            offer,
                            &tx,
                        )
                        .await
                        {
                            Ok(created) => conn = Some(created),
                            Err(e) => {
                                let _ = tx.send(WsMessage::new("error", json!(e.to_string())));
                            }
                        }
                    }
                    "webrtc/offer" => {
                        let offer = AsyncOffer {
                            sdp: msg.value.as_str().unwrap_or_default().to_string(),
                            ice_servers: None,
                            v2: false,
                        };
                        match signaling::async_exchange(
                            &state,
                            &query,
                            user_agent.clone(),
                            client_ip.clone(),
                            offer,
                            &tx,
                        )
                        .await
                        {
                            Ok(created) => conn = Some(created),
                            Err(e) => {
                                let _ = tx.send(WsMessage::new("error", json!(e.to_string())));
                            }
                        }
                    }
                    "webrtc/candidate" => {
                        if let (Some(conn), Some(candidate)) = (&conn, msg.value.as_str()) {
                            if let Err(e) = conn.add_remote_candidate(candidate).await {
                                warn!("remote candidate rejected: {}", e);
                            }
                        }
                    }
                    "webrtc/pause" => pause_all(&state),
                    "webrtc/resume" => resume_all(&state),
                    other => debug!("unhandled transport message: {}", other),
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("transport error: {}", e);
                break;
            }
        }
    }

    send_task.abort();
}

/// Legacy global pause: every consumer connection in the process,
/// regardless of which transport carried the command.
fn pause_all(state: &AppState) {
    let mut paused = 0;
    for conn in state.registry.snapshot() {
        if conn.mode == Mode::PassiveConsumer {
            conn.pause();
            paused += 1;
        }
    }
    if paused > 0 {
        info!("pause: {} consumer connections", paused);
    } else {
        warn!("pause: no active consumer connections");
    }
}

/// Legacy global resume, mirror of [`pause_all`].
fn resume_all(state: &AppState) {
    let mut resumed = 0;
    for conn in state.registry.snapshot() {
        if conn.mode == Mode::PassiveConsumer {
            conn.resume();
            resumed += 1;
        }
    }
    if resumed > 0 {
        info!("resume: {} consumer connections", resumed);
    } else {
        warn!("resume: no active consumer connections");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let msg = WsMessage::new("webrtc/candidate", json!("candidate:1 1 udp 1 1.2.3.4 5 typ host"));
        let text = serde_json::to_string(&msg).unwrap();
        let back: WsMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.msg_type, "webrtc/candidate");
        assert_eq!(back.value.as_str().unwrap(), msg.value.as_str().unwrap());
    }

    #[test]
    fn envelope_tolerates_missing_value() {
        let back: WsMessage = serde_json::from_str(r#"{"type":"webrtc/pause"}"#).unwrap();
        assert_eq!(back.msg_type, "webrtc/pause");
        assert!(back.value.is_null());
    }

    #[test]
    fn v2_offer_envelope_parses() {
        let value = json!({
            "type": "offer",
            "sdp": "v=0\r\n",
            "ice_servers": [{"urls": ["stun:stun.l.google.com:19302"]}]
        });
        let envelope: OfferEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(envelope.sdp, "v=0\r\n");
        assert_eq!(envelope.ice_servers.unwrap().len(), 1);
    }
}
