//! HTTP server
//!
//! Routes the signaling endpoints (synchronous SDP exchange and the
//! WebSocket transport upgrade), the pause/resume control plane and a
//! health probe. Every `/api` response carries permissive CORS headers
//! and OPTIONS preflights are answered directly.

use crate::transport::ws_server;
use crate::web::shared::AppState;
use crate::webrtc::control;
use crate::webrtc::signaling::{self, client_ip, user_agent};
use crate::webrtc::WebRtcError;
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/webrtc", post(sync_webrtc_handler))
        .route("/api/webrtc/sessions", get(control::list_sessions))
        .route("/api/webrtc/session/pause", post(control::session_pause))
        .route("/api/webrtc/session/resume", post(control::session_resume))
        .route("/api/webrtc/pause", post(control::viewer_pause))
        .route("/api/webrtc/resume", post(control::viewer_resume))
        .route("/api/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

/// Bind and serve until a shutdown signal arrives.
pub async fn run(state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("http api listening on http://{}", listener.local_addr()?);

    let app = router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

async fn cors_middleware(req: Request<Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors(response.headers_mut());
        return response;
    }
    let mut response = next.run(req).await;
    apply_cors(response.headers_mut());
    response
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type"),
    );
}

/// `POST /api/webrtc`: synchronous exchange. Offer in, complete answer
/// out, no trickle on this channel.
async fn sync_webrtc_handler(
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    body: String,
) -> Response {
    let agent = user_agent(&headers);
    let ip = client_ip(&headers, Some(remote));
    match signaling::sync_exchange(&state, &query, agent, ip, &body).await {
        Ok((_conn, answer)) => {
            ([(header::CONTENT_TYPE, "application/sdp")], answer).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `GET /api/ws`: upgrade to the message transport.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let agent = user_agent(&headers);
    let ip = client_ip(&headers, Some(remote));
    ws.on_upgrade(move |socket| ws_server::handle_socket(socket, state, query, agent, ip))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.uptime().as_secs_f64(),
        "sessions": state.registry.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

fn error_response(error: WebRtcError) -> Response {
    match error {
        WebRtcError::StreamNotFound => {
            (StatusCode::NOT_FOUND, "Stream not found").into_response()
        }
        WebRtcError::SessionNotFound(_) => {
            (StatusCode::NOT_FOUND, "Session not found").into_response()
        }
        WebRtcError::OfferInvalid(_) | WebRtcError::BadRequest(_) => {
            (StatusCode::BAD_REQUEST, error.to_string()).into_response()
        }
        WebRtcError::AddConsumerFailed(_) | WebRtcError::EngineInternal(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::webrtc::connection::{Connection, ConnectionParams, Mode, Protocol};
    use axum::body::to_bytes;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.webrtc.listen = String::new();
        config.streams.insert("cam1".to_string(), "test://cam1".to_string());
        Arc::new(AppState::new(config).unwrap())
    }

    async fn add_conn(state: &Arc<AppState>, mode: Mode, viewer: &str) -> Arc<Connection> {
        let peer = state.peers.create(false, None).await.unwrap();
        let conn = Connection::new(
            peer,
            ConnectionParams {
                id: state.registry.allocate_id(),
                mode,
                protocol: Protocol::Ws,
                stream_source: "cam1".to_string(),
                viewer_id: viewer.to_string(),
                client_ip: "127.0.0.1".to_string(),
                user_agent: String::new(),
                start_paused: false,
            },
        );
        state.registry.register(&conn).unwrap();
        conn
    }

    async fn call(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, Value, HeaderMap) {
        let response = router(Arc::clone(state)).oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes).to_string()));
        (status, value, headers)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn sessions_list_reports_registered_connection() {
        let state = test_state().await;
        let conn = add_conn(&state, Mode::PassiveConsumer, "").await;

        let (status, body, _) = call(&state, get_req("/api/webrtc/sessions")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        let entry = &body["sessions"][0];
        assert_eq!(entry["session_id"], conn.session_id.as_str());
        assert_eq!(entry["stream_source"], "cam1");
        assert_eq!(entry["mode"], "passive consumer");
        assert_eq!(entry["paused"], false);
    }

    #[tokio::test]
    async fn session_pause_flips_the_flag() {
        let state = test_state().await;
        let conn = add_conn(&state, Mode::PassiveConsumer, "").await;

        let body = format!(r#"{{"session_id":"{}"}}"#, conn.session_id);
        let (status, value, _) = call(&state, post("/api/webrtc/session/pause", &body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["success"], true);
        assert_eq!(value["action"], "pause");
        assert_eq!(value["session_id"], conn.session_id.as_str());
        assert!(conn.is_paused());

        let (_, listing, _) = call(&state, get_req("/api/webrtc/sessions")).await;
        assert_eq!(listing["sessions"][0]["paused"], true);

        let (status, value, _) = call(&state, post("/api/webrtc/session/resume", &body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["action"], "resume");
        assert!(!conn.is_paused());
    }

    #[tokio::test]
    async fn session_pause_missing_id_is_bad_request() {
        let state = test_state().await;
        let (status, _, _) = call(&state, post("/api/webrtc/session/pause", "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = call(&state, post("/api/webrtc/session/pause", "not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn session_pause_unknown_id_is_not_found() {
        let state = test_state().await;
        let body = r#"{"session_id":"deadbeefdeadbeefdeadbeefdeadbeef"}"#;
        let (status, value, _) = call(&state, post("/api/webrtc/session/pause", body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(value.as_str().unwrap(), "Session not found");
    }

    #[tokio::test]
    async fn viewer_pause_fans_out_over_matching_consumers() {
        let state = test_state().await;
        let a1 = add_conn(&state, Mode::PassiveConsumer, "A").await;
        let a2 = add_conn(&state, Mode::PassiveConsumer, "A").await;
        let b = add_conn(&state, Mode::PassiveConsumer, "B").await;
        let producer = add_conn(&state, Mode::PassiveProducer, "A").await;

        let body = r#"{"action":"pause","viewer_id":"A"}"#;
        let (status, value, _) = call(&state, post("/api/webrtc/pause", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["paused_connections"], 2);
        assert_eq!(value["success"], true);
        assert!(a1.is_paused() && a2.is_paused());
        assert!(!b.is_paused());
        assert!(!producer.is_paused());
    }

    #[tokio::test]
    async fn viewer_pause_without_id_affects_all_consumers_only() {
        let state = test_state().await;
        let consumer = add_conn(&state, Mode::PassiveConsumer, "A").await;
        let producer = add_conn(&state, Mode::PassiveProducer, "").await;

        let (status, value, _) = call(&state, post("/api/webrtc/pause", "{}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["paused_connections"], 1);
        assert!(consumer.is_paused());
        assert!(!producer.is_paused());
    }

    #[tokio::test]
    async fn viewer_resume_reports_zero_matches_as_failure() {
        let state = test_state().await;
        let body = r#"{"action":"resume","viewer_id":"ghost"}"#;
        let (status, value, _) = call(&state, post("/api/webrtc/resume", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["success"], false);
        assert_eq!(value["resumed_connections"], 0);
        assert!(value["message"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn closed_session_disappears_and_turns_not_found() {
        let state = test_state().await;
        let conn = add_conn(&state, Mode::PassiveConsumer, "").await;
        let body = format!(r#"{{"session_id":"{}"}}"#, conn.session_id);

        state.registry.unregister(&conn);
        let (_, listing, _) = call(&state, get_req("/api/webrtc/sessions")).await;
        assert_eq!(listing["count"], 0);

        let (status, _, _) = call(&state, post("/api/webrtc/session/pause", &body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn options_preflight_gets_cors_headers() {
        let state = test_state().await;
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/webrtc/session/pause")
            .body(Body::empty())
            .unwrap();
        let (status, _, headers) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "GET, POST, PUT, DELETE, OPTIONS"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "Authorization, Content-Type"
        );
    }

    #[tokio::test]
    async fn health_reports_session_count() {
        let state = test_state().await;
        add_conn(&state, Mode::PassiveConsumer, "").await;
        let (status, value, _) = call(&state, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["sessions"], 1);
    }
}
