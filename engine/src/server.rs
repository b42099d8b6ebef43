use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admin::{AdminRequest, AdminSender};
use crate::config::ChannelPlan;
use crate::distributor::Distributor;
use crate::error::AdminError;
use crate::ingest::{ChannelStatus, IngestStats};
use crate::protocol::StreamMessage;

// ChannelMix engine HTTP surface
//
//   GET  /ws                      session channel: one text frame per payload
//   GET  /health                  liveness for the reverse proxy
//   GET  /api/v1/ping             version + feature probe
//   GET  /api/v1/status           per-channel ingest counters, session count
//   POST /admin/control-streams   relay start/stop to the stream generator
//
// UI pages, auth and saved mixes live in the web tier in front of us.

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub plan: ChannelPlan,
    pub distributor: Distributor,
    pub stats: IngestStats,
    pub admin: AdminSender,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    sessions: usize,
    channels: Vec<ChannelStatus>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/ws", get(ws_handler))
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/status", get(status))
        .route("/admin/control-streams", post(api_control_streams))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "ChannelMix engine is running. Sessions connect to /ws; try /api/v1/status"
}

async fn ping(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "version": state.version,
        "features": ["ws", "status", "admin"]
    }))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let channels = state
        .stats
        .iter()
        .enumerate()
        .map(|(ch, st)| st.status(ch, state.plan.endpoint(ch)))
        .collect();

    Json(StatusResponse {
        version: state.version.clone(),
        // The engine keeps no receiver of its own, so this is exactly the
        // number of connected sessions.
        sessions: state.distributor.session_count(),
        channels,
    })
}

async fn api_control_streams(
    State(state): State<AppState>,
    payload: Result<Json<AdminRequest>, JsonRejection>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => {
            warn!("admin: unreadable request: {rejection}");
            return (StatusCode::BAD_REQUEST, Json(json!({ "message": rejection.body_text() })));
        }
    };

    let cmd = match req.validate() {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!("admin: rejected request: {e}");
            return (StatusCode::BAD_REQUEST, Json(json!({ "message": e.to_string() })));
        }
    };

    match state.admin.send(&cmd).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "message": format!("Command '{}' sent successfully.", cmd.action.as_str()) })),
        ),
        Err(e @ AdminError::Send { .. }) => {
            warn!("admin: {e}");
            (StatusCode::BAD_GATEWAY, Json(json!({ "message": e.to_string() })))
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": e.to_string() }))),
    }
}

// --- Sessions ------------------------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state.distributor))
}

/// One connected client. Subscribes before anything else so no payload
/// published after the upgrade is missed.
async fn handle_session(socket: WebSocket, distributor: Distributor) {
    let id = Uuid::new_v4();
    let mut rx = distributor.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("session {id} connected ({} total)", distributor.session_count());

    // Client -> engine: we only care about close/errors.
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!("session {id}: receive error: {e}");
                    break;
                }
                _ => {}
            }
        }
    });

    // Engine -> client: every payload, as it comes.
    let mut send_task = tokio::spawn(async move {
        loop {
            let p = match rx.recv().await {
                Ok(p) => p,
                Err(RecvError::Lagged(n)) => {
                    // Slow client; it loses audio, nobody else waits for it.
                    warn!("session {id}: lagged, dropped {n} payloads");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let msg = StreamMessage::for_payload(p.channel, &p.payload);
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    }

    info!("session {id} disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::new_stats;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(admin_target: std::net::SocketAddr) -> AppState {
        let plan = ChannelPlan::default();
        AppState {
            version: "test".into(),
            stats: new_stats(plan.channels),
            plan,
            distributor: Distributor::new(16),
            admin: AdminSender::new(admin_target),
        }
    }

    async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn admin_rejects_empty_start_without_sending() {
        let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let app = build_router(state(upstream.local_addr().unwrap()));

        let (code, body) =
            post_json(app, "/admin/control-streams", json!({"action": "start", "channels": []})).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "No channels selected.");

        let mut buf = [0u8; 64];
        let nothing = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            upstream.recv_from(&mut buf),
        )
        .await;
        assert!(nothing.is_err(), "no datagram may be sent");
    }

    #[tokio::test]
    async fn admin_malformed_body_gets_json_message() {
        let app = build_router(state("127.0.0.1:9".parse().unwrap()));
        let resp = app
            .oneshot(
                Request::post("/admin/control-streams")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(v["message"].as_str().is_some_and(|m| !m.is_empty()));
    }

    #[tokio::test]
    async fn admin_relays_valid_command() {
        let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let app = build_router(state(upstream.local_addr().unwrap()));

        let (code, body) = post_json(
            app,
            "/admin/control-streams",
            json!({"action": "start", "channels": [1, 3, 5]}),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["message"], "Command 'start' sent successfully.");

        let mut buf = [0u8; 256];
        let (n, _) = upstream.recv_from(&mut buf).await.unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(sent, json!({"command": "start", "channels": [1, 3, 5], "duration": 15}));
    }

    #[tokio::test]
    async fn status_lists_every_channel() {
        let app = build_router(state("127.0.0.1:9".parse().unwrap()));
        let resp = app
            .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["sessions"], 0);
        assert_eq!(v["channels"].as_array().unwrap().len(), 10);
        assert_eq!(v["channels"][0]["group"], "239.0.0.1:5001");
        assert_eq!(v["channels"][0]["listening"], false);
    }
}
