//! HTTP signaling: the only way in for new peers.
//!
//! `POST /offer` takes a session description and answers it once candidate
//! gathering is complete; `GET /status` returns a snapshot of component
//! counters. Everything else about a peer happens on its data channel.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::warn;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::bridge::KernelBridge;
use crate::dedup::Deduplicator;
use crate::dochub::DocumentHub;
use crate::peer::PeerHub;
use crate::proxy::HttpProxy;
use crate::router::FrameRouter;
use crate::widgets::WidgetRegistry;

/// Shared handles the HTTP handlers read from.
#[derive(Clone)]
pub struct GatewayState {
    /// Peer admission and lifecycle.
    pub hub: Arc<PeerHub>,
    /// Frame dispatch counters.
    pub router: Arc<FrameRouter>,
    /// Kernel bridge counters.
    pub bridge: Arc<KernelBridge>,
    /// Proxy counters.
    pub proxy: Arc<HttpProxy>,
    /// Document hub counters.
    pub dochub: Arc<DocumentHub>,
    /// Dedup counters.
    pub dedup: Arc<Deduplicator>,
    /// Widget registry counters.
    pub widgets: Arc<WidgetRegistry>,
}

/// Build the signaling router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/offer", post(handle_offer))
        .route("/status", get(handle_status))
        .with_state(state)
}

async fn handle_offer(
    State(state): State<GatewayState>,
    Json(offer): Json<RTCSessionDescription>,
) -> Result<Json<RTCSessionDescription>, (StatusCode, Json<Value>)> {
    if offer.sdp_type != RTCSdpType::Offer || offer.sdp.is_empty() {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "body is not a session offer" })),
        ));
    }

    match state.hub.admit(offer).await {
        Ok(answer) => Ok(Json(answer)),
        Err(err) => {
            warn!(%err, "offer handling failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            ))
        }
    }
}

async fn handle_status(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "peers": state.hub.status(),
        "router": state.router.status(),
        "kernel_bridge": state.bridge.status(),
        "http_proxy": state.proxy.status(),
        "documents": state.dochub.status(),
        "dedup": state.dedup.status(),
        "widgets": state.widgets.status(),
    }))
}
