//! Classifies inbound peer frames and dispatches them to handlers.
//!
//! One `route` call per frame, invoked from the per-peer drain task so that
//! a peer's frames are handled in arrival order. Malformed or unknown
//! frames are counted and dropped; the peer stays connected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::bridge::KernelBridge;
use crate::dedup::Deduplicator;
use crate::dochub::DocumentHub;
use crate::frame::PeerFrame;
use crate::peer::PeerSender;
use crate::proxy::HttpProxy;

/// Actions a peer can put on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Kernel protocol message wrapped for an instance.
    KernelMessage,
    /// Widget comm traffic, also forwarded to the kernel.
    CommMsg,
    /// Widget comm opening.
    CommOpen,
    /// Widget comm teardown.
    CommClose,
    /// Request to open a kernel link for an instance.
    WebsocketConnect,
    /// Request to close an instance's kernel link.
    WebsocketClose,
    /// Restart a kernel in place via the Jupyter REST API.
    RestartKernel,
    /// Interrupt a kernel's current execution.
    InterruptKernel,
    /// Privileged REST request against the Jupyter API.
    SudoHttpRequest,
    /// Opaque collaborative-canvas payload, relayed to other peers.
    CanvasData,
    /// CRDT document delta.
    YjsDocumentUpdate,
    /// CRDT presence/awareness delta.
    YjsAwarenessUpdate,
    /// Request to replay the stored change log.
    YjsSyncRequest,
    /// Solicitation for a full document snapshot.
    YjsRequestState,
    /// Full notebook snapshot answering a solicitation.
    YjsStateResponse,
    /// Anything else; counted and dropped.
    Other(String),
}

impl Action {
    /// Map the wire tag to an action.
    pub fn parse(tag: &str) -> Action {
        match tag {
            "kernel_message" => Action::KernelMessage,
            "comm_msg" => Action::CommMsg,
            "comm_open" => Action::CommOpen,
            "comm_close" => Action::CommClose,
            "websocket_connect" => Action::WebsocketConnect,
            "websocket_close" => Action::WebsocketClose,
            "restart_kernel" => Action::RestartKernel,
            "interrupt_kernel" => Action::InterruptKernel,
            "sudo_http_request" => Action::SudoHttpRequest,
            "canvas_data" => Action::CanvasData,
            "yjs_document_update" => Action::YjsDocumentUpdate,
            "yjs_awareness_update" => Action::YjsAwarenessUpdate,
            "yjs_sync_request" => Action::YjsSyncRequest,
            "yjs_request_state" => Action::YjsRequestState,
            "yjs_state_response" => Action::YjsStateResponse,
            other => Action::Other(other.to_string()),
        }
    }

    /// Whether this action carries a Jupyter message subject to dedup.
    fn deduplicated(&self) -> bool {
        matches!(
            self,
            Action::KernelMessage | Action::CommMsg | Action::CommOpen | Action::CommClose
        )
    }
}

#[derive(Default)]
struct RouterStats {
    total: AtomicU64,
    failed: AtomicU64,
    dropped_duplicates: AtomicU64,
    by_action: DashMap<String, u64>,
}

/// Routes parsed frames to the owning component.
pub struct FrameRouter {
    bridge: Arc<KernelBridge>,
    proxy: Arc<HttpProxy>,
    dochub: Arc<DocumentHub>,
    peers: PeerSender,
    dedup: Arc<Deduplicator>,
    stats: RouterStats,
}

impl FrameRouter {
    /// Wire up the router against its downstream handlers.
    pub fn new(
        bridge: Arc<KernelBridge>,
        proxy: Arc<HttpProxy>,
        dochub: Arc<DocumentHub>,
        peers: PeerSender,
        dedup: Arc<Deduplicator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            proxy,
            dochub,
            peers,
            dedup,
            stats: RouterStats::default(),
        })
    }

    /// Route one raw frame from a peer.
    pub async fn route(self: &Arc<Self>, peer_id: &str, payload: &[u8]) {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let mut frame = match PeerFrame::parse(payload) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                debug!(%peer_id, %err, "dropping unparsable frame");
                return;
            }
        };

        let Some(tag) = frame.action().map(str::to_string) else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            debug!(%peer_id, "dropping frame without action");
            return;
        };
        let action = Action::parse(&tag);
        *self.stats.by_action.entry(tag.clone()).or_insert(0) += 1;

        // The sender identity comes from the connection, never the wire.
        frame.set_client_id(peer_id);

        if action.deduplicated() {
            if let Some(data) = frame.data() {
                let msg_id = data.msg_id().unwrap_or_default();
                if self.dedup.check_and_mark(msg_id, data.comm_id()) {
                    self.stats.dropped_duplicates.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer_id, %msg_id, "duplicate frame suppressed");
                    return;
                }
            }
        }

        match action {
            Action::KernelMessage | Action::CommMsg | Action::CommOpen | Action::CommClose => {
                self.bridge.handle_kernel_frame(peer_id, &frame).await;
            }
            Action::WebsocketConnect => self.bridge.connect(peer_id, &frame).await,
            Action::WebsocketClose => self.bridge.disconnect(peer_id, &frame).await,
            Action::RestartKernel => self.bridge.restart(peer_id, &frame).await,
            Action::InterruptKernel => self.bridge.interrupt(peer_id, &frame).await,
            Action::SudoHttpRequest => {
                // Executed off the routing path so a slow Jupyter response
                // cannot stall this peer's frame ordering.
                let proxy = self.proxy.clone();
                let peers = self.peers.clone();
                let peer_id = peer_id.to_string();
                tokio::spawn(async move {
                    let reply = proxy.execute(&frame).await;
                    peers.send_to(&peer_id, &reply).await;
                });
            }
            Action::CanvasData => {
                self.peers.broadcast(frame.value(), Some(peer_id)).await;
            }
            Action::YjsDocumentUpdate => self.dochub.apply_update(peer_id, &frame).await,
            Action::YjsAwarenessUpdate => self.dochub.apply_awareness(peer_id, &frame).await,
            Action::YjsSyncRequest => self.dochub.replay(peer_id, &frame).await,
            Action::YjsRequestState => self.dochub.relay_state_request(peer_id, &frame).await,
            Action::YjsStateResponse => self.dochub.handle_state_response(peer_id, &frame).await,
            Action::Other(tag) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%peer_id, %tag, "no handler for action");
            }
        }
    }

    /// Counter snapshot for the status endpoint.
    pub fn status(&self) -> Value {
        let by_action: serde_json::Map<String, Value> = self
            .stats
            .by_action
            .iter()
            .map(|entry| (entry.key().clone(), json!(*entry.value())))
            .collect();
        json!({
            "total_frames": self.stats.total.load(Ordering::Relaxed),
            "failed_frames": self.stats.failed.load(Ordering::Relaxed),
            "dropped_duplicates": self.stats.dropped_duplicates.load(Ordering::Relaxed),
            "frames_by_action": by_action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jupyter::JupyterClient;
    use crate::peer::PeerHub;
    use crate::widgets::WidgetRegistry;
    use url::Url;

    fn test_router() -> Arc<FrameRouter> {
        let config = Config {
            jupyter_url: Url::parse("http://localhost:8888").unwrap(),
            jupyter_token: "secret".into(),
            listen_port: 8765,
            stun_url: "stun:stun.example.com".into(),
            turn_url: None,
            turn_username: None,
            turn_password: None,
            log_filter: "info".into(),
        };
        let jupyter = JupyterClient::new(&config).unwrap();
        let hub = PeerHub::new(Vec::new()).unwrap();
        let widgets = Arc::new(WidgetRegistry::new());
        let bridge = KernelBridge::new(config.clone(), jupyter.clone(), hub.sender(), widgets);
        let proxy = Arc::new(HttpProxy::new(&config).unwrap());
        let dochub = DocumentHub::new(hub.sender(), jupyter);
        let dedup = Arc::new(Deduplicator::default());
        FrameRouter::new(bridge, proxy, dochub, hub.sender(), dedup)
    }

    #[test]
    fn action_tags_round_trip() {
        assert_eq!(Action::parse("kernel_message"), Action::KernelMessage);
        assert_eq!(Action::parse("yjs_document_update"), Action::YjsDocumentUpdate);
        assert_eq!(Action::parse("restart_kernel"), Action::RestartKernel);
        assert_eq!(
            Action::parse("launch_missiles"),
            Action::Other("launch_missiles".into())
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_counted_not_fatal() {
        let router = test_router();
        router.route("p1", b"{garbage").await;
        router.route("p1", br#"{"no_action": true}"#).await;
        router.route("p1", br#"{"action": "unknown_thing"}"#).await;

        let status = router.status();
        assert_eq!(status["total_frames"], 3);
        assert_eq!(status["failed_frames"], 3);
    }

    #[tokio::test]
    async fn duplicate_kernel_frames_are_suppressed() {
        let router = test_router();
        // No instance binding and no kernelId: the bridge drops it, but the
        // dedup mark happens first, so the retry is suppressed earlier.
        let frame = br#"{
            "action": "kernel_message",
            "instanceId": "i1",
            "data": {"header": {"msg_id": "dup", "msg_type": "execute_request"}}
        }"#;
        router.route("p1", frame).await;
        router.route("p1", frame).await;
        router.route("p1", frame).await;

        let status = router.status();
        assert_eq!(status["dropped_duplicates"], 2);
    }

    #[tokio::test]
    async fn canvas_data_broadcasts_without_error() {
        let router = test_router();
        router
            .route("p1", br#"{"action": "canvas_data", "data": {"type": "stroke"}}"#)
            .await;
        let status = router.status();
        assert_eq!(status["failed_frames"], 0);
        assert_eq!(status["frames_by_action"]["canvas_data"], 1);
    }
}
