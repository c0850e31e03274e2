//! Fan-out and persistence for collaborative documents.
//!
//! Document and awareness updates are opaque CRDT payloads relayed to every
//! other peer. The hub never merges updates itself; instead, a debounced
//! timer asks the connected clients for a full notebook snapshot and writes
//! the first response through the Jupyter contents API.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::{timestamp, PeerFrame};
use crate::jupyter::JupyterClient;
use crate::peer::PeerSender;

/// Quiet period after the last update before a snapshot is requested.
pub const SAVE_DELAY: Duration = Duration::from_secs(2);

/// Retained change-log entries per document, for late-joiner replay.
const CHANGELOG_CAP: usize = 1024;

struct DocState {
    updates: Vec<Value>,
    save_timer: Option<CancellationToken>,
    awaiting_state: bool,
}

/// Relays CRDT traffic between peers and schedules debounced saves.
pub struct DocumentHub {
    peers: PeerSender,
    jupyter: JupyterClient,
    docs: DashMap<String, DocState>,
    shutdown: CancellationToken,
}

impl DocumentHub {
    /// Create the hub. Documents are created lazily on first update.
    pub fn new(peers: PeerSender, jupyter: JupyterClient) -> Arc<Self> {
        Arc::new(Self {
            peers,
            jupyter,
            docs: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Handle `yjs_document_update`: log it, fan it out, reset the save
    /// timer for the document.
    pub async fn apply_update(self: &Arc<Self>, peer_id: &str, frame: &PeerFrame) {
        let Some(doc_id) = frame.document_id() else {
            warn!(%peer_id, "document update without documentId");
            return;
        };

        {
            let mut doc = self.docs.entry(doc_id.to_string()).or_insert_with(|| DocState {
                updates: Vec::new(),
                save_timer: None,
                awaiting_state: false,
            });
            if doc.updates.len() >= CHANGELOG_CAP {
                doc.updates.remove(0);
            }
            doc.updates.push(frame.value().clone());
        }

        self.peers.broadcast(frame.value(), Some(peer_id)).await;
        self.schedule_save(doc_id);
    }

    /// Handle `yjs_awareness_update`: fan-out only, never persisted.
    pub async fn apply_awareness(&self, peer_id: &str, frame: &PeerFrame) {
        if frame.document_id().is_none() {
            warn!(%peer_id, "awareness update without documentId");
            return;
        }
        self.peers.broadcast(frame.value(), Some(peer_id)).await;
    }

    /// Handle `yjs_sync_request`: replay the stored change log to the
    /// requesting peer, in arrival order.
    pub async fn replay(&self, peer_id: &str, frame: &PeerFrame) {
        let Some(doc_id) = frame.document_id() else {
            return;
        };
        let updates: Vec<Value> = self
            .docs
            .get(doc_id)
            .map(|doc| doc.updates.clone())
            .unwrap_or_default();
        debug!(%peer_id, %doc_id, count = updates.len(), "replaying change log");
        for update in updates {
            self.peers.send_to(peer_id, &update).await;
        }
    }

    /// Handle a peer-initiated `yjs_request_state` by relaying the
    /// solicitation to the other peers holding the document.
    pub async fn relay_state_request(&self, peer_id: &str, frame: &PeerFrame) {
        self.peers.broadcast(frame.value(), Some(peer_id)).await;
    }

    /// Handle `yjs_state_response`: the first response per requested save
    /// wins and is written through the contents API; the rest are dropped.
    pub async fn handle_state_response(&self, peer_id: &str, frame: &PeerFrame) {
        let Some(doc_id) = frame.document_id() else {
            return;
        };
        let Some(content) = frame.value().get("state").or_else(|| frame.value().get("content"))
        else {
            warn!(%peer_id, %doc_id, "state response without content");
            return;
        };

        if !self.take_awaiting(doc_id) {
            debug!(%peer_id, %doc_id, "state response discarded, no save pending");
            return;
        }

        let path = doc_path(doc_id);
        let body = json!({
            "type": "notebook",
            "path": path,
            "content": content,
        });
        match self.jupyter.put_contents(&path, &body).await {
            Ok(()) => info!(%doc_id, %path, "document persisted"),
            // In-memory state is intact; the next debounced save retries.
            Err(err) => warn!(%doc_id, %path, %err, "document save failed"),
        }
    }

    /// Forget a disconnected peer. Nothing doc-side is owned per peer, so
    /// this only logs; subscriber bookkeeping lives in the peer hub.
    pub fn drop_peer(&self, peer_id: &str) {
        debug!(%peer_id, "peer left document hub");
    }

    /// Arm (or re-arm) the debounced save for a document. The previous
    /// timer, if any, is cancelled: only the newest update schedules.
    fn schedule_save(self: &Arc<Self>, doc_id: &str) {
        let timer = self.shutdown.child_token();
        {
            let Some(mut doc) = self.docs.get_mut(doc_id) else {
                return;
            };
            if let Some(previous) = doc.save_timer.replace(timer.clone()) {
                previous.cancel();
            }
        }

        let hub = self.clone();
        let doc_id = doc_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(SAVE_DELAY) => {
                    hub.request_state(&doc_id).await;
                }
            }
        });
    }

    /// Ask the connected clients for a full snapshot of the document.
    async fn request_state(&self, doc_id: &str) {
        if let Some(mut doc) = self.docs.get_mut(doc_id) {
            doc.awaiting_state = true;
            doc.save_timer = None;
        }
        let request = json!({
            "action": "yjs_request_state",
            "documentId": doc_id,
            "timestamp": timestamp(),
        });
        let receivers = self.peers.broadcast(&request, None).await;
        debug!(%doc_id, receivers, "requested document state");
    }

    /// Atomically consume the awaiting-state flag for a document.
    fn take_awaiting(&self, doc_id: &str) -> bool {
        let Some(mut doc) = self.docs.get_mut(doc_id) else {
            return false;
        };
        std::mem::take(&mut doc.awaiting_state)
    }

    /// Counter snapshot for the status endpoint.
    pub fn status(&self) -> Value {
        let pending_saves = self
            .docs
            .iter()
            .filter(|entry| entry.value().save_timer.is_some() || entry.value().awaiting_state)
            .count();
        json!({
            "documents": self.docs.len(),
            "pending_saves": pending_saves,
        })
    }

    /// Cancel all timers at process shutdown.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Derive the notebook path for a document id.
///
/// `notebook-foo-bar` maps to `foo/bar.ipynb`; ids without the prefix or
/// with no usable segments fall back to `tmp.ipynb`.
fn doc_path(doc_id: &str) -> String {
    let Some(rest) = doc_id.strip_prefix("notebook-") else {
        return "tmp.ipynb".into();
    };
    let path = rest.replace('-', "/");
    if path.is_empty() || path == "/" {
        return "tmp.ipynb".into();
    }
    if path.ends_with(".ipynb") {
        path
    } else {
        format!("{path}.ipynb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::peer::PeerHub;
    use url::Url;

    fn test_hub() -> Arc<DocumentHub> {
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
        let peers = PeerHub::new(Vec::new()).unwrap();
        DocumentHub::new(peers.sender(), JupyterClient::new(&config).unwrap())
    }

    fn update_frame(doc_id: &str, payload: u8) -> PeerFrame {
        PeerFrame::from_value(json!({
            "action": "yjs_document_update",
            "documentId": doc_id,
            "update": [payload],
        }))
    }

    #[test]
    fn doc_id_to_path_mapping() {
        assert_eq!(doc_path("notebook-tmp"), "tmp.ipynb");
        assert_eq!(doc_path("notebook-foo-bar"), "foo/bar.ipynb");
        assert_eq!(doc_path("notebook-"), "tmp.ipynb");
        assert_eq!(doc_path("whiteboard-1"), "tmp.ipynb");
    }

    #[tokio::test]
    async fn change_log_is_bounded() {
        let hub = test_hub();
        for i in 0..CHANGELOG_CAP + 10 {
            hub.apply_update("p1", &update_frame("notebook-tmp", (i % 256) as u8))
                .await;
        }
        let doc = hub.docs.get("notebook-tmp").unwrap();
        assert_eq!(doc.updates.len(), CHANGELOG_CAP);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_marks_save_pending() {
        let hub = test_hub();
        hub.apply_update("p1", &update_frame("notebook-tmp", 1)).await;

        tokio::time::sleep(SAVE_DELAY + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert!(hub.take_awaiting("notebook-tmp"));
        // Consumed: the next response finds nothing pending.
        assert!(!hub.take_awaiting("notebook-tmp"));
    }

    #[tokio::test(start_paused = true)]
    async fn new_update_replaces_pending_save() {
        let hub = test_hub();
        hub.apply_update("p1", &update_frame("notebook-tmp", 1)).await;
        tokio::time::sleep(SAVE_DELAY / 2).await;
        hub.apply_update("p1", &update_frame("notebook-tmp", 2)).await;
        tokio::time::sleep(SAVE_DELAY / 2).await;
        tokio::task::yield_now().await;

        // First timer was cancelled; the save window restarted.
        assert!(!hub.take_awaiting("notebook-tmp"));

        tokio::time::sleep(SAVE_DELAY).await;
        tokio::task::yield_now().await;
        assert!(hub.take_awaiting("notebook-tmp"));
    }
}
