//! The peer hub: admits WebRTC peers and carries JSON frames over one
//! reliable ordered data channel per peer.
//!
//! The hub does not inspect frame contents. Inbound bytes go onto a bounded
//! per-peer queue drained by the frame router; outbound frames are
//! serialized and sent with at most one in-flight send per peer. Candidate
//! gathering is completed before the answer is returned, so no trickle
//! signaling is needed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_channel::{Receiver, Sender, TrySendError};
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::Error;

/// Capacity of the inbound frame queue per peer. When full, further frames
/// from that peer are dropped with a warning; the peer stays connected.
pub const INBOUND_QUEUE_CAP: usize = 1024;

/// Lifecycle notifications delivered to the supervisor.
pub enum PeerEvent {
    /// A peer's data channel is open; `frames` yields its inbound traffic
    /// in arrival order until the peer goes away.
    Open {
        /// Gateway-assigned peer id.
        peer_id: String,
        /// Bounded stream of raw inbound frames.
        frames: Receiver<Bytes>,
    },
    /// The peer is gone and will never receive another frame.
    Closed {
        /// Gateway-assigned peer id.
        peer_id: String,
    },
}

struct Peer {
    id: String,
    conn: Arc<RTCPeerConnection>,
    channel: OnceLock<Arc<RTCDataChannel>>,
    inbound_tx: Sender<Bytes>,
    inbound_rx: Receiver<Bytes>,
    send_lock: Mutex<()>,
    dropped_frames: AtomicU64,
}

impl Peer {
    /// Serialize and send a frame; false if the peer cannot receive it.
    async fn send_json(&self, frame: &Value) -> bool {
        let Some(channel) = self.channel.get() else {
            return false;
        };
        let payload = frame.to_string();
        let _guard = self.send_lock.lock().await;
        match channel.send_text(payload).await {
            Ok(_) => true,
            Err(err) => {
                debug!(peer_id = %self.id, %err, "send to peer failed");
                false
            }
        }
    }
}

struct HubInner {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    peers: DashMap<String, Arc<Peer>>,
    events_tx: Sender<PeerEvent>,
    events_rx: Receiver<PeerEvent>,
}

/// Maintains the set of active peer connections.
pub struct PeerHub {
    inner: Arc<HubInner>,
}

impl PeerHub {
    /// Create a hub that will offer the given ICE servers to peers.
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let (events_tx, events_rx) = async_channel::unbounded();
        Ok(Self {
            inner: Arc::new(HubInner {
                api,
                ice_servers,
                peers: DashMap::new(),
                events_tx,
                events_rx,
            }),
        })
    }

    /// Stream of peer lifecycle events, consumed by the supervisor.
    pub fn events(&self) -> Receiver<PeerEvent> {
        self.inner.events_rx.clone()
    }

    /// Narrow send-only handle for components that unicast or broadcast.
    pub fn sender(&self) -> PeerSender {
        PeerSender {
            inner: self.inner.clone(),
        }
    }

    /// Admit a new peer: drive the offer/answer handshake and return the
    /// answer once candidate gathering has completed.
    pub async fn admit(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription, Error> {
        let inner = self.inner.clone();
        let peer_id = Uuid::new_v4().to_string();

        let conn = Arc::new(
            inner
                .api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: inner.ice_servers.clone(),
                    ..Default::default()
                })
                .await?,
        );

        let (inbound_tx, inbound_rx) = async_channel::bounded(INBOUND_QUEUE_CAP);
        let peer = Arc::new(Peer {
            id: peer_id.clone(),
            conn: conn.clone(),
            channel: OnceLock::new(),
            inbound_tx,
            inbound_rx,
            send_lock: Mutex::new(()),
            dropped_frames: AtomicU64::new(0),
        });
        inner.peers.insert(peer_id.clone(), peer.clone());

        {
            let inner = inner.clone();
            let peer = peer.clone();
            conn.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let inner = inner.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    inner.attach_channel(peer, channel);
                })
            }));
        }

        {
            let inner = inner.clone();
            let conn = conn.clone();
            let peer_id = peer_id.clone();
            conn.clone()
                .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                    let inner = inner.clone();
                    let conn = conn.clone();
                    let peer_id = peer_id.clone();
                    Box::pin(async move {
                        debug!(%peer_id, ?state, "peer connection state changed");
                        match state {
                            RTCPeerConnectionState::Failed => {
                                // Closing re-triggers this handler with Closed,
                                // which performs the actual teardown.
                                if let Err(err) = conn.close().await {
                                    warn!(%peer_id, %err, "error closing failed connection");
                                }
                            }
                            RTCPeerConnectionState::Closed => {
                                inner.close_peer(&peer_id).await;
                            }
                            _ => {}
                        }
                    })
                }));
        }

        let handshake = async {
            conn.set_remote_description(offer).await?;
            let answer = conn.create_answer(None).await?;
            let mut gathered = conn.gathering_complete_promise().await;
            conn.set_local_description(answer).await?;
            let _ = gathered.recv().await;

            conn.local_description().await.ok_or_else(|| {
                Error::PeerNegotiation("no local description after gathering".into())
            })
        };

        match handshake.await {
            Ok(answer) => {
                info!(%peer_id, "peer admitted");
                Ok(answer)
            }
            Err(err) => {
                // A failed handshake never leaves a half-registered peer.
                inner.close_peer(&peer_id).await;
                Err(err)
            }
        }
    }

    /// Counter snapshot for the status endpoint.
    pub fn status(&self) -> Value {
        let dropped: u64 = self
            .inner
            .peers
            .iter()
            .map(|entry| entry.value().dropped_frames.load(Ordering::Relaxed))
            .sum();
        json!({
            "connected_peers": self.inner.peers.len(),
            "dropped_inbound_frames": dropped,
        })
    }

    /// Close every peer connection, used at process shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self
            .inner
            .peers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for peer_id in ids {
            self.inner.close_peer(&peer_id).await;
        }
    }
}

impl HubInner {
    fn attach_channel(self: &Arc<Self>, peer: Arc<Peer>, channel: Arc<RTCDataChannel>) {
        debug!(peer_id = %peer.id, label = channel.label(), "data channel received");
        if peer.channel.set(channel.clone()).is_err() {
            // One frame channel per peer; extras would split the stream.
            warn!(peer_id = %peer.id, label = channel.label(), "ignoring extra data channel");
            return;
        }

        {
            let peer = peer.clone();
            channel.on_message(Box::new(move |message: DataChannelMessage| {
                match peer.inbound_tx.try_send(message.data) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        peer.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        warn!(peer_id = %peer.id, "inbound queue full, dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
                Box::pin(async {})
            }));
        }

        {
            let inner = self.clone();
            let peer = peer.clone();
            channel.on_open(Box::new(move || {
                info!(peer_id = %peer.id, "data channel open");
                let event = PeerEvent::Open {
                    peer_id: peer.id.clone(),
                    frames: peer.inbound_rx.clone(),
                };
                let inner = inner.clone();
                Box::pin(async move {
                    let _ = inner.events_tx.send(event).await;
                })
            }));
        }

        {
            let inner = self.clone();
            let peer_id = peer.id.clone();
            channel.on_close(Box::new(move || {
                let inner = inner.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    inner.close_peer(&peer_id).await;
                })
            }));
        }
    }

    /// Tear down a peer. Removal from the map makes this exactly-once even
    /// though channel close and connection close both land here.
    async fn close_peer(self: &Arc<Self>, peer_id: &str) {
        let Some((_, peer)) = self.peers.remove(peer_id) else {
            return;
        };
        info!(%peer_id, "peer closed");
        peer.inbound_tx.close();
        if let Err(err) = peer.conn.close().await {
            debug!(%peer_id, %err, "error closing peer connection");
        }
        let _ = self
            .events_tx
            .send(PeerEvent::Closed {
                peer_id: peer_id.to_string(),
            })
            .await;
    }
}

/// Send-only view of the hub, handed to the bridge, proxy dispatch, and
/// document hub so that no component can reach admission or lifecycle.
#[derive(Clone)]
pub struct PeerSender {
    inner: Arc<HubInner>,
}

impl PeerSender {
    /// Unicast a frame. Returns false (without error) if the peer is gone.
    pub async fn send_to(&self, peer_id: &str, frame: &Value) -> bool {
        let peer = self
            .inner
            .peers
            .get(peer_id)
            .map(|entry| entry.value().clone());
        match peer {
            Some(peer) => peer.send_json(frame).await,
            None => false,
        }
    }

    /// Best-effort fan-out to every peer except `except`. Per-peer failures
    /// are isolated; returns the number of successful sends.
    pub async fn broadcast(&self, frame: &Value, except: Option<&str>) -> usize {
        let targets: Vec<Arc<Peer>> = self
            .inner
            .peers
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != except)
            .map(|entry| entry.value().clone())
            .collect();

        let mut sent = 0;
        for peer in targets {
            if peer.send_json(frame).await {
                sent += 1;
            }
        }
        sent
    }
}
