//! The kernel bridge: owns one wire connection per kernel and correlates
//! replies back to the peer instance that asked for them.
//!
//! Peers address kernels through `instanceId` (their own logical session).
//! The bridge maps instances to shared [`link::KernelLink`]s, learns Jupyter
//! session ids from outbound traffic, and uses four correlation sources for
//! inbound messages, in order: own msg id, parent msg id, session id, and
//! finally kernel-wide fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::frame::{self, Channel, KernelFrame, PeerFrame};
use crate::jupyter::JupyterClient;
use crate::peer::PeerSender;
use crate::widgets::WidgetRegistry;
use crate::Error;

pub mod link;

use link::{KernelLink, LinkEvent};

/// How long an unanswered request is tracked before the sweeper drops it.
pub const PENDING_TTL: Duration = Duration::from_secs(600);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Kernel spec used when a requested kernel does not exist yet.
const DEFAULT_KERNEL_SPEC: &str = "python3";

/// Best-effort init cell making sure widget comm packages are importable.
/// Runs once per process; failure is non-fatal.
const WIDGET_PREFLIGHT_CODE: &str = "\
import sys, subprocess, json
pkgs = ['ipywidgets>=8.0.0', 'jupyterlab_widgets>=3.0.0', 'traitlets>=5.0.0']
def ensure(pkg):
    name = pkg.split('>=')[0].replace('-', '_')
    try:
        __import__(name)
        return True
    except Exception:
        try:
            subprocess.check_call([sys.executable, '-m', 'pip', 'install', pkg, '--quiet'])
            __import__(name)
            return True
        except Exception as e:
            print(f'[widgets] install failed: {pkg}: {e}')
            return False
ok = all(ensure(p) for p in pkgs)
print(json.dumps({'widgets_ok': ok}))
";

/// Msg types reflected to the widget registry in either direction.
fn is_widget_traffic(msg_type: &str) -> bool {
    matches!(
        msg_type,
        "comm_open" | "comm_msg" | "comm_close" | "display_data" | "update_display_data"
            | "clear_output"
    )
}

/// A peer-side logical session bound to one kernel.
#[derive(Clone, Debug)]
struct Instance {
    peer_id: String,
    kernel_id: String,
    session_id: Option<String>,
    #[allow(dead_code)]
    connected_at: OffsetDateTime,
}

/// A forwarded request awaiting its reply.
struct PendingReply {
    instance_id: String,
    kernel_id: String,
    /// Channel the reply is expected on (the request's own channel).
    expected_channel: &'static str,
    sent_at: Instant,
    /// Gateway-internal request (widget preflight); replies are consumed
    /// rather than forwarded.
    internal: bool,
}

/// Bridges peer instances to shared kernel wire connections.
pub struct KernelBridge {
    config: Config,
    jupyter: JupyterClient,
    peers: PeerSender,
    widgets: Arc<WidgetRegistry>,

    links: DashMap<String, Arc<KernelLink>>,
    instances: DashMap<String, Instance>,
    session_index: DashMap<String, String>,
    pending: DashMap<String, PendingReply>,

    preflight_done: AtomicBool,
    shutdown: CancellationToken,
}

impl KernelBridge {
    /// Create a bridge. No kernel connections are opened until a peer asks.
    pub fn new(
        config: Config,
        jupyter: JupyterClient,
        peers: PeerSender,
        widgets: Arc<WidgetRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            jupyter,
            peers,
            widgets,
            links: DashMap::new(),
            instances: DashMap::new(),
            session_index: DashMap::new(),
            pending: DashMap::new(),
            preflight_done: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Handle `websocket_connect`: open (or join) the kernel link and bind
    /// the instance to it.
    pub async fn connect(self: &Arc<Self>, peer_id: &str, frame: &PeerFrame) {
        let Some(instance_id) = frame.instance_id() else {
            warn!(%peer_id, "websocket_connect without instanceId");
            return;
        };
        let Some(kernel_id) = frame.kernel_id() else {
            warn!(%peer_id, %instance_id, "websocket_connect without kernelId");
            self.peers
                .send_to(
                    peer_id,
                    &frame::error_frame("kernel_create_failed", "missing kernelId"),
                )
                .await;
            return;
        };

        match self.ensure_link(kernel_id).await {
            Ok((link, actual_kernel)) => {
                self.bind_instance(peer_id, instance_id, &actual_kernel, &link);
                // Comms survive a re-connect of a still-bound instance; hand
                // them back so the client can resume its widgets.
                let comms = self.widgets.comms_for_instance(instance_id);
                self.peers
                    .send_to(
                        peer_id,
                        &frame::websocket_connected(instance_id, &actual_kernel, &comms),
                    )
                    .await;
            }
            Err(err) => {
                warn!(%peer_id, %kernel_id, %err, "kernel connect failed");
                self.peers
                    .send_to(
                        peer_id,
                        &frame::error_frame("kernel_create_failed", &err.to_string()),
                    )
                    .await;
            }
        }
    }

    /// Handle `websocket_close`: unbind the instance, tearing the link down
    /// when it was the last user.
    pub async fn disconnect(&self, peer_id: &str, frame: &PeerFrame) {
        let Some(instance_id) = frame.instance_id() else {
            warn!(%peer_id, "websocket_close without instanceId");
            return;
        };

        let Some((_, instance)) = self
            .instances
            .remove_if(instance_id, |_, instance| instance.peer_id == peer_id)
        else {
            warn!(%peer_id, %instance_id, "websocket_close for unknown or foreign instance");
            return;
        };

        self.forget_instance(instance_id);
        if let Some(link) = self.links.get(&instance.kernel_id).map(|l| l.value().clone()) {
            if link.remove_instance(instance_id) {
                self.teardown_link(&instance.kernel_id);
            }
        }

        self.peers
            .send_to(
                peer_id,
                &frame::websocket_closed(instance_id, &instance.kernel_id),
            )
            .await;
    }

    /// Handle `kernel_message` and comm frames: forward the wrapped Jupyter
    /// message to the kernel, recording what is needed to route the reply.
    pub async fn handle_kernel_frame(self: &Arc<Self>, peer_id: &str, frame: &PeerFrame) {
        let Some(instance_id) = frame.instance_id() else {
            warn!(%peer_id, "kernel frame without instanceId");
            return;
        };
        let Some(data) = frame.data().filter(|data| data.0.is_object()) else {
            warn!(%peer_id, %instance_id, "kernel frame without data");
            return;
        };

        // The instance binding wins over whatever kernel id the frame
        // claims; the frame value is only trusted when nothing is bound yet.
        let bound = self
            .instances
            .get(instance_id)
            .map(|instance| instance.kernel_id.clone());
        let kernel_id = match &bound {
            Some(bound) => {
                if let Some(claimed) = frame.kernel_id() {
                    if claimed != bound {
                        warn!(
                            %instance_id,
                            %claimed,
                            %bound,
                            "frame kernel id ignored in favor of instance binding"
                        );
                    }
                }
                bound.clone()
            }
            None => match frame.kernel_id() {
                Some(kernel_id) => kernel_id.to_string(),
                None => {
                    warn!(%peer_id, %instance_id, "kernel frame with no kernel binding");
                    return;
                }
            },
        };

        let (link, actual_kernel) = match self.ensure_link(&kernel_id).await {
            Ok(ok) => ok,
            Err(err) => {
                warn!(%kernel_id, %err, "auto-connect failed");
                self.peers
                    .send_to(peer_id, &frame::error_frame("kernel_lost", &err.to_string()))
                    .await;
                return;
            }
        };
        if bound.is_none() {
            self.bind_instance(peer_id, instance_id, &actual_kernel, &link);
        }

        // Learn the Jupyter session id from the first outbound message so
        // later iopub traffic can find its way back.
        if let Some(session) = data.session() {
            self.learn_session(instance_id, session);
        }

        let msg_type = data.msg_type().unwrap_or_default().to_string();
        let channel = frame
            .channel()
            .or_else(|| data.channel())
            .map(str::to_string)
            .unwrap_or_else(|| Channel::for_msg_type(&msg_type).as_str().to_string());

        if is_widget_traffic(&msg_type) {
            self.widgets.observe(data, Some(instance_id));
        }

        let msg_id = data.msg_id().map(str::to_string);
        if let Some(msg_id) = &msg_id {
            self.pending.insert(
                msg_id.clone(),
                PendingReply {
                    instance_id: instance_id.to_string(),
                    kernel_id: actual_kernel.clone(),
                    expected_channel: Channel::for_msg_type(&msg_type).as_str(),
                    sent_at: Instant::now(),
                    internal: false,
                },
            );
        }

        let mut payload = data.0.clone();
        if payload.get("channel").is_none() {
            payload["channel"] = json!(channel);
        }
        if let Err(err) = link.send(payload.to_string()) {
            if let Some(msg_id) = &msg_id {
                self.pending.remove(msg_id);
            }
            warn!(%actual_kernel, %err, "kernel send failed");
            self.peers
                .send_to(peer_id, &frame::error_frame("kernel_lost", &err.to_string()))
                .await;
        }
    }

    /// Handle `restart_kernel`: restart through the REST API and tell every
    /// peer holding an instance on that kernel.
    pub async fn restart(&self, peer_id: &str, frame: &PeerFrame) {
        let Some(kernel_id) = self.resolve_kernel(frame) else {
            warn!(%peer_id, "restart_kernel with no kernel binding");
            return;
        };
        match self.jupyter.restart_kernel(&kernel_id).await {
            Ok(()) => {
                info!(%kernel_id, "kernel restarted");
                let notice = json!({
                    "action": "kernel_restarted",
                    "kernelId": kernel_id,
                    "timestamp": frame::timestamp(),
                });
                self.notify_kernel_peers(&kernel_id, &notice).await;
            }
            Err(err) => {
                warn!(%kernel_id, %err, "kernel restart failed");
                self.peers
                    .send_to(peer_id, &frame::error_frame("kernel_lost", &err.to_string()))
                    .await;
            }
        }
    }

    /// Handle `interrupt_kernel`: interrupt through the REST API; only the
    /// requesting peer is told, the outcome shows up on iopub anyway.
    pub async fn interrupt(&self, peer_id: &str, frame: &PeerFrame) {
        let Some(kernel_id) = self.resolve_kernel(frame) else {
            warn!(%peer_id, "interrupt_kernel with no kernel binding");
            return;
        };
        match self.jupyter.interrupt_kernel(&kernel_id).await {
            Ok(()) => {
                let notice = json!({
                    "action": "kernel_interrupted",
                    "kernelId": kernel_id,
                    "timestamp": frame::timestamp(),
                });
                self.peers.send_to(peer_id, &notice).await;
            }
            Err(err) => {
                warn!(%kernel_id, %err, "kernel interrupt failed");
                self.peers
                    .send_to(peer_id, &frame::error_frame("kernel_lost", &err.to_string()))
                    .await;
            }
        }
    }

    /// Kernel targeted by a control frame: the instance binding when one
    /// exists, otherwise the frame's own kernel id.
    fn resolve_kernel(&self, frame: &PeerFrame) -> Option<String> {
        if let Some(instance_id) = frame.instance_id() {
            if let Some(instance) = self.instances.get(instance_id) {
                return Some(instance.kernel_id.clone());
            }
        }
        frame.kernel_id().map(str::to_string)
    }

    /// Send a frame once to each peer holding an instance on a kernel.
    async fn notify_kernel_peers(&self, kernel_id: &str, notice: &Value) {
        let mut peers: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| entry.value().kernel_id == kernel_id)
            .map(|entry| entry.value().peer_id.clone())
            .collect();
        peers.sort();
        peers.dedup();
        for peer_id in peers {
            self.peers.send_to(&peer_id, notice).await;
        }
    }

    /// Remove everything a disconnected peer owned. Links shared with other
    /// peers survive; exclusive links are closed.
    pub async fn remove_peer(&self, peer_id: &str) {
        let owned: Vec<(String, String)> = self
            .instances
            .iter()
            .filter(|entry| entry.value().peer_id == peer_id)
            .map(|entry| (entry.key().clone(), entry.value().kernel_id.clone()))
            .collect();

        for (instance_id, kernel_id) in owned {
            self.instances.remove(&instance_id);
            self.forget_instance(&instance_id);
            if let Some(link) = self.links.get(&kernel_id).map(|l| l.value().clone()) {
                if link.remove_instance(&instance_id) {
                    self.teardown_link(&kernel_id);
                }
            }
        }
    }

    /// Resolve or open the link for a kernel, creating the kernel on the
    /// Jupyter server when it does not exist. Returns the link and the
    /// server-assigned kernel id, which may differ from the requested one.
    async fn ensure_link(self: &Arc<Self>, kernel_id: &str) -> Result<(Arc<KernelLink>, String), Error> {
        if let Some(link) = self.links.get(kernel_id) {
            if !link.is_closed() {
                return Ok((link.clone(), kernel_id.to_string()));
            }
        }

        let info = match self.jupyter.get_kernel(kernel_id).await? {
            Some(info) => info,
            None => {
                info!(%kernel_id, "kernel not found, creating");
                self.jupyter.create_kernel(DEFAULT_KERNEL_SPEC).await?
            }
        };
        let actual_kernel = info.id;
        if actual_kernel != kernel_id {
            debug!(requested = %kernel_id, assigned = %actual_kernel, "kernel id rebound");
        }

        if let Some(link) = self.links.get(&actual_kernel) {
            if !link.is_closed() {
                return Ok((link.clone(), actual_kernel));
            }
        }

        // Connect with no map lock held; publication below resolves races.
        let ws_url = self.config.ws_channels_url(&actual_kernel)?;
        let (link, events) = KernelLink::connect(&actual_kernel, &ws_url, &self.config.auth_header()).await?;
        let link = Arc::new(link);

        let link = match self.links.entry(actual_kernel.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    occupied.insert(link.clone());
                    self.spawn_link_task(actual_kernel.clone(), events);
                    link
                } else {
                    // A concurrent open won the race; keep the winner and
                    // drop our half-open connection.
                    link.close();
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(link.clone());
                self.spawn_link_task(actual_kernel.clone(), events);
                link
            }
        };

        self.maybe_preflight(&link);
        Ok((link, actual_kernel))
    }

    fn bind_instance(&self, peer_id: &str, instance_id: &str, kernel_id: &str, link: &KernelLink) {
        self.instances.insert(
            instance_id.to_string(),
            Instance {
                peer_id: peer_id.to_string(),
                kernel_id: kernel_id.to_string(),
                session_id: None,
                connected_at: OffsetDateTime::now_utc(),
            },
        );
        link.add_instance(instance_id);
        info!(%peer_id, %instance_id, %kernel_id, "instance bound to kernel");
    }

    fn learn_session(&self, instance_id: &str, session: &str) {
        if !self.session_index.contains_key(session) {
            self.session_index
                .insert(session.to_string(), instance_id.to_string());
            debug!(%session, %instance_id, "session id learned");
        }
        if let Some(mut instance) = self.instances.get_mut(instance_id) {
            if instance.session_id.is_none() {
                instance.session_id = Some(session.to_string());
            }
        }
    }

    /// Drop session-index entries and widget comms for a removed instance.
    fn forget_instance(&self, instance_id: &str) {
        self.session_index
            .retain(|_, mapped| mapped != instance_id);
        self.widgets.drop_instance(instance_id);
    }

    fn teardown_link(&self, kernel_id: &str) {
        if let Some((_, link)) = self.links.remove(kernel_id) {
            link.close();
        }
        self.pending.retain(|_, pending| pending.kernel_id != kernel_id);
        info!(%kernel_id, "kernel link closed");
    }

    fn spawn_link_task(self: &Arc<Self>, kernel_id: String, events: async_channel::Receiver<LinkEvent>) {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = bridge.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(LinkEvent::Frame(frame)) => bridge.route_inbound(&kernel_id, &frame).await,
                        Ok(LinkEvent::Closed) | Err(_) => {
                            bridge.on_link_lost(&kernel_id).await;
                            break;
                        }
                    },
                }
            }
        });
    }

    /// Route one inbound kernel message to the correct peer.
    async fn route_inbound(&self, kernel_id: &str, message: &Value) {
        let kf = KernelFrame(message);
        let msg_type = kf.msg_type().unwrap_or_default();
        let channel = kf
            .channel()
            .map(str::to_string)
            .unwrap_or_else(|| Channel::for_msg_type(msg_type).as_str().to_string());

        // Correlation order: own msg id, then parent msg id.
        let pending_key = [kf.msg_id(), kf.parent_msg_id()]
            .into_iter()
            .flatten()
            .find(|id| self.pending.contains_key(*id))
            .map(str::to_string);

        if let Some(key) = pending_key {
            let (instance_id, internal, resolved) = {
                let Some(pending) = self.pending.get(&key) else {
                    return;
                };
                // The entry is retired by its actual reply; iopub siblings
                // (status, streams) keep correlating through it until then.
                let resolved =
                    channel == pending.expected_channel || msg_type.ends_with("_reply");
                (pending.instance_id.clone(), pending.internal, resolved)
            };
            if resolved {
                self.pending.remove(&key);
            }
            if internal {
                debug!(%msg_type, "internal request traffic consumed");
                return;
            }
            self.forward(&instance_id, kernel_id, message, &channel).await;
            return;
        }

        // Session routing: replies carry the requester's session in the
        // parent header; client-echoed messages carry it in their own.
        let session_instance = [kf.parent_session(), kf.session()]
            .into_iter()
            .flatten()
            .find_map(|session| self.session_index.get(session).map(|i| i.value().clone()));

        if let Some(instance_id) = session_instance {
            self.forward(&instance_id, kernel_id, message, &channel).await;
            return;
        }

        // Last resort: every instance bound to this kernel hears it.
        let bound: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| entry.value().kernel_id == kernel_id)
            .map(|entry| entry.key().clone())
            .collect();
        if bound.is_empty() {
            debug!(%kernel_id, %msg_type, "inbound message with no bound instances");
            return;
        }
        for instance_id in bound {
            self.forward(&instance_id, kernel_id, message, &channel).await;
        }
    }

    async fn forward(&self, instance_id: &str, kernel_id: &str, message: &Value, channel: &str) {
        let kf = KernelFrame(message);
        if is_widget_traffic(kf.msg_type().unwrap_or_default()) {
            self.widgets.observe(kf, Some(instance_id));
        }

        let Some(peer_id) = self
            .instances
            .get(instance_id)
            .map(|instance| instance.peer_id.clone())
        else {
            debug!(%instance_id, "no owner for routed message");
            return;
        };
        self.peers
            .send_to(
                &peer_id,
                &frame::websocket_message(instance_id, kernel_id, message, channel),
            )
            .await;
    }

    /// A link's reader terminated: synthesize closes for every instance
    /// that referenced it and evict its pending replies.
    async fn on_link_lost(&self, kernel_id: &str) {
        self.teardown_link(kernel_id);

        let affected: Vec<(String, String)> = self
            .instances
            .iter()
            .filter(|entry| entry.value().kernel_id == kernel_id)
            .map(|entry| (entry.key().clone(), entry.value().peer_id.clone()))
            .collect();

        for (instance_id, peer_id) in affected {
            self.instances.remove(&instance_id);
            self.forget_instance(&instance_id);
            self.peers
                .send_to(&peer_id, &frame::websocket_closed(&instance_id, kernel_id))
                .await;
            self.peers
                .send_to(
                    &peer_id,
                    &frame::error_frame("kernel_lost", "kernel connection lost"),
                )
                .await;
        }
    }

    /// Queue the widget preflight cell once per process.
    fn maybe_preflight(&self, link: &KernelLink) {
        if self.preflight_done.swap(true, Ordering::SeqCst) {
            return;
        }
        let message = frame::kernel_request(
            "execute_request",
            json!({
                "code": WIDGET_PREFLIGHT_CODE,
                "silent": true,
                "store_history": false,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": false,
            }),
        );
        let msg_id = message["header"]["msg_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.pending.insert(
            msg_id,
            PendingReply {
                instance_id: String::new(),
                kernel_id: link.kernel_id().to_string(),
                expected_channel: Channel::Shell.as_str(),
                sent_at: Instant::now(),
                internal: true,
            },
        );
        let mut payload = message;
        payload["channel"] = json!(Channel::Shell.as_str());
        if let Err(err) = link.send(payload.to_string()) {
            debug!(%err, "widget preflight not sent");
        } else {
            info!(kernel_id = link.kernel_id(), "widget preflight queued");
        }
    }

    /// Start the periodic sweep of stale pending replies and dedup entries.
    pub fn spawn_sweeper(self: &Arc<Self>, dedup: Arc<Deduplicator>) {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = bridge.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        bridge.sweep_pending_at(Instant::now());
                        dedup.sweep();
                    }
                }
            }
        });
    }

    fn sweep_pending_at(&self, now: Instant) {
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| now.duration_since(pending.sent_at) < PENDING_TTL);
        if before != self.pending.len() {
            debug!(
                evicted = before - self.pending.len(),
                "stale pending replies evicted"
            );
        }
    }

    /// Counter snapshot for the status endpoint.
    pub fn status(&self) -> Value {
        json!({
            "kernel_links": self.links.len(),
            "instances": self.instances.len(),
            "known_sessions": self.session_index.len(),
            "pending_replies": self.pending.len(),
        })
    }

    /// Close every link and stop background tasks.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let kernel_ids: Vec<String> = self.links.iter().map(|entry| entry.key().clone()).collect();
        for kernel_id in kernel_ids {
            self.teardown_link(&kernel_id);
        }
        self.instances.clear();
        self.session_index.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::peer::PeerHub;
    use url::Url;

    fn test_bridge() -> Arc<KernelBridge> {
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
        KernelBridge::new(config, jupyter, hub.sender(), Arc::new(WidgetRegistry::new()))
    }

    fn fake_instance(bridge: &KernelBridge, instance_id: &str, peer_id: &str, kernel_id: &str) {
        bridge.instances.insert(
            instance_id.to_string(),
            Instance {
                peer_id: peer_id.to_string(),
                kernel_id: kernel_id.to_string(),
                session_id: None,
                connected_at: OffsetDateTime::now_utc(),
            },
        );
    }

    #[tokio::test]
    async fn session_learning_is_first_writer_wins() {
        let bridge = test_bridge();
        fake_instance(&bridge, "i1", "p1", "k1");
        fake_instance(&bridge, "i2", "p2", "k1");

        bridge.learn_session("i1", "s1");
        bridge.learn_session("i2", "s1");
        assert_eq!(bridge.session_index.get("s1").unwrap().as_str(), "i1");
        assert_eq!(
            bridge.instances.get("i1").unwrap().session_id.as_deref(),
            Some("s1")
        );
    }

    #[tokio::test]
    async fn remove_peer_drops_only_its_instances() {
        let bridge = test_bridge();
        fake_instance(&bridge, "i1", "p1", "k1");
        fake_instance(&bridge, "i2", "p1", "k2");
        fake_instance(&bridge, "i3", "p2", "k1");
        bridge.learn_session("i1", "s1");
        bridge.learn_session("i3", "s3");

        bridge.remove_peer("p1").await;

        assert!(bridge.instances.get("i1").is_none());
        assert!(bridge.instances.get("i2").is_none());
        assert!(bridge.instances.get("i3").is_some());
        assert!(bridge.session_index.get("s1").is_none());
        assert!(bridge.session_index.get("s3").is_some());
    }

    #[tokio::test]
    async fn pending_sweep_honors_ttl() {
        let bridge = test_bridge();
        let now = Instant::now();
        bridge.pending.insert(
            "old".into(),
            PendingReply {
                instance_id: "i1".into(),
                kernel_id: "k1".into(),
                expected_channel: "shell",
                sent_at: now,
                internal: false,
            },
        );
        bridge.pending.insert(
            "fresh".into(),
            PendingReply {
                instance_id: "i1".into(),
                kernel_id: "k1".into(),
                expected_channel: "shell",
                sent_at: now + PENDING_TTL / 2,
                internal: false,
            },
        );

        bridge.sweep_pending_at(now + PENDING_TTL);
        assert!(bridge.pending.get("old").is_none());
        assert!(bridge.pending.get("fresh").is_some());
    }

    #[tokio::test]
    async fn iopub_siblings_do_not_retire_pending() {
        let bridge = test_bridge();
        fake_instance(&bridge, "i1", "p1", "k1");
        bridge.pending.insert(
            "m1".into(),
            PendingReply {
                instance_id: "i1".into(),
                kernel_id: "k1".into(),
                expected_channel: "shell",
                sent_at: Instant::now(),
                internal: false,
            },
        );

        // Status on iopub correlates through the parent id but leaves the
        // entry in place for the real reply.
        let status = json!({
            "header": { "msg_id": "x1", "msg_type": "status", "session": "kernel-sess" },
            "parent_header": { "msg_id": "m1", "session": "s1" },
            "channel": "iopub",
            "content": { "execution_state": "busy" },
        });
        bridge.route_inbound("k1", &status).await;
        assert!(bridge.pending.get("m1").is_some());

        let reply = json!({
            "header": { "msg_id": "x2", "msg_type": "execute_reply", "session": "kernel-sess" },
            "parent_header": { "msg_id": "m1", "session": "s1" },
            "channel": "shell",
            "content": { "status": "ok", "execution_count": 1 },
        });
        bridge.route_inbound("k1", &reply).await;
        assert!(bridge.pending.get("m1").is_none());
    }

    #[tokio::test]
    async fn internal_request_replies_are_consumed() {
        let bridge = test_bridge();
        bridge.pending.insert(
            "pre1".into(),
            PendingReply {
                instance_id: String::new(),
                kernel_id: "k1".into(),
                expected_channel: "shell",
                sent_at: Instant::now(),
                internal: true,
            },
        );

        let reply = json!({
            "header": { "msg_id": "x1", "msg_type": "execute_reply" },
            "parent_header": { "msg_id": "pre1" },
            "channel": "shell",
            "content": { "status": "ok" },
        });
        bridge.route_inbound("k1", &reply).await;
        assert!(bridge.pending.get("pre1").is_none());
    }

    #[tokio::test]
    async fn teardown_link_discards_matching_pending() {
        let bridge = test_bridge();
        bridge.pending.insert(
            "m1".into(),
            PendingReply {
                instance_id: "i1".into(),
                kernel_id: "k1".into(),
                expected_channel: "shell",
                sent_at: Instant::now(),
                internal: false,
            },
        );
        bridge.pending.insert(
            "m2".into(),
            PendingReply {
                instance_id: "i2".into(),
                kernel_id: "k2".into(),
                expected_channel: "shell",
                sent_at: Instant::now(),
                internal: false,
            },
        );

        bridge.teardown_link("k1");
        assert!(bridge.pending.get("m1").is_none());
        assert!(bridge.pending.get("m2").is_some());
    }
}
