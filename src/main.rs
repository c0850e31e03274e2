//! Gateway entry point: builds every component, wires them together, and
//! runs the signaling server until shutdown.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nbgate::bridge::KernelBridge;
use nbgate::config::Config;
use nbgate::dedup::Deduplicator;
use nbgate::dochub::DocumentHub;
use nbgate::jupyter::JupyterClient;
use nbgate::peer::{PeerEvent, PeerHub};
use nbgate::proxy::HttpProxy;
use nbgate::router::FrameRouter;
use nbgate::signaling::{self, GatewayState};
use nbgate::widgets::WidgetRegistry;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long components get to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("configuration")?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_filter.clone()))
        .init();

    info!(
        jupyter_url = %config.jupyter_url,
        port = config.listen_port,
        "starting nbgate"
    );

    // Leaves first, then components that only hold narrow handles down.
    let jupyter = JupyterClient::new(&config)?;
    let hub = Arc::new(PeerHub::new(config.ice_servers())?);
    let widgets = Arc::new(WidgetRegistry::new());
    let dedup = Arc::new(Deduplicator::default());
    let proxy = Arc::new(HttpProxy::new(&config)?);
    let bridge = KernelBridge::new(
        config.clone(),
        jupyter.clone(),
        hub.sender(),
        widgets.clone(),
    );
    let dochub = DocumentHub::new(hub.sender(), jupyter);
    let router = FrameRouter::new(
        bridge.clone(),
        proxy.clone(),
        dochub.clone(),
        hub.sender(),
        dedup.clone(),
    );

    bridge.spawn_sweeper(dedup.clone());
    spawn_peer_dispatch(hub.clone(), router.clone(), bridge.clone(), dochub.clone());

    let state = GatewayState {
        hub: hub.clone(),
        router,
        bridge: bridge.clone(),
        proxy,
        dochub: dochub.clone(),
        dedup,
        widgets,
    };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "signaling server listening");

    axum::serve(listener, signaling::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("signaling server")?;

    info!("shutting down");
    dochub.close();
    bridge.close().await;
    match tokio::time::timeout(SHUTDOWN_GRACE, hub.close_all()).await {
        Ok(()) => info!("all peers closed"),
        Err(_) => warn!("shutdown grace period elapsed, exiting anyway"),
    }
    Ok(())
}

/// Drain peer lifecycle events: spawn one routing task per admitted peer
/// (preserving that peer's arrival order) and clean up after departures.
fn spawn_peer_dispatch(
    hub: Arc<PeerHub>,
    router: Arc<FrameRouter>,
    bridge: Arc<KernelBridge>,
    dochub: Arc<DocumentHub>,
) {
    let events = hub.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PeerEvent::Open { peer_id, frames } => {
                    let router = router.clone();
                    tokio::spawn(async move {
                        while let Ok(payload) = frames.recv().await {
                            router.route(&peer_id, &payload).await;
                        }
                    });
                }
                PeerEvent::Closed { peer_id } => {
                    bridge.remove_peer(&peer_id).await;
                    dochub.drop_peer(&peer_id);
                }
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to install shutdown handler");
        std::future::pending::<()>().await;
    }
}
