//! One outbound wire connection to a Jupyter kernel's channel endpoint.
//!
//! Each link owns exactly one reader task and one sender task. Outbound
//! frames are serialized through a bounded queue so two frames never
//! interleave on the socket; the sender also emits a periodic ping to keep
//! idle connections alive through NATs and proxies.

use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use dashmap::DashSet;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Error;

/// Capacity of the outbound frame queue per link.
pub const OUTBOUND_QUEUE_CAP: usize = 1024;

const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Traffic delivered from a link to the bridge.
pub enum LinkEvent {
    /// A kernel message arrived on the wire.
    Frame(Value),
    /// The wire connection is gone; no further events will follow.
    Closed,
}

/// A shared connection to one kernel, used by every instance bound to it.
pub struct KernelLink {
    kernel_id: String,
    outbound_tx: Sender<String>,
    instance_ids: DashSet<String>,
    cancel: CancellationToken,
}

impl KernelLink {
    /// Connect to the kernel's multiplexed channel endpoint and start the
    /// reader and sender tasks. Inbound traffic and the eventual close are
    /// delivered through the returned receiver.
    pub async fn connect(
        kernel_id: &str,
        ws_url: &str,
        auth_header: &str,
    ) -> Result<(Self, Receiver<LinkEvent>), Error> {
        let mut request = ws_url
            .into_client_request()
            .map_err(|err| Error::KernelConnect(err.to_string()))?;
        request.headers_mut().insert(
            AUTHORIZATION,
            auth_header
                .parse()
                .map_err(|_| Error::KernelConnect("invalid auth header".into()))?,
        );

        let (ws, _resp) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| Error::KernelConnect(err.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (outbound_tx, outbound_rx) = async_channel::bounded::<String>(OUTBOUND_QUEUE_CAP);
        let (events_tx, events_rx) = async_channel::unbounded();
        let cancel = CancellationToken::new();

        {
            // Sender: drain the outbound queue and keep the socket warm.
            let cancel = cancel.clone();
            let kernel_id = kernel_id.to_string();
            tokio::spawn(async move {
                let mut ping = interval(PING_INTERVAL);
                ping.tick().await; // First tick fires immediately; skip it.
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ping.tick() => {
                            if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                                break;
                            }
                        }
                        payload = outbound_rx.recv() => {
                            let Ok(payload) = payload else { break };
                            if ws_tx.send(Message::Text(payload)).await.is_err() {
                                debug!(%kernel_id, "kernel socket rejected send");
                                break;
                            }
                        }
                    }
                }
                let _ = ws_tx.send(Message::Close(None)).await;
            });
        }

        {
            // Reader: forward kernel frames to the bridge until the wire
            // closes, then report exactly one Closed event.
            let cancel = cancel.clone();
            let kernel_id = kernel_id.to_string();
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = cancel.cancelled() => break,
                        message = ws_rx.next() => message,
                    };
                    let Some(Ok(message)) = message else { break };
                    let payload = match message {
                        Message::Text(payload) => payload,
                        Message::Binary(payload) => match String::from_utf8(payload) {
                            Ok(payload) => payload,
                            Err(_) => continue,
                        },
                        Message::Close(_) => break,
                        _ => continue,
                    };
                    match serde_json::from_str::<Value>(&payload) {
                        Ok(frame) => {
                            if events_tx.send(LinkEvent::Frame(frame)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(%kernel_id, %err, "unparsable frame from kernel");
                        }
                    }
                }
                cancel.cancel();
                let _ = events_tx.send(LinkEvent::Closed).await;
            });
        }

        Ok((
            Self {
                kernel_id: kernel_id.to_string(),
                outbound_tx,
                instance_ids: DashSet::new(),
                cancel,
            },
            events_rx,
        ))
    }

    /// The kernel this link is bound to.
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    /// Queue a serialized frame for the kernel.
    ///
    /// Errors when the link is closed or the outbound queue is full; the
    /// caller decides whether that is fatal for the request.
    pub fn send(&self, payload: String) -> Result<(), Error> {
        match self.outbound_tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::KernelConnect(format!(
                "outbound queue full for kernel {}",
                self.kernel_id
            ))),
            Err(TrySendError::Closed(_)) => Err(Error::KernelDisconnect),
        }
    }

    /// Whether the wire connection has been closed or cancelled.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Register an instance as a user of this link.
    pub fn add_instance(&self, instance_id: &str) {
        self.instance_ids.insert(instance_id.to_string());
    }

    /// Remove an instance; returns true when the set became empty and the
    /// link should be torn down.
    pub fn remove_instance(&self, instance_id: &str) -> bool {
        self.instance_ids.remove(instance_id);
        self.instance_ids.is_empty()
    }

    /// Stop both tasks and close the wire connection.
    pub fn close(&self) {
        self.cancel.cancel();
        self.outbound_tx.close();
    }
}

impl Drop for KernelLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
