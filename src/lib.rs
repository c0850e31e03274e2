//! Library code for the nbgate Jupyter gateway.
//!
//! The gateway admits browser peers over WebRTC data channels and bridges
//! them to a local Jupyter server: kernel wire-protocol traffic, privileged
//! REST calls, and collaborative document sync all travel over one reliable
//! ordered channel per peer.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod config;
pub mod dedup;
pub mod dochub;
pub mod frame;
pub mod jupyter;
pub mod peer;
pub mod proxy;
pub mod router;
pub mod signaling;
pub mod widgets;

/// Errors returned by gateway components.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration was missing or invalid at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The WebRTC offer/answer exchange with a peer failed.
    #[error("peer negotiation failed: {0}")]
    PeerNegotiation(String),

    /// Could not connect to the kernel.
    #[error("could not connect to the kernel: {0}")]
    KernelConnect(String),

    /// Disconnected while communicating with a kernel.
    #[error("disconnected from the kernel")]
    KernelDisconnect,

    /// An invalid URL was provided or constructed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// HTTP error from reqwest while making a request.
    #[error("HTTP failure: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// A frame failed to parse or was missing a required field.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Error originating from the WebRTC stack.
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
}
