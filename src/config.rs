//! Environment-driven configuration for the gateway process.

use std::env;

use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::Error;

/// Default Jupyter server URL when `JUPYTER_URL` is unset.
pub const DEFAULT_JUPYTER_URL: &str = "http://localhost:8888";

/// Default listen port for the HTTP signaling server.
pub const DEFAULT_PORT: u16 = 8765;

/// Public STUN server used when `STUN_URL` is unset.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Runtime configuration, resolved once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the Jupyter server (REST + kernel WebSocket endpoints).
    pub jupyter_url: Url,

    /// Token sent as `Authorization: token <value>` on every Jupyter request.
    pub jupyter_token: String,

    /// Port the HTTP signaling server listens on.
    pub listen_port: u16,

    /// STUN server URL for ICE.
    pub stun_url: String,

    /// Optional TURN server URL.
    pub turn_url: Option<String>,

    /// TURN username, required when `turn_url` is set.
    pub turn_username: Option<String>,

    /// TURN credential, required when `turn_url` is set.
    pub turn_password: Option<String>,

    /// Tracing filter directive (e.g. `info` or `nbgate=debug`).
    pub log_filter: String,
}

impl Config {
    /// Resolve configuration from the process environment.
    ///
    /// A missing token or an unparsable URL/port is a startup failure; the
    /// process should exit non-zero rather than run half-configured.
    pub fn from_env() -> Result<Self, Error> {
        let jupyter_url = env::var("JUPYTER_URL").unwrap_or_else(|_| DEFAULT_JUPYTER_URL.into());
        let jupyter_url = Url::parse(&jupyter_url)
            .map_err(|err| Error::Config(format!("JUPYTER_URL {jupyter_url:?}: {err}")))?;

        let jupyter_token = env::var("JUPYTER_TOKEN")
            .map_err(|_| Error::Config("JUPYTER_TOKEN is not set".into()))?;

        let listen_port = match env::var("NBGATE_PORT") {
            Ok(port) => port
                .parse()
                .map_err(|_| Error::Config(format!("NBGATE_PORT {port:?} is not a port")))?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            jupyter_url,
            jupyter_token,
            listen_port,
            stun_url: env::var("STUN_URL").unwrap_or_else(|_| DEFAULT_STUN_URL.into()),
            turn_url: env::var("TURN_URL").ok(),
            turn_username: env::var("TURN_USERNAME").ok(),
            turn_password: env::var("TURN_PASSWORD").ok(),
            log_filter: env::var("NBGATE_LOG").unwrap_or_else(|_| "info".into()),
        })
    }

    /// ICE servers handed to each new peer connection.
    ///
    /// STUN is always present; TURN only when the URL and both credentials
    /// are configured.
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = vec![RTCIceServer {
            urls: vec![self.stun_url.clone()],
            ..Default::default()
        }];

        if let (Some(url), Some(username), Some(credential)) = (
            self.turn_url.as_ref(),
            self.turn_username.as_ref(),
            self.turn_password.as_ref(),
        ) {
            servers.push(RTCIceServer {
                urls: vec![url.clone()],
                username: username.clone(),
                credential: credential.clone(),
                ..Default::default()
            });
        }

        servers
    }

    /// WebSocket URL for a kernel's multiplexed channel endpoint.
    pub fn ws_channels_url(&self, kernel_id: &str) -> Result<String, Error> {
        let url = self
            .jupyter_url
            .join(&format!("/api/kernels/{kernel_id}/channels"))?;
        let mut url = url.to_string();
        if url.starts_with("https://") {
            url = url.replacen("https://", "wss://", 1);
        } else {
            url = url.replacen("http://", "ws://", 1);
        }
        Ok(url)
    }

    /// Value of the `Authorization` header for Jupyter requests.
    pub fn auth_header(&self) -> String {
        format!("token {}", self.jupyter_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            jupyter_url: Url::parse("http://localhost:8888").unwrap(),
            jupyter_token: "secret".into(),
            listen_port: 8765,
            stun_url: DEFAULT_STUN_URL.into(),
            turn_url: None,
            turn_username: None,
            turn_password: None,
            log_filter: "info".into(),
        }
    }

    #[test]
    fn ws_url_rewrites_scheme() {
        let config = test_config();
        assert_eq!(
            config.ws_channels_url("k1").unwrap(),
            "ws://localhost:8888/api/kernels/k1/channels"
        );

        let mut tls = test_config();
        tls.jupyter_url = Url::parse("https://hub.example.com").unwrap();
        assert_eq!(
            tls.ws_channels_url("k1").unwrap(),
            "wss://hub.example.com/api/kernels/k1/channels"
        );
    }

    #[test]
    fn turn_requires_full_credentials() {
        let mut config = test_config();
        assert_eq!(config.ice_servers().len(), 1);

        config.turn_url = Some("turn:turn.example.com:3478".into());
        // Credentials missing, TURN entry is withheld.
        assert_eq!(config.ice_servers().len(), 1);

        config.turn_username = Some("user".into());
        config.turn_password = Some("pass".into());
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "user");
    }

    #[test]
    fn auth_header_format() {
        assert_eq!(test_config().auth_header(), "token secret");
    }
}
