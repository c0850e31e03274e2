//! Privileged HTTP proxy for peer requests against the Jupyter REST API.
//!
//! Peers cannot reach the Jupyter server directly; they wrap REST calls in
//! `sudo_http_request` frames and the gateway executes them with its own
//! credentials, returning the response as a frame tagged with the caller's
//! correlation id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::frame::{timestamp, PeerFrame};
use crate::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes privileged HTTP requests on behalf of peers.
pub struct HttpProxy {
    base_url: Url,
    http_client: reqwest::Client,
    stats: ProxyStats,
}

#[derive(Default)]
struct ProxyStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    by_method: DashMap<String, u64>,
}

impl HttpProxy {
    /// Create a proxy against the configured Jupyter server.
    ///
    /// The proxy holds its own connection pool, separate from the kernel
    /// bridge's REST client.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let auth = config
            .auth_header()
            .parse()
            .map_err(|_| Error::Config("jupyter token is not a valid header value".into()))?;
        let headers = HeaderMap::from_iter([(AUTHORIZATION, auth)]);
        let http_client = reqwest::ClientBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            base_url: config.jupyter_url.clone(),
            http_client,
            stats: ProxyStats::default(),
        })
    }

    /// Execute a proxied request and build the reply frame for the caller.
    ///
    /// Never fails: validation errors and transport failures all come back
    /// as a reply with `status: 500` and the error text in `data`, so the
    /// originating peer always hears something.
    pub async fn execute(&self, frame: &PeerFrame) -> Value {
        let request_tag = frame.msg_id_tag().unwrap_or_default().to_string();
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        match self.try_execute(frame).await {
            Ok((status, headers, data)) => {
                if status < 400 {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                reply_frame(&request_tag, status, headers, data)
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%err, "proxy request failed");
                reply_frame(
                    &request_tag,
                    500,
                    Map::new(),
                    Value::String(format!("Error: {err}")),
                )
            }
        }
    }

    async fn try_execute(&self, frame: &PeerFrame) -> Result<(u16, Map<String, Value>, Value), Error> {
        let url = frame
            .value()
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::MalformedFrame("missing url".into()))?;
        let method = frame
            .value()
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedFrame("missing method".into()))?;
        let method = parse_method(method)?;

        *self
            .stats
            .by_method
            .entry(method.as_str().to_string())
            .or_insert(0) += 1;

        let full_url = self.compose_url(url)?;
        debug!(%full_url, method = method.as_str(), "proxying request");

        let mut builder = self.http_client.request(method.clone(), full_url);

        // Caller-supplied headers override the client defaults.
        if let Some(headers) = frame.value().get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                let (Ok(name), Some(value)) = (name.parse::<HeaderName>(), value.as_str()) else {
                    continue;
                };
                if let Ok(value) = value.parse::<HeaderValue>() {
                    builder = builder.header(name, value);
                }
            }
        }

        builder = match frame.value().get("data") {
            // Stringified JSON from the client is unwrapped; anything else
            // textual goes through as a raw body.
            Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
                Ok(parsed) => builder.json(&parsed),
                Err(_) => builder.body(text.clone()),
            },
            Some(Value::Null) | None => {
                // Several Jupyter endpoints reject write methods without a
                // JSON body, so an absent body becomes `{}`.
                if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
                    builder.json(&json!({}))
                } else {
                    builder
                }
            }
            Some(body) => builder.json(body),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();
        let text = response.text().await?;
        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok((status, headers, data))
    }

    fn compose_url(&self, url: &str) -> Result<Url, Error> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(Url::parse(url)?);
        }
        // Relative path: append to the configured base, collapsing any
        // duplicate slash at the joint.
        Ok(self.base_url.join(url.trim_start_matches('/'))?)
    }

    /// Counter snapshot for the status endpoint.
    pub fn status(&self) -> Value {
        let by_method: Map<String, Value> = self
            .stats
            .by_method
            .iter()
            .map(|entry| (entry.key().clone(), json!(*entry.value())))
            .collect();
        json!({
            "total_requests": self.stats.total.load(Ordering::Relaxed),
            "successful_requests": self.stats.succeeded.load(Ordering::Relaxed),
            "failed_requests": self.stats.failed.load(Ordering::Relaxed),
            "requests_by_method": by_method,
            "base_url": self.base_url.as_str(),
        })
    }
}

fn parse_method(method: &str) -> Result<Method, Error> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        other => Err(Error::MalformedFrame(format!(
            "unsupported HTTP method: {other}"
        ))),
    }
}

/// The reply is addressed by the caller's own tag so the client can match
/// it without a dedicated reply channel.
fn reply_frame(request_tag: &str, status: u16, headers: Map<String, Value>, data: Value) -> Value {
    json!({
        "action": request_tag,
        "msgId": request_tag,
        "status": status,
        "headers": headers,
        "data": data,
        "timestamp": timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> HttpProxy {
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
        HttpProxy::new(&config).unwrap()
    }

    #[test]
    fn relative_urls_join_the_base() {
        let proxy = proxy();
        assert_eq!(
            proxy.compose_url("/api/kernels").unwrap().as_str(),
            "http://localhost:8888/api/kernels"
        );
        assert_eq!(
            proxy.compose_url("api/kernels").unwrap().as_str(),
            "http://localhost:8888/api/kernels"
        );
    }

    #[test]
    fn absolute_urls_pass_through() {
        let proxy = proxy();
        assert_eq!(
            proxy.compose_url("http://other:9999/api").unwrap().as_str(),
            "http://other:9999/api"
        );
    }

    #[test]
    fn method_validation() {
        assert!(parse_method("get").is_ok());
        assert!(parse_method("DELETE").is_ok());
        assert!(parse_method("TRACE").is_err());
        assert!(parse_method("").is_err());
    }

    #[tokio::test]
    async fn missing_url_yields_status_500_reply() {
        let proxy = proxy();
        let frame = PeerFrame::parse(
            br#"{"action": "sudo_http_request", "method": "GET", "msgId": "r1"}"#,
        )
        .unwrap();
        let reply = proxy.execute(&frame).await;
        assert_eq!(reply["action"], "r1");
        assert_eq!(reply["status"], 500);
        assert!(reply["data"].as_str().unwrap().starts_with("Error:"));
    }

    #[tokio::test]
    async fn bad_method_yields_status_500_reply() {
        let proxy = proxy();
        let frame = PeerFrame::parse(
            br#"{"action": "sudo_http_request", "url": "/api", "method": "TRACE", "msgId": "r2"}"#,
        )
        .unwrap();
        let reply = proxy.execute(&frame).await;
        assert_eq!(reply["status"], 500);
        assert_eq!(reply["msgId"], "r2");
    }
}
