//! A client for the REST surface of the Jupyter server behind the gateway.

use std::time::Duration;

use reqwest::{
    header::{self, HeaderMap},
    StatusCode,
};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use url::Url;

use crate::config::Config;
use crate::Error;

/// A stateless HTTP client for a running Jupyter server.
#[derive(Clone)]
pub struct JupyterClient {
    server_url: Url,
    http_client: reqwest::Client,
}

impl JupyterClient {
    /// Return a new client to a Jupyter server without connecting.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let auth = config
            .auth_header()
            .parse()
            .map_err(|_| Error::Config("jupyter token is not a valid header value".into()))?;
        let headers = HeaderMap::from_iter([(header::AUTHORIZATION, auth)]);
        let http_client = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(5))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            server_url: config.jupyter_url.clone(),
            http_client,
        })
    }

    /// Get information about a specific kernel by its ID.
    pub async fn get_kernel(&self, kernel_id: &str) -> Result<Option<JupyterKernelInfo>, Error> {
        let url = self.server_url.join(&format!("/api/kernels/{kernel_id}"))?;
        let resp = self.http_client.get(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(resp.error_for_status()?.json().await?)
    }

    /// Create a new kernel from the spec with the given name.
    ///
    /// The server assigns the kernel id; callers must use the returned id,
    /// which can differ from anything they asked for.
    pub async fn create_kernel(&self, spec_name: &str) -> Result<JupyterKernelInfo, Error> {
        let url = self.server_url.join("/api/kernels")?;
        let resp = self
            .http_client
            .post(url)
            .json(&json!({ "name": spec_name }))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Restart a kernel in place, keeping its id.
    pub async fn restart_kernel(&self, kernel_id: &str) -> Result<(), Error> {
        let url = self
            .server_url
            .join(&format!("/api/kernels/{kernel_id}/restart"))?;
        self.http_client
            .post(url)
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Interrupt whatever the kernel is currently executing.
    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), Error> {
        let url = self
            .server_url
            .join(&format!("/api/kernels/{kernel_id}/interrupt"))?;
        self.http_client
            .post(url)
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Write a file through the contents API, replacing any existing content.
    pub async fn put_contents(&self, path: &str, body: &serde_json::Value) -> Result<(), Error> {
        let url = self.server_url.join(&format!("/api/contents/{path}"))?;
        self.http_client
            .put(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Information about a running Jupyter kernel.
#[derive(Clone, Debug, Deserialize)]
pub struct JupyterKernelInfo {
    /// The unique identifier of the kernel.
    pub id: String,

    /// Name of the type of kernel being run (e.g., `python3`).
    pub name: String,

    /// Last activity ISO timestamp, typically UTC.
    #[serde(default, with = "time::serde::iso8601::option")]
    pub last_activity: Option<OffsetDateTime>,

    /// The execution state of the kernel: `starting`, `running`, etc.
    #[serde(default)]
    pub execution_state: Option<String>,

    /// The number of active connections to the kernel.
    #[serde(default)]
    pub connections: u32,
}
