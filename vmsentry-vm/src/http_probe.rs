//! Internal status check over HTTP

use async_trait::async_trait;
use tracing::debug;
use vmsentry_core::config::ProbeConfig;
use vmsentry_core::error::{VmSentryError, VmSentryResult};
use vmsentry_core::status_check::{GuestProbe, ProbeResult};

/// Sends `GET http://<ip>:<port><path>` and reports the status code
///
/// Connection failures and request timeouts are "no response", which the
/// status-check oracle keeps polling through.
pub struct HttpStatusProbe {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl HttpStatusProbe {
    pub fn new(config: &ProbeConfig) -> VmSentryResult<Self> {
        let client = reqwest::ClientBuilder::new()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| VmSentryError::ProbeError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            port: config.port,
            path: config.path.clone(),
        })
    }

    pub fn url(&self, ip_address: &str) -> String {
        format!("http://{}:{}{}", ip_address, self.port, self.path)
    }
}

#[async_trait]
impl GuestProbe for HttpStatusProbe {
    async fn probe(&self, ip_address: &str) -> Option<ProbeResult> {
        let url = self.url(ip_address);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(%url, status, "Status check response");
                Some(ProbeResult::new(status))
            }
            Err(e) => {
                debug!(%url, error = %e, "Status check got no response");
                None
            }
        }
    }
}
