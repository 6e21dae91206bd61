use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{PagewatchError, Result};

/// Probed in order; the first one that answers proves we are online.
pub const DEFAULT_ENDPOINTS: &[&str] = &[
    "https://www.google.com/generate_204",
    "https://cloudflare.com/cdn-cgi/trace",
    "https://www.msftconnecttest.com/connecttest.txt",
];

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// `Err(PagewatchError::Connectivity)` when no endpoint is reachable.
    async fn check(&self) -> Result<()>;
}

/// Any HTTP response counts as reachable; only transport failures and
/// timeouts move on to the next endpoint.
pub struct HttpProbe {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpProbe {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PagewatchError::Config(format!("failed to build probe client: {e}")))?;
        Ok(Self { client, endpoints })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(
            DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            PROBE_TIMEOUT,
        )
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> Result<()> {
        for endpoint in &self.endpoints {
            match self.client.head(endpoint).send().await {
                Ok(resp) => {
                    debug!(endpoint, status = %resp.status(), "Connectivity probe succeeded");
                    return Ok(());
                }
                Err(e) => debug!(endpoint, error = %e, "Connectivity probe failed"),
            }
        }
        Err(PagewatchError::Connectivity)
    }
}
