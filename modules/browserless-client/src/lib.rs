pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

use serde::Serialize;

/// Body of a `/content` request.
///
/// Scripts in `add_script_tag` run inside the page after navigation and
/// before the DOM is serialized, which lets callers expand collapsed
/// content. `wait_for_timeout` gives those scripts time to settle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_script_tag: Vec<ScriptTag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goto_options: Option<GotoOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptTag {
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GotoOptions {
    pub wait_until: String,
    pub timeout: u64,
}

impl ContentRequest {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            goto_options: Some(GotoOptions {
                wait_until: "networkidle2".to_string(),
                timeout: 30_000,
            }),
            ..Default::default()
        }
    }

    pub fn with_script(mut self, js: &str) -> Self {
        self.add_script_tag.push(ScriptTag {
            content: js.to_string(),
        });
        self
    }

    pub fn wait_for(mut self, millis: u64) -> Self {
        self.wait_for_timeout = Some(millis);
        self
    }
}

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    headless: bool,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| BrowserlessError::Setup(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            headless: true,
        })
    }

    /// Ask Browserless to launch a headed browser when `false`.
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    fn endpoint(&self) -> String {
        let mut params = Vec::new();
        if let Some(ref token) = self.token {
            params.push(format!("token={token}"));
        }
        if !self.headless {
            params.push("headless=false".to_string());
        }

        let mut endpoint = format!("{}/content", self.base_url);
        if !params.is_empty() {
            endpoint.push('?');
            endpoint.push_str(&params.join("&"));
        }
        endpoint
    }

    /// Fetch fully-rendered HTML for a URL via the Browserless /content endpoint.
    pub async fn content(&self, url: &str) -> Result<String> {
        self.content_with(&ContentRequest::new(url)).await
    }

    /// Fetch rendered HTML with injected scripts and a settle delay.
    pub async fn content_with(&self, request: &ContentRequest) -> Result<String> {
        tracing::debug!(
            url = %request.url,
            scripts = request.add_script_tag.len(),
            "Requesting rendered content"
        );

        let resp = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }
}
