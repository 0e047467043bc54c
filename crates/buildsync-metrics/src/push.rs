//! ---
//! bs_section: "03-persistence-logging"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Push-gateway uploader for operator metrics."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::{encode_text, SharedRegistry};

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Uploads the registry to a Prometheus push gateway, replacing the group
/// `job/<job>/instance/<instance>` on every push.
#[derive(Debug, Clone)]
pub struct PushGateway {
    client: Client,
    url: Url,
    registry: SharedRegistry,
}

impl PushGateway {
    pub fn new(endpoint: &str, job: &str, instance: &str, registry: SharedRegistry) -> Result<Self> {
        let mut url = Url::parse(endpoint)
            .with_context(|| format!("invalid push gateway endpoint {endpoint}"))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("push gateway endpoint {endpoint} cannot be a base URL"))?
            .pop_if_empty()
            .extend(["metrics", "job", job, "instance", instance]);
        let client = Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .context("failed to build push gateway client")?;
        Ok(Self {
            client,
            url,
            registry,
        })
    }

    /// Instance label derived from the host name, falling back to `unknown`.
    pub fn default_instance() -> String {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|host| !host.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_owned())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn push(&self) -> Result<()> {
        let body = encode_text(&self.registry)?;
        let response = self
            .client
            .put(self.url.clone())
            .header(CONTENT_TYPE, prometheus::TEXT_FORMAT)
            .body(body)
            .send()
            .await
            .with_context(|| format!("failed to push metrics to {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!(
                "push gateway {} responded with {}",
                self.url,
                status
            ));
        }
        debug!(url = %self.url, "metrics pushed");
        Ok(())
    }
}
