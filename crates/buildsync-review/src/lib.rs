//! ---
//! bs_section: "05-networking-external-interfaces"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Source-control commit status reporting."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use buildsync_common::{load_token, StartupError};
use octocrab::Octocrab;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("failed to create status on {target}: {source}")]
    Api {
        target: String,
        #[source]
        source: octocrab::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

/// Status posted against a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitStatus {
    pub state: StatusState,
    pub context: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

/// The commit a status is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatusTarget {
    pub owner: String,
    pub repo: String,
    pub sha: String,
}

impl fmt::Display for StatusTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.sha)
    }
}

/// Mutation surface the controller uses to publish build results.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, target: &StatusTarget, status: &CommitStatus) -> Result<(), ReviewError>;
}

/// Source-control API client. In dry-run mode mutations are logged, not sent.
#[derive(Clone)]
pub struct ReviewClient {
    octocrab: Octocrab,
    endpoint: Url,
    dry_run: bool,
}

impl fmt::Debug for ReviewClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl ReviewClient {
    pub fn new(token: String, endpoint: &str, dry_run: bool) -> Result<Self, StartupError> {
        let invalid = |reason: String| StartupError::InvalidEndpoint {
            flag: "--review-endpoint",
            reason,
        };
        let endpoint = Url::parse(endpoint).map_err(|err| invalid(err.to_string()))?;
        if endpoint.cannot_be_a_base() {
            return Err(invalid(format!("{endpoint} cannot be used as a base URL")));
        }
        let octocrab = Octocrab::builder()
            .personal_token(token)
            .base_uri(endpoint.as_str())
            .map_err(|err| invalid(err.to_string()))?
            .build()
            .map_err(|err| StartupError::Client {
                client: "review",
                reason: err.to_string(),
            })?;
        debug!(endpoint = %endpoint, dry_run, "review client constructed");
        Ok(Self {
            octocrab,
            endpoint,
            dry_run,
        })
    }

    /// Build a client from an OAuth token file.
    pub fn from_token_file(path: &Path, endpoint: &str, dry_run: bool) -> Result<Self, StartupError> {
        Self::new(load_token(path)?, endpoint, dry_run)
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl StatusReporter for ReviewClient {
    async fn report(&self, target: &StatusTarget, status: &CommitStatus) -> Result<(), ReviewError> {
        if self.dry_run {
            info!(target = %target, context = %status.context, state = ?status.state, "dry run; not creating commit status");
            return Ok(());
        }
        let route = format!(
            "/repos/{}/{}/statuses/{}",
            target.owner, target.repo, target.sha
        );
        let _: serde_json::Value = self
            .octocrab
            .post(route, Some(status))
            .await
            .map_err(|source| ReviewError::Api {
                target: target.to_string(),
                source,
            })?;
        debug!(target = %target, context = %status.context, state = ?status.state, "commit status created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> CommitStatus {
        CommitStatus {
            state: StatusState::Success,
            context: "ci/unit".into(),
            description: "Job succeeded.".into(),
            target_url: None,
        }
    }

    #[test]
    fn status_serialises_without_empty_target_url() {
        let value = serde_json::to_value(status()).unwrap();
        assert_eq!(value["state"], "success");
        assert!(value.get("target_url").is_none());
    }

    #[tokio::test]
    async fn rejects_invalid_endpoint() {
        assert!(matches!(
            ReviewClient::new("token".into(), "::not a url", true),
            Err(StartupError::InvalidEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn missing_token_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ReviewClient::from_token_file(&dir.path().join("oauth"), "https://api.github.com", true),
            Err(StartupError::Credential { .. })
        ));
    }

    #[tokio::test]
    async fn dry_run_never_contacts_the_api() {
        // Port 9 is discard; a real request would fail.
        let client = ReviewClient::new("token".into(), "http://127.0.0.1:9", true).unwrap();
        assert!(client.is_dry_run());
        let target = StatusTarget {
            owner: "acme".into(),
            repo: "widgets".into(),
            sha: "deadbeef".into(),
        };
        client.report(&target, &status()).await.unwrap();
    }
}
