//! ---
//! bs_section: "05-networking-external-interfaces"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "HTTP client for the build backend."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use async_trait::async_trait;
use buildsync_common::StartupError;
use buildsync_metrics::ClientMetrics;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::auth::AuthConfig;
use crate::model::{job_segments, Build, BuildRef};
use crate::tls::TlsMaterial;
use crate::{BuildSource, LogSource};

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Streamed console log body.
pub type LogStream = BoxStream<'static, Result<Bytes, BackendError>>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0} not found on the backend")]
    NotFound(String),
    #[error("backend responded with {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

/// Authenticated client for the build backend.
///
/// Safe to share across tasks; every request records request metrics.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base: Url,
    auth: AuthConfig,
    metrics: ClientMetrics,
    attempts: u32,
    backoff: Duration,
}

impl BackendClient {
    pub fn new(
        base_url: &str,
        auth: AuthConfig,
        tls: Option<TlsMaterial>,
        metrics: ClientMetrics,
    ) -> Result<Self, StartupError> {
        let base = Url::parse(base_url).map_err(|err| StartupError::InvalidEndpoint {
            flag: "--backend-url",
            reason: err.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(StartupError::InvalidEndpoint {
                flag: "--backend-url",
                reason: format!("{base_url} cannot be used as a base URL"),
            });
        }
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(tls) = tls {
            builder = tls.apply(builder);
        }
        let http = builder.build().map_err(|err| StartupError::Client {
            client: "backend",
            reason: err.to_string(),
        })?;
        debug!(url = %base, auth = auth.scheme(), "backend client constructed");
        Ok(Self {
            http,
            base,
            auth,
            metrics,
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        })
    }

    /// Override how many times a request is tried and the first retry delay.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url<I, S>(&self, segments: I) -> Url
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// GET with retry on transport errors and 5xx responses.
    async fn get(&self, handler: &'static str, url: Url) -> Result<Response, BackendError> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let request = self.auth.apply(self.http.get(url.clone()));
            let outcome = request.send().await;
            let elapsed = started.elapsed();
            let retryable = match outcome {
                Ok(response) => {
                    let status = response.status();
                    self.metrics
                        .record("GET", handler, status.as_str(), elapsed);
                    if !status.is_server_error() {
                        return Ok(response);
                    }
                    BackendError::Status {
                        status,
                        url: url.to_string(),
                    }
                }
                Err(source) => {
                    self.metrics.record("GET", handler, "error", elapsed);
                    BackendError::Transport {
                        url: url.to_string(),
                        source,
                    }
                }
            };
            if attempt >= self.attempts {
                return Err(retryable);
            }
            warn!(url = %url, attempt, error = %retryable, "backend request failed; retrying");
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }

    fn check(response: Response, what: impl FnOnce() -> String) -> Result<Response, BackendError> {
        match response.status() {
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(what())),
            status if status.is_success() => Ok(response),
            status => Err(BackendError::Status {
                status,
                url: response.url().to_string(),
            }),
        }
    }

    /// Stream the console log of `build`.
    pub async fn get_log(&self, build: &BuildRef) -> Result<LogStream, BackendError> {
        let url = self.url(build.log_segments());
        let response = self.get("consoleText", url.clone()).await?;
        let response = Self::check(response, || format!("log for {build}"))?;
        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|source| BackendError::Transport {
                url: url.to_string(),
                source,
            })
        });
        Ok(stream.boxed())
    }

    /// Latest build of `job`, `None` if the job has no builds.
    pub async fn latest_build(&self, job: &str) -> Result<Option<Build>, BackendError> {
        let mut segments = job_segments(job);
        segments.extend(["lastBuild".to_owned(), "api".to_owned(), "json".to_owned()]);
        let url = self.url(segments);
        let response = self.get("lastBuild", url.clone()).await?;
        let response = match Self::check(response, || format!("job {job}")) {
            Ok(response) => response,
            Err(BackendError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let build = response
            .json::<Build>()
            .await
            .map_err(|source| BackendError::Decode {
                url: url.to_string(),
                source,
            })?;
        Ok(Some(build))
    }
}

#[async_trait]
impl LogSource for BackendClient {
    async fn get_log(&self, build: &BuildRef) -> Result<LogStream, BackendError> {
        BackendClient::get_log(self, build).await
    }
}

#[async_trait]
impl BuildSource for BackendClient {
    async fn latest_build(&self, job: &str) -> Result<Option<Build>, BackendError> {
        BackendClient::latest_build(self, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> Result<BackendClient, StartupError> {
        BackendClient::new(
            base,
            AuthConfig::Bearer {
                token: "t".into(),
            },
            None,
            ClientMetrics::new(&buildsync_metrics::prometheus::Registry::new()).unwrap(),
        )
    }

    #[test]
    fn rejects_invalid_base_urls() {
        assert!(matches!(
            client("jenkins-proxy"),
            Err(StartupError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            client("mailto:ops@example.com"),
            Err(StartupError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn builds_urls_under_base_path() {
        let backend = client("http://jenkins-proxy/ci/").unwrap();
        let url = backend.url(BuildRef::new("team/unit", 9).log_segments());
        assert_eq!(
            url.as_str(),
            "http://jenkins-proxy/ci/job/team/job/unit/9/consoleText"
        );
    }
}
