//! ---
//! bs_section: "04-configuration-orchestration"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Reconciliation controller for tracked backend jobs."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
//! The controller polls the backend for the latest build of every tracked job,
//! remembers what it saw, and reports state changes to source control.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use buildsync_backend::{Build, BuildSource, BuildState};
use buildsync_common::{ConfigAgent, JobConfig, LabelSelector, ReportTarget};
use buildsync_metrics::ControllerMetrics;
use buildsync_review::{CommitStatus, StatusReporter, StatusState, StatusTarget};
use buildsync_rt::Reconciler;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Build parameter carrying the commit a build was triggered for.
pub const SHA_PARAMETER: &str = "PULL_PULL_SHA";

/// What the controller last saw for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedBuild {
    /// Backend build number.
    pub number: u64,
    /// State of that build when observed.
    pub state: BuildState,
}

impl ObservedBuild {
    fn of(build: &Build) -> Self {
        Self {
            number: build.number,
            state: build.state(),
        }
    }
}

/// Reconciliation controller consumed by the scheduler.
pub struct BuildController {
    builds: Arc<dyn BuildSource>,
    reporter: Arc<dyn StatusReporter>,
    config: ConfigAgent,
    selector: LabelSelector,
    metrics: ControllerMetrics,
    observed: RwLock<HashMap<String, ObservedBuild>>,
}

impl std::fmt::Debug for BuildController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildController")
            .field("selector", &self.selector.to_string())
            .field("tracked", &self.observed.read().len())
            .finish_non_exhaustive()
    }
}

impl BuildController {
    /// Create a controller over the jobs in `config` that match `selector`.
    pub fn new(
        builds: Arc<dyn BuildSource>,
        reporter: Arc<dyn StatusReporter>,
        config: ConfigAgent,
        selector: LabelSelector,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            builds,
            reporter,
            config,
            selector,
            metrics,
            observed: RwLock::new(HashMap::new()),
        }
    }

    /// Last observation for `job`, if it is tracked and has built.
    pub fn observed(&self, job: &str) -> Option<ObservedBuild> {
        self.observed.read().get(job).copied()
    }

    fn selected_jobs(&self, jobs: &[JobConfig]) -> Vec<JobConfig> {
        jobs.iter()
            .filter(|job| self.selector.matches(&job.labels))
            .cloned()
            .collect()
    }

    async fn sync_job(&self, job: &JobConfig) -> Result<()> {
        let Some(build) = self.builds.latest_build(&job.name).await? else {
            if self.observed.write().remove(&job.name).is_some() {
                debug!(job = %job.name, "job has no builds; forgetting previous observation");
            }
            return Ok(());
        };

        let current = ObservedBuild::of(&build);
        let previous = self.observed(&job.name);
        if previous == Some(current) {
            return Ok(());
        }
        info!(
            job = %job.name,
            build = current.number,
            state = %current.state,
            previous = ?previous.map(|p| p.state),
            "build state changed"
        );
        if let Some(report) = &job.report {
            self.report(job, report, &build).await?;
        }
        // Recorded only after a successful report so a failed report is retried.
        self.observed.write().insert(job.name.clone(), current);
        Ok(())
    }

    async fn report(&self, job: &JobConfig, report: &ReportTarget, build: &Build) -> Result<()> {
        let Some(sha) = build.parameter(SHA_PARAMETER) else {
            debug!(job = %job.name, build = build.number, "build carries no commit; skipping report");
            return Ok(());
        };
        let Some(status) = commit_status(report, build) else {
            return Ok(());
        };
        let (owner, repo) = report.split_repo()?;
        let target = StatusTarget {
            owner: owner.to_owned(),
            repo: repo.to_owned(),
            sha,
        };
        self.reporter.report(&target, &status).await?;
        Ok(())
    }
}

/// Commit status for a build, or `None` when the state is not reportable.
fn commit_status(report: &ReportTarget, build: &Build) -> Option<CommitStatus> {
    let (state, description) = match build.state() {
        BuildState::Pending => (StatusState::Pending, "Job triggered."),
        BuildState::Running => (StatusState::Pending, "Job running."),
        BuildState::Success => (StatusState::Success, "Job succeeded."),
        BuildState::Failure => (StatusState::Failure, "Job failed."),
        BuildState::Aborted => (StatusState::Error, "Job aborted."),
        BuildState::Unknown => return None,
    };
    Some(CommitStatus {
        state,
        context: report.context.clone(),
        description: description.to_owned(),
        target_url: build.url.clone(),
    })
}

#[async_trait]
impl Reconciler for BuildController {
    async fn sync(&self) -> Result<()> {
        let config = self.config.config();
        let jobs = self.selected_jobs(&config.jobs);
        let tracked: HashSet<&str> = jobs.iter().map(|job| job.name.as_str()).collect();
        self.observed
            .write()
            .retain(|name, _| tracked.contains(name.as_str()));

        let mut failures = Vec::new();
        for job in &jobs {
            if let Err(err) = self.sync_job(job).await {
                warn!(job = %job.name, error = %format!("{err:#}"), "failed to sync job");
                failures.push(format!("{}: {err:#}", job.name));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "failed to sync {} of {} jobs: {}",
                failures.len(),
                jobs.len(),
                failures.join("; ")
            ))
        }
    }

    async fn sync_metrics(&self) {
        let mut counts: HashMap<BuildState, i64> = HashMap::new();
        for observed in self.observed.read().values() {
            *counts.entry(observed.state).or_default() += 1;
        }
        self.metrics.set_job_counts(
            BuildState::ALL
                .iter()
                .map(|state| (state.as_str(), counts.get(state).copied().unwrap_or(0))),
        );
    }
}
