//! ---
//! bs_section: "05-networking-external-interfaces"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Build backend data model."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies one build of one job. Job names may be folder paths (`team/unit`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildRef {
    pub job: String,
    pub number: u64,
}

impl BuildRef {
    pub fn new(job: impl Into<String>, number: u64) -> Self {
        Self {
            job: job.into(),
            number,
        }
    }

    /// Parse a console log path of the form
    /// `/job/<name>[/job/<name>...]/<number>/consoleText`.
    pub fn from_log_path(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let (tail, rest) = segments.split_last()?;
        if *tail != "consoleText" {
            return None;
        }
        let (number, job_segments) = rest.split_last()?;
        let number = number.parse::<u64>().ok()?;
        if job_segments.is_empty() || job_segments.len() % 2 != 0 {
            return None;
        }
        let mut names = Vec::with_capacity(job_segments.len() / 2);
        for pair in job_segments.chunks(2) {
            if pair[0] != "job" || pair[1].is_empty() {
                return None;
            }
            names.push(pair[1]);
        }
        Some(Self::new(names.join("/"), number))
    }

    /// URL path segments for this build's console log.
    pub fn log_segments(&self) -> Vec<String> {
        let mut segments = job_segments(&self.job);
        segments.push(self.number.to_string());
        segments.push("consoleText".to_owned());
        segments
    }
}

impl fmt::Display for BuildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.number)
    }
}

/// `team/unit` becomes `job/team/job/unit`.
pub(crate) fn job_segments(job: &str) -> Vec<String> {
    job.split('/')
        .filter(|part| !part.is_empty())
        .flat_map(|part| ["job".to_owned(), part.to_owned()])
        .collect()
}

/// Coarse lifecycle state of a build as seen by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Pending,
    Running,
    Success,
    Failure,
    Aborted,
    Unknown,
}

impl BuildState {
    pub const ALL: [BuildState; 6] = [
        BuildState::Pending,
        BuildState::Running,
        BuildState::Success,
        BuildState::Failure,
        BuildState::Aborted,
        BuildState::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Running => "running",
            BuildState::Success => "success",
            BuildState::Failure => "failure",
            BuildState::Aborted => "aborted",
            BuildState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subset of the backend's build document the operator reads.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Build {
    pub number: u64,
    #[serde(default)]
    pub building: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub actions: Vec<BuildAction>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct BuildAction {
    #[serde(default)]
    pub parameters: Vec<BuildParameter>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BuildParameter {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

impl Build {
    pub fn state(&self) -> BuildState {
        if self.building {
            return BuildState::Running;
        }
        match self.result.as_deref() {
            None => BuildState::Pending,
            Some("SUCCESS") => BuildState::Success,
            Some("FAILURE") | Some("UNSTABLE") => BuildState::Failure,
            Some("ABORTED") | Some("NOT_BUILT") => BuildState::Aborted,
            Some(_) => BuildState::Unknown,
        }
    }

    /// String value of the named build parameter, if present.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.actions
            .iter()
            .flat_map(|action| action.parameters.iter())
            .find(|param| param.name == name)
            .and_then(|param| match &param.value {
                Value::String(value) => Some(value.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
    }
}
