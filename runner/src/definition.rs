use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum JobFileError {
    #[error("Failed to read job file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse job file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("No jobs found in job file {0:?}")]
    NoJobs(PathBuf),
}

/// One job invocation: which job type to run and with which raw parameters
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobDefinition {
    #[serde(alias = "display")]
    pub display_name: String,
    #[serde(alias = "job")]
    pub job_name: String,
    #[serde(default, alias = "params")]
    pub parameters: BTreeMap<String, Value>,
}

impl JobDefinition {
    pub fn new(display_name: &str, job_name: &str) -> Self {
        Self {
            display_name: display_name.to_owned(),
            job_name: job_name.to_owned(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_owned(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }
}

#[derive(Deserialize, Debug)]
struct JobFile {
    jobs: Option<Vec<JobDefinition>>,
}

/// parse the contents of a job file, `origin` is only used for errors
pub fn parse_job_file(contents: &str, origin: &Path) -> Result<Vec<JobDefinition>, JobFileError> {
    let file: JobFile = serde_yaml::from_str(contents).map_err(|source| JobFileError::Parse {
        path: origin.to_path_buf(),
        source,
    })?;

    file.jobs
        .ok_or_else(|| JobFileError::NoJobs(origin.to_path_buf()))
}

pub fn load_job_file(path: &Path) -> Result<Vec<JobDefinition>, JobFileError> {
    let contents = fs::read_to_string(path).map_err(|source| JobFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let jobs = parse_job_file(&contents, path)?;

    debug!("Loaded {} job definitions from {}", jobs.len(), path.display());

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_and_short_keys() {
        let jobs = parse_job_file(
            r#"
jobs:
  - display_name: batch1
    job_name: resize
    parameters:
      width: "256"
      paths: [a.jpg, b.jpg]
  - display: batch2
    job: resize
    params:
      width: 128
"#,
            Path::new("jobs.yaml"),
        )
        .unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].display_name, "batch1");
        assert_eq!(jobs[0].get("width"), Some(&Value::from("256")));
        assert_eq!(
            jobs[1],
            JobDefinition::new("batch2", "resize").parameter("width", 128)
        );
    }

    #[test]
    fn missing_jobs_key_is_an_error() {
        let error = parse_job_file("name: nothing\n", Path::new("empty.yaml"));

        assert!(matches!(error, Err(JobFileError::NoJobs(_))));
    }

    #[test]
    fn unknown_entry_fields_are_rejected() {
        let error = parse_job_file(
            "jobs:\n  - display_name: a\n    job_name: b\n    colour: red\n",
            Path::new("typo.yaml"),
        );

        assert!(matches!(error, Err(JobFileError::Parse { .. })));
    }

    #[test]
    fn missing_file_reports_path() {
        let error = load_job_file(Path::new("/nonexistent/jobs.yaml")).unwrap_err();

        assert!(error.to_string().contains("/nonexistent/jobs.yaml"));
    }
}
