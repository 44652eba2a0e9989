use crate::environment::{CancelToken, CommandStatus, Environment};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Why a build did not produce a usable program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("Build step '{step}' failed with exit code {exit_code:?}")]
    StepFailed { step: String, exit_code: Option<i32> },

    #[error("Build timed out during step '{step}'")]
    Timeout { step: String },

    #[error("Build was cancelled")]
    Cancelled,

    #[error("Build environment error: {0}")]
    Environment(String),
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub success: bool,
    pub failure: Option<BuildError>,
    /// Combined stdout/stderr of every step that ran.
    pub log: String,
    pub duration: Duration,
}

/// Runs build steps sequentially within an overall time budget.
#[derive(Debug, Clone)]
pub struct BuildManager {
    time_limit: Duration,
}

impl BuildManager {
    pub fn new(time_limit: Duration) -> Self {
        Self { time_limit }
    }

    pub fn build(
        &self,
        env: &dyn Environment,
        steps: &[String],
        workdir: &Path,
        cancel: &CancelToken,
    ) -> BuildResult {
        let start_time = Instant::now();
        let mut log = String::new();

        let finish = |log: String, failure: Option<BuildError>| BuildResult {
            success: failure.is_none(),
            failure,
            log,
            duration: start_time.elapsed(),
        };

        for step in steps {
            if cancel.is_cancelled() {
                return finish(log, Some(BuildError::Cancelled));
            }
            let remaining = self.time_limit.saturating_sub(start_time.elapsed());
            if remaining.is_zero() {
                return finish(log, Some(BuildError::Timeout { step: step.clone() }));
            }

            debug!("build step '{step}' in {workdir:?} ({remaining:?} left)");
            let output = match env.execute(step, workdir, remaining, cancel) {
                Ok(output) => output,
                Err(e) => return finish(log, Some(BuildError::Environment(e.to_string()))),
            };
            log.push_str(&format!("$ {step}\n"));
            log.push_str(&output.stdout);
            log.push_str(&output.stderr);

            let failure = match output.status {
                CommandStatus::Exited(0) => None,
                CommandStatus::Exited(code) => Some(BuildError::StepFailed {
                    step: step.clone(),
                    exit_code: Some(code),
                }),
                CommandStatus::Signaled => Some(BuildError::StepFailed {
                    step: step.clone(),
                    exit_code: None,
                }),
                CommandStatus::TimedOut => Some(BuildError::Timeout { step: step.clone() }),
                CommandStatus::Cancelled => Some(BuildError::Cancelled),
            };
            if failure.is_some() {
                return finish(log, failure);
            }
        }

        finish(log, None)
    }
}
