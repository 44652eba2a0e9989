use crate::build::{BuildError, BuildManager};
use crate::environment::{CancelToken, CommandStatus, Environment};
use crate::runner::{ObservedResult, TestCase, TestRunner};
use crate::source::Location;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Time allowed for resetting or extracting counters.
const TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-line execution counts of one file.
pub type LineCounts = BTreeMap<u32, u64>;

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Coverage I/O error: {0}")]
    Io(String),

    #[error("Failed to (de)serialize coverage record: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Coverage build failed: {0}")]
    Build(BuildError),

    #[error("Coverage tool failed: {0}")]
    Tool(String),

    #[error("Coverage collection was cancelled")]
    Cancelled,
}

impl From<std::io::Error> for CoverageError {
    fn from(err: std::io::Error) -> Self {
        CoverageError::Io(err.to_string())
    }
}

/// Coverage of one test on the unmodified program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestCoverage {
    pub test: String,
    pub observed_success: bool,
    pub expected_success: bool,
    /// file -> line -> execution count. Non-executable lines are absent.
    pub lines: BTreeMap<String, LineCounts>,
}

impl TestCoverage {
    /// A test is failing when the unmodified program does not meet its expectation.
    pub fn is_failing(&self) -> bool {
        self.observed_success != self.expected_success
    }

    pub fn executed(&self, location: &Location) -> bool {
        self.lines
            .get(&location.file)
            .and_then(|counts| counts.get(&location.line))
            .is_some_and(|&count| count > 0)
    }
}

/// Per-test line coverage plus each test's outcome on the unmodified program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CoverageRecord {
    pub tests: Vec<TestCoverage>,
}

impl CoverageRecord {
    pub fn load_from_file(path: &Path) -> Result<Self, CoverageError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoverageError::Io(format!("{path:?}: {e}")))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), CoverageError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| CoverageError::Io(format!("{path:?}: {e}")))?;
        Ok(())
    }

    /// Drops every file not in `files`. An empty list keeps everything.
    pub fn restrict_to(&mut self, files: &[String]) {
        if files.is_empty() {
            return;
        }
        let keep: HashSet<&str> = files.iter().map(String::as_str).collect();
        for test in &mut self.tests {
            test.lines.retain(|file, _| keep.contains(file.as_str()));
        }
    }

    pub fn failing(&self) -> impl Iterator<Item = &TestCoverage> {
        self.tests.iter().filter(|t| t.is_failing())
    }

    pub fn passing(&self) -> impl Iterator<Item = &TestCoverage> {
        self.tests.iter().filter(|t| !t.is_failing())
    }

    pub fn has_failing_test(&self) -> bool {
        self.failing().next().is_some()
    }

    /// Whether any test executed `location`.
    pub fn executed_by_any(&self, location: &Location) -> bool {
        self.tests.iter().any(|t| t.executed(location))
    }

    /// Every line that appears in the record, executed or not.
    pub fn locations(&self) -> BTreeSet<Location> {
        self.tests
            .iter()
            .flat_map(|t| {
                t.lines.iter().flat_map(|(file, counts)| {
                    counts.keys().map(move |&line| Location::new(file.clone(), line))
                })
            })
            .collect()
    }

    pub fn files(&self) -> BTreeSet<String> {
        self.tests
            .iter()
            .flat_map(|t| t.lines.keys().cloned())
            .collect()
    }
}

/// Resets and reads the instrumentation counters of a built program.
pub trait CoverageTool: Send + Sync {
    fn reset(&self, workdir: &Path, cancel: &CancelToken) -> Result<(), CoverageError>;

    fn extract(
        &self,
        workdir: &Path,
        files: &[String],
        cancel: &CancelToken,
    ) -> Result<BTreeMap<String, LineCounts>, CoverageError>;
}

/// Reads `gcov` counters.
pub struct GcovTool {
    env: Arc<dyn Environment>,
    object_directory: Option<String>,
}

impl GcovTool {
    pub fn new(env: Arc<dyn Environment>, object_directory: Option<String>) -> Self {
        Self {
            env,
            object_directory,
        }
    }

    fn run(&self, command: &str, workdir: &Path, cancel: &CancelToken) -> Result<String, CoverageError> {
        let output = self
            .env
            .execute(command, workdir, TOOL_TIMEOUT, cancel)
            .map_err(|e| CoverageError::Tool(e.to_string()))?;
        match output.status {
            CommandStatus::Exited(0) => Ok(output.stdout),
            CommandStatus::Cancelled => Err(CoverageError::Cancelled),
            status => Err(CoverageError::Tool(format!(
                "'{command}' ended with {status:?}: {}",
                output.stderr.trim()
            ))),
        }
    }
}

impl CoverageTool for GcovTool {
    fn reset(&self, workdir: &Path, cancel: &CancelToken) -> Result<(), CoverageError> {
        self.run("find . -name '*.gcda' -type f -delete", workdir, cancel)?;
        Ok(())
    }

    fn extract(
        &self,
        workdir: &Path,
        files: &[String],
        cancel: &CancelToken,
    ) -> Result<BTreeMap<String, LineCounts>, CoverageError> {
        let mut coverage = BTreeMap::new();
        for file in files {
            let mut command = String::from("gcov --stdout");
            if let Some(dir) = &self.object_directory {
                command.push_str(&format!(" --object-directory {dir}"));
            }
            command.push_str(&format!(" {file}"));
            let text = self.run(&command, workdir, cancel)?;
            coverage.insert(file.clone(), parse_gcov(&text, file));
        }
        Ok(coverage)
    }
}

fn same_source(section: &str, file: &str) -> bool {
    section == file
        || section.ends_with(&format!("/{file}"))
        || file.ends_with(&format!("/{section}"))
}

/// Parses gcov's text format (`count:line:source`) for `file`.
///
/// Output may hold several `Source:` sections (headers are reported too); only
/// the one naming `file` is read. `#####` and `=====` mark executable lines that
/// never ran, `-` marks non-executable lines, and a trailing `*` flags lines
/// with unexecuted blocks.
pub fn parse_gcov(text: &str, file: &str) -> LineCounts {
    let mut counts = LineCounts::new();
    let mut in_target = true;
    for raw in text.lines() {
        let mut fields = raw.splitn(3, ':');
        let (Some(count), Some(line), rest) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        let Ok(line) = line.trim().parse::<u32>() else {
            continue;
        };
        if line == 0 {
            if let Some(source) = rest.and_then(|r| r.strip_prefix("Source:")) {
                in_target = same_source(source.trim(), file);
            }
            continue;
        }
        if !in_target {
            continue;
        }

        let count = count.trim().trim_end_matches('*');
        let hits = match count {
            "-" => continue,
            "#####" | "=====" => 0,
            n => match n.parse::<u64>() {
                Ok(hits) => hits,
                Err(_) => continue,
            },
        };
        *counts.entry(line).or_insert(0) += hits;
    }
    counts
}

/// Builds an instrumented program once and runs every test against it.
pub struct CoverageCollector {
    env: Arc<dyn Environment>,
    tool: Arc<dyn CoverageTool>,
    runner: TestRunner,
    build: BuildManager,
}

impl CoverageCollector {
    pub fn new(
        env: Arc<dyn Environment>,
        tool: Arc<dyn CoverageTool>,
        runner: TestRunner,
        build: BuildManager,
    ) -> Self {
        Self {
            env,
            tool,
            runner,
            build,
        }
    }

    /// Runs `steps` in `workdir`, then for each test resets the counters, runs
    /// the test and extracts counts for `instrument_files`. Files outside
    /// `restrict_files` are discarded (an empty list keeps all).
    pub fn collect(
        &self,
        workdir: &Path,
        steps: &[String],
        tests: &[TestCase],
        instrument_files: &[String],
        restrict_files: &[String],
        cancel: &CancelToken,
    ) -> Result<CoverageRecord, CoverageError> {
        info!("building instrumented program for coverage");
        let build = self.build.build(self.env.as_ref(), steps, workdir, cancel);
        if let Some(failure) = build.failure {
            debug!("coverage build log:\n{}", build.log);
            return Err(CoverageError::Build(failure));
        }

        let mut record = CoverageRecord::default();
        for test in tests {
            if cancel.is_cancelled() {
                return Err(CoverageError::Cancelled);
            }
            self.tool.reset(workdir, cancel)?;
            let outcome = self.runner.run(test, workdir, cancel);
            if outcome.observed == ObservedResult::Cancelled {
                return Err(CoverageError::Cancelled);
            }
            let lines = self.tool.extract(workdir, instrument_files, cancel)?;
            let executed: usize = lines
                .values()
                .map(|counts| counts.values().filter(|&&c| c > 0).count())
                .sum();
            info!(
                "coverage for test '{}': {} (expected {}), {executed} lines executed",
                test.name,
                if outcome.observed.is_success() { "success" } else { "failure" },
                if test.expected_outcome { "success" } else { "failure" },
            );
            record.tests.push(TestCoverage {
                test: test.name.clone(),
                observed_success: outcome.observed.is_success(),
                expected_success: test.expected_outcome,
                lines,
            });
        }

        record.restrict_to(restrict_files);
        Ok(record)
    }
}
