use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// The only scenario format version this crate understands.
pub const SUPPORTED_VERSION: &str = "1.0";

/// Defines errors that can arise while loading or validating a scenario.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// The scenario file could not be read.
    #[error("Failed to read scenario file at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML or does not match the scenario schema
    /// (unknown keys, unknown schema types, wrong value types).
    #[error("Failed to parse scenario: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The document parsed but is self-contradictory or incomplete.
    #[error("Invalid scenario: {0}")]
    Invalid(String),
}

/// Accepts `yes`/`no`/`on`/`off` as well as YAML booleans.
///
/// `serde_yaml` follows YAML 1.2, where `yes` is a plain string, while scenario
/// files conventionally spell flags that way.
fn yes_no<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Text(text) => match text.to_ascii_lowercase().as_str() {
            "yes" | "y" | "on" | "true" => Ok(true),
            "no" | "n" | "off" | "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected one of yes/no/true/false, found '{other}'"
            ))),
        },
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Language {
    C,
    #[default]
    #[serde(alias = "c++")]
    Cpp,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BuildInstructions {
    /// Overall budget, in seconds, for one build (all steps together).
    #[serde(default = "default_build_time_limit")]
    pub time_limit: u64,
    pub steps: Vec<String>,
    #[serde(default)]
    pub steps_for_coverage: Vec<String>,
}

fn default_build_time_limit() -> u64 {
    300
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProgramSettings {
    #[serde(default)]
    pub language: Language,
    /// Container image holding the program. When absent, `source_directory`
    /// is a directory on the host and commands run in a host shell.
    #[serde(default)]
    pub image: Option<String>,
    pub source_directory: PathBuf,
    pub build_instructions: BuildInstructions,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TestSuiteType {
    #[serde(alias = "start")]
    Sitl,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Vehicle {
    #[default]
    Copter,
    Rover,
    Plane,
}

impl Vehicle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vehicle::Copter => "copter",
            Vehicle::Rover => "rover",
            Vehicle::Plane => "plane",
        }
    }

    /// Location of the SITL binary for this vehicle inside the program image.
    pub fn sitl_binary(&self) -> &'static str {
        match self {
            Vehicle::Copter => "/opt/ardupilot/build/sitl/bin/arducopter",
            Vehicle::Rover => "/opt/ardupilot/build/sitl/bin/ardurover",
            Vehicle::Plane => "/opt/ardupilot/build/sitl/bin/arduplane",
        }
    }
}

/// A fault injected during flight: `parameter` is overwritten with `value`
/// once the vehicle's next-waypoint index reaches `waypoint`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AttackSpec {
    pub parameter: String,
    pub value: f64,
    pub waypoint: u32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TestCaseSpec {
    pub name: String,
    /// Mission file, relative to the scenario file unless absolute.
    pub mission: PathBuf,
    /// Parameter defaults file, an absolute path inside the program environment.
    #[serde(default = "default_parameters")]
    pub parameters: String,
    #[serde(default = "default_speedup")]
    pub speedup: u32,
    pub timeout_seconds: u64,
    /// Whether the mission is expected to succeed.
    #[serde(deserialize_with = "yes_no")]
    pub expected_outcome: bool,
    #[serde(default)]
    pub attack: Option<AttackSpec>,
}

pub fn default_parameters() -> String {
    "/opt/ardupilot/copter.parm".to_string()
}

fn default_speedup() -> u32 {
    1
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TestSuiteSettings {
    #[serde(rename = "type")]
    pub suite_type: TestSuiteType,
    #[serde(default)]
    pub vehicle: Vehicle,
    /// Command that flies a mission against a running SITL and prints a flight report.
    #[serde(default = "default_harness")]
    pub harness: String,
    pub tests: Vec<TestCaseSpec>,
}

pub fn default_harness() -> String {
    "mender-fly".to_string()
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LocalizationType {
    Spectrum,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SpectrumMetric {
    #[default]
    Weighted,
    Ochiai,
    Tarantula,
    Jaccard,
    Genprog,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LocalizationSettings {
    #[serde(rename = "type")]
    pub localization_type: LocalizationType,
    #[serde(default)]
    pub metric: SpectrumMetric,
    #[serde(default)]
    pub restrict_to_files: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AlgorithmType {
    #[default]
    Exhaustive,
    Random,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AlgorithmSettings {
    #[serde(rename = "type")]
    pub algorithm_type: AlgorithmType,
    /// Number of consecutive candidates shuffled together by the random algorithm.
    #[serde(default = "default_window")]
    pub window: usize,
}

fn default_window() -> usize {
    64
}

impl Default for AlgorithmSettings {
    fn default() -> Self {
        Self {
            algorithm_type: AlgorithmType::Exhaustive,
            window: default_window(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaKind {
    DeleteStatement,
    ReplaceStatement,
    PrependStatement,
}

impl SchemaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaKind::DeleteStatement => "delete-statement",
            SchemaKind::ReplaceStatement => "replace-statement",
            SchemaKind::PrependStatement => "prepend-statement",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SchemaSpec {
    #[serde(rename = "type")]
    pub kind: SchemaKind,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TransformationSettings {
    pub schemas: Vec<SchemaSpec>,
}

/// Search-space pruning switches. Every flag defaults to off.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Optimizations {
    #[serde(default, deserialize_with = "yes_no")]
    pub ignore_equivalent_prepends: bool,
    #[serde(default, deserialize_with = "yes_no")]
    pub ignore_dead_code: bool,
    #[serde(default, deserialize_with = "yes_no")]
    pub ignore_string_equivalent_snippets: bool,
    #[serde(default, deserialize_with = "yes_no")]
    pub ignore_untyped_returns: bool,
    #[serde(default, deserialize_with = "yes_no")]
    pub ignore_decls: bool,
    #[serde(default, deserialize_with = "yes_no")]
    pub use_scope_checking: bool,
    #[serde(default, deserialize_with = "yes_no")]
    pub use_syntax_scope_checking: bool,
    #[serde(default, deserialize_with = "yes_no")]
    pub only_insert_executed_code: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    #[serde(default)]
    pub candidates: Option<u64>,
    #[serde(default)]
    pub time_minutes: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageMethodType {
    Gcov,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageMethod {
    #[serde(rename = "type")]
    pub method_type: CoverageMethodType,
    #[serde(default)]
    pub files_to_instrument: Vec<String>,
    #[serde(default)]
    pub restrict_to_files: Vec<String>,
    /// Where the instrumented object files live, relative to the source root.
    #[serde(default)]
    pub object_directory: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    pub method: CoverageMethod,
    #[serde(default)]
    pub load_from_file: Option<PathBuf>,
}

impl CoverageSettings {
    /// Files whose coverage is retained: instrumented files, narrowed to
    /// `restrict-to-files` when that list is non-empty. Without instrumented
    /// files (loaded coverage) the restriction list alone applies.
    pub fn retained_files(&self) -> Vec<String> {
        if self.method.files_to_instrument.is_empty() {
            return self.method.restrict_to_files.clone();
        }
        let restrict: HashSet<&str> = self
            .method
            .restrict_to_files
            .iter()
            .map(String::as_str)
            .collect();
        self.method
            .files_to_instrument
            .iter()
            .filter(|f| restrict.is_empty() || restrict.contains(f.as_str()))
            .cloned()
            .collect()
    }
}

/// An immutable repair scenario.
///
/// Loaded once per session and shared by reference with every component.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub version: String,
    pub program: ProgramSettings,
    pub tests: TestSuiteSettings,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_threads")]
    pub threads: usize,
    pub localization: LocalizationSettings,
    #[serde(default)]
    pub algorithm: AlgorithmSettings,
    pub transformations: TransformationSettings,
    #[serde(default)]
    pub optimizations: Optimizations,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    pub coverage: CoverageSettings,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

pub fn default_threads() -> usize {
    1
}

impl Scenario {
    pub fn load_from_file(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml_str(&content, base_dir)
    }

    pub fn from_yaml_str(content: &str, base_dir: PathBuf) -> Result<Self, ScenarioError> {
        let mut scenario: Scenario = serde_yaml::from_str(content)?;
        scenario.base_dir = base_dir;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Checks the invariants serde cannot express. Called by the loaders and
    /// again by callers that modify a scenario (e.g. CLI overrides).
    pub fn validate(&self) -> Result<(), ScenarioError> {
        let invalid = |msg: String| Err(ScenarioError::Invalid(msg));

        if self.version != SUPPORTED_VERSION {
            return invalid(format!(
                "unsupported version '{}', expected '{SUPPORTED_VERSION}'",
                self.version
            ));
        }
        if self.threads == 0 {
            return invalid("'threads' must be at least 1".to_string());
        }
        if self.program.build_instructions.steps.is_empty() {
            return invalid("'program.build-instructions.steps' must not be empty".to_string());
        }
        if self.program.build_instructions.time_limit == 0 {
            return invalid("'program.build-instructions.time-limit' must be positive".to_string());
        }
        if self.tests.tests.is_empty() {
            return invalid("test suite must contain at least one test".to_string());
        }

        let mut names = HashSet::new();
        for test in &self.tests.tests {
            if !names.insert(test.name.as_str()) {
                return invalid(format!("duplicate test name '{}'", test.name));
            }
            if test.timeout_seconds == 0 {
                return invalid(format!("test '{}': 'timeout-seconds' must be positive", test.name));
            }
            if test.speedup == 0 {
                return invalid(format!("test '{}': 'speedup' must be at least 1", test.name));
            }
            if !test.parameters.starts_with('/') {
                return invalid(format!(
                    "test '{}': 'parameters' filename must be given as an absolute path",
                    test.name
                ));
            }
        }

        if self.transformations.schemas.is_empty() {
            return invalid("'transformations.schemas' must not be empty".to_string());
        }
        let mut schemas = HashSet::new();
        for schema in &self.transformations.schemas {
            if !schemas.insert(schema.kind) {
                return invalid(format!("schema '{}' listed twice", schema.kind.as_str()));
            }
        }

        if self.algorithm.window == 0 {
            return invalid("'algorithm.window' must be at least 1".to_string());
        }

        if self.coverage.load_from_file.is_none() {
            if self.coverage.method.files_to_instrument.is_empty() {
                return invalid(
                    "'coverage.method.files-to-instrument' must not be empty".to_string(),
                );
            }
            if self.program.build_instructions.steps_for_coverage.is_empty() {
                return invalid(
                    "'program.build-instructions.steps-for-coverage' must not be empty when coverage is collected"
                        .to_string(),
                );
            }
            if self.coverage.retained_files().is_empty() {
                return invalid(
                    "no instrumented file survives 'coverage.method.restrict-to-files'".to_string(),
                );
            }
        }

        Ok(())
    }

    /// Resolves `path` against the scenario's directory unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn schemas(&self) -> Vec<SchemaKind> {
        self.transformations.schemas.iter().map(|s| s.kind).collect()
    }

    pub fn build_time_limit(&self) -> Duration {
        Duration::from_secs(self.program.build_instructions.time_limit)
    }

    pub fn search_time_limit(&self) -> Option<Duration> {
        self.resource_limits
            .time_minutes
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
    }
}
