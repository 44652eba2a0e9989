use crate::build::BuildManager;
use crate::coverage::{CoverageCollector, CoverageError, CoverageRecord, CoverageTool, GcovTool};
use crate::environment::{CancelToken, ContainerEnvironment, Environment, EnvironmentError, HostEnvironment, ScratchArena};
use crate::localization::Localization;
use crate::mission::MissionError;
use crate::mutator::{Candidate, MutationGenerator};
use crate::oracle::WaypointHomeOracle;
use crate::runner::{SitlHarness, TestCase, TestHarness, TestRunner};
use crate::scenario::{CoverageMethodType, Language, Scenario, ScenarioError};
use crate::search::{ExhaustionReason, ProgramEvaluator, SearchController, SearchLimits, SearchOutcome};
use crate::source::{CFamilyAnalyzer, SourceAnalyzer, SourceError, SourceIndex};
use similar::TextDiff;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that end a session before a search outcome exists.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load mission: {0}")]
    Mission(#[from] MissionError),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("Coverage error: {0}")]
    Coverage(#[from] CoverageError),

    #[error("Source analysis error: {0}")]
    Source(#[from] SourceError),
}

impl SessionError {
    /// Whether the scenario itself is at fault, as opposed to the infrastructure.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SessionError::Scenario(_) | SessionError::Config(_) | SessionError::Mission(_)
        )
    }
}

#[derive(Debug, Clone)]
pub enum SessionOutcome {
    PatchFound { candidate: Candidate, diff: String },
    Exhausted(ExhaustionReason),
    BuildFailure { log: String },
}

/// The concrete capabilities a session runs with.
pub struct Toolchain {
    pub env: Arc<dyn Environment>,
    pub harness: Arc<dyn TestHarness>,
    pub coverage_tool: Arc<dyn CoverageTool>,
    pub analyzer: Arc<dyn SourceAnalyzer>,
}

impl Toolchain {
    /// Selects capabilities from the scenario: a container when `program.image`
    /// is set (a host shell otherwise), the SITL harness, and the configured
    /// coverage method.
    pub fn from_scenario(scenario: &Scenario) -> Self {
        let program = &scenario.program;
        let env: Arc<dyn Environment> = match &program.image {
            Some(image) => Arc::new(ContainerEnvironment::new(
                image.clone(),
                program.source_directory.to_string_lossy().into_owned(),
            )),
            None => Arc::new(HostEnvironment::new(scenario.resolve(&program.source_directory))),
        };

        let harness = Arc::new(SitlHarness::new(
            env.clone(),
            scenario.tests.vehicle,
            scenario.tests.harness.clone(),
            Arc::new(WaypointHomeOracle::new()),
        ));

        let method = &scenario.coverage.method;
        let coverage_tool: Arc<dyn CoverageTool> = match method.method_type {
            CoverageMethodType::Gcov => {
                Arc::new(GcovTool::new(env.clone(), method.object_directory.clone()))
            }
        };

        let analyzer: Arc<dyn SourceAnalyzer> = match program.language {
            Language::C | Language::Cpp => Arc::new(CFamilyAnalyzer),
        };

        Self {
            env,
            harness,
            coverage_tool,
            analyzer,
        }
    }
}

/// Drives one repair session from the initial build to a final outcome.
pub struct SessionController<'s> {
    scenario: &'s Scenario,
    toolchain: Toolchain,
    save_coverage: Option<PathBuf>,
    cancel: CancelToken,
}

impl<'s> SessionController<'s> {
    pub fn new(scenario: &'s Scenario, toolchain: Toolchain) -> Self {
        Self {
            scenario,
            toolchain,
            save_coverage: None,
            cancel: CancelToken::new(),
        }
    }

    /// Writes freshly collected coverage to `path`.
    pub fn save_coverage_to(mut self, path: PathBuf) -> Self {
        self.save_coverage = Some(path);
        self
    }

    /// Token that stops the session when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(&self) -> Result<SessionOutcome, SessionError> {
        let scenario = self.scenario;
        let env = self.toolchain.env.as_ref();
        scenario.validate()?;
        let tests = TestCase::load_suite(scenario)?;
        info!(
            "session: {} test(s), {} thread(s), environment {}",
            tests.len(),
            scenario.threads,
            env.name()
        );

        let mut arena = ScratchArena::new(env)?;
        for _ in 0..scenario.threads {
            arena.add_slot()?;
        }
        let build = BuildManager::new(scenario.build_time_limit());
        let steps = &scenario.program.build_instructions.steps;

        let Some(first_slot) = arena.slot(0) else {
            return Err(EnvironmentError::Io("no scratch slot for the initial build".to_string()).into());
        };
        info!("building unmodified program");
        let initial = build.build(env, steps, first_slot, &self.cancel);
        if let Some(failure) = &initial.failure {
            warn!("initial build failed: {failure}");
            return Ok(SessionOutcome::BuildFailure { log: initial.log });
        }
        info!("initial build succeeded in {:?}", initial.duration);

        let runner = TestRunner::new(self.toolchain.harness.clone());
        let coverage = self.coverage(&mut arena, &runner, &build, &tests)?;
        if !coverage.has_failing_test() {
            return Err(SessionError::Config(
                "no test fails on the unmodified program, nothing to localize against".to_string(),
            ));
        }

        let index = SourceIndex::build(
            self.toolchain.analyzer.as_ref(),
            arena.pristine(),
            coverage.files(),
        )?;
        let localization = Localization::from_coverage(
            &coverage,
            scenario.localization.metric,
            &scenario.localization.restrict_to_files,
        );
        info!("localized {} suspicious location(s)", localization.len());

        let generator = MutationGenerator::new(
            &localization,
            &index,
            &coverage,
            scenario.schemas(),
            scenario.optimizations.clone(),
        );
        debug!("snippet database holds {} statement(s)", generator.snippets().len());

        let evaluator = ProgramEvaluator {
            env,
            arena: &arena,
            build: &build,
            steps,
            runner: &runner,
            tests: &tests,
        };
        let limits = SearchLimits {
            candidates: scenario.resource_limits.candidates,
            time: scenario.search_time_limit(),
        };
        let search = SearchController::new(
            scenario.threads,
            limits,
            scenario.algorithm.clone(),
            scenario.seed,
        );
        let report = search.run(generator.candidates(), &evaluator, &self.cancel);

        match report.outcome {
            SearchOutcome::Found(evaluation) => {
                let candidate = evaluation.candidate;
                let original = arena.read_pristine(&candidate.location.file)?;
                let diff = unified_diff(&candidate.location.file, &original, &candidate.patched);
                info!("patch found: {candidate}");
                Ok(SessionOutcome::PatchFound { candidate, diff })
            }
            SearchOutcome::Exhausted(reason) => {
                info!("no patch found: {reason}");
                Ok(SessionOutcome::Exhausted(reason))
            }
        }
    }

    fn coverage(
        &self,
        arena: &mut ScratchArena,
        runner: &TestRunner,
        build: &BuildManager,
        tests: &[TestCase],
    ) -> Result<CoverageRecord, SessionError> {
        let settings = &self.scenario.coverage;
        let retained = settings.retained_files();

        if let Some(path) = &settings.load_from_file {
            let path = self.scenario.resolve(path);
            info!("loading coverage from {path:?}");
            let mut record = CoverageRecord::load_from_file(&path)?;
            record.restrict_to(&retained);
            return Ok(record);
        }

        let slot = arena.add_slot()?;
        let Some(workdir) = arena.slot(slot) else {
            return Err(EnvironmentError::Io(format!("no scratch slot {slot}")).into());
        };
        let collector = CoverageCollector::new(
            self.toolchain.env.clone(),
            self.toolchain.coverage_tool.clone(),
            runner.clone(),
            build.clone(),
        );
        let record = collector.collect(
            workdir,
            &self.scenario.program.build_instructions.steps_for_coverage,
            tests,
            &settings.method.files_to_instrument,
            &settings.method.restrict_to_files,
            &self.cancel,
        )?;

        if let Some(path) = &self.save_coverage {
            record.save_to_file(path)?;
            info!("saved coverage to {path:?}");
        }
        Ok(record)
    }
}

/// Unified diff of one file with three lines of context.
pub fn unified_diff(file: &str, original: &str, patched: &str) -> String {
    TextDiff::from_lines(original, patched)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{file}"), &format!("b/{file}"))
        .to_string()
}
