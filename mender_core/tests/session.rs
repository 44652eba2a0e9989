use mender_core::coverage::{CoverageError, CoverageRecord, CoverageTool, LineCounts};
use mender_core::localization::Localization;
use mender_core::environment::{CancelToken, HostEnvironment};
use mender_core::runner::{ObservedResult, TestCase, TestHarness};
use mender_core::scenario::{SchemaKind, Scenario};
use mender_core::search::ExhaustionReason;
use mender_core::session::{SessionController, SessionError, SessionOutcome, Toolchain};
use mender_core::source::{CFamilyAnalyzer, Location};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

const BEACON: &str = "static int healthy_count;

int beacon_update(int latitude)
{
    int status = 0;
    healthy_count++;
    if (latitude == 0) {
        status = 1;
    }
    return status;
}
";

const SQUARE: &str = "QGC WPL 110
0\t1\t0\t16\t0\t0\t0\t0\t-35.363262\t149.165237\t584.0\t1
1\t0\t3\t22\t0\t0\t0\t0\t0\t0\t20\t1
2\t0\t3\t16\t0\t0\t0\t0\t-35.3632\t149.1656\t20\t1
3\t0\t3\t16\t0\t0\t0\t0\t-35.3628\t149.1656\t20\t1
4\t0\t3\t20\t0\t0\t0\t0\t0\t0\t0\t1
";

/// Lines of `BEACON` that carry code.
const CODE_LINES: [u32; 5] = [5, 6, 7, 8, 10];

/// Flies against `build.out`, the "binary" produced by copying the source.
///
/// The attacked test survives only when the latitude fallback on line 8 is
/// gone, or only while it is present when `attack_needs_fallback` is set. The
/// nominal test needs the counter on line 6. Each flight leaves a `trace` of
/// executed lines for [`TraceCoverage`].
#[derive(Default)]
struct FakeHarness {
    attack_is_harmless: bool,
    attack_needs_fallback: bool,
    flights: AtomicUsize,
}

impl TestHarness for FakeHarness {
    fn fly(&self, test: &TestCase, workdir: &Path, _cancel: &CancelToken) -> ObservedResult {
        self.flights.fetch_add(1, Ordering::SeqCst);
        let Ok(program) = std::fs::read_to_string(workdir.join("build.out")) else {
            return ObservedResult::Failure("program was not built".to_string());
        };
        let (success, trace) = if test.attack.is_some() {
            let fallback = program.contains("status = 1;");
            let survives = if self.attack_needs_fallback {
                fallback
            } else {
                self.attack_is_harmless || !fallback
            };
            (survives, "5 6 7 8 10")
        } else {
            (program.contains("healthy_count++;"), "5 6 7 10")
        };
        std::fs::write(workdir.join("trace"), trace).unwrap();
        if success {
            ObservedResult::Success
        } else {
            ObservedResult::Failure("vehicle did not return home".to_string())
        }
    }
}

struct TraceCoverage;

impl CoverageTool for TraceCoverage {
    fn reset(&self, workdir: &Path, _cancel: &CancelToken) -> Result<(), CoverageError> {
        let _ = std::fs::remove_file(workdir.join("trace"));
        Ok(())
    }

    fn extract(
        &self,
        workdir: &Path,
        files: &[String],
        _cancel: &CancelToken,
    ) -> Result<BTreeMap<String, LineCounts>, CoverageError> {
        let trace = std::fs::read_to_string(workdir.join("trace"))?;
        let executed: Vec<u32> = trace.split_whitespace().map(|l| l.parse().unwrap()).collect();
        let counts: LineCounts = CODE_LINES
            .iter()
            .map(|line| (*line, u64::from(executed.contains(line))))
            .collect();
        Ok(files.iter().map(|f| (f.clone(), counts.clone())).collect())
    }
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("program/src")).unwrap();
        std::fs::create_dir_all(dir.path().join("missions")).unwrap();
        std::fs::write(dir.path().join("program/src/beacon.cpp"), BEACON).unwrap();
        std::fs::write(dir.path().join("missions/square.wpl"), SQUARE).unwrap();
        Self { dir }
    }

    fn scenario(&self, build_step: &str, threads: usize, extra: &str) -> Scenario {
        self.scenario_expecting(build_step, threads, extra, "yes")
    }

    fn scenario_expecting(&self, build_step: &str, threads: usize, extra: &str, attacked: &str) -> Scenario {
        let yaml = format!(
            r#"
version: '1.0'
program:
  language: cpp
  source-directory: program
  build-instructions:
    time-limit: 60
    steps:
      - {build_step}
    steps-for-coverage:
      - {build_step}
tests:
  type: sitl
  tests:
    - name: attacked
      mission: missions/square.wpl
      timeout-seconds: 30
      expected-outcome: {attacked}
      attack:
        parameter: BCN_LATITUDE
        value: 0
        waypoint: 3
    - name: nominal
      mission: missions/square.wpl
      timeout-seconds: 30
      expected-outcome: yes
seed: 7
threads: {threads}
localization:
  type: spectrum
  metric: weighted
transformations:
  schemas:
    - type: delete-statement
    - type: replace-statement
    - type: prepend-statement
optimizations:
  ignore-dead-code: yes
  ignore-decls: yes
  use-syntax-scope-checking: yes
{extra}
coverage:
  method:
    type: gcov
    files-to-instrument:
      - src/beacon.cpp
"#
        );
        Scenario::from_yaml_str(&yaml, self.dir.path().to_path_buf()).unwrap()
    }

    fn toolchain(&self, harness: Arc<FakeHarness>) -> Toolchain {
        Toolchain {
            env: Arc::new(HostEnvironment::new(self.dir.path().join("program"))),
            harness,
            coverage_tool: Arc::new(TraceCoverage),
            analyzer: Arc::new(CFamilyAnalyzer),
        }
    }
}

const COPY_BUILD: &str = "cp src/beacon.cpp build.out";

#[test]
fn deleting_the_faulty_line_is_found() {
    let fixture = Fixture::new();
    let scenario = fixture.scenario(COPY_BUILD, 1, "");
    let outcome = SessionController::new(&scenario, fixture.toolchain(Arc::default()))
        .run()
        .unwrap();

    match outcome {
        SessionOutcome::PatchFound { candidate, diff } => {
            assert_eq!(candidate.location, Location::new("src/beacon.cpp", 8));
            assert_eq!(candidate.schema, SchemaKind::DeleteStatement);
            assert!(!candidate.patched.contains("status = 1;"));
            assert!(diff.contains("--- a/src/beacon.cpp"), "{diff}");
            assert!(diff.contains("-        status = 1;"), "{diff}");
        }
        other => panic!("expected a patch, got {other:?}"),
    }

    let source = std::fs::read_to_string(fixture.dir.path().join("program/src/beacon.cpp")).unwrap();
    assert_eq!(source, BEACON, "the program's own source must never be modified");
}

#[test]
fn initial_build_failure_short_circuits() {
    let fixture = Fixture::new();
    let scenario = fixture.scenario("echo broken toolchain >&2; exit 1", 1, "");
    let harness = Arc::new(FakeHarness::default());
    let outcome = SessionController::new(&scenario, fixture.toolchain(harness.clone()))
        .run()
        .unwrap();

    match outcome {
        SessionOutcome::BuildFailure { log } => assert!(log.contains("broken toolchain"), "{log}"),
        other => panic!("expected a build failure, got {other:?}"),
    }
    assert_eq!(harness.flights.load(Ordering::SeqCst), 0, "no test may fly after a failed build");
}

#[test]
fn no_failing_test_is_a_configuration_error() {
    let fixture = Fixture::new();
    let scenario = fixture.scenario(COPY_BUILD, 1, "");
    let harness = Arc::new(FakeHarness {
        attack_is_harmless: true,
        ..FakeHarness::default()
    });
    let err = SessionController::new(&scenario, fixture.toolchain(harness))
        .run()
        .unwrap_err();
    assert!(matches!(err, SessionError::Config(_)), "{err:?}");
    assert!(err.is_config_error());
}

#[test]
fn sequential_sessions_are_deterministic() {
    let fixture = Fixture::new();
    let scenario = fixture.scenario(COPY_BUILD, 1, "");
    let run = || match SessionController::new(&scenario, fixture.toolchain(Arc::default())).run() {
        Ok(SessionOutcome::PatchFound { candidate, diff }) => (candidate, diff),
        other => panic!("expected a patch, got {other:?}"),
    };
    assert_eq!(run(), run());
}

#[test]
fn parallel_session_finds_the_sequential_winner() {
    let fixture = Fixture::new();
    let sequential = fixture.scenario(COPY_BUILD, 1, "");
    let parallel = fixture.scenario(COPY_BUILD, 3, "");
    let winner = |scenario: &Scenario| {
        match SessionController::new(scenario, fixture.toolchain(Arc::default())).run() {
            Ok(SessionOutcome::PatchFound { candidate, .. }) => candidate,
            other => panic!("expected a patch, got {other:?}"),
        }
    };
    assert_eq!(winner(&sequential), winner(&parallel));
}

#[test]
fn zero_candidate_budget_is_exhausted() {
    let fixture = Fixture::new();
    let scenario = fixture.scenario(COPY_BUILD, 1, "resource-limits:\n  candidates: 0");
    let outcome = SessionController::new(&scenario, fixture.toolchain(Arc::default()))
        .run()
        .unwrap();
    assert!(
        matches!(outcome, SessionOutcome::Exhausted(ExhaustionReason::CandidateLimit)),
        "{outcome:?}"
    );
}

#[test]
fn saved_coverage_can_be_reloaded() {
    let fixture = Fixture::new();
    let saved = fixture.dir.path().join("coverage.json");
    let scenario = fixture.scenario(COPY_BUILD, 1, "");
    let first = SessionController::new(&scenario, fixture.toolchain(Arc::default()))
        .save_coverage_to(saved.clone())
        .run()
        .unwrap();

    let record = CoverageRecord::load_from_file(&saved).unwrap();
    assert_eq!(record.tests.len(), 2);
    assert_eq!(record.failing().map(|t| t.test.as_str()).collect::<Vec<_>>(), vec!["attacked"]);

    let mut reloaded = scenario.clone();
    reloaded.coverage.load_from_file = Some(saved);
    let harness = Arc::new(FakeHarness::default());
    let second = SessionController::new(&reloaded, fixture.toolchain(harness.clone()))
        .run()
        .unwrap();

    let candidate = |outcome: SessionOutcome| match outcome {
        SessionOutcome::PatchFound { candidate, .. } => candidate,
        other => panic!("expected a patch, got {other:?}"),
    };
    assert_eq!(candidate(first), candidate(second));
    // Only the winning candidate's two flights; no coverage runs.
    assert_eq!(harness.flights.load(Ordering::SeqCst), 2);
}

#[test]
fn attack_expected_to_fail_is_repaired() {
    let fixture = Fixture::new();
    let saved = fixture.dir.path().join("coverage.json");
    let scenario = fixture.scenario_expecting(COPY_BUILD, 1, "", "no");
    let harness = Arc::new(FakeHarness {
        attack_needs_fallback: true,
        ..FakeHarness::default()
    });
    let outcome = SessionController::new(&scenario, fixture.toolchain(harness))
        .save_coverage_to(saved.clone())
        .run()
        .unwrap();

    match outcome {
        SessionOutcome::PatchFound { candidate, .. } => {
            assert_eq!(candidate.location, Location::new("src/beacon.cpp", 8));
        }
        other => panic!("expected a patch, got {other:?}"),
    }

    let record = CoverageRecord::load_from_file(&saved).unwrap();
    let failing: Vec<&str> = record.failing().map(|t| t.test.as_str()).collect();
    assert_eq!(failing, vec!["attacked"], "the attack succeeding is the failure");
    let localization = Localization::from_coverage(&record, scenario.localization.metric, &[]);
    assert_eq!(
        localization.get(0).map(|r| r.location.clone()),
        Some(Location::new("src/beacon.cpp", 8))
    );
}

#[test]
fn loaded_coverage_honours_file_restriction() {
    let fixture = Fixture::new();
    let saved = fixture.dir.path().join("coverage.json");
    let scenario = fixture.scenario(COPY_BUILD, 1, "");
    SessionController::new(&scenario, fixture.toolchain(Arc::default()))
        .save_coverage_to(saved.clone())
        .run()
        .unwrap();

    // A file the program does not have; indexing it would fail.
    let mut record = CoverageRecord::load_from_file(&saved).unwrap();
    for test in &mut record.tests {
        test.lines
            .insert("src/ghost.cpp".to_string(), LineCounts::from([(1, 1)]));
    }
    record.save_to_file(&saved).unwrap();

    let mut reloaded = scenario.clone();
    reloaded.coverage.load_from_file = Some(saved);
    reloaded.coverage.method.files_to_instrument.clear();
    reloaded.coverage.method.restrict_to_files = vec!["src/beacon.cpp".to_string()];
    let outcome = SessionController::new(&reloaded, fixture.toolchain(Arc::default()))
        .run()
        .unwrap();
    match outcome {
        SessionOutcome::PatchFound { candidate, .. } => {
            assert_eq!(candidate.location, Location::new("src/beacon.cpp", 8));
        }
        other => panic!("expected a patch, got {other:?}"),
    }
}
