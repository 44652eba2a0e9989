use crate::environment::{CancelToken, CommandStatus, Environment};
use crate::mission::{Attack, Mission, MissionError};
use crate::oracle::{FlightReport, MissionVerdict, Oracle};
use crate::scenario::{Scenario, TestCaseSpec, Vehicle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// First MAVLink UDP port handed out to simulations.
pub const MAVLINK_PORT_START: u16 = 13000;
/// One past the last MAVLink UDP port handed out to simulations.
pub const MAVLINK_PORT_END: u16 = 13500;
/// Where missions are staged inside the source tree.
pub const MISSION_STAGING_DIR: &str = ".mender/missions";

/// A simulation test case with its mission loaded.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub name: String,
    pub mission: Arc<Mission>,
    pub parameters: String,
    pub speedup: u32,
    pub timeout: Duration,
    pub expected_outcome: bool,
    pub attack: Option<Attack>,
}

impl TestCase {
    pub fn from_spec(spec: &TestCaseSpec, mission: Arc<Mission>) -> Self {
        Self {
            name: spec.name.clone(),
            mission,
            parameters: spec.parameters.clone(),
            speedup: spec.speedup,
            timeout: Duration::from_secs(spec.timeout_seconds),
            expected_outcome: spec.expected_outcome,
            attack: spec.attack.as_ref().map(Attack::from),
        }
    }

    /// Loads every test of the scenario, reading each distinct mission file once.
    pub fn load_suite(scenario: &Scenario) -> Result<Vec<TestCase>, MissionError> {
        let mut missions: HashMap<PathBuf, Arc<Mission>> = HashMap::new();
        let mut tests = Vec::with_capacity(scenario.tests.tests.len());
        for spec in &scenario.tests.tests {
            let path = scenario.resolve(&spec.mission);
            let mission = match missions.get(&path) {
                Some(mission) => Arc::clone(mission),
                None => {
                    let mission = Arc::new(Mission::load_from_file(&path)?);
                    missions.insert(path, Arc::clone(&mission));
                    mission
                }
            };
            tests.push(TestCase::from_spec(spec, mission));
        }
        Ok(tests)
    }
}

/// What happened when a test was flown.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedResult {
    Success,
    Failure(String),
    /// Killed at the test's timeout. Counts as a failure.
    TimedOut,
    /// Stopped by cancellation. Never counts as matching the expectation.
    Cancelled,
}

impl ObservedResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ObservedResult::Success)
    }
}

#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub name: String,
    pub matched_expectation: bool,
    pub observed: ObservedResult,
    pub duration: Duration,
}

/// Flies one test case against the program built in `workdir`.
pub trait TestHarness: Send + Sync {
    fn fly(&self, test: &TestCase, workdir: &Path, cancel: &CancelToken) -> ObservedResult;
}

/// Runs test cases and classifies them against their expected outcomes.
#[derive(Clone)]
pub struct TestRunner {
    harness: Arc<dyn TestHarness>,
}

impl TestRunner {
    pub fn new(harness: Arc<dyn TestHarness>) -> Self {
        Self { harness }
    }

    pub fn run(&self, test: &TestCase, workdir: &Path, cancel: &CancelToken) -> TestOutcome {
        let start_time = Instant::now();
        let observed = self.harness.fly(test, workdir, cancel);
        let matched_expectation = match observed {
            ObservedResult::Cancelled => false,
            ref other => other.is_success() == test.expected_outcome,
        };
        debug!(
            "test '{}': observed {:?}, expected success={}, matched={}",
            test.name, observed, test.expected_outcome, matched_expectation
        );
        TestOutcome {
            name: test.name.clone(),
            matched_expectation,
            observed,
            duration: start_time.elapsed(),
        }
    }
}

/// Circular pool of MAVLink ports shared by concurrent simulations.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    size: usize,
    next: AtomicUsize,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            size: usize::from(end.saturating_sub(start).max(1)),
            next: AtomicUsize::new(0),
        }
    }

    pub fn take<const N: usize>(&self) -> [u16; N] {
        let base = self.next.fetch_add(N, Ordering::Relaxed);
        std::array::from_fn(|i| self.start + ((base + i) % self.size) as u16)
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new(MAVLINK_PORT_START, MAVLINK_PORT_END)
    }
}

/// Quotes `text` for `/bin/sh`.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Launches the SITL binary through the external flying harness and judges
/// the resulting flight report with an [`Oracle`].
pub struct SitlHarness {
    env: Arc<dyn Environment>,
    vehicle: Vehicle,
    command: String,
    ports: PortPool,
    oracle: Arc<dyn Oracle>,
}

impl SitlHarness {
    pub fn new(
        env: Arc<dyn Environment>,
        vehicle: Vehicle,
        command: String,
        oracle: Arc<dyn Oracle>,
    ) -> Self {
        Self {
            env,
            vehicle,
            command,
            ports: PortPool::default(),
            oracle,
        }
    }

    pub fn sitl_command(&self, test: &TestCase) -> String {
        format!(
            "{} --speedup {} --model {} --home {} --defaults {}",
            self.vehicle.sitl_binary(),
            test.speedup,
            self.vehicle.as_str(),
            test.mission.home_location().as_sitl_arg(),
            test.parameters
        )
    }

    fn stage_mission(&self, test: &TestCase, workdir: &Path) -> Result<String, std::io::Error> {
        let staging = workdir.join(MISSION_STAGING_DIR);
        std::fs::create_dir_all(&staging)?;
        let file_name = format!("{}.wpl", test.name.replace(['/', ' '], "_"));
        std::fs::copy(test.mission.path(), staging.join(&file_name))?;
        Ok(format!("{MISSION_STAGING_DIR}/{file_name}"))
    }

    pub fn harness_command(&self, test: &TestCase, staged_mission: &str, ports: [u16; 3]) -> String {
        let ports = ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut command = format!(
            "{} --sitl {} --mission {} --ports {} --timeout {}",
            self.command,
            shell_quote(&self.sitl_command(test)),
            shell_quote(staged_mission),
            ports,
            test.timeout.as_secs().max(1)
        );
        if let Some(attack) = &test.attack {
            command.push_str(" --attack ");
            command.push_str(&shell_quote(&attack.as_harness_arg()));
        }
        command
    }
}

/// The flight report is the last line of stdout that parses as one.
fn parse_report(stdout: &str) -> Option<FlightReport> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
}

impl TestHarness for SitlHarness {
    fn fly(&self, test: &TestCase, workdir: &Path, cancel: &CancelToken) -> ObservedResult {
        let staged = match self.stage_mission(test, workdir) {
            Ok(staged) => staged,
            Err(e) => {
                warn!("failed to stage mission for test '{}': {e}", test.name);
                return ObservedResult::Failure(format!("mission staging failed: {e}"));
            }
        };
        let ports = self.ports.take::<3>();
        let command = self.harness_command(test, &staged, ports);
        debug!("flying test '{}': {command}", test.name);

        let output = match self.env.execute(&command, workdir, test.timeout, cancel) {
            Ok(output) => output,
            Err(e) => {
                warn!("test '{}' could not be executed: {e}", test.name);
                return ObservedResult::Failure(e.to_string());
            }
        };

        match output.status {
            CommandStatus::TimedOut => return ObservedResult::TimedOut,
            CommandStatus::Cancelled => return ObservedResult::Cancelled,
            _ => {}
        }

        match parse_report(&output.stdout) {
            Some(report) => match self.oracle.judge(&test.mission, &report) {
                MissionVerdict::Success => ObservedResult::Success,
                MissionVerdict::Failure(reason) => ObservedResult::Failure(reason),
            },
            None => {
                warn!(
                    "test '{}' produced no flight report (status {:?}): {}",
                    test.name,
                    output.status,
                    output.stderr.trim()
                );
                ObservedResult::Failure("no flight report".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::HostEnvironment;
    use crate::mission::tests::SQUARE;
    use crate::oracle::WaypointHomeOracle;

    const HOME_REPORT: &str = r#"{"completed": true, "visited-waypoints": [0,1,2,3,4], "final-position": {"lat": -35.363262, "lon": 149.165237, "alt": 584.0}}"#;

    fn square_mission(dir: &Path) -> Arc<Mission> {
        let path = dir.join("square.wpl");
        std::fs::write(&path, SQUARE).unwrap();
        Arc::new(Mission::load_from_file(&path).unwrap())
    }

    fn test_case(mission: Arc<Mission>, expected_outcome: bool, attack: Option<Attack>) -> TestCase {
        TestCase {
            name: "nominal".to_string(),
            mission,
            parameters: "/opt/ardupilot/copter.parm".to_string(),
            speedup: 10,
            timeout: Duration::from_secs(5),
            expected_outcome,
            attack,
        }
    }

    fn harness(dir: &Path, command: String) -> SitlHarness {
        SitlHarness::new(
            Arc::new(HostEnvironment::new(dir.to_path_buf())),
            Vehicle::Copter,
            command,
            Arc::new(WaypointHomeOracle::new()),
        )
    }

    #[test]
    fn port_pool_wraps_around() {
        let pool = PortPool::new(13000, 13004);
        assert_eq!(pool.take::<3>(), [13000, 13001, 13002]);
        assert_eq!(pool.take::<3>(), [13003, 13000, 13001]);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn builds_sitl_and_harness_commands() {
        let dir = tempfile::tempdir().unwrap();
        let attack = Attack {
            parameter: "BCN_LATITUDE".to_string(),
            value: 0.0,
            waypoint: 3,
        };
        let test = test_case(square_mission(dir.path()), false, Some(attack));
        let harness = harness(dir.path(), "mender-fly".to_string());

        assert_eq!(
            harness.sitl_command(&test),
            "/opt/ardupilot/build/sitl/bin/arducopter --speedup 10 --model copter \
             --home -35.363262,149.165237,584,0 --defaults /opt/ardupilot/copter.parm"
        );
        let command = harness.harness_command(&test, ".mender/missions/nominal.wpl", [13000, 13001, 13002]);
        assert!(command.starts_with("mender-fly --sitl '/opt/ardupilot/build/sitl/bin/arducopter"));
        assert!(command.contains("--ports 13000,13001,13002"));
        assert!(command.contains("--timeout 5"));
        assert!(command.ends_with("--attack 'BCN_LATITUDE=0@3'"));
    }

    #[test]
    fn flies_mission_through_harness_and_judges_report() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fly.sh");
        std::fs::write(
            &script,
            format!("test -f \"$4\" || exit 9\necho 'SITL starting'\necho '{HOME_REPORT}'\n"),
        )
        .unwrap();
        let runner = TestRunner::new(Arc::new(harness(
            dir.path(),
            format!("sh {}", script.display()),
        )));

        let outcome = runner.run(
            &test_case(square_mission(dir.path()), true, None),
            dir.path(),
            &CancelToken::new(),
        );
        assert_eq!(outcome.observed, ObservedResult::Success);
        assert!(outcome.matched_expectation);
        assert!(dir.path().join(".mender/missions/nominal.wpl").exists());
    }

    #[test]
    fn missing_report_is_a_failure_that_matches_a_failing_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(Arc::new(harness(dir.path(), "exit 1 #".to_string())));
        let outcome = runner.run(
            &test_case(square_mission(dir.path()), false, None),
            dir.path(),
            &CancelToken::new(),
        );
        assert!(matches!(outcome.observed, ObservedResult::Failure(_)));
        assert!(outcome.matched_expectation);
    }

    #[test]
    fn timed_out_flight_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(Arc::new(harness(dir.path(), "sleep 5 #".to_string())));
        let mut test = test_case(square_mission(dir.path()), true, None);
        test.timeout = Duration::from_millis(200);
        let outcome = runner.run(&test, dir.path(), &CancelToken::new());
        assert_eq!(outcome.observed, ObservedResult::TimedOut);
        assert!(!outcome.matched_expectation);
    }

    #[test]
    fn cancelled_flight_never_matches() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TestRunner::new(Arc::new(harness(dir.path(), "sleep 5 #".to_string())));
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = runner.run(
            &test_case(square_mission(dir.path()), false, None),
            dir.path(),
            &cancel,
        );
        assert_eq!(outcome.observed, ObservedResult::Cancelled);
        assert!(!outcome.matched_expectation);
    }
}
