pub mod build;
pub mod coverage;
pub mod environment;
pub mod localization;
pub mod mission;
pub mod mutator;
pub mod oracle;
pub mod runner;
pub mod scenario;
pub mod search;
pub mod session;
pub mod source;

pub use build::{BuildError, BuildManager, BuildResult};
pub use coverage::{CoverageCollector, CoverageError, CoverageRecord, CoverageTool, GcovTool, TestCoverage};
pub use environment::{CancelToken, ContainerEnvironment, Environment, EnvironmentError, HostEnvironment, ScratchArena};
pub use localization::{Localization, RankedLocation, Spectrum};
pub use mission::{Attack, Mission, MissionError, Position};
pub use mutator::{Candidate, MutationGenerator};
pub use oracle::{FlightReport, MissionVerdict, Oracle, WaypointHomeOracle};
pub use runner::{ObservedResult, SitlHarness, TestCase, TestHarness, TestOutcome, TestRunner};
pub use scenario::{Scenario, ScenarioError};
pub use search::{ExhaustionReason, SearchController, SearchLimits, SearchOutcome, SearchReport};
pub use session::{SessionController, SessionError, SessionOutcome, Toolchain};
pub use source::{CFamilyAnalyzer, Location, SourceAnalyzer, SourceError, SourceIndex};
