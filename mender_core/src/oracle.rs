use crate::mission::{Mission, Position, distance_metres};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Maximum distance, in metres, between the final position and home for the
/// vehicle to count as having returned.
pub const HOME_TOLERANCE_METRES: f64 = 3.0;

/// What the flying harness observed during one mission.
///
/// The harness prints this as a single JSON object on the last line of its
/// standard output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlightReport {
    /// Whether the mission ran to its end (the waypoint pointer rolled back to zero).
    pub completed: bool,
    #[serde(default)]
    pub visited_waypoints: BTreeSet<u32>,
    pub final_position: Position,
}

/// The outcome of judging a flight against its mission.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionVerdict {
    Success,
    Failure(String),
}

impl MissionVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, MissionVerdict::Success)
    }
}

/// An `Oracle` decides whether a flown mission succeeded.
///
/// Implementations must be pure functions of the mission and the report so
/// that the same flight is always judged the same way.
pub trait Oracle: Send + Sync {
    fn judge(&self, mission: &Mission, report: &FlightReport) -> MissionVerdict;
}

/// Succeeds iff the mission completed, every waypoint was visited and the
/// vehicle ended within [`HOME_TOLERANCE_METRES`] of home.
#[derive(Debug, Clone)]
pub struct WaypointHomeOracle {
    tolerance: f64,
}

impl WaypointHomeOracle {
    pub fn new() -> Self {
        Self {
            tolerance: HOME_TOLERANCE_METRES,
        }
    }
}

impl Default for WaypointHomeOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl Oracle for WaypointHomeOracle {
    fn judge(&self, mission: &Mission, report: &FlightReport) -> MissionVerdict {
        if !report.completed {
            return MissionVerdict::Failure("mission did not complete".to_string());
        }

        let expected = mission.waypoints();
        let missed: Vec<u32> = expected
            .difference(&report.visited_waypoints)
            .copied()
            .collect();
        if !missed.is_empty() {
            debug!(
                "failed to visit all waypoints: visited {:?}, expected {:?}",
                report.visited_waypoints, expected
            );
            return MissionVerdict::Failure(format!("waypoints not visited: {missed:?}"));
        }

        let home = mission.home_location().position;
        let distance = distance_metres(&home, &report.final_position);
        debug!("distance to home: {distance:.3} metres");
        if distance >= self.tolerance {
            return MissionVerdict::Failure(format!(
                "ended {distance:.2} m from home (tolerance {:.1} m)",
                self.tolerance
            ));
        }

        MissionVerdict::Success
    }
}
