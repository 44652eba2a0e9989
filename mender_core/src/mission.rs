use crate::scenario::AttackSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Metres per degree of latitude/longitude in the flat-earth approximation
/// used by ArduPilot's autotest suite.
pub const METRES_PER_DEGREE: f64 = 1.113195e5;

#[derive(Error, Debug)]
pub enum MissionError {
    #[error("Failed to read mission file {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Malformed mission command on line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Mission {0:?} must have at least one command")]
    Empty(PathBuf),
}

/// A global position (degrees, degrees, metres).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// Ground distance between two positions. Not accurate over large distances
/// or near the poles.
pub fn distance_metres(a: &Position, b: &Position) -> f64 {
    let d_lat = b.lat - a.lat;
    let d_lon = b.lon - a.lon;
    (d_lat * d_lat + d_lon * d_lon).sqrt() * METRES_PER_DEGREE
}

/// One line of a WPL mission file.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionCommand {
    pub index: u32,
    pub frame: u32,
    pub command: u32,
    pub params: [f64; 4],
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomeLocation {
    pub position: Position,
    pub heading: f64,
}

impl HomeLocation {
    /// The `lat,lon,alt,heading` form accepted by SITL's `--home`.
    pub fn as_sitl_arg(&self) -> String {
        format!(
            "{},{},{},{}",
            self.position.lat, self.position.lon, self.position.alt, self.heading
        )
    }
}

/// A parsed WPL mission.
#[derive(Debug, Clone)]
pub struct Mission {
    path: PathBuf,
    commands: Vec<MissionCommand>,
}

impl Mission {
    pub fn load_from_file(path: &Path) -> Result<Self, MissionError> {
        debug!("loading mission file {path:?}");
        let content = std::fs::read_to_string(path).map_err(|e| MissionError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(path, &content)
    }

    /// Parses WPL text. The first line is the format header and is skipped.
    pub fn parse(path: &Path, content: &str) -> Result<Self, MissionError> {
        let mut commands = Vec::new();
        for (number, line) in content.lines().enumerate().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            commands.push(parse_command(number + 1, line)?);
        }
        if commands.is_empty() {
            return Err(MissionError::Empty(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            commands,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commands(&self) -> &[MissionCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The first command's coordinates, heading 0.
    pub fn home_location(&self) -> HomeLocation {
        let home = &self.commands[0];
        HomeLocation {
            position: Position {
                lat: home.x,
                lon: home.y,
                alt: home.z,
            },
            heading: 0.0,
        }
    }

    /// Indices of every command; all must be visited for the mission to succeed.
    pub fn waypoints(&self) -> BTreeSet<u32> {
        (0..self.commands.len() as u32).collect()
    }
}

fn parse_command(line: usize, text: &str) -> Result<MissionCommand, MissionError> {
    let malformed = |reason: String| MissionError::Malformed { line, reason };
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() < 11 {
        return Err(malformed(format!(
            "expected at least 11 fields, found {}",
            fields.len()
        )));
    }

    let int = |i: usize| -> Result<u32, MissionError> {
        fields[i]
            .parse::<u32>()
            .map_err(|e| malformed(format!("field {} ('{}'): {e}", i + 1, fields[i])))
    };
    let float = |i: usize| -> Result<f64, MissionError> {
        fields[i]
            .parse::<f64>()
            .map_err(|e| malformed(format!("field {} ('{}'): {e}", i + 1, fields[i])))
    };

    Ok(MissionCommand {
        index: int(0)?,
        frame: int(2)?,
        command: int(3)?,
        params: [float(4)?, float(5)?, float(6)?, float(7)?],
        x: float(8)?,
        y: float(9)?,
        z: float(10)?,
    })
}

/// A parameter overwrite applied once the vehicle's next waypoint reaches `waypoint`.
#[derive(Debug, Clone, PartialEq)]
pub struct Attack {
    pub parameter: String,
    pub value: f64,
    pub waypoint: u32,
}

impl Attack {
    /// `PARAMETER=VALUE@WAYPOINT`, the form passed to the flying harness.
    pub fn as_harness_arg(&self) -> String {
        format!("{}={}@{}", self.parameter, self.value, self.waypoint)
    }
}

impl From<&AttackSpec> for Attack {
    fn from(spec: &AttackSpec) -> Self {
        Self {
            parameter: spec.parameter.clone(),
            value: spec.value,
            waypoint: spec.waypoint,
        }
    }
}
