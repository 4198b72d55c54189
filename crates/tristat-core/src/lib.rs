//! Core domain model for tristat: raw program payloads, per-program summaries,
//! merged event rows and the append-only exclusion/conflict logs.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod log;
pub mod model;
pub mod raw;

pub use error::{InconsistencyKind, ReconcileError};
pub use log::{
    ConditionConflict, ConditionField, ConditionSource, ConflictLog, ExclusionLog,
    ExclusionRecord, ExclusionRule, Sourced,
};
pub use model::{
    Conditions, DisciplineStats, EventRow, Gap, ProgramSummary, WETSUIT_WATER_LIMIT_C,
};
pub use raw::{EventDocument, NonFinish, Position, ProgramDocument, ResultRecord};

pub const CRATE_NAME: &str = "tristat-core";

pub type EventId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Men,
    Women,
}

impl Gender {
    pub const BOTH: [Gender; 2] = [Gender::Men, Gender::Women];

    /// Exact program-name lookup; anything else is an unsupported API shape.
    pub fn from_program_name(name: &str) -> Option<Self> {
        match name {
            "Elite Men" => Some(Self::Men),
            "Elite Women" => Some(Self::Women),
            _ => None,
        }
    }

    pub fn program_name(&self) -> &'static str {
        match self {
            Self::Men => "Elite Men",
            Self::Women => "Elite Women",
        }
    }

    /// Column suffix used in the flat dataset (`swim_mean_m`, `wetsuit_w`, ...).
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Men => "m",
            Self::Women => "w",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix.trim_start_matches('_') {
            "m" => Some(Self::Men),
            "w" => Some(Self::Women),
            _ => None,
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    Swim,
    T1,
    Bike,
    T2,
    Run,
}

impl Discipline {
    pub const ALL: [Discipline; 5] = [
        Discipline::Swim,
        Discipline::T1,
        Discipline::Bike,
        Discipline::T2,
        Discipline::Run,
    ];

    pub const SPORTS: [Discipline; 3] = [Discipline::Swim, Discipline::Bike, Discipline::Run];

    pub fn from_header(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "swim" => Some(Self::Swim),
            "t1" => Some(Self::T1),
            "bike" => Some(Self::Bike),
            "t2" => Some(Self::T2),
            "run" => Some(Self::Run),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Swim => "swim",
            Self::T1 => "t1",
            Self::Bike => "bike",
            Self::T2 => "t2",
            Self::Run => "run",
        }
    }

    /// Transitions may be missing from timing data; the three sports may not.
    pub fn is_required(&self) -> bool {
        matches!(self, Self::Swim | Self::Bike | Self::Run)
    }

    /// Index into [`Discipline::SPORTS`], used by outlier overrides.
    pub fn sport_index(&self) -> Option<usize> {
        Self::SPORTS.iter().position(|d| d == self)
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DistanceCategory {
    Sprint,
    Standard,
    Other(String),
}

impl DistanceCategory {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sprint => "sprint",
            Self::Standard => "standard",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for DistanceCategory {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "sprint" => Self::Sprint,
            "standard" => Self::Standard,
            _ => Self::Other(value.trim().to_string()),
        }
    }
}

impl From<&str> for DistanceCategory {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<DistanceCategory> for String {
    fn from(value: DistanceCategory) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for DistanceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
