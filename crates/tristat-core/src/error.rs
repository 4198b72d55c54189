use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EventId, Gender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    /// Wetsuit worn although water was at or above the limit.
    HotWetsuit,
    /// No wetsuit although water was below the limit.
    ColdSwimsuit,
}

impl fmt::Display for InconsistencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HotWetsuit => f.write_str("hot wetsuit"),
            Self::ColdSwimsuit => f.write_str("cold swimsuit"),
        }
    }
}

/// Errors that abort a reconciliation run.
///
/// Anything that only disqualifies one event is an exclusion instead and never
/// surfaces here.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("event {event_id}: program `{prog_name}` is not supported (expected `Elite Men` or `Elite Women`)")]
    SchemaMismatch { event_id: EventId, prog_name: String },
    #[error("event {event_id}: programs disagree on `{field}`: {values:?}")]
    InconsistentEvent {
        event_id: EventId,
        field: &'static str,
        values: Vec<String>,
    },
    #[error("event {event_id} ({gender}): {kind} with water at {water_temperature} °C is not a known inconsistency")]
    UnresolvedInconsistency {
        event_id: EventId,
        gender: Gender,
        kind: InconsistencyKind,
        water_temperature: f64,
    },
}
