//! Append-only audit logs returned alongside the reconciled dataset.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{EventId, Gender};

/// Rule that removed an event from the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionRule {
    NotEnoughPrograms,
    DuplicateProgram,
    MissingPayload,
    InvalidDate,
    DateOutOfRange,
    ModifiedCourse,
    UnknownDistance,
    DistanceNotAllowed,
    CategoryNotAllowed,
    SegmentDistanceOutOfRange,
    InsufficientResults,
    DistanceMismatch,
    UnknownWetsuit,
    ImplausibleDuration,
    NegativeGap,
    ExtremeGap,
}

impl ExclusionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotEnoughPrograms => "not_enough_programs",
            Self::DuplicateProgram => "duplicate_program",
            Self::MissingPayload => "missing_payload",
            Self::InvalidDate => "invalid_date",
            Self::DateOutOfRange => "date_out_of_range",
            Self::ModifiedCourse => "modified_course",
            Self::UnknownDistance => "unknown_distance",
            Self::DistanceNotAllowed => "distance_not_allowed",
            Self::CategoryNotAllowed => "category_not_allowed",
            Self::SegmentDistanceOutOfRange => "segment_distance_out_of_range",
            Self::InsufficientResults => "insufficient_results",
            Self::DistanceMismatch => "distance_mismatch",
            Self::UnknownWetsuit => "unknown_wetsuit",
            Self::ImplausibleDuration => "implausible_duration",
            Self::NegativeGap => "negative_gap",
            Self::ExtremeGap => "extreme_gap",
        }
    }
}

impl fmt::Display for ExclusionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRecord {
    pub event_id: EventId,
    pub rule: ExclusionRule,
    pub reason: String,
}

/// At most one record per event; later reasons for the same event are appended
/// to the first record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionLog {
    records: Vec<ExclusionRecord>,
}

impl ExclusionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event_id: EventId, rule: ExclusionRule, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(existing) = self.records.iter_mut().find(|r| r.event_id == event_id) {
            existing.reason.push('\n');
            existing.reason.push_str(&reason);
            return;
        }
        self.records.push(ExclusionRecord {
            event_id,
            rule,
            reason,
        });
    }

    pub fn contains(&self, event_id: EventId) -> bool {
        self.records.iter().any(|r| r.event_id == event_id)
    }

    pub fn get(&self, event_id: EventId) -> Option<&ExclusionRecord> {
        self.records.iter().find(|r| r.event_id == event_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExclusionRecord> {
        self.records.iter()
    }

    pub fn extend(&mut self, other: ExclusionLog) {
        for record in other.records {
            self.push(record.event_id, record.rule, record.reason);
        }
    }
}

/// Where a race-condition value came from, in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSource {
    ApiMeta,
    NotesKeyword,
    NotesRegex,
    ManualOverride,
    WaterThreshold,
    Labeler,
}

/// A candidate value tagged with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConditionSource,
}

impl<T> Sourced<T> {
    pub fn new(value: T, source: ConditionSource) -> Self {
        Self { value, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    AirTemperature,
    WaterTemperature,
    Wetsuit,
}

impl fmt::Display for ConditionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AirTemperature => f.write_str("air_temperature"),
            Self::WaterTemperature => f.write_str("water_temperature"),
            Self::Wetsuit => f.write_str("wetsuit"),
        }
    }
}

/// Sources disagreed on a field; `chosen` is the first-collected value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConflict {
    pub event_id: EventId,
    pub gender: Gender,
    pub field: ConditionField,
    pub candidates: Vec<Sourced<String>>,
    pub chosen: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictLog {
    entries: Vec<ConditionConflict>,
}

impl ConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, conflict: ConditionConflict) {
        self.entries.push(conflict);
    }

    pub fn has_conflict(&self, event_id: EventId, gender: Gender, field: ConditionField) -> bool {
        self.entries
            .iter()
            .any(|c| c.event_id == event_id && c.gender == gender && c.field == field)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConditionConflict> {
        self.entries.iter()
    }

    pub fn extend(&mut self, other: ConflictLog) {
        self.entries.extend(other.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_log_keeps_one_record_per_event() {
        let mut log = ExclusionLog::new();
        log.push(7, ExclusionRule::ImplausibleDuration, "swim_mean_m = 120 < 300");
        log.push(7, ExclusionRule::ImplausibleDuration, "swim_mean_w = 130 < 300");
        log.push(8, ExclusionRule::NegativeGap, "bike gap -4.00 < 0");

        assert_eq!(log.len(), 2);
        let first = log.get(7).unwrap();
        assert_eq!(first.rule, ExclusionRule::ImplausibleDuration);
        assert!(first.reason.contains("swim_mean_m"));
        assert!(first.reason.contains("swim_mean_w"));
        assert!(log.contains(8));
        assert!(!log.contains(9));
    }

    #[test]
    fn exclusion_rules_serialize_as_snake_case() {
        let json = serde_json::to_string(&ExclusionRule::SegmentDistanceOutOfRange).unwrap();
        assert_eq!(json, "\"segment_distance_out_of_range\"");
        assert_eq!(ExclusionRule::NegativeGap.to_string(), "negative_gap");
    }
}
