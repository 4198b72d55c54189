//! Condition Extractor: air/water temperature and wetsuit legality per program.
//!
//! Candidates are collected from every source in priority order, then each
//! field is resolved independently: no candidate gives `None`, agreeing
//! candidates give their value, disagreeing candidates log a
//! [`ConditionConflict`] and keep the first-collected value.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use tristat_core::raw::loose_f64;
use tristat_core::{
    ConditionConflict, ConditionField, ConditionSource, Conditions, ConflictLog, EventId, Gender,
    ProgramDocument, Sourced, WETSUIT_WATER_LIMIT_C,
};

/// Last-resort wetsuit source, consulted only when every other source is silent.
pub trait WetsuitLabeler: Send + Sync {
    fn resolve_unknown(&self, event_id: EventId, gender: Gender) -> Option<bool>;
}

/// Leaves unresolved programs unresolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLabeler;

impl WetsuitLabeler for NoLabeler {
    fn resolve_unknown(&self, _event_id: EventId, _gender: Gender) -> Option<bool> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualWetsuitEntry {
    pub wetsuit: Option<bool>,
    #[serde(default)]
    pub event_title: Option<String>,
    #[serde(default)]
    pub event_listing: Option<String>,
}

/// Hand-labelled wetsuit decisions keyed `"<event_id>_<m|w>"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManualWetsuitTable {
    entries: BTreeMap<String, ManualWetsuitEntry>,
}

impl ManualWetsuitTable {
    pub fn key(event_id: EventId, gender: Gender) -> String {
        format!("{event_id}_{}", gender.suffix())
    }

    /// A missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn insert(&mut self, event_id: EventId, gender: Gender, wetsuit: Option<bool>) {
        self.entries.insert(
            Self::key(event_id, gender),
            ManualWetsuitEntry {
                wetsuit,
                event_title: None,
                event_listing: None,
            },
        );
    }

    pub fn wetsuit(&self, event_id: EventId, gender: Gender) -> Option<bool> {
        self.entries
            .get(&Self::key(event_id, gender))
            .and_then(|entry| entry.wetsuit)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionCandidates {
    pub air: Vec<Sourced<f64>>,
    pub water: Vec<Sourced<f64>>,
    pub wetsuit: Vec<Sourced<bool>>,
}

const WETSUIT_ALLOWED_MARKERS: [&str; 3] = ["wetsuits allowed", "wetsuit allowed", ". wetsuit swim."];
const WETSUIT_FORBIDDEN_MARKER: &str = "wetsuits not allowed";

static AIR_TEMPERATURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"air temperature[:\s]*([\d.]+)").expect("air regex"));
static WATER_TEMPERATURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"water temperature[:\s]*([\d.]+)").expect("water regex"));

pub fn wetsuit_from_meta(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "allowed" | "mandatory" => Some(true),
            "forbidden" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn wetsuit_from_notes(notes: &str) -> Option<bool> {
    let notes = notes.to_lowercase();
    if WETSUIT_ALLOWED_MARKERS.iter().any(|m| notes.contains(m)) {
        Some(true)
    } else if notes.contains(WETSUIT_FORBIDDEN_MARKER) {
        Some(false)
    } else {
        None
    }
}

/// `(air, water)` from "<measure> temperature: <number>" phrases.
pub fn temperatures_from_notes(notes: &str) -> (Option<f64>, Option<f64>) {
    let notes = notes.to_lowercase();
    let grab = |re: &Regex| {
        re.captures(&notes).and_then(|caps| {
            let raw = &caps[1];
            raw.strip_suffix('.').unwrap_or(raw).parse::<f64>().ok()
        })
    };
    (grab(&AIR_TEMPERATURE), grab(&WATER_TEMPERATURE))
}

pub fn wetsuit_from_water(water_temperature: f64) -> bool {
    water_temperature < WETSUIT_WATER_LIMIT_C
}

pub struct ConditionExtractor<'a> {
    manual: &'a ManualWetsuitTable,
    labeler: &'a dyn WetsuitLabeler,
}

impl<'a> ConditionExtractor<'a> {
    pub fn new(manual: &'a ManualWetsuitTable, labeler: &'a dyn WetsuitLabeler) -> Self {
        Self { manual, labeler }
    }

    /// Sources 1 to 4: API metadata, notes keywords, notes temperatures, manual table.
    pub fn collect(
        &self,
        event_id: EventId,
        gender: Gender,
        doc: &ProgramDocument,
    ) -> ConditionCandidates {
        let mut candidates = ConditionCandidates::default();

        if let Some(meta) = &doc.meta {
            if let Some(air) = meta.temperature_air.as_ref().and_then(loose_f64) {
                candidates.air.push(Sourced::new(air, ConditionSource::ApiMeta));
            }
            if let Some(water) = meta.temperature_water.as_ref().and_then(loose_f64) {
                candidates.water.push(Sourced::new(water, ConditionSource::ApiMeta));
            }
            if let Some(wetsuit) = meta.wetsuit.as_ref().and_then(wetsuit_from_meta) {
                candidates
                    .wetsuit
                    .push(Sourced::new(wetsuit, ConditionSource::ApiMeta));
            }
        }

        let notes = doc.notes();
        if let Some(wetsuit) = wetsuit_from_notes(notes) {
            candidates
                .wetsuit
                .push(Sourced::new(wetsuit, ConditionSource::NotesKeyword));
        }
        let (air, water) = temperatures_from_notes(notes);
        if let Some(air) = air {
            candidates.air.push(Sourced::new(air, ConditionSource::NotesRegex));
        }
        if let Some(water) = water {
            candidates
                .water
                .push(Sourced::new(water, ConditionSource::NotesRegex));
        }

        if let Some(wetsuit) = self.manual.wetsuit(event_id, gender) {
            candidates
                .wetsuit
                .push(Sourced::new(wetsuit, ConditionSource::ManualOverride));
        }

        candidates
    }

    pub fn extract(
        &self,
        event_id: EventId,
        gender: Gender,
        doc: &ProgramDocument,
    ) -> (Conditions, ConflictLog) {
        let mut conflicts = ConflictLog::new();
        let mut candidates = self.collect(event_id, gender, doc);

        let air_temperature = resolve(
            event_id,
            gender,
            ConditionField::AirTemperature,
            &candidates.air,
            &mut conflicts,
        );
        let water_temperature = resolve(
            event_id,
            gender,
            ConditionField::WaterTemperature,
            &candidates.water,
            &mut conflicts,
        );

        if let Some(water) = water_temperature {
            candidates.wetsuit.push(Sourced::new(
                wetsuit_from_water(water),
                ConditionSource::WaterThreshold,
            ));
        }

        let mut wetsuit = resolve(
            event_id,
            gender,
            ConditionField::Wetsuit,
            &candidates.wetsuit,
            &mut conflicts,
        );
        if wetsuit.is_none() {
            wetsuit = self.labeler.resolve_unknown(event_id, gender);
            debug!(event_id, %gender, ?wetsuit, "wetsuit unresolved, asked labeler");
        }

        (
            Conditions {
                air_temperature,
                water_temperature,
                wetsuit,
            },
            conflicts,
        )
    }
}

/// First-collected value wins; disagreement is recorded, never fatal.
pub fn resolve<T>(
    event_id: EventId,
    gender: Gender,
    field: ConditionField,
    candidates: &[Sourced<T>],
    conflicts: &mut ConflictLog,
) -> Option<T>
where
    T: Copy + PartialEq + ToString,
{
    let first = candidates.first()?;
    if candidates.iter().any(|c| c.value != first.value) {
        let conflict = ConditionConflict {
            event_id,
            gender,
            field,
            candidates: candidates
                .iter()
                .map(|c| Sourced::new(c.value.to_string(), c.source))
                .collect(),
            chosen: first.value.to_string(),
        };
        warn!(
            event_id,
            %gender,
            %field,
            chosen = %conflict.chosen,
            candidates = ?conflict.candidates,
            "condition sources disagree"
        );
        conflicts.push(conflict);
    }
    Some(first.value)
}
