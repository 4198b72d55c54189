//! Field Reconciler: validates cached programs and resolves their gender and
//! distance category.
//!
//! Distance detection is an ordered chain of [`DistanceRule`]s; each rule is a
//! plain function so every fallback can be exercised on its own.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tristat_core::raw::loose_f64;
use tristat_core::{
    DistanceCategory, EventDocument, EventId, ExclusionRule, Gender, ProgramDocument,
    ReconcileError,
};

/// Settings consumed by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldRules {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub distance_categories: Vec<DistanceCategory>,
    /// API category id -> API category name.
    pub category_ids: BTreeMap<u32, String>,
    /// Lower-case note fragments meaning the course was altered.
    pub modified_course_markers: Vec<String>,
    /// Distance category -> allowed (min, max) for the swim, bike and run headers.
    pub expected_distances: BTreeMap<String, Vec<(f64, f64)>>,
}

impl Default for FieldRules {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2009, 1, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or_default(),
            distance_categories: vec![DistanceCategory::Sprint, DistanceCategory::Standard],
            category_ids: BTreeMap::from([
                (343, "Major Games".to_string()),
                (345, "Recognised Event".to_string()),
                (346, "Recognised Games".to_string()),
                (349, "World Cup".to_string()),
                (351, "World Championship Series".to_string()),
                (624, "World Championship Finals".to_string()),
            ]),
            modified_course_markers: vec![
                "race was modified to a".to_string(),
                "race modified  to".to_string(),
                "swim was shortened".to_string(),
                "swim distance was reduced from 1500 m to 750m".to_string(),
            ],
            expected_distances: BTreeMap::new(),
        }
    }
}

impl FieldRules {
    pub fn allows_distance(&self, category: &DistanceCategory) -> bool {
        self.distance_categories.contains(category)
    }
}

/// One distance-detection fallback.
#[derive(Clone, Copy)]
pub struct DistanceRule {
    pub name: &'static str,
    pub resolve: fn(&ProgramDocument) -> Option<DistanceCategory>,
}

/// Fallbacks in priority order; the first rule that answers wins.
pub const DISTANCE_RULES: &[DistanceRule] = &[
    DistanceRule {
        name: "structured_category",
        resolve: distance_from_category_field,
    },
    DistanceRule {
        name: "notes_marker",
        resolve: distance_from_notes,
    },
    DistanceRule {
        name: "structured_distance",
        resolve: distance_from_first_segment,
    },
    DistanceRule {
        name: "winner_time",
        resolve: distance_from_winner_time,
    },
];

pub fn distance_from_category_field(doc: &ProgramDocument) -> Option<DistanceCategory> {
    doc.prog_distance_category
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(DistanceCategory::from)
}

pub fn distance_from_notes(doc: &ProgramDocument) -> Option<DistanceCategory> {
    let notes = doc.prog_notes.as_deref()?;
    if notes.contains("750") {
        Some(DistanceCategory::Sprint)
    } else if notes.contains("1500") {
        Some(DistanceCategory::Standard)
    } else {
        None
    }
}

pub fn distance_from_first_segment(doc: &ProgramDocument) -> Option<DistanceCategory> {
    let first = doc.prog_distances.as_ref()?.first()?;
    let distance = first.distance.as_ref().and_then(loose_f64)?;
    if distance == 750.0 {
        Some(DistanceCategory::Sprint)
    } else if distance == 1500.0 {
        Some(DistanceCategory::Standard)
    } else {
        None
    }
}

static FINISH_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+):(\d{2}):\d{2}").expect("finish time regex"));

pub fn distance_from_winner_time(doc: &ProgramDocument) -> Option<DistanceCategory> {
    let total = doc.results.first()?.total_time.as_deref()?;
    let caps = FINISH_TIME.captures(total)?;
    let hours: u32 = caps[1].parse().ok()?;
    let minutes: u32 = caps[2].parse().ok()?;
    match hours * 60 + minutes {
        40..=79 => Some(DistanceCategory::Sprint),
        90..=139 => Some(DistanceCategory::Standard),
        _ => None,
    }
}

pub fn detect_distance(doc: &ProgramDocument) -> Option<(DistanceCategory, &'static str)> {
    DISTANCE_RULES
        .iter()
        .find_map(|rule| (rule.resolve)(doc).map(|cat| (cat, rule.name)))
}

/// A program that passed every field check.
#[derive(Debug, Clone)]
pub struct ReconciledProgram<'a> {
    pub program_id: &'a str,
    pub doc: &'a ProgramDocument,
    pub gender: Gender,
    pub distance_category: DistanceCategory,
    pub event_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub enum ProgramVerdict<'a> {
    Accepted(ReconciledProgram<'a>),
    Excluded { rule: ExclusionRule, reason: String },
}

/// Both programs of an event plus the metadata they share.
#[derive(Debug, Clone)]
pub struct ReconciledEvent<'a> {
    pub event_id: EventId,
    pub event_title: String,
    pub event_venue: String,
    pub event_listing: String,
    pub event_country_noc: String,
    pub men: ReconciledProgram<'a>,
    pub women: ReconciledProgram<'a>,
}

#[derive(Debug, Clone)]
pub enum EventVerdict<'a> {
    Accepted(Box<ReconciledEvent<'a>>),
    Excluded(Vec<(ExclusionRule, String)>),
}

pub struct FieldReconciler<'r> {
    rules: &'r FieldRules,
}

impl<'r> FieldReconciler<'r> {
    pub fn new(rules: &'r FieldRules) -> Self {
        Self { rules }
    }

    /// Gender is checked first: an unknown program name aborts the run.
    pub fn reconcile_program<'a>(
        &self,
        program_id: &'a str,
        doc: &'a ProgramDocument,
    ) -> Result<ProgramVerdict<'a>, ReconcileError> {
        let gender = Gender::from_program_name(&doc.prog_name).ok_or_else(|| {
            ReconcileError::SchemaMismatch {
                event_id: doc.event_id,
                prog_name: doc.prog_name.clone(),
            }
        })?;
        let name = &doc.prog_name;

        let missing = [
            ("headers", doc.headers.is_empty()),
            ("results", doc.results.is_empty()),
        ]
        .into_iter()
        .filter_map(|(key, is_missing)| is_missing.then_some(key))
        .collect::<Vec<_>>();
        if !missing.is_empty() {
            return excluded(
                ExclusionRule::MissingPayload,
                format!("missing keys for {name}: {}", missing.join(", ")),
            );
        }

        let event_date = match self.event_window(doc) {
            Ok(date) => date,
            Err((rule, reason)) => return excluded(rule, reason),
        };

        let Some((distance_category, rule_name)) = detect_distance(doc) else {
            return excluded(
                ExclusionRule::UnknownDistance,
                format!("cannot detect distance for {name}"),
            );
        };
        debug!(event_id = doc.event_id, program = %name, %distance_category, rule = rule_name, "distance detected");

        if !self.rules.allows_distance(&distance_category) {
            return excluded(
                ExclusionRule::DistanceNotAllowed,
                format!(
                    "prog_distance_category for {name}: '{distance_category}' not in {:?}",
                    self.allowed_names()
                ),
            );
        }

        let category_ids = doc.event_category_ids();
        if !category_ids
            .iter()
            .any(|id| self.rules.category_ids.contains_key(id))
        {
            return excluded(
                ExclusionRule::CategoryNotAllowed,
                format!(
                    "event_category_ids for {name}: {category_ids:?} not in {:?}",
                    self.rules.category_ids.keys().collect::<Vec<_>>()
                ),
            );
        }

        if let Some(reason) = self.segment_distance_violation(doc, &distance_category) {
            return excluded(ExclusionRule::SegmentDistanceOutOfRange, reason);
        }

        Ok(ProgramVerdict::Accepted(ReconciledProgram {
            program_id,
            doc,
            gender,
            distance_category,
            event_date,
        }))
    }

    /// Date window and modified-course checks run over every program before
    /// any fatal check, so a skipped event never aborts the run.
    pub fn reconcile_event<'a>(
        &self,
        event_id: EventId,
        doc: &'a EventDocument,
    ) -> Result<EventVerdict<'a>, ReconcileError> {
        if doc.len() < 2 {
            let names = doc.iter().map(|(_, p)| p.prog_name.as_str()).collect::<Vec<_>>();
            return Ok(EventVerdict::Excluded(vec![(
                ExclusionRule::NotEnoughPrograms,
                format!("not enough data: {names:?}"),
            )]));
        }

        let outside_window = doc
            .iter()
            .filter_map(|(_, program)| self.event_window(program).err())
            .collect::<Vec<_>>();
        if !outside_window.is_empty() {
            return Ok(EventVerdict::Excluded(outside_window));
        }

        let shared = shared_metadata(event_id, doc)?;

        let mut exclusions = Vec::new();
        let mut men = None;
        let mut women = None;
        for (program_id, program) in doc.iter() {
            match self.reconcile_program(program_id, program)? {
                ProgramVerdict::Excluded { rule, reason } => exclusions.push((rule, reason)),
                ProgramVerdict::Accepted(accepted) => {
                    let slot = match accepted.gender {
                        Gender::Men => &mut men,
                        Gender::Women => &mut women,
                    };
                    if slot.is_some() {
                        exclusions.push((
                            ExclusionRule::DuplicateProgram,
                            format!("more than one {} program", accepted.gender),
                        ));
                    } else {
                        *slot = Some(accepted);
                    }
                }
            }
        }

        if !exclusions.is_empty() {
            return Ok(EventVerdict::Excluded(exclusions));
        }

        match (men, women) {
            (Some(men), Some(women)) => Ok(EventVerdict::Accepted(Box::new(ReconciledEvent {
                event_id,
                event_title: shared.title,
                event_venue: shared.venue,
                event_listing: shared.listing,
                event_country_noc: shared.country_noc,
                men,
                women,
            }))),
            (men, _) => {
                let missing = if men.is_none() { Gender::Men } else { Gender::Women };
                Ok(EventVerdict::Excluded(vec![(
                    ExclusionRule::NotEnoughPrograms,
                    format!("not enough data: no {missing} program"),
                )]))
            }
        }
    }

    /// Parsed event date, unless the program falls outside the query window or
    /// its notes report a modified course.
    fn event_window(&self, doc: &ProgramDocument) -> Result<NaiveDate, (ExclusionRule, String)> {
        let name = &doc.prog_name;
        let Ok(event_date) = NaiveDate::parse_from_str(doc.event_date.trim(), "%Y-%m-%d") else {
            return Err((
                ExclusionRule::InvalidDate,
                format!("unparsable event date `{}` for {name}", doc.event_date),
            ));
        };
        if event_date < self.rules.start_date || event_date > self.rules.end_date {
            return Err((
                ExclusionRule::DateOutOfRange,
                format!(
                    "date ({event_date}) not in range [{}, {}] for {name}",
                    self.rules.start_date, self.rules.end_date
                ),
            ));
        }

        let notes = doc.notes().to_lowercase();
        if let Some(marker) = self
            .rules
            .modified_course_markers
            .iter()
            .find(|m| notes.contains(&m.to_lowercase()))
        {
            return Err((
                ExclusionRule::ModifiedCourse,
                format!("prog_notes for {name} mention a modified course (`{marker}`)"),
            ));
        }
        Ok(event_date)
    }

    fn allowed_names(&self) -> Vec<&str> {
        self.rules
            .distance_categories
            .iter()
            .map(DistanceCategory::as_str)
            .collect()
    }

    /// Swim, bike and run sit at header indices 0, 2 and 4.
    fn segment_distance_violation(
        &self,
        doc: &ProgramDocument,
        category: &DistanceCategory,
    ) -> Option<String> {
        let ranges = self.rules.expected_distances.get(category.as_str())?;
        for (i_distance, i_header) in [0usize, 2, 4].into_iter().enumerate() {
            let Some(header) = doc.headers.get(i_header) else {
                continue;
            };
            let Some(distance) = header.distance.as_ref().and_then(loose_f64) else {
                continue;
            };
            let Some(&(d_min, d_max)) = ranges.get(i_distance) else {
                continue;
            };
            if !(d_min..=d_max).contains(&distance) {
                return Some(format!(
                    "distance #{i_distance} for {}: `{distance}` not in [{d_min}, {d_max}]",
                    doc.prog_name
                ));
            }
        }
        None
    }
}

fn excluded<'a>(rule: ExclusionRule, reason: String) -> Result<ProgramVerdict<'a>, ReconcileError> {
    Ok(ProgramVerdict::Excluded { rule, reason })
}

struct SharedMetadata {
    title: String,
    venue: String,
    listing: String,
    country_noc: String,
}

fn shared_metadata(event_id: EventId, doc: &EventDocument) -> Result<SharedMetadata, ReconcileError> {
    fn agree(
        event_id: EventId,
        doc: &EventDocument,
        field: &'static str,
        get: fn(&ProgramDocument) -> String,
    ) -> Result<String, ReconcileError> {
        let mut values = doc.iter().map(|(_, p)| get(p)).collect::<Vec<_>>();
        values.dedup();
        if values.len() != 1 {
            return Err(ReconcileError::InconsistentEvent {
                event_id,
                field,
                values,
            });
        }
        Ok(values.remove(0))
    }

    agree(event_id, doc, "event_id", |p| p.event_id.to_string())?;
    Ok(SharedMetadata {
        title: agree(event_id, doc, "event_title", |p| p.event_title.clone())?,
        venue: agree(event_id, doc, "event_venue", |p| p.event_venue.trim_end().to_string())?,
        listing: agree(event_id, doc, "event_listing", |p| p.event_listing.clone())?,
        country_noc: agree(event_id, doc, "event_country_noc", |p| {
            p.event_country_noc.clone()
        })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn program(name: &str, overrides: serde_json::Value) -> ProgramDocument {
        let mut base = json!({
            "prog_name": name,
            "event_id": 100,
            "event_title": "2019 World Triathlon Series Leeds",
            "event_venue": "Leeds ",
            "event_date": "2019-06-09",
            "event_country_noc": "GBR",
            "event_listing": "https://triathlon.org/events/event/2019_leeds",
            "prog_distance_category": "standard",
            "event_categories": [{"cat_id": 351, "cat_name": "World Championship Series"}],
            "headers": [{"name": "Swim"}, {"name": "T1"}, {"name": "Bike"}, {"name": "T2"}, {"name": "Run"}],
            "results": [{"athlete_id": 1, "position": 1, "total_time": "01:45:10", "splits": []}]
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).expect("program")
    }

    fn event(programs: Vec<ProgramDocument>) -> EventDocument {
        let mut doc = EventDocument::default();
        for (i, p) in programs.into_iter().enumerate() {
            doc.programs.insert(format!("{}", 500 + i), p);
        }
        doc
    }

    #[test]
    fn distance_chain_falls_back_in_order() {
        let structured = program("Elite Men", json!({}));
        assert_eq!(
            detect_distance(&structured),
            Some((DistanceCategory::Standard, "structured_category"))
        );

        let notes = program(
            "Elite Men",
            json!({"prog_distance_category": "", "prog_notes": "Swim 750m, bike 20km, run 5km. 1500 spectators"}),
        );
        assert_eq!(
            detect_distance(&notes),
            Some((DistanceCategory::Sprint, "notes_marker"))
        );

        let segments = program(
            "Elite Men",
            json!({"prog_distance_category": null, "prog_distances": [{"segment": "Swim", "distance": 1500}]}),
        );
        assert_eq!(
            detect_distance(&segments),
            Some((DistanceCategory::Standard, "structured_distance"))
        );

        let winner = program(
            "Elite Men",
            json!({"prog_distance_category": null, "results": [{"athlete_id": 1, "position": 1, "total_time": "00:52:41"}]}),
        );
        assert_eq!(
            detect_distance(&winner),
            Some((DistanceCategory::Sprint, "winner_time"))
        );

        let unknown = program(
            "Elite Men",
            json!({"prog_distance_category": null, "results": [{"athlete_id": 1, "position": 1, "total_time": "03:52:41"}]}),
        );
        assert_eq!(detect_distance(&unknown), None);
    }

    #[test]
    fn winner_time_buckets_match_known_ranges() {
        let at = |t: &str| {
            distance_from_winner_time(&program(
                "Elite Men",
                json!({"results": [{"athlete_id": 1, "position": 1, "total_time": t}]}),
            ))
        };
        assert_eq!(at("01:19:59"), Some(DistanceCategory::Sprint));
        assert_eq!(at("01:25:00"), None);
        assert_eq!(at("01:30:00"), Some(DistanceCategory::Standard));
        assert_eq!(at("02:19:00"), Some(DistanceCategory::Standard));
        assert_eq!(at("02:20:00"), None);
    }

    #[test]
    fn unknown_program_name_is_fatal() {
        let rules = FieldRules::default();
        let reconciler = FieldReconciler::new(&rules);
        let doc = program("U23 Men", json!({}));
        let err = reconciler.reconcile_program("1", &doc).unwrap_err();
        assert!(matches!(err, ReconcileError::SchemaMismatch { .. }));
    }

    #[test]
    fn soft_exclusions_carry_rules_and_reasons() {
        let rules = FieldRules::default();
        let reconciler = FieldReconciler::new(&rules);

        let cases = [
            (json!({"event_date": "2031-05-01"}), ExclusionRule::DateOutOfRange),
            (json!({"event_date": "May 2019"}), ExclusionRule::InvalidDate),
            (
                json!({"prog_notes": "Due to fog the SWIM WAS SHORTENED to 750m"}),
                ExclusionRule::ModifiedCourse,
            ),
            (json!({"prog_distance_category": "long"}), ExclusionRule::DistanceNotAllowed),
            (
                json!({"event_categories": [{"cat_id": 1}]}),
                ExclusionRule::CategoryNotAllowed,
            ),
            (json!({"results": []}), ExclusionRule::MissingPayload),
            (
                json!({"prog_distance_category": null, "results": [{"athlete_id": 1, "position": 1}]}),
                ExclusionRule::UnknownDistance,
            ),
        ];

        for (overrides, expected) in cases {
            let doc = program("Elite Women", overrides);
            match reconciler.reconcile_program("1", &doc).expect("not fatal") {
                ProgramVerdict::Excluded { rule, reason } => {
                    assert_eq!(rule, expected);
                    assert!(reason.contains("Elite Women"), "{reason}");
                }
                ProgramVerdict::Accepted(_) => panic!("expected {expected} exclusion"),
            }
        }
    }

    #[test]
    fn segment_distances_are_checked_when_configured() {
        let mut rules = FieldRules::default();
        rules
            .expected_distances
            .insert("standard".into(), vec![(1400.0, 1600.0), (38.0, 42.0), (9.5, 10.5)]);
        let reconciler = FieldReconciler::new(&rules);
        let doc = program(
            "Elite Men",
            json!({"headers": [
                {"name": "Swim", "distance": 750}, {"name": "T1"},
                {"name": "Bike", "distance": 40}, {"name": "T2"}, {"name": "Run", "distance": 10}
            ]}),
        );
        match reconciler.reconcile_program("1", &doc).expect("not fatal") {
            ProgramVerdict::Excluded { rule, reason } => {
                assert_eq!(rule, ExclusionRule::SegmentDistanceOutOfRange);
                assert!(reason.contains("distance #0"));
            }
            ProgramVerdict::Accepted(_) => panic!("swim distance should be rejected"),
        }
    }

    #[test]
    fn events_pair_one_program_per_gender() {
        let rules = FieldRules::default();
        let reconciler = FieldReconciler::new(&rules);
        let doc = event(vec![
            program("Elite Men", json!({})),
            program("Elite Women", json!({})),
        ]);
        match reconciler.reconcile_event(100, &doc).expect("not fatal") {
            EventVerdict::Accepted(ev) => {
                assert_eq!(ev.men.gender, Gender::Men);
                assert_eq!(ev.women.gender, Gender::Women);
                assert_eq!(ev.event_venue, "Leeds");
            }
            EventVerdict::Excluded(reasons) => panic!("unexpected exclusion {reasons:?}"),
        }

        let single = event(vec![program("Elite Men", json!({}))]);
        match reconciler.reconcile_event(100, &single).expect("not fatal") {
            EventVerdict::Excluded(reasons) => {
                assert_eq!(reasons[0].0, ExclusionRule::NotEnoughPrograms)
            }
            EventVerdict::Accepted(_) => panic!("single program cannot pair"),
        }

        let twins = event(vec![
            program("Elite Men", json!({})),
            program("Elite Men", json!({})),
        ]);
        match reconciler.reconcile_event(100, &twins).expect("not fatal") {
            EventVerdict::Excluded(reasons) => {
                assert_eq!(reasons[0].0, ExclusionRule::DuplicateProgram)
            }
            EventVerdict::Accepted(_) => panic!("duplicate genders cannot pair"),
        }
    }

    #[test]
    fn disagreeing_event_metadata_is_fatal() {
        let rules = FieldRules::default();
        let reconciler = FieldReconciler::new(&rules);
        let doc = event(vec![
            program("Elite Men", json!({})),
            program("Elite Women", json!({"event_title": "Another title"})),
        ]);
        let err = reconciler.reconcile_event(100, &doc).unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::InconsistentEvent { field: "event_title", .. }
        ));
    }

    #[test]
    fn skipped_events_never_reach_fatal_checks() {
        let rules = FieldRules::default();
        let reconciler = FieldReconciler::new(&rules);

        let old = event(vec![
            program("Elite Men", json!({"event_date": "2005-06-01", "event_venue": "Leeds"})),
            program("Elite Women", json!({"event_date": "2005-06-01", "event_venue": "Leeds, UK"})),
        ]);
        match reconciler.reconcile_event(7, &old).expect("out-of-window event is not fatal") {
            EventVerdict::Excluded(reasons) => {
                assert_eq!(reasons.len(), 2);
                assert!(reasons.iter().all(|(rule, _)| *rule == ExclusionRule::DateOutOfRange));
            }
            EventVerdict::Accepted(_) => panic!("2005 is outside the query window"),
        }

        let modified = event(vec![
            program("U23 Men", json!({"prog_notes": "Race was modified to a duathlon"})),
            program("Elite Women", json!({})),
        ]);
        match reconciler.reconcile_event(8, &modified).expect("modified course is not fatal") {
            EventVerdict::Excluded(reasons) => {
                assert_eq!(reasons, vec![(
                    ExclusionRule::ModifiedCourse,
                    "prog_notes for U23 Men mention a modified course (`race was modified to a`)"
                        .to_string(),
                )]);
            }
            EventVerdict::Accepted(_) => panic!("modified course must be excluded"),
        }
    }
}
