//! Derived per-program summaries and merged event rows.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::InconsistencyKind;
use crate::{Discipline, DistanceCategory, EventId, Gender};

/// Water temperature at and above which wetsuits are forbidden.
pub const WETSUIT_WATER_LIMIT_C: f64 = 20.0;

/// Order statistics for one discipline of one program.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DisciplineStats {
    /// Mean over the rank window of the fastest times.
    pub mean: f64,
    pub std: f64,
    /// Same window mirrored from the slowest end.
    pub mean_last: f64,
    pub std_last: f64,
    /// Non-zero times available for this discipline.
    pub n_values: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Conditions {
    pub air_temperature: Option<f64>,
    pub water_temperature: Option<f64>,
    pub wetsuit: Option<bool>,
}

impl Conditions {
    /// Hot wetsuit or cold swimsuit, when both signals are known and disagree.
    pub fn inconsistency(&self) -> Option<InconsistencyKind> {
        let water = self.water_temperature?;
        match self.wetsuit? {
            true if water >= WETSUIT_WATER_LIMIT_C => Some(InconsistencyKind::HotWetsuit),
            false if water < WETSUIT_WATER_LIMIT_C => Some(InconsistencyKind::ColdSwimsuit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSummary {
    pub program_id: String,
    pub gender: Gender,
    pub event_date: NaiveDate,
    pub distance_category: DistanceCategory,
    pub notes: String,
    pub event_category_ids: Vec<u32>,
    pub disciplines: BTreeMap<Discipline, DisciplineStats>,
    pub n_finishers: usize,
    pub pack_size: usize,
    pub is_winner_in_front_pack: bool,
    pub is_best_runner_in_front_pack: bool,
    pub best_runner_wins: bool,
    /// Seconds between the winner and the runner-up.
    pub second_delay_s: f64,
    pub winner: Option<String>,
    pub winner_country: Option<String>,
    pub second: Option<String>,
    pub second_country: Option<String>,
    pub age_mean: Option<f64>,
    pub age_std: Option<f64>,
    pub level: Option<f64>,
    pub conditions: Conditions,
}

impl ProgramSummary {
    pub fn stats(&self, discipline: Discipline) -> Option<&DisciplineStats> {
        self.disciplines.get(&discipline)
    }

    pub fn mean(&self, discipline: Discipline) -> Option<f64> {
        self.stats(discipline).map(|s| s.mean)
    }
}

/// Women's minus men's window mean for one discipline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub seconds: f64,
    /// Relative to the men's mean.
    pub percent: f64,
}

impl Gap {
    pub fn between(men_mean: f64, women_mean: f64) -> Self {
        let seconds = women_mean - men_mean;
        let percent = if men_mean != 0.0 { seconds / men_mean } else { 0.0 };
        Self { seconds, percent }
    }
}

/// One event of the final dataset: both genders side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub event_id: EventId,
    pub event_title: String,
    pub event_venue: String,
    pub event_listing: String,
    pub event_country_noc: String,
    pub event_date: NaiveDate,
    pub event_year: i32,
    pub event_category: Option<String>,
    pub distance_category: DistanceCategory,
    pub men: ProgramSummary,
    pub women: ProgramSummary,
    pub gaps: BTreeMap<Discipline, Gap>,
    /// Disciplines whose measurements are known-bad for this event.
    #[serde(default)]
    pub suppressed: BTreeSet<Discipline>,
}

impl EventRow {
    pub fn summary(&self, gender: Gender) -> &ProgramSummary {
        match gender {
            Gender::Men => &self.men,
            Gender::Women => &self.women,
        }
    }

    pub fn gap(&self, discipline: Discipline) -> Option<Gap> {
        self.gaps.get(&discipline).copied()
    }

    pub fn is_suppressed(&self, discipline: Discipline) -> bool {
        self.suppressed.contains(&discipline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_inconsistencies_follow_the_twenty_degree_rule() {
        let hot = Conditions {
            air_temperature: None,
            water_temperature: Some(22.5),
            wetsuit: Some(true),
        };
        assert_eq!(hot.inconsistency(), Some(InconsistencyKind::HotWetsuit));

        let cold = Conditions {
            water_temperature: Some(17.0),
            wetsuit: Some(false),
            ..Conditions::default()
        };
        assert_eq!(cold.inconsistency(), Some(InconsistencyKind::ColdSwimsuit));

        let boundary = Conditions {
            water_temperature: Some(20.0),
            wetsuit: Some(false),
            ..Conditions::default()
        };
        assert_eq!(boundary.inconsistency(), None);

        let unknown_water = Conditions {
            wetsuit: Some(true),
            ..Conditions::default()
        };
        assert_eq!(unknown_water.inconsistency(), None);
    }

    #[test]
    fn gap_percent_is_relative_to_men() {
        let gap = Gap::between(1000.0, 1100.0);
        assert_eq!(gap.seconds, 100.0);
        assert!((gap.percent - 0.1).abs() < 1e-12);
        assert_eq!(Gap::between(0.0, 10.0).percent, 0.0);
    }
}
