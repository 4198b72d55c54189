//! Dataset Cleaner: ordered filters over merged rows. Every dropped row leaves
//! a record in the exclusion log; wetsuit/temperature contradictions that
//! nobody has reviewed stop the run.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tristat_core::{
    Discipline, EventId, EventRow, ExclusionLog, ExclusionRule, Gender, ReconcileError,
};

use crate::config::PipelineConfig;
use crate::record_exclusion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownInconsistency {
    pub event_id: EventId,
    pub gender: Gender,
    #[serde(default)]
    pub note: String,
}

/// Reviewed hot-wetsuit / cold-swimsuit cases that may pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnownInconsistencies {
    entries: Vec<KnownInconsistency>,
}

impl KnownInconsistencies {
    pub fn new(entries: Vec<KnownInconsistency>) -> Self {
        Self { entries }
    }

    /// A missing file means nothing has been reviewed yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn contains(&self, event_id: EventId, gender: Gender) -> bool {
        self.entries
            .iter()
            .any(|e| e.event_id == event_id && e.gender == gender)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Linear interpolation between closest ranks.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64))
}

pub struct DatasetCleaner<'c> {
    config: &'c PipelineConfig,
    known: &'c KnownInconsistencies,
}

impl<'c> DatasetCleaner<'c> {
    pub fn new(config: &'c PipelineConfig, known: &'c KnownInconsistencies) -> Self {
        Self { config, known }
    }

    pub fn clean(&self, rows: Vec<EventRow>) -> Result<(Vec<EventRow>, ExclusionLog), ReconcileError> {
        let mut log = ExclusionLog::new();

        let rows = self.filter(rows, &mut log, ExclusionRule::DistanceMismatch, |row| {
            (row.men.distance_category != row.women.distance_category).then(|| {
                format!(
                    "prog_distance_category_m = '{}' != prog_distance_category_w = '{}'",
                    row.men.distance_category, row.women.distance_category
                )
            })
        });

        let rows = self.filter(rows, &mut log, ExclusionRule::UnknownWetsuit, |row| {
            let (m, w) = (row.men.conditions.wetsuit, row.women.conditions.wetsuit);
            (m.is_none() || w.is_none())
                .then(|| format!("wetsuit is unknown: wetsuit_m = {m:?}, wetsuit_w = {w:?}"))
        });

        let rows = self.filter(rows, &mut log, ExclusionRule::ImplausibleDuration, |row| {
            let reasons = Gender::BOTH
                .iter()
                .flat_map(|gender| {
                    let summary = row.summary(*gender);
                    self.config.sports.iter().filter_map(move |sport| {
                        let mean = summary.mean(*sport).unwrap_or(0.0);
                        (mean < self.config.cleaning.min_duration_s).then(|| {
                            format!(
                                "{sport}_mean_{} = {mean:.1} < {}",
                                gender.suffix(),
                                self.config.cleaning.min_duration_s
                            )
                        })
                    })
                })
                .collect::<Vec<_>>();
            (!reasons.is_empty()).then(|| reasons.join(" or "))
        });

        let rows = if self.config.cleaning.drop_negative_gaps {
            self.filter(rows, &mut log, ExclusionRule::NegativeGap, |row| {
                self.negative_gaps(row)
            })
        } else {
            for row in &rows {
                if let Some(reason) = self.negative_gaps(row) {
                    warn!(event_id = row.event_id, %reason, "negative gap kept");
                }
            }
            rows
        };

        let rows = self.filter(rows, &mut log, ExclusionRule::DistanceNotAllowed, |row| {
            (!self.config.fields.allows_distance(&row.distance_category)).then(|| {
                format!(
                    "prog_distance_category = '{}' not in {:?}",
                    row.distance_category,
                    self.config
                        .fields
                        .distance_categories
                        .iter()
                        .map(|c| c.as_str())
                        .collect::<Vec<_>>()
                )
            })
        });

        let mut rows = if self.config.cleaning.remove_extreme_diffs {
            self.remove_extreme_gaps(rows, &mut log)
        } else {
            rows
        };

        for row in &mut rows {
            for (index, event_id) in &self.config.outliers {
                if *event_id != row.event_id {
                    continue;
                }
                if let Some(sport) = self.config.sports.get(*index) {
                    info!(event_id = row.event_id, %sport, "discipline suppressed by outlier override");
                    row.suppressed.insert(*sport);
                }
            }
        }

        for row in &rows {
            for gender in Gender::BOTH {
                let conditions = row.summary(gender).conditions;
                let Some(kind) = conditions.inconsistency() else {
                    continue;
                };
                let water_temperature = conditions.water_temperature.unwrap_or_default();
                if self.known.contains(row.event_id, gender) {
                    warn!(event_id = row.event_id, %gender, %kind, water_temperature, "known inconsistency kept");
                    continue;
                }
                return Err(ReconcileError::UnresolvedInconsistency {
                    event_id: row.event_id,
                    gender,
                    kind,
                    water_temperature,
                });
            }
        }

        Ok((rows, log))
    }

    fn filter(
        &self,
        rows: Vec<EventRow>,
        log: &mut ExclusionLog,
        rule: ExclusionRule,
        reject: impl Fn(&EventRow) -> Option<String>,
    ) -> Vec<EventRow> {
        rows.into_iter()
            .filter(|row| match reject(row) {
                Some(reason) => {
                    record_exclusion(log, row.event_id, rule, reason);
                    false
                }
                None => true,
            })
            .collect()
    }

    fn negative_gaps(&self, row: &EventRow) -> Option<String> {
        let reasons = self
            .config
            .sports
            .iter()
            .filter_map(|sport| {
                let gap = row.gap(*sport)?;
                (gap.seconds < 0.0).then(|| format!("{sport} gap {:.2} < 0", gap.seconds))
            })
            .collect::<Vec<_>>();
        (!reasons.is_empty()).then(|| reasons.join(" or "))
    }

    /// Quantiles are recomputed per sport over the rows still standing.
    fn remove_extreme_gaps(&self, mut rows: Vec<EventRow>, log: &mut ExclusionLog) -> Vec<EventRow> {
        let q_min = self.config.cleaning.quantile_min;
        let q_max = self.config.cleaning.quantile_max;
        for sport in self.config.sports.clone() {
            let percents = rows
                .iter()
                .filter_map(|row| row.gap(sport).map(|g| g.percent))
                .collect::<Vec<_>>();
            let (Some(low), Some(high)) = (quantile(&percents, q_min), quantile(&percents, q_max))
            else {
                continue;
            };
            rows = self.filter(rows, log, ExclusionRule::ExtremeGap, |row| {
                let percent = row.gap(sport)?.percent;
                (percent <= low || percent >= high).then(|| {
                    format!(
                        "{sport} gap percent {percent:.4} outside ({low:.4}, {high:.4}) [q{q_min}, q{q_max}]"
                    )
                })
            });
        }
        rows
    }
}

/// False when an outlier override marked this row's `sport` times as bad.
pub fn is_usable(row: &EventRow, sport: Discipline) -> bool {
    !row.is_suppressed(sport)
}
