//! Results Aggregator: per-discipline order statistics and race-shape metrics
//! for one program.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use tracing::debug;
use tristat_adapters::ReconciledProgram;
use tristat_core::raw::parse_hms;
use tristat_core::{
    Conditions, Discipline, DisciplineStats, ExclusionRule, ProgramDocument, ProgramSummary,
};

use crate::config::{PipelineConfig, RankWindow};

/// A classified finisher with complete sport splits, in result order.
#[derive(Debug, Clone, PartialEq)]
pub struct Finisher {
    pub athlete_id: u64,
    pub place: u32,
    pub splits: BTreeMap<Discipline, u32>,
    pub age: Option<f64>,
}

impl Finisher {
    pub fn split(&self, discipline: Discipline) -> u32 {
        self.splits.get(&discipline).copied().unwrap_or(0)
    }

    pub fn start_to_t2(&self) -> u32 {
        self.split(Discipline::Swim) + self.split(Discipline::T1) + self.split(Discipline::Bike)
    }

    pub fn total(&self) -> u32 {
        Discipline::ALL.iter().map(|d| self.split(*d)).sum()
    }
}

/// Drops non-finishers and anyone without a positive swim, bike and run.
pub fn finishers(doc: &ProgramDocument, event_date: NaiveDate) -> Vec<Finisher> {
    let columns = doc.discipline_columns();
    doc.results
        .iter()
        .filter_map(|record| {
            let place = record.position.place()?;
            let splits = columns
                .iter()
                .map(|(idx, discipline)| {
                    let seconds = record
                        .splits
                        .get(*idx)
                        .and_then(|s| parse_hms(s))
                        .unwrap_or(0);
                    (*discipline, seconds)
                })
                .collect::<BTreeMap<_, _>>();
            let age = record
                .dob
                .as_deref()
                .and_then(|dob| NaiveDate::parse_from_str(dob.trim(), "%Y-%m-%d").ok())
                .or_else(|| {
                    record
                        .year_of_birth()
                        .and_then(|yob| NaiveDate::from_ymd_opt(yob, 7, 1))
                })
                .map(|born| age_in_years(born, event_date));
            Some(Finisher {
                athlete_id: record.athlete_id,
                place,
                splits,
                age,
            })
        })
        .filter(|f| Discipline::SPORTS.iter().all(|d| f.split(*d) > 0))
        .collect()
}

pub fn age_in_years(born: NaiveDate, on: NaiveDate) -> f64 {
    (on - born).num_days() as f64 / 365.25
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Sample standard deviation; needs two values.
pub fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Window over `sorted` from the fastest end, and the same window mirrored
/// from the slowest end.
pub fn window_stats(sorted: &[f64], window: RankWindow) -> DisciplineStats {
    let len = sorted.len();
    let head_end = window.i_last.min(len);
    let head = &sorted[window.i_first.min(head_end)..head_end];
    let tail_start = len.saturating_sub(window.i_last);
    let tail_end = len.saturating_sub(window.i_first).max(tail_start);
    let tail = &sorted[tail_start..tail_end];
    DisciplineStats {
        mean: mean(head).unwrap_or(0.0),
        std: std_dev(head).unwrap_or(0.0),
        mean_last: mean(tail).unwrap_or(0.0),
        std_last: std_dev(tail).unwrap_or(0.0),
        n_values: len,
    }
}

/// Position of the smallest value, first on ties.
fn argmin(values: impl Iterator<Item = u32>) -> Option<usize> {
    values
        .enumerate()
        .fold(None, |best: Option<(usize, u32)>, (i, v)| match best {
            Some((_, b)) if b <= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

pub struct ResultsAggregator<'c> {
    config: &'c PipelineConfig,
}

impl<'c> ResultsAggregator<'c> {
    pub fn new(config: &'c PipelineConfig) -> Self {
        Self { config }
    }

    /// Level and conditions are filled in by the caller.
    pub fn summarize(
        &self,
        program: &ReconciledProgram<'_>,
    ) -> Result<ProgramSummary, (ExclusionRule, String)> {
        let doc = program.doc;
        let window = self.config.mean_computation;
        let n_results_min = self.config.cleaning.n_results_min;
        let finishers = finishers(doc, program.event_date);

        if finishers.len() < n_results_min || finishers.is_empty() {
            return Err((
                ExclusionRule::InsufficientResults,
                format!("only {} results for {}", finishers.len(), doc.prog_name),
            ));
        }

        let mut disciplines = BTreeMap::new();
        for discipline in Discipline::ALL {
            let mut values = finishers
                .iter()
                .map(|f| f.split(discipline))
                .filter(|s| *s > 0)
                .map(f64::from)
                .collect::<Vec<_>>();
            if values.len() < n_results_min && self.config.sports.contains(&discipline) {
                return Err((
                    ExclusionRule::InsufficientResults,
                    format!(
                        "only {} results for {} for {discipline}",
                        values.len(),
                        doc.prog_name
                    ),
                ));
            }
            values.sort_by(f64::total_cmp);
            disciplines.insert(discipline, window_stats(&values, window));
        }

        let ages = finishers
            .iter()
            .skip(window.i_first)
            .take(window.i_last.saturating_sub(window.i_first))
            .filter_map(|f| f.age)
            .collect::<Vec<_>>();

        let fastest_to_t2 = finishers.iter().map(Finisher::start_to_t2).min().unwrap_or(0);
        let pack_limit = f64::from(fastest_to_t2) + self.config.pack_duration_s;
        let in_pack = |f: &Finisher| f64::from(f.start_to_t2()) <= pack_limit;
        let pack_size = finishers.iter().filter(|f| in_pack(f)).count();

        let best_runner = argmin(finishers.iter().map(|f| f.split(Discipline::Run)));
        let fastest_total = argmin(finishers.iter().map(Finisher::total));
        let is_best_runner_in_front_pack = best_runner
            .map(|i| in_pack(&finishers[i]))
            .unwrap_or(false);

        let winner = doc.results.first();
        let second = doc.results.get(1);
        let summary = ProgramSummary {
            program_id: program.program_id.to_string(),
            gender: program.gender,
            event_date: program.event_date,
            distance_category: program.distance_category.clone(),
            notes: doc.notes().to_string(),
            event_category_ids: doc.event_category_ids(),
            disciplines,
            n_finishers: finishers.len(),
            pack_size,
            is_winner_in_front_pack: in_pack(&finishers[0]),
            is_best_runner_in_front_pack,
            best_runner_wins: best_runner.is_some() && best_runner == fastest_total,
            second_delay_s: second_delay(doc, &finishers),
            winner: winner.and_then(|r| r.display_name()),
            winner_country: winner.and_then(|r| r.athlete_noc.clone()),
            second: second.and_then(|r| r.display_name()),
            second_country: second.and_then(|r| r.athlete_noc.clone()),
            age_mean: mean(&ages),
            age_std: sample_std_dev(&ages),
            level: None,
            conditions: Conditions::default(),
        };
        debug!(
            event_id = doc.event_id,
            program = %doc.prog_name,
            year = program.event_date.year(),
            n_finishers = summary.n_finishers,
            pack_size,
            "program summarized"
        );
        Ok(summary)
    }
}

/// Official total times of places 1 and 2 when the federation reports them,
/// otherwise the summed splits of the first two finishers.
fn second_delay(doc: &ProgramDocument, finishers: &[Finisher]) -> f64 {
    let has_totals = doc
        .results
        .first()
        .is_some_and(|r| r.total_time.is_some());
    if has_totals {
        let mut placed = doc
            .results
            .iter()
            .filter_map(|r| {
                let place = r.position.place()?;
                let total = r.total_time.as_deref().and_then(parse_hms)?;
                Some((place, total))
            })
            .collect::<Vec<_>>();
        placed.sort_by_key(|(place, _)| *place);
        if let [(1, first), (2, second), ..] = placed.as_slice() {
            return f64::from(*second) - f64::from(*first);
        }
    }
    match finishers {
        [first, second, ..] => f64::from(second.total()) - f64::from(first.total()),
        _ => 0.0,
    }
}
