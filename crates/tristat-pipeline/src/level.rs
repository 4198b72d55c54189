//! Field strength from historical ranking snapshots. Lower is stronger.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use tristat_core::raw::loose_f64;
use tristat_core::{Gender, Position, ProgramDocument};

use crate::config::LevelSettings;

/// One gender's rankings: year -> athlete ids, best first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankingSnapshot {
    years: BTreeMap<i32, Vec<u64>>,
}

impl RankingSnapshot {
    /// Rows are `[athlete_id, ...]`; only the leading id is read.
    pub fn from_json(value: &str) -> Result<Self> {
        let raw: BTreeMap<String, Vec<Vec<JsonValue>>> =
            serde_json::from_str(value).context("parsing ranking snapshot")?;
        let mut years = BTreeMap::new();
        for (year, rows) in raw {
            let year: i32 = year
                .trim()
                .parse()
                .with_context(|| format!("ranking year `{year}` is not a number"))?;
            let ids = rows
                .iter()
                .filter_map(|row| row.first().and_then(loose_f64))
                .map(|id| id as u64)
                .collect();
            years.insert(year, ids);
        }
        Ok(Self { years })
    }

    /// `None` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("loading {}", path.display()))
            .map(Some)
    }

    pub fn insert_year(&mut self, year: i32, athlete_ids: Vec<u64>) {
        self.years.insert(year, athlete_ids);
    }

    pub fn has_year(&self, year: i32) -> bool {
        self.years.contains_key(&year)
    }

    /// 1-based rank of `athlete_id` in `year`.
    pub fn rank(&self, year: i32, athlete_id: u64) -> Option<usize> {
        self.years
            .get(&year)?
            .iter()
            .position(|id| *id == athlete_id)
            .map(|i| i + 1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankingSnapshots {
    pub men: Option<RankingSnapshot>,
    pub women: Option<RankingSnapshot>,
}

impl RankingSnapshots {
    pub fn get(&self, gender: Gender) -> Option<&RankingSnapshot> {
        match gender {
            Gender::Men => self.men.as_ref(),
            Gender::Women => self.women.as_ref(),
        }
    }
}

/// Mean rank of the first `n_top` athletes in `year`, unranked athletes
/// counting as `default_ranking`.
pub fn level_for_year(
    snapshot: &RankingSnapshot,
    year: i32,
    athletes: &[u64],
    settings: LevelSettings,
) -> Option<f64> {
    if !snapshot.has_year(year) {
        return None;
    }
    let ranks = athletes
        .iter()
        .take(settings.n_top)
        .map(|id| {
            snapshot
                .rank(year, *id)
                .map(|r| r as f64)
                .unwrap_or(settings.default_ranking)
        })
        .collect::<Vec<_>>();
    if ranks.is_empty() {
        return None;
    }
    Some(ranks.iter().sum::<f64>() / ranks.len() as f64)
}

/// Averages the start-number and result orderings over the event year and
/// its two neighbours; years missing from the snapshot are skipped.
pub fn program_level(
    doc: &ProgramDocument,
    year: i32,
    snapshot: &RankingSnapshot,
    settings: LevelSettings,
) -> Option<f64> {
    let mut entrants = doc
        .results
        .iter()
        .filter(|r| !matches!(r.position, Position::NonFinish(_)))
        .filter_map(|r| r.start_number().map(|start| (start, r.athlete_id)))
        .collect::<Vec<_>>();
    let by_result = entrants.iter().map(|(_, id)| *id).collect::<Vec<_>>();
    entrants.sort_by_key(|(start, _)| *start);
    let by_start = entrants.iter().map(|(_, id)| *id).collect::<Vec<_>>();

    let levels = [&by_start, &by_result]
        .into_iter()
        .flat_map(|order| {
            [year, year - 1, year + 1]
                .into_iter()
                .filter_map(move |y| level_for_year(snapshot, y, order, settings))
        })
        .collect::<Vec<_>>();
    if levels.is_empty() {
        return None;
    }
    Some(levels.iter().sum::<f64>() / levels.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(n_top: usize) -> LevelSettings {
        LevelSettings {
            n_top,
            default_ranking: 50.0,
        }
    }

    #[test]
    fn snapshot_reads_leading_ids() {
        let snapshot =
            RankingSnapshot::from_json(r#"{"2019": [[501, "A"], ["502", "B"]], "2020": []}"#)
                .unwrap();
        assert_eq!(snapshot.rank(2019, 502), Some(2));
        assert_eq!(snapshot.rank(2019, 9), None);
        assert!(snapshot.has_year(2020));
        assert!(!snapshot.has_year(2018));
    }

    #[test]
    fn only_top_n_count_and_unranked_default() {
        let mut snapshot = RankingSnapshot::default();
        snapshot.insert_year(2019, vec![1, 2, 3, 4]);
        assert_eq!(
            level_for_year(&snapshot, 2019, &[2, 4, 99, 1], settings(3)),
            Some((2.0 + 4.0 + 50.0) / 3.0)
        );
        assert_eq!(level_for_year(&snapshot, 2018, &[1], settings(3)), None);
        assert_eq!(level_for_year(&snapshot, 2019, &[], settings(3)), None);
    }

    #[test]
    fn program_level_averages_orderings_and_available_years() {
        let doc: ProgramDocument = serde_json::from_value(json!({
            "prog_name": "Elite Women",
            "event_id": 3,
            "event_title": "2019 WTS Bermuda",
            "event_date": "2019-04-27",
            "results": [
                {"athlete_id": 10, "position": 1, "start_num": 3},
                {"athlete_id": 20, "position": 2, "start_num": 1},
                {"athlete_id": 30, "position": "DNF", "start_num": 2},
                {"athlete_id": 40, "position": 3, "start_num": null},
            ]
        }))
        .unwrap();

        let mut snapshot = RankingSnapshot::default();
        snapshot.insert_year(2019, vec![20, 10]);
        snapshot.insert_year(2020, vec![10]);

        // n_top = 1: by start -> athlete 20, by result -> athlete 10.
        // 2019: start 1.0, result 2.0; 2020: start 50.0, result 1.0; 2018 missing.
        let level = program_level(&doc, 2019, &snapshot, settings(1)).unwrap();
        assert_eq!(level, (1.0 + 50.0 + 2.0 + 1.0) / 4.0);

        assert_eq!(
            program_level(&doc, 2010, &snapshot, settings(1)),
            None
        );
    }
}
