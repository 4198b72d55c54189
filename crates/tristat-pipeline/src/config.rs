use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tristat_adapters::{FieldRules, HarvestPlan};
use tristat_core::{Discipline, EventId};

pub const DEFAULT_CONFIG_FILE: &str = "tristat.yaml";

/// Everything a run needs, built once and passed into each stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub fields: FieldRules,
    pub harvest: HarvestPlan,
    pub sports: Vec<Discipline>,
    pub mean_computation: RankWindow,
    /// Seconds behind the fastest swim+T1+bike that still count as front pack.
    pub pack_duration_s: f64,
    pub level: LevelSettings,
    pub cleaning: CleaningSettings,
    /// API category id -> group name used in reports ("games", "wcs", ...).
    pub event_category_mapping: BTreeMap<u32, String>,
    /// `(discipline index into sports, event id)` measurements known to be bad.
    pub outliers: Vec<(usize, EventId)>,
    pub paths: DataPaths,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fields: FieldRules::default(),
            harvest: HarvestPlan::default(),
            sports: Discipline::SPORTS.to_vec(),
            mean_computation: RankWindow::default(),
            pack_duration_s: 30.0,
            level: LevelSettings::default(),
            cleaning: CleaningSettings::default(),
            event_category_mapping: BTreeMap::from([
                (343, "games".to_string()),
                (345, "games".to_string()),
                (346, "games".to_string()),
                (349, "world-cup".to_string()),
                (351, "wcs".to_string()),
                (624, "wcs".to_string()),
            ]),
            outliers: Vec::new(),
            paths: DataPaths::default(),
        }
    }
}

/// Half-open `[i_first, i_last)` slice over values sorted fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankWindow {
    pub i_first: usize,
    pub i_last: usize,
}

impl Default for RankWindow {
    fn default() -> Self {
        Self {
            i_first: 4,
            i_last: 9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelSettings {
    pub n_top: usize,
    /// Rank assumed for athletes missing from a year's ranking.
    pub default_ranking: f64,
}

impl Default for LevelSettings {
    fn default() -> Self {
        Self {
            n_top: 10,
            default_ranking: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningSettings {
    pub n_results_min: usize,
    pub min_duration_s: f64,
    pub drop_negative_gaps: bool,
    pub remove_extreme_diffs: bool,
    pub quantile_min: f64,
    pub quantile_max: f64,
}

impl Default for CleaningSettings {
    fn default() -> Self {
        Self {
            n_results_min: 10,
            min_duration_s: 300.0,
            drop_negative_gaps: true,
            remove_extreme_diffs: false,
            quantile_min: 0.05,
            quantile_max: 0.95,
        }
    }
}

/// Relative paths are resolved against `data_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPaths {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub manual_wetsuit: PathBuf,
    pub rankings_men: PathBuf,
    pub rankings_women: PathBuf,
    pub known_inconsistencies: PathBuf,
}

impl Default for DataPaths {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_dir: PathBuf::from("cache"),
            reports_dir: PathBuf::from("reports"),
            manual_wetsuit: PathBuf::from("manual_labelled_wetsuit.json"),
            rankings_men: PathBuf::from("years_id_rankings_m.json"),
            rankings_women: PathBuf::from("years_id_rankings_w.json"),
            known_inconsistencies: PathBuf::from("known_inconsistencies.yaml"),
        }
    }
}

impl DataPaths {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.resolve(&self.cache_dir)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.resolve(&self.reports_dir)
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// `TRISTAT_CONFIG` picks the file (defaults apply when it does not exist);
    /// `TRISTAT_DATA_DIR` overrides `paths.data_dir`.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("TRISTAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        if let Ok(data_dir) = std::env::var("TRISTAT_DATA_DIR") {
            config.paths.data_dir = PathBuf::from(data_dir);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let window = self.mean_computation;
        ensure!(
            window.i_first < window.i_last,
            "mean_computation: i_first ({}) must be below i_last ({})",
            window.i_first,
            window.i_last
        );
        ensure!(!self.sports.is_empty(), "sports must not be empty");
        ensure!(
            self.sports.iter().all(Discipline::is_required),
            "sports must only list swim, bike and run: {:?}",
            self.sports
        );
        ensure!(
            self.cleaning.quantile_min < self.cleaning.quantile_max,
            "cleaning: quantile_min must be below quantile_max"
        );
        if let Some((index, event_id)) = self
            .outliers
            .iter()
            .find(|(index, _)| *index >= self.sports.len())
        {
            anyhow::bail!("outlier ({index}, {event_id}) refers to a sport index outside {:?}", self.sports);
        }
        Ok(())
    }

    pub fn event_category(&self, category_ids: &[u32]) -> Option<String> {
        category_ids
            .iter()
            .find_map(|id| self.event_category_mapping.get(id).cloned())
    }
}
