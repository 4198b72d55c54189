//! Run reports: JSON dataset and logs, a markdown exclusion report and
//! parquet snapshots with a checksummed manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, RecordBatch, StringArray,
    UInt64Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tristat_core::{Discipline, EventRow, ExclusionLog, Gender, ProgramSummary};
use uuid::Uuid;

use crate::{ReconcileOutcome, RunCounts};

pub const DATASET_FILE: &str = "dataset.json";
pub const EXCLUSIONS_FILE: &str = "exclusions.json";
pub const CONFLICTS_FILE: &str = "conflicts.json";
pub const REPORT_FILE: &str = "exclusion_report.md";
pub const RUN_FILE: &str = "run.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: RunCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct WrittenReports {
    pub dataset: PathBuf,
    pub exclusions: PathBuf,
    pub report: PathBuf,
    pub parquet_manifest: PathBuf,
}

pub async fn write_reports(
    reports_dir: &Path,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: &ReconcileOutcome,
) -> Result<WrittenReports> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let run = RunRecord {
        run_id,
        started_at,
        finished_at,
        counts: outcome.counts,
    };
    write_json(&reports_dir.join(RUN_FILE), &run).await?;

    let dataset = reports_dir.join(DATASET_FILE);
    write_json(&dataset, &outcome.rows).await?;
    let exclusions = reports_dir.join(EXCLUSIONS_FILE);
    write_json(&exclusions, &outcome.exclusions).await?;
    write_json(&reports_dir.join(CONFLICTS_FILE), &outcome.conflicts).await?;

    let report = reports_dir.join(REPORT_FILE);
    fs::write(&report, exclusion_report_markdown(&run, outcome))
        .await
        .with_context(|| format!("writing {}", report.display()))?;

    let parquet_manifest = export_parquet_snapshots(reports_dir, outcome).await?;
    Ok(WrittenReports {
        dataset,
        exclusions,
        report,
        parquet_manifest,
    })
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Exclusions grouped by rule, followed by the condition conflicts.
pub fn exclusion_report_markdown(run: &RunRecord, outcome: &ReconcileOutcome) -> String {
    let mut by_rule: BTreeMap<&str, Vec<(u64, &str)>> = BTreeMap::new();
    for record in outcome.exclusions.iter() {
        by_rule
            .entry(record.rule.as_str())
            .or_default()
            .push((record.event_id, record.reason.as_str()));
    }

    let mut lines = vec![
        "# Reconciliation Report".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!("- Events loaded: {}", run.counts.loaded),
        format!("- Events kept: {}", run.counts.kept),
        format!("- Events excluded: {}", run.counts.excluded),
        format!("- Condition conflicts: {}", run.counts.conflicts),
        String::new(),
        "## Exclusions by Rule".to_string(),
    ];
    for (rule, events) in &by_rule {
        lines.push(format!("- {}: {}", rule, events.len()));
    }
    for (rule, events) in &by_rule {
        lines.push(String::new());
        lines.push(format!("### {rule}"));
        lines.push(String::new());
        lines.push("| event_id | reason |".to_string());
        lines.push("|---|---|".to_string());
        for (event_id, reason) in events {
            lines.push(format!("| {} | {} |", event_id, markdown_cell(reason)));
        }
    }

    if !outcome.conflicts.is_empty() {
        lines.push(String::new());
        lines.push("## Condition Conflicts".to_string());
        lines.push(String::new());
        lines.push("| event_id | gender | field | candidates | chosen |".to_string());
        lines.push("|---|---|---|---|---|".to_string());
        for conflict in outcome.conflicts.iter() {
            let candidates = conflict
                .candidates
                .iter()
                .map(|c| format!("{} ({:?})", c.value, c.source))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!(
                "| {} | {} | {:?} | {} | {} |",
                conflict.event_id,
                conflict.gender,
                conflict.field,
                markdown_cell(&candidates),
                markdown_cell(&conflict.chosen),
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

fn markdown_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', "<br>")
}

async fn export_parquet_snapshots(
    reports_dir: &Path,
    outcome: &ReconcileOutcome,
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let events_path = snapshot_dir.join("event_rows.parquet");
    let exclusions_path = snapshot_dir.join("exclusions.parquet");
    write_parquet(&events_path, event_rows_batch(&outcome.rows)?)?;
    write_parquet(&exclusions_path, exclusions_batch(&outcome.exclusions)?)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("event_rows", reports_dir, &events_path)?,
            manifest_entry("exclusions", reports_dir, &exclusions_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    write_json(&manifest_path, &manifest).await?;
    Ok(manifest_path)
}

/// Accumulates named columns of a flat record batch.
#[derive(Default)]
struct Columns {
    fields: Vec<ArrowField>,
    arrays: Vec<ArrayRef>,
}

impl Columns {
    fn push(&mut self, name: impl Into<String>, nullable: bool, array: ArrayRef) {
        self.fields
            .push(ArrowField::new(name, array.data_type().clone(), nullable));
        self.arrays.push(array);
    }

    fn utf8<'a>(&mut self, name: impl Into<String>, values: impl Iterator<Item = Option<&'a str>>) {
        self.push(name, true, Arc::new(StringArray::from(values.collect::<Vec<_>>())));
    }

    fn f64(&mut self, name: impl Into<String>, values: impl Iterator<Item = Option<f64>>) {
        self.push(name, true, Arc::new(Float64Array::from(values.collect::<Vec<_>>())));
    }

    fn bool(&mut self, name: impl Into<String>, values: impl Iterator<Item = Option<bool>>) {
        self.push(name, true, Arc::new(BooleanArray::from(values.collect::<Vec<_>>())));
    }

    fn finish(self) -> Result<RecordBatch> {
        let schema = Arc::new(Schema::new(self.fields));
        RecordBatch::try_new(schema, self.arrays).context("building record batch")
    }
}

fn event_rows_batch(rows: &[EventRow]) -> Result<RecordBatch> {
    let mut columns = Columns::default();
    columns.push(
        "event_id",
        false,
        Arc::new(UInt64Array::from(rows.iter().map(|r| r.event_id).collect::<Vec<_>>())),
    );
    columns.utf8("event_title", rows.iter().map(|r| Some(r.event_title.as_str())));
    columns.utf8("event_venue", rows.iter().map(|r| Some(r.event_venue.as_str())));
    columns.utf8(
        "event_country_noc",
        rows.iter().map(|r| Some(r.event_country_noc.as_str())),
    );
    let dates = rows
        .iter()
        .map(|r| r.event_date.format("%Y-%m-%d").to_string())
        .collect::<Vec<_>>();
    columns.utf8("event_date", dates.iter().map(|d| Some(d.as_str())));
    columns.push(
        "event_year",
        false,
        Arc::new(Int32Array::from(rows.iter().map(|r| r.event_year).collect::<Vec<_>>())),
    );
    columns.utf8("event_category", rows.iter().map(|r| r.event_category.as_deref()));
    columns.utf8(
        "distance_category",
        rows.iter().map(|r| Some(r.distance_category.as_str())),
    );

    for gender in Gender::BOTH {
        let g = gender.suffix();
        let summaries = rows.iter().map(|r| r.summary(gender)).collect::<Vec<_>>();
        program_columns(&mut columns, g, &summaries);
    }

    for sport in Discipline::SPORTS {
        let gap = |r: &EventRow| r.gap(sport).filter(|_| !r.is_suppressed(sport));
        columns.f64(
            format!("{sport}_diff"),
            rows.iter().map(|r| gap(r).map(|g| g.seconds)),
        );
        columns.f64(
            format!("{sport}_diff_percent"),
            rows.iter().map(|r| gap(r).map(|g| g.percent)),
        );
    }
    columns.finish()
}

fn program_columns(columns: &mut Columns, g: &str, summaries: &[&ProgramSummary]) {
    for discipline in Discipline::ALL {
        let stats = summaries.iter().map(|s| s.stats(discipline)).collect::<Vec<_>>();
        columns.f64(
            format!("{discipline}_mean_{g}"),
            stats.iter().map(|s| s.map(|s| s.mean)),
        );
        columns.f64(
            format!("{discipline}_std_{g}"),
            stats.iter().map(|s| s.map(|s| s.std)),
        );
        columns.f64(
            format!("{discipline}_mean_{g}_last"),
            stats.iter().map(|s| s.map(|s| s.mean_last)),
        );
    }
    columns.f64(
        format!("n_finishers_{g}"),
        summaries.iter().map(|s| Some(s.n_finishers as f64)),
    );
    columns.f64(
        format!("pack_size_{g}"),
        summaries.iter().map(|s| Some(s.pack_size as f64)),
    );
    columns.bool(
        format!("is_winner_in_front_pack_{g}"),
        summaries.iter().map(|s| Some(s.is_winner_in_front_pack)),
    );
    columns.bool(
        format!("is_best_runner_in_front_pack_{g}"),
        summaries.iter().map(|s| Some(s.is_best_runner_in_front_pack)),
    );
    columns.bool(
        format!("best_runner_wins_{g}"),
        summaries.iter().map(|s| Some(s.best_runner_wins)),
    );
    columns.f64(
        format!("second_delay_{g}"),
        summaries.iter().map(|s| Some(s.second_delay_s)),
    );
    columns.utf8(format!("winner_{g}"), summaries.iter().map(|s| s.winner.as_deref()));
    columns.utf8(
        format!("winner_country_{g}"),
        summaries.iter().map(|s| s.winner_country.as_deref()),
    );
    columns.f64(format!("age_mean_{g}"), summaries.iter().map(|s| s.age_mean));
    columns.f64(format!("age_std_{g}"), summaries.iter().map(|s| s.age_std));
    columns.f64(format!("level_{g}"), summaries.iter().map(|s| s.level));
    columns.f64(
        format!("air_temperature_{g}"),
        summaries.iter().map(|s| s.conditions.air_temperature),
    );
    columns.f64(
        format!("water_temperature_{g}"),
        summaries.iter().map(|s| s.conditions.water_temperature),
    );
    columns.bool(
        format!("wetsuit_{g}"),
        summaries.iter().map(|s| s.conditions.wetsuit),
    );
}

fn exclusions_batch(log: &ExclusionLog) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("event_id", DataType::UInt64, false),
        ArrowField::new("rule", DataType::Utf8, false),
        ArrowField::new("reason", DataType::Utf8, false),
    ]));
    let event_ids = UInt64Array::from(log.iter().map(|r| r.event_id).collect::<Vec<_>>());
    let rules = StringArray::from(log.iter().map(|r| Some(r.rule.as_str())).collect::<Vec<_>>());
    let reasons = StringArray::from(
        log.iter()
            .map(|r| Some(r.reason.as_str()))
            .collect::<Vec<_>>(),
    );
    RecordBatch::try_new(
        schema,
        vec![Arc::new(event_ids), Arc::new(rules), Arc::new(reasons)],
    )
    .context("building exclusions record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Summaries of the most recent `runs` report directories, newest first.
pub fn report_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut records = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let run_path = entry.path().join(RUN_FILE);
            let text = std::fs::read_to_string(&run_path).ok()?;
            let record: RunRecord = serde_json::from_str(&text).ok()?;
            Some((record, entry.path()))
        })
        .collect::<Vec<_>>();
    records.sort_by(|a, b| b.0.finished_at.cmp(&a.0.finished_at));

    let mut lines = vec!["# Reconciliation Runs".to_string(), String::new()];
    for (record, dir) in records.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", record.run_id));
        lines.push(format!("- finished: {}", record.finished_at));
        lines.push(format!(
            "- events: {} loaded, {} kept, {} excluded",
            record.counts.loaded, record.counts.kept, record.counts.excluded
        ));
        lines.push(format!("- condition conflicts: {}", record.counts.conflicts));
        lines.push(format!("- dataset: `{}`", dir.join(DATASET_FILE).display()));
        let report = dir.join(REPORT_FILE);
        if report.exists() {
            lines.push(format!("- exclusion report: `{}`", report.display()));
        }
        let manifest = dir.join("snapshots").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
