//! Reconciliation pipeline: cached events in, cleaned per-event rows plus
//! exclusion and conflict logs out.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};
use tristat_adapters::{EventVerdict, FieldReconciler};
use tristat_core::{
    ConflictLog, EventDocument, EventId, EventRow, ExclusionLog, ExclusionRule, ProgramSummary,
    ReconcileError,
};
use tristat_storage::EventCache;
use uuid::Uuid;

pub mod aggregate;
pub mod clean;
pub mod conditions;
pub mod config;
pub mod export;
pub mod level;
pub mod merge;

pub use aggregate::ResultsAggregator;
pub use clean::{DatasetCleaner, KnownInconsistencies, KnownInconsistency};
pub use conditions::{ConditionExtractor, ManualWetsuitTable, NoLabeler, WetsuitLabeler};
pub use config::PipelineConfig;
pub use level::{RankingSnapshot, RankingSnapshots};
pub use merge::EventMerger;

pub const CRATE_NAME: &str = "tristat-pipeline";

pub(crate) fn record_exclusion(
    log: &mut ExclusionLog,
    event_id: EventId,
    rule: ExclusionRule,
    reason: impl Into<String>,
) {
    let reason = reason.into();
    info!(event_id, rule = %rule, reason = %reason, "event excluded");
    log.push(event_id, rule, reason);
}

/// Everything `reconcile` reads besides the cached events.
pub struct ReconcileContext<'a> {
    pub config: &'a PipelineConfig,
    pub manual: &'a ManualWetsuitTable,
    pub rankings: &'a RankingSnapshots,
    pub known: &'a KnownInconsistencies,
    pub labeler: &'a dyn WetsuitLabeler,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub loaded: usize,
    pub merged: usize,
    pub kept: usize,
    pub excluded: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    /// Sorted by (event date, event id).
    pub rows: Vec<EventRow>,
    pub exclusions: ExclusionLog,
    pub conflicts: ConflictLog,
    pub counts: RunCounts,
}

/// Pure over its inputs: the same cache and context give the same outcome.
pub fn reconcile(
    events: &[(EventId, EventDocument)],
    ctx: &ReconcileContext<'_>,
) -> Result<ReconcileOutcome, ReconcileError> {
    let config = ctx.config;
    let reconciler = FieldReconciler::new(&config.fields);
    let aggregator = ResultsAggregator::new(config);
    let extractor = ConditionExtractor::new(ctx.manual, ctx.labeler);
    let merger = EventMerger::new(config);

    let mut ordered = events.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|(event_id, _)| *event_id);

    let mut exclusions = ExclusionLog::new();
    let mut conflicts = ConflictLog::new();
    let mut merged = Vec::new();

    for (event_id, document) in ordered {
        let event_id = *event_id;
        let _span = info_span!("reconcile_event", event_id).entered();

        let event = match reconciler.reconcile_event(event_id, document)? {
            EventVerdict::Accepted(event) => event,
            EventVerdict::Excluded(reasons) => {
                for (rule, reason) in reasons {
                    record_exclusion(&mut exclusions, event_id, rule, reason);
                }
                continue;
            }
        };

        let mut summaries: Vec<ProgramSummary> = Vec::with_capacity(2);
        let mut failed = false;
        for program in [&event.men, &event.women] {
            match aggregator.summarize(program) {
                Ok(summary) => summaries.push(summary),
                Err((rule, reason)) => {
                    record_exclusion(&mut exclusions, event_id, rule, reason);
                    failed = true;
                }
            }
        }
        if failed {
            continue;
        }

        for (summary, program) in summaries.iter_mut().zip([&event.men, &event.women]) {
            summary.level = ctx.rankings.get(program.gender).and_then(|snapshot| {
                level::program_level(
                    program.doc,
                    program.event_date.year(),
                    snapshot,
                    config.level,
                )
            });
            let (conditions, program_conflicts) =
                extractor.extract(event_id, program.gender, program.doc);
            summary.conditions = conditions;
            conflicts.extend(program_conflicts);
        }

        let women = summaries.pop();
        let men = summaries.pop();
        let (Some(men), Some(women)) = (men, women) else {
            continue;
        };
        match merger.merge(&event, men, women) {
            Ok(row) => merged.push(row),
            Err((rule, reason)) => record_exclusion(&mut exclusions, event_id, rule, reason),
        }
    }

    let n_merged = merged.len();
    let (mut rows, cleaned_out) = DatasetCleaner::new(config, ctx.known).clean(merged)?;
    exclusions.extend(cleaned_out);
    rows.sort_by(|a, b| (a.event_date, a.event_id).cmp(&(b.event_date, b.event_id)));

    let counts = RunCounts {
        loaded: events.len(),
        merged: n_merged,
        kept: rows.len(),
        excluded: exclusions.len(),
        conflicts: conflicts.len(),
    };
    info!(
        loaded = counts.loaded,
        kept = counts.kept,
        excluded = counts.excluded,
        conflicts = counts.conflicts,
        "reconciliation finished"
    );
    Ok(ReconcileOutcome {
        rows,
        exclusions,
        conflicts,
        counts,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: RunCounts,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

pub struct Pipeline {
    config: PipelineConfig,
    labeler: Box<dyn WetsuitLabeler>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            labeler: Box::new(NoLabeler),
        }
    }

    pub fn with_labeler(mut self, labeler: Box<dyn WetsuitLabeler>) -> Self {
        self.labeler = labeler;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> EventCache {
        EventCache::new(self.config.paths.cache_dir())
    }

    /// Reads every input up front, reconciles, then writes a report directory.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let paths = &self.config.paths;

        let events = self.cache().load_all().await?;
        let manual = ManualWetsuitTable::load(&paths.resolve(&paths.manual_wetsuit))?;
        let rankings = RankingSnapshots {
            men: RankingSnapshot::load(&paths.resolve(&paths.rankings_men))?,
            women: RankingSnapshot::load(&paths.resolve(&paths.rankings_women))?,
        };
        let known = KnownInconsistencies::load(&paths.resolve(&paths.known_inconsistencies))?;
        info!(
            %run_id,
            events = events.len(),
            manual_labels = manual.len(),
            known_inconsistencies = known.len(),
            "inputs loaded"
        );

        let ctx = ReconcileContext {
            config: &self.config,
            manual: &manual,
            rankings: &rankings,
            known: &known,
            labeler: self.labeler.as_ref(),
        };
        let outcome = reconcile(&events, &ctx).context("reconciliation aborted")?;

        let finished_at = Utc::now();
        let reports_dir: PathBuf = paths.reports_dir().join(run_id.to_string());
        let written =
            export::write_reports(&reports_dir, run_id, started_at, finished_at, &outcome).await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            counts: outcome.counts,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: written.parquet_manifest.display().to_string(),
        })
    }
}
