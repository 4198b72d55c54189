use std::collections::BTreeMap;

use serde_json::json;
use tristat_core::{
    ConditionField, Discipline, EventDocument, EventId, ExclusionRule, Gender, InconsistencyKind,
    ProgramDocument, ReconcileError,
};
use tristat_pipeline::aggregate::window_stats;
use tristat_pipeline::config::RankWindow;
use tristat_pipeline::{
    reconcile, KnownInconsistencies, KnownInconsistency, ManualWetsuitTable, NoLabeler, Pipeline,
    PipelineConfig, RankingSnapshot, RankingSnapshots, ReconcileContext, ReconcileOutcome,
};
use tristat_storage::EventCache;

const HOT_WETSUIT_EVENT: EventId = 101;
const CLEAN_EVENT: EventId = 102;
const SINGLE_PROGRAM_EVENT: EventId = 103;
const MODIFIED_COURSE_EVENT: EventId = 104;
const MIXED_DISTANCE_EVENT: EventId = 105;
const SHORT_FIELD_EVENT: EventId = 106;
const NO_WETSUIT_INFO_EVENT: EventId = 107;

fn hms(seconds: u32) -> String {
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

struct ProgramFixture<'a> {
    gender: Gender,
    notes: &'a str,
    distance: &'a str,
    finishers: usize,
    /// Fastest swim, bike and run in seconds.
    base: (u32, u32, u32),
}

impl<'a> ProgramFixture<'a> {
    fn new(gender: Gender, notes: &'a str) -> Self {
        let base = match gender {
            Gender::Men => (1100, 3300, 1850),
            Gender::Women => (1200, 3700, 2100),
        };
        Self {
            gender,
            notes,
            distance: "standard",
            finishers: 6,
            base,
        }
    }

    fn distance(mut self, distance: &'a str) -> Self {
        self.distance = distance;
        self
    }

    fn finishers(mut self, finishers: usize) -> Self {
        self.finishers = finishers;
        self
    }

    fn build(&self, event_id: EventId) -> ProgramDocument {
        let id_base = match self.gender {
            Gender::Men => 1000,
            Gender::Women => 2000,
        };
        let (swim, bike, run) = self.base;
        let results = (0..self.finishers as u32)
            .map(|i| {
                let splits = [swim + i * 5, 40, bike + i * 10, 30, run + i * 20];
                json!({
                    "athlete_id": id_base + i,
                    "athlete_title": format!("{} Athlete {i}", self.gender),
                    "athlete_noc": "NZL",
                    "position": i + 1,
                    "total_time": hms(splits.iter().sum()),
                    "splits": splits.iter().map(|s| hms(*s)).collect::<Vec<_>>(),
                    "start_num": i + 1,
                    "athlete_yob": 1994,
                })
            })
            .collect::<Vec<_>>();
        serde_json::from_value(json!({
            "prog_name": self.gender.program_name(),
            "event_id": event_id,
            "event_title": format!("2019 World Triathlon Series Event {event_id}"),
            "event_venue": "Hamburg ",
            "event_date": "2019-07-14",
            "event_country_noc": "GER",
            "event_listing": format!("https://example.org/events/{event_id}"),
            "prog_distance_category": self.distance,
            "prog_notes": self.notes,
            "event_categories": [{"cat_id": 351, "cat_name": "World Championship Series"}],
            "headers": [
                {"name": "Swim", "distance": 1.5},
                {"name": "T1"},
                {"name": "Bike", "distance": 40},
                {"name": "T2"},
                {"name": "Run", "distance": 10},
            ],
            "results": results,
        }))
        .unwrap()
    }
}

fn event(event_id: EventId, programs: &[ProgramFixture<'_>]) -> (EventId, EventDocument) {
    let programs = programs
        .iter()
        .enumerate()
        .map(|(i, program)| ((event_id * 10 + i as u64).to_string(), program.build(event_id)))
        .collect::<BTreeMap<_, _>>();
    (event_id, EventDocument { programs })
}

fn fixture() -> Vec<(EventId, EventDocument)> {
    use Gender::{Men, Women};
    vec![
        event(
            HOT_WETSUIT_EVENT,
            &[
                ProgramFixture::new(Men, "Water Temperature: 22.5"),
                ProgramFixture::new(Women, "Water Temperature: 22.5. Wetsuits allowed."),
            ],
        ),
        event(
            CLEAN_EVENT,
            &[
                ProgramFixture::new(Men, "Water Temperature: 18.0"),
                ProgramFixture::new(Women, "Water Temperature: 18.0"),
            ],
        ),
        event(
            SINGLE_PROGRAM_EVENT,
            &[ProgramFixture::new(Women, "Water Temperature: 18.0")],
        ),
        event(
            MODIFIED_COURSE_EVENT,
            &[
                ProgramFixture::new(Men, "Swim was shortened because of fog."),
                ProgramFixture::new(Women, "Water Temperature: 18.0"),
            ],
        ),
        event(
            MIXED_DISTANCE_EVENT,
            &[
                ProgramFixture::new(Men, "Water Temperature: 18.0").distance("sprint"),
                ProgramFixture::new(Women, "Water Temperature: 18.0"),
            ],
        ),
        event(
            SHORT_FIELD_EVENT,
            &[
                ProgramFixture::new(Men, "Water Temperature: 18.0"),
                ProgramFixture::new(Women, "Water Temperature: 18.0").finishers(2),
            ],
        ),
        event(
            NO_WETSUIT_INFO_EVENT,
            &[ProgramFixture::new(Men, ""), ProgramFixture::new(Women, "")],
        ),
    ]
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.mean_computation = RankWindow {
        i_first: 1,
        i_last: 4,
    };
    config.cleaning.n_results_min = 3;
    config
}

fn reviewed_hot_wetsuit() -> KnownInconsistencies {
    KnownInconsistencies::new(vec![KnownInconsistency {
        event_id: HOT_WETSUIT_EVENT,
        gender: Gender::Women,
        note: "organiser allowed wetsuits despite 22.5C water".into(),
    }])
}

fn run(
    events: &[(EventId, EventDocument)],
    config: &PipelineConfig,
    manual: &ManualWetsuitTable,
    rankings: &RankingSnapshots,
    known: &KnownInconsistencies,
) -> Result<ReconcileOutcome, ReconcileError> {
    let ctx = ReconcileContext {
        config,
        manual,
        rankings,
        known,
        labeler: &NoLabeler,
    };
    reconcile(events, &ctx)
}

#[test]
fn unreviewed_hot_wetsuit_aborts_the_run() {
    let err = run(
        &fixture(),
        &config(),
        &ManualWetsuitTable::default(),
        &RankingSnapshots::default(),
        &KnownInconsistencies::default(),
    )
    .unwrap_err();
    match err {
        ReconcileError::UnresolvedInconsistency {
            event_id,
            gender,
            kind,
            water_temperature,
        } => {
            assert_eq!(event_id, HOT_WETSUIT_EVENT);
            assert_eq!(gender, Gender::Women);
            assert_eq!(kind, InconsistencyKind::HotWetsuit);
            assert_eq!(water_temperature, 22.5);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn reviewed_inconsistency_passes_with_conflict_logged() {
    let outcome = run(
        &fixture(),
        &config(),
        &ManualWetsuitTable::default(),
        &RankingSnapshots::default(),
        &reviewed_hot_wetsuit(),
    )
    .unwrap();

    let kept = outcome.rows.iter().map(|r| r.event_id).collect::<Vec<_>>();
    assert_eq!(kept, vec![HOT_WETSUIT_EVENT, CLEAN_EVENT]);

    let hot = &outcome.rows[0];
    assert_eq!(hot.women.conditions.wetsuit, Some(true));
    assert_eq!(hot.men.conditions.wetsuit, Some(false));
    assert_eq!(hot.women.conditions.water_temperature, Some(22.5));
    assert!(outcome
        .conflicts
        .has_conflict(HOT_WETSUIT_EVENT, Gender::Women, ConditionField::Wetsuit));
    assert!(!outcome
        .conflicts
        .has_conflict(HOT_WETSUIT_EVENT, Gender::Men, ConditionField::Wetsuit));

    // Window 1..4 over 1100, 1105, ... picks 1105, 1110, 1115.
    assert_eq!(hot.men.mean(Discipline::Swim), Some(1110.0));
    assert_eq!(hot.women.mean(Discipline::Swim), Some(1210.0));
    assert_eq!(hot.gap(Discipline::Swim).unwrap().seconds, 100.0);
    assert_eq!(hot.event_category.as_deref(), Some("wcs"));
    assert_eq!(hot.event_venue, "Hamburg");
}

#[test]
fn every_event_is_kept_or_excluded_exactly_once() {
    let events = fixture();
    let outcome = run(
        &events,
        &config(),
        &ManualWetsuitTable::default(),
        &RankingSnapshots::default(),
        &reviewed_hot_wetsuit(),
    )
    .unwrap();

    for (event_id, _) in &events {
        let kept = outcome.rows.iter().any(|r| r.event_id == *event_id);
        let excluded = outcome.exclusions.contains(*event_id);
        assert!(kept ^ excluded, "event {event_id}: kept={kept} excluded={excluded}");
    }

    let rule = |id| outcome.exclusions.get(id).map(|r| r.rule);
    assert_eq!(rule(SINGLE_PROGRAM_EVENT), Some(ExclusionRule::NotEnoughPrograms));
    assert_eq!(rule(MODIFIED_COURSE_EVENT), Some(ExclusionRule::ModifiedCourse));
    assert_eq!(rule(MIXED_DISTANCE_EVENT), Some(ExclusionRule::DistanceMismatch));
    assert_eq!(rule(SHORT_FIELD_EVENT), Some(ExclusionRule::InsufficientResults));
    assert_eq!(rule(NO_WETSUIT_INFO_EVENT), Some(ExclusionRule::UnknownWetsuit));

    assert_eq!(outcome.counts.loaded, events.len());
    assert_eq!(outcome.counts.kept + outcome.counts.excluded, events.len());
}

#[test]
fn manual_labels_recover_events_without_wetsuit_info() {
    let mut manual = ManualWetsuitTable::default();
    manual.insert(NO_WETSUIT_INFO_EVENT, Gender::Men, Some(true));
    manual.insert(NO_WETSUIT_INFO_EVENT, Gender::Women, Some(true));

    let outcome = run(
        &fixture(),
        &config(),
        &manual,
        &RankingSnapshots::default(),
        &reviewed_hot_wetsuit(),
    )
    .unwrap();
    let row = outcome
        .rows
        .iter()
        .find(|r| r.event_id == NO_WETSUIT_INFO_EVENT)
        .expect("manually labelled event kept");
    assert_eq!(row.men.conditions.wetsuit, Some(true));
    assert_eq!(row.women.conditions.water_temperature, None);
}

#[test]
fn level_uses_the_available_gender_snapshot() {
    let mut men = RankingSnapshot::default();
    men.insert_year(2019, vec![1000, 1001]);
    let rankings = RankingSnapshots {
        men: Some(men),
        women: None,
    };

    let outcome = run(
        &fixture(),
        &config(),
        &ManualWetsuitTable::default(),
        &rankings,
        &reviewed_hot_wetsuit(),
    )
    .unwrap();
    let row = &outcome.rows[0];
    // Ranks 1 and 2, four unranked athletes at 50.
    let level = row.men.level.unwrap();
    assert!((level - 203.0 / 6.0).abs() < 1e-9);
    assert_eq!(row.women.level, None);
}

#[test]
fn output_is_identical_across_runs_and_input_order() {
    let config = config();
    let manual = ManualWetsuitTable::default();
    let rankings = RankingSnapshots::default();
    let known = reviewed_hot_wetsuit();

    let forward = run(&fixture(), &config, &manual, &rankings, &known).unwrap();
    let mut reversed_events = fixture();
    reversed_events.reverse();
    let reversed = run(&reversed_events, &config, &manual, &rankings, &known).unwrap();

    assert_eq!(
        serde_json::to_vec(&forward.rows).unwrap(),
        serde_json::to_vec(&reversed.rows).unwrap()
    );
    assert_eq!(
        serde_json::to_vec(&forward.exclusions).unwrap(),
        serde_json::to_vec(&reversed.exclusions).unwrap()
    );
    assert_eq!(forward.conflicts, reversed.conflicts);
}

#[test]
fn rank_window_mean_over_sorted_values() {
    let values = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0];
    let stats = window_stats(
        &values,
        RankWindow {
            i_first: 2,
            i_last: 4,
        },
    );
    assert_eq!(stats.mean, 35.0);
    assert_eq!(stats.mean_last, 35.0);
    assert_eq!(stats.n_values, 6);
}

#[tokio::test]
async fn run_once_reads_the_cache_and_writes_reports() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config();
    config.paths.data_dir = tmp.path().to_path_buf();

    let cache = EventCache::new(config.paths.cache_dir());
    for (event_id, document) in fixture() {
        cache.save(event_id, &document).await.unwrap();
    }
    std::fs::write(
        tmp.path().join("known_inconsistencies.yaml"),
        "- event_id: 101\n  gender: women\n  note: reviewed\n",
    )
    .unwrap();

    let pipeline = Pipeline::new(config);
    let first = pipeline.run_once().await.unwrap();
    let second = pipeline.run_once().await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.counts.loaded, 7);
    assert_eq!(first.counts.kept, 2);
    assert_eq!(first.counts, second.counts);

    let read = |dir: &str, file: &str| std::fs::read(std::path::Path::new(dir).join(file)).unwrap();
    assert_eq!(
        read(&first.reports_dir, "dataset.json"),
        read(&second.reports_dir, "dataset.json")
    );
    assert_eq!(
        read(&first.reports_dir, "exclusions.json"),
        read(&second.reports_dir, "exclusions.json")
    );
    assert!(std::path::Path::new(&first.parquet_manifest).exists());

    let report = String::from_utf8(read(&first.reports_dir, "exclusion_report.md")).unwrap();
    assert!(report.contains("### unknown_wetsuit"));
    assert!(report.contains("## Condition Conflicts"));
}

#[tokio::test]
async fn run_once_fails_on_unreviewed_inconsistency() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config();
    config.paths.data_dir = tmp.path().to_path_buf();
    let cache = EventCache::new(config.paths.cache_dir());
    for (event_id, document) in fixture() {
        cache.save(event_id, &document).await.unwrap();
    }

    let err = Pipeline::new(config).run_once().await.unwrap_err();
    let root = err.downcast_ref::<ReconcileError>();
    assert!(matches!(
        root,
        Some(ReconcileError::UnresolvedInconsistency { event_id: HOT_WETSUIT_EVENT, .. })
    ));
    assert!(!tmp.path().join("reports").exists());
}
