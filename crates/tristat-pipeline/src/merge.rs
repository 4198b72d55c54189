//! Event Merger: one row per event with both genders side by side.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Datelike;
use tristat_adapters::ReconciledEvent;
use tristat_core::{EventRow, ExclusionRule, Gap, ProgramSummary};

use crate::config::PipelineConfig;

pub struct EventMerger<'c> {
    config: &'c PipelineConfig,
}

impl<'c> EventMerger<'c> {
    pub fn new(config: &'c PipelineConfig) -> Self {
        Self { config }
    }

    pub fn merge(
        &self,
        event: &ReconciledEvent<'_>,
        men: ProgramSummary,
        women: ProgramSummary,
    ) -> Result<EventRow, (ExclusionRule, String)> {
        if men.distance_category != women.distance_category {
            return Err((
                ExclusionRule::DistanceMismatch,
                format!(
                    "prog_distance_category_m = '{}' != prog_distance_category_w = '{}'",
                    men.distance_category, women.distance_category
                ),
            ));
        }

        let gaps = self
            .config
            .sports
            .iter()
            .filter_map(|sport| {
                let m = men.mean(*sport)?;
                let w = women.mean(*sport)?;
                Some((*sport, Gap::between(m, w)))
            })
            .collect::<BTreeMap<_, _>>();

        Ok(EventRow {
            event_id: event.event_id,
            event_title: event.event_title.clone(),
            event_venue: event.event_venue.clone(),
            event_listing: event.event_listing.clone(),
            event_country_noc: event.event_country_noc.clone(),
            event_date: men.event_date,
            event_year: men.event_date.year(),
            event_category: self.config.event_category(&men.event_category_ids),
            distance_category: men.distance_category.clone(),
            gaps,
            suppressed: BTreeSet::new(),
            men,
            women,
        })
    }
}
