//! Populates the event cache from the federation API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};
use tristat_core::{EventDocument, EventId, ProgramDocument};
use tristat_storage::{ApiClient, EventCache, FetchError};

pub const EVENTS_QUERY_DOC: &str = "events_query";
pub const IGNORED_EVENTS_DOC: &str = "ignored_events";

/// Anything that answers federation API paths with the unwrapped `data` payload.
#[async_trait]
pub trait FederationSource: Send + Sync {
    async fn get_data(&self, path_and_query: &str) -> Result<JsonValue, FetchError>;
}

#[async_trait]
impl FederationSource for ApiClient {
    async fn get_data(&self, path_and_query: &str) -> Result<JsonValue, FetchError> {
        ApiClient::get_data(self, path_and_query).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestPlan {
    /// `YYYY-MM-DD`, passed through to the listing query.
    pub start_date: String,
    pub end_date: String,
    pub per_page: usize,
    pub program_names: Vec<String>,
    /// (specification id, name)
    pub specification_ids: Vec<(u32, String)>,
    /// (category id, category name)
    pub category_ids: BTreeMap<u32, String>,
}

impl Default for HarvestPlan {
    fn default() -> Self {
        Self {
            start_date: "2009-01-01".to_string(),
            end_date: "2024-12-31".to_string(),
            per_page: 1000,
            program_names: vec!["Elite Men".to_string(), "Elite Women".to_string()],
            specification_ids: vec![(376, "Triathlon".to_string())],
            category_ids: crate::FieldRules::default().category_ids,
        }
    }
}

impl HarvestPlan {
    pub fn listing_query(&self, category_id: u32, specification_id: u32) -> String {
        format!(
            "events?category_id={category_id}&start_date={}&end_date={}&specification_id={specification_id}&per_page={}",
            self.start_date, self.end_date, self.per_page
        )
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{query}: {count} events returned with per_page={per_page}; increase per_page")]
    TooManyResults {
        query: String,
        count: usize,
        per_page: usize,
    },
    #[error("unexpected payload for {path}: {message}")]
    UnexpectedShape { path: String, message: String },
    #[error(transparent)]
    Cache(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoredEvent {
    pub event_title: String,
    pub event_listing: String,
    pub txt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarvestSummary {
    pub queries_sent: usize,
    pub queries_cached: usize,
    pub events_listed: usize,
    pub events_saved: Vec<EventId>,
    pub events_already_cached: usize,
    pub events_ignored: Vec<EventId>,
    pub events_filtered: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct ListedEvent {
    event_id: EventId,
    #[serde(default)]
    event_title: String,
    #[serde(default)]
    event_listing: String,
    #[serde(default)]
    event_venue: Option<String>,
    #[serde(default)]
    event_date: Option<String>,
    #[serde(default)]
    event_country_noc: Option<String>,
    #[serde(default)]
    event_specifications: Vec<SpecificationRef>,
}

#[derive(Debug, Clone, Deserialize)]
struct SpecificationRef {
    cat_id: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ProgramListing {
    prog_id: JsonValue,
    prog_name: String,
}

/// Title filters some categories need because they also list non-elite races.
pub fn title_passes_category_filter(category_name: &str, title: &str) -> bool {
    match category_name {
        "Recognised Games" => title.contains("Commonwealth Games"),
        "Major Games" => !title.contains("Youth") && title.contains("Olympic Games"),
        "Recognised Event" => ["Olympic Games Test", "Olympic Qualification Event"]
            .iter()
            .any(|needle| title.contains(needle)),
        _ => true,
    }
}

pub struct Harvester<S> {
    source: S,
    cache: EventCache,
    plan: HarvestPlan,
}

impl<S: FederationSource> Harvester<S> {
    pub fn new(source: S, cache: EventCache, plan: HarvestPlan) -> Self {
        Self {
            source,
            cache,
            plan,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn run(&self) -> Result<HarvestSummary, HarvestError> {
        let mut summary = HarvestSummary::default();
        let mut queries: BTreeMap<String, JsonValue> = self
            .cache
            .load_aux(EVENTS_QUERY_DOC)
            .await?
            .unwrap_or_default();
        let mut ignored: BTreeMap<String, IgnoredEvent> = self
            .cache
            .load_aux(IGNORED_EVENTS_DOC)
            .await?
            .unwrap_or_default();

        for (spec_id, spec_name) in &self.plan.specification_ids {
            for (cat_id, cat_name) in &self.plan.category_ids {
                let query = self.plan.listing_query(*cat_id, *spec_id);
                let listing = match queries.get(&query) {
                    Some(cached) => {
                        summary.queries_cached += 1;
                        cached.clone()
                    }
                    None => {
                        let fresh = self.source.get_data(&query).await?;
                        summary.queries_sent += 1;
                        queries.insert(query.clone(), fresh.clone());
                        self.cache.save_aux(EVENTS_QUERY_DOC, &queries).await?;
                        fresh
                    }
                };

                let events: Vec<ListedEvent> = decode(&query, listing)?;
                info!(spec = %spec_name, category = %cat_name, count = events.len(), "event listing");
                if events.len() >= self.plan.per_page {
                    return Err(HarvestError::TooManyResults {
                        query,
                        count: events.len(),
                        per_page: self.plan.per_page,
                    });
                }
                summary.events_listed += events.len();

                for event in events {
                    if !title_passes_category_filter(cat_name, &event.event_title)
                        || !event.event_specifications.iter().any(|s| s.cat_id == *spec_id)
                    {
                        summary.events_filtered += 1;
                        continue;
                    }
                    if self.cache.contains(event.event_id).await? {
                        debug!(event_id = event.event_id, "already cached");
                        summary.events_already_cached += 1;
                        continue;
                    }
                    if ignored.contains_key(&event.event_id.to_string()) {
                        debug!(event_id = event.event_id, "already ignored");
                        continue;
                    }

                    match self.collect_event(&event).await? {
                        Ok(document) => {
                            self.cache.save(event.event_id, &document).await?;
                            info!(event_id = event.event_id, title = %event.event_title, programs = document.len(), "event cached");
                            summary.events_saved.push(event.event_id);
                        }
                        Err(txt) => {
                            warn!(event_id = event.event_id, title = %event.event_title, reason = %txt, "event ignored");
                            ignored.insert(
                                event.event_id.to_string(),
                                IgnoredEvent {
                                    event_title: event.event_title.clone(),
                                    event_listing: event.event_listing.clone(),
                                    txt,
                                },
                            );
                            self.cache.save_aux(IGNORED_EVENTS_DOC, &ignored).await?;
                            summary.events_ignored.push(event.event_id);
                        }
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Outer error aborts the harvest; inner `Err` is the reason the event is ignored.
    async fn collect_event(
        &self,
        event: &ListedEvent,
    ) -> Result<Result<EventDocument, String>, HarvestError> {
        let event_id = event.event_id;
        let path = format!("events/{event_id}/programs");
        let listings: Vec<ProgramListing> = match self.source.get_data(&path).await {
            Ok(value) => decode(&path, value)?,
            Err(FetchError::MissingData { .. }) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let listings = listings
            .into_iter()
            .filter(|l| self.plan.program_names.contains(&l.prog_name))
            .collect::<Vec<_>>();
        if listings.is_empty() {
            return Ok(Err("no listing found".to_string()));
        }

        let mut document = EventDocument::default();
        for listing in listings {
            let prog_id = match &listing.prog_id {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            let detail_path = format!("events/{event_id}/programs/{prog_id}");
            let detail = self.source.get_data(&detail_path).await?;
            let results_path = format!("{detail_path}/results");
            let results = self.source.get_data(&results_path).await?;

            let missing = ["headers", "results", "prog_gender"]
                .into_iter()
                .filter(|key| is_blank(results.get(*key)))
                .collect::<Vec<_>>();
            if !missing.is_empty() {
                return Ok(Err(format!("Missing keys: {}", missing.join(", "))));
            }

            let payload = json!({
                "prog_name": listing.prog_name,
                "event_id": event_id,
                "event_title": event.event_title,
                "event_venue": event.event_venue.clone().unwrap_or_default(),
                "event_date": event.event_date.clone().unwrap_or_default(),
                "event_country_noc": event.event_country_noc.clone().unwrap_or_default(),
                "event_listing": event.event_listing,
                "prog_distances": detail.get("prog_distances").cloned().unwrap_or(JsonValue::Null),
                "prog_distance_category": detail.get("prog_distance_category").cloned().unwrap_or(JsonValue::Null),
                "prog_notes": detail.get("prog_notes").cloned().unwrap_or(JsonValue::Null),
                "meta": detail.get("meta").cloned().unwrap_or(JsonValue::Null),
                "prog_gender": results.get("prog_gender").cloned().unwrap_or(JsonValue::Null),
                "event_categories": results
                    .pointer("/event/event_categories")
                    .cloned()
                    .unwrap_or_else(|| json!([])),
                "headers": results.get("headers").cloned().unwrap_or_else(|| json!([])),
                "results": results.get("results").cloned().unwrap_or_else(|| json!([])),
            });
            let program: ProgramDocument = decode(&results_path, payload)?;
            document.programs.insert(prog_id, program);
        }
        Ok(Ok(document))
    }
}

fn is_blank(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.is_empty(),
        Some(JsonValue::Array(items)) => items.is_empty(),
        Some(JsonValue::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn decode<T: serde::de::DeserializeOwned>(path: &str, value: JsonValue) -> Result<T, HarvestError> {
    serde_json::from_value(value).map_err(|err| HarvestError::UnexpectedShape {
        path: path.to_string(),
        message: err.to_string(),
    })
}
