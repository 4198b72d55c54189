//! Cached API payloads, exactly as the harvester stores them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Discipline, EventId};

/// One cached event: program id -> program payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventDocument {
    pub programs: BTreeMap<String, ProgramDocument>,
}

impl EventDocument {
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProgramDocument)> {
        self.programs.iter().map(|(id, prog)| (id.as_str(), prog))
    }
}

/// One race program (e.g. "Elite Women") of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDocument {
    pub prog_name: String,
    pub event_id: EventId,
    pub event_title: String,
    #[serde(default)]
    pub event_venue: String,
    pub event_date: String,
    #[serde(default)]
    pub event_country_noc: String,
    #[serde(default)]
    pub event_listing: String,
    #[serde(default)]
    pub prog_distances: Option<Vec<ProgramDistance>>,
    #[serde(default)]
    pub prog_distance_category: Option<String>,
    #[serde(default)]
    pub prog_notes: Option<String>,
    #[serde(default)]
    pub prog_gender: Option<String>,
    #[serde(default)]
    pub event_categories: Vec<EventCategory>,
    #[serde(default)]
    pub headers: Vec<ResultHeader>,
    #[serde(default)]
    pub results: Vec<ResultRecord>,
    #[serde(default)]
    pub meta: Option<ProgramMeta>,
}

impl ProgramDocument {
    pub fn notes(&self) -> &str {
        self.prog_notes.as_deref().unwrap_or_default()
    }

    pub fn event_category_ids(&self) -> Vec<u32> {
        self.event_categories.iter().map(|c| c.cat_id).collect()
    }

    /// Header index of each discipline column, in header order.
    pub fn discipline_columns(&self) -> Vec<(usize, Discipline)> {
        self.headers
            .iter()
            .enumerate()
            .filter_map(|(idx, h)| Discipline::from_header(&h.name).map(|d| (idx, d)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDistance {
    #[serde(default)]
    pub segment: Option<String>,
    #[serde(default)]
    pub distance: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCategory {
    pub cat_id: u32,
    #[serde(default)]
    pub cat_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultHeader {
    pub name: String,
    #[serde(default)]
    pub distance: Option<JsonValue>,
}

/// Structured race conditions from the program detail endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgramMeta {
    #[serde(default)]
    pub temperature_air: Option<JsonValue>,
    #[serde(default)]
    pub temperature_water: Option<JsonValue>,
    #[serde(default)]
    pub wetsuit: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(default)]
    pub athlete_id: u64,
    #[serde(default)]
    pub athlete_title: Option<String>,
    #[serde(default)]
    pub athlete_first: Option<String>,
    #[serde(default)]
    pub athlete_last: Option<String>,
    #[serde(default)]
    pub athlete_noc: Option<String>,
    pub position: Position,
    #[serde(default)]
    pub total_time: Option<String>,
    #[serde(default)]
    pub splits: Vec<String>,
    #[serde(default)]
    pub start_num: Option<JsonValue>,
    #[serde(default)]
    pub dob: Option<String>,
    #[serde(default)]
    pub athlete_yob: Option<JsonValue>,
}

impl ResultRecord {
    pub fn start_number(&self) -> Option<u32> {
        self.start_num
            .as_ref()
            .and_then(loose_f64)
            .filter(|n| *n >= 0.0)
            .map(|n| n as u32)
    }

    pub fn year_of_birth(&self) -> Option<i32> {
        self.athlete_yob.as_ref().and_then(loose_f64).map(|y| y as i32)
    }

    pub fn display_name(&self) -> Option<String> {
        if let Some(title) = &self.athlete_title {
            return Some(title.clone());
        }
        match (&self.athlete_first, &self.athlete_last) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(name), None) | (None, Some(name)) => Some(name.clone()),
            (None, None) => None,
        }
    }
}

/// Non-finish sentinels reported by the federation in place of a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NonFinish {
    Dnf,
    Dns,
    Dsq,
    Lap,
}

impl NonFinish {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "DNF" => Some(Self::Dnf),
            "DNS" => Some(Self::Dns),
            "DSQ" => Some(Self::Dsq),
            "LAP" => Some(Self::Lap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dnf => "DNF",
            Self::Dns => "DNS",
            Self::Dsq => "DSQ",
            Self::Lap => "LAP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PositionRepr", into = "PositionRepr")]
pub enum Position {
    Place(u32),
    NonFinish(NonFinish),
    Unknown(String),
}

impl Position {
    pub fn place(&self) -> Option<u32> {
        match self {
            Self::Place(p) => Some(*p),
            _ => None,
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Self::Place(_))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PositionRepr {
    Number(u32),
    Text(String),
}

impl From<PositionRepr> for Position {
    fn from(repr: PositionRepr) -> Self {
        match repr {
            PositionRepr::Number(n) => Position::Place(n),
            PositionRepr::Text(text) => {
                if let Some(nf) = NonFinish::parse(&text) {
                    Position::NonFinish(nf)
                } else if let Ok(n) = text.trim().parse::<u32>() {
                    Position::Place(n)
                } else {
                    Position::Unknown(text)
                }
            }
        }
    }
}

impl From<Position> for PositionRepr {
    fn from(position: Position) -> Self {
        match position {
            Position::Place(n) => PositionRepr::Number(n),
            Position::NonFinish(nf) => PositionRepr::Text(nf.as_str().to_string()),
            Position::Unknown(text) => PositionRepr::Text(text),
        }
    }
}

/// Numbers arrive as JSON numbers or as numeric strings depending on the endpoint.
pub fn loose_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().trim_end_matches('.').parse::<f64>().ok(),
        _ => None,
    }
}

/// Parse an `H:MM:SS` (or `MM:SS`) split into seconds.
pub fn parse_hms(text: &str) -> Option<u32> {
    let parts = text
        .trim()
        .split(':')
        .map(|p| p.parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()?;
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => (0, *m, *s),
        _ => return None,
    };
    h.checked_mul(3600)?
        .checked_add(m.checked_mul(60)?)?
        .checked_add(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn positions_parse_numbers_strings_and_sentinels() {
        let places: Vec<Position> =
            serde_json::from_value(json!([1, "2", "DNF", "lap", "DSQ", "??"])).unwrap();
        assert_eq!(places[0], Position::Place(1));
        assert_eq!(places[1], Position::Place(2));
        assert_eq!(places[2], Position::NonFinish(NonFinish::Dnf));
        assert_eq!(places[3], Position::NonFinish(NonFinish::Lap));
        assert_eq!(places[4], Position::NonFinish(NonFinish::Dsq));
        assert_eq!(places[5], Position::Unknown("??".into()));
        assert!(!places[5].is_finish());
    }

    #[test]
    fn hms_parsing() {
        assert_eq!(parse_hms("00:18:30"), Some(1110));
        assert_eq!(parse_hms("1:02:03"), Some(3723));
        assert_eq!(parse_hms("00:00:00"), Some(0));
        assert_eq!(parse_hms("DNF"), None);
        assert_eq!(parse_hms("18:30"), Some(1110));
    }

    #[test]
    fn hms_overflow_is_rejected() {
        assert_eq!(parse_hms("4000000:00:00"), None);
        assert_eq!(parse_hms("00:80000000:00"), None);
        assert_eq!(parse_hms("1193046:28:15"), Some(u32::MAX));
        assert_eq!(parse_hms("1193046:28:16"), None);
    }

    #[test]
    fn loose_numbers_accept_strings() {
        assert_eq!(loose_f64(&json!(21.5)), Some(21.5));
        assert_eq!(loose_f64(&json!("19.")), Some(19.0));
        assert_eq!(loose_f64(&json!("n/a")), None);
        assert_eq!(loose_f64(&json!(null)), None);
    }

    #[test]
    fn event_document_is_keyed_by_program_id() {
        let doc: EventDocument = serde_json::from_value(json!({
            "635344": {
                "prog_name": "Elite Men",
                "event_id": 183774,
                "event_title": "2023 World Triathlon Cup Valencia",
                "event_date": "2023-09-16",
                "results": [{"athlete_id": 1, "position": 1, "splits": ["00:18:00"]}]
            }
        }))
        .unwrap();
        assert_eq!(doc.len(), 1);
        let (id, prog) = doc.iter().next().unwrap();
        assert_eq!(id, "635344");
        assert_eq!(prog.results[0].position, Position::Place(1));
        assert!(prog.notes().is_empty());
    }
}
