//! Raw record and vehicle models shared by the client and the normalizer.
//!
//! Remote endpoints return loosely-shaped JSON: key casing varies per
//! endpoint, dates come in several formats, and ids are sometimes numeric
//! strings. Records keep their full payload and carry a small extracted
//! envelope (id, date, completion flag) that the normalizer orders by.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;

/// One record category tracked per vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Odometer statistic (adjusted reading or latest raw record)
    Odometer,
    /// Planned maintenance items
    Maintenance,
    Fuel,
    Service,
    Repair,
    Upgrade,
    Supply,
    Tax,
    Reminder,
}

impl Category {
    /// All categories, in publication order.
    pub const ALL: [Category; 9] = [
        Category::Odometer,
        Category::Maintenance,
        Category::Fuel,
        Category::Service,
        Category::Repair,
        Category::Upgrade,
        Category::Supply,
        Category::Tax,
        Category::Reminder,
    ];

    /// Stable lowercase key, used in logs and entity ids.
    pub fn key(&self) -> &'static str {
        match self {
            Category::Odometer => "odometer",
            Category::Maintenance => "maintenance",
            Category::Fuel => "fuel",
            Category::Service => "service",
            Category::Repair => "repair",
            Category::Upgrade => "upgrade",
            Category::Supply => "supply",
            Category::Tax => "tax",
            Category::Reminder => "reminder",
        }
    }

    /// Categories whose published fact is a "next due" item rather than a
    /// "latest" one.
    pub fn is_next_due(&self) -> bool {
        matches!(self, Category::Maintenance | Category::Reminder)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One entry fetched from a single remote endpoint.
///
/// Immutable once built; lives for one normalization pass and, if selected,
/// inside the published snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Record identifier (0 when the payload carries none)
    pub id: i64,
    /// Associated date, when the payload carries a parseable one
    pub date: Option<DateTime<Utc>>,
    /// Completion flag for plannable records; always false for other kinds
    pub completed: bool,
    /// Full payload as returned by the endpoint
    pub payload: Map<String, Value>,
}

/// A vehicle known to the remote service.
#[derive(Debug, Clone)]
pub struct Vehicle {
    pub id: i64,
    /// Display name built from year/make/model, the name field, or the id
    pub name: String,
    pub payload: Map<String, Value>,
}

/// Parse a date string in the formats the remote service is known to emit.
///
/// Tries RFC 3339 first, then day-first, month-first and ISO-like formats
/// with and without a time component. Naive values are taken as UTC.
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let s = date_str.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // Day-first formats before month-first: "28/02/2027" must not parse as US
    const DATETIME_FORMATS: [&str; 5] = [
        "%d/%m/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }

    const DATE_FORMATS: [&str; 3] = ["%d/%m/%Y", "%m/%d/%Y", "%Y-%m-%d"];
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }

    None
}

/// Look up the first present string value among candidate keys.
fn get_str<'a>(payload: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| payload.get(*k))
        .find_map(|v| v.as_str())
}

/// Look up an id that may be a number or a numeric string.
fn get_id(payload: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter().filter_map(|k| payload.get(*k)).find_map(|v| {
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
    })
}

/// Whether a plannable record is already completed.
///
/// Plan records carry either a `progress` string ("Done" when finished) or a
/// boolean completion flag depending on service version.
fn is_completed(payload: &Map<String, Value>) -> bool {
    if let Some(progress) = get_str(payload, &["progress", "Progress"]) {
        if progress.eq_ignore_ascii_case("done") {
            return true;
        }
    }
    ["isCompleted", "IsCompleted", "completed", "Completed"]
        .iter()
        .filter_map(|k| payload.get(*k))
        .any(|v| v.as_bool() == Some(true))
}

/// Build a record from one array entry.
///
/// Returns None for non-object entries, which are skipped rather than failing
/// the whole response. `date_keys` lists the candidate date keys for the
/// endpoint, tried in order.
pub(crate) fn record_from_value(value: &Value, date_keys: &[&str]) -> Option<RawRecord> {
    let payload = value.as_object()?;
    let date = get_str(payload, date_keys).and_then(parse_date);

    Some(RawRecord {
        id: get_id(payload, &["id", "Id"]).unwrap_or(0),
        date,
        completed: is_completed(payload),
        payload: payload.clone(),
    })
}

/// Build a vehicle from one array entry.
///
/// Entries without an id are skipped.
pub(crate) fn vehicle_from_value(value: &Value) -> Option<Vehicle> {
    let payload = value.as_object()?;
    let id = get_id(payload, &["id", "Id"])?;

    let year = get_str(payload, &["year", "Year"]).unwrap_or("");
    let make = get_str(payload, &["make", "Make"]).unwrap_or("");
    let model = get_str(payload, &["model", "Model"]).unwrap_or("");

    let parts: Vec<&str> = [year, make, model]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();

    let name = if parts.is_empty() {
        get_str(payload, &["name", "Name"])
            .map(str::to_string)
            .unwrap_or_else(|| format!("Vehicle {}", id))
    } else {
        parts.join(" ")
    };

    Some(Vehicle {
        id,
        name,
        payload: payload.clone(),
    })
}
