//! Reduction of raw per-category record lists into vehicle facts.
//!
//! "Latest" is the record with the maximal date, ties broken by the highest
//! record id so the pick is deterministic. "Next" (maintenance plans,
//! reminders) is the incomplete record with the minimal date (past-due items
//! stay eligible and therefore surface first), ties broken by the lowest id.
//! Records without a parseable date lose "latest" ties by date and are never
//! "next" candidates.

use crate::client::records::{Category, RawRecord, Vehicle};
use crate::client::FetchError;
use crate::snapshot::{FactValue, VehicleFacts};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of one category fetch, as fed into reduction.
#[derive(Debug, Clone)]
pub enum CategoryFetch {
    Records(Vec<RawRecord>),
    Failed(FetchError),
}

/// Reduce one vehicle's fetch results into facts.
///
/// Every category gets a slot: `Present` with the selected record, `Empty`
/// when the fetch returned nothing, or `Unavailable` when the fetch failed
/// (failed categories are also recorded in the failed set, which the
/// coordinator uses for carry-over).
pub fn reduce(vehicle: &Vehicle, results: &BTreeMap<Category, CategoryFetch>) -> VehicleFacts {
    let mut facts = BTreeMap::new();
    let mut failed = BTreeSet::new();

    for category in Category::ALL {
        let value = match results.get(&category) {
            Some(CategoryFetch::Records(records)) => {
                let selected = if category.is_next_due() {
                    next_due(records)
                } else {
                    latest(records)
                };
                match selected {
                    Some(record) => FactValue::Present(record.clone()),
                    None => FactValue::Empty,
                }
            }
            Some(CategoryFetch::Failed(_)) | None => {
                failed.insert(category);
                FactValue::Unavailable
            }
        };
        facts.insert(category, value);
    }

    VehicleFacts::new(vehicle.id, vehicle.name.clone(), facts, failed)
}

/// The record with the maximal date; ties broken by the highest id.
///
/// Undated records sort before any dated one, so they are only picked when
/// no record carries a date (then the highest id wins).
pub fn latest(records: &[RawRecord]) -> Option<&RawRecord> {
    records.iter().max_by_key(|r| (r.date, r.id))
}

/// The incomplete, dated record with the minimal date; ties broken by the
/// lowest id. Past-due items remain eligible.
pub fn next_due(records: &[RawRecord]) -> Option<&RawRecord> {
    records
        .iter()
        .filter(|r| !r.completed && r.date.is_some())
        .min_by_key(|r| (r.date, r.id))
}

/// Carry-over merge against the previous snapshot's facts for this vehicle.
///
/// Failed categories take their last known good value instead of being
/// blanked; a previous `Empty` stays `Empty` (known absence is information
/// worth keeping). The failed set is untouched so readers can still tell the
/// value is stale.
pub fn merge_carry_over(fresh: &mut VehicleFacts, previous: Option<&VehicleFacts>) {
    let Some(previous) = previous else {
        return;
    };

    let failed: Vec<Category> = fresh.failed_categories().iter().copied().collect();
    for category in failed {
        match previous.fact(category) {
            FactValue::Present(record) => {
                fresh.set_fact(category, FactValue::Present(record.clone()));
            }
            FactValue::Empty => {
                fresh.set_fact(category, FactValue::Empty);
            }
            FactValue::Unavailable => {}
        }
    }
}
