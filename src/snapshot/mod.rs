//! Published vehicle-facts model.
//!
//! A [`Snapshot`] is the unit readers consume: the complete mapping of
//! vehicles to their current facts, replaced as a whole on each successful
//! refresh. [`VehicleFacts`] values are built fresh from a complete set of
//! fetch results and never mutated in place after publication.

pub mod normalize;

use crate::client::records::{Category, RawRecord};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};


/// Value of one category slot in a vehicle's facts.
///
/// The three states keep "no record exists" distinguishable from "the fetch
/// for this category failed and nothing could be carried over".
#[derive(Debug, Clone, PartialEq)]
pub enum FactValue {
    /// A record exists for this category
    Present(RawRecord),
    /// Fetch succeeded and returned no records
    Empty,
    /// Fetch failed and no previous value could be carried over
    Unavailable,
}

impl FactValue {
    pub fn is_present(&self) -> bool {
        matches!(self, FactValue::Present(_))
    }

    pub fn record(&self) -> Option<&RawRecord> {
        match self {
            FactValue::Present(record) => Some(record),
            _ => None,
        }
    }
}

/// Facts for one vehicle: one slot per category plus the set of categories
/// whose fetch failed in the cycle that built this value.
///
/// A slot can be `Present` while its category is in the failed set: that is
/// a carried-over value from the previous snapshot.
#[derive(Debug, Clone)]
pub struct VehicleFacts {
    pub vehicle_id: i64,
    pub name: String,
    facts: BTreeMap<Category, FactValue>,
    failed: BTreeSet<Category>,
}

impl VehicleFacts {
    pub(crate) fn new(
        vehicle_id: i64,
        name: String,
        facts: BTreeMap<Category, FactValue>,
        failed: BTreeSet<Category>,
    ) -> Self {
        Self {
            vehicle_id,
            name,
            facts,
            failed,
        }
    }

    /// The fact slot for a category.
    pub fn fact(&self, category: Category) -> &FactValue {
        static UNAVAILABLE: FactValue = FactValue::Unavailable;
        self.facts.get(&category).unwrap_or(&UNAVAILABLE)
    }

    /// Whether this category's fetch failed in the cycle that built this
    /// value (the slot may still hold a carried-over record).
    pub fn fetch_failed(&self, category: Category) -> bool {
        self.failed.contains(&category)
    }

    /// Categories currently holding a present value.
    pub fn present_categories(&self) -> impl Iterator<Item = Category> + '_ {
        self.facts
            .iter()
            .filter(|(_, v)| v.is_present())
            .map(|(c, _)| *c)
    }

    /// True when no slot holds any information at all: every category
    /// failed and nothing was carried over.
    pub fn is_entirely_unavailable(&self) -> bool {
        self.facts
            .values()
            .all(|v| matches!(v, FactValue::Unavailable))
    }

    pub(crate) fn failed_categories(&self) -> &BTreeSet<Category> {
        &self.failed
    }

    pub(crate) fn set_fact(&mut self, category: Category, value: FactValue) {
        self.facts.insert(category, value);
    }
}

/// The complete published mapping of vehicles to facts.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Refresh start time of the cycle that built this snapshot
    pub taken_at: DateTime<Utc>,
    pub vehicles: BTreeMap<i64, VehicleFacts>,
}

impl Snapshot {
    pub fn vehicle(&self, vehicle_id: i64) -> Option<&VehicleFacts> {
        self.vehicles.get(&vehicle_id)
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    /// Presentation boundary: one descriptor per vehicle/category holding a
    /// present value. Categories with no data produce no descriptor, so
    /// consumers never build placeholder entities.
    pub fn entity_descriptors(&self) -> Vec<EntityDescriptor> {
        self.vehicles
            .values()
            .flat_map(|facts| {
                facts.present_categories().map(|category| EntityDescriptor {
                    vehicle_id: facts.vehicle_id,
                    vehicle_name: facts.name.clone(),
                    category,
                    entity_id: format!("vehicle_{}_{}", facts.vehicle_id, category.key()),
                })
            })
            .collect()
    }
}

/// Descriptor for one presentation entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub vehicle_id: i64,
    pub vehicle_name: String,
    pub category: Category,
    /// Stable id: "vehicle_{id}_{category}"
    pub entity_id: String,
}
