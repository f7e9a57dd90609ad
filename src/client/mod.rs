//! Typed client for the garage service record endpoints.
//!
//! One operation per record category, each returning the parsed record list
//! or a typed [`FetchError`]. Calls are independent: a failure in one
//! category never aborts fetches for other categories or vehicles; the
//! coordinator treats every call result separately.

pub mod records;

use crate::session::SessionManager;
use async_trait::async_trait;
use records::{record_from_value, vehicle_from_value, Category, RawRecord, Vehicle};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;


/// Typed fetch errors, one per failure class the coordinator distinguishes.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Transport failure or timeout; isolated per call
    Network(String),
    /// Unauthorized after the single re-authentication retry
    Auth,
    /// Response received but its shape was not understood, as opposed to
    /// "endpoint returned nothing"
    Malformed(String),
    /// Endpoint not found; callers treat this as an empty category
    NotFound,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Network(msg) => write!(f, "network error: {}", msg),
            FetchError::Auth => write!(f, "authentication failed"),
            FetchError::Malformed(msg) => write!(f, "malformed response: {}", msg),
            FetchError::NotFound => write!(f, "endpoint not found"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Source of vehicles and per-category records.
///
/// The coordinator consumes this seam rather than [`ApiClient`] directly so
/// cycle logic can be exercised against an in-memory fake.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Enumerate all vehicles known to the service.
    async fn vehicles(&self) -> Result<Vec<Vehicle>, FetchError>;

    /// Fetch one category's records for one vehicle.
    async fn category_records(
        &self,
        vehicle_id: i64,
        category: Category,
    ) -> Result<Vec<RawRecord>, FetchError>;
}

/// Candidate date keys per category endpoint.
fn date_keys(category: Category) -> &'static [&'static str] {
    match category {
        Category::Odometer => &["date", "Date"],
        Category::Maintenance => &["dateCreated", "dateModified", "Date", "date"],
        Category::Fuel => &["date", "Date", "fuelDate", "FuelDate"],
        Category::Service => &["date", "Date", "serviceDate"],
        Category::Repair => &["date", "Date", "repairDate"],
        Category::Upgrade => &["date", "Date", "upgradeDate"],
        Category::Supply => &["date", "Date", "supplyDate"],
        Category::Tax => &["date", "Date", "taxDate"],
        Category::Reminder => &["dueDate", "DueDate", "date", "Date"],
    }
}

/// Endpoint path (with query) for a category fetch.
fn record_endpoint(category: Category, vehicle_id: i64) -> String {
    let resource = match category {
        Category::Odometer => "odometerrecords",
        Category::Maintenance => "planrecords",
        Category::Fuel => "gasrecords",
        Category::Service => "servicerecords",
        Category::Repair => "repairrecords",
        Category::Upgrade => "upgraderecords",
        Category::Supply => "supplyrecords",
        Category::Tax => "taxrecords",
        Category::Reminder => "reminders",
    };
    format!("/api/vehicle/{}?vehicleId={}", resource, vehicle_id)
}

/// HTTP client for the garage service API.
pub struct ApiClient {
    session: Arc<SessionManager>,
}

impl ApiClient {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Fetch all vehicles.
    pub async fn vehicles(&self) -> Result<Vec<Vehicle>, FetchError> {
        let value = self.session.get_json("/api/vehicles").await?;
        let items = value
            .as_array()
            .ok_or_else(|| FetchError::Malformed("/api/vehicles: expected a JSON array".into()))?;
        Ok(items.iter().filter_map(vehicle_from_value).collect())
    }

    /// Fetch the odometer statistic for a vehicle.
    ///
    /// Prefers the aggregate adjusted-odometer endpoint (a single object);
    /// falls back to the raw odometer record list when that endpoint is
    /// missing, malformed, or unreachable. Auth failures never fall back.
    pub async fn odometer_records(&self, vehicle_id: i64) -> Result<Vec<RawRecord>, FetchError> {
        let adjusted_path = format!("/api/vehicle/adjustedodometer?vehicleId={}", vehicle_id);
        match self.session.get_json(&adjusted_path).await {
            Ok(value) if value.is_object() => {
                debug!(vehicle_id, "Using adjusted odometer");
                let record = record_from_value(&value, date_keys(Category::Odometer));
                return Ok(record.into_iter().collect());
            }
            Ok(_) | Err(FetchError::NotFound) | Err(FetchError::Malformed(_))
            | Err(FetchError::Network(_)) => {
                debug!(vehicle_id, "Adjusted odometer unavailable, using record list");
            }
            Err(FetchError::Auth) => return Err(FetchError::Auth),
        }
        self.record_list(Category::Odometer, vehicle_id).await
    }

    pub async fn maintenance_plans(&self, vehicle_id: i64) -> Result<Vec<RawRecord>, FetchError> {
        self.record_list(Category::Maintenance, vehicle_id).await
    }

    pub async fn fuel_records(&self, vehicle_id: i64) -> Result<Vec<RawRecord>, FetchError> {
        self.record_list(Category::Fuel, vehicle_id).await
    }

    pub async fn service_records(&self, vehicle_id: i64) -> Result<Vec<RawRecord>, FetchError> {
        self.record_list(Category::Service, vehicle_id).await
    }

    pub async fn repair_records(&self, vehicle_id: i64) -> Result<Vec<RawRecord>, FetchError> {
        self.record_list(Category::Repair, vehicle_id).await
    }

    pub async fn upgrade_records(&self, vehicle_id: i64) -> Result<Vec<RawRecord>, FetchError> {
        self.record_list(Category::Upgrade, vehicle_id).await
    }

    pub async fn supply_records(&self, vehicle_id: i64) -> Result<Vec<RawRecord>, FetchError> {
        self.record_list(Category::Supply, vehicle_id).await
    }

    pub async fn tax_records(&self, vehicle_id: i64) -> Result<Vec<RawRecord>, FetchError> {
        self.record_list(Category::Tax, vehicle_id).await
    }

    pub async fn reminders(&self, vehicle_id: i64) -> Result<Vec<RawRecord>, FetchError> {
        self.record_list(Category::Reminder, vehicle_id).await
    }

    /// Fetch and parse one record-list endpoint.
    ///
    /// Non-object entries within the array are skipped; a non-array body is
    /// a [`FetchError::Malformed`] so callers can tell it apart from an
    /// empty list.
    async fn record_list(
        &self,
        category: Category,
        vehicle_id: i64,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let path = record_endpoint(category, vehicle_id);
        let value = self.session.get_json(&path).await?;
        let items = parse_record_array(&path, &value)?;
        let records: Vec<RawRecord> = items
            .iter()
            .filter_map(|v| record_from_value(v, date_keys(category)))
            .collect();
        debug!(
            vehicle_id,
            category = %category,
            count = records.len(),
            "Fetched records"
        );
        Ok(records)
    }
}

fn parse_record_array<'a>(path: &str, value: &'a Value) -> Result<&'a Vec<Value>, FetchError> {
    value
        .as_array()
        .ok_or_else(|| FetchError::Malformed(format!("{}: expected a JSON array", path)))
}

#[async_trait]
impl RecordSource for ApiClient {
    async fn vehicles(&self) -> Result<Vec<Vehicle>, FetchError> {
        ApiClient::vehicles(self).await
    }

    async fn category_records(
        &self,
        vehicle_id: i64,
        category: Category,
    ) -> Result<Vec<RawRecord>, FetchError> {
        match category {
            Category::Odometer => self.odometer_records(vehicle_id).await,
            Category::Maintenance => self.maintenance_plans(vehicle_id).await,
            Category::Fuel => self.fuel_records(vehicle_id).await,
            Category::Service => self.service_records(vehicle_id).await,
            Category::Repair => self.repair_records(vehicle_id).await,
            Category::Upgrade => self.upgrade_records(vehicle_id).await,
            Category::Supply => self.supply_records(vehicle_id).await,
            Category::Tax => self.tax_records(vehicle_id).await,
            Category::Reminder => self.reminders(vehicle_id).await,
        }
    }
}
