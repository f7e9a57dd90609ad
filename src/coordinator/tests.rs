use super::*;
use crate::client::records::parse_date;
use crate::snapshot::FactValue;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex as StdMutex;

/// In-memory record source with scriptable results and call counters.
struct FakeSource {
    vehicles: StdMutex<Result<Vec<Vehicle>, FetchError>>,
    records: StdMutex<HashMap<(i64, Category), Result<Vec<RawRecord>, FetchError>>>,
    delay: StdMutex<Duration>,
    vehicle_calls: AtomicUsize,
    record_calls: AtomicUsize,
}

impl FakeSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            vehicles: StdMutex::new(Ok(vec![])),
            records: StdMutex::new(HashMap::new()),
            delay: StdMutex::new(Duration::ZERO),
            vehicle_calls: AtomicUsize::new(0),
            record_calls: AtomicUsize::new(0),
        })
    }

    fn set_vehicles(&self, result: Result<Vec<Vehicle>, FetchError>) {
        *self.vehicles.lock().unwrap() = result;
    }

    fn set_records(
        &self,
        vehicle_id: i64,
        category: Category,
        result: Result<Vec<RawRecord>, FetchError>,
    ) {
        self.records
            .lock()
            .unwrap()
            .insert((vehicle_id, category), result);
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl RecordSource for FakeSource {
    async fn vehicles(&self) -> Result<Vec<Vehicle>, FetchError> {
        self.vehicle_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.vehicles.lock().unwrap().clone()
    }

    async fn category_records(
        &self,
        vehicle_id: i64,
        category: Category,
    ) -> Result<Vec<RawRecord>, FetchError> {
        self.record_calls.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .unwrap()
            .get(&(vehicle_id, category))
            .cloned()
            .unwrap_or_else(|| Ok(vec![]))
    }
}

fn vehicle(id: i64) -> Vehicle {
    Vehicle {
        id,
        name: format!("Vehicle {}", id),
        payload: Map::new(),
    }
}

fn record(id: i64, date: &str) -> RawRecord {
    RawRecord {
        id,
        date: parse_date(date),
        completed: false,
        payload: Map::new(),
    }
}

fn coordinator_with(source: &Arc<FakeSource>) -> Arc<Coordinator> {
    Arc::new(Coordinator::new(
        SyncConfig::default(),
        Arc::clone(source) as Arc<dyn RecordSource>,
    ))
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_cycle() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    source.set_delay(Duration::from_millis(200));
    let coordinator = coordinator_with(&source);

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.request_refresh().await })
        })
        .collect();

    for outcome in join_all(tasks).await {
        assert!(matches!(outcome.unwrap(), CycleOutcome::Published(_)));
    }

    // One vehicle enumeration and one fetch per category, not one per caller
    assert_eq!(source.vehicle_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        source.record_calls.load(Ordering::SeqCst),
        Category::ALL.len()
    );
}

#[tokio::test(start_paused = true)]
async fn get_snapshot_during_refresh_returns_previous() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    let coordinator = coordinator_with(&source);

    coordinator.request_refresh().await;
    let first = coordinator.get_snapshot().unwrap();

    // Second cycle is slow; read mid-flight
    source.set_delay(Duration::from_millis(200));
    let refresh = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.request_refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mid_flight = coordinator.get_snapshot().unwrap();
    assert!(Arc::ptr_eq(&first, &mid_flight));

    refresh.await.unwrap();
    let after = coordinator.get_snapshot().unwrap();
    assert!(!Arc::ptr_eq(&first, &after));
}

#[tokio::test]
async fn failed_category_carries_over_previous_value() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    source.set_records(1, Category::Fuel, Ok(vec![record(7, "2024-01-01")]));
    source.set_records(1, Category::Maintenance, Ok(vec![record(3, "2024-02-01")]));
    let coordinator = coordinator_with(&source);

    coordinator.request_refresh().await;

    // Fuel fails this cycle, maintenance moves on
    source.set_records(1, Category::Fuel, Err(FetchError::Network("timeout".into())));
    source.set_records(1, Category::Maintenance, Ok(vec![record(4, "2024-03-01")]));
    coordinator.request_refresh().await;

    let snapshot = coordinator.get_snapshot().unwrap();
    let facts = snapshot.vehicle(1).unwrap();

    assert_eq!(facts.fact(Category::Fuel).record().unwrap().id, 7);
    assert!(facts.fetch_failed(Category::Fuel));
    assert_eq!(facts.fact(Category::Maintenance).record().unwrap().id, 4);
    assert!(!facts.fetch_failed(Category::Maintenance));
}

#[tokio::test]
async fn failed_category_without_history_is_unavailable() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    source.set_records(1, Category::Fuel, Err(FetchError::Network("down".into())));
    let coordinator = coordinator_with(&source);

    coordinator.request_refresh().await;

    let snapshot = coordinator.get_snapshot().unwrap();
    let facts = snapshot.vehicle(1).unwrap();
    assert_eq!(*facts.fact(Category::Fuel), FactValue::Unavailable);
    assert!(facts.fetch_failed(Category::Fuel));
    // Other categories returned empty lists and stay known-empty
    assert_eq!(*facts.fact(Category::Tax), FactValue::Empty);
}

#[tokio::test]
async fn not_found_category_is_empty_not_failed() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    source.set_records(1, Category::Tax, Err(FetchError::NotFound));
    let coordinator = coordinator_with(&source);

    coordinator.request_refresh().await;

    let facts = coordinator.get_snapshot().unwrap();
    let facts = facts.vehicle(1).unwrap();
    assert_eq!(*facts.fact(Category::Tax), FactValue::Empty);
    assert!(!facts.fetch_failed(Category::Tax));
}

#[tokio::test]
async fn vehicle_enumeration_failure_is_hard() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    source.set_records(1, Category::Fuel, Ok(vec![record(7, "2024-01-01")]));
    let coordinator = coordinator_with(&source);

    coordinator.request_refresh().await;
    let before = coordinator.get_snapshot().unwrap();

    let (_handle, mut events) = coordinator.subscribe();
    source.set_vehicles(Err(FetchError::Network("connection refused".into())));

    let outcome = coordinator.request_refresh().await;
    assert!(matches!(
        outcome,
        CycleOutcome::Failed(CycleError::VehicleEnumeration(_))
    ));

    // Previous snapshot untouched, failure notified exactly once
    let after = coordinator.get_snapshot().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(matches!(
        events.try_recv(),
        Ok(SyncEvent::RefreshFailed(CycleError::VehicleEnumeration(_)))
    ));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn terminal_auth_failure_is_hard_and_short_circuits() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    source.set_records(1, Category::Odometer, Err(FetchError::Auth));
    let coordinator = coordinator_with(&source);

    let outcome = coordinator.request_refresh().await;
    assert!(matches!(outcome, CycleOutcome::Failed(CycleError::Auth)));
    assert!(coordinator.get_snapshot().is_none());
}

#[tokio::test]
async fn all_categories_failed_vehicle_carries_everything() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    source.set_records(1, Category::Fuel, Ok(vec![record(7, "2024-01-01")]));
    let coordinator = coordinator_with(&source);

    coordinator.request_refresh().await;

    for category in Category::ALL {
        source.set_records(1, category, Err(FetchError::Network("down".into())));
    }
    let outcome = coordinator.request_refresh().await;

    // Still a partial success: the cycle publishes
    assert!(matches!(outcome, CycleOutcome::Published(_)));
    let snapshot = coordinator.get_snapshot().unwrap();
    let facts = snapshot.vehicle(1).unwrap();
    assert_eq!(facts.fact(Category::Fuel).record().unwrap().id, 7);
    // Categories that were empty before stay known-empty
    assert_eq!(*facts.fact(Category::Tax), FactValue::Empty);
}

#[tokio::test]
async fn all_categories_failed_without_history_omits_vehicle() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    for category in Category::ALL {
        source.set_records(1, category, Err(FetchError::Network("down".into())));
    }
    let coordinator = coordinator_with(&source);

    let outcome = coordinator.request_refresh().await;
    assert!(matches!(outcome, CycleOutcome::Published(_)));

    let snapshot = coordinator.get_snapshot().unwrap();
    assert!(snapshot.vehicle(1).is_none());
}

#[tokio::test]
async fn subscribers_notified_once_per_published_cycle() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    let coordinator = coordinator_with(&source);

    let (handle, mut events) = coordinator.subscribe();

    coordinator.request_refresh().await;
    assert!(matches!(
        events.try_recv(),
        Ok(SyncEvent::SnapshotPublished(_))
    ));
    assert!(events.try_recv().is_err());

    coordinator.unsubscribe(handle);
    coordinator.request_refresh().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_in_flight_cycle_and_releases_lock() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    source.set_delay(Duration::from_secs(10));
    let coordinator = coordinator_with(&source);

    let refresh = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.request_refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    coordinator.shutdown();
    let outcome = refresh.await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Cancelled));

    // Nothing published, and the in-flight slot is free again
    assert!(coordinator.get_snapshot().is_none());
    let outcome = coordinator.request_refresh().await;
    assert!(matches!(outcome, CycleOutcome::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn cancel_refresh_is_not_terminal() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    source.set_delay(Duration::from_secs(10));
    let coordinator = coordinator_with(&source);

    let refresh = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.request_refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    coordinator.cancel_refresh();
    assert!(matches!(refresh.await.unwrap(), CycleOutcome::Cancelled));
    assert!(coordinator.get_snapshot().is_none());

    // A subsequent refresh proceeds normally
    source.set_delay(Duration::ZERO);
    let outcome = coordinator.request_refresh().await;
    assert!(matches!(outcome, CycleOutcome::Published(_)));
    assert!(coordinator.get_snapshot().is_some());
}

#[tokio::test]
async fn status_counters_track_cycles() {
    let source = FakeSource::new();
    source.set_vehicles(Ok(vec![vehicle(1)]));
    let coordinator = coordinator_with(&source);

    coordinator.request_refresh().await;
    source.set_vehicles(Err(FetchError::Network("down".into())));
    coordinator.request_refresh().await;

    let status = coordinator.status();
    assert_eq!(status.cycle_count, 2);
    assert_eq!(status.failure_count, 1);
    assert!(status.last_published.is_some());
}

#[test]
fn backoff_doubles_until_cap_and_resets() {
    let mut backoff = Backoff::new(Duration::from_secs(300), Duration::from_secs(3600));

    // Strictly later than nominal after the first hard failure
    assert_eq!(backoff.after_failure(), Duration::from_secs(600));
    assert_eq!(backoff.after_failure(), Duration::from_secs(1200));
    assert_eq!(backoff.after_failure(), Duration::from_secs(2400));
    assert_eq!(backoff.after_failure(), Duration::from_secs(3600));
    assert_eq!(backoff.after_failure(), Duration::from_secs(3600));

    assert_eq!(backoff.reset(), Duration::from_secs(300));
    assert_eq!(backoff.after_failure(), Duration::from_secs(600));
}
