//! Refresh coordination.
//!
//! One coordinator instance owns the cached snapshot and serializes all
//! refresh work into at most one in-flight cycle: the timer and on-demand
//! callers both go through [`Coordinator::request_refresh`], which attaches
//! to a running cycle instead of starting a second one. Readers use
//! [`Coordinator::get_snapshot`], a plain read of the last published value
//! that never participates in the refresh lock.
//!
//! Cycle pipeline: enumerate vehicles, fan out category fetches under the
//! configured concurrency limit, reduce to per-vehicle facts, carry over
//! last known good values for failed categories, swap the snapshot, notify
//! subscribers. Only authentication failing terminally or vehicle
//! enumeration failing hard-fails a cycle; everything below that degrades
//! per category.

use crate::client::records::{Category, RawRecord, Vehicle};
use crate::client::{FetchError, RecordSource};
use crate::config::SyncConfig;
use crate::snapshot::normalize::{merge_carry_over, reduce, CategoryFetch};
use crate::snapshot::{Snapshot, VehicleFacts};
use crate::subscription::{SubscriptionHandle, SubscriptionRegistry, SyncEvent};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod tests;

/// Cycle-level hard failure.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleError {
    /// Authentication failed terminally (after the single re-auth retry)
    Auth,
    /// Vehicle enumeration failed after authentication succeeded
    VehicleEnumeration(String),
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleError::Auth => write!(f, "authentication failed"),
            CycleError::VehicleEnumeration(msg) => {
                write!(f, "vehicle enumeration failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for CycleError {}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// A snapshot was published (success or partial success)
    Published(Arc<Snapshot>),
    /// Hard failure; the previously published snapshot was retained
    Failed(CycleError),
    /// Shutdown interrupted the cycle; nothing was published
    Cancelled,
}

/// Monitoring counters, updated once per completed cycle.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStatus {
    /// Completed cycles (published or hard-failed)
    pub cycle_count: u64,
    /// Hard-failed cycles
    pub failure_count: u64,
    /// Timestamp of the last published snapshot
    pub last_published: Option<DateTime<Utc>>,
}

/// Hard-failure backoff: doubles from the nominal interval up to a cap,
/// reset by any published cycle.
struct Backoff {
    nominal: Duration,
    cap: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(nominal: Duration, cap: Duration) -> Self {
        Self {
            nominal,
            cap,
            current: None,
        }
    }

    /// Delay before the next automatic refresh after a hard failure.
    fn after_failure(&mut self) -> Duration {
        let doubled = self.current.unwrap_or(self.nominal).saturating_mul(2);
        let next = doubled.min(self.cap);
        self.current = Some(next);
        next
    }

    /// Reset after a published cycle; the next delay is nominal again.
    fn reset(&mut self) -> Duration {
        self.current = None;
        self.nominal
    }
}

/// Schedules refreshes, caches the last good snapshot, and publishes
/// updates to subscribers.
pub struct Coordinator {
    sync_config: SyncConfig,
    source: Arc<dyn RecordSource>,
    /// Last published snapshot; replaced as a whole, never mutated
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    /// Completion channel of the in-flight cycle, if any. Present exactly
    /// while a cycle runs; late callers attach to it instead of fetching.
    in_flight: Mutex<Option<broadcast::Sender<CycleOutcome>>>,
    registry: SubscriptionRegistry,
    shutdown: watch::Sender<bool>,
    /// Cancellation epoch; bumping it aborts the in-flight cycle only
    cancel: watch::Sender<u64>,
    status: std::sync::Mutex<CoordinatorStatus>,
}

impl Coordinator {
    pub fn new(sync_config: SyncConfig, source: Arc<dyn RecordSource>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (cancel, _) = watch::channel(0);
        Self {
            sync_config,
            source,
            snapshot: RwLock::new(None),
            in_flight: Mutex::new(None),
            registry: SubscriptionRegistry::new(),
            shutdown,
            cancel,
            status: std::sync::Mutex::new(CoordinatorStatus::default()),
        }
    }

    /// The last published snapshot, immediately and without blocking on any
    /// refresh. None until the first cycle publishes.
    pub fn get_snapshot(&self) -> Option<Arc<Snapshot>> {
        let guard = match self.snapshot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    /// Register a subscriber for per-cycle events.
    pub fn subscribe(&self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<SyncEvent>) {
        self.registry.subscribe()
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    pub fn status(&self) -> CoordinatorStatus {
        match self.status.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Request a refresh, resolving when the cycle publishes or fails.
    ///
    /// If a cycle is already in flight the caller attaches to its
    /// completion; the remote service sees exactly one set of fetch calls
    /// per cycle regardless of how many callers request one.
    pub async fn request_refresh(&self) -> CycleOutcome {
        let mut attached = {
            let mut guard = self.in_flight.lock().await;
            match guard.as_ref() {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    *guard = Some(tx);
                    drop(guard);
                    return self.run_cycle_to_completion().await;
                }
            }
        };
        debug!("Attached to in-flight refresh cycle");
        match attached.recv().await {
            Ok(outcome) => outcome,
            // Sender dropped without a send only if the running task died
            Err(_) => CycleOutcome::Cancelled,
        }
    }

    /// Run one cycle, publish its result, then release the in-flight slot.
    async fn run_cycle_to_completion(&self) -> CycleOutcome {
        let outcome = self.run_cycle().await;

        match &outcome {
            CycleOutcome::Published(snapshot) => {
                {
                    let mut guard = match self.snapshot.write() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    *guard = Some(Arc::clone(snapshot));
                }
                self.update_status(|status| {
                    status.cycle_count += 1;
                    status.last_published = Some(snapshot.taken_at);
                });
                info!(
                    vehicles = snapshot.vehicle_count(),
                    "Published vehicle facts snapshot"
                );
                self.registry
                    .notify(&SyncEvent::SnapshotPublished(Arc::clone(snapshot)));
            }
            CycleOutcome::Failed(err) => {
                self.update_status(|status| {
                    status.cycle_count += 1;
                    status.failure_count += 1;
                });
                error!(error = %err, "Refresh cycle hard-failed, keeping previous snapshot");
                self.registry.notify(&SyncEvent::RefreshFailed(err.clone()));
            }
            CycleOutcome::Cancelled => {
                info!("Refresh cycle cancelled");
            }
        }

        // Release the in-flight slot and wake attached callers. Done on
        // every exit path so a cancelled cycle never wedges the next one.
        let mut guard = self.in_flight.lock().await;
        if let Some(tx) = guard.take() {
            let _ = tx.send(outcome.clone());
        }
        outcome
    }

    fn update_status(&self, apply: impl FnOnce(&mut CoordinatorStatus)) {
        let mut guard = match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
    }

    /// One refresh cycle: enumerate, fetch, normalize, build the snapshot.
    async fn run_cycle(&self) -> CycleOutcome {
        let reference = Utc::now();
        let mut shutdown = self.shutdown.subscribe();
        let mut cancel = self.cancel.subscribe();
        if *shutdown.borrow() {
            return CycleOutcome::Cancelled;
        }

        debug!("Refresh cycle starting");

        let vehicles = tokio::select! {
            _ = shutdown.changed() => return CycleOutcome::Cancelled,
            _ = cancel.changed() => return CycleOutcome::Cancelled,
            result = self.source.vehicles() => match result {
                Ok(vehicles) => vehicles,
                Err(FetchError::Auth) => return CycleOutcome::Failed(CycleError::Auth),
                Err(err) => {
                    return CycleOutcome::Failed(CycleError::VehicleEnumeration(err.to_string()))
                }
            },
        };

        let results = {
            let fetch_all = self.fetch_categories(&vehicles);
            tokio::select! {
                _ = shutdown.changed() => return CycleOutcome::Cancelled,
                _ = cancel.changed() => return CycleOutcome::Cancelled,
                results = fetch_all => results,
            }
        };

        // A terminal auth failure anywhere hard-fails the cycle
        if results
            .iter()
            .any(|(_, _, result)| matches!(result, Err(FetchError::Auth)))
        {
            return CycleOutcome::Failed(CycleError::Auth);
        }

        let previous = self.get_snapshot();
        let snapshot = build_snapshot(reference, &vehicles, results, previous.as_deref());
        CycleOutcome::Published(Arc::new(snapshot))
    }

    /// Fan out all (vehicle, category) fetches under the concurrency limit.
    ///
    /// Once one fetch reports a terminal auth failure the remaining ones
    /// short-circuit without touching the network.
    async fn fetch_categories(
        &self,
        vehicles: &[Vehicle],
    ) -> Vec<(i64, Category, Result<Vec<RawRecord>, FetchError>)> {
        let pairs: Vec<(i64, Category)> = vehicles
            .iter()
            .flat_map(|v| Category::ALL.iter().map(move |c| (v.id, *c)))
            .collect();

        let auth_failed = Arc::new(AtomicBool::new(false));
        let source = &self.source;

        stream::iter(pairs.into_iter().map(|(vehicle_id, category)| {
            let auth_failed = Arc::clone(&auth_failed);
            async move {
                if auth_failed.load(Ordering::Relaxed) {
                    return (vehicle_id, category, Err(FetchError::Auth));
                }
                let result = source.category_records(vehicle_id, category).await;
                if matches!(result, Err(FetchError::Auth)) {
                    auth_failed.store(true, Ordering::Relaxed);
                }
                (vehicle_id, category, result)
            }
        }))
        .buffer_unordered(self.sync_config.concurrency_limit.max(1))
        .collect()
        .await
    }

    /// Start the automatic refresh loop (non-blocking).
    ///
    /// The first refresh runs immediately; afterwards the loop waits the
    /// nominal interval, stretched by backoff after hard failures.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run_scheduler().await })
    }

    async fn run_scheduler(self: Arc<Self>) {
        let nominal = Duration::from_secs(self.sync_config.interval_seconds);
        let cap = Duration::from_secs(self.sync_config.backoff_cap_seconds);
        let mut backoff = Backoff::new(nominal, cap);
        let mut shutdown = self.shutdown.subscribe();

        info!(
            interval_seconds = self.sync_config.interval_seconds,
            "Starting refresh scheduler"
        );

        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            delay = match self.request_refresh().await {
                CycleOutcome::Published(_) => backoff.reset(),
                CycleOutcome::Failed(_) => {
                    let next = backoff.after_failure();
                    warn!(
                        delay_seconds = next.as_secs(),
                        "Backing off after hard-failure cycle"
                    );
                    next
                }
                CycleOutcome::Cancelled => break,
            };
        }

        info!("Refresh scheduler stopped");
    }

    /// Cancel the in-flight refresh cycle, if any.
    ///
    /// The previous snapshot is untouched and the in-flight slot is
    /// released, so a subsequent refresh starts cleanly. Waiters attached
    /// to the cancelled cycle resolve with [`CycleOutcome::Cancelled`].
    pub fn cancel_refresh(&self) {
        self.cancel.send_modify(|epoch| *epoch += 1);
    }

    /// Cancel any in-flight cycle and stop the scheduler.
    ///
    /// The previous snapshot stays published and the in-flight slot is
    /// released, so a later coordinator could resume cleanly.
    pub fn shutdown(&self) {
        info!("Coordinator shutting down");
        self.shutdown.send_replace(true);
    }
}

/// Assemble the published snapshot from one cycle's fetch results.
fn build_snapshot(
    reference: DateTime<Utc>,
    vehicles: &[Vehicle],
    results: Vec<(i64, Category, Result<Vec<RawRecord>, FetchError>)>,
    previous: Option<&Snapshot>,
) -> Snapshot {
    let mut per_vehicle: BTreeMap<i64, BTreeMap<Category, CategoryFetch>> = BTreeMap::new();
    for (vehicle_id, category, result) in results {
        let fetch = match result {
            Ok(records) => CategoryFetch::Records(records),
            // Missing endpoint means the category has no data, not a failure
            Err(FetchError::NotFound) => CategoryFetch::Records(Vec::new()),
            Err(err @ FetchError::Malformed(_)) => {
                warn!(
                    vehicle_id,
                    category = %category,
                    error = %err,
                    "Discarding malformed category response"
                );
                CategoryFetch::Failed(err)
            }
            Err(err) => {
                warn!(
                    vehicle_id,
                    category = %category,
                    error = %err,
                    "Category fetch failed, will carry over previous value"
                );
                CategoryFetch::Failed(err)
            }
        };
        per_vehicle.entry(vehicle_id).or_default().insert(category, fetch);
    }

    let mut facts_by_vehicle: BTreeMap<i64, VehicleFacts> = BTreeMap::new();
    for vehicle in vehicles {
        let results = per_vehicle.remove(&vehicle.id).unwrap_or_default();
        let mut facts = reduce(vehicle, &results);
        merge_carry_over(&mut facts, previous.and_then(|s| s.vehicle(vehicle.id)));

        if facts.is_entirely_unavailable() {
            warn!(
                vehicle_id = vehicle.id,
                "Every category failed and no previous facts exist, omitting vehicle"
            );
            continue;
        }
        facts_by_vehicle.insert(vehicle.id, facts);
    }

    Snapshot {
        taken_at: reference,
        vehicles: facts_by_vehicle,
    }
}
