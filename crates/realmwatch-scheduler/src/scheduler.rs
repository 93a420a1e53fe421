//! Scheduler: per-realm fetch cadence and the monitoring control surface.
//!
//! The `Scheduler` is the control loop that:
//! - Decides which realms are due and claims them (`in_flight = true`)
//! - Runs each claimed realm's fetch cycle in its own supervised task
//! - Reschedules realms on their interval, or with backoff after a failure
//! - Answers status, latest and history queries for the API

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use realm_core::config::SchedulerSettings;
use realm_core::{Principal, RealmConfig};
use realmwatch_health::{
    BackoffPolicy, HealthScorer, HealthTracker, RealmHealth, StatusFetcher, fetch_with_timeout,
};
use realmwatch_state::{NewStatusRecord, StateError, StateResult, StatusRecord, StatusRepository};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, CycleError, SchedulerError, SchedulerResult, StoreCallError};
use crate::registry::RealmRegistry;

/// The most recent failure of a realm's fetch cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    /// Stable classification, e.g. `timeout` or `store_error`.
    pub kind: String,
    pub message: String,
    /// Unix milliseconds.
    pub at: u64,
}

/// Per-realm scheduling state held in memory.
struct ScheduleEntry {
    next_due_at: Instant,
    in_flight: bool,
    last_error: Option<LastError>,
    tracker: HealthTracker,
    last_success_at: Option<u64>,
    last_score: Option<u8>,
}

impl ScheduleEntry {
    fn new(next_due_at: Instant, tracker: HealthTracker) -> Self {
        Self {
            next_due_at,
            in_flight: false,
            last_error: None,
            tracker,
            last_success_at: None,
            last_score: None,
        }
    }

    /// Mark the entry as fetching. Returns `false` if a cycle already runs.
    fn try_claim(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        true
    }
}

/// Point-in-time view of one realm's schedule entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryStatus {
    pub principal: Principal,
    pub display_name: String,
    pub enabled: bool,
    pub in_flight: bool,
    /// Milliseconds until the realm is next due; 0 when already due.
    pub next_due_in_ms: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<LastError>,
    pub last_success_at: Option<u64>,
    pub last_score: Option<u8>,
    /// Delay applied at the last reschedule, in milliseconds.
    pub last_delay_ms: u64,
    pub health: RealmHealth,
}

/// Scheduler-wide status.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Whether the scheduler is configured to start automatically.
    pub enabled: bool,
    /// Whether ticks currently launch new fetch cycles.
    pub running: bool,
    pub fetch_interval_secs: u64,
    pub network: String,
    pub realms_count: usize,
    pub in_flight: usize,
    pub realms: Vec<EntryStatus>,
}

/// Current view of one realm: its config, the last good record and the
/// last failure, if any.
#[derive(Debug, Clone, Serialize)]
pub struct RealmStatusView {
    pub config: RealmConfig,
    pub latest: Option<StatusRecord>,
    pub last_error: Option<LastError>,
    pub consecutive_failures: u32,
    pub health: RealmHealth,
}

struct Inner {
    settings: SchedulerSettings,
    registry: RealmRegistry,
    /// principal → entry. Each entry has its own lock so claiming or
    /// completing one realm never blocks another.
    entries: RwLock<HashMap<Principal, Arc<Mutex<ScheduleEntry>>>>,
    fetcher: Arc<dyn StatusFetcher>,
    store: Arc<dyn StatusRepository>,
    scorer: HealthScorer,
    running: AtomicBool,
    permits: Semaphore,
    wake: Notify,
}

/// Polls registered realms and records their status.
///
/// Cheap to clone; all clones share the same registry and entries.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a stopped scheduler with an empty registry.
    pub fn new(
        settings: SchedulerSettings,
        scorer: HealthScorer,
        fetcher: Arc<dyn StatusFetcher>,
        store: Arc<dyn StatusRepository>,
    ) -> Self {
        let permits = Semaphore::new(settings.max_concurrent_fetches.max(1));
        Self {
            inner: Arc::new(Inner {
                settings,
                registry: RealmRegistry::new(),
                entries: RwLock::new(HashMap::new()),
                fetcher,
                store,
                scorer,
                running: AtomicBool::new(false),
                permits,
                wake: Notify::new(),
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Let ticks launch new fetch cycles.
    pub fn start(&self) {
        if !self.inner.running.swap(true, Ordering::SeqCst) {
            info!(
                interval_secs = self.inner.settings.fetch_interval.as_secs(),
                network = %self.inner.settings.network,
                "scheduler started"
            );
            self.inner.wake.notify_one();
        }
    }

    /// Stop launching new cycles. Cycles already in flight run to completion.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The control loop. Ticks every `tick_interval` or when woken by
    /// `fetch_now`, `start` or a registration, until `shutdown` changes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let tick_interval = self.inner.settings.tick_interval;
        info!(
            tick_ms = tick_interval.as_millis() as u64,
            "scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick_interval) => {}
                _ = self.inner.wake.notified() => {}
                _ = shutdown.changed() => {
                    info!("scheduler loop shutting down");
                    break;
                }
            }

            let launched = self.tick().await;
            if !launched.is_empty() {
                debug!(count = launched.len(), "launched fetch cycles");
            }
        }

        self.stop();
    }

    /// Claim every enabled, due, idle realm and launch its fetch cycle.
    /// Returns the principals that were launched. Does nothing while stopped.
    pub async fn tick(&self) -> Vec<Principal> {
        if !self.is_running() {
            return Vec::new();
        }

        let now = Instant::now();
        let configs = self.inner.registry.list().await;
        let entries = self.inner.entries.read().await.clone();
        let mut launched = Vec::new();

        for config in configs.into_iter().filter(|c| c.enabled) {
            let Some(entry) = entries.get(&config.principal) else {
                continue;
            };
            {
                let mut state = entry.lock().await;
                if state.next_due_at > now || !state.try_claim() {
                    continue;
                }
            }
            launched.push(config.principal.clone());
            let network = self.inner.settings.network.clone();
            self.spawn_supervised(Arc::clone(entry), config, network);
        }

        launched
    }

    /// Make a realm due immediately and wake the control loop.
    ///
    /// Returns `false` without effect if a fetch of the realm is already
    /// running or the realm is disabled, since ticks skip disabled realms.
    /// Use `fetch` for a one-off fetch of a disabled realm.
    pub async fn fetch_now(&self, principal: &str) -> SchedulerResult<bool> {
        let config = self.inner.registry.get(principal).await?;
        if !config.enabled {
            debug!(principal, "realm disabled, ignoring fetch_now");
            return Ok(false);
        }
        let entry = self.entry(principal).await?;
        {
            let mut state = entry.lock().await;
            if state.in_flight {
                debug!(principal, "fetch already in flight, ignoring fetch_now");
                return Ok(false);
            }
            state.next_due_at = Instant::now();
        }
        self.inner.wake.notify_one();
        Ok(true)
    }

    // ── On-demand fetches ──────────────────────────────────────────

    /// Fetch, score and store one realm now, bypassing its cadence.
    ///
    /// Works for disabled realms and while the scheduler is stopped. Fails
    /// with `InFlight` if a fetch of the realm is already running.
    pub async fn fetch(
        &self,
        principal: &str,
        network: Option<&str>,
    ) -> SchedulerResult<StatusRecord> {
        let config = self.inner.registry.get(principal).await?;
        let entry = self.entry(principal).await?;
        if !entry.lock().await.try_claim() {
            return Err(SchedulerError::InFlight(principal.to_string()));
        }

        let network = network
            .unwrap_or(&self.inner.settings.network)
            .to_string();
        let supervisor = self.spawn_supervised(entry, config, network);
        let outcome = supervisor
            .await
            .unwrap_or_else(|e| Err(CycleError::Aborted(e.to_string())));

        outcome.map_err(|source| SchedulerError::Cycle {
            principal: principal.to_string(),
            source,
        })
    }

    /// Fetch several realms in parallel. Duplicates are fetched once.
    pub async fn batch_fetch(
        &self,
        principals: &[String],
        network: Option<&str>,
    ) -> BTreeMap<Principal, SchedulerResult<StatusRecord>> {
        let unique: BTreeSet<&String> = principals.iter().collect();
        let handles: Vec<_> = unique
            .into_iter()
            .map(|principal| {
                let scheduler = self.clone();
                let principal = principal.clone();
                let network = network.map(str::to_string);
                let task_principal = principal.clone();
                let handle = tokio::spawn(async move {
                    scheduler
                        .fetch(&task_principal, network.as_deref())
                        .await
                });
                (principal, handle)
            })
            .collect();

        let mut results = BTreeMap::new();
        for (principal, handle) in handles {
            let result = handle.await.unwrap_or_else(|e| {
                Err(SchedulerError::Cycle {
                    principal: principal.clone(),
                    source: CycleError::Aborted(e.to_string()),
                })
            });
            results.insert(principal, result);
        }
        results
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Most recent record of a realm, including realms since removed.
    pub async fn latest(&self, principal: &str) -> SchedulerResult<StatusRecord> {
        let owned = principal.to_string();
        self.store_call(move |store| store.latest(&owned))
            .await?
            .ok_or_else(|| SchedulerError::NoStatus(principal.to_string()))
    }

    /// Records of a realm, newest first.
    pub async fn history(
        &self,
        principal: &str,
        limit: usize,
        before: Option<u64>,
    ) -> SchedulerResult<Vec<StatusRecord>> {
        let owned = principal.to_string();
        Ok(self
            .store_call(move |store| store.history(&owned, limit, before))
            .await?)
    }

    /// Config, last good record and last failure of a registered realm.
    pub async fn realm_status(&self, principal: &str) -> SchedulerResult<RealmStatusView> {
        let config = self.inner.registry.get(principal).await?;
        let owned = principal.to_string();
        let latest = self.store_call(move |store| store.latest(&owned)).await?;
        let entry = self.entry(principal).await?;
        let state = entry.lock().await;
        Ok(RealmStatusView {
            config,
            latest,
            last_error: state.last_error.clone(),
            consecutive_failures: state.tracker.consecutive_failures(),
            health: state.tracker.status(),
        })
    }

    /// Latest record of every realm, highest health score first.
    pub async fn summary(&self) -> SchedulerResult<Vec<StatusRecord>> {
        let mut records = self.store_call(|store| store.latest_all()).await?;
        records.sort_by(|a, b| {
            b.health_score
                .cmp(&a.health_score)
                .then_with(|| a.realm_principal.cmp(&b.realm_principal))
        });
        Ok(records)
    }

    pub async fn status(&self) -> SchedulerStatus {
        let now = Instant::now();
        let configs = self.inner.registry.list().await;
        let entries = self.inner.entries.read().await.clone();

        let mut realms = Vec::with_capacity(configs.len());
        for config in configs {
            let Some(entry) = entries.get(&config.principal) else {
                continue;
            };
            let state = entry.lock().await;
            realms.push(EntryStatus {
                principal: config.principal,
                display_name: config.display_name,
                enabled: config.enabled,
                in_flight: state.in_flight,
                next_due_in_ms: state.next_due_at.saturating_duration_since(now).as_millis()
                    as u64,
                consecutive_failures: state.tracker.consecutive_failures(),
                last_error: state.last_error.clone(),
                last_success_at: state.last_success_at,
                last_score: state.last_score,
                last_delay_ms: state.tracker.last_delay().as_millis() as u64,
                health: state.tracker.status(),
            });
        }

        SchedulerStatus {
            enabled: self.inner.settings.enabled,
            running: self.is_running(),
            fetch_interval_secs: self.inner.settings.fetch_interval.as_secs(),
            network: self.inner.settings.network.clone(),
            realms_count: realms.len(),
            in_flight: realms.iter().filter(|r| r.in_flight).count(),
            realms,
        }
    }

    /// Number of realms with a fetch cycle currently running.
    pub async fn in_flight_count(&self) -> usize {
        let entries = self.inner.entries.read().await.clone();
        let mut count = 0;
        for entry in entries.values() {
            if entry.lock().await.in_flight {
                count += 1;
            }
        }
        count
    }

    // ── Registry administration ────────────────────────────────────

    /// Register a realm and create its schedule entry.
    pub async fn add_realm(&self, config: RealmConfig) -> SchedulerResult<RealmConfig> {
        let config = self.inner.registry.add(config).await?;

        let interval = self.interval_for(&config);
        let next_due_at = if self.inner.settings.fetch_on_register {
            Instant::now()
        } else {
            Instant::now() + interval
        };
        {
            let mut entries = self.inner.entries.write().await;
            // A cycle started before an earlier removal may still hold the
            // entry; reuse it so its claim stays visible to `tick`.
            let retained = match entries.get(&config.principal) {
                Some(entry) => {
                    let mut state = entry.lock().await;
                    *state = ScheduleEntry {
                        in_flight: state.in_flight,
                        ..ScheduleEntry::new(next_due_at, self.new_tracker())
                    };
                    state.in_flight
                }
                None => {
                    let entry = ScheduleEntry::new(next_due_at, self.new_tracker());
                    entries.insert(config.principal.clone(), Arc::new(Mutex::new(entry)));
                    false
                }
            };
            if retained {
                debug!(principal = %config.principal, "re-registered realm still has a fetch in flight");
            }
        }

        self.persist_realm(&config).await;
        info!(
            principal = %config.principal,
            url = %config.url,
            enabled = config.enabled,
            "realm added"
        );
        if config.enabled && self.inner.settings.fetch_on_register {
            self.inner.wake.notify_one();
        }
        Ok(config)
    }

    /// Unregister a realm. Its stored records are kept, and a fetch already
    /// in flight runs to completion.
    pub async fn remove_realm(&self, principal: &str) -> SchedulerResult<RealmConfig> {
        let config = self.inner.registry.remove(principal).await?;
        {
            let mut entries = self.inner.entries.write().await;
            let idle = match entries.get(principal) {
                Some(entry) => !entry.lock().await.in_flight,
                None => false,
            };
            // An in-flight entry is dropped by its supervisor once the cycle ends.
            if idle {
                entries.remove(principal);
            }
        }

        let owned = principal.to_string();
        if let Err(e) = self.store_call(move |store| store.delete_realm(&owned)).await {
            warn!(principal, error = %e, "failed to remove persisted realm config");
        }
        info!(principal, "realm removed");
        Ok(config)
    }

    /// Replace a realm's url, name, interval and enabled flag.
    pub async fn update_realm(&self, config: RealmConfig) -> SchedulerResult<RealmConfig> {
        let (previous, config) = self.inner.registry.update(config).await?;
        if !previous.enabled && config.enabled {
            self.reschedule_after_enable(&config).await?;
        }
        self.persist_realm(&config).await;
        info!(principal = %config.principal, "realm updated");
        Ok(config)
    }

    /// Pause or resume scheduling of a realm. Records are untouched; a
    /// re-enabled realm is next due one interval from now.
    pub async fn set_enabled(&self, principal: &str, enabled: bool) -> SchedulerResult<RealmConfig> {
        let (was_enabled, config) = self.inner.registry.set_enabled(principal, enabled).await?;
        if !was_enabled && enabled {
            self.reschedule_after_enable(&config).await?;
        }
        if was_enabled != enabled {
            self.persist_realm(&config).await;
            info!(principal, enabled, "realm scheduling toggled");
        }
        Ok(config)
    }

    pub async fn list_realms(&self) -> Vec<RealmConfig> {
        self.inner.registry.list().await
    }

    pub async fn get_realm(&self, principal: &str) -> SchedulerResult<RealmConfig> {
        Ok(self.inner.registry.get(principal).await?)
    }

    /// Realm configs previously persisted by `add_realm` and friends.
    pub async fn persisted_realms(&self) -> SchedulerResult<Vec<RealmConfig>> {
        Ok(self.store_call(|store| store.list_realms()).await?)
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn entry(&self, principal: &str) -> Result<Arc<Mutex<ScheduleEntry>>, ConfigError> {
        self.inner
            .entries
            .read()
            .await
            .get(principal)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(principal.to_string()))
    }

    fn interval_for(&self, config: &RealmConfig) -> Duration {
        self.inner.interval_for(config)
    }

    fn new_tracker(&self) -> HealthTracker {
        let settings = &self.inner.settings;
        HealthTracker::new(
            BackoffPolicy::new(settings.retry_base, settings.max_backoff),
            settings.unhealthy_threshold,
        )
    }

    async fn reschedule_after_enable(&self, config: &RealmConfig) -> SchedulerResult<()> {
        let entry = self.entry(&config.principal).await?;
        let mut state = entry.lock().await;
        state.next_due_at = Instant::now() + self.interval_for(config);
        Ok(())
    }

    async fn persist_realm(&self, config: &RealmConfig) {
        let owned = config.clone();
        if let Err(e) = self.store_call(move |store| store.put_realm(&owned)).await {
            warn!(principal = %config.principal, error = %e, "failed to persist realm config");
        }
    }

    async fn store_call<T, F>(&self, op: F) -> Result<T, StoreCallError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StatusRepository) -> StateResult<T> + Send + 'static,
    {
        self.inner.store_call(op).await
    }

    /// Spawn a realm's fetch cycle under a supervisor task.
    ///
    /// The entry must already be claimed. The supervisor always returns the
    /// entry to idle and records the outcome, including when the cycle task
    /// panics.
    fn spawn_supervised(
        &self,
        entry: Arc<Mutex<ScheduleEntry>>,
        config: RealmConfig,
        network: String,
    ) -> tokio::task::JoinHandle<Result<StatusRecord, CycleError>> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let principal = config.principal.clone();
            let interval = inner.interval_for(&config);

            let cycle = tokio::spawn(Inner::run_cycle(Arc::clone(&inner), config, network));
            let outcome = match cycle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(CycleError::Aborted(e.to_string())),
            };

            inner.complete(&principal, &entry, interval, &outcome).await;
            inner.prune_if_removed(&principal, &entry).await;
            outcome
        })
    }
}

impl Inner {
    fn interval_for(&self, config: &RealmConfig) -> Duration {
        config
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.fetch_interval)
    }

    /// Fetch → score → append for one realm.
    async fn run_cycle(
        inner: Arc<Inner>,
        config: RealmConfig,
        network: String,
    ) -> Result<StatusRecord, CycleError> {
        let payload = {
            let _permit = inner
                .permits
                .acquire()
                .await
                .map_err(|e| CycleError::Aborted(e.to_string()))?;
            debug!(principal = %config.principal, %network, "fetching realm status");
            fetch_with_timeout(
                inner.fetcher.as_ref(),
                &config,
                &network,
                inner.settings.fetch_timeout,
            )
            .await?
        };

        let created_at = epoch_millis();
        let health_score = inner.scorer.score(&payload, created_at)?;
        let record = NewStatusRecord {
            realm_principal: config.principal,
            realm_url: config.url,
            status_payload: payload,
            health_score,
            created_at,
        };
        Ok(inner.store_call(move |store| store.append(record)).await?)
    }

    /// Return a claimed entry to idle and reschedule it.
    async fn complete(
        &self,
        principal: &str,
        entry: &Mutex<ScheduleEntry>,
        interval: Duration,
        outcome: &Result<StatusRecord, CycleError>,
    ) {
        let mut state = entry.lock().await;
        state.in_flight = false;

        match outcome {
            Ok(record) => {
                let delay = state.tracker.record_success(interval);
                state.next_due_at = Instant::now() + delay;
                state.last_error = None;
                state.last_success_at = Some(record.created_at);
                state.last_score = Some(record.health_score);
                debug!(
                    principal,
                    record_id = record.id,
                    score = record.health_score,
                    "realm status recorded"
                );
            }
            Err(e) => {
                let delay = state.tracker.record_failure();
                state.next_due_at = Instant::now() + delay;
                state.last_error = Some(LastError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                    at: epoch_millis(),
                });
                match e {
                    CycleError::Store(_) | CycleError::Aborted(_) => error!(
                        principal,
                        kind = e.kind(),
                        error = %e,
                        failures = state.tracker.consecutive_failures(),
                        "fetch cycle failed"
                    ),
                    _ => warn!(
                        principal,
                        kind = e.kind(),
                        error = %e,
                        failures = state.tracker.consecutive_failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "realm fetch failed"
                    ),
                }
            }
        }
    }

    /// Drop an entry whose realm was removed while its cycle was running.
    async fn prune_if_removed(&self, principal: &str, entry: &Arc<Mutex<ScheduleEntry>>) {
        let mut entries = self.entries.write().await;
        if self.registry.get(principal).await.is_ok() {
            return;
        }
        let current = entries
            .get(principal)
            .is_some_and(|held| Arc::ptr_eq(held, entry));
        if current && !entry.lock().await.in_flight {
            entries.remove(principal);
            debug!(principal, "dropped schedule entry of removed realm");
        }
    }

    /// Run a blocking store call on the blocking pool with `store_timeout`.
    async fn store_call<T, F>(&self, op: F) -> Result<T, StoreCallError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StatusRepository) -> StateResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let timeout = self.settings.store_timeout;
        let task = tokio::task::spawn_blocking(move || op(store.as_ref()));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) => Err(StateError::Transaction(format!("store task failed: {e}")).into()),
            Err(_) => Err(StoreCallError::Timeout(timeout)),
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
