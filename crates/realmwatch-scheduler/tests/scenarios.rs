//! End-to-end scheduler behaviour against scripted fetchers and stores.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use realm_core::config::SchedulerSettings;
use realm_core::{RealmConfig, StatusPayload};
use realmwatch_health::{FetchError, FetchFuture, HealthScorer, RealmHealth, StatusFetcher};
use realmwatch_scheduler::{ConfigError, CycleError, Scheduler, SchedulerError};
use realmwatch_state::{
    NewStatusRecord, StateError, StateResult, StatusRecord, StatusRepository, StatusStore,
};
use serde_json::{Value, json};
use tokio::time::Instant;

// ── Scripted fetcher ───────────────────────────────────────────────

enum Step {
    Respond(Value),
    Fail(FetchError),
    Hang,
    Panic,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fetcher that replays per-realm scripts and falls back to a fixed payload.
struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    fallback: Value,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(fallback: Value) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn script(self, principal: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(principal.to_string(), steps.into());
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StatusFetcher for ScriptedFetcher {
    fn fetch<'a>(
        &'a self,
        realm: &'a RealmConfig,
        _network: &'a str,
        _timeout: Duration,
    ) -> FetchFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&realm.principal)
                .and_then(VecDeque::pop_front);

            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = ActiveGuard(&self.active);
            self.max_active.fetch_max(now_active, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            match step {
                None => Ok(StatusPayload::new(self.fallback.clone()).unwrap()),
                Some(Step::Respond(value)) => Ok(StatusPayload::new(value).unwrap()),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(StatusPayload::new(json!({})).unwrap())
                }
                Some(Step::Panic) => panic!("scripted fetcher panic"),
            }
        })
    }
}

// ── Flaky store ────────────────────────────────────────────────────

/// In-memory store whose appends can be made to fail or stall.
struct FlakyStore {
    inner: StatusStore,
    fail_appends: AtomicBool,
    append_delay: Mutex<Duration>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: StatusStore::open_in_memory().unwrap(),
            fail_appends: AtomicBool::new(false),
            append_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl StatusRepository for FlakyStore {
    fn append(&self, record: NewStatusRecord) -> StateResult<StatusRecord> {
        let delay = *self.append_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StateError::Write("disk full".into()));
        }
        self.inner.append(record)
    }

    fn latest(&self, principal: &str) -> StateResult<Option<StatusRecord>> {
        self.inner.latest(principal)
    }

    fn history(
        &self,
        principal: &str,
        limit: usize,
        before: Option<u64>,
    ) -> StateResult<Vec<StatusRecord>> {
        self.inner.history(principal, limit, before)
    }

    fn latest_all(&self) -> StateResult<Vec<StatusRecord>> {
        self.inner.latest_all()
    }

    fn put_realm(&self, config: &RealmConfig) -> StateResult<()> {
        self.inner.put_realm(config)
    }

    fn delete_realm(&self, principal: &str) -> StateResult<bool> {
        self.inner.delete_realm(principal)
    }

    fn list_realms(&self) -> StateResult<Vec<RealmConfig>> {
        self.inner.list_realms()
    }
}

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    scheduler: Scheduler,
    fetcher: Arc<ScriptedFetcher>,
    store: Arc<FlakyStore>,
}

fn test_settings() -> SchedulerSettings {
    SchedulerSettings {
        fetch_interval: Duration::from_secs(300),
        fetch_timeout: Duration::from_millis(100),
        store_timeout: Duration::from_secs(2),
        retry_base: Duration::from_secs(1),
        max_backoff: Duration::from_secs(8),
        tick_interval: Duration::from_millis(10),
        ..SchedulerSettings::default()
    }
}

fn harness_with(settings: SchedulerSettings, fetcher: ScriptedFetcher) -> Harness {
    let fetcher = Arc::new(fetcher);
    let store = Arc::new(FlakyStore::new());
    let scheduler = Scheduler::new(
        settings,
        HealthScorer::default(),
        fetcher.clone(),
        store.clone(),
    );
    Harness {
        scheduler,
        fetcher,
        store,
    }
}

fn harness(fetcher: ScriptedFetcher) -> Harness {
    harness_with(test_settings(), fetcher)
}

async fn settle(scheduler: &Scheduler) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.in_flight_count().await > 0 {
        assert!(Instant::now() < deadline, "fetch cycles did not settle");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Leaves room for fetchers with an artificial delay.
fn slow_fetch_settings() -> SchedulerSettings {
    SchedulerSettings {
        fetch_timeout: Duration::from_secs(2),
        ..test_settings()
    }
}

fn r1() -> RealmConfig {
    RealmConfig::new("r1", "https://r1.example").with_interval_secs(300)
}

// ── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn first_tick_scores_then_timeout_keeps_last_good_record() {
    let h = harness(ScriptedFetcher::new(json!({})).script(
        "r1",
        vec![
            Step::Respond(json!({
                "users": 3,
                "orgs": 1,
                "extensions": 0,
                "recent_activity": true
            })),
            Step::Hang,
        ],
    ));
    h.scheduler.add_realm(r1()).await.unwrap();
    h.scheduler.start();

    assert_eq!(h.scheduler.tick().await, vec!["r1".to_string()]);
    settle(&h.scheduler).await;

    let first = h.scheduler.latest("r1").await.unwrap();
    assert_eq!(first.health_score, 90);
    assert_eq!(first.realm_url, "https://r1.example");
    assert_eq!(h.scheduler.history("r1", 10, None).await.unwrap().len(), 1);

    // Not due again for another interval.
    assert!(h.scheduler.tick().await.is_empty());

    assert!(h.scheduler.fetch_now("r1").await.unwrap());
    assert_eq!(h.scheduler.tick().await, vec!["r1".to_string()]);
    settle(&h.scheduler).await;

    assert_eq!(h.scheduler.latest("r1").await.unwrap(), first);
    let view = h.scheduler.realm_status("r1").await.unwrap();
    assert_eq!(view.latest, Some(first));
    assert_eq!(view.consecutive_failures, 1);
    assert_eq!(view.last_error.unwrap().kind, "timeout");
    assert_eq!(view.health, RealmHealth::Degraded);
    assert_eq!(h.scheduler.history("r1", 10, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_fetch_now_runs_once() {
    let settings = SchedulerSettings {
        fetch_on_register: false,
        ..test_settings()
    };
    let h = harness_with(
        settings,
        ScriptedFetcher::new(json!({})).with_delay(Duration::from_millis(50)),
    );
    h.scheduler.add_realm(r1()).await.unwrap();
    h.scheduler.start();
    assert!(h.scheduler.tick().await.is_empty());

    let mut calls = Vec::new();
    for _ in 0..10 {
        let scheduler = h.scheduler.clone();
        calls.push(tokio::spawn(async move { scheduler.fetch_now("r1").await }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert_eq!(h.scheduler.tick().await.len(), 1);
    assert!(!h.scheduler.fetch_now("r1").await.unwrap());
    assert!(h.scheduler.tick().await.is_empty());
    settle(&h.scheduler).await;

    assert_eq!(h.fetcher.calls(), 1);
    assert_eq!(h.scheduler.history("r1", 10, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_fetch_yields_one_success_and_in_flight_errors() {
    let h = harness(ScriptedFetcher::new(json!({"users": 1})).with_delay(Duration::from_millis(80)));
    h.scheduler.add_realm(r1()).await.unwrap();

    let mut calls = Vec::new();
    for _ in 0..5 {
        let scheduler = h.scheduler.clone();
        calls.push(tokio::spawn(async move { scheduler.fetch("r1", None).await }));
    }

    let mut successes = 0;
    let mut in_flight = 0;
    for call in calls {
        match call.await.unwrap() {
            Ok(record) => {
                successes += 1;
                assert_eq!(record.health_score, 70);
            }
            Err(SchedulerError::InFlight(p)) => {
                in_flight += 1;
                assert_eq!(p, "r1");
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(in_flight, 4);
    assert_eq!(h.fetcher.calls(), 1);
}

#[tokio::test]
async fn disabling_stops_scheduling_and_reenable_waits_one_interval() {
    let h = harness(ScriptedFetcher::new(json!({})));
    h.scheduler.add_realm(r1()).await.unwrap();
    h.scheduler.set_enabled("r1", false).await.unwrap();
    h.scheduler.start();

    assert!(h.scheduler.tick().await.is_empty());

    // On-demand fetches still work for a disabled realm.
    h.scheduler.fetch("r1", None).await.unwrap();
    assert_eq!(h.scheduler.history("r1", 10, None).await.unwrap().len(), 1);

    let config = h.scheduler.set_enabled("r1", true).await.unwrap();
    assert!(config.enabled);
    let status = h.scheduler.status().await;
    assert!(status.realms[0].next_due_in_ms > 290_000);
    assert!(h.scheduler.tick().await.is_empty());

    assert_eq!(h.scheduler.history("r1", 10, None).await.unwrap().len(), 1);
    assert_eq!(h.fetcher.calls(), 1);
}

#[tokio::test]
async fn backoff_grows_until_success_resets_it() {
    let unreachable = || Step::Fail(FetchError::Unreachable("connection refused".into()));
    let h = harness(ScriptedFetcher::new(json!({})).script(
        "r1",
        vec![unreachable(), unreachable(), unreachable(), unreachable()],
    ));
    h.scheduler.add_realm(r1()).await.unwrap();

    let expected = [
        (1, 1_000, RealmHealth::Degraded),
        (2, 2_000, RealmHealth::Degraded),
        (3, 4_000, RealmHealth::Unhealthy),
        (4, 8_000, RealmHealth::Unhealthy),
    ];
    let mut previous_delay = 0;
    for (failures, delay_ms, health) in expected {
        let err = h.scheduler.fetch("r1", None).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Cycle { source: CycleError::Fetch(FetchError::Unreachable(_)), .. }
        ));

        let entry = h.scheduler.status().await.realms.remove(0);
        assert_eq!(entry.consecutive_failures, failures);
        assert_eq!(entry.last_delay_ms, delay_ms);
        assert!(entry.last_delay_ms >= previous_delay);
        assert_eq!(entry.health, health);
        assert_eq!(entry.last_error.unwrap().kind, "unreachable");
        previous_delay = entry.last_delay_ms;
    }

    h.scheduler.fetch("r1", None).await.unwrap();
    let entry = h.scheduler.status().await.realms.remove(0);
    assert_eq!(entry.consecutive_failures, 0);
    assert_eq!(entry.last_delay_ms, 300_000);
    assert!(entry.last_error.is_none());
    assert_eq!(entry.health, RealmHealth::Healthy);
}

#[tokio::test]
async fn store_failures_stay_with_the_realm() {
    let h = harness(ScriptedFetcher::new(json!({})));
    h.scheduler.add_realm(r1()).await.unwrap();
    h.scheduler
        .add_realm(RealmConfig::new("r2", "https://r2.example"))
        .await
        .unwrap();

    h.store.fail_appends.store(true, Ordering::SeqCst);
    let err = h.scheduler.fetch("r1", None).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Cycle { source: CycleError::Store(_), .. }
    ));
    let view = h.scheduler.realm_status("r1").await.unwrap();
    assert_eq!(view.last_error.unwrap().kind, "store_error");
    assert!(view.latest.is_none());

    h.store.fail_appends.store(false, Ordering::SeqCst);
    h.scheduler.fetch("r2", None).await.unwrap();
    let view = h.scheduler.realm_status("r2").await.unwrap();
    assert_eq!(view.consecutive_failures, 0);

    // r1 is idle again and retries normally.
    h.scheduler.fetch("r1", None).await.unwrap();
    assert_eq!(h.scheduler.realm_status("r1").await.unwrap().consecutive_failures, 0);
}

#[tokio::test]
async fn slow_store_counts_as_store_timeout() {
    let settings = SchedulerSettings {
        store_timeout: Duration::from_millis(50),
        ..test_settings()
    };
    let h = harness_with(settings, ScriptedFetcher::new(json!({})));
    h.scheduler.add_realm(r1()).await.unwrap();

    *h.store.append_delay.lock().unwrap() = Duration::from_millis(300);
    let err = h.scheduler.fetch("r1", None).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Cycle { source: CycleError::Store(_), .. }
    ));
    let view = h.scheduler.realm_status("r1").await.unwrap();
    assert_eq!(view.last_error.unwrap().kind, "store_timeout");
    assert_eq!(h.scheduler.in_flight_count().await, 0);
}

#[tokio::test]
async fn stop_lets_in_flight_cycles_finish() {
    let h = harness_with(
        slow_fetch_settings(),
        ScriptedFetcher::new(json!({})).with_delay(Duration::from_millis(150)),
    );
    h.scheduler.add_realm(r1()).await.unwrap();
    h.scheduler.start();
    assert_eq!(h.scheduler.tick().await.len(), 1);

    h.scheduler.stop();
    assert!(!h.scheduler.is_running());
    assert_eq!(h.scheduler.in_flight_count().await, 1);
    settle(&h.scheduler).await;

    assert_eq!(h.scheduler.history("r1", 10, None).await.unwrap().len(), 1);

    h.scheduler.fetch_now("r1").await.unwrap();
    assert!(h.scheduler.tick().await.is_empty());
}

#[tokio::test]
async fn removing_a_realm_keeps_its_records() {
    let h = harness(ScriptedFetcher::new(json!({})));
    h.scheduler.add_realm(r1()).await.unwrap();
    let record = h.scheduler.fetch("r1", None).await.unwrap();

    h.scheduler.remove_realm("r1").await.unwrap();
    assert!(matches!(
        h.scheduler.get_realm("r1").await,
        Err(SchedulerError::Config(ConfigError::NotFound(_)))
    ));
    assert_eq!(h.scheduler.latest("r1").await.unwrap(), record);
    assert_eq!(h.scheduler.history("r1", 10, None).await.unwrap().len(), 1);
    assert_eq!(h.scheduler.status().await.realms_count, 0);
}

#[tokio::test]
async fn re_registering_during_a_fetch_does_not_start_a_second_one() {
    let h = harness_with(
        slow_fetch_settings(),
        ScriptedFetcher::new(json!({"users": 1})).with_delay(Duration::from_millis(200)),
    );
    h.scheduler.add_realm(r1()).await.unwrap();
    h.scheduler.start();
    assert_eq!(h.scheduler.tick().await, vec!["r1".to_string()]);

    h.scheduler.remove_realm("r1").await.unwrap();
    h.scheduler.add_realm(r1()).await.unwrap();

    // The cycle launched before the removal still holds the realm.
    assert!(h.scheduler.tick().await.is_empty());
    assert!(matches!(
        h.scheduler.fetch("r1", None).await,
        Err(SchedulerError::InFlight(_))
    ));
    assert!(!h.scheduler.fetch_now("r1").await.unwrap());
    assert!(h.scheduler.status().await.realms[0].in_flight);

    settle(&h.scheduler).await;
    assert_eq!(h.fetcher.calls(), 1);
    assert_eq!(h.fetcher.max_active.load(Ordering::SeqCst), 1);

    h.scheduler.fetch("r1", None).await.unwrap();
    assert_eq!(h.scheduler.history("r1", 10, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn removed_realm_entry_is_dropped_when_its_fetch_ends() {
    let h = harness_with(
        slow_fetch_settings(),
        ScriptedFetcher::new(json!({})).with_delay(Duration::from_millis(100)),
    );
    h.scheduler.add_realm(r1()).await.unwrap();
    h.scheduler.start();
    h.scheduler.tick().await;

    h.scheduler.remove_realm("r1").await.unwrap();
    assert_eq!(h.scheduler.in_flight_count().await, 1);
    assert_eq!(h.scheduler.status().await.realms_count, 0);

    settle(&h.scheduler).await;
    // The record written by the orphaned cycle is kept like any other.
    assert_eq!(h.scheduler.history("r1", 10, None).await.unwrap().len(), 1);

    h.scheduler.add_realm(r1()).await.unwrap();
    let entry = h.scheduler.status().await.realms.remove(0);
    assert!(!entry.in_flight);
    assert_eq!(entry.consecutive_failures, 0);
    assert_eq!(h.scheduler.tick().await, vec!["r1".to_string()]);
    settle(&h.scheduler).await;
}

#[tokio::test]
async fn batch_fetch_reports_each_realm() {
    let h = harness(ScriptedFetcher::new(json!({"users": 5})).script(
        "bad",
        vec![Step::Fail(FetchError::RemoteError {
            code: 1,
            message: "canister stopped".into(),
        })],
    ));
    h.scheduler.add_realm(r1()).await.unwrap();
    h.scheduler
        .add_realm(RealmConfig::new("bad", "https://bad.example"))
        .await
        .unwrap();

    let principals = vec![
        "r1".to_string(),
        "bad".to_string(),
        "ghost".to_string(),
        "r1".to_string(),
    ];
    let results = h.scheduler.batch_fetch(&principals, None).await;

    assert_eq!(results.len(), 3);
    assert_eq!(results["r1"].as_ref().unwrap().health_score, 70);
    assert!(matches!(
        results["bad"],
        Err(SchedulerError::Cycle { source: CycleError::Fetch(FetchError::RemoteError { code: 1, .. }), .. })
    ));
    assert!(matches!(
        results["ghost"],
        Err(SchedulerError::Config(ConfigError::NotFound(_)))
    ));
    assert_eq!(h.fetcher.calls(), 2);
}

#[tokio::test]
async fn panicking_fetch_is_recorded_as_aborted() {
    let h = harness(ScriptedFetcher::new(json!({})).script("r1", vec![Step::Panic]));
    h.scheduler.add_realm(r1()).await.unwrap();

    let err = h.scheduler.fetch("r1", None).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Cycle { source: CycleError::Aborted(_), .. }
    ));
    let view = h.scheduler.realm_status("r1").await.unwrap();
    assert_eq!(view.last_error.unwrap().kind, "aborted");
    assert_eq!(view.consecutive_failures, 1);

    // The entry went back to idle.
    h.scheduler.fetch("r1", None).await.unwrap();
}

#[tokio::test]
async fn concurrent_fetches_respect_the_permit_bound() {
    let settings = SchedulerSettings {
        max_concurrent_fetches: 2,
        ..test_settings()
    };
    let h = harness_with(
        settings,
        ScriptedFetcher::new(json!({})).with_delay(Duration::from_millis(40)),
    );
    for i in 0..5 {
        h.scheduler
            .add_realm(RealmConfig::new(format!("r{i}"), "https://x.example"))
            .await
            .unwrap();
    }
    h.scheduler.start();
    assert_eq!(h.scheduler.tick().await.len(), 5);
    settle(&h.scheduler).await;

    assert_eq!(h.fetcher.calls(), 5);
    assert!(h.fetcher.max_active.load(Ordering::SeqCst) <= 2);
    assert_eq!(h.scheduler.summary().await.unwrap().len(), 5);
}

#[tokio::test]
async fn summary_orders_by_score() {
    let h = harness(
        ScriptedFetcher::new(json!({}))
            .script("a-low", vec![Step::Respond(json!({}))])
            .script(
                "b-high",
                vec![Step::Respond(json!({"users": 1, "orgs": 1, "extensions": 1}))],
            ),
    );
    for p in ["a-low", "b-high"] {
        h.scheduler
            .add_realm(RealmConfig::new(p, "https://x.example"))
            .await
            .unwrap();
        h.scheduler.fetch(p, None).await.unwrap();
    }

    let summary = h.scheduler.summary().await.unwrap();
    let order: Vec<_> = summary
        .iter()
        .map(|r| (r.realm_principal.as_str(), r.health_score))
        .collect();
    assert_eq!(order, vec![("b-high", 90), ("a-low", 50)]);
}

#[tokio::test]
async fn run_loop_picks_up_new_realms_and_stops_on_shutdown() {
    let h = harness(ScriptedFetcher::new(json!({"users": 1})));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    h.scheduler.start();
    let runner = {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    h.scheduler.add_realm(r1()).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if h.scheduler.latest("r1").await.is_ok() {
            break;
        }
        assert!(Instant::now() < deadline, "run loop never fetched r1");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run loop did not exit")
        .unwrap();
    assert!(!h.scheduler.is_running());
    assert_eq!(h.fetcher.calls(), 1);
}
