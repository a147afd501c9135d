//! カレンダー同期サイクル
//!
//! One cycle fetches events for the coming week, plans their alerts,
//! schedules every planned alert under its idempotency key and finally
//! schedules the next cycle under [`SYNC_WORK_KEY`]. Because the cycle
//! itself is a keyed delayed task, an out-of-band sync replaces the pending
//! one instead of running next to it.

use async_trait::async_trait;
use ca_core::alert::plan;
use ca_core::{
    Clock, Event, LocalEventSource, RemoteEventSource, SettingsStore, SyncFrequency, SyncState,
    TimeWindow,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::handler::{FiredTask, TaskHandler};
use crate::scheduler::DelayedScheduler;
use crate::{Result, ScheduleError};

/// Fixed key of the recurring sync task
pub const SYNC_WORK_KEY: &str = "calendar_sync_work";

/// Task type handled by [`SyncTaskHandler`]
pub const SYNC_TASK_TYPE: &str = "calendar_sync";

/// Where the orchestrator currently is within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CyclePhase {
    #[default]
    Idle,
    Fetching,
    Planning,
    Reconciling,
    SchedulingNext,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Fetching => "fetching",
            CyclePhase::Planning => "planning",
            CyclePhase::Reconciling => "reconciling",
            CyclePhase::SchedulingNext => "scheduling next",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    /// The cycle produced no alerts; the reason is attached
    Failed(String),
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Success)
    }
}

/// Summary of one finished cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    /// Local and remote events together
    pub events_fetched: usize,
    pub remote_events: usize,
    /// Set when the remote fetch failed and was skipped
    pub remote_error: Option<String>,
    pub alerts_scheduled: usize,
    /// Alerts whose store write failed
    pub store_failures: usize,
    /// `None` until the next cycle has been armed
    pub next_sync_at: Option<DateTime<Utc>>,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            outcome: CycleOutcome::Success,
            events_fetched: 0,
            remote_events: 0,
            remote_error: None,
            alerts_scheduled: 0,
            store_failures: 0,
            next_sync_at: None,
        }
    }
}

/// Drives the periodic fetch, plan and reconcile cycle
pub struct SyncOrchestrator {
    local: Arc<dyn LocalEventSource>,
    remote: Option<Arc<dyn RemoteEventSource>>,
    settings: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    phase: Mutex<CyclePhase>,
    last_report: Mutex<Option<CycleReport>>,
    /// Held for the whole cycle so that cycles never overlap
    cycle_lock: tokio::sync::Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        local: Arc<dyn LocalEventSource>,
        settings: Arc<dyn SettingsStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local,
            remote: None,
            settings,
            clock,
            phase: Mutex::new(CyclePhase::Idle),
            last_report: Mutex::new(None),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Also fetch from a remote account
    pub fn with_remote(mut self, remote: Arc<dyn RemoteEventSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_phase(&self, phase: CyclePhase) {
        debug!(phase = %phase, "Sync phase");
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    /// Schedule a sync cycle to run now, replacing the pending one
    pub fn request_immediate_sync(&self, scheduler: &DelayedScheduler) -> Result<()> {
        info!("Immediate sync requested");
        scheduler.schedule(SYNC_WORK_KEY, self.clock.now(), SYNC_TASK_TYPE, json!({}))
    }

    /// Run one full cycle
    ///
    /// Never fails: problems are recorded in the returned report. The next
    /// cycle is scheduled whether or not this one succeeded.
    pub async fn run_cycle(&self, scheduler: &DelayedScheduler) -> CycleReport {
        let _guard = self.cycle_lock.lock().await;

        let now = self.clock.now();
        let mut report = CycleReport::new(now);
        info!("Starting calendar sync");

        let frequency = match self.reconcile(scheduler, now, &mut report).await {
            Ok(frequency) => frequency,
            Err((frequency, reason)) => {
                error!("Sync cycle failed: {}", reason);
                report.outcome = CycleOutcome::Failed(reason);
                frequency
            }
        };

        self.set_phase(CyclePhase::SchedulingNext);
        if report.outcome.is_success() {
            if let Err(e) = SyncState::record_sync(self.settings.as_ref(), now) {
                error!("Failed to record sync time: {}", e);
            }
        }

        let next_at = now + frequency.interval();
        match scheduler.schedule(SYNC_WORK_KEY, next_at, SYNC_TASK_TYPE, json!({})) {
            Ok(()) => {
                info!(next_sync_at = %next_at, frequency = %frequency, "Next sync scheduled");
            }
            Err(e) => {
                // The firing entry is already claimed, so without a timer
                // the sync loop would stop here
                error!("Failed to persist next sync, keeping it in memory: {}", e);
                scheduler.schedule_in_memory(SYNC_WORK_KEY, next_at, SYNC_TASK_TYPE, json!({}));
            }
        }
        report.next_sync_at = Some(next_at);

        self.set_phase(CyclePhase::Idle);
        info!(
            success = report.outcome.is_success(),
            events = report.events_fetched,
            alerts = report.alerts_scheduled,
            store_failures = report.store_failures,
            "Calendar sync finished"
        );

        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    /// Fetch, plan and schedule alerts, returning the frequency to use for
    /// the next cycle
    async fn reconcile(
        &self,
        scheduler: &DelayedScheduler,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> std::result::Result<SyncFrequency, (SyncFrequency, String)> {
        let state = SyncState::load(self.settings.as_ref())
            .map_err(|e| (SyncFrequency::default(), format!("Failed to load sync state: {}", e)))?;
        let frequency = state.sync_frequency;
        let window = TimeWindow::lookahead(now);

        self.set_phase(CyclePhase::Fetching);
        let mut events = self
            .local
            .fetch_local_events(&state.selected_calendar_ids, &window)
            .await
            .map_err(|e| (frequency, format!("Local fetch failed: {}", e)))?;
        debug!(count = events.len(), "Fetched local events");

        let remote_events = self.fetch_remote(&window, report).await;
        report.remote_events = remote_events.len();
        events.extend(remote_events);
        report.events_fetched = events.len();

        self.set_phase(CyclePhase::Planning);
        let tasks = plan(&events, now);
        debug!(count = tasks.len(), "Planned alerts");

        self.set_phase(CyclePhase::Reconciling);
        for task in &tasks {
            let scheduled = task.payload_json().map_err(ScheduleError::from).and_then(|payload| {
                scheduler.schedule(&task.key, task.fire_at, ca_core::ALERT_TASK_TYPE, payload)
            });
            match scheduled {
                Ok(()) => report.alerts_scheduled += 1,
                Err(e) => {
                    warn!(key = %task.key, "Failed to schedule alert: {}", e);
                    report.store_failures += 1;
                }
            }
        }

        Ok(frequency)
    }

    async fn fetch_remote(&self, window: &TimeWindow, report: &mut CycleReport) -> Vec<Event> {
        let Some(remote) = &self.remote else {
            return Vec::new();
        };
        let Some(session) = remote.session() else {
            debug!("No remote session, skipping remote calendar");
            return Vec::new();
        };

        match remote.fetch_remote_events(&session, window).await {
            Ok(events) => {
                debug!(account = %session.account, count = events.len(), "Fetched remote events");
                events
            }
            Err(e) => {
                warn!(account = %session.account, "Remote fetch failed, continuing with local events: {}", e);
                report.remote_error = Some(e.to_string());
                Vec::new()
            }
        }
    }
}

/// Runs a sync cycle each time [`SYNC_WORK_KEY`] fires
pub struct SyncTaskHandler {
    orchestrator: Arc<SyncOrchestrator>,
}

impl SyncTaskHandler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for SyncTaskHandler {
    fn task_type(&self) -> &str {
        SYNC_TASK_TYPE
    }

    async fn run(&self, scheduler: &DelayedScheduler, _task: FiredTask) -> Result<()> {
        match self.orchestrator.run_cycle(scheduler).await.outcome {
            CycleOutcome::Success => Ok(()),
            CycleOutcome::Failed(reason) => Err(ScheduleError::Handler(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ca_core::alert::alert_key;
    use ca_core::{
        AlertKind, ManualClock, RemoteSession, ScheduleStore, SourceError, SourceResult,
        SqliteSettings, SystemClock,
    };
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct FakeLocal {
        result: Mutex<Option<SourceResult<Vec<Event>>>>,
        seen_calendars: Mutex<Option<BTreeSet<String>>>,
    }

    impl FakeLocal {
        fn returning(result: SourceResult<Vec<Event>>) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(result)),
                seen_calendars: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl LocalEventSource for FakeLocal {
        async fn fetch_local_events(
            &self,
            calendar_ids: &BTreeSet<String>,
            _window: &TimeWindow,
        ) -> SourceResult<Vec<Event>> {
            *self.seen_calendars.lock().unwrap() = Some(calendar_ids.clone());
            self.result.lock().unwrap().take().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct FakeRemote {
        signed_in: bool,
        fail: bool,
        events: Vec<Event>,
    }

    #[async_trait]
    impl RemoteEventSource for FakeRemote {
        fn session(&self) -> Option<RemoteSession> {
            self.signed_in.then(|| RemoteSession::new("user@example.com"))
        }

        async fn fetch_remote_events(
            &self,
            _session: &RemoteSession,
            _window: &TimeWindow,
        ) -> SourceResult<Vec<Event>> {
            if self.fail {
                Err(SourceError::NetworkError("connection reset".to_string()))
            } else {
                Ok(self.events.clone())
            }
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn event(id: &str, starts_in_minutes: i64) -> Event {
        let start = now() + ChronoDuration::minutes(starts_in_minutes);
        Event::new(id, id, start, start + ChronoDuration::minutes(30), "work")
    }

    fn setup() -> (DelayedScheduler, Arc<SqliteSettings>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now()));
        let scheduler = DelayedScheduler::new(ScheduleStore::in_memory().unwrap(), clock.clone());
        let settings = Arc::new(SqliteSettings::in_memory().unwrap());
        (scheduler, settings, clock)
    }

    /// Scheduler over a file-backed store that refuses writes for `key`
    fn rejecting_writes_for(
        dir: &tempfile::TempDir,
        key: &str,
    ) -> (DelayedScheduler, Arc<SqliteSettings>, Arc<ManualClock>) {
        let db_path = dir.path().join("schedule.db").to_string_lossy().into_owned();
        let store = ScheduleStore::new(&db_path).unwrap();

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch(&format!(
            "CREATE TRIGGER reject_key BEFORE INSERT ON scheduled_tasks WHEN NEW.key = '{}'
             BEGIN SELECT RAISE(ABORT, 'database is busy'); END;",
            key
        ))
        .unwrap();

        let clock = Arc::new(ManualClock::new(now()));
        let scheduler =
            DelayedScheduler::with_max_sleep(store, clock.clone(), Duration::from_millis(10));
        let settings = Arc::new(SqliteSettings::in_memory().unwrap());
        (scheduler, settings, clock)
    }

    fn alert_keys(scheduler: &DelayedScheduler) -> Vec<String> {
        scheduler
            .pending()
            .unwrap()
            .into_iter()
            .filter(|e| e.task_type == ca_core::ALERT_TASK_TYPE)
            .map(|e| e.key)
            .collect()
    }

    #[tokio::test]
    async fn test_successful_cycle_schedules_alerts_and_next_sync() {
        let (scheduler, settings, clock) = setup();
        let local = FakeLocal::returning(Ok(vec![event("e1", 60), event("e2", 5)]));
        let orchestrator = SyncOrchestrator::new(local, settings.clone(), clock);

        let report = orchestrator.run_cycle(&scheduler).await;

        assert_eq!(report.outcome, CycleOutcome::Success);
        assert_eq!(report.events_fetched, 2);
        // e1: both alerts, e2: at-start only
        assert_eq!(report.alerts_scheduled, 3);
        assert_eq!(report.next_sync_at, Some(now() + ChronoDuration::minutes(60)));

        let sync = scheduler.get(SYNC_WORK_KEY).unwrap().unwrap();
        assert_eq!(sync.task_type, SYNC_TASK_TYPE);
        assert_eq!(sync.fire_at, now() + ChronoDuration::minutes(60));

        let entry = scheduler
            .get(&alert_key("e1", AlertKind::TenMinuteBefore))
            .unwrap()
            .unwrap();
        assert_eq!(entry.fire_at, now() + ChronoDuration::minutes(50));

        let state = SyncState::load(settings.as_ref()).unwrap();
        assert_eq!(state.last_sync_at, Some(now()));
        assert_eq!(orchestrator.phase(), CyclePhase::Idle);
        assert_eq!(orchestrator.last_report(), Some(report));
    }

    #[tokio::test]
    async fn test_remote_network_error_keeps_local_events() {
        let (scheduler, settings, clock) = setup();
        let local = FakeLocal::returning(Ok(vec![event("a", 5), event("b", 6), event("c", 7)]));
        let remote = Arc::new(FakeRemote {
            signed_in: true,
            fail: true,
            events: vec![event("r", 60)],
        });
        let orchestrator = SyncOrchestrator::new(local, settings, clock).with_remote(remote);

        let report = orchestrator.run_cycle(&scheduler).await;

        assert!(report.outcome.is_success());
        assert_eq!(report.events_fetched, 3);
        assert!(report.remote_error.is_some());

        let mut keys = alert_keys(&scheduler);
        keys.sort();
        let mut expected: Vec<String> = ["a", "b", "c"]
            .iter()
            .map(|id| alert_key(id, AlertKind::AtStart))
            .collect();
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_remote_events_are_merged() {
        let (scheduler, settings, clock) = setup();
        let local = FakeLocal::returning(Ok(vec![event("local", 30)]));
        let remote = Arc::new(FakeRemote {
            signed_in: true,
            fail: false,
            events: vec![event("remote", 30)],
        });
        let orchestrator = SyncOrchestrator::new(local, settings, clock).with_remote(remote);

        let report = orchestrator.run_cycle(&scheduler).await;

        assert_eq!(report.events_fetched, 2);
        assert_eq!(report.remote_events, 1);
        assert_eq!(report.alerts_scheduled, 4);
    }

    #[tokio::test]
    async fn test_remote_skipped_without_session() {
        let (scheduler, settings, clock) = setup();
        let local = FakeLocal::returning(Ok(vec![]));
        let remote = Arc::new(FakeRemote {
            signed_in: false,
            fail: true,
            events: vec![],
        });
        let orchestrator = SyncOrchestrator::new(local, settings, clock).with_remote(remote);

        let report = orchestrator.run_cycle(&scheduler).await;

        assert!(report.outcome.is_success());
        assert!(report.remote_error.is_none());
    }

    #[tokio::test]
    async fn test_local_permission_denied_fails_cycle_but_schedules_next() {
        let (scheduler, settings, clock) = setup();

        // A previous cycle left one alert behind
        let first = SyncOrchestrator::new(
            FakeLocal::returning(Ok(vec![event("old", 120)])),
            settings.clone(),
            clock.clone(),
        );
        first.run_cycle(&scheduler).await;
        let before = alert_keys(&scheduler);
        let synced_at = SyncState::load(settings.as_ref()).unwrap().last_sync_at;

        clock.advance(ChronoDuration::minutes(60));
        let local = FakeLocal::returning(Err(SourceError::PermissionDenied(
            "calendar access revoked".to_string(),
        )));
        let orchestrator = SyncOrchestrator::new(local, settings.clone(), clock);

        let report = orchestrator.run_cycle(&scheduler).await;

        assert!(matches!(report.outcome, CycleOutcome::Failed(_)));
        assert_eq!(report.alerts_scheduled, 0);
        assert_eq!(alert_keys(&scheduler), before);
        assert_eq!(SyncState::load(settings.as_ref()).unwrap().last_sync_at, synced_at);
        assert_eq!(
            scheduler.get(SYNC_WORK_KEY).unwrap().unwrap().fire_at,
            now() + ChronoDuration::minutes(120)
        );
    }

    #[tokio::test]
    async fn test_failed_alert_write_does_not_stop_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let rejected = alert_key("e1", AlertKind::AtStart);
        let (scheduler, settings, clock) = rejecting_writes_for(&dir, &rejected);
        let local = FakeLocal::returning(Ok(vec![event("e1", 60), event("e2", 5)]));
        let orchestrator = SyncOrchestrator::new(local, settings, clock);

        let report = orchestrator.run_cycle(&scheduler).await;

        assert_eq!(report.outcome, CycleOutcome::Success);
        assert_eq!(report.store_failures, 1);
        assert_eq!(report.alerts_scheduled, 2);

        let mut keys = alert_keys(&scheduler);
        keys.sort();
        let mut expected = vec![
            alert_key("e1", AlertKind::TenMinuteBefore),
            alert_key("e2", AlertKind::AtStart),
        ];
        expected.sort();
        assert_eq!(keys, expected);
        assert!(!scheduler.is_armed(&rejected));
        assert!(scheduler.get(SYNC_WORK_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_loop_survives_failed_next_sync_write() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, settings, clock) = rejecting_writes_for(&dir, SYNC_WORK_KEY);
        let local = FakeLocal::returning(Ok(vec![]));
        let orchestrator = Arc::new(SyncOrchestrator::new(local, settings, clock.clone()));
        scheduler.register(Arc::new(SyncTaskHandler::new(orchestrator.clone())));

        let report = orchestrator.run_cycle(&scheduler).await;
        let next_at = now() + ChronoDuration::minutes(60);
        assert_eq!(report.next_sync_at, Some(next_at));
        assert!(scheduler.get(SYNC_WORK_KEY).unwrap().is_none());
        assert!(scheduler.is_armed(SYNC_WORK_KEY));

        // The in-memory timer runs the next cycle, which arms another one
        clock.set(next_at);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let second = orchestrator.last_report().unwrap();
        assert_eq!(second.started_at, next_at);
        assert_eq!(second.next_sync_at, Some(next_at + ChronoDuration::minutes(60)));
        assert!(scheduler.is_armed(SYNC_WORK_KEY));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_cycle_uses_persisted_frequency_and_calendars() {
        let (scheduler, settings, clock) = setup();
        SyncState::set_frequency(settings.as_ref(), SyncFrequency::Minutes15).unwrap();
        let calendars: BTreeSet<String> = ["home".to_string()].into_iter().collect();
        SyncState::set_selected_calendars(settings.as_ref(), &calendars).unwrap();

        let local = FakeLocal::returning(Ok(vec![]));
        let orchestrator = SyncOrchestrator::new(local.clone(), settings, clock);
        let report = orchestrator.run_cycle(&scheduler).await;

        assert_eq!(report.next_sync_at, Some(now() + ChronoDuration::minutes(15)));
        assert_eq!(*local.seen_calendars.lock().unwrap(), Some(calendars));
    }

    #[tokio::test]
    async fn test_rerun_replaces_instead_of_duplicating() {
        let (scheduler, settings, clock) = setup();
        let events = vec![event("e1", 60)];
        let first = SyncOrchestrator::new(FakeLocal::returning(Ok(events.clone())), settings.clone(), clock.clone());
        first.run_cycle(&scheduler).await;
        let second = SyncOrchestrator::new(FakeLocal::returning(Ok(events)), settings, clock);
        second.run_cycle(&scheduler).await;

        // Two alerts and one sync task
        assert_eq!(scheduler.pending().unwrap().len(), 3);
        assert_eq!(scheduler.armed_count(), 3);
    }

    #[tokio::test]
    async fn test_immediate_sync_runs_through_scheduler() {
        let clock = Arc::new(SystemClock);
        let scheduler = DelayedScheduler::new(ScheduleStore::in_memory().unwrap(), clock.clone());
        let settings = Arc::new(SqliteSettings::in_memory().unwrap());
        let soon = Utc::now() + ChronoDuration::hours(2);
        let local = FakeLocal::returning(Ok(vec![Event::new("e1", "Review", soon, soon, "work")]));
        let orchestrator = Arc::new(SyncOrchestrator::new(local, settings, clock));
        scheduler.register(Arc::new(SyncTaskHandler::new(orchestrator.clone())));

        orchestrator.request_immediate_sync(&scheduler).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = orchestrator.last_report().unwrap();
        assert!(report.outcome.is_success());
        assert_eq!(report.alerts_scheduled, 2);

        // The cycle re-armed its own key for the next run
        let next = scheduler.get(SYNC_WORK_KEY).unwrap().unwrap();
        assert_eq!(Some(next.fire_at), report.next_sync_at);
        assert!(scheduler.is_armed(SYNC_WORK_KEY));
    }
}
