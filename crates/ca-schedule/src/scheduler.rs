//! 遅延タスクスケジューラー
//!
//! Every task is persisted in the [`ScheduleStore`] before its timer is armed,
//! so pending tasks survive a process restart. Inserting a task under an
//! existing key replaces both the stored entry and the armed timer.
//!
//! Timers sleep in bounded slices and compare against the wall clock after
//! each slice: a host suspend or clock jump delays a task by at most one
//! slice, and a task that is already overdue when noticed fires immediately.
//!
//! A firing timer must claim its entry from the store with the token it was
//! armed with. An entry that has been replaced in the meantime carries a new
//! token, so the stale timer cannot deliver it.

use ca_core::{Clock, ScheduleStore, ScheduledEntry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::handler::{FiredTask, HandlerRegistry, TaskHandler};
use crate::{Result, ScheduleError};

/// Longest single sleep before the wall clock is checked again
pub const MAX_SLEEP_SLICE: Duration = Duration::from_secs(60);

/// Whether a firing timer must claim its entry from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persistence {
    Durable,
    /// Not in the store; lost when the process stops
    InMemory,
}

/// An armed timer for one key
struct Timer {
    token: String,
    handle: JoinHandle<()>,
}

/// Outcome of restoring persisted tasks at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Keys re-armed
    pub restored: Vec<String>,
    /// Keys whose fire time passed while the process was down
    pub discarded: Vec<String>,
}

struct Inner {
    store: Mutex<ScheduleStore>,
    timers: DashMap<String, Timer>,
    handlers: HandlerRegistry,
    clock: Arc<dyn Clock>,
    max_slice: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl Inner {
    fn with_store<T>(&self, f: impl FnOnce(&ScheduleStore) -> ca_core::Result<T>) -> Result<T> {
        let store = self.store.lock().map_err(|_| ca_core::Error::LockPoisoned)?;
        Ok(f(&store)?)
    }
}

/// Durable, restart-safe delayed task scheduler
///
/// Cloning is cheap; all clones share the same timers and store.
#[derive(Clone)]
pub struct DelayedScheduler {
    inner: Arc<Inner>,
}

impl DelayedScheduler {
    /// Create a scheduler over `store`
    ///
    /// Nothing is armed until [`restore`](Self::restore) or
    /// [`schedule`](Self::schedule) is called.
    pub fn new(store: ScheduleStore, clock: Arc<dyn Clock>) -> Self {
        Self::with_max_sleep(store, clock, MAX_SLEEP_SLICE)
    }

    /// Create a scheduler with a custom wall-clock polling slice
    pub fn with_max_sleep(store: ScheduleStore, clock: Arc<dyn Clock>, max_slice: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(store),
                timers: DashMap::new(),
                handlers: HandlerRegistry::new(),
                clock,
                max_slice,
                shutdown_tx,
            }),
        }
    }

    /// Register the handler for a task type
    pub fn register(&self, handler: Arc<dyn TaskHandler>) {
        info!(task_type = %handler.task_type(), "Registered task handler");
        self.inner.handlers.register(handler);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Re-arm persisted tasks after a restart
    ///
    /// Tasks whose fire time has already passed are deleted without firing.
    pub fn restore(&self) -> Result<RestoreReport> {
        let now = self.now();
        let (discarded, pending) = self
            .inner
            .with_store(|store| Ok((store.discard_due(now)?, store.list()?)))?;

        for key in &discarded {
            info!(key = %key, "Discarding task that came due while stopped");
        }

        let mut restored = Vec::with_capacity(pending.len());
        for entry in pending {
            if let Entry::Vacant(vacant) = self.inner.timers.entry(entry.key.clone()) {
                let key = entry.key.clone();
                vacant.insert(arm(&self.inner, entry, Persistence::Durable));
                restored.push(key);
            }
        }

        info!(
            restored = restored.len(),
            discarded = discarded.len(),
            "Restored scheduled tasks"
        );
        Ok(RestoreReport { restored, discarded })
    }

    /// Schedule `task_type` to run with `payload` at `fire_at`
    ///
    /// Any task already scheduled under `key` is replaced: its stored entry
    /// is overwritten and its timer canceled. If the store write fails the
    /// previous task stays in place and the error is returned.
    pub fn schedule(
        &self,
        key: &str,
        fire_at: DateTime<Utc>,
        task_type: &str,
        payload: JsonValue,
    ) -> Result<()> {
        let entry = ScheduledEntry::new(key, task_type, fire_at, payload);

        // The map entry stays locked until the new timer is in place, so
        // store write and timer swap for one key cannot interleave.
        match self.inner.timers.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                self.inner.with_store(|store| store.upsert(&entry))?;
                let previous = occupied.insert(arm(&self.inner, entry, Persistence::Durable));
                previous.handle.abort();
                debug!(key = %key, fire_at = %fire_at, "Replaced scheduled task");
            }
            Entry::Vacant(vacant) => {
                self.inner.with_store(|store| store.upsert(&entry))?;
                vacant.insert(arm(&self.inner, entry, Persistence::Durable));
                debug!(key = %key, fire_at = %fire_at, "Scheduled task");
            }
        }

        Ok(())
    }

    /// Arm a timer for `key` without writing it to the store
    ///
    /// Fallback for when [`schedule`](Self::schedule) fails: the task still
    /// fires in this process but does not survive a restart. Replaces any
    /// timer armed under `key`.
    pub fn schedule_in_memory(
        &self,
        key: &str,
        fire_at: DateTime<Utc>,
        task_type: &str,
        payload: JsonValue,
    ) {
        let entry = ScheduledEntry::new(key, task_type, fire_at, payload);

        match self.inner.timers.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(arm(&self.inner, entry, Persistence::InMemory));
                previous.handle.abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(arm(&self.inner, entry, Persistence::InMemory));
            }
        }
        warn!(key = %key, fire_at = %fire_at, "Task armed in memory only");
    }

    /// Cancel the task under `key`, returning whether one was pending
    ///
    /// Does not wait for a timer that is already firing.
    pub fn cancel(&self, key: &str) -> Result<bool> {
        let removed = match self.inner.timers.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                self.inner.with_store(|store| store.remove(key))?;
                occupied.remove().handle.abort();
                true
            }
            Entry::Vacant(_) => self.inner.with_store(|store| store.remove(key))?,
        };

        if removed {
            debug!(key = %key, "Canceled scheduled task");
        }
        Ok(removed)
    }

    /// The persisted entry for `key`
    pub fn get(&self, key: &str) -> Result<Option<ScheduledEntry>> {
        self.inner.with_store(|store| store.get(key))
    }

    /// All pending entries ordered by fire time
    pub fn pending(&self) -> Result<Vec<ScheduledEntry>> {
        self.inner.with_store(|store| store.list())
    }

    /// Whether a timer is currently armed for `key`
    pub fn is_armed(&self, key: &str) -> bool {
        self.inner.timers.contains_key(key)
    }

    /// Number of armed timers
    pub fn armed_count(&self) -> usize {
        self.inner.timers.len()
    }

    /// Stop all timers
    ///
    /// Stored entries are kept and will be restored by the next process.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
        self.inner.timers.retain(|_, timer| {
            timer.handle.abort();
            false
        });
        info!("Scheduler stopped");
    }
}

/// Spawn the timer task for `entry`
fn arm(inner: &Arc<Inner>, entry: ScheduledEntry, persistence: Persistence) -> Timer {
    let task_inner = Arc::clone(inner);
    let token = entry.token.clone();
    let shutdown_rx = inner.shutdown_tx.subscribe();

    let handle = tokio::spawn(async move {
        run_timer(task_inner, entry, persistence, shutdown_rx).await;
    });

    Timer { token, handle }
}

async fn run_timer(
    inner: Arc<Inner>,
    entry: ScheduledEntry,
    persistence: Persistence,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let key = entry.key.clone();
    loop {
        let now = inner.clock.now();
        if now >= entry.fire_at {
            break;
        }

        let remaining = (entry.fire_at - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(remaining.min(inner.max_slice)) => {}
            _ = shutdown_rx.recv() => {
                debug!(key = %key, "Timer stopped by shutdown");
                return;
            }
        }
    }

    // Leave the timer map before running anything, so a handler that
    // re-schedules its own key does not abort itself.
    let still_current = inner
        .timers
        .remove_if(&key, |_, timer| timer.token == entry.token)
        .is_some();

    let entry = match persistence {
        Persistence::InMemory if still_current => entry,
        Persistence::InMemory => {
            debug!(key = %key, "Task was replaced before firing");
            return;
        }
        Persistence::Durable => match inner.with_store(|store| store.claim(&key, &entry.token)) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(key = %key, "Task was replaced before firing");
                return;
            }
            Err(e) => {
                error!(key = %key, "Failed to claim task: {}", e);
                return;
            }
        },
    };

    fire(inner, entry).await;
}

async fn fire(inner: Arc<Inner>, entry: ScheduledEntry) {
    let Some(handler) = inner.handlers.get(&entry.task_type) else {
        let e = ScheduleError::HandlerNotFound(entry.task_type.clone());
        error!(key = %entry.key, "Dropping task: {}", e);
        return;
    };

    let fired_at = inner.clock.now();
    let late_by = (fired_at - entry.fire_at).num_seconds();
    if late_by > 60 {
        warn!(key = %entry.key, late_by_secs = late_by, "Task fired late");
    }

    let task = FiredTask {
        key: entry.key,
        task_type: entry.task_type,
        scheduled_for: entry.fire_at,
        fired_at,
        payload: entry.payload,
    };
    let key = task.key.clone();
    info!(key = %key, task_type = %task.task_type, "Running scheduled task");

    let scheduler = DelayedScheduler { inner };
    match handler.run(&scheduler, task).await {
        Ok(()) => debug!(key = %key, "Task completed"),
        // No retry: a failed task is dropped
        Err(e) => error!(key = %key, "Task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ca_core::{ManualClock, SystemClock};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Records every fired task
    #[derive(Default)]
    struct Recorder {
        fired: StdMutex<Vec<FiredTask>>,
    }

    impl Recorder {
        fn fired(&self) -> Vec<FiredTask> {
            self.fired.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        fn task_type(&self) -> &str {
            "record"
        }

        async fn run(&self, _scheduler: &DelayedScheduler, task: FiredTask) -> Result<()> {
            self.fired.lock().unwrap().push(task);
            Ok(())
        }
    }

    /// Re-schedules its own key once, like a periodic job
    struct Rescheduler {
        runs: StdMutex<u32>,
    }

    #[async_trait]
    impl TaskHandler for Rescheduler {
        fn task_type(&self) -> &str {
            "again"
        }

        async fn run(&self, scheduler: &DelayedScheduler, task: FiredTask) -> Result<()> {
            let runs = {
                let mut runs = self.runs.lock().unwrap();
                *runs += 1;
                *runs
            };
            if runs == 1 {
                scheduler.schedule(&task.key, scheduler.now(), "again", json!({}))?;
            }
            // Still running after scheduling our own key
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    }

    fn system_scheduler() -> (DelayedScheduler, Arc<Recorder>) {
        let scheduler =
            DelayedScheduler::new(ScheduleStore::in_memory().unwrap(), Arc::new(SystemClock));
        let recorder = Arc::new(Recorder::default());
        scheduler.register(recorder.clone());
        (scheduler, recorder)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_fires_due_task_and_removes_entry() {
        let (scheduler, recorder) = system_scheduler();
        let fire_at = Utc::now() + ChronoDuration::milliseconds(30);

        scheduler
            .schedule("k1", fire_at, "record", json!({"n": 1}))
            .unwrap();
        assert!(scheduler.is_armed("k1"));

        settle().await;

        let fired = recorder.fired();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].key, "k1");
        assert_eq!(fired[0].payload, json!({"n": 1}));
        assert!(fired[0].fired_at >= fired[0].scheduled_for);
        assert!(scheduler.get("k1").unwrap().is_none());
        assert!(!scheduler.is_armed("k1"));
    }

    #[tokio::test]
    async fn test_in_memory_task_fires_without_store_entry() {
        let (scheduler, recorder) = system_scheduler();

        scheduler.schedule_in_memory(
            "volatile",
            Utc::now() + ChronoDuration::milliseconds(30),
            "record",
            json!({"n": 2}),
        );
        assert!(scheduler.is_armed("volatile"));
        assert!(scheduler.get("volatile").unwrap().is_none());

        settle().await;

        let fired = recorder.fired();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].payload, json!({"n": 2}));
        assert!(!scheduler.is_armed("volatile"));
    }

    #[tokio::test]
    async fn test_durable_schedule_replaces_in_memory_task() {
        let (scheduler, recorder) = system_scheduler();
        let later = Utc::now() + ChronoDuration::hours(1);

        scheduler.schedule_in_memory(
            "k1",
            Utc::now() + ChronoDuration::milliseconds(30),
            "record",
            json!({}),
        );
        scheduler.schedule("k1", later, "record", json!({})).unwrap();

        settle().await;

        assert!(recorder.fired().is_empty());
        assert_eq!(scheduler.get("k1").unwrap().unwrap().fire_at, later);
        assert_eq!(scheduler.armed_count(), 1);
    }

    #[tokio::test]
    async fn test_overdue_task_fires_immediately() {
        let (scheduler, recorder) = system_scheduler();

        scheduler
            .schedule("late", Utc::now() - ChronoDuration::minutes(5), "record", json!({}))
            .unwrap();
        settle().await;

        assert_eq!(recorder.fired().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_keeps_one_entry_and_cancels_old_timer() {
        let (scheduler, recorder) = system_scheduler();
        let t1 = Utc::now() + ChronoDuration::milliseconds(30);
        let t2 = Utc::now() + ChronoDuration::hours(1);

        scheduler.schedule("k1", t1, "record", json!({"p": 1})).unwrap();
        scheduler.schedule("k1", t2, "record", json!({"p": 2})).unwrap();

        settle().await;

        assert!(recorder.fired().is_empty());
        let pending = scheduler.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].fire_at, t2);
        assert_eq!(pending[0].payload, json!({"p": 2}));
        assert_eq!(scheduler.armed_count(), 1);
    }

    #[tokio::test]
    async fn test_replace_with_earlier_time_fires_new_payload_once() {
        let (scheduler, recorder) = system_scheduler();

        scheduler
            .schedule("k1", Utc::now() + ChronoDuration::hours(1), "record", json!({"p": 1}))
            .unwrap();
        scheduler
            .schedule("k1", Utc::now() + ChronoDuration::milliseconds(20), "record", json!({"p": 2}))
            .unwrap();

        settle().await;

        let fired = recorder.fired();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].payload, json!({"p": 2}));
    }

    #[tokio::test]
    async fn test_cancel() {
        let (scheduler, recorder) = system_scheduler();

        scheduler
            .schedule("k1", Utc::now() + ChronoDuration::milliseconds(30), "record", json!({}))
            .unwrap();
        assert!(scheduler.cancel("k1").unwrap());
        assert!(!scheduler.cancel("k1").unwrap());

        settle().await;

        assert!(recorder.fired().is_empty());
        assert!(scheduler.get("k1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_timer_cannot_claim_replaced_entry() {
        let (scheduler, recorder) = system_scheduler();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        // Simulate an old timer that woke up after its entry was replaced
        let old = ScheduledEntry::new("k1", "record", Utc::now(), json!({"p": "old"}));
        scheduler.inner.with_store(|s| s.upsert(&old)).unwrap();
        scheduler
            .schedule("k1", Utc::now() + ChronoDuration::hours(1), "record", json!({"p": "new"}))
            .unwrap();

        let (_tx, rx) = broadcast::channel(1);
        run_timer(
            Arc::clone(&scheduler.inner),
            old.clone(),
            Persistence::Durable,
            rx,
        )
        .await;

        assert!(recorder.fired().is_empty());
        assert!(scheduler.is_armed("k1"));
        assert_eq!(scheduler.get("k1").unwrap().unwrap().payload, json!({"p": "new"}));
    }

    #[tokio::test]
    async fn test_handler_can_reschedule_own_key() {
        let scheduler =
            DelayedScheduler::new(ScheduleStore::in_memory().unwrap(), Arc::new(SystemClock));
        let handler = Arc::new(Rescheduler {
            runs: StdMutex::new(0),
        });
        scheduler.register(handler.clone());

        scheduler.schedule("job", Utc::now(), "again", json!({})).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(*handler.runs.lock().unwrap(), 2);
        assert!(scheduler.get("job").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_dropped() {
        let (scheduler, recorder) = system_scheduler();

        scheduler.schedule("k1", Utc::now(), "nobody", json!({})).unwrap();
        settle().await;

        assert!(recorder.fired().is_empty());
        assert!(scheduler.get("k1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wall_clock_jump_is_noticed() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let scheduler = DelayedScheduler::with_max_sleep(
            ScheduleStore::in_memory().unwrap(),
            clock.clone(),
            Duration::from_millis(10),
        );
        let recorder = Arc::new(Recorder::default());
        scheduler.register(recorder.clone());

        scheduler
            .schedule("k1", start + ChronoDuration::hours(1), "record", json!({}))
            .unwrap();
        settle().await;
        assert!(recorder.fired().is_empty());

        clock.advance(ChronoDuration::hours(2));
        settle().await;

        let fired = recorder.fired();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].fired_at, start + ChronoDuration::hours(2));
    }

    #[tokio::test]
    async fn test_restore_discards_overdue_and_rearms_future() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let path = path.to_str().unwrap();
        let now = Utc::now();

        {
            let store = ScheduleStore::new(path).unwrap();
            store
                .upsert(&ScheduledEntry::new("past", "record", now - ChronoDuration::minutes(1), json!({})))
                .unwrap();
            store
                .upsert(&ScheduledEntry::new(
                    "soon",
                    "record",
                    now + ChronoDuration::milliseconds(500),
                    json!({}),
                ))
                .unwrap();
            store
                .upsert(&ScheduledEntry::new("later", "record", now + ChronoDuration::hours(1), json!({})))
                .unwrap();
        }

        let scheduler = DelayedScheduler::new(ScheduleStore::new(path).unwrap(), Arc::new(SystemClock));
        let recorder = Arc::new(Recorder::default());
        scheduler.register(recorder.clone());

        let report = scheduler.restore().unwrap();
        assert_eq!(report.discarded, vec!["past".to_string()]);
        assert_eq!(report.restored, vec!["soon".to_string(), "later".to_string()]);

        tokio::time::sleep(Duration::from_millis(800)).await;

        let fired: Vec<_> = recorder.fired().into_iter().map(|t| t.key).collect();
        assert_eq!(fired, vec!["soon".to_string()]);
        assert!(scheduler.get("past").unwrap().is_none());
        assert!(scheduler.get("later").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_keeps_entries() {
        let (scheduler, recorder) = system_scheduler();

        scheduler
            .schedule("k1", Utc::now() + ChronoDuration::milliseconds(50), "record", json!({}))
            .unwrap();
        scheduler.shutdown();
        settle().await;

        assert!(recorder.fired().is_empty());
        assert_eq!(scheduler.armed_count(), 0);
        assert!(scheduler.get("k1").unwrap().is_some());
    }
}
