//! Component wiring
//!
//! Builds the stores, event sources, scheduler and handlers from a
//! [`Config`]. Every run mode starts from a [`Gateway`].

use ca_calendar::{CalDavConfig, CalDavSource, IcsDirectorySource};
use ca_core::{
    Config, NotificationRenderer, ScheduleStore, SettingsStore, SqliteSettings, SyncConfig,
    SyncState, SystemClock,
};
use ca_schedule::{AlertDispatcher, DelayedScheduler, RestoreReport, SyncOrchestrator, SyncTaskHandler};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// All long-lived components of one process
pub struct Gateway {
    pub scheduler: DelayedScheduler,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub settings: Arc<SqliteSettings>,
    pub local: Arc<IcsDirectorySource>,
    pub remote: Option<Arc<CalDavSource>>,
}

impl Gateway {
    /// Open the database and wire everything together
    ///
    /// Nothing is scheduled yet; call [`start`](Self::start) to restore
    /// persisted tasks.
    pub fn build(config: &Config, renderer: Arc<dyn NotificationRenderer>) -> anyhow::Result<Self> {
        let db_path = &config.store.db_path;
        ensure_parent_dir(db_path)?;

        let store = ScheduleStore::new(db_path)
            .map_err(|e| anyhow::anyhow!("Failed to open schedule store: {}", e))?;
        let settings = Arc::new(
            SqliteSettings::new(db_path)
                .map_err(|e| anyhow::anyhow!("Failed to open settings store: {}", e))?,
        );
        seed_sync_state(settings.as_ref(), &config.sync)?;

        let clock = Arc::new(SystemClock);
        let local = Arc::new(IcsDirectorySource::new(&config.local.ics_dir));
        info!("Local calendars: {}", config.local.ics_dir);

        let remote = match CalDavConfig::from_remote(&config.remote) {
            Some(caldav) => Some(Arc::new(
                CalDavSource::new(caldav)
                    .map_err(|e| anyhow::anyhow!("Failed to create CalDAV source: {}", e))?,
            )),
            None => {
                info!("Remote calendar disabled (no CalDAV account configured)");
                None
            }
        };

        let mut orchestrator = SyncOrchestrator::new(local.clone(), settings.clone(), clock.clone());
        if let Some(remote) = &remote {
            orchestrator = orchestrator.with_remote(remote.clone());
        }
        let orchestrator = Arc::new(orchestrator);

        let scheduler = DelayedScheduler::new(store, clock);
        scheduler.register(Arc::new(SyncTaskHandler::new(orchestrator.clone())));
        scheduler.register(Arc::new(AlertDispatcher::new(renderer)));

        Ok(Self {
            scheduler,
            orchestrator,
            settings,
            local,
            remote,
        })
    }

    /// Restore persisted tasks
    pub fn start(&self) -> anyhow::Result<RestoreReport> {
        Ok(self.scheduler.restore()?)
    }

    /// Replace the pending sync with one that runs now
    pub fn request_sync(&self) -> anyhow::Result<()> {
        Ok(self.orchestrator.request_immediate_sync(&self.scheduler)?)
    }

    pub fn sync_state(&self) -> anyhow::Result<SyncState> {
        Ok(SyncState::load(self.settings.as_ref())?)
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

fn ensure_parent_dir(db_path: &str) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }
    }
    Ok(())
}

/// Write explicitly configured sync settings over the persisted ones
fn seed_sync_state(settings: &dyn SettingsStore, sync: &SyncConfig) -> ca_core::Result<()> {
    if let Some(frequency) = sync.frequency {
        info!("Sync frequency from config: {}", frequency);
        SyncState::set_frequency(settings, frequency)?;
    }
    if let Some(calendars) = &sync.calendars {
        let ids: BTreeSet<String> = calendars.iter().cloned().collect();
        info!("Calendars from config: {:?}", ids);
        SyncState::set_selected_calendars(settings, &ids)?;
    }
    Ok(())
}
