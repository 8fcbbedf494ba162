use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::models::{GpuUsageEvent, TelemetryRecord};
use crate::persistence::{Histories, PersistenceAdapter};
use crate::retention;
use crate::settings::{GpuLogAging, ServerSettings};

struct StoreState {
    histories: Histories,
    gpu_log: VecDeque<GpuUsageEvent>,
    last_updated: DateTime<Utc>,
}

/// In-memory fleet status with bounded per-machine histories and a global GPU
/// usage log, snapshotted to disk every `write_interval`.
///
/// Every write runs as one critical section under the write lock; readers
/// get cloned snapshots and never see a half-applied report.
pub struct TelemetryStore {
    state: RwLock<StoreState>,
    persistence: PersistenceAdapter,
    max_records: usize,
    max_gpu_records: usize,
    history_window: Duration,
    write_interval: Duration,
    gpu_log_aging: GpuLogAging,
}

impl TelemetryStore {
    /// Build a store and reload any snapshot left on disk.
    pub fn open(settings: &ServerSettings) -> Self {
        Self::open_at(settings, Utc::now())
    }

    /// Like `open`, with `now` as the time of the last snapshot.
    ///
    /// Caps of zero are raised to one; `ServerSettings::check` rejects them
    /// for configs read from disk, but settings built in code skip it.
    pub fn open_at(settings: &ServerSettings, now: DateTime<Utc>) -> Self {
        if let Err(e) = settings.check() {
            log::warn!("Opening telemetry store with out-of-range settings: {e}");
        }
        let max_records = settings.max_records.max(1);
        let max_gpu_records = settings.max_gpu_records.max(1);

        let persistence = PersistenceAdapter::new(
            settings.status_file.clone(),
            settings.gpu_log_file.clone(),
            max_records,
        );

        let histories = persistence.load_status().unwrap_or_else(|e| {
            log::error!(
                "Could not load status snapshot {}: {e}; starting empty",
                settings.status_file.display()
            );
            Histories::new()
        });
        let mut gpu_log = persistence.load_gpu_log().unwrap_or_else(|e| {
            log::error!(
                "Could not load gpu log {}: {e}; starting empty",
                settings.gpu_log_file.display()
            );
            VecDeque::new()
        });
        let excess = retention::loaded_gpu_log_overflow(gpu_log.len(), max_gpu_records);
        if excess > 0 {
            log::info!("Dropping {excess} gpu usage events over the cap of {max_gpu_records}");
            gpu_log.drain(..excess);
        }

        log::info!(
            "Telemetry store ready: {} machines, {} gpu usage events",
            histories.len(),
            gpu_log.len()
        );

        Self {
            state: RwLock::new(StoreState {
                histories,
                gpu_log,
                last_updated: now,
            }),
            persistence,
            max_records,
            max_gpu_records,
            history_window: settings.history_window(),
            write_interval: settings.write_interval(),
            gpu_log_aging: settings.gpu_log_aging,
        }
    }

    /// Ingest a validated record.
    pub fn add(&self, record: TelemetryRecord) {
        self.add_at(record, Utc::now());
    }

    /// Ingest a validated record as of `now`.
    pub fn add_at(&self, record: TelemetryRecord, now: DateTime<Utc>) {
        let mut guard = self.write();
        let state = &mut *guard;

        state.gpu_log.extend(record.gpu_usage_events());

        let history = state.histories.entry(record.machine_id.clone()).or_default();
        history.push_back(record);
        let excess = retention::history_overflow(history.len(), self.max_records);
        history.drain(..excess);
        let oldest = history.front().map(|r| r.created_at);

        match self.gpu_log_aging {
            GpuLogAging::HistoryCoupled => {
                let expired = oldest
                    .is_some_and(|oldest| retention::gpu_log_expired(oldest, now, self.history_window));
                if expired {
                    state.gpu_log.pop_front();
                }
            }
            GpuLogAging::EventTimestamp => {
                while state
                    .gpu_log
                    .front()
                    .is_some_and(|e| retention::event_expired(e.time, now, self.history_window))
                {
                    state.gpu_log.pop_front();
                }
            }
        }

        let overflow = retention::gpu_log_overflow(state.gpu_log.len(), self.max_gpu_records);
        state.gpu_log.drain(..overflow);

        let due = state
            .last_updated
            .checked_add_signed(self.write_interval)
            .is_some_and(|due| now >= due);
        if due {
            state.last_updated = now;
            if let Err(e) = self.persistence.save(&state.histories, &state.gpu_log) {
                log::error!("Failed to persist telemetry snapshot: {e:#}");
            }
        }
    }

    /// Newest record of every machine, ordered by machine id descending.
    pub fn latest_per_machine(&self) -> Vec<TelemetryRecord> {
        self.read()
            .histories
            .iter()
            .rev()
            .filter_map(|(_, history)| history.back().cloned())
            .collect()
    }

    pub fn gpu_usage_log(&self) -> Vec<GpuUsageEvent> {
        self.read().gpu_log.iter().cloned().collect()
    }

    /// Full history of one machine, oldest first.
    pub fn history(&self, machine_id: &str) -> Option<Vec<TelemetryRecord>> {
        self.read()
            .histories
            .get(machine_id)
            .map(|history| history.iter().cloned().collect())
    }

    pub fn machine_count(&self) -> usize {
        self.read().histories.len()
    }

    pub fn gpu_log_len(&self) -> usize {
        self.read().gpu_log.len()
    }

    /// Write a snapshot now, regardless of `write_interval`.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.write();
        self.persistence.save(&state.histories, &state.gpu_log)?;
        state.last_updated = Utc::now();
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
