// Randomized per-entity scheduling: decides when each tracked entity is fetched next.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::orchestrator::{CycleReport, FetchOrchestrator};
use super::randomizer::{Randomizer, Strategy};
use crate::config::SchedulerConfig;
use crate::store::ScheduleStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Due,
    Running,
}

/// One row of the persisted schedule table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub entity_id: String,
    pub base_interval_secs: u64,
    pub strategy: Strategy,
    pub next_due: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub last_outcome: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(skip)]
    running: bool,
}

impl ScheduleEntry {
    pub fn new(
        entity_id: impl Into<String>,
        base_interval: Duration,
        strategy: Strategy,
        next_due: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            base_interval_secs: base_interval.as_secs().max(1),
            strategy,
            next_due,
            last_run: None,
            run_count: 0,
            last_outcome: None,
            last_error: None,
            running: false,
        }
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }

    pub fn phase(&self, now: DateTime<Utc>) -> Phase {
        if self.running {
            Phase::Running
        } else if self.next_due <= now {
            Phase::Due
        } else {
            Phase::Pending
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    #[serde(flatten)]
    pub entry: ScheduleEntry,
    pub phase: Phase,
}

/// `now + d`, saturating at the far end of the calendar.
fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct Scheduler {
    orchestrator: Arc<FetchOrchestrator>,
    randomizer: Arc<Randomizer>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn ScheduleStore>,
    config: SchedulerConfig,
    cycle_deadline: Duration,
    entries: Mutex<BTreeMap<String, ScheduleEntry>>,
    /// Orders saves from overlapping batches; the snapshot is taken under it.
    persisting: tokio::sync::Mutex<()>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<FetchOrchestrator>,
        randomizer: Arc<Randomizer>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn ScheduleStore>,
        config: SchedulerConfig,
        cycle_deadline: Duration,
    ) -> Self {
        Self {
            orchestrator,
            randomizer,
            clock,
            store,
            config,
            cycle_deadline,
            entries: Mutex::new(BTreeMap::new()),
            persisting: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the persisted table, then track configured entities it lacks.
    pub async fn restore(&self) -> Result<usize> {
        let stored = self.store.load().await?;
        let restored = stored.len();
        {
            let mut entries = self.entries.lock();
            for mut entry in stored {
                entry.running = false;
                entries.insert(entry.entity_id.clone(), entry);
            }
        }
        for entity in self.config.entities.clone() {
            self.track(&entity, None, None);
        }
        info!(
            "schedule restored: {} persisted, {} tracked",
            restored,
            self.len()
        );
        Ok(restored)
    }

    /// Start tracking `entity`. Its first run is one randomized interval from now.
    /// Returns false when it was already tracked.
    pub fn track(&self, entity: &str, base: Option<Duration>, strategy: Option<Strategy>) -> bool {
        let base = base.unwrap_or_else(|| self.config.base_interval());
        let strategy = strategy.unwrap_or(self.config.strategy);
        let mut entries = self.entries.lock();
        if entries.contains_key(entity) {
            return false;
        }
        let next_due = after(self.clock.now(), self.randomizer.next_interval(base, strategy));
        debug!("tracking {} (next due {})", entity, next_due);
        entries.insert(
            entity.to_string(),
            ScheduleEntry::new(entity, base, strategy, next_due),
        );
        true
    }

    /// Stop tracking `entity` and drop whatever the cache holds for it.
    pub fn untrack(&self, entity: &str) -> bool {
        let removed = self.entries.lock().remove(entity).is_some();
        if removed {
            self.orchestrator.cache().invalidate(entity);
            debug!("untracked {}", entity);
        }
        removed
    }

    pub fn is_tracked(&self, entity: &str) -> bool {
        self.entries.lock().contains_key(entity)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<ScheduleStatus> {
        let now = self.clock.now();
        self.entries
            .lock()
            .values()
            .map(|entry| ScheduleStatus {
                phase: entry.phase(now),
                entry: entry.clone(),
            })
            .collect()
    }

    /// Mark every due, idle entity as running and return them.
    pub fn collect_due(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries
            .values_mut()
            .filter(|e| e.phase(now) == Phase::Due)
            .map(|e| {
                e.running = true;
                e.entity_id.clone()
            })
            .collect()
    }

    /// Collect due entities and run them as one batch.
    pub async fn run_cycle(&self) -> CycleReport {
        let due = self.collect_due();
        self.run_batch(due).await
    }

    async fn run_batch(&self, due: Vec<String>) -> CycleReport {
        let guard = RunningGuard {
            scheduler: self,
            entities: due.clone(),
        };
        let deadline = Instant::now() + self.cycle_deadline;
        let report = self
            .orchestrator
            .fetch_many(due, false, deadline)
            .await;
        self.complete(&report);
        drop(guard);
        if !report.outcomes.is_empty() {
            if let Err(e) = self.persist().await {
                warn!("persisting schedule failed: {}", e);
            }
        }
        report
    }

    /// Record outcomes and reschedule from the completion time.
    fn complete(&self, report: &CycleReport) {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        for (entity, outcome) in &report.outcomes {
            // Untracked while running.
            let Some(entry) = entries.get_mut(entity) else {
                continue;
            };
            entry.running = false;
            entry.last_run = Some(now);
            entry.run_count += 1;
            match outcome {
                Ok(status) => {
                    entry.last_outcome = Some(format!("{:?}", status).to_lowercase());
                    entry.last_error = None;
                }
                Err(e) => {
                    entry.last_outcome = Some(e.root().class().to_string());
                    entry.last_error = Some(e.to_string());
                }
            }
            let interval = self.randomizer.next_interval(entry.base_interval(), entry.strategy);
            entry.next_due = after(now, interval);
            debug!("{} next due {}", entity, entry.next_due);
        }
    }

    pub async fn persist(&self) -> Result<()> {
        let _saving = self.persisting.lock().await;
        let snapshot: Vec<ScheduleEntry> = self.entries.lock().values().cloned().collect();
        self.store.save(&snapshot).await
    }

    /// Tick until `shutdown`, spawning a batch for whatever is due. A slow
    /// batch never holds up later ticks; entities it owns stay Running.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = JoinSet::new();
        info!("scheduler running: {} entities tracked", self.len());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    while cycles.try_join_next().is_some() {}
                    self.orchestrator.cache().purge_expired();
                    let due = self.collect_due();
                    if due.is_empty() {
                        continue;
                    }
                    debug!("{} entities due", due.len());
                    let this = Arc::clone(&self);
                    cycles.spawn(async move {
                        this.run_batch(due).await;
                    });
                }
            }
        }

        info!("scheduler stopping, waiting for {} cycle(s)", cycles.len());
        while cycles.join_next().await.is_some() {}
        if let Err(e) = self.persist().await {
            warn!("persisting schedule on shutdown failed: {}", e);
        }
    }
}

/// Clears Running flags left behind by a batch that never completed.
struct RunningGuard<'a> {
    scheduler: &'a Scheduler,
    entities: Vec<String>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.scheduler.entries.lock();
        for entity in &self.entities {
            if let Some(entry) = entries.get_mut(entity) {
                entry.running = false;
            }
        }
    }
}
