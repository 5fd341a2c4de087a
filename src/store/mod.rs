// Persistence boundaries: the schedule table and the fetched-result sink.

pub mod json;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::cache::CacheEntry;
use crate::engine::scheduler::ScheduleEntry;

pub use json::{JsonDirSink, JsonScheduleStore};

/// Durable home of the schedule table, reloaded on restart.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ScheduleEntry>>;
    async fn save(&self, entries: &[ScheduleEntry]) -> Result<()>;
}

/// Receives every freshly fetched payload. Writes must be idempotent
/// upserts; the same entity may be delivered more than once.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, entity_id: &str, entry: &CacheEntry) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryScheduleStore {
    entries: Mutex<Vec<ScheduleEntry>>,
    saves: Mutex<u64>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<ScheduleEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            saves: Mutex::new(0),
        }
    }

    pub fn saved(&self) -> Vec<ScheduleEntry> {
        self.entries.lock().clone()
    }

    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn load(&self) -> Result<Vec<ScheduleEntry>> {
        Ok(self.entries.lock().clone())
    }

    async fn save(&self, entries: &[ScheduleEntry]) -> Result<()> {
        *self.entries.lock() = entries.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}
