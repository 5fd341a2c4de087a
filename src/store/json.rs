use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::{fs, task};
use tracing::debug;

use super::{ResultSink, ScheduleStore};
use crate::engine::cache::CacheEntry;
use crate::engine::scheduler::ScheduleEntry;

/// Write `data` to a fresh temp file beside `path` and rename it into place.
/// Every call gets its own temp file, so concurrent writers never share one.
async fn write_atomic(path: &Path, data: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    task::spawn_blocking(move || write_atomic_blocking(&path, &data))
        .await
        .context("atomic write task failed")?
}

fn write_atomic_blocking(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(data)
        .with_context(|| format!("writing {}", tmp.path().display()))?;
    tmp.persist(path)
        .with_context(|| format!("renaming into place {}", path.display()))?;
    Ok(())
}

/// Schedule table persisted as a single JSON array.
pub struct JsonScheduleStore {
    path: PathBuf,
}

impl JsonScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ScheduleStore for JsonScheduleStore {
    async fn load(&self) -> Result<Vec<ScheduleEntry>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        serde_json::from_slice(&raw)
            .with_context(|| format!("parsing schedule table {}", self.path.display()))
    }

    async fn save(&self, entries: &[ScheduleEntry]) -> Result<()> {
        let data = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.path, data).await?;
        debug!("saved {} schedule entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

/// Writes each entity's latest payload to `<dir>/<entity>.json`.
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, entity_id: &str) -> Result<PathBuf> {
        let safe = entity_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if entity_id.is_empty() || !safe {
            return Err(anyhow!("entity id {:?} is not usable as a file name", entity_id));
        }
        Ok(self.dir.join(format!("{}.json", entity_id)))
    }
}

#[async_trait]
impl ResultSink for JsonDirSink {
    async fn store(&self, entity_id: &str, entry: &CacheEntry) -> Result<()> {
        let path = self.path_for(entity_id)?;
        let doc = json!({
            "entityId": entity_id,
            "fetchedAt": entry.fetched_at,
            "payload": entry.payload_json(),
        });
        write_atomic(&path, serde_json::to_vec_pretty(&doc)?).await
    }
}
