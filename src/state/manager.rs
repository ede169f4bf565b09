//! StateManager - crash-safe persistence of task-state records.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::lock::{lock_path, StateLockGuard};
use crate::config::StateConfig;
use crate::core::task::{TaskId, TaskState};
use crate::error::{Error, Result};
use crate::protocols::StateManagement;

/// Timestamp format of backup file suffixes.
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Durable state of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: TaskState,
    pub updated: DateTime<Utc>,
}

/// On-disk document.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    updated: DateTime<Utc>,
    states: BTreeMap<TaskId, StateRecord>,
}

struct StateInner {
    records: HashMap<TaskId, StateRecord>,
    /// Ids changed in memory since the last successful save.
    dirty: HashSet<TaskId>,
    cache: LruCache<TaskId, StateRecord>,
    last_save: Option<DateTime<Utc>>,
}

/// Owns the task-state map and its state file.
///
/// `update` is write-back: records are flushed when `save_interval` has
/// passed since the last save, or explicitly through `save`. Reads go
/// through a small LRU cache that is dropped on every mutation.
pub struct StateManager {
    config: StateConfig,
    lock_path: PathBuf,
    inner: Mutex<StateInner>,
}

impl StateManager {
    /// Create a manager for `config.file_path`. Nothing is read until
    /// `load` is called.
    ///
    /// # Errors
    /// Returns `Validation` if `cache_size` is zero.
    pub fn new(config: &StateConfig) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.cache_size)
            .ok_or_else(|| Error::Validation("state.cache_size must be >= 1".to_string()))?;
        Ok(Self {
            config: config.clone(),
            lock_path: lock_path(&config.file_path),
            inner: Mutex::new(StateInner {
                records: HashMap::new(),
                dirty: HashSet::new(),
                cache: LruCache::new(capacity),
                last_save: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.config.file_path
    }

    /// Path of the sibling lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Take the file lock without waiting.
    pub fn try_lock(&self) -> Result<StateLockGuard> {
        StateLockGuard::try_acquire(&self.lock_path)
    }

    /// Take the file lock, retrying until `timeout`.
    pub fn acquire_lock(&self, timeout: Duration) -> Result<StateLockGuard> {
        StateLockGuard::acquire(&self.lock_path, timeout)
    }

    /// Ids with unsaved changes.
    pub fn dirty_ids(&self) -> Vec<TaskId> {
        self.lock().dirty.iter().copied().collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.lock().dirty.is_empty()
    }

    /// When the state file was last written by this manager.
    pub fn last_save(&self) -> Option<DateTime<Utc>> {
        self.lock().last_save
    }

    fn backup_path(&self, at: DateTime<Utc>) -> PathBuf {
        let mut name = self.config.file_path.clone().into_os_string();
        name.push(format!(".bak.{}", at.format(BACKUP_TIMESTAMP_FORMAT)));
        PathBuf::from(name)
    }

    /// Existing backup files with the time encoded in their name.
    pub fn backups(&self) -> Vec<(PathBuf, DateTime<Utc>)> {
        let path = &self.config.file_path;
        let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Vec::new();
        };
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        let prefix = format!("{}.bak.", file_name.to_string_lossy());
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let stamp = name.strip_prefix(&prefix)?;
                let at = NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT).ok()?;
                Some((entry.path(), at.and_utc()))
            })
            .collect()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.config.file_path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Write the current map while `inner` is held.
    fn save_locked(&self, inner: &mut StateInner) -> Result<()> {
        if inner.dirty.is_empty() {
            return Ok(());
        }

        let _guard = self.acquire_lock(self.config.lock_timeout())?;
        let path = &self.config.file_path;
        let now = Utc::now();

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    Error::StateSave(format!("cannot create {}: {}", dir.display(), e))
                })?;
            }
        }

        if self.config.backups && path.exists() {
            let backup = self.backup_path(now);
            if let Err(e) = fs::copy(path, &backup) {
                warn!(backup = %backup.display(), error = %e, "failed to back up state file");
            }
        }

        let document = StateFile {
            version: self.config.version,
            updated: now,
            states: inner.records.iter().map(|(id, r)| (*id, *r)).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| Error::StateSave(format!("cannot serialize state: {}", e)))?;

        let temp = self.temp_path();
        fs::write(&temp, bytes)
            .map_err(|e| Error::StateSave(format!("cannot write {}: {}", temp.display(), e)))?;
        if let Err(e) = fs::rename(&temp, path) {
            let _ = fs::remove_file(&temp);
            return Err(Error::StateSave(format!(
                "cannot replace {}: {}",
                path.display(),
                e
            )));
        }

        debug!(
            path = %path.display(),
            records = inner.records.len(),
            dirty = inner.dirty.len(),
            "state saved"
        );
        inner.dirty.clear();
        inner.last_save = Some(now);
        Ok(())
    }

    fn save_due(&self, inner: &StateInner, now: DateTime<Utc>) -> bool {
        match inner.last_save {
            None => true,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.config.save_interval()
            }
        }
    }
}

impl StateManagement for StateManager {
    fn load(&self) -> Result<()> {
        let path = &self.config.file_path;
        if !path.exists() {
            debug!(path = %path.display(), "no state file, nothing to load");
            return Ok(());
        }

        let document = {
            let _guard = self.acquire_lock(self.config.lock_timeout())?;
            let raw = fs::read_to_string(path)
                .map_err(|e| Error::StateLoad(format!("cannot read {}: {}", path.display(), e)))?;
            serde_json::from_str::<StateFile>(&raw).map_err(|e| {
                Error::StateLoad(format!("malformed state file {}: {}", path.display(), e))
            })?
        };

        if document.version != self.config.version {
            return Err(Error::StateLoad(format!(
                "unsupported state file version {} (expected {})",
                document.version, self.config.version
            )));
        }

        let mut inner = self.lock();
        inner.records = document.states.into_iter().collect();
        inner.dirty.clear();
        inner.cache.clear();
        info!(
            path = %path.display(),
            records = inner.records.len(),
            "state loaded"
        );
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let mut inner = self.lock();
        self.save_locked(&mut inner)
    }

    fn update(&self, task_id: TaskId, state: TaskState) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.lock();
        inner.records.insert(task_id, StateRecord { state, updated: now });
        inner.dirty.insert(task_id);
        inner.cache.clear();
        if self.save_due(&inner, now) {
            self.save_locked(&mut inner)?;
        }
        Ok(())
    }

    fn get(&self, task_id: &TaskId) -> Result<StateRecord> {
        let mut inner = self.lock();
        if let Some(record) = inner.cache.get(task_id) {
            return Ok(*record);
        }
        let record = *inner
            .records
            .get(task_id)
            .ok_or(Error::StateNotFound(*task_id))?;
        inner.cache.put(*task_id, record);
        Ok(record)
    }

    fn cleanup(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = {
            let mut inner = self.lock();
            let expired: Vec<TaskId> = inner
                .records
                .iter()
                .filter(|(_, record)| record.updated < before)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                inner.records.remove(id);
                inner.dirty.insert(*id);
            }
            inner.cache.clear();
            self.save_locked(&mut inner)?;
            expired.len()
        };

        for (backup, at) in self.backups() {
            if at < before {
                if let Err(e) = fs::remove_file(&backup) {
                    warn!(backup = %backup.display(), error = %e, "failed to remove old backup");
                }
            }
        }

        debug!(removed, cutoff = %before, "state cleanup");
        Ok(removed)
    }

    fn records(&self) -> HashMap<TaskId, StateRecord> {
        self.lock().records.clone()
    }
}
