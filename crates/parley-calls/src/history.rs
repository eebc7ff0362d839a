//! Call history log.
//!
//! Stores one entry per call, newest first, bounded by
//! `history.max_entries`. The log is a plain store: the call session
//! decides what gets written and when.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_common::Result;
use parley_config::HistoryConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Answered,
    Declined,
    Missed,
    Failed,
}

/// One row of the call history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLogEntry {
    pub id: String,
    pub counterpart_name: String,
    pub direction: CallDirection,
    pub outcome: CallOutcome,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    pub is_video: bool,
}

impl CallLogEntry {
    pub fn new(
        counterpart_name: impl Into<String>,
        direction: CallDirection,
        outcome: CallOutcome,
        is_video: bool,
    ) -> Self {
        Self {
            id: parley_common::new_id(),
            counterpart_name: counterpart_name.into(),
            direction,
            outcome,
            started_at: Utc::now(),
            ended_at: None,
            duration_seconds: None,
            is_video,
        }
    }

    /// Mark the entry finished right away with a zero duration.
    pub fn closed(mut self) -> Self {
        self.ended_at = Some(self.started_at);
        self.duration_seconds = Some(0);
        self
    }

    fn apply(&mut self, update: &CallLogUpdate) {
        if let Some(outcome) = update.outcome {
            self.outcome = outcome;
        }
        if let Some(ended_at) = update.ended_at {
            self.ended_at = Some(ended_at);
        }
        if let Some(duration) = update.duration_seconds {
            self.duration_seconds = Some(duration);
        }
    }
}

/// Fields to overwrite on an existing entry. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallLogUpdate {
    pub outcome: Option<CallOutcome>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
}

impl CallLogUpdate {
    /// Finish an entry that started at `started_at`.
    pub fn finished(started_at: DateTime<Utc>, outcome: CallOutcome) -> Self {
        let ended_at = Utc::now();
        let millis = (ended_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            outcome: Some(outcome),
            ended_at: Some(ended_at),
            duration_seconds: Some((millis + 500) / 1000),
        }
    }
}

#[async_trait]
pub trait CallLogStore: Send + Sync {
    async fn append(&self, entry: CallLogEntry) -> Result<()>;

    /// Returns `false` when no entry has that id.
    async fn update(&self, id: &str, update: CallLogUpdate) -> Result<bool>;

    /// All entries, newest first.
    async fn list(&self) -> Result<Vec<CallLogEntry>>;

    async fn clear(&self) -> Result<()>;
}

/// Pick the store described by the config.
pub fn from_config(config: &HistoryConfig) -> Result<Arc<dyn CallLogStore>> {
    let max = config.max_entries as usize;
    match &config.path {
        Some(path) => Ok(Arc::new(JsonFileCallLog::open(path, max)?)),
        None => Ok(Arc::new(MemoryCallLog::new(max))),
    }
}

fn push_front(entries: &mut VecDeque<CallLogEntry>, entry: CallLogEntry, max: usize) {
    entries.push_front(entry);
    entries.truncate(max);
}

fn update_in(entries: &mut VecDeque<CallLogEntry>, id: &str, update: &CallLogUpdate) -> bool {
    match entries.iter_mut().find(|e| e.id == id) {
        Some(entry) => {
            entry.apply(update);
            true
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

pub struct MemoryCallLog {
    max_entries: usize,
    entries: RwLock<VecDeque<CallLogEntry>>,
}

impl MemoryCallLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: RwLock::new(VecDeque::new()),
        }
    }
}

impl Default for MemoryCallLog {
    fn default() -> Self {
        Self::new(HistoryConfig::default().max_entries as usize)
    }
}

#[async_trait]
impl CallLogStore for MemoryCallLog {
    async fn append(&self, entry: CallLogEntry) -> Result<()> {
        push_front(&mut *self.entries.write().await, entry, self.max_entries);
        Ok(())
    }

    async fn update(&self, id: &str, update: CallLogUpdate) -> Result<bool> {
        Ok(update_in(&mut *self.entries.write().await, id, &update))
    }

    async fn list(&self) -> Result<Vec<CallLogEntry>> {
        Ok(self.entries.read().await.iter().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

/// History persisted as a JSON array, rewritten on every change.
pub struct JsonFileCallLog {
    path: PathBuf,
    max_entries: usize,
    entries: RwLock<VecDeque<CallLogEntry>>,
}

impl JsonFileCallLog {
    /// Load `path`, or start empty if it does not exist yet.
    pub fn open(path: &Path, max_entries: usize) -> Result<Self> {
        let entries: VecDeque<CallLogEntry> = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), entries = entries.len(), "Call history loaded");
        Ok(Self {
            path: path.to_path_buf(),
            max_entries,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &VecDeque<CallLogEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, json).await?;
        debug!(path = %self.path.display(), entries = entries.len(), "Call history saved");
        Ok(())
    }
}

#[async_trait]
impl CallLogStore for JsonFileCallLog {
    async fn append(&self, entry: CallLogEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        push_front(&mut entries, entry, self.max_entries);
        self.persist(&entries).await
    }

    async fn update(&self, id: &str, update: CallLogUpdate) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if !update_in(&mut entries, id, &update) {
            return Ok(false);
        }
        self.persist(&entries).await?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<CallLogEntry>> {
        Ok(self.entries.read().await.iter().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.clear();
        self.persist(&entries).await
    }
}
