//! Schedule table persistence.
//!
//! The scheduler owns the table exclusively; the store handle is passed in
//! explicitly so tests and single-process deployments can use memory while
//! production persists to Postgres.

use crate::error::{Error, Result};
use crate::model::{ScheduleEntry, ScheduleFile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Every entry, enabled or not.
    async fn load(&self) -> Result<Vec<ScheduleEntry>>;

    /// Persist an entry's runtime state (`next_due`, `last_run`).
    async fn save(&self, entry: &ScheduleEntry) -> Result<()>;

    /// Insert an entry, or update the definition of an existing one while
    /// keeping its runtime state. Returns true if the entry was new.
    ///
    /// A flagged entry stays disabled unless its cadence changed.
    async fn register(&self, entry: ScheduleEntry) -> Result<bool>;

    /// Disable an entry and record why.
    async fn disable(&self, name: &str, reason: &str) -> Result<()>;
}

/// Load operator-written `[[schedule]]` tables from a TOML file.
pub fn load_schedule_file(path: &Path, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>> {
    let text = std::fs::read_to_string(path)?;
    parse_schedule(&text, now)
}

pub fn parse_schedule(text: &str, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>> {
    let file: ScheduleFile =
        toml::from_str(text).map_err(|e| Error::Config(format!("schedule file: {e}")))?;
    Ok(file
        .schedule
        .into_iter()
        .map(|def| def.into_entry(now))
        .collect())
}

fn merge_definition(existing: &mut ScheduleEntry, def: ScheduleEntry) {
    let cadence_changed = existing.cadence != def.cadence;
    if cadence_changed {
        existing.flagged = None;
    }
    existing.enabled = def.enabled && existing.flagged.is_none();
    existing.task_name = def.task_name;
    existing.cadence = def.cadence;
    existing.args = def.args;
    existing.kwargs = def.kwargs;
    existing.queue = def.queue;
    existing.max_retries = def.max_retries;
}

#[derive(Clone, Default)]
pub struct MemoryScheduleStore {
    entries: Arc<Mutex<BTreeMap<String, ScheduleEntry>>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<ScheduleEntry> {
        self.entries.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn load(&self) -> Result<Vec<ScheduleEntry>> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }

    async fn save(&self, entry: &ScheduleEntry) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(entry.name.clone(), entry.clone());
        Ok(())
    }

    async fn register(&self, entry: ScheduleEntry) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&entry.name) {
            Some(existing) => {
                merge_definition(existing, entry);
                Ok(false)
            }
            None => {
                entries.insert(entry.name.clone(), entry);
                Ok(true)
            }
        }
    }

    async fn disable(&self, name: &str, reason: &str) -> Result<()> {
        if let Some(entry) = self.entries.lock().await.get_mut(name) {
            entry.enabled = false;
            entry.flagged = Some(reason.to_string());
        }
        Ok(())
    }
}

/// Schedule table in Postgres (`schedule_entries`, see migrations).
#[derive(Clone)]
pub struct PgScheduleStore {
    pool: PgPool,
}

type EntryRow = (
    String,
    String,
    String,
    Value,
    Value,
    String,
    Option<i32>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    bool,
    Option<String>,
);

impl PgScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: EntryRow) -> ScheduleEntry {
        let (name, task_name, cadence, args, kwargs, queue, max_retries, next_due, last_run, enabled, flagged) =
            row;
        ScheduleEntry {
            name,
            task_name,
            cadence,
            args: match args {
                Value::Array(items) => items,
                _ => Vec::new(),
            },
            kwargs: match kwargs {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            queue,
            max_retries: max_retries.and_then(|n| u32::try_from(n).ok()),
            next_due,
            last_run,
            enabled,
            flagged,
        }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn load(&self) -> Result<Vec<ScheduleEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT name, task_name, cadence, args, kwargs, queue, max_retries, next_due, last_run, enabled, flagged
             FROM schedule_entries ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Self::from_row).collect())
    }

    async fn save(&self, entry: &ScheduleEntry) -> Result<()> {
        sqlx::query(
            "UPDATE schedule_entries SET next_due = $2, last_run = $3, updated_at = now()
             WHERE name = $1",
        )
        .bind(&entry.name)
        .bind(entry.next_due)
        .bind(entry.last_run)
        .execute(&self.pool)
        .await?;
        debug!(entry = %entry.name, next_due = %entry.next_due, "schedule entry saved");
        Ok(())
    }

    async fn register(&self, entry: ScheduleEntry) -> Result<bool> {
        let (inserted,): (bool,) = sqlx::query_as(
            "INSERT INTO schedule_entries
                (name, task_name, cadence, args, kwargs, queue, max_retries, next_due, last_run, enabled, flagged, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9, NULL, now())
             ON CONFLICT (name) DO UPDATE SET
                task_name = EXCLUDED.task_name,
                cadence = EXCLUDED.cadence,
                args = EXCLUDED.args,
                kwargs = EXCLUDED.kwargs,
                queue = EXCLUDED.queue,
                max_retries = EXCLUDED.max_retries,
                flagged = CASE WHEN schedule_entries.cadence = EXCLUDED.cadence
                               THEN schedule_entries.flagged ELSE NULL END,
                enabled = EXCLUDED.enabled AND (schedule_entries.cadence <> EXCLUDED.cadence
                                                OR schedule_entries.flagged IS NULL),
                updated_at = now()
             RETURNING (xmax = 0)",
        )
        .bind(&entry.name)
        .bind(&entry.task_name)
        .bind(&entry.cadence)
        .bind(Value::Array(entry.args))
        .bind(Value::Object(entry.kwargs))
        .bind(&entry.queue)
        .bind(entry.max_retries.map(|n| n as i32))
        .bind(entry.next_due)
        .bind(entry.enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(inserted)
    }

    async fn disable(&self, name: &str, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE schedule_entries SET enabled = false, flagged = $2, updated_at = now()
             WHERE name = $1",
        )
        .bind(name)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
