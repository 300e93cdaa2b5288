//! Append-only audit log.
//!
//! Records are appended as JSON lines to one file per UTC day:
//!
//! ```text
//! $XDG_DATA_HOME/tollgate/audit/
//! ├── 2024-01-01.jsonl
//! └── 2024-01-02.jsonl
//! ```
//!
//! Recording never fails from the caller's point of view. A record that
//! cannot be written is emitted on the `tollgate::audit` tracing target
//! instead.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use tollgate_common::AuditRecord;
use tracing::{error, warn};

use crate::error::{BrokerError, Result};

/// Target of the fallback channel for records that could not be persisted.
pub const FALLBACK_TARGET: &str = "tollgate::audit";

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persists one record. Failures are handled inside the sink.
    async fn record(&self, record: &AuditRecord);
}

/// Emits a record on the fallback tracing channel.
fn fallback(record: &AuditRecord, reason: &str) {
    match serde_json::to_string(record) {
        Ok(json) => error!(target: FALLBACK_TARGET, record = %json, reason, "Audit record not persisted"),
        Err(e) => error!(
            target: FALLBACK_TARGET,
            request_id = %record.request_id,
            reason,
            error = %e,
            "Audit record not persisted or serialized"
        ),
    }
}

/// Writes records to daily JSON-lines files.
#[derive(Clone)]
pub struct FileAuditLog {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    /// Serializes appends so concurrent records never interleave.
    /// `std::sync::Mutex` is correct here because appends run on the
    /// blocking thread pool via `spawn_blocking`.
    write_lock: Mutex<()>,
}

impl FileAuditLog {
    /// Opens (creating if needed) the audit directory with mode `0700`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or restricted.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                write_lock: Mutex::new(()),
            }),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Path of the file holding records of `day`.
    #[must_use]
    pub fn day_path(&self, day: NaiveDate) -> PathBuf {
        self.inner.dir.join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }

    /// Reads back every record written on `day`.
    ///
    /// Lines that fail to parse are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn read_day(&self, day: NaiveDate) -> Result<Vec<AuditRecord>> {
        let path = self.day_path(day);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    file = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping malformed audit line"
                ),
            }
        }
        Ok(records)
    }

    fn append(inner: &Inner, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let path = inner
            .dir
            .join(format!("{}.jsonl", record.timestamp.date_naive().format("%Y-%m-%d")));

        let _guard = inner
            .write_lock
            .lock()
            .map_err(|e| BrokerError::Internal(format!("Audit lock poisoned: {e}")))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for FileAuditLog {
    async fn record(&self, record: &AuditRecord) {
        let inner = Arc::clone(&self.inner);
        let owned = record.clone();
        let outcome = tokio::task::spawn_blocking(move || FileAuditLog::append(&inner, &owned)).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => fallback(record, &e.to_string()),
            Err(e) => fallback(record, &format!("audit task failed: {e}")),
        }
    }
}

impl std::fmt::Debug for FileAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditLog")
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

/// Keeps records in memory. Used by tests and `tollgate check`.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record so far.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, record: &AuditRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(_) => fallback(record, "memory audit log poisoned"),
        }
    }
}
