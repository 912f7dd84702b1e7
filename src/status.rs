//! Task status records and the per-host status store
//!
//! One JSON record per (fingerprint, host) under the host's status
//! directory. The file-per-record layout makes the uniqueness invariant
//! structural: a task cannot have two live records on one host because it
//! only ever has one record there.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::task::TaskSpec;

// ─────────────────────────────────────────────────────────────────
// Task Status
// ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a task on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created locally, never handed to a backend
    New,
    /// Waiting for an admission slot
    Pending,
    /// Accepted by the backend, not yet observed running
    Submitted,
    /// Observed running on the backend
    Running,
    /// Finished successfully, outputs retrieved
    Completed,
    /// Finished unsuccessfully (non-zero exit, missing output, lost job)
    Failed,
    /// Cancelled by user intent
    Aborted,
    /// Backend currently unreachable
    Unknown,
}

impl TaskStatus {
    /// Terminal states are never left except by an explicit forced resume
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted)
    }

    /// Live states count against the host's admission window
    pub fn is_live(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Submitted | TaskStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Pending => "pending",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Record
// ─────────────────────────────────────────────────────────────────

/// Exit information captured when a task reaches a terminal state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitSummary {
    /// Process exit code, when the backend reported one
    pub exit_code: Option<i32>,

    /// Tail of the captured output, for diagnostics
    #[serde(default)]
    pub output_tail: String,
}

/// The persisted record of one task on one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Stable task identity
    pub fingerprint: String,

    /// Host this record belongs to
    pub host: String,

    /// Current status
    pub status: TaskStatus,

    /// Identifier of the current submission attempt
    pub run_id: Uuid,

    /// Backend-assigned handle (job id, container id, pid marker)
    #[serde(default)]
    pub handle: Option<String>,

    /// The staged command, kept for reporting and re-execution
    pub command: String,

    /// Declared input paths, for reporting
    #[serde(default)]
    pub inputs: Vec<PathBuf>,

    /// Declared output paths, for reporting
    #[serde(default)]
    pub outputs: Vec<PathBuf>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,

    /// Last time a poll observed this task
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,

    /// Exit information once terminal
    #[serde(default)]
    pub exit: Option<ExitSummary>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl TaskRecord {
    /// Create a fresh record for a task on a host
    pub fn new(task: &TaskSpec, host: impl Into<String>) -> Self {
        Self {
            fingerprint: task.fingerprint(),
            host: host.into(),
            status: TaskStatus::New,
            run_id: Uuid::new_v4(),
            handle: None,
            command: task.command.clone(),
            inputs: task.inputs.clone(),
            outputs: task.outputs.iter().map(|o| o.path.clone()).collect(),
            created_at: Utc::now(),
            submitted_at: None,
            started_at: None,
            ended_at: None,
            last_seen: None,
            exit: None,
            tags: task.tags.clone(),
        }
    }

    pub fn mark_pending(&mut self) {
        self.status = TaskStatus::Pending;
    }

    pub fn mark_submitted(&mut self, handle: impl Into<String>) {
        self.status = TaskStatus::Submitted;
        self.handle = Some(handle.into());
        self.submitted_at = Some(Utc::now());
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.last_seen = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, exit: ExitSummary) {
        self.status = TaskStatus::Completed;
        self.ended_at = Some(Utc::now());
        self.last_seen = Some(Utc::now());
        self.exit = Some(exit);
    }

    pub fn mark_failed(&mut self, exit: ExitSummary) {
        self.status = TaskStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.last_seen = Some(Utc::now());
        self.exit = Some(exit);
    }

    /// Flip to aborted on user intent. Applies only to live records.
    pub fn mark_aborted(&mut self) {
        if self.status.is_live() || self.status == TaskStatus::Unknown {
            self.status = TaskStatus::Aborted;
            self.ended_at = Some(Utc::now());
        }
    }

    /// A poll cycle could not reach the backend. A previously-known
    /// terminal state is never overwritten.
    pub fn mark_unknown(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Unknown;
        }
    }

    /// Forced resume over a terminal record: back to pending with a fresh
    /// submission attempt.
    pub fn reset_for_resubmit(&mut self) {
        self.status = TaskStatus::Pending;
        self.run_id = Uuid::new_v4();
        self.handle = None;
        self.submitted_at = None;
        self.started_at = None;
        self.ended_at = None;
        self.exit = None;
    }
}

// ─────────────────────────────────────────────────────────────────
// Status Store
// ─────────────────────────────────────────────────────────────────

/// Directory-of-records status store for one host.
///
/// Writes are serialized through an internal mutex: the engine owns
/// mutation, reporters only read snapshots.
pub struct StatusStore {
    host: String,
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl StatusStore {
    /// Open (and create) the status directory for a host
    pub fn open(workdir: &Path, host: impl Into<String>) -> Result<Self> {
        let host = host.into();
        let root = workdir.join("status").join(&host);
        fs::create_dir_all(&root).map_err(|e| Error::IoWrite {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self {
            host,
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Host this store belongs to
    pub fn host(&self) -> &str {
        &self.host
    }

    fn record_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{fingerprint}.json"))
    }

    /// Load one record, if present. A record that cannot be decoded is a
    /// fatal local fault.
    pub fn load(&self, fingerprint: &str) -> Result<Option<TaskRecord>> {
        let path = self.record_path(fingerprint);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::IoRead { path, source: e }),
        };
        let record =
            serde_json::from_str(&text).map_err(|e| Error::CorruptRecord { path, source: e })?;
        Ok(Some(record))
    }

    /// Persist a record atomically (write-then-rename)
    pub fn save(&self, record: &TaskRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self.record_path(&record.fingerprint);
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(record)
            .map_err(|e| Error::Internal(format!("failed to encode status record: {e}")))?;
        fs::write(&tmp, text).map_err(|e| Error::IoWrite {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| Error::IoWrite { path, source: e })?;
        debug!(host = %self.host, fingerprint = %record.fingerprint, status = %record.status, "Status record saved");
        Ok(())
    }

    /// Remove a record. Returns whether one existed.
    pub fn remove(&self, fingerprint: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = self.record_path(fingerprint);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::IoWrite { path, source: e }),
        }
    }

    /// Load all records for this host (a consistent read snapshot)
    pub fn list(&self) -> Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| Error::IoRead {
            path: self.root.clone(),
            source: e,
        })? {
            let entry = entry.map_err(|e| Error::IoRead {
                path: self.root.clone(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(record) = self.load(stem)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
