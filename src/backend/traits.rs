//! Queue backend trait definitions
//!
//! Defines the capability interface every execution backend implements:
//! submit, poll, cancel, capacity_hint. Backends share one job-script
//! convention: the staged script runs the task command and writes an exit
//! marker file, so "finished" is observable even after a scheduler has
//! forgotten the job.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::status::ExitSummary;
use crate::task::TaskSpec;

/// How many bytes of captured output are kept in an exit summary
const OUTPUT_TAIL_BYTES: usize = 2048;

// ─────────────────────────────────────────────────────────────────
// Job Handles & Poll States
// ─────────────────────────────────────────────────────────────────

/// Backend-assigned identity of one submitted task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    /// Task fingerprint the handle belongs to
    pub fingerprint: String,

    /// Backend-side id: pid, container id or scheduler job id
    pub id: String,

    /// Host-side run directory holding script, log and exit marker
    pub run_dir: PathBuf,
}

impl JobHandle {
    /// Encode for persistence in a status record
    pub fn encode(&self) -> String {
        format!("{}:{}", self.id, self.run_dir.display())
    }

    /// Decode a persisted handle
    pub fn decode(fingerprint: &str, encoded: &str) -> Option<Self> {
        let (id, run_dir) = encoded.split_once(':')?;
        Some(Self {
            fingerprint: fingerprint.to_string(),
            id: id.to_string(),
            run_dir: PathBuf::from(run_dir),
        })
    }
}

/// Observed state of one handle during a poll cycle
#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    /// Accepted but not yet running
    Queued,
    /// Alive on the backend
    Running,
    /// Exit marker present: the job ran to its end
    Finished(ExitSummary),
    /// Absent from the live table with no exit marker
    Lost,
    /// The scheduler no longer knows the id and no marker exists;
    /// batch queues silently purge old records, so this is an abort,
    /// not a completion
    Vanished,
}

// ─────────────────────────────────────────────────────────────────
// Prepared Jobs
// ─────────────────────────────────────────────────────────────────

/// A task turned into a runnable job script under the host staging tree
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub fingerprint: String,
    pub command: String,
    pub script_path: PathBuf,
    pub run_dir: PathBuf,
}

impl PreparedJob {
    /// Write the job script for a task. The script changes into the host
    /// root (so staged relative paths resolve), runs the command with
    /// output captured, and records the exit code in the marker file.
    pub fn write(task: &TaskSpec, host_root: &Path) -> Result<Self> {
        let fingerprint = task.fingerprint();
        let run_dir = host_root.join(".taskmill").join(&fingerprint);
        fs::create_dir_all(&run_dir).map_err(|e| Error::IoWrite {
            path: run_dir.clone(),
            source: e,
        })?;

        let script_path = run_dir.join("job.sh");
        let out_path = run_dir.join("job.out");
        let exit_path = run_dir.join("job.exit");

        // The run directory is keyed by fingerprint, so a resubmission
        // reuses it. A leftover marker from the previous run would make
        // the first poll report the old result; clear it before the new
        // attempt starts.
        for stale in [&exit_path, &out_path] {
            match fs::remove_file(stale) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::IoWrite {
                        path: stale.to_path_buf(),
                        source: e,
                    })
                }
            }
        }

        let script = format!(
            "#!/bin/sh\ncd '{root}'\n(\n{command}\n) > '{out}' 2>&1\necho $? > '{exit}'\n",
            root = host_root.display(),
            command = task.command,
            out = out_path.display(),
            exit = exit_path.display(),
        );
        fs::write(&script_path, script).map_err(|e| Error::IoWrite {
            path: script_path.clone(),
            source: e,
        })?;

        Ok(Self {
            fingerprint,
            command: task.command.clone(),
            script_path,
            run_dir,
        })
    }
}

/// Path of a handle's exit marker file
pub fn exit_marker(run_dir: &Path) -> PathBuf {
    run_dir.join("job.exit")
}

/// Read the exit marker of a run directory, if the job finished.
/// Also collects the tail of the captured output.
pub fn read_exit(run_dir: &Path) -> Option<ExitSummary> {
    let text = fs::read_to_string(exit_marker(run_dir)).ok()?;
    let exit_code = text.trim().parse::<i32>().ok();
    let output_tail = fs::read_to_string(run_dir.join("job.out"))
        .map(|s| {
            let start = s.len().saturating_sub(OUTPUT_TAIL_BYTES);
            s[start..].to_string()
        })
        .unwrap_or_default();
    Some(ExitSummary {
        exit_code,
        output_tail,
    })
}

// ─────────────────────────────────────────────────────────────────
// QueueBackend Trait
// ─────────────────────────────────────────────────────────────────

/// Core trait for queue backends
///
/// All backends (local, container, batch-scheduler, mock) implement this
/// trait. It is object-safe for dynamic dispatch; one instance serves one
/// host.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Get the backend name (e.g., "local", "batch")
    fn name(&self) -> &'static str;

    /// Submit a prepared job. Fails with a submission error when the
    /// resource is unreachable or rejects the script.
    async fn submit(&self, job: &PreparedJob) -> Result<JobHandle>;

    /// Poll a batch of handles in one call. Best-effort: the result maps
    /// each fingerprint to its observed state; the caller bounds the
    /// overall cycle with a timeout.
    async fn poll(&self, handles: &[JobHandle]) -> Result<HashMap<String, PollState>>;

    /// Cancel one handle. Best-effort; returns whether the backend
    /// acknowledged the cancellation.
    async fn cancel(&self, handle: &JobHandle) -> Result<bool>;

    /// Fixed slot count, when the backend has one (e.g. spooler lanes).
    /// Informs the engine's admission window.
    fn capacity_hint(&self) -> Option<usize> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
