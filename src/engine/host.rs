//! One configured execution host: backend, status store and file sync
//!
//! A `Host` bundles everything the engine needs to talk to one queue:
//! the backend instance, the per-host status store, the staging tree and
//! the effective admission window.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{create_backend, JobHandle, PollState, PreparedJob, QueueBackend};
use crate::config::{Config, HostConfig};
use crate::error::Result;
use crate::status::{ExitSummary, StatusStore, TaskRecord, TaskStatus};
use crate::sync::{FileSync, PathMapper};
use crate::task::TaskSpec;

pub struct Host {
    name: String,
    root: PathBuf,
    backend: Arc<dyn QueueBackend>,
    store: StatusStore,
    sync: FileSync,
    max_running_jobs: usize,
    wait_for_task: bool,
}

impl Host {
    /// Build a host from its configuration section
    pub fn from_config(name: &str, config: &Config) -> Result<Self> {
        let host_config = config.host(name)?;
        let root = host_root(name, host_config, &config.workdir());
        let backend = create_backend(host_config, &root)?;
        Self::assemble(name, config, host_config, root, backend)
    }

    /// Build a host around an injected backend (used by tests)
    pub fn with_backend(
        name: &str,
        config: &Config,
        backend: Arc<dyn QueueBackend>,
    ) -> Result<Self> {
        let host_config = config.host(name)?;
        let root = host_root(name, host_config, &config.workdir());
        Self::assemble(name, config, host_config, root, backend)
    }

    fn assemble(
        name: &str,
        config: &Config,
        host_config: &HostConfig,
        root: PathBuf,
        backend: Arc<dyn QueueBackend>,
    ) -> Result<Self> {
        let store = StatusStore::open(&config.workdir(), name)?;
        let sync = FileSync::new(PathMapper::new(host_config.path_maps.clone(), &root));

        // A backend with fixed slots caps the configured window.
        let configured = config.max_running_jobs(host_config);
        let max_running_jobs = match backend.capacity_hint() {
            Some(capacity) => configured.min(capacity),
            None => configured,
        };

        Ok(Self {
            name: name.to_string(),
            root,
            backend,
            store,
            sync,
            max_running_jobs,
            wait_for_task: host_config.wait_for_task.unwrap_or(config.engine.wait_for_task),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn sync(&self) -> &FileSync {
        &self.sync
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn max_running_jobs(&self) -> usize {
        self.max_running_jobs
    }

    pub fn wait_for_task(&self) -> bool {
        self.wait_for_task
    }

    /// Remaining admission slots. Only records the backend is (or may
    /// be) holding occupy a slot; locally deferred pending tasks do not.
    pub fn free_slots(&self) -> Result<usize> {
        let occupied = self
            .store
            .list()?
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    TaskStatus::Submitted | TaskStatus::Running | TaskStatus::Unknown
                )
            })
            .count();
        Ok(self.max_running_jobs.saturating_sub(occupied))
    }

    /// Stage a task's inputs and hand it to the backend. The caller has
    /// already decided admission; the record moves to `submitted` here.
    pub async fn submit_task(&self, task: &TaskSpec, record: &mut TaskRecord) -> Result<()> {
        self.sync.stage(task)?;
        let job = PreparedJob::write(task, &self.root)?;
        let handle = self.backend.submit(&job).await?;
        record.mark_submitted(handle.encode());
        self.store.save(record)?;
        debug!(host = %self.name, fingerprint = %record.fingerprint, "Task submitted");
        Ok(())
    }

    /// Live records that carry a backend handle, paired with the decoded
    /// handles. Pending records have no handle yet and are not polled.
    pub fn pollable(&self) -> Result<Vec<(TaskRecord, JobHandle)>> {
        let mut pairs = Vec::new();
        for record in self.store.list()? {
            if !(record.status.is_live() || record.status == TaskStatus::Unknown) {
                continue;
            }
            let Some(encoded) = record.handle.as_deref() else {
                continue;
            };
            match JobHandle::decode(&record.fingerprint, encoded) {
                Some(handle) => pairs.push((record, handle)),
                None => warn!(
                    host = %self.name,
                    fingerprint = %record.fingerprint,
                    "Undecodable handle in status record"
                ),
            }
        }
        Ok(pairs)
    }

    /// One poll cycle over all pollable records. Applies the observed
    /// transitions and returns the records that just finished (they still
    /// need output retrieval, which the engine owns). The boolean reports
    /// whether anything changed this cycle.
    pub async fn poll_once(&self) -> Result<(Vec<FinishedTask>, bool)> {
        let pairs = self.pollable()?;
        if pairs.is_empty() {
            return Ok((Vec::new(), false));
        }
        let handles: Vec<JobHandle> = pairs.iter().map(|(_, h)| h.clone()).collect();
        let states = self.backend.poll(&handles).await?;

        let mut finished = Vec::new();
        let mut changed = false;
        for (mut record, _handle) in pairs {
            let before = record.status;
            match states.get(&record.fingerprint) {
                Some(PollState::Queued) => {
                    // Recovering from a backend outage counts as progress.
                    if record.status == TaskStatus::Unknown {
                        record.status = TaskStatus::Submitted;
                    }
                }
                Some(PollState::Running) => record.mark_running(),
                Some(PollState::Finished(exit)) => {
                    finished.push(FinishedTask {
                        record: record.clone(),
                        exit: exit.clone(),
                    });
                    // Final status is written by the engine after retrieval.
                    changed = true;
                    continue;
                }
                Some(PollState::Lost) => {
                    record.mark_failed(ExitSummary {
                        exit_code: None,
                        output_tail: "job disappeared without an exit marker".into(),
                    });
                }
                Some(PollState::Vanished) => {
                    warn!(
                        host = %self.name,
                        fingerprint = %record.fingerprint,
                        "Scheduler no longer knows this job"
                    );
                    record.mark_aborted();
                }
                None => record.mark_unknown(),
            }
            if record.status != before {
                changed = true;
                self.store.save(&record)?;
            } else if record.status == TaskStatus::Running {
                // last_seen moved even though the status did not
                self.store.save(&record)?;
            }
        }
        Ok((finished, changed))
    }

    /// Mark every pollable record unknown (backend unreachable)
    pub fn mark_all_unknown(&self) -> Result<()> {
        for (mut record, _) in self.pollable()? {
            record.mark_unknown();
            self.store.save(&record)?;
        }
        Ok(())
    }

    /// Cancel one live task: best-effort backend cancel, then abort the
    /// record. Returns whether anything was live to kill.
    pub async fn kill(&self, fingerprint: &str) -> Result<bool> {
        let Some(mut record) = self.store.load(fingerprint)? else {
            return Ok(false);
        };
        if !(record.status.is_live() || record.status == TaskStatus::Unknown) {
            return Ok(false);
        }
        if let Some(encoded) = record.handle.as_deref() {
            if let Some(handle) = JobHandle::decode(fingerprint, encoded) {
                let acknowledged = self.backend.cancel(&handle).await?;
                if !acknowledged {
                    warn!(
                        host = %self.name,
                        fingerprint = %fingerprint,
                        "Backend did not acknowledge the cancellation"
                    );
                }
            }
        }
        record.mark_aborted();
        self.store.save(&record)?;
        Ok(true)
    }
}

/// A task whose backend execution ended this cycle
pub struct FinishedTask {
    pub record: TaskRecord,
    pub exit: ExitSummary,
}

/// Staging root of a host: its configured workdir, or a directory named
/// after it under the engine workdir
fn host_root(name: &str, config: &HostConfig, workdir: &Path) -> PathBuf {
    match &config.workdir {
        Some(dir) => crate::config::expand_path(Path::new(dir)),
        None => workdir.join("hosts").join(name),
    }
}
