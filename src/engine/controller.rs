//! The task engine: submission, waiting, and admin operations
//!
//! Owns the cross-host orchestration: signature-based skipping, the
//! bounded admission window, the adaptive poll loop, and the purge /
//! kill / execute operations. Per-host mechanics live in [`super::host`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::host::{FinishedTask, Host};
use crate::error::{Error, Result};
use crate::signature::{Signature, SignatureStore};
use crate::status::{ExitSummary, TaskRecord, TaskStatus};
use crate::task::{SigMode, TaskSpec};

// ─────────────────────────────────────────────────────────────────
// Outcomes & Reports
// ─────────────────────────────────────────────────────────────────

/// What happened to one task at submission time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Staged and handed to the backend
    Submitted,
    /// Admission window full; queued locally as pending
    Deferred,
    /// Recorded signature still valid; no backend interaction at all
    Skipped,
    /// A live record already exists; re-attached to it
    Resumed,
}

/// Aggregate result of one `run` invocation
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub completed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub skipped: usize,
    pub unknown: usize,
    /// Final status per fingerprint
    pub statuses: BTreeMap<String, TaskStatus>,
}

impl RunReport {
    /// Whether every task ended well (completed or skipped)
    pub fn success(&self) -> bool {
        self.failed == 0 && self.aborted == 0 && self.unknown == 0
    }

    fn count(&mut self, fingerprint: &str, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Aborted => self.aborted += 1,
            _ => self.unknown += 1,
        }
        self.statuses.insert(fingerprint.to_string(), status);
    }
}

/// Aggregate result of a purge
#[derive(Debug, Clone, Default)]
pub struct PurgeReport {
    pub removed: usize,
    pub skipped_live: usize,
}

// ─────────────────────────────────────────────────────────────────
// Task Engine
// ─────────────────────────────────────────────────────────────────

pub struct TaskEngine {
    config: Config,
    workdir: PathBuf,
    signatures: SignatureStore,
    hosts: BTreeMap<String, Host>,
}

impl TaskEngine {
    /// Build the engine with every configured host
    pub fn new(config: Config) -> Result<Self> {
        let workdir = config.workdir();
        let mut hosts = BTreeMap::new();
        for name in config.hosts.keys() {
            hosts.insert(name.clone(), Host::from_config(name, &config)?);
        }
        let signatures = SignatureStore::open(&workdir)?;
        Ok(Self {
            config,
            workdir,
            signatures,
            hosts,
        })
    }

    /// Build the engine around pre-constructed hosts (used by tests)
    pub fn with_hosts(config: Config, hosts: Vec<Host>) -> Result<Self> {
        let workdir = config.workdir();
        let signatures = SignatureStore::open(&workdir)?;
        Ok(Self {
            config,
            workdir,
            signatures,
            hosts: hosts.into_iter().map(|h| (h.name().to_string(), h)).collect(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn host(&self, name: &str) -> Result<&Host> {
        self.hosts.get(name).ok_or_else(|| Error::unknown_host(name))
    }

    fn host_for(&self, task: &TaskSpec) -> Result<&Host> {
        let name = if task.queue.is_empty() {
            &self.config.engine.default_queue
        } else {
            &task.queue
        };
        self.host(name)
    }

    /// Task-level signature mode, falling back to the engine default
    fn effective_sig_mode(&self, task: &TaskSpec) -> SigMode {
        match task.sig_mode {
            SigMode::Default => self.config.engine.sig_mode,
            explicit => explicit,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Task Spec Persistence
    // ─────────────────────────────────────────────────────────────

    fn spec_path(&self, fingerprint: &str) -> PathBuf {
        self.workdir.join("tasks").join(format!("{fingerprint}.toml"))
    }

    fn save_spec(&self, task: &TaskSpec) -> Result<()> {
        let path = self.spec_path(&task.fingerprint());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let text = toml::to_string_pretty(task)?;
        fs::write(&path, text).map_err(|e| Error::IoWrite { path, source: e })?;
        Ok(())
    }

    fn load_spec(&self, fingerprint: &str) -> Result<Option<TaskSpec>> {
        let path = self.spec_path(fingerprint);
        if !path.exists() {
            return Ok(None);
        }
        TaskSpec::from_toml_file(&path).map(Some)
    }

    // ─────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────

    /// Submit one task. Decides between skip, re-attach, immediate
    /// submission and deferral, in that order.
    pub async fn submit(&self, task: &TaskSpec) -> Result<SubmitOutcome> {
        let host = self.host_for(task)?;
        let fingerprint = task.fingerprint();
        let sig_mode = self.effective_sig_mode(task);
        self.save_spec(task)?;

        let existing = host.store().load(&fingerprint)?;

        // A live (or unreachable) record is never resubmitted over, not
        // even with force: the running attempt is re-attached instead.
        if let Some(record) = &existing {
            if record.status.is_live() || record.status == TaskStatus::Unknown {
                info!(fingerprint = %fingerprint, host = %host.name(), status = %record.status, "Re-attaching to live task");
                return Ok(SubmitOutcome::Resumed);
            }
        }

        match sig_mode {
            SigMode::Ignore => {}
            SigMode::Force => {
                self.signatures.invalidate(&fingerprint)?;
            }
            SigMode::Build => {
                if task.local_outputs().iter().all(|o| o.path.exists()) {
                    let signature = Signature::capture(task)?;
                    self.signatures.record(&signature)?;
                    self.record_skip(host, task, &existing)?;
                    info!(fingerprint = %fingerprint, "Signature baseline recorded from existing outputs");
                    return Ok(SubmitOutcome::Skipped);
                }
                // No complete outputs to build from: behave like default
                if self.signature_holds(task)? {
                    self.record_skip(host, task, &existing)?;
                    return Ok(SubmitOutcome::Skipped);
                }
            }
            SigMode::Default => {
                if self.signature_holds(task)? {
                    self.record_skip(host, task, &existing)?;
                    debug!(fingerprint = %fingerprint, "Skipped: recorded signature still valid");
                    return Ok(SubmitOutcome::Skipped);
                }
            }
        }

        let mut record = match existing {
            Some(mut record) => {
                record.reset_for_resubmit();
                record
            }
            None => {
                let mut record = TaskRecord::new(task, host.name());
                record.mark_pending();
                record
            }
        };

        if host.free_slots()? > 0 {
            host.submit_task(task, &mut record).await?;
            Ok(SubmitOutcome::Submitted)
        } else {
            host.store().save(&record)?;
            debug!(fingerprint = %fingerprint, host = %host.name(), "Admission window full, task deferred");
            Ok(SubmitOutcome::Deferred)
        }
    }

    /// A task is skippable only when a signature exists, every output the
    /// task declares *now* is part of the snapshot, and the snapshot still
    /// matches on disk. Declared outputs are not part of the fingerprint,
    /// so a task that grows an output keeps its identity but must rerun.
    fn signature_holds(&self, task: &TaskSpec) -> Result<bool> {
        let Some(signature) = self.signatures.lookup(&task.fingerprint())? else {
            return Ok(false);
        };
        let covered = task
            .local_outputs()
            .iter()
            .all(|o| signature.outputs.contains_key(&o.path));
        Ok(covered && signature.still_valid())
    }

    /// Make sure a skipped task has a terminal record to report on
    fn record_skip(&self, host: &Host, task: &TaskSpec, existing: &Option<TaskRecord>) -> Result<()> {
        if existing.is_some() {
            return Ok(());
        }
        let mut record = TaskRecord::new(task, host.name());
        record.mark_completed(ExitSummary {
            exit_code: None,
            output_tail: "skipped: outputs up to date".into(),
        });
        host.store().save(&record)
    }

    // ─────────────────────────────────────────────────────────────
    // Run & Wait
    // ─────────────────────────────────────────────────────────────

    /// Submit a batch of tasks and, when waiting is enabled, poll until
    /// every one of them reaches a terminal state.
    pub async fn run(&self, tasks: Vec<TaskSpec>) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut specs: BTreeMap<String, TaskSpec> = BTreeMap::new();
        let mut tracked: Vec<(String, String)> = Vec::new(); // (fingerprint, host)
        let mut involved: BTreeSet<String> = BTreeSet::new();

        for task in tasks {
            let host = self.host_for(&task)?;
            let fingerprint = task.fingerprint();
            let outcome = self.submit(&task).await?;
            match outcome {
                SubmitOutcome::Skipped => {
                    report.skipped += 1;
                    report
                        .statuses
                        .insert(fingerprint.clone(), TaskStatus::Completed);
                }
                SubmitOutcome::Resumed if !self.config.engine.resume_mode => {
                    // Another session owns this attempt; report its state
                    // without waiting on it.
                    let status = host
                        .store()
                        .load(&fingerprint)?
                        .map(|r| r.status)
                        .unwrap_or(TaskStatus::Unknown);
                    report.statuses.insert(fingerprint.clone(), status);
                }
                SubmitOutcome::Submitted | SubmitOutcome::Deferred | SubmitOutcome::Resumed => {
                    tracked.push((fingerprint.clone(), host.name().to_string()));
                    involved.insert(host.name().to_string());
                }
            }
            specs.insert(fingerprint, task);
        }

        let wait = self.config.engine.wait_for_task
            && involved.iter().any(|name| {
                self.hosts
                    .get(name)
                    .map(|h| h.wait_for_task())
                    .unwrap_or(true)
            });
        if !wait || tracked.is_empty() {
            for (fingerprint, host_name) in &tracked {
                let status = self
                    .host(host_name)?
                    .store()
                    .load(fingerprint)?
                    .map(|r| r.status)
                    .unwrap_or(TaskStatus::Unknown);
                report.statuses.insert(fingerprint.clone(), status);
            }
            return Ok(report);
        }

        self.wait_for(&tracked, &specs, &mut report).await?;
        Ok(report)
    }

    /// The adaptive poll loop: interval grows exponentially while nothing
    /// changes and resets on any observed transition.
    async fn wait_for(
        &self,
        tracked: &[(String, String)],
        specs: &BTreeMap<String, TaskSpec>,
        report: &mut RunReport,
    ) -> Result<()> {
        let engine = &self.config.engine;
        let mut interval = ExponentialBackoff {
            initial_interval: Duration::from_millis(engine.poll_initial_ms),
            max_interval: Duration::from_millis(engine.poll_max_ms),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        let poll_timeout = Duration::from_secs(engine.poll_timeout_secs);

        let involved: BTreeSet<&str> = tracked.iter().map(|(_, h)| h.as_str()).collect();
        let mut unreachable: BTreeMap<&str, u32> = BTreeMap::new();
        let mut gave_up: BTreeSet<&str> = BTreeSet::new();

        loop {
            let mut changed = false;

            for &host_name in &involved {
                if gave_up.contains(host_name) {
                    continue;
                }
                let host = self.host(host_name)?;

                let cycle = tokio::time::timeout(poll_timeout, host.poll_once()).await;
                match cycle {
                    Ok(Ok((finished, cycle_changed))) => {
                        unreachable.insert(host_name, 0);
                        changed |= cycle_changed;
                        for done in finished {
                            self.finalize(host, done, specs)?;
                            changed = true;
                        }
                        changed |= self.promote_pending(host, specs).await?;
                    }
                    Ok(Err(e)) if e.is_retryable() => {
                        let count = unreachable.entry(host_name).or_insert(0);
                        *count += 1;
                        warn!(host = %host_name, attempt = *count, error = %e.format_for_log(), "Poll cycle failed");
                        host.mark_all_unknown()?;
                        if *count >= engine.max_unreachable_cycles {
                            warn!(host = %host_name, "Backend unreachable for too long, giving up");
                            gave_up.insert(host_name);
                        }
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        let count = unreachable.entry(host_name).or_insert(0);
                        *count += 1;
                        warn!(host = %host_name, attempt = *count, "Poll cycle timed out");
                        host.mark_all_unknown()?;
                        if *count >= engine.max_unreachable_cycles {
                            gave_up.insert(host_name);
                        }
                    }
                }
            }

            // Are all tracked tasks settled?
            let mut done = true;
            for (fingerprint, host_name) in tracked {
                if gave_up.contains(host_name.as_str()) {
                    continue;
                }
                let status = self
                    .host(host_name)?
                    .store()
                    .load(fingerprint)?
                    .map(|r| r.status)
                    .unwrap_or(TaskStatus::Unknown);
                if !status.is_terminal() {
                    done = false;
                    break;
                }
            }
            if done {
                break;
            }

            if changed {
                interval.reset();
            }
            let pause = interval
                .next_backoff()
                .unwrap_or(Duration::from_millis(engine.poll_max_ms));
            tokio::time::sleep(pause).await;
        }

        for (fingerprint, host_name) in tracked {
            let status = self
                .host(host_name)?
                .store()
                .load(fingerprint)?
                .map(|r| r.status)
                .unwrap_or(TaskStatus::Unknown);
            report.count(fingerprint, status);
        }
        Ok(())
    }

    /// Settle one finished task: retrieve outputs, record the signature,
    /// write the terminal status.
    fn finalize(
        &self,
        host: &Host,
        done: FinishedTask,
        specs: &BTreeMap<String, TaskSpec>,
    ) -> Result<()> {
        let FinishedTask { mut record, exit } = done;
        let fingerprint = record.fingerprint.clone();
        let spec = match specs.get(&fingerprint) {
            Some(spec) => Some(spec.clone()),
            None => self.load_spec(&fingerprint)?,
        };

        if exit.exit_code == Some(0) {
            if let Some(task) = &spec {
                match host.sync().retrieve(task) {
                    Ok(_) => {
                        if self.effective_sig_mode(task) != SigMode::Ignore {
                            let signature = Signature::capture(task)?;
                            self.signatures.record(&signature)?;
                        }
                        record.mark_completed(exit);
                    }
                    Err(e) => {
                        warn!(fingerprint = %fingerprint, error = %e.format_for_log(), "Output retrieval failed");
                        record.mark_failed(ExitSummary {
                            exit_code: exit.exit_code,
                            output_tail: e.to_string(),
                        });
                    }
                }
            } else {
                // Spec file lost; nothing to retrieve or sign
                record.mark_completed(exit);
            }
        } else {
            record.mark_failed(exit);
        }

        info!(fingerprint = %fingerprint, host = %host.name(), status = %record.status, "Task finished");
        host.store().save(&record)
    }

    /// Move deferred tasks into freed admission slots
    async fn promote_pending(
        &self,
        host: &Host,
        specs: &BTreeMap<String, TaskSpec>,
    ) -> Result<bool> {
        let mut promoted = false;
        let mut free = host.free_slots()?;
        // Pending records with no handle never entered the backend; live
        // pending ones with a handle are already in flight.
        for mut record in host.store().list()? {
            if free == 0 {
                break;
            }
            if record.status != TaskStatus::Pending || record.handle.is_some() {
                continue;
            }
            let spec = match specs.get(&record.fingerprint) {
                Some(spec) => Some(spec.clone()),
                None => self.load_spec(&record.fingerprint)?,
            };
            let Some(task) = spec else {
                warn!(fingerprint = %record.fingerprint, "Pending task has no stored spec");
                continue;
            };
            host.submit_task(&task, &mut record).await?;
            free = host.free_slots()?;
            promoted = true;
        }
        Ok(promoted)
    }

    // ─────────────────────────────────────────────────────────────
    // Admin Operations
    // ─────────────────────────────────────────────────────────────

    /// Status records across hosts, optionally filtered to one host.
    /// Runs one poll cycle per host first so the records reflect live
    /// backend state; an unreachable backend marks its records unknown.
    pub async fn status(&self, host: Option<&str>) -> Result<Vec<TaskRecord>> {
        let hosts: Vec<&Host> = match host {
            Some(name) => vec![self.host(name)?],
            None => self.hosts.values().collect(),
        };
        let poll_timeout = Duration::from_secs(self.config.engine.poll_timeout_secs);
        let no_specs = BTreeMap::new();

        let mut records = Vec::new();
        for host in hosts {
            match tokio::time::timeout(poll_timeout, host.poll_once()).await {
                Ok(Ok((finished, _))) => {
                    for done in finished {
                        self.finalize(host, done, &no_specs)?;
                    }
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(host = %host.name(), error = %e.format_for_log(), "Status refresh failed");
                    host.mark_all_unknown()?;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(host = %host.name(), "Status refresh timed out");
                    host.mark_all_unknown()?;
                }
            }
            records.extend(host.store().list()?);
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Remove terminal records (and their signatures, specs and staged
    /// run directories). Live records are skipped unless `force` is set,
    /// in which case they are killed first.
    pub async fn purge(
        &self,
        fingerprints: &[String],
        host: Option<&str>,
        force: bool,
    ) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        let hosts: Vec<&Host> = match host {
            Some(name) => vec![self.host(name)?],
            None => self.hosts.values().collect(),
        };

        for host in hosts {
            for record in host.store().list()? {
                if !fingerprints.is_empty() && !fingerprints.contains(&record.fingerprint) {
                    continue;
                }
                let live = record.status.is_live() || record.status == TaskStatus::Unknown;
                if live {
                    if !force {
                        report.skipped_live += 1;
                        continue;
                    }
                    host.kill(&record.fingerprint).await?;
                }
                host.store().remove(&record.fingerprint)?;
                self.signatures.invalidate(&record.fingerprint)?;
                let _ = fs::remove_file(self.spec_path(&record.fingerprint));
                let run_dir = host.root().join(".taskmill").join(&record.fingerprint);
                let _ = fs::remove_dir_all(run_dir);
                report.removed += 1;
                debug!(fingerprint = %record.fingerprint, host = %host.name(), "Record purged");
            }
        }
        Ok(report)
    }

    /// Cancel live tasks. With no fingerprints given, every live task on
    /// the selected hosts is killed. Returns the number of tasks killed.
    pub async fn kill(&self, fingerprints: &[String], host: Option<&str>) -> Result<usize> {
        let hosts: Vec<&Host> = match host {
            Some(name) => vec![self.host(name)?],
            None => self.hosts.values().collect(),
        };

        let mut killed = 0;
        for host in hosts {
            let targets: Vec<String> = if fingerprints.is_empty() {
                host.store()
                    .list()?
                    .into_iter()
                    .filter(|r| r.status.is_live() || r.status == TaskStatus::Unknown)
                    .map(|r| r.fingerprint)
                    .collect()
            } else {
                fingerprints.to_vec()
            };
            for fingerprint in targets {
                if host.kill(&fingerprint).await? {
                    killed += 1;
                }
            }
        }
        Ok(killed)
    }

    /// Re-run a previously seen task, ignoring any recorded signature
    pub async fn execute(&self, fingerprint: &str, host: Option<&str>) -> Result<RunReport> {
        let hosts: Vec<&Host> = match host {
            Some(name) => vec![self.host(name)?],
            None => self.hosts.values().collect(),
        };

        for host in hosts {
            let Some(record) = host.store().load(fingerprint)? else {
                continue;
            };
            let mut task = match self.load_spec(fingerprint)? {
                Some(task) => task,
                // Spec file gone: rebuild the bare command from the record
                None => TaskSpec::from_command(&record.command),
            };
            task.sig_mode = SigMode::Force;
            task.queue = host.name().to_string();
            return self.run(vec![task]).await;
        }
        Err(Error::execution(format!(
            "no record of task {fingerprint} on any selected host"
        )))
    }
}
