//! Batch scheduler backend
//!
//! Drives an external queueing system (PBS-style scheduler, task spooler)
//! through configurable command templates. `{script}` and `{job_id}` are
//! the only placeholders. Scheduler state names are translated through the
//! configured status map; a job the scheduler no longer knows and that
//! left no exit marker counts as vanished, because batch queues silently
//! purge finished and killed records.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::backend::traits::{read_exit, JobHandle, PollState, PreparedJob, QueueBackend};
use crate::config::BatchSettings;
use crate::error::{Error, Result};

pub struct BatchBackend {
    settings: BatchSettings,
}

impl BatchBackend {
    pub fn new(settings: BatchSettings) -> Self {
        Self { settings }
    }

    /// Whether the status command queries one job at a time or lists the
    /// whole queue
    fn per_job_status(&self) -> bool {
        self.settings.status_cmd.contains("{job_id}")
    }

    async fn run_shell(&self, command: &str) -> Result<std::process::Output> {
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| Error::submission("batch", format!("failed to run '{command}': {e}")))
    }

    /// Translate scheduler output tokens through the status map.
    /// The first token with a mapping wins.
    fn map_tokens<'a>(&self, tokens: impl Iterator<Item = &'a str>) -> Option<String> {
        for token in tokens {
            if let Some(mapped) = self.settings.status_map.get(token) {
                return Some(mapped.to_lowercase());
            }
        }
        None
    }

    /// Turn a mapped scheduler state into a poll state. Scheduler-reported
    /// termination defers to the exit marker; a terminal report without a
    /// marker means the job never ran its script to the end.
    fn resolve_mapped(&self, handle: &JobHandle, mapped: &str) -> PollState {
        match mapped {
            "pending" | "submitted" | "queued" => PollState::Queued,
            "running" => PollState::Running,
            "completed" | "failed" | "aborted" => match read_exit(&handle.run_dir) {
                Some(exit) => PollState::Finished(exit),
                None => {
                    warn!(
                        fingerprint = %handle.fingerprint,
                        job_id = %handle.id,
                        state = %mapped,
                        "Scheduler reports terminal state but no exit marker exists"
                    );
                    PollState::Lost
                }
            },
            other => {
                warn!(state = %other, "Unrecognized mapped scheduler state");
                PollState::Lost
            }
        }
    }

    /// State of a handle the scheduler did not report at all
    fn resolve_unlisted(&self, handle: &JobHandle) -> PollState {
        match read_exit(&handle.run_dir) {
            Some(exit) => PollState::Finished(exit),
            None => PollState::Vanished,
        }
    }

    async fn poll_per_job(&self, handles: &[JobHandle]) -> Result<HashMap<String, PollState>> {
        let mut states = HashMap::new();
        for handle in handles {
            let command = self.settings.status_cmd.replace("{job_id}", &handle.id);
            let output = self.run_shell(&command).await?;
            let state = if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                match self.map_tokens(text.split_whitespace()) {
                    Some(mapped) => self.resolve_mapped(handle, &mapped),
                    None => self.resolve_unlisted(handle),
                }
            } else {
                // Scheduler rejects unknown ids with a non-zero exit.
                self.resolve_unlisted(handle)
            };
            trace!(fingerprint = %handle.fingerprint, ?state, "Polled");
            states.insert(handle.fingerprint.clone(), state);
        }
        Ok(states)
    }

    async fn poll_listing(&self, handles: &[JobHandle]) -> Result<HashMap<String, PollState>> {
        let output = self.run_shell(&self.settings.status_cmd).await?;
        if !output.status.success() {
            return Err(Error::submission(
                "batch",
                format!(
                    "status command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        let listing = String::from_utf8_lossy(&output.stdout).into_owned();

        let mut states = HashMap::new();
        for handle in handles {
            let line = listing.lines().find(|line| {
                line.split_whitespace()
                    .next()
                    .map(|first| first == handle.id || first.starts_with(&format!("{}.", handle.id)))
                    .unwrap_or(false)
            });
            let state = match line {
                Some(line) => match self.map_tokens(line.split_whitespace()) {
                    Some(mapped) => self.resolve_mapped(handle, &mapped),
                    None => self.resolve_unlisted(handle),
                },
                None => self.resolve_unlisted(handle),
            };
            states.insert(handle.fingerprint.clone(), state);
        }
        Ok(states)
    }
}

#[async_trait]
impl QueueBackend for BatchBackend {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn submit(&self, job: &PreparedJob) -> Result<JobHandle> {
        let command = self
            .settings
            .submit_cmd
            .replace("{script}", &job.script_path.display().to_string());
        let output = self.run_shell(&command).await?;

        if !output.status.success() {
            return Err(Error::submission(
                "batch",
                format!(
                    "submit command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        // qsub prints "1234.server", ts prints a bare job number; either
        // way the id is the first token of the first line.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = stdout
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().next())
            .unwrap_or("")
            .to_string();
        if job_id.is_empty() {
            return Err(Error::submission(
                "batch",
                "submit command reported no job id".to_string(),
            ));
        }

        debug!(fingerprint = %job.fingerprint, job_id = %job_id, "Job queued");
        Ok(JobHandle {
            fingerprint: job.fingerprint.clone(),
            id: job_id,
            run_dir: job.run_dir.clone(),
        })
    }

    async fn poll(&self, handles: &[JobHandle]) -> Result<HashMap<String, PollState>> {
        if handles.is_empty() {
            return Ok(HashMap::new());
        }
        if self.per_job_status() {
            self.poll_per_job(handles).await
        } else {
            self.poll_listing(handles).await
        }
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        if self.settings.kill_cmd.is_empty() {
            return Err(Error::NotSupported(
                "no kill command configured for this batch queue".to_string(),
            ));
        }
        let command = self.settings.kill_cmd.replace("{job_id}", &handle.id);
        let output = self
            .run_shell(&command)
            .await
            .map_err(|e| Error::CancelFailed {
                fingerprint: handle.fingerprint.clone(),
                message: e.to_string(),
            })?;
        debug!(
            fingerprint = %handle.fingerprint,
            job_id = %handle.id,
            acknowledged = output.status.success(),
            "Kill requested"
        );
        Ok(output.status.success())
    }

    fn capacity_hint(&self) -> Option<usize> {
        self.settings.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn pbs_like(dir: &TempDir) -> BatchSettings {
        // A fake scheduler backed by plain files: submit prints an id,
        // status reads the queue file.
        let queue_file = dir.path().join("queue.txt");
        BatchSettings {
            submit_cmd: "echo 42.fakehost".into(),
            status_cmd: format!("cat '{}'", queue_file.display()),
            kill_cmd: "true".into(),
            status_map: BTreeMap::from([
                ("Q".to_string(), "submitted".to_string()),
                ("R".to_string(), "running".to_string()),
                ("C".to_string(), "completed".to_string()),
            ]),
            capacity: Some(2),
        }
    }

    fn handle(dir: &TempDir, id: &str) -> JobHandle {
        JobHandle {
            fingerprint: format!("fp-{id}"),
            id: id.into(),
            run_dir: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_submit_parses_job_id() {
        let dir = TempDir::new().unwrap();
        let backend = BatchBackend::new(pbs_like(&dir));
        let task = TaskSpec::from_command("true");
        let job = PreparedJob::write(&task, dir.path()).unwrap();

        let handle = backend.submit(&job).await.unwrap();
        assert_eq!(handle.id, "42.fakehost");
    }

    #[tokio::test]
    async fn test_listing_poll_maps_states() {
        let dir = TempDir::new().unwrap();
        let settings = pbs_like(&dir);
        std::fs::write(
            dir.path().join("queue.txt"),
            "41 job-a user R 00:01\n42.fakehost job-b user Q 00:00\n",
        )
        .unwrap();
        let backend = BatchBackend::new(settings);

        let run_a = TempDir::new().unwrap();
        let run_b = TempDir::new().unwrap();
        let mut a = handle(&run_a, "41");
        a.run_dir = run_a.path().to_path_buf();
        let mut b = handle(&run_b, "42");
        b.run_dir = run_b.path().to_path_buf();

        let states = backend.poll(&[a, b]).await.unwrap();
        assert_eq!(states.get("fp-41"), Some(&PollState::Running));
        // "42" matches the "42.fakehost" listing prefix
        assert_eq!(states.get("fp-42"), Some(&PollState::Queued));
    }

    #[tokio::test]
    async fn test_unlisted_job_with_marker_is_finished() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("queue.txt"), "").unwrap();
        let backend = BatchBackend::new(pbs_like(&dir));

        let run = TempDir::new().unwrap();
        std::fs::write(run.path().join("job.exit"), "0\n").unwrap();
        let h = handle(&run, "77");

        let states = backend.poll(std::slice::from_ref(&h)).await.unwrap();
        match states.get("fp-77") {
            Some(PollState::Finished(exit)) => assert_eq!(exit.exit_code, Some(0)),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unlisted_job_without_marker_vanished() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("queue.txt"), "").unwrap();
        let backend = BatchBackend::new(pbs_like(&dir));

        let run = TempDir::new().unwrap();
        let h = handle(&run, "88");
        let states = backend.poll(std::slice::from_ref(&h)).await.unwrap();
        assert_eq!(states.get("fp-88"), Some(&PollState::Vanished));
    }

    #[tokio::test]
    async fn test_per_job_status_mode() {
        let dir = TempDir::new().unwrap();
        let settings = BatchSettings {
            submit_cmd: "echo 9".into(),
            // {job_id} present: queried one job at a time
            status_cmd: "echo job {job_id} state R".into(),
            kill_cmd: String::new(),
            status_map: BTreeMap::from([("R".to_string(), "running".to_string())]),
            capacity: None,
        };
        let backend = BatchBackend::new(settings);
        assert!(backend.per_job_status());

        let h = handle(&dir, "9");
        let states = backend.poll(std::slice::from_ref(&h)).await.unwrap();
        assert_eq!(states.get("fp-9"), Some(&PollState::Running));

        let err = backend.cancel(&h).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_capacity_hint() {
        let dir = TempDir::new().unwrap();
        let backend = BatchBackend::new(pbs_like(&dir));
        assert_eq!(backend.capacity_hint(), Some(2));
    }
}
