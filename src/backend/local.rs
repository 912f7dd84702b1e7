//! Local shell backend
//!
//! Runs job scripts as detached background processes on the current
//! machine. The handle id is the shell pid; liveness is checked with
//! `kill -0`, completion through the exit marker the script writes.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::traits::{read_exit, JobHandle, PollState, PreparedJob, QueueBackend};
use crate::error::{Error, Result};

pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }

    async fn pid_alive(&self, pid: &str) -> bool {
        Command::new("kill")
            .arg("-0")
            .arg(pid)
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, job: &PreparedJob) -> Result<JobHandle> {
        // nohup + backgrounding detaches the job from our own lifetime;
        // the spawning shell prints the pid and exits immediately.
        let launcher = format!(
            "nohup sh '{}' >/dev/null 2>&1 & echo $!",
            job.script_path.display()
        );
        let output = Command::new("sh")
            .arg("-c")
            .arg(&launcher)
            .output()
            .await
            .map_err(|e| Error::submission("local", format!("failed to spawn shell: {e}")))?;

        if !output.status.success() {
            return Err(Error::submission(
                "local",
                format!(
                    "launcher exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let pid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if pid.is_empty() || pid.parse::<u32>().is_err() {
            return Err(Error::submission(
                "local",
                format!("launcher did not report a pid: {pid:?}"),
            ));
        }

        debug!(fingerprint = %job.fingerprint, pid = %pid, "Job started");
        Ok(JobHandle {
            fingerprint: job.fingerprint.clone(),
            id: pid,
            run_dir: job.run_dir.clone(),
        })
    }

    async fn poll(&self, handles: &[JobHandle]) -> Result<HashMap<String, PollState>> {
        let mut states = HashMap::new();
        for handle in handles {
            // The marker outlives the process, so check it first.
            let state = if let Some(exit) = read_exit(&handle.run_dir) {
                PollState::Finished(exit)
            } else if self.pid_alive(&handle.id).await {
                PollState::Running
            } else {
                warn!(
                    fingerprint = %handle.fingerprint,
                    pid = %handle.id,
                    "Process gone without exit marker"
                );
                PollState::Lost
            };
            states.insert(handle.fingerprint.clone(), state);
        }
        Ok(states)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        let output = Command::new("kill")
            .arg(&handle.id)
            .output()
            .await
            .map_err(|e| Error::CancelFailed {
                fingerprint: handle.fingerprint.clone(),
                message: format!("failed to run kill: {e}"),
            })?;
        debug!(
            fingerprint = %handle.fingerprint,
            pid = %handle.id,
            acknowledged = output.status.success(),
            "Cancel requested"
        );
        Ok(output.status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_submit_and_poll_to_completion() {
        let dir = TempDir::new().unwrap();
        let task = TaskSpec::from_command("echo done");
        let job = PreparedJob::write(&task, dir.path()).unwrap();

        let backend = LocalBackend::new();
        let handle = backend.submit(&job).await.unwrap();
        assert_eq!(handle.fingerprint, job.fingerprint);

        // The job is tiny; wait for the marker to land.
        let mut finished = None;
        for _ in 0..50 {
            let states = backend.poll(std::slice::from_ref(&handle)).await.unwrap();
            match states.get(&handle.fingerprint) {
                Some(PollState::Finished(exit)) => {
                    finished = Some(exit.clone());
                    break;
                }
                _ => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
            }
        }
        let exit = finished.expect("job never finished");
        assert_eq!(exit.exit_code, Some(0));
        assert!(exit.output_tail.contains("done"));
    }

    #[tokio::test]
    async fn test_failing_command_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let task = TaskSpec::from_command("exit 3");
        let job = PreparedJob::write(&task, dir.path()).unwrap();

        let backend = LocalBackend::new();
        let handle = backend.submit(&job).await.unwrap();

        let mut exit_code = None;
        for _ in 0..50 {
            let states = backend.poll(std::slice::from_ref(&handle)).await.unwrap();
            if let Some(PollState::Finished(exit)) = states.get(&handle.fingerprint) {
                exit_code = exit.exit_code;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert_eq!(exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_dead_pid_without_marker_is_lost() {
        let dir = TempDir::new().unwrap();
        let handle = JobHandle {
            fingerprint: "feedbeef".into(),
            id: "999999".into(),
            run_dir: dir.path().to_path_buf(),
        };
        let backend = LocalBackend::new();
        let states = backend.poll(std::slice::from_ref(&handle)).await.unwrap();
        assert_eq!(states.get("feedbeef"), Some(&PollState::Lost));
    }
}
