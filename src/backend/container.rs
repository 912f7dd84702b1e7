//! Container backend
//!
//! Runs job scripts inside detached containers. The host staging root is
//! bind-mounted at the same path inside the container, so the script's
//! paths and the exit marker work unchanged. The handle id is the
//! container id; state comes from `docker inspect`, completion from the
//! exit marker.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::traits::{read_exit, JobHandle, PollState, PreparedJob, QueueBackend};
use crate::config::ContainerSettings;
use crate::error::{Error, Result};

pub struct ContainerBackend {
    settings: ContainerSettings,
    host_root: PathBuf,
}

impl ContainerBackend {
    pub fn new(settings: ContainerSettings, host_root: PathBuf) -> Self {
        Self {
            settings,
            host_root,
        }
    }

    async fn inspect_running(&self, container_id: &str) -> Option<bool> {
        let output = Command::new(&self.settings.docker_bin)
            .args(["inspect", "-f", "{{.State.Running}}", container_id])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            // Unknown id: the container was removed.
            return None;
        }
        match String::from_utf8_lossy(&output.stdout).trim() {
            "true" => Some(true),
            _ => Some(false),
        }
    }
}

#[async_trait]
impl QueueBackend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn submit(&self, job: &PreparedJob) -> Result<JobHandle> {
        let mount = format!("{root}:{root}", root = self.host_root.display());
        let mut cmd = Command::new(&self.settings.docker_bin);
        cmd.args(["run", "-d", "-v", &mount]);
        for arg in &self.settings.run_args {
            cmd.arg(arg);
        }
        cmd.arg(&self.settings.image)
            .arg("sh")
            .arg(&job.script_path);

        let output = cmd.output().await.map_err(|e| {
            Error::submission(
                "container",
                format!("failed to run {}: {e}", self.settings.docker_bin),
            )
        })?;

        if !output.status.success() {
            return Err(Error::submission(
                "container",
                format!(
                    "{} run exited with {}: {}",
                    self.settings.docker_bin,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(Error::submission(
                "container",
                "no container id reported".to_string(),
            ));
        }

        debug!(
            fingerprint = %job.fingerprint,
            container = %container_id,
            image = %self.settings.image,
            "Container started"
        );
        Ok(JobHandle {
            fingerprint: job.fingerprint.clone(),
            id: container_id,
            run_dir: job.run_dir.clone(),
        })
    }

    async fn poll(&self, handles: &[JobHandle]) -> Result<HashMap<String, PollState>> {
        let mut states = HashMap::new();
        for handle in handles {
            let state = if let Some(exit) = read_exit(&handle.run_dir) {
                PollState::Finished(exit)
            } else {
                match self.inspect_running(&handle.id).await {
                    Some(true) => PollState::Running,
                    Some(false) | None => {
                        warn!(
                            fingerprint = %handle.fingerprint,
                            container = %handle.id,
                            "Container stopped without exit marker"
                        );
                        PollState::Lost
                    }
                }
            };
            states.insert(handle.fingerprint.clone(), state);
        }
        Ok(states)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        let output = Command::new(&self.settings.docker_bin)
            .args(["rm", "-f", &handle.id])
            .output()
            .await
            .map_err(|e| Error::CancelFailed {
                fingerprint: handle.fingerprint.clone(),
                message: format!("failed to run {}: {e}", self.settings.docker_bin),
            })?;
        debug!(
            fingerprint = %handle.fingerprint,
            container = %handle.id,
            acknowledged = output.status.success(),
            "Container removal requested"
        );
        Ok(output.status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings() -> ContainerSettings {
        ContainerSettings {
            image: "alpine:3".into(),
            docker_bin: "docker".into(),
            run_args: vec!["--rm".into()],
        }
    }

    #[tokio::test]
    async fn test_finished_marker_wins_over_inspect() {
        // With the marker present, no docker invocation is needed at all.
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("job.exit"), "0\n").unwrap();
        let handle = JobHandle {
            fingerprint: "cafe".into(),
            id: "deadbeefdead".into(),
            run_dir: dir.path().to_path_buf(),
        };

        let backend = ContainerBackend::new(settings(), dir.path().to_path_buf());
        let states = backend.poll(std::slice::from_ref(&handle)).await.unwrap();
        match states.get("cafe") {
            Some(PollState::Finished(exit)) => assert_eq!(exit.exit_code, Some(0)),
            other => panic!("unexpected state: {other:?}"),
        }
    }
}
