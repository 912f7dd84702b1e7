//! Configuration system for taskmill
//!
//! Supports multiple configuration sources with the following precedence
//! (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (TASKMILL_* prefix, wired through clap)
//! 3. Configuration file (TOML)
//! 4. Default values
//!
//! The file enumerates engine defaults, logging settings and the host
//! table: one `[hosts.<name>]` section per execution target.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::BackendKind;
use crate::error::{Error, Result};
use crate::task::SigMode;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine defaults
    pub engine: EngineSettings,

    /// Logging configuration
    pub logging: LoggingSettings,

    /// Named execution hosts
    pub hosts: BTreeMap<String, HostConfig>,
}

/// Engine-wide defaults, overridable per host and per invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Host used when a task names no queue
    pub default_queue: String,

    /// Block until submitted tasks reach a terminal state
    pub wait_for_task: bool,

    /// Bounded admission window: never more than N live tasks per host
    pub max_running_jobs: usize,

    /// Default signature mode
    pub sig_mode: SigMode,

    /// Wait on re-attached live tasks as if this session had submitted them
    pub resume_mode: bool,

    /// Root directory for status records, signatures and staged files
    pub workdir: String,

    /// Initial poll interval in milliseconds
    pub poll_initial_ms: u64,

    /// Poll interval ceiling in milliseconds
    pub poll_max_ms: u64,

    /// Bounded timeout for one poll cycle, in seconds
    pub poll_timeout_secs: u64,

    /// Consecutive unreachable poll cycles tolerated before a waiting
    /// `run` gives up and reports the affected tasks as unknown
    pub max_unreachable_cycles: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_queue: "localhost".to_string(),
            wait_for_task: true,
            max_running_jobs: 10,
            sig_mode: SigMode::Default,
            resume_mode: false,
            workdir: "~/.taskmill".to_string(),
            poll_initial_ms: 200,
            poll_max_ms: 10_000,
            poll_timeout_secs: 30,
            max_unreachable_cycles: 10,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Host Configuration
// ─────────────────────────────────────────────────────────────────

/// One local↔remote path mapping rule (longest local prefix wins)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapRule {
    pub local: PathBuf,
    pub remote: PathBuf,
}

/// Settings for the container backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Image to run tasks in
    pub image: String,

    /// Docker-compatible binary
    pub docker_bin: String,

    /// Extra arguments passed to `docker run`
    pub run_args: Vec<String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: String::new(),
            docker_bin: "docker".to_string(),
            run_args: Vec::new(),
        }
    }
}

/// Settings for the batch-scheduler backend.
///
/// Command templates cover both PBS-style schedulers and the task spooler:
/// `{script}` expands to the staged job script, `{job_id}` to the
/// scheduler-assigned id. When `status_cmd` carries no `{job_id}`
/// placeholder it is treated as a listing command and invoked once per
/// poll cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// e.g. "qsub {script}" or "ts sh {script}"
    pub submit_cmd: String,

    /// e.g. "qstat -f {job_id}" or "ts"
    pub status_cmd: String,

    /// e.g. "qdel {job_id}" or "ts -k {job_id}"
    pub kill_cmd: String,

    /// Scheduler state name → taskmill status
    /// (e.g. "R" = running, "Q" = submitted, "C" = completed)
    pub status_map: BTreeMap<String, String>,

    /// Fixed slot count (e.g. spooler lanes); informs the admission window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

/// One named execution target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Backend kind: "local", "container" or "batch"
    pub kind: String,

    /// Staging root on the host side; defaults to
    /// `<engine.workdir>/hosts/<name>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    /// Per-host admission window override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_running_jobs: Option<usize>,

    /// Per-host wait policy override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_task: Option<bool>,

    /// Local↔remote path mapping rules
    pub path_maps: Vec<PathMapRule>,

    /// Container backend settings (kind = "container")
    pub container: ContainerSettings,

    /// Batch backend settings (kind = "batch")
    pub batch: BatchSettings,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            kind: "local".to_string(),
            workdir: None,
            max_running_jobs: None,
            wait_for_task: None,
            path_maps: Vec::new(),
            container: ContainerSettings::default(),
            batch: BatchSettings::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Loading & Validation
// ─────────────────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let mut hosts = BTreeMap::new();
        hosts.insert("localhost".to_string(), HostConfig::default());
        Self {
            engine: EngineSettings::default(),
            logging: LoggingSettings::default(),
            hosts,
        }
    }
}

impl Config {
    /// Default configuration file location: `~/.taskmill/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskmill")
            .join("config.toml")
    }

    /// Load configuration from an explicit path, or from the default
    /// location. A missing default file yields the built-in defaults; a
    /// missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (expand_path(p), true),
            None => (Self::default_path(), false),
        };

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if explicit {
                    return Err(Error::ConfigNotFound {
                        path,
                        source: Some(e),
                    });
                }
                debug!(path = %path.display(), "No configuration file, using defaults");
                let config = Config::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => return Err(Error::IoRead { path, source: e }),
        };

        let config: Config = toml::from_str(&text).map_err(|e| Error::ConfigParse {
            message: format!("invalid configuration '{}'", path.display()),
            source: Some(e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write a default configuration file to the given (or default) path
    pub fn init(path: Option<&Path>) -> Result<PathBuf> {
        let path = path.map(expand_path).unwrap_or_else(Self::default_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let text = toml::to_string_pretty(&Config::default())?;
        fs::write(&path, text).map_err(|e| Error::IoWrite {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    /// Validate structural constraints
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_running_jobs == 0 {
            return Err(Error::config_field_invalid(
                "engine.max_running_jobs",
                "must be at least 1",
            ));
        }
        if self.hosts.is_empty() {
            return Err(Error::config_validation("no hosts configured"));
        }
        if !self.hosts.contains_key(&self.engine.default_queue) {
            return Err(Error::config_field_invalid(
                "engine.default_queue",
                format!("'{}' is not a configured host", self.engine.default_queue),
            ));
        }
        for (name, host) in &self.hosts {
            // Same parser as backend construction, so kind aliases
            // ("docker", "pbs", "spooler") validate too
            let kind: BackendKind = host.kind.parse().map_err(|_| {
                Error::config_field_invalid(
                    format!("hosts.{name}.kind"),
                    format!("unknown backend kind '{}'", host.kind),
                )
            })?;
            match kind {
                BackendKind::Local => {}
                BackendKind::Container => {
                    if host.container.image.is_empty() {
                        return Err(Error::config_field_invalid(
                            format!("hosts.{name}.container.image"),
                            "container hosts require an image",
                        ));
                    }
                }
                BackendKind::Batch => {
                    if host.batch.submit_cmd.is_empty() || host.batch.status_cmd.is_empty() {
                        return Err(Error::config_field_invalid(
                            format!("hosts.{name}.batch"),
                            "batch hosts require submit_cmd and status_cmd",
                        ));
                    }
                }
            }
            if host.max_running_jobs == Some(0) {
                return Err(Error::config_field_invalid(
                    format!("hosts.{name}.max_running_jobs"),
                    "must be at least 1",
                ));
            }
        }
        Ok(())
    }

    /// Expanded engine workdir
    pub fn workdir(&self) -> PathBuf {
        expand_path(Path::new(&self.engine.workdir))
    }

    /// Look up a host by name
    pub fn host(&self, name: &str) -> Result<&HostConfig> {
        self.hosts.get(name).ok_or_else(|| Error::unknown_host(name))
    }

    /// Effective admission window for a host
    pub fn max_running_jobs(&self, host: &HostConfig) -> usize {
        host.max_running_jobs.unwrap_or(self.engine.max_running_jobs)
    }
}

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    match shellexpand::full(text.as_ref()) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.hosts.contains_key("localhost"));
        assert_eq!(config.engine.default_queue, "localhost");
    }

    #[test]
    fn test_load_explicit_missing_file_errors() {
        let err = Config::load(Some(Path::new("/nonexistent/taskmill.toml"))).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_load_parses_hosts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[engine]
default_queue = "ts"
max_running_jobs = 3

[hosts.ts]
kind = "batch"

[hosts.ts.batch]
submit_cmd = "ts sh {script}"
status_cmd = "ts"
kill_cmd = "ts -k {job_id}"
capacity = 2

[hosts.ts.batch.status_map]
queued = "submitted"
running = "running"
finished = "completed"

[hosts.docker]
kind = "container"

[hosts.docker.container]
image = "ubuntu:22.04"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.engine.default_queue, "ts");
        assert_eq!(config.engine.max_running_jobs, 3);
        let ts = config.host("ts").unwrap();
        assert_eq!(ts.kind, "batch");
        assert_eq!(ts.batch.capacity, Some(2));
        assert_eq!(ts.batch.status_map.get("running").unwrap(), "running");
        assert!(config.host("docker").is_ok());
        assert!(config.host("nope").is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_kind() {
        let mut config = Config::default();
        config
            .hosts
            .insert("weird".into(), HostConfig { kind: "quantum".into(), ..Default::default() });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("quantum"));
    }

    #[test]
    fn test_validate_accepts_kind_aliases() {
        let mut config = Config::default();
        let mut docker = HostConfig { kind: "docker".into(), ..Default::default() };
        docker.container.image = "alpine:3".into();
        config.hosts.insert("docker".into(), docker);

        let mut spooler = HostConfig { kind: "spooler".into(), ..Default::default() };
        spooler.batch.submit_cmd = "ts sh {script}".into();
        spooler.batch.status_cmd = "ts -s {job_id}".into();
        config.hosts.insert("spooler".into(), spooler);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_default_queue() {
        let mut config = Config::default();
        config.engine.default_queue = "missing".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_batch_requires_commands() {
        let mut config = Config::default();
        config
            .hosts
            .insert("pbs".into(), HostConfig { kind: "batch".into(), ..Default::default() });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_init_writes_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        let written = Config::init(Some(&path)).unwrap();
        assert!(written.exists());
        let reloaded = Config::load(Some(&written)).unwrap();
        assert!(reloaded.validate().is_ok());
    }
}
