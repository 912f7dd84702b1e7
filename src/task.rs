//! Task descriptor data model
//!
//! Defines the immutable specification of one unit of work: the command
//! script, declared inputs/outputs, file-staging maps and signature policy.
//! The workflow layer that produces these descriptors is out of scope; the
//! descriptor itself (and its TOML form) is owned here.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ─────────────────────────────────────────────────────────────────
// Signature Mode
// ─────────────────────────────────────────────────────────────────

/// Policy controlling whether a recorded signature causes skipping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigMode {
    /// Skip execution when the recorded signature still matches
    #[default]
    Default,
    /// Never skip; invalidate any recorded signature
    Force,
    /// Bypass signatures entirely (neither consulted nor recorded)
    Ignore,
    /// Build a fresh baseline from existing outputs without executing
    Build,
}

impl SigMode {
    /// Parse from a CLI string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "default" => Some(SigMode::Default),
            "force" => Some(SigMode::Force),
            "ignore" => Some(SigMode::Ignore),
            "build" => Some(SigMode::Build),
            _ => None,
        }
    }
}

impl std::fmt::Display for SigMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigMode::Default => write!(f, "default"),
            SigMode::Force => write!(f, "force"),
            SigMode::Ignore => write!(f, "ignore"),
            SigMode::Build => write!(f, "build"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// File Targets
// ─────────────────────────────────────────────────────────────────

/// One declared output of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    /// Declared path (local naming; mapped onto the host at staging time)
    pub path: PathBuf,

    /// Remote-only outputs must exist on the host but are never copied back
    #[serde(default)]
    pub remote_only: bool,
}

impl OutputTarget {
    /// Declare a regular (locally retrieved) output
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            remote_only: false,
        }
    }

    /// Declare a remote-only output
    pub fn remote(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            remote_only: true,
        }
    }
}

/// A source → destination pair for staging
///
/// When a task names only a source, the destination defaults to the same
/// relative path (identity mapping).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMap {
    pub source: PathBuf,
    pub dest: PathBuf,
}

impl FileMap {
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
        }
    }

    /// Identity mapping: source and destination share the path
    pub fn identity(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            dest: path,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Specification
// ─────────────────────────────────────────────────────────────────

/// Immutable specification of one unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    /// The shell command script to execute on the host
    pub command: String,

    /// Declared input files (ordered)
    pub inputs: Vec<PathBuf>,

    /// Declared output targets (ordered)
    pub outputs: Vec<OutputTarget>,

    /// Files staged onto the host before submission
    pub to_host: Vec<FileMap>,

    /// Files fetched from the host after completion (in addition to outputs)
    pub from_host: Vec<FileMap>,

    /// Queue (host) name this task is destined for; empty = default queue
    pub queue: String,

    /// Signature policy for this task
    pub sig_mode: SigMode,

    /// Parameter substitutions recorded for identity and signatures.
    /// BTreeMap keeps fingerprinting order-independent.
    pub parameters: BTreeMap<String, String>,

    /// Free-form tags for filtering and reporting
    pub tags: Vec<String>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            command: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            to_host: Vec::new(),
            from_host: Vec::new(),
            queue: String::new(),
            sig_mode: SigMode::Default,
            parameters: BTreeMap::new(),
            tags: Vec::new(),
        }
    }
}

impl TaskSpec {
    /// Create a task from a bare command
    pub fn from_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Stable identity of this task.
    ///
    /// Derived from the command text and the parameter set; the parameter
    /// map is iterated in key order so two tasks with identical parameters
    /// declared in different order share a fingerprint. Truncated to 32 hex
    /// characters for readable ids.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.command.as_bytes());
        for (key, value) in &self.parameters {
            hasher.update(b"\0");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }

    /// All files that must land on the host before submission:
    /// explicit `to_host` maps plus identity maps for declared inputs not
    /// already covered.
    pub fn staged_inputs(&self) -> Vec<FileMap> {
        let mut maps = self.to_host.clone();
        for input in &self.inputs {
            if !maps.iter().any(|m| &m.source == input) {
                maps.push(FileMap::identity(input.clone()));
            }
        }
        maps
    }

    /// All files fetched back after completion: explicit `from_host` maps
    /// plus identity maps for declared outputs that are not remote-only.
    pub fn retrieved_outputs(&self) -> Vec<FileMap> {
        let mut maps = self.from_host.clone();
        for output in &self.outputs {
            if output.remote_only {
                continue;
            }
            if !maps.iter().any(|m| m.source == output.path) {
                maps.push(FileMap::identity(output.path.clone()));
            }
        }
        maps
    }

    /// Declared outputs that stay on the host
    pub fn remote_only_outputs(&self) -> Vec<&OutputTarget> {
        self.outputs.iter().filter(|o| o.remote_only).collect()
    }

    /// Declared outputs expected on the local filesystem after retrieval
    pub fn local_outputs(&self) -> Vec<&OutputTarget> {
        self.outputs.iter().filter(|o| !o.remote_only).collect()
    }

    /// Load a task descriptor from a TOML file
    pub fn from_toml_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| crate::error::Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| crate::error::Error::ConfigParse {
            message: format!("invalid task file '{}'", path.display()),
            source: Some(e),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_mode_parse() {
        assert_eq!(SigMode::parse("default"), Some(SigMode::Default));
        assert_eq!(SigMode::parse("FORCE"), Some(SigMode::Force));
        assert_eq!(SigMode::parse("build"), Some(SigMode::Build));
        assert_eq!(SigMode::parse("bogus"), None);
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let mut a = TaskSpec::from_command("echo hi");
        a.parameters.insert("i".into(), "1".into());
        a.parameters.insert("j".into(), "2".into());

        let mut b = TaskSpec::from_command("echo hi");
        // Insertion order reversed; fingerprint must not change
        b.parameters.insert("j".into(), "2".into());
        b.parameters.insert("i".into(), "1".into());

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 32);
    }

    #[test]
    fn test_fingerprint_sensitive_to_command_and_params() {
        let a = TaskSpec::from_command("echo hi");
        let b = TaskSpec::from_command("echo ho");
        assert_ne!(a.fingerprint(), b.fingerprint());

        let mut c = TaskSpec::from_command("echo hi");
        c.parameters.insert("i".into(), "1".into());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_staged_inputs_identity_default() {
        let mut task = TaskSpec::from_command("cat a.txt");
        task.inputs.push("a.txt".into());
        let maps = task.staged_inputs();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].source, PathBuf::from("a.txt"));
        assert_eq!(maps[0].dest, PathBuf::from("a.txt"));
    }

    #[test]
    fn test_staged_inputs_respects_explicit_map() {
        let mut task = TaskSpec::from_command("cat b.txt");
        task.inputs.push("a.txt".into());
        task.to_host.push(FileMap::new("a.txt", "b.txt"));
        let maps = task.staged_inputs();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].dest, PathBuf::from("b.txt"));
    }

    #[test]
    fn test_retrieved_outputs_skips_remote_only() {
        let mut task = TaskSpec::from_command("touch x y");
        task.outputs.push(OutputTarget::local("x"));
        task.outputs.push(OutputTarget::remote("y"));
        let maps = task.retrieved_outputs();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].source, PathBuf::from("x"));
        assert_eq!(task.remote_only_outputs().len(), 1);
    }

    #[test]
    fn test_task_toml_roundtrip() {
        let toml_src = r#"
command = "echo hello > out.txt"
queue = "docker"
sig_mode = "force"

[[outputs]]
path = "out.txt"

[[to_host]]
source = "1.txt"
dest = "2.txt"
"#;
        let task: TaskSpec = toml::from_str(toml_src).unwrap();
        assert_eq!(task.queue, "docker");
        assert_eq!(task.sig_mode, SigMode::Force);
        assert_eq!(task.to_host[0].dest, PathBuf::from("2.txt"));
        assert!(!task.outputs[0].remote_only);
    }
}
