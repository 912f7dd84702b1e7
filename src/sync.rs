//! File sync protocol: staging files onto the host, retrieving them back
//!
//! Tasks see the execution host through a mapped directory tree. Before
//! submission every `to_host` entry is copied to its mapped destination;
//! after completion declared outputs (minus remote-only ones) and
//! `from_host` entries are copied back. Two policies here are deliberate,
//! not incidental: symlinks stage as symlinks, and path mapping falls back
//! to case-insensitive lookup when mapping metadata was recorded in a
//! different case than the filesystem holds.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, trace};

use crate::config::PathMapRule;
use crate::error::{Error, Result};
use crate::task::TaskSpec;

// ─────────────────────────────────────────────────────────────────
// Path Mapping
// ─────────────────────────────────────────────────────────────────

/// Maps local paths into a host's staging tree
#[derive(Debug, Clone)]
pub struct PathMapper {
    rules: Vec<PathMapRule>,
    /// Fallback root: unmatched paths land under here
    host_root: PathBuf,
}

impl PathMapper {
    pub fn new(rules: Vec<PathMapRule>, host_root: impl Into<PathBuf>) -> Self {
        let mut rules = rules;
        // Longest local prefix first
        rules.sort_by_key(|r| std::cmp::Reverse(r.local.components().count()));
        Self {
            rules,
            host_root: host_root.into(),
        }
    }

    /// Root of the host staging tree
    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    /// Map a local path to its host-side location.
    ///
    /// Rules are tried by longest local prefix, first with an exact
    /// component match and then case-insensitively. Unmatched relative
    /// paths land directly under the host root; unmatched absolute paths
    /// are re-rooted there with their leading separators stripped.
    pub fn map(&self, local: &Path) -> PathBuf {
        for rule in &self.rules {
            if let Some(rest) = strip_prefix_components(local, &rule.local, false) {
                return rule.remote.join(rest);
            }
        }
        for rule in &self.rules {
            if let Some(rest) = strip_prefix_components(local, &rule.local, true) {
                return rule.remote.join(rest);
            }
        }
        self.host_root.join(strip_root(local))
    }
}

/// Strip `prefix` from `path` component-wise. With `case_insensitive`
/// set, component names compare case-folded.
fn strip_prefix_components(path: &Path, prefix: &Path, case_insensitive: bool) -> Option<PathBuf> {
    let mut path_iter = path.components();
    for want in prefix.components() {
        let got = path_iter.next()?;
        let matches = if case_insensitive {
            component_str(&got).to_lowercase() == component_str(&want).to_lowercase()
        } else {
            got == want
        };
        if !matches {
            return None;
        }
    }
    Some(path_iter.as_path().to_path_buf())
}

fn component_str(component: &Component) -> String {
    component.as_os_str().to_string_lossy().into_owned()
}

/// Drop root/prefix components so an absolute path can be re-rooted
fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Resolve a path that may have been recorded in a different case than
/// the filesystem holds. Walks the path component by component; whenever
/// an exact entry is missing, a unique case-insensitive match is taken.
pub fn resolve_case_insensitive(path: &Path) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }

    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                if candidate.exists() {
                    resolved = candidate;
                    continue;
                }
                let wanted = name.to_string_lossy().to_lowercase();
                let entries = fs::read_dir(if resolved.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    &resolved
                })
                .ok()?;
                let mut matched = None;
                for entry in entries.flatten() {
                    if entry.file_name().to_string_lossy().to_lowercase() == wanted {
                        matched = Some(entry.file_name());
                        break;
                    }
                }
                resolved = resolved.join(matched?);
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved.exists().then_some(resolved)
}

// ─────────────────────────────────────────────────────────────────
// Copy Primitives
// ─────────────────────────────────────────────────────────────────

/// Copy one filesystem entry, preserving symlinks and recursing into
/// directories. A symlink to file F stages as a symlink, not a
/// dereferenced copy.
fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let meta = fs::symlink_metadata(src).map_err(|e| Error::IoRead {
        path: src.to_path_buf(),
        source: e,
    })?;

    if meta.file_type().is_symlink() {
        let target = fs::read_link(src).map_err(|e| Error::IoRead {
            path: src.to_path_buf(),
            source: e,
        })?;
        if dst.symlink_metadata().is_ok() {
            fs::remove_file(dst).map_err(|e| Error::IoWrite {
                path: dst.to_path_buf(),
                source: e,
            })?;
        }
        make_symlink(&target, dst)?;
        trace!(src = %src.display(), dst = %dst.display(), "Staged symlink");
    } else if meta.is_dir() {
        fs::create_dir_all(dst).map_err(|e| Error::IoWrite {
            path: dst.to_path_buf(),
            source: e,
        })?;
        for entry in fs::read_dir(src).map_err(|e| Error::IoRead {
            path: src.to_path_buf(),
            source: e,
        })? {
            let entry = entry.map_err(|e| Error::IoRead {
                path: src.to_path_buf(),
                source: e,
            })?;
            copy_entry(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst).map_err(|e| Error::IoWrite {
            path: dst.to_path_buf(),
            source: e,
        })?;
        trace!(src = %src.display(), dst = %dst.display(), "Staged file");
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| Error::IoWrite {
        path: link.to_path_buf(),
        source: e,
    })
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    // No symlink support: fall back to a content copy
    fs::copy(target, link).map_err(|e| Error::IoWrite {
        path: link.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// File Sync
// ─────────────────────────────────────────────────────────────────

/// Bidirectional file transfer for one host
pub struct FileSync {
    mapper: PathMapper,
}

impl FileSync {
    pub fn new(mapper: PathMapper) -> Self {
        Self { mapper }
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// Stage a task's inputs onto the host. Returns the host-side paths.
    /// Re-running for an unchanged task produces no observable difference.
    pub fn stage(&self, task: &TaskSpec) -> Result<Vec<PathBuf>> {
        let fingerprint = task.fingerprint();
        let mut staged = Vec::new();

        for map in task.staged_inputs() {
            let source = resolve_case_insensitive(&map.source).ok_or_else(|| Error::Staging {
                fingerprint: fingerprint.clone(),
                message: format!("missing required input '{}'", map.source.display()),
            })?;
            let dest = self.mapper.map(&map.dest);
            copy_entry(&source, &dest)?;
            staged.push(dest);
        }

        debug!(fingerprint = %fingerprint, count = staged.len(), "Inputs staged");
        Ok(staged)
    }

    /// Retrieve a task's outputs from the host. Remote-only outputs are
    /// asserted on the host but never copied back. Returns the local paths
    /// that were fetched.
    pub fn retrieve(&self, task: &TaskSpec) -> Result<Vec<PathBuf>> {
        let mut fetched = Vec::new();

        for map in task.retrieved_outputs() {
            let remote = self.mapper.map(&map.source);
            let remote = resolve_case_insensitive(&remote)
                .ok_or_else(|| Error::OutputMissing { path: map.dest.clone() })?;
            copy_entry(&remote, &map.dest)?;
            fetched.push(map.dest.clone());
        }

        for output in task.remote_only_outputs() {
            let remote = self.mapper.map(&output.path);
            if resolve_case_insensitive(&remote).is_none() {
                return Err(Error::OutputMissing {
                    path: output.path.clone(),
                });
            }
        }

        debug!(fingerprint = %task.fingerprint(), count = fetched.len(), "Outputs retrieved");
        Ok(fetched)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FileMap, OutputTarget};
    use tempfile::TempDir;

    #[test]
    fn test_mapper_longest_prefix_wins() {
        let mapper = PathMapper::new(
            vec![
                PathMapRule {
                    local: "/data".into(),
                    remote: "/remote/data".into(),
                },
                PathMapRule {
                    local: "/data/deep".into(),
                    remote: "/remote/deep".into(),
                },
            ],
            "/remote/root",
        );
        assert_eq!(mapper.map(Path::new("/data/a.txt")), PathBuf::from("/remote/data/a.txt"));
        assert_eq!(
            mapper.map(Path::new("/data/deep/a.txt")),
            PathBuf::from("/remote/deep/a.txt")
        );
    }

    #[test]
    fn test_mapper_case_insensitive_fallback() {
        let mapper = PathMapper::new(
            vec![PathMapRule {
                local: "/Users/me".into(),
                remote: "/home/me".into(),
            }],
            "/remote/root",
        );
        // Recorded in a different case than the rule
        assert_eq!(
            mapper.map(Path::new("/USERS/ME/file.txt")),
            PathBuf::from("/home/me/file.txt")
        );
    }

    #[test]
    fn test_mapper_unmatched_paths_reroot() {
        let mapper = PathMapper::new(vec![], "/remote/root");
        assert_eq!(mapper.map(Path::new("rel/a.txt")), PathBuf::from("/remote/root/rel/a.txt"));
        assert_eq!(mapper.map(Path::new("/abs/b.txt")), PathBuf::from("/remote/root/abs/b.txt"));
    }

    #[test]
    fn test_resolve_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("tt1.py");
        fs::write(&real, "content").unwrap();

        let upper = dir.path().join("TT1.PY");
        let resolved = resolve_case_insensitive(&upper).unwrap();
        assert_eq!(resolved, real);

        assert!(resolve_case_insensitive(&dir.path().join("missing.py")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_stage_preserves_symlinks() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("local");
        let host = dir.path().join("host");
        fs::create_dir_all(&local).unwrap();

        let target = local.join("ttt.py");
        fs::write(&target, "something").unwrap();
        let link = local.join("llink");
        std::os::unix::fs::symlink("ttt.py", &link).unwrap();

        let mut task = TaskSpec::from_command("stat llink");
        task.to_host.push(FileMap::identity(&target));
        task.to_host.push(FileMap::identity(&link));

        let sync = FileSync::new(PathMapper::new(vec![], &host));
        sync.stage(&task).unwrap();

        let staged_link = sync.mapper().map(&link);
        let meta = fs::symlink_metadata(&staged_link).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(fs::read_link(&staged_link).unwrap(), PathBuf::from("ttt.py"));
    }

    #[test]
    fn test_stage_missing_input_is_staging_error() {
        let dir = TempDir::new().unwrap();
        let mut task = TaskSpec::from_command("cat gone.txt");
        task.inputs.push(dir.path().join("gone.txt"));

        let sync = FileSync::new(PathMapper::new(vec![], dir.path().join("host")));
        let err = sync.stage(&task).unwrap_err();
        assert!(matches!(err, Error::Staging { .. }));
    }

    #[test]
    fn test_stage_idempotent() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "payload").unwrap();

        let mut task = TaskSpec::from_command("cat a.txt");
        task.to_host.push(FileMap::identity(&input));

        let sync = FileSync::new(PathMapper::new(vec![], dir.path().join("host")));
        let first = sync.stage(&task).unwrap();
        let second = sync.stage(&task).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&first[0]).unwrap(), "payload");
    }

    #[test]
    fn test_retrieve_skips_remote_only_and_asserts_it() {
        let dir = TempDir::new().unwrap();
        let host = dir.path().join("host");
        let local_out = dir.path().join("test_file1.txt");
        let remote_only = dir.path().join("test_file.txt");

        let mut task = TaskSpec::from_command("emit files");
        task.outputs.push(OutputTarget::remote(&remote_only));
        task.outputs.push(OutputTarget::local(&local_out));

        let sync = FileSync::new(PathMapper::new(vec![], &host));

        // Backend produced both files on the host side
        let remote_local_out = sync.mapper().map(&local_out);
        fs::create_dir_all(remote_local_out.parent().unwrap()).unwrap();
        fs::write(&remote_local_out, "A file").unwrap();
        let remote_remote_only = sync.mapper().map(&remote_only);
        fs::write(&remote_remote_only, "A file").unwrap();

        sync.retrieve(&task).unwrap();

        assert!(local_out.is_file());
        // Remote-only output never materializes locally
        assert!(!remote_only.exists());
    }

    #[test]
    fn test_retrieve_missing_output_errors() {
        let dir = TempDir::new().unwrap();
        let mut task = TaskSpec::from_command("emit");
        task.outputs.push(OutputTarget::local(dir.path().join("never.txt")));

        let sync = FileSync::new(PathMapper::new(vec![], dir.path().join("host")));
        let err = sync.retrieve(&task).unwrap_err();
        assert!(matches!(err, Error::OutputMissing { .. }));
    }

    #[test]
    fn test_from_host_rename() {
        // to_host={'1.txt': '2.txt'}, from_host={'3.txt': '2.txt'}
        let dir = TempDir::new().unwrap();
        let host = dir.path().join("host");
        let one = dir.path().join("1.txt");
        let three = dir.path().join("3.txt");
        fs::write(&one, "1\n").unwrap();

        let mut task = TaskSpec::from_command("echo 2 >> 2.txt");
        task.to_host.push(FileMap::new(&one, dir.path().join("2.txt")));
        task.from_host.push(FileMap::new(dir.path().join("2.txt"), &three));

        let sync = FileSync::new(PathMapper::new(vec![], &host));
        sync.stage(&task).unwrap();

        // Simulate the task appending on the host side
        let remote_two = sync.mapper().map(&dir.path().join("2.txt"));
        let mut content = fs::read_to_string(&remote_two).unwrap();
        content.push_str("2\n");
        fs::write(&remote_two, content).unwrap();

        sync.retrieve(&task).unwrap();
        assert_eq!(fs::read_to_string(&three).unwrap(), "1\n2\n");
    }
}
