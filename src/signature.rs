//! Signature store: skip-on-rerun bookkeeping
//!
//! A signature is the snapshot of a task's inputs, outputs and parameters
//! recorded after a successful run. At submission time a task is skippable
//! iff a signature exists, every declared local output still matches the
//! snapshot, and the signature mode allows skipping.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::task::TaskSpec;

/// Files larger than this are stamped by size+mtime instead of content hash
const HASH_SIZE_LIMIT: u64 = 64 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────
// File Stamps
// ─────────────────────────────────────────────────────────────────

/// Recorded identity of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    /// Hex SHA-256 of the content, when the file was small enough to hash
    #[serde(default)]
    pub content_hash: Option<String>,

    /// File size in bytes
    pub size: u64,

    /// Modification time, seconds since the epoch
    pub mtime: i64,
}

impl FileStamp {
    /// Capture the current stamp of a file
    pub fn capture(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let size = meta.len();
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let content_hash = if size <= HASH_SIZE_LIMIT {
            Some(hash_file(path)?)
        } else {
            None
        };

        Ok(Self {
            content_hash,
            size,
            mtime,
        })
    }

    /// Compare against another stamp. Content hashes win when both sides
    /// have one; otherwise size+mtime decide.
    pub fn matches(&self, other: &FileStamp) -> bool {
        match (&self.content_hash, &other.content_hash) {
            (Some(a), Some(b)) => a == b,
            _ => self.size == other.size && self.mtime == other.mtime,
        }
    }
}

/// Hex SHA-256 of a file's content
fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| Error::IoRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ─────────────────────────────────────────────────────────────────
// Signature
// ─────────────────────────────────────────────────────────────────

/// Snapshot recorded at the end of a successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub fingerprint: String,
    pub command: String,
    pub parameters: BTreeMap<String, String>,

    /// Stamps of declared inputs at record time
    pub inputs: BTreeMap<PathBuf, FileStamp>,

    /// Stamps of declared local outputs at record time
    pub outputs: BTreeMap<PathBuf, FileStamp>,

    pub recorded_at: DateTime<Utc>,
}

impl Signature {
    /// Capture a signature for a task whose local outputs are present.
    ///
    /// Inputs that no longer exist are simply omitted from the snapshot;
    /// a missing declared local output is an error (the caller verifies
    /// outputs before recording).
    pub fn capture(task: &TaskSpec) -> Result<Self> {
        let mut inputs = BTreeMap::new();
        for input in &task.inputs {
            if input.exists() {
                inputs.insert(input.clone(), FileStamp::capture(input)?);
            }
        }

        let mut outputs = BTreeMap::new();
        for output in task.local_outputs() {
            outputs.insert(output.path.clone(), FileStamp::capture(&output.path)?);
        }

        Ok(Self {
            fingerprint: task.fingerprint(),
            command: task.command.clone(),
            parameters: task.parameters.clone(),
            inputs,
            outputs,
            recorded_at: Utc::now(),
        })
    }

    /// Whether the snapshot still holds: every recorded output exists and
    /// matches, and every recorded input is unchanged. Any mismatch
    /// invalidates skippability (it is not an error).
    pub fn still_valid(&self) -> bool {
        for (path, recorded) in &self.outputs {
            let Ok(current) = FileStamp::capture(path) else {
                return false;
            };
            if !current.matches(recorded) {
                return false;
            }
        }
        for (path, recorded) in &self.inputs {
            let Ok(current) = FileStamp::capture(path) else {
                return false;
            };
            if !current.matches(recorded) {
                return false;
            }
        }
        true
    }
}

// ─────────────────────────────────────────────────────────────────
// Signature Store
// ─────────────────────────────────────────────────────────────────

/// One signature record per task fingerprint, stored as JSON files
pub struct SignatureStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl SignatureStore {
    /// Open (and create) the signature directory
    pub fn open(workdir: &Path) -> Result<Self> {
        let root = workdir.join("signatures");
        fs::create_dir_all(&root).map_err(|e| Error::IoWrite {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn signature_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{fingerprint}.json"))
    }

    /// Look up the recorded signature for a fingerprint
    pub fn lookup(&self, fingerprint: &str) -> Result<Option<Signature>> {
        let path = self.signature_path(fingerprint);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::IoRead { path, source: e }),
        };
        let sig =
            serde_json::from_str(&text).map_err(|e| Error::SignatureCorrupt { path, source: e })?;
        Ok(Some(sig))
    }

    /// Record a signature. Called only after a task reached `completed`
    /// with all local outputs verified present.
    pub fn record(&self, signature: &Signature) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self.signature_path(&signature.fingerprint);
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(signature)
            .map_err(|e| Error::Internal(format!("failed to encode signature: {e}")))?;
        fs::write(&tmp, text).map_err(|e| Error::IoWrite {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| Error::IoWrite { path, source: e })?;
        debug!(fingerprint = %signature.fingerprint, "Signature recorded");
        Ok(())
    }

    /// Drop a recorded signature. Returns whether one existed.
    pub fn invalidate(&self, fingerprint: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = self.signature_path(fingerprint);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(fingerprint = %fingerprint, "Signature invalidated");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::IoWrite { path, source: e }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
