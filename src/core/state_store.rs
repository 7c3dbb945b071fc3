//! Durable canary state: one JSON document per canary, written atomically.
//!
//! The document carries the construction spec alongside the mutable snapshot
//! and a SHA-256 digest over both. A file whose digest does not match, or whose
//! spec disagrees with the active configuration, is refused rather than
//! reinterpreted.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canary::facade::{CanarySnapshot, CanarySpec};
use crate::core::errors::{CanaryError, Result};

/// On-disk schema version.
pub const STATE_VERSION: u32 = 1;

/// The persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCanary {
    pub version: u32,
    pub spec: CanarySpec,
    pub snapshot: CanarySnapshot,
    /// Hex SHA-256 over the canonical JSON of `version`, `spec`, `snapshot`.
    pub digest: String,
}

#[derive(Serialize)]
struct DigestBody<'a> {
    version: u32,
    spec: &'a CanarySpec,
    snapshot: &'a CanarySnapshot,
}

impl PersistedCanary {
    /// Wrap `spec` and `snapshot` with the current version and a fresh digest.
    pub fn seal(spec: CanarySpec, snapshot: CanarySnapshot) -> Result<Self> {
        let digest = compute_digest(STATE_VERSION, &spec, &snapshot)?;
        Ok(Self {
            version: STATE_VERSION,
            spec,
            snapshot,
            digest,
        })
    }

    fn verify(&self, path: &Path) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(CanaryError::StateCorrupt {
                path: path.to_path_buf(),
                details: format!(
                    "unsupported state version {} (expected {STATE_VERSION})",
                    self.version
                ),
            });
        }
        let expected = compute_digest(self.version, &self.spec, &self.snapshot)?;
        if expected != self.digest {
            return Err(CanaryError::StateCorrupt {
                path: path.to_path_buf(),
                details: "digest mismatch".to_string(),
            });
        }
        Ok(())
    }
}

fn compute_digest(version: u32, spec: &CanarySpec, snapshot: &CanarySnapshot) -> Result<String> {
    let body = serde_json::to_vec(&DigestBody {
        version,
        spec,
        snapshot,
    })?;
    Ok(format!("{:x}", Sha256::digest(&body)))
}

/// Exclusive advisory lock over a state file, released on drop.
#[derive(Debug)]
pub struct StateLock {
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<File>,
    path: PathBuf,
}

impl StateLock {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn acquire_lock(file: File, path: PathBuf) -> Result<StateLock> {
    #[allow(deprecated)]
    let flock = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive).map_err(
        |(_file, e)| CanaryError::Runtime {
            details: format!("failed to lock {}: {e}", path.display()),
        },
    )?;
    Ok(StateLock {
        _flock: flock,
        path,
    })
}

#[cfg(not(unix))]
fn acquire_lock(file: File, path: PathBuf) -> Result<StateLock> {
    drop(file);
    Ok(StateLock { path })
}

/// File-backed store for a single canary.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Serialize load-modify-store cycles across processes.
    pub fn lock(&self) -> Result<StateLock> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| CanaryError::io(parent, e))?;
        }

        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o600);
        }
        let file = opts
            .open(&lock_path)
            .map_err(|e| CanaryError::io(&lock_path, e))?;

        acquire_lock(file, lock_path)
    }

    /// Read and verify the raw document. `Ok(None)` when no state exists yet.
    pub fn load_raw(&self) -> Result<Option<PersistedCanary>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| CanaryError::io(&self.path, e))?;
        let doc: PersistedCanary =
            serde_json::from_str(&raw).map_err(|e| CanaryError::StateCorrupt {
                path: self.path.clone(),
                details: format!("unparseable state: {e}"),
            })?;
        doc.verify(&self.path)?;
        Ok(Some(doc))
    }

    /// Load the snapshot for the canary described by `expected`.
    ///
    /// A stored canary built from a different spec is refused.
    pub fn load(&self, expected: &CanarySpec) -> Result<Option<CanarySnapshot>> {
        let Some(doc) = self.load_raw()? else {
            return Ok(None);
        };
        if &doc.spec != expected {
            return Err(CanaryError::StateCorrupt {
                path: self.path.clone(),
                details: format!(
                    "stored canary {:?} was built from a different configuration; \
                     re-run `canary init --force` to hatch a new one",
                    doc.spec.name
                ),
            });
        }
        Ok(Some(doc.snapshot))
    }

    /// Persist `snapshot` using tmp-file + fsync + rename.
    pub fn store(&self, spec: &CanarySpec, snapshot: &CanarySnapshot) -> Result<()> {
        let doc = PersistedCanary::seal(spec.clone(), snapshot.clone())?;
        let json = serde_json::to_string_pretty(&doc)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| CanaryError::io(parent, e))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let result = (|| {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                opts.mode(0o600);
            }
            let mut file = opts.open(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp_path, &self.path)
        })();

        if let Err(source) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(CanaryError::io(&self.path, source));
        }
        Ok(())
    }

    /// Delete the stored canary. Missing files are fine.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CanaryError::io(&self.path, e)),
        }
    }
}
