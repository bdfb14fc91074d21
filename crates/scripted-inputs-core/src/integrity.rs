//! Integrity Guard: scripts only run if their content matches a trusted
//! SHA-512 baseline.
//!
//! The baseline ([`IntegrityRecord`]) is built once at startup and is
//! read-only afterwards; the guard hashes the file again before every run.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha512};
use tracing::warn;

use crate::error::{ConfigError, IntegrityError};

const HASH_CHUNK: usize = 8 * 1024;

/// Trusted mapping of script name to lowercase SHA-512 hex digest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityRecord {
    digests: BTreeMap<String, String>,
}

impl IntegrityRecord {
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let digests = entries
            .into_iter()
            .map(|(name, digest)| (name.into(), digest.as_ref().trim().to_ascii_lowercase()))
            .collect();
        Self { digests }
    }

    /// Parse a YAML mapping of `name: digest`.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let digests: BTreeMap<String, String> =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Ok(Self::from_entries(digests))
    }

    /// Hash every regular file directly under `root`. Meant to run once at
    /// startup against a root the operator trusts.
    pub fn baseline_from_dir(root: &Path) -> io::Result<Self> {
        let mut digests = BTreeMap::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let digest = sha512_file(&entry.path())?;
            digests.insert(name, digest);
        }
        Ok(Self { digests })
    }

    #[must_use]
    pub fn digest(&self, name: &str) -> Option<&str> {
        self.digests.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.digests.contains_key(name)
    }

    /// Registered script names, sorted.
    #[must_use]
    pub fn available_scripts(&self) -> Vec<String> {
        self.digests.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// Stream a file through SHA-512 and return the lowercase hex digest.
pub fn sha512_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buf = [0u8; HASH_CHUNK];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Resolves script names under a fixed root and checks them against the
/// baseline before execution.
#[derive(Debug, Clone)]
pub struct IntegrityGuard {
    root: PathBuf,
    record: Arc<IntegrityRecord>,
}

impl IntegrityGuard {
    pub fn new(root: impl Into<PathBuf>, record: Arc<IntegrityRecord>) -> Self {
        Self {
            root: root.into(),
            record,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn record(&self) -> &IntegrityRecord {
        &self.record
    }

    /// Path of `name` under the scripts root. Only plain file names are
    /// accepted, and symlinks may not lead outside the root.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, IntegrityError> {
        let mut components = Path::new(name).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if name.is_empty() || !plain {
            return Err(IntegrityError::InvalidName(name.to_string()));
        }

        let candidate = self.root.join(name);
        let unreadable = |source| IntegrityError::Unreadable {
            path: candidate.clone(),
            source,
        };
        let root = self.root.canonicalize().map_err(unreadable)?;
        let resolved = candidate.canonicalize().map_err(unreadable)?;
        if !resolved.starts_with(&root) {
            return Err(IntegrityError::OutsideRoot {
                name: name.to_string(),
                root,
            });
        }
        Ok(resolved)
    }

    /// Hash the script and compare it with the registered digest.
    pub fn check(&self, name: &str) -> Result<PathBuf, IntegrityError> {
        let expected = self
            .record
            .digest(name)
            .ok_or_else(|| IntegrityError::NotRegistered(name.to_string()))?;
        let path = self.resolve(name)?;
        let actual = sha512_file(&path).map_err(|source| IntegrityError::Unreadable {
            path: path.clone(),
            source,
        })?;
        if actual != expected {
            return Err(IntegrityError::DigestMismatch {
                name: name.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(path)
    }

    /// Fail-closed gate: `false` on mismatch or any read error.
    pub fn verify(&self, name: &str) -> bool {
        match self.check(name) {
            Ok(_) => true,
            Err(err) => {
                warn!(script_name = name, error = %err, "Script integrity check failed");
                false
            }
        }
    }
}
