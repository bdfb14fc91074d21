//! Shared test infrastructure for scripted-inputs-core integration tests.
//!
//! ```ignore
//! mod common;
//! use common::ScriptDir;
//! ```

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scripted_inputs_core::integrity::{IntegrityGuard, IntegrityRecord};

/// Scripts root in a temp directory, baselined after the scripts are written.
pub struct ScriptDir {
    dir: tempfile::TempDir,
    guard: IntegrityGuard,
}

impl ScriptDir {
    pub fn with_scripts(scripts: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, body) in scripts {
            std::fs::write(dir.path().join(name), body).expect("write script");
        }
        let record = IntegrityRecord::baseline_from_dir(dir.path()).expect("baseline");
        let guard = IntegrityGuard::new(dir.path(), Arc::new(record));
        Self { dir, guard }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn guard(&self) -> IntegrityGuard {
        self.guard.clone()
    }

    /// Rewrite a script after the baseline was taken.
    pub fn tamper(&self, name: &str, body: &str) {
        std::fs::write(self.dir.path().join(name), body).expect("tamper script");
    }
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
