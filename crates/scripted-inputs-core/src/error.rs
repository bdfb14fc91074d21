//! Error types for scripted-inputs-core
//!
//! Only [`ConfigError`] ever reaches the caller that builds a job. The other
//! kinds are handled where they occur: logged, counted, and the cycle or
//! frame is skipped so the scheduling loop keeps running.

use std::fmt::Write;
use std::path::PathBuf;
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for scripted-inputs-core
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid job configuration
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Script failed its integrity check
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// Script process could not be started
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    /// Script process could not be signalled
    #[error("Termination error: {0}")]
    Termination(#[from] TerminationError),

    /// Output frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Runtime errors (task join failures, closed channels)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Integrity(err) => Some(err.remediation()),
            Self::Launch(_) => Some(
                Remediation::new("Check that the interpreter exists and the scripts root is readable.")
                    .alternative("Set `interpreter` to an empty string to execute the script directly."),
            ),
            Self::Termination(_) => Some(
                Remediation::new("The script could not be signalled; check for processes left behind.")
                    .alternative("Inspect the process table for members of the script's process group."),
            ),
            Self::Decode(_) => Some(
                Remediation::new("Verify the `encoding` setting matches what the script writes.")
                    .alternative("Use `nop` to pass raw bytes through unchanged."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the scripts root exists and is readable."),
            ),
            Self::Runtime(_) => None,
        }
    }
}

/// Job configuration errors. Fatal at job construction.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("'script_name' must be specified")]
    MissingScriptName,

    #[error("unsupported 'script_name' {name:?}. must be one of {available:?}")]
    UnknownScript {
        name: String,
        available: Vec<String>,
    },

    #[error("invalid value for parameter 'max_log_size', must be equal to or greater than {min} bytes (got {actual})")]
    MaxLogSizeTooSmall { actual: u64, min: u64 },

    #[error("invalid value for parameter 'max_log_size': {0}")]
    InvalidByteSize(String),

    #[error("invalid 'collection_interval': {0}")]
    InvalidInterval(String),

    #[error("only one of 'line_start_pattern' or 'line_end_pattern' can be set")]
    ConflictingPatterns,

    #[error("invalid multiline pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unsupported encoding {0:?}")]
    UnsupportedEncoding(String),

    #[error("scripted inputs must be run directly on a host and are not supported in a container")]
    ContainerUnsupported,

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::MissingScriptName => Remediation::new("Set 'script_name' to one of the registered scripts."),
            Self::UnknownScript { available, .. } => Remediation::new(format!(
                "Pick a registered script: {}",
                available.join(", ")
            ))
            .alternative("Register the script in the integrity baseline before starting the job."),
            Self::MaxLogSizeTooSmall { min, .. } => {
                Remediation::new(format!("Raise 'max_log_size' to at least {min} bytes."))
                    .alternative("Remove 'max_log_size' to use the 1MiB default.")
            }
            Self::InvalidByteSize(_) => Remediation::new(
                "Use a byte count or a size with units such as 64KiB or 1MiB.",
            ),
            Self::InvalidInterval(_) => Remediation::new(
                "Use a positive duration with units, e.g. 30s, 5m or 1h30m.",
            ),
            Self::ConflictingPatterns => Remediation::new(
                "Keep either 'multiline.line_start_pattern' or 'multiline.line_end_pattern'.",
            ),
            Self::InvalidPattern { .. } => Remediation::new("Fix the regular expression syntax.")
                .alternative("Remove the 'multiline' block to emit one record per run."),
            Self::UnsupportedEncoding(_) => Remediation::new(
                "Use one of: utf-8, utf-16le, utf-16be, ascii, latin1, nop.",
            ),
            Self::ContainerUnsupported => Remediation::new(
                "Run the collector directly on the host.",
            )
            .alternative("Set 'refuse_in_container: false' to allow running in a container."),
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Verify {path} exists and is readable."))
            }
            Self::ParseFailed(_) => Remediation::new("Fix the YAML syntax and retry."),
        }
    }
}

/// Integrity gate failures. The cycle is skipped; the job stays scheduled.
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("script {0:?} has no registered digest")]
    NotRegistered(String),

    #[error("script name {0:?} is not a plain file name under the scripts root")]
    InvalidName(String),

    #[error("script {name:?} resolves outside the scripts root {root}")]
    OutsideRoot { name: String, root: PathBuf },

    #[error("failed to read script {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch for script {name:?}: expected {expected}, got {actual}")]
    DigestMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

impl IntegrityError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotRegistered(_) | Self::InvalidName(_) | Self::OutsideRoot { .. } => {
                Remediation::new("Only scripts registered under the scripts root can be executed.")
            }
            Self::Unreadable { path, .. } => {
                Remediation::new(format!("Check that {} exists and is readable.", path.display()))
            }
            Self::DigestMismatch { .. } => Remediation::new(
                "The script changed since the baseline was taken. Restore it or refresh the baseline.",
            ),
        }
    }
}

/// Process spawn failures. The cycle resolves immediately with no process.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("supervisor already started")]
    AlreadyStarted,

    #[error("failed to create output pipe: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("spawned process reported no pid")]
    MissingPid,

    #[error("integrity check task failed: {0}")]
    Join(String),
}

/// Signal delivery failures while stopping a process.
#[derive(Error, Debug)]
pub enum TerminationError {
    #[error("failed to send {signal} to process group {pgid}: {reason}")]
    Signal {
        signal: &'static str,
        pgid: u32,
        reason: String,
    },
}

/// A single frame could not be turned into text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid {encoding} input at byte {offset}")]
    InvalidByte {
        encoding: &'static str,
        offset: usize,
    },

    #[error("{encoding} input has odd length {len}")]
    OddLength { encoding: &'static str, len: usize },

    #[error("unpaired surrogate in {encoding} input")]
    UnpairedSurrogate { encoding: &'static str },
}
