//! scripted-inputs-core: scripted collection for host telemetry
//!
//! Runs a trusted host script on a fixed interval and turns its output into
//! records for a downstream sink.
//!
//! # Architecture
//!
//! ```text
//! Scheduler ──tick──▶ Cycle ──▶ Integrity Guard ──ok──▶ Process Supervisor
//!                       │                                   │ stdout+stderr
//!                       └──────────── Stream Decoder ◀──pipe┘
//!                                          │
//!                                          ▼
//!                                      RecordSink
//! ```
//!
//! # Modules
//!
//! - `config`: job configuration and validation
//! - `integrity`: SHA-512 baseline and pre-execution gate
//! - `supervisor`: process start, watch, and SIGTERM/SIGKILL stop (unix)
//! - `framing`: incremental frame splitting
//! - `decode`: text decoders for configured encodings
//! - `decoder`: frame reader and record emission
//! - `sink`: output records and sinks
//! - `cycle`: one supervised run wired to its decoder (unix)
//! - `scheduler`: fixed-interval job loop (unix)
//! - `stats`: skipped-cycle and dropped-frame counters
//! - `logging`: tracing subscriber setup
//! - `environment`: container detection
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
#[cfg(unix)]
pub mod cycle;
pub mod decode;
pub mod decoder;
pub mod environment;
pub mod error;
pub mod framing;
pub mod integrity;
pub mod logging;
#[cfg(unix)]
pub mod scheduler;
pub mod sink;
pub mod stats;
#[cfg(unix)]
pub mod supervisor;

pub use config::{JobSettings, ScriptJobConfig};
pub use decode::{Encoding, TextDecoder};
pub use error::{Error, Result};
pub use integrity::{IntegrityGuard, IntegrityRecord};
#[cfg(unix)]
pub use scheduler::{JobHandle, ScriptJob};
pub use sink::{OutputRecord, RecordSink};
pub use stats::JobStatsSnapshot;
#[cfg(unix)]
pub use supervisor::{ProcessState, ProcessSupervisor, StartOutcome};
