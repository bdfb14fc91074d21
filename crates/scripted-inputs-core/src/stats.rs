//! Per-job counters for skipped cycles and dropped frames.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters shared by the scheduler, cycles and decoder tasks.
#[derive(Debug, Default)]
pub struct JobStats {
    cycles_started: AtomicU64,
    cycles_skipped: AtomicU64,
    launch_failures: AtomicU64,
    cycles_preempted: AtomicU64,
    forced_kills: AtomicU64,
    frames_emitted: AtomicU64,
    frames_dropped: AtomicU64,
    frames_truncated: AtomicU64,
}

/// Point-in-time copy of [`JobStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatsSnapshot {
    /// Cycles whose process was spawned.
    pub cycles_started: u64,
    /// Cycles skipped by the integrity gate.
    pub cycles_skipped: u64,
    /// Cycles whose process failed to spawn.
    pub launch_failures: u64,
    /// Cycles still running when the next tick or shutdown arrived.
    pub cycles_preempted: u64,
    /// Processes that ignored SIGTERM and were SIGKILLed.
    pub forced_kills: u64,
    pub frames_emitted: u64,
    /// Frames lost to decode failures or the size limit.
    pub frames_dropped: u64,
    pub frames_truncated: u64,
}

impl JobStatsSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl JobStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle_started(&self) {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_launch_failure(&self) {
        self.launch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preempted(&self) {
        self.cycles_preempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_kill(&self) {
        self.forced_kills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_emitted(&self) {
        self.frames_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_truncated(&self) {
        self.frames_truncated.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> JobStatsSnapshot {
        JobStatsSnapshot {
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
            cycles_preempted: self.cycles_preempted.load(Ordering::Relaxed),
            forced_kills: self.forced_kills.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_truncated: self.frames_truncated.load(Ordering::Relaxed),
        }
    }
}
