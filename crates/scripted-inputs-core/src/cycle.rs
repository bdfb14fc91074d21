//! One Cycle: a supervised script process wired into a decoder task.
//!
//! A running cycle owns two tasks. The process-wait task races process exit
//! against cancellation and stops the process when cancelled. The decoder
//! task reads the output pipe until every writer has closed it.

use std::sync::Arc;

use serde::Serialize;
use tokio::net::unix::pipe;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::config::JobSettings;
use crate::decoder::{DecodeSummary, StreamDecoder};
use crate::integrity::IntegrityGuard;
use crate::stats::JobStats;
use crate::supervisor::{ProcessState, ProcessSupervisor, StartOutcome, SupervisorOptions};

/// Everything a cycle needs that outlives it.
#[derive(Clone)]
pub struct CycleContext {
    pub settings: Arc<JobSettings>,
    pub guard: IntegrityGuard,
    pub decoder: StreamDecoder,
    pub options: SupervisorOptions,
    pub stats: Arc<JobStats>,
}

pub enum CycleLaunch {
    Running(Cycle),
    /// Integrity gate refused the script.
    Skipped,
    /// Pipe or spawn failure.
    Failed,
}

impl CycleLaunch {
    #[must_use]
    pub fn into_running(self) -> Option<Cycle> {
        match self {
            Self::Running(cycle) => Some(cycle),
            Self::Skipped | Self::Failed => None,
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub generation: u64,
    /// The process was still running when shutdown was requested.
    pub preempted: bool,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub summary: DecodeSummary,
}

pub struct Cycle {
    generation: u64,
    supervisor: ProcessSupervisor,
    stats: Arc<JobStats>,
    cancel_tx: watch::Sender<bool>,
    wait_task: JoinHandle<()>,
    decoder_task: JoinHandle<DecodeSummary>,
    span: Span,
}

impl Cycle {
    /// Verify and start the script, then spawn the process-wait and
    /// decoder tasks. Never fails loudly: refused or failed launches are
    /// logged, counted, and reported as [`CycleLaunch::Skipped`] or
    /// [`CycleLaunch::Failed`].
    pub async fn launch(generation: u64, ctx: &CycleContext) -> CycleLaunch {
        let span = info_span!(
            "script_cycle",
            script_name = %ctx.settings.script_name,
            generation
        );
        Self::launch_in(generation, ctx, span.clone())
            .instrument(span)
            .await
    }

    async fn launch_in(generation: u64, ctx: &CycleContext, span: Span) -> CycleLaunch {
        let (writer, reader) = match pipe::pipe().and_then(|(tx, rx)| Ok((tx.into_blocking_fd()?, rx))) {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "Failed to create output pipe");
                ctx.stats.record_launch_failure();
                return CycleLaunch::Failed;
            }
        };

        let supervisor = ProcessSupervisor::new(
            ctx.guard.clone(),
            ctx.settings.script_name.clone(),
            ctx.options.clone(),
        );
        let working_dir = ctx.settings.working_dir.as_deref();
        match supervisor.start(working_dir, &ctx.settings.args, writer).await {
            Ok(StartOutcome::Started) => ctx.stats.record_cycle_started(),
            Ok(StartOutcome::Skipped(_)) => {
                ctx.stats.record_cycle_skipped();
                return CycleLaunch::Skipped;
            }
            Err(err) => {
                error!(error = %err, "Failed to start script");
                ctx.stats.record_launch_failure();
                return CycleLaunch::Failed;
            }
        }

        let decoder = ctx.decoder.clone();
        let decoder_task = tokio::spawn(
            async move { decoder.run(reader).await }.instrument(span.clone()),
        );

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let waiter = supervisor.clone();
        let stats = Arc::clone(&ctx.stats);
        let wait_task = tokio::spawn(
            async move {
                let mut done = waiter.done();
                tokio::select! {
                    () = done.wait() => {
                        debug!(exit_code = ?waiter.exit_code(), "Script finished");
                    }
                    _ = cancel_rx.changed() => {
                        if let Err(err) = waiter.stop(None).await {
                            error!(error = %err, "Failed to stop script");
                        }
                        if waiter.state() == ProcessState::Killed {
                            stats.record_forced_kill();
                        }
                    }
                }
            }
            .instrument(span.clone()),
        );

        CycleLaunch::Running(Self {
            generation,
            supervisor,
            stats: Arc::clone(&ctx.stats),
            cancel_tx,
            wait_task,
            decoder_task,
            span,
        })
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Both tasks have returned: the process is reaped and the decoder saw
    /// end-of-stream.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.wait_task.is_finished() && self.decoder_task.is_finished()
    }

    /// Stop the process if it is still running and drain the decoder.
    /// Returns once nothing of this cycle is left running.
    pub async fn shutdown(self) -> CycleReport {
        let span = self.span.clone();
        self.shutdown_in().instrument(span).await
    }

    async fn shutdown_in(mut self) -> CycleReport {
        let preempted = self.supervisor.is_running();
        if preempted {
            info!("Script still running; stopping it");
            self.stats.record_preempted();
        }

        self.cancel_tx.send_replace(true);
        if let Err(err) = (&mut self.wait_task).await {
            error!(error = %err, "Process-wait task failed");
        }

        if !self.decoder_task.is_finished() {
            if let Err(err) = self.supervisor.sweep_group() {
                warn!(error = %err, "Failed to kill leftover script processes");
            }
        }

        let linger = self.supervisor.graceful_timeout();
        let summary = match tokio::time::timeout(linger, &mut self.decoder_task).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(err)) => {
                error!(error = %err, "Decoder task failed");
                DecodeSummary::default()
            }
            Err(_) => {
                warn!("Output pipe held open outside the script's process group; abandoning reader");
                self.decoder_task.abort();
                DecodeSummary::default()
            }
        };

        let report = CycleReport {
            generation: self.generation,
            preempted,
            state: self.supervisor.state(),
            exit_code: self.supervisor.exit_code(),
            summary,
        };
        debug!(?report, "Cycle drained");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptJobConfig;
    use crate::decode::Encoding;
    use crate::integrity::IntegrityRecord;
    use crate::sink::MemorySink;
    use std::time::Duration;

    fn context(body: &str) -> (tempfile::TempDir, CycleContext, MemorySink) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job.sh"), body).unwrap();
        let record = IntegrityRecord::baseline_from_dir(dir.path()).unwrap();
        let settings = ScriptJobConfig::for_script("job.sh").validate(&record).unwrap();
        let guard = IntegrityGuard::new(dir.path(), Arc::new(record));
        let sink = MemorySink::new();
        let stats = Arc::new(JobStats::new());
        let decoder = StreamDecoder::new(
            settings.framing.clone(),
            settings.max_log_size,
            Arc::new(Encoding::Utf8),
            Arc::new(sink.clone()),
            Arc::clone(&stats),
        );
        let ctx = CycleContext {
            settings: Arc::new(settings),
            guard,
            decoder,
            options: SupervisorOptions {
                graceful_timeout: Duration::from_millis(300),
                ..SupervisorOptions::default()
            },
            stats,
        };
        (dir, ctx, sink)
    }

    #[tokio::test]
    async fn finished_cycle_reports_output() {
        let (_dir, ctx, sink) = context("echo hello\n");
        let cycle = Cycle::launch(1, &ctx).await.into_running().unwrap();
        cycle.supervisor().done().wait().await;

        let report = cycle.shutdown().await;
        assert!(!report.preempted);
        assert_eq!(report.state, ProcessState::Exited);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.summary.frames_emitted, 1);
        assert_eq!(sink.records()[0].body, "hello\n");
    }

    #[tokio::test]
    async fn shutdown_preempts_running_script() {
        let (_dir, ctx, _sink) = context("sleep 30\n");
        let cycle = Cycle::launch(7, &ctx).await.into_running().unwrap();
        assert_eq!(cycle.generation(), 7);
        assert!(!cycle.is_finished());

        let report = cycle.shutdown().await;
        assert!(report.preempted);
        assert!(report.state.is_terminal());
        assert_eq!(ctx.stats.snapshot().cycles_preempted, 1);
    }

    #[tokio::test]
    async fn background_child_does_not_block_drain() {
        let (_dir, ctx, sink) = context("echo parent\n(sleep 30; echo late) &\n");
        let cycle = Cycle::launch(1, &ctx).await.into_running().unwrap();
        cycle.supervisor().done().wait().await;

        let report = tokio::time::timeout(Duration::from_secs(5), cycle.shutdown())
            .await
            .expect("drain must not wait for the background child");
        assert_eq!(report.state, ProcessState::Exited);
        assert!(sink.records()[0].body.starts_with("parent"));
    }

    #[tokio::test]
    async fn tampered_script_is_skipped_and_counted() {
        let (dir, ctx, sink) = context("echo ok\n");
        std::fs::write(dir.path().join("job.sh"), "echo tampered\n").unwrap();

        assert!(matches!(Cycle::launch(1, &ctx).await, CycleLaunch::Skipped));
        assert_eq!(ctx.stats.snapshot().cycles_skipped, 1);
        assert!(sink.is_empty());
    }
}
