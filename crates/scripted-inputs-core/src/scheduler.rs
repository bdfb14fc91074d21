//! Cycle Scheduler: runs one script job on a fixed interval.
//!
//! At most one cycle is active. When a tick arrives while the previous
//! cycle is still running, that cycle is stopped and drained before the
//! next one starts, so sustained overruns slow the cadence down instead
//! of stacking processes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span};

use crate::config::{JobSettings, ScriptJobConfig};
use crate::cycle::{Cycle, CycleContext};
use crate::decode::TextDecoder;
use crate::decoder::StreamDecoder;
use crate::error::ConfigError;
use crate::integrity::IntegrityGuard;
use crate::sink::{RecordSink, SOURCE_ATTRIBUTE, SOURCETYPE_ATTRIBUTE};
use crate::stats::{JobStats, JobStatsSnapshot};
use crate::supervisor::SupervisorOptions;

/// A validated scripted job, ready to start.
pub struct ScriptJob {
    settings: Arc<JobSettings>,
    guard: IntegrityGuard,
    sink: Arc<dyn RecordSink>,
    text_decoder: Arc<dyn TextDecoder>,
    graceful_timeout: Duration,
    stats: Arc<JobStats>,
}

impl ScriptJob {
    /// Validate `config` against the guard's baseline. Configuration
    /// problems are the only errors surfaced to the caller.
    pub fn new(
        config: &ScriptJobConfig,
        guard: IntegrityGuard,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self, ConfigError> {
        let settings = config.validate(guard.record())?;
        let text_decoder: Arc<dyn TextDecoder> = Arc::new(settings.encoding);
        Ok(Self {
            settings: Arc::new(settings),
            guard,
            sink,
            text_decoder,
            graceful_timeout: crate::supervisor::DEFAULT_GRACEFUL_TIMEOUT,
            stats: Arc::new(JobStats::new()),
        })
    }

    /// Replace the decoder picked from the configured encoding.
    #[must_use]
    pub fn with_text_decoder(mut self, decoder: Arc<dyn TextDecoder>) -> Self {
        self.text_decoder = decoder;
        self
    }

    /// Wait between SIGTERM and SIGKILL when a cycle is stopped.
    #[must_use]
    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    fn context(&self) -> CycleContext {
        let mut decoder = StreamDecoder::new(
            self.settings.framing.clone(),
            self.settings.max_log_size,
            Arc::clone(&self.text_decoder),
            Arc::clone(&self.sink),
            Arc::clone(&self.stats),
        );
        if self.settings.add_attributes {
            decoder = decoder
                .with_attribute(SOURCE_ATTRIBUTE, self.settings.source.clone())
                .with_attribute(SOURCETYPE_ATTRIBUTE, self.settings.source_type.clone());
        }

        CycleContext {
            settings: Arc::clone(&self.settings),
            guard: self.guard.clone(),
            decoder,
            options: SupervisorOptions {
                interpreter: self.settings.interpreter.clone(),
                graceful_timeout: self.graceful_timeout,
            },
            stats: Arc::clone(&self.stats),
        }
    }

    /// Spawn the scheduling loop on the current runtime. The first cycle
    /// starts immediately.
    pub fn start(self) -> JobHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let span = info_span!("script_job", script_name = %self.settings.script_name);
        let task = tokio::spawn(self.run(shutdown_rx).instrument(span));
        JobHandle {
            shutdown_tx,
            task,
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let ctx = self.context();
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut generation = 0_u64;
        let mut active: Option<Cycle> = None;

        info!(
            interval_ms = u64::try_from(self.settings.interval.as_millis()).unwrap_or(u64::MAX),
            "Scripted job started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(previous) = active.take() {
                        previous.shutdown().await;
                    }
                    generation += 1;
                    active = Cycle::launch(generation, &ctx).await.into_running();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(cycle) = active.take() {
            debug!(generation = cycle.generation(), "Draining active cycle");
            cycle.shutdown().await;
        }
        let stats = self.stats.snapshot().to_json().unwrap_or_default();
        info!(cycles = generation, %stats, "Scripted job stopped");
    }
}

/// Control handle for a started job.
pub struct JobHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<JobStats>,
}

impl JobHandle {
    /// Stop scheduling and wait until the active cycle's process is reaped
    /// and its output fully drained. Returns the final counters.
    pub async fn shutdown(self) -> JobStatsSnapshot {
        self.shutdown_tx.send_replace(true);
        if let Err(err) = self.task.await {
            error!(error = %err, "Scheduling loop failed");
        }
        self.stats.snapshot()
    }

    #[must_use]
    pub fn stats(&self) -> JobStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
