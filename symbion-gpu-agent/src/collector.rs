//! Collection loop
//!
//! Runs probe -> transform -> publish on a fixed interval, one cycle at a
//! time. A failed cycle is logged and the next tick is the retry; nothing is
//! carried from one cycle to the next.

use crate::catalog::MetricCatalog;
use crate::error::CycleError;
use crate::metadata::HostIdentity;
use crate::probe::SampleSource;
use crate::publish::{MetricBackend, PublishBatcher};
use crate::transform::transform;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the next tick
    Idle,
    /// One cycle in flight
    Running,
}

/// What one successful cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub devices: usize,
    pub rejected_lines: usize,
    pub derive_failures: usize,
    pub points_published: usize,
}

/// Cycle counters reported when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub completed: u64,
    pub failed: u64,
}

pub struct CollectionLoop<S, B> {
    source: S,
    batcher: PublishBatcher<B>,
    catalog: MetricCatalog,
    identity: HostIdentity,
    interval: Duration,
    state: LoopState,
    stats: LoopStats,
}

impl<S: SampleSource, B: MetricBackend> CollectionLoop<S, B> {
    pub fn new(
        source: S,
        batcher: PublishBatcher<B>,
        catalog: MetricCatalog,
        identity: HostIdentity,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            batcher,
            catalog,
            identity,
            interval,
            state: LoopState::Idle,
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run cycles until `shutdown` resolves.
    ///
    /// The first cycle starts immediately. A cycle that overruns the interval
    /// delays the next tick instead of overlapping with it. Shutdown during a
    /// cycle abandons that cycle.
    pub async fn run_until<F>(&mut self, shutdown: F) -> LoopStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Collection loop started (every {}s, {} metrics per GPU)",
            self.interval.as_secs(),
            self.catalog.entries().len() + self.catalog.derived().len()
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let finished = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                result = self.run_cycle() => Some(result),
            };

            match finished {
                None => {
                    self.state = LoopState::Idle;
                    warn!("Shutdown requested, abandoning in-flight cycle");
                    break;
                }
                Some(Ok(outcome)) => {
                    self.stats.completed += 1;
                    info!(
                        devices = outcome.devices,
                        rejected_lines = outcome.rejected_lines,
                        derive_failures = outcome.derive_failures,
                        points = outcome.points_published,
                        "Cycle complete"
                    );
                }
                Some(Err(e)) => {
                    self.stats.failed += 1;
                    error!("Cycle failed: {}", e);
                }
            }
        }

        info!(
            completed = self.stats.completed,
            failed = self.stats.failed,
            "Collection loop stopped"
        );
        self.stats
    }

    /// Run exactly one probe -> transform -> publish cycle
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, CycleError> {
        self.state = LoopState::Running;
        let result = self.collect_and_publish().await;
        self.state = LoopState::Idle;
        result
    }

    async fn collect_and_publish(&self) -> Result<CycleOutcome, CycleError> {
        let report = self.source.probe(&self.catalog).await?;
        let transformed = transform(report.samples, &self.catalog);

        let mut outcome = CycleOutcome {
            devices: transformed.devices.len(),
            rejected_lines: report.rejected.len(),
            derive_failures: transformed.failures.len(),
            points_published: 0,
        };

        if transformed.devices.is_empty() {
            warn!("No GPU samples this cycle, nothing to publish");
            return Ok(outcome);
        }

        outcome.points_published = self
            .batcher
            .publish(&self.identity, &transformed.devices, &self.catalog)
            .await?;

        Ok(outcome)
    }
}
