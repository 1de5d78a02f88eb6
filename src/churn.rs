// ============================================================================
// churn.rs — slime-engine
// Periodic population turnover: every interval the oldest block of agents is
// replaced by freshly spawned ones.
// ============================================================================

use crate::backend::ComputeBackend;
use crate::engine::SimulationEngine;
use crate::error::{SimError, SimResult};

pub const DEFAULT_CHURN_INTERVAL: f64 = 2.0;
pub const DEFAULT_CHURN_BATCH: usize = 5000;

/// Outcome of one completed churn cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ChurnReport {
    pub cycle: u64,
    pub replaced: usize,
    pub population: usize,
    pub completed_at: f64,
}

/// Cooperative interval task. The host calls `poll` with its clock on the
/// simulation thread, between steps. The next cycle is due `interval` after
/// the previous one completed, so a slow cycle never stacks up.
#[derive(Debug)]
pub struct PopulationChurnScheduler {
    interval: f64,
    batch: usize,
    next_fire: f64,
    cycles: u64,
    skipped: u64,
    cancelled: bool,
}

impl PopulationChurnScheduler {
    pub fn new(interval: f64, batch: usize, now: f64) -> SimResult<Self> {
        if !interval.is_finite() || interval <= 0.0 {
            return Err(SimError::InvalidArgument(format!(
                "churn interval must be positive, got {interval}"
            )));
        }
        Ok(Self {
            interval,
            batch,
            next_fire: now + interval,
            cycles: 0,
            skipped: 0,
            cancelled: false,
        })
    }

    pub fn with_defaults(now: f64) -> SimResult<Self> {
        Self::new(DEFAULT_CHURN_INTERVAL, DEFAULT_CHURN_BATCH, now)
    }

    /// Run a cycle if one is due. `Ok(None)` when nothing was due or the
    /// scheduler is cancelled. A cycle that fails, including on
    /// `ChurnUnderflow`, is skipped and the next one rescheduled.
    pub fn poll<B: ComputeBackend>(
        &mut self,
        now: f64,
        engine: &mut SimulationEngine<B>,
    ) -> SimResult<Option<ChurnReport>> {
        if self.cancelled {
            return Ok(None);
        }
        if engine.is_disposed() {
            log::info!("Engine disposed, churn scheduler cancelled after {} cycles", self.cycles);
            self.cancel();
            return Ok(None);
        }
        if now < self.next_fire {
            return Ok(None);
        }

        let result = self.run_cycle(engine);
        self.next_fire = now + self.interval;
        match result {
            Ok(replaced) => {
                self.cycles += 1;
                let report = ChurnReport {
                    cycle: self.cycles,
                    replaced,
                    population: engine.population_len(),
                    completed_at: now,
                };
                log::info!(
                    "Churn cycle {}: replaced {} of {} agents",
                    report.cycle,
                    report.replaced,
                    report.population
                );
                Ok(Some(report))
            }
            Err(e) => {
                self.skipped += 1;
                log::warn!("Churn cycle skipped: {e}");
                Err(e)
            }
        }
    }

    fn run_cycle<B: ComputeBackend>(&self, engine: &mut SimulationEngine<B>) -> SimResult<usize> {
        let population = engine.population_len();
        if self.batch > population {
            return Err(SimError::ChurnUnderflow {
                batch: self.batch,
                population,
            });
        }
        let fresh = engine.spawn_batch(self.batch)?;
        engine.replace_population_prefix(&fresh)?;
        Ok(fresh.len())
    }

    /// Stop for good. A cancelled scheduler never fires again.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn next_fire(&self) -> f64 {
        self.next_fire
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }
}
