use super::error::EngineError;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the ledger's counters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LedgerSnapshot {
    pub runs: Vec<u64>,
    pub device: u64,
}

impl LedgerSnapshot {
    pub fn run_total(&self) -> u64 {
        self.runs.iter().sum()
    }

    /// Evaluations of the run that has consumed the fewest so far.
    pub fn slowest_run(&self) -> u64 {
        self.runs.iter().copied().min().unwrap_or(0)
    }
}

/// Monotonic counters of fitness evaluations.
///
/// [`EvaluationLedger::begin_run`] resets the per-run counters and the device's
/// per-job total; only the lifetime total survives across jobs. Reads never block and
/// may land in the middle of a generation; they are a lower bound, not a barrier.
#[derive(Debug, Default)]
pub struct EvaluationLedger {
    runs: Vec<AtomicU64>,
    device: AtomicU64,
    lifetime: AtomicU64,
}

impl EvaluationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_run(&mut self, num_runs: usize) {
        self.runs.clear();
        self.runs.resize_with(num_runs, AtomicU64::default);
        *self.device.get_mut() = 0;
    }

    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }

    fn counter(&self, run: usize) -> Result<&AtomicU64, EngineError> {
        self.runs.get(run).ok_or(EngineError::RunOutOfRange {
            run,
            runs: self.runs.len(),
        })
    }

    pub fn record(&self, run: usize, evaluations: u64) -> Result<(), EngineError> {
        self.counter(run)?.fetch_add(evaluations, Ordering::Relaxed);
        self.device.fetch_add(evaluations, Ordering::Relaxed);
        self.lifetime.fetch_add(evaluations, Ordering::Relaxed);
        Ok(())
    }

    /// Folds a per-individual staging array (evaluations of new entities) into the
    /// counters of `run`, returning the amount added.
    pub fn record_entities(&self, run: usize, staged: &[u32]) -> Result<u64, EngineError> {
        let total: u64 = staged.par_iter().map(|&n| u64::from(n)).sum();
        self.record(run, total)?;
        Ok(total)
    }

    pub fn run_evaluations(&self, run: usize) -> Option<u64> {
        self.runs.get(run).map(|c| c.load(Ordering::Relaxed))
    }

    pub fn device_evaluations(&self) -> u64 {
        self.device.load(Ordering::Relaxed)
    }

    /// Everything this device has evaluated since it was registered.
    pub fn lifetime_evaluations(&self) -> u64 {
        self.lifetime.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            runs: self
                .runs
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            device: self.device.load(Ordering::Relaxed),
        }
    }
}
