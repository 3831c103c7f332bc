use super::search::{self, FitnessEvaluator, JobOutcome, SearchInput, VariationOperator};
use crate::core::tables::KernelConstants;
use crate::engine::device::ComputeDevice;
use crate::engine::error::{AcquireError, EngineError};
use crate::engine::pool::{DevicePool, RunRequest};
use crate::engine::progress::{Progress, ProgressReporter};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, error, info, instrument};

/// One queued docking job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub request: RunRequest,
    pub constants: KernelConstants,
    pub grid_maps: Arc<[f32]>,
}

/// Drives `jobs` through the pool with one coordinating thread per device.
///
/// Jobs are taken from a shared queue in order; each coordinator acquires a device,
/// runs the job to termination and releases the device before taking the next one.
/// The first error raises a shared halt flag: no coordinator starts a new job, and
/// jobs already running stop at their next generation boundary. Outcomes are
/// returned ordered by job index.
#[instrument(skip_all, name = "batch_workflow", fields(jobs = jobs.len(), devices = pool.len()))]
pub fn run<D, E, V>(
    pool: &DevicePool<D>,
    jobs: &[JobSpec],
    evaluator: &E,
    variation: &V,
    reporter: &ProgressReporter,
) -> Result<Vec<JobOutcome>, EngineError>
where
    D: ComputeDevice,
    E: FitnessEvaluator,
    V: VariationOperator,
{
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    if pool.is_empty() {
        let required_bytes = jobs[0].request.required_memory_bytes(pool.config());
        return Err(AcquireError::Unsatisfiable { required_bytes }.into());
    }

    reporter.report(Progress::BatchStart {
        total_jobs: jobs.len() as u64,
    });
    info!("Dispatching {} job(s) over {} device(s).", jobs.len(), pool.len());

    let next = AtomicUsize::new(0);
    let halted = AtomicBool::new(false);
    let outcomes = Mutex::new(Vec::with_capacity(jobs.len()));
    let coordinators = pool.len().min(jobs.len());

    let results: Vec<Result<(), EngineError>> = thread::scope(|s| {
        let handles: Vec<_> = (0..coordinators)
            .map(|_| {
                s.spawn(|| {
                    let result = coordinate(pool, jobs, &next, &halted, &outcomes, evaluator, variation, reporter);
                    if result.is_err() {
                        halted.store(true, Ordering::SeqCst);
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(EngineError::Internal("batch coordinator panicked".to_string()))
                })
            })
            .collect()
    });

    // A device fault outranks whatever it caused elsewhere.
    let mut errors: Vec<EngineError> = results.into_iter().filter_map(Result::err).collect();
    if let Some(position) = errors.iter().position(EngineError::is_device_fault) {
        return Err(errors.swap_remove(position));
    }
    if let Some(err) = errors.into_iter().next() {
        return Err(err);
    }

    reporter.report(Progress::BatchFinish);
    let mut outcomes = outcomes.into_inner();
    outcomes.sort_by_key(|o| o.job);
    Ok(outcomes)
}

#[allow(clippy::too_many_arguments)]
fn coordinate<D, E, V>(
    pool: &DevicePool<D>,
    jobs: &[JobSpec],
    next: &AtomicUsize,
    halted: &AtomicBool,
    outcomes: &Mutex<Vec<JobOutcome>>,
    evaluator: &E,
    variation: &V,
    reporter: &ProgressReporter,
) -> Result<(), EngineError>
where
    D: ComputeDevice,
    E: FitnessEvaluator,
    V: VariationOperator,
{
    while !halted.load(Ordering::SeqCst) {
        let job = next.fetch_add(1, Ordering::SeqCst);
        let Some(queued) = jobs.get(job) else {
            break;
        };

        let mut lease = pool.acquire(&queued.request)?;
        reporter.report(Progress::JobStart {
            job,
            device: lease.id(),
        });
        let input = SearchInput {
            job,
            params: &queued.request.params,
            constants: &queued.constants,
            grid_maps: &queued.grid_maps,
            halt: Some(halted),
        };
        match search::run(&mut lease, &input, pool.config(), evaluator, variation, reporter) {
            Ok(outcome) => outcomes.lock().push(outcome),
            Err(EngineError::Halted { generation, .. }) => {
                debug!(job, generation, device = %lease.id(), "Job abandoned after a batch halt.");
                break;
            }
            Err(err) => {
                error!(job, device = %lease.id(), "Job failed: {}", err);
                return Err(err);
            }
        }
        drop(lease);
        reporter.report(Progress::JobFinish { job });
    }
    Ok(())
}
