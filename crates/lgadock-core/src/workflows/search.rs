use crate::core::fixed_point::{FixedPointCodec, Regime};
use crate::core::ids::DeviceId;
use crate::core::params::DockingParameters;
use crate::core::tables::KernelConstants;
use crate::engine::config::EngineConfig;
use crate::engine::device::ComputeDevice;
use crate::engine::error::EngineError;
use crate::engine::launch::LaunchGuard;
use crate::engine::ledger::{EvaluationLedger, LedgerSnapshot};
use crate::engine::pool::DeviceSlot;
use crate::engine::population::{PopulationView, PopulationViewMut};
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::random::LaneRng;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, instrument, trace, warn};

const KERNEL_INIT_POPULATION: &str = "init_population";
const KERNEL_NEXT_GENERATION: &str = "next_generation";

/// Scores genomes. The scoring function itself lives outside the engine.
pub trait FitnessEvaluator: Sync {
    /// Pushes the energy contributions of `genome` to `terms`, one per term, and
    /// returns the number of evaluations spent. The genome may be refined in place;
    /// the refined genes are what the next generation inherits.
    fn evaluate(&self, genome: &mut [f32], terms: &mut Vec<f32>) -> u32;
}

/// Selection and variation producing the next generation.
pub trait VariationOperator: Sync {
    /// Fills one individual of generation 0.
    fn initialize(&self, run: usize, individual: usize, rng: &mut LaneRng, genome: &mut [f32]);

    /// Writes one offspring of `run` into `child`, choosing parents from the active
    /// generation.
    fn offspring(
        &self,
        parents: &PopulationView<'_>,
        run: usize,
        individual: usize,
        rng: &mut LaneRng,
        child: &mut [f32],
    );
}

/// Stops a job once every run has used its evaluation budget or the generation
/// budget is exhausted, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub max_evals: u64,
    pub max_generations: u64,
}

impl TerminationPolicy {
    pub fn from_params(params: &DockingParameters) -> Self {
        Self {
            max_evals: params.max_evals,
            max_generations: params.max_generations,
        }
    }

    pub fn should_stop(&self, evaluations: &LedgerSnapshot, generation: u64) -> bool {
        generation >= self.max_generations || evaluations.slowest_run() >= self.max_evals
    }
}

/// One docking job: the run request plus the tables and grid maps it runs against.
///
/// When `halt` is set, the job checks it at every generation boundary and stops
/// with [`EngineError::Halted`] once it is raised.
#[derive(Debug, Clone)]
pub struct SearchInput<'a> {
    pub job: usize,
    pub params: &'a DockingParameters,
    pub constants: &'a KernelConstants,
    pub grid_maps: &'a [f32],
    pub halt: Option<&'a AtomicBool>,
}

impl SearchInput<'_> {
    fn halted(&self) -> bool {
        self.halt.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunBest {
    pub run: usize,
    pub individual: usize,
    pub energy: f32,
    pub genome: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job: usize,
    pub device: DeviceId,
    pub generations: u64,
    pub evaluations: LedgerSnapshot,
    pub best: Vec<RunBest>,
}

impl JobOutcome {
    /// Lowest energy found by any run of the job.
    pub fn best_energy(&self) -> Option<f32> {
        self.best.iter().map(|b| b.energy).min_by(|a, b| a.total_cmp(b))
    }
}

#[derive(Debug, Default)]
struct LaneResults {
    staged: Vec<u32>,
    saturated: Vec<bool>,
}

/// Runs one job to termination on an acquired device.
///
/// Every generation is a single guarded launch: offspring are bred from the active
/// half into the writing half, scored lane-parallel, and published by a swap once
/// the launch has completed.
#[instrument(skip_all, name = "search_workflow", fields(job = input.job, device = %slot.id()))]
pub fn run<D, E, V>(
    slot: &mut DeviceSlot<D>,
    input: &SearchInput<'_>,
    config: &EngineConfig,
    evaluator: &E,
    variation: &V,
    reporter: &ProgressReporter,
) -> Result<JobOutcome, EngineError>
where
    D: ComputeDevice,
    E: FitnessEvaluator,
    V: VariationOperator,
{
    let device_id = slot.id();
    slot.context_mut()
        .load_run(input.params, input.constants.clone(), input.grid_maps)?;
    info!(
        runs = input.params.num_runs,
        pop_size = input.params.pop_size,
        "Starting docking job."
    );

    let outcome = drive(slot, input, config, evaluator, variation, reporter);
    slot.context_mut().clear_run();
    let (generations, best) = outcome?;

    let evaluations = slot.ledger().snapshot();
    info!(
        generations,
        evaluations = evaluations.run_total(),
        "Docking job finished."
    );
    Ok(JobOutcome {
        job: input.job,
        device: device_id,
        generations,
        evaluations,
        best,
    })
}

fn drive<D, E, V>(
    slot: &mut DeviceSlot<D>,
    input: &SearchInput<'_>,
    config: &EngineConfig,
    evaluator: &E,
    variation: &V,
    reporter: &ProgressReporter,
) -> Result<(u64, Vec<RunBest>), EngineError>
where
    D: ComputeDevice,
    E: FitnessEvaluator,
    V: VariationOperator,
{
    let guard = LaunchGuard::new(config.launch_mode);
    let codec = config.codec();
    let policy = TerminationPolicy::from_params(input.params);
    let mut saturation_reported = false;

    let mut parts = slot.parts_mut();
    let pop_size = parts.population.layout().pop_size;

    // Generation 0 is written in place into the active half.
    let initial = parts.population.initial_mut()?;
    let streams = &mut *parts.streams;
    let launch = guard.launch(parts.device, KERNEL_INIT_POPULATION, |_| {
        score_lanes(None, initial, streams.lanes_mut(), evaluator, variation, codec)
    })?;
    let (lanes, completion) = launch.complete(parts.device)?;
    trace!(kernel = completion.kernel(), "Initial population evaluated.");
    account(parts.ledger, &lanes, pop_size)?;
    saturation_reported |= report_saturation(&lanes, 0, saturation_reported);

    while !policy.should_stop(&parts.ledger.snapshot(), parts.population.generation()) {
        if input.halted() {
            let generation = parts.population.generation();
            info!(generation, "Halt requested, abandoning the job.");
            return Err(EngineError::Halted {
                job: input.job,
                generation,
            });
        }
        let (parents, children) = parts.population.split();
        let streams = &mut *parts.streams;
        let launch = guard.launch(parts.device, KERNEL_NEXT_GENERATION, |_| {
            score_lanes(
                Some(parents),
                children,
                streams.lanes_mut(),
                evaluator,
                variation,
                codec,
            )
        })?;
        let (lanes, completion) = launch.complete(parts.device)?;
        account(parts.ledger, &lanes, pop_size)?;
        parts.population.swap_generation(completion);

        let generation = parts.population.generation();
        saturation_reported |= report_saturation(&lanes, generation, saturation_reported);
        let best_energy = best_of_runs(&parts.population.active(), input.params.num_runs)?
            .into_iter()
            .map(|(_, energy)| energy)
            .fold(f32::INFINITY, f32::min);
        trace!(generation, best_energy, "Generation published.");
        reporter.report(Progress::GenerationFinish {
            job: input.job,
            generation,
            best_energy,
        });
    }

    let active = parts.population.active();
    let best = best_of_runs(&active, input.params.num_runs)?
        .into_iter()
        .enumerate()
        .map(|(run, (individual, energy))| {
            let index = active.layout().index_of(run, individual);
            RunBest {
                run,
                individual,
                energy,
                genome: active.genome(index).map(<[f32]>::to_vec).unwrap_or_default(),
            }
        })
        .collect();
    Ok((parts.population.generation(), best))
}

fn best_of_runs(
    view: &PopulationView<'_>,
    num_runs: usize,
) -> Result<Vec<(usize, f32)>, EngineError> {
    (0..num_runs).map(|run| view.best_in_run(run)).collect()
}

/// Lane-parallel body of one generation: breed (or initialize), then score.
fn score_lanes<E, V>(
    parents: Option<PopulationView<'_>>,
    mut children: PopulationViewMut<'_>,
    lanes: &mut [LaneRng],
    evaluator: &E,
    variation: &V,
    codec: FixedPointCodec,
) -> LaneResults
where
    E: FitnessEvaluator,
    V: VariationOperator,
{
    let pop_size = children.layout().pop_size;
    let (staged, saturated) = children
        .par_individuals_mut()
        .zip(lanes.par_iter_mut())
        .enumerate()
        .map_init(Vec::new, |terms, (index, ((genome, fitness), rng))| {
            let (run, individual) = (index / pop_size, index % pop_size);
            match &parents {
                Some(parents) => variation.offspring(parents, run, individual, rng, genome),
                None => variation.initialize(run, individual, rng, genome),
            }

            terms.clear();
            let evaluations = evaluator.evaluate(genome, terms);
            let total = codec.reduce(terms.iter().map(|&t| codec.encode(t)));
            // NaN terms poison the score the same way a clamped total does.
            let saturated = codec.is_saturated(total, Regime::Reduction)
                || terms.iter().any(|t| t.is_nan());
            *fitness = if saturated {
                codec.worst_energy()
            } else {
                codec.energy_of_reduction(total)
            };
            (evaluations, saturated)
        })
        .unzip();
    LaneResults { staged, saturated }
}

fn account(ledger: &EvaluationLedger, lanes: &LaneResults, pop_size: usize) -> Result<(), EngineError> {
    for (run, staged) in lanes.staged.chunks(pop_size).enumerate() {
        ledger.record_entities(run, staged)?;
    }
    Ok(())
}

/// Warns once per job when scores saturate; returns whether it did.
fn report_saturation(lanes: &LaneResults, generation: u64, already_reported: bool) -> bool {
    if already_reported {
        return false;
    }
    let count = lanes.saturated.iter().filter(|&&s| s).count();
    if count > 0 {
        warn!(
            generation,
            individuals = count,
            "Energies saturated or undefined; affected individuals rank last."
        );
    }
    count > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tables::{RotbondTables, TableKind};
    use crate::engine::config::EngineConfig;
    use crate::engine::device::{DeviceInfo, DeviceStatus, HostDevice, InjectedFault};
    use crate::engine::launch::{FaultPhase, LaunchMode};
    use crate::engine::pool::{DevicePool, RunRequest};
    use rand::Rng;
    use std::sync::Arc;
    use std::sync::Mutex;

    /// Sum of squared genes, one term per gene.
    struct Quadratic;

    impl FitnessEvaluator for Quadratic {
        fn evaluate(&self, genome: &mut [f32], terms: &mut Vec<f32>) -> u32 {
            terms.extend(genome.iter().map(|g| g * g));
            1
        }
    }

    /// Keeps the run's best parent at individual 0 and perturbs it elsewhere.
    struct Perturb;

    impl VariationOperator for Perturb {
        fn initialize(&self, _: usize, _: usize, rng: &mut LaneRng, genome: &mut [f32]) {
            genome.iter_mut().for_each(|g| *g = rng.gen_range(-5.0..5.0));
        }

        fn offspring(
            &self,
            parents: &PopulationView<'_>,
            run: usize,
            individual: usize,
            rng: &mut LaneRng,
            child: &mut [f32],
        ) {
            let Ok((best, _)) = parents.best_in_run(run) else {
                return;
            };
            let index = parents.layout().index_of(run, best);
            if let Some(parent) = parents.genome(index) {
                child.copy_from_slice(parent);
            }
            if individual != 0 {
                child.iter_mut().for_each(|g| *g += rng.gen_range(-0.5..0.5));
            }
        }
    }

    fn params() -> DockingParameters {
        DockingParameters {
            num_runs: 2,
            pop_size: 8,
            num_genes: 3,
            num_atoms: 4,
            grid_size: [2, 2, 2],
            num_map_atypes: 1,
            max_evals: 80,
            max_generations: 50,
        }
    }

    fn constants() -> KernelConstants {
        TableKind::ALL
            .iter()
            .fold(KernelConstants::builder(), |b, &kind| b.table(kind, vec![1u8; 4]))
            .rotbonds(RotbondTables::default())
            .build()
            .unwrap()
    }

    fn pool(config: &Arc<EngineConfig>, device: HostDevice) -> DevicePool<HostDevice> {
        DevicePool::new(vec![device], Arc::clone(config)).unwrap()
    }

    fn host() -> HostDevice {
        HostDevice::new(DeviceInfo {
            name: "host-0".to_string(),
            memory_bytes: 1 << 30,
            warp_size: 32,
        })
    }

    fn search(
        config: EngineConfig,
        device: HostDevice,
        seed: u64,
    ) -> Result<JobOutcome, EngineError> {
        let config = Arc::new(config);
        let pool = pool(&config, device);
        let params = params();
        let grid = vec![0.0; params.grid_floats()];
        let constants = constants();
        let mut lease = pool.acquire(&RunRequest::new(params.clone(), seed))?;
        let input = SearchInput {
            job: 0,
            params: &params,
            constants: &constants,
            grid_maps: &grid,
            halt: None,
        };
        run(
            &mut lease,
            &input,
            &config,
            &Quadratic,
            &Perturb,
            &ProgressReporter::new(),
        )
    }

    #[test]
    fn termination_checks_both_budgets() {
        let policy = TerminationPolicy::from_params(&params());
        let under = LedgerSnapshot {
            runs: vec![80, 79],
            device: 159,
        };
        let over = LedgerSnapshot {
            runs: vec![80, 80],
            device: 160,
        };
        assert!(!policy.should_stop(&under, 3));
        assert!(policy.should_stop(&over, 3));
        assert!(policy.should_stop(&under, 50));
    }

    #[test]
    fn job_stops_at_the_evaluation_budget() {
        let outcome = search(EngineConfig::default(), host(), 42).unwrap();
        // 8 evaluations per run per generation, generation 0 included.
        assert_eq!(outcome.generations, 9);
        assert_eq!(outcome.evaluations.runs, vec![80, 80]);
        assert_eq!(outcome.best.len(), 2);
    }

    #[test]
    fn best_energy_never_gets_worse_with_elitism() {
        let config = Arc::new(EngineConfig::default());
        let pool = pool(&config, host());
        let params = params();
        let grid = vec![0.0; params.grid_floats()];
        let constants = constants();
        let energies = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|event: Progress| {
            if let Progress::GenerationFinish { best_energy, .. } = event {
                energies.lock().unwrap().push(best_energy);
            }
        }));

        let mut lease = pool.acquire(&RunRequest::new(params.clone(), 7)).unwrap();
        let input = SearchInput {
            job: 0,
            params: &params,
            constants: &constants,
            grid_maps: &grid,
            halt: None,
        };
        run(&mut lease, &input, &config, &Quadratic, &Perturb, &reporter).unwrap();
        drop(reporter);

        let energies = energies.into_inner().unwrap();
        assert_eq!(energies.len(), 9);
        assert!(energies.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn same_seed_reproduces_the_same_result() {
        let first = search(EngineConfig::default(), host(), 1234).unwrap();
        let second = search(EngineConfig::default(), host(), 1234).unwrap();
        assert_eq!(first.best, second.best);
    }

    #[test]
    fn asynchronous_launches_reach_the_same_result() {
        let asynchronous = EngineConfig {
            launch_mode: LaunchMode::Asynchronous,
            ..EngineConfig::default()
        };
        let sync = search(EngineConfig::default(), host(), 99).unwrap();
        let not_sync = search(asynchronous, host(), 99).unwrap();
        assert_eq!(sync.best, not_sync.best);
        assert_eq!(sync.generations, not_sync.generations);
    }

    #[test]
    fn execution_fault_stops_the_job_with_a_device_fault() {
        let mut device = host();
        device.inject_fault(
            2,
            InjectedFault::OnSynchronize(DeviceStatus::error(700, "illegal address")),
        );
        let err = search(EngineConfig::default(), device, 5).unwrap_err();
        match err {
            EngineError::DeviceFault(fault) => {
                assert_eq!(fault.phase, FaultPhase::Execution);
                assert_eq!(fault.operation, KERNEL_NEXT_GENERATION);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_grid_length_is_rejected_before_any_launch() {
        let config = Arc::new(EngineConfig::default());
        let pool = pool(&config, host());
        let params = params();
        let constants = constants();
        let mut lease = pool.acquire(&RunRequest::new(params.clone(), 1)).unwrap();
        let input = SearchInput {
            job: 0,
            params: &params,
            constants: &constants,
            grid_maps: &[0.0; 3],
            halt: None,
        };
        let result = run(&mut lease, &input, &config, &Quadratic, &Perturb, &ProgressReporter::new());
        assert!(matches!(result, Err(EngineError::GridSize { .. })));
        assert_eq!(lease.device().launches(), 0);
    }

    /// Pushes the same term `count` times, whatever the genome.
    struct Constant {
        term: f32,
        count: usize,
    }

    impl FitnessEvaluator for Constant {
        fn evaluate(&self, _: &mut [f32], terms: &mut Vec<f32>) -> u32 {
            terms.extend(std::iter::repeat(self.term).take(self.count));
            1
        }
    }

    fn search_with<E: FitnessEvaluator>(evaluator: &E, seed: u64) -> JobOutcome {
        let config = Arc::new(EngineConfig::default());
        let pool = pool(&config, host());
        let params = params();
        let grid = vec![0.0; params.grid_floats()];
        let constants = constants();
        let mut lease = pool.acquire(&RunRequest::new(params.clone(), seed)).unwrap();
        let input = SearchInput {
            job: 0,
            params: &params,
            constants: &constants,
            grid_maps: &grid,
            halt: None,
        };
        run(&mut lease, &input, &config, evaluator, &Perturb, &ProgressReporter::new()).unwrap()
    }

    #[test]
    fn positive_saturation_ranks_as_the_worst_energy() {
        let outcome = search_with(&Constant { term: 1.0e6, count: 100 }, 3);
        let worst = EngineConfig::default().codec().worst_energy();
        assert!(outcome.best.iter().all(|b| b.energy == worst));
    }

    #[test]
    fn negative_saturation_ranks_as_the_worst_energy() {
        let outcome = search_with(&Constant { term: -1.0e6, count: 100 }, 3);
        let worst = EngineConfig::default().codec().worst_energy();
        assert_eq!(outcome.best_energy(), Some(worst));
    }

    #[test]
    fn undefined_terms_rank_as_the_worst_energy() {
        let outcome = search_with(&Constant { term: f32::NAN, count: 1 }, 3);
        let worst = EngineConfig::default().codec().worst_energy();
        assert_eq!(outcome.best_energy(), Some(worst));
    }

    #[test]
    fn raised_halt_flag_stops_the_job_at_the_next_generation_boundary() {
        let config = Arc::new(EngineConfig::default());
        let pool = pool(&config, host());
        let params = DockingParameters {
            max_evals: u64::MAX,
            max_generations: 10_000,
            ..params()
        };
        let grid = vec![0.0; params.grid_floats()];
        let constants = constants();
        let halt = AtomicBool::new(false);
        let reporter = ProgressReporter::with_callback(Box::new(|event: Progress| {
            if let Progress::GenerationFinish { generation: 3, .. } = event {
                halt.store(true, Ordering::SeqCst);
            }
        }));

        let mut lease = pool.acquire(&RunRequest::new(params.clone(), 8)).unwrap();
        let input = SearchInput {
            job: 4,
            params: &params,
            constants: &constants,
            grid_maps: &grid,
            halt: Some(&halt),
        };
        let result = run(&mut lease, &input, &config, &Quadratic, &Perturb, &reporter);

        assert!(matches!(
            result,
            Err(EngineError::Halted {
                job: 4,
                generation: 3
            })
        ));
        // Generation 0 plus three bred generations.
        assert_eq!(lease.device().launches(), 4);
        assert!(!lease.context().has_run_loaded());
    }
}
