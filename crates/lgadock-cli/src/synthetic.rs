//! Host-side stand-ins for the scoring function, the genetic operators and the
//! prepared docking inputs, so a batch can run end to end on simulated devices.

use lgadock::core::params::DockingParameters;
use lgadock::core::tables::{KernelConstants, RotbondTables, TableError, TableKind};
use lgadock::engine::population::PopulationView;
use lgadock::engine::random::LaneRng;
use lgadock::workflows::search::{FitnessEvaluator, VariationOperator};
use rand::{Rng, SeedableRng};
use std::f32::consts::TAU;
use std::sync::Arc;

const TARGET_RANGE: f32 = 4.0;
const INITIAL_RANGE: f32 = 6.0;
const RUGGEDNESS: f32 = 0.25;
const LOCAL_SEARCH_STEP: f32 = 0.05;

/// Quadratic bowl with a cosine ripple per gene, centered on a seeded target.
///
/// Scoring a genome also runs a few sweeps of coordinate descent and keeps the
/// improved genes (the Lamarckian step); every trial counts as one evaluation.
#[derive(Debug, Clone)]
pub struct SyntheticLandscape {
    target: Vec<f32>,
    local_search_steps: u32,
}

impl SyntheticLandscape {
    pub fn new(num_genes: usize, seed: u64, local_search_steps: u32) -> Self {
        let mut rng = LaneRng::seed_from_u64(seed);
        let target = (0..num_genes)
            .map(|_| rng.gen_range(-TARGET_RANGE..TARGET_RANGE))
            .collect();
        Self {
            target,
            local_search_steps,
        }
    }

    pub fn target(&self) -> &[f32] {
        &self.target
    }

    fn push_terms(&self, genome: &[f32], terms: &mut Vec<f32>) {
        for (gene, target) in genome.iter().zip(&self.target) {
            let d = gene - target;
            terms.push(d * d);
            terms.push(RUGGEDNESS * (1.0 - (TAU * d).cos()));
        }
    }

    pub fn energy(&self, genome: &[f32]) -> f32 {
        genome
            .iter()
            .zip(&self.target)
            .map(|(gene, target)| {
                let d = gene - target;
                d * d + RUGGEDNESS * (1.0 - (TAU * d).cos())
            })
            .sum()
    }
}

impl FitnessEvaluator for SyntheticLandscape {
    fn evaluate(&self, genome: &mut [f32], terms: &mut Vec<f32>) -> u32 {
        let mut evaluations = 1;
        let mut best = self.energy(genome);

        for _ in 0..self.local_search_steps {
            for i in 0..genome.len() {
                for delta in [LOCAL_SEARCH_STEP, -LOCAL_SEARCH_STEP] {
                    genome[i] += delta;
                    let energy = self.energy(genome);
                    evaluations += 1;
                    if energy < best {
                        best = energy;
                        break;
                    }
                    genome[i] -= delta;
                }
            }
        }

        self.push_terms(genome, terms);
        evaluations
    }
}

/// Tournament selection, uniform crossover and uniform mutation, with the best
/// individual of each run carried over unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LamarckianVariation {
    pub crossover_rate: f32,
    pub mutation_rate: f32,
    pub mutation_scale: f32,
    pub tournament_size: usize,
}

impl Default for LamarckianVariation {
    fn default() -> Self {
        Self {
            crossover_rate: 0.8,
            mutation_rate: 0.02,
            mutation_scale: 2.0,
            tournament_size: 2,
        }
    }
}

impl LamarckianVariation {
    fn tournament(&self, parents: &PopulationView<'_>, run: usize, rng: &mut LaneRng) -> usize {
        let layout = parents.layout();
        let mut winner = None;
        for _ in 0..self.tournament_size.max(1) {
            let candidate = layout.index_of(run, rng.gen_range(0..layout.pop_size));
            let fitness = parents.fitness(candidate).unwrap_or(f32::INFINITY);
            match winner {
                Some((_, best)) if best <= fitness => {}
                _ => winner = Some((candidate, fitness)),
            }
        }
        winner.map_or_else(|| layout.index_of(run, 0), |(index, _)| index)
    }
}

impl VariationOperator for LamarckianVariation {
    fn initialize(&self, _: usize, _: usize, rng: &mut LaneRng, genome: &mut [f32]) {
        genome
            .iter_mut()
            .for_each(|g| *g = rng.gen_range(-INITIAL_RANGE..INITIAL_RANGE));
    }

    fn offspring(
        &self,
        parents: &PopulationView<'_>,
        run: usize,
        individual: usize,
        rng: &mut LaneRng,
        child: &mut [f32],
    ) {
        let layout = parents.layout();
        if individual == 0 {
            if let Ok((best, _)) = parents.best_in_run(run) {
                if let Some(elite) = parents.genome(layout.index_of(run, best)) {
                    child.copy_from_slice(elite);
                    return;
                }
            }
        }

        let first = self.tournament(parents, run, rng);
        let second = self.tournament(parents, run, rng);
        let (Some(a), Some(b)) = (parents.genome(first), parents.genome(second)) else {
            return;
        };
        let crossover = rng.gen_range(0.0..1.0) < self.crossover_rate;
        for (i, gene) in child.iter_mut().enumerate() {
            *gene = if crossover && rng.gen_range(0.0..1.0) < 0.5 {
                b[i]
            } else {
                a[i]
            };
            if rng.gen_range(0.0..1.0) < self.mutation_rate {
                *gene += rng.gen_range(-self.mutation_scale..self.mutation_scale);
            }
        }
    }
}

/// Deterministic constant tables sized from the job's topology.
pub fn synthetic_constants(params: &DockingParameters) -> Result<KernelConstants, TableError> {
    let atoms = params.num_atoms;
    let rotbonds = params.num_genes.saturating_sub(6).max(1);
    let sizes = [
        (TableKind::InterIntra, atoms * 4),
        (TableKind::IntraContrib, atoms * atoms * 3),
        (TableKind::Intra, atoms * 16),
        (TableKind::RotList, rotbonds * atoms * 4),
        (TableKind::Conform, atoms * 12),
        (TableKind::Grads, rotbonds * 8),
    ];
    let builder = sizes
        .into_iter()
        .fold(KernelConstants::builder(), |builder, (kind, len)| {
            let bytes: Vec<u8> = (0..len.max(1)).map(|i| (i % 251) as u8).collect();
            builder.table(kind, bytes)
        });

    let atom_count = i32::try_from(atoms).unwrap_or(i32::MAX).max(1);
    let rot = RotbondTables {
        rotbonds: (0..rotbonds as i32 * 2).map(|i| i % atom_count).collect(),
        rotbonds_atoms: (0..atom_count).collect(),
        num_rotating_atoms_per_rotbond: vec![atom_count / 2; rotbonds],
    };
    builder.rotbonds(rot).build()
}

/// A smooth grid energy map of the right length for the job.
pub fn synthetic_grid(params: &DockingParameters) -> Arc<[f32]> {
    let len = params.grid_floats();
    (0..len)
        .map(|i| ((i % 97) as f32 * 0.01).sin())
        .collect::<Vec<_>>()
        .into()
}
