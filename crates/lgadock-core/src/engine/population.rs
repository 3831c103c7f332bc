//! Double-buffered population storage.
//!
//! Two genome buffers and two fitness buffers form a ping-pong pair. One half is
//! active (the current generation, read-only) and the other is being written
//! (the next generation). Roles only change through
//! [`PopulationStore::swap_generation`], which needs exclusive access to the store
//! and the [`Completion`] of the kernel that filled the writing half. Readers of
//! the active half and the writer of the other half therefore can never overlap
//! with a swap.

use super::error::EngineError;
use super::launch::Completion;
use crate::core::fixed_point::NumericConfig;
use rayon::prelude::*;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Half {
    A,
    B,
}

impl Half {
    #[inline]
    pub fn other(self) -> Self {
        match self {
            Half::A => Half::B,
            Half::B => Half::A,
        }
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            Half::A => 0,
            Half::B => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulationLayout {
    pub num_runs: usize,
    pub pop_size: usize,
    pub num_genes: usize,
    pub genotype_stride: usize,
}

impl PopulationLayout {
    #[inline]
    pub fn individuals(&self) -> usize {
        self.num_runs * self.pop_size
    }

    #[inline]
    pub fn genome_floats(&self) -> usize {
        self.individuals() * self.genotype_stride
    }

    /// Global index of `individual` within `run`.
    #[inline]
    pub fn index_of(&self, run: usize, individual: usize) -> usize {
        run * self.pop_size + individual
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.individuals() == 0 || self.num_genes == 0 {
            return Err(EngineError::Internal(
                "population layout must hold at least one gene and individual".to_string(),
            ));
        }
        if self.num_genes > self.genotype_stride {
            return Err(EngineError::Internal(format!(
                "{} genes do not fit the genotype stride of {}",
                self.num_genes, self.genotype_stride
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Buffers {
    genomes: Vec<f32>,
    fitness: Vec<f32>,
}

#[derive(Debug)]
pub struct PopulationStore {
    halves: [Buffers; 2],
    active: Half,
    generation: u64,
    layout: PopulationLayout,
    worst_fitness: f32,
}

impl PopulationStore {
    pub fn new(layout: PopulationLayout, numeric: &NumericConfig) -> Result<Self, EngineError> {
        let mut store = Self {
            halves: [Buffers::default(), Buffers::default()],
            active: Half::A,
            generation: 0,
            layout,
            worst_fitness: numeric.max_energy,
        };
        store.reshape(layout)?;
        Ok(store)
    }

    /// Resizes both halves for a new run and resets roles to generation 0.
    ///
    /// Allocations are reused; memory only grows when the new layout needs more.
    /// Fitness is reset to the worst-energy sentinel.
    pub fn reshape(&mut self, layout: PopulationLayout) -> Result<(), EngineError> {
        layout.validate()?;
        let genome_floats = layout.genome_floats();
        let individuals = layout.individuals();
        for half in &mut self.halves {
            if half.genomes.capacity() < genome_floats {
                debug!(
                    from = half.genomes.capacity(),
                    to = genome_floats,
                    "Reallocating population genome buffer."
                );
            }
            half.genomes.clear();
            half.genomes.resize(genome_floats, 0.0);
            half.fitness.clear();
            half.fitness.resize(individuals, self.worst_fitness);
        }
        self.layout = layout;
        self.active = Half::A;
        self.generation = 0;
        Ok(())
    }

    pub fn layout(&self) -> PopulationLayout {
        self.layout
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn active_half(&self) -> Half {
        self.active
    }

    pub fn writing_half(&self) -> Half {
        self.active.other()
    }

    pub fn active(&self) -> PopulationView<'_> {
        let buffers = &self.halves[self.active.index()];
        PopulationView {
            layout: self.layout,
            half: self.active,
            genomes: &buffers.genomes,
            fitness: &buffers.fitness,
        }
    }

    pub fn writing_mut(&mut self) -> PopulationViewMut<'_> {
        let half = self.active.other();
        let buffers = &mut self.halves[half.index()];
        PopulationViewMut {
            layout: self.layout,
            half,
            genomes: &mut buffers.genomes,
            fitness: &mut buffers.fitness,
        }
    }

    /// Read view of the current generation and write view of the next one.
    pub fn split(&mut self) -> (PopulationView<'_>, PopulationViewMut<'_>) {
        let layout = self.layout;
        let active = self.active;
        let (a, b) = self.halves.split_at_mut(1);
        let (read, write) = match active {
            Half::A => (&a[0], &mut b[0]),
            Half::B => (&b[0], &mut a[0]),
        };
        (
            PopulationView {
                layout,
                half: active,
                genomes: &read.genomes,
                fitness: &read.fitness,
            },
            PopulationViewMut {
                layout,
                half: active.other(),
                genomes: &mut write.genomes,
                fitness: &mut write.fitness,
            },
        )
    }

    /// Write access to generation 0 before it is first published by a swap.
    pub fn initial_mut(&mut self) -> Result<PopulationViewMut<'_>, EngineError> {
        if self.generation != 0 {
            return Err(EngineError::PopulationPublished);
        }
        let half = self.active;
        let buffers = &mut self.halves[half.index()];
        Ok(PopulationViewMut {
            layout: self.layout,
            half,
            genomes: &mut buffers.genomes,
            fitness: &mut buffers.fitness,
        })
    }

    /// Publishes the writing half as the new generation. Constant time, no copy.
    pub fn swap_generation(&mut self, completion: Completion) -> Half {
        self.active = self.active.other();
        self.generation += 1;
        trace!(
            generation = self.generation,
            active = ?self.active,
            kernel = completion.kernel(),
            "Population generation swapped."
        );
        self.active
    }

    /// Lowest fitness of `run` in the current generation, with its individual index.
    pub fn best_of_generation(&self, run: usize) -> Result<(usize, f32), EngineError> {
        self.active().best_in_run(run)
    }
}

/// Read-only view of one population half.
#[derive(Debug, Clone, Copy)]
pub struct PopulationView<'a> {
    layout: PopulationLayout,
    half: Half,
    genomes: &'a [f32],
    fitness: &'a [f32],
}

impl<'a> PopulationView<'a> {
    pub fn half(&self) -> Half {
        self.half
    }

    pub fn layout(&self) -> PopulationLayout {
        self.layout
    }

    /// Genes of one individual (padding excluded).
    pub fn genome(&self, index: usize) -> Option<&'a [f32]> {
        let start = index * self.layout.genotype_stride;
        self.genomes.get(start..start + self.layout.num_genes)
    }

    pub fn fitness(&self, index: usize) -> Option<f32> {
        self.fitness.get(index).copied()
    }

    pub fn fitness_slice(&self) -> &'a [f32] {
        self.fitness
    }

    pub fn run_fitness(&self, run: usize) -> Result<&'a [f32], EngineError> {
        if run >= self.layout.num_runs {
            return Err(EngineError::RunOutOfRange {
                run,
                runs: self.layout.num_runs,
            });
        }
        let start = run * self.layout.pop_size;
        Ok(&self.fitness[start..start + self.layout.pop_size])
    }

    pub fn best_in_run(&self, run: usize) -> Result<(usize, f32), EngineError> {
        let fitness = self.run_fitness(run)?;
        fitness
            .iter()
            .copied()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .ok_or_else(|| EngineError::Internal(format!("run {run} has no individuals")))
    }
}

/// Mutable view of the half being written.
#[derive(Debug)]
pub struct PopulationViewMut<'a> {
    layout: PopulationLayout,
    half: Half,
    genomes: &'a mut [f32],
    fitness: &'a mut [f32],
}

impl<'a> PopulationViewMut<'a> {
    pub fn half(&self) -> Half {
        self.half
    }

    pub fn layout(&self) -> PopulationLayout {
        self.layout
    }

    pub fn genome_mut(&mut self, index: usize) -> Option<&mut [f32]> {
        let start = index * self.layout.genotype_stride;
        self.genomes.get_mut(start..start + self.layout.num_genes)
    }

    pub fn set_fitness(&mut self, index: usize, value: f32) -> Result<(), EngineError> {
        let individuals = self.fitness.len();
        let slot = self
            .fitness
            .get_mut(index)
            .ok_or(EngineError::LaneOutOfRange {
                lane: index,
                lanes: individuals,
            })?;
        *slot = value;
        Ok(())
    }

    /// One `(genes, fitness)` pair per individual, in global index order.
    pub fn par_individuals_mut(
        &mut self,
    ) -> impl IndexedParallelIterator<Item = (&mut [f32], &mut f32)> + '_ {
        let genes = self.layout.num_genes;
        self.genomes
            .par_chunks_mut(self.layout.genotype_stride)
            .map(move |chunk| &mut chunk[..genes])
            .zip(self.fitness.par_iter_mut())
    }

    pub fn individuals_mut(&mut self) -> impl Iterator<Item = (&mut [f32], &mut f32)> + '_ {
        let genes = self.layout.num_genes;
        self.genomes
            .chunks_mut(self.layout.genotype_stride)
            .map(move |chunk| &mut chunk[..genes])
            .zip(self.fitness.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::device::{DeviceInfo, HostDevice};
    use crate::engine::launch::{LaunchGuard, LaunchMode};

    fn layout() -> PopulationLayout {
        PopulationLayout {
            num_runs: 2,
            pop_size: 3,
            num_genes: 4,
            genotype_stride: 8,
        }
    }

    fn store() -> PopulationStore {
        PopulationStore::new(layout(), &NumericConfig::default()).unwrap()
    }

    fn completion() -> Completion {
        let mut device = HostDevice::new(DeviceInfo {
            name: "host".to_string(),
            memory_bytes: 1 << 20,
            warp_size: 32,
        });
        let (_, completion) = LaunchGuard::new(LaunchMode::Synchronous)
            .launch(&mut device, "gen_next", |_| ())
            .unwrap()
            .complete(&mut device)
            .unwrap();
        completion
    }

    #[test]
    fn roles_alternate_across_successive_swaps() {
        let mut store = store();
        assert_eq!(store.generation(), 0);
        assert_eq!(store.active_half(), Half::A);

        assert_eq!(store.swap_generation(completion()), Half::B);
        assert_eq!(store.generation(), 1);

        assert_eq!(store.swap_generation(completion()), Half::A);
        assert_eq!(store.generation(), 2);
        assert_eq!(store.writing_half(), Half::B);
    }

    #[test]
    fn new_store_starts_with_worst_fitness() {
        let store = store();
        assert!(
            store
                .active()
                .fitness_slice()
                .iter()
                .all(|&f| f == NumericConfig::default().max_energy)
        );
    }

    #[test]
    fn written_generation_becomes_visible_only_after_swap() {
        let mut store = store();
        {
            let mut writing = store.writing_mut();
            writing.genome_mut(1).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
            writing.set_fitness(1, -7.5).unwrap();
        }
        assert_ne!(store.active().fitness(1), Some(-7.5));

        store.swap_generation(completion());
        let active = store.active();
        assert_eq!(active.genome(1), Some(&[1.0, 2.0, 3.0, 4.0][..]));
        assert_eq!(active.fitness(1), Some(-7.5));
    }

    #[test]
    fn swap_does_not_copy_data() {
        let mut store = store();
        store.initial_mut().unwrap().set_fitness(0, 1.0).unwrap();
        store.writing_mut().set_fitness(0, 2.0).unwrap();

        store.swap_generation(completion());
        assert_eq!(store.active().fitness(0), Some(2.0));
        store.swap_generation(completion());
        assert_eq!(store.active().fitness(0), Some(1.0));
    }

    #[test]
    fn split_exposes_disjoint_halves() {
        let mut store = store();
        store.initial_mut().unwrap().set_fitness(2, 5.0).unwrap();
        let (read, mut write) = store.split();
        assert_eq!(read.half(), Half::A);
        assert_eq!(write.half(), Half::B);
        write
            .par_individuals_mut()
            .for_each(|(genes, fitness)| {
                genes.fill(0.5);
                *fitness = read.fitness(2).unwrap_or_default() * 2.0;
            });
        drop(write);
        store.swap_generation(completion());
        assert!(store.active().fitness_slice().iter().all(|&f| f == 10.0));
    }

    #[test]
    fn initial_population_is_writable_only_before_the_first_swap() {
        let mut store = store();
        assert!(store.initial_mut().is_ok());
        store.swap_generation(completion());
        assert!(matches!(
            store.initial_mut(),
            Err(EngineError::PopulationPublished)
        ));
    }

    #[test]
    fn best_of_generation_is_computed_per_run() {
        let mut store = store();
        {
            let mut init = store.initial_mut().unwrap();
            for (i, value) in [3.0, -1.0, 2.0, 0.5, 0.25, 9.0].into_iter().enumerate() {
                init.set_fitness(i, value).unwrap();
            }
        }
        assert_eq!(store.best_of_generation(0).unwrap(), (1, -1.0));
        assert_eq!(store.best_of_generation(1).unwrap(), (1, 0.25));
        assert!(matches!(
            store.best_of_generation(2),
            Err(EngineError::RunOutOfRange { run: 2, runs: 2 })
        ));
    }

    #[test]
    fn reshape_resets_roles_and_reuses_allocations() {
        let mut store = store();
        store.swap_generation(completion());
        let bigger = PopulationLayout {
            pop_size: 10,
            ..layout()
        };
        store.reshape(bigger).unwrap();
        assert_eq!(store.generation(), 0);
        assert_eq!(store.active_half(), Half::A);
        assert_eq!(store.active().fitness_slice().len(), 20);

        store.reshape(layout()).unwrap();
        assert_eq!(store.active().fitness_slice().len(), 6);
    }

    #[test]
    fn genome_views_exclude_stride_padding() {
        let mut store = store();
        let mut init = store.initial_mut().unwrap();
        let lengths: Vec<usize> = init.individuals_mut().map(|(genes, _)| genes.len()).collect();
        assert_eq!(lengths, vec![4; 6]);
    }

    #[test]
    fn invalid_layout_is_rejected() {
        let result = PopulationStore::new(
            PopulationLayout {
                num_genes: 9,
                ..layout()
            },
            &NumericConfig::default(),
        );
        assert!(result.is_err());
    }
}
