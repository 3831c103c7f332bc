use thiserror::Error;

/// Floats stored per grid point and map: the energy plus three gradient components.
pub const FLOATS_PER_GRID_POINT: usize = 4;
/// Maps beyond the per-atom-type ones: electrostatics and desolvation.
pub const EXTRA_GRID_MAPS: usize = 2;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParamsError {
    #[error("Docking parameter '{name}' must be greater than zero")]
    Zero { name: &'static str },

    #[error("Genes per individual ({genes}) exceed the genotype stride ({stride})")]
    GenotypeTooLong { genes: usize, stride: usize },

    #[error("Job dimensions overflow the addressable size of the {what}")]
    TooLarge { what: &'static str },
}

/// Sizing parameters of one docking job.
///
/// A job runs `num_runs` independent LGA runs side by side on one device, each with
/// `pop_size` individuals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockingParameters {
    pub num_runs: usize,
    pub pop_size: usize,
    pub num_genes: usize,
    pub num_atoms: usize,
    pub grid_size: [usize; 3],
    pub num_map_atypes: usize,
    pub max_evals: u64,
    pub max_generations: u64,
}

impl DockingParameters {
    pub fn validate(&self, genotype_stride: usize) -> Result<(), ParamsError> {
        let positive = [
            ("num_runs", self.num_runs),
            ("pop_size", self.pop_size),
            ("num_genes", self.num_genes),
            ("num_atoms", self.num_atoms),
            ("grid_size_x", self.grid_size[0]),
            ("grid_size_y", self.grid_size[1]),
            ("grid_size_z", self.grid_size[2]),
            ("num_map_atypes", self.num_map_atypes),
        ];
        if let Some(&(name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ParamsError::Zero { name });
        }
        if self.num_genes > genotype_stride {
            return Err(ParamsError::GenotypeTooLong {
                genes: self.num_genes,
                stride: genotype_stride,
            });
        }
        self.checked_grid_floats()
            .ok_or(ParamsError::TooLarge { what: "grid maps" })?;
        self.num_runs
            .checked_mul(self.pop_size)
            .and_then(|n| n.checked_mul(genotype_stride))
            .ok_or(ParamsError::TooLarge { what: "population" })?;
        self.checked_memory_bytes(genotype_stride)
            .ok_or(ParamsError::TooLarge { what: "device memory footprint" })?;
        Ok(())
    }

    /// Individuals across all runs of the job; one parallel lane each.
    #[inline]
    pub fn individuals(&self) -> usize {
        self.num_runs.saturating_mul(self.pop_size)
    }

    pub fn grid_points(&self) -> usize {
        self.grid_size
            .iter()
            .fold(1usize, |acc, &n| acc.saturating_mul(n))
    }

    /// Length of the grid energy-map buffer in floats, saturating at `usize::MAX`.
    pub fn grid_floats(&self) -> usize {
        self.checked_grid_floats().unwrap_or(usize::MAX)
    }

    /// Device memory the job needs: grid maps, both population halves and the
    /// per-individual bookkeeping arrays. Saturates at `u64::MAX`, which no device
    /// can satisfy.
    pub fn required_memory_bytes(&self, genotype_stride: usize) -> u64 {
        self.checked_memory_bytes(genotype_stride)
            .unwrap_or(u64::MAX)
    }

    fn checked_grid_floats(&self) -> Option<usize> {
        let points = self
            .grid_size
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))?;
        self.num_map_atypes
            .checked_add(EXTRA_GRID_MAPS)?
            .checked_mul(FLOATS_PER_GRID_POINT)?
            .checked_mul(points)
    }

    fn checked_memory_bytes(&self, genotype_stride: usize) -> Option<u64> {
        let float = size_of::<f32>() as u64;
        let individuals = u64::try_from(self.num_runs.checked_mul(self.pop_size)?).ok()?;
        let grid = u64::try_from(self.checked_grid_floats()?)
            .ok()?
            .checked_mul(float)?;
        let genomes = individuals
            .checked_mul(u64::try_from(genotype_stride).ok()?)?
            .checked_mul(2 * float)?;
        let fitness = individuals.checked_mul(2 * float)?;
        let evals = individuals
            .checked_mul(size_of::<u32>() as u64)?
            .checked_add(u64::try_from(self.num_runs).ok()?.checked_mul(8)?)?;
        grid.checked_add(genomes)?
            .checked_add(fitness)?
            .checked_add(evals)
    }
}
