use super::device::DeviceInfo;
use super::error::EngineError;
use crate::core::ids::{BufferId, DeviceId};
use crate::core::params::DockingParameters;
use crate::core::tables::{KernelConstants, TableKind};
use slotmap::SlotMap;
use tracing::debug;

/// Reduction constants derived from the device's warp (SIMD group) width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarpConstants {
    pub size: u32,
    pub mask: u32,
    pub bits: u32,
}

impl WarpConstants {
    pub fn from_warp_size(size: u32) -> Option<Self> {
        size.is_power_of_two().then(|| Self {
            size,
            mask: size - 1,
            bits: size.trailing_zeros(),
        })
    }
}

/// Storage behind a [`BufferId`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceBuffer {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl DeviceBuffer {
    pub fn len(&self) -> usize {
        match self {
            DeviceBuffer::F32(v) => v.len(),
            DeviceBuffer::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handles of the integer rotatable-bond tables uploaded for the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotbondBuffers {
    pub rotbonds: BufferId,
    pub rotbonds_atoms: BufferId,
    pub num_rotating_atoms_per_rotbond: BufferId,
}

/// One physical device's kernel constants and scratch grid buffer.
///
/// Buffers live in an arena owned by the context and are addressed through
/// opaque [`BufferId`] handles. The grid buffer survives across runs and only
/// grows when a run needs more than is preallocated.
#[derive(Debug)]
pub struct DeviceContext {
    logical_id: DeviceId,
    physical_id: usize,
    name: String,
    warp: WarpConstants,
    buffers: SlotMap<BufferId, DeviceBuffer>,
    grid: BufferId,
    grid_len: usize,
    constants: Option<KernelConstants>,
    rotbonds: Option<RotbondBuffers>,
}

impl DeviceContext {
    pub fn new(
        logical_id: DeviceId,
        physical_id: usize,
        info: &DeviceInfo,
    ) -> Result<Self, EngineError> {
        let warp = WarpConstants::from_warp_size(info.warp_size).ok_or_else(|| {
            EngineError::InvalidDevice {
                name: info.name.clone(),
                reason: format!("warp size {} is not a power of two", info.warp_size),
            }
        })?;

        let mut buffers = SlotMap::with_key();
        let grid = buffers.insert(DeviceBuffer::F32(Vec::new()));

        Ok(Self {
            logical_id,
            physical_id,
            name: info.name.clone(),
            warp,
            buffers,
            grid,
            grid_len: 0,
            constants: None,
            rotbonds: None,
        })
    }

    pub fn logical_id(&self) -> DeviceId {
        self.logical_id
    }

    pub fn physical_id(&self) -> usize {
        self.physical_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn warp(&self) -> WarpConstants {
        self.warp
    }

    /// Grid floats that fit without reallocation.
    pub fn preallocated_grid_size(&self) -> usize {
        match self.buffers.get(self.grid) {
            Some(DeviceBuffer::F32(grid)) => grid.len(),
            _ => 0,
        }
    }

    /// Grows the grid buffer to hold `floats` values; never shrinks it.
    pub fn ensure_grid_capacity(&mut self, floats: usize) -> Result<(), EngineError> {
        let current = self.preallocated_grid_size();
        if floats <= current {
            return Ok(());
        }
        match self.buffers.get_mut(self.grid) {
            Some(DeviceBuffer::F32(grid)) => {
                debug!(
                    device = %self.logical_id,
                    from = current,
                    to = floats,
                    "Reallocating grid buffer."
                );
                grid.resize(floats, 0.0);
                Ok(())
            }
            _ => Err(EngineError::Internal(format!(
                "grid buffer of {} is missing from the arena",
                self.logical_id
            ))),
        }
    }

    /// Installs the run's constant tables and grid maps.
    ///
    /// Tables stay immutable until [`DeviceContext::clear_run`]; loading twice for
    /// the same run is rejected.
    pub fn load_run(
        &mut self,
        params: &DockingParameters,
        constants: KernelConstants,
        grid_maps: &[f32],
    ) -> Result<(), EngineError> {
        if self.constants.is_some() {
            return Err(EngineError::TablesAlreadyLoaded {
                device: self.logical_id,
            });
        }
        let expected = params.grid_floats();
        if grid_maps.len() != expected {
            return Err(EngineError::GridSize {
                expected,
                actual: grid_maps.len(),
            });
        }

        self.ensure_grid_capacity(expected)?;
        if let Some(DeviceBuffer::F32(grid)) = self.buffers.get_mut(self.grid) {
            grid[..expected].copy_from_slice(grid_maps);
        }
        self.grid_len = expected;

        let rot = constants.rotbonds();
        self.rotbonds = Some(RotbondBuffers {
            rotbonds: self.buffers.insert(DeviceBuffer::I32(rot.rotbonds.clone())),
            rotbonds_atoms: self
                .buffers
                .insert(DeviceBuffer::I32(rot.rotbonds_atoms.clone())),
            num_rotating_atoms_per_rotbond: self.buffers.insert(DeviceBuffer::I32(
                rot.num_rotating_atoms_per_rotbond.clone(),
            )),
        });

        debug!(
            device = %self.logical_id,
            grid_floats = expected,
            table_bytes = constants.total_bytes(),
            "Kernel constants loaded."
        );
        self.constants = Some(constants);
        Ok(())
    }

    /// Drops the run's tables; the grid allocation is kept for the next run.
    pub fn clear_run(&mut self) {
        if let Some(rot) = self.rotbonds.take() {
            self.buffers.remove(rot.rotbonds);
            self.buffers.remove(rot.rotbonds_atoms);
            self.buffers.remove(rot.num_rotating_atoms_per_rotbond);
        }
        self.constants = None;
        self.grid_len = 0;
    }

    pub fn has_run_loaded(&self) -> bool {
        self.constants.is_some()
    }

    pub fn constants(&self) -> Result<&KernelConstants, EngineError> {
        self.constants.as_ref().ok_or(EngineError::TablesNotLoaded {
            device: self.logical_id,
        })
    }

    pub fn table(&self, kind: TableKind) -> Result<&[u8], EngineError> {
        Ok(self.constants()?.table(kind))
    }

    pub fn grid_id(&self) -> BufferId {
        self.grid
    }

    /// The loaded grid maps of the current run.
    pub fn grid_maps(&self) -> &[f32] {
        match self.buffers.get(self.grid) {
            Some(DeviceBuffer::F32(grid)) => &grid[..self.grid_len],
            _ => &[],
        }
    }

    pub fn rotbond_buffers(&self) -> Option<RotbondBuffers> {
        self.rotbonds
    }

    pub fn buffer_f32(&self, id: BufferId) -> Option<&[f32]> {
        match self.buffers.get(id)? {
            DeviceBuffer::F32(v) => Some(v.as_slice()),
            DeviceBuffer::I32(_) => None,
        }
    }

    pub fn buffer_i32(&self, id: BufferId) -> Option<&[i32]> {
        match self.buffers.get(id)? {
            DeviceBuffer::I32(v) => Some(v.as_slice()),
            DeviceBuffer::F32(_) => None,
        }
    }
}
