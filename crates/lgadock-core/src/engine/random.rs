use super::error::EngineError;
use rand::distributions::uniform::SampleUniform;
use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::ops::Range;
use tracing::debug;

/// State of one lane's random stream.
///
/// xoshiro256++ has a fixed, documented output sequence, so a seed or a restored
/// checkpoint replays the same draws on every host and toolchain.
pub type LaneRng = Xoshiro256PlusPlus;

/// Saved lane states, restorable with [`RandomStreamPool::restore`].
#[derive(Debug, Clone)]
pub struct StreamCheckpoint {
    seed: Option<u64>,
    lanes: Vec<LaneRng>,
}

/// Independent random streams, one per parallel lane.
///
/// Lanes are partitioned by index: a lane's state is only ever touched through
/// its own index, so lane-parallel code draws without any locking.
#[derive(Debug, Clone, Default)]
pub struct RandomStreamPool {
    seed: Option<u64>,
    lanes: Vec<LaneRng>,
}

impl RandomStreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministically derives `lane_count` lane states from `value`.
    pub fn seed(&mut self, value: u64, lane_count: usize) -> Result<(), EngineError> {
        if lane_count == 0 {
            return Err(EngineError::LaneOutOfRange { lane: 0, lanes: 0 });
        }
        let mut master = LaneRng::seed_from_u64(value);
        self.lanes.clear();
        self.lanes
            .extend((0..lane_count).map(|_| LaneRng::seed_from_u64(master.next_u64())));
        self.seed = Some(value);
        debug!(seed = value, lanes = lane_count, "Random streams seeded.");
        Ok(())
    }

    pub fn seed_value(&self) -> Option<u64> {
        self.seed
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn lane_mut(&mut self, lane: usize) -> Result<&mut LaneRng, EngineError> {
        let lanes = self.lanes.len();
        self.lanes
            .get_mut(lane)
            .ok_or(EngineError::LaneOutOfRange { lane, lanes })
    }

    /// Advances one lane and returns a value from `range`.
    pub fn draw<T>(&mut self, lane: usize, range: Range<T>) -> Result<T, EngineError>
    where
        T: SampleUniform + PartialOrd,
    {
        if !(range.start < range.end) {
            return Err(EngineError::EmptyRange);
        }
        Ok(self.lane_mut(lane)?.gen_range(range))
    }

    /// Advances one lane and returns a float in `[0, 1)`.
    pub fn draw_unit(&mut self, lane: usize) -> Result<f32, EngineError> {
        self.draw(lane, 0.0..1.0)
    }

    /// Lane states in index order, for lane-parallel kernels.
    pub fn lanes_mut(&mut self) -> &mut [LaneRng] {
        &mut self.lanes
    }

    pub fn checkpoint(&self) -> StreamCheckpoint {
        StreamCheckpoint {
            seed: self.seed,
            lanes: self.lanes.clone(),
        }
    }

    pub fn restore(&mut self, checkpoint: StreamCheckpoint) {
        self.seed = checkpoint.seed;
        self.lanes = checkpoint.lanes;
    }
}
