//! Multi-device scheduling.
//!
//! The pool owns one [`DeviceSlot`] per physical device: the device handle plus its
//! context, population, random streams and ledger. Acquiring a device moves its slot
//! out of the pool into a [`DeviceLease`], so a busy device is reachable only
//! through the lease of the run holding it. Dropping the lease returns the slot.
//!
//! Waiters block on a condition variable and are served in arrival order. Among
//! free devices the one whose preallocated grid is the smallest that still fits
//! the run is preferred, then the lowest device id. When no free device fits
//! without reallocation, the largest preallocated one is chosen.

use super::config::EngineConfig;
use super::context::DeviceContext;
use super::device::{ComputeDevice, DeviceInfo};
use super::error::{AcquireError, EngineError};
use super::ledger::EvaluationLedger;
use super::population::{PopulationLayout, PopulationStore};
use super::random::RandomStreamPool;
use crate::core::ids::DeviceId;
use crate::core::params::DockingParameters;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What a run asks of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub params: DockingParameters,
    pub seed: u64,
}

impl RunRequest {
    pub fn new(params: DockingParameters, seed: u64) -> Self {
        Self { params, seed }
    }

    pub fn required_grid_floats(&self) -> usize {
        self.params.grid_floats()
    }

    pub fn required_memory_bytes(&self, config: &EngineConfig) -> u64 {
        self.params.required_memory_bytes(config.genotype_stride)
    }
}

/// Everything a run needs from one device.
#[derive(Debug)]
pub struct DeviceSlot<D> {
    device: D,
    context: DeviceContext,
    population: PopulationStore,
    streams: RandomStreamPool,
    ledger: EvaluationLedger,
}

/// Disjoint mutable borrows of a slot's parts, for driving one generation.
pub struct SlotParts<'a, D> {
    pub device: &'a mut D,
    pub context: &'a DeviceContext,
    pub population: &'a mut PopulationStore,
    pub streams: &'a mut RandomStreamPool,
    pub ledger: &'a EvaluationLedger,
}

impl<D: ComputeDevice> DeviceSlot<D> {
    fn new(id: DeviceId, physical_id: usize, device: D, config: &EngineConfig) -> Result<Self, EngineError> {
        let context = DeviceContext::new(id, physical_id, device.info())?;
        let layout = PopulationLayout {
            num_runs: 1,
            pop_size: 1,
            num_genes: 1,
            genotype_stride: config.genotype_stride,
        };
        Ok(Self {
            device,
            context,
            population: PopulationStore::new(layout, &config.numeric)?,
            streams: RandomStreamPool::new(),
            ledger: EvaluationLedger::new(),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.context.logical_id()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut DeviceContext {
        &mut self.context
    }

    pub fn population(&self) -> &PopulationStore {
        &self.population
    }

    pub fn population_mut(&mut self) -> &mut PopulationStore {
        &mut self.population
    }

    pub fn streams_mut(&mut self) -> &mut RandomStreamPool {
        &mut self.streams
    }

    pub fn ledger(&self) -> &EvaluationLedger {
        &self.ledger
    }

    pub fn parts_mut(&mut self) -> SlotParts<'_, D> {
        SlotParts {
            device: &mut self.device,
            context: &self.context,
            population: &mut self.population,
            streams: &mut self.streams,
            ledger: &self.ledger,
        }
    }

    /// Sizes buffers for the run (lazily growing them), seeds one random lane per
    /// individual and resets the per-run counters.
    fn prepare(&mut self, request: &RunRequest, config: &EngineConfig) -> Result<(), EngineError> {
        let params = &request.params;
        params.validate(config.genotype_stride)?;
        let lanes = params.individuals();
        if lanes > config.max_lanes {
            return Err(EngineError::LaneLimit {
                requested: lanes,
                max: config.max_lanes,
            });
        }
        self.context.clear_run();
        self.context.ensure_grid_capacity(request.required_grid_floats())?;
        self.population.reshape(PopulationLayout {
            num_runs: params.num_runs,
            pop_size: params.pop_size,
            num_genes: params.num_genes,
            genotype_stride: config.genotype_stride,
        })?;
        self.streams.seed(request.seed, lanes)?;
        self.ledger.begin_run(params.num_runs);
        Ok(())
    }
}

/// Public, copyable view of one scheduler entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntryInfo {
    pub id: DeviceId,
    pub name: String,
    pub memory_bytes: u64,
    pub busy: bool,
    pub preallocated_grid_size: usize,
}

#[derive(Debug)]
struct Entry<D> {
    id: DeviceId,
    info: DeviceInfo,
    busy: bool,
    preallocated_grid_size: usize,
    slot: Option<DeviceSlot<D>>,
}

#[derive(Debug)]
struct PoolState<D> {
    entries: Vec<Entry<D>>,
    waiting: VecDeque<u64>,
    next_ticket: u64,
}

enum Selection {
    Chosen(usize),
    Busy,
    Unsatisfiable(u64),
}

impl<D> PoolState<D> {
    fn select(&self, required_bytes: u64, required_grid: usize) -> Selection {
        let eligible: Vec<(usize, &Entry<D>)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.info.memory_bytes >= required_bytes)
            .collect();
        if eligible.is_empty() {
            return Selection::Unsatisfiable(required_bytes);
        }

        let free = || eligible.iter().filter(|(_, e)| !e.busy);
        let fitting = free()
            .filter(|(_, e)| e.preallocated_grid_size >= required_grid)
            .min_by_key(|(_, e)| (e.preallocated_grid_size, e.id));
        let chosen = fitting.or_else(|| {
            free().min_by_key(|(_, e)| (Reverse(e.preallocated_grid_size), e.id))
        });

        match chosen {
            Some((index, _)) => Selection::Chosen(*index),
            None => Selection::Busy,
        }
    }

    fn take(&mut self, index: usize) -> Result<DeviceSlot<D>, EngineError> {
        let entry = &mut self.entries[index];
        let slot = entry.slot.take().ok_or_else(|| {
            EngineError::Internal(format!("{} is free but holds no slot", entry.id))
        })?;
        entry.busy = true;
        Ok(slot)
    }
}

/// Fixed pool of devices with blocking acquire and release.
pub struct DevicePool<D> {
    state: Mutex<PoolState<D>>,
    available: Condvar,
    config: Arc<EngineConfig>,
}

impl<D: ComputeDevice> DevicePool<D> {
    /// Registers every device once; logical ids follow the order given.
    pub fn new(devices: Vec<D>, config: Arc<EngineConfig>) -> Result<Self, EngineError> {
        let mut entries = Vec::with_capacity(devices.len());
        for (index, device) in devices.into_iter().enumerate() {
            let id = DeviceId(index);
            let info = device.info().clone();
            let slot = DeviceSlot::new(id, index, device, &config)?;
            info!(%id, name = %info.name, memory_bytes = info.memory_bytes, "Device registered.");
            entries.push(Entry {
                id,
                info,
                busy: false,
                preallocated_grid_size: 0,
                slot: Some(slot),
            });
        }
        Ok(Self {
            state: Mutex::new(PoolState {
                entries,
                waiting: VecDeque::new(),
                next_ticket: 0,
            }),
            available: Condvar::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<DeviceEntryInfo> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| DeviceEntryInfo {
                id: e.id,
                name: e.info.name.clone(),
                memory_bytes: e.info.memory_bytes,
                busy: e.busy,
                preallocated_grid_size: e.preallocated_grid_size,
            })
            .collect()
    }

    pub fn is_busy(&self, id: DeviceId) -> Option<bool> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.busy)
    }

    /// Blocks until a device can take the run.
    pub fn acquire(&self, request: &RunRequest) -> Result<DeviceLease<'_, D>, EngineError> {
        self.acquire_until(request, None)
    }

    /// Like [`DevicePool::acquire`] but gives up after `timeout`.
    pub fn acquire_timeout(
        &self,
        request: &RunRequest,
        timeout: Duration,
    ) -> Result<DeviceLease<'_, D>, EngineError> {
        self.acquire_until(request, Some(Instant::now() + timeout))
    }

    /// Non-blocking acquire; reports [`AcquireError::NoCapacity`] instead of waiting.
    pub fn try_acquire(&self, request: &RunRequest) -> Result<DeviceLease<'_, D>, EngineError> {
        let required_bytes = request.required_memory_bytes(&self.config);
        let slot = {
            let mut state = self.state.lock();
            if !state.waiting.is_empty() {
                return Err(AcquireError::NoCapacity.into());
            }
            match state.select(required_bytes, request.required_grid_floats()) {
                Selection::Chosen(index) => state.take(index)?,
                Selection::Busy => return Err(AcquireError::NoCapacity.into()),
                Selection::Unsatisfiable(required_bytes) => {
                    return Err(AcquireError::Unsatisfiable { required_bytes }.into());
                }
            }
        };
        self.lease(slot, request)
    }

    fn acquire_until(
        &self,
        request: &RunRequest,
        deadline: Option<Instant>,
    ) -> Result<DeviceLease<'_, D>, EngineError> {
        let required_bytes = request.required_memory_bytes(&self.config);
        let required_grid = request.required_grid_floats();

        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting.push_back(ticket);

        let slot = loop {
            if state.waiting.front() == Some(&ticket) {
                match state.select(required_bytes, required_grid) {
                    Selection::Chosen(index) => {
                        state.waiting.pop_front();
                        let slot = state.take(index);
                        self.available.notify_all();
                        break slot?;
                    }
                    Selection::Unsatisfiable(required_bytes) => {
                        state.waiting.pop_front();
                        self.available.notify_all();
                        return Err(AcquireError::Unsatisfiable { required_bytes }.into());
                    }
                    Selection::Busy => {}
                }
            }

            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        state.waiting.retain(|&t| t != ticket);
                        self.available.notify_all();
                        return Err(AcquireError::Timeout.into());
                    }
                }
                None => self.available.wait(&mut state),
            }
        };
        drop(state);

        self.lease(slot, request)
    }

    fn lease(
        &self,
        slot: DeviceSlot<D>,
        request: &RunRequest,
    ) -> Result<DeviceLease<'_, D>, EngineError> {
        let mut lease = DeviceLease {
            pool: self,
            slot: Some(slot),
        };
        debug!(device = %lease.id(), seed = request.seed, "Device acquired.");
        lease.prepare(request, &self.config)?;
        Ok(lease)
    }

    /// Returns a device to the pool. Equivalent to dropping the lease.
    pub fn release(&self, lease: DeviceLease<'_, D>) {
        drop(lease);
    }

    fn give_back(&self, mut slot: DeviceSlot<D>) {
        slot.context.clear_run();
        let id = slot.id();
        let preallocated = slot.context.preallocated_grid_size();
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            entry.preallocated_grid_size = preallocated;
            entry.slot = Some(slot);
            entry.busy = false;
        }
        drop(state);
        debug!(device = %id, "Device released.");
        self.available.notify_all();
    }

    /// Resets every idle device; used after a fault before the process exits.
    pub fn reset_idle_devices(&self) {
        let mut state = self.state.lock();
        for entry in state.entries.iter_mut() {
            if let Some(slot) = entry.slot.as_mut() {
                slot.device.reset();
            }
        }
    }
}

/// Exclusive hold on one device for the duration of a run.
pub struct DeviceLease<'p, D: ComputeDevice> {
    pool: &'p DevicePool<D>,
    slot: Option<DeviceSlot<D>>,
}

impl<D: ComputeDevice> Deref for DeviceLease<'_, D> {
    type Target = DeviceSlot<D>;

    fn deref(&self) -> &Self::Target {
        // The slot is only taken out in `drop`.
        self.slot.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<D: ComputeDevice> DerefMut for DeviceLease<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slot.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<D: ComputeDevice> Drop for DeviceLease<'_, D> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.give_back(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::device::HostDevice;
    use std::sync::mpsc;
    use std::thread;

    fn host(name: &str, memory_bytes: u64) -> HostDevice {
        HostDevice::new(DeviceInfo {
            name: name.to_string(),
            memory_bytes,
            warp_size: 32,
        })
    }

    fn params(grid: usize) -> DockingParameters {
        DockingParameters {
            num_runs: 2,
            pop_size: 10,
            num_genes: 6,
            num_atoms: 5,
            grid_size: [grid, grid, grid],
            num_map_atypes: 2,
            max_evals: 1000,
            max_generations: 50,
        }
    }

    fn request(grid: usize) -> RunRequest {
        RunRequest::new(params(grid), 42)
    }

    fn pool(devices: Vec<HostDevice>) -> DevicePool<HostDevice> {
        DevicePool::new(devices, Arc::new(EngineConfig::default())).unwrap()
    }

    #[test]
    fn acquires_follow_device_id_order_and_third_reports_no_capacity() {
        let pool = pool(vec![host("a", 1 << 30), host("b", 1 << 30)]);
        let first = pool.acquire(&request(4)).unwrap();
        let second = pool.acquire(&request(4)).unwrap();
        assert_eq!(first.id(), DeviceId(0));
        assert_eq!(second.id(), DeviceId(1));
        assert!(matches!(
            pool.try_acquire(&request(4)),
            Err(EngineError::Acquire(AcquireError::NoCapacity))
        ));
    }

    #[test]
    fn busy_flag_holds_until_release() {
        let pool = pool(vec![host("a", 1 << 30)]);
        let lease = pool.acquire(&request(4)).unwrap();
        assert_eq!(pool.is_busy(DeviceId(0)), Some(true));
        pool.release(lease);
        assert_eq!(pool.is_busy(DeviceId(0)), Some(false));
        assert_eq!(pool.is_busy(DeviceId(7)), None);
    }

    #[test]
    fn third_acquire_blocks_until_a_release() {
        let pool = pool(vec![host("a", 1 << 30), host("b", 1 << 30)]);
        let first = pool.acquire(&request(4)).unwrap();
        let _second = pool.acquire(&request(4)).unwrap();

        thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            let pool = &pool;
            s.spawn(move || {
                let lease = pool.acquire(&request(4)).unwrap();
                tx.send(lease.id()).unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
            drop(first);
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                DeviceId(0)
            );
        });
    }

    #[test]
    fn acquire_timeout_gives_up_when_nothing_is_released() {
        let pool = pool(vec![host("a", 1 << 30)]);
        let _held = pool.acquire(&request(4)).unwrap();
        let result = pool.acquire_timeout(&request(4), Duration::from_millis(50));
        assert!(matches!(
            result,
            Err(EngineError::Acquire(AcquireError::Timeout))
        ));
        drop(_held);
        assert!(pool.try_acquire(&request(4)).is_ok());
    }

    #[test]
    fn never_returns_a_busy_device() {
        let pool = pool(vec![host("a", 1 << 30), host("b", 1 << 30), host("c", 1 << 30)]);
        let leases: Vec<_> = (0..3).map(|_| pool.acquire(&request(4)).unwrap()).collect();
        let mut ids: Vec<_> = leases.iter().map(|l| l.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(pool.entries().iter().all(|e| e.busy));
    }

    #[test]
    fn devices_too_small_for_the_run_are_skipped() {
        let needed = request(4).required_memory_bytes(&EngineConfig::default());
        let pool = pool(vec![host("small", needed - 1), host("large", needed)]);
        let lease = pool.acquire(&request(4)).unwrap();
        assert_eq!(lease.id(), DeviceId(1));
    }

    #[test]
    fn unsatisfiable_requests_fail_instead_of_blocking() {
        let pool = pool(vec![host("tiny", 1024)]);
        assert!(matches!(
            pool.acquire(&request(4)),
            Err(EngineError::Acquire(AcquireError::Unsatisfiable { .. }))
        ));
    }

    #[test]
    fn oversized_jobs_are_unsatisfiable_rather_than_overflowing() {
        let pool = pool(vec![host("a", 1 << 30)]);
        let huge = RunRequest::new(params(1 << 22), 1);
        assert_eq!(huge.required_memory_bytes(&EngineConfig::default()), u64::MAX);
        assert!(matches!(
            pool.try_acquire(&huge),
            Err(EngineError::Acquire(AcquireError::Unsatisfiable { .. }))
        ));
        assert!(matches!(
            pool.acquire(&huge),
            Err(EngineError::Acquire(AcquireError::Unsatisfiable { .. }))
        ));
        assert_eq!(pool.is_busy(DeviceId(0)), Some(false));
    }

    #[test]
    fn best_fit_prefers_the_smallest_sufficient_preallocation() {
        let pool = pool(vec![host("a", 1 << 30), host("b", 1 << 30), host("c", 1 << 30)]);
        {
            let _a = pool.acquire(&request(8)).unwrap();
            let _b = pool.acquire(&request(4)).unwrap();
        }
        let grids: Vec<usize> = pool.entries().iter().map(|e| e.preallocated_grid_size).collect();
        assert_eq!(grids, vec![params(8).grid_floats(), params(4).grid_floats(), 0]);

        let lease = pool.acquire(&request(4)).unwrap();
        assert_eq!(lease.id(), DeviceId(1));
        drop(lease);

        let lease = pool.acquire(&request(6)).unwrap();
        assert_eq!(lease.id(), DeviceId(0));
        drop(lease);

        let lease = pool.acquire(&request(10)).unwrap();
        assert_eq!(lease.id(), DeviceId(0));
        assert_eq!(
            lease.context().preallocated_grid_size(),
            params(10).grid_floats()
        );
    }

    #[test]
    fn acquire_prepares_population_streams_and_ledger() {
        let pool = pool(vec![host("a", 1 << 30)]);
        let lease = pool.acquire(&request(4)).unwrap();
        assert_eq!(lease.population().layout().individuals(), 20);
        assert_eq!(lease.population().generation(), 0);
        assert_eq!(lease.ledger().num_runs(), 2);
        assert!(!lease.context().has_run_loaded());
    }

    #[test]
    fn lane_limit_is_enforced_and_the_device_is_returned() {
        let config = EngineConfig {
            max_lanes: 8,
            ..EngineConfig::default()
        };
        let pool = DevicePool::new(vec![host("a", 1 << 30)], Arc::new(config)).unwrap();
        assert!(matches!(
            pool.acquire(&request(4)),
            Err(EngineError::LaneLimit { requested: 20, max: 8 })
        ));
        assert_eq!(pool.is_busy(DeviceId(0)), Some(false));
    }

    #[test]
    fn invalid_warp_size_is_rejected_at_registration() {
        let device = HostDevice::new(DeviceInfo {
            name: "odd".to_string(),
            memory_bytes: 1 << 30,
            warp_size: 24,
        });
        assert!(DevicePool::new(vec![device], Arc::new(EngineConfig::default())).is_err());
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let pool = pool(vec![host("a", 1 << 30)]);
        let held = pool.acquire(&request(4)).unwrap();
        let order = Mutex::new(Vec::new());

        thread::scope(|s| {
            for waiter in 0..3 {
                let pool = &pool;
                let order = &order;
                s.spawn(move || {
                    let lease = pool.acquire(&request(4)).unwrap();
                    order.lock().push(waiter);
                    thread::sleep(Duration::from_millis(10));
                    drop(lease);
                });
                // Let each waiter queue up before the next one arrives.
                thread::sleep(Duration::from_millis(50));
            }
            drop(held);
        });

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
