//! Guarded kernel invocation.
//!
//! Every kernel launch goes through a [`LaunchGuard`]. The guard checks the device's
//! sticky error word right after the launch and, in synchronous mode, waits for
//! completion and checks again. Faults come back as a classified [`DeviceFault`];
//! deciding to abort the process is left to the orchestration layer.
//!
//! A successful wait yields a [`Completion`], the proof that every lane of the
//! kernel has finished. The population store only swaps generations against such a
//! proof.

use super::device::{ComputeDevice, DeviceStatus};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    /// Wait for completion after every launch and check its status.
    #[default]
    Synchronous,
    /// Only check the launch error word; completion is awaited later.
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPhase {
    /// The device rejected the launch itself.
    Launch,
    /// The kernel faulted while running; reported by the completion wait.
    Execution,
    /// A runtime call other than a launch failed (e.g. a buffer transfer).
    Runtime,
}

impl std::fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            FaultPhase::Launch => "launch",
            FaultPhase::Execution => "execution",
            FaultPhase::Runtime => "runtime call",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Device '{device}' faulted during {phase} of '{operation}': {message} (code {code})")]
pub struct DeviceFault {
    pub device: String,
    pub operation: String,
    pub phase: FaultPhase,
    pub code: i32,
    pub message: String,
}

impl DeviceFault {
    fn from_status(
        device: &str,
        operation: &str,
        phase: FaultPhase,
        status: DeviceStatus,
    ) -> Option<Self> {
        match status {
            DeviceStatus::Success => None,
            DeviceStatus::Error { code, message } => Some(Self {
                device: device.to_string(),
                operation: operation.to_string(),
                phase,
                code,
                message,
            }),
        }
    }
}

/// Proof that a kernel ran to completion without a fault.
#[derive(Debug)]
#[must_use]
pub struct Completion {
    kernel: &'static str,
}

impl Completion {
    pub fn kernel(&self) -> &'static str {
        self.kernel
    }
}

/// A launch accepted by the device whose completion has not been awaited yet.
#[derive(Debug)]
#[must_use = "an unawaited launch gives no guarantee that its lanes have finished"]
pub struct PendingLaunch {
    kernel: &'static str,
}

impl PendingLaunch {
    pub fn wait<D>(self, device: &mut D) -> Result<Completion, DeviceFault>
    where
        D: ComputeDevice + ?Sized,
    {
        wait_for(device, self.kernel)
    }
}

#[derive(Debug)]
pub enum Launch<R> {
    Completed { output: R, completion: Completion },
    Pending { output: R, pending: PendingLaunch },
}

impl<R> Launch<R> {
    pub fn output(&self) -> &R {
        match self {
            Launch::Completed { output, .. } | Launch::Pending { output, .. } => output,
        }
    }

    /// Returns the kernel output together with its completion proof, waiting first
    /// if the launch was asynchronous.
    pub fn complete<D>(self, device: &mut D) -> Result<(R, Completion), DeviceFault>
    where
        D: ComputeDevice + ?Sized,
    {
        match self {
            Launch::Completed { output, completion } => Ok((output, completion)),
            Launch::Pending { output, pending } => Ok((output, pending.wait(device)?)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchGuard {
    mode: LaunchMode,
}

impl LaunchGuard {
    pub fn new(mode: LaunchMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> LaunchMode {
        self.mode
    }

    /// Runs `body` as one kernel invocation on `device`.
    ///
    /// The body enqueues the kernel's work; its return value is handed back
    /// untouched once the launch is accepted.
    pub fn launch<D, F, R>(
        &self,
        device: &mut D,
        kernel: &'static str,
        body: F,
    ) -> Result<Launch<R>, DeviceFault>
    where
        D: ComputeDevice + ?Sized,
        F: FnOnce(&mut D) -> R,
    {
        device.enqueue(kernel);
        let output = body(device);

        let status = device.take_last_error();
        if let Some(fault) =
            DeviceFault::from_status(&device.info().name, kernel, FaultPhase::Launch, status)
        {
            error!(device = %fault.device, kernel, code = fault.code, "Kernel launch rejected: {}", fault.message);
            return Err(fault);
        }

        match self.mode {
            LaunchMode::Synchronous => {
                let completion = wait_for(device, kernel)?;
                trace!(kernel, "Kernel completed.");
                Ok(Launch::Completed { output, completion })
            }
            LaunchMode::Asynchronous => {
                trace!(kernel, "Kernel launched without waiting.");
                Ok(Launch::Pending {
                    output,
                    pending: PendingLaunch { kernel },
                })
            }
        }
    }
}

fn wait_for<D>(device: &mut D, kernel: &'static str) -> Result<Completion, DeviceFault>
where
    D: ComputeDevice + ?Sized,
{
    let status = device.synchronize();
    match DeviceFault::from_status(&device.info().name, kernel, FaultPhase::Execution, status) {
        Some(fault) => {
            error!(device = %fault.device, kernel, code = fault.code, "Kernel execution failed: {}", fault.message);
            Err(fault)
        }
        None => Ok(Completion { kernel }),
    }
}

/// Classifies the status of a runtime call that is not a kernel launch.
pub fn check_runtime<D>(device: &D, operation: &str, status: DeviceStatus) -> Result<(), DeviceFault>
where
    D: ComputeDevice + ?Sized,
{
    match DeviceFault::from_status(&device.info().name, operation, FaultPhase::Runtime, status) {
        Some(fault) => {
            error!(device = %fault.device, operation, code = fault.code, "Runtime call failed: {}", fault.message);
            Err(fault)
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::device::{DeviceInfo, HostDevice, InjectedFault};

    fn device() -> HostDevice {
        HostDevice::new(DeviceInfo {
            name: "host-0".to_string(),
            memory_bytes: 1 << 30,
            warp_size: 32,
        })
    }

    #[test]
    fn synchronous_launch_waits_and_yields_a_completion() {
        let mut dev = device();
        let guard = LaunchGuard::new(LaunchMode::Synchronous);
        let launch = guard.launch(&mut dev, "calc_initpop", |_| 7).unwrap();
        assert!(matches!(launch, Launch::Completed { .. }));
        assert_eq!(dev.synchronizations(), 1);

        let (output, completion) = launch.complete(&mut dev).unwrap();
        assert_eq!(output, 7);
        assert_eq!(completion.kernel(), "calc_initpop");
        assert_eq!(dev.synchronizations(), 1);
    }

    #[test]
    fn asynchronous_launch_defers_the_wait() {
        let mut dev = device();
        let guard = LaunchGuard::new(LaunchMode::Asynchronous);
        let launch = guard.launch(&mut dev, "gen_next", |_| ()).unwrap();
        assert!(matches!(launch, Launch::Pending { .. }));
        assert_eq!(dev.synchronizations(), 0);

        let (_, completion) = launch.complete(&mut dev).unwrap();
        assert_eq!(completion.kernel(), "gen_next");
        assert_eq!(dev.synchronizations(), 1);
    }

    #[test]
    fn launch_fault_is_reported_before_any_wait() {
        let mut dev = device();
        dev.inject_fault(0, InjectedFault::OnLaunch(DeviceStatus::error(9, "invalid configuration")));
        let guard = LaunchGuard::new(LaunchMode::Synchronous);
        let fault = guard.launch(&mut dev, "gen_next", |_| ()).unwrap_err();
        assert_eq!(fault.phase, FaultPhase::Launch);
        assert_eq!(fault.code, 9);
        assert_eq!(fault.operation, "gen_next");
        assert_eq!(dev.synchronizations(), 0);
    }

    #[test]
    fn execution_fault_is_reported_by_the_synchronous_wait() {
        let mut dev = device();
        dev.inject_fault(0, InjectedFault::OnSynchronize(DeviceStatus::error(700, "illegal address")));
        let guard = LaunchGuard::new(LaunchMode::Synchronous);
        let fault = guard.launch(&mut dev, "local_search", |_| ()).unwrap_err();
        assert_eq!(fault.phase, FaultPhase::Execution);
        assert_eq!(fault.device, "host-0");
    }

    #[test]
    fn asynchronous_mode_surfaces_execution_faults_at_the_deferred_wait() {
        let mut dev = device();
        dev.inject_fault(0, InjectedFault::OnSynchronize(DeviceStatus::error(700, "illegal address")));
        let guard = LaunchGuard::new(LaunchMode::Asynchronous);
        let launch = guard.launch(&mut dev, "gen_next", |_| ()).unwrap();
        let fault = launch.complete(&mut dev).unwrap_err();
        assert_eq!(fault.phase, FaultPhase::Execution);
    }

    #[test]
    fn body_runs_exactly_once_per_launch() {
        let mut dev = device();
        let guard = LaunchGuard::default();
        let mut calls = 0;
        guard
            .launch(&mut dev, "k", |_| calls += 1)
            .unwrap()
            .complete(&mut dev)
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(dev.launches(), 1);
    }

    #[test]
    fn check_runtime_classifies_failed_transfers() {
        let dev = device();
        assert!(check_runtime(&dev, "copy grids", DeviceStatus::Success).is_ok());
        let fault = check_runtime(&dev, "copy grids", DeviceStatus::error(2, "out of memory"))
            .unwrap_err();
        assert_eq!(fault.phase, FaultPhase::Runtime);
        assert!(fault.to_string().contains("runtime call of 'copy grids'"));
    }
}
