use serde::Deserialize;
use tracing::{debug, warn};

/// Capability report used for scheduling decisions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeviceInfo {
    pub name: String,
    pub memory_bytes: u64,
    pub warp_size: u32,
}

/// Status word reported by a device runtime call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceStatus {
    #[default]
    Success,
    Error {
        code: i32,
        message: String,
    },
}

impl DeviceStatus {
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        DeviceStatus::Error {
            code,
            message: message.into(),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, DeviceStatus::Success)
    }
}

/// The runtime surface of one physical compute device.
///
/// Kernel bodies are supplied by callers; the trait only covers what is needed to
/// guard their invocation: launch bookkeeping, the sticky error word, the
/// completion wait, and a reset after an unrecoverable fault.
pub trait ComputeDevice: Send {
    fn info(&self) -> &DeviceInfo;

    /// Marks the start of one kernel launch.
    fn enqueue(&mut self, kernel: &str);

    /// Returns and clears the error raised by the most recent launch, without waiting.
    fn take_last_error(&mut self) -> DeviceStatus;

    /// Blocks until every enqueued kernel has finished.
    fn synchronize(&mut self) -> DeviceStatus;

    fn reset(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFault {
    /// Reported by the next launch check.
    OnLaunch(DeviceStatus),
    /// Reported by the next completion wait.
    OnSynchronize(DeviceStatus),
}

/// Host-backed device: kernels run on the calling thread (lane parallelism comes
/// from rayon inside the kernel body). Faults can be injected for testing the
/// fail-fast paths.
#[derive(Debug)]
pub struct HostDevice {
    info: DeviceInfo,
    launches: u64,
    synchronizations: u64,
    resets: u64,
    fail_after: Option<(u64, InjectedFault)>,
    launch_error: DeviceStatus,
    execution_error: DeviceStatus,
}

impl HostDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            launches: 0,
            synchronizations: 0,
            resets: 0,
            fail_after: None,
            launch_error: DeviceStatus::Success,
            execution_error: DeviceStatus::Success,
        }
    }

    /// Arms a fault that fires on the launch `launches_from_now` launches ahead
    /// (zero means the next launch).
    pub fn inject_fault(&mut self, launches_from_now: u64, fault: InjectedFault) {
        self.fail_after = Some((self.launches + launches_from_now + 1, fault));
    }

    pub fn launches(&self) -> u64 {
        self.launches
    }

    pub fn synchronizations(&self) -> u64 {
        self.synchronizations
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }
}

impl ComputeDevice for HostDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn enqueue(&mut self, kernel: &str) {
        self.launches += 1;
        if let Some((at, _)) = &self.fail_after {
            if *at == self.launches {
                if let Some((_, fault)) = self.fail_after.take() {
                    warn!(device = %self.info.name, kernel, "Injected fault armed for this launch.");
                    match fault {
                        InjectedFault::OnLaunch(status) => self.launch_error = status,
                        InjectedFault::OnSynchronize(status) => self.execution_error = status,
                    }
                }
            }
        }
    }

    fn take_last_error(&mut self) -> DeviceStatus {
        std::mem::take(&mut self.launch_error)
    }

    fn synchronize(&mut self) -> DeviceStatus {
        self.synchronizations += 1;
        std::mem::take(&mut self.execution_error)
    }

    fn reset(&mut self) {
        debug!(device = %self.info.name, "Resetting host device.");
        self.resets += 1;
        self.fail_after = None;
        self.launch_error = DeviceStatus::Success;
        self.execution_error = DeviceStatus::Success;
    }
}
