use thiserror::Error;

use super::config::ConfigError;
use super::launch::DeviceFault;
use crate::core::ids::DeviceId;
use crate::core::params::ParamsError;
use crate::core::tables::TableError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("No free device can take the run right now")]
    NoCapacity,

    #[error("No device in the pool has the {required_bytes} bytes the run needs")]
    Unsatisfiable { required_bytes: u64 },

    #[error("Timed out waiting for a free device")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid docking parameters: {0}")]
    Params(#[from] ParamsError),

    #[error("Kernel constants rejected: {0}")]
    Tables(#[from] TableError),

    #[error(transparent)]
    DeviceFault(#[from] DeviceFault),

    #[error("Device acquisition failed: {0}")]
    Acquire(#[from] AcquireError),

    #[error("Invalid device '{name}': {reason}")]
    InvalidDevice { name: String, reason: String },

    #[error("Grid map length {actual} does not match the expected {expected} floats")]
    GridSize { expected: usize, actual: usize },

    #[error("Kernel constants are already loaded on {device} for the current run")]
    TablesAlreadyLoaded { device: DeviceId },

    #[error("No kernel constants are loaded on {device}")]
    TablesNotLoaded { device: DeviceId },

    #[error("Lane {lane} is out of range for {lanes} seeded lanes")]
    LaneOutOfRange { lane: usize, lanes: usize },

    #[error("Run needs {requested} lanes but at most {max} are allowed")]
    LaneLimit { requested: usize, max: usize },

    #[error("Run index {run} is out of range for {runs} runs")]
    RunOutOfRange { run: usize, runs: usize },

    #[error("Cannot draw from an empty range")]
    EmptyRange,

    #[error("Initial population can only be written before the first generation swap")]
    PopulationPublished,

    #[error("Job {job} was halted after generation {generation}")]
    Halted { job: usize, generation: u64 },

    #[error("Internal logic error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Faults reported by a device leave its execution state untrusted.
    pub fn is_device_fault(&self) -> bool {
        matches!(self, EngineError::DeviceFault(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::launch::FaultPhase;

    #[test]
    fn device_faults_are_classified() {
        let fault = DeviceFault {
            device: "sim-0".to_string(),
            operation: "gen_next".to_string(),
            phase: FaultPhase::Execution,
            code: 700,
            message: "illegal address".to_string(),
        };
        let err = EngineError::from(fault);
        assert!(err.is_device_fault());
        assert!(err.to_string().contains("illegal address"));
        assert!(!EngineError::EmptyRange.is_device_fault());
    }

    #[test]
    fn acquire_errors_convert_into_engine_errors() {
        let err: EngineError = AcquireError::NoCapacity.into();
        assert!(matches!(err, EngineError::Acquire(AcquireError::NoCapacity)));
        assert_eq!(
            err.to_string(),
            "Device acquisition failed: No free device can take the run right now"
        );
    }
}
