use super::launch::LaunchMode;
use crate::core::fixed_point::{FixedPointCodec, NumericConfig};
use thiserror::Error;

/// Padded genotype length of one individual in device memory.
pub const DEFAULT_GENOTYPE_STRIDE: usize = 64;
pub const DEFAULT_MAX_LANES: usize = 1 << 16;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{name}': {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Immutable engine-wide configuration, built once at startup and shared by
/// reference with every device slot.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub numeric: NumericConfig,
    pub launch_mode: LaunchMode,
    pub genotype_stride: usize,
    pub max_lanes: usize,
}

impl EngineConfig {
    pub fn codec(&self) -> FixedPointCodec {
        FixedPointCodec::new(&self.numeric)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            numeric: NumericConfig::default(),
            launch_mode: LaunchMode::default(),
            genotype_stride: DEFAULT_GENOTYPE_STRIDE,
            max_lanes: DEFAULT_MAX_LANES,
        }
    }
}

#[derive(Default)]
pub struct EngineConfigBuilder {
    numeric: Option<NumericConfig>,
    launch_mode: Option<LaunchMode>,
    genotype_stride: Option<usize>,
    max_lanes: Option<usize>,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn numeric(mut self, numeric: NumericConfig) -> Self {
        self.numeric = Some(numeric);
        self
    }
    pub fn launch_mode(mut self, mode: LaunchMode) -> Self {
        self.launch_mode = Some(mode);
        self
    }
    pub fn genotype_stride(mut self, stride: usize) -> Self {
        self.genotype_stride = Some(stride);
        self
    }
    pub fn max_lanes(mut self, lanes: usize) -> Self {
        self.max_lanes = Some(lanes);
        self
    }

    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        let config = EngineConfig {
            numeric: self
                .numeric
                .ok_or(ConfigError::MissingParameter("numeric"))?,
            launch_mode: self
                .launch_mode
                .ok_or(ConfigError::MissingParameter("launch_mode"))?,
            genotype_stride: self
                .genotype_stride
                .ok_or(ConfigError::MissingParameter("genotype_stride"))?,
            max_lanes: self
                .max_lanes
                .ok_or(ConfigError::MissingParameter("max_lanes"))?,
        };

        if !config.numeric.is_representable() {
            return Err(ConfigError::Invalid {
                name: "numeric",
                reason: format!(
                    "{} fraction bits with {}/{} headroom bits do not fit a 32-bit term",
                    config.numeric.term_bits,
                    config.numeric.term_headroom_bits,
                    config.numeric.reduce_headroom_bits
                ),
            });
        }
        if config.genotype_stride == 0 {
            return Err(ConfigError::Invalid {
                name: "genotype_stride",
                reason: "must be greater than zero".to_string(),
            });
        }
        if config.max_lanes == 0 {
            return Err(ConfigError::Invalid {
                name: "max_lanes",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(config)
    }
}
