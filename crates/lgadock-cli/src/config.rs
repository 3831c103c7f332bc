use crate::cli::RunArgs;
use crate::error::{CliError, Result};
use lgadock::core::fixed_point::NumericConfig;
use lgadock::core::params::DockingParameters;
use lgadock::engine::config::{
    DEFAULT_GENOTYPE_STRIDE, DEFAULT_MAX_LANES, EngineConfig, EngineConfigBuilder,
};
use lgadock::engine::device::DeviceInfo;
use lgadock::engine::launch::LaunchMode;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Built-in values for everything the configuration file may leave out.
pub struct DefaultsConfig {
    pub jobs: usize,
    pub num_runs: usize,
    pub pop_size: usize,
    pub num_genes: usize,
    pub num_atoms: usize,
    pub grid_size: [usize; 3],
    pub num_map_atypes: usize,
    pub max_evals: u64,
    pub max_generations: u64,
    pub seed: u64,
    pub local_search_steps: u32,
    pub device_count: usize,
    pub device_memory_bytes: u64,
    pub warp_size: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            jobs: 4,
            num_runs: 10,
            pop_size: 150,
            num_genes: 7,
            num_atoms: 24,
            grid_size: [40, 40, 40],
            num_map_atypes: 6,
            max_evals: 250_000,
            max_generations: 27_000,
            seed: 42,
            local_search_steps: 4,
            device_count: 2,
            device_memory_bytes: 8 << 30,
            warp_size: 32,
        }
    }
}

/// Everything a batch needs after file values, overrides and defaults are merged.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub devices: Vec<DeviceInfo>,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub jobs: usize,
    pub params: DockingParameters,
    pub seed: u64,
    pub local_search_steps: u32,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialEngineConfig {
    numeric: Option<NumericConfig>,
    launch_mode: Option<LaunchMode>,
    genotype_stride: Option<usize>,
    max_lanes: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialBatchConfig {
    jobs: Option<usize>,
    num_runs: Option<usize>,
    pop_size: Option<usize>,
    num_genes: Option<usize>,
    num_atoms: Option<usize>,
    grid_size: Option<[usize; 3]>,
    num_map_atypes: Option<usize>,
    max_evals: Option<u64>,
    max_generations: Option<u64>,
    seed: Option<u64>,
    local_search_steps: Option<u32>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialAppConfig {
    engine: Option<PartialEngineConfig>,
    devices: Option<Vec<DeviceInfo>>,
    batch: Option<PartialBatchConfig>,
}

impl PartialAppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    /// Loads `path` when given, otherwise starts from an empty configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn merge_with_cli(mut self, args: &RunArgs) -> Result<AppConfig> {
        self.apply_set_values(&args.set_values)?;

        let batch = self.batch.get_or_insert_with(Default::default);
        batch.jobs = args.jobs.or(batch.jobs);
        batch.num_runs = args.runs.or(batch.num_runs);
        batch.pop_size = args.pop_size.or(batch.pop_size);
        batch.max_evals = args.max_evals.or(batch.max_evals);
        batch.max_generations = args.max_generations.or(batch.max_generations);
        batch.seed = args.seed.or(batch.seed);

        if args.asynchronous {
            self.engine
                .get_or_insert_with(Default::default)
                .launch_mode = Some(LaunchMode::Asynchronous);
        }

        self.finish()
    }

    /// Fills every remaining gap with defaults and validates the result.
    pub fn finish(self) -> Result<AppConfig> {
        let defaults = DefaultsConfig::default();
        let engine = Self::merge_engine(self.engine.unwrap_or_default())?;
        let batch = Self::merge_batch(self.batch.unwrap_or_default(), &defaults);
        let devices = self.devices.unwrap_or_else(|| {
            (0..defaults.device_count)
                .map(|i| DeviceInfo {
                    name: format!("host-{i}"),
                    memory_bytes: defaults.device_memory_bytes,
                    warp_size: defaults.warp_size,
                })
                .collect()
        });

        if batch.jobs == 0 {
            return Err(CliError::Config("`batch.jobs` must be greater than zero.".to_string()));
        }
        batch
            .params
            .validate(engine.genotype_stride)
            .map_err(|e| CliError::Config(format!("Invalid `[batch]` section: {e}")))?;

        Ok(AppConfig {
            engine,
            devices,
            batch,
        })
    }

    fn merge_engine(partial: PartialEngineConfig) -> Result<EngineConfig> {
        EngineConfigBuilder::new()
            .numeric(partial.numeric.unwrap_or_default())
            .launch_mode(partial.launch_mode.unwrap_or_default())
            .genotype_stride(partial.genotype_stride.unwrap_or(DEFAULT_GENOTYPE_STRIDE))
            .max_lanes(partial.max_lanes.unwrap_or(DEFAULT_MAX_LANES))
            .build()
            .map_err(|e| CliError::Config(e.to_string()))
    }

    fn merge_batch(partial: PartialBatchConfig, defaults: &DefaultsConfig) -> BatchConfig {
        BatchConfig {
            jobs: partial.jobs.unwrap_or(defaults.jobs),
            params: DockingParameters {
                num_runs: partial.num_runs.unwrap_or(defaults.num_runs),
                pop_size: partial.pop_size.unwrap_or(defaults.pop_size),
                num_genes: partial.num_genes.unwrap_or(defaults.num_genes),
                num_atoms: partial.num_atoms.unwrap_or(defaults.num_atoms),
                grid_size: partial.grid_size.unwrap_or(defaults.grid_size),
                num_map_atypes: partial.num_map_atypes.unwrap_or(defaults.num_map_atypes),
                max_evals: partial.max_evals.unwrap_or(defaults.max_evals),
                max_generations: partial.max_generations.unwrap_or(defaults.max_generations),
            },
            seed: partial.seed.unwrap_or(defaults.seed),
            local_search_steps: partial
                .local_search_steps
                .unwrap_or(defaults.local_search_steps),
        }
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let Some((key, value)) = kv_pair.split_once('=') else {
                return Err(CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                )));
            };

            match key {
                "engine.launch-mode" => {
                    let mode = match value {
                        "synchronous" => LaunchMode::Synchronous,
                        "asynchronous" => LaunchMode::Asynchronous,
                        _ => {
                            return Err(CliError::Config(format!(
                                "Invalid launch mode for {}: '{}'. Expected 'synchronous' or 'asynchronous'.",
                                key, value
                            )));
                        }
                    };
                    self.engine_mut().launch_mode = Some(mode);
                }
                "engine.max-lanes" => self.engine_mut().max_lanes = Some(parse(key, value)?),
                "batch.jobs" => self.batch_mut().jobs = Some(parse(key, value)?),
                "batch.num-runs" => self.batch_mut().num_runs = Some(parse(key, value)?),
                "batch.pop-size" => self.batch_mut().pop_size = Some(parse(key, value)?),
                "batch.num-genes" => self.batch_mut().num_genes = Some(parse(key, value)?),
                "batch.num-atoms" => self.batch_mut().num_atoms = Some(parse(key, value)?),
                "batch.max-evals" => self.batch_mut().max_evals = Some(parse(key, value)?),
                "batch.max-generations" => {
                    self.batch_mut().max_generations = Some(parse(key, value)?)
                }
                "batch.seed" => self.batch_mut().seed = Some(parse(key, value)?),
                "batch.local-search-steps" => {
                    self.batch_mut().local_search_steps = Some(parse(key, value)?)
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    fn engine_mut(&mut self) -> &mut PartialEngineConfig {
        self.engine.get_or_insert_with(Default::default)
    }

    fn batch_mut(&mut self) -> &mut PartialBatchConfig {
        self.batch.get_or_insert_with(Default::default)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        CliError::Config(format!("Invalid numeric value for {}: {}", key, value))
    })
}
