use crate::cli::RunArgs;
use crate::config::{AppConfig, BatchConfig, PartialAppConfig};
use crate::error::{CliError, Result};
use crate::synthetic::{LamarckianVariation, SyntheticLandscape, synthetic_constants, synthetic_grid};
use crate::utils::progress::CliProgressHandler;
use lgadock::engine::device::HostDevice;
use lgadock::engine::pool::{DevicePool, RunRequest};
use lgadock::engine::progress::ProgressReporter;
use lgadock::workflows::batch::{self, JobSpec};
use lgadock::workflows::search::JobOutcome;
use std::sync::Arc;
use tracing::{error, info};

pub fn run(args: RunArgs) -> Result<()> {
    let partial_config = PartialAppConfig::load(args.config.as_deref())?;
    info!("Merging configuration from file and CLI arguments...");
    let config = partial_config.merge_with_cli(&args)?;
    execute(config).map(|outcomes| print_summary(&outcomes))
}

/// Builds the pool and the job queue from `config` and runs the batch.
///
/// A device fault is fatal: the fault is logged, every device is reset and the
/// error is handed back so the process exits with a failure status.
pub fn execute(config: AppConfig) -> Result<Vec<JobOutcome>> {
    let AppConfig {
        engine,
        devices,
        batch: batch_config,
    } = config;
    let engine = Arc::new(engine);
    let pool = DevicePool::new(
        devices.into_iter().map(HostDevice::new).collect(),
        Arc::clone(&engine),
    )?;
    let jobs = build_jobs(&batch_config)?;

    let evaluator = SyntheticLandscape::new(
        batch_config.params.num_genes,
        batch_config.seed,
        batch_config.local_search_steps,
    );
    let variation = LamarckianVariation::default();

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!(
        "Running {} job(s) on {} device(s)...",
        jobs.len(),
        pool.len()
    );
    info!("Invoking the batch workflow...");

    match batch::run(&pool, &jobs, &evaluator, &variation, &reporter) {
        Ok(outcomes) => {
            info!("Batch finished with {} job outcome(s).", outcomes.len());
            Ok(outcomes)
        }
        Err(e) if e.is_device_fault() => {
            error!("Unrecoverable device fault, aborting the batch: {}", e);
            pool.reset_idle_devices();
            Err(CliError::from(e))
        }
        Err(e) => Err(e.into()),
    }
}

fn build_jobs(batch_config: &BatchConfig) -> Result<Vec<JobSpec>> {
    let constants =
        synthetic_constants(&batch_config.params).map_err(|e| CliError::Other(e.into()))?;
    let grid_maps = synthetic_grid(&batch_config.params);

    Ok((0..batch_config.jobs)
        .map(|job| JobSpec {
            request: RunRequest::new(
                batch_config.params.clone(),
                batch_config.seed.wrapping_add(job as u64),
            ),
            constants: constants.clone(),
            grid_maps: Arc::clone(&grid_maps),
        })
        .collect())
}

fn print_summary(outcomes: &[JobOutcome]) {
    println!(
        "{:<5} {:<10} {:>12} {:>14} {:>14}",
        "JOB", "DEVICE", "GENERATIONS", "EVALUATIONS", "BEST ENERGY"
    );
    for outcome in outcomes {
        let best = outcome
            .best_energy()
            .map_or_else(|| "-".to_string(), |e| format!("{e:.4}"));
        println!(
            "{:<5} {:<10} {:>12} {:>14} {:>14}",
            outcome.job,
            outcome.device.to_string(),
            outcome.generations,
            outcome.evaluations.run_total(),
            best
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn small_config() -> AppConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.toml");
        fs::write(
            &path,
            r#"
                [[devices]]
                name = "sim-0"
                memory-bytes = 1073741824
                warp-size = 32

                [[devices]]
                name = "sim-1"
                memory-bytes = 1073741824
                warp-size = 32

                [batch]
                jobs = 3
                num-runs = 2
                pop-size = 12
                num-genes = 5
                num-atoms = 6
                grid-size = [4, 4, 4]
                num-map-atypes = 2
                max-evals = 2000
                max-generations = 40
                seed = 11
                local-search-steps = 1
                "#,
        )
        .unwrap();
        PartialAppConfig::from_file(&path).unwrap().finish().unwrap()
    }

    #[test]
    fn batch_runs_every_job_within_budget() {
        let config = small_config();
        let outcomes = execute(config).unwrap();

        assert_eq!(outcomes.len(), 3);
        for outcome in &outcomes {
            assert!(outcome.generations <= 40);
            assert_eq!(outcome.best.len(), 2);
            assert!(outcome.best_energy().is_some());
        }
    }

    #[test]
    fn jobs_are_seeded_consecutively_from_the_base_seed() {
        let config = small_config();
        let jobs = build_jobs(&config.batch).unwrap();
        let seeds: Vec<u64> = jobs.iter().map(|j| j.request.seed).collect();
        assert_eq!(seeds, vec![11, 12, 13]);
        assert!(jobs.iter().all(|j| j.grid_maps.len() == config.batch.params.grid_floats()));
    }

    #[test]
    fn undersized_devices_fail_the_batch() {
        let mut config = small_config();
        for device in &mut config.devices {
            device.memory_bytes = 1024;
        }
        let err = execute(config).unwrap_err();
        assert!(matches!(err, CliError::LgaDockCore(_)));
        assert!(!err.is_device_fault());
    }
}
