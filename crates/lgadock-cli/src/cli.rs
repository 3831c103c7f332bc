use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LGADock CLI - Drives batches of Lamarckian GA docking jobs across a pool of compute devices.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Set the number of threads for lane-parallel computation.
    /// Defaults to the number of available logical cores.
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a batch of docking jobs on the configured (host-simulated) device pool.
    Run(RunArgs),
    /// List the configured devices and whether each can hold one job of the batch.
    Devices(DevicesArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the configuration file in TOML format. Built-in defaults are used
    /// for everything the file leaves out.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    // --- Batch Overrides ---
    /// Override the number of docking jobs in the batch.
    #[arg(short = 'n', long, value_name = "INT")]
    pub jobs: Option<usize>,

    /// Override the number of independent runs per job.
    #[arg(short, long, value_name = "INT")]
    pub runs: Option<usize>,

    /// Override the population size of each run.
    #[arg(short, long, value_name = "INT")]
    pub pop_size: Option<usize>,

    /// Override the per-run evaluation budget.
    #[arg(short = 'e', long, value_name = "INT")]
    pub max_evals: Option<u64>,

    /// Override the generation budget.
    #[arg(short = 'g', long, value_name = "INT")]
    pub max_generations: Option<u64>,

    /// Override the base random seed; job `i` is seeded with `seed + i`.
    #[arg(short, long, value_name = "INT")]
    pub seed: Option<u64>,

    // --- Engine Overrides ---
    /// Check kernel launches without waiting for their completion.
    #[arg(long)]
    pub asynchronous: bool,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S batch.num-genes=7
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `devices` subcommand.
#[derive(Args, Debug)]
pub struct DevicesArgs {
    /// Path to the configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_are_accepted_after_the_subcommand() {
        let cli = Cli::parse_from(["lgadock", "run", "-vv", "-j", "4", "--jobs", "3"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.threads, Some(4));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.jobs, Some(3));
                assert!(!args.asynchronous);
                assert!(args.config.is_none());
            }
            other => panic!("expected 'run', got {other:?}"),
        }
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["lgadock", "devices", "-q", "-v"]);
        assert!(result.is_err());
    }

    #[test]
    fn set_values_can_be_repeated() {
        let cli = Cli::parse_from([
            "lgadock",
            "run",
            "-S",
            "batch.seed=9",
            "-S",
            "engine.launch-mode=asynchronous",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected 'run'");
        };
        assert_eq!(
            args.set_values,
            vec!["batch.seed=9", "engine.launch-mode=asynchronous"]
        );
    }
}
