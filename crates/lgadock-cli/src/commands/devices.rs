use crate::cli::DevicesArgs;
use crate::config::PartialAppConfig;
use crate::error::Result;
use lgadock::engine::context::WarpConstants;
use tracing::info;

/// Lists the configured devices and whether each one can hold a single job of
/// the configured batch.
pub fn run(args: DevicesArgs) -> Result<()> {
    let config = PartialAppConfig::load(args.config.as_deref())?.finish()?;
    let required = config
        .batch
        .params
        .required_memory_bytes(config.engine.genotype_stride);
    info!(
        devices = config.devices.len(),
        required_bytes = required,
        "Listing configured devices."
    );

    println!(
        "{:<4} {:<16} {:>12} {:>6} {:>6}  {}",
        "ID", "NAME", "MEMORY (MiB)", "WARP", "BITS", "FITS JOB"
    );
    for (id, device) in config.devices.iter().enumerate() {
        let bits = WarpConstants::from_warp_size(device.warp_size)
            .map_or_else(|| "n/a".to_string(), |w| w.bits.to_string());
        let fits = if device.memory_bytes >= required {
            "yes"
        } else {
            "no"
        };
        println!(
            "{:<4} {:<16} {:>12} {:>6} {:>6}  {}",
            id,
            device.name,
            device.memory_bytes >> 20,
            device.warp_size,
            bits,
            fits
        );
    }
    println!(
        "One job needs {:.1} MiB ({} runs x {} individuals).",
        required as f64 / (1u64 << 20) as f64,
        config.batch.params.num_runs,
        config.batch.params.pop_size
    );
    Ok(())
}
