use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use npuforge::allocator::{AllocatorConfig, NpuAllocator, RecordContext};
use npuforge::backend::acl_backend::DeviceDriver;
use npuforge::{DataPtr, NpuRuntime, SimDriver};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "npu_mem_probe", version)]
#[command(about = "Exercise the NPU caching allocator and dump its state", long_about = None)]
struct Cli {
    /// Driver to run against
    #[arg(long, value_enum, default_value_t = DriverKind::Sim)]
    driver: DriverKind,

    /// Simulated device count
    #[arg(long, default_value_t = 1)]
    devices: usize,

    /// Simulated memory per device, in MiB
    #[arg(long, default_value_t = 1024)]
    memory_mb: usize,

    /// Allocator options, same syntax as NPUFORGE_ALLOC_CONF
    #[arg(long)]
    alloc_conf: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum DriverKind {
    Sim,
    Acl,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allocate and free a repeating list of sizes on pool streams
    Run {
        /// Request sizes in bytes, comma separated
        #[arg(long, value_delimiter = ',', default_value = "4096,65536,2097152,12582912")]
        sizes: Vec<usize>,
        /// Times to repeat the list
        #[arg(long, default_value_t = 4)]
        iterations: usize,
        /// Keep every n-th allocation alive until the end
        #[arg(long, default_value_t = 3)]
        keep_every: usize,
        /// Device to allocate on
        #[arg(long, default_value_t = 0)]
        device: i32,
        /// Empty the cache before printing
        #[arg(long)]
        empty_cache: bool,
        /// Include the allocation history in the snapshot
        #[arg(long)]
        history: bool,
    },
    /// Print device properties and memory info
    Info,
}

#[derive(Serialize)]
struct ProbeReport {
    driver: &'static str,
    allocator: &'static str,
    stats: std::collections::BTreeMap<String, i64>,
    cache_info: (usize, usize),
    snapshot: npuforge::SnapshotInfo,
}

#[derive(Serialize)]
struct DeviceReport {
    index: i32,
    properties: npuforge::backend::acl_backend::DeviceProperties,
    memory: npuforge::backend::acl_backend::MemInfo,
}

fn make_driver(cli: &Cli) -> anyhow::Result<Arc<dyn DeviceDriver>> {
    match cli.driver {
        DriverKind::Sim => Ok(Arc::new(SimDriver::new(cli.devices, cli.memory_mb << 20))),
        #[cfg(feature = "acl")]
        DriverKind::Acl => Ok(Arc::new(
            npuforge::backend::acl_backend::AclDriver::new().context("initializing ACL")?,
        )),
        #[cfg(not(feature = "acl"))]
        DriverKind::Acl => anyhow::bail!("npu_mem_probe was built without the `acl` feature"),
    }
}

fn run_workload(
    runtime: &NpuRuntime,
    sizes: &[usize],
    iterations: usize,
    keep_every: usize,
    device: i32,
) -> anyhow::Result<Vec<DataPtr>> {
    let mut kept = Vec::new();
    let mut step = 0usize;
    for iteration in 0..iterations {
        let stream = runtime
            .streams()
            .stream_from_pool(iteration % 2 == 1, Some(device))
            .context("getting a pool stream")?;
        for &size in sizes {
            let ptr = runtime
                .allocate_on(size, &stream)
                .with_context(|| format!("allocating {} bytes on {}", size, stream))?;
            step += 1;
            if keep_every > 0 && step % keep_every == 0 {
                kept.push(ptr);
            }
        }
    }
    Ok(kept)
}

fn main() -> anyhow::Result<()> {
    npuforge::init_logging_default();
    let cli = Cli::parse();

    let config = match &cli.alloc_conf {
        Some(conf) => AllocatorConfig::parse(conf).context("parsing --alloc-conf")?,
        None => AllocatorConfig::from_env().context("parsing NPUFORGE_ALLOC_CONF")?,
    };
    let driver = make_driver(&cli)?;
    let runtime = NpuRuntime::new(driver, config)?;

    match cli.command {
        Commands::Run {
            sizes,
            iterations,
            keep_every,
            device,
            empty_cache,
            history,
        } => {
            let allocator = runtime.current_allocator()?;
            if history {
                allocator.record_history(true, None, 10_000, RecordContext::Never)?;
            }
            let kept = run_workload(&runtime, &sizes, iterations, keep_every, device)?;
            if empty_cache {
                allocator.empty_device_cache(device)?;
            }
            let report = ProbeReport {
                driver: runtime.registry().driver().name(),
                allocator: allocator.name(),
                stats: allocator.device_stats(device)?.to_flat_map(),
                cache_info: allocator.cache_info(device)?,
                snapshot: allocator.snapshot()?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            drop(kept);
        }
        Commands::Info => {
            let registry = runtime.registry();
            let mut devices = Vec::new();
            for index in 0..registry.device_count() {
                devices.push(DeviceReport {
                    index,
                    properties: registry.device_properties(index)?,
                    memory: registry.mem_get_info(index)?,
                });
            }
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
    }

    runtime.shutdown().context("shutting down")?;
    Ok(())
}
