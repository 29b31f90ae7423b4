use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use indicatif::MultiProgress;
use log::{info, warn};
use serde::Serialize;
use vmpress_bin::init_logging_with_progress;
use vmpress_bin::session::{Channels, SessionLog, run_lines};
use vmpress_core::allocator::{AllocMode, PageAllocator, ZoneClass};
use vmpress_core::mapping::AddressSpace;
use vmpress_core::signals::SignalPolicy;
use vmpress_core::{Harness, HarnessConfig};
use vmpress_linux::{LinuxAddressSpace, MmapPageAllocator};
use vmpress_sim::{SimAllocator, SimConfig};

#[derive(Clone, Copy, Debug, ValueEnum, Serialize)]
enum Backend {
    /// Simulated buddy allocator (safe, deterministic)
    Sim,
    /// The running Linux kernel
    Linux,
}

/// CLI arguments for the `vmpress` binary.
///
/// Without a test on the command line, control lines of the form
/// `<test> <p1> [p2]` are read from stdin until end of input.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// The allocator to pressure.
    #[clap(long = "backend", value_enum, default_value = "sim")]
    backend: Backend,
    /// Simulator configuration file (JSON). Uses a built-in machine if absent.
    #[clap(long = "sim-config")]
    sim_config: Option<String>,
    /// Let allocations block and enter reclaim.
    #[clap(long = "blocking")]
    blocking: bool,
    /// Zone to pressure.
    #[clap(long = "zone", default_value = "Normal")]
    zone: String,
    /// Zone to pressure in fault tests. Defaults to HighMem if present, else Normal.
    #[clap(long = "fault-zone")]
    fault_zone: Option<String>,
    /// Rate limit of high-order attempts, in attempts per second.
    #[clap(long = "hz-fraction", default_value = "10")]
    hz_fraction: u64,
    /// Do not mask signals during ZERO tier tests.
    #[clap(long = "no-signal-block")]
    no_signal_block: bool,
    /// Yield to the scheduler every this many loop iterations.
    #[clap(long = "yield-every", default_value = "64")]
    yield_every: u64,
    /// Directory to write the report, timings and buddyinfo channels to.
    #[clap(long = "channel-dir")]
    channel_dir: Option<PathBuf>,
    /// Output file for results (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
    /// A single control line, e.g. `alloc_fast 3 1000`.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    test: Vec<String>,
}

fn parse_zone(name: &str) -> Result<ZoneClass> {
    ZoneClass::from_name(name).with_context(|| format!("Unknown zone {:?}", name))
}

fn harness_config(args: &CliArgs) -> Result<HarnessConfig> {
    if args.hz_fraction == 0 {
        bail!("--hz-fraction must be positive");
    }
    Ok(HarnessConfig {
        mode: if args.blocking {
            AllocMode::Blocking
        } else {
            AllocMode::Atomic
        },
        hz_fraction: args.hz_fraction,
        zone: parse_zone(&args.zone)?,
        fault_zone: args.fault_zone.as_deref().map(parse_zone).transpose()?,
        signals: if args.no_signal_block {
            SignalPolicy::Ignore
        } else {
            SignalPolicy::Block
        },
        yield_every: args.yield_every,
        ..HarnessConfig::default()
    })
}

fn control_lines(args: &CliArgs) -> Result<Vec<String>> {
    if !args.test.is_empty() {
        return Ok(vec![args.test.join(" ")]);
    }
    info!("Reading control lines from stdin");
    std::io::stdin()
        .lock()
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(Into::into)
}

fn run_session<A, S>(
    allocator: A,
    space: &S,
    args: &CliArgs,
    progress: MultiProgress,
) -> Result<SessionLog>
where
    A: PageAllocator,
    S: AddressSpace + ?Sized,
{
    let config = harness_config(args)?;
    info!("Harness config: {:?}", config);
    let mut harness = Harness::new(allocator, config).with_progress(progress);
    let mut channels = Channels::new(args.channel_dir.clone())?;
    let data = serde_json::to_value(args).ok();
    run_lines(&mut harness, space, &mut channels, control_lines(args)?, data)
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;

    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);

    let log = match args.backend {
        Backend::Sim => {
            let config = match &args.sim_config {
                Some(path) => SimConfig::from_jsonfile(path)?,
                None => SimConfig::default(),
            };
            let allocator = SimAllocator::new(&config)?;
            let space = allocator.address_space();
            run_session(allocator, &space, &args, progress)?
        }
        Backend::Linux => {
            warn!("Pressuring the host kernel; ZERO tier tests can trigger the OOM killer");
            let space = LinuxAddressSpace::new()?;
            run_session(MmapPageAllocator::new(), &space, &args, progress)?
        }
    };

    // Save results if output file is specified
    if let Some(output_file) = &args.output {
        log.save_to_file(output_file)?;
    }

    let failures = log.failures();
    info!(
        "{} commands run, {} failed",
        log.records.len(),
        failures
    );
    if failures > 0 {
        bail!("{} of {} commands failed", failures, log.records.len());
    }
    Ok(())
}
