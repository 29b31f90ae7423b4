//! # vmpress
//!
//! Command line front end of the vmpress page allocator pressure harness.
//!
//! ## Quickstart guide
//!
//! ```sh
//! # Run three FAST passes against the simulated allocator
//! cargo run --release --bin=vmpress -- alloc_fast 3
//!
//! # Attempt order-3 allocations on the host kernel, keeping all channels
//! cargo run --release --bin=vmpress -- --backend linux --channel-dir out highalloc 3 100
//!
//! # Read control lines ("<test> <p1> [p2]") from stdin
//! echo "help alloc_zero" | cargo run --release --bin=vmpress
//! ```
//!
//! Every test writes its report to stdout. With `--channel-dir` the report,
//! timings and buddyinfo channels are also written to files, and with
//! `--output` a JSON record of every command is saved.
//!
//! ## Modules
//!
//! - `session`: Runs control lines against a harness and collects records.
pub mod session;

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}
