//! # Leaktrace
//!
//! Leaktrace collects software execution traces of white-box cryptographic
//! implementations and exports them for differential computation analysis.
//!
//! ## Quickstart guide
//!
//! Install Valgrind with the TracerGrind tool and `texttrace` from the
//! SideChannelMarvels project, then run:
//!
//! ```sh
//! cargo build --release
//! cargo run --release --bin=leaktrace -- --config config/aes-whitebox.json
//! ```
//!
//! This collects 100 traces of the target with the `data_W` filter and writes
//! Daredevil input files to `traces/`. Use `leaktrace --help` to see the
//! available options; every flag overrides the corresponding field of the
//! configuration file. Set `LEAKTRACE_VALGRIND` and `LEAKTRACE_TEXTTRACE` if
//! the tools are not on the `PATH`.
//!
//! ## Modules
//!
//! - `config`: Campaign configuration files.
pub mod config;

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}
