use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use leaktrace_bin::config::{AttackEntry, CampaignConfig, ExportConfig, ExportFormat, FilterEntry};
use leaktrace_bin::init_logging_with_progress;
use leaktrace_columnar::ColumnarWriter;
use leaktrace_core::arch::Arch;
use leaktrace_core::event::AddressRange;
use leaktrace_core::filter::FilterSpec;
use leaktrace_core::trace::TraceStore;
use leaktrace_core::{AttackConfig, ExportError, ExportLayout, RunReport, TraceSession, export};
use leaktrace_daredevil::DaredevilExporter;
use leaktrace_tracergrind::TracerGrind;
use log::{info, warn};
use serde::Serialize;

/// CLI arguments for the `leaktrace` binary.
///
/// Every option overrides the corresponding field of the campaign config file.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// The campaign config file.
    #[clap(long = "config")]
    config: Option<PathBuf>,
    /// The target executable.
    #[clap(long = "target")]
    target: Option<PathBuf>,
    /// The architecture of the target (i386, amd64, arm, arm64).
    #[clap(long = "arch")]
    arch: Option<Arch>,
    /// The traced address range, e.g. 0x109080-0x109785.
    #[clap(long = "range")]
    range: Option<AddressRange>,
    /// The number of runs.
    #[clap(long = "runs")]
    runs: Option<u64>,
    /// A filter preset name or JSON filter description. Repeatable.
    #[clap(long = "filter")]
    filters: Vec<String>,
    /// An attack as NAME=ALGORITHM:POSITION. Repeatable.
    #[clap(long = "attack")]
    attacks: Vec<AttackConfig>,
    /// The export format.
    #[clap(long = "format", value_enum)]
    format: Option<ExportFormat>,
    /// The export destination, a file for columnar or a directory for daredevil.
    #[clap(long = "out")]
    out: Option<PathBuf>,
    /// Retries per failed run.
    #[clap(long = "retries")]
    retries: Option<u32>,
    /// The timeout of a single run in seconds, 0 disables it.
    #[clap(long = "timeout")]
    timeout: Option<u64>,
    /// The seed of the input generator.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// The number of targets traced in parallel.
    #[clap(long = "workers")]
    workers: Option<usize>,
    /// Output file for the collection report (JSON format).
    #[clap(long = "report")]
    report: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct CampaignReport<'a> {
    config: &'a CampaignConfig,
    report: &'a RunReport,
}

fn load_config(args: &CliArgs) -> Result<CampaignConfig> {
    let mut config = match &args.config {
        Some(path) => CampaignConfig::from_jsonfile(path)?,
        None => CampaignConfig::default(),
    };
    if let Some(target) = &args.target {
        config.target = Some(target.clone());
    }
    if let Some(arch) = args.arch {
        config.arch = arch;
    }
    if let Some(range) = args.range {
        config.range = Some(range);
    }
    if let Some(runs) = args.runs {
        config.runs = runs;
    }
    if !args.filters.is_empty() {
        config.filters = args
            .filters
            .iter()
            .map(|f| parse_filter(f))
            .collect::<Result<_>>()?;
    }
    for attack in &args.attacks {
        config.attacks.insert(
            attack.name.clone(),
            AttackEntry {
                algorithm: attack.algorithm.clone(),
                position: attack.position.clone(),
            },
        );
    }
    match (args.format, &args.out) {
        (Some(format), Some(path)) => {
            config.export = Some(ExportConfig {
                format,
                path: path.clone(),
            })
        }
        (None, Some(path)) => match config.export.as_mut() {
            Some(export) => export.path = path.clone(),
            None => bail!("--out needs --format"),
        },
        (Some(format), None) => match config.export.as_mut() {
            Some(export) => export.format = format,
            None => bail!("--format needs --out"),
        },
        (None, None) => {}
    }
    if let Some(retries) = args.retries {
        config.retries = retries;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = if timeout == 0 { None } else { Some(timeout) };
    }
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    Ok(config)
}

fn parse_filter(arg: &str) -> Result<FilterEntry> {
    if arg.trim_start().starts_with('{') {
        let spec: FilterSpec =
            serde_json::from_str(arg).with_context(|| format!("invalid filter {}", arg))?;
        Ok(FilterEntry::Spec(spec))
    } else {
        Ok(FilterEntry::Preset(arg.to_string()))
    }
}

fn save_report(path: &Path, report: &CampaignReport) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer.flush()?;
    info!("Results saved to {}", path.display());
    Ok(())
}

fn export_store(
    store: &TraceStore,
    export_config: &ExportConfig,
    attacks: &[AttackConfig],
) -> Result<()> {
    // validate before touching the destination
    let layout = ExportLayout::new(store, &[]).inspect_err(|e| {
        if let ExportError::ColumnLengthMismatch(mismatches) = e {
            for mismatch in mismatches {
                warn!("Misaligned column {}", mismatch);
            }
        }
    })?;
    info!(
        "Exporting {} traces with {} columns as {:?}",
        layout.traces(),
        layout.columns().len(),
        export_config.format
    );
    match export_config.format {
        ExportFormat::Columnar => {
            let mut writer = ColumnarWriter::create(&export_config.path)?;
            export(&mut writer, store, &[], attacks)?;
        }
        ExportFormat::Daredevil => {
            std::fs::create_dir_all(&export_config.path)?;
            let mut exporter = DaredevilExporter::new(&export_config.path);
            export(&mut exporter, store, &[], attacks)?;
        }
    }
    info!("Traces exported to {}", export_config.path.display());
    Ok(())
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;
    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);

    let config = load_config(&args)?;
    let target = config.target_spec()?;
    let attacks = config.attacks();
    let tracer = TracerGrind::from_env()
        .input_mode(config.input_mode.into())
        .output_prefix(config.output_prefix.clone());
    let session = TraceSession::builder()
        .source(tracer)
        .target(target)
        .filters(config.filters()?)
        .progress(progress)
        .config(config.session_config())
        .build()?;

    info!(
        "Tracing {} in {} with {} runs",
        session.target().path.display(),
        session.target().range,
        config.runs
    );
    let collection = session.run(config.runs)?;
    let report = &collection.report;
    for failure in &report.failures {
        warn!(
            "Run {} abandoned after {} attempts: {}",
            failure.request, failure.attempts, failure.error
        );
    }
    let aborted = report.aborted_filters();
    if !aborted.is_empty() {
        warn!("Filters aborted runs: {}", aborted.join(", "));
    }
    info!(
        "Collected {}/{} traces ({} retries)",
        report.collected, report.requested, report.retried
    );

    if let Some(path) = &args.report {
        save_report(
            path,
            &CampaignReport {
                config: &config,
                report,
            },
        )?;
    }

    if collection.store.is_empty() {
        bail!("No traces collected");
    }
    match &config.export {
        Some(export_config) => export_store(&collection.store, export_config, &attacks)?,
        None => warn!("No export configured, traces are discarded"),
    }
    Ok(())
}
