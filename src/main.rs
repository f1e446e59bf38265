//! CLI entry point for daq-raw
//!
//! ```bash
//! daq-raw simulate run_0001.rdq --channels 8 --events 100000
//! daq-raw inspect run_0001.rdq
//! daq-raw build run_0001.rdq --routing routing.json --max-rows 50000
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use daq_raw::config::RawConfig;
use daq_raw::logging::{self, LogSettings};
use daq_raw::raw::build::{BuildSummary, OutSpec};
use daq_raw::raw::rdq::{self, RdqHeader, SimulationSpec};
use daq_raw::raw::routing::RoutingSpec;
use daq_raw::raw::{ChunkMode, ProgressObserver, ProgressUpdate, RawBuilder, StreamerRegistry};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Store that never reaches disk; only reachable through the config file.
const IN_MEMORY_STORE: &str = "memory";

#[derive(Parser)]
#[command(name = "daq-raw")]
#[command(version, about = "Convert raw binary DAQ streams into columnar stores", long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file
    #[arg(long, global = true, default_value = daq_raw::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert an input file
    Build(BuildArgs),

    /// Print the header of an input file as JSON
    Inspect {
        input: PathBuf,

        /// Input format (detected from the extension by default)
        #[arg(long)]
        format: Option<String>,
    },

    /// Write a synthetic RDQ run
    Simulate(SimulateArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct BuildArgs {
    input: PathBuf,

    /// Input format (detected from the extension by default)
    #[arg(long)]
    format: Option<String>,

    /// Single output store for every stream
    #[arg(long, conflicts_with = "routing")]
    out: Option<PathBuf>,

    /// JSON routing spec
    #[arg(long)]
    routing: Option<PathBuf>,

    /// Rows per buffer
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Stop after this many rows
    #[arg(long)]
    max_rows: Option<u64>,

    /// Fail instead of deleting existing outputs
    #[arg(long)]
    no_overwrite: bool,

    /// Fail on the first malformed record
    #[arg(long)]
    strict: bool,

    /// full_only, any_full or single_packet
    #[arg(long)]
    chunk_mode: Option<ChunkMode>,

    /// Output store (arrow, csv)
    #[arg(long, value_parser = ["arrow", "csv"])]
    store: Option<String>,
}

#[derive(Args)]
struct SimulateArgs {
    output: PathBuf,

    #[arg(long, default_value_t = 4)]
    channels: u16,

    #[arg(long, default_value_t = 10_000)]
    events: u64,

    /// Samples per waveform
    #[arg(long, default_value_t = 128)]
    samples: u16,

    /// Sync record every N events (0 = never)
    #[arg(long, default_value_t = 1000)]
    sync_every: u64,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 1)]
    run: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RawConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    config.validate()?;

    let settings = if cli.verbose > 0 || cli.quiet {
        LogSettings {
            format: config.logging.format,
            ..LogSettings::from_verbosity(cli.verbose, cli.quiet)
        }
    } else {
        LogSettings::from_config(&config)?
    };
    logging::init(settings)?;

    match cli.command {
        Commands::Build(args) => build(args, &config, cli.quiet),
        Commands::Inspect { input, format } => inspect(&input, format.as_deref()),
        Commands::Simulate(args) => simulate(args),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn build(args: BuildArgs, config: &RawConfig, quiet: bool) -> Result<()> {
    let mut options = config.build_options()?;
    if let Some(routing) = &args.routing {
        options.out_spec = OutSpec::Routing(
            RoutingSpec::from_file(routing)
                .with_context(|| format!("reading routing spec {}", routing.display()))?,
        );
    } else if let Some(out) = args.out {
        options.out_spec = OutSpec::Path(out);
    }
    if args.format.is_some() {
        options.format = args.format;
    }
    if let Some(size) = args.buffer_size {
        options.buffer_size = size;
    }
    if args.max_rows.is_some() {
        options.row_limit = args.max_rows;
    }
    if let Some(mode) = args.chunk_mode {
        options.chunk_mode = mode;
    }
    if let Some(store) = args.store {
        options.store = store;
    }
    if options.store == IN_MEMORY_STORE {
        warn!("the memory store keeps rows in RAM only; nothing will be written to disk");
    }
    options.overwrite &= !args.no_overwrite;
    options.strict |= args.strict;
    options.verbosity = if quiet { 0 } else { 1 };

    let mut builder = RawBuilder::new();
    if !quiet {
        builder = builder.with_progress(BarProgress::default());
    }
    let summary = builder.run(&args.input, &options)?;
    if !quiet {
        println!("{summary}");
    }
    Ok(())
}

fn inspect(input: &Path, format: Option<&str>) -> Result<()> {
    let registry = StreamerRegistry::new();
    let format = registry.detect(format, input)?;
    anyhow::ensure!(
        format == rdq::FORMAT_NAME,
        "inspect supports only the {} format",
        rdq::FORMAT_NAME
    );
    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let header = RdqHeader::read_from(&mut BufReader::new(file))?;

    let report = serde_json::json!({
        "format": format,
        "run_start": run_start(header.start_time_ns),
        "header": header,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// RFC 3339 time of `ns` past the epoch, or the raw count when it does not fit a timestamp.
fn run_start(ns: u64) -> String {
    match i64::try_from(ns) {
        Ok(ns) => chrono::DateTime::from_timestamp_nanos(ns).to_rfc3339(),
        Err(_) => format!("{ns} ns"),
    }
}

fn simulate(args: SimulateArgs) -> Result<()> {
    let start_time_ns = chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|ns| u64::try_from(ns).ok())
        .unwrap_or(0);
    let spec = SimulationSpec {
        channels: args.channels,
        events: args.events,
        samples: args.samples,
        sync_every: args.sync_every,
        seed: args.seed,
        run_number: args.run,
        start_time_ns,
        ..SimulationSpec::default()
    };
    let bytes = rdq::simulate_to_path(&spec, &args.output)?;
    println!(
        "Wrote {} ({}, {} events)",
        args.output.display(),
        daq_raw::raw::build::format_bytes(bytes),
        args.events
    );
    Ok(())
}

/// Progress bar over rows when a row limit is set, otherwise over input bytes.
#[derive(Default)]
struct BarProgress {
    bar: Option<ProgressBar>,
    by_rows: bool,
}

impl ProgressObserver for BarProgress {
    fn on_start(&mut self, total_bytes: Option<u64>, row_limit: Option<u64>) {
        self.by_rows = row_limit.is_some();
        let (len, template) = match (row_limit, total_bytes) {
            (Some(rows), _) => (rows, "{bar:40.cyan/blue} {pos}/{len} rows ({eta})"),
            (None, Some(bytes)) => (bytes, "{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})"),
            (None, None) => (0, "{spinner} {bytes}"),
        };
        let bar = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars("=>-"));
        }
        self.bar = Some(bar);
    }

    fn on_chunk(&mut self, update: &ProgressUpdate) {
        if let Some(bar) = &self.bar {
            bar.set_position(if self.by_rows {
                update.rows_written
            } else {
                update.bytes_read
            });
        }
    }

    fn on_finish(&mut self, _summary: &BuildSummary) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
