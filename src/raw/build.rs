//! The build loop: input file in, columnar stores out.
//!
//! A run moves through [`BuildPhase`]s in order. Everything that can be rejected up
//! front (missing input, unknown format, bad routing, existing outputs) fails before the
//! first output is touched. Once decoding has started, an error still closes the sink so
//! every batch flushed so far stays readable.

use crate::error::{RawError, RawResult};
use crate::raw::buffer::{RawBuffer, MAX_BUFFER_ROWS};
use crate::raw::library::RawBufferLibrary;
use crate::raw::progress::{NoProgress, ProgressObserver, ProgressUpdate};
use crate::raw::routing::RoutingSpec;
use crate::raw::streamer::{ChunkMode, DataStreamer, StreamOptions, StreamerRegistry};
use crate::raw::table::Table;
use crate::store::{write_and_clear, RawSink, SinkRegistry};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Extension of the default output store, `<input-stem>.raw`.
pub const DEFAULT_OUTPUT_EXTENSION: &str = "raw";
/// Rows per buffer when neither the options nor a route set one.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Stages of a build, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildPhase {
    /// Resolve the format, open the input, build the buffer library.
    Init,
    /// Check every destination, then remove existing ones.
    OutputPrepare,
    /// Write the header group of every destination.
    HeaderWrite,
    /// Decode chunks and flush them.
    Decoding,
    /// Close the stores and report.
    Finalize,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildPhase::Init => "init",
            BuildPhase::OutputPrepare => "output prepare",
            BuildPhase::HeaderWrite => "header write",
            BuildPhase::Decoding => "decoding",
            BuildPhase::Finalize => "finalize",
        })
    }
}

/// Where decoded records go.
#[derive(Debug, Clone, Default)]
pub enum OutSpec {
    /// One store next to the input, `<input-stem>.raw`, one group per identity.
    #[default]
    Default,
    /// One store at this path, one group per identity.
    Path(PathBuf),
    /// Routing table; unlisted identities go to the default store.
    Routing(RoutingSpec),
    /// Prebuilt library, used as is.
    Library(RawBufferLibrary),
}

/// Options for one build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Registered format name; `None` detects it from the input extension.
    pub format: Option<String>,
    /// Where rows go.
    pub out_spec: OutSpec,
    /// Rows per buffer unless a route says otherwise.
    pub buffer_size: usize,
    /// Maximum rows written across all destinations; `None` is unlimited.
    pub row_limit: Option<u64>,
    /// Delete existing outputs. When false an existing output aborts the run.
    pub overwrite: bool,
    /// Abort on the first malformed record instead of skipping it.
    pub strict: bool,
    /// When the streamer hands buffers back.
    pub chunk_mode: ChunkMode,
    /// Registered store name.
    pub store: String,
    /// 0 is quiet, 1 logs the summary, 2 also logs every chunk.
    pub verbosity: u8,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            format: None,
            out_spec: OutSpec::Default,
            buffer_size: DEFAULT_BUFFER_SIZE,
            row_limit: None,
            overwrite: true,
            strict: false,
            chunk_mode: ChunkMode::FullOnly,
            store: "arrow".to_string(),
            verbosity: 1,
        }
    }
}

/// Rows still allowed into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowBudget(Option<u64>);

impl RowBudget {
    /// Budget of `limit` rows; `None` is unlimited.
    pub fn new(limit: Option<u64>) -> Self {
        Self(limit)
    }

    /// Budget without a bound.
    pub fn unlimited() -> Self {
        Self(None)
    }

    /// Takes up to `rows` from the budget and returns how many were granted.
    pub fn clip(&mut self, rows: usize) -> usize {
        match &mut self.0 {
            None => rows,
            Some(remaining) => {
                let granted = (*remaining).min(rows as u64);
                *remaining -= granted;
                granted as usize
            }
        }
    }

    /// Rows left, or `None` when unlimited.
    pub fn remaining(&self) -> Option<u64> {
        self.0
    }

    /// Whether no more rows may be written.
    pub fn is_exhausted(&self) -> bool {
        self.0 == Some(0)
    }
}

/// Size of one destination after the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSize {
    /// Store path.
    pub path: PathBuf,
    /// Bytes on disk, recursively for directory stores.
    pub bytes: u64,
}

/// What a successful run did.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    /// Input file.
    pub input: PathBuf,
    /// Format the input was decoded as.
    pub format: String,
    /// Wall time of the whole run.
    pub elapsed: Duration,
    /// Every destination with its size.
    pub outputs: Vec<OutputSize>,
    /// Existing outputs deleted before writing.
    pub removed_outputs: Vec<PathBuf>,
    /// Input bytes consumed.
    pub bytes_read: u64,
    /// Data rows appended, header rows excluded.
    pub rows_written: u64,
    /// Records appended to a buffer.
    pub records_decoded: u64,
    /// Malformed records dropped.
    pub records_skipped: u64,
    /// Records of discarded identities.
    pub records_discarded: u64,
    /// Data batches appended, header batches excluded.
    pub flushes: u64,
    /// Non-empty buffer lists returned by the streamer.
    pub chunks: u64,
}

impl BuildSummary {
    /// Input bytes per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_read as f64 / secs
        } else {
            0.0
        }
    }

    /// Bytes on disk across every destination.
    pub fn output_bytes(&self) -> u64 {
        self.outputs.iter().map(|o| o.bytes).sum()
    }
}

impl fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Time elapsed: {:.2} sec", self.elapsed.as_secs_f64())?;
        for out in &self.outputs {
            writeln!(f, "Output: {} ({})", out.path.display(), format_bytes(out.bytes))?;
        }
        writeln!(f, "Total converted: {}", format_bytes(self.bytes_read))?;
        writeln!(f, "Conversion speed: {}/s", format_bytes(self.throughput() as u64))?;
        write!(
            f,
            "Rows written: {} in {} batches over {} chunks ({} skipped, {} discarded)",
            self.rows_written,
            self.flushes,
            self.chunks,
            self.records_skipped,
            self.records_discarded
        )
    }
}

/// A failed run: the phase it failed in and which existing outputs it had deleted.
#[derive(Debug, Error)]
#[error("raw build failed during {phase}: {source}{}", removed_note(.removed_outputs))]
pub struct BuildError {
    /// Phase that failed.
    pub phase: BuildPhase,
    /// Outputs already deleted when the run failed.
    pub removed_outputs: Vec<PathBuf>,
    /// Underlying error.
    #[source]
    pub source: RawError,
}

fn removed_note(removed: &[PathBuf]) -> String {
    if removed.is_empty() {
        return String::new();
    }
    let paths: Vec<String> = removed.iter().map(|p| p.display().to_string()).collect();
    format!(" (already removed: {})", paths.join(", "))
}

impl BuildError {
    fn new(phase: BuildPhase, removed_outputs: &[PathBuf], source: RawError) -> Self {
        Self {
            phase,
            removed_outputs: removed_outputs.to_vec(),
            source,
        }
    }

    /// Whether the run failed before any output was modified.
    pub fn is_preflight(&self) -> bool {
        self.removed_outputs.is_empty()
            && matches!(self.phase, BuildPhase::Init | BuildPhase::OutputPrepare)
    }
}

/// Runs builds with a set of formats, stores and a progress observer.
pub struct RawBuilder {
    streamers: StreamerRegistry,
    sinks: SinkRegistry,
    progress: Box<dyn ProgressObserver>,
}

impl Default for RawBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RawBuilder {
    /// Builder with the built-in formats and stores and no progress observer.
    pub fn new() -> Self {
        Self {
            streamers: StreamerRegistry::new(),
            sinks: SinkRegistry::new(),
            progress: Box::new(NoProgress),
        }
    }

    /// Replaces the format registry.
    pub fn with_streamers(mut self, streamers: StreamerRegistry) -> Self {
        self.streamers = streamers;
        self
    }

    /// Replaces the store registry.
    pub fn with_sinks(mut self, sinks: SinkRegistry) -> Self {
        self.sinks = sinks;
        self
    }

    /// Sets the progress observer.
    pub fn with_progress(mut self, progress: impl ProgressObserver + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// Formats this builder can decode.
    pub fn streamers(&self) -> &StreamerRegistry {
        &self.streamers
    }

    /// Stores this builder can write.
    pub fn sinks(&self) -> &SinkRegistry {
        &self.sinks
    }

    /// Builds with the store named in `options`.
    pub fn run(
        &mut self,
        input: impl AsRef<Path>,
        options: &BuildOptions,
    ) -> Result<BuildSummary, BuildError> {
        let mut sink = self
            .sinks
            .create(&options.store)
            .map_err(|e| BuildError::new(BuildPhase::Init, &[], e))?;
        self.run_with_sink(input, options, sink.as_mut())
    }

    /// Builds into a caller-provided sink. `options.store` is ignored.
    pub fn run_with_sink(
        &mut self,
        input: impl AsRef<Path>,
        options: &BuildOptions,
        sink: &mut dyn RawSink,
    ) -> Result<BuildSummary, BuildError> {
        let input = input.as_ref();
        let started = Instant::now();

        debug!(phase = %BuildPhase::Init, input = %input.display());
        let mut run = self
            .init(input, options)
            .map_err(|e| BuildError::new(BuildPhase::Init, &[], e))?;

        debug!(phase = %BuildPhase::OutputPrepare);
        let removed = prepare_outputs(&run.destinations, options.overwrite)
            .map_err(|(removed, e)| BuildError::new(BuildPhase::OutputPrepare, &removed, e))?;

        debug!(phase = %BuildPhase::HeaderWrite);
        if let Err(e) = write_headers(&run, sink) {
            close_after_error(sink);
            return Err(BuildError::new(BuildPhase::HeaderWrite, &removed, e));
        }

        debug!(phase = %BuildPhase::Decoding);
        self.progress.on_start(run.input_len, options.row_limit);
        let decoded = self.decode(&mut run, options, sink);
        let flushes = match decoded {
            Ok(flushes) => flushes,
            Err(e) => {
                close_after_error(sink);
                return Err(BuildError::new(BuildPhase::Decoding, &removed, e));
            }
        };

        debug!(phase = %BuildPhase::Finalize);
        sink.finish()
            .map_err(|e| BuildError::new(BuildPhase::Finalize, &removed, e))?;

        let stats = run.streamer.stats();
        let outputs = run
            .destinations
            .iter()
            .map(|path| OutputSize {
                path: path.clone(),
                bytes: disk_usage(path).unwrap_or(0),
            })
            .collect();
        let summary = BuildSummary {
            input: input.to_path_buf(),
            format: run.streamer.format_name().to_string(),
            elapsed: started.elapsed(),
            outputs,
            removed_outputs: removed,
            bytes_read: stats.bytes_read,
            rows_written: run.rows_written,
            records_decoded: stats.records_decoded,
            records_skipped: stats.records_skipped,
            records_discarded: stats.records_discarded,
            flushes,
            chunks: stats.chunks,
        };

        if options.verbosity >= 1 {
            info!(
                input = %input.display(),
                elapsed_s = summary.elapsed.as_secs_f64(),
                converted = %format_bytes(summary.bytes_read),
                speed = %format!("{}/s", format_bytes(summary.throughput() as u64)),
                rows = summary.rows_written,
                skipped = summary.records_skipped,
                "raw build complete"
            );
            for out in &summary.outputs {
                info!(output = %out.path.display(), size = %format_bytes(out.bytes));
            }
        }
        self.progress.on_finish(&summary);
        Ok(summary)
    }

    fn init(&self, input: &Path, options: &BuildOptions) -> RawResult<Run> {
        let source = File::open(input).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RawError::InputNotFound(input.to_path_buf()),
            _ => RawError::Io(e),
        })?;
        if source.metadata()?.is_dir() {
            return Err(RawError::InputNotFound(input.to_path_buf()));
        }
        let input_len = source.metadata().ok().map(|m| m.len());

        let mut buffer_size = options.buffer_size;
        if !(1..=MAX_BUFFER_ROWS).contains(&buffer_size) {
            return Err(RawError::Configuration(format!(
                "buffer size must be between 1 and {MAX_BUFFER_ROWS} rows (got {buffer_size})"
            )));
        }
        // A zero row limit still runs: the header is written and decoding stops at once.
        if let Some(limit) = options.row_limit {
            buffer_size = buffer_size.min(usize::try_from(limit).unwrap_or(usize::MAX)).max(1);
        }

        let mut streamer = self.streamers.resolve(options.format.as_deref(), input)?;

        let default_out = default_output(input);
        let mut library = match &options.out_spec {
            OutSpec::Default => RawBufferLibrary::catch_all(&default_out, buffer_size),
            OutSpec::Path(path) => RawBufferLibrary::catch_all(path, buffer_size),
            OutSpec::Routing(spec) => RawBufferLibrary::from_routing(spec, &default_out, buffer_size)?,
            OutSpec::Library(lib) => lib.clone(),
        };
        if options.row_limit.is_some() {
            library.set_capacity_limit(Some(buffer_size));
        }
        check_not_input(&library.list_destinations(), input)?;

        let stream_options = StreamOptions {
            chunk_mode: options.chunk_mode,
            strict: options.strict,
        };
        let header = streamer.open(Box::new(source), &mut library, &stream_options)?;

        let destinations = library.list_destinations();
        check_not_input(&destinations, input)?;
        debug!(
            format = streamer.format_name(),
            buffers = library.len(),
            destinations = destinations.len(),
            buffer_size,
            "opened input"
        );

        Ok(Run {
            streamer,
            library,
            header,
            destinations,
            budget: RowBudget::new(options.row_limit),
            rows_written: 0,
            input_len,
        })
    }

    /// Returns the number of data batches appended.
    fn decode(&mut self, run: &mut Run, options: &BuildOptions, sink: &mut dyn RawSink) -> RawResult<u64> {
        let mut flushes = 0;
        while !run.budget.is_exhausted() {
            let list = run.streamer.read_chunk(&mut run.library)?;
            if list.is_empty() {
                break;
            }
            for id in list.iter() {
                let buffer = run.library.buffer_mut(id);
                let granted = run.budget.clip(buffer.len());
                buffer.truncate(granted);
                if granted > 0 {
                    flushes += 1;
                }
            }
            let rows = write_and_clear(&list, &mut run.library, sink)?;
            run.rows_written += rows as u64;

            let stats = run.streamer.stats();
            if options.verbosity >= 2 {
                info!(
                    bytes_read = stats.bytes_read,
                    rows = run.rows_written,
                    buffers = list.len(),
                    "chunk written"
                );
            }
            self.progress.on_chunk(&ProgressUpdate {
                bytes_read: stats.bytes_read,
                rows_written: run.rows_written,
                records_skipped: stats.records_skipped,
            });
        }
        if run.budget.is_exhausted() {
            debug!(rows = run.rows_written, "row limit reached");
        }
        Ok(flushes)
    }
}

struct Run {
    streamer: Box<dyn DataStreamer>,
    library: RawBufferLibrary,
    header: Table,
    destinations: Vec<PathBuf>,
    budget: RowBudget,
    rows_written: u64,
    input_len: Option<u64>,
}

/// Builds `input` with the default formats and stores.
pub fn build_raw(
    input: impl AsRef<Path>,
    options: &BuildOptions,
) -> Result<BuildSummary, BuildError> {
    RawBuilder::new().run(input, options)
}

/// `<input-stem>.raw` next to the input.
pub fn default_output(input: &Path) -> PathBuf {
    input.with_extension(DEFAULT_OUTPUT_EXTENSION)
}

fn check_not_input(destinations: &[PathBuf], input: &Path) -> RawResult<()> {
    let canonical_input = fs::canonicalize(input).ok();
    for dest in destinations {
        let same = dest == input
            || (canonical_input.is_some() && fs::canonicalize(dest).ok() == canonical_input);
        if same {
            return Err(RawError::Configuration(format!(
                "destination {} is the input file",
                dest.display()
            )));
        }
    }
    Ok(())
}

/// Checks every destination before touching any, then removes the existing ones.
fn prepare_outputs(
    destinations: &[PathBuf],
    overwrite: bool,
) -> Result<Vec<PathBuf>, (Vec<PathBuf>, RawError)> {
    let existing: Vec<&PathBuf> = destinations
        .iter()
        .filter(|p| p.symlink_metadata().is_ok())
        .collect();
    if !overwrite {
        if let Some(first) = existing.first() {
            return Err((Vec::new(), RawError::OutputExists((*first).clone())));
        }
        return Ok(Vec::new());
    }

    let mut removed = Vec::with_capacity(existing.len());
    for path in existing {
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        if let Err(e) = result {
            return Err((removed, RawError::Io(e)));
        }
        warn!(output = %path.display(), "removed existing output");
        removed.push(path.clone());
    }
    Ok(removed)
}

fn write_headers(run: &Run, sink: &mut dyn RawSink) -> RawResult<()> {
    for dest in &run.destinations {
        let mut buffer = RawBuffer::header(dest, run.header.clone());
        sink.append(&buffer)?;
        sink.clear(&mut buffer);
    }
    Ok(())
}

fn close_after_error(sink: &mut dyn RawSink) {
    if let Err(e) = sink.finish() {
        warn!(error = %e, "could not close outputs after failure");
    }
}

/// Size of a file, or the recursive size of a directory.
pub fn disk_usage(path: &Path) -> io::Result<u64> {
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += disk_usage(&entry?.path())?;
    }
    Ok(total)
}

/// Human-readable byte count in powers of 1000, e.g. `1.500 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["", "k", "M", "G", "T", "P", "E"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1000.0 {
            return format!("{value:.3} {unit}B");
        }
        value /= 1000.0;
    }
    format!("{value:.3} ZB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_clips_and_exhausts() {
        let mut budget = RowBudget::new(Some(5));
        assert_eq!(budget.clip(3), 3);
        assert_eq!(budget.clip(3), 2);
        assert!(budget.is_exhausted());
        assert_eq!(budget.clip(3), 0);

        let mut unlimited = RowBudget::unlimited();
        assert_eq!(unlimited.clip(usize::MAX), usize::MAX);
        assert!(!unlimited.is_exhausted());
        assert_eq!(unlimited.remaining(), None);
    }

    #[test]
    fn formats_byte_counts() {
        assert_eq!(format_bytes(999), "999.000 B");
        assert_eq!(format_bytes(1500), "1.500 kB");
        assert_eq!(format_bytes(2_000_000), "2.000 MB");
    }

    #[test]
    fn default_output_sits_next_to_the_input() {
        assert_eq!(
            default_output(Path::new("/data/run_0001.rdq")),
            PathBuf::from("/data/run_0001.raw")
        );
    }

    #[test]
    fn disk_usage_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), [0u8; 10]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b"), [0u8; 5]).unwrap();
        assert_eq!(disk_usage(dir.path()).unwrap(), 15);
    }

    #[test]
    fn error_reports_removed_outputs() {
        let err = BuildError::new(
            BuildPhase::Decoding,
            &[PathBuf::from("a.raw")],
            RawError::Format("bad".into()),
        );
        let text = err.to_string();
        assert!(text.contains("decoding"));
        assert!(text.contains("a.raw"));
        assert!(!err.is_preflight());
    }
}
