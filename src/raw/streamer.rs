//! The streamer contract and the format registry.
//!
//! A streamer turns one binary DAQ format into rows in raw buffers. The orchestrator owns
//! the [`RawBufferLibrary`] and lends it to every call, so streamers keep only their input
//! cursor and scratch space.

use crate::error::{RawError, RawResult};
use crate::raw::buffer::RawBufferList;
use crate::raw::library::RawBufferLibrary;
use crate::raw::table::Table;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// When `read_chunk` hands buffers back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// Stop when a buffer fills and return only full buffers. Sync points and the end of
    /// input return every non-empty buffer.
    #[default]
    FullOnly,
    /// Stop when a buffer fills and return every non-empty buffer.
    AnyFull,
    /// Return after every record that landed in a buffer.
    SinglePacket,
}

impl std::str::FromStr for ChunkMode {
    type Err = RawError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_only" => Ok(ChunkMode::FullOnly),
            "any_full" => Ok(ChunkMode::AnyFull),
            "single_packet" => Ok(ChunkMode::SinglePacket),
            other => Err(RawError::Configuration(format!(
                "unknown chunk mode '{other}' (expected full_only, any_full or single_packet)"
            ))),
        }
    }
}

/// Options passed to [`DataStreamer::open`].
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// When `read_chunk` returns.
    pub chunk_mode: ChunkMode,
    /// Fail on the first malformed record instead of skipping it.
    pub strict: bool,
}

/// Counters kept by a streamer. Observational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Input bytes consumed, header included.
    pub bytes_read: u64,
    /// Records appended to a buffer.
    pub records_decoded: u64,
    /// Malformed records skipped.
    pub records_skipped: u64,
    /// Records of discarded identities.
    pub records_discarded: u64,
    /// Non-empty buffer lists returned.
    pub chunks: u64,
}

/// A decoder for one DAQ wire format.
pub trait DataStreamer {
    /// Registry name of the format.
    fn format_name(&self) -> &'static str;

    /// Reads and validates the header, creates buffers in `library` for every stream
    /// identity the header declares, and returns the header as a one-row table.
    fn open(
        &mut self,
        source: Box<dyn Read>,
        library: &mut RawBufferLibrary,
        options: &StreamOptions,
    ) -> RawResult<Table>;

    /// Decodes forward and returns the buffers needing a flush. An empty list means the
    /// input is exhausted.
    fn read_chunk(&mut self, library: &mut RawBufferLibrary) -> RawResult<RawBufferList>;

    /// Counters so far.
    fn stats(&self) -> StreamStats;
}

type StreamerFactory = Box<dyn Fn() -> Box<dyn DataStreamer> + Send + Sync>;

/// Format-name to constructor table, plus the file-extension heuristic.
///
/// New formats register here; the orchestrator never names a concrete streamer.
pub struct StreamerRegistry {
    factories: HashMap<String, StreamerFactory>,
    extensions: HashMap<String, String>,
}

impl Default for StreamerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamerRegistry {
    /// Registry with every built-in format.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(
            crate::raw::rdq::FORMAT_NAME,
            &[crate::raw::rdq::FILE_EXTENSION],
            || Box::new(crate::raw::rdq::RdqStreamer::new()),
        );
        registry
    }

    /// Registry without any format.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            extensions: HashMap::new(),
        }
    }

    /// Registers a format under `name`, recognised by any of `extensions`.
    pub fn register<F>(&mut self, name: &str, extensions: &[&str], factory: F)
    where
        F: Fn() -> Box<dyn DataStreamer> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        for ext in extensions {
            self.extensions
                .insert(ext.trim_start_matches('.').to_ascii_lowercase(), name.to_string());
        }
    }

    /// Registered format names, sorted.
    pub fn list_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = self.factories.keys().cloned().collect();
        formats.sort();
        formats
    }

    /// Whether `format` is registered.
    pub fn is_available(&self, format: &str) -> bool {
        self.factories.contains_key(format)
    }

    /// Format name from an explicit hint, else from the input's extension.
    pub fn detect(&self, hint: Option<&str>, input: &Path) -> RawResult<String> {
        if let Some(hint) = hint {
            return if self.is_available(hint) {
                Ok(hint.to_string())
            } else {
                Err(RawError::UnknownFormat(format!(
                    "'{hint}' (available: {})",
                    self.list_formats().join(", ")
                )))
            };
        }
        let ext = input
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| {
                RawError::UnknownFormat(format!(
                    "{} has no file extension; specify the input format",
                    input.display()
                ))
            })?;
        self.extensions.get(&ext).cloned().ok_or_else(|| {
            RawError::UnknownFormat(format!(
                "unknown file extension '.{ext}'; specify the input format"
            ))
        })
    }

    /// Instantiates the streamer registered as `format`.
    pub fn create(&self, format: &str) -> RawResult<Box<dyn DataStreamer>> {
        self.factories
            .get(format)
            .map(|factory| factory())
            .ok_or_else(|| RawError::UnknownFormat(format.to_string()))
    }

    /// [`detect`](Self::detect) followed by [`create`](Self::create).
    pub fn resolve(&self, hint: Option<&str>, input: &Path) -> RawResult<Box<dyn DataStreamer>> {
        let format = self.detect(hint, input)?;
        self.create(&format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_format_is_registered() {
        let registry = StreamerRegistry::new();
        assert_eq!(registry.list_formats(), vec!["rdq".to_string()]);
        let streamer = registry.create("rdq").unwrap();
        assert_eq!(streamer.format_name(), "rdq");
    }

    #[test]
    fn detects_format_from_extension() {
        let registry = StreamerRegistry::new();
        assert_eq!(registry.detect(None, Path::new("run_0001.rdq")).unwrap(), "rdq");
        assert_eq!(registry.detect(None, Path::new("RUN.RDQ")).unwrap(), "rdq");
    }

    #[test]
    fn unknown_or_missing_extension_fails() {
        let registry = StreamerRegistry::new();
        assert!(matches!(
            registry.detect(None, Path::new("run.fcio")),
            Err(RawError::UnknownFormat(_))
        ));
        assert!(matches!(
            registry.detect(None, Path::new("run")),
            Err(RawError::UnknownFormat(_))
        ));
        assert!(matches!(
            registry.detect(Some("orca"), Path::new("run.rdq")),
            Err(RawError::UnknownFormat(_))
        ));
    }

    #[test]
    fn explicit_hint_wins_over_extension() {
        let registry = StreamerRegistry::new();
        assert_eq!(registry.detect(Some("rdq"), Path::new("run.bin")).unwrap(), "rdq");
    }

    #[test]
    fn parses_chunk_modes() {
        assert_eq!("full_only".parse::<ChunkMode>().unwrap(), ChunkMode::FullOnly);
        assert_eq!("any_full".parse::<ChunkMode>().unwrap(), ChunkMode::AnyFull);
        assert_eq!("single_packet".parse::<ChunkMode>().unwrap(), ChunkMode::SinglePacket);
        assert!("everything".parse::<ChunkMode>().is_err());
    }
}
