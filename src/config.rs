//! Configuration for the raw builder, loaded with Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file (`daq-raw.toml` unless another path is given)
//! 3. environment variables prefixed with `DAQ_RAW_`, sections separated by `__`
//!    (`DAQ_RAW_BUILD__BUFFER_SIZE=4096`, `DAQ_RAW_LOGGING__LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use daq_raw::config::RawConfig;
//!
//! let config = RawConfig::load()?;
//! config.validate()?;
//! let options = config.build_options()?;
//! println!("buffer size: {}", options.buffer_size);
//! # Ok::<(), daq_raw::error::RawError>(())
//! ```

use crate::error::{RawError, RawResult};
use crate::raw::buffer::MAX_BUFFER_ROWS;
use crate::raw::build::{BuildOptions, OutSpec, DEFAULT_BUFFER_SIZE};
use crate::raw::routing::RoutingSpec;
use crate::raw::streamer::ChunkMode;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration file read when no `--config` path is given.
pub const DEFAULT_CONFIG_FILE: &str = "daq-raw.toml";
/// Prefix of environment variables that override the file.
pub const ENV_PREFIX: &str = "DAQ_RAW_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    /// Defaults for `daq-raw build`.
    pub build: BuildConfig,
    /// Log level and format.
    pub logging: LoggingConfig,
}

/// Defaults for `daq-raw build`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Input format; detected from the file extension when unset
    pub format: Option<String>,
    /// Single output store for every identity
    pub output: Option<PathBuf>,
    /// JSON routing spec; takes precedence over `output`
    pub routing: Option<PathBuf>,
    /// Rows per buffer.
    pub buffer_size: usize,
    /// Stop after this many rows; unset means no limit.
    pub row_limit: Option<u64>,
    /// Delete existing outputs instead of failing.
    pub overwrite: bool,
    /// Fail on the first malformed record.
    pub strict: bool,
    /// When the streamer hands buffers back.
    pub chunk_mode: ChunkMode,
    /// Output store (arrow, csv, memory)
    pub store: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            format: None,
            output: None,
            routing: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            row_limit: None,
            overwrite: true,
            strict: false,
            chunk_mode: ChunkMode::FullOnly,
            store: "arrow".to_string(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-oriented output
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error; `RUST_LOG` overrides it
    pub level: String,
    /// Output format of the subscriber.
    pub format: LogFormat,
    /// Include source file and line in every event.
    pub file_and_line: bool,
    /// ANSI colours in pretty output.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file_and_line: false,
            ansi: true,
        }
    }
}

impl RawConfig {
    /// Load from `daq-raw.toml` in the working directory (if present) and the environment
    pub fn load() -> RawResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path. A missing file contributes nothing.
    pub fn load_from<P: AsRef<Path>>(path: P) -> RawResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// Layered provider: defaults, then `path`, then `DAQ_RAW_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(RawConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> RawResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(RawError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if !(1..=MAX_BUFFER_ROWS).contains(&self.build.buffer_size) {
            return Err(RawError::Configuration(format!(
                "build.buffer_size must be between 1 and {MAX_BUFFER_ROWS}"
            )));
        }

        if self.build.store.trim().is_empty() {
            return Err(RawError::Configuration("build.store is empty".into()));
        }

        if let Some(routing) = &self.build.routing {
            if !routing.is_file() {
                return Err(RawError::Configuration(format!(
                    "routing spec {} does not exist",
                    routing.display()
                )));
            }
        }

        Ok(())
    }

    /// Options for one build, reading the routing spec if one is configured
    pub fn build_options(&self) -> RawResult<BuildOptions> {
        let build = &self.build;
        let out_spec = match (&build.routing, &build.output) {
            (Some(routing), _) => OutSpec::Routing(RoutingSpec::from_file(routing)?),
            (None, Some(output)) => OutSpec::Path(output.clone()),
            (None, None) => OutSpec::Default,
        };
        Ok(BuildOptions {
            format: build.format.clone(),
            out_spec,
            buffer_size: build.buffer_size,
            row_limit: build.row_limit,
            overwrite: build.overwrite,
            strict: build.strict,
            chunk_mode: build.chunk_mode,
            store: build.store.clone(),
            ..BuildOptions::default()
        })
    }
}
