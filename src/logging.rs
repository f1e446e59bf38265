//! Tracing setup for the `daq-raw` binary and embedding applications.
//!
//! Built on `tracing-subscriber`:
//! - pretty, compact or JSON output
//! - `EnvFilter` with `RUST_LOG` taking precedence over the configured level
//! - idempotent initialisation, so tests and libraries can call [`init`] freely
//!
//! # Example
//! ```no_run
//! use daq_raw::{config::RawConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RawConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("ready");
//! # Ok(())
//! # }
//! ```

use crate::config::{LogFormat, RawConfig};
use crate::error::{RawError, RawResult};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Events below this level are dropped unless `RUST_LOG` says otherwise.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source file and line numbers
    pub with_file_and_line: bool,
    /// ANSI colours (pretty format only)
    pub with_ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LogSettings {
    /// Settings at `level` with the default format.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Settings from the `[logging]` section of `config`.
    pub fn from_config(config: &RawConfig) -> RawResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: config.logging.format,
            with_file_and_line: config.logging.file_and_line,
            with_ansi: config.logging.ansi,
        })
    }

    /// Replaces the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables or disables ANSI colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Level from CLI verbosity: `-q` gives warnings only, each `-v` goes one level down.
    pub fn from_verbosity(verbose: u8, quiet: bool) -> Self {
        let level = match (quiet, verbose) {
            (true, _) => Level::WARN,
            (false, 0) => Level::INFO,
            (false, 1) => Level::DEBUG,
            (false, _) => Level::TRACE,
        };
        Self::new(level)
    }
}

/// Initialize tracing from the loaded configuration
pub fn init_from_config(config: &RawConfig) -> RawResult<()> {
    init(LogSettings::from_config(config)?)
}

/// Installs the global subscriber. Returns `Ok(())` if one is already set.
pub fn init(settings: LogSettings) -> RawResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str().to_lowercase()));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match settings.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_ansi(settings.with_ansi)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .map_err(|e| RawError::Configuration(format!("Failed to initialize tracing: {e}")))
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> RawResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(RawError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}
