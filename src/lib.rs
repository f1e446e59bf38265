//! # daq-raw
//!
//! Streaming conversion of raw binary DAQ streams into columnar "raw tier" stores.
//!
//! A detector readout produces one long binary stream interleaving records from many
//! hardware channels and decoder streams. This crate decodes such a stream in bounded
//! memory, routes every record by its stream identity to a fixed-capacity buffer, and
//! flushes buffers into per-destination, per-group tables as they fill.
//!
//! ## Crate Structure
//!
//! - **`raw`**: the engine. Tables and buffers, the buffer library and routing specs, the
//!   `DataStreamer` contract with the reference `rdq` decoder, and the build loop.
//! - **`store`**: the `RawSink` contract and the Arrow IPC, CSV and in-memory stores.
//! - **`config`**: Figment-based configuration (TOML file plus `DAQ_RAW_` environment).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: the `RawError` enum shared by every module.
//!
//! ## Example
//!
//! ```no_run
//! use daq_raw::raw::{build_raw, BuildOptions};
//!
//! let summary = build_raw("run_0001.rdq", &BuildOptions::default())?;
//! println!("{summary}");
//! # Ok::<(), daq_raw::raw::BuildError>(())
//! ```

/// Figment-based configuration.
pub mod config;
/// Error types shared by every module.
pub mod error;
/// `tracing-subscriber` setup.
pub mod logging;
/// The raw-tier engine: buffers, routing, streamers and the build loop.
pub mod raw;
/// Output stores.
pub mod store;

pub use error::{RawError, RawResult};
