//! The raw-tier ingestion engine.
//!
//! Streamers decode a binary DAQ input into [`RawBuffer`]s held by a
//! [`RawBufferLibrary`]; the build loop in [`build`] flushes full buffers to a
//! [`RawSink`](crate::store::RawSink) until the input or the row budget runs out.

/// Raw buffers and buffer lists.
pub mod buffer;
/// The build loop.
pub mod build;
/// Stream identities.
pub mod key;
/// Routing table from identity to buffer.
pub mod library;
/// Progress hooks.
pub mod progress;
/// The RDQ reference format.
pub mod rdq;
/// Routing specifications.
pub mod routing;
/// The decoder contract and format registry.
pub mod streamer;
/// Fixed-capacity columnar tables.
pub mod table;

pub use buffer::{BufferId, RawBuffer, RawBufferList, HEADER_GROUP};
pub use build::{
    build_raw, BuildError, BuildOptions, BuildPhase, BuildSummary, OutSpec, RawBuilder, RowBudget,
};
pub use key::StreamKey;
pub use library::{RawBufferLibrary, RouteTarget};
pub use progress::{NoProgress, ProgressObserver, ProgressUpdate};
pub use routing::{KeySelector, RouteEntry, RoutingSpec};
pub use streamer::{ChunkMode, DataStreamer, StreamOptions, StreamStats, StreamerRegistry};
pub use table::{Column, ColumnType, Schema, Table, Value};
