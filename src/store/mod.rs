//! Output stores.
//!
//! A [`RawSink`] persists the filled region of raw buffers. The orchestrator appends a
//! buffer, then clears it through the same sink, so a store that needs to see the clear
//! (or wants to recycle allocations) can hook it.
//!
//! Stores are created by name through [`SinkRegistry`], which registers each built-in
//! store only when its cargo feature is enabled:
//! - `storage_arrow` → `arrow`
//! - `storage_csv` → `csv`
//! - `memory` is always available

/// Arrow IPC store.
#[cfg(feature = "storage_arrow")]
pub mod arrow_store;
/// CSV store.
#[cfg(feature = "storage_csv")]
pub mod csv_store;
/// In-memory store.
pub mod memory;

#[cfg(feature = "storage_arrow")]
pub use arrow_store::ArrowStore;
#[cfg(feature = "storage_csv")]
pub use csv_store::CsvStore;
pub use memory::MemorySink;

use crate::error::{RawError, RawResult};
use crate::raw::buffer::{RawBuffer, RawBufferList};
use crate::raw::library::RawBufferLibrary;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Appends buffer contents to persistent storage.
pub trait RawSink {
    /// Writes the buffer's filled rows to `(out_stream, group)`. Called any number of
    /// times per group; rows accumulate in call order.
    fn append(&mut self, buffer: &RawBuffer) -> RawResult<()>;

    /// Resets the buffer after a successful append.
    fn clear(&mut self, buffer: &mut RawBuffer) {
        buffer.clear();
    }

    /// Closes every open store. Nothing may be appended afterwards.
    fn finish(&mut self) -> RawResult<()>;
}

impl<S: RawSink + ?Sized> RawSink for Box<S> {
    fn append(&mut self, buffer: &RawBuffer) -> RawResult<()> {
        (**self).append(buffer)
    }

    fn clear(&mut self, buffer: &mut RawBuffer) {
        (**self).clear(buffer)
    }

    fn finish(&mut self) -> RawResult<()> {
        (**self).finish()
    }
}

/// Appends every non-empty buffer in `list`, then clears all of them. Returns the number
/// of rows written.
pub fn write_and_clear(
    list: &RawBufferList,
    library: &mut RawBufferLibrary,
    sink: &mut dyn RawSink,
) -> RawResult<usize> {
    let mut rows = 0;
    for id in list.iter() {
        let buffer = library.buffer_mut(id);
        if !buffer.is_empty() {
            sink.append(buffer)?;
            rows += buffer.len();
        }
        sink.clear(buffer);
    }
    Ok(rows)
}

/// Creates the directory backing a store, if missing.
pub(crate) fn ensure_store_dir(out_stream: &Path) -> RawResult<()> {
    if out_stream.is_file() {
        return Err(RawError::Storage(format!(
            "{} is a file, expected a store directory",
            out_stream.display()
        )));
    }
    fs::create_dir_all(out_stream)?;
    Ok(())
}

/// Group names become file names; path separators would escape the store.
pub(crate) fn group_file_name(group: &str, extension: &str) -> RawResult<String> {
    if group.is_empty() || group.contains(['/', '\\']) || group == "." || group == ".." {
        return Err(RawError::Storage(format!(
            "group name '{group}' cannot be used as a file name"
        )));
    }
    Ok(format!("{group}.{extension}"))
}

type SinkFactory = Box<dyn Fn() -> Box<dyn RawSink> + Send + Sync>;

/// Store name to sink constructor, populated from enabled cargo features.
pub struct SinkRegistry {
    factories: HashMap<String, SinkFactory>,
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkRegistry {
    /// Registry with every store compiled into this build.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        #[cfg(feature = "storage_arrow")]
        registry.register("arrow", || Box::new(ArrowStore::new()));

        #[cfg(feature = "storage_csv")]
        registry.register("csv", || Box::new(CsvStore::new()));

        registry.register("memory", || Box::new(MemorySink::new()));

        registry
    }

    /// Registers a custom store under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn RawSink> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Creates a new sink for `name`.
    ///
    /// # Arguments
    ///
    /// * `name` - Store name (e.g., "arrow", "csv", "memory")
    ///
    /// # Errors
    ///
    /// `FeatureNotEnabled` when `name` is a built-in store compiled out of this build,
    /// `Configuration` for any other unknown name.
    ///
    /// # Examples
    ///
    /// ```
    /// use daq_raw::store::SinkRegistry;
    ///
    /// let registry = SinkRegistry::new();
    /// let sink = registry.create("memory")?;
    /// # drop(sink);
    /// # Ok::<(), daq_raw::RawError>(())
    /// ```
    pub fn create(&self, name: &str) -> RawResult<Box<dyn RawSink>> {
        if let Some(factory) = self.factories.get(name) {
            return Ok(factory());
        }
        match name {
            "arrow" => Err(RawError::FeatureNotEnabled("storage_arrow".into())),
            "csv" => Err(RawError::FeatureNotEnabled("storage_csv".into())),
            _ => Err(RawError::Configuration(format!(
                "unsupported store '{name}'. Available stores: [{}]",
                self.list_formats().join(", ")
            ))),
        }
    }

    /// Registered store names, sorted.
    pub fn list_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = self.factories.keys().cloned().collect();
        formats.sort();
        formats
    }

    /// Whether `name` is registered.
    pub fn is_available(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}
