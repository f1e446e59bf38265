//! Raw buffers and buffer lists.
//!
//! A [`RawBuffer`] pairs a [`Table`] with the stream identities it accepts and the
//! destination its rows are flushed to. Buffers live in a
//! [`RawBufferLibrary`](super::library::RawBufferLibrary); everything else refers to them
//! through [`BufferId`] handles collected in a [`RawBufferList`].

use super::key::StreamKey;
use super::table::Table;
use std::path::{Path, PathBuf};

/// Group that receives the stream header in every destination.
pub const HEADER_GROUP: &str = "header";

/// Largest row capacity a buffer may be configured with.
pub const MAX_BUFFER_ROWS: usize = 1 << 24;

/// Largest allocation, in bytes, a single buffer may reserve up front.
pub const MAX_BUFFER_BYTES: u64 = 1 << 32;

/// Handle to a buffer owned by a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) usize);

/// Capacity-bounded accumulator for the records of one or more stream identities.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    keys: Vec<StreamKey>,
    out_stream: PathBuf,
    group: String,
    table: Table,
}

impl RawBuffer {
    /// Empty buffer flushed into `group` of `out_stream`.
    pub fn new(out_stream: impl Into<PathBuf>, group: impl Into<String>, table: Table) -> Self {
        Self {
            keys: Vec::new(),
            out_stream: out_stream.into(),
            group: group.into(),
            table,
        }
    }

    /// Buffer carrying the header table for one destination.
    pub fn header(out_stream: impl Into<PathBuf>, table: Table) -> Self {
        Self::new(out_stream, HEADER_GROUP, table)
    }

    /// Stream identities routed into this buffer, in first-seen order.
    pub fn keys(&self) -> &[StreamKey] {
        &self.keys
    }

    pub(crate) fn add_key(&mut self, key: StreamKey) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    /// Output store this buffer is flushed into.
    pub fn out_stream(&self) -> &Path {
        &self.out_stream
    }

    /// Group (table name) inside the output store.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Rows held since the last flush.
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Mutable access for decoders appending rows.
    pub fn table_mut(&mut self) -> &mut Table {
        &mut self.table
    }

    /// Fill cursor.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the buffer holds no rows.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Whether the fill cursor reached the capacity.
    pub fn is_full(&self) -> bool {
        self.table.is_full()
    }

    /// Row capacity.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Drops every row past `rows`.
    pub fn truncate(&mut self, rows: usize) {
        self.table.truncate(rows);
    }

    /// Resets the fill cursor, keeping the allocation.
    pub fn clear(&mut self) {
        self.table.clear();
    }
}

/// Ordered, duplicate-free list of buffer handles needing attention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBufferList {
    ids: Vec<BufferId>,
}

impl RawBufferList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id` unless it is already listed.
    pub fn push(&mut self, id: BufferId) {
        if !self.ids.contains(&id) {
            self.ids.push(id);
        }
    }

    /// Whether `id` is in the list.
    pub fn contains(&self, id: BufferId) -> bool {
        self.ids.contains(&id)
    }

    /// Number of buffers listed.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Buffers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.ids.iter().copied()
    }
}

impl FromIterator<BufferId> for RawBufferList {
    fn from_iter<T: IntoIterator<Item = BufferId>>(iter: T) -> Self {
        let mut list = RawBufferList::new();
        for id in iter {
            list.push(id);
        }
        list
    }
}
