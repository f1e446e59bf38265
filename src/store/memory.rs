//! In-memory store.

use super::RawSink;
use crate::error::{RawError, RawResult};
use crate::raw::buffer::RawBuffer;
use crate::raw::table::Table;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Batches {
    groups: BTreeMap<(PathBuf, String), Vec<Table>>,
    appends: usize,
    finished: bool,
}

/// Keeps every appended batch, per `(out_stream, group)`.
///
/// Clones share the same storage, so a test can hand one clone to the orchestrator and
/// inspect the other afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Batches>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Batches> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Batches appended to one group, in order.
    pub fn batches(&self, out_stream: &Path, group: &str) -> Vec<Table> {
        self.lock()
            .groups
            .get(&(out_stream.to_path_buf(), group.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Total rows appended to one group.
    pub fn rows(&self, out_stream: &Path, group: &str) -> usize {
        self.batches(out_stream, group).iter().map(Table::len).sum()
    }

    /// Every `(out_stream, group)` written so far, sorted.
    pub fn groups(&self) -> Vec<(PathBuf, String)> {
        self.lock().groups.keys().cloned().collect()
    }

    /// Number of `append` calls.
    pub fn appends(&self) -> usize {
        self.lock().appends
    }

    /// Whether `finish` was called.
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }
}

impl RawSink for MemorySink {
    fn append(&mut self, buffer: &RawBuffer) -> RawResult<()> {
        let mut batches = self.lock();
        if batches.finished {
            return Err(RawError::Storage("append after finish".into()));
        }
        batches.appends += 1;
        batches
            .groups
            .entry((buffer.out_stream().to_path_buf(), buffer.group().to_string()))
            .or_default()
            .push(buffer.table().snapshot());
        Ok(())
    }

    fn finish(&mut self) -> RawResult<()> {
        self.lock().finished = true;
        Ok(())
    }
}
