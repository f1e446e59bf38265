//! Progress hooks for a raw build.

use super::build::BuildSummary;

/// Snapshot handed to [`ProgressObserver::on_chunk`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Input bytes consumed so far, header included.
    pub bytes_read: u64,
    /// Data rows written so far.
    pub rows_written: u64,
    /// Malformed records skipped so far.
    pub records_skipped: u64,
}

/// Observes a build. Called from the build loop once per chunk; never read back.
pub trait ProgressObserver {
    /// `total_bytes` is the input size when known.
    fn on_start(&mut self, _total_bytes: Option<u64>, _row_limit: Option<u64>) {}

    /// Called after every chunk has been written.
    fn on_chunk(&mut self, _update: &ProgressUpdate) {}

    /// Called once after a successful build.
    fn on_finish(&mut self, _summary: &BuildSummary) {}
}

/// Ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {}

impl<P: ProgressObserver + ?Sized> ProgressObserver for &mut P {
    fn on_start(&mut self, total_bytes: Option<u64>, row_limit: Option<u64>) {
        (**self).on_start(total_bytes, row_limit)
    }

    fn on_chunk(&mut self, update: &ProgressUpdate) {
        (**self).on_chunk(update)
    }

    fn on_finish(&mut self, summary: &BuildSummary) {
        (**self).on_finish(summary)
    }
}
