//! RDQ encoder, used by the simulator, the tests and the benchmarks.

use super::header::RdqHeader;
use super::record::{encode_event, encode_status, encode_sync, EventRecord, RecordHeader, StatusRecord};
use std::io::{self, Write};

/// Writes an RDQ stream: the header on construction, then one record per call.
pub struct RdqWriter<W: Write> {
    inner: W,
    scratch: Vec<u8>,
    bytes_written: u64,
}

impl<W: Write> RdqWriter<W> {
    /// Writes `header` to `inner`.
    pub fn new(inner: W, header: &RdqHeader) -> io::Result<Self> {
        let mut writer = Self {
            inner,
            scratch: Vec::with_capacity(header.encoded_len()),
            bytes_written: 0,
        };
        header.encode(&mut writer.scratch);
        writer.flush_scratch()?;
        Ok(writer)
    }

    fn flush_scratch(&mut self) -> io::Result<()> {
        self.inner.write_all(&self.scratch)?;
        self.bytes_written += self.scratch.len() as u64;
        self.scratch.clear();
        Ok(())
    }

    /// Appends an event without flags.
    pub fn write_event(&mut self, event: &EventRecord) -> io::Result<()> {
        self.write_flagged_event(event, 0)
    }

    /// Event with explicit record flags, e.g. [`FLAG_CRC_ERROR`](super::record::FLAG_CRC_ERROR).
    pub fn write_flagged_event(&mut self, event: &EventRecord, flags: u8) -> io::Result<()> {
        encode_event(event, flags, &mut self.scratch);
        self.flush_scratch()
    }

    /// Appends a status record.
    pub fn write_status(&mut self, status: &StatusRecord) -> io::Result<()> {
        encode_status(status, &mut self.scratch);
        self.flush_scratch()
    }

    /// Appends a sync record.
    pub fn write_sync(&mut self, timestamp: Option<u64>) -> io::Result<()> {
        encode_sync(timestamp, &mut self.scratch);
        self.flush_scratch()
    }

    /// Record with an arbitrary tag and payload.
    pub fn write_raw(&mut self, tag: u8, flags: u8, channel: u16, payload: &[u8]) -> io::Result<()> {
        RecordHeader {
            tag,
            flags,
            channel,
            payload_len: payload.len() as u32,
        }
        .encode(&mut self.scratch);
        self.scratch.extend_from_slice(payload);
        self.flush_scratch()
    }

    /// Bytes written so far, header included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::rdq::record::RECORD_HEADER_LEN;

    #[test]
    fn counts_bytes_written() {
        let header = RdqHeader::new(3, 0, 8).with_channel(1, 4);
        let mut w = RdqWriter::new(Vec::new(), &header).unwrap();
        assert_eq!(w.bytes_written(), 40);
        w.write_sync(None).unwrap();
        w.write_raw(0x09, 0, 1, &[0; 3]).unwrap();
        assert_eq!(w.bytes_written(), 40 + RECORD_HEADER_LEN as u64 * 2 + 3);
        let bytes = w.into_inner().unwrap();
        assert_eq!(bytes.len(), 59);
        assert_eq!(&bytes[..4], b"RDAQ");
    }
}
