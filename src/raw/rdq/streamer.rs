//! Streamer for the RDQ reference format.

use super::header::RdqHeader;
use super::read_up_to;
use super::record::{
    decode, event_schema, status_schema, Decoded, RecordHeader, MAX_PAYLOAD_LEN,
    RECORD_HEADER_LEN, STATUS_STREAM,
};
use super::FORMAT_NAME;
use crate::error::{RawError, RawResult};
use crate::raw::buffer::{BufferId, RawBufferList};
use crate::raw::key::StreamKey;
use crate::raw::library::RawBufferLibrary;
use crate::raw::streamer::{ChunkMode, DataStreamer, StreamOptions, StreamStats};
use crate::raw::table::{Schema, Table, Value};
use std::collections::HashMap;
use std::io::{BufReader, Read};
use std::sync::Arc;
use tracing::{debug, warn};

const READ_BUFFER_BYTES: usize = 1 << 16;

/// Decodes RDQ files into raw buffers.
///
/// Events are routed by channel number, status words under the `status` identity.
/// Records with invalid contents are skipped and counted, or rejected in strict mode;
/// a record cut short by the end of the input is always fatal.
pub struct RdqStreamer {
    reader: Option<BufReader<Box<dyn Read>>>,
    header: Option<RdqHeader>,
    options: StreamOptions,
    stats: StreamStats,
    record_header: [u8; RECORD_HEADER_LEN],
    payload: Vec<u8>,
    samples: Vec<u16>,
    declared: HashMap<u16, usize>,
    event_schemas: HashMap<usize, Arc<Schema>>,
    status_schema: Arc<Schema>,
    exhausted: bool,
}

impl Default for RdqStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl RdqStreamer {
    /// Streamer waiting for [`DataStreamer::open`].
    pub fn new() -> Self {
        Self {
            reader: None,
            header: None,
            options: StreamOptions::default(),
            stats: StreamStats::default(),
            record_header: [0; RECORD_HEADER_LEN],
            payload: Vec::new(),
            samples: Vec::new(),
            declared: HashMap::new(),
            event_schemas: HashMap::new(),
            status_schema: status_schema(),
            exhausted: false,
        }
    }

    /// Header of the open stream.
    pub fn header(&self) -> Option<&RdqHeader> {
        self.header.as_ref()
    }

    fn event_schema(&mut self, waveform_len: usize) -> Arc<Schema> {
        Arc::clone(
            self.event_schemas
                .entry(waveform_len)
                .or_insert_with(|| event_schema(waveform_len)),
        )
    }

    /// Reads the next record into the scratch buffers. `None` at a clean end of input.
    fn next_record(&mut self) -> RawResult<Option<RecordHeader>> {
        if self.exhausted {
            return Ok(None);
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| RawError::Configuration("RDQ stream read before open".into()))?;
        let offset = self.stats.bytes_read;

        let got = read_up_to(reader, &mut self.record_header)?;
        if got == 0 {
            self.exhausted = true;
            return Ok(None);
        }
        if got < RECORD_HEADER_LEN {
            return Err(RawError::TruncatedInput {
                offset,
                needed: RECORD_HEADER_LEN as u64,
                available: got as u64,
            });
        }
        let header = RecordHeader::parse(&self.record_header);
        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(RawError::Format(format!(
                "record at byte {offset} declares a {} byte payload",
                header.payload_len
            )));
        }

        let len = header.payload_len as usize;
        self.payload.resize(len, 0);
        let got = read_up_to(reader, &mut self.payload)?;
        if got < len {
            return Err(RawError::TruncatedInput {
                offset,
                needed: (RECORD_HEADER_LEN + len) as u64,
                available: (RECORD_HEADER_LEN + got) as u64,
            });
        }
        self.stats.bytes_read += (RECORD_HEADER_LEN + len) as u64;
        Ok(Some(header))
    }

    fn skip(&mut self, offset: u64, reason: String) -> RawResult<()> {
        if self.options.strict {
            return Err(RawError::MalformedRecord { offset, reason });
        }
        self.stats.records_skipped += 1;
        warn!(offset, %reason, "skipping malformed record");
        Ok(())
    }

    /// Appends the record held in the scratch buffers. `Ok(None)` when the record was
    /// discarded or skipped.
    fn append(
        &mut self,
        decoded: Decoded,
        offset: u64,
        library: &mut RawBufferLibrary,
    ) -> RawResult<Option<BufferId>> {
        let (key, schema) = match decoded {
            Decoded::Event(fields) => {
                let n = self.samples.len();
                if let Some(&declared) = self.declared.get(&fields.channel) {
                    if declared != n {
                        return self
                            .skip(
                                offset,
                                format!(
                                    "channel {} waveform has {n} samples, header declares {declared}",
                                    fields.channel
                                ),
                            )
                            .map(|_| None);
                    }
                }
                (StreamKey::from(fields.channel), self.event_schema(n))
            }
            Decoded::Status(_) => (StreamKey::from(STATUS_STREAM), Arc::clone(&self.status_schema)),
            Decoded::Sync(_) => return Ok(None),
        };

        let id = match library.buffer_for(&key, &schema) {
            Ok(Some(id)) => id,
            Ok(None) => {
                self.stats.records_discarded += 1;
                return Ok(None);
            }
            Err(RawError::Configuration(reason)) => return self.skip(offset, reason).map(|_| None),
            Err(e) => return Err(e),
        };

        let table = library.buffer_mut(id).table_mut();
        let appended = match decoded {
            Decoded::Event(fields) => table.append_row(&[
                Value::U32(u32::from(fields.channel)),
                Value::U32(fields.event_no),
                Value::U64(fields.timestamp),
                Value::U16(fields.baseline),
                Value::Samples(&self.samples),
            ]),
            Decoded::Status(status) => table.append_row(&[
                Value::U64(status.timestamp),
                Value::U32(status.error_count),
                Value::F64(f64::from(status.temperature_mc) / 1000.0),
            ]),
            Decoded::Sync(_) => return Ok(None),
        };
        if let Err(e) = appended {
            return self.skip(offset, e.to_string()).map(|_| None);
        }
        self.stats.records_decoded += 1;
        Ok(Some(id))
    }

    fn finish_chunk(&mut self, list: RawBufferList) -> RawResult<RawBufferList> {
        if !list.is_empty() {
            self.stats.chunks += 1;
        }
        Ok(list)
    }
}

impl DataStreamer for RdqStreamer {
    fn format_name(&self) -> &'static str {
        FORMAT_NAME
    }

    fn open(
        &mut self,
        source: Box<dyn Read>,
        library: &mut RawBufferLibrary,
        options: &StreamOptions,
    ) -> RawResult<Table> {
        let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, source);
        let header = RdqHeader::read_from(&mut reader)?;
        debug!(
            run = header.run_number,
            channels = header.channels.len(),
            "read RDQ header"
        );

        self.options = options.clone();
        self.stats = StreamStats {
            bytes_read: header.encoded_len() as u64,
            ..StreamStats::default()
        };
        self.exhausted = false;
        self.declared = header
            .channels
            .iter()
            .map(|c| (c.channel, usize::from(c.waveform_len)))
            .collect();

        for info in &header.channels {
            let schema = self.event_schema(usize::from(info.waveform_len));
            library.buffer_for(&StreamKey::from(info.channel), &schema)?;
        }
        let status = Arc::clone(&self.status_schema);
        library.buffer_for(&StreamKey::from(STATUS_STREAM), &status)?;

        let table = header.to_table()?;
        self.header = Some(header);
        self.reader = Some(reader);
        Ok(table)
    }

    fn read_chunk(&mut self, library: &mut RawBufferLibrary) -> RawResult<RawBufferList> {
        // A buffer the caller left full must be drained before decoding further.
        let full = library.full_buffers();
        if !full.is_empty() {
            return self.finish_chunk(full);
        }

        loop {
            let offset = self.stats.bytes_read;
            let Some(header) = self.next_record()? else {
                let rest = library.nonempty_buffers();
                return self.finish_chunk(rest);
            };

            let decoded = match decode(&header, &self.payload, &mut self.samples) {
                Ok(decoded) => decoded,
                Err(reason) => {
                    self.skip(offset, reason)?;
                    continue;
                }
            };

            if let Decoded::Sync(_) = decoded {
                let pending = library.nonempty_buffers();
                if pending.is_empty() {
                    continue;
                }
                return self.finish_chunk(pending);
            }

            let Some(id) = self.append(decoded, offset, library)? else {
                continue;
            };

            let full = library.buffer(id).is_full();
            match self.options.chunk_mode {
                ChunkMode::SinglePacket => {
                    let list = [id].into_iter().collect();
                    return self.finish_chunk(list);
                }
                ChunkMode::FullOnly if full => {
                    let list = library.full_buffers();
                    return self.finish_chunk(list);
                }
                ChunkMode::AnyFull if full => {
                    let list = library.nonempty_buffers();
                    return self.finish_chunk(list);
                }
                _ => {}
            }
        }
    }

    fn stats(&self) -> StreamStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::rdq::record::{EventRecord, StatusRecord};
    use crate::raw::rdq::RdqWriter;

    fn event(channel: u16, event_no: u32, len: usize) -> EventRecord {
        EventRecord {
            channel,
            event_no,
            timestamp: u64::from(event_no) * 100,
            baseline: 1000,
            waveform: vec![event_no as u16; len],
        }
    }

    fn open(bytes: Vec<u8>, lib: &mut RawBufferLibrary, options: StreamOptions) -> RdqStreamer {
        let mut streamer = RdqStreamer::new();
        streamer
            .open(Box::new(std::io::Cursor::new(bytes)), lib, &options)
            .unwrap();
        streamer
    }

    fn drain(streamer: &mut RdqStreamer, lib: &mut RawBufferLibrary) -> Vec<(String, Vec<u32>)> {
        let mut flushes = Vec::new();
        loop {
            let list = streamer.read_chunk(lib).unwrap();
            if list.is_empty() {
                return flushes;
            }
            for id in list.iter() {
                let buffer = lib.buffer_mut(id);
                let rows = buffer
                    .table()
                    .column("event_no")
                    .and_then(|c| c.as_u32())
                    .map(<[u32]>::to_vec)
                    .unwrap_or_default();
                flushes.push((buffer.group().to_string(), rows));
                buffer.clear();
            }
        }
    }

    #[test]
    fn open_creates_buffers_for_declared_channels() {
        let header = RdqHeader::new(1, 0, 16).with_channel(0, 4).with_channel(1, 4);
        let bytes = RdqWriter::new(Vec::new(), &header).unwrap().into_inner().unwrap();
        let mut lib = RawBufferLibrary::catch_all("run.raw", 8);
        let streamer = open(bytes, &mut lib, StreamOptions::default());
        let groups: Vec<_> = lib.buffers().map(|(_, b)| b.group().to_string()).collect();
        assert_eq!(groups, vec!["ch0", "ch1", "status"]);
        assert_eq!(streamer.stats().bytes_read, header.encoded_len() as u64);
    }

    #[test]
    fn full_only_returns_full_buffers_then_the_rest() {
        let header = RdqHeader::new(1, 0, 16).with_channel(0, 2).with_channel(1, 2);
        let mut w = RdqWriter::new(Vec::new(), &header).unwrap();
        for i in 0..3 {
            w.write_event(&event(0, i, 2)).unwrap();
        }
        w.write_event(&event(1, 10, 2)).unwrap();
        let bytes = w.into_inner().unwrap();

        let mut lib = RawBufferLibrary::catch_all("run.raw", 2);
        let mut streamer = open(bytes, &mut lib, StreamOptions::default());
        let flushes = drain(&mut streamer, &mut lib);
        assert_eq!(
            flushes,
            vec![
                ("ch0".to_string(), vec![0, 1]),
                ("ch0".to_string(), vec![2]),
                ("ch1".to_string(), vec![10]),
            ]
        );
        assert_eq!(streamer.stats().records_decoded, 4);
    }

    #[test]
    fn sync_record_ends_a_chunk() {
        let header = RdqHeader::new(1, 0, 16).with_channel(0, 1);
        let mut w = RdqWriter::new(Vec::new(), &header).unwrap();
        w.write_sync(None).unwrap();
        w.write_event(&event(0, 1, 1)).unwrap();
        w.write_sync(Some(5)).unwrap();
        w.write_sync(Some(6)).unwrap();
        w.write_event(&event(0, 2, 1)).unwrap();
        let bytes = w.into_inner().unwrap();

        let mut lib = RawBufferLibrary::catch_all("run.raw", 100);
        let mut streamer = open(bytes, &mut lib, StreamOptions::default());
        let flushes = drain(&mut streamer, &mut lib);
        assert_eq!(
            flushes,
            vec![("ch0".to_string(), vec![1]), ("ch0".to_string(), vec![2])]
        );
    }

    #[test]
    fn single_packet_mode_returns_every_record() {
        let header = RdqHeader::new(1, 0, 16).with_channel(0, 1);
        let mut w = RdqWriter::new(Vec::new(), &header).unwrap();
        for i in 0..3 {
            w.write_event(&event(0, i, 1)).unwrap();
        }
        let bytes = w.into_inner().unwrap();
        let mut lib = RawBufferLibrary::catch_all("run.raw", 100);
        let options = StreamOptions {
            chunk_mode: ChunkMode::SinglePacket,
            strict: false,
        };
        let mut streamer = open(bytes, &mut lib, options);
        let flushes = drain(&mut streamer, &mut lib);
        assert_eq!(flushes.len(), 3);
    }

    #[test]
    fn skips_malformed_records_in_order() {
        let header = RdqHeader::new(1, 0, 16).with_channel(0, 2);
        let mut w = RdqWriter::new(Vec::new(), &header).unwrap();
        w.write_event(&event(0, 1, 2)).unwrap();
        w.write_event(&event(0, 2, 3)).unwrap(); // wrong waveform length
        w.write_event(&event(0, 3, 2)).unwrap();
        let bytes = w.into_inner().unwrap();

        let mut lib = RawBufferLibrary::catch_all("run.raw", 100);
        let mut streamer = open(bytes, &mut lib, StreamOptions::default());
        let flushes = drain(&mut streamer, &mut lib);
        assert_eq!(flushes, vec![("ch0".to_string(), vec![1, 3])]);
        assert_eq!(streamer.stats().records_skipped, 1);
    }

    #[test]
    fn strict_mode_fails_on_malformed_record() {
        let header = RdqHeader::new(1, 0, 16).with_channel(0, 2);
        let mut w = RdqWriter::new(Vec::new(), &header).unwrap();
        w.write_event(&event(0, 1, 2)).unwrap();
        w.write_raw(0x42, 0, 0, &[1, 2, 3]).unwrap();
        let bytes = w.into_inner().unwrap();

        let mut lib = RawBufferLibrary::catch_all("run.raw", 100);
        let options = StreamOptions {
            strict: true,
            ..StreamOptions::default()
        };
        let mut streamer = open(bytes, &mut lib, options);
        let err = streamer.read_chunk(&mut lib).unwrap_err();
        assert!(matches!(err, RawError::MalformedRecord { offset: 68, .. }));
        // The valid record before it is intact.
        let ch0 = lib.lookup(&StreamKey::Int(0)).unwrap();
        assert_eq!(lib.buffer(ch0).len(), 1);
    }

    #[test]
    fn truncated_record_is_fatal() {
        let header = RdqHeader::new(1, 0, 16).with_channel(0, 4);
        let mut w = RdqWriter::new(Vec::new(), &header).unwrap();
        w.write_event(&event(0, 1, 4)).unwrap();
        let mut bytes = w.into_inner().unwrap();
        bytes.truncate(bytes.len() - 3);

        let mut lib = RawBufferLibrary::catch_all("run.raw", 100);
        let mut streamer = open(bytes, &mut lib, StreamOptions::default());
        let err = streamer.read_chunk(&mut lib).unwrap_err();
        assert!(matches!(err, RawError::TruncatedInput { offset: 40, needed: 32, available: 29 }));
        let ch0 = lib.lookup(&StreamKey::Int(0)).unwrap();
        assert!(lib.buffer(ch0).is_empty());
    }

    #[test]
    fn undeclared_channel_and_status_are_routed() {
        let header = RdqHeader::new(1, 0, 16);
        let mut w = RdqWriter::new(Vec::new(), &header).unwrap();
        w.write_event(&event(9, 1, 3)).unwrap();
        w.write_status(&StatusRecord {
            timestamp: 1,
            error_count: 0,
            temperature_mc: 41_500,
        })
        .unwrap();
        let bytes = w.into_inner().unwrap();

        let mut lib = RawBufferLibrary::catch_all("run.raw", 100);
        let mut streamer = open(bytes, &mut lib, StreamOptions::default());
        let list = streamer.read_chunk(&mut lib).unwrap();
        assert_eq!(list.len(), 2);
        let status = lib.lookup(&StreamKey::from(STATUS_STREAM)).unwrap();
        assert_eq!(
            lib.buffer(status).table().column("temperature").unwrap().as_f64().unwrap(),
            &[41.5]
        );
        let ch9 = lib.lookup(&StreamKey::Int(9)).unwrap();
        assert_eq!(lib.buffer(ch9).group(), "ch9");
    }

    #[test]
    fn leftover_full_buffer_is_returned_before_decoding() {
        let header = RdqHeader::new(1, 0, 16).with_channel(0, 1);
        let mut w = RdqWriter::new(Vec::new(), &header).unwrap();
        w.write_event(&event(0, 1, 1)).unwrap();
        w.write_event(&event(0, 2, 1)).unwrap();
        let bytes = w.into_inner().unwrap();

        let mut lib = RawBufferLibrary::catch_all("run.raw", 1);
        let mut streamer = open(bytes, &mut lib, StreamOptions::default());
        let first = streamer.read_chunk(&mut lib).unwrap();
        let bytes_after_first = streamer.stats().bytes_read;
        let again = streamer.read_chunk(&mut lib).unwrap();
        assert_eq!(first, again);
        assert_eq!(streamer.stats().bytes_read, bytes_after_first);
    }
}
