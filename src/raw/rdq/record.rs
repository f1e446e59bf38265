//! RDQ records.
//!
//! Every record starts with an 8-byte header: tag `u8`, flags `u8`, channel `u16`,
//! payload length `u32`. The payload length always delimits the record, so a record with
//! bad contents can be skipped without losing the stream position.

use crate::raw::table::{ColumnType, Schema};
use bytes::{Buf, BufMut};
use std::sync::Arc;

/// Bytes of every record header.
pub const RECORD_HEADER_LEN: usize = 8;
/// Larger payloads mean the record boundary itself is corrupt.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Digitized waveform.
pub const TAG_EVENT: u8 = 0x01;
/// Synchronisation marker; ends a chunk.
pub const TAG_SYNC: u8 = 0x02;
/// Digitizer status word.
pub const TAG_STATUS: u8 = 0x03;

/// Set by the digitizer when the record failed its checksum.
pub const FLAG_CRC_ERROR: u8 = 0x80;

/// Event payload bytes before the samples.
pub const EVENT_FIXED_LEN: usize = 16;
/// Status payload bytes.
pub const STATUS_LEN: usize = 16;

/// Identity under which status records are routed.
pub const STATUS_STREAM: &str = "status";

/// The fixed part of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Record kind, one of the `TAG_*` constants.
    pub tag: u8,
    /// Flag bits such as [`FLAG_CRC_ERROR`].
    pub flags: u8,
    /// Channel of event records; zero otherwise.
    pub channel: u16,
    /// Bytes following the header.
    pub payload_len: u32,
}

impl RecordHeader {
    /// Reads a header from its little-endian bytes.
    pub fn parse(bytes: &[u8; RECORD_HEADER_LEN]) -> Self {
        let mut buf = &bytes[..];
        Self {
            tag: buf.get_u8(),
            flags: buf.get_u8(),
            channel: buf.get_u16_le(),
            payload_len: buf.get_u32_le(),
        }
    }

    /// Writes the header in file layout.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(self.tag);
        out.put_u8(self.flags);
        out.put_u16_le(self.channel);
        out.put_u32_le(self.payload_len);
    }
}

/// A digitized waveform with its trigger information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Digitizer channel.
    pub channel: u16,
    /// Trigger counter.
    pub event_no: u32,
    /// Trigger time, nanoseconds since run start.
    pub timestamp: u64,
    /// Baseline estimate in ADC counts.
    pub baseline: u16,
    /// Samples in ADC counts.
    pub waveform: Vec<u16>,
}

/// Periodic digitizer health word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    /// Time of the reading, nanoseconds since run start.
    pub timestamp: u64,
    /// Errors counted by the board since the last status word.
    pub error_count: u32,
    /// Board temperature in milli-degrees Celsius.
    pub temperature_mc: i32,
}

/// Fields of a decoded event; samples go to the caller's scratch vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFields {
    /// Digitizer channel.
    pub channel: u16,
    /// Trigger counter.
    pub event_no: u32,
    /// Trigger time, nanoseconds since run start.
    pub timestamp: u64,
    /// Baseline estimate in ADC counts.
    pub baseline: u16,
}

/// A record whose contents passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// Event; samples are in the scratch vector.
    Event(EventFields),
    /// Status word.
    Status(StatusRecord),
    /// Sync marker with its optional timestamp.
    Sync(Option<u64>),
}

/// Decodes one payload. `Err` carries the reason a well-delimited record is invalid.
pub fn decode(
    header: &RecordHeader,
    payload: &[u8],
    samples: &mut Vec<u16>,
) -> Result<Decoded, String> {
    if header.flags & FLAG_CRC_ERROR != 0 {
        return Err("digitizer flagged a checksum error".to_string());
    }
    match header.tag {
        TAG_EVENT => decode_event(header, payload, samples).map(Decoded::Event),
        TAG_SYNC => match payload.len() {
            0 => Ok(Decoded::Sync(None)),
            8 => {
                let mut buf = payload;
                Ok(Decoded::Sync(Some(buf.get_u64_le())))
            }
            n => Err(format!("sync record with {n} payload bytes")),
        },
        TAG_STATUS => {
            if payload.len() != STATUS_LEN {
                return Err(format!(
                    "status record with {} payload bytes, expected {STATUS_LEN}",
                    payload.len()
                ));
            }
            let mut buf = payload;
            Ok(Decoded::Status(StatusRecord {
                timestamp: buf.get_u64_le(),
                error_count: buf.get_u32_le(),
                temperature_mc: buf.get_i32_le(),
            }))
        }
        tag => Err(format!("unknown record tag 0x{tag:02x}")),
    }
}

fn decode_event(
    header: &RecordHeader,
    payload: &[u8],
    samples: &mut Vec<u16>,
) -> Result<EventFields, String> {
    if payload.len() < EVENT_FIXED_LEN {
        return Err(format!("event payload of {} bytes is too short", payload.len()));
    }
    let mut buf = payload;
    let event_no = buf.get_u32_le();
    let timestamp = buf.get_u64_le();
    let baseline = buf.get_u16_le();
    let n_samples = buf.get_u16_le() as usize;
    if buf.remaining() != 2 * n_samples {
        return Err(format!(
            "event declares {n_samples} samples but carries {} bytes",
            buf.remaining()
        ));
    }
    samples.clear();
    samples.extend((0..n_samples).map(|_| buf.get_u16_le()));
    Ok(EventFields {
        channel: header.channel,
        event_no,
        timestamp,
        baseline,
    })
}

/// Encodes `event` with `flags`, header included.
pub fn encode_event(event: &EventRecord, flags: u8, out: &mut impl BufMut) {
    let payload_len = EVENT_FIXED_LEN + 2 * event.waveform.len();
    RecordHeader {
        tag: TAG_EVENT,
        flags,
        channel: event.channel,
        payload_len: payload_len as u32,
    }
    .encode(out);
    out.put_u32_le(event.event_no);
    out.put_u64_le(event.timestamp);
    out.put_u16_le(event.baseline);
    out.put_u16_le(event.waveform.len() as u16);
    for sample in &event.waveform {
        out.put_u16_le(*sample);
    }
}

/// Encodes a status record, header included.
pub fn encode_status(status: &StatusRecord, out: &mut impl BufMut) {
    RecordHeader {
        tag: TAG_STATUS,
        flags: 0,
        channel: 0,
        payload_len: STATUS_LEN as u32,
    }
    .encode(out);
    out.put_u64_le(status.timestamp);
    out.put_u32_le(status.error_count);
    out.put_i32_le(status.temperature_mc);
}

/// Encodes a sync record. The payload is empty without a timestamp.
pub fn encode_sync(timestamp: Option<u64>, out: &mut impl BufMut) {
    RecordHeader {
        tag: TAG_SYNC,
        flags: 0,
        channel: 0,
        payload_len: if timestamp.is_some() { 8 } else { 0 },
    }
    .encode(out);
    if let Some(ts) = timestamp {
        out.put_u64_le(ts);
    }
}

/// Layout of the event tables, one per waveform length.
pub fn event_schema(waveform_len: usize) -> Arc<Schema> {
    Arc::new(
        Schema::default()
            .with("channel", ColumnType::U32)
            .with("event_no", ColumnType::U32)
            .with("timestamp", ColumnType::U64)
            .with("baseline", ColumnType::U16)
            .with("waveform", ColumnType::Waveform(waveform_len)),
    )
}

/// Layout of the `status` group.
pub fn status_schema() -> Arc<Schema> {
    Arc::new(
        Schema::default()
            .with("timestamp", ColumnType::U64)
            .with("error_count", ColumnType::U32)
            .with("temperature", ColumnType::F64),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(bytes: &[u8]) -> (RecordHeader, &[u8]) {
        let mut head = [0u8; RECORD_HEADER_LEN];
        head.copy_from_slice(&bytes[..RECORD_HEADER_LEN]);
        (RecordHeader::parse(&head), &bytes[RECORD_HEADER_LEN..])
    }

    #[test]
    fn decodes_event() {
        let event = EventRecord {
            channel: 5,
            event_no: 77,
            timestamp: 123_456,
            baseline: 1000,
            waveform: vec![1, 2, 3],
        };
        let mut bytes = Vec::new();
        encode_event(&event, 0, &mut bytes);
        let (header, payload) = split(&bytes);
        assert_eq!(header.payload_len as usize, payload.len());

        let mut samples = Vec::new();
        let decoded = decode(&header, payload, &mut samples).unwrap();
        assert_eq!(
            decoded,
            Decoded::Event(EventFields {
                channel: 5,
                event_no: 77,
                timestamp: 123_456,
                baseline: 1000
            })
        );
        assert_eq!(samples, vec![1, 2, 3]);
    }

    #[test]
    fn crc_flag_marks_record_malformed() {
        let event = EventRecord {
            channel: 1,
            event_no: 1,
            timestamp: 1,
            baseline: 0,
            waveform: vec![0; 4],
        };
        let mut bytes = Vec::new();
        encode_event(&event, FLAG_CRC_ERROR, &mut bytes);
        let (header, payload) = split(&bytes);
        let err = decode(&header, payload, &mut Vec::new()).unwrap_err();
        assert!(err.contains("checksum"));
    }

    #[test]
    fn inconsistent_sample_count_is_malformed() {
        let mut bytes = Vec::new();
        RecordHeader {
            tag: TAG_EVENT,
            flags: 0,
            channel: 0,
            payload_len: 18,
        }
        .encode(&mut bytes);
        bytes.put_u32_le(1);
        bytes.put_u64_le(2);
        bytes.put_u16_le(3);
        bytes.put_u16_le(4); // claims four samples
        bytes.put_u16_le(9); // carries one
        let (header, payload) = split(&bytes);
        let err = decode(&header, payload, &mut Vec::new()).unwrap_err();
        assert!(err.contains("declares 4 samples"));
    }

    #[test]
    fn decodes_status_and_sync() {
        let mut bytes = Vec::new();
        let status = StatusRecord {
            timestamp: 9,
            error_count: 2,
            temperature_mc: -1500,
        };
        encode_status(&status, &mut bytes);
        let (header, payload) = split(&bytes);
        assert_eq!(
            decode(&header, payload, &mut Vec::new()).unwrap(),
            Decoded::Status(status)
        );

        let mut bytes = Vec::new();
        encode_sync(Some(44), &mut bytes);
        let (header, payload) = split(&bytes);
        assert_eq!(
            decode(&header, payload, &mut Vec::new()).unwrap(),
            Decoded::Sync(Some(44))
        );
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let header = RecordHeader {
            tag: 0x7f,
            flags: 0,
            channel: 0,
            payload_len: 0,
        };
        assert!(decode(&header, &[], &mut Vec::new())
            .unwrap_err()
            .contains("0x7f"));
    }
}
