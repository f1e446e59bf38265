//! RDQ file header.
//!
//! Layout (little-endian):
//!
//! ```text
//! 0   magic "RDAQ"         4
//! 4   version              2
//! 6   channel count n      2
//! 8   header length        4   (= 32 + 8n)
//! 12  run number           4
//! 16  run start, ns        8
//! 24  sample period, ns    4
//! 28  reserved             4
//! 32  channel descriptors  8n
//! ```
//!
//! Channel descriptor: channel `u16`, waveform length `u16`, ADC bits `u8`, flags `u8`,
//! reserved `u16`.

use super::read_up_to;
use crate::error::{RawError, RawResult};
use crate::raw::table::{ColumnType, Schema, Table, Value};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;

/// File signature.
pub const MAGIC: [u8; 4] = *b"RDAQ";
/// Only supported header version.
pub const VERSION: u16 = 1;
/// Bytes before the channel descriptors.
pub const FIXED_HEADER_LEN: usize = 32;
/// Bytes per channel descriptor.
pub const CHANNEL_DESCRIPTOR_LEN: usize = 8;

/// Static configuration of one digitizer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Hardware channel number; the stream identity of its events.
    pub channel: u16,
    /// Samples per waveform.
    pub waveform_len: u16,
    /// ADC resolution.
    pub adc_bits: u8,
    /// Digitizer-specific flags, passed through.
    pub flags: u8,
}

/// Parsed RDQ header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdqHeader {
    /// Header layout version.
    pub version: u16,
    /// Run number assigned by the DAQ.
    pub run_number: u32,
    /// Run start, nanoseconds since the Unix epoch.
    pub start_time_ns: u64,
    /// Time between samples, nanoseconds.
    pub sample_period_ns: u32,
    /// Channel descriptors in file order.
    pub channels: Vec<ChannelInfo>,
}

impl RdqHeader {
    /// Header without channels.
    pub fn new(run_number: u32, start_time_ns: u64, sample_period_ns: u32) -> Self {
        Self {
            version: VERSION,
            run_number,
            start_time_ns,
            sample_period_ns,
            channels: Vec::new(),
        }
    }

    /// Adds a 14-bit channel with `waveform_len` samples per event.
    pub fn with_channel(mut self, channel: u16, waveform_len: u16) -> Self {
        self.channels.push(ChannelInfo {
            channel,
            waveform_len,
            adc_bits: 14,
            flags: 0,
        });
        self
    }

    /// Descriptor of `channel`, if declared.
    pub fn channel(&self, channel: u16) -> Option<&ChannelInfo> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    /// Bytes the encoded header occupies.
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + CHANNEL_DESCRIPTOR_LEN * self.channels.len()
    }

    /// Writes the header in file layout.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_slice(&MAGIC);
        out.put_u16_le(self.version);
        out.put_u16_le(self.channels.len() as u16);
        out.put_u32_le(self.encoded_len() as u32);
        out.put_u32_le(self.run_number);
        out.put_u64_le(self.start_time_ns);
        out.put_u32_le(self.sample_period_ns);
        out.put_u32_le(0);
        for ch in &self.channels {
            out.put_u16_le(ch.channel);
            out.put_u16_le(ch.waveform_len);
            out.put_u8(ch.adc_bits);
            out.put_u8(ch.flags);
            out.put_u16_le(0);
        }
    }

    /// Reads a complete header from the start of `reader`.
    pub fn read_from(reader: &mut impl Read) -> RawResult<Self> {
        let mut fixed = [0u8; FIXED_HEADER_LEN];
        let got = read_up_to(reader, &mut fixed)?;
        if got >= MAGIC.len() && fixed[..MAGIC.len()] != MAGIC {
            return Err(RawError::Format(format!(
                "bad signature {:02x?}, expected \"RDAQ\"",
                &fixed[..MAGIC.len()]
            )));
        }
        if got < FIXED_HEADER_LEN {
            return Err(RawError::TruncatedInput {
                offset: 0,
                needed: FIXED_HEADER_LEN as u64,
                available: got as u64,
            });
        }

        let mut buf = &fixed[MAGIC.len()..];
        let version = buf.get_u16_le();
        let n_channels = buf.get_u16_le() as usize;
        let header_len = buf.get_u32_le() as usize;
        let run_number = buf.get_u32_le();
        let start_time_ns = buf.get_u64_le();
        let sample_period_ns = buf.get_u32_le();

        if version != VERSION {
            return Err(RawError::Format(format!(
                "unsupported RDQ version {version} (expected {VERSION})"
            )));
        }
        let expected_len = FIXED_HEADER_LEN + CHANNEL_DESCRIPTOR_LEN * n_channels;
        if header_len != expected_len {
            return Err(RawError::Format(format!(
                "header length {header_len} does not match {n_channels} channels ({expected_len})"
            )));
        }

        let mut descriptors = vec![0u8; header_len - FIXED_HEADER_LEN];
        let got = read_up_to(reader, &mut descriptors)?;
        if got < descriptors.len() {
            return Err(RawError::TruncatedInput {
                offset: 0,
                needed: header_len as u64,
                available: (FIXED_HEADER_LEN + got) as u64,
            });
        }

        let mut buf = &descriptors[..];
        let mut channels = Vec::with_capacity(n_channels);
        let mut seen = HashSet::with_capacity(n_channels);
        for _ in 0..n_channels {
            let info = ChannelInfo {
                channel: buf.get_u16_le(),
                waveform_len: buf.get_u16_le(),
                adc_bits: buf.get_u8(),
                flags: buf.get_u8(),
            };
            buf.advance(2);
            if !seen.insert(info.channel) {
                return Err(RawError::Format(format!(
                    "channel {} declared twice in header",
                    info.channel
                )));
            }
            channels.push(info);
        }

        Ok(Self {
            version,
            run_number,
            start_time_ns,
            sample_period_ns,
            channels,
        })
    }

    /// Layout of the header group.
    pub fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::default()
                .with("version", ColumnType::U16)
                .with("run_number", ColumnType::U32)
                .with("start_time_ns", ColumnType::U64)
                .with("sample_period_ns", ColumnType::U32)
                .with("n_channels", ColumnType::U16)
                .with("channels", ColumnType::Utf8),
        )
    }

    /// One-row table persisted as the `header` group of every output.
    pub fn to_table(&self) -> RawResult<Table> {
        let channels = serde_json::to_string(&self.channels)?;
        let mut table = Table::new(Self::schema(), 1);
        table
            .append_row(&[
                Value::U16(self.version),
                Value::U32(self.run_number),
                Value::U64(self.start_time_ns),
                Value::U32(self.sample_period_ns),
                Value::U16(self.channels.len() as u16),
                Value::Utf8(&channels),
            ])
            .map_err(|e| RawError::Format(e.to_string()))?;
        Ok(table)
    }
}
