//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use daq_raw::raw::rdq::record::FLAG_CRC_ERROR;
use daq_raw::raw::rdq::{EventRecord, RdqHeader, RdqWriter, StatusRecord};
use daq_raw::raw::table::Table;
use daq_raw::store::MemorySink;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// One record of a synthetic input.
#[derive(Debug, Clone)]
pub enum Rec {
    Event { channel: u16, event_no: u32 },
    /// Event whose digitizer flagged a checksum error.
    Corrupt { channel: u16, event_no: u32 },
    Status { timestamp: u64 },
    Sync,
}

pub const SAMPLES: u16 = 4;

pub fn ev(channel: u16, event_no: u32) -> Rec {
    Rec::Event { channel, event_no }
}

fn event(channel: u16, event_no: u32) -> EventRecord {
    EventRecord {
        channel,
        event_no,
        timestamp: u64::from(event_no) * 1_000,
        baseline: 1000,
        waveform: (0..SAMPLES).map(|i| i + event_no as u16).collect(),
    }
}

/// Writes an RDQ file declaring `channels`, each with [`SAMPLES`] samples.
pub fn write_rdq(path: &Path, channels: &[u16], records: &[Rec]) -> PathBuf {
    let header = channels
        .iter()
        .fold(RdqHeader::new(7, 1_700_000_000_000_000_000, 16), |h, &ch| {
            h.with_channel(ch, SAMPLES)
        });
    let file = BufWriter::new(File::create(path).unwrap());
    let mut w = RdqWriter::new(file, &header).unwrap();
    for rec in records {
        match rec {
            Rec::Event { channel, event_no } => w.write_event(&event(*channel, *event_no)).unwrap(),
            Rec::Corrupt { channel, event_no } => w
                .write_flagged_event(&event(*channel, *event_no), FLAG_CRC_ERROR)
                .unwrap(),
            Rec::Status { timestamp } => w
                .write_status(&StatusRecord {
                    timestamp: *timestamp,
                    error_count: 0,
                    temperature_mc: 40_000,
                })
                .unwrap(),
            Rec::Sync => w.write_sync(None).unwrap(),
        }
    }
    w.into_inner().unwrap();
    path.to_path_buf()
}

/// `event_no` of every row written to one group, across batches.
pub fn event_numbers(sink: &MemorySink, out: &Path, group: &str) -> Vec<u32> {
    sink.batches(out, group)
        .iter()
        .flat_map(|t| t.column("event_no").and_then(|c| c.as_u32()).unwrap().to_vec())
        .collect()
}

/// Row count of every data batch written to one group.
pub fn batch_sizes(sink: &MemorySink, out: &Path, group: &str) -> Vec<usize> {
    sink.batches(out, group).iter().map(Table::len).collect()
}

/// Rows across every non-header group.
pub fn data_rows(sink: &MemorySink) -> usize {
    sink.groups()
        .iter()
        .filter(|(_, group)| group != "header")
        .map(|(out, group)| sink.rows(out, group))
        .sum()
}
