//! Builds into on-disk stores and checks what lands on disk.

mod common;

use common::{ev, write_rdq, Rec};
use daq_raw::raw::build::{build_raw, default_output, BuildOptions, BuildPhase, OutSpec};
use daq_raw::raw::routing::RoutingSpec;
use daq_raw::RawError;
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tracing_test::traced_test;

fn store(name: &str) -> BuildOptions {
    BuildOptions {
        buffer_size: 2,
        store: name.into(),
        ..BuildOptions::default()
    }
}

fn read_tree(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let path = e.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            (name, fs::read(&path).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[test]
#[cfg(feature = "storage_arrow")]
fn arrow_store_holds_every_row() {
    use arrow::array::{Array, FixedSizeListArray, UInt32Array};
    use daq_raw::store::arrow_store::read_group;

    let dir = TempDir::new().unwrap();
    let records: Vec<Rec> = (1..=5).map(|n| ev(2, n)).collect();
    let input = write_rdq(&dir.path().join("run.rdq"), &[2], &records);

    let summary = build_raw(&input, &store("arrow")).unwrap();
    let out = default_output(&input);
    assert!(out.join("ch2.arrow").is_file());
    assert!(out.join("header.arrow").is_file());
    assert_eq!(summary.outputs.len(), 1);
    assert!(summary.output_bytes() > 0);

    let batches = read_group(&out, "ch2").unwrap();
    assert_eq!(
        batches.iter().map(|b| b.num_rows()).collect::<Vec<_>>(),
        vec![2, 2, 1]
    );
    let event_no: Vec<u32> = batches
        .iter()
        .flat_map(|b| {
            let col = b
                .column_by_name("event_no")
                .unwrap()
                .as_any()
                .downcast_ref::<UInt32Array>()
                .unwrap();
            col.values().to_vec()
        })
        .collect();
    assert_eq!(event_no, vec![1, 2, 3, 4, 5]);

    let waveform = batches[0]
        .column_by_name("waveform")
        .unwrap()
        .as_any()
        .downcast_ref::<FixedSizeListArray>()
        .unwrap();
    assert_eq!(waveform.value_length(), common::SAMPLES as i32);
    assert_eq!(waveform.len(), 2);

    let header = read_group(&out, "header").unwrap();
    assert_eq!(header[0].num_rows(), 1);
}

#[test]
#[cfg(feature = "storage_arrow")]
fn rerun_reproduces_identical_files() {
    let dir = TempDir::new().unwrap();
    let records = [ev(0, 1), ev(1, 2), Rec::Status { timestamp: 3 }, ev(0, 4), Rec::Sync, ev(1, 5)];
    let input = write_rdq(&dir.path().join("run.rdq"), &[0, 1], &records);
    let out = default_output(&input);

    build_raw(&input, &store("arrow")).unwrap();
    let first = read_tree(&out);

    let summary = build_raw(&input, &store("arrow")).unwrap();
    assert_eq!(summary.removed_outputs, vec![out.clone()]);
    assert_eq!(read_tree(&out), first);
}

#[test]
#[cfg(feature = "storage_csv")]
fn csv_store_writes_one_file_per_group() {
    let dir = TempDir::new().unwrap();
    let records = [ev(0, 1), Rec::Status { timestamp: 77 }, ev(0, 2)];
    let input = write_rdq(&dir.path().join("run.rdq"), &[0], &records);

    build_raw(&input, &store("csv")).unwrap();
    let out = default_output(&input);
    let ch0 = fs::read_to_string(out.join("ch0.csv")).unwrap();
    let mut lines = ch0.lines();
    assert_eq!(
        lines.next(),
        Some("channel,event_no,timestamp,baseline,waveform")
    );
    assert_eq!(lines.next(), Some("0,1,1000,1000,1 2 3 4"));
    assert_eq!(lines.next(), Some("0,2,2000,1000,2 3 4 5"));
    assert_eq!(lines.next(), None);

    let status = fs::read_to_string(out.join("status.csv")).unwrap();
    assert!(status.starts_with("timestamp,error_count,temperature\n77,0,40"));
}

#[test]
#[cfg(feature = "storage_csv")]
fn refuses_to_touch_any_output_when_one_exists() {
    let dir = TempDir::new().unwrap();
    let input = write_rdq(&dir.path().join("run.rdq"), &[0, 1], &[ev(0, 1), ev(1, 2)]);
    let a = dir.path().join("a.raw");
    let b = dir.path().join("b.raw");
    fs::create_dir(&a).unwrap();
    fs::write(a.join("keep.txt"), "old").unwrap();

    let routing = RoutingSpec::from_json_value(&json!({
        "0": {"destination": a},
        "1": {"destination": b}
    }))
    .unwrap();
    let options = BuildOptions {
        out_spec: OutSpec::Routing(routing),
        overwrite: false,
        ..store("csv")
    };
    let err = build_raw(&input, &options).unwrap_err();
    assert_eq!(err.phase, BuildPhase::OutputPrepare);
    assert!(matches!(err.source, RawError::OutputExists(ref p) if *p == a));
    assert!(err.is_preflight());
    assert_eq!(fs::read_to_string(a.join("keep.txt")).unwrap(), "old");
    assert!(!b.exists());
    assert!(!default_output(&input).exists());

    let options = BuildOptions {
        overwrite: true,
        ..options
    };
    let summary = build_raw(&input, &options).unwrap();
    assert_eq!(summary.removed_outputs, vec![a.clone()]);
    assert!(!a.join("keep.txt").exists());
    assert!(a.join("ch0.csv").is_file());
    assert!(b.join("ch1.csv").is_file());
}

#[test]
#[cfg(feature = "storage_csv")]
fn truncated_input_leaves_readable_partial_output() {
    let dir = TempDir::new().unwrap();
    let records: Vec<Rec> = (1..=3).map(|n| ev(0, n)).collect();
    let input = write_rdq(&dir.path().join("run.rdq"), &[0], &records);
    let len = fs::metadata(&input).unwrap().len();
    fs::OpenOptions::new()
        .write(true)
        .open(&input)
        .unwrap()
        .set_len(len - 1)
        .unwrap();

    let err = build_raw(&input, &store("csv")).unwrap_err();
    assert_eq!(err.phase, BuildPhase::Decoding);
    assert!(err.to_string().contains("decoding"));
    let ch0 = fs::read_to_string(default_output(&input).join("ch0.csv")).unwrap();
    assert_eq!(ch0.lines().count(), 3);
}

#[test]
#[traced_test]
fn malformed_records_are_logged() {
    let dir = TempDir::new().unwrap();
    let records = [ev(0, 1), Rec::Corrupt { channel: 0, event_no: 2 }, ev(0, 3)];
    let input = write_rdq(&dir.path().join("run.rdq"), &[0], &records);

    let summary = build_raw(&input, &store("memory")).unwrap();
    assert_eq!(summary.records_skipped, 1);
    assert!(logs_contain("skipping malformed record"));
    assert!(logs_contain("checksum"));
}

#[test]
fn unknown_store_is_rejected_before_reading() {
    let dir = TempDir::new().unwrap();
    let input = write_rdq(&dir.path().join("run.rdq"), &[0], &[ev(0, 1)]);
    let err = build_raw(&input, &store("hdf5")).unwrap_err();
    assert_eq!(err.phase, BuildPhase::Init);
    assert!(matches!(err.source, RawError::Configuration(_)));
    assert!(!default_output(&input).exists());
}
