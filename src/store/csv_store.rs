//! CSV store: one `<group>.csv` per group, header row of column names, waveform samples
//! joined by spaces.

use super::{ensure_store_dir, group_file_name, RawSink};
use crate::error::{RawError, RawResult};
use crate::raw::buffer::RawBuffer;
use crate::raw::table::{Column, Table};
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use tracing::{debug, info};

/// File extension of a group file.
pub const EXTENSION: &str = "csv";

/// [`RawSink`] writing CSV files.
#[derive(Default)]
pub struct CsvStore {
    open: HashMap<(PathBuf, String), csv::Writer<File>>,
    row: Vec<String>,
    finished: bool,
}

impl CsvStore {
    /// Store with no open group files.
    pub fn new() -> Self {
        Self::default()
    }
}

fn cell(column: &Column, row: usize) -> String {
    match column {
        Column::U16(v) => v[row].to_string(),
        Column::U32(v) => v[row].to_string(),
        Column::U64(v) => v[row].to_string(),
        Column::F64(v) => v[row].to_string(),
        Column::Utf8(v) => v[row].clone(),
        Column::Waveform { .. } => column
            .waveform(row)
            .unwrap_or_default()
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn write_rows(writer: &mut csv::Writer<File>, table: &Table, row: &mut Vec<String>) -> RawResult<()> {
    for i in 0..table.len() {
        row.clear();
        row.extend(table.columns().iter().map(|c| cell(c, i)));
        writer.write_record(row.iter())?;
    }
    Ok(())
}

impl RawSink for CsvStore {
    fn append(&mut self, buffer: &RawBuffer) -> RawResult<()> {
        if self.finished {
            return Err(RawError::Storage("csv store already finished".into()));
        }
        let slot = (buffer.out_stream().to_path_buf(), buffer.group().to_string());
        if !self.open.contains_key(&slot) {
            ensure_store_dir(buffer.out_stream())?;
            let path = buffer
                .out_stream()
                .join(group_file_name(buffer.group(), EXTENSION)?);
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record(
                buffer
                    .table()
                    .schema()
                    .fields()
                    .iter()
                    .map(|f| f.name.as_str()),
            )?;
            debug!(path = %path.display(), "opened csv group file");
            self.open.insert(slot.clone(), writer);
        }
        let writer = self
            .open
            .get_mut(&slot)
            .ok_or_else(|| RawError::Storage(format!("group '{}' not open", slot.1)))?;
        write_rows(writer, buffer.table(), &mut self.row)
    }

    fn finish(&mut self) -> RawResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let groups = self.open.len();
        for (_, mut writer) in self.open.drain() {
            writer.flush()?;
        }
        info!(groups, "csv store shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::table::{ColumnType, Schema, Value};
    use std::sync::Arc;

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run.raw");
        let schema = Arc::new(
            Schema::default()
                .with("event_no", ColumnType::U32)
                .with("temperature", ColumnType::F64)
                .with("waveform", ColumnType::Waveform(2)),
        );
        let mut buffer = RawBuffer::new(&out, "ch1", Table::new(schema, 8));
        buffer
            .table_mut()
            .append_row(&[Value::U32(5), Value::F64(41.5), Value::Samples(&[10, 11])])
            .unwrap();

        let mut store = CsvStore::new();
        store.append(&buffer).unwrap();
        store.clear(&mut buffer);
        buffer
            .table_mut()
            .append_row(&[Value::U32(6), Value::F64(40.0), Value::Samples(&[12, 13])])
            .unwrap();
        store.append(&buffer).unwrap();
        store.finish().unwrap();

        let text = std::fs::read_to_string(out.join("ch1.csv")).unwrap();
        assert_eq!(
            text,
            "event_no,temperature,waveform\n5,41.5,10 11\n6,40,12 13\n"
        );
    }
}
