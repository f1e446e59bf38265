//! Arrow IPC store.
//!
//! An output store is a directory; each group is one Arrow IPC file `<group>.arrow`
//! holding one record batch per append. Waveforms are `FixedSizeList<UInt16>` columns.
//! Files stay open until [`RawSink::finish`], which writes the IPC footers.

use super::{ensure_store_dir, group_file_name, RawSink};
use crate::error::{RawError, RawResult};
use crate::raw::buffer::RawBuffer;
use crate::raw::table::{Column, ColumnType, Schema, Table};
use arrow::array::{
    ArrayRef, FixedSizeListArray, Float64Array, StringArray, UInt16Array, UInt32Array,
    UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, SchemaRef};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// File extension of a group file.
pub const EXTENSION: &str = "arrow";

struct GroupFile {
    path: PathBuf,
    schema: SchemaRef,
    writer: FileWriter<BufWriter<File>>,
    batches: usize,
}

/// [`RawSink`] writing Arrow IPC files.
#[derive(Default)]
pub struct ArrowStore {
    open: HashMap<(PathBuf, String), GroupFile>,
    finished: bool,
}

impl ArrowStore {
    /// Store with no open group files.
    pub fn new() -> Self {
        Self::default()
    }

    fn group_file(&mut self, buffer: &RawBuffer) -> RawResult<&mut GroupFile> {
        let slot = (buffer.out_stream().to_path_buf(), buffer.group().to_string());
        if !self.open.contains_key(&slot) {
            ensure_store_dir(buffer.out_stream())?;
            let path = buffer
                .out_stream()
                .join(group_file_name(buffer.group(), EXTENSION)?);
            let schema = arrow_schema(buffer.table().schema(), buffer.group());
            let file = File::create(&path)?;
            let writer = FileWriter::try_new(BufWriter::new(file), &schema)?;
            debug!(path = %path.display(), "opened arrow group file");
            self.open.insert(
                slot.clone(),
                GroupFile {
                    path,
                    schema,
                    writer,
                    batches: 0,
                },
            );
        }
        self.open
            .get_mut(&slot)
            .ok_or_else(|| RawError::Storage(format!("group '{}' not open", slot.1)))
    }
}

impl RawSink for ArrowStore {
    fn append(&mut self, buffer: &RawBuffer) -> RawResult<()> {
        if self.finished {
            return Err(RawError::Storage("arrow store already finished".into()));
        }
        let group = self.group_file(buffer)?;
        let batch = to_record_batch(buffer.table(), Arc::clone(&group.schema))?;
        group.writer.write(&batch)?;
        group.batches += 1;
        Ok(())
    }

    fn finish(&mut self) -> RawResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut first_error = None;
        for (_, mut group) in self.open.drain() {
            match group.writer.finish() {
                Ok(()) => info!(
                    path = %group.path.display(),
                    batches = group.batches,
                    "closed arrow group file"
                ),
                Err(e) => {
                    first_error.get_or_insert(RawError::from(e));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn data_type(dtype: ColumnType) -> DataType {
    match dtype {
        ColumnType::U16 => DataType::UInt16,
        ColumnType::U32 => DataType::UInt32,
        ColumnType::U64 => DataType::UInt64,
        ColumnType::F64 => DataType::Float64,
        ColumnType::Utf8 => DataType::Utf8,
        ColumnType::Waveform(n) => DataType::FixedSizeList(sample_field(), n as i32),
    }
}

fn sample_field() -> Arc<Field> {
    Arc::new(Field::new("item", DataType::UInt16, false))
}

/// Arrow schema for a table layout, tagged with the group name.
pub fn arrow_schema(schema: &Schema, group: &str) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| Field::new(&f.name, data_type(f.dtype), false))
        .collect();
    let metadata = HashMap::from([("group".to_string(), group.to_string())]);
    Arc::new(ArrowSchema::new_with_metadata(fields, metadata))
}

/// Converts the filled rows of `table` into one record batch.
pub fn to_record_batch(table: &Table, schema: SchemaRef) -> RawResult<RecordBatch> {
    let columns = table
        .columns()
        .iter()
        .map(|column| -> RawResult<ArrayRef> {
            Ok(match column {
                Column::U16(v) => Arc::new(UInt16Array::from(v.clone())),
                Column::U32(v) => Arc::new(UInt32Array::from(v.clone())),
                Column::U64(v) => Arc::new(UInt64Array::from(v.clone())),
                Column::F64(v) => Arc::new(Float64Array::from(v.clone())),
                Column::Utf8(v) => Arc::new(StringArray::from_iter_values(v.iter())),
                Column::Waveform { len, samples } => {
                    let values: ArrayRef = Arc::new(UInt16Array::from(samples.clone()));
                    Arc::new(FixedSizeListArray::try_new(
                        sample_field(),
                        *len as i32,
                        values,
                        None,
                    )?)
                }
            })
        })
        .collect::<RawResult<Vec<_>>>()?;
    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Reads every batch of one group file back.
pub fn read_group(out_stream: &Path, group: &str) -> RawResult<Vec<RecordBatch>> {
    let path = out_stream.join(group_file_name(group, EXTENSION)?);
    let file = File::open(&path)?;
    let reader = FileReader::try_new(BufReader::new(file), None)?;
    Ok(reader.collect::<Result<Vec<_>, _>>()?)
}
