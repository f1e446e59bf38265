//! Fixed-capacity columnar tables.
//!
//! A [`Table`] is the storage behind every raw buffer: one typed vector per column,
//! allocated up front for `capacity` rows and reused across flushes. Rows are appended
//! through [`Table::append_row`], which validates the whole row before it touches any
//! column, so a rejected row never leaves the columns with different lengths.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Element type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ColumnType {
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// 64-bit float.
    F64,
    /// UTF-8 string.
    Utf8,
    /// Fixed number of `u16` samples per row.
    Waveform(usize),
}

impl ColumnType {
    /// Bytes one row of this type reserves in a column.
    pub fn reserved_bytes(self) -> u64 {
        match self {
            ColumnType::U16 => 2,
            ColumnType::U32 => 4,
            ColumnType::U64 | ColumnType::F64 => 8,
            ColumnType::Utf8 => std::mem::size_of::<String>() as u64,
            ColumnType::Waveform(n) => 2 * n as u64,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::U16 => f.write_str("u16"),
            ColumnType::U32 => f.write_str("u32"),
            ColumnType::U64 => f.write_str("u64"),
            ColumnType::F64 => f.write_str("f64"),
            ColumnType::Utf8 => f.write_str("utf8"),
            ColumnType::Waveform(n) => write!(f, "waveform[{n}]"),
        }
    }
}

/// A named column in a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    /// Column name, unique within the schema.
    pub name: String,
    /// Element type.
    pub dtype: ColumnType,
}

/// Ordered list of fields. Immutable once a table is built on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Schema from `fields` in order.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Builder-style helper used by decoders to declare their layout.
    pub fn with(mut self, name: &str, dtype: ColumnType) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            dtype,
        });
        self
    }

    /// Fields in column order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Column position of `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Bytes reserved per row when a table is allocated on this schema.
    pub fn row_bytes(&self) -> u64 {
        self.fields.iter().map(|f| f.dtype.reserved_bytes()).sum()
    }
}

/// One cell of a row being appended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    /// Cell of a `U16` column.
    U16(u16),
    /// Cell of a `U32` column.
    U32(u32),
    /// Cell of a `U64` column.
    U64(u64),
    /// Cell of an `F64` column.
    F64(f64),
    /// Cell of a `Utf8` column.
    Utf8(&'a str),
    /// Samples of a `Waveform` column.
    Samples(&'a [u16]),
}

/// Why a row was rejected. The table is unchanged in every case.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppendError {
    /// Every row slot is taken.
    #[error("table is full ({capacity} rows)")]
    Full {
        /// Row capacity of the table.
        capacity: usize,
    },

    /// Wrong number of values.
    #[error("row has {got} values, schema has {expected} columns")]
    Arity {
        /// Columns in the schema.
        expected: usize,
        /// Values supplied.
        got: usize,
    },

    /// A value does not match its column type.
    #[error("column '{column}' expects {expected}")]
    Type {
        /// Offending column.
        column: String,
        /// Type the column stores.
        expected: ColumnType,
    },

    /// A waveform has the wrong number of samples.
    #[error("column '{column}' expects {expected} samples, got {got}")]
    WaveformLength {
        /// Offending column.
        column: String,
        /// Declared waveform length.
        expected: usize,
        /// Samples supplied.
        got: usize,
    },
}

/// Typed storage for one column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// `u16` values.
    U16(Vec<u16>),
    /// `u32` values.
    U32(Vec<u32>),
    /// `u64` values.
    U64(Vec<u64>),
    /// `f64` values.
    F64(Vec<f64>),
    /// Strings.
    Utf8(Vec<String>),
    /// Row-major samples, `len` per row.
    Waveform { len: usize, samples: Vec<u16> },
}

impl Column {
    fn with_capacity(dtype: ColumnType, rows: usize) -> Self {
        match dtype {
            ColumnType::U16 => Column::U16(Vec::with_capacity(rows)),
            ColumnType::U32 => Column::U32(Vec::with_capacity(rows)),
            ColumnType::U64 => Column::U64(Vec::with_capacity(rows)),
            ColumnType::F64 => Column::F64(Vec::with_capacity(rows)),
            ColumnType::Utf8 => Column::Utf8(Vec::with_capacity(rows)),
            ColumnType::Waveform(len) => Column::Waveform {
                len,
                samples: Vec::with_capacity(rows.saturating_mul(len)),
            },
        }
    }

    /// Caller has already checked the value against the schema.
    fn push(&mut self, value: &Value<'_>) {
        match (self, value) {
            (Column::U16(v), Value::U16(x)) => v.push(*x),
            (Column::U32(v), Value::U32(x)) => v.push(*x),
            (Column::U64(v), Value::U64(x)) => v.push(*x),
            (Column::F64(v), Value::F64(x)) => v.push(*x),
            (Column::Utf8(v), Value::Utf8(x)) => v.push((*x).to_string()),
            (Column::Waveform { samples, .. }, Value::Samples(x)) => {
                samples.extend_from_slice(x)
            }
            _ => {}
        }
    }

    fn truncate(&mut self, rows: usize) {
        match self {
            Column::U16(v) => v.truncate(rows),
            Column::U32(v) => v.truncate(rows),
            Column::U64(v) => v.truncate(rows),
            Column::F64(v) => v.truncate(rows),
            Column::Utf8(v) => v.truncate(rows),
            Column::Waveform { len, samples } => samples.truncate(rows * *len),
        }
    }

    /// Number of rows held.
    pub fn rows(&self) -> usize {
        match self {
            Column::U16(v) => v.len(),
            Column::U32(v) => v.len(),
            Column::U64(v) => v.len(),
            Column::F64(v) => v.len(),
            Column::Utf8(v) => v.len(),
            Column::Waveform { len, samples } => {
                if *len == 0 {
                    0
                } else {
                    samples.len() / len
                }
            }
        }
    }

    /// Values of a `U16` column.
    pub fn as_u16(&self) -> Option<&[u16]> {
        match self {
            Column::U16(v) => Some(v),
            _ => None,
        }
    }

    /// Values of a `U32` column.
    pub fn as_u32(&self) -> Option<&[u32]> {
        match self {
            Column::U32(v) => Some(v),
            _ => None,
        }
    }

    /// Values of a `U64` column.
    pub fn as_u64(&self) -> Option<&[u64]> {
        match self {
            Column::U64(v) => Some(v),
            _ => None,
        }
    }

    /// Values of an `F64` column.
    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            Column::F64(v) => Some(v),
            _ => None,
        }
    }

    /// Values of a `Utf8` column.
    pub fn as_utf8(&self) -> Option<&[String]> {
        match self {
            Column::Utf8(v) => Some(v),
            _ => None,
        }
    }

    /// Samples of one waveform row.
    pub fn waveform(&self, row: usize) -> Option<&[u16]> {
        match self {
            Column::Waveform { len, samples } => samples.get(row * len..(row + 1) * len),
            _ => None,
        }
    }
}

fn check(field: &Field, value: &Value<'_>) -> Result<(), AppendError> {
    let ok = match (field.dtype, value) {
        (ColumnType::U16, Value::U16(_))
        | (ColumnType::U32, Value::U32(_))
        | (ColumnType::U64, Value::U64(_))
        | (ColumnType::F64, Value::F64(_))
        | (ColumnType::Utf8, Value::Utf8(_)) => true,
        (ColumnType::Waveform(expected), Value::Samples(s)) => {
            if s.len() != expected {
                return Err(AppendError::WaveformLength {
                    column: field.name.clone(),
                    expected,
                    got: s.len(),
                });
            }
            true
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(AppendError::Type {
            column: field.name.clone(),
            expected: field.dtype,
        })
    }
}

/// Columnar buffer with a fixed row capacity and a fill cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    schema: Arc<Schema>,
    columns: Vec<Column>,
    capacity: usize,
    len: usize,
}

impl Table {
    /// Allocates every column for `capacity` rows.
    pub fn new(schema: Arc<Schema>, capacity: usize) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|f| Column::with_capacity(f.dtype, capacity))
            .collect();
        Self {
            schema,
            columns,
            capacity,
            len: 0,
        }
    }

    /// Layout of the table.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Maximum rows.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill cursor: rows currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no row is held.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the fill cursor reached the capacity.
    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Rows that still fit.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.len)
    }

    /// Columns in schema order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column called `name`.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.schema.index_of(name).map(|i| &self.columns[i])
    }

    /// Appends one row, or rejects it without modifying the table.
    pub fn append_row(&mut self, row: &[Value<'_>]) -> Result<(), AppendError> {
        if self.is_full() {
            return Err(AppendError::Full {
                capacity: self.capacity,
            });
        }
        if row.len() != self.schema.len() {
            return Err(AppendError::Arity {
                expected: self.schema.len(),
                got: row.len(),
            });
        }
        for (field, value) in self.schema.fields().iter().zip(row) {
            check(field, value)?;
        }
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.push(value);
        }
        self.len += 1;
        Ok(())
    }

    /// Lowers the fill cursor to at most `rows`.
    pub fn truncate(&mut self, rows: usize) {
        if rows >= self.len {
            return;
        }
        for column in &mut self.columns {
            column.truncate(rows);
        }
        self.len = rows;
    }

    /// Resets the fill cursor. Column allocations are kept.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Copy of the filled rows only.
    pub fn snapshot(&self) -> Table {
        Table {
            schema: Arc::clone(&self.schema),
            columns: self.columns.clone(),
            capacity: self.len,
            len: self.len,
        }
    }
}
