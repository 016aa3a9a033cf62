use crate::core::{ColumnMeta, DataType, ProxyError, Result, Row, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One bit per row, set when the row's value is NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawNullBitmap")]
pub struct NullBitmap {
    words: Vec<u64>,
    len: usize,
}

#[derive(Deserialize)]
struct RawNullBitmap {
    words: Vec<u64>,
    len: usize,
}

impl TryFrom<RawNullBitmap> for NullBitmap {
    type Error = ProxyError;

    fn try_from(raw: RawNullBitmap) -> Result<Self> {
        if raw.words.len() != raw.len.div_ceil(64) {
            return Err(ProxyError::Codec(format!(
                "null bitmap of {} rows carries {} words",
                raw.len,
                raw.words.len()
            )));
        }
        Ok(Self {
            words: raw.words,
            len: raw.len,
        })
    }
}

impl NullBitmap {
    pub fn with_capacity(rows: usize) -> Self {
        Self {
            words: Vec::with_capacity(rows.div_ceil(64)),
            len: 0,
        }
    }

    pub fn push(&mut self, is_null: bool) {
        let bit = self.len % 64;
        if bit == 0 {
            self.words.push(0);
        }
        if is_null {
            if let Some(word) = self.words.last_mut() {
                *word |= 1u64 << bit;
            }
        }
        self.len += 1;
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn null_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn extend(&mut self, other: &NullBitmap) {
        for i in 0..other.len {
            self.push(other.get(i));
        }
    }
}

/// Flattened values of one column. NULL slots hold a placeholder in typed
/// arrays so every array stays parallel to the null bitmap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Integer(Vec<i64>),
    Float(Vec<f64>),
    Text(Vec<String>),
    Boolean(Vec<bool>),
    Bytes(Vec<Vec<u8>>),
    Timestamp(Vec<DateTime<Utc>>),
    /// Fallback when the driver returns values that do not match the
    /// declared column type.
    Mixed(Vec<Value>),
}

impl ColumnData {
    fn for_type(data_type: DataType, capacity: usize) -> Self {
        match data_type {
            DataType::Integer => Self::Integer(Vec::with_capacity(capacity)),
            DataType::Float => Self::Float(Vec::with_capacity(capacity)),
            DataType::Text => Self::Text(Vec::with_capacity(capacity)),
            DataType::Boolean => Self::Boolean(Vec::with_capacity(capacity)),
            DataType::Bytes => Self::Bytes(Vec::with_capacity(capacity)),
            DataType::Timestamp => Self::Timestamp(Vec::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Integer(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
            Self::Boolean(v) => v.len(),
            Self::Bytes(v) => v.len(),
            Self::Timestamp(v) => v.len(),
            Self::Mixed(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a value; returns it back when it does not fit this array.
    fn push(&mut self, value: Value) -> std::result::Result<(), Value> {
        match (self, value) {
            (Self::Mixed(v), value) => v.push(value),
            (Self::Integer(v), Value::Null) => v.push(0),
            (Self::Float(v), Value::Null) => v.push(0.0),
            (Self::Text(v), Value::Null) => v.push(String::new()),
            (Self::Boolean(v), Value::Null) => v.push(false),
            (Self::Bytes(v), Value::Null) => v.push(Vec::new()),
            (Self::Timestamp(v), Value::Null) => v.push(DateTime::<Utc>::default()),
            (Self::Integer(v), Value::Integer(i)) => v.push(i),
            (Self::Float(v), Value::Float(f)) => v.push(f),
            (Self::Text(v), Value::Text(s)) => v.push(s),
            (Self::Boolean(v), Value::Boolean(b)) => v.push(b),
            (Self::Bytes(v), Value::Bytes(b)) => v.push(b),
            (Self::Timestamp(v), Value::Timestamp(ts)) => v.push(ts),
            (_, other) => return Err(other),
        }
        Ok(())
    }

    fn get(&self, index: usize, is_null: bool) -> Value {
        if is_null {
            return Value::Null;
        }
        match self {
            Self::Integer(v) => Value::Integer(v[index]),
            Self::Float(v) => Value::Float(v[index]),
            Self::Text(v) => Value::Text(v[index].clone()),
            Self::Boolean(v) => Value::Boolean(v[index]),
            Self::Bytes(v) => Value::Bytes(v[index].clone()),
            Self::Timestamp(v) => Value::Timestamp(v[index]),
            Self::Mixed(v) => v[index].clone(),
        }
    }

    fn to_mixed(&self, nulls: &NullBitmap) -> Vec<Value> {
        (0..self.len()).map(|i| self.get(i, nulls.get(i))).collect()
    }

    fn same_variant(&self, other: &ColumnData) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    fn extend(&mut self, other: ColumnData) {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.extend(b),
            (Self::Float(a), Self::Float(b)) => a.extend(b),
            (Self::Text(a), Self::Text(b)) => a.extend(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.extend(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.extend(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.extend(b),
            (Self::Mixed(a), Self::Mixed(b)) => a.extend(b),
            _ => unreachable!("extend is only called on matching variants"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketColumn {
    pub data: ColumnData,
    pub nulls: NullBitmap,
}

impl PacketColumn {
    fn push(&mut self, value: Value) {
        let is_null = value.is_null();
        if let Err(value) = self.data.push(value) {
            self.data = ColumnData::Mixed(self.data.to_mixed(&self.nulls));
            // Mixed accepts anything.
            let _ = self.data.push(value);
        }
        self.nulls.push(is_null);
    }

    fn append(&mut self, other: PacketColumn) {
        if self.data.same_variant(&other.data) {
            self.data.extend(other.data);
        } else {
            let mut merged = self.data.to_mixed(&self.nulls);
            merged.extend(other.data.to_mixed(&other.nulls));
            self.data = ColumnData::Mixed(merged);
        }
        self.nulls.extend(&other.nulls);
    }
}

/// A columnar batch of up to `K` consecutive rows of a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRowPacket")]
pub struct RowPacket {
    columns: Vec<PacketColumn>,
    row_count: usize,
    last_part: bool,
}

#[derive(Deserialize)]
struct RawRowPacket {
    columns: Vec<PacketColumn>,
    row_count: usize,
    last_part: bool,
}

/// Decoded packets are checked once so that row access never indexes past
/// a column array.
impl TryFrom<RawRowPacket> for RowPacket {
    type Error = ProxyError;

    fn try_from(raw: RawRowPacket) -> Result<Self> {
        for (index, column) in raw.columns.iter().enumerate() {
            if column.data.len() != raw.row_count || column.nulls.len() != raw.row_count {
                return Err(ProxyError::Codec(format!(
                    "column {} holds {} values and {} null flags for {} rows",
                    index + 1,
                    column.data.len(),
                    column.nulls.len(),
                    raw.row_count
                )));
            }
        }
        Ok(Self {
            columns: raw.columns,
            row_count: raw.row_count,
            last_part: raw.last_part,
        })
    }
}

impl RowPacket {
    pub fn empty(columns: &[ColumnMeta], last_part: bool) -> Self {
        Self::with_capacity(columns, 0, last_part)
    }

    fn with_capacity(columns: &[ColumnMeta], capacity: usize, last_part: bool) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|c| PacketColumn {
                    data: ColumnData::for_type(c.data_type, capacity),
                    nulls: NullBitmap::with_capacity(capacity),
                })
                .collect(),
            row_count: 0,
            last_part,
        }
    }

    pub fn from_rows(columns: &[ColumnMeta], rows: Vec<Row>, last_part: bool) -> Result<Self> {
        let mut packet = Self::with_capacity(columns, rows.len(), last_part);
        for row in rows {
            packet.push_row(row)?;
        }
        Ok(packet)
    }

    pub fn push_row(&mut self, row: Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(ProxyError::Cursor(format!(
                "row has {} values but the cursor has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.push(value);
        }
        self.row_count += 1;
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[PacketColumn] {
        &self.columns
    }

    pub fn last_part(&self) -> bool {
        self.last_part
    }

    pub fn set_last_part(&mut self, last_part: bool) {
        self.last_part = last_part;
    }

    /// Value at (`row`, `column`), both 0-based.
    pub fn value(&self, row: usize, column: usize) -> Option<Value> {
        if row >= self.row_count {
            return None;
        }
        let col = self.columns.get(column)?;
        Some(col.data.get(row, col.nulls.get(row)))
    }

    pub fn row(&self, index: usize) -> Option<Row> {
        if index >= self.row_count {
            return None;
        }
        Some(
            self.columns
                .iter()
                .map(|c| c.data.get(index, c.nulls.get(index)))
                .collect(),
        )
    }

    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        (0..self.row_count).filter_map(move |i| self.row(i))
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows().collect()
    }

    /// Appends `other` after the rows of this packet, taking over its
    /// `last_part` flag.
    pub fn append(&mut self, other: RowPacket) -> Result<()> {
        if other.columns.len() != self.columns.len() {
            return Err(ProxyError::Cursor(format!(
                "cannot merge a packet with {} columns into one with {}",
                other.columns.len(),
                self.columns.len()
            )));
        }
        for (mine, theirs) in self.columns.iter_mut().zip(other.columns) {
            mine.append(theirs);
        }
        self.row_count += other.row_count;
        self.last_part = other.last_part;
        Ok(())
    }
}

/// How a client folds a newly received packet into what it already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    /// Replace: consumed rows are dropped, memory stays bounded by `K`.
    Forward,
    /// Append: the full history is retained for backward positioning.
    Scroll,
}

/// Rows a client currently holds for one cursor.
#[derive(Debug, Clone)]
pub struct PacketWindow {
    packet: RowPacket,
    /// Absolute (0-based) index of the first retained row.
    start: usize,
    mode: MergeMode,
}

impl PacketWindow {
    pub fn new(first: RowPacket, mode: MergeMode) -> Self {
        Self {
            packet: first,
            start: 0,
            mode,
        }
    }

    pub fn merge(&mut self, next: RowPacket) -> Result<()> {
        match self.mode {
            MergeMode::Forward => {
                self.start += self.packet.row_count();
                self.packet = next;
                Ok(())
            }
            MergeMode::Scroll => self.packet.append(next),
        }
    }

    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    /// Absolute index of the first retained row.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Absolute index one past the last received row.
    pub fn end(&self) -> usize {
        self.start + self.packet.row_count()
    }

    pub fn retained(&self) -> usize {
        self.packet.row_count()
    }

    pub fn is_complete(&self) -> bool {
        self.packet.last_part()
    }

    pub fn contains(&self, absolute: usize) -> bool {
        absolute >= self.start && absolute < self.end()
    }

    pub fn value(&self, absolute: usize, column: usize) -> Result<Value> {
        if absolute < self.start {
            return Err(ProxyError::Cursor(format!(
                "row {} is below the possible range ({}..{})",
                absolute + 1,
                self.start + 1,
                self.end() + 1
            )));
        }
        if absolute >= self.end() {
            return Err(ProxyError::Cursor(format!(
                "row {} is above the possible range ({}..{})",
                absolute + 1,
                self.start + 1,
                self.end() + 1
            )));
        }
        self.packet
            .value(absolute - self.start, column)
            .ok_or_else(|| ProxyError::Cursor(format!("column index {} out of range", column + 1)))
    }
}
