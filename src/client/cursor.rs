use super::SessionHandle;
use crate::command::Command;
use crate::core::{ColumnMeta, ProxyError, Result, Uid, Value, find_column};
use crate::pagination::{MergeMode, PacketWindow};
use crate::wire::{CursorPage, Response};
use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    Row(usize),
    AfterLast,
}

/// Conversion used by the typed getters of [`StreamingCursor`].
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch(value: &Value, wanted: &str) -> ProxyError {
    ProxyError::Cursor(format!("cannot read {} as {}", value.type_name(), wanted))
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch(&value, "integer"))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch(&value, "float"))
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value.as_bool())
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            other => Err(mismatch(&other, "bytes")),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Result<Self> {
        value.as_timestamp().ok_or_else(|| mismatch(&value, "timestamp"))
    }
}

/// Client side of a query result.
///
/// Rows arrive packet by packet. A forward-only cursor keeps one packet and
/// drops it when the next one is merged; a scrollable cursor keeps every
/// packet it has seen, so backward and absolute moves never need the
/// server. Column and row numbers are 1-based.
pub struct StreamingCursor {
    session: Arc<SessionHandle>,
    /// Server-side remainder; `None` once every packet has arrived.
    holder: Option<Uid>,
    columns: Vec<ColumnMeta>,
    window: PacketWindow,
    position: Position,
    was_null: bool,
    closed: bool,
}

impl std::fmt::Debug for StreamingCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCursor")
            .field("holder", &self.holder)
            .field("columns", &self.columns)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl StreamingCursor {
    pub(crate) fn open(session: Arc<SessionHandle>, page: CursorPage) -> Result<Self> {
        let first = page.packet.into_inner()?;
        let holder = if first.last_part() {
            None
        } else {
            page.holder.map(|r| r.uid.plain())
        };
        Ok(Self {
            session,
            holder,
            columns: page.columns,
            window: PacketWindow::new(first, page.mode),
            position: Position::BeforeFirst,
            was_null: false,
            closed: false,
        })
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// 1-based index of the column labelled `label`.
    pub fn find_column(&self, label: &str) -> Result<usize> {
        find_column(&self.columns, label)
            .map(|i| i + 1)
            .ok_or_else(|| ProxyError::Cursor(format!("no column labelled '{}'", label)))
    }

    pub fn is_scrollable(&self) -> bool {
        self.window.mode() == MergeMode::Scroll
    }

    /// Rows received so far, discarded ones included.
    pub fn fetched_rows(&self) -> usize {
        self.window.end()
    }

    /// Every row of the result has been received.
    pub fn is_complete(&self) -> bool {
        self.window.is_complete()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_before_first(&self) -> bool {
        self.position == Position::BeforeFirst
    }

    pub fn is_after_last(&self) -> bool {
        self.position == Position::AfterLast
    }

    /// Current row number, 0 when not on a row.
    pub fn row(&self) -> usize {
        match self.position {
            Position::Row(i) => i + 1,
            _ => 0,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ProxyError::Closed("cursor is closed".into()));
        }
        Ok(())
    }

    fn ensure_scrollable(&self, operation: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.is_scrollable() {
            return Err(ProxyError::Unsupported(format!(
                "{} on a forward-only cursor",
                operation
            )));
        }
        Ok(())
    }

    /// Requests the next packet. Returns false when none is left.
    async fn fetch_more(&mut self) -> Result<bool> {
        if self.window.is_complete() {
            return Ok(false);
        }
        let holder = self
            .holder
            .ok_or_else(|| ProxyError::Cursor("the rest of the cursor is no longer available".into()))?;

        let packet = match self.session.send(Some(holder), Command::NextPacket).await? {
            Response::Packet(envelope) => envelope.into_inner()?,
            other => {
                return Err(ProxyError::MalformedCommand(format!(
                    "expected packet reply, got {}",
                    other.name()
                )));
            }
        };
        debug!("Cursor {} received {} rows", holder, packet.row_count());
        if packet.last_part() {
            self.holder = None;
        }
        self.window.merge(packet)?;
        Ok(true)
    }

    async fn fetch_through(&mut self, index: usize) -> Result<bool> {
        while self.window.end() <= index {
            if !self.fetch_more().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn fetch_all(&mut self) -> Result<()> {
        while self.fetch_more().await? {}
        Ok(())
    }

    async fn move_to(&mut self, index: usize) -> Result<bool> {
        if self.fetch_through(index).await? {
            self.position = Position::Row(index);
            Ok(true)
        } else {
            self.position = Position::AfterLast;
            Ok(false)
        }
    }

    pub async fn next(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let target = match self.position {
            Position::BeforeFirst => 0,
            Position::Row(i) => i + 1,
            Position::AfterLast => return Ok(false),
        };
        self.move_to(target).await
    }

    pub async fn previous(&mut self) -> Result<bool> {
        self.ensure_scrollable("previous")?;
        match self.position {
            Position::BeforeFirst | Position::Row(0) => {
                self.position = Position::BeforeFirst;
                Ok(false)
            }
            Position::Row(i) => {
                self.position = Position::Row(i - 1);
                Ok(true)
            }
            Position::AfterLast => self.last().await,
        }
    }

    pub async fn first(&mut self) -> Result<bool> {
        self.ensure_scrollable("first")?;
        self.move_to(0).await
    }

    pub async fn last(&mut self) -> Result<bool> {
        self.ensure_scrollable("last")?;
        self.fetch_all().await?;
        match self.window.end() {
            0 => {
                self.position = Position::BeforeFirst;
                Ok(false)
            }
            end => {
                self.position = Position::Row(end - 1);
                Ok(true)
            }
        }
    }

    /// Moves to row `row`; negative values count from the end, 0 means
    /// before the first row.
    pub async fn absolute(&mut self, row: i64) -> Result<bool> {
        self.ensure_scrollable("absolute")?;
        if row == 0 {
            self.position = Position::BeforeFirst;
            return Ok(false);
        }
        if row > 0 {
            return self.move_to(row as usize - 1).await;
        }
        self.fetch_all().await?;
        let index = self.window.end() as i64 + row;
        if index < 0 {
            self.position = Position::BeforeFirst;
            Ok(false)
        } else {
            self.position = Position::Row(index as usize);
            Ok(true)
        }
    }

    pub async fn relative(&mut self, rows: i64) -> Result<bool> {
        self.ensure_scrollable("relative")?;
        let current = match self.position {
            Position::BeforeFirst => -1,
            Position::Row(i) => i as i64,
            Position::AfterLast => {
                self.fetch_all().await?;
                self.window.end() as i64
            }
        };
        let target = current + rows;
        if target < 0 {
            self.position = Position::BeforeFirst;
            return Ok(false);
        }
        self.move_to(target as usize).await
    }

    pub fn before_first(&mut self) -> Result<()> {
        self.ensure_scrollable("before_first")?;
        self.position = Position::BeforeFirst;
        Ok(())
    }

    pub async fn after_last(&mut self) -> Result<()> {
        self.ensure_scrollable("after_last")?;
        self.fetch_all().await?;
        self.position = Position::AfterLast;
        Ok(())
    }

    /// Raw value of `column` (1-based) in the current row.
    pub fn get_value(&mut self, column: usize) -> Result<Value> {
        self.ensure_open()?;
        let Position::Row(row) = self.position else {
            return Err(ProxyError::Cursor("cursor is not positioned on a row".into()));
        };
        if column == 0 || column > self.columns.len() {
            return Err(ProxyError::Cursor(format!(
                "column index {} out of range (1..={})",
                column,
                self.columns.len()
            )));
        }
        let value = self.window.value(row, column - 1)?;
        self.was_null = value.is_null();
        Ok(value)
    }

    /// Typed value of `column`; `None` for SQL NULL.
    pub fn get<T: FromValue>(&mut self, column: usize) -> Result<Option<T>> {
        match self.get_value(column)? {
            Value::Null => Ok(None),
            value => T::from_value(value).map(Some),
        }
    }

    pub fn get_by_label<T: FromValue>(&mut self, label: &str) -> Result<Option<T>> {
        let column = self.find_column(label)?;
        self.get(column)
    }

    pub fn get_i64(&mut self, column: usize) -> Result<Option<i64>> {
        self.get(column)
    }

    pub fn get_f64(&mut self, column: usize) -> Result<Option<f64>> {
        self.get(column)
    }

    pub fn get_bool(&mut self, column: usize) -> Result<Option<bool>> {
        self.get(column)
    }

    pub fn get_string(&mut self, column: usize) -> Result<Option<String>> {
        self.get(column)
    }

    pub fn get_bytes(&mut self, column: usize) -> Result<Option<Vec<u8>>> {
        self.get(column)
    }

    pub fn get_timestamp(&mut self, column: usize) -> Result<Option<DateTime<Utc>>> {
        self.get(column)
    }

    /// Whether the last value read was SQL NULL.
    pub fn was_null(&self) -> bool {
        self.was_null
    }

    /// Closes the cursor and discards the server-side remainder.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.holder.take() {
            Some(holder) => self.session.destroy(holder).await,
            None => Ok(()),
        }
    }
}

impl Drop for StreamingCursor {
    fn drop(&mut self) {
        let Some(holder) = self.holder.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let session = self.session.clone();
            runtime.spawn(async move {
                if let Err(e) = session.destroy(holder).await {
                    debug!("Dropping cursor {} failed: {}", holder, e);
                }
            });
        }
    }
}
