use super::Shared;
use super::exec::{self, Executed};
use super::sql::{self, ParsedSql};
use crate::core::{ColumnMeta, DataType, ProxyError, Result, Row, Value};
use crate::driver::{
    CancelHandle, DriverResultSet, DriverStatement, ScrollMode, StatementKind, VecResultSet,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct CancelFlag(AtomicBool);

impl CancelHandle for CancelFlag {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

enum BatchEntry {
    Sql(String),
    Params(BTreeMap<usize, Value>),
}

pub struct MemoryStatement {
    shared: Arc<Shared>,
    kind: StatementKind,
    scroll: ScrollMode,
    prepared: Option<ParsedSql>,
    params: BTreeMap<usize, Value>,
    batch: Vec<BatchEntry>,
    max_rows: u64,
    query_timeout: u64,
    fetch_size: u64,
    cancel: Arc<CancelFlag>,
    pending: Option<Box<dyn DriverResultSet>>,
    update_count: Option<u64>,
    generated: (Option<ColumnMeta>, Vec<Row>),
    out_types: BTreeMap<usize, DataType>,
    out_row: Option<Row>,
    closed: bool,
}

impl MemoryStatement {
    pub(crate) fn new(
        shared: Arc<Shared>,
        kind: StatementKind,
        sql: Option<&str>,
        scroll: ScrollMode,
    ) -> Result<Self> {
        let prepared = sql.map(|s| sql::parse(strip_call_escape(s))).transpose()?;
        Ok(Self {
            shared,
            kind,
            scroll,
            prepared,
            params: BTreeMap::new(),
            batch: Vec::new(),
            max_rows: 0,
            query_timeout: 0,
            fetch_size: 0,
            cancel: Arc::new(CancelFlag::default()),
            pending: None,
            update_count: None,
            generated: (None, Vec::new()),
            out_types: BTreeMap::new(),
            out_row: None,
            closed: false,
        })
    }

    pub fn scroll_mode(&self) -> ScrollMode {
        self.scroll
    }

    pub fn fetch_size(&self) -> u64 {
        self.fetch_size
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ProxyError::Closed("statement".to_string()));
        }
        Ok(())
    }

    /// Resolves what to run: explicit SQL for plain statements, the prepared
    /// text otherwise.
    fn resolve(&self, sql: Option<&str>) -> Result<(ParsedSql, Vec<Value>)> {
        match (sql, &self.prepared) {
            (Some(text), None) => {
                let parsed = sql::parse(text)?;
                let params = exec::bind_params(&parsed, &BTreeMap::new())?;
                Ok((parsed, params))
            }
            (None, Some(parsed)) => {
                let params = exec::bind_params(parsed, &self.params)?;
                Ok((parsed.clone(), params))
            }
            (Some(_), Some(_)) => Err(ProxyError::database_with_state(
                "Cannot pass SQL text to a prepared statement",
                "HY000",
            )),
            (None, None) => Err(ProxyError::database_with_state(
                "No SQL text given to a plain statement",
                "HY000",
            )),
        }
    }

    async fn run(&mut self, parsed: &ParsedSql, params: &[Value]) -> Result<Executed> {
        self.ensure_open()?;
        self.cancel.0.store(false, Ordering::SeqCst);
        if let Some(mut previous) = self.pending.take() {
            let _ = previous.close().await;
        }
        self.update_count = None;
        self.generated = (None, Vec::new());
        self.out_row = None;

        exec::execute(&self.shared, parsed, params, self.max_rows)
    }

    fn result_set(&mut self, columns: Vec<ColumnMeta>, rows: Vec<Row>) -> Box<dyn DriverResultSet> {
        if self.kind == StatementKind::Callable {
            self.out_row = rows.first().cloned();
        }
        Box::new(MemoryResultSet::new(columns, rows, self.cancel.clone()))
    }

    fn record_count(&mut self, count: u64, inserted: Vec<Row>, key_column: Option<ColumnMeta>) -> u64 {
        self.update_count = Some(count);
        self.generated = (key_column, inserted);
        count
    }
}

fn strip_call_escape(sql: &str) -> &str {
    let trimmed = sql.trim();
    trimmed
        .strip_prefix("{call")
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[async_trait]
impl DriverStatement for MemoryStatement {
    fn kind(&self) -> StatementKind {
        self.kind
    }

    async fn execute_query(&mut self, sql: Option<&str>) -> Result<Box<dyn DriverResultSet>> {
        let (parsed, params) = self.resolve(sql)?;
        if !parsed.plan.is_query() {
            return Err(ProxyError::database_with_state(
                "Statement did not return a result set",
                "02000",
            ));
        }
        match self.run(&parsed, &params).await? {
            Executed::Rows { columns, rows } => Ok(self.result_set(columns, rows)),
            Executed::Count { .. } => Err(ProxyError::database("Query produced an update count")),
        }
    }

    async fn execute_update(&mut self, sql: Option<&str>) -> Result<u64> {
        let (parsed, params) = self.resolve(sql)?;
        if !parsed.plan.is_write() {
            return Err(ProxyError::database_with_state(
                "Query statements cannot be executed as updates",
                "HY000",
            ));
        }
        match self.run(&parsed, &params).await? {
            Executed::Count {
                count,
                inserted,
                key_column,
            } => Ok(self.record_count(count, inserted, key_column)),
            Executed::Rows { .. } => Err(ProxyError::database("Update produced a result set")),
        }
    }

    async fn execute(&mut self, sql: Option<&str>) -> Result<bool> {
        let (parsed, params) = self.resolve(sql)?;
        match self.run(&parsed, &params).await? {
            Executed::Rows { columns, rows } => {
                let rs = self.result_set(columns, rows);
                self.pending = Some(rs);
                Ok(true)
            }
            Executed::Count {
                count,
                inserted,
                key_column,
            } => {
                self.record_count(count, inserted, key_column);
                Ok(false)
            }
        }
    }

    async fn take_result_set(&mut self) -> Result<Option<Box<dyn DriverResultSet>>> {
        self.ensure_open()?;
        Ok(self.pending.take())
    }

    fn update_count(&self) -> Option<u64> {
        self.update_count
    }

    async fn set_parameter(&mut self, index: usize, value: Value) -> Result<()> {
        self.ensure_open()?;
        let Some(parsed) = &self.prepared else {
            return Err(ProxyError::database_with_state(
                "Parameters can only be set on prepared statements",
                "HY000",
            ));
        };
        if index == 0 || index > parsed.param_count {
            return Err(ProxyError::database_with_state(
                format!(
                    "Parameter index {} is out of range (1..={})",
                    index, parsed.param_count
                ),
                "07009",
            ));
        }
        self.params.insert(index, value);
        Ok(())
    }

    async fn clear_parameters(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.params.clear();
        Ok(())
    }

    async fn add_batch(&mut self, sql: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let entry = match (sql, &self.prepared) {
            (Some(text), None) => BatchEntry::Sql(text.to_string()),
            (None, Some(_)) => BatchEntry::Params(self.params.clone()),
            _ => {
                return Err(ProxyError::database_with_state(
                    "Batch entry does not match the statement kind",
                    "HY000",
                ));
            }
        };
        self.batch.push(entry);
        Ok(())
    }

    async fn clear_batch(&mut self) -> Result<()> {
        self.batch.clear();
        Ok(())
    }

    async fn execute_batch(&mut self) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let entries = std::mem::take(&mut self.batch);
        let mut counts = Vec::with_capacity(entries.len());

        for entry in entries {
            let (parsed, params) = match entry {
                BatchEntry::Sql(text) => {
                    let parsed = sql::parse(&text)?;
                    let params = exec::bind_params(&parsed, &BTreeMap::new())?;
                    (parsed, params)
                }
                BatchEntry::Params(bound) => {
                    let parsed = self
                        .prepared
                        .clone()
                        .ok_or_else(|| ProxyError::database("Prepared text missing"))?;
                    let params = exec::bind_params(&parsed, &bound)?;
                    (parsed, params)
                }
            };
            if parsed.plan.is_query() {
                return Err(ProxyError::database_with_state(
                    "Queries are not allowed in a batch",
                    "HY000",
                ));
            }
            match self.run(&parsed, &params).await? {
                Executed::Count { count, .. } => counts.push(count),
                Executed::Rows { .. } => counts.push(0),
            }
        }

        Ok(counts)
    }

    async fn generated_keys(&mut self) -> Result<Box<dyn DriverResultSet>> {
        self.ensure_open()?;
        let (column, rows) = &self.generated;
        let Some(column) = column else {
            return Ok(Box::new(VecResultSet::new(Vec::new(), Vec::new())));
        };
        let keys = rows
            .iter()
            .filter_map(|row| row.first().cloned())
            .map(|key| vec![key])
            .collect();
        Ok(Box::new(VecResultSet::new(vec![column.clone()], keys)))
    }

    fn set_max_rows(&mut self, rows: u64) {
        self.max_rows = rows;
    }

    fn max_rows(&self) -> u64 {
        self.max_rows
    }

    fn set_query_timeout(&mut self, secs: u64) {
        self.query_timeout = secs;
    }

    fn query_timeout(&self) -> u64 {
        self.query_timeout
    }

    fn set_fetch_size(&mut self, rows: u64) {
        self.fetch_size = rows;
    }

    async fn register_out_parameter(&mut self, index: usize, data_type: DataType) -> Result<()> {
        self.ensure_open()?;
        if self.kind != StatementKind::Callable {
            return Err(ProxyError::database_with_state(
                "Out parameters require a callable statement",
                "HY000",
            ));
        }
        if index == 0 {
            return Err(ProxyError::database_with_state("Parameter indexes start at 1", "07009"));
        }
        self.out_types.insert(index, data_type);
        Ok(())
    }

    async fn out_parameter(&mut self, index: usize) -> Result<Value> {
        self.ensure_open()?;
        let data_type = self.out_types.get(&index).copied().ok_or_else(|| {
            ProxyError::database_with_state(
                format!("Parameter {} was not registered as an out parameter", index),
                "07009",
            )
        })?;
        let row = self.out_row.as_ref().ok_or_else(|| {
            ProxyError::database_with_state("Callable statement has not produced a row", "02000")
        })?;
        let value = row.get(index - 1).cloned().ok_or_else(|| {
            ProxyError::database_with_state(format!("No out value at position {}", index), "07009")
        })?;
        data_type.coerce(value)
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        self.cancel.clone()
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut rs) = self.pending.take() {
            rs.close().await?;
        }
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Rows of one query, observing the statement's cancel flag between rows.
pub struct MemoryResultSet {
    columns: Vec<ColumnMeta>,
    rows: std::vec::IntoIter<Row>,
    cancel: Arc<CancelFlag>,
    closed: bool,
}

impl MemoryResultSet {
    fn new(columns: Vec<ColumnMeta>, rows: Vec<Row>, cancel: Arc<CancelFlag>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
            cancel,
            closed: false,
        }
    }
}

#[async_trait]
impl DriverResultSet for MemoryResultSet {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Err(ProxyError::Closed("result set".to_string()));
        }
        if self.cancel.0.load(Ordering::SeqCst) {
            return Err(ProxyError::Cancelled);
        }
        Ok(self.rows.next())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
