//! Scripted driver shared by the integration tests.
//!
//! Statements understand a tiny command language instead of SQL:
//! - `ROWS n` yields `n` rows of `(id INTEGER, name TEXT)`
//! - `FAIL n` yields `n` rows, then fails on the next fetch
//! - `BLOCK` waits until the statement is cancelled
//! - `COUNT n` (updates) reports `n` affected rows

#![allow(dead_code)]

use async_trait::async_trait;
use rustmemodb_remote::core::{ColumnMeta, DataType, Properties, ProxyError, Result, Row, SavepointInfo, Value};
use rustmemodb_remote::driver::{
    CancelHandle, Driver, DriverConnection, DriverMetaData, DriverResultSet, DriverStatement,
    Isolation, ScrollMode, StatementKind,
};
use rustmemodb_remote::{Dispatcher, DriverRegistry, MemoryDriver, ServerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const LOCATOR: &str = "scripted:test";

#[derive(Debug, Default)]
pub struct ScriptStats {
    pub connections_opened: AtomicUsize,
    pub connections_closed: AtomicUsize,
    pub result_sets_closed: AtomicUsize,
    pub rows_served: AtomicUsize,
}

impl ScriptStats {
    pub fn opened(&self) -> usize {
        self.connections_opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.connections_closed.load(Ordering::SeqCst)
    }

    pub fn result_sets_closed(&self) -> usize {
        self.result_sets_closed.load(Ordering::SeqCst)
    }

    pub fn rows_served(&self) -> usize {
        self.rows_served.load(Ordering::SeqCst)
    }
}

pub fn columns() -> Vec<ColumnMeta> {
    vec![
        ColumnMeta::new("id", DataType::Integer),
        ColumnMeta::new("name", DataType::Text),
    ]
}

pub fn row(i: usize) -> Row {
    vec![Value::Integer(i as i64), Value::Text(format!("row-{}", i))]
}

#[derive(Default)]
pub struct ScriptedDriver {
    pub stats: Arc<ScriptStats>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn accepts(&self, locator: &str) -> bool {
        locator.starts_with("scripted:")
    }

    async fn connect(&self, _locator: &str, _props: &Properties) -> Result<Box<dyn DriverConnection>> {
        self.stats.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            stats: self.stats.clone(),
            auto_commit: true,
            read_only: false,
            closed: false,
        }))
    }
}

pub struct ScriptedConnection {
    stats: Arc<ScriptStats>,
    auto_commit: bool,
    read_only: bool,
    closed: bool,
}

impl ScriptedConnection {
    fn statement(&self, kind: StatementKind, sql: Option<&str>) -> Box<dyn DriverStatement> {
        Box::new(ScriptedStatement {
            stats: self.stats.clone(),
            kind,
            prepared: sql.map(str::to_string),
            cancelled: Arc::new(CancelFlag::default()),
            pending: None,
            max_rows: 0,
            query_timeout: 0,
            closed: false,
        })
    }
}

#[async_trait]
impl DriverConnection for ScriptedConnection {
    async fn create_statement(&mut self, _scroll: ScrollMode) -> Result<Box<dyn DriverStatement>> {
        Ok(self.statement(StatementKind::Plain, None))
    }

    async fn prepare_statement(&mut self, sql: &str, _scroll: ScrollMode) -> Result<Box<dyn DriverStatement>> {
        Ok(self.statement(StatementKind::Prepared, Some(sql)))
    }

    async fn prepare_call(&mut self, sql: &str) -> Result<Box<dyn DriverStatement>> {
        Ok(self.statement(StatementKind::Callable, Some(sql)))
    }

    async fn set_auto_commit(&mut self, enabled: bool) -> Result<()> {
        self.auto_commit = enabled;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    async fn set_savepoint(&mut self, name: Option<&str>) -> Result<SavepointInfo> {
        Ok(SavepointInfo {
            id: 1,
            name: name.map(str::to_string),
        })
    }

    async fn rollback_to_savepoint(&mut self, _savepoint: &SavepointInfo) -> Result<()> {
        Ok(())
    }

    async fn release_savepoint(&mut self, _savepoint: &SavepointInfo) -> Result<()> {
        Ok(())
    }

    async fn metadata(&mut self) -> Result<Box<dyn DriverMetaData>> {
        Err(ProxyError::Unsupported("scripted metadata".into()))
    }

    async fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.read_only = read_only;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn set_transaction_isolation(&mut self, _level: Isolation) -> Result<()> {
        Ok(())
    }

    fn transaction_isolation(&self) -> Isolation {
        Isolation::default()
    }

    async fn is_valid(&mut self) -> Result<bool> {
        Ok(!self.closed)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.stats.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Debug, Default)]
struct CancelFlag(AtomicBool);

impl CancelHandle for CancelFlag {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

enum Script {
    Rows(usize),
    Fail(usize),
    Block,
    Count(u64),
}

fn parse_script(sql: &str) -> Result<Script> {
    let mut words = sql.split_whitespace();
    let verb = words.next().unwrap_or_default().to_ascii_uppercase();
    let number = words.next().and_then(|n| n.parse::<usize>().ok());
    match (verb.as_str(), number) {
        ("ROWS", Some(n)) => Ok(Script::Rows(n)),
        ("FAIL", Some(n)) => Ok(Script::Fail(n)),
        ("BLOCK", _) => Ok(Script::Block),
        ("COUNT", Some(n)) => Ok(Script::Count(n as u64)),
        _ => Err(ProxyError::database_with_state(format!("bad script '{}'", sql), "42000")),
    }
}

pub struct ScriptedStatement {
    stats: Arc<ScriptStats>,
    kind: StatementKind,
    prepared: Option<String>,
    cancelled: Arc<CancelFlag>,
    pending: Option<Box<dyn DriverResultSet>>,
    max_rows: u64,
    query_timeout: u64,
    closed: bool,
}

impl ScriptedStatement {
    fn resolve(&self, sql: Option<&str>) -> Result<Script> {
        let text = sql
            .or(self.prepared.as_deref())
            .ok_or_else(|| ProxyError::database("no SQL to execute"))?;
        parse_script(text)
    }
}

async fn wait_for_cancel(cancelled: Arc<CancelFlag>) -> ProxyError {
    while !cancelled.0.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    ProxyError::Cancelled
}

async fn open(script: Script, cancelled: Arc<CancelFlag>, stats: Arc<ScriptStats>) -> Result<Box<dyn DriverResultSet>> {
    match script {
        Script::Rows(n) => Ok(Box::new(ScriptedResultSet::new(n, None, stats))),
        Script::Fail(n) => Ok(Box::new(ScriptedResultSet::new(usize::MAX, Some(n), stats))),
        Script::Block => Err(wait_for_cancel(cancelled).await),
        Script::Count(_) => Err(ProxyError::database("update script used as a query")),
    }
}

#[async_trait]
impl DriverStatement for ScriptedStatement {
    fn kind(&self) -> StatementKind {
        self.kind
    }

    async fn execute_query(&mut self, sql: Option<&str>) -> Result<Box<dyn DriverResultSet>> {
        let script = self.resolve(sql)?;
        open(script, self.cancelled.clone(), self.stats.clone()).await
    }

    async fn execute_update(&mut self, sql: Option<&str>) -> Result<u64> {
        match self.resolve(sql)? {
            Script::Count(n) => Ok(n),
            Script::Block => Err(wait_for_cancel(self.cancelled.clone()).await),
            _ => Err(ProxyError::database("query script used as an update")),
        }
    }

    async fn execute(&mut self, sql: Option<&str>) -> Result<bool> {
        match self.resolve(sql)? {
            Script::Count(_) => Ok(false),
            script => {
                self.pending = Some(open(script, self.cancelled.clone(), self.stats.clone()).await?);
                Ok(true)
            }
        }
    }

    async fn take_result_set(&mut self) -> Result<Option<Box<dyn DriverResultSet>>> {
        Ok(self.pending.take())
    }

    fn update_count(&self) -> Option<u64> {
        None
    }

    async fn set_parameter(&mut self, _index: usize, _value: Value) -> Result<()> {
        Ok(())
    }

    async fn clear_parameters(&mut self) -> Result<()> {
        Ok(())
    }

    async fn add_batch(&mut self, _sql: Option<&str>) -> Result<()> {
        Err(ProxyError::Unsupported("scripted batches".into()))
    }

    async fn clear_batch(&mut self) -> Result<()> {
        Ok(())
    }

    async fn execute_batch(&mut self) -> Result<Vec<u64>> {
        Ok(Vec::new())
    }

    async fn generated_keys(&mut self) -> Result<Box<dyn DriverResultSet>> {
        Ok(Box::new(ScriptedResultSet::new(0, None, self.stats.clone())))
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

    fn set_fetch_size(&mut self, _rows: u64) {}

    async fn register_out_parameter(&mut self, _index: usize, _data_type: DataType) -> Result<()> {
        Err(ProxyError::Unsupported("scripted out parameters".into()))
    }

    async fn out_parameter(&mut self, _index: usize) -> Result<Value> {
        Err(ProxyError::Unsupported("scripted out parameters".into()))
    }

    fn cancel_handle(&self) -> Arc<dyn CancelHandle> {
        self.cancelled.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// `total` rows, optionally failing once `fail_at` rows were served.
pub struct ScriptedResultSet {
    columns: Vec<ColumnMeta>,
    next: usize,
    total: usize,
    fail_at: Option<usize>,
    /// Fetching this row waits for a permit on the semaphore.
    gate: Option<(usize, Arc<Semaphore>)>,
    stats: Arc<ScriptStats>,
    closed: bool,
}

impl ScriptedResultSet {
    pub fn new(total: usize, fail_at: Option<usize>, stats: Arc<ScriptStats>) -> Self {
        Self {
            columns: columns(),
            next: 0,
            total,
            fail_at,
            gate: None,
            stats,
            closed: false,
        }
    }

    pub fn boxed(total: usize, stats: &Arc<ScriptStats>) -> Box<dyn DriverResultSet> {
        Box::new(Self::new(total, None, stats.clone()))
    }

    pub fn failing(fail_at: usize, stats: &Arc<ScriptStats>) -> Box<dyn DriverResultSet> {
        Box::new(Self::new(usize::MAX, Some(fail_at), stats.clone()))
    }

    pub fn gated(total: usize, gate_at: usize, gate: &Arc<Semaphore>, stats: &Arc<ScriptStats>) -> Box<dyn DriverResultSet> {
        let mut rs = Self::new(total, None, stats.clone());
        rs.gate = Some((gate_at, gate.clone()));
        Box::new(rs)
    }
}

#[async_trait]
impl DriverResultSet for ScriptedResultSet {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        if self.closed || self.next >= self.total {
            return Ok(None);
        }
        if self.gate.as_ref().is_some_and(|(at, _)| *at == self.next) {
            if let Some((_, gate)) = self.gate.take() {
                let _ = gate.acquire().await;
            }
        }
        if self.fail_at == Some(self.next) {
            return Err(ProxyError::database_with_state(
                format!("row {} is unreadable", self.next + 1),
                "XX001",
            ));
        }
        let row = row(self.next);
        self.next += 1;
        self.stats.rows_served.fetch_add(1, Ordering::SeqCst);
        Ok(Some(row))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.stats.result_sets_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Dispatcher with the memory driver and a scripted driver whose counters
/// are returned alongside.
pub fn dispatcher(config: ServerConfig) -> (Arc<Dispatcher>, Arc<ScriptStats>) {
    let scripted = ScriptedDriver::new();
    let stats = scripted.stats.clone();
    let drivers = DriverRegistry::new()
        .with(Arc::new(MemoryDriver::new()))
        .with(Arc::new(scripted));
    let dispatcher = Dispatcher::new(config, drivers).expect("valid test configuration");
    (Arc::new(dispatcher), stats)
}
