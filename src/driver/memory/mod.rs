//! In-memory SQL driver used by the server binary and the test-suite.
//!
//! Locators have the form `memory:<name>`; every connection opened with the
//! same name sees the same tables. Transactions are implemented by taking a
//! snapshot of the whole database on the first write after auto-commit has
//! been disabled; rollback restores it.

mod exec;
mod sql;
mod statement;

pub use statement::{MemoryResultSet, MemoryStatement};

use super::{
    Driver, DriverConnection, DriverMetaData, DriverResultSet, DriverStatement, Isolation,
    ScrollMode, StatementKind, VecResultSet,
};
use crate::core::{ColumnMeta, DataType, Properties, ProxyError, Result, SavepointInfo, Value};
use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const LOCATOR_PREFIX: &str = "memory:";

#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: BTreeMap<String, MemoryTable>,
}

impl MemoryDatabase {
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.tables.get(table).map(|t| t.rows.len())
    }
}

#[derive(Debug, Clone)]
struct MemoryTable {
    name: String,
    columns: Vec<ColumnMeta>,
    rows: Vec<crate::core::Row>,
}

/// Driver for `memory:<name>` locators.
#[derive(Default)]
pub struct MemoryDriver {
    databases: DashMap<String, Arc<RwLock<MemoryDatabase>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared database behind a name, created on first use.
    pub fn database(&self, name: &str) -> Arc<RwLock<MemoryDatabase>> {
        self.databases
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(MemoryDatabase::default())))
            .clone()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn accepts(&self, locator: &str) -> bool {
        locator.starts_with(LOCATOR_PREFIX)
    }

    async fn connect(&self, locator: &str, props: &Properties) -> Result<Box<dyn DriverConnection>> {
        let name = locator
            .strip_prefix(LOCATOR_PREFIX)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ProxyError::Config(format!("Invalid memory locator '{}'", locator)))?;

        let read_only = props
            .get("readOnly")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        debug!("Opening memory connection to '{}'", name);
        let shared = Arc::new(Shared {
            name: name.to_string(),
            db: self.database(name),
            txn: Mutex::new(TxnState {
                read_only,
                ..TxnState::default()
            }),
        });

        Ok(Box::new(MemoryConnection { shared }))
    }
}

#[derive(Debug)]
struct TxnState {
    auto_commit: bool,
    read_only: bool,
    isolation: Isolation,
    closed: bool,
    snapshot: Option<MemoryDatabase>,
    savepoints: Vec<(SavepointInfo, MemoryDatabase)>,
    next_savepoint: u64,
}

impl Default for TxnState {
    fn default() -> Self {
        Self {
            auto_commit: true,
            read_only: false,
            isolation: Isolation::default(),
            closed: false,
            snapshot: None,
            savepoints: Vec::new(),
            next_savepoint: 1,
        }
    }
}

/// State shared by a connection and the statements it created.
pub(crate) struct Shared {
    name: String,
    db: Arc<RwLock<MemoryDatabase>>,
    txn: Mutex<TxnState>,
}

impl Shared {
    fn ensure_open(&self) -> Result<()> {
        if self.txn.lock().closed {
            return Err(ProxyError::Closed(format!("connection to '{}'", self.name)));
        }
        Ok(())
    }
}

pub struct MemoryConnection {
    shared: Arc<Shared>,
}

impl MemoryConnection {
    fn statement(&self, kind: StatementKind, sql: Option<&str>, scroll: ScrollMode) -> Result<Box<dyn DriverStatement>> {
        self.shared.ensure_open()?;
        let stmt = MemoryStatement::new(self.shared.clone(), kind, sql, scroll)?;
        Ok(Box::new(stmt))
    }
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    async fn create_statement(&mut self, scroll: ScrollMode) -> Result<Box<dyn DriverStatement>> {
        self.statement(StatementKind::Plain, None, scroll)
    }

    async fn prepare_statement(&mut self, sql: &str, scroll: ScrollMode) -> Result<Box<dyn DriverStatement>> {
        self.statement(StatementKind::Prepared, Some(sql), scroll)
    }

    async fn prepare_call(&mut self, sql: &str) -> Result<Box<dyn DriverStatement>> {
        self.statement(StatementKind::Callable, Some(sql), ScrollMode::ForwardOnly)
    }

    async fn set_auto_commit(&mut self, enabled: bool) -> Result<()> {
        self.shared.ensure_open()?;
        let mut txn = self.shared.txn.lock();
        if enabled && !txn.auto_commit {
            // Switching auto-commit back on commits the open transaction.
            txn.snapshot = None;
            txn.savepoints.clear();
        }
        txn.auto_commit = enabled;
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.shared.txn.lock().auto_commit
    }

    async fn commit(&mut self) -> Result<()> {
        self.shared.ensure_open()?;
        let mut txn = self.shared.txn.lock();
        if txn.auto_commit {
            return Err(ProxyError::database_with_state(
                "Cannot commit when auto-commit is enabled",
                "25000",
            ));
        }
        txn.snapshot = None;
        txn.savepoints.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.shared.ensure_open()?;
        let mut txn = self.shared.txn.lock();
        if txn.auto_commit {
            return Err(ProxyError::database_with_state(
                "Cannot rollback when auto-commit is enabled",
                "25000",
            ));
        }
        if let Some(snapshot) = txn.snapshot.take() {
            *self.shared.db.write() = snapshot;
        }
        txn.savepoints.clear();
        Ok(())
    }

    async fn set_savepoint(&mut self, name: Option<&str>) -> Result<SavepointInfo> {
        self.shared.ensure_open()?;
        let mut txn = self.shared.txn.lock();
        if txn.auto_commit {
            return Err(ProxyError::database_with_state(
                "Savepoints require auto-commit to be disabled",
                "25000",
            ));
        }

        let db = self.shared.db.read();
        if txn.snapshot.is_none() {
            txn.snapshot = Some(db.clone());
        }

        let info = SavepointInfo {
            id: txn.next_savepoint,
            name: name.map(str::to_string),
        };
        txn.next_savepoint += 1;
        txn.savepoints.push((info.clone(), db.clone()));
        Ok(info)
    }

    async fn rollback_to_savepoint(&mut self, savepoint: &SavepointInfo) -> Result<()> {
        self.shared.ensure_open()?;
        let mut txn = self.shared.txn.lock();
        let pos = txn
            .savepoints
            .iter()
            .position(|(info, _)| info.id == savepoint.id)
            .ok_or_else(|| unknown_savepoint(savepoint))?;

        // The savepoint itself stays valid; later ones are discarded.
        txn.savepoints.truncate(pos + 1);
        let state = txn.savepoints[pos].1.clone();
        *self.shared.db.write() = state;
        Ok(())
    }

    async fn release_savepoint(&mut self, savepoint: &SavepointInfo) -> Result<()> {
        self.shared.ensure_open()?;
        let mut txn = self.shared.txn.lock();
        let pos = txn
            .savepoints
            .iter()
            .position(|(info, _)| info.id == savepoint.id)
            .ok_or_else(|| unknown_savepoint(savepoint))?;
        txn.savepoints.truncate(pos);
        Ok(())
    }

    async fn metadata(&mut self) -> Result<Box<dyn DriverMetaData>> {
        self.shared.ensure_open()?;
        Ok(Box::new(MemoryMetaData {
            shared: self.shared.clone(),
        }))
    }

    async fn set_read_only(&mut self, read_only: bool) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.txn.lock().read_only = read_only;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.shared.txn.lock().read_only
    }

    async fn set_transaction_isolation(&mut self, level: Isolation) -> Result<()> {
        self.shared.ensure_open()?;
        if level == Isolation::None {
            return Err(ProxyError::database_with_state(
                "Transactions cannot be disabled",
                "HY024",
            ));
        }
        self.shared.txn.lock().isolation = level;
        Ok(())
    }

    fn transaction_isolation(&self) -> Isolation {
        self.shared.txn.lock().isolation
    }

    async fn is_valid(&mut self) -> Result<bool> {
        Ok(!self.shared.txn.lock().closed)
    }

    async fn close(&mut self) -> Result<()> {
        let mut txn = self.shared.txn.lock();
        if txn.closed {
            return Ok(());
        }
        if let Some(snapshot) = txn.snapshot.take() {
            debug!("Rolling back open transaction on '{}' at close", self.shared.name);
            *self.shared.db.write() = snapshot;
        }
        txn.savepoints.clear();
        txn.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.txn.lock().closed
    }
}

fn unknown_savepoint(savepoint: &SavepointInfo) -> ProxyError {
    ProxyError::database_with_state(
        format!("Savepoint {} does not exist", savepoint.id),
        "3B001",
    )
}

pub struct MemoryMetaData {
    shared: Arc<Shared>,
}

#[async_trait]
impl DriverMetaData for MemoryMetaData {
    fn product_name(&self) -> String {
        "rustmemodb".to_string()
    }

    fn product_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn driver_name(&self) -> String {
        "memory".to_string()
    }

    async fn tables(&mut self, pattern: Option<&str>) -> Result<Box<dyn DriverResultSet>> {
        self.shared.ensure_open()?;
        let db = self.shared.db.read();
        let rows = db
            .tables
            .values()
            .filter(|t| pattern.map(|p| like(p, &t.name)).unwrap_or(true))
            .map(|t| vec![Value::Text(t.name.clone()), Value::Integer(t.columns.len() as i64)])
            .collect();

        Ok(Box::new(VecResultSet::new(
            vec![
                ColumnMeta::new("table_name", DataType::Text).not_null(),
                ColumnMeta::new("column_count", DataType::Integer).not_null(),
            ],
            rows,
        )))
    }

    async fn columns(&mut self, table: &str) -> Result<Box<dyn DriverResultSet>> {
        self.shared.ensure_open()?;
        let db = self.shared.db.read();
        let table = db
            .tables
            .get(&table.to_lowercase())
            .ok_or_else(|| ProxyError::database_with_state(format!("Table '{}' does not exist", table), "42P01"))?;

        let rows = table
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                vec![
                    Value::Text(c.name.clone()),
                    Value::Text(c.data_type.to_string()),
                    Value::Boolean(c.nullable),
                    Value::Integer(i as i64 + 1),
                ]
            })
            .collect();

        Ok(Box::new(VecResultSet::new(
            vec![
                ColumnMeta::new("column_name", DataType::Text).not_null(),
                ColumnMeta::new("type_name", DataType::Text).not_null(),
                ColumnMeta::new("nullable", DataType::Boolean).not_null(),
                ColumnMeta::new("ordinal_position", DataType::Integer).not_null(),
            ],
            rows,
        )))
    }
}

/// SQL `LIKE` matching with `%` and `_`, case-insensitive.
fn like(pattern: &str, text: &str) -> bool {
    fn go(p: &[char], t: &[char]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some(('%', rest)) => (0..=t.len()).any(|i| go(rest, &t[i..])),
            Some(('_', rest)) => !t.is_empty() && go(rest, &t[1..]),
            Some((c, rest)) => t
                .split_first()
                .map(|(tc, trest)| tc.eq_ignore_ascii_case(c) && go(rest, trest))
                .unwrap_or(false),
        }
    }

    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    go(&p, &t)
}
