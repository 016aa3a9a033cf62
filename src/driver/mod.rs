//! Database-client boundary.
//!
//! The proxy never talks to a database directly: every session owns one
//! [`DriverConnection`] obtained from a [`Driver`], and every command ends up
//! as a call on one of the traits below. The shape mirrors a synchronous,
//! stateful JDBC-style API (connections, statements, result sets, metadata,
//! savepoints), exposed as async traits so a long-running call does not pin
//! a runtime thread.

pub mod memory;

use crate::core::{ColumnMeta, DataType, Properties, Result, Row, SavepointInfo, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Entry point of a database client library.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this driver understands the given locator.
    fn accepts(&self, locator: &str) -> bool;

    async fn connect(&self, locator: &str, props: &Properties) -> Result<Box<dyn DriverConnection>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ScrollMode {
    #[default]
    ForwardOnly,
    Scrollable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Isolation {
    None,
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    /// Numeric level as exposed by JDBC-style APIs.
    pub fn code(&self) -> i64 {
        match self {
            Self::None => 0,
            Self::ReadUncommitted => 1,
            Self::ReadCommitted => 2,
            Self::RepeatableRead => 4,
            Self::Serializable => 8,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::ReadUncommitted),
            2 => Some(Self::ReadCommitted),
            4 => Some(Self::RepeatableRead),
            8 => Some(Self::Serializable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementKind {
    Plain,
    Prepared,
    Callable,
}

/// A live connection to the database. Owned by exactly one session.
#[async_trait]
pub trait DriverConnection: Send {
    async fn create_statement(&mut self, scroll: ScrollMode) -> Result<Box<dyn DriverStatement>>;

    async fn prepare_statement(
        &mut self,
        sql: &str,
        scroll: ScrollMode,
    ) -> Result<Box<dyn DriverStatement>>;

    async fn prepare_call(&mut self, sql: &str) -> Result<Box<dyn DriverStatement>>;

    async fn set_auto_commit(&mut self, enabled: bool) -> Result<()>;

    fn auto_commit(&self) -> bool;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn set_savepoint(&mut self, name: Option<&str>) -> Result<SavepointInfo>;

    async fn rollback_to_savepoint(&mut self, savepoint: &SavepointInfo) -> Result<()>;

    async fn release_savepoint(&mut self, savepoint: &SavepointInfo) -> Result<()>;

    async fn metadata(&mut self) -> Result<Box<dyn DriverMetaData>>;

    async fn set_read_only(&mut self, read_only: bool) -> Result<()>;

    fn is_read_only(&self) -> bool;

    async fn set_transaction_isolation(&mut self, level: Isolation) -> Result<()>;

    fn transaction_isolation(&self) -> Isolation;

    async fn native_sql(&mut self, sql: &str) -> Result<String> {
        Ok(sql.to_string())
    }

    async fn is_valid(&mut self) -> Result<bool>;

    async fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Result of a generic `execute`.
pub enum ExecuteResult {
    ResultSet(Box<dyn DriverResultSet>),
    UpdateCount(u64),
}

/// Plain, prepared or callable statement.
///
/// Methods taking `sql: Option<&str>` execute the given text for plain
/// statements and the prepared text (with bound parameters) when `None`.
#[async_trait]
pub trait DriverStatement: Send {
    fn kind(&self) -> StatementKind;

    async fn execute_query(&mut self, sql: Option<&str>) -> Result<Box<dyn DriverResultSet>>;

    async fn execute_update(&mut self, sql: Option<&str>) -> Result<u64>;

    /// Returns true when the execution produced a result set.
    async fn execute(&mut self, sql: Option<&str>) -> Result<bool>;

    /// Result set of the last `execute`, taken at most once.
    async fn take_result_set(&mut self) -> Result<Option<Box<dyn DriverResultSet>>>;

    fn update_count(&self) -> Option<u64>;

    async fn set_parameter(&mut self, index: usize, value: Value) -> Result<()>;

    async fn clear_parameters(&mut self) -> Result<()>;

    async fn add_batch(&mut self, sql: Option<&str>) -> Result<()>;

    async fn clear_batch(&mut self) -> Result<()>;

    async fn execute_batch(&mut self) -> Result<Vec<u64>>;

    async fn generated_keys(&mut self) -> Result<Box<dyn DriverResultSet>>;

    fn set_max_rows(&mut self, rows: u64);

    fn max_rows(&self) -> u64;

    fn set_query_timeout(&mut self, secs: u64);

    fn query_timeout(&self) -> u64;

    fn set_fetch_size(&mut self, rows: u64);

    async fn register_out_parameter(&mut self, index: usize, data_type: DataType) -> Result<()>;

    async fn out_parameter(&mut self, index: usize) -> Result<Value>;

    /// Handle usable from another task while this statement is busy.
    fn cancel_handle(&self) -> Arc<dyn CancelHandle>;

    async fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// A forward-only stream of rows.
#[async_trait]
pub trait DriverResultSet: Send {
    fn columns(&self) -> &[ColumnMeta];

    async fn next_row(&mut self) -> Result<Option<Row>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait DriverMetaData: Send {
    fn product_name(&self) -> String;

    fn product_version(&self) -> String;

    fn driver_name(&self) -> String;

    async fn tables(&mut self, pattern: Option<&str>) -> Result<Box<dyn DriverResultSet>>;

    async fn columns(&mut self, table: &str) -> Result<Box<dyn DriverResultSet>>;
}

pub trait CancelHandle: Send + Sync {
    fn cancel(&self);
}

/// Result set over rows that are already in memory.
pub struct VecResultSet {
    columns: Vec<ColumnMeta>,
    rows: std::vec::IntoIter<Row>,
    closed: bool,
}

impl VecResultSet {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
            closed: false,
        }
    }
}

#[async_trait]
impl DriverResultSet for VecResultSet {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rows.next())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Registered drivers, consulted in registration order.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.push(driver);
    }

    pub fn with(mut self, driver: Arc<dyn Driver>) -> Self {
        self.register(driver);
        self
    }

    pub fn find(&self, locator: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.iter().find(|d| d.accepts(locator)).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }
}
