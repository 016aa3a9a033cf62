//! Commands: one serializable variant per remote operation.
//!
//! A command names the operation and carries its arguments; executing it
//! against a registered object is a pure function of that object, the
//! arguments and the [`CommandContext`].

mod execute;

use crate::core::{DataType, DebugContext, ObjectKind, SavepointInfo, SessionId, Uid, Value};
use crate::driver::{DriverResultSet, Isolation, ScrollMode};
use crate::pagination::RowPacket;
use crate::registry::RemoteObject;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    // Session level
    Ping,
    Destroy,
    Cancel,

    // Connection
    CreateStatement { scroll: ScrollMode },
    PrepareStatement { sql: String, scroll: ScrollMode },
    PrepareCall { sql: String },
    SetAutoCommit { enabled: bool },
    GetAutoCommit,
    Commit,
    Rollback,
    SetSavepoint { name: Option<String> },
    RollbackToSavepoint { savepoint: SavepointInfo },
    ReleaseSavepoint { savepoint: SavepointInfo },
    GetMetaData,
    SetReadOnly { read_only: bool },
    IsReadOnly,
    SetTransactionIsolation { level: Isolation },
    GetTransactionIsolation,
    IsValid,
    NativeSql { sql: String },
    CreateBlob,
    CreateClob,

    // Statement (plain, prepared and callable)
    ExecuteQuery { sql: Option<String> },
    ExecuteUpdate { sql: Option<String> },
    Execute { sql: Option<String> },
    GetResultSet,
    GetUpdateCount,
    SetMaxRows { rows: u64 },
    GetMaxRows,
    SetQueryTimeout { secs: u64 },
    GetQueryTimeout,
    SetFetchSize { rows: u64 },
    AddBatch { sql: Option<String> },
    ClearBatch,
    ExecuteBatch,
    GetGeneratedKeys,

    // Prepared and callable statements
    SetParameter { index: usize, value: Value },
    ClearParameters,

    // Callable statements
    RegisterOutParameter { index: usize, data_type: DataType },
    GetOutParameter { index: usize },

    // Cursor holder
    NextPacket,

    // Database metadata
    GetDatabaseProductName,
    GetDatabaseProductVersion,
    GetDriverName,
    GetTables { pattern: Option<String> },
    GetColumns { table: String },

    // Large objects
    LobLength,
    LobRead { pos: u64, len: usize },
    LobWrite { pos: u64, data: Vec<u8> },
    LobTruncate { len: u64 },
}

/// What kind of object a command can be applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The session itself; no object id required.
    Session,
    /// Any registered object.
    Any,
    Connection,
    /// Plain, prepared or callable statement.
    Statement,
    /// Prepared or callable statement.
    Prepared,
    Callable,
    Cursor,
    MetaData,
    Lob,
}

impl Target {
    pub fn accepts(&self, kind: ObjectKind) -> bool {
        match self {
            Self::Session | Self::Any => true,
            Self::Connection => kind == ObjectKind::Connection,
            Self::Statement => kind.is_statement(),
            Self::Prepared => matches!(
                kind,
                ObjectKind::PreparedStatement | ObjectKind::CallableStatement
            ),
            Self::Callable => kind == ObjectKind::CallableStatement,
            Self::Cursor => kind == ObjectKind::Cursor,
            Self::MetaData => kind == ObjectKind::MetaData,
            Self::Lob => matches!(kind, ObjectKind::Blob | ObjectKind::Clob),
        }
    }
}

/// How a cursor-shaped result of a command is sent back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPolicy {
    /// Through the pagination engine.
    Stream,
    /// Drained into a single final packet; used for small, bounded results.
    Materialize,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Destroy => "destroy",
            Self::Cancel => "cancel",
            Self::CreateStatement { .. } => "create_statement",
            Self::PrepareStatement { .. } => "prepare_statement",
            Self::PrepareCall { .. } => "prepare_call",
            Self::SetAutoCommit { .. } => "set_auto_commit",
            Self::GetAutoCommit => "get_auto_commit",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::SetSavepoint { .. } => "set_savepoint",
            Self::RollbackToSavepoint { .. } => "rollback_to_savepoint",
            Self::ReleaseSavepoint { .. } => "release_savepoint",
            Self::GetMetaData => "get_meta_data",
            Self::SetReadOnly { .. } => "set_read_only",
            Self::IsReadOnly => "is_read_only",
            Self::SetTransactionIsolation { .. } => "set_transaction_isolation",
            Self::GetTransactionIsolation => "get_transaction_isolation",
            Self::IsValid => "is_valid",
            Self::NativeSql { .. } => "native_sql",
            Self::CreateBlob => "create_blob",
            Self::CreateClob => "create_clob",
            Self::ExecuteQuery { .. } => "execute_query",
            Self::ExecuteUpdate { .. } => "execute_update",
            Self::Execute { .. } => "execute",
            Self::GetResultSet => "get_result_set",
            Self::GetUpdateCount => "get_update_count",
            Self::SetMaxRows { .. } => "set_max_rows",
            Self::GetMaxRows => "get_max_rows",
            Self::SetQueryTimeout { .. } => "set_query_timeout",
            Self::GetQueryTimeout => "get_query_timeout",
            Self::SetFetchSize { .. } => "set_fetch_size",
            Self::AddBatch { .. } => "add_batch",
            Self::ClearBatch => "clear_batch",
            Self::ExecuteBatch => "execute_batch",
            Self::GetGeneratedKeys => "get_generated_keys",
            Self::SetParameter { .. } => "set_parameter",
            Self::ClearParameters => "clear_parameters",
            Self::RegisterOutParameter { .. } => "register_out_parameter",
            Self::GetOutParameter { .. } => "get_out_parameter",
            Self::NextPacket => "next_packet",
            Self::GetDatabaseProductName => "get_database_product_name",
            Self::GetDatabaseProductVersion => "get_database_product_version",
            Self::GetDriverName => "get_driver_name",
            Self::GetTables { .. } => "get_tables",
            Self::GetColumns { .. } => "get_columns",
            Self::LobLength => "lob_length",
            Self::LobRead { .. } => "lob_read",
            Self::LobWrite { .. } => "lob_write",
            Self::LobTruncate { .. } => "lob_truncate",
        }
    }

    pub fn target(&self) -> Target {
        match self {
            Self::Ping => Target::Session,
            Self::Destroy => Target::Any,
            Self::Cancel => Target::Statement,

            Self::CreateStatement { .. }
            | Self::PrepareStatement { .. }
            | Self::PrepareCall { .. }
            | Self::SetAutoCommit { .. }
            | Self::GetAutoCommit
            | Self::Commit
            | Self::Rollback
            | Self::SetSavepoint { .. }
            | Self::RollbackToSavepoint { .. }
            | Self::ReleaseSavepoint { .. }
            | Self::GetMetaData
            | Self::SetReadOnly { .. }
            | Self::IsReadOnly
            | Self::SetTransactionIsolation { .. }
            | Self::GetTransactionIsolation
            | Self::IsValid
            | Self::NativeSql { .. }
            | Self::CreateBlob
            | Self::CreateClob => Target::Connection,

            Self::ExecuteQuery { .. }
            | Self::ExecuteUpdate { .. }
            | Self::Execute { .. }
            | Self::GetResultSet
            | Self::GetUpdateCount
            | Self::SetMaxRows { .. }
            | Self::GetMaxRows
            | Self::SetQueryTimeout { .. }
            | Self::GetQueryTimeout
            | Self::SetFetchSize { .. }
            | Self::AddBatch { .. }
            | Self::ClearBatch
            | Self::ExecuteBatch
            | Self::GetGeneratedKeys => Target::Statement,

            Self::SetParameter { .. } | Self::ClearParameters => Target::Prepared,

            Self::RegisterOutParameter { .. } | Self::GetOutParameter { .. } => Target::Callable,

            Self::NextPacket => Target::Cursor,

            Self::GetDatabaseProductName
            | Self::GetDatabaseProductVersion
            | Self::GetDriverName
            | Self::GetTables { .. }
            | Self::GetColumns { .. } => Target::MetaData,

            Self::LobLength | Self::LobRead { .. } | Self::LobWrite { .. } | Self::LobTruncate { .. } => {
                Target::Lob
            }
        }
    }

    /// SQL text carried by the command, subject to query filtering.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::PrepareStatement { sql, .. } | Self::PrepareCall { sql } | Self::NativeSql { sql } => {
                Some(sql)
            }
            Self::ExecuteQuery { sql } | Self::ExecuteUpdate { sql } | Self::Execute { sql } | Self::AddBatch { sql } => {
                sql.as_deref()
            }
            _ => None,
        }
    }

    pub fn cursor_policy(&self) -> CursorPolicy {
        match self {
            Self::GetGeneratedKeys | Self::GetTables { .. } | Self::GetColumns { .. } => {
                CursorPolicy::Materialize
            }
            _ => CursorPolicy::Stream,
        }
    }

    pub fn is_destroy(&self) -> bool {
        matches!(self, Self::Destroy)
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sql() {
            Some(sql) => write!(f, "{}({})", self.name(), sql),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// Ambient information available to a command while it executes.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub session_id: SessionId,
    pub object_id: Uid,
    pub debug_context: Option<DebugContext>,
}

/// Raw result of executing a command, before the session classifies it.
pub enum Outcome {
    Unit,
    Value(Value),
    Values(Vec<Value>),
    /// A new stateful object that must outlive this call.
    Object(RemoteObject),
    /// A cursor-shaped result.
    ResultSet(Box<dyn DriverResultSet>),
    Packet(RowPacket),
    Bytes(Vec<u8>),
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "Unit"),
            Self::Value(v) => write!(f, "Value({:?})", v),
            Self::Values(v) => write!(f, "Values({:?})", v),
            Self::Object(o) => write!(f, "Object({})", o.kind()),
            Self::ResultSet(rs) => write!(f, "ResultSet({} columns)", rs.columns().len()),
            Self::Packet(p) => write!(f, "Packet({} rows)", p.row_count()),
            Self::Bytes(b) => write!(f, "Bytes({})", b.len()),
        }
    }
}
