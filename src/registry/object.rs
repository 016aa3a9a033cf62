use crate::core::{ObjectKind, ProxyError, Result, SavepointInfo};
use crate::driver::{
    CancelHandle, DriverConnection, DriverMetaData, DriverStatement, ScrollMode, StatementKind,
};
use crate::pagination::CursorHolder;
use crate::wire::ProxyEncoding;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobKind {
    Binary,
    Character,
}

/// Server-side large object created through the connection.
///
/// Offsets are 0-based byte positions; character objects hold UTF-8.
#[derive(Debug, Clone)]
pub struct LobBuffer {
    kind: LobKind,
    data: Vec<u8>,
}

impl LobBuffer {
    pub fn new(kind: LobKind) -> Self {
        Self {
            kind,
            data: Vec::new(),
        }
    }

    pub fn kind(&self) -> LobKind {
        self.kind
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let start = self.offset(pos)?;
        let end = start.saturating_add(len).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }

    /// Writes `bytes` at `pos`, growing the object as needed.
    pub fn write(&mut self, pos: u64, bytes: &[u8]) -> Result<usize> {
        let start = self.offset(pos)?;
        if self.kind == LobKind::Character && std::str::from_utf8(bytes).is_err() {
            return Err(ProxyError::database_with_state(
                "Character data must be valid UTF-8",
                "22021",
            ));
        }
        let end = start + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if len > self.len() {
            return Err(ProxyError::database_with_state(
                format!("Cannot truncate a {} byte object to {} bytes", self.len(), len),
                "22003",
            ));
        }
        self.data.truncate(len as usize);
        Ok(())
    }

    fn offset(&self, pos: u64) -> Result<usize> {
        if pos > self.len() {
            return Err(ProxyError::database_with_state(
                format!("Position {} is past the end ({} bytes)", pos, self.len()),
                "22003",
            ));
        }
        Ok(pos as usize)
    }
}

/// A live server-side object held in a session's registry.
pub enum RemoteObject {
    Connection(Box<dyn DriverConnection>),
    Statement {
        statement: Box<dyn DriverStatement>,
        scroll: ScrollMode,
    },
    MetaData(Box<dyn DriverMetaData>),
    Savepoint(SavepointInfo),
    Cursor(Arc<CursorHolder>),
    Lob(LobBuffer),
}

impl RemoteObject {
    /// Interface kind, inferred from what the object is.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Connection(_) => ObjectKind::Connection,
            Self::Statement { statement, .. } => match statement.kind() {
                StatementKind::Plain => ObjectKind::Statement,
                StatementKind::Prepared => ObjectKind::PreparedStatement,
                StatementKind::Callable => ObjectKind::CallableStatement,
            },
            Self::MetaData(_) => ObjectKind::MetaData,
            Self::Savepoint(_) => ObjectKind::Savepoint,
            Self::Cursor(_) => ObjectKind::Cursor,
            Self::Lob(lob) => match lob.kind() {
                LobKind::Binary => ObjectKind::Blob,
                LobKind::Character => ObjectKind::Clob,
            },
        }
    }

    pub fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>> {
        match self {
            Self::Statement { statement, .. } => Some(statement.cancel_handle()),
            _ => None,
        }
    }

    pub fn scroll_mode(&self) -> Option<ScrollMode> {
        match self {
            Self::Statement { scroll, .. } => Some(*scroll),
            _ => None,
        }
    }

    /// Special client-side representation, if the object declares one.
    pub fn proxy_encoding(&self) -> Option<ProxyEncoding> {
        match self {
            Self::Savepoint(info) => Some(ProxyEncoding::Savepoint(info.clone())),
            Self::MetaData(meta) => Some(ProxyEncoding::MetaData {
                product_name: meta.product_name(),
                product_version: meta.product_version(),
                driver_name: meta.driver_name(),
            }),
            _ => None,
        }
    }

    /// Scalars piggy-backed on the registration response: initial row
    /// limit and query timeout of a statement.
    pub fn initial_aux(&self) -> (Option<i64>, Option<i64>) {
        match self {
            Self::Statement { statement, .. } => (
                Some(statement.max_rows() as i64),
                Some(statement.query_timeout() as i64),
            ),
            _ => (None, None),
        }
    }

    /// Runs the object's close path. `Unsupported` means the object has no
    /// close operation and is tolerated by callers.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            Self::Connection(conn) => {
                if conn.is_closed() {
                    return Ok(());
                }
                conn.close().await
            }
            Self::Statement { statement, .. } => {
                if statement.is_closed() {
                    return Ok(());
                }
                statement.close().await
            }
            Self::MetaData(_) => Err(ProxyError::Unsupported("metadata cannot be closed".to_string())),
            Self::Savepoint(_) => Err(ProxyError::Unsupported("savepoints cannot be closed".to_string())),
            Self::Cursor(holder) => {
                holder.close().await;
                Ok(())
            }
            Self::Lob(lob) => {
                lob.data.clear();
                Ok(())
            }
        }
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteObject({})", self.kind())
    }
}
