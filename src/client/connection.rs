use super::{
    KeepAlive, RemoteLob, RemoteMetaData, RemoteSavepoint, RemoteStatement, SessionHandle,
    Transport, expect_kind, value_to_bool,
};
use crate::command::Command;
use crate::core::{ObjectKind, Properties, ProxyError, Result, SessionId, Uid, Value};
use crate::driver::{Isolation, ScrollMode};
use crate::wire::{ConnectRequest, SessionFlags};
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// Client view of a database connection living in a remote session.
pub struct RemoteConnection {
    session: Arc<SessionHandle>,
    root: Uid,
    closed: bool,
}

impl RemoteConnection {
    /// Opens a session on `resource`, a configured resource name or a
    /// driver locator.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        resource: &str,
        properties: Properties,
    ) -> Result<Self> {
        let response = transport
            .connect(ConnectRequest {
                resource: resource.to_string(),
                properties,
            })
            .await?;
        debug!("Connected to {} as session {}", resource, response.session_id);

        Ok(Self {
            session: Arc::new(SessionHandle {
                transport,
                session_id: response.session_id,
                flags: response.flags,
            }),
            root: response.root.uid,
            closed: false,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session.session_id
    }

    pub fn flags(&self) -> &SessionFlags {
        &self.session.flags
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ProxyError::Closed("connection is closed".into()));
        }
        Ok(())
    }

    async fn unit(&self, command: Command) -> Result<()> {
        self.ensure_open()?;
        self.session.unit(self.root, command).await
    }

    async fn value(&self, command: Command) -> Result<Value> {
        self.ensure_open()?;
        self.session.value(self.root, command).await
    }

    pub async fn create_statement(&self) -> Result<RemoteStatement> {
        self.create_statement_with(ScrollMode::ForwardOnly).await
    }

    pub async fn create_statement_with(&self, scroll: ScrollMode) -> Result<RemoteStatement> {
        self.ensure_open()?;
        let remote = self
            .session
            .object(self.root, Command::CreateStatement { scroll })
            .await?;
        expect_kind(&remote, &[ObjectKind::Statement])?;
        Ok(RemoteStatement::new(self.session.clone(), remote))
    }

    pub async fn prepare_statement(&self, sql: &str) -> Result<RemoteStatement> {
        self.prepare_statement_with(sql, ScrollMode::ForwardOnly).await
    }

    pub async fn prepare_statement_with(&self, sql: &str, scroll: ScrollMode) -> Result<RemoteStatement> {
        self.ensure_open()?;
        let remote = self
            .session
            .object(
                self.root,
                Command::PrepareStatement {
                    sql: sql.to_string(),
                    scroll,
                },
            )
            .await?;
        expect_kind(&remote, &[ObjectKind::PreparedStatement])?;
        Ok(RemoteStatement::new(self.session.clone(), remote))
    }

    pub async fn prepare_call(&self, sql: &str) -> Result<RemoteStatement> {
        self.ensure_open()?;
        let remote = self
            .session
            .object(self.root, Command::PrepareCall { sql: sql.to_string() })
            .await?;
        expect_kind(&remote, &[ObjectKind::CallableStatement])?;
        Ok(RemoteStatement::new(self.session.clone(), remote))
    }

    pub async fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.unit(Command::SetAutoCommit { enabled }).await
    }

    pub async fn auto_commit(&self) -> Result<bool> {
        value_to_bool(self.value(Command::GetAutoCommit).await?)
    }

    pub async fn commit(&self) -> Result<()> {
        self.unit(Command::Commit).await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.unit(Command::Rollback).await
    }

    pub async fn set_savepoint(&self, name: Option<&str>) -> Result<RemoteSavepoint> {
        self.ensure_open()?;
        let remote = self
            .session
            .object(
                self.root,
                Command::SetSavepoint {
                    name: name.map(str::to_string),
                },
            )
            .await?;
        RemoteSavepoint::from_remote(remote)
    }

    pub async fn rollback_to_savepoint(&self, savepoint: &RemoteSavepoint) -> Result<()> {
        self.unit(Command::RollbackToSavepoint {
            savepoint: savepoint.info().clone(),
        })
        .await
    }

    /// Releases the savepoint and forgets its remote handle.
    pub async fn release_savepoint(&self, savepoint: RemoteSavepoint) -> Result<()> {
        self.unit(Command::ReleaseSavepoint {
            savepoint: savepoint.info().clone(),
        })
        .await?;
        self.session.destroy(savepoint.uid()).await
    }

    pub async fn metadata(&self) -> Result<RemoteMetaData> {
        self.ensure_open()?;
        let remote = self.session.object(self.root, Command::GetMetaData).await?;
        RemoteMetaData::from_remote(self.session.clone(), remote)
    }

    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.unit(Command::SetReadOnly { read_only }).await
    }

    pub async fn is_read_only(&self) -> Result<bool> {
        value_to_bool(self.value(Command::IsReadOnly).await?)
    }

    pub async fn set_transaction_isolation(&self, level: Isolation) -> Result<()> {
        self.unit(Command::SetTransactionIsolation { level }).await
    }

    pub async fn transaction_isolation(&self) -> Result<Isolation> {
        let value = self.value(Command::GetTransactionIsolation).await?;
        value
            .as_i64()
            .and_then(Isolation::from_code)
            .ok_or_else(|| ProxyError::MalformedCommand(format!("unknown isolation level {}", value)))
    }

    pub async fn is_valid(&self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        value_to_bool(self.value(Command::IsValid).await?)
    }

    pub async fn native_sql(&self, sql: &str) -> Result<String> {
        match self.value(Command::NativeSql { sql: sql.to_string() }).await? {
            Value::Text(text) => Ok(text),
            other => Err(ProxyError::MalformedCommand(format!(
                "expected text, got {}",
                other.type_name()
            ))),
        }
    }

    pub async fn create_blob(&self) -> Result<RemoteLob> {
        self.create_lob(Command::CreateBlob, ObjectKind::Blob).await
    }

    pub async fn create_clob(&self) -> Result<RemoteLob> {
        self.create_lob(Command::CreateClob, ObjectKind::Clob).await
    }

    async fn create_lob(&self, command: Command, kind: ObjectKind) -> Result<RemoteLob> {
        self.ensure_open()?;
        let remote = self.session.object(self.root, command).await?;
        expect_kind(&remote, &[kind])?;
        Ok(RemoteLob::new(self.session.clone(), remote))
    }

    /// Round trip that only refreshes the session's idle clock.
    pub async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        super::expect_unit(self.session.send(None, Command::Ping).await?)
    }

    /// Starts pinging at the interval the server asked for, or at `fallback`
    /// when the server disabled keep-alive.
    pub fn start_keep_alive(&self, fallback: Option<Duration>) -> Option<KeepAlive> {
        let interval = match self.session.flags.keep_alive_interval_ms {
            0 => fallback?,
            ms => Duration::from_millis(ms),
        };
        Some(KeepAlive::spawn(self.session.clone(), interval))
    }

    /// Destroys the session: every object it created is closed on the
    /// server, then the connection itself.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.destroy(self.root).await
    }
}
