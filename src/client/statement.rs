use super::{SessionHandle, StreamingCursor, value_to_bool, value_to_u64};
use crate::command::Command;
use crate::core::{DataType, ObjectKind, ProxyError, Result, Uid, Value};
use crate::wire::{RemoteRef, Response};
use std::sync::Arc;

/// Handle that cancels a statement from another task while it executes.
#[derive(Clone)]
pub struct StatementCanceller {
    session: Arc<SessionHandle>,
    uid: Uid,
}

impl StatementCanceller {
    pub async fn cancel(&self) -> Result<()> {
        self.session.unit(self.uid, Command::Cancel).await
    }
}

/// Client view of a plain, prepared or callable statement.
///
/// Row limit and query timeout arrive with the registration reply and are
/// cached, so reading them costs no round trip.
pub struct RemoteStatement {
    session: Arc<SessionHandle>,
    uid: Uid,
    kind: ObjectKind,
    max_rows: u64,
    query_timeout: u64,
    closed: bool,
}

impl RemoteStatement {
    pub(crate) fn new(session: Arc<SessionHandle>, remote: RemoteRef) -> Self {
        let mut uid = remote.uid;
        let (max_rows, query_timeout) = uid.take_aux();
        Self {
            session,
            uid,
            kind: remote.kind,
            max_rows: max_rows.unwrap_or(0).max(0) as u64,
            query_timeout: query_timeout.unwrap_or(0).max(0) as u64,
            closed: false,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn canceller(&self) -> StatementCanceller {
        StatementCanceller {
            session: self.session.clone(),
            uid: self.uid,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ProxyError::Closed(format!("statement {} is closed", self.uid)));
        }
        Ok(())
    }

    async fn unit(&self, command: Command) -> Result<()> {
        self.ensure_open()?;
        self.session.unit(self.uid, command).await
    }

    async fn value(&self, command: Command) -> Result<Value> {
        self.ensure_open()?;
        self.session.value(self.uid, command).await
    }

    async fn query(&self, sql: Option<&str>) -> Result<StreamingCursor> {
        self.ensure_open()?;
        let page = self
            .session
            .cursor(
                self.uid,
                Command::ExecuteQuery {
                    sql: sql.map(str::to_string),
                },
            )
            .await?;
        StreamingCursor::open(self.session.clone(), page)
    }

    async fn update(&self, sql: Option<&str>) -> Result<u64> {
        value_to_u64(
            self.value(Command::ExecuteUpdate {
                sql: sql.map(str::to_string),
            })
            .await?,
        )
    }

    async fn run(&self, sql: Option<&str>) -> Result<bool> {
        value_to_bool(
            self.value(Command::Execute {
                sql: sql.map(str::to_string),
            })
            .await?,
        )
    }

    pub async fn execute_query(&self, sql: &str) -> Result<StreamingCursor> {
        self.query(Some(sql)).await
    }

    pub async fn execute_update(&self, sql: &str) -> Result<u64> {
        self.update(Some(sql)).await
    }

    /// Returns true when the statement produced a result set.
    pub async fn execute(&self, sql: &str) -> Result<bool> {
        self.run(Some(sql)).await
    }

    /// Runs the prepared SQL with the parameters bound so far.
    pub async fn execute_prepared_query(&self) -> Result<StreamingCursor> {
        self.query(None).await
    }

    pub async fn execute_prepared_update(&self) -> Result<u64> {
        self.update(None).await
    }

    pub async fn execute_prepared(&self) -> Result<bool> {
        self.run(None).await
    }

    /// Result set left by the last `execute`, if any.
    pub async fn result_set(&self) -> Result<Option<StreamingCursor>> {
        self.ensure_open()?;
        match self.session.send(Some(self.uid), Command::GetResultSet).await? {
            Response::Cursor(page) => Ok(Some(StreamingCursor::open(self.session.clone(), page)?)),
            Response::Value(Value::Null) => Ok(None),
            other => Err(ProxyError::MalformedCommand(format!(
                "expected cursor reply, got {}",
                other.name()
            ))),
        }
    }

    pub async fn update_count(&self) -> Result<Option<u64>> {
        match self.value(Command::GetUpdateCount).await? {
            Value::Null => Ok(None),
            other => value_to_u64(other).map(Some),
        }
    }

    pub async fn set_max_rows(&mut self, rows: u64) -> Result<()> {
        self.unit(Command::SetMaxRows { rows }).await?;
        self.max_rows = rows;
        Ok(())
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    pub async fn set_query_timeout(&mut self, secs: u64) -> Result<()> {
        self.unit(Command::SetQueryTimeout { secs }).await?;
        self.query_timeout = secs;
        Ok(())
    }

    pub fn query_timeout(&self) -> u64 {
        self.query_timeout
    }

    pub async fn set_fetch_size(&self, rows: u64) -> Result<()> {
        self.unit(Command::SetFetchSize { rows }).await
    }

    pub async fn add_batch(&self, sql: &str) -> Result<()> {
        self.unit(Command::AddBatch {
            sql: Some(sql.to_string()),
        })
        .await
    }

    /// Queues the currently bound parameters of a prepared statement.
    pub async fn add_prepared_batch(&self) -> Result<()> {
        self.unit(Command::AddBatch { sql: None }).await
    }

    pub async fn clear_batch(&self) -> Result<()> {
        self.unit(Command::ClearBatch).await
    }

    pub async fn execute_batch(&self) -> Result<Vec<u64>> {
        self.ensure_open()?;
        match self.session.send(Some(self.uid), Command::ExecuteBatch).await? {
            Response::Values(values) => values.into_iter().map(value_to_u64).collect(),
            other => Err(ProxyError::MalformedCommand(format!(
                "expected values reply, got {}",
                other.name()
            ))),
        }
    }

    pub async fn generated_keys(&self) -> Result<StreamingCursor> {
        self.ensure_open()?;
        let page = self.session.cursor(self.uid, Command::GetGeneratedKeys).await?;
        StreamingCursor::open(self.session.clone(), page)
    }

    /// Binds parameter `index` (1-based).
    pub async fn set_parameter(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.unit(Command::SetParameter {
            index,
            value: value.into(),
        })
        .await
    }

    pub async fn set_null(&self, index: usize) -> Result<()> {
        self.set_parameter(index, Value::Null).await
    }

    pub async fn clear_parameters(&self) -> Result<()> {
        self.unit(Command::ClearParameters).await
    }

    pub async fn register_out_parameter(&self, index: usize, data_type: DataType) -> Result<()> {
        self.unit(Command::RegisterOutParameter { index, data_type }).await
    }

    pub async fn out_parameter(&self, index: usize) -> Result<Value> {
        self.value(Command::GetOutParameter { index }).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.canceller().cancel().await
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.destroy(self.uid).await
    }
}
