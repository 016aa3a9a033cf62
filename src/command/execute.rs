use super::{Command, CommandContext, Outcome};
use crate::core::{ProxyError, Result, Value};
use crate::registry::{LobBuffer, LobKind, RemoteObject};
use log::trace;

impl Command {
    /// Applies the command to `target`.
    ///
    /// `Destroy` and `Cancel` are normally intercepted by the session, which
    /// needs to act on the registry; executing them here only touches the
    /// object itself.
    pub async fn execute(&self, target: &mut RemoteObject, ctx: &CommandContext) -> Result<Outcome> {
        let kind = target.kind();
        if !self.target().accepts(kind) {
            return Err(ProxyError::NotApplicable {
                command: self.name().to_string(),
                kind: kind.to_string(),
            });
        }
        trace!("{} executing {} on {}", ctx.session_id, self, ctx.object_id);

        match (self, target) {
            (Command::Ping, _) => Ok(Outcome::Unit),
            (Command::Destroy, object) => {
                object.close().await?;
                Ok(Outcome::Unit)
            }
            (Command::Cancel, object) => {
                if let Some(handle) = object.cancel_handle() {
                    handle.cancel();
                }
                Ok(Outcome::Unit)
            }

            (cmd, RemoteObject::Connection(conn)) => match cmd {
                Command::CreateStatement { scroll } => Ok(Outcome::Object(RemoteObject::Statement {
                    statement: conn.create_statement(*scroll).await?,
                    scroll: *scroll,
                })),
                Command::PrepareStatement { sql, scroll } => Ok(Outcome::Object(RemoteObject::Statement {
                    statement: conn.prepare_statement(sql, *scroll).await?,
                    scroll: *scroll,
                })),
                Command::PrepareCall { sql } => Ok(Outcome::Object(RemoteObject::Statement {
                    statement: conn.prepare_call(sql).await?,
                    scroll: Default::default(),
                })),
                Command::SetAutoCommit { enabled } => {
                    conn.set_auto_commit(*enabled).await?;
                    Ok(Outcome::Unit)
                }
                Command::GetAutoCommit => Ok(Outcome::Value(Value::Boolean(conn.auto_commit()))),
                Command::Commit => {
                    conn.commit().await?;
                    Ok(Outcome::Unit)
                }
                Command::Rollback => {
                    conn.rollback().await?;
                    Ok(Outcome::Unit)
                }
                Command::SetSavepoint { name } => {
                    let info = conn.set_savepoint(name.as_deref()).await?;
                    Ok(Outcome::Object(RemoteObject::Savepoint(info)))
                }
                Command::RollbackToSavepoint { savepoint } => {
                    conn.rollback_to_savepoint(savepoint).await?;
                    Ok(Outcome::Unit)
                }
                Command::ReleaseSavepoint { savepoint } => {
                    conn.release_savepoint(savepoint).await?;
                    Ok(Outcome::Unit)
                }
                Command::GetMetaData => Ok(Outcome::Object(RemoteObject::MetaData(conn.metadata().await?))),
                Command::SetReadOnly { read_only } => {
                    conn.set_read_only(*read_only).await?;
                    Ok(Outcome::Unit)
                }
                Command::IsReadOnly => Ok(Outcome::Value(Value::Boolean(conn.is_read_only()))),
                Command::SetTransactionIsolation { level } => {
                    conn.set_transaction_isolation(*level).await?;
                    Ok(Outcome::Unit)
                }
                Command::GetTransactionIsolation => Ok(Outcome::Value(Value::Integer(
                    conn.transaction_isolation().code(),
                ))),
                Command::IsValid => Ok(Outcome::Value(Value::Boolean(conn.is_valid().await?))),
                Command::NativeSql { sql } => Ok(Outcome::Value(Value::Text(conn.native_sql(sql).await?))),
                Command::CreateBlob => Ok(Outcome::Object(RemoteObject::Lob(LobBuffer::new(LobKind::Binary)))),
                Command::CreateClob => Ok(Outcome::Object(RemoteObject::Lob(LobBuffer::new(LobKind::Character)))),
                other => Err(unreachable_target(other)),
            },

            (cmd, RemoteObject::Statement { statement, .. }) => match cmd {
                Command::ExecuteQuery { sql } => {
                    Ok(Outcome::ResultSet(statement.execute_query(sql.as_deref()).await?))
                }
                Command::ExecuteUpdate { sql } => {
                    let count = statement.execute_update(sql.as_deref()).await?;
                    Ok(Outcome::Value(Value::Integer(count as i64)))
                }
                Command::Execute { sql } => {
                    let has_result = statement.execute(sql.as_deref()).await?;
                    Ok(Outcome::Value(Value::Boolean(has_result)))
                }
                Command::GetResultSet => match statement.take_result_set().await? {
                    Some(rs) => Ok(Outcome::ResultSet(rs)),
                    None => Ok(Outcome::Value(Value::Null)),
                },
                Command::GetUpdateCount => Ok(Outcome::Value(
                    statement
                        .update_count()
                        .map(|c| Value::Integer(c as i64))
                        .unwrap_or(Value::Null),
                )),
                Command::SetMaxRows { rows } => {
                    statement.set_max_rows(*rows);
                    Ok(Outcome::Unit)
                }
                Command::GetMaxRows => Ok(Outcome::Value(Value::Integer(statement.max_rows() as i64))),
                Command::SetQueryTimeout { secs } => {
                    statement.set_query_timeout(*secs);
                    Ok(Outcome::Unit)
                }
                Command::GetQueryTimeout => Ok(Outcome::Value(Value::Integer(
                    statement.query_timeout() as i64,
                ))),
                Command::SetFetchSize { rows } => {
                    statement.set_fetch_size(*rows);
                    Ok(Outcome::Unit)
                }
                Command::AddBatch { sql } => {
                    statement.add_batch(sql.as_deref()).await?;
                    Ok(Outcome::Unit)
                }
                Command::ClearBatch => {
                    statement.clear_batch().await?;
                    Ok(Outcome::Unit)
                }
                Command::ExecuteBatch => {
                    let counts = statement.execute_batch().await?;
                    Ok(Outcome::Values(
                        counts.into_iter().map(|c| Value::Integer(c as i64)).collect(),
                    ))
                }
                Command::GetGeneratedKeys => Ok(Outcome::ResultSet(statement.generated_keys().await?)),
                Command::SetParameter { index, value } => {
                    statement.set_parameter(*index, value.clone()).await?;
                    Ok(Outcome::Unit)
                }
                Command::ClearParameters => {
                    statement.clear_parameters().await?;
                    Ok(Outcome::Unit)
                }
                Command::RegisterOutParameter { index, data_type } => {
                    statement.register_out_parameter(*index, *data_type).await?;
                    Ok(Outcome::Unit)
                }
                Command::GetOutParameter { index } => {
                    Ok(Outcome::Value(statement.out_parameter(*index).await?))
                }
                other => Err(unreachable_target(other)),
            },

            (Command::NextPacket, RemoteObject::Cursor(holder)) => {
                Ok(Outcome::Packet(holder.next_packet().await?))
            }

            (cmd, RemoteObject::MetaData(meta)) => match cmd {
                Command::GetDatabaseProductName => Ok(Outcome::Value(Value::Text(meta.product_name()))),
                Command::GetDatabaseProductVersion => {
                    Ok(Outcome::Value(Value::Text(meta.product_version())))
                }
                Command::GetDriverName => Ok(Outcome::Value(Value::Text(meta.driver_name()))),
                Command::GetTables { pattern } => Ok(Outcome::ResultSet(meta.tables(pattern.as_deref()).await?)),
                Command::GetColumns { table } => Ok(Outcome::ResultSet(meta.columns(table).await?)),
                other => Err(unreachable_target(other)),
            },

            (cmd, RemoteObject::Lob(lob)) => match cmd {
                Command::LobLength => Ok(Outcome::Value(Value::Integer(lob.len() as i64))),
                Command::LobRead { pos, len } => Ok(Outcome::Bytes(lob.read(*pos, *len)?)),
                Command::LobWrite { pos, data } => {
                    let written = lob.write(*pos, data)?;
                    Ok(Outcome::Value(Value::Integer(written as i64)))
                }
                Command::LobTruncate { len } => {
                    lob.truncate(*len)?;
                    Ok(Outcome::Unit)
                }
                other => Err(unreachable_target(other)),
            },

            (cmd, object) => Err(ProxyError::NotApplicable {
                command: cmd.name().to_string(),
                kind: object.kind().to_string(),
            }),
        }
    }
}

fn unreachable_target(cmd: &Command) -> ProxyError {
    ProxyError::MalformedCommand(format!("{} routed to the wrong object kind", cmd.name()))
}
