//! Client-side proxies.
//!
//! Every call becomes a [`Command`] addressed to a remote object and travels
//! through a [`Transport`]. Clients only ever hold opaque identifiers.

mod connection;
mod cursor;
mod keep_alive;
mod objects;
mod statement;
mod transport;

pub use connection::RemoteConnection;
pub use cursor::{FromValue, StreamingCursor};
pub use keep_alive::KeepAlive;
pub use objects::{RemoteLob, RemoteMetaData, RemoteSavepoint};
pub use statement::{RemoteStatement, StatementCanceller};
pub use transport::{HttpTransport, LocalTransport, Transport};

use crate::command::Command;
use crate::core::{DebugContext, ObjectKind, ProxyError, Result, SessionId, Uid, Value};
use crate::wire::{CursorPage, RemoteRef, Request, Response, SessionFlags};
use std::sync::Arc;

/// What every proxy of one session shares.
pub(crate) struct SessionHandle {
    transport: Arc<dyn Transport>,
    session_id: SessionId,
    flags: SessionFlags,
}

impl SessionHandle {
    pub(crate) async fn send(&self, object: Option<Uid>, command: Command) -> Result<Response> {
        let debug_context = self
            .flags
            .debug_contexts
            .then(|| DebugContext::capture(command.name()));
        let request = Request::new(self.session_id, object.map(|u| u.plain()), command)
            .with_debug_context(debug_context);
        self.transport.send(request).await
    }

    pub(crate) async fn unit(&self, object: Uid, command: Command) -> Result<()> {
        expect_unit(self.send(Some(object), command).await?)
    }

    pub(crate) async fn value(&self, object: Uid, command: Command) -> Result<Value> {
        expect_value(self.send(Some(object), command).await?)
    }

    pub(crate) async fn object(&self, object: Uid, command: Command) -> Result<RemoteRef> {
        expect_object(self.send(Some(object), command).await?)
    }

    pub(crate) async fn cursor(&self, object: Uid, command: Command) -> Result<CursorPage> {
        expect_cursor(self.send(Some(object), command).await?)
    }

    /// Destroys a remote object. Already-destroyed objects are fine.
    pub(crate) async fn destroy(&self, object: Uid) -> Result<()> {
        self.unit(object, Command::Destroy).await
    }
}

fn unexpected(expected: &str, got: &Response) -> ProxyError {
    ProxyError::MalformedCommand(format!("expected {} reply, got {}", expected, got.name()))
}

pub(crate) fn expect_unit(response: Response) -> Result<()> {
    match response {
        Response::Unit => Ok(()),
        other => Err(unexpected("unit", &other)),
    }
}

pub(crate) fn expect_value(response: Response) -> Result<Value> {
    match response {
        Response::Value(value) => Ok(value),
        other => Err(unexpected("value", &other)),
    }
}

pub(crate) fn expect_object(response: Response) -> Result<RemoteRef> {
    match response {
        Response::Object(remote) => Ok(remote),
        other => Err(unexpected("object", &other)),
    }
}

pub(crate) fn expect_cursor(response: Response) -> Result<CursorPage> {
    match response {
        Response::Cursor(page) => Ok(page),
        other => Err(unexpected("cursor", &other)),
    }
}

pub(crate) fn expect_kind(remote: &RemoteRef, accepted: &[ObjectKind]) -> Result<()> {
    if accepted.contains(&remote.kind) {
        Ok(())
    } else {
        Err(ProxyError::MalformedCommand(format!(
            "server returned a {} where {:?} was expected",
            remote.kind, accepted
        )))
    }
}

pub(crate) fn value_to_bool(value: Value) -> Result<bool> {
    match value {
        Value::Boolean(b) => Ok(b),
        other => Err(ProxyError::MalformedCommand(format!(
            "expected a boolean, got {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn value_to_u64(value: Value) -> Result<u64> {
    match value.as_i64() {
        Some(n) if n >= 0 => Ok(n as u64),
        _ => Err(ProxyError::MalformedCommand(format!(
            "expected a non-negative integer, got {}",
            value.type_name()
        ))),
    }
}
