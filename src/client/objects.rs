use super::{SessionHandle, StreamingCursor, expect_kind, value_to_u64};
use crate::command::Command;
use crate::core::{ObjectKind, ProxyError, Result, SavepointInfo, Uid};
use crate::wire::{ProxyEncoding, RemoteRef, Response};
use std::sync::Arc;

/// Database metadata. Product information comes with the registration
/// reply and needs no round trip.
pub struct RemoteMetaData {
    session: Arc<SessionHandle>,
    uid: Uid,
    product_name: String,
    product_version: String,
    driver_name: String,
}

impl RemoteMetaData {
    pub(crate) fn from_remote(session: Arc<SessionHandle>, remote: RemoteRef) -> Result<Self> {
        expect_kind(&remote, &[ObjectKind::MetaData])?;
        let Some(ProxyEncoding::MetaData {
            product_name,
            product_version,
            driver_name,
        }) = remote.encoding
        else {
            return Err(ProxyError::MalformedCommand(
                "metadata reply carries no product information".into(),
            ));
        };
        Ok(Self {
            session,
            uid: remote.uid.plain(),
            product_name,
            product_version,
            driver_name,
        })
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn product_version(&self) -> &str {
        &self.product_version
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Tables whose name matches the SQL LIKE `pattern`.
    pub async fn tables(&self, pattern: Option<&str>) -> Result<StreamingCursor> {
        let page = self
            .session
            .cursor(
                self.uid,
                Command::GetTables {
                    pattern: pattern.map(str::to_string),
                },
            )
            .await?;
        StreamingCursor::open(self.session.clone(), page)
    }

    pub async fn columns(&self, table: &str) -> Result<StreamingCursor> {
        let page = self
            .session
            .cursor(
                self.uid,
                Command::GetColumns {
                    table: table.to_string(),
                },
            )
            .await?;
        StreamingCursor::open(self.session.clone(), page)
    }

    pub async fn close(self) -> Result<()> {
        self.session.destroy(self.uid).await
    }
}

/// A savepoint; everything is known locally.
#[derive(Debug, Clone)]
pub struct RemoteSavepoint {
    uid: Uid,
    info: SavepointInfo,
}

impl RemoteSavepoint {
    pub(crate) fn from_remote(remote: RemoteRef) -> Result<Self> {
        expect_kind(&remote, &[ObjectKind::Savepoint])?;
        match remote.encoding {
            Some(ProxyEncoding::Savepoint(info)) => Ok(Self {
                uid: remote.uid.plain(),
                info,
            }),
            _ => Err(ProxyError::MalformedCommand(
                "savepoint reply carries no savepoint".into(),
            )),
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn info(&self) -> &SavepointInfo {
        &self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn name(&self) -> Option<&str> {
        self.info.name.as_deref()
    }
}

/// Server-side large object (blob or clob). Positions are 0-based.
pub struct RemoteLob {
    session: Arc<SessionHandle>,
    uid: Uid,
    kind: ObjectKind,
}

impl RemoteLob {
    pub(crate) fn new(session: Arc<SessionHandle>, remote: RemoteRef) -> Self {
        Self {
            session,
            uid: remote.uid.plain(),
            kind: remote.kind,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub async fn length(&self) -> Result<u64> {
        value_to_u64(self.session.value(self.uid, Command::LobLength).await?)
    }

    pub async fn read(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        match self
            .session
            .send(Some(self.uid), Command::LobRead { pos, len })
            .await?
        {
            Response::Bytes(envelope) => envelope.into_inner(),
            other => Err(ProxyError::MalformedCommand(format!(
                "expected bytes reply, got {}",
                other.name()
            ))),
        }
    }

    pub async fn read_string(&self, pos: u64, len: usize) -> Result<String> {
        String::from_utf8(self.read(pos, len).await?)
            .map_err(|e| ProxyError::Codec(format!("clob is not valid UTF-8: {}", e)))
    }

    /// Writes `data` at `pos`, growing the object. Returns bytes written.
    pub async fn write(&self, pos: u64, data: &[u8]) -> Result<u64> {
        value_to_u64(
            self.session
                .value(
                    self.uid,
                    Command::LobWrite {
                        pos,
                        data: data.to_vec(),
                    },
                )
                .await?,
        )
    }

    pub async fn write_str(&self, pos: u64, text: &str) -> Result<u64> {
        self.write(pos, text.as_bytes()).await
    }

    pub async fn truncate(&self, len: u64) -> Result<()> {
        self.session.unit(self.uid, Command::LobTruncate { len }).await
    }

    /// Releases the object on the server.
    pub async fn free(self) -> Result<()> {
        self.session.destroy(self.uid).await
    }
}
