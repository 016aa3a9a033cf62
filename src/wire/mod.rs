//! Wire format shared by the server bindings and the client transports.
//!
//! Every message is MessagePack (named fields) produced by `rmp-serde`.
//! Bulk payloads (row packets, large-object bytes) travel inside an
//! [`Envelope`] that compresses them above a size threshold.

mod envelope;

pub use envelope::{CompressionMode, CompressionSettings, DEFAULT_COMPRESSION_THRESHOLD, Envelope};

use crate::command::Command;
use crate::core::{
    ColumnMeta, DebugContext, ObjectKind, Properties, RemoteError, Result, SavepointInfo,
    SessionId, Uid, Value,
};
use crate::pagination::{MergeMode, RowPacket};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// One command addressed to one object of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub session_id: SessionId,
    /// `None` only for session-level commands such as `Ping`.
    pub object_id: Option<Uid>,
    pub command: Command,
    pub debug_context: Option<DebugContext>,
}

impl Request {
    pub fn new(session_id: SessionId, object_id: Option<Uid>, command: Command) -> Self {
        Self {
            session_id,
            object_id,
            command,
            debug_context: None,
        }
    }

    pub fn with_debug_context(mut self, context: Option<DebugContext>) -> Self {
        self.debug_context = context;
        self
    }
}

/// Client-side representation some objects declare for themselves, so that
/// cheap accessors do not need a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyEncoding {
    Savepoint(SavepointInfo),
    MetaData {
        product_name: String,
        product_version: String,
        driver_name: String,
    },
}

/// Reference to a newly registered server-side object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub uid: Uid,
    pub kind: ObjectKind,
    pub encoding: Option<ProxyEncoding>,
}

/// First packet of a query result, plus a handle on the remainder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorPage {
    /// `None` when the first packet already holds every row.
    pub holder: Option<RemoteRef>,
    pub columns: Vec<ColumnMeta>,
    pub packet: Envelope<RowPacket>,
    pub mode: MergeMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Unit,
    Value(Value),
    Values(Vec<Value>),
    Object(RemoteRef),
    Cursor(CursorPage),
    Packet(Envelope<RowPacket>),
    Bytes(Envelope<Vec<u8>>),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Value(_) => "value",
            Self::Values(_) => "values",
            Self::Object(_) => "object",
            Self::Cursor(_) => "cursor",
            Self::Packet(_) => "packet",
            Self::Bytes(_) => "bytes",
        }
    }
}

pub type Reply = std::result::Result<Response, RemoteError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Resource name, or a locator understood by a registered driver.
    pub resource: String,
    pub properties: Properties,
}

/// Per-session settings the client must honor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
    /// Attach a [`DebugContext`] to every request (expensive).
    pub debug_contexts: bool,
    /// Period of client keep-alive pings; 0 disables them.
    pub keep_alive_interval_ms: u64,
    pub row_packet_size: usize,
    pub charset: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub session_id: SessionId,
    pub root: RemoteRef,
    pub flags: SessionFlags,
}

pub type ConnectReply = std::result::Result<ConnectResponse, RemoteError>;
