pub mod error;
pub mod types;
pub mod value;

pub use error::{ErrorCode, ErrorKind, ProxyError, RemoteError, Result};
pub use types::{
    ColumnMeta, DebugContext, ObjectKind, Properties, Row, SavepointInfo, SessionId, Uid,
    UidGenerator, find_column,
};
pub use value::{DataType, Value};
