
// ============================================================================
// RustMemDB Remote: command-based proxy for database connections
// ============================================================================

pub mod core;
pub mod driver;
pub mod command;
pub mod registry;
pub mod pagination;
pub mod worker;
pub mod wire;
pub mod config;
pub mod filter;
pub mod pool;
pub mod session;
pub mod dispatcher;
pub mod server;
pub mod client;

// Re-export main types for convenience
pub use core::{DataType, ErrorCode, ErrorKind, ProxyError, RemoteError, Result, SessionId, Uid, Value};
pub use command::Command;
pub use config::{PoolConfig, ResourceConfig, ServerConfig};
pub use dispatcher::{Dispatcher, IdleReclaimer, SweepReport};
pub use driver::{Driver, DriverRegistry, ScrollMode};
pub use driver::memory::MemoryDriver;
pub use session::{Session, SessionStats};
pub use wire::{CompressionMode, Envelope};

// Re-export client API
pub use client::{
    HttpTransport, KeepAlive, LocalTransport, RemoteConnection, RemoteStatement,
    StreamingCursor, Transport,
};

// ============================================================================
// Convenience
// ============================================================================

/// Driver registry with every driver built into this crate.
///
/// # Examples
///
/// ```
/// use rustmemodb_remote::{Dispatcher, LocalTransport, RemoteConnection, ServerConfig};
/// use rustmemodb_remote::default_drivers;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let dispatcher = Arc::new(Dispatcher::new(ServerConfig::default(), default_drivers())?);
/// let transport = Arc::new(LocalTransport::new(dispatcher.clone()));
///
/// let mut conn = RemoteConnection::connect(transport, "memory:demo", Default::default()).await?;
/// let stmt = conn.create_statement().await?;
/// stmt.execute_update("CREATE TABLE users (id INTEGER, name TEXT)").await?;
/// stmt.execute_update("INSERT INTO users VALUES (1, 'Alice')").await?;
///
/// let mut rows = stmt.execute_query("SELECT name FROM users").await?;
/// while rows.next().await? {
///     println!("{:?}", rows.get_string(1)?);
/// }
/// conn.close().await?;
/// dispatcher.shutdown().await;
/// # Ok::<(), rustmemodb_remote::ProxyError>(())
/// # }).unwrap();
/// ```
pub fn default_drivers() -> DriverRegistry {
    DriverRegistry::new().with(std::sync::Arc::new(MemoryDriver::new()))
}
