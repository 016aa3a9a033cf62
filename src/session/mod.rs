//! One logical client connection: the real database connection, the
//! registry of every object the client caused to exist, and the lock that
//! serializes command execution.

mod stats;

pub use stats::SessionStats;

use crate::command::{Command, CommandContext, CursorPolicy, Outcome};
use crate::config::ResourceConfig;
use crate::core::{DebugContext, ObjectKind, ProxyError, Result, SessionId, Uid, UidGenerator};
use crate::driver::{DriverConnection, DriverResultSet, ScrollMode};
use crate::filter::QueryFilter;
use crate::pagination::{CursorHolder, MergeMode, PaginationSettings, RowSource};
use crate::pool::{ConnectionPool, Lease};
use crate::registry::{ObjectRegistry, RemoteObject, SharedObject};
use crate::wire::{CompressionSettings, CursorPage, Envelope, RemoteRef, Response, SessionFlags};
use crate::worker::WorkerPool;
use log::{debug, info, warn};
use parking_lot::Mutex as SyncMutex;
use stats::Activity;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{Instrument, Level, event, info_span};

/// Per-session settings resolved from the resource configuration at
/// connect time.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub resource: String,
    pub pagination: PaginationSettings,
    pub compression: CompressionSettings,
    pub filter: QueryFilter,
    pub command_stats: bool,
    pub flags: SessionFlags,
}

impl SessionSettings {
    pub fn from_resource(resource: &ResourceConfig, keep_alive_interval_ms: u64) -> Result<Self> {
        Ok(Self {
            resource: resource.name.clone(),
            pagination: resource.pagination(),
            compression: resource.compression_settings(),
            filter: QueryFilter::new(&resource.allow, &resource.deny)?,
            command_stats: resource.command_stats,
            flags: SessionFlags {
                debug_contexts: resource.debug_contexts,
                keep_alive_interval_ms,
                row_packet_size: resource.row_packet_size,
                charset: resource.charset.clone(),
            },
        })
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        let resource = ResourceConfig::default();
        Self {
            resource: String::new(),
            pagination: resource.pagination(),
            compression: resource.compression_settings(),
            filter: QueryFilter::permissive(),
            command_stats: false,
            flags: SessionFlags {
                debug_contexts: false,
                keep_alive_interval_ms: 0,
                row_packet_size: resource.row_packet_size,
                charset: resource.charset,
            },
        }
    }
}

/// Where the root connection goes when the session ends.
pub enum ConnectionOrigin {
    Direct,
    Pooled(Arc<ConnectionPool>, Lease),
}

/// Result of an attempt to reclaim an idle session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Reclaimed,
    /// A command is executing.
    Active,
    /// Idle for less than the timeout.
    Fresh,
    /// The execution lock was taken between the check and the close; try
    /// again on the next sweep.
    Deferred,
}

/// Clears the active flag when a command finishes, however it finishes.
struct ActiveGuard<'a>(&'a AtomicBool);

impl<'a> ActiveGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Session {
    id: SessionId,
    root: Uid,
    registry: ObjectRegistry,
    exec_lock: Mutex<()>,
    active: AtomicBool,
    activity: Activity,
    settings: SessionSettings,
    workers: WorkerPool,
    origin: SyncMutex<Option<ConnectionOrigin>>,
}

impl Session {
    /// Wraps a freshly opened connection, registering it as the root object.
    pub fn new(
        connection: Box<dyn DriverConnection>,
        origin: ConnectionOrigin,
        settings: SessionSettings,
        workers: WorkerPool,
        uids: Arc<UidGenerator>,
        created_by: Option<DebugContext>,
    ) -> Self {
        let id = SessionId::new();
        let registry = ObjectRegistry::new(uids);
        let root = registry.register(RemoteObject::Connection(connection), created_by);
        info!("Session {} opened on '{}' (root {})", id, settings.resource, root);

        Self {
            id,
            root,
            registry,
            exec_lock: Mutex::new(()),
            active: AtomicBool::new(false),
            activity: Activity::new(settings.command_stats),
            settings,
            workers,
            origin: SyncMutex::new(Some(origin)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn root(&self) -> RemoteRef {
        RemoteRef {
            uid: self.root,
            kind: ObjectKind::Connection,
            encoding: None,
        }
    }

    pub fn flags(&self) -> &SessionFlags {
        &self.settings.flags
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// True once every object, the root connection included, is gone.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    pub fn stats(&self) -> SessionStats {
        self.activity.snapshot(
            self.id,
            &self.settings.resource,
            self.is_active(),
            self.registry.len(),
        )
    }

    /// Runs one command against one registered object.
    ///
    /// Commands are serialized per session, except `Cancel`, which goes
    /// straight to the target's cancel handle.
    pub async fn execute_command(
        &self,
        object_id: Option<Uid>,
        command: Command,
        debug_context: Option<DebugContext>,
    ) -> Result<Response> {
        if command.is_cancel() {
            return self.cancel(object_id);
        }

        let span = info_span!(
            "session.command",
            session = %self.id,
            object = %object_id.map(|u| u.to_string()).unwrap_or_default(),
            command = command.name()
        );
        async move {
            let _exec = self.exec_lock.lock().await;
            let _active = ActiveGuard::enter(&self.active);
            self.activity.record(command.name());

            let result = self.dispatch(object_id, &command, debug_context).await;
            self.activity.touch();
            if let Err(err) = &result {
                event!(Level::WARN, error = %err, "command failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &self,
        object_id: Option<Uid>,
        command: &Command,
        debug_context: Option<DebugContext>,
    ) -> Result<Response> {
        if matches!(command, Command::Ping) {
            return Ok(Response::Unit);
        }
        let uid = object_id.ok_or_else(|| {
            ProxyError::MalformedCommand(format!("{} needs a target object", command.name()))
        })?;

        if command.is_destroy() {
            return self.destroy(uid).await.map(|_| Response::Unit);
        }
        if let Some(sql) = command.sql() {
            self.settings.filter.check(sql)?;
        }

        let Some((object, kind)) = self.registry.get(uid) else {
            warn!("Session {}: {} addressed to missing object {}", self.id, command, uid);
            return Err(ProxyError::ObjectNotFound(uid.value()));
        };

        let ctx = CommandContext {
            session_id: self.id,
            object_id: uid,
            debug_context: debug_context.clone(),
        };
        let (outcome, scroll) = {
            let mut target = object.lock().await;
            let outcome = command.execute(&mut target, &ctx).await?;
            (outcome, target.scroll_mode())
        };

        let response = self.respond(outcome, command, scroll, debug_context).await?;
        if kind == ObjectKind::Cursor {
            if let Response::Packet(packet) = &response {
                if packet.unwrap()?.last_part() {
                    debug!("Session {}: cursor {} drained", self.id, uid);
                    self.registry.remove(uid);
                }
            }
        }
        Ok(response)
    }

    async fn respond(
        &self,
        outcome: Outcome,
        command: &Command,
        scroll: Option<ScrollMode>,
        debug_context: Option<DebugContext>,
    ) -> Result<Response> {
        match outcome {
            Outcome::Unit => Ok(Response::Unit),
            Outcome::Value(value) => Ok(Response::Value(value)),
            Outcome::Values(values) => Ok(Response::Values(values)),
            Outcome::Object(object) => Ok(Response::Object(self.register(object, debug_context))),
            Outcome::ResultSet(result_set) => {
                let mode = match scroll {
                    Some(ScrollMode::Scrollable) => MergeMode::Scroll,
                    _ => MergeMode::Forward,
                };
                let page = match command.cursor_policy() {
                    CursorPolicy::Materialize => self.materialize(result_set, mode).await?,
                    CursorPolicy::Stream => self.stream(result_set, mode, debug_context).await?,
                };
                Ok(Response::Cursor(page))
            }
            Outcome::Packet(packet) => Ok(Response::Packet(Envelope::wrap(
                packet,
                &self.settings.compression,
            )?)),
            Outcome::Bytes(bytes) => Ok(Response::Bytes(Envelope::wrap(
                bytes,
                &self.settings.compression,
            )?)),
        }
    }

    fn register(&self, object: RemoteObject, created_by: Option<DebugContext>) -> RemoteRef {
        let kind = object.kind();
        let encoding = object.proxy_encoding();
        let (aux_1, aux_2) = object.initial_aux();
        let uid = self.registry.register(object, created_by).with_aux(aux_1, aux_2);
        RemoteRef {
            uid,
            kind,
            encoding,
        }
    }

    async fn stream(
        &self,
        result_set: Box<dyn DriverResultSet>,
        mode: MergeMode,
        debug_context: Option<DebugContext>,
    ) -> Result<CursorPage> {
        let (columns, first, holder) =
            CursorHolder::open(result_set, &self.settings.pagination, self.workers.clone()).await?;
        let holder =
            holder.map(|h| self.register(RemoteObject::Cursor(Arc::new(h)), debug_context));
        Ok(CursorPage {
            holder,
            columns,
            packet: Envelope::wrap(first, &self.settings.compression)?,
            mode,
        })
    }

    /// Drains a result set into one last packet.
    async fn materialize(
        &self,
        result_set: Box<dyn DriverResultSet>,
        mode: MergeMode,
    ) -> Result<CursorPage> {
        let mut source = RowSource::new(result_set);
        let columns = source.columns().to_vec();
        let packet = match source.next_packet(usize::MAX).await {
            Ok(packet) => packet,
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        };
        Ok(CursorPage {
            holder: None,
            columns,
            packet: Envelope::wrap(packet, &self.settings.compression)?,
            mode,
        })
    }

    /// Cancels the statement `object_id` without waiting for the execution
    /// lock, so a command blocked inside the database can be interrupted.
    pub fn cancel(&self, object_id: Option<Uid>) -> Result<Response> {
        let uid = object_id
            .ok_or_else(|| ProxyError::MalformedCommand("cancel needs a target object".into()))?;
        self.activity.record(Command::Cancel.name());

        match self.registry.canceller(uid) {
            Some(handle) => {
                debug!("Session {}: cancelling {}", self.id, uid);
                handle.cancel();
                Ok(Response::Unit)
            }
            None => match self.registry.kind(uid) {
                Some(kind) => Err(ProxyError::NotApplicable {
                    command: Command::Cancel.name().to_string(),
                    kind: kind.to_string(),
                }),
                None => Err(ProxyError::ObjectNotFound(uid.value())),
            },
        }
    }

    async fn destroy(&self, uid: Uid) -> Result<()> {
        if uid == self.root {
            return self.shutdown().await;
        }
        match self.registry.remove(uid) {
            Some(entry) => {
                let mut object = entry.object().lock().await;
                close_tolerant(&mut object).await
            }
            None => {
                debug!("Session {}: {} already destroyed", self.id, uid);
                Ok(())
            }
        }
    }

    /// Closes every object, then gives the root connection back to its
    /// pool or closes it. Safe to call more than once.
    async fn shutdown(&self) -> Result<()> {
        for uid in self.registry.keys() {
            if uid == self.root {
                continue;
            }
            if let Some(entry) = self.registry.remove(uid) {
                let mut object = entry.object().lock().await;
                if let Err(e) = close_tolerant(&mut object).await {
                    warn!("Session {}: closing {} failed: {}", self.id, uid, e);
                }
            }
        }

        let Some(entry) = self.registry.remove(self.root) else {
            return Ok(());
        };
        let origin = self.origin.lock().take();
        let object = take_object(entry.into_object()).await;

        let result = match (object, origin) {
            (Some(RemoteObject::Connection(connection)), Some(ConnectionOrigin::Pooled(pool, lease))) => {
                pool.release(connection, lease).await;
                Ok(())
            }
            (Some(mut object), _) => close_tolerant(&mut object).await,
            // Closed in place by take_object.
            (None, Some(ConnectionOrigin::Pooled(pool, lease))) => {
                pool.discard(lease);
                Ok(())
            }
            (None, _) => Ok(()),
        };
        info!("Session {} closed", self.id);
        result
    }

    /// Closes the session, waiting for the command in flight to finish.
    pub async fn close(&self) -> Result<()> {
        let _exec = self.exec_lock.lock().await;
        self.shutdown().await
    }

    /// Closes the session if nothing is executing and it has been idle for
    /// longer than `timeout`.
    pub async fn try_close_idle(&self, timeout: Duration) -> Result<ReclaimOutcome> {
        if self.is_active() {
            return Ok(ReclaimOutcome::Active);
        }
        if self.idle_for() <= timeout {
            return Ok(ReclaimOutcome::Fresh);
        }
        let Ok(_exec) = self.exec_lock.try_lock() else {
            return Ok(ReclaimOutcome::Deferred);
        };
        info!(
            "Reclaiming session {} idle for {}ms",
            self.id,
            self.idle_for().as_millis()
        );
        self.shutdown()
            .await
            .map_err(|e| ProxyError::Reclamation(format!("session {}: {}", self.id, e)))?;
        Ok(ReclaimOutcome::Reclaimed)
    }
}

/// Runs an object's close path, tolerating objects that cannot be closed.
async fn close_tolerant(object: &mut RemoteObject) -> Result<()> {
    match object.close().await {
        Err(e) if e.is_unsupported() => Ok(()),
        other => other,
    }
}

/// Takes sole ownership of a removed object. Falls back to closing it in
/// place when another task still holds a reference.
async fn take_object(shared: SharedObject) -> Option<RemoteObject> {
    match Arc::try_unwrap(shared) {
        Ok(mutex) => Some(mutex.into_inner()),
        Err(shared) => {
            let mut object = shared.lock().await;
            if let Err(e) = close_tolerant(&mut object).await {
                warn!("Closing shared {:?} failed: {}", *object, e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Properties;
    use crate::driver::Driver;
    use crate::driver::memory::MemoryDriver;

    async fn session(settings: SessionSettings) -> Session {
        let driver = MemoryDriver::new();
        let conn = driver.connect("memory:session", &Properties::new()).await.unwrap();
        Session::new(
            conn,
            ConnectionOrigin::Direct,
            settings,
            WorkerPool::new(4),
            Arc::new(UidGenerator::new()),
            None,
        )
    }

    fn object(response: Response) -> RemoteRef {
        match response {
            Response::Object(r) => r,
            other => panic!("expected object, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_statement_registration_carries_aux() {
        let session = session(SessionSettings::default()).await;
        let root = session.root().uid;

        let stmt = object(
            session
                .execute_command(Some(root), Command::CreateStatement { scroll: ScrollMode::ForwardOnly }, None)
                .await
                .unwrap(),
        );
        assert_eq!(stmt.kind, ObjectKind::Statement);
        assert_eq!(stmt.uid.aux(), (Some(0), Some(0)));
        assert_eq!(session.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_object_and_idempotent_destroy() {
        let session = session(SessionSettings::default()).await;
        let ghost = Some(Uid::new(9_999));

        let err = session
            .execute_command(ghost, Command::GetMaxRows, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ObjectNotFound(9_999)));
        assert!(session.execute_command(ghost, Command::Destroy, None).await.is_ok());
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_filter_rejects_denied_sql() {
        let mut settings = SessionSettings::default();
        settings.filter = QueryFilter::new(&[], &["(?i)drop".to_string()]).unwrap();
        let session = session(settings).await;
        let root = Some(session.root().uid);

        let err = session
            .execute_command(root, Command::NativeSql { sql: "DROP TABLE t".into() }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_root_destroy_cascades() {
        let mut settings = SessionSettings::default();
        settings.command_stats = true;
        let session = session(settings).await;
        let root = Some(session.root().uid);

        let meta = object(session.execute_command(root, Command::GetMetaData, None).await.unwrap());
        assert!(meta.encoding.is_some());
        session.execute_command(root, Command::CreateBlob, None).await.unwrap();
        assert_eq!(session.registry().len(), 3);

        session.execute_command(root, Command::Destroy, None).await.unwrap();
        assert!(session.is_empty());
        assert!(session.execute_command(root, Command::Destroy, None).await.is_ok());

        let stats = session.stats();
        assert_eq!(stats.per_command.get("get_meta_data"), Some(&1));
        assert_eq!(stats.objects, 0);
    }

    #[tokio::test]
    async fn test_try_close_idle() {
        let session = session(SessionSettings::default()).await;
        assert_eq!(
            session.try_close_idle(Duration::from_secs(60)).await.unwrap(),
            ReclaimOutcome::Fresh
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            session.try_close_idle(Duration::from_millis(5)).await.unwrap(),
            ReclaimOutcome::Reclaimed
        );
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_shared_pooled_root_gives_up_its_lease() {
        let pool = Arc::new(
            ConnectionPool::new(
                crate::config::PoolConfig {
                    enabled: true,
                    min_connections: 0,
                    max_connections: 1,
                    acquire_timeout_ms: 100,
                    ..Default::default()
                },
                Arc::new(MemoryDriver::new()),
                "memory:shared-root",
                Properties::new(),
            )
            .await
            .unwrap(),
        );
        let (conn, lease) = pool.acquire().await.unwrap();
        let session = Session::new(
            conn,
            ConnectionOrigin::Pooled(pool.clone(), lease),
            SessionSettings::default(),
            WorkerPool::new(4),
            Arc::new(UidGenerator::new()),
            None,
        );

        // Something still holds the root connection while the session closes.
        let (held, _) = session.registry().get(session.root().uid).unwrap();
        session.close().await.unwrap();
        assert!(matches!(&*held.lock().await, RemoteObject::Connection(c) if c.is_closed()));

        assert_eq!(pool.stats().await.total_connections, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_ping_without_object() {
        let session = session(SessionSettings::default()).await;
        assert!(matches!(
            session.execute_command(None, Command::Ping, None).await.unwrap(),
            Response::Unit
        ));
        let err = session
            .execute_command(None, Command::GetAutoCommit, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::MalformedCommand(_)));
    }
}
