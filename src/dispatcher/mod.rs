//! Process-wide session directory.
//!
//! One `Dispatcher` is built at process start and handed to every server
//! binding; `shutdown` closes whatever sessions remain.

mod reclaim;

pub use reclaim::IdleReclaimer;

use crate::command::Command;
use crate::config::{ResourceConfig, ServerConfig};
use crate::core::{DebugContext, Properties, ProxyError, Result, SessionId, Uid, UidGenerator};
use crate::driver::{Driver, DriverRegistry};
use crate::pool::{ConnectionPool, PoolStats};
use crate::session::{ConnectionOrigin, ReclaimOutcome, Session, SessionSettings, SessionStats};
use crate::wire::{ConnectReply, ConnectRequest, ConnectResponse, Reply, Request, Response};
use crate::worker::WorkerPool;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Tally of one idle sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub reclaimed: usize,
    pub active: usize,
    pub deferred: usize,
}

pub struct Dispatcher {
    config: ServerConfig,
    drivers: DriverRegistry,
    sessions: DashMap<SessionId, Arc<Session>>,
    pools: DashMap<String, Arc<ConnectionPool>>,
    uids: Arc<UidGenerator>,
    workers: WorkerPool,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: ServerConfig, drivers: DriverRegistry) -> Result<Self> {
        config.validate()?;
        let workers = WorkerPool::new(config.max_prefetch_tasks);
        Ok(Self {
            config,
            drivers,
            sessions: DashMap::new(),
            pools: DashMap::new(),
            uids: Arc::new(UidGenerator::new()),
            workers,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Opens a session on the resource named (or located) by the request.
    pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProxyError::Closed("dispatcher is shut down".into()));
        }

        let resource = self.config.lookup(&request.resource);
        let settings = SessionSettings::from_resource(&resource, self.config.keep_alive_interval_ms)?;
        let driver = self.drivers.find(&resource.locator).ok_or_else(|| {
            ProxyError::Config(format!("no driver accepts locator '{}'", resource.locator))
        })?;

        let (connection, origin) = if resource.pool.enabled {
            let pool = self.pool_for(&resource, driver).await?;
            let (connection, lease) = pool.acquire().await?;
            (connection, ConnectionOrigin::Pooled(pool, lease))
        } else {
            let properties = merge_properties(&resource.properties, &request.properties);
            let connection = driver.connect(&resource.locator, &properties).await?;
            (connection, ConnectionOrigin::Direct)
        };

        let session = Arc::new(Session::new(
            connection,
            origin,
            settings,
            self.workers.clone(),
            self.uids.clone(),
            None,
        ));
        let response = ConnectResponse {
            session_id: session.id(),
            root: session.root(),
            flags: session.flags().clone(),
        };
        self.sessions.insert(session.id(), session);
        Ok(response)
    }

    async fn pool_for(&self, resource: &ResourceConfig, driver: Arc<dyn Driver>) -> Result<Arc<ConnectionPool>> {
        if let Some(pool) = self.pools.get(&resource.name) {
            return Ok(pool.clone());
        }

        let created = Arc::new(
            ConnectionPool::new(
                resource.pool.clone(),
                driver,
                &resource.locator,
                resource.properties.clone(),
            )
            .await?,
        );
        let pool = self
            .pools
            .entry(resource.name.clone())
            .or_insert_with(|| created.clone())
            .clone();
        if !Arc::ptr_eq(&pool, &created) {
            created.close_idle().await;
        } else {
            info!("Created connection pool for '{}'", resource.name);
        }
        Ok(pool)
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_stats(&self) -> Vec<SessionStats> {
        let mut stats: Vec<SessionStats> = self.sessions.iter().map(|s| s.stats()).collect();
        stats.sort_by_key(|s| s.created_at);
        stats
    }

    pub async fn pool_stats(&self) -> Vec<(String, PoolStats)> {
        let pools: Vec<(String, Arc<ConnectionPool>)> = self
            .pools
            .iter()
            .map(|p| (p.key().clone(), p.value().clone()))
            .collect();
        let mut out = Vec::with_capacity(pools.len());
        for (name, pool) in pools {
            out.push((name, pool.stats().await));
        }
        out
    }

    /// Routes one command to its session.
    pub async fn execute(
        &self,
        session_id: SessionId,
        object_id: Option<Uid>,
        command: Command,
        debug_context: Option<DebugContext>,
    ) -> Result<Response> {
        let session = self
            .session(session_id)
            .ok_or_else(|| ProxyError::UnknownSession(session_id.to_string()))?;

        let result = session.execute_command(object_id, command, debug_context).await;
        if session.is_empty() && self.sessions.remove_if(&session_id, |_, s| s.is_empty()).is_some() {
            debug!("Session {} removed from the directory", session_id);
        }
        result
    }

    /// Like [`Dispatcher::execute`], with the error normalized for the wire.
    pub async fn handle(&self, request: Request) -> Reply {
        self.execute(
            request.session_id,
            request.object_id,
            request.command,
            request.debug_context,
        )
        .await
        .map_err(Into::into)
    }

    pub async fn handle_connect(&self, request: ConnectRequest) -> ConnectReply {
        self.connect(request).await.map_err(Into::into)
    }

    /// Closes and removes every inactive session idle for longer than the
    /// configured timeout. A session that starts executing in the meantime
    /// is left for the next sweep.
    pub async fn sweep_idle(&self) -> Result<SweepReport> {
        let timeout = self.config.session_idle_timeout();
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|s| s.value().clone()).collect();
        let mut report = SweepReport::default();

        for session in sessions {
            report.examined += 1;
            let outcome = session.try_close_idle(timeout).await;
            match outcome {
                Ok(ReclaimOutcome::Reclaimed) => {
                    self.sessions.remove(&session.id());
                    report.reclaimed += 1;
                }
                Ok(ReclaimOutcome::Active) => report.active += 1,
                Ok(ReclaimOutcome::Deferred) => {
                    debug!("Session {} became busy during the sweep; deferred", session.id());
                    report.deferred += 1;
                }
                Ok(ReclaimOutcome::Fresh) => {}
                Err(e) => {
                    self.sessions.remove(&session.id());
                    return Err(e);
                }
            }
        }

        if report.reclaimed > 0 {
            info!("Idle sweep reclaimed {} of {} sessions", report.reclaimed, report.examined);
        }
        Ok(report)
    }

    /// Closes every session and idle pooled connection. Later connects fail.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| *s.key()).collect();
        info!("Shutting down {} sessions", ids.len());

        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                if let Err(e) = session.close().await {
                    warn!("Closing session {} failed: {}", id, e);
                }
            }
        }

        let pools: Vec<Arc<ConnectionPool>> = self.pools.iter().map(|p| p.value().clone()).collect();
        self.pools.clear();
        for pool in pools {
            pool.close_idle().await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) && !self.sessions.is_empty() {
            error!(
                "Dispatcher dropped with {} open sessions; call shutdown() first",
                self.sessions.len()
            );
        }
    }
}

/// Client properties override resource properties.
fn merge_properties(base: &Properties, overrides: &Properties) -> Properties {
    let mut merged = base.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
