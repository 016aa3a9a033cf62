use crate::core::SessionId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Activity bookkeeping of one session.
pub(crate) struct Activity {
    created_at: DateTime<Utc>,
    last_access: Mutex<(Instant, DateTime<Utc>)>,
    commands: AtomicU64,
    per_command: Option<DashMap<&'static str, u64>>,
}

impl Activity {
    pub(crate) fn new(per_command: bool) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_access: Mutex::new((Instant::now(), now)),
            commands: AtomicU64::new(0),
            per_command: per_command.then(DashMap::new),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_access.lock() = (Instant::now(), Utc::now());
    }

    pub(crate) fn record(&self, command: &'static str) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = &self.per_command {
            *counters.entry(command).or_insert(0) += 1;
        }
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_access.lock().0.elapsed()
    }

    pub(crate) fn snapshot(
        &self,
        id: SessionId,
        resource: &str,
        active: bool,
        objects: usize,
    ) -> SessionStats {
        let (instant, last_access) = *self.last_access.lock();
        SessionStats {
            id,
            resource: resource.to_string(),
            created_at: self.created_at,
            last_access,
            idle: instant.elapsed(),
            active,
            commands: self.commands.load(Ordering::Relaxed),
            objects,
            per_command: self
                .per_command
                .as_ref()
                .map(|counters| {
                    counters
                        .iter()
                        .map(|e| (e.key().to_string(), *e.value()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub id: SessionId,
    pub resource: String,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub idle: Duration,
    pub active: bool,
    pub commands: u64,
    /// Registered objects, the root connection included.
    pub objects: usize,
    /// Empty unless per-command statistics are enabled for the resource.
    pub per_command: BTreeMap<String, u64>,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Session {} on {}: {} commands, {} objects, idle {}ms{}",
            self.id,
            self.resource,
            self.commands,
            self.objects,
            self.idle.as_millis(),
            if self.active { ", active" } else { "" }
        )
    }
}
