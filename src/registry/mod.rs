//! Per-session table of live remote objects.

mod object;

pub use object::{LobBuffer, LobKind, RemoteObject};

use crate::core::{DebugContext, ObjectKind, Uid, UidGenerator};
use crate::driver::CancelHandle;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedObject = Arc<Mutex<RemoteObject>>;

pub struct RegistryEntry {
    object: SharedObject,
    kind: ObjectKind,
    canceller: Option<Arc<dyn CancelHandle>>,
    created_by: Option<DebugContext>,
    created_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn object(&self) -> &SharedObject {
        &self.object
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn created_by(&self) -> Option<&DebugContext> {
        self.created_by.as_ref()
    }

    pub fn into_object(self) -> SharedObject {
        self.object
    }
}

/// One line of [`ObjectRegistry::describe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescription {
    pub uid: Uid,
    pub kind: ObjectKind,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl fmt::Display for ObjectDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} created {}", self.uid, self.kind, self.created_at.to_rfc3339())?;
        if let Some(label) = &self.created_by {
            write!(f, " by {}", label)?;
        }
        Ok(())
    }
}

/// Concurrent map from UID to live object.
///
/// Identifiers come from a generator shared by every session of the
/// process. Iteration always works on a snapshot of the key set.
pub struct ObjectRegistry {
    entries: DashMap<u64, RegistryEntry>,
    uids: Arc<UidGenerator>,
}

impl ObjectRegistry {
    pub fn new(uids: Arc<UidGenerator>) -> Self {
        Self {
            entries: DashMap::new(),
            uids,
        }
    }

    pub fn register(&self, object: RemoteObject, created_by: Option<DebugContext>) -> Uid {
        let uid = self.uids.next();
        let kind = object.kind();
        let canceller = object.cancel_handle();
        debug!("Registering {} as {}", kind, uid);

        self.entries.insert(
            uid.value(),
            RegistryEntry {
                object: Arc::new(Mutex::new(object)),
                kind,
                canceller,
                created_by,
                created_at: Utc::now(),
            },
        );
        uid
    }

    /// Object and kind for `uid`. The map shard is released before return.
    pub fn get(&self, uid: Uid) -> Option<(SharedObject, ObjectKind)> {
        self.entries
            .get(&uid.value())
            .map(|entry| (entry.object.clone(), entry.kind))
    }

    pub fn kind(&self, uid: Uid) -> Option<ObjectKind> {
        self.entries.get(&uid.value()).map(|entry| entry.kind)
    }

    /// Cancel handle captured at registration; usable without locking the
    /// object itself.
    pub fn canceller(&self, uid: Uid) -> Option<Arc<dyn CancelHandle>> {
        self.entries
            .get(&uid.value())
            .and_then(|entry| entry.canceller.clone())
    }

    pub fn remove(&self, uid: Uid) -> Option<RegistryEntry> {
        self.entries.remove(&uid.value()).map(|(_, entry)| entry)
    }

    pub fn contains(&self, uid: Uid) -> bool {
        self.entries.contains_key(&uid.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the registered identifiers in registration order.
    pub fn keys(&self) -> Vec<Uid> {
        let mut keys: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        keys.into_iter().map(Uid::new).collect()
    }

    /// Live objects with their creation context, for leak hunting.
    pub fn describe(&self) -> Vec<ObjectDescription> {
        let mut out: Vec<ObjectDescription> = self
            .entries
            .iter()
            .map(|entry| ObjectDescription {
                uid: Uid::new(*entry.key()),
                kind: entry.kind,
                created_at: entry.created_at,
                created_by: entry.created_by.as_ref().map(|c| c.label.clone()),
            })
            .collect();
        out.sort_by_key(|d| d.uid);
        out
    }
}
