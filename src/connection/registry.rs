//! Authoritative connection registry
//!
//! Records live in the document store, which may be shared between server
//! instances; `serverId` on each record disambiguates ownership. The live
//! socket and the heartbeat timer are non-serializable and stay in
//! process-local side-tables keyed by connection id. The side-tables start
//! empty and are drained only at shutdown.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::store::{DocumentStore, StoreError};

use super::record::ConnectionRecord;
use super::sender::OutboundHandle;

/// Collection holding connection records.
pub const CONNECTIONS_COLLECTION: &str = "morrigan.connections";

pub struct Registry {
    store: Arc<DocumentStore>,
    sockets: Mutex<HashMap<Uuid, OutboundHandle>>,
    heartbeats: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sockets", &self.sockets.lock().len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            store,
            sockets: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize one read-check-write span per key: the client id during
    /// issuance, the connection id during upgrade and cleanup. The store
    /// only makes individual reads and writes atomic; holders of this guard
    /// own the whole span. Entries are dropped once nobody holds or waits
    /// on them.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    fn parse(document: serde_json::Value) -> Option<ConnectionRecord> {
        match serde_json::from_value(document) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(error = %err, "skipping unparseable connection record");
                None
            }
        }
    }

    pub fn find_by_id(&self, id: &Uuid) -> Option<ConnectionRecord> {
        self.store
            .get(CONNECTIONS_COLLECTION, &id.to_string())
            .and_then(Self::parse)
    }

    pub fn find_by_client_id(&self, client_id: &str) -> Option<ConnectionRecord> {
        self.find_one(|record| record.client_id == client_id)
    }

    pub fn find_one(
        &self,
        predicate: impl Fn(&ConnectionRecord) -> bool,
    ) -> Option<ConnectionRecord> {
        self.store
            .values(CONNECTIONS_COLLECTION)
            .into_iter()
            .filter_map(Self::parse)
            .find(|record| predicate(record))
    }

    pub fn find_all(&self) -> Vec<ConnectionRecord> {
        self.store
            .values(CONNECTIONS_COLLECTION)
            .into_iter()
            .filter_map(Self::parse)
            .collect()
    }

    pub fn upsert(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        self.store.put(
            CONNECTIONS_COLLECTION,
            &record.id.to_string(),
            serde_json::to_value(record)?,
        )
    }

    pub fn delete_by_id(&self, id: &Uuid) -> Result<(), StoreError> {
        self.store.remove(CONNECTIONS_COLLECTION, &id.to_string())?;
        Ok(())
    }

    // Local-only side-tables below: never consulted by another process.

    pub fn register_socket(&self, id: Uuid, handle: OutboundHandle) {
        self.sockets.lock().insert(id, handle);
    }

    pub fn unregister_socket(&self, id: &Uuid) -> Option<OutboundHandle> {
        self.sockets.lock().remove(id)
    }

    pub fn socket(&self, id: &Uuid) -> Option<OutboundHandle> {
        self.sockets.lock().get(id).cloned()
    }

    pub fn socket_ids(&self) -> Vec<Uuid> {
        self.sockets.lock().keys().copied().collect()
    }

    pub fn register_heartbeat(&self, id: Uuid, task: JoinHandle<()>) {
        if let Some(replaced) = self.heartbeats.lock().insert(id, task) {
            replaced.abort();
        }
    }

    pub fn take_heartbeat(&self, id: &Uuid) -> Option<JoinHandle<()>> {
        self.heartbeats.lock().remove(id)
    }

    pub fn has_heartbeat(&self, id: &Uuid) -> bool {
        self.heartbeats.lock().contains_key(id)
    }
}
