//! Provider key pool: an ordered credential list plus a process-wide credential → client cache.
//!
//! Rotation state does not live here. Each generation call takes its own [`KeyCursor`], so one call's
//! rotation or reset can never move another in-flight call off its credential.

use dashmap::DashMap;
use std::sync::Arc;

use super::{ApiKey, ClientFactory, ProviderClient, ProviderError};

#[derive(Debug, thiserror::Error)]
pub enum KeyPoolError {
    #[error("no provider credentials configured")]
    Empty,
}

pub struct KeyPool {
    keys: Vec<ApiKey>,
    factory: Arc<dyn ClientFactory>,
    /// Read-mostly; racing inserts for the same credential are harmless (clients are equivalent).
    clients: DashMap<String, Arc<dyn ProviderClient>>,
}

impl KeyPool {
    pub fn new(keys: Vec<ApiKey>, factory: Arc<dyn ClientFactory>) -> Result<Self, KeyPoolError> {
        if keys.is_empty() {
            return Err(KeyPoolError::Empty);
        }
        Ok(Self { keys, factory, clients: DashMap::new() })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false: `new` rejects an empty credential list.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Starts a fresh rotation at the first credential.
    pub fn cursor(self: &Arc<Self>) -> KeyCursor {
        KeyCursor { pool: Arc::clone(self), index: 0 }
    }

    /// Number of clients built so far.
    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }

    fn client_at(&self, index: usize) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        let key = &self.keys[index];
        if let Some(client) = self.clients.get(key.expose()) {
            return Ok(Arc::clone(client.value()));
        }
        let client = self.factory.build(key)?;
        self.clients.insert(key.expose().to_string(), Arc::clone(&client));
        tracing::debug!(target: "vigil::keys", key_index = index, "Provider client initialised");
        Ok(client)
    }
}

/// Per-call rotation state over a shared [`KeyPool`].
pub struct KeyCursor {
    pool: Arc<KeyPool>,
    index: usize,
}

impl KeyCursor {
    /// Ready client for the active credential (memoized in the pool).
    pub fn current_client(&self) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        self.pool.client_at(self.index)
    }

    /// Advances to the next credential. Returns false when already on the last one.
    pub fn rotate(&mut self) -> bool {
        if self.index + 1 < self.pool.len() {
            self.index += 1;
            tracing::debug!(target: "vigil::keys", key_index = self.index, "Rotated to next provider key");
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn index(&self) -> usize {
        self.index
    }
}
