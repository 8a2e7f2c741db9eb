//! Storage transport seam
//!
//! The orchestrator talks to endpoints only through [`ShareTransport`].
//! [`MemoryTransport`] keeps shares in process memory and can inject faults;
//! it is used by tests and simulations.

use crate::placement::EndpointId;
use async_trait::async_trait;
use bytes::Bytes;
use cyxgrid_core::ShareId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Transport failures; both are transient from the orchestrator's view
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Share not found")]
    NotFound,

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),
}

/// Moves share envelopes to and from storage endpoints
#[async_trait]
pub trait ShareTransport: Send + Sync {
    /// Store `data` under `id` on `endpoint`
    async fn put_share(
        &self,
        endpoint: &EndpointId,
        id: &ShareId,
        data: Bytes,
    ) -> Result<(), TransportError>;

    /// Fetch the bytes stored under `id` on `endpoint`
    async fn get_share(&self, endpoint: &EndpointId, id: &ShareId) -> Result<Bytes, TransportError>;
}

/// In-memory transport with fault injection
#[derive(Default)]
pub struct MemoryTransport {
    /// Shares per endpoint
    stores: RwLock<HashMap<EndpointId, HashMap<ShareId, Bytes>>>,

    /// Endpoints that refuse every call
    unreachable: RwLock<HashSet<EndpointId>>,

    /// Remaining put failures per endpoint
    failing_puts: RwLock<HashMap<EndpointId, u64>>,

    /// Endpoints that flip a byte of everything they return
    corrupting: RwLock<HashSet<EndpointId>>,

    /// Artificial delay per endpoint
    latency: RwLock<HashMap<EndpointId, Duration>>,

    /// Operation counters
    puts: AtomicU64,
    gets: AtomicU64,
}

impl MemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `endpoint` refuse (or accept again) every call
    pub fn set_unreachable(&self, endpoint: &EndpointId, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(endpoint.clone());
        } else {
            set.remove(endpoint);
        }
    }

    /// Fail the next `count` puts to `endpoint`
    pub fn fail_puts(&self, endpoint: &EndpointId, count: u64) {
        self.failing_puts.write().insert(endpoint.clone(), count);
    }

    /// Make `endpoint` return corrupted bytes
    pub fn set_corrupting(&self, endpoint: &EndpointId, corrupting: bool) {
        let mut set = self.corrupting.write();
        if corrupting {
            set.insert(endpoint.clone());
        } else {
            set.remove(endpoint);
        }
    }

    /// Delay every call to `endpoint`
    pub fn set_latency(&self, endpoint: &EndpointId, delay: Duration) {
        self.latency.write().insert(endpoint.clone(), delay);
    }

    /// Flip one byte of a stored share; returns false if it is not stored
    pub fn corrupt_share(&self, endpoint: &EndpointId, id: &ShareId, offset: usize) -> bool {
        let mut stores = self.stores.write();
        let Some(data) = stores.get_mut(endpoint).and_then(|s| s.get_mut(id)) else {
            return false;
        };
        if data.is_empty() {
            return false;
        }
        let mut bytes = data.to_vec();
        let at = offset % bytes.len();
        bytes[at] ^= 0xff;
        *data = Bytes::from(bytes);
        true
    }

    /// Remove a stored share; returns false if it was not stored
    pub fn remove_share(&self, endpoint: &EndpointId, id: &ShareId) -> bool {
        self.stores
            .write()
            .get_mut(endpoint)
            .map(|s| s.remove(id).is_some())
            .unwrap_or(false)
    }

    /// Drop everything stored on `endpoint`
    pub fn wipe(&self, endpoint: &EndpointId) {
        self.stores.write().remove(endpoint);
    }

    /// Share ids stored on `endpoint`
    pub fn shares_on(&self, endpoint: &EndpointId) -> Vec<ShareId> {
        let mut ids: Vec<ShareId> = self
            .stores
            .read()
            .get(endpoint)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Number of shares stored on `endpoint`
    pub fn share_count(&self, endpoint: &EndpointId) -> usize {
        self.stores.read().get(endpoint).map(HashMap::len).unwrap_or(0)
    }

    /// Whether `endpoint` stores `id`
    pub fn holds(&self, endpoint: &EndpointId, id: &ShareId) -> bool {
        self.stores
            .read()
            .get(endpoint)
            .map(|s| s.contains_key(id))
            .unwrap_or(false)
    }

    /// Total successful and failed put calls
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Total get calls
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    async fn simulate_network(&self, endpoint: &EndpointId) -> Result<(), TransportError> {
        let delay = self.latency.read().get(endpoint).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.read().contains(endpoint) {
            return Err(TransportError::Unreachable(endpoint.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ShareTransport for MemoryTransport {
    async fn put_share(
        &self,
        endpoint: &EndpointId,
        id: &ShareId,
        data: Bytes,
    ) -> Result<(), TransportError> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.simulate_network(endpoint).await?;

        {
            let mut failing = self.failing_puts.write();
            if let Some(remaining) = failing.get_mut(endpoint) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Unreachable(format!(
                        "{} rejected put",
                        endpoint
                    )));
                }
            }
        }

        self.stores
            .write()
            .entry(endpoint.clone())
            .or_default()
            .insert(*id, data);
        Ok(())
    }

    async fn get_share(&self, endpoint: &EndpointId, id: &ShareId) -> Result<Bytes, TransportError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.simulate_network(endpoint).await?;

        let data = self
            .stores
            .read()
            .get(endpoint)
            .and_then(|s| s.get(id).cloned())
            .ok_or(TransportError::NotFound)?;

        if self.corrupting.read().contains(endpoint) && !data.is_empty() {
            let mut bytes = data.to_vec();
            let last = bytes.len() - 1;
            bytes[last] ^= 0x01;
            return Ok(Bytes::from(bytes));
        }
        Ok(data)
    }
}
