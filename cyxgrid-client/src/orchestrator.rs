//! Upload/Download Orchestrator
//!
//! Drives objects between callers and storage endpoints:
//! - Upload: segment, seal, encode, place and await acknowledgements
//! - Download: resolve a version, fetch k verified shares per segment,
//!   decode and unseal
//! - Verify/check: share-level integrity audit without the read key
//! - Mutable slots: create and publish signed versions
//!
//! Every transport call is raced against a cancellation token and bounded by
//! the configured request timeout. Endpoint health is shared across calls.

use crate::config::GridConfig;
use crate::download::VerifyReport;
use crate::health::EndpointHealth;
use crate::placement::{DiversityPolicy, Endpoint, EndpointId};
use crate::transport::{ShareTransport, TransportError};
use crate::upload::UploadTarget;
use bytes::Bytes;
use cyxgrid_core::{
    Capability, CapabilityKind, CodingParams, ConvergenceSecret, GridError, Result, ShareId,
    WriteKey,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Outcome of one transport call: the outer error is cancellation only
pub(crate) type CallResult<T> = Result<std::result::Result<T, TransportError>>;

/// Run CPU-bound coding work off the async runtime
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GridError::Internal(format!("blocking task failed: {}", e)))?
}

/// Upload/download orchestrator over a fixed endpoint pool
pub struct Orchestrator {
    pub(crate) transport: Arc<dyn ShareTransport>,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) config: GridConfig,
    pub(crate) health: Arc<EndpointHealth>,
    pub(crate) convergence: Option<ConvergenceSecret>,
}

impl Orchestrator {
    /// Create an orchestrator.
    ///
    /// Duplicate endpoint ids are dropped, keeping the first occurrence.
    pub fn new(
        transport: Arc<dyn ShareTransport>,
        endpoints: Vec<Endpoint>,
        config: GridConfig,
    ) -> Result<Self> {
        config.validate()?;
        let convergence = config.convergence_secret()?;

        let mut seen = HashSet::new();
        let endpoints: Vec<Endpoint> = endpoints
            .into_iter()
            .filter(|e| seen.insert(e.id.clone()))
            .collect();
        if endpoints.is_empty() {
            return Err(GridError::InsufficientEndpoints {
                available: 0,
                required: 1,
            });
        }

        let health = Arc::new(EndpointHealth::new(config.breaker_config()));
        info!(
            endpoints = endpoints.len(),
            convergent = convergence.is_some(),
            "Orchestrator ready"
        );

        Ok(Self {
            transport,
            endpoints,
            config,
            health,
            convergence,
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Endpoint pool
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Endpoint health shared by every operation
    pub fn health(&self) -> &EndpointHealth {
        &self.health
    }

    // ===== Transport calls =====

    /// Run one transport call under cancellation and timeout, feeding the
    /// outcome into endpoint health. A timeout counts as `Unreachable`.
    async fn guarded<T, F>(
        &self,
        cancel: &CancellationToken,
        endpoint: &EndpointId,
        call: F,
    ) -> CallResult<T>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GridError::Cancelled),
            result = tokio::time::timeout(self.config.request_timeout(), call) => match result {
                Ok(result) => result,
                Err(_) => Err(TransportError::Unreachable(format!("{} timed out", endpoint))),
            },
        };

        match &outcome {
            Ok(_) | Err(TransportError::NotFound) => self.health.record_success(endpoint),
            Err(TransportError::Unreachable(reason)) => {
                debug!(endpoint = %endpoint, reason = %reason, "Transport call failed");
                self.health.record_failure(endpoint);
            }
        }
        Ok(outcome)
    }

    pub(crate) async fn put(
        &self,
        cancel: &CancellationToken,
        endpoint: &EndpointId,
        id: &ShareId,
        data: Bytes,
    ) -> CallResult<()> {
        self.guarded(cancel, endpoint, self.transport.put_share(endpoint, id, data))
            .await
    }

    pub(crate) async fn get(
        &self,
        cancel: &CancellationToken,
        endpoint: &EndpointId,
        id: &ShareId,
    ) -> CallResult<Bytes> {
        self.guarded(cancel, endpoint, self.transport.get_share(endpoint, id))
            .await
    }

    // ===== Immutable objects =====

    /// Upload an immutable object and return its read capability
    pub async fn upload(
        &self,
        data: Bytes,
        params: CodingParams,
        policy: DiversityPolicy,
    ) -> Result<Capability> {
        self.upload_with_cancel(data, params, policy, &CancellationToken::new())
            .await
    }

    /// Upload under a caller-held cancellation token.
    ///
    /// On cancellation shares already placed are left in place.
    #[instrument(skip(self, data, cancel), fields(size = data.len()))]
    pub async fn upload_with_cancel(
        &self,
        data: Bytes,
        params: CodingParams,
        policy: DiversityPolicy,
        cancel: &CancellationToken,
    ) -> Result<Capability> {
        let size = data.len() as u64;
        let sealed = self
            .run_upload(data, params, policy, UploadTarget::Immutable, cancel)
            .await?;
        let cap = Capability::mint(
            sealed.key.as_bytes(),
            sealed.digest,
            params,
            size,
            CapabilityKind::Read,
        )?;
        info!(storage_index = %sealed.storage_index, "Upload complete");
        Ok(cap)
    }

    /// Download the object a read (or write) capability refers to
    pub async fn download(&self, cap: &Capability) -> Result<Bytes> {
        self.download_with_cancel(cap, &CancellationToken::new())
            .await
    }

    /// Download under a caller-held cancellation token
    #[instrument(skip(self, cap, cancel), fields(storage_index = %cap.storage_index()))]
    pub async fn download_with_cancel(
        &self,
        cap: &Capability,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        self.run_download(cap, cancel).await
    }

    /// Whether every segment of the object has at least k intact shares.
    ///
    /// Works with verify-only capabilities; the plaintext is never touched.
    pub async fn verify(&self, cap: &Capability) -> Result<bool> {
        Ok(self.check(cap).await?.is_recoverable())
    }

    /// Per-segment share audit
    pub async fn check(&self, cap: &Capability) -> Result<VerifyReport> {
        self.check_with_cancel(cap, &CancellationToken::new())
            .await
    }

    /// Share audit under a caller-held cancellation token
    #[instrument(skip(self, cap, cancel), fields(storage_index = %cap.storage_index()))]
    pub async fn check_with_cancel(
        &self,
        cap: &Capability,
        cancel: &CancellationToken,
    ) -> Result<VerifyReport> {
        self.run_check(cap, cancel).await
    }

    // ===== Mutable slots =====

    /// Create a mutable slot holding `data` as version 1
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn create_mutable(
        &self,
        data: Bytes,
        params: CodingParams,
        policy: DiversityPolicy,
    ) -> Result<Capability> {
        let write_key = WriteKey::generate();
        let cap = Capability::new_mutable(write_key.clone(), params);
        let target = UploadTarget::Mutable {
            write_key,
            seqnum: 1,
        };
        self.run_upload(data, params, policy, target, &CancellationToken::new())
            .await?;
        info!(storage_index = %cap.storage_index(), "Mutable slot created");
        Ok(cap)
    }

    /// Publish `data` as the next version of a mutable slot
    ///
    /// Returns the new sequence number.
    pub async fn publish(
        &self,
        cap: &Capability,
        data: Bytes,
        policy: DiversityPolicy,
    ) -> Result<u64> {
        self.publish_with_cancel(cap, data, policy, &CancellationToken::new())
            .await
    }

    /// Publish under a caller-held cancellation token
    #[instrument(skip(self, cap, data, cancel), fields(size = data.len()))]
    pub async fn publish_with_cancel(
        &self,
        cap: &Capability,
        data: Bytes,
        policy: DiversityPolicy,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let Capability::MutableWrite(write) = cap else {
            return Err(GridError::InsufficientAuthority {
                required: CapabilityKind::Write.to_string(),
            });
        };

        let current = self
            .resolve_mutable(
                cap.storage_index(),
                write.fingerprint,
                write.params,
                cancel,
            )
            .await?
            .map(|resolved| resolved.newest_seqnum)
            .unwrap_or(0);
        let seqnum = current + 1;

        let target = UploadTarget::Mutable {
            write_key: write.write_key.clone(),
            seqnum,
        };
        self.run_upload(data, write.params, policy, target, cancel)
            .await?;
        info!(storage_index = %cap.storage_index(), seqnum, "Version published");
        Ok(seqnum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::time::Duration;

    fn pool(count: usize) -> Vec<Endpoint> {
        (0..count)
            .map(|i| Endpoint::new(format!("node-{}", i)))
            .collect()
    }

    #[test]
    fn test_new_dedupes_endpoints() {
        let mut endpoints = pool(3);
        endpoints.push(Endpoint::new("node-1"));
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryTransport::new()),
            endpoints,
            GridConfig::default(),
        )
        .unwrap();
        assert_eq!(orchestrator.endpoints().len(), 3);
    }

    #[test]
    fn test_new_rejects_empty_pool() {
        let result = Orchestrator::new(
            Arc::new(MemoryTransport::new()),
            Vec::new(),
            GridConfig::default(),
        );
        assert!(matches!(
            result,
            Err(GridError::InsufficientEndpoints { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_unreachable() {
        let transport = Arc::new(MemoryTransport::new());
        let config = GridConfig {
            request_timeout_ms: 100,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(transport.clone(), pool(1), config).unwrap();
        let endpoint = EndpointId::new("node-0");
        transport.set_latency(&endpoint, Duration::from_secs(1));

        let id = ShareId::new(cyxgrid_core::StorageIndex::from_bytes([1u8; 16]), 0, 0);
        let outcome = orchestrator
            .put(&CancellationToken::new(), &endpoint, &id, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(matches!(outcome, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_cancelled_call() {
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryTransport::new()),
            pool(1),
            GridConfig::default(),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let id = ShareId::new(cyxgrid_core::StorageIndex::from_bytes([1u8; 16]), 0, 0);
        let result = orchestrator
            .get(&cancel, &EndpointId::new("node-0"), &id)
            .await;
        assert!(matches!(result, Err(GridError::Cancelled)));
    }

    #[tokio::test]
    async fn test_publish_requires_write_authority() {
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryTransport::new()),
            pool(4),
            GridConfig::default(),
        )
        .unwrap();
        let params = CodingParams::new(2, 4).unwrap();
        let write = Capability::new_mutable(WriteKey::from_bytes([9u8; 32]), params);
        let read = write.to_read_cap().unwrap();

        let result = orchestrator
            .publish(&read, Bytes::from_static(b"v2"), DiversityPolicy::Any)
            .await;
        assert!(matches!(
            result,
            Err(GridError::InsufficientAuthority { .. })
        ));
    }
}
