//! Upload pipeline
//!
//! Two passes over the object. Pass 1 seals and encodes every segment in
//! parallel only to learn the share hashes, from which the Merkle root and
//! the capability digest follow. Pass 2 re-derives one segment's shares at a
//! time, wraps them in envelopes carrying inclusion proofs and places them.
//!
//! Per segment:
//! Segmenting → Sealing → Encoding → Placing → AwaitingAcks → Sealed | Failed

use crate::orchestrator::{blocking, Orchestrator};
use crate::placement::{
    permute_endpoints, DiversityPolicy, Endpoint, PlacementMap, PlacementPlanner,
};
use bytes::Bytes;
use cyxgrid_core::crypto::bind_digest;
use cyxgrid_core::{
    split_into_segments, CodingParams, ContentHash, EncryptionKey, ErasureCoder, GridError,
    MerkleTree, Result, Segment, SegmentFailure, SegmentLayout, Share, ShareEnvelope, ShareId,
    SignedVersion, StorageIndex, WriteKey,
};
use futures::future::join_all;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-segment upload state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Segmenting,
    Sealing,
    Encoding,
    Placing,
    AwaitingAcks,
    Sealed,
    Failed,
}

/// What an upload writes
pub(crate) enum UploadTarget {
    /// Content-addressed object under a fresh or convergent key
    Immutable,
    /// Version `seqnum` of the slot owned by `write_key`
    Mutable { write_key: WriteKey, seqnum: u64 },
}

/// Result of a successful upload
pub(crate) struct SealedObject {
    pub key: EncryptionKey,
    pub storage_index: StorageIndex,
    pub digest: ContentHash,
}

/// Seals and encodes segments; shared by both passes
struct SegmentSealer {
    key: EncryptionKey,
    coder: ErasureCoder,
}

impl SegmentSealer {
    fn shares(&self, segment: &Segment) -> Result<Vec<Share>> {
        let sealed = self.key.seal_at(&segment.data, segment.offset)?;
        self.coder.encode_segment(segment.index, &sealed)
    }

    /// Share hashes of every segment, segment-major
    fn share_hashes(&self, segments: &[Segment]) -> Result<Vec<ContentHash>> {
        let per_segment = segments
            .par_iter()
            .map(|segment| -> Result<Vec<ContentHash>> {
                Ok(self
                    .shares(segment)?
                    .into_iter()
                    .map(|share| share.digest)
                    .collect())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(per_segment.concat())
    }
}

/// Everything pass 2 needs to build envelopes
struct UploadPlan {
    sealer: SegmentSealer,
    storage_index: StorageIndex,
    params: CodingParams,
    layout: SegmentLayout,
    tree: MerkleTree,
    version: Option<SignedVersion>,
}

impl UploadPlan {
    /// Serialized envelopes of one segment, indexed by share index
    fn envelopes(&self, segment: &Segment) -> Result<Vec<Bytes>> {
        self.sealer
            .shares(segment)?
            .into_iter()
            .map(|share| -> Result<Bytes> {
                let mut envelope = ShareEnvelope::new(
                    self.storage_index,
                    self.params,
                    self.layout,
                    &self.tree,
                    share,
                )?;
                if let Some(version) = &self.version {
                    envelope = envelope.with_version(version.clone());
                }
                Ok(Bytes::from(envelope.to_bytes()?))
            })
            .collect()
    }
}

impl Orchestrator {
    pub(crate) async fn run_upload(
        &self,
        data: Bytes,
        params: CodingParams,
        policy: DiversityPolicy,
        target: UploadTarget,
        cancel: &CancellationToken,
    ) -> Result<SealedObject> {
        let segment_size = self.config.segment_size;
        let layout = SegmentLayout::new(data.len() as u64, segment_size)?;
        debug!(
            state = ?UploadState::Segmenting,
            segments = layout.num_segments(),
            "Upload started"
        );
        let segments = Arc::new(split_into_segments(&data, segment_size)?);

        let (key, storage_index) = match &target {
            UploadTarget::Immutable => {
                let key = match &self.convergence {
                    Some(secret) => EncryptionKey::convergent(secret, &params, segment_size, &data),
                    None => EncryptionKey::generate(),
                };
                let storage_index = key.storage_index();
                (key, storage_index)
            }
            UploadTarget::Mutable { write_key, seqnum } => {
                let read_key = write_key.read_key();
                (read_key.version_key(*seqnum), read_key.storage_index())
            }
        };

        // Pass 1: share hashes → Merkle root → digest
        debug!(state = ?UploadState::Sealing, "Computing share hashes");
        let sealer = SegmentSealer {
            key: key.clone(),
            coder: ErasureCoder::new(params)?,
        };
        let (sealer, hashes) = {
            let segments = segments.clone();
            blocking(move || {
                let hashes = sealer.share_hashes(&segments)?;
                Ok((sealer, hashes))
            })
            .await?
        };
        let tree = MerkleTree::new(&hashes);
        let digest = bind_digest(&params, &layout, &tree.root());

        let version = match &target {
            UploadTarget::Immutable => None,
            UploadTarget::Mutable { write_key, seqnum } => Some(SignedVersion::sign(
                write_key,
                &storage_index,
                *seqnum,
                &params,
                &layout,
                &tree.root(),
            )),
        };

        let plan = Arc::new(UploadPlan {
            sealer,
            storage_index,
            params,
            layout,
            tree,
            version,
        });

        // Fresh placements avoid endpoints whose breaker is open, unless the
        // healthy ones cannot take every share
        let (usable, open) = self
            .health
            .partition(&permute_endpoints(&self.endpoints, &storage_index));
        let candidates: Vec<Endpoint> = if open.is_empty() || usable.len() >= params.total() {
            if !open.is_empty() {
                debug!(excluded = open.len(), "Skipping endpoints with open circuit");
            }
            usable
        } else {
            warn!(
                usable = usable.len(),
                open = open.len(),
                "Too few healthy endpoints; placing on open-circuit endpoints too"
            );
            usable.into_iter().chain(open).collect()
        };
        let mut placement = PlacementPlanner::plan(params.total(), &candidates, &policy)?;
        if !placement.fallback_indices().is_empty() {
            warn!(
                fallback = ?placement.fallback_indices(),
                "Diversity policy not satisfied for every share"
            );
        }

        // Pass 2: one segment at a time
        let happy = self.config.shares_happy_for(&params);
        let mut failures = Vec::new();
        for index in 0..segments.len() {
            if cancel.is_cancelled() {
                return Err(GridError::Cancelled);
            }
            let segment_no = segments[index].index;

            debug!(segment = segment_no, state = ?UploadState::Encoding, "Encoding segment");
            let envelopes = {
                let plan = plan.clone();
                let segments = segments.clone();
                blocking(move || plan.envelopes(&segments[index])).await?
            };

            let placed = self
                .place_segment(
                    &plan.storage_index,
                    segment_no,
                    &envelopes,
                    &mut placement,
                    &candidates,
                    &policy,
                    cancel,
                )
                .await?;

            if placed.len() >= happy {
                debug!(
                    segment = segment_no,
                    placed = placed.len(),
                    state = ?UploadState::Sealed,
                    "Segment sealed"
                );
            } else {
                let missing: Vec<u16> = (0..params.total() as u16)
                    .filter(|i| !placed.contains(i))
                    .collect();
                warn!(
                    segment = segment_no,
                    placed = placed.len(),
                    required = happy,
                    state = ?UploadState::Failed,
                    "Segment not sealed"
                );
                failures.push(SegmentFailure {
                    segment: segment_no,
                    placed: placed.into_iter().collect(),
                    missing,
                    required: happy,
                });
            }
        }

        if !failures.is_empty() {
            return Err(GridError::PartialUploadFailure { failures });
        }

        info!(
            storage_index = %storage_index,
            segments = segments.len(),
            shares = params.total(),
            "Object sealed"
        );
        Ok(SealedObject {
            key,
            storage_index,
            digest,
        })
    }

    /// Put every share of one segment, retrying failed indices on alternate
    /// endpoints. Returns the acknowledged share indices.
    #[allow(clippy::too_many_arguments)]
    async fn place_segment(
        &self,
        storage_index: &StorageIndex,
        segment: u32,
        envelopes: &[Bytes],
        placement: &mut PlacementMap,
        candidates: &[Endpoint],
        policy: &DiversityPolicy,
        cancel: &CancellationToken,
    ) -> Result<BTreeSet<u16>> {
        let mut pending: BTreeSet<u16> = (0..envelopes.len() as u16).collect();
        let mut placed = BTreeSet::new();
        let attempts = self.config.max_put_attempts;

        for attempt in 1..=attempts {
            if pending.is_empty() {
                break;
            }
            let round: Vec<(u16, Endpoint)> = pending
                .iter()
                .filter_map(|i| placement.endpoint_for(*i).map(|e| (*i, e.clone())))
                .collect();
            debug!(
                segment,
                attempt,
                shares = round.len(),
                state = ?UploadState::Placing,
                "Placing shares"
            );

            let puts = round.iter().map(|(index, endpoint)| {
                let id = ShareId::new(*storage_index, segment, *index);
                let data = envelopes[*index as usize].clone();
                async move { (*index, self.put(cancel, &endpoint.id, &id, data).await) }
            });
            debug!(segment, state = ?UploadState::AwaitingAcks, "Awaiting acknowledgements");
            let results = join_all(puts).await;

            for (index, outcome) in results {
                match outcome? {
                    Ok(()) => {
                        pending.remove(&index);
                        placed.insert(index);
                    }
                    Err(e) => {
                        warn!(segment, index, attempt, error = %e, "Share put failed");
                        if attempt < attempts {
                            // No alternate: retry the same endpoint next round
                            if placement.replan(index, candidates, policy).is_err() {
                                debug!(segment, index, "Retrying on current endpoint");
                            }
                        }
                    }
                }
            }
        }

        Ok(placed)
    }
}
