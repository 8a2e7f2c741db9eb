//! Download and audit pipeline
//!
//! Download: Resolving → Fetching → Decoding → Unsealing → Verified
//!
//! Resolving pins the version to read. For an immutable object that is the
//! capability digest itself; the segment layout is learned from the first
//! shares that prove membership under it. For a mutable slot every endpoint
//! is asked for segment 0 and the highest validly signed version wins.
//!
//! Fetching keeps at most k share requests in flight per segment, on
//! distinct share indices, and stops at k verified shares. Locations that
//! served a valid share are tried first for later segments.

use crate::orchestrator::{blocking, CallResult, Orchestrator};
use crate::placement::{permute_endpoints, EndpointId};
use crate::transport::TransportError;
use bytes::Bytes;
use cyxgrid_core::{
    reassemble_segments, Capability, CapabilityKind, CodingParams, ContentHash, EncryptionKey,
    ErasureCoder, GridError, Result, Segment, SegmentLayout, Share, ShareEnvelope, ShareId,
    StorageIndex,
};
use futures::future::{self, join_all};
use futures::stream::{self, FuturesUnordered, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Download progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Resolving,
    Fetching,
    Decoding,
    Unsealing,
    Verified,
}

/// Audit outcome for one share index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareStatus {
    /// Some endpoint returned a share that verifies
    Valid,
    /// Only shares failing verification were found
    Corrupt,
    /// No endpoint returned the share
    Missing,
}

/// Audit of one segment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentReport {
    pub segment: u32,
    pub valid: Vec<u16>,
    pub corrupt: Vec<u16>,
    pub missing: Vec<u16>,
}

/// Result of [`Orchestrator::check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub storage_index: StorageIndex,
    /// Shares needed per segment (k)
    pub required: usize,
    /// Shares produced per segment (n)
    pub total: usize,
    /// Segment count; `None` when no share proved the layout
    pub num_segments: Option<u32>,
    /// Audited version (mutable slots)
    pub version: Option<u64>,
    pub segments: Vec<SegmentReport>,
}

impl VerifyReport {
    /// Every segment has at least k valid shares
    pub fn is_recoverable(&self) -> bool {
        match self.num_segments {
            Some(count) => {
                self.segments.len() == count as usize
                    && self.segments.iter().all(|s| s.valid.len() >= self.required)
            }
            None => false,
        }
    }

    /// Every share of every segment is valid
    pub fn is_healthy(&self) -> bool {
        self.is_recoverable() && self.segments.iter().all(|s| s.valid.len() == self.total)
    }
}

/// Version a download or audit is pinned to
#[derive(Debug, Clone, Copy)]
pub(crate) struct VersionPin {
    storage_index: StorageIndex,
    params: CodingParams,
    /// Digest every accepted envelope must be anchored to
    digest: ContentHash,
}

/// Version of a mutable slot chosen for reading
pub(crate) struct ResolvedVersion {
    pub seqnum: u64,
    /// Highest validly signed sequence number seen, recoverable or not
    pub newest_seqnum: u64,
    pin: VersionPin,
    layout: SegmentLayout,
    /// Verified segment-0 envelopes and where they were found
    seed: Vec<(EndpointId, ShareEnvelope)>,
}

/// Share index → endpoint that served a valid share
type Locations = Mutex<HashMap<u16, EndpointId>>;

struct Session {
    pin: VersionPin,
    layout: SegmentLayout,
    coder: Arc<ErasureCoder>,
    key: EncryptionKey,
    locations: Locations,
}

/// Candidate version seen while resolving a mutable slot
struct VersionCandidate {
    seqnum: u64,
    anchor: ContentHash,
    shares: BTreeMap<u16, (EndpointId, ShareEnvelope)>,
}

/// Check a fetched envelope against the pinned version
fn accept(pin: &VersionPin, segment: u32, index: u16, bytes: &[u8]) -> Result<ShareEnvelope> {
    let corrupt = || GridError::CorruptShare { segment, index };
    let envelope = ShareEnvelope::from_bytes(bytes).map_err(|_| corrupt())?;

    if envelope.share.segment != segment {
        return Err(GridError::MismatchedSegment {
            expected: segment,
            found: envelope.share.segment,
            index,
        });
    }
    if envelope.id() != ShareId::new(pin.storage_index, segment, index) {
        return Err(corrupt());
    }
    if envelope.verify_integrity()? != pin.digest {
        return Err(corrupt());
    }
    Ok(envelope)
}

/// Check a segment-0 envelope of a mutable slot; returns its sequence number
fn accept_version(
    storage_index: &StorageIndex,
    fingerprint: &ContentHash,
    params: &CodingParams,
    index: u16,
    bytes: &[u8],
) -> Result<(u64, ShareEnvelope)> {
    let corrupt = || GridError::CorruptShare { segment: 0, index };
    let envelope = ShareEnvelope::from_bytes(bytes).map_err(|_| corrupt())?;

    if envelope.id() != ShareId::new(*storage_index, 0, index) || envelope.params != *params {
        return Err(corrupt());
    }
    envelope.verify_integrity()?;
    let seqnum = envelope.verify_version(fingerprint)?;
    Ok((seqnum, envelope))
}

fn all_indices(params: &CodingParams) -> Vec<u16> {
    (0..params.total() as u16).collect()
}

impl Orchestrator {
    /// Request order for one segment.
    ///
    /// Learned locations first, then each index on its guessed endpoint in
    /// the per-object permutation, then every remaining pair. Endpoints with
    /// an open breaker come last.
    fn fetch_order(
        &self,
        storage_index: &StorageIndex,
        total: usize,
        learned: &HashMap<u16, EndpointId>,
    ) -> Vec<(u16, EndpointId)> {
        let ordered = self
            .health
            .order(&permute_endpoints(&self.endpoints, storage_index));

        let mut seen = HashSet::new();
        let mut plan = Vec::new();
        let mut push = |index: u16, endpoint: &EndpointId| {
            if seen.insert((index, endpoint.clone())) {
                plan.push((index, endpoint.clone()));
            }
        };

        for index in 0..total as u16 {
            if let Some(endpoint) = learned.get(&index) {
                push(index, endpoint);
            }
        }
        for (index, endpoint) in (0..total as u16).zip(ordered.iter()) {
            push(index, &endpoint.id);
        }
        for endpoint in &ordered {
            for index in 0..total as u16 {
                push(index, &endpoint.id);
            }
        }
        plan
    }

    async fn request_share(
        &self,
        cancel: &CancellationToken,
        storage_index: StorageIndex,
        segment: u32,
        index: u16,
        endpoint: EndpointId,
    ) -> (u16, EndpointId, CallResult<Bytes>) {
        let id = ShareId::new(storage_index, segment, index);
        let outcome = self.get(cancel, &endpoint, &id).await;
        (index, endpoint, outcome)
    }

    /// Collect k verified envelopes of `segment`, starting from `seed`
    async fn fetch_segment(
        &self,
        pin: &VersionPin,
        locations: &Locations,
        segment: u32,
        seed: Vec<ShareEnvelope>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ShareEnvelope>> {
        let needed = pin.params.needed();
        let mut accepted: BTreeMap<u16, ShareEnvelope> =
            seed.into_iter().map(|e| (e.share.index, e)).collect();

        let learned = locations.lock().clone();
        let mut queue: VecDeque<(u16, EndpointId)> = self
            .fetch_order(&pin.storage_index, pin.params.total(), &learned)
            .into();
        let mut in_flight = FuturesUnordered::new();
        let mut busy: HashSet<u16> = HashSet::new();

        debug!(segment, state = ?DownloadState::Fetching, "Fetching shares");
        while accepted.len() < needed {
            while accepted.len() + in_flight.len() < needed {
                let next = queue
                    .iter()
                    .position(|(i, _)| !accepted.contains_key(i) && !busy.contains(i));
                let Some((index, endpoint)) = next.and_then(|pos| queue.remove(pos)) else {
                    break;
                };
                busy.insert(index);
                in_flight.push(self.request_share(
                    cancel,
                    pin.storage_index,
                    segment,
                    index,
                    endpoint,
                ));
            }

            let Some((index, endpoint, outcome)) = in_flight.next().await else {
                break;
            };
            busy.remove(&index);

            match outcome? {
                Ok(bytes) => match accept(pin, segment, index, &bytes) {
                    Ok(envelope) => {
                        locations.lock().insert(index, endpoint);
                        accepted.insert(index, envelope);
                    }
                    Err(e) => {
                        warn!(segment, index, endpoint = %endpoint, error = %e, "Discarding invalid share");
                    }
                },
                Err(TransportError::NotFound) => {}
                Err(e) => {
                    debug!(segment, index, endpoint = %endpoint, error = %e, "Share fetch failed");
                }
            }
        }

        if accepted.len() < needed {
            let missing = (0..pin.params.total() as u16)
                .filter(|i| !accepted.contains_key(i))
                .collect();
            return Err(GridError::InsufficientShares {
                segment,
                available: accepted.len(),
                required: needed,
                missing,
            });
        }
        Ok(accepted.into_values().collect())
    }

    async fn download_segment(
        &self,
        session: &Session,
        segment: u32,
        seed: Vec<ShareEnvelope>,
        cancel: &CancellationToken,
    ) -> Result<Segment> {
        let envelopes = self
            .fetch_segment(&session.pin, &session.locations, segment, seed, cancel)
            .await?;
        let shares: Vec<Share> = envelopes.into_iter().map(|e| e.share).collect();

        let len = session.layout.segment_len(segment);
        let offset = session.layout.segment_offset(segment);
        let coder = session.coder.clone();
        let key = session.key.clone();

        debug!(segment, state = ?DownloadState::Decoding, "Decoding segment");
        blocking(move || {
            let sealed = coder.decode(&shares, len)?;
            debug!(segment, state = ?DownloadState::Unsealing, "Unsealing segment");
            let data = key.unseal_at(&sealed, offset)?;
            Ok(Segment {
                index: segment,
                offset,
                data: Bytes::from(data),
            })
        })
        .await
    }

    /// Find the version of a mutable slot to read.
    ///
    /// Versions with at least k valid segment-0 shares rank above those
    /// without, then by sequence number; ties go to the version with more
    /// shares, then to the smaller digest. `None` when no endpoint holds a
    /// valid version.
    ///
    /// Every (index, endpoint) pair is asked, except that an endpoint found
    /// unreachable is not asked again during this resolve.
    pub(crate) async fn resolve_mutable(
        &self,
        storage_index: StorageIndex,
        fingerprint: ContentHash,
        params: CodingParams,
        cancel: &CancellationToken,
    ) -> Result<Option<ResolvedVersion>> {
        debug!(state = ?DownloadState::Resolving, "Resolving mutable slot");
        let needed = params.needed();
        let pairs = self.fetch_order(&storage_index, params.total(), &HashMap::new());
        let unreachable: Mutex<HashSet<EndpointId>> = Mutex::new(HashSet::new());
        let mut requests = stream::iter(pairs)
            .filter(|(_, endpoint)| future::ready(!unreachable.lock().contains(endpoint)))
            .map(|(index, endpoint)| self.request_share(cancel, storage_index, 0, index, endpoint))
            .buffer_unordered(params.total());

        let mut candidates: HashMap<(u64, [u8; 32]), VersionCandidate> = HashMap::new();
        while let Some((index, endpoint, outcome)) = requests.next().await {
            let bytes = match outcome? {
                Ok(bytes) => bytes,
                Err(TransportError::NotFound) => continue,
                Err(TransportError::Unreachable(_)) => {
                    unreachable.lock().insert(endpoint);
                    continue;
                }
            };
            match accept_version(&storage_index, &fingerprint, &params, index, &bytes) {
                Ok((seqnum, envelope)) => {
                    let anchor = envelope.anchor_digest();
                    candidates
                        .entry((seqnum, *anchor.as_bytes()))
                        .or_insert_with(|| VersionCandidate {
                            seqnum,
                            anchor,
                            shares: BTreeMap::new(),
                        })
                        .shares
                        .entry(index)
                        .or_insert((endpoint, envelope));
                }
                Err(e) => {
                    warn!(index, endpoint = %endpoint, error = %e, "Ignoring invalid version share");
                }
            }
        }

        let newest_seqnum = candidates.values().map(|c| c.seqnum).max();
        let best = candidates.into_values().max_by(|a, b| {
            (a.shares.len() >= needed)
                .cmp(&(b.shares.len() >= needed))
                .then(a.seqnum.cmp(&b.seqnum))
                .then(a.shares.len().cmp(&b.shares.len()))
                .then(b.anchor.as_bytes().cmp(a.anchor.as_bytes()))
        });
        let (Some(best), Some(newest_seqnum)) = (best, newest_seqnum) else {
            debug!("No version found");
            return Ok(None);
        };
        if best.seqnum < newest_seqnum {
            warn!(
                newest = newest_seqnum,
                reading = best.seqnum,
                "Newest version is unrecoverable; reading an older one"
            );
        }

        let seed: Vec<(EndpointId, ShareEnvelope)> = best.shares.into_values().collect();
        let Some(layout) = seed.first().map(|(_, e)| e.layout) else {
            return Ok(None);
        };
        debug!(seqnum = best.seqnum, shares = seed.len(), "Version resolved");
        Ok(Some(ResolvedVersion {
            seqnum: best.seqnum,
            newest_seqnum,
            pin: VersionPin {
                storage_index,
                params,
                digest: best.anchor,
            },
            layout,
            seed,
        }))
    }

    pub(crate) async fn run_download(
        &self,
        cap: &Capability,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let read_key = cap.read_key().ok_or(GridError::InsufficientAuthority {
            required: CapabilityKind::Read.to_string(),
        })?;
        let params = cap.params();
        let storage_index = cap.storage_index();
        let locations = Locations::default();

        debug!(state = ?DownloadState::Resolving, "Resolving version");
        let (pin, layout, key, seed) = match cap.fingerprint() {
            Some(fingerprint) => {
                let resolved = self
                    .resolve_mutable(storage_index, fingerprint, params, cancel)
                    .await?
                    .ok_or_else(|| GridError::InsufficientShares {
                        segment: 0,
                        available: 0,
                        required: params.needed(),
                        missing: all_indices(&params),
                    })?;
                {
                    let mut learned = locations.lock();
                    for (endpoint, envelope) in &resolved.seed {
                        learned.insert(envelope.share.index, endpoint.clone());
                    }
                }
                let seed: Vec<ShareEnvelope> =
                    resolved.seed.into_iter().map(|(_, e)| e).collect();
                (
                    resolved.pin,
                    resolved.layout,
                    read_key.version_key(resolved.seqnum),
                    seed,
                )
            }
            None => {
                let digest = cap.digest().ok_or_else(|| {
                    GridError::MalformedCapability("capability carries no digest".to_string())
                })?;
                let pin = VersionPin {
                    storage_index,
                    params,
                    digest,
                };
                let seed = self
                    .fetch_segment(&pin, &locations, 0, Vec::new(), cancel)
                    .await?;
                let layout = seed.first().map(|e| e.layout).ok_or_else(|| {
                    GridError::Internal("segment 0 resolved without shares".to_string())
                })?;
                if cap.size() != Some(layout.size) {
                    return Err(GridError::MalformedCapability(
                        "capability size does not match object".to_string(),
                    ));
                }
                (pin, layout, read_key, seed)
            }
        };

        let session = Session {
            pin,
            layout,
            coder: Arc::new(ErasureCoder::new(params)?),
            key,
            locations,
        };

        let mut seed = Some(seed);
        let segments: Vec<Segment> = stream::iter(0..layout.num_segments())
            .map(|segment| {
                let seed = if segment == 0 {
                    seed.take().unwrap_or_default()
                } else {
                    Vec::new()
                };
                self.download_segment(&session, segment, seed, cancel)
            })
            .buffered(self.config.segment_parallelism)
            .try_collect()
            .await?;

        let data = reassemble_segments(&segments, &layout)?;
        info!(
            size = data.len(),
            segments = segments.len(),
            state = ?DownloadState::Verified,
            "Download verified"
        );
        Ok(data)
    }

    /// Audit one share index: the first endpoint serving a valid copy wins
    async fn check_share(
        &self,
        pin: &VersionPin,
        segment: u32,
        index: u16,
        endpoints: Vec<EndpointId>,
        cancel: &CancellationToken,
    ) -> Result<(ShareStatus, Option<(EndpointId, SegmentLayout)>)> {
        let id = ShareId::new(pin.storage_index, segment, index);
        let mut status = ShareStatus::Missing;
        for endpoint in endpoints {
            if let Ok(bytes) = self.get(cancel, &endpoint, &id).await? {
                match accept(pin, segment, index, &bytes) {
                    Ok(envelope) => {
                        return Ok((ShareStatus::Valid, Some((endpoint, envelope.layout))))
                    }
                    Err(e) => {
                        debug!(segment, index, endpoint = %endpoint, error = %e, "Corrupt share");
                        status = ShareStatus::Corrupt;
                    }
                }
            }
        }
        Ok((status, None))
    }

    /// Audit every share index of one segment; also returns the layout the
    /// valid shares prove
    async fn check_segment(
        &self,
        pin: &VersionPin,
        locations: &Locations,
        segment: u32,
        cancel: &CancellationToken,
    ) -> Result<(SegmentReport, Option<SegmentLayout>)> {
        let learned = locations.lock().clone();
        let plan = self.fetch_order(&pin.storage_index, pin.params.total(), &learned);

        let checks = (0..pin.params.total() as u16).map(|index| {
            let endpoints = plan
                .iter()
                .filter(|(i, _)| *i == index)
                .map(|(_, e)| e.clone())
                .collect();
            self.check_share(pin, segment, index, endpoints, cancel)
        });
        let results = join_all(checks).await;

        let mut report = SegmentReport {
            segment,
            ..Default::default()
        };
        let mut layout = None;
        for (index, result) in results.into_iter().enumerate() {
            let index = index as u16;
            let (status, found) = result?;
            match status {
                ShareStatus::Valid => report.valid.push(index),
                ShareStatus::Corrupt => report.corrupt.push(index),
                ShareStatus::Missing => report.missing.push(index),
            }
            if let Some((endpoint, proven)) = found {
                layout.get_or_insert(proven);
                locations.lock().insert(index, endpoint);
            }
        }
        Ok((report, layout))
    }

    pub(crate) async fn run_check(
        &self,
        cap: &Capability,
        cancel: &CancellationToken,
    ) -> Result<VerifyReport> {
        let params = cap.params();
        let storage_index = cap.storage_index();
        let locations = Locations::default();
        let mut report = VerifyReport {
            storage_index,
            required: params.needed(),
            total: params.total(),
            num_segments: None,
            version: None,
            segments: Vec::new(),
        };

        let (pin, known_layout) = match cap.fingerprint() {
            Some(fingerprint) => {
                match self
                    .resolve_mutable(storage_index, fingerprint, params, cancel)
                    .await?
                {
                    Some(resolved) => {
                        report.version = Some(resolved.seqnum);
                        (resolved.pin, Some(resolved.layout))
                    }
                    None => {
                        report.segments.push(SegmentReport {
                            segment: 0,
                            missing: all_indices(&params),
                            ..Default::default()
                        });
                        return Ok(report);
                    }
                }
            }
            None => {
                let digest = cap.digest().ok_or_else(|| {
                    GridError::MalformedCapability("capability carries no digest".to_string())
                })?;
                let pin = VersionPin {
                    storage_index,
                    params,
                    digest,
                };
                (pin, None)
            }
        };

        // Segment 0 proves the layout of an immutable object
        let (first, proven) = self.check_segment(&pin, &locations, 0, cancel).await?;
        report.segments.push(first);
        let Some(layout) = known_layout.or(proven) else {
            warn!("No valid share found; layout unknown");
            return Ok(report);
        };
        if let Some(size) = cap.size() {
            if size != layout.size {
                return Err(GridError::MalformedCapability(
                    "capability size does not match object".to_string(),
                ));
            }
        }
        report.num_segments = Some(layout.num_segments());

        let rest: Vec<SegmentReport> = stream::iter(1..layout.num_segments())
            .map(|segment| self.check_segment(&pin, &locations, segment, cancel))
            .buffered(self.config.segment_parallelism)
            .map_ok(|(segment_report, _)| segment_report)
            .try_collect()
            .await?;
        report.segments.extend(rest);

        info!(
            segments = report.segments.len(),
            recoverable = report.is_recoverable(),
            healthy = report.is_healthy(),
            "Check complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConfig;
    use crate::placement::{DiversityPolicy, Endpoint};
    use crate::transport::MemoryTransport;
    use cyxgrid_core::MIN_SEGMENT_SIZE;

    fn setup(endpoints: usize) -> (Arc<MemoryTransport>, Orchestrator) {
        let transport = Arc::new(MemoryTransport::new());
        let pool = (0..endpoints)
            .map(|i| Endpoint::new(format!("node-{}", i)))
            .collect();
        let config = GridConfig {
            segment_size: MIN_SEGMENT_SIZE,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(transport.clone(), pool, config).unwrap();
        (transport, orchestrator)
    }

    fn sample(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<_>>())
    }

    /// Endpoint currently storing `id`
    fn holder(transport: &MemoryTransport, endpoints: usize, id: &ShareId) -> EndpointId {
        (0..endpoints)
            .map(|i| EndpointId::new(format!("node-{}", i)))
            .find(|e| transport.holds(e, id))
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_multi_segment() {
        let (_, orchestrator) = setup(5);
        let params = CodingParams::new(2, 4).unwrap();
        let data = sample(5 * MIN_SEGMENT_SIZE + 123);

        let cap = orchestrator
            .upload(data.clone(), params, DiversityPolicy::Any)
            .await
            .unwrap();
        assert_eq!(orchestrator.download(&cap).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_empty_object() {
        let (_, orchestrator) = setup(4);
        let params = CodingParams::new(2, 4).unwrap();
        let cap = orchestrator
            .upload(Bytes::new(), params, DiversityPolicy::Any)
            .await
            .unwrap();
        assert!(orchestrator.download(&cap).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_download_stops_at_k_shares() {
        let (transport, orchestrator) = setup(6);
        let params = CodingParams::new(2, 6).unwrap();
        let cap = orchestrator
            .upload(sample(100), params, DiversityPolicy::Any)
            .await
            .unwrap();

        let before = transport.get_count();
        orchestrator.download(&cap).await.unwrap();
        assert_eq!(transport.get_count() - before, 2);
    }

    #[tokio::test]
    async fn test_corrupt_share_fetched_elsewhere() {
        let (transport, orchestrator) = setup(4);
        let params = CodingParams::new(2, 4).unwrap();
        let data = sample(3000);
        let cap = orchestrator
            .upload(data.clone(), params, DiversityPolicy::Any)
            .await
            .unwrap();

        for index in 0..3u16 {
            let id = ShareId::new(cap.storage_index(), 0, index);
            let endpoint = holder(&transport, 4, &id);
            assert!(transport.corrupt_share(&endpoint, &id, 1000 + index as usize));
        }
        // Only index 3 is intact: one short of k
        assert!(matches!(
            orchestrator.download(&cap).await,
            Err(GridError::InsufficientShares { segment: 0, available: 1, required: 2, .. })
        ));

        let report = orchestrator.check(&cap.to_verify_cap()).await.unwrap();
        assert_eq!(report.segments[0].valid, vec![3]);
        assert_eq!(report.segments[0].corrupt, vec![0, 1, 2]);
        assert!(!report.is_recoverable());
    }

    #[tokio::test]
    async fn test_verify_cap_cannot_download() {
        let (_, orchestrator) = setup(4);
        let params = CodingParams::new(2, 4).unwrap();
        let cap = orchestrator
            .upload(sample(10), params, DiversityPolicy::Any)
            .await
            .unwrap();

        let verify = cap.to_verify_cap();
        assert!(matches!(
            orchestrator.download(&verify).await,
            Err(GridError::InsufficientAuthority { .. })
        ));
        assert!(orchestrator.verify(&verify).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_reports_missing() {
        let (transport, orchestrator) = setup(4);
        let params = CodingParams::new(2, 4).unwrap();
        let cap = orchestrator
            .upload(sample(2 * MIN_SEGMENT_SIZE), params, DiversityPolicy::Any)
            .await
            .unwrap();

        let id = ShareId::new(cap.storage_index(), 1, 2);
        let endpoint = holder(&transport, 4, &id);
        assert!(transport.remove_share(&endpoint, &id));

        let report = orchestrator.check(&cap).await.unwrap();
        assert_eq!(report.num_segments, Some(2));
        assert_eq!(report.segments[0].valid.len(), 4);
        assert_eq!(report.segments[1].missing, vec![2]);
        assert!(report.is_recoverable());
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn test_wrong_digest_finds_nothing() {
        let (_, orchestrator) = setup(4);
        let params = CodingParams::new(2, 4).unwrap();
        let cap = orchestrator
            .upload(sample(10), params, DiversityPolicy::Any)
            .await
            .unwrap();

        let Capability::ImmutableRead(mut read) = cap else {
            panic!("expected immutable read capability");
        };
        read.digest = ContentHash::compute(b"another object");
        let forged = Capability::ImmutableRead(read);

        assert!(matches!(
            orchestrator.download(&forged).await,
            Err(GridError::InsufficientShares { available: 0, .. })
        ));
        assert!(!orchestrator.verify(&forged).await.unwrap());
    }

    #[tokio::test]
    async fn test_mutable_publish_and_read() {
        let (_, orchestrator) = setup(5);
        let params = CodingParams::new(2, 4).unwrap();

        let cap = orchestrator
            .create_mutable(Bytes::from_static(b"first"), params, DiversityPolicy::Any)
            .await
            .unwrap();
        let read = cap.to_read_cap().unwrap();
        assert_eq!(
            orchestrator.download(&read).await.unwrap(),
            Bytes::from_static(b"first")
        );

        let seqnum = orchestrator
            .publish(&cap, Bytes::from_static(b"second version"), DiversityPolicy::Any)
            .await
            .unwrap();
        assert_eq!(seqnum, 2);
        assert_eq!(
            orchestrator.download(&read).await.unwrap(),
            Bytes::from_static(b"second version")
        );

        let report = orchestrator.check(&cap.to_verify_cap()).await.unwrap();
        assert_eq!(report.version, Some(2));
        assert!(report.is_recoverable());
    }

    #[tokio::test]
    async fn test_empty_mutable_slot() {
        let (_, orchestrator) = setup(4);
        let params = CodingParams::new(2, 4).unwrap();
        let cap = Capability::new_mutable(cyxgrid_core::WriteKey::from_bytes([4u8; 32]), params);

        assert!(matches!(
            orchestrator.download(&cap).await,
            Err(GridError::InsufficientShares { available: 0, .. })
        ));
        let report = orchestrator.check(&cap).await.unwrap();
        assert_eq!(report.version, None);
        assert!(!report.is_recoverable());
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_previous_version_readable() {
        let transport = Arc::new(MemoryTransport::new());
        let pool: Vec<Endpoint> = (0..4).map(|i| Endpoint::new(format!("node-{}", i))).collect();
        let config = GridConfig {
            segment_size: MIN_SEGMENT_SIZE,
            max_put_attempts: 1,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(transport.clone(), pool.clone(), config).unwrap();
        let params = CodingParams::new(2, 4).unwrap();

        let cap = orchestrator
            .create_mutable(Bytes::from_static(b"first"), params, DiversityPolicy::Any)
            .await
            .unwrap();
        let read = cap.to_read_cap().unwrap();

        // Only the endpoint holding share 0 accepts the second version
        let keeper = holder(&transport, 4, &ShareId::new(cap.storage_index(), 0, 0));
        for endpoint in pool.iter().filter(|e| e.id != keeper) {
            transport.fail_puts(&endpoint.id, u64::MAX);
        }
        let result = orchestrator
            .publish(&cap, Bytes::from_static(b"second"), DiversityPolicy::Any)
            .await;
        assert!(matches!(result, Err(GridError::PartialUploadFailure { .. })));

        // One share of version 2 exists; three of version 1 still decode
        assert_eq!(
            orchestrator.download(&read).await.unwrap(),
            Bytes::from_static(b"first")
        );
        let report = orchestrator.check(&read).await.unwrap();
        assert_eq!(report.version, Some(1));
        assert!(report.is_recoverable());

        // The next publish skips past the unrecoverable sequence number
        for endpoint in &pool {
            transport.fail_puts(&endpoint.id, 0);
        }
        let seqnum = orchestrator
            .publish(&cap, Bytes::from_static(b"third"), DiversityPolicy::Any)
            .await
            .unwrap();
        assert_eq!(seqnum, 3);
        assert_eq!(
            orchestrator.download(&read).await.unwrap(),
            Bytes::from_static(b"third")
        );
    }

    #[tokio::test]
    async fn test_resolve_stops_asking_unreachable_endpoint() {
        let (transport, orchestrator) = setup(4);
        let params = CodingParams::new(2, 4).unwrap();
        let cap = orchestrator
            .create_mutable(Bytes::from_static(b"slot"), params, DiversityPolicy::Any)
            .await
            .unwrap();
        transport.set_unreachable(&EndpointId::new("node-3"), true);

        // Every (index, endpoint) pair would be 4 x 4 requests
        let before = transport.get_count();
        assert_eq!(
            orchestrator.download(&cap).await.unwrap(),
            Bytes::from_static(b"slot")
        );
        assert!(transport.get_count() - before < 16);
    }
}
