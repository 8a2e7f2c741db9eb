//! Share Placement Planner
//!
//! Assigns the `n` share indices of an object to distinct endpoints.
//! Planning runs in two passes:
//! - diversity pass: candidates admitted by the [`DiversityPolicy`], in order
//! - fallback pass: any unused candidate, recorded as a fallback placement
//!
//! The resulting [`PlacementMap`] belongs to a single upload and is dropped
//! with it.

use cyxgrid_core::{GridError, Result, StorageIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// Identifier of a storage endpoint
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({})", self.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A storage endpoint and its failure domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    /// Failure domain (rack, site, operator); `None` is a domain of its own
    pub group: Option<String>,
}

impl Endpoint {
    /// Endpoint that forms its own failure domain
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: EndpointId::new(id),
            group: None,
        }
    }

    /// Endpoint inside a shared failure domain
    pub fn in_group(id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: EndpointId::new(id),
            group: Some(group.into()),
        }
    }
}

/// How strongly a placement should spread across failure domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiversityPolicy {
    /// Any distinct endpoints
    Any,
    /// At most one share per group
    #[default]
    DistinctGroups,
    /// At most `m` shares per group
    MaxPerGroup(usize),
}

impl DiversityPolicy {
    fn group_limit(&self) -> Option<usize> {
        match self {
            DiversityPolicy::Any => None,
            DiversityPolicy::DistinctGroups => Some(1),
            DiversityPolicy::MaxPerGroup(m) => Some(*m),
        }
    }

    /// Whether `endpoint` may take one more share given current group usage
    fn admits(&self, endpoint: &Endpoint, usage: &HashMap<&str, usize>) -> bool {
        match (self.group_limit(), endpoint.group.as_deref()) {
            (None, _) | (_, None) => true,
            (Some(limit), Some(group)) => usage.get(group).copied().unwrap_or(0) < limit,
        }
    }
}

/// Share index → endpoint assignment for one upload
#[derive(Debug, Clone, Default)]
pub struct PlacementMap {
    assignments: BTreeMap<u16, Endpoint>,
    fallback: BTreeSet<u16>,
    failed: HashSet<EndpointId>,
}

impl PlacementMap {
    /// Endpoint currently holding `index`
    pub fn endpoint_for(&self, index: u16) -> Option<&Endpoint> {
        self.assignments.get(&index)
    }

    /// Assigned share indices in order
    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.assignments.keys().copied()
    }

    /// All `(index, endpoint)` pairs in index order
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Endpoint)> {
        self.assignments.iter().map(|(i, e)| (*i, e))
    }

    /// Number of assigned indices
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Indices placed outside the diversity policy
    pub fn fallback_indices(&self) -> Vec<u16> {
        self.fallback.iter().copied().collect()
    }

    /// Whether `index` was placed by the fallback pass
    pub fn is_fallback(&self, index: u16) -> bool {
        self.fallback.contains(&index)
    }

    /// Whether `endpoint` has failed during this operation
    pub fn has_failed(&self, endpoint: &EndpointId) -> bool {
        self.failed.contains(endpoint)
    }

    fn holds(&self, endpoint: &EndpointId) -> bool {
        self.assignments.values().any(|e| &e.id == endpoint)
    }

    fn group_usage(&self, skip: u16) -> HashMap<&str, usize> {
        let mut usage = HashMap::new();
        for (index, endpoint) in &self.assignments {
            if *index == skip {
                continue;
            }
            if let Some(group) = endpoint.group.as_deref() {
                *usage.entry(group).or_insert(0) += 1;
            }
        }
        usage
    }

    /// Move `index` off its current endpoint after a failure.
    ///
    /// The current endpoint is marked failed for the rest of the operation.
    /// Candidates that already hold another index or have failed are skipped;
    /// policy-admitted candidates win over the rest. Other assignments are
    /// never touched. When no alternate exists the assignment is left as is.
    #[instrument(skip(self, candidates))]
    pub fn replan(
        &mut self,
        index: u16,
        candidates: &[Endpoint],
        policy: &DiversityPolicy,
    ) -> Result<Endpoint> {
        let current = self
            .assignments
            .get(&index)
            .cloned()
            .ok_or(GridError::InvalidShareIndex {
                index: index as usize,
                max: self.assignments.len().saturating_sub(1),
            })?;
        self.failed.insert(current.id.clone());

        let usage = self.group_usage(index);
        let eligible: Vec<&Endpoint> = candidates
            .iter()
            .filter(|c| !self.failed.contains(&c.id) && !self.holds(&c.id))
            .collect();

        let diverse = eligible.iter().find(|c| policy.admits(c, &usage));
        let (chosen, is_fallback) = match diverse {
            Some(c) => ((*c).clone(), false),
            None => match eligible.first() {
                Some(c) => ((*c).clone(), true),
                None => {
                    warn!(index, endpoint = %current.id, "No alternate endpoint for share");
                    return Err(GridError::InsufficientEndpoints {
                        available: 0,
                        required: 1,
                    });
                }
            },
        };

        debug!(index, from = %current.id, to = %chosen.id, is_fallback, "Replanned share");
        if is_fallback {
            self.fallback.insert(index);
        } else {
            self.fallback.remove(&index);
        }
        self.assignments.insert(index, chosen.clone());
        Ok(chosen)
    }
}

/// Plans share placements
#[derive(Debug, Default, Clone, Copy)]
pub struct PlacementPlanner;

impl PlacementPlanner {
    /// Assign `n` share indices to distinct endpoints.
    ///
    /// Deterministic for identical candidate order and policy. Fails with
    /// `InsufficientEndpoints` when fewer than `n` distinct endpoints exist.
    #[instrument(skip(candidates))]
    pub fn plan(
        n: usize,
        candidates: &[Endpoint],
        policy: &DiversityPolicy,
    ) -> Result<PlacementMap> {
        let mut seen = HashSet::new();
        let distinct: Vec<&Endpoint> = candidates
            .iter()
            .filter(|c| seen.insert(c.id.clone()))
            .collect();

        if distinct.len() < n {
            return Err(GridError::InsufficientEndpoints {
                available: distinct.len(),
                required: n,
            });
        }

        let mut map = PlacementMap::default();
        let mut used = vec![false; distinct.len()];
        let mut usage: HashMap<&str, usize> = HashMap::new();
        let mut next: u16 = 0;

        // Diversity pass
        for (slot, endpoint) in distinct.iter().enumerate() {
            if next as usize == n {
                break;
            }
            if policy.admits(endpoint, &usage) {
                if let Some(group) = endpoint.group.as_deref() {
                    *usage.entry(group).or_insert(0) += 1;
                }
                map.assignments.insert(next, (*endpoint).clone());
                used[slot] = true;
                next += 1;
            }
        }

        // Fallback pass
        for (slot, endpoint) in distinct.iter().enumerate() {
            if next as usize == n {
                break;
            }
            if !used[slot] {
                map.assignments.insert(next, (*endpoint).clone());
                map.fallback.insert(next);
                used[slot] = true;
                next += 1;
            }
        }

        info!(
            shares = n,
            candidates = distinct.len(),
            fallback = map.fallback.len(),
            "Placement planned"
        );
        Ok(map)
    }
}

/// Per-object endpoint order: sorted by `BLAKE3(storage_index || endpoint id)`.
///
/// Upload and download derive the same order from the storage index alone,
/// so a reader asks the endpoints a writer most likely used first.
pub fn permute_endpoints(endpoints: &[Endpoint], storage_index: &StorageIndex) -> Vec<Endpoint> {
    let mut keyed: Vec<([u8; 32], &Endpoint)> = endpoints
        .iter()
        .map(|endpoint| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(storage_index.as_bytes());
            hasher.update(endpoint.id.as_str().as_bytes());
            (*hasher.finalize().as_bytes(), endpoint)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
    keyed.into_iter().map(|(_, e)| e.clone()).collect()
}
