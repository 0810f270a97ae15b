//! Entity sets and their halo patterns.
use crate::error::TopologyError;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_SET_ID: AtomicUsize = AtomicUsize::new(0);

/// Process-unique identity of a [`Set`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetId(usize);

impl SetId {
    fn next() -> Self {
        Self(NEXT_SET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Number of entities in each category of a set.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSizes {
    pub core: usize,
    pub owned: usize,
    pub exec_halo: usize,
    pub non_exec_halo: usize,
}

impl SetSizes {
    pub fn total(&self) -> usize {
        self.core + self.owned + self.exec_halo + self.non_exec_halo
    }

    fn boundaries(&self) -> [usize; 4] {
        let core_end = self.core;
        let owned_end = core_end + self.owned;
        let exec_end = owned_end + self.exec_halo;
        [core_end, owned_end, exec_end, exec_end + self.non_exec_halo]
    }
}

/// The category of an entity in a distributed set.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EntityCategory {
    /// Owned, and computable without any halo data.
    Core,
    /// Owned, but depends on halo data.
    Owned,
    /// Owned by another rank and redundantly computed here.
    ExecHalo,
    /// Owned by another rank and only ever read.
    NonExecHalo,
}

/// Exchange lists with one neighboring rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaloNeighbor {
    pub rank: usize,
    /// Local indices of owned entities whose values are sent to the neighbor.
    pub send: Vec<usize>,
    /// Local indices of halo entities whose values are received from the neighbor, in the
    /// order the neighbor sends them.
    pub recv: Vec<usize>,
}

/// Halo pattern of a set: what to send to and receive from every neighboring rank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Halo {
    neighbors: Vec<HaloNeighbor>,
}

impl Halo {
    pub fn new(neighbors: Vec<HaloNeighbor>) -> Self {
        Self { neighbors }
    }

    pub fn neighbors(&self) -> &[HaloNeighbor] {
        &self.neighbors
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    fn validate(&self, set: &str, boundaries: &[usize; 4]) -> Result<(), TopologyError> {
        let [_, owned_end, _, total] = *boundaries;
        let invalid = |reason: String| TopologyError::InvalidHalo {
            set: set.to_string(),
            reason,
        };

        let mut received = FxHashSet::default();
        let mut ranks = FxHashSet::default();
        for neighbor in &self.neighbors {
            if !ranks.insert(neighbor.rank) {
                return Err(invalid(format!("rank {} is listed more than once", neighbor.rank)));
            }
            if let Some(&idx) = neighbor.send.iter().find(|&&idx| idx >= owned_end) {
                return Err(invalid(format!(
                    "send index {} for rank {} is not an owned entity",
                    idx, neighbor.rank
                )));
            }
            for &idx in &neighbor.recv {
                if idx < owned_end || idx >= total {
                    return Err(invalid(format!(
                        "receive index {} for rank {} is not a halo entity",
                        idx, neighbor.rank
                    )));
                }
                if !received.insert(idx) {
                    return Err(invalid(format!("halo entity {} is received more than once", idx)));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct SetInner {
    id: SetId,
    name: String,
    /// `[core_end, owned_end, exec_end, total]`
    boundaries: [usize; 4],
    halo: Option<Halo>,
}

/// An ordered, finite collection of mesh entities of one kind.
///
/// Entities are numbered so that every category occupies a contiguous range:
/// core, then owned, then exec halo, then non-exec halo. A set is immutable, and cloning it
/// is cheap: clones share the same identity.
#[derive(Clone)]
pub struct Set {
    inner: Arc<SetInner>,
}

impl fmt::Debug for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Set")
            .field("name", &self.inner.name)
            .field("boundaries", &self.inner.boundaries)
            .finish()
    }
}

impl PartialEq for Set {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Set {}

impl Set {
    /// A set in which every entity is core.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self::from_parts(name.into(), [size; 4], None)
    }

    pub fn with_sizes(name: impl Into<String>, sizes: SetSizes) -> Self {
        Self::from_parts(name.into(), sizes.boundaries(), None)
    }

    /// Construct a set from its category boundaries `[core_end, owned_end, exec_end, total]`.
    pub fn from_boundaries(name: impl Into<String>, boundaries: [usize; 4]) -> Result<Self, TopologyError> {
        let name = name.into();
        if boundaries.windows(2).any(|w| w[0] > w[1]) {
            return Err(TopologyError::NonMonotonicBoundaries { set: name, boundaries });
        }
        Ok(Self::from_parts(name, boundaries, None))
    }

    /// Attach a halo pattern, producing a new set.
    ///
    /// The new set has a new identity, so it should be attached before any map or dat is
    /// defined on the set.
    pub fn with_halo(self, halo: Halo) -> Result<Self, TopologyError> {
        halo.validate(&self.inner.name, &self.inner.boundaries)?;
        Ok(Self::from_parts(self.inner.name.clone(), self.inner.boundaries, Some(halo)))
    }

    fn from_parts(name: String, boundaries: [usize; 4], halo: Option<Halo>) -> Self {
        Self {
            inner: Arc::new(SetInner {
                id: SetId::next(),
                name,
                boundaries,
                halo,
            }),
        }
    }

    pub fn id(&self) -> SetId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn core_end(&self) -> usize {
        self.inner.boundaries[0]
    }

    pub fn owned_end(&self) -> usize {
        self.inner.boundaries[1]
    }

    pub fn exec_end(&self) -> usize {
        self.inner.boundaries[2]
    }

    pub fn total_size(&self) -> usize {
        self.inner.boundaries[3]
    }

    pub fn boundaries(&self) -> [usize; 4] {
        self.inner.boundaries
    }

    pub fn sizes(&self) -> SetSizes {
        let [core_end, owned_end, exec_end, total] = self.inner.boundaries;
        SetSizes {
            core: core_end,
            owned: owned_end - core_end,
            exec_halo: exec_end - owned_end,
            non_exec_halo: total - exec_end,
        }
    }

    /// Indices of the entities whose values this rank is authoritative for.
    pub fn owned_range(&self) -> Range<usize> {
        0..self.owned_end()
    }

    /// Indices of the entities received from other ranks.
    pub fn halo_range(&self) -> Range<usize> {
        self.owned_end()..self.total_size()
    }

    pub fn halo(&self) -> Option<&Halo> {
        self.inner.halo.as_ref()
    }

    /// Whether the set has a halo with at least one neighbor.
    pub fn has_halo(&self) -> bool {
        self.halo().map_or(false, |halo| !halo.is_empty())
    }

    /// The category of the given entity, or `None` if the index is out of bounds.
    pub fn category(&self, index: usize) -> Option<EntityCategory> {
        let [core_end, owned_end, exec_end, total] = self.inner.boundaries;
        if index < core_end {
            Some(EntityCategory::Core)
        } else if index < owned_end {
            Some(EntityCategory::Owned)
        } else if index < exec_end {
            Some(EntityCategory::ExecHalo)
        } else if index < total {
            Some(EntityCategory::NonExecHalo)
        } else {
            None
        }
    }
}
