use crate::error::TopologyError;
use crate::set::Set;
use parloop_sparse::SENTINEL;
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_MAP_ID: AtomicUsize = AtomicUsize::new(0);

/// Process-unique identity of a [`Map`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(usize);

impl MapId {
    fn next() -> Self {
        Self(NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies the values of a map: the base map and the sorted targets replaced by
/// [`SENTINEL`]. Maps with equal keys hold equal values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapKey {
    base: MapId,
    sentinels: Arc<[usize]>,
}

struct MapInner {
    id: MapId,
    /// The map this map was derived from with [`Map::with_sentinels`], or its own id.
    base: MapId,
    sentinels: Arc<[usize]>,
    name: String,
    source: Set,
    target: Set,
    arity: usize,
    values: Vec<usize>,
}

/// A fixed-arity incidence relation from every entity of a source set to entities of a
/// target set.
///
/// The `k` target indices of source entity `e` are stored at `values[k * e .. k * (e + 1)]`.
/// Every stored index is valid in the target set (halo included), except in maps derived with
/// [`Map::with_sentinels`], which may contain [`SENTINEL`].
#[derive(Clone)]
pub struct Map {
    inner: Arc<MapInner>,
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("name", &self.inner.name)
            .field("source", &self.inner.source.name())
            .field("target", &self.inner.target.name())
            .field("arity", &self.inner.arity)
            .finish()
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Map {}

impl Map {
    pub fn new(
        name: impl Into<String>,
        source: &Set,
        target: &Set,
        arity: usize,
        values: Vec<usize>,
    ) -> Result<Self, TopologyError> {
        let name = name.into();
        let expected = arity * source.total_size();
        if values.len() != expected {
            return Err(TopologyError::LengthMismatch {
                name,
                expected,
                actual: values.len(),
            });
        }

        let target_size = target.total_size();
        if let Some(position) = values.iter().position(|&idx| idx >= target_size) {
            return Err(TopologyError::IndexOutOfBounds {
                map: name,
                source_entity: position / arity,
                index: values[position],
                target_size,
            });
        }

        let id = MapId::next();
        Ok(Self {
            inner: Arc::new(MapInner {
                id,
                base: id,
                sentinels: Arc::from(Vec::new()),
                name,
                source: source.clone(),
                target: target.clone(),
                arity,
                values,
            }),
        })
    }

    /// Construct a map from one row of `K` target indices per source entity.
    pub fn from_rows<const K: usize>(
        name: impl Into<String>,
        source: &Set,
        target: &Set,
        rows: &[[usize; K]],
    ) -> Result<Self, TopologyError> {
        let values = rows.iter().flatten().copied().collect();
        Self::new(name, source, target, K, values)
    }

    /// Derive a map in which every occurrence of the given target entities is replaced by
    /// [`SENTINEL`].
    ///
    /// Contributions scattered through a sentinel entry are dropped, and gathers through a
    /// sentinel entry produce zeros. This is how boundary rows and columns are excluded from an
    /// assembled operator.
    ///
    /// Maps derived from the same map with the same targets share their cached conflict
    /// adjacency and plans, so deriving the map anew for every solve does not grow the
    /// engine's caches.
    pub fn with_sentinels(&self, targets: &[usize]) -> Self {
        let excluded: FxHashSet<usize> = targets.iter().copied().collect();
        let mut sentinels: Vec<usize> = self.inner.sentinels.iter().chain(targets).copied().collect();
        sentinels.sort_unstable();
        sentinels.dedup();
        let values = self
            .inner
            .values
            .iter()
            .map(|idx| if excluded.contains(idx) { SENTINEL } else { *idx })
            .collect();
        Self {
            inner: Arc::new(MapInner {
                id: MapId::next(),
                base: self.inner.base,
                sentinels: sentinels.into(),
                name: format!("{}[sentinels]", self.inner.name),
                source: self.inner.source.clone(),
                target: self.inner.target.clone(),
                arity: self.inner.arity,
                values,
            }),
        }
    }

    pub fn id(&self) -> MapId {
        self.inner.id
    }

    /// The identity of the map this map was ultimately derived from.
    ///
    /// Derived maps address a subset of the entries of their base map, so any sparsity built
    /// from the base map also covers them.
    pub fn base_id(&self) -> MapId {
        self.inner.base
    }

    /// Key under which plans through this map are cached.
    pub fn key(&self) -> MapKey {
        MapKey {
            base: self.inner.base,
            sentinels: Arc::clone(&self.inner.sentinels),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn source(&self) -> &Set {
        &self.inner.source
    }

    pub fn target(&self) -> &Set {
        &self.inner.target
    }

    pub fn arity(&self) -> usize {
        self.inner.arity
    }

    pub fn values(&self) -> &[usize] {
        &self.inner.values
    }

    /// The target indices of a source entity.
    ///
    /// Panics if the source entity is out of bounds.
    pub fn row(&self, source_entity: usize) -> &[usize] {
        let k = self.inner.arity;
        &self.inner.values[k * source_entity..k * (source_entity + 1)]
    }

    pub fn get(&self, source_entity: usize, index: usize) -> Option<usize> {
        if index < self.inner.arity {
            self.inner.values.get(self.inner.arity * source_entity + index).copied()
        } else {
            None
        }
    }
}
