//! Loading sets and maps from a mesh or partition provider.
use crate::error::TopologyError;
use crate::map::Map;
use crate::set::{Halo, Set, SetSizes};
use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Description of a set as supplied by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDescription {
    pub name: String,
    pub sizes: SetSizes,
    #[serde(default)]
    pub halo: Option<Halo>,
}

/// Description of an incidence relation as supplied by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDescription {
    pub name: String,
    pub source: String,
    pub target: String,
    pub arity: usize,
    /// Row-major target indices, `arity` per source entity.
    pub values: Vec<usize>,
}

/// A source of mesh topology: the entity sets of one rank, with their categories and halos,
/// and the incidence relations between them.
pub trait TopologyProvider {
    fn sets(&self) -> Result<Vec<SetDescription>, TopologyError>;

    fn maps(&self) -> Result<Vec<MapDescription>, TopologyError>;
}

/// A topology provider that holds its descriptions in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryTopology {
    sets: Vec<SetDescription>,
    maps: Vec<MapDescription>,
}

impl InMemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set(mut self, name: impl Into<String>, sizes: SetSizes, halo: Option<Halo>) -> Self {
        self.sets.push(SetDescription {
            name: name.into(),
            sizes,
            halo,
        });
        self
    }

    pub fn with_map(
        mut self,
        name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        arity: usize,
        values: Vec<usize>,
    ) -> Self {
        self.maps.push(MapDescription {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            arity,
            values,
        });
        self
    }
}

impl TopologyProvider for InMemoryTopology {
    fn sets(&self) -> Result<Vec<SetDescription>, TopologyError> {
        Ok(self.sets.clone())
    }

    fn maps(&self) -> Result<Vec<MapDescription>, TopologyError> {
        Ok(self.maps.clone())
    }
}

/// Named sets and maps of one rank.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    sets: Vec<Set>,
    maps: Vec<Map>,
    set_indices: FxHashMap<String, usize>,
    map_indices: FxHashMap<String, usize>,
}

impl Topology {
    /// Build and validate all sets and maps described by the provider.
    pub fn load(provider: &dyn TopologyProvider) -> Result<Self, TopologyError> {
        let mut topology = Self::default();
        for description in provider.sets()? {
            let set = Set::with_sizes(&description.name, description.sizes);
            let set = match description.halo {
                Some(halo) => set.with_halo(halo)?,
                None => set,
            };
            topology
                .set_indices
                .insert(description.name, topology.sets.len());
            topology.sets.push(set);
        }

        for description in provider.maps()? {
            let source = topology.set(&description.source)?.clone();
            let target = topology.set(&description.target)?.clone();
            let map = Map::new(&description.name, &source, &target, description.arity, description.values)?;
            topology
                .map_indices
                .insert(description.name, topology.maps.len());
            topology.maps.push(map);
        }

        debug!(
            "Loaded topology with {} sets and {} maps",
            topology.sets.len(),
            topology.maps.len()
        );
        Ok(topology)
    }

    pub fn set(&self, name: &str) -> Result<&Set, TopologyError> {
        self.set_indices
            .get(name)
            .map(|&index| &self.sets[index])
            .ok_or_else(|| TopologyError::Missing {
                what: format!("set '{}'", name),
            })
    }

    pub fn map(&self, name: &str) -> Result<&Map, TopologyError> {
        self.map_indices
            .get(name)
            .map(|&index| &self.maps[index])
            .ok_or_else(|| TopologyError::Missing {
                what: format!("map '{}'", name),
            })
    }

    /// All sets, in the order the provider listed them.
    pub fn sets(&self) -> &[Set] {
        &self.sets
    }

    pub fn maps(&self) -> &[Map] {
        &self.maps
    }
}
