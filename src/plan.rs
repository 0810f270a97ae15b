//! Parallel-loop planning: validation of access descriptors, conflict coloring and blocking.
//!
//! Two iterations conflict when they write, through some map, to a common target entity. The
//! planner colors the conflict graph with first-fit greedy coloring, so that the iterations of
//! one color can run concurrently, and then groups the iterations of every color into blocks of
//! bounded size and bounded number of touched entities. Blocks never mix core iterations, which
//! only touch data owned by this rank, with iterations that depend on halo data.
use crate::access::{Access, Arg, MapIndex, Target};
use crate::config::{Backend, Coloring};
use crate::error::PlanningError;
use crate::map::{Map, MapKey};
use crate::set::{Set, SetId};
use itertools::Itertools;
use log::{debug, trace};
use parking_lot::Mutex;
use parloop_nested_vec::NestedVec;
use parloop_paradis::coloring::{greedy_coloring, VertexColoring};
use parloop_paradis::{DisjointSubsets, SubsetsNotDisjointError};
use parloop_sparse::SENTINEL;
use rustc_hash::{FxHashMap, FxHashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Execution phase of a block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Iterations that only touch data owned by this rank. Runs while halos are exchanged.
    Core,
    /// Iterations that may read halo data. Runs after the exchange has completed.
    HaloDependent,
}

/// A contiguous run of iterations of one color and one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub color: usize,
    pub phase: Phase,
    range: Range<usize>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// An execution plan for one loop shape.
///
/// Blocks are stored in execution order: by phase, then by color, then by iteration index.
#[derive(Debug)]
pub struct Plan {
    set: SetId,
    extent: usize,
    coloring: VertexColoring,
    elements: Vec<usize>,
    blocks: Vec<Block>,
    /// Ranges of blocks sharing phase and color, in execution order.
    groups: Vec<Range<usize>>,
}

impl Plan {
    pub fn set_id(&self) -> SetId {
        self.set
    }

    /// The plan covers iterations `0..extent`.
    pub fn extent(&self) -> usize {
        self.extent
    }

    pub fn num_colors(&self) -> usize {
        self.coloring.num_colors()
    }

    /// The color of every iteration.
    pub fn colors(&self) -> &[usize] {
        self.coloring.colors()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The iterations of a block, in increasing order.
    pub fn block_elements(&self, block: &Block) -> &[usize] {
        &self.elements[block.range.clone()]
    }

    /// Groups of blocks that may run concurrently, in execution order.
    pub fn groups(&self) -> impl '_ + Iterator<Item = (Phase, usize, &[Block])> {
        self.groups.iter().map(move |range| {
            let blocks = &self.blocks[range.clone()];
            (blocks[0].phase, blocks[0].color, blocks)
        })
    }

    /// Check that within every color no two iterations address a common entity through the
    /// given maps.
    pub fn verify_conflict_free(&self, maps: &[(&Map, MapIndex)]) -> Result<(), SubsetsNotDisjointError> {
        for class in self.coloring.color_classes().iter() {
            for &(map, index) in maps {
                let targets: Vec<Vec<usize>> = class
                    .iter()
                    .map(|&e| targets_of(map, index, e).filter(|&t| t != SENTINEL).collect())
                    .collect();
                DisjointSubsets::try_from_disjoint_subsets(&targets, class.to_vec())?;
            }
        }
        Ok(())
    }
}

fn targets_of<'a>(map: &'a Map, index: MapIndex, element: usize) -> impl 'a + Iterator<Item = usize> {
    let row = map.row(element);
    let selected = match index {
        MapIndex::All => row,
        MapIndex::At(i) => &row[i..=i],
    };
    selected.iter().copied()
}

/// The iteration extent of a loop: every iteration whose result may be needed on this rank.
///
/// Loops that write indirectly also execute the exec halo, so that owned entities receive the
/// contributions of iterations owned by other ranks. All other loops stop after the owned
/// iterations.
pub fn iteration_extent<T>(set: &Set, args: &[Arg<'_, T>]) -> usize {
    if args.iter().any(|arg| arg.conflict_map().is_some()) {
        set.exec_end()
    } else {
        set.owned_end()
    }
}

/// Check that the descriptors describe a loop that can be planned and executed without races.
pub fn validate_args<T>(
    set: &Set,
    args: &[Arg<'_, T>],
    backend: Backend,
    coloring: Coloring,
) -> Result<(), PlanningError> {
    if coloring == Coloring::Disabled && backend != Backend::Sequential {
        return Err(PlanningError::ColoringDisabled);
    }

    let invalid_access = |arg: usize, access: Access, target: &str| PlanningError::InvalidAccess {
        arg,
        access: access.to_string(),
        target: target.to_string(),
    };
    let check_map = |arg: usize, map: &Map, index: MapIndex, writes: bool| -> Result<(), PlanningError> {
        if map.source() != set {
            return Err(PlanningError::MapSourceMismatch {
                arg,
                map: map.name().to_string(),
                iteration_set: set.name().to_string(),
            });
        }
        if let MapIndex::At(i) = index {
            if i >= map.arity() {
                return Err(PlanningError::MapIndexOutOfBounds {
                    arg,
                    index: i,
                    arity: map.arity(),
                });
            }
        }
        if writes && map.arity() == 0 {
            return Err(PlanningError::ZeroArityIndirection {
                arg,
                map: map.name().to_string(),
            });
        }
        Ok(())
    };

    for (i, arg) in args.iter().enumerate() {
        let access = arg.access();
        match arg.target() {
            Target::Dat(dat) => {
                if matches!(access, Access::Min | Access::Max) {
                    return Err(invalid_access(i, access, arg.target().kind()));
                }
                let expected_set = match arg.map() {
                    Some((map, index)) => {
                        check_map(i, map, index, access.writes())?;
                        map.target()
                    }
                    None => set,
                };
                if dat.set() != expected_set {
                    return Err(PlanningError::DatSetMismatch {
                        arg: i,
                        dat: dat.name().to_string(),
                        expected_set: expected_set.name().to_string(),
                    });
                }
            }
            Target::Global(_) => {
                if arg.map().is_some() {
                    return Err(PlanningError::GlobalThroughMap { arg: i });
                }
                if matches!(access, Access::Write | Access::ReadWrite) {
                    return Err(invalid_access(i, access, arg.target().kind()));
                }
            }
            Target::Mat { mat, rows, cols } => {
                if arg.map().is_some() {
                    return Err(invalid_access(i, access, "matrix accessed through an additional map"));
                }
                if access != Access::Inc {
                    return Err(invalid_access(i, access, arg.target().kind()));
                }
                check_map(i, rows, MapIndex::All, true)?;
                check_map(i, cols, MapIndex::All, false)?;
                if !mat.sparsity().contains_pair(rows, cols) {
                    return Err(PlanningError::MatMapsNotInSparsity {
                        arg: i,
                        mat: mat.name().to_string(),
                    });
                }
            }
        }
    }

    for ((i, a), (j, b)) in args.iter().enumerate().tuple_combinations() {
        let a_target = a.target();
        if a_target.data_id() == b.target().data_id() && (a.access().writes() || b.access().writes()) {
            return Err(PlanningError::Aliasing {
                first: i,
                second: j,
                name: a_target.data_name().to_string(),
            });
        }
    }

    Ok(())
}

/// Identifies a loop shape: the iteration set and extent, and per argument the maps it goes
/// through and its access mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanKey {
    set: SetId,
    extent: usize,
    args: Vec<(Access, bool, Vec<(MapKey, MapIndex)>)>,
}

impl PlanKey {
    fn new<T>(set: &Set, extent: usize, args: &[Arg<'_, T>]) -> Self {
        let args = args
            .iter()
            .map(|arg| {
                let maps = arg
                    .indirections()
                    .into_iter()
                    .map(|(map, index)| (map.key(), index))
                    .collect();
                (arg.access(), arg.conflict_map().is_some(), maps)
            })
            .collect();
        Self { set: set.id(), extent, args }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlannerConfig {
    pub block_size: usize,
    pub locality_budget: usize,
    pub coloring: Coloring,
}

/// Builds and memoizes execution plans.
#[derive(Debug)]
pub struct Planner {
    config: PlannerConfig,
    adjacency: Mutex<FxHashMap<(SetId, MapKey, MapIndex), Arc<NestedVec<usize>>>>,
    plans: Mutex<FxHashMap<PlanKey, Arc<Plan>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            adjacency: Default::default(),
            plans: Default::default(),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Number of plans served from the cache.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of plans built.
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn cached_plans(&self) -> usize {
        self.plans.lock().len()
    }

    /// Drop all plans and conflict adjacencies that iterate over the given set.
    pub fn evict_set(&self, set: SetId) {
        self.plans.lock().retain(|key, _| key.set != set);
        self.adjacency.lock().retain(|(s, _, _), _| *s != set);
    }

    /// The plan for a validated loop over `0..extent` of `set`.
    pub fn plan<T>(&self, set: &Set, extent: usize, args: &[Arg<'_, T>]) -> Arc<Plan> {
        let key = PlanKey::new(set, extent, args);
        if let Some(plan) = self.plans.lock().get(&key) {
            trace!("Plan cache hit for loop over '{}'", set.name());
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(plan);
        }

        let plan = Arc::new(self.build_plan(set, extent, args));
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.plans.lock().insert(key, Arc::clone(&plan));
        plan
    }

    fn build_plan<T>(&self, set: &Set, extent: usize, args: &[Arg<'_, T>]) -> Plan {
        let conflict_maps: Vec<_> = args
            .iter()
            .filter_map(|arg| arg.conflict_map())
            .unique_by(|(map, index)| (map.id(), *index))
            .collect();

        let coloring = if conflict_maps.is_empty() || self.config.coloring == Coloring::Disabled {
            VertexColoring::single_color(extent)
        } else {
            let adjacencies: Vec<_> = conflict_maps
                .iter()
                .map(|&(map, index)| self.adjacency(set, map, index))
                .collect();
            greedy_coloring(&conflict_graph(&adjacencies, extent))
        };

        let locality_maps: Vec<_> = args
            .iter()
            .flat_map(|arg| arg.indirections())
            .unique_by(|(map, index)| (map.id(), *index))
            .collect();

        let core_end = set.core_end().min(extent);
        let classes = coloring.color_classes();
        let mut elements = Vec::with_capacity(extent);
        let mut blocks = Vec::new();
        let mut groups = Vec::new();
        let mut touched = FxHashSet::default();
        let mut element_targets = Vec::new();
        for phase in [Phase::Core, Phase::HaloDependent] {
            for (color, class) in classes.iter().enumerate() {
                let in_phase = class.iter().copied().filter(|&e| match phase {
                    Phase::Core => e < core_end,
                    Phase::HaloDependent => e >= core_end,
                });

                let first_block = blocks.len();
                let mut block_start = elements.len();
                touched.clear();
                for e in in_phase {
                    element_targets.clear();
                    for &(map, index) in &locality_maps {
                        let target_set = map.target().id();
                        element_targets.extend(
                            targets_of(map, index, e)
                                .filter(|&t| t != SENTINEL)
                                .map(|t| (target_set, t)),
                        );
                    }
                    element_targets.sort_unstable();
                    element_targets.dedup();

                    let current_len = elements.len() - block_start;
                    let new_targets = element_targets
                        .iter()
                        .filter(|target| !touched.contains(*target))
                        .count();
                    let full = current_len >= self.config.block_size
                        || touched.len() + new_targets > self.config.locality_budget;
                    if current_len > 0 && full {
                        blocks.push(Block {
                            color,
                            phase,
                            range: block_start..elements.len(),
                        });
                        block_start = elements.len();
                        touched.clear();
                    }
                    touched.extend(element_targets.iter().copied());
                    elements.push(e);
                }
                if elements.len() > block_start {
                    blocks.push(Block {
                        color,
                        phase,
                        range: block_start..elements.len(),
                    });
                }
                if blocks.len() > first_block {
                    groups.push(first_block..blocks.len());
                }
            }
        }

        debug!(
            "Planned loop over '{}' ({} iterations, {} core): {} colors, {} blocks",
            set.name(),
            extent,
            core_end,
            coloring.num_colors(),
            blocks.len()
        );

        Plan {
            set: set.id(),
            extent,
            coloring,
            elements,
            blocks,
            groups,
        }
    }

    /// Element adjacency through a single map index, over all entities of the map's source set.
    fn adjacency(&self, set: &Set, map: &Map, index: MapIndex) -> Arc<NestedVec<usize>> {
        let key = (set.id(), map.key(), index);
        if let Some(adjacency) = self.adjacency.lock().get(&key) {
            return Arc::clone(adjacency);
        }
        let adjacency = Arc::new(build_adjacency(map, index));
        self.adjacency.lock().insert(key, Arc::clone(&adjacency));
        adjacency
    }
}

/// Two elements are adjacent when they address a common target through the map.
fn build_adjacency(map: &Map, index: MapIndex) -> NestedVec<usize> {
    let num_elements = map.source().total_size();
    let num_targets = map.target().total_size();

    // Transpose: target -> elements addressing it, via counting sort
    let mut offsets = vec![0usize; num_targets + 1];
    for e in 0..num_elements {
        for t in targets_of(map, index, e).filter(|&t| t != SENTINEL) {
            offsets[t + 1] += 1;
        }
    }
    for t in 0..num_targets {
        offsets[t + 1] += offsets[t];
    }
    let mut fill = offsets.clone();
    let mut incident = vec![0usize; offsets[num_targets]];
    for e in 0..num_elements {
        for t in targets_of(map, index, e).filter(|&t| t != SENTINEL) {
            incident[fill[t]] = e;
            fill[t] += 1;
        }
    }

    let mut adjacency = NestedVec::with_capacity(num_elements, 0);
    let mut neighbors = Vec::new();
    for e in 0..num_elements {
        neighbors.clear();
        for t in targets_of(map, index, e).filter(|&t| t != SENTINEL) {
            neighbors.extend(
                incident[offsets[t]..offsets[t + 1]]
                    .iter()
                    .copied()
                    .filter(|&other| other != e),
            );
        }
        neighbors.sort_unstable();
        neighbors.dedup();
        adjacency.begin_group().extend(neighbors.iter().copied());
    }
    adjacency
}

/// Union of per-map adjacencies, restricted to the elements `0..extent`.
fn conflict_graph(adjacencies: &[Arc<NestedVec<usize>>], extent: usize) -> NestedVec<usize> {
    let mut graph = NestedVec::new();
    let mut neighbors = Vec::new();
    for e in 0..extent {
        neighbors.clear();
        for adjacency in adjacencies {
            if let Some(list) = adjacency.get(e) {
                neighbors.extend(list.iter().copied().filter(|&other| other < extent));
            }
        }
        neighbors.sort_unstable();
        neighbors.dedup();
        graph.begin_group().extend(neighbors.iter().copied());
    }
    graph
}
