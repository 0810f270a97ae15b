//! The parallel-loop engine.
use crate::access::{Arg, Target};
use crate::codegen::{check_signature, Binding, DatStorage, LoopData, Marshaller, MarshallerCache, Workspace};
use crate::comm::{decode, encode, Communicator, SerialCommunicator};
use crate::config::{Backend, EngineConfig};
use crate::dat::{Dat, Global};
use crate::error::{ConfigError, Error, ExecutionError};
use crate::halo::PendingExchange;
use crate::kernel::Kernel;
use crate::plan::{iteration_extent, validate_args, Block, Phase, Plan, Planner, PlannerConfig};
use crate::set::Set;
use crate::sparsity::Mat;
use crate::Value;
use log::{debug, info};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use parloop_paradis::slice::ParallelSliceAccess;
use parloop_sparse::CsrMatrix;
use rayon::prelude::*;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thread_local::ThreadLocal;

/// Counters describing the work an engine has done.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub loops: usize,
    pub plan_hits: usize,
    pub plan_misses: usize,
    pub marshaller_hits: usize,
    pub marshaller_misses: usize,
    /// Number of dat halos exchanged.
    pub halo_exchanges: usize,
    /// Number of cross-rank reductions.
    pub reductions: usize,
}

/// Executes parallel loops.
///
/// The engine owns the caches of plans and marshallers, the thread pool and the communicator.
/// On a distributed run every rank owns one engine, and all ranks must issue the same loops
/// (and calls to [`Engine::update_halo`]) in the same order, whether or not their part of a set
/// has halo neighbors.
pub struct Engine {
    config: EngineConfig,
    comm: Arc<dyn Communicator>,
    pool: Option<rayon::ThreadPool>,
    planner: Planner,
    marshallers: MarshallerCache,
    next_sequence: AtomicU64,
    loops: AtomicUsize,
    halo_exchanges: AtomicUsize,
    reductions: AtomicUsize,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("rank", &self.comm.rank())
            .field("size", &self.comm.size())
            .finish()
    }
}

impl Engine {
    /// An engine for a single rank.
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        Self::with_communicator(config, Arc::new(SerialCommunicator))
    }

    pub fn with_communicator(config: EngineConfig, comm: Arc<dyn Communicator>) -> Result<Self, Error> {
        config.validate()?;
        let pool = match config.backend {
            Backend::Sequential => None,
            Backend::Threaded | Backend::Distributed => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(config.num_threads.unwrap_or(0))
                    .build()
                    .map_err(|err| ConfigError {
                        reason: format!("failed to build thread pool: {}", err),
                    })?;
                Some(pool)
            }
        };
        info!(
            "Created {:?} engine on rank {} of {} ({} threads)",
            config.backend,
            comm.rank(),
            comm.size(),
            pool.as_ref().map_or(1, |pool| pool.current_num_threads())
        );
        let planner = Planner::new(PlannerConfig {
            block_size: config.block_size,
            locality_budget: config.locality_budget,
            coloring: config.coloring,
        });
        Ok(Self {
            config,
            comm,
            pool,
            planner,
            marshallers: MarshallerCache::default(),
            next_sequence: AtomicU64::new(0),
            loops: AtomicUsize::new(0),
            halo_exchanges: AtomicUsize::new(0),
            reductions: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            loops: self.loops.load(Ordering::Relaxed),
            plan_hits: self.planner.hits(),
            plan_misses: self.planner.misses(),
            marshaller_hits: self.marshallers.hits(),
            marshaller_misses: self.marshallers.misses(),
            halo_exchanges: self.halo_exchanges.load(Ordering::Relaxed),
            reductions: self.reductions.load(Ordering::Relaxed),
        }
    }

    /// Forget all cached plans for loops over the given set.
    pub fn evict_set(&self, set: &Set) {
        debug!("Evicting cached plans for set '{}'", set.name());
        self.planner.evict_set(set.id());
    }

    /// The (cached) plan the engine would execute for a loop.
    pub fn plan<T>(&self, set: &Set, args: &[Arg<'_, T>]) -> Result<Arc<Plan>, Error> {
        validate_args(set, args, self.config.backend, self.config.coloring)?;
        Ok(self.planner.plan(set, iteration_extent(set, args), args))
    }

    /// Bring the halo of a dat up to date, if it is dirty. Returns whether an exchange took
    /// place.
    pub fn update_halo<T: Value>(&self, dat: &Dat<T>) -> Result<bool, Error> {
        let sequence = self.next_sequence();
        if !dat.set().has_halo() || !dat.is_halo_dirty() {
            return Ok(false);
        }
        let mut guard = dat.try_write()?;
        let storage = [DatStorage::Exclusive(ParallelSliceAccess::new(guard.as_mut_slice()))];
        let mut pending = PendingExchange::new(self.comm.as_ref(), self.config.exchange_timeout());
        // Sound: the storage is exclusively locked by this thread.
        unsafe {
            pending.start(dat, 0, &storage[0], exchange_tag(sequence, 0))?;
            pending.wait(&storage)?;
        }
        self.halo_exchanges.fetch_add(1, Ordering::Relaxed);
        dat.mark_halo_clean();
        Ok(true)
    }

    /// Number the next collective operation. Every loop and every halo update takes exactly
    /// one number, so the numbers agree on all ranks.
    fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Execute `kernel` once for every iteration entity of `set`.
    ///
    /// Structural problems (invalid descriptors, mismatching kernel signature) are reported
    /// before anything is executed. Owned iterations are always executed; the exec halo is
    /// executed as well when the loop writes through a map.
    pub fn par_loop<T: Value>(&self, kernel: &Kernel<T>, set: &Set, args: &[Arg<'_, T>]) -> Result<(), Error> {
        validate_args(set, args, self.config.backend, self.config.coloring)?;
        check_signature(kernel, args)?;
        let sequence = self.next_sequence();
        let extent = iteration_extent(set, args);
        let plan = self.planner.plan(set, extent, args);
        let marshaller = self.marshallers.get_or_compile(kernel, args, self.config.backend);
        self.loops.fetch_add(1, Ordering::Relaxed);

        let Locks {
            bindings,
            mut dats,
            mut globals,
            mut mats,
        } = Locks::acquire(set, extent, args)?;
        let states: Vec<DatState<'_, T>> = dats.iter().map(DatLock::state).collect();
        let data = LoopData {
            bindings,
            dats: dats.iter_mut().map(DatLock::storage).collect(),
            globals: globals.iter().map(GlobalLock::to_vec).collect(),
            mats: mats.iter_mut().map(|guard| guard.par_accumulator()).collect(),
            owned_end: set.owned_end(),
        };

        let mut pending = PendingExchange::new(self.comm.as_ref(), self.config.exchange_timeout());
        for (index, state) in states.iter().enumerate() {
            if state.exchange {
                // Sound: no iterations are running yet.
                unsafe { pending.start(state.dat, index, &data.dats[index], exchange_tag(sequence, index))? };
                self.halo_exchanges.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut pending = Some(pending).filter(|pending| !pending.is_empty());
        if self.config.backend != Backend::Distributed {
            complete_exchange(pending.take(), &data, &states)?;
        }

        let workspace = ThreadLocal::new();
        let mut partials = Vec::new();
        for (phase, color, blocks) in plan.groups() {
            if phase == Phase::HaloDependent {
                complete_exchange(pending.take(), &data, &states)?;
            }
            debug!("Running {:?} blocks of color {} ({} blocks)", phase, color, blocks.len());
            partials.extend(self.run_group(kernel, &marshaller, &plan, blocks, &data, &workspace)?);
        }
        complete_exchange(pending.take(), &data, &states)?;

        if marshaller.has_reductions() {
            for (global, value) in self.reduce(&marshaller, &data, &partials, sequence)? {
                globals[global].store(&value);
            }
        }

        for state in &states {
            if state.written {
                state.dat.mark_halo_dirty();
            }
        }
        Ok(())
    }

    fn run_group<T: Value>(
        &self,
        kernel: &Kernel<T>,
        marshaller: &Marshaller,
        plan: &Plan,
        blocks: &[Block],
        data: &LoopData<'_, T>,
        workspace: &ThreadLocal<RefCell<Workspace<T>>>,
    ) -> Result<Vec<Vec<T>>, ExecutionError> {
        let run_block = |block: &Block| {
            let ws = &mut *workspace.get_or_default().borrow_mut();
            marshaller.run_block(kernel, data, plan.block_elements(block), ws)
        };
        match &self.pool {
            None => blocks.iter().map(run_block).collect(),
            Some(pool) => pool.install(|| blocks.par_iter().map(run_block).collect()),
        }
    }

    /// Combine the block partials in plan order, then across ranks in rank order.
    fn reduce<T: Value>(
        &self,
        marshaller: &Marshaller,
        data: &LoopData<'_, T>,
        partials: &[Vec<T>],
        sequence: u64,
    ) -> Result<Vec<(usize, Vec<T>)>, Error> {
        let mut local = marshaller.initial_partials(data);
        for partial in partials {
            marshaller.combine_partials(&mut local, partial);
        }

        let total = if self.comm.size() > 1 {
            let gathered = self
                .comm
                .all_gather(reduction_tag(sequence), encode(&local)?, self.config.exchange_timeout())?;
            self.reductions.fetch_add(1, Ordering::Relaxed);
            let mut total = marshaller.initial_partials(data);
            for (rank, bytes) in gathered.iter().enumerate() {
                let contribution: Vec<T> = decode(rank, bytes)?;
                marshaller.combine_partials(&mut total, &contribution);
            }
            total
        } else {
            local
        };
        Ok(marshaller.finalize_reductions(data, &total))
    }
}

/// Tags of one collective operation: slot 0 for the reduction, one slot per dat for halo
/// exchanges. Dat slots follow the order of the loop arguments, which is the same on all ranks.
fn reduction_tag(sequence: u64) -> u64 {
    sequence << 32
}

fn exchange_tag(sequence: u64, dat: usize) -> u64 {
    (sequence << 32) | (dat as u64 + 1)
}

fn complete_exchange<T: Value>(
    pending: Option<PendingExchange<'_>>,
    data: &LoopData<'_, T>,
    states: &[DatState<'_, T>],
) -> Result<(), Error> {
    if let Some(pending) = pending {
        // Sound: called between groups, when no iterations are running.
        let completed = unsafe { pending.wait(&data.dats)? };
        for index in completed {
            states[index].dat.mark_halo_clean();
        }
    }
    Ok(())
}

/// What the engine needs to know about a locked dat after the loop.
struct DatState<'a, T> {
    dat: &'a Dat<T>,
    written: bool,
    exchange: bool,
}

struct DatLock<'a, T> {
    dat: &'a Dat<T>,
    guard: DatGuard<'a, T>,
    written: bool,
    exchange: bool,
}

enum DatGuard<'a, T> {
    Shared(RwLockReadGuard<'a, Vec<T>>),
    Exclusive(RwLockWriteGuard<'a, Vec<T>>),
}

impl<'a, T> DatLock<'a, T> {
    fn state(&self) -> DatState<'a, T> {
        DatState {
            dat: self.dat,
            written: self.written,
            exchange: self.exchange,
        }
    }

    fn storage(&mut self) -> DatStorage<'_, T> {
        match &mut self.guard {
            DatGuard::Shared(guard) => DatStorage::Shared(guard.as_slice()),
            DatGuard::Exclusive(guard) => DatStorage::Exclusive(ParallelSliceAccess::new(guard.as_mut_slice())),
        }
    }
}

enum GlobalLock<'a, T> {
    Shared(RwLockReadGuard<'a, Vec<T>>),
    Exclusive(RwLockWriteGuard<'a, Vec<T>>),
}

impl<'a, T: Value> GlobalLock<'a, T> {
    fn to_vec(&self) -> Vec<T> {
        match self {
            Self::Shared(guard) => guard.to_vec(),
            Self::Exclusive(guard) => guard.to_vec(),
        }
    }

    fn store(&mut self, value: &[T]) {
        if let Self::Exclusive(guard) = self {
            guard.copy_from_slice(value);
        }
    }
}

/// Every data object of a loop, locked once for the whole loop.
struct Locks<'a, T> {
    bindings: Vec<Binding<'a>>,
    dats: Vec<DatLock<'a, T>>,
    globals: Vec<GlobalLock<'a, T>>,
    mats: Vec<RwLockWriteGuard<'a, CsrMatrix<T>>>,
}

impl<'a, T: Value> Locks<'a, T> {
    fn acquire(set: &Set, extent: usize, args: &[Arg<'a, T>]) -> Result<Self, ExecutionError> {
        // A dat needs its halo if some argument reads it through a map, or directly over
        // iterations beyond the owned ones.
        let reads_halo = |arg: &Arg<'a, T>| arg.access().reads() && (arg.is_indirect() || extent > set.owned_end());

        let mut dats: Vec<(&'a Dat<T>, bool, bool)> = Vec::new();
        let mut globals: Vec<(&'a Global<T>, bool)> = Vec::new();
        let mut bindings = Vec::with_capacity(args.len());
        let mut num_mats = 0;
        for arg in args {
            let writes = arg.access().writes();
            let binding = match arg.target() {
                Target::Dat(dat) => {
                    let index = match dats.iter().position(|(d, _, _)| d.id() == dat.id()) {
                        Some(index) => index,
                        None => {
                            dats.push((dat, false, false));
                            dats.len() - 1
                        }
                    };
                    dats[index].1 |= writes;
                    dats[index].2 |= reads_halo(arg);
                    Binding {
                        data: index,
                        map: arg.map().map(|(map, _)| map.values()),
                        col_map: None,
                    }
                }
                Target::Global(global) => {
                    let index = match globals.iter().position(|(g, _)| g.id() == global.id()) {
                        Some(index) => index,
                        None => {
                            globals.push((global, false));
                            globals.len() - 1
                        }
                    };
                    globals[index].1 |= writes;
                    Binding {
                        data: index,
                        map: None,
                        col_map: None,
                    }
                }
                Target::Mat { rows, cols, .. } => {
                    // Matrices are never aliased
                    num_mats += 1;
                    Binding {
                        data: num_mats - 1,
                        map: Some(rows.values()),
                        col_map: Some(cols.values()),
                    }
                }
            };
            bindings.push(binding);
        }

        let dats = dats
            .into_iter()
            .map(|(dat, written, reads_halo)| {
                let exchange = reads_halo && dat.set().has_halo() && dat.is_halo_dirty();
                let guard = if written || exchange {
                    DatGuard::Exclusive(dat.try_write()?)
                } else {
                    DatGuard::Shared(dat.try_read()?)
                };
                Ok(DatLock {
                    dat,
                    guard,
                    written,
                    exchange,
                })
            })
            .collect::<Result<Vec<_>, ExecutionError>>()?;

        let globals = globals
            .into_iter()
            .map(|(global, written)| {
                let lock = if written {
                    GlobalLock::Exclusive(global.try_write()?)
                } else {
                    GlobalLock::Shared(global.try_read()?)
                };
                Ok(lock)
            })
            .collect::<Result<Vec<_>, ExecutionError>>()?;

        let mats = args
            .iter()
            .filter_map(|arg| match arg.target() {
                Target::Mat { mat, .. } => Some(mat),
                _ => None,
            })
            .map(|mat: &'a Mat<T>| mat.try_write())
            .collect::<Result<Vec<_>, ExecutionError>>()?;

        Ok(Self {
            bindings,
            dats,
            globals,
            mats,
        })
    }
}
