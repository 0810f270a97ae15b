//! Marshalling of kernel arguments.
//!
//! A [`Marshaller`] is the routine generated for one combination of kernel signature, argument
//! layout and backend. It knows where every argument lives in the flat per-thread workspace and
//! how to gather it before the kernel runs and scatter it afterwards. Marshallers only depend on
//! the structure of a loop, not on the concrete data, so they are generated once and cached.
use crate::access::{Access, Arg, MapIndex, Target};
use crate::config::Backend;
use crate::error::{ExecutionError, KernelSignatureMismatch};
use crate::kernel::{Kernel, KernelBuffers};
use crate::Value;
use log::{debug, trace};
use parking_lot::Mutex;
use parloop_paradis::slice::ParallelSliceAccess;
use parloop_sparse::{CsrParAccumulator, SENTINEL};
use rustc_hash::FxHashMap;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How an argument buffer is filled from, and written back to, its target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Addressing {
    Direct { dim: usize },
    Indirect { index: usize, arity: usize, dim: usize },
    IndirectAll { arity: usize, dim: usize },
    Global { dim: usize },
    MatBlock {
        row_arity: usize,
        row_dim: usize,
        col_arity: usize,
        col_dim: usize,
    },
}

impl Addressing {
    fn of<T>(arg: &Arg<'_, T>) -> Self {
        match arg.target() {
            Target::Dat(dat) => match arg.map() {
                None => Self::Direct { dim: dat.dim() },
                Some((map, MapIndex::At(index))) => Self::Indirect {
                    index,
                    arity: map.arity(),
                    dim: dat.dim(),
                },
                Some((map, MapIndex::All)) => Self::IndirectAll {
                    arity: map.arity(),
                    dim: dat.dim(),
                },
            },
            Target::Global(global) => Self::Global { dim: global.dim() },
            Target::Mat { mat, rows, cols } => {
                let (row_dim, col_dim) = mat.sparsity().dims();
                Self::MatBlock {
                    row_arity: rows.arity(),
                    row_dim,
                    col_arity: cols.arity(),
                    col_dim,
                }
            }
        }
    }

    fn len(&self) -> usize {
        match *self {
            Self::Direct { dim } | Self::Indirect { dim, .. } | Self::Global { dim } => dim,
            Self::IndirectAll { arity, dim } => arity * dim,
            Self::MatBlock {
                row_arity,
                row_dim,
                col_arity,
                col_dim,
            } => row_arity * row_dim * col_arity * col_dim,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    range: Range<usize>,
    access: Access,
    addressing: Addressing,
    /// Position of the running reduction value among the loop's reduction partials.
    reduction: Option<Range<usize>>,
}

/// Check that the argument buffers match the shapes the kernel declares.
pub fn check_signature<T>(kernel: &Kernel<T>, args: &[Arg<'_, T>]) -> Result<(), KernelSignatureMismatch> {
    let shapes = kernel.shapes();
    if shapes.len() != args.len() {
        return Err(KernelSignatureMismatch {
            kernel: kernel.name().to_string(),
            arg: None,
            expected: shapes.len().to_string(),
            found: args.len().to_string(),
        });
    }
    for (i, (shape, arg)) in shapes.iter().zip(args).enumerate() {
        let found = arg.shape();
        if *shape != found {
            return Err(KernelSignatureMismatch {
                kernel: kernel.name().to_string(),
                arg: Some(i),
                expected: shape.to_string(),
                found: found.to_string(),
            });
        }
    }
    Ok(())
}

/// Locked storage of one dat for the duration of a loop.
pub(crate) enum DatStorage<'a, T> {
    Shared(&'a [T]),
    Exclusive(ParallelSliceAccess<'a, T>),
}

impl<'a, T> DatStorage<'a, T> {
    /// # Safety
    ///
    /// No thread may write to the range at the same time.
    pub(crate) unsafe fn read(&self, range: Range<usize>) -> &'a [T] {
        match self {
            Self::Shared(values) => &values[range],
            Self::Exclusive(access) => access.subslice(range),
        }
    }

    /// # Safety
    ///
    /// No other thread may access the range at the same time.
    ///
    /// Panics if the storage is shared.
    pub(crate) unsafe fn write(&self, range: Range<usize>) -> &'a mut [T] {
        match self {
            Self::Shared(_) => panic!("Attempt to write to a dat locked for reading."),
            Self::Exclusive(access) => access.subslice_mut(range),
        }
    }
}

/// What a slot refers to at run time: an index into the loop's dats, globals or matrices
/// (depending on the addressing) and the map values used for indirection.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Binding<'a> {
    pub data: usize,
    pub map: Option<&'a [usize]>,
    pub col_map: Option<&'a [usize]>,
}

/// The locked data of one loop.
pub(crate) struct LoopData<'a, T> {
    pub bindings: Vec<Binding<'a>>,
    pub dats: Vec<DatStorage<'a, T>>,
    /// Values of the globals at the start of the loop.
    pub globals: Vec<Vec<T>>,
    pub mats: Vec<CsrParAccumulator<'a, T>>,
    /// Only iterations below this index contribute to global reductions.
    pub owned_end: usize,
}

/// Per-thread scratch memory.
#[derive(Debug)]
pub(crate) struct Workspace<T> {
    buffer: Vec<T>,
    staging: Vec<T>,
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl<T> Default for Workspace<T> {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            staging: Vec::new(),
            rows: Vec::new(),
            cols: Vec::new(),
        }
    }
}

/// The generated gather/compute/scatter routine for one loop structure.
#[derive(Debug)]
pub struct Marshaller {
    signature: u64,
    backend: Backend,
    slots: Vec<Slot>,
    layout: Vec<Range<usize>>,
    workspace_len: usize,
    reduction_len: usize,
}

impl Marshaller {
    fn signature_of<T>(kernel: &Kernel<T>, args: &[Arg<'_, T>], backend: Backend) -> u64 {
        let mut hasher = fxhash::FxHasher64::default();
        kernel.signature().hash(&mut hasher);
        backend.hash(&mut hasher);
        for arg in args {
            arg.access().hash(&mut hasher);
            Addressing::of(arg).hash(&mut hasher);
        }
        hasher.finish()
    }

    fn compile<T>(kernel: &Kernel<T>, args: &[Arg<'_, T>], backend: Backend, signature: u64) -> Self {
        let mut offset = 0;
        let mut reduction_offset = 0;
        let mut slots = Vec::with_capacity(args.len());
        for arg in args {
            let addressing = Addressing::of(arg);
            let len = addressing.len();
            let reduction = match (arg.target(), arg.access()) {
                (Target::Global(_), access) if access.is_reduction() => {
                    let range = reduction_offset..reduction_offset + len;
                    reduction_offset += len;
                    Some(range)
                }
                _ => None,
            };
            slots.push(Slot {
                range: offset..offset + len,
                access: arg.access(),
                addressing,
                reduction,
            });
            offset += len;
        }

        debug!(
            "Generated marshaller for kernel '{}' ({:?}): {} arguments, {} workspace values",
            kernel.name(),
            backend,
            args.len(),
            offset
        );

        Self {
            signature,
            backend,
            layout: slots.iter().map(|slot| slot.range.clone()).collect(),
            slots,
            workspace_len: offset,
            reduction_len: reduction_offset,
        }
    }

    pub fn signature(&self) -> u64 {
        self.signature
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn num_args(&self) -> usize {
        self.slots.len()
    }

    /// Number of values in the workspace of a single kernel invocation.
    pub fn workspace_len(&self) -> usize {
        self.workspace_len
    }

    pub fn has_reductions(&self) -> bool {
        self.reduction_len > 0
    }

    /// Running reduction values before any iteration has contributed.
    pub(crate) fn initial_partials<T: Value>(&self, data: &LoopData<'_, T>) -> Vec<T> {
        let mut partials = vec![T::zero(); self.reduction_len];
        for (slot, binding) in self.slots.iter().zip(&data.bindings) {
            if let Some(range) = &slot.reduction {
                if slot.access != Access::Inc {
                    partials[range.clone()].copy_from_slice(&data.globals[binding.data]);
                }
            }
        }
        partials
    }

    /// Fold `partial` into `accumulated`.
    pub(crate) fn combine_partials<T: Value>(&self, accumulated: &mut [T], partial: &[T]) {
        for slot in &self.slots {
            if let Some(range) = &slot.reduction {
                combine(slot.access, &mut accumulated[range.clone()], &partial[range.clone()]);
            }
        }
    }

    /// The final value of every reduced global: `(global index, value)`.
    pub(crate) fn finalize_reductions<T: Value>(&self, data: &LoopData<'_, T>, total: &[T]) -> Vec<(usize, Vec<T>)> {
        self.slots
            .iter()
            .zip(&data.bindings)
            .filter_map(|(slot, binding)| {
                let range = slot.reduction.clone()?;
                let mut value = data.globals[binding.data].clone();
                match slot.access {
                    Access::Inc => combine(Access::Inc, &mut value, &total[range]),
                    _ => value.copy_from_slice(&total[range]),
                }
                Some((binding.data, value))
            })
            .collect()
    }

    /// Run the kernel for every iteration of a block, then commit the results of the block.
    ///
    /// Returns the block's contribution to the global reductions. If the kernel fails for
    /// any iteration, nothing of the block is committed.
    pub(crate) fn run_block<T: Value>(
        &self,
        kernel: &Kernel<T>,
        data: &LoopData<'_, T>,
        elements: &[usize],
        ws: &mut Workspace<T>,
    ) -> Result<Vec<T>, ExecutionError> {
        let mut partials = self.initial_partials(data);
        let len = self.workspace_len;
        ws.buffer.resize(len, T::zero());
        ws.staging.clear();

        for &e in elements {
            // Sound: the plan guarantees that no iteration running concurrently writes to
            // anything this iteration reads.
            unsafe { self.gather(data, e, &partials, &mut ws.buffer) };
            let mut buffers = KernelBuffers::new(e, &mut ws.buffer, &self.layout);
            kernel
                .call(&mut buffers)
                .map_err(|source| ExecutionError::KernelFailed {
                    kernel: kernel.name().to_string(),
                    iteration: e,
                    source,
                })?;
            if self.reduction_len > 0 && e < data.owned_end {
                self.combine_partials(&mut partials, &self.reduction_view(&ws.buffer));
            }
            ws.staging.extend_from_slice(&ws.buffer);
        }

        let Workspace {
            staging, rows, cols, ..
        } = ws;
        for (k, &e) in elements.iter().enumerate() {
            let buffer = &staging[k * len..(k + 1) * len];
            // Sound: iterations of one color write to disjoint entities and matrix rows.
            unsafe { self.scatter(data, e, buffer, rows, cols) }.map_err(|source| ExecutionError::Assembly {
                context: kernel.name().to_string(),
                source,
            })?;
        }
        Ok(partials)
    }

    /// The reduction slots of a kernel buffer, laid out like the partials.
    fn reduction_view<T: Value>(&self, buffer: &[T]) -> Vec<T> {
        let mut view = Vec::with_capacity(self.reduction_len);
        for slot in &self.slots {
            if slot.reduction.is_some() {
                view.extend_from_slice(&buffer[slot.range.clone()]);
            }
        }
        view
    }

    unsafe fn gather<T: Value>(&self, data: &LoopData<'_, T>, e: usize, partials: &[T], buffer: &mut [T]) {
        for (slot, binding) in self.slots.iter().zip(&data.bindings) {
            let out = &mut buffer[slot.range.clone()];
            if !slot.access.reads() {
                out.fill(T::zero());
                continue;
            }
            match slot.addressing {
                Addressing::Direct { dim } => {
                    out.copy_from_slice(data.dats[binding.data].read(dim * e..dim * (e + 1)));
                }
                Addressing::Indirect { index, arity, dim } => {
                    let map = binding.map.unwrap_or_default();
                    gather_entity(&data.dats[binding.data], map[arity * e + index], dim, out);
                }
                Addressing::IndirectAll { arity, dim } => {
                    let map = binding.map.unwrap_or_default();
                    for (j, chunk) in out.chunks_exact_mut(dim.max(1)).enumerate().take(arity) {
                        gather_entity(&data.dats[binding.data], map[arity * e + j], dim, chunk);
                    }
                }
                Addressing::Global { .. } => match &slot.reduction {
                    Some(range) => out.copy_from_slice(&partials[range.clone()]),
                    None => out.copy_from_slice(&data.globals[binding.data]),
                },
                Addressing::MatBlock { .. } => out.fill(T::zero()),
            }
        }
    }

    unsafe fn scatter<T: Value>(
        &self,
        data: &LoopData<'_, T>,
        e: usize,
        buffer: &[T],
        rows: &mut Vec<usize>,
        cols: &mut Vec<usize>,
    ) -> Result<(), parloop_sparse::MissingEntryError> {
        for (slot, binding) in self.slots.iter().zip(&data.bindings) {
            if !slot.access.writes() {
                continue;
            }
            let values = &buffer[slot.range.clone()];
            match slot.addressing {
                Addressing::Direct { dim } => {
                    let target = data.dats[binding.data].write(dim * e..dim * (e + 1));
                    apply(slot.access, target, values);
                }
                Addressing::Indirect { index, arity, dim } => {
                    let map = binding.map.unwrap_or_default();
                    scatter_entity(&data.dats[binding.data], map[arity * e + index], dim, slot.access, values);
                }
                Addressing::IndirectAll { arity, dim } => {
                    let map = binding.map.unwrap_or_default();
                    for (j, chunk) in values.chunks_exact(dim.max(1)).enumerate().take(arity) {
                        scatter_entity(&data.dats[binding.data], map[arity * e + j], dim, slot.access, chunk);
                    }
                }
                Addressing::Global { .. } => {}
                Addressing::MatBlock {
                    row_arity,
                    row_dim,
                    col_arity,
                    col_dim,
                } => {
                    let row_map = binding.map.unwrap_or_default();
                    let col_map = binding.col_map.unwrap_or_default();
                    expand_indices(&row_map[row_arity * e..row_arity * (e + 1)], row_dim, rows);
                    expand_indices(&col_map[col_arity * e..col_arity * (e + 1)], col_dim, cols);
                    data.mats[binding.data].add_local_block(rows, cols, values)?;
                }
            }
        }
        Ok(())
    }
}

unsafe fn gather_entity<T: Value>(storage: &DatStorage<'_, T>, entity: usize, dim: usize, out: &mut [T]) {
    if entity == SENTINEL {
        out.fill(T::zero());
    } else {
        out.copy_from_slice(storage.read(dim * entity..dim * (entity + 1)));
    }
}

unsafe fn scatter_entity<T: Value>(storage: &DatStorage<'_, T>, entity: usize, dim: usize, access: Access, values: &[T]) {
    if entity != SENTINEL {
        apply(access, storage.write(dim * entity..dim * (entity + 1)), values);
    }
}

fn apply<T: Value>(access: Access, target: &mut [T], values: &[T]) {
    match access {
        Access::Inc => {
            for (t, &v) in target.iter_mut().zip(values) {
                *t += v;
            }
        }
        _ => target.copy_from_slice(values),
    }
}

fn combine<T: Value>(access: Access, accumulated: &mut [T], partial: &[T]) {
    for (a, &p) in accumulated.iter_mut().zip(partial) {
        match access {
            Access::Inc => *a += p,
            Access::Min if p < *a => *a = p,
            Access::Max if p > *a => *a = p,
            _ => {}
        }
    }
}

/// Expand entity indices into scalar indices, `dim` per entity. Sentinels stay sentinels.
fn expand_indices(entities: &[usize], dim: usize, out: &mut Vec<usize>) {
    out.clear();
    for &entity in entities {
        for i in 0..dim {
            out.push(if entity == SENTINEL { SENTINEL } else { dim * entity + i });
        }
    }
}

/// Cache of generated marshallers, keyed by their structural signature.
#[derive(Debug, Default)]
pub struct MarshallerCache {
    entries: Mutex<FxHashMap<u64, Arc<Marshaller>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl MarshallerCache {
    pub fn get_or_compile<T>(&self, kernel: &Kernel<T>, args: &[Arg<'_, T>], backend: Backend) -> Arc<Marshaller> {
        let signature = Marshaller::signature_of(kernel, args, backend);
        let mut entries = self.entries.lock();
        if let Some(marshaller) = entries.get(&signature) {
            trace!("Marshaller cache hit for kernel '{}'", kernel.name());
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(marshaller);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let marshaller = Arc::new(Marshaller::compile(kernel, args, backend, signature));
        entries.insert(signature, Arc::clone(&marshaller));
        marshaller
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
