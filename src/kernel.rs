//! Local kernels and the buffers they operate on.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::sync::Arc;

/// The shape of one kernel argument buffer: `rows x cols` values in row-major order.
///
/// A dat accessed through all indices of an arity-`k` map has shape `k x dim`, a single dat
/// entity or a global has shape `1 x dim`, and a matrix block has shape
/// `(row_arity * row_dim) x (col_arity * col_dim)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub fn vector(len: usize) -> Self {
        Self { rows: 1, cols: len }
    }

    pub fn matrix(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Signature of a kernel body.
pub type KernelFn<T> = dyn Fn(&mut KernelBuffers<'_, T>) -> eyre::Result<()> + Send + Sync;

/// A pure per-entity computation together with the shapes of the buffers it expects.
///
/// The body must only depend on its buffers: it may be invoked from any thread, in any order
/// within a color, and more than once for the same entity on different ranks.
#[derive(Clone)]
pub struct Kernel<T> {
    name: Arc<str>,
    shapes: Arc<[Shape]>,
    signature: u64,
    body: Arc<KernelFn<T>>,
}

impl<T> fmt::Debug for Kernel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("shapes", &self.shapes)
            .finish()
    }
}

impl<T> Kernel<T> {
    pub fn new<F>(name: impl Into<String>, shapes: Vec<Shape>, body: F) -> Self
    where
        F: Fn(&mut KernelBuffers<'_, T>) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let name: String = name.into();
        let mut hasher = fxhash::FxHasher64::default();
        name.hash(&mut hasher);
        shapes.hash(&mut hasher);
        Self {
            name: name.into(),
            shapes: shapes.into(),
            signature: hasher.finish(),
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    /// Content signature used to key generated marshallers.
    pub fn signature(&self) -> u64 {
        self.signature
    }

    pub(crate) fn call(&self, buffers: &mut KernelBuffers<'_, T>) -> eyre::Result<()> {
        (self.body)(buffers)
    }
}

/// The argument buffers of one kernel invocation, laid out back to back in a workspace.
pub struct KernelBuffers<'a, T> {
    iteration: usize,
    workspace: &'a mut [T],
    layout: &'a [Range<usize>],
}

impl<'a, T> KernelBuffers<'a, T> {
    /// `layout` must consist of consecutive, non-overlapping ranges in increasing order.
    pub(crate) fn new(iteration: usize, workspace: &'a mut [T], layout: &'a [Range<usize>]) -> Self {
        Self {
            iteration,
            workspace,
            layout,
        }
    }

    /// The index of the iteration entity this invocation computes.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn num_args(&self) -> usize {
        self.layout.len()
    }

    /// Panics if `index` is not an argument index.
    pub fn arg(&self, index: usize) -> &[T] {
        &self.workspace[self.layout[index].clone()]
    }

    /// Panics if `index` is not an argument index.
    pub fn arg_mut(&mut self, index: usize) -> &mut [T] {
        &mut self.workspace[self.layout[index].clone()]
    }

    /// Split into read access to all other arguments and write access to `output`.
    ///
    /// Panics if `output` is not an argument index.
    pub fn split_output(&mut self, output: usize) -> (KernelInputs<'_, T>, &mut [T]) {
        let Range { start, end } = self.layout[output].clone();
        let (before, rest) = self.workspace.split_at_mut(start);
        let (out, after) = rest.split_at_mut(end - start);
        let inputs = KernelInputs {
            output,
            before,
            after,
            after_offset: end,
            layout: self.layout,
        };
        (inputs, out)
    }

    /// Mutable access to all arguments at once.
    pub fn split_mut(&mut self) -> Vec<&mut [T]> {
        let mut remaining: &mut [T] = &mut *self.workspace;
        let mut consumed = 0;
        let mut buffers = Vec::with_capacity(self.layout.len());
        for range in self.layout.iter() {
            let (_, tail) = std::mem::take(&mut remaining).split_at_mut(range.start - consumed);
            let (buffer, tail) = tail.split_at_mut(range.end - range.start);
            buffers.push(buffer);
            remaining = tail;
            consumed = range.end;
        }
        buffers
    }
}

/// Read access to every argument except the one handed out mutably by
/// [`KernelBuffers::split_output`].
pub struct KernelInputs<'a, T> {
    output: usize,
    before: &'a [T],
    after: &'a [T],
    after_offset: usize,
    layout: &'a [Range<usize>],
}

impl<'a, T> KernelInputs<'a, T> {
    /// Panics if `index` is the output argument or not an argument index.
    pub fn arg(&self, index: usize) -> &[T] {
        assert_ne!(index, self.output, "The output argument is borrowed mutably.");
        let Range { start, end } = self.layout[index].clone();
        if index < self.output {
            &self.before[start..end]
        } else {
            &self.after[start - self.after_offset..end - self.after_offset]
        }
    }
}
