//! Sparse matrix functionality for parloop.
//!
//! The matrices assembled by parallel loops have a nonzero pattern that is fixed once the
//! incidence maps are known, while the values are zeroed and re-accumulated many times. The
//! pattern is therefore shared (`Arc`) between the matrix and anything that wants to inspect it.
//!
//! Local contributions are addressed through row and column indices that may contain the
//! [`SENTINEL`] marker. Entries addressed through a sentinel are silently dropped, which is how
//! boundary rows and columns are excluded from an assembled operator.

use nalgebra::{DMatrix, Scalar};
use num::Zero;
use parloop_paradis::slice::ParallelSliceAccess;
use rayon::slice::ParallelSliceMut;
use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;

/// Out-of-range marker. Contributions addressed through this index are dropped.
pub const SENTINEL: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SparsityPatternError {
    /// The offsets do not start at zero, decrease, or do not end at the number of indices.
    InvalidOffsets,
    /// The indices of a row are not strictly increasing.
    UnsortedOrDuplicateIndices { row: usize },
    /// A coordinate or index is out of bounds.
    IndexOutOfBounds { row: usize, col: usize },
}

impl fmt::Display for SparsityPatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOffsets => write!(f, "Invalid row offsets."),
            Self::UnsortedOrDuplicateIndices { row } => {
                write!(f, "Column indices of row {} are unsorted or contain duplicates.", row)
            }
            Self::IndexOutOfBounds { row, col } => {
                write!(f, "Entry ({}, {}) is out of bounds.", row, col)
            }
        }
    }
}

impl std::error::Error for SparsityPatternError {}

/// Error returned when a contribution addresses an entry outside the sparsity pattern.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MissingEntryError {
    pub row: usize,
    pub col: usize,
}

impl fmt::Display for MissingEntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entry ({}, {}) is not part of the sparsity pattern.", self.row, self.col)
    }
}

impl std::error::Error for MissingEntryError {}

/// Row-major (CSR) nonzero pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsityPattern {
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    ncols: usize,
}

impl SparsityPattern {
    /// An empty pattern with the given shape.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            row_offsets: vec![0; nrows + 1],
            col_indices: Vec::new(),
            ncols,
        }
    }

    pub fn try_from_offsets_and_indices(
        nrows: usize,
        ncols: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
    ) -> Result<Self, SparsityPatternError> {
        if row_offsets.len() != nrows + 1
            || row_offsets[0] != 0
            || row_offsets[nrows] != col_indices.len()
            || row_offsets.windows(2).any(|w| w[0] > w[1])
        {
            return Err(SparsityPatternError::InvalidOffsets);
        }

        for row in 0..nrows {
            let lane = &col_indices[row_offsets[row]..row_offsets[row + 1]];
            if lane.windows(2).any(|w| w[0] >= w[1]) {
                return Err(SparsityPatternError::UnsortedOrDuplicateIndices { row });
            }
            if let Some(&col) = lane.iter().find(|&&col| col >= ncols) {
                return Err(SparsityPatternError::IndexOutOfBounds { row, col });
            }
        }

        Ok(Self {
            row_offsets,
            col_indices,
            ncols,
        })
    }

    /// Build a pattern from (possibly duplicated, unsorted) coordinates.
    ///
    /// Coordinates containing [`SENTINEL`] are skipped.
    pub fn from_coordinates(
        nrows: usize,
        ncols: usize,
        mut coordinates: Vec<(usize, usize)>,
    ) -> Result<Self, SparsityPatternError> {
        coordinates.retain(|&(i, j)| i != SENTINEL && j != SENTINEL);
        if let Some(&(row, col)) = coordinates.iter().find(|&&(i, j)| i >= nrows || j >= ncols) {
            return Err(SparsityPatternError::IndexOutOfBounds { row, col });
        }

        coordinates.par_sort_unstable();
        coordinates.dedup();

        let mut row_offsets = Vec::with_capacity(nrows + 1);
        let mut col_indices = Vec::with_capacity(coordinates.len());
        row_offsets.push(0);
        let mut current_row = 0;
        for (i, j) in coordinates {
            // A while loop, so that consecutive empty rows are handled correctly
            while i > current_row {
                row_offsets.push(col_indices.len());
                current_row += 1;
            }
            col_indices.push(j);
        }
        while row_offsets.len() < nrows + 1 {
            row_offsets.push(col_indices.len());
        }

        Ok(Self {
            row_offsets,
            col_indices,
            ncols,
        })
    }

    pub fn nrows(&self) -> usize {
        self.row_offsets.len() - 1
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.col_indices.len()
    }

    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    /// The column indices of the given row.
    pub fn lane(&self, row: usize) -> Option<&[usize]> {
        let begin = *self.row_offsets.get(row)?;
        let end = *self.row_offsets.get(row + 1)?;
        Some(&self.col_indices[begin..end])
    }

    /// Position of entry `(row, col)` in the value array, if it is part of the pattern.
    pub fn entry_position(&self, row: usize, col: usize) -> Option<usize> {
        let lane = self.lane(row)?;
        lane.binary_search(&col)
            .ok()
            .map(|local| self.row_offsets[row] + local)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    pattern: Arc<SparsityPattern>,
    values: Vec<T>,
}

impl<T> CsrMatrix<T> {
    pub fn from_pattern_and_values(pattern: Arc<SparsityPattern>, values: Vec<T>) -> Self {
        assert_eq!(pattern.nnz(), values.len(), "Need exactly one value per nonzero.");
        Self { pattern, values }
    }

    pub fn zeros(pattern: Arc<SparsityPattern>) -> Self
    where
        T: Zero + Clone,
    {
        let values = vec![T::zero(); pattern.nnz()];
        Self { pattern, values }
    }

    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.pattern
    }

    pub fn nrows(&self) -> usize {
        self.pattern.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.pattern.ncols()
    }

    pub fn nnz(&self) -> usize {
        self.pattern.nnz()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    pub fn fill(&mut self, value: T)
    where
        T: Clone,
    {
        self.values.fill(value);
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        self.pattern
            .entry_position(row, col)
            .map(|pos| &self.values[pos])
    }

    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut T> {
        let pos = self.pattern.entry_position(row, col)?;
        Some(&mut self.values[pos])
    }

    /// Column indices and values of a row.
    pub fn row(&self, row: usize) -> (&[usize], &[T]) {
        let offsets = self.pattern.row_offsets();
        let range = offsets[row]..offsets[row + 1];
        (&self.pattern.col_indices()[range.clone()], &self.values[range])
    }

    /// Column indices and mutable values of a row.
    pub fn row_mut(&mut self, row: usize) -> (&[usize], &mut [T]) {
        let offsets = self.pattern.row_offsets();
        let range = offsets[row]..offsets[row + 1];
        (&self.pattern.col_indices()[range.clone()], &mut self.values[range])
    }

    /// Iterate over all stored entries as `(row, col, value)`.
    pub fn triplet_iter(&self) -> impl '_ + Iterator<Item = (usize, usize, &T)> {
        (0..self.nrows()).flat_map(move |i| {
            let (cols, values) = self.row(i);
            cols.iter().zip(values).map(move |(&j, v)| (i, j, v))
        })
    }

    /// Add a dense, row-major local block into the matrix.
    ///
    /// `rows` and `cols` give the global row and column of every local row and column. Entries
    /// whose row or column is [`SENTINEL`] are dropped.
    pub fn add_local_block(&mut self, rows: &[usize], cols: &[usize], block: &[T]) -> Result<(), MissingEntryError>
    where
        T: Copy + AddAssign,
    {
        let access = self.par_accumulator();
        // Sound: we hold the only access to the matrix through &mut self.
        unsafe { access.add_local_block(rows, cols, block) }
    }

    /// Create an accumulator that lets several threads add blocks into disjoint rows.
    pub fn par_accumulator(&mut self) -> CsrParAccumulator<'_, T> {
        CsrParAccumulator {
            pattern: &self.pattern,
            values: ParallelSliceAccess::new(&mut self.values),
        }
    }

    pub fn to_dense(&self) -> DMatrix<T>
    where
        T: Scalar + Zero + Copy,
    {
        let mut dense = DMatrix::zeros(self.nrows(), self.ncols());
        for (i, j, v) in self.triplet_iter() {
            dense[(i, j)] = *v;
        }
        dense
    }
}

impl<'a, T: Scalar> From<&'a CsrMatrix<T>> for nalgebra_sparse::CsrMatrix<T> {
    fn from(matrix: &'a CsrMatrix<T>) -> Self {
        let pattern = matrix.pattern();
        nalgebra_sparse::CsrMatrix::try_from_csr_data(
            pattern.nrows(),
            pattern.ncols(),
            pattern.row_offsets().to_vec(),
            pattern.col_indices().to_vec(),
            matrix.values().to_vec(),
        )
        .expect("Pattern is validated on construction")
    }
}

/// Shared accumulation into a CSR matrix from several threads.
///
/// Blocks may be added concurrently as long as no two threads add into the same row at the
/// same time.
#[derive(Clone)]
pub struct CsrParAccumulator<'a, T> {
    pattern: &'a SparsityPattern,
    values: ParallelSliceAccess<'a, T>,
}

impl<'a, T: Copy + AddAssign> CsrParAccumulator<'a, T> {
    /// Add a dense, row-major local block. See [`CsrMatrix::add_local_block`].
    ///
    /// # Safety
    ///
    /// No other thread may concurrently add into any of the rows in `rows`.
    pub unsafe fn add_local_block(&self, rows: &[usize], cols: &[usize], block: &[T]) -> Result<(), MissingEntryError> {
        assert_eq!(rows.len() * cols.len(), block.len(), "Block size must match row and column counts.");
        for (local_row, &row) in rows.iter().enumerate() {
            if row == SENTINEL {
                continue;
            }
            let offsets = self.pattern.row_offsets();
            let lane_range = offsets[row]..offsets[row + 1];
            let lane = &self.pattern.col_indices()[lane_range.clone()];
            let values = self.values.subslice_mut(lane_range);
            let local_values = &block[local_row * cols.len()..(local_row + 1) * cols.len()];
            for (&col, &value) in cols.iter().zip(local_values) {
                if col == SENTINEL {
                    continue;
                }
                let pos = lane
                    .binary_search(&col)
                    .map_err(|_| MissingEntryError { row, col })?;
                values[pos] += value;
            }
        }
        Ok(())
    }
}
