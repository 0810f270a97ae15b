//! Sparsity patterns built from incidence maps, and matrices over them.
use crate::dat::{busy, DataId};
use crate::error::{Error, ExecutionError, TopologyError};
use crate::map::{Map, MapId};
use crate::set::Set;
use crate::Value;
use log::debug;
use nalgebra::DMatrix;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use parloop_sparse::{CsrMatrix, SparsityPattern, SENTINEL};
use std::fmt;
use std::sync::Arc;

struct SparsityInner {
    name: String,
    row_set: Set,
    col_set: Set,
    dims: (usize, usize),
    map_pairs: Vec<(Map, Map)>,
    pattern: Arc<SparsityPattern>,
}

/// The nonzero layout of a matrix: the union of all local blocks addressed through a number of
/// (row map, column map) pairs.
///
/// Every entity contributes `row_dim x col_dim` scalar entries per addressed (row, column)
/// pair. When rows and columns live on the same set with the same dimension, the diagonal is
/// always part of the pattern, so that rows excluded through sentinels can still receive a
/// diagonal value.
#[derive(Clone)]
pub struct Sparsity {
    inner: Arc<SparsityInner>,
}

impl fmt::Debug for Sparsity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sparsity")
            .field("name", &self.inner.name)
            .field("dims", &self.inner.dims)
            .field("nnz", &self.inner.pattern.nnz())
            .finish()
    }
}

impl Sparsity {
    pub fn new(name: impl Into<String>, map_pairs: &[(Map, Map)], dims: (usize, usize)) -> Result<Self, TopologyError> {
        let name = name.into();
        let incompatible = |reason: String| TopologyError::IncompatibleMaps { reason };
        let (first_rows, first_cols) = map_pairs
            .first()
            .ok_or_else(|| incompatible(format!("sparsity '{}' needs at least one map pair", name)))?;
        let row_set = first_rows.target().clone();
        let col_set = first_cols.target().clone();

        for (rows, cols) in map_pairs {
            if rows.source() != cols.source() {
                return Err(incompatible(format!(
                    "row map '{}' and column map '{}' have different source sets",
                    rows.name(),
                    cols.name()
                )));
            }
            if rows.target() != &row_set || cols.target() != &col_set {
                return Err(incompatible(format!(
                    "map pair ('{}', '{}') does not share the row and column sets of sparsity '{}'",
                    rows.name(),
                    cols.name(),
                    name
                )));
            }
        }

        let (row_dim, col_dim) = dims;
        let nrows = row_dim * row_set.total_size();
        let ncols = col_dim * col_set.total_size();
        let mut coordinates = Vec::new();
        for (rows, cols) in map_pairs {
            for entity in 0..rows.source().total_size() {
                for &r in rows.row(entity) {
                    for &c in cols.row(entity) {
                        if r == SENTINEL || c == SENTINEL {
                            continue;
                        }
                        for i in 0..row_dim {
                            for j in 0..col_dim {
                                coordinates.push((row_dim * r + i, col_dim * c + j));
                            }
                        }
                    }
                }
            }
        }
        if row_set == col_set && row_dim == col_dim {
            coordinates.extend((0..nrows).map(|i| (i, i)));
        }

        let pattern = SparsityPattern::from_coordinates(nrows, ncols, coordinates)
            .map_err(|err| incompatible(format!("sparsity '{}': {}", name, err)))?;
        debug!(
            "Built sparsity '{}' ({} x {}, {} nonzeros) from {} map pair(s)",
            name,
            nrows,
            ncols,
            pattern.nnz(),
            map_pairs.len()
        );

        Ok(Self {
            inner: Arc::new(SparsityInner {
                name,
                row_set,
                col_set,
                dims,
                map_pairs: map_pairs.to_vec(),
                pattern: Arc::new(pattern),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn row_set(&self) -> &Set {
        &self.inner.row_set
    }

    pub fn col_set(&self) -> &Set {
        &self.inner.col_set
    }

    /// `(row_dim, col_dim)`
    pub fn dims(&self) -> (usize, usize) {
        self.inner.dims
    }

    pub fn map_pairs(&self) -> &[(Map, Map)] {
        &self.inner.map_pairs
    }

    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.inner.pattern
    }

    /// Whether the pattern covers all blocks addressed through the given maps (or maps derived
    /// from them).
    pub fn contains_pair(&self, rows: &Map, cols: &Map) -> bool {
        let key: (MapId, MapId) = (rows.base_id(), cols.base_id());
        self.inner
            .map_pairs
            .iter()
            .any(|(r, c)| (r.base_id(), c.base_id()) == key)
    }
}

/// A sparse matrix over a [`Sparsity`].
///
/// The pattern is fixed. Values can be zeroed and reassembled any number of times.
pub struct Mat<T> {
    id: DataId,
    name: String,
    sparsity: Sparsity,
    values: RwLock<CsrMatrix<T>>,
}

impl<T> fmt::Debug for Mat<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mat")
            .field("name", &self.name)
            .field("sparsity", &self.sparsity)
            .finish()
    }
}

impl<T: Value> Mat<T> {
    pub fn new(name: impl Into<String>, sparsity: &Sparsity) -> Self {
        Self {
            id: DataId::next(),
            name: name.into(),
            sparsity: sparsity.clone(),
            values: RwLock::new(CsrMatrix::zeros(Arc::clone(sparsity.pattern()))),
        }
    }

    /// Set all stored values to zero.
    pub fn zero(&self) -> Result<(), Error> {
        self.try_write()?.fill(T::zero());
        Ok(())
    }

    /// Put `value` on the diagonal of every scalar row belonging to the given row entities.
    ///
    /// Used together with [`Map::with_sentinels`] to impose boundary conditions: the boundary
    /// rows are left empty by assembly and receive a diagonal value here.
    pub fn set_diagonal(&self, entities: &[usize], value: T) -> Result<(), Error> {
        let (row_dim, _) = self.sparsity.dims();
        let mut matrix = self.try_write()?;
        for &entity in entities {
            for i in 0..row_dim {
                let row = row_dim * entity + i;
                let entry = matrix
                    .get_mut(row, row)
                    .ok_or_else(|| ExecutionError::Assembly {
                        context: format!("set_diagonal on '{}'", self.name),
                        source: parloop_sparse::MissingEntryError { row, col: row },
                    })?;
                *entry = value;
            }
        }
        Ok(())
    }

    /// Copy of the stored value at `(row, col)`, if the entry is part of the pattern.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        self.values.read().get(row, col).copied()
    }

    /// Convert to a `nalgebra-sparse` matrix for hand-off to a solver.
    pub fn to_csr(&self) -> nalgebra_sparse::CsrMatrix<T> {
        nalgebra_sparse::CsrMatrix::from(&*self.values.read())
    }

    pub fn to_dense(&self) -> DMatrix<T> {
        self.values.read().to_dense()
    }
}

impl<T> Mat<T> {
    pub fn id(&self) -> DataId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sparsity(&self) -> &Sparsity {
        &self.sparsity
    }

    /// Blocking shared access to the underlying CSR matrix.
    pub fn read(&self) -> RwLockReadGuard<'_, CsrMatrix<T>> {
        self.values.read()
    }

    pub(crate) fn try_write(&self) -> Result<RwLockWriteGuard<'_, CsrMatrix<T>>, ExecutionError> {
        self.values.try_write().ok_or_else(|| busy(&self.name))
    }
}
