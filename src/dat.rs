//! Data attached to sets ([`Dat`]) and free-standing reduction values ([`Global`]).
use crate::error::{ExecutionError, TopologyError};
use crate::set::Set;
use crate::Value;
use nalgebra::DVector;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

static NEXT_DATA_ID: AtomicUsize = AtomicUsize::new(0);

/// Process-unique identity of a data object ([`Dat`], [`Global`] or [`Mat`](crate::Mat)).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataId(usize);

impl DataId {
    pub(crate) fn next() -> Self {
        Self(NEXT_DATA_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) fn busy(name: &str) -> ExecutionError {
    ExecutionError::Busy { name: name.to_string() }
}

/// Values attached to every entity of a set, `dim` values per entity.
///
/// The values of core and owned entities are always valid. The values of halo entities are
/// only valid while the halo is clean; any write marks the halo dirty, and a halo exchange
/// cleans it again.
pub struct Dat<T> {
    id: DataId,
    name: String,
    set: Set,
    dim: usize,
    values: RwLock<Vec<T>>,
    halo_dirty: AtomicBool,
}

impl<T> fmt::Debug for Dat<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dat")
            .field("name", &self.name)
            .field("set", &self.set.name())
            .field("dim", &self.dim)
            .field("halo_dirty", &self.is_halo_dirty())
            .finish()
    }
}

impl<T: Value> Dat<T> {
    /// A zero-initialized dat. Zeros are consistent across ranks, so the halo starts clean.
    pub fn new(name: impl Into<String>, set: &Set, dim: usize) -> Self {
        let values = vec![T::zero(); dim * set.total_size()];
        Self::from_parts(name.into(), set, dim, values)
    }

    /// A dat with the given values for every local entity, halo included.
    ///
    /// The caller is responsible for the halo values being consistent with their owners; the
    /// halo starts clean.
    pub fn from_values(name: impl Into<String>, set: &Set, dim: usize, values: Vec<T>) -> Result<Self, TopologyError> {
        let name = name.into();
        let expected = dim * set.total_size();
        if values.len() != expected {
            return Err(TopologyError::LengthMismatch {
                name,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self::from_parts(name, set, dim, values))
    }

    fn from_parts(name: String, set: &Set, dim: usize, values: Vec<T>) -> Self {
        Self {
            id: DataId::next(),
            name,
            set: set.clone(),
            dim,
            values: RwLock::new(values),
            halo_dirty: AtomicBool::new(false),
        }
    }

    /// Copy of all local values, halo included.
    pub fn to_vec(&self) -> Vec<T> {
        self.values.read().clone()
    }

    /// Copy of the values of the entity.
    ///
    /// Panics if the entity is out of bounds.
    pub fn entity(&self, index: usize) -> Vec<T> {
        self.values.read()[self.dim * index..self.dim * (index + 1)].to_vec()
    }

    /// The owned values as a vector, the hand-off format for solvers.
    pub fn owned_to_dvector(&self) -> DVector<T> {
        let values = self.values.read();
        DVector::from_column_slice(&values[..self.dim * self.set.owned_end()])
    }
}

impl<T> Dat<T> {
    pub fn id(&self) -> DataId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self) -> &Set {
        &self.set
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_halo_dirty(&self) -> bool {
        self.halo_dirty.load(Ordering::Acquire)
    }

    /// Mark the halo values as stale, so that the next loop reading them exchanges first.
    pub fn mark_halo_dirty(&self) {
        self.halo_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn mark_halo_clean(&self) {
        self.halo_dirty.store(false, Ordering::Release);
    }

    /// Blocking shared access to the values.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.values.read()
    }

    /// Blocking exclusive access to the values. Marks the halo dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        let guard = self.values.write();
        self.mark_halo_dirty();
        guard
    }

    pub(crate) fn try_read(&self) -> Result<RwLockReadGuard<'_, Vec<T>>, ExecutionError> {
        self.values.try_read().ok_or_else(|| busy(&self.name))
    }

    pub(crate) fn try_write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>, ExecutionError> {
        self.values.try_write().ok_or_else(|| busy(&self.name))
    }
}

/// A small fixed-size value that is not attached to a set.
///
/// Used as a read-only kernel parameter, or as the target of an `Inc`, `Min` or `Max`
/// reduction over all owned iterations of a loop (and all ranks).
pub struct Global<T> {
    id: DataId,
    name: String,
    dim: usize,
    values: RwLock<Vec<T>>,
}

impl<T: fmt::Debug> fmt::Debug for Global<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Global")
            .field("name", &self.name)
            .field("values", &*self.values.read())
            .finish()
    }
}

impl<T: Value> Global<T> {
    pub fn new(name: impl Into<String>, dim: usize) -> Self {
        Self::from_values(name, vec![T::zero(); dim])
    }

    pub fn from_values(name: impl Into<String>, values: Vec<T>) -> Self {
        Self {
            id: DataId::next(),
            name: name.into(),
            dim: values.len(),
            values: RwLock::new(values),
        }
    }

    pub fn value(&self) -> Vec<T> {
        self.values.read().clone()
    }

    /// Replace the value.
    ///
    /// Panics if the dimension changes.
    pub fn set_value(&self, values: &[T]) {
        let mut current = self.values.write();
        assert_eq!(current.len(), values.len(), "Global dimension cannot change.");
        current.copy_from_slice(values);
    }
}

impl<T> Global<T> {
    pub fn id(&self) -> DataId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub(crate) fn try_read(&self) -> Result<RwLockReadGuard<'_, Vec<T>>, ExecutionError> {
        self.values.try_read().ok_or_else(|| busy(&self.name))
    }

    pub(crate) fn try_write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>, ExecutionError> {
        self.values.try_write().ok_or_else(|| busy(&self.name))
    }
}
