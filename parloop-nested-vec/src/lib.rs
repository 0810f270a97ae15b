//! Compact storage for a sequence of variable-length groups.
//!
//! `NestedVec` stores all groups back-to-back in a single buffer together with a table of
//! offsets, in the same way a CSR matrix stores its rows. It is used throughout `parloop` for
//! element adjacency lists, the elements of each color class and the element ranges of blocks.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Debug;
use std::ops::Range;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedVec<T> {
    data: Vec<T>,
    // offsets[i] .. offsets[i + 1] is the range of group i. Always has at least one entry.
    offsets: Vec<usize>,
}

impl<T: Debug> Debug for NestedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T> Default for NestedVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when offsets and data do not describe a valid `NestedVec`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InvalidOffsets;

impl fmt::Display for InvalidOffsets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Offsets must start at zero, be non-decreasing and end at the length of the data."
        )
    }
}

impl std::error::Error for InvalidOffsets {}

impl<T> NestedVec<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            offsets: vec![0],
        }
    }

    pub fn with_capacity(num_groups: usize, num_elements: usize) -> Self {
        let mut offsets = Vec::with_capacity(num_groups + 1);
        offsets.push(0);
        Self {
            data: Vec::with_capacity(num_elements),
            offsets,
        }
    }

    /// Construct from CSR-like offsets and data.
    pub fn try_from_offsets_and_data(offsets: Vec<usize>, data: Vec<T>) -> Result<Self, InvalidOffsets> {
        let starts_at_zero = offsets.first() == Some(&0);
        let ends_at_len = offsets.last() == Some(&data.len());
        let non_decreasing = offsets.windows(2).all(|w| w[0] <= w[1]);
        if starts_at_zero && ends_at_len && non_decreasing {
            Ok(Self { data, offsets })
        } else {
            Err(InvalidOffsets)
        }
    }

    /// Begin a new group whose elements are appended one at a time.
    ///
    /// The group is committed when the returned appender is dropped, so the result is
    /// equivalent to pushing the whole group at once with [`NestedVec::push`].
    pub fn begin_group(&mut self) -> GroupAppender<'_, T> {
        GroupAppender {
            initial_len: self.data.len(),
            data: &mut self.data,
            offsets: &mut self.offsets,
        }
    }

    pub fn iter(&self) -> impl '_ + ExactSizeIterator<Item = &[T]> {
        self.offsets
            .windows(2)
            .map(move |w| &self.data[w[0]..w[1]])
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of elements across all groups.
    pub fn total_len(&self) -> usize {
        self.data.len()
    }

    pub fn get(&self, index: usize) -> Option<&[T]> {
        let range = self.group_range(index)?;
        self.data.get(range)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut [T]> {
        let range = self.group_range(index)?;
        self.data.get_mut(range)
    }

    pub fn group_range(&self, index: usize) -> Option<Range<usize>> {
        let begin = *self.offsets.get(index)?;
        let end = *self.offsets.get(index + 1)?;
        Some(begin..end)
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// All elements of all groups, back to back.
    pub fn flat(&self) -> &[T] {
        &self.data
    }

    pub fn last(&self) -> Option<&[T]> {
        self.len().checked_sub(1).and_then(|idx| self.get(idx))
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.offsets.truncate(1);
    }
}

impl<T: Clone> NestedVec<T> {
    pub fn push(&mut self, group: &[T]) {
        self.data.extend_from_slice(group);
        self.offsets.push(self.data.len());
    }
}

#[derive(Debug)]
pub struct GroupAppender<'a, T> {
    data: &'a mut Vec<T>,
    offsets: &'a mut Vec<usize>,
    initial_len: usize,
}

impl<'a, T> GroupAppender<'a, T> {
    pub fn push_single(&mut self, element: T) -> &mut Self {
        self.data.push(element);
        self
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, elements: I) -> &mut Self {
        self.data.extend(elements);
        self
    }

    /// Number of elements pushed to the current group so far.
    pub fn count(&self) -> usize {
        self.data.len() - self.initial_len
    }

    /// The elements pushed to the current group so far.
    pub fn current(&self) -> &[T] {
        &self.data[self.initial_len..]
    }
}

impl<'a, T> Drop for GroupAppender<'a, T> {
    fn drop(&mut self) {
        self.offsets.push(self.data.len());
    }
}

impl<'a, T: Clone> From<&'a [Vec<T>]> for NestedVec<T> {
    fn from(groups: &'a [Vec<T>]) -> Self {
        let total = groups.iter().map(Vec::len).sum();
        let mut result = Self::with_capacity(groups.len(), total);
        for group in groups {
            result.push(group);
        }
        result
    }
}

impl<'a, T: Clone> From<&'a Vec<Vec<T>>> for NestedVec<T> {
    fn from(groups: &'a Vec<Vec<T>>) -> Self {
        Self::from(groups.as_slice())
    }
}

impl<T: Clone> From<Vec<Vec<T>>> for NestedVec<T> {
    fn from(groups: Vec<Vec<T>>) -> Self {
        Self::from(groups.as_slice())
    }
}

impl<'a, T: Clone> From<&'a NestedVec<T>> for Vec<Vec<T>> {
    fn from(nested: &'a NestedVec<T>) -> Self {
        nested.iter().map(<[T]>::to_vec).collect()
    }
}

impl<T: Clone> From<NestedVec<T>> for Vec<Vec<T>> {
    fn from(nested: NestedVec<T>) -> Self {
        Self::from(&nested)
    }
}
