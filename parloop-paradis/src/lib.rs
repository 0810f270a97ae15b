//! paradis
//! =======
//!
//! Parallel processing of disjoint index subsets.
//!
//! The parallel-loop executor writes into shared storage from many threads at once. It is
//! sound to do so as long as no two threads touch the same record, which is exactly what a
//! coloring of the loop's conflict graph guarantees. This crate provides the pieces needed to
//! express that: unchecked parallel access to slices ([`slice::ParallelSliceAccess`]), a
//! checked container of disjoint index subsets ([`DisjointSubsets`]) and first-fit greedy
//! coloring ([`coloring::greedy_coloring`]).

pub mod coloring;
pub mod slice;

use parloop_nested_vec::NestedVec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A collection of index subsets in which no index appears in two different subsets.
///
/// An index may appear several times within the *same* subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisjointSubsets {
    subsets: NestedVec<usize>,
    labels: Vec<usize>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubsetsNotDisjointError {
    /// An index shared by two different subsets.
    pub index: usize,
}

impl fmt::Display for SubsetsNotDisjointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Index {} is contained in more than one subset.", self.index)
    }
}

impl std::error::Error for SubsetsNotDisjointError {}

impl DisjointSubsets {
    pub fn try_from_disjoint_subsets<Subsets: Into<NestedVec<usize>>>(
        subsets: Subsets,
        labels: Vec<usize>,
    ) -> Result<Self, SubsetsNotDisjointError> {
        let subsets = subsets.into();
        assert_eq!(subsets.len(), labels.len(), "Must have exactly one label per subset.");

        let mut seen = HashSet::new();
        let mut local = HashSet::new();
        for subset in subsets.iter() {
            local.clear();
            local.extend(subset.iter().copied());
            for &idx in &local {
                if !seen.insert(idx) {
                    return Err(SubsetsNotDisjointError { index: idx });
                }
            }
        }

        Ok(Self { subsets, labels })
    }

    pub fn subsets(&self) -> &NestedVec<usize> {
        &self.subsets
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }
}
