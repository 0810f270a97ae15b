//! Access descriptors: how a parallel loop touches each of its arguments.
use crate::dat::{DataId, Dat, Global};
use crate::kernel::Shape;
use crate::map::Map;
use crate::sparsity::Mat;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    /// Accumulate into the target. Concurrent contributions are summed.
    Inc,
    /// Minimum reduction. Globals only.
    Min,
    /// Maximum reduction. Globals only.
    Max,
}

impl Access {
    /// Whether the kernel sees the current values of the target.
    pub fn reads(&self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite | Self::Min | Self::Max)
    }

    /// Whether the loop modifies the target.
    pub fn writes(&self) -> bool {
        !matches!(self, Self::Read)
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self, Self::Inc | Self::Min | Self::Max)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::ReadWrite => "RW",
            Self::Inc => "INC",
            Self::Min => "MIN",
            Self::Max => "MAX",
        };
        write!(f, "{}", name)
    }
}

/// Which of the target indices of a map an argument addresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapIndex {
    /// All `arity` target entities, as one `arity x dim` buffer.
    All,
    /// A single target entity.
    At(usize),
}

/// The data object an argument refers to.
pub enum Target<'a, T> {
    Dat(&'a Dat<T>),
    Global(&'a Global<T>),
    /// A matrix, addressed in blocks through a row map and a column map.
    Mat { mat: &'a Mat<T>, rows: &'a Map, cols: &'a Map },
}

impl<'a, T> Clone for Target<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for Target<'a, T> {}

impl<'a, T> Target<'a, T> {
    pub fn data_id(&self) -> DataId {
        match self {
            Self::Dat(dat) => dat.id(),
            Self::Global(global) => global.id(),
            Self::Mat { mat, .. } => mat.id(),
        }
    }

    pub fn data_name(&self) -> &'a str {
        match self {
            Self::Dat(dat) => dat.name(),
            Self::Global(global) => global.name(),
            Self::Mat { mat, .. } => mat.name(),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Dat(_) => "dat",
            Self::Global(_) => "global",
            Self::Mat { .. } => "matrix",
        }
    }
}

/// An access descriptor: target, access mode and optional indirection.
pub struct Arg<'a, T> {
    target: Target<'a, T>,
    access: Access,
    map: Option<(&'a Map, MapIndex)>,
}

impl<'a, T> Clone for Arg<'a, T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target,
            access: self.access,
            map: self.map,
        }
    }
}

impl<'a, T> fmt::Debug for Arg<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arg")
            .field("target", &self.target.data_name())
            .field("access", &self.access)
            .field("map", &self.map.map(|(map, index)| (map.name(), index)))
            .finish()
    }
}

impl<'a, T> Arg<'a, T> {
    /// A dat accessed directly: iteration entity `e` addresses entity `e` of the dat.
    pub fn dat(dat: &'a Dat<T>, access: Access) -> Self {
        Self {
            target: Target::Dat(dat),
            access,
            map: None,
        }
    }

    /// A dat accessed through a map.
    pub fn indirect(dat: &'a Dat<T>, map: &'a Map, index: MapIndex, access: Access) -> Self {
        Self::dat(dat, access).via(map, index)
    }

    pub fn global(global: &'a Global<T>, access: Access) -> Self {
        Self {
            target: Target::Global(global),
            access,
            map: None,
        }
    }

    /// A matrix whose local blocks are addressed through all indices of both maps.
    pub fn mat(mat: &'a Mat<T>, rows: &'a Map, cols: &'a Map, access: Access) -> Self {
        Self {
            target: Target::Mat { mat, rows, cols },
            access,
            map: None,
        }
    }

    /// Access the target through a map.
    pub fn via(mut self, map: &'a Map, index: MapIndex) -> Self {
        self.map = Some((map, index));
        self
    }

    pub fn target(&self) -> Target<'a, T> {
        self.target
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn map(&self) -> Option<(&'a Map, MapIndex)> {
        self.map
    }

    /// Whether the argument touches entities other than the iteration entity.
    pub fn is_indirect(&self) -> bool {
        self.map.is_some() || matches!(self.target, Target::Mat { .. })
    }

    /// The maps through which this argument writes, and so has to be colored by.
    pub(crate) fn conflict_map(&self) -> Option<(&'a Map, MapIndex)> {
        if !self.access.writes() {
            return None;
        }
        match self.target {
            Target::Mat { rows, .. } => Some((rows, MapIndex::All)),
            Target::Dat(_) => self.map,
            Target::Global(_) => None,
        }
    }

    /// The maps through which this argument touches other entities.
    pub(crate) fn indirections(&self) -> Vec<(&'a Map, MapIndex)> {
        match self.target {
            Target::Mat { rows, cols, .. } => vec![(rows, MapIndex::All), (cols, MapIndex::All)],
            _ => self.map.into_iter().collect(),
        }
    }

    /// The buffer shape a kernel must declare for this argument.
    pub fn shape(&self) -> Shape {
        match self.target {
            Target::Dat(dat) => match self.map {
                Some((map, MapIndex::All)) => Shape::matrix(map.arity(), dat.dim()),
                _ => Shape::vector(dat.dim()),
            },
            Target::Global(global) => Shape::vector(global.dim()),
            Target::Mat { mat, rows, cols } => {
                let (row_dim, col_dim) = mat.sparsity().dims();
                Shape::matrix(rows.arity() * row_dim, cols.arity() * col_dim)
            }
        }
    }
}
