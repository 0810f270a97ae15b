//! Error types.
//!
//! Structural errors ([`TopologyError`], [`PlanningError`], [`KernelSignatureMismatch`],
//! [`ConfigError`]) are reported before any parallel work starts. Runtime errors
//! ([`ExecutionError`], [`HaloExchangeError`]) abort the loop that is in flight. Nothing is
//! retried: replaying an increment loop would count contributions twice.
use parloop_sparse::MissingEntryError;
use std::error::Error as StdError;
use std::fmt;

/// Malformed sets, maps, halos or data layouts, detected at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TopologyError {
    NonMonotonicBoundaries { set: String, boundaries: [usize; 4] },
    LengthMismatch { name: String, expected: usize, actual: usize },
    IndexOutOfBounds { map: String, source_entity: usize, index: usize, target_size: usize },
    InvalidHalo { set: String, reason: String },
    /// Maps that are combined (for instance in a sparsity) do not fit together.
    IncompatibleMaps { reason: String },
    /// A topology provider could not supply the requested set or relation.
    Missing { what: String },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonMonotonicBoundaries { set, boundaries } => write!(
                f,
                "Category boundaries {:?} of set '{}' are not non-decreasing.",
                boundaries, set
            ),
            Self::LengthMismatch { name, expected, actual } => {
                write!(f, "'{}' expected {} values, got {}.", name, expected, actual)
            }
            Self::IndexOutOfBounds {
                map,
                source_entity,
                index,
                target_size,
            } => write!(
                f,
                "Map '{}' refers to index {} from entity {}, but the target set has {} entities.",
                map, index, source_entity, target_size
            ),
            Self::InvalidHalo { set, reason } => write!(f, "Invalid halo for set '{}': {}", set, reason),
            Self::IncompatibleMaps { reason } => write!(f, "Incompatible maps: {}", reason),
            Self::Missing { what } => write!(f, "Topology provider has no {}.", what),
        }
    }
}

impl StdError for TopologyError {}

/// An access pattern the planner cannot turn into a race-free plan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlanningError {
    /// The source set of an argument's map is not the iteration set.
    MapSourceMismatch { arg: usize, map: String, iteration_set: String },
    /// A dat is not defined on the set its argument addresses.
    DatSetMismatch { arg: usize, dat: String, expected_set: String },
    MapIndexOutOfBounds { arg: usize, index: usize, arity: usize },
    /// A writing indirect argument through a map of arity zero.
    ZeroArityIndirection { arg: usize, map: String },
    /// The access mode is not supported for the argument's target kind.
    InvalidAccess { arg: usize, access: String, target: String },
    GlobalThroughMap { arg: usize },
    /// The maps of a matrix argument are not part of the matrix's sparsity.
    MatMapsNotInSparsity { arg: usize, mat: String },
    /// The same data object appears in two arguments, at least one of which writes.
    Aliasing { first: usize, second: usize, name: String },
    /// Coloring can only be disabled for the sequential backend.
    ColoringDisabled,
    /// A form argument role was not bound to an argument.
    MissingRole { role: String },
}

impl fmt::Display for PlanningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapSourceMismatch { arg, map, iteration_set } => write!(
                f,
                "Argument {}: map '{}' does not map from the iteration set '{}'.",
                arg, map, iteration_set
            ),
            Self::DatSetMismatch { arg, dat, expected_set } => write!(
                f,
                "Argument {}: dat '{}' is not defined on set '{}'.",
                arg, dat, expected_set
            ),
            Self::MapIndexOutOfBounds { arg, index, arity } => write!(
                f,
                "Argument {}: map index {} out of bounds for arity {}.",
                arg, index, arity
            ),
            Self::ZeroArityIndirection { arg, map } => write!(
                f,
                "Argument {}: cannot write through map '{}' of arity zero.",
                arg, map
            ),
            Self::InvalidAccess { arg, access, target } => {
                write!(f, "Argument {}: access {} is not valid for a {}.", arg, access, target)
            }
            Self::GlobalThroughMap { arg } => {
                write!(f, "Argument {}: globals cannot be accessed through a map.", arg)
            }
            Self::MatMapsNotInSparsity { arg, mat } => write!(
                f,
                "Argument {}: maps are not part of the sparsity of matrix '{}'.",
                arg, mat
            ),
            Self::Aliasing { first, second, name } => write!(
                f,
                "Arguments {} and {} both access '{}' and at least one of them writes.",
                first, second, name
            ),
            Self::ColoringDisabled => write!(f, "Coloring may only be disabled for the sequential backend."),
            Self::MissingRole { role } => write!(f, "No argument bound for form role {}.", role),
        }
    }
}

impl StdError for PlanningError {}

/// Argument buffers disagree with the kernel's declared signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignatureMismatch {
    pub kernel: String,
    /// The offending argument, or `None` if the number of arguments differs.
    pub arg: Option<usize>,
    pub expected: String,
    pub found: String,
}

impl fmt::Display for KernelSignatureMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.arg {
            Some(arg) => write!(
                f,
                "Kernel '{}' expects argument {} with shape {}, found {}.",
                self.kernel, arg, self.expected, self.found
            ),
            None => write!(
                f,
                "Kernel '{}' expects {} arguments, found {}.",
                self.kernel, self.expected, self.found
            ),
        }
    }
}

impl StdError for KernelSignatureMismatch {}

/// Halo communication failed. Always fatal: halos would be left inconsistent.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HaloExchangeError {
    Disconnected { peer: usize },
    Timeout { peer: usize },
    UnknownRank { peer: usize, size: usize },
    SizeMismatch { peer: usize, expected: usize, received: usize },
    Encode { reason: String },
    Decode { peer: usize, reason: String },
}

impl fmt::Display for HaloExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected { peer } => write!(f, "Rank {} disconnected.", peer),
            Self::Timeout { peer } => write!(f, "Timed out waiting for rank {}.", peer),
            Self::UnknownRank { peer, size } => {
                write!(f, "Rank {} does not exist in a communicator of size {}.", peer, size)
            }
            Self::SizeMismatch { peer, expected, received } => write!(
                f,
                "Expected {} halo values from rank {}, received {}.",
                expected, peer, received
            ),
            Self::Encode { reason } => write!(f, "Failed to encode halo payload: {}", reason),
            Self::Decode { peer, reason } => {
                write!(f, "Failed to decode halo payload from rank {}: {}", peer, reason)
            }
        }
    }
}

impl StdError for HaloExchangeError {}

#[derive(Debug)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The kernel body returned an error. The block containing the iteration is not committed.
    KernelFailed {
        kernel: String,
        iteration: usize,
        source: eyre::Report,
    },
    /// A matrix contribution addressed an entry outside the sparsity.
    Assembly { context: String, source: MissingEntryError },
    /// The data object is in use by another loop.
    Busy { name: String },
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KernelFailed { kernel, iteration, source } => write!(
                f,
                "Kernel '{}' failed at iteration {}: {}",
                kernel, iteration, source
            ),
            Self::Assembly { context, source } => {
                write!(f, "Invalid matrix contribution from '{}': {}", context, source)
            }
            Self::Busy { name } => write!(f, "'{}' is in use by another loop.", name),
        }
    }
}

impl StdError for ExecutionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::KernelFailed { source, .. } => Some(&**source),
            Self::Assembly { source, .. } => Some(source),
            Self::Busy { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid engine configuration: {}", self.reason)
    }
}

impl StdError for ConfigError {}

/// Any error produced by the engine.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Topology(TopologyError),
    Planning(PlanningError),
    KernelSignature(KernelSignatureMismatch),
    HaloExchange(HaloExchangeError),
    Execution(ExecutionError),
    Config(ConfigError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topology(err) => write!(f, "Topology error: {}", err),
            Self::Planning(err) => write!(f, "Planning error: {}", err),
            Self::KernelSignature(err) => write!(f, "Kernel signature mismatch: {}", err),
            Self::HaloExchange(err) => write!(f, "Halo exchange error: {}", err),
            Self::Execution(err) => write!(f, "Execution error: {}", err),
            Self::Config(err) => err.fmt(f),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Topology(err) => Some(err),
            Self::Planning(err) => Some(err),
            Self::KernelSignature(err) => Some(err),
            Self::HaloExchange(err) => Some(err),
            Self::Execution(err) => Some(err),
            Self::Config(err) => Some(err),
        }
    }
}

macro_rules! impl_from_error {
    ($($variant:ident($ty:ty)),*) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    Self::$variant(err)
                }
            }
        )*
    };
}

impl_from_error!(
    Topology(TopologyError),
    Planning(PlanningError),
    KernelSignature(KernelSignatureMismatch),
    HaloExchange(HaloExchangeError),
    Execution(ExecutionError),
    Config(ConfigError)
);
