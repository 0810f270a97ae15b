//! Parallel loops over the entities of unstructured meshes.
//!
//! A loop applies a [`Kernel`] to every entity of a [`Set`]. Its arguments ([`Arg`]) describe
//! which data the kernel sees for an entity (a [`Dat`] directly or through a [`Map`], a
//! [`Global`], or a block of a [`Mat`]) and how it is accessed. From this the [`Engine`]
//! derives a conflict-free execution [`Plan`](plan::Plan), generates the marshalling code
//! for the loop structure, keeps halos of distributed data up to date and combines global
//! reductions.
use nalgebra::Scalar;
use num::Zero;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ops::AddAssign;

pub mod access;
pub mod codegen;
pub mod comm;
pub mod config;
pub mod dat;
pub mod error;
pub mod exec;
pub mod form;
pub mod kernel;
pub mod map;
pub mod plan;
pub mod set;
pub mod sparsity;
pub mod topology;

mod halo;

pub use access::{Access, Arg, MapIndex};
pub use comm::{ChannelCommunicator, Communicator, SerialCommunicator};
pub use config::{Backend, Coloring, EngineConfig};
pub use dat::{Dat, Global};
pub use error::Error;
pub use exec::{Engine, EngineStats};
pub use kernel::{Kernel, KernelBuffers, Shape};
pub use map::Map;
pub use set::{EntityCategory, Halo, HaloNeighbor, Set, SetSizes};
pub use sparsity::{Mat, Sparsity};

pub use parloop_sparse::SENTINEL;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;
pub extern crate parloop_nested_vec;

/// A scalar value stored in dats, globals and matrices.
///
/// Used as a trait alias for the traits needed by the loop machinery: values are combined by
/// addition or comparison, moved between threads and serialized for halo exchange.
pub trait Value: Scalar + Copy + Zero + AddAssign + PartialOrd + Send + Sync + Serialize + DeserializeOwned {}

impl<T> Value for T where T: Scalar + Copy + Zero + AddAssign + PartialOrd + Send + Sync + Serialize + DeserializeOwned {}
