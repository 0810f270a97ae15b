//! Interface to the services that turn variational forms into kernels.
use crate::access::Arg;
use crate::error::PlanningError;
use crate::kernel::Kernel;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The meaning of a kernel argument in a compiled form.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgRole {
    Coordinates,
    /// The i-th coefficient function of the form.
    Coefficient(usize),
    /// The tensor the form is assembled into.
    Output,
}

impl fmt::Display for ArgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinates => write!(f, "coordinates"),
            Self::Coefficient(i) => write!(f, "coefficient {}", i),
            Self::Output => write!(f, "output"),
        }
    }
}

/// A kernel together with the roles of its arguments, in kernel argument order.
#[derive(Debug, Clone)]
pub struct CompiledForm<T> {
    kernel: Kernel<T>,
    roles: Vec<ArgRole>,
}

impl<T> CompiledForm<T> {
    /// Panics if the number of roles differs from the number of kernel arguments.
    pub fn new(kernel: Kernel<T>, roles: Vec<ArgRole>) -> Self {
        assert_eq!(
            kernel.shapes().len(),
            roles.len(),
            "Every kernel argument must have exactly one role."
        );
        Self { kernel, roles }
    }

    pub fn kernel(&self) -> &Kernel<T> {
        &self.kernel
    }

    pub fn roles(&self) -> &[ArgRole] {
        &self.roles
    }

    /// Arrange arguments given by role in the order the kernel expects.
    ///
    /// Bindings for roles the form does not use are ignored. If a role is bound more than
    /// once, the first binding wins.
    pub fn bind<'a>(&self, bindings: &[(ArgRole, Arg<'a, T>)]) -> Result<Vec<Arg<'a, T>>, PlanningError> {
        self.roles
            .iter()
            .map(|role| {
                bindings
                    .iter()
                    .find(|(bound, _)| bound == role)
                    .map(|(_, arg)| arg.clone())
                    .ok_or_else(|| PlanningError::MissingRole { role: role.to_string() })
            })
            .collect()
    }
}

/// A producer of kernels, such as a form compiler.
pub trait KernelSource<T> {
    type Form: ?Sized;

    fn compile(&self, form: &Self::Form) -> eyre::Result<CompiledForm<T>>;
}
