//! # fusor
//!
//! Fused element-wise / reduction kernel generation for tensor runtimes.
//!
//! A compound kernel fuses a linear sequence of element-wise and reduction
//! operations over strided tensor views into a single generated CUDA
//! kernel, eliminating the intermediate memory round-trips a op-per-launch
//! runtime would pay. Describe the sequence as [`OpStep`]s, call
//! [`generate`] to get complete kernel source plus launch geometry and an
//! ordered argument list, or [`prepare`] to also compile it for a device.
//!
//! ```no_run
//! use fusor::{generate, DType, OpKind, OpStep, TensorDesc, BufferId};
//!
//! let x = TensorDesc::contiguous(&[4096], DType::F32, Some(BufferId(1)));
//! let y = TensorDesc::contiguous(&[4096], DType::F32, Some(BufferId(2)));
//! let spec = generate(&[OpStep::unary(OpKind::Sig, x, y)], 80)?;
//! assert!(spec.source.contains("__global__"));
//! # Ok::<(), fusor::Error>(())
//! ```
//!
//! Generation is deterministic: a given op sequence always produces
//! byte-identical source, so compiled modules can be cached by source
//! hash. The CUDA/NVRTC backend behind the `cuda` feature does exactly
//! that; other backends plug in through [`DeviceCompiler`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compiler;
pub mod dtype;
pub mod error;
pub mod generator;
pub mod ops;
pub mod tensor;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use compiler::DeviceCompiler;
pub use dtype::DType;
pub use error::{Error, Result};
pub use generator::{generate, prepare, KernelArg, KernelSpec, PreparedKernel};
pub use ops::{OpKind, OpStep, Operand};
pub use tensor::{BufferId, Shape, Strides, TensorDesc, MAX_AXES};

#[cfg(feature = "cuda")]
pub use cuda::CudaCompiler;

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::compiler::DeviceCompiler;
    pub use crate::dtype::DType;
    pub use crate::error::{Error, Result};
    pub use crate::generator::{generate, prepare, KernelArg, KernelSpec, PreparedKernel};
    pub use crate::ops::{OpKind, OpStep, Operand};
    pub use crate::tensor::{BufferId, TensorDesc};

    #[cfg(feature = "cuda")]
    pub use crate::cuda::CudaCompiler;
}
