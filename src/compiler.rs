//! Backend seam for kernel compilation
//!
//! Generation is backend-agnostic; anything that can turn a
//! [`KernelSpec`] into a launchable kernel implements [`DeviceCompiler`].
//! The CUDA/NVRTC implementation lives behind the `cuda` feature; tests
//! use lightweight in-memory compilers.

use crate::error::Result;
use crate::generator::KernelSpec;

/// A device backend that compiles generated kernel source.
pub trait DeviceCompiler {
    /// Backend handle to a loaded, launchable kernel.
    type Kernel;

    /// Compile `spec.source` and resolve the entry point `spec.name`.
    fn compile(&self, spec: &KernelSpec) -> Result<Self::Kernel>;

    /// Streaming multiprocessor count of the target device.
    fn sm_count(&self) -> u32;
}
