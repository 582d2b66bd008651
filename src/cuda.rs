//! CUDA backend: NVRTC compilation, module caching and launching
//!
//! Generated source is compiled to PTX with NVRTC at runtime and loaded
//! through a per-device module cache keyed by a hash of the source text.
//! Generation is deterministic, so the hash-keyed cache gives one
//! compilation per distinct fused sequence per device.
//!
//! # Thread Safety
//!
//! The module cache uses `OnceLock<Mutex<HashMap>>` for thread-safe
//! initialization and concurrent access from multiple streams.

use cudarc::driver::safe::{CudaContext, CudaFunction, CudaModule, CudaStream, LaunchConfig};
use cudarc::driver::PushKernelArg;
use cudarc::nvrtc::compile_ptx;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

use crate::compiler::DeviceCompiler;
use crate::error::{Error, Result};
use crate::generator::{KernelArg, KernelSpec, PreparedKernel};
use crate::tensor::BufferId;

/// Cache of loaded modules, keyed by (device index, source hash)
static MODULE_CACHE: OnceLock<Mutex<HashMap<(usize, u64), Arc<CudaModule>>>> = OnceLock::new();

/// Log a kernel launch failure.
#[cold]
#[inline(never)]
fn log_launch_error(name: &str, err: &cudarc::driver::DriverError) {
    eprintln!("[fusor::cuda] kernel '{}' launch failed: {:?}", name, err);
}

fn source_hash(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

/// Compiles and launches generated kernels on one CUDA device.
///
/// Owns the context and the stream every compound kernel launches on.
/// `Clone` shares both via `Arc`.
#[derive(Clone)]
pub struct CudaCompiler {
    device_index: usize,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    sm_count: u32,
}

impl std::fmt::Debug for CudaCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaCompiler")
            .field("device_index", &self.device_index)
            .field("sm_count", &self.sm_count)
            .finish_non_exhaustive()
    }
}

impl CudaCompiler {
    /// Open device `index` and create the launch stream.
    pub fn new(index: usize) -> Result<Self> {
        let context = CudaContext::new(index).map_err(|e| {
            Error::Backend(format!("Failed to create CUDA context on device {index}: {e:?}"))
        })?;
        let stream = context.default_stream();
        let sm_count = multiprocessor_count(index)?;
        Ok(Self {
            device_index: index,
            context,
            stream,
            sm_count,
        })
    }

    /// The stream compound kernels launch on.
    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    fn get_or_load_module(&self, spec: &KernelSpec) -> Result<Arc<CudaModule>> {
        let cache = MODULE_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
        let mut guard = cache.lock().map_err(|e| {
            Error::Internal(format!(
                "Failed to acquire module cache lock (Mutex poisoned): {}",
                e
            ))
        })?;

        let key = (self.device_index, source_hash(&spec.source));
        if let Some(module) = guard.get(&key) {
            return Ok(module.clone());
        }

        let ptx = compile_ptx(&spec.source).map_err(|e| {
            Error::Backend(format!(
                "NVRTC compilation of kernel '{}' failed: {:?}",
                spec.name, e
            ))
        })?;
        let module = self.context.load_module(ptx).map_err(|e| {
            Error::Backend(format!(
                "Failed to load CUDA module for kernel '{}': {:?}",
                spec.name, e
            ))
        })?;

        guard.insert(key, module.clone());
        Ok(module)
    }

    /// Launch a prepared kernel on this compiler's stream.
    ///
    /// `resolve` maps each tensor's [`BufferId`] to its device pointer.
    ///
    /// # Safety
    ///
    /// Every resolved pointer must be valid device memory large enough for
    /// the view the kernel was generated against, allocated on this device.
    pub unsafe fn launch(
        &self,
        prepared: &PreparedKernel<CudaFunction>,
        resolve: impl Fn(BufferId) -> u64,
    ) -> Result<()> {
        let spec = &prepared.spec;

        // Materialize owned argument values first; the builder borrows
        // them until the launch call.
        let mut scalars: Vec<u32> = Vec::new();
        let mut floats: Vec<f32> = Vec::new();
        let mut pointers: Vec<u64> = Vec::new();
        for arg in &spec.args {
            match arg {
                KernelArg::Shape(v) | KernelArg::Stride(v) => scalars.push(*v),
                KernelArg::Const(v) => floats.push(*v),
                KernelArg::Buffer(id) => pointers.push(resolve(*id)),
            }
        }

        let cfg = LaunchConfig {
            grid_dim: spec.grid_dim,
            block_dim: spec.block_dim,
            shared_mem_bytes: spec.shared_mem_bytes,
        };

        let mut builder = self.stream.launch_builder(&prepared.kernel);
        let (mut si, mut fi, mut pi) = (0, 0, 0);
        for arg in &spec.args {
            match arg {
                KernelArg::Shape(_) | KernelArg::Stride(_) => {
                    builder.arg(&scalars[si]);
                    si += 1;
                }
                KernelArg::Const(_) => {
                    builder.arg(&floats[fi]);
                    fi += 1;
                }
                KernelArg::Buffer(_) => {
                    builder.arg(&pointers[pi]);
                    pi += 1;
                }
            }
        }

        // SAFETY: argument count and types match the generated signature
        // by construction; pointer validity is the caller's contract.
        unsafe {
            builder.launch(cfg).map_err(|e| {
                log_launch_error(&spec.name, &e);
                Error::Backend(format!("Kernel '{}' launch failed: {:?}", spec.name, e))
            })?;
        }
        Ok(())
    }
}

impl DeviceCompiler for CudaCompiler {
    type Kernel = CudaFunction;

    fn compile(&self, spec: &KernelSpec) -> Result<CudaFunction> {
        let module = self.get_or_load_module(spec)?;
        module.load_function(&spec.name).map_err(|e| {
            Error::Backend(format!(
                "Failed to get kernel '{}': {:?}. \
                 Check that the kernel name matches the generated source.",
                spec.name, e
            ))
        })
    }

    fn sm_count(&self) -> u32 {
        self.sm_count
    }
}

/// Streaming multiprocessor count of device `index`.
fn multiprocessor_count(index: usize) -> Result<u32> {
    let device = cudarc::driver::result::device::get(index as i32)
        .map_err(|e| Error::Backend(format!("Failed to get CUDA device {index}: {e:?}")))?;
    let count = unsafe {
        cudarc::driver::result::device::get_attribute(
            device,
            cudarc::driver::sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
        )
    }
    .map_err(|e| Error::Backend(format!("Failed to get multiprocessor count: {e:?}")))?;
    Ok(count as u32)
}
