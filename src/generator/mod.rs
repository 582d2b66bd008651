//! Compound kernel generation pipeline
//!
//! [`generate`] takes a linear sequence of fused ops and produces a
//! [`KernelSpec`]: complete CUDA source plus everything the host needs to
//! launch it (launch geometry, ordered argument values and their type
//! descriptor). Generation is pure and deterministic: the same op
//! sequence always yields byte-identical source and the same argument
//! list, which is what makes source-keyed module caching sound.
//!
//! The pipeline runs in fixed phases:
//!
//! 1. rank-normalize every tensor operand ([`view`]);
//! 2. locate the (single) reduction axis and compress the axis space down
//!    to at most three logical axes ([`compress`]);
//! 3. intern operands into the arena, fixing register and argument names
//!    ([`arena`]);
//! 4. map logical axes onto the hardware launch space ([`mapping`]);
//! 5. partition ops into reduction-delimited stages ([`stages`]);
//! 6. lower stages to the statement IR and render ([`assemble`], [`code`]).

mod arena;
mod assemble;
mod code;
mod compress;
mod mapping;
mod stages;
mod view;

use crate::compiler::DeviceCompiler;
use crate::error::Result;
use crate::ops::OpStep;
use crate::tensor::BufferId;

/// Static shared memory footprint reported per launch.
const SHARED_SIZE: u32 = 128;

/// One host-side kernel argument, in parameter order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KernelArg {
    /// Logical extent of an active axis
    Shape(u32),
    /// Immediate scalar constant
    Const(f32),
    /// Device pointer for a tensor buffer
    Buffer(BufferId),
    /// Element stride of a buffer along an active axis
    Stride(u32),
}

/// A fully generated compound kernel, ready to compile and launch.
#[derive(Clone, Debug)]
pub struct KernelSpec {
    /// Kernel entry point name
    pub name: String,
    /// Complete CUDA C source
    pub source: String,
    /// One type code per argument: `I` scalar, `f` float, `P` pointer
    pub arg_desc: String,
    /// Argument values in parameter order
    pub args: Vec<KernelArg>,
    /// Grid dimensions (x, y, z)
    pub grid_dim: (u32, u32, u32),
    /// Block dimensions (x, y, z)
    pub block_dim: (u32, u32, u32),
    /// Shared memory bytes to reserve at launch
    pub shared_mem_bytes: u32,
}

/// A compiled kernel paired with the spec that produced it.
#[derive(Clone, Debug)]
pub struct PreparedKernel<K> {
    /// Generation output, kept for argument resolution at launch time
    pub spec: KernelSpec,
    /// Backend handle to the loaded kernel
    pub kernel: K,
}

/// Generate the compound kernel for a fused op sequence.
///
/// `sm_count` is the streaming multiprocessor count of the target device;
/// it sizes the grid for element-wise launches. Fails when the sequence
/// mixes reduction axes, uses an unsupported dtype, or is internally
/// inconsistent.
pub fn generate(ops: &[OpStep], sm_count: u32) -> Result<KernelSpec> {
    for op in ops {
        op.validate()?;
    }

    let wrapped = view::wrap_ops(ops);
    let reduction = compress::reduction_axis(&wrapped)?;
    let wrapped = compress::compress_axes(wrapped, reduction)?;
    // Compression renumbers axes; re-derive the reduction axis in the
    // compressed space.
    let reduction = compress::reduction_axis(&wrapped)?;

    let (arena, arena_ops) = arena::intern_ops(&wrapped)?;
    let (mapping, dims) = mapping::map_axes(&wrapped, reduction, sm_count)?;
    let staged = stages::build_stages(&arena_ops, &arena)?;
    let kernel = assemble::assemble_kernel(&arena, &arena_ops, &staged, &mapping, dims)?;

    let mut grid_dim = (1, 1, 1);
    let mut block_dim = (1, 1, 1);
    for entry in &mapping {
        match entry.dim {
            Some(mapping::HwDim::X) => {
                grid_dim.0 = entry.grid;
                block_dim.0 = entry.block;
            }
            Some(mapping::HwDim::Y) => {
                grid_dim.1 = entry.grid;
                block_dim.1 = entry.block;
            }
            Some(mapping::HwDim::Z) => {
                grid_dim.2 = entry.grid;
                block_dim.2 = entry.block;
            }
            None => {}
        }
    }

    Ok(KernelSpec {
        name: kernel.name,
        source: kernel.source,
        arg_desc: kernel.arg_desc,
        args: kernel.args,
        grid_dim,
        block_dim,
        shared_mem_bytes: SHARED_SIZE,
    })
}

/// Generate and compile a compound kernel for `compiler`'s device.
pub fn prepare<C: DeviceCompiler>(
    compiler: &C,
    ops: &[OpStep],
) -> Result<PreparedKernel<C::Kernel>> {
    let spec = generate(ops, compiler.sm_count())?;
    let kernel = compiler.compile(&spec)?;
    Ok(PreparedKernel { spec, kernel })
}
