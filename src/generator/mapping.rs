//! Grid mapping: logical axes onto the hardware launch space
//!
//! Each of the (at most three) logical axes is assigned a hardware
//! dimension, a block size, a grid size and a static items-per-thread
//! unroll factor. A reduction axis always binds to hardware `x` so the
//! item loop and the intra-block reduction share the same thread index.
//! Without a reduction, the occupancy heuristic balances warp count per
//! block against register pressure, and the remaining axes are given
//! power-of-two block slices while the cumulative block size stays within
//! the 1024 thread hardware limit.
//!
//! Invariant: `block * grid * items_per_thread >= extent` for every mapped
//! axis. Over-coverage is tolerated (the emitted kernel bounds its item
//! loop), under-coverage would drop elements and is never produced.

use crate::error::{Error, Result};
use crate::generator::view::ViewOp;
use crate::tensor::MAX_AXES;

/// Hardware thread/block dimension label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HwDim {
    X,
    Y,
    Z,
}

impl HwDim {
    /// CUDA member suffix (`threadIdx.x` etc).
    pub fn letter(self) -> char {
        match self {
            HwDim::X => 'x',
            HwDim::Y => 'y',
            HwDim::Z => 'z',
        }
    }
}

/// Launch assignment of one logical axis.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AxisMapping {
    /// Hardware dimension this axis occupies
    pub dim: Option<HwDim>,
    /// Threads along this axis per block
    pub block: u32,
    /// Blocks along this axis
    pub grid: u32,
    /// Elements each thread handles along this axis
    pub items_per_thread: u32,
    /// Logical extent of the axis
    pub extent: u32,
}

impl AxisMapping {
    const UNASSIGNED: AxisMapping = AxisMapping {
        dim: None,
        block: 1,
        grid: 1,
        items_per_thread: 1,
        extent: 1,
    };

    /// Work items this axis can cover.
    pub fn coverage(&self) -> u64 {
        self.block as u64 * self.grid as u64 * self.items_per_thread as u64
    }
}

/// Hardware limit on threads per block.
pub(crate) const THREADS_PER_BLOCK: u32 = 1024;

/// Warp width; reductions below this stay register-only.
pub(crate) const WARP_SIZE: u32 = 32;

#[inline]
fn ceil_div(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// Occupancy heuristic for the axis the thread loop runs over.
///
/// Spreads the extent over at most `sm_count` blocks, then grows the
/// per-thread unroll factor while the block would otherwise need more than
/// 4 warps (up to 8 items per thread) or more than 32 warps, minimizing
/// block size subject to those bounds. Returns (grid, block, items).
fn optimize_loop_axis(extent: u32, sm_count: u32) -> (u32, u32, u32) {
    let grid = sm_count.min(ceil_div(extent, WARP_SIZE)).max(1);
    let items_per_block = ceil_div(extent, grid);

    let mut items_per_thread = 1;
    let mut warps = ceil_div(items_per_block, WARP_SIZE * items_per_thread);
    while (warps > 4 && items_per_thread < 8) || warps > 32 {
        items_per_thread += 1;
        warps = ceil_div(items_per_block, WARP_SIZE * items_per_thread);
    }

    (grid, warps * WARP_SIZE, items_per_thread)
}

/// Assign every logical axis to the launch space.
///
/// Returns the per-axis mapping (always `MAX_AXES` entries) and the active
/// dimensionality: trailing axes whose block x grid x items product is 1
/// are pruned and stop being iterated explicitly in kernel code.
pub(crate) fn map_axes(
    ops: &[ViewOp],
    reduction: Option<usize>,
    sm_count: u32,
) -> Result<([AxisMapping; MAX_AXES], usize)> {
    // Element-wise maximum extent per axis over buffer-backed operands;
    // broadcast axes of extent 1 never dominate.
    let mut max_shape = [1u32; MAX_AXES];
    for op in ops {
        for view in op.tensors() {
            if !view.is_buffer() {
                continue;
            }
            if view.shape.len() > MAX_AXES {
                return Err(Error::Internal(format!(
                    "operand rank {} survived axis compression (max {})",
                    view.shape.len(),
                    MAX_AXES
                )));
            }
            for (axis, &extent) in view.shape.iter().enumerate() {
                max_shape[axis] = max_shape[axis].max(extent as u32);
            }
        }
    }

    let mut mapping = [AxisMapping::UNASSIGNED; MAX_AXES];
    for (axis, entry) in mapping.iter_mut().enumerate() {
        entry.extent = max_shape[axis];
    }

    let mut free_dims = vec![HwDim::X, HwDim::Y, HwDim::Z];
    let mut blocksize = 1u32;

    if let Some(axis) = reduction {
        // One block spans the whole reduction axis; block size is a warp
        // multiple so the shuffle tree lines up, capped at the hardware
        // maximum with the remainder folded into the item loop.
        let extent = max_shape[axis];
        let block = (ceil_div(extent, 256) * WARP_SIZE).clamp(WARP_SIZE, THREADS_PER_BLOCK);
        mapping[axis] = AxisMapping {
            dim: Some(HwDim::X),
            block,
            grid: 1,
            items_per_thread: ceil_div(extent, block),
            extent,
        };
        blocksize = block;
        free_dims.retain(|dim| *dim != HwDim::X);
    } else if max_shape[0] == 1 && max_shape.iter().product::<u32>() != 1 {
        // Leading axis is degenerate but the tensor is not scalar: loop
        // over the first non-trivial axis instead.
        let axis = if max_shape[1] == 1 { 2 } else { 1 };
        let (grid, block, items) = optimize_loop_axis(max_shape[axis], sm_count);
        mapping[axis] = AxisMapping {
            dim: Some(free_dims.remove(0)),
            block,
            grid,
            items_per_thread: items,
            extent: max_shape[axis],
        };
        blocksize = block;
    }

    for axis in 0..MAX_AXES {
        if mapping[axis].dim.is_some() {
            continue;
        }
        let extent = max_shape[axis];

        let (grid, block, items) = if free_dims.len() == MAX_AXES {
            // First assignment overall: this axis carries the thread loop.
            let (grid, block, items) = optimize_loop_axis(extent, sm_count);
            blocksize = block;
            (grid, block, items)
        } else {
            // Secondary axis: double the block slice while the cumulative
            // block size fits the hardware limit.
            let mut block = 1u32;
            while block * blocksize * 2 <= THREADS_PER_BLOCK && block * 2 < extent {
                block *= 2;
            }
            blocksize *= block;
            (ceil_div(extent, block), block, 1)
        };

        mapping[axis] = AxisMapping {
            dim: Some(free_dims.remove(0)),
            block,
            grid,
            items_per_thread: items,
            extent,
        };
    }

    if mapping.iter().any(|entry| entry.dim.is_none()) {
        return Err(Error::Internal(
            "axis mapping left a slot unassigned".to_string(),
        ));
    }
    debug_assert!(mapping
        .iter()
        .all(|entry| entry.coverage() >= entry.extent as u64));

    // Prune degenerate trailing axes from the active dimensionality.
    let mut dims = MAX_AXES;
    while dims > 1 && mapping[dims - 1].coverage() == 1 {
        dims -= 1;
    }

    Ok((mapping, dims))
}
