//! Kernel assembly
//!
//! Walks the staged op sequence and lowers it to the statement IR, then
//! renders the complete CUDA translation unit: header defines, the kernel
//! signature, register declarations and the per-stage bodies. The kernel
//! argument list is assembled in the same pass, so the parameter text and
//! the host-side argument descriptors cannot drift apart.
//!
//! Placement rules per stage:
//!
//! - an input whose loop-axis stride is zero (or whose loop-axis extent is
//!   one) is loaded once before the item loop; every other load sits
//!   inside the loop and re-indexes per iteration;
//! - a value loaded or produced earlier in the stage stays in its
//!   register, it is never reloaded within the stage;
//! - stores happen only at the overall last write of a buffer. Reduction
//!   and broadcast destinations store once after the loop, guarded to the
//!   first loop index; everything else stores per iteration;
//! - the item loop is skipped entirely when the stage has no per-item
//!   loads, stores or reduction accumulation.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::generator::arena::{ArenaOp, OperandArena, OperandId, OperandRecord};
use crate::generator::code::{render, stride_letter, ItemVar, RenderCx, Stmt};
use crate::generator::mapping::{AxisMapping, HwDim, WARP_SIZE};
use crate::generator::stages::Stages;
use crate::generator::KernelArg;
use crate::ops::OpKind;
use crate::tensor::MAX_AXES;

/// Kernel names carry at most this many op names.
const NAME_OPS: usize = 5;

/// Rendered kernel plus its host-side launch arguments.
#[derive(Clone, Debug)]
pub(crate) struct KernelBuild {
    pub name: String,
    pub source: String,
    pub arg_desc: String,
    pub args: Vec<KernelArg>,
}

/// Shared-buffer slot initializer for a reduction kind.
fn shared_init(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Max => "-FLT_MAX",
        OpKind::Min => "FLT_MAX",
        _ => "0.0f",
    }
}

fn is_broadcast(view: &crate::generator::view::TensorView, loop_axis: usize) -> bool {
    view.strides[loop_axis] == 0 || view.shape[loop_axis] == 1
}

/// Lowered statements of one stage.
#[derive(Default)]
struct StageBody {
    pre: Vec<Stmt>,
    in_loop: Vec<Stmt>,
    reduces: Vec<Stmt>,
    stores: Vec<Stmt>,
    needs_loop: bool,
}

/// Render the staged sequence into a complete kernel.
pub(crate) fn assemble_kernel(
    arena: &OperandArena,
    ops: &[ArenaOp],
    stages: &Stages,
    mapping: &[AxisMapping; MAX_AXES],
    dims: usize,
) -> Result<KernelBuild> {
    let loop_axis = (0..dims)
        .find(|&axis| mapping[axis].dim == Some(HwDim::X))
        .ok_or_else(|| Error::Internal("no axis mapped to hardware x".to_string()))?;
    let cx = RenderCx { dims, loop_axis };
    let block_reduce = mapping[loop_axis].block > WARP_SIZE;

    // Overall last write position per buffer-backed destination; the
    // single store site for each buffer.
    let mut last_write: HashMap<OperandId, (usize, usize)> = HashMap::new();
    for (stage_index, stage) in stages.iter().enumerate() {
        for (pos, &op_index) in stage.iter().enumerate() {
            let dst = ops[op_index].dst;
            if arena.get(dst).is_buffer() {
                last_write.insert(dst, (stage_index, pos));
            }
        }
    }

    let mut carried: HashSet<OperandId> = HashSet::new();
    let mut sbufs: Vec<(String, &'static str)> = Vec::new();
    let mut any_loop = false;
    let mut has_arg_reduce = false;
    let mut body = String::new();

    for (stage_index, stage) in stages.iter().enumerate() {
        let mut lowered = StageBody::default();
        let mut in_reg = carried.clone();

        for (pos, &op_index) in stage.iter().enumerate() {
            let op = &ops[op_index];
            has_arg_reduce |= op.kind.is_arg_reduction();

            for input in op.inputs() {
                let record = arena.get(input);
                let (Some(buffer), Some(view)) = (record.buffer_name(), record.view()) else {
                    continue;
                };
                if in_reg.contains(&input) {
                    continue;
                }
                let reg = record.symbol().to_string();
                let buffer = buffer.to_string();
                if is_broadcast(view, loop_axis) {
                    lowered.pre.push(Stmt::Index {
                        buffer: buffer.clone(),
                        item: ItemVar::Broadcast,
                    });
                    lowered.pre.push(Stmt::Load { reg, buffer });
                } else {
                    lowered.in_loop.push(Stmt::Index {
                        buffer: buffer.clone(),
                        item: ItemVar::Loop,
                    });
                    lowered.in_loop.push(Stmt::Load { reg, buffer });
                    lowered.needs_loop = true;
                }
                in_reg.insert(input);
            }

            let x = op
                .a
                .map(|id| arena.get(id).symbol().to_string())
                .unwrap_or_default();
            let y = op
                .b
                .map(|id| arena.get(id).symbol().to_string())
                .unwrap_or_default();
            let dst_record = arena.get(op.dst);
            let out = dst_record.symbol().to_string();
            lowered.in_loop.push(Stmt::Apply {
                kind: op.kind,
                x,
                y: y.clone(),
                out: out.clone(),
            });
            in_reg.insert(op.dst);

            if op.kind.is_reduction() {
                lowered.needs_loop = true;
                if block_reduce {
                    let sbuf = format!("sbuffer{}", sbufs.len());
                    sbufs.push((sbuf.clone(), shared_init(op.kind)));
                    lowered.reduces.push(Stmt::BlockReduce {
                        kind: op.kind,
                        out: out.clone(),
                        y: y.clone(),
                        sbuf,
                    });
                } else {
                    lowered.reduces.push(Stmt::WarpReduce {
                        kind: op.kind,
                        out: out.clone(),
                        y: y.clone(),
                    });
                }
            }

            // Store only at the buffer's last write.
            if last_write.get(&op.dst) == Some(&(stage_index, pos)) {
                let (Some(buffer), Some(view)) = (dst_record.buffer_name(), dst_record.view())
                else {
                    continue;
                };
                let buffer = buffer.to_string();
                if op.kind.is_reduction() || is_broadcast(view, loop_axis) {
                    lowered.stores.push(Stmt::Index {
                        buffer: buffer.clone(),
                        item: ItemVar::Broadcast,
                    });
                    lowered.stores.push(Stmt::GuardedStore { buffer, reg: out });
                } else {
                    lowered.in_loop.push(Stmt::Index {
                        buffer: buffer.clone(),
                        item: ItemVar::Loop,
                    });
                    lowered.in_loop.push(Stmt::Store { buffer, reg: out });
                    lowered.needs_loop = true;
                }
            }
        }

        for &op_index in stage {
            if ops[op_index].kind.is_reduction() {
                carried.insert(ops[op_index].dst);
            }
        }

        body.push_str(&render(&lowered.pre, cx, 1));
        if lowered.needs_loop {
            any_loop = true;
            body.push_str(&render(
                &[Stmt::ItemLoop {
                    body: lowered.in_loop,
                }],
                cx,
                1,
            ));
        } else {
            body.push_str(&render(&lowered.in_loop, cx, 1));
        }
        body.push_str(&render(&lowered.reduces, cx, 1));
        body.push_str(&render(&lowered.stores, cx, 1));
    }

    // Parameter list, launch arguments and the argument descriptor string
    // are built side by side: shapes, constants, then each buffer pointer
    // followed by its per-axis strides, all in arena interning order.
    let mut params: Vec<String> = Vec::new();
    let mut args: Vec<KernelArg> = Vec::new();
    let mut arg_desc = String::new();

    for axis in 0..dims {
        params.push(format!("unsigned int shape{}", stride_letter(axis)));
        args.push(KernelArg::Shape(mapping[axis].extent));
        arg_desc.push('I');
    }
    for (_, record) in arena.records() {
        if let OperandRecord::Const { value, name } = record {
            params.push(format!("float {name}"));
            args.push(KernelArg::Const(*value));
            arg_desc.push('f');
        }
    }
    for (_, record) in arena.records() {
        let OperandRecord::Tensor {
            view,
            ctype,
            buffer_name: Some(name),
            ..
        } = record
        else {
            continue;
        };
        let Some(buffer) = view.buffer else {
            continue;
        };
        params.push(format!("{ctype}* {name}"));
        args.push(KernelArg::Buffer(buffer));
        arg_desc.push('P');
        for axis in 0..dims {
            params.push(format!("unsigned int stride{}_{name}", stride_letter(axis)));
            args.push(KernelArg::Stride(view.strides[axis] as u32));
            arg_desc.push('I');
        }
    }

    let mut name = String::from("fused_ew");
    for op in ops.iter().take(NAME_OPS) {
        name.push('_');
        name.push_str(op.kind.name());
    }

    // NVRTC resolves no standard headers; define the one limit macro the
    // reduction initializers use.
    let mut source = String::from("#define FLT_MAX 3.402823466e+38f\n\n");
    for axis in 0..dims {
        let entry = &mapping[axis];
        source.push_str(&format!(
            "#define ITEMS_PER_BLOCK{axis} {}\n",
            entry.block * entry.items_per_thread
        ));
    }
    source.push_str(&format!(
        "\nextern \"C\" __global__ void {name}(\n    {})\n{{\n",
        params.join(", ")
    ));

    for (sbuf, _) in &sbufs {
        source.push_str(&format!("    __shared__ float {sbuf}[32];\n"));
    }
    for axis in 0..dims {
        let letter = match mapping[axis].dim {
            Some(dim) => dim.letter(),
            None => return Err(Error::Internal("unmapped active axis".to_string())),
        };
        source.push_str(&format!(
            "    int idx{axis} = threadIdx.{letter} + blockIdx.{letter} * ITEMS_PER_BLOCK{axis};\n"
        ));
    }
    if any_loop {
        source.push_str(&format!(
            "    int loopmax = min(shape{}, (blockIdx.x + 1) * ITEMS_PER_BLOCK{loop_axis});\n",
            stride_letter(loop_axis)
        ));
    }
    source.push_str("    unsigned int index = 0;\n");
    for (_, record) in arena.records() {
        if let OperandRecord::Tensor {
            reg, ctype, init, ..
        } = record
        {
            source.push_str(&format!("    {ctype} {reg} = {init};\n"));
        }
    }
    if has_arg_reduce {
        source.push_str("    float temp_val = 0.0f;\n");
        source.push_str("    unsigned int temp_idx = 0;\n");
    }
    if !sbufs.is_empty() {
        source.push_str("\n    if(threadIdx.x < 32)\n    {\n");
        for (sbuf, init) in &sbufs {
            source.push_str(&format!("        {sbuf}[threadIdx.x] = {init};\n"));
        }
        source.push_str("    }\n    __syncthreads();\n");
    }

    source.push_str(&body);
    source.push_str("\n}\n");

    Ok(KernelBuild {
        name,
        source,
        arg_desc,
        args,
    })
}
