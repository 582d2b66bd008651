//! End-to-end tests for compound kernel generation
//!
//! These drive the public `generate` API the way a tensor runtime would:
//! build an op sequence over strided views, generate, and check the
//! emitted source, launch geometry and argument list.

use fusor::{
    generate, prepare, BufferId, DType, DeviceCompiler, Error, KernelArg, KernelSpec, OpKind,
    OpStep, Result, TensorDesc,
};
use std::cell::RefCell;

const SM_COUNT: u32 = 80;

fn buf(shape: &[usize], id: u64) -> TensorDesc {
    TensorDesc::contiguous(shape, DType::F32, Some(BufferId(id)))
}

fn virt(shape: &[usize]) -> TensorDesc {
    TensorDesc::contiguous(shape, DType::F32, None)
}

#[test]
fn test_sigmoid_elementwise_kernel() {
    let spec = generate(
        &[OpStep::unary(OpKind::Sig, buf(&[4096], 1), buf(&[4096], 2))],
        SM_COUNT,
    )
    .unwrap();

    assert_eq!(spec.name, "fused_ew_sig");
    assert!(spec.source.contains("extern \"C\" __global__ void fused_ew_sig("));
    assert!(spec.source.contains("reg1 = 1.0f / (1.0f + expf(-reg0));"));

    // Input load and output store both ride the item loop
    assert!(spec.source.contains("for(int item = idx0; item < loopmax; item += blockDim.x)"));
    assert!(spec.source.contains("reg0 = buf0[index];"));
    assert!(spec.source.contains("buf1[index] = reg1;"));

    // Launch covers every element with warp-multiple blocks
    let (gx, gy, gz) = spec.grid_dim;
    let (bx, by, bz) = spec.block_dim;
    assert_eq!((gy, gz, by, bz), (1, 1, 1, 1));
    assert!(gx as u64 * bx as u64 >= 4096);
    assert_eq!(bx % 32, 0);
    assert!(spec.source.contains("#define ITEMS_PER_BLOCK0 "));

    // shapea, then per buffer: pointer plus one stride
    assert_eq!(spec.arg_desc, "IPIPI");
    assert_eq!(spec.args[0], KernelArg::Shape(4096));
    assert_eq!(spec.args[1], KernelArg::Buffer(BufferId(1)));
    assert_eq!(spec.args[2], KernelArg::Stride(1));
    assert_eq!(spec.args[3], KernelArg::Buffer(BufferId(2)));
    assert_eq!(spec.args[4], KernelArg::Stride(1));
}

#[test]
fn test_mul_sum_fuses_into_two_stages() {
    // t = x * y, then s = sum(t, axis 0): the reduction opens its own
    // stage, reloading t from memory.
    let x = buf(&[64, 64], 1);
    let y = buf(&[64, 64], 2);
    let t = buf(&[64, 64], 3);
    let s = buf(&[1, 64], 4);
    let spec = generate(
        &[
            OpStep::binary(OpKind::Mul, x, y, t.clone()),
            OpStep::reduce(OpKind::Sum, t, s, 0),
        ],
        SM_COUNT,
    )
    .unwrap();

    assert_eq!(spec.name, "fused_ew_mul_sum");
    // Two item loops: one per stage
    assert_eq!(spec.source.matches("for(int item = idx0;").count(), 2);
    // The intermediate stores per iteration, the reduction stores once
    assert!(spec.source.contains("buf2[index] = reg2;"));
    assert_eq!(spec.source.matches("if(idx0 == 0)").count(), 1);
    assert!(spec.source.contains("if(idx0 == 0) {buf3[index] = reg3;}"));
    // Accumulate into the identity-initialized register, then shuffle
    assert!(spec.source.contains("float reg3 = 0.0f;"));
    assert!(spec.source.contains("reg3 = reg3 + __shfl_xor_sync(0xffffffff, reg3, i);"));

    // Reduction axis binds hardware x with a single block
    assert_eq!(spec.grid_dim.0, 1);
    assert_eq!(spec.block_dim.0 % 32, 0);
    assert!(spec.grid_dim.1 as u64 * spec.block_dim.1 as u64 >= 64);
    assert!(spec.block_dim.0 * spec.block_dim.1 * spec.block_dim.2 <= 1024);
}

#[test]
fn test_generation_is_deterministic() {
    let ops = [
        OpStep::unary(OpKind::Sqr, buf(&[64], 1), virt(&[64])),
        OpStep::reduce(OpKind::Sum, virt(&[64]), buf(&[1], 2), 0),
    ];
    let first = generate(&ops, SM_COUNT).unwrap();
    let second = generate(&ops, SM_COUNT).unwrap();
    assert_eq!(first.source, second.source);
    assert_eq!(first.args, second.args);
    assert_eq!(first.name, second.name);
    assert_eq!(first.grid_dim, second.grid_dim);
    assert_eq!(first.block_dim, second.block_dim);
}

#[test]
fn test_register_intermediate_never_touches_memory() {
    // The squared value has no buffer: no load, no store, no argument
    let spec = generate(
        &[
            OpStep::unary(OpKind::Sqr, buf(&[4096], 1), virt(&[4096])),
            OpStep::binary(OpKind::Add, virt(&[4096]), 1.0f32, buf(&[4096], 2)),
        ],
        SM_COUNT,
    )
    .unwrap();

    // shapea, constant, two buffers
    assert_eq!(spec.arg_desc, "IfPIPI");
    assert!(spec.source.contains("float constant0"));
    assert!(spec.source.contains("reg1 = reg0 * reg0;"));
    assert!(spec.source.contains("reg2 = reg1 + constant0;"));
    // Exactly two memory operands appear in the source
    assert!(!spec.source.contains("buf2"));
}

#[test]
fn test_wide_reduction_switches_to_shared_memory() {
    let small = generate(
        &[OpStep::reduce(OpKind::Max, buf(&[64], 1), buf(&[1], 2), 0)],
        SM_COUNT,
    )
    .unwrap();
    assert!(small.source.contains("__shfl_xor_sync"));
    assert!(!small.source.contains("__shared__"));
    assert!(!small.source.contains("__syncthreads"));

    let wide = generate(
        &[OpStep::reduce(OpKind::Max, buf(&[4096], 1), buf(&[1], 2), 0)],
        SM_COUNT,
    )
    .unwrap();
    assert!(wide.source.contains("__shared__ float sbuffer0[32];"));
    assert!(wide.source.contains("sbuffer0[threadIdx.x] = -FLT_MAX;"));
    assert!(wide.source.contains("reg1 = fmaxf(reg1, __shfl_xor_sync(0xffffffff, reg1, i));"));
    assert_eq!(wide.source.matches("__syncthreads();").count(), 3);
    assert_eq!(wide.grid_dim.0, 1);
    assert!(wide.block_dim.0 > 32);
}

#[test]
fn test_argmax_tracks_value_and_index() {
    let running = virt(&[128]);
    let dst = TensorDesc::contiguous(&[1], DType::I32, Some(BufferId(2)));
    let spec = generate(
        &[OpStep::arg_reduce(
            OpKind::Argmax,
            buf(&[128], 1),
            running,
            dst,
            0,
        )],
        SM_COUNT,
    )
    .unwrap();

    // Winning index lands in an int register, running value in a float
    // register starting from the lowest representable value
    assert!(spec.source.contains("int reg2 = 0;"));
    assert!(spec.source.contains("float reg1 = -FLT_MAX;"));
    assert!(spec.source.contains("if(reg0 > reg1) {reg2 = item; reg1 = reg0;}"));
    assert!(spec.source.contains("float temp_val = 0.0f;"));
    assert!(spec.source.contains("unsigned int temp_idx = 0;"));
    assert!(spec.source.contains("int* buf1"));
}

#[test]
fn test_broadcast_operand_loads_before_loop() {
    // Bias row with zero stride along the loop axis
    let bias = TensorDesc::new(&[4096, 64], &[0, 1], DType::F32, Some(BufferId(2)));
    let spec = generate(
        &[OpStep::binary(
            OpKind::Add,
            buf(&[4096, 64], 1),
            bias,
            buf(&[4096, 64], 3),
        )],
        SM_COUNT,
    )
    .unwrap();

    let loop_at = spec.source.find("for(int item").unwrap();
    let bias_load = spec.source.find("reg1 = buf1[index];").unwrap();
    let main_load = spec.source.find("reg0 = buf0[index];").unwrap();
    assert!(bias_load < loop_at);
    assert!(main_load > loop_at);
    // Broadcast index uses the block-invariant idx, not the loop variable
    assert!(spec.source.contains("index = idx0 * stridea_buf1 + idx1 * strideb_buf1;"));
}

#[test]
fn test_high_rank_operands_are_compressed() {
    // Rank-4 elementwise: axes merge down, strides stay element-exact
    let spec = generate(
        &[OpStep::unary(
            OpKind::Neg,
            buf(&[2, 3, 4, 5], 1),
            buf(&[2, 3, 4, 5], 2),
        )],
        SM_COUNT,
    )
    .unwrap();
    // Two compressed axes: [2, 60]
    assert_eq!(spec.args[0], KernelArg::Shape(2));
    assert_eq!(spec.args[1], KernelArg::Shape(60));
    assert!(spec.source.contains("unsigned int shapea, unsigned int shapeb"));
    assert!(!spec.source.contains("shapec"));
}

#[test]
fn test_conflicting_reduction_axes_rejected() {
    let result = generate(
        &[
            OpStep::reduce(OpKind::Sum, buf(&[4, 4], 1), buf(&[1, 4], 2), 0),
            OpStep::reduce(OpKind::Max, buf(&[4, 4], 1), buf(&[4, 1], 3), 1),
        ],
        SM_COUNT,
    );
    assert!(matches!(
        result,
        Err(Error::ConflictingReductionAxes {
            first: 0,
            second: 1
        })
    ));
}

#[test]
fn test_unsupported_dtype_rejected() {
    let result = generate(
        &[OpStep::unary(
            OpKind::Neg,
            TensorDesc::contiguous(&[8], DType::F64, Some(BufferId(1))),
            TensorDesc::contiguous(&[8], DType::F64, Some(BufferId(2))),
        )],
        SM_COUNT,
    );
    assert!(matches!(result, Err(Error::UnsupportedDType { .. })));
}

#[test]
fn test_out_of_range_reduction_axis_rejected() {
    // Rank-1 operand, axis 5
    let result = generate(
        &[OpStep::reduce(OpKind::Sum, buf(&[16], 1), buf(&[1], 2), 5)],
        SM_COUNT,
    );
    assert!(matches!(result, Err(Error::Internal(_))));

    // Rank-4 operand, axis 4 (one past the end)
    let result = generate(
        &[OpStep::reduce(
            OpKind::Sum,
            buf(&[2, 3, 4, 5], 1),
            buf(&[2, 3, 4, 1], 2),
            4,
        )],
        SM_COUNT,
    );
    assert!(matches!(result, Err(Error::Internal(_))));
}

#[test]
fn test_missing_operand_rejected() {
    let bad = OpStep {
        kind: OpKind::Add,
        a: Some(buf(&[8], 1).into()),
        b: None,
        dst: buf(&[8], 2),
        axis: None,
    };
    assert!(matches!(generate(&[bad], SM_COUNT), Err(Error::Internal(_))));
}

#[test]
fn test_in_place_update_stores_once() {
    let x = buf(&[4096], 1);
    let spec = generate(
        &[
            OpStep::binary(OpKind::Add, x.clone(), 1.0f32, x.clone()),
            OpStep::binary(OpKind::Mul, x.clone(), 2.0f32, x.clone()),
        ],
        SM_COUNT,
    )
    .unwrap();
    // One load, one store, both through the same register
    assert_eq!(spec.source.matches("reg0 = buf0[index];").count(), 1);
    assert_eq!(spec.source.matches("buf0[index] = reg0;").count(), 1);
    assert!(spec.source.contains("reg0 = reg0 + constant0;"));
    assert!(spec.source.contains("reg0 = reg0 * constant1;"));
}

#[test]
fn test_division_by_reduced_value() {
    // z = x / sum(x): the reduction result is carried in registers into
    // the following stage, never re-stored or re-loaded there.
    let x = buf(&[64], 1);
    let total = buf(&[1], 2);
    let spec = generate(
        &[
            OpStep::reduce(OpKind::Sum, x.clone(), total.clone(), 0),
            OpStep::binary(OpKind::Div, x.clone(), total, buf(&[64], 3)),
        ],
        SM_COUNT,
    )
    .unwrap();

    // reg1 holds the total; exactly one (guarded) store and no load of it
    assert_eq!(spec.source.matches("reg1 = buf1[index];").count(), 0);
    assert_eq!(spec.source.matches("buf1[index] = reg1;").count(), 1);
    assert!(spec.source.contains("reg2 = reg0 / reg1;"));
}

/// In-memory backend that records every spec it compiles.
struct RecordingCompiler {
    sm_count: u32,
    compiled: RefCell<Vec<KernelSpec>>,
}

impl DeviceCompiler for RecordingCompiler {
    type Kernel = String;

    fn compile(&self, spec: &KernelSpec) -> Result<String> {
        self.compiled.borrow_mut().push(spec.clone());
        Ok(spec.name.clone())
    }

    fn sm_count(&self) -> u32 {
        self.sm_count
    }
}

/// Backend whose compilation always fails.
struct BrokenCompiler;

impl DeviceCompiler for BrokenCompiler {
    type Kernel = ();

    fn compile(&self, _spec: &KernelSpec) -> Result<()> {
        Err(Error::Backend("no device present".into()))
    }

    fn sm_count(&self) -> u32 {
        1
    }
}

#[test]
fn test_prepare_compiles_with_device_sm_count() {
    let ops = [OpStep::unary(OpKind::Sig, buf(&[4096], 1), buf(&[4096], 2))];
    let compiler = RecordingCompiler {
        sm_count: 2,
        compiled: RefCell::new(Vec::new()),
    };

    let prepared = prepare(&compiler, &ops).unwrap();

    // Generation saw the device's multiprocessor count, not a default:
    // two SMs cap the element-wise grid at two blocks.
    assert_eq!(prepared.spec.grid_dim.0, 2);
    assert_eq!(
        prepared.spec.source,
        generate(&ops, 2).unwrap().source
    );

    // The compiled handle comes from the backend, fed the same spec.
    assert_eq!(prepared.kernel, "fused_ew_sig");
    let compiled = compiler.compiled.borrow();
    assert_eq!(compiled.len(), 1);
    assert_eq!(compiled[0].source, prepared.spec.source);
}

#[test]
fn test_prepare_propagates_backend_error() {
    let ops = [OpStep::unary(OpKind::Sig, buf(&[64], 1), buf(&[64], 2))];
    match prepare(&BrokenCompiler, &ops) {
        Err(Error::Backend(message)) => assert_eq!(message, "no device present"),
        other => panic!("expected a backend error, got {other:?}"),
    }
}
