//! Axis compression
//!
//! When a sequence's operands exceed [`MAX_AXES`] logical axes, contiguous
//! runs of axes are merged until at most `MAX_AXES` remain. The reduction
//! axis (if any) is never merged: it is isolated as its own group so the
//! grid mapper can bind it to the block's first hardware dimension.
//!
//! Merging preserves total element count and relative memory layout. It is
//! only valid when the merged axes are contiguous in the layout being
//! compressed; the caller guarantees canonical ordering. This is a
//! precondition, not a runtime check.

use crate::error::{Error, Result};
use crate::generator::view::{TensorView, ViewOp, ViewOperand};
use crate::tensor::{Shape, Strides, MAX_AXES};
use smallvec::SmallVec;
use std::ops::Range;

/// Reduction axis of the sequence, verified to be unique.
///
/// Returns `ConflictingReductionAxes` if two reduction ops declare
/// different axes. Mixed reductions over different axes cannot share one
/// fused kernel.
pub(crate) fn reduction_axis(ops: &[ViewOp]) -> Result<Option<usize>> {
    let mut reduction: Option<usize> = None;
    for op in ops {
        if !op.kind.is_reduction() {
            continue;
        }
        let axis = op.axis.ok_or_else(|| {
            Error::Internal(format!(
                "reduction op '{}' without a reduction axis",
                op.kind.name()
            ))
        })?;
        match reduction {
            None => reduction = Some(axis),
            Some(first) if first != axis => {
                return Err(Error::ConflictingReductionAxes {
                    first,
                    second: axis,
                });
            }
            Some(_) => {}
        }
    }
    Ok(reduction)
}

/// Maximum rank over buffer-backed operands of the sequence.
fn max_buffer_rank(ops: &[ViewOp]) -> usize {
    let mut rank = 0;
    for op in ops {
        for view in op.tensors() {
            if view.is_buffer() {
                rank = rank.max(view.shape.len());
            }
        }
    }
    rank
}

/// Merge a view's axes according to `groups`.
///
/// The merged extent is the product of group extents; the merged stride is
/// the stride of the group's innermost (fastest-varying) axis, which is the
/// combined step exactly when the group is contiguous in layout.
fn reshape_groups(view: &TensorView, groups: &[Range<usize>]) -> TensorView {
    let mut shape: Shape = SmallVec::with_capacity(groups.len());
    let mut strides: Strides = SmallVec::with_capacity(groups.len());
    for group in groups {
        let extent: usize = view.shape[group.clone()].iter().product();
        shape.push(extent);
        strides.push(if extent == 1 {
            0
        } else {
            view.strides[group.end - 1]
        });
    }
    TensorView {
        shape,
        strides,
        dtype: view.dtype,
        buffer: view.buffer,
    }
}

/// Compress the sequence's axes down to at most [`MAX_AXES`].
///
/// A no-op when operand rank is already within bounds. Otherwise axis
/// indices are partitioned into at most three contiguous groups: the
/// reduction axis alone (when present and interior), everything strictly
/// before it, and everything strictly after it.
pub(crate) fn compress_axes(ops: Vec<ViewOp>, reduction: Option<usize>) -> Result<Vec<ViewOp>> {
    let num_axes = max_buffer_rank(&ops);
    if num_axes <= MAX_AXES {
        return Ok(ops);
    }

    let groups: Vec<Range<usize>> = match reduction {
        None | Some(0) => vec![0..1, 1..num_axes],
        Some(axis) if axis == num_axes - 1 => vec![0..num_axes - 1, num_axes - 1..num_axes],
        Some(axis) => vec![0..axis, axis..axis + 1, axis + 1..num_axes],
    };

    if groups.len() > MAX_AXES {
        return Err(Error::Internal(format!(
            "axis compression produced {} groups (max {})",
            groups.len(),
            MAX_AXES
        )));
    }

    // The reduction axis moves to its group's index in the compressed space.
    let compressed_axis = reduction.map(|axis| {
        groups
            .iter()
            .position(|group| group.contains(&axis))
            .unwrap_or(0)
    });

    let reshape_operand = |operand: &Option<ViewOperand>| -> Option<ViewOperand> {
        operand.as_ref().map(|operand| match operand {
            ViewOperand::Const(value) => ViewOperand::Const(*value),
            ViewOperand::Tensor(view) => ViewOperand::Tensor(reshape_groups(view, &groups)),
        })
    };

    Ok(ops
        .into_iter()
        .map(|op| {
            let axis = op.axis.and(compressed_axis);
            ViewOp {
                kind: op.kind,
                a: reshape_operand(&op.a),
                b: reshape_operand(&op.b),
                dst: reshape_groups(&op.dst, &groups),
                axis,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::generator::view::wrap_ops;
    use crate::ops::{OpKind, OpStep};
    use crate::tensor::{BufferId, TensorDesc};

    fn buf(shape: &[usize], id: u64) -> TensorDesc {
        TensorDesc::contiguous(shape, DType::F32, Some(BufferId(id)))
    }

    #[test]
    fn test_passthrough_at_low_rank() {
        let ops = wrap_ops(&[OpStep::binary(
            OpKind::Add,
            buf(&[8, 8], 1),
            buf(&[8, 8], 2),
            buf(&[8, 8], 3),
        )]);
        let before: Vec<_> = ops.iter().map(|op| op.dst.shape.clone()).collect();
        let out = compress_axes(ops, None).unwrap();
        let after: Vec<_> = out.iter().map(|op| op.dst.shape.clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_interior_reduction_axis_isolated() {
        let ops = wrap_ops(&[OpStep::reduce(
            OpKind::Sum,
            buf(&[2, 3, 4, 5], 1),
            buf(&[2, 1, 1, 1], 2),
            1,
        )]);
        let red = reduction_axis(&ops).unwrap();
        assert_eq!(red, Some(1));
        let out = compress_axes(ops, red).unwrap();

        let src = out[0].a.as_ref().unwrap().as_tensor().unwrap();
        assert_eq!(&src.shape[..], &[2, 3, 20]);
        assert_eq!(src.shape.iter().product::<usize>(), 2 * 3 * 4 * 5);
        // Reduction axis stays its own group, position preserved here
        assert_eq!(out[0].axis, Some(1));
        // Merged trailing group steps by the innermost stride
        assert_eq!(src.strides[2], 1);
    }

    #[test]
    fn test_trailing_reduction_axis() {
        let ops = wrap_ops(&[OpStep::reduce(
            OpKind::Sum,
            buf(&[2, 3, 4, 5], 1),
            buf(&[1, 1, 1, 1], 2),
            3,
        )]);
        let out = compress_axes(ops, Some(3)).unwrap();
        let src = out[0].a.as_ref().unwrap().as_tensor().unwrap();
        assert_eq!(&src.shape[..], &[24, 5]);
        assert_eq!(out[0].axis, Some(1));
    }

    #[test]
    fn test_no_reduction_merges_tail() {
        let ops = wrap_ops(&[OpStep::unary(
            OpKind::Neg,
            buf(&[2, 3, 4, 5], 1),
            buf(&[2, 3, 4, 5], 2),
        )]);
        let out = compress_axes(ops, None).unwrap();
        let src = out[0].a.as_ref().unwrap().as_tensor().unwrap();
        assert_eq!(&src.shape[..], &[2, 60]);
    }

    #[test]
    fn test_conflicting_reduction_axes() {
        let ops = wrap_ops(&[
            OpStep::reduce(OpKind::Sum, buf(&[4, 4], 1), buf(&[1, 4], 2), 0),
            OpStep::reduce(OpKind::Max, buf(&[4, 4], 1), buf(&[4, 1], 3), 1),
        ]);
        assert!(matches!(
            reduction_axis(&ops),
            Err(Error::ConflictingReductionAxes { first: 0, second: 1 })
        ));
    }
}
