//! Tensor descriptor normalization
//!
//! Every tensor operand of a fused sequence is wrapped in a [`TensorView`]
//! whose shape and strides are padded to the maximum rank required across
//! the whole sequence, substituting (size 1, stride 0) axes on the left
//! where an operand omits a dimension. Downstream stages therefore never
//! special-case rank.

use crate::dtype::DType;
use crate::ops::{OpKind, OpStep, Operand};
use crate::tensor::{BufferId, Shape, Strides, TensorDesc};
use smallvec::smallvec;

/// A rank-normalized view of one tensor operand.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TensorView {
    /// Padded shape, exactly `max_dims` entries
    pub shape: Shape,
    /// Padded element strides, exactly `max_dims` entries
    pub strides: Strides,
    /// Element data type
    pub dtype: DType,
    /// Backing allocation, if any
    pub buffer: Option<BufferId>,
}

impl TensorView {
    /// Normalize a descriptor to exactly `max_dims` axes (1 ≤ max_dims).
    ///
    /// Rank-0 descriptors become a single degenerate axis first; smaller
    /// ranks are left-padded with (size 1, stride 0) axes.
    pub fn normalize(desc: &TensorDesc, max_dims: usize) -> Self {
        let mut shape: Shape = desc.shape.clone();
        let mut strides: Strides = desc.strides.clone();

        if shape.is_empty() {
            shape = smallvec![1];
            strides = smallvec![0];
        }

        while shape.len() < max_dims {
            shape.insert(0, 1);
            strides.insert(0, 0);
        }

        Self {
            shape,
            strides,
            dtype: desc.dtype,
            buffer: desc.buffer,
        }
    }

    /// Whether this view is backed by an allocated buffer.
    pub fn is_buffer(&self) -> bool {
        self.buffer.is_some()
    }
}

/// One input operand after normalization.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ViewOperand {
    Const(f32),
    Tensor(TensorView),
}

impl ViewOperand {
    pub fn as_tensor(&self) -> Option<&TensorView> {
        match self {
            ViewOperand::Tensor(view) => Some(view),
            ViewOperand::Const(_) => None,
        }
    }

}

/// One op of the sequence with all tensor operands normalized.
#[derive(Clone, Debug)]
pub(crate) struct ViewOp {
    pub kind: OpKind,
    pub a: Option<ViewOperand>,
    pub b: Option<ViewOperand>,
    pub dst: TensorView,
    pub axis: Option<usize>,
}

impl ViewOp {
    /// Input operands in positional order, skipping absent ones.
    pub fn inputs(&self) -> impl Iterator<Item = &ViewOperand> {
        self.a.iter().chain(self.b.iter())
    }

    /// All tensor views of this op (inputs then destination).
    pub fn tensors(&self) -> impl Iterator<Item = &TensorView> {
        self.inputs()
            .filter_map(ViewOperand::as_tensor)
            .chain(std::iter::once(&self.dst))
    }
}

/// Wrap every tensor operand of the sequence in a rank-normalized view.
///
/// The target rank is the maximum rank over all tensor operands (1 for an
/// all-scalar sequence), computed over the whole sequence before any
/// wrapping so every view ends up with the same rank.
pub(crate) fn wrap_ops(ops: &[OpStep]) -> Vec<ViewOp> {
    let mut max_dims = 1;
    for op in ops {
        for operand in op.a.iter().chain(op.b.iter()) {
            if let Operand::Tensor(desc) = operand {
                max_dims = max_dims.max(desc.rank());
            }
        }
        max_dims = max_dims.max(op.dst.rank());
    }

    let wrap_operand = |operand: &Option<Operand>| -> Option<ViewOperand> {
        operand.as_ref().map(|operand| match operand {
            Operand::Const(value) => ViewOperand::Const(*value),
            Operand::Tensor(desc) => ViewOperand::Tensor(TensorView::normalize(desc, max_dims)),
        })
    };

    ops.iter()
        .map(|op| ViewOp {
            kind: op.kind,
            a: wrap_operand(&op.a),
            b: wrap_operand(&op.b),
            dst: TensorView::normalize(&op.dst, max_dims),
            axis: op.axis,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn test_normalize_pads_left() {
        let desc = TensorDesc::new(&[5], &[1], DType::F32, Some(BufferId(1)));
        let view = TensorView::normalize(&desc, 3);
        assert_eq!(&view.shape[..], &[1, 1, 5]);
        assert_eq!(&view.strides[..], &[0, 0, 1]);
    }

    #[test]
    fn test_normalize_rank0() {
        let desc = TensorDesc::contiguous(&[], DType::F32, None);
        let view = TensorView::normalize(&desc, 2);
        assert_eq!(&view.shape[..], &[1, 1]);
        assert_eq!(&view.strides[..], &[0, 0]);
    }

    #[test]
    fn test_wrap_uses_sequence_wide_rank() {
        let a = TensorDesc::contiguous(&[4, 4], DType::F32, Some(BufferId(1)));
        let b = TensorDesc::contiguous(&[4], DType::F32, Some(BufferId(2)));
        let dst = TensorDesc::contiguous(&[4, 4], DType::F32, Some(BufferId(3)));
        let ops = vec![crate::ops::OpStep::binary(OpKind::Add, a, b, dst)];

        let wrapped = wrap_ops(&ops);
        for view in wrapped[0].tensors() {
            assert_eq!(view.shape.len(), 2);
        }
        // The rank-1 operand is broadcast along the padded axis
        let b_view = wrapped[0].b.as_ref().unwrap().as_tensor().unwrap();
        assert_eq!(&b_view.shape[..], &[1, 4]);
        assert_eq!(b_view.strides[0], 0);
    }
}
