//! Strided tensor descriptors consumed by the kernel generator
//!
//! A [`TensorDesc`] is an opaque description of an operand: logical shape,
//! element strides, dtype and buffer identity. Descriptors are constructed
//! fresh per compound-kernel build by the graph layer and are not retained
//! after kernel text is emitted.

use crate::dtype::DType;
use smallvec::SmallVec;

/// Maximum number of logical axes a fused kernel iterates over.
///
/// Higher-rank operand sets are merged down to this by the axis compressor.
pub const MAX_AXES: usize = 3;

/// Stack allocation threshold for dimensions
/// Most tensors have 4 or fewer dimensions, so we stack-allocate up to 4
const STACK_DIMS: usize = 4;

/// Shape type: dimensions of a tensor
pub type Shape = SmallVec<[usize; STACK_DIMS]>;

/// Strides type: element offsets between consecutive elements along each dimension
/// Signed to support negative strides (e.g., for flip views)
/// NOTE: strides are in ELEMENTS, not bytes
pub type Strides = SmallVec<[isize; STACK_DIMS]>;

/// Opaque identity of a device allocation.
///
/// Equality of two `BufferId`s means the operands alias the same underlying
/// buffer; the generator uses this to detect value reuse and in-place
/// update ordering. The contained value is never dereferenced here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Description of one strided tensor operand.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorDesc {
    /// Logical extent per axis
    pub shape: Shape,
    /// Element stride per axis (same length as `shape`)
    pub strides: Strides,
    /// Element data type
    pub dtype: DType,
    /// Backing allocation, or `None` for a value that exists only in
    /// registers during the fused kernel (not yet allocated)
    pub buffer: Option<BufferId>,
}

impl TensorDesc {
    /// Create a descriptor from explicit shape and strides.
    ///
    /// # Panics
    ///
    /// Panics if `shape` and `strides` have different lengths.
    pub fn new(shape: &[usize], strides: &[isize], dtype: DType, buffer: Option<BufferId>) -> Self {
        assert_eq!(
            shape.len(),
            strides.len(),
            "shape and strides must have equal rank"
        );
        Self {
            shape: shape.iter().copied().collect(),
            strides: strides.iter().copied().collect(),
            dtype,
            buffer,
        }
    }

    /// Create a descriptor with contiguous (row-major) strides.
    pub fn contiguous(shape: &[usize], dtype: DType, buffer: Option<BufferId>) -> Self {
        let mut strides: Strides = SmallVec::with_capacity(shape.len());
        let mut acc = 1isize;
        for &dim in shape.iter().rev() {
            strides.push(acc);
            acc *= dim as isize;
        }
        strides.reverse();
        Self {
            shape: shape.iter().copied().collect(),
            strides,
            dtype,
            buffer,
        }
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether this operand is backed by an allocated buffer.
    pub fn is_buffer(&self) -> bool {
        self.buffer.is_some()
    }
}
