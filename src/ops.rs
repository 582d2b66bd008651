//! Operation vocabulary for fused kernels
//!
//! A compound kernel is described by a linear sequence of [`OpStep`]s. Each
//! step applies one element-wise or reduction [`OpKind`] to up to two input
//! operands and writes one destination view. The kind vocabulary is a
//! closed enum: code templates and register initializers are resolved by
//! pattern match in the code generator, so an unknown kind cannot reach
//! emission.

use crate::error::{Error, Result};
use crate::tensor::TensorDesc;

/// Kind of a fused operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    // Element-wise unary
    /// Copy input to output
    Assign,
    /// Arithmetic negation
    Neg,
    /// Absolute value
    Abs,
    /// Square root
    Sqrt,
    /// Square
    Sqr,
    /// Natural exponential
    Exp,
    /// Natural logarithm
    Log,
    /// Base-2 exponential
    Exp2,
    /// Base-2 logarithm
    Log2,
    /// Logistic sigmoid, `1 / (1 + exp(-x))`
    Sig,
    /// Base-2 sigmoid variant, `1 / (1 + exp2(-x))`
    Sig2,
    /// Hyperbolic tangent
    Tanh,
    /// Base-2 tanh variant
    Tanh2,
    /// Logarithm clamped to -50 for non-positive inputs
    Safelog,

    // Element-wise binary
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Equality comparison
    Eq,
    /// Inequality comparison
    Ne,
    /// Less-than comparison
    Lt,
    /// Less-or-equal comparison
    Le,
    /// Greater-than comparison
    Gt,
    /// Greater-or-equal comparison
    Ge,
    /// Power
    Pow,
    /// Element-wise minimum
    Minimum,
    /// Element-wise maximum
    Maximum,

    // Reductions (collapse one logical axis)
    /// Sum reduction
    Sum,
    /// Max reduction
    Max,
    /// Min reduction
    Min,
    /// Index of the maximum element
    Argmax,
    /// Index of the minimum element
    Argmin,
}

impl OpKind {
    /// Lower-case name used in kernel naming.
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Assign => "assign",
            OpKind::Neg => "neg",
            OpKind::Abs => "abs",
            OpKind::Sqrt => "sqrt",
            OpKind::Sqr => "sqr",
            OpKind::Exp => "exp",
            OpKind::Log => "log",
            OpKind::Exp2 => "exp2",
            OpKind::Log2 => "log2",
            OpKind::Sig => "sig",
            OpKind::Sig2 => "sig2",
            OpKind::Tanh => "tanh",
            OpKind::Tanh2 => "tanh2",
            OpKind::Safelog => "safelog",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Eq => "eq",
            OpKind::Ne => "ne",
            OpKind::Lt => "lt",
            OpKind::Le => "le",
            OpKind::Gt => "gt",
            OpKind::Ge => "ge",
            OpKind::Pow => "pow",
            OpKind::Minimum => "minimum",
            OpKind::Maximum => "maximum",
            OpKind::Sum => "sum",
            OpKind::Max => "max",
            OpKind::Min => "min",
            OpKind::Argmax => "argmax",
            OpKind::Argmin => "argmin",
        }
    }

    /// Whether this kind collapses a logical axis.
    pub fn is_reduction(self) -> bool {
        matches!(
            self,
            OpKind::Sum | OpKind::Max | OpKind::Min | OpKind::Argmax | OpKind::Argmin
        )
    }

    /// Whether this kind is an argmax/argmin style index reduction.
    pub fn is_arg_reduction(self) -> bool {
        matches!(self, OpKind::Argmax | OpKind::Argmin)
    }

    /// Whether this kind reads a second operand.
    pub(crate) fn needs_second_operand(self) -> bool {
        matches!(
            self,
            OpKind::Add
                | OpKind::Sub
                | OpKind::Mul
                | OpKind::Div
                | OpKind::Eq
                | OpKind::Ne
                | OpKind::Lt
                | OpKind::Le
                | OpKind::Gt
                | OpKind::Ge
                | OpKind::Pow
                | OpKind::Minimum
                | OpKind::Maximum
        ) || self.is_arg_reduction()
    }

    /// Register initializer for a reduction destination.
    pub(crate) fn reduction_init(self) -> &'static str {
        match self {
            OpKind::Sum => "0.0f",
            OpKind::Max => "-FLT_MAX",
            OpKind::Min => "FLT_MAX",
            OpKind::Argmax | OpKind::Argmin => "0",
            _ => "0.0f",
        }
    }
}

/// One input operand of an [`OpStep`].
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// Immediate scalar constant, passed to the kernel as an argument
    Const(f32),
    /// Strided tensor view
    Tensor(TensorDesc),
}

impl From<f32> for Operand {
    fn from(value: f32) -> Self {
        Operand::Const(value)
    }
}

impl From<TensorDesc> for Operand {
    fn from(desc: TensorDesc) -> Self {
        Operand::Tensor(desc)
    }
}

/// One operation of a fused sequence: `(kind, a, b, dst, axis?)`.
#[derive(Clone, Debug, PartialEq)]
pub struct OpStep {
    /// Operation kind
    pub kind: OpKind,
    /// First input operand (`None` only for kinds that take no input)
    pub a: Option<Operand>,
    /// Second input operand
    pub b: Option<Operand>,
    /// Destination view
    pub dst: TensorDesc,
    /// Reduction axis; present iff `kind.is_reduction()`
    pub axis: Option<usize>,
}

impl OpStep {
    /// Build a unary element-wise step.
    pub fn unary(kind: OpKind, a: impl Into<Operand>, dst: TensorDesc) -> Self {
        Self {
            kind,
            a: Some(a.into()),
            b: None,
            dst,
            axis: None,
        }
    }

    /// Build a binary element-wise step.
    pub fn binary(
        kind: OpKind,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
        dst: TensorDesc,
    ) -> Self {
        Self {
            kind,
            a: Some(a.into()),
            b: Some(b.into()),
            dst,
            axis: None,
        }
    }

    /// Build a reduction step collapsing `axis`.
    pub fn reduce(kind: OpKind, a: impl Into<Operand>, dst: TensorDesc, axis: usize) -> Self {
        Self {
            kind,
            a: Some(a.into()),
            b: None,
            dst,
            axis: Some(axis),
        }
    }

    /// Build an argmax/argmin step. `running` is a scratch view holding the
    /// running best value while `dst` receives the winning index.
    pub fn arg_reduce(
        kind: OpKind,
        a: impl Into<Operand>,
        running: impl Into<Operand>,
        dst: TensorDesc,
        axis: usize,
    ) -> Self {
        Self {
            kind,
            a: Some(a.into()),
            b: Some(running.into()),
            dst,
            axis: Some(axis),
        }
    }

    /// Validate the step's shape: reductions must carry an axis within the
    /// operand's rank, element-wise kinds must not carry one, and every
    /// operand the kind reads must be present.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_reduction() && self.axis.is_none() {
            return Err(Error::Internal(format!(
                "reduction op '{}' without a reduction axis",
                self.kind.name()
            )));
        }
        if !self.kind.is_reduction() && self.axis.is_some() {
            return Err(Error::Internal(format!(
                "element-wise op '{}' carries a reduction axis",
                self.kind.name()
            )));
        }
        if let Some(axis) = self.axis {
            let rank = match &self.a {
                Some(Operand::Tensor(desc)) => desc.rank(),
                _ => self.dst.rank(),
            };
            if axis >= rank {
                return Err(Error::Internal(format!(
                    "reduction axis {} out of range for rank-{} operand",
                    axis, rank
                )));
            }
        }
        if self.a.is_none() {
            return Err(Error::Internal(format!(
                "op '{}' has no first operand",
                self.kind.name()
            )));
        }
        if self.kind.needs_second_operand() && self.b.is_none() {
            return Err(Error::Internal(format!(
                "op '{}' requires a second operand",
                self.kind.name()
            )));
        }
        Ok(())
    }
}
