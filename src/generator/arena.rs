//! Operand arena
//!
//! Every operand of the fused sequence (scalar constant or tensor view) is
//! interned into an arena and addressed by a small integer id from then on.
//! "Same operand" is explicit index equality: constants dedup by value
//! bits, tensors by buffer identity (structural equality for the rare
//! buffer-less, register-only views). Each record carries the symbolic
//! names used in the generated source, so one operand identity always maps
//! to the same register / buffer name within a build - the property that
//! turns repeated reads into register reuse instead of redundant loads.

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::generator::view::{TensorView, ViewOp, ViewOperand};
use crate::ops::OpKind;

/// Index of an operand record in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct OperandId(pub usize);

/// One interned operand.
#[derive(Clone, Debug)]
pub(crate) enum OperandRecord {
    /// Scalar constant, passed as a kernel argument
    Const {
        value: f32,
        /// Kernel argument name, `constant<N>`
        name: String,
    },
    /// Tensor view held in a register while a stage runs
    Tensor {
        view: TensorView,
        /// Register name, `reg<N>`
        reg: String,
        /// Register C type (`float` / `int`)
        ctype: &'static str,
        /// Register initializer
        init: &'static str,
        /// Kernel buffer argument name, `buf<N>`; `None` for register-only views
        buffer_name: Option<String>,
    },
}

impl OperandRecord {
    /// Symbolic name substituted into op statements.
    pub fn symbol(&self) -> &str {
        match self {
            OperandRecord::Const { name, .. } => name,
            OperandRecord::Tensor { reg, .. } => reg,
        }
    }

    /// The tensor view, when this operand is one.
    pub fn view(&self) -> Option<&TensorView> {
        match self {
            OperandRecord::Tensor { view, .. } => Some(view),
            OperandRecord::Const { .. } => None,
        }
    }

    /// Buffer argument name, when this operand is memory-backed.
    pub fn buffer_name(&self) -> Option<&str> {
        match self {
            OperandRecord::Tensor { buffer_name, .. } => buffer_name.as_deref(),
            OperandRecord::Const { .. } => None,
        }
    }

    /// Whether this operand is a memory-backed tensor.
    pub fn is_buffer(&self) -> bool {
        self.buffer_name().is_some()
    }
}

/// One op with its operands resolved to arena ids.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ArenaOp {
    pub kind: OpKind,
    pub a: Option<OperandId>,
    pub b: Option<OperandId>,
    pub dst: OperandId,
}

impl ArenaOp {
    /// Input ids in positional order.
    pub fn inputs(&self) -> impl Iterator<Item = OperandId> {
        self.a.into_iter().chain(self.b)
    }
}

/// Arena of interned operands, in first-encounter order.
#[derive(Debug, Default)]
pub(crate) struct OperandArena {
    records: Vec<OperandRecord>,
    reg_count: usize,
    const_count: usize,
    buffer_count: usize,
}

/// C register type for a supported element dtype.
///
/// Half-precision values are loaded into full `float` registers; the
/// remaining dtypes have no lane type in the emitted dialect.
pub(crate) fn register_ctype(dtype: DType) -> Result<&'static str> {
    match dtype {
        DType::F32 | DType::F16 => Ok("float"),
        DType::I32 => Ok("int"),
        other => Err(Error::UnsupportedDType {
            dtype: other,
            op: "compound kernel",
        }),
    }
}

impl OperandArena {
    pub fn get(&self, id: OperandId) -> &OperandRecord {
        &self.records[id.0]
    }

    /// All records in interning order.
    pub fn records(&self) -> impl Iterator<Item = (OperandId, &OperandRecord)> {
        self.records
            .iter()
            .enumerate()
            .map(|(index, record)| (OperandId(index), record))
    }

    fn find_const(&self, value: f32) -> Option<OperandId> {
        self.records.iter().position(|record| match record {
            OperandRecord::Const { value: v, .. } => v.to_bits() == value.to_bits(),
            _ => false,
        }).map(OperandId)
    }

    fn find_tensor(&self, view: &TensorView) -> Option<OperandId> {
        self.records
            .iter()
            .position(|record| match record.view() {
                Some(existing) => match (existing.buffer, view.buffer) {
                    (Some(a), Some(b)) => a == b,
                    (None, None) => existing == view,
                    _ => false,
                },
                None => false,
            })
            .map(OperandId)
    }

    fn intern_const(&mut self, value: f32) -> OperandId {
        if let Some(id) = self.find_const(value) {
            return id;
        }
        let name = format!("constant{}", self.const_count);
        self.const_count += 1;
        self.records.push(OperandRecord::Const { value, name });
        OperandId(self.records.len() - 1)
    }

    fn intern_tensor(&mut self, view: &TensorView, init: &'static str) -> Result<OperandId> {
        if let Some(id) = self.find_tensor(view) {
            return Ok(id);
        }
        let ctype = register_ctype(view.dtype)?;
        let reg = format!("reg{}", self.reg_count);
        self.reg_count += 1;
        let buffer_name = view.is_buffer().then(|| {
            let name = format!("buf{}", self.buffer_count);
            self.buffer_count += 1;
            name
        });
        self.records.push(OperandRecord::Tensor {
            view: view.clone(),
            reg,
            ctype,
            init,
            buffer_name,
        });
        Ok(OperandId(self.records.len() - 1))
    }
}

/// Intern every operand of the sequence and resolve ops to ids.
///
/// Initializers are fixed at first encounter: reduction destinations start
/// from the reduction's identity element, the running-value operand of an
/// argmax/argmin starts from the opposite extreme, everything else from
/// zero. Unsupported dtypes surface here, before any source is emitted.
pub(crate) fn intern_ops(ops: &[ViewOp]) -> Result<(OperandArena, Vec<ArenaOp>)> {
    let mut arena = OperandArena::default();
    let mut out = Vec::with_capacity(ops.len());

    for op in ops {
        let mut intern_input = |operand: &Option<ViewOperand>,
                                init: &'static str|
         -> Result<Option<OperandId>> {
            match operand {
                None => Ok(None),
                Some(ViewOperand::Const(value)) => Ok(Some(arena.intern_const(*value))),
                Some(ViewOperand::Tensor(view)) => arena.intern_tensor(view, init).map(Some),
            }
        };

        let a = intern_input(&op.a, "0.0f")?;
        let b_init = match op.kind {
            OpKind::Argmax => "-FLT_MAX",
            OpKind::Argmin => "FLT_MAX",
            _ => "0.0f",
        };
        let b = intern_input(&op.b, b_init)?;
        let dst_init = if op.kind.is_reduction() {
            op.kind.reduction_init()
        } else {
            "0.0f"
        };
        let dst = arena.intern_tensor(&op.dst, dst_init)?;

        out.push(ArenaOp { kind: op.kind, a, b, dst });
    }

    Ok((arena, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::view::wrap_ops;
    use crate::ops::OpStep;
    use crate::tensor::{BufferId, TensorDesc};

    fn buf(shape: &[usize], id: u64) -> TensorDesc {
        TensorDesc::contiguous(shape, DType::F32, Some(BufferId(id)))
    }

    #[test]
    fn test_same_buffer_same_register() {
        let x = buf(&[16], 1);
        let t = buf(&[16], 2);
        let ops = wrap_ops(&[
            OpStep::binary(OpKind::Mul, x.clone(), x.clone(), t.clone()),
            OpStep::binary(OpKind::Add, t.clone(), x, buf(&[16], 3)),
        ]);
        let (arena, aops) = intern_ops(&ops).unwrap();
        // x appears three times but is interned once; the sequence has
        // exactly three distinct operands (x, t, and the output)
        assert_eq!(aops[0].a, aops[0].b);
        assert_eq!(aops[0].a, aops[1].b);
        assert_eq!(aops[0].dst, aops[1].a.unwrap());
        assert_eq!(arena.records().count(), 3);
    }

    #[test]
    fn test_constants_dedup_by_value() {
        let ops = wrap_ops(&[
            OpStep::binary(OpKind::Mul, buf(&[8], 1), 2.0f32, buf(&[8], 2)),
            OpStep::binary(OpKind::Add, buf(&[8], 2), 2.0f32, buf(&[8], 3)),
        ]);
        let (arena, aops) = intern_ops(&ops).unwrap();
        assert_eq!(aops[0].b, aops[1].b);
        let record = arena.get(aops[0].b.unwrap());
        assert_eq!(record.symbol(), "constant0");
    }

    #[test]
    fn test_unsupported_dtype_rejected() {
        let bad = TensorDesc::contiguous(&[8], DType::F64, Some(BufferId(1)));
        let ops = wrap_ops(&[OpStep::unary(OpKind::Neg, bad, buf(&[8], 2))]);
        assert!(matches!(
            intern_ops(&ops),
            Err(Error::UnsupportedDType { .. })
        ));
    }

    #[test]
    fn test_reduction_dest_initializer() {
        let ops = wrap_ops(&[OpStep::reduce(
            OpKind::Max,
            buf(&[4, 4], 1),
            buf(&[1, 4], 2),
            0,
        )]);
        let (arena, aops) = intern_ops(&ops).unwrap();
        match arena.get(aops[0].dst) {
            OperandRecord::Tensor { init, .. } => assert_eq!(*init, "-FLT_MAX"),
            _ => panic!("destination must be a tensor record"),
        }
    }
}
