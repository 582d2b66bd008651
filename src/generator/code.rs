//! Statement IR and the kernel-source serializer
//!
//! The assembler builds a small tree of statement nodes instead of pasting
//! strings at each emission site; this file is the single place where IR
//! nodes become CUDA source text. Register and buffer names are produced
//! centrally by the operand arena, so name collisions and template-field
//! mismatches cannot arise at render time.
//!
//! Reduction idioms follow the classic two-level scheme: a butterfly
//! `__shfl_xor_sync` tree within each warp, then - for blocks wider than
//! one warp - warp leaders publish partials to shared memory, the first
//! warp reduces those, and the result is re-broadcast through shared
//! memory with `__syncthreads()` on both sides of the cross-warp handoff.

use crate::ops::OpKind;

const INDENT: &str = "    ";

/// Address variable used for the loop-axis term of an index computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ItemVar {
    /// Per-iteration loop variable `item`
    Loop,
    /// Block-invariant `idx<loop_axis>`; the access is a broadcast
    Broadcast,
}

/// One emitted statement.
#[derive(Clone, Debug)]
pub(crate) enum Stmt {
    /// `index = <sum of stride terms for `buffer`>;`
    Index { buffer: String, item: ItemVar },
    /// `<reg> = <buffer>[index];`
    Load { reg: String, buffer: String },
    /// `<buffer>[index] = <reg>;`
    Store { buffer: String, reg: String },
    /// Store gated on loop-index 0 (reduction finalization / broadcast dst)
    GuardedStore { buffer: String, reg: String },
    /// Element-wise or reduction-accumulate statement
    Apply {
        kind: OpKind,
        x: String,
        y: String,
        out: String,
    },
    /// Strided per-thread loop over the loop axis
    ItemLoop { body: Vec<Stmt> },
    /// Butterfly shuffle reduction; block is a single warp
    WarpReduce { kind: OpKind, out: String, y: String },
    /// Two-level warp + shared-memory tree reduction
    BlockReduce {
        kind: OpKind,
        out: String,
        y: String,
        sbuf: String,
    },
}

/// Axis context the serializer renders against.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RenderCx {
    /// Active dimensionality (1..=3)
    pub dims: usize,
    /// Logical axis the item loop runs over (always hardware x)
    pub loop_axis: usize,
}

/// Render a statement list at the given indent depth.
pub(crate) fn render(stmts: &[Stmt], cx: RenderCx, depth: usize) -> String {
    let mut out = String::new();
    for stmt in stmts {
        render_stmt(stmt, cx, depth, &mut out);
    }
    out
}

fn render_stmt(stmt: &Stmt, cx: RenderCx, depth: usize, out: &mut String) {
    let pad = INDENT.repeat(depth);
    match stmt {
        Stmt::Index { buffer, item } => {
            out.push('\n');
            out.push_str(&pad);
            out.push_str(&format!("index = {};", index_terms(buffer, *item, cx)));
        }
        Stmt::Load { reg, buffer } => {
            out.push('\n');
            out.push_str(&pad);
            out.push_str(&format!("{reg} = {buffer}[index];"));
        }
        Stmt::Store { buffer, reg } => {
            out.push('\n');
            out.push_str(&pad);
            out.push_str(&format!("{buffer}[index] = {reg};"));
        }
        Stmt::GuardedStore { buffer, reg } => {
            out.push('\n');
            out.push_str(&pad);
            out.push_str(&format!(
                "if(idx{} == 0) {{{buffer}[index] = {reg};}}",
                cx.loop_axis
            ));
        }
        Stmt::Apply { kind, x, y, out: dst } => {
            out.push('\n');
            out.push_str(&pad);
            out.push_str(&apply_stmt(*kind, x, y, dst));
        }
        Stmt::ItemLoop { body } => {
            out.push('\n');
            out.push_str(&pad);
            out.push_str(&format!(
                "for(int item = idx{}; item < loopmax; item += blockDim.x)",
                cx.loop_axis
            ));
            out.push('\n');
            out.push_str(&pad);
            out.push('{');
            out.push_str(&render(body, cx, depth + 1));
            out.push('\n');
            out.push_str(&pad);
            out.push('}');
        }
        Stmt::WarpReduce { kind, out: dst, y } => {
            let statement = shuffle_stmt(*kind, dst, y, &INDENT.repeat(2));
            out.push_str(&format!(
                r#"
    #pragma unroll
    for (int i = 16; i > 0; i >>= 1)
    {{
        {statement}
    }}
"#
            ));
        }
        Stmt::BlockReduce {
            kind,
            out: dst,
            y,
            sbuf,
        } => {
            let statement = shuffle_stmt(*kind, dst, y, &INDENT.repeat(2));
            let inner = shuffle_stmt(*kind, dst, y, &INDENT.repeat(3));
            out.push_str(&format!(
                r#"
    // Reduce within warp
    #pragma unroll
    for (int i = 16; i > 0; i >>= 1)
    {{
        {statement}
    }}
    if (!(threadIdx.x & 0x1f))
    {{
        {sbuf}[threadIdx.x >> 5] = {dst};
    }}

    __syncthreads();

    // Reduce between warps (max of 32 warps since block has max 1024 threads)
    if (threadIdx.x < 32)
    {{
        {dst} = {sbuf}[threadIdx.x];

        #pragma unroll
        for (int i = 16; i > 0; i >>= 1)
        {{
            {inner}
        }}
    }}

    if (threadIdx.x == 0)
    {{
        {sbuf}[0] = {dst};
    }}

    __syncthreads();

    {dst} = {sbuf}[0];
"#
            ));
        }
    }
}

/// Stride-weighted index expression for one buffer access.
fn index_terms(buffer: &str, item: ItemVar, cx: RenderCx) -> String {
    let terms: Vec<String> = (0..cx.dims)
        .map(|axis| {
            let var = if axis == cx.loop_axis {
                match item {
                    ItemVar::Loop => "item".to_string(),
                    ItemVar::Broadcast => format!("idx{axis}"),
                }
            } else {
                format!("idx{axis}")
            };
            format!("{var} * stride{}_{buffer}", stride_letter(axis))
        })
        .collect();
    terms.join(" + ")
}

/// Stride argument suffix per logical axis (`stridea`, `strideb`, `stridec`).
pub(crate) fn stride_letter(axis: usize) -> char {
    (b'a' + axis as u8) as char
}

/// Element-wise statement, or the per-item accumulate for reductions.
fn apply_stmt(kind: OpKind, x: &str, y: &str, out: &str) -> String {
    match kind {
        OpKind::Assign => format!("{out} = {x};"),
        OpKind::Neg => format!("{out} = -{x};"),
        OpKind::Abs => format!("{out} = fabsf({x});"),
        OpKind::Sqrt => format!("{out} = sqrtf({x});"),
        OpKind::Sqr => format!("{out} = {x} * {x};"),
        OpKind::Exp => format!("{out} = expf({x});"),
        OpKind::Log => format!("{out} = logf({x});"),
        OpKind::Exp2 => format!("{out} = exp2f({x});"),
        OpKind::Log2 => format!("{out} = log2f({x});"),
        OpKind::Sig => format!("{out} = 1.0f / (1.0f + expf(-{x}));"),
        OpKind::Sig2 => format!("{out} = 1.0f / (1.0f + exp2f(-{x}));"),
        OpKind::Tanh => format!("{out} = tanhf({x});"),
        OpKind::Tanh2 => {
            format!("{out} = (exp2f(2.0f * {x}) - 1.0f) / (exp2f(2.0f * {x}) + 1.0f);")
        }
        OpKind::Safelog => format!("{out} = ({x} > 0.0f) ? logf({x}) : -50.0f;"),
        OpKind::Add => format!("{out} = {x} + {y};"),
        OpKind::Sub => format!("{out} = {x} - {y};"),
        OpKind::Mul => format!("{out} = {x} * {y};"),
        OpKind::Div => format!("{out} = {x} / {y};"),
        OpKind::Eq => format!("{out} = {x} == {y};"),
        OpKind::Ne => format!("{out} = {x} != {y};"),
        OpKind::Lt => format!("{out} = {x} < {y};"),
        OpKind::Le => format!("{out} = {x} <= {y};"),
        OpKind::Gt => format!("{out} = {x} > {y};"),
        OpKind::Ge => format!("{out} = {x} >= {y};"),
        OpKind::Pow => format!("{out} = powf({x}, {y});"),
        OpKind::Minimum => format!("{out} = fminf({x}, {y});"),
        OpKind::Maximum => format!("{out} = fmaxf({x}, {y});"),
        OpKind::Sum => format!("{out} = {out} + {x};"),
        OpKind::Max => format!("{out} = fmaxf({out}, {x});"),
        OpKind::Min => format!("{out} = fminf({out}, {x});"),
        OpKind::Argmax => format!("if({x} > {y}) {{{out} = item; {y} = {x};}}"),
        OpKind::Argmin => format!("if({x} < {y}) {{{out} = item; {y} = {x};}}"),
    }
}

/// One step of the butterfly shuffle tree for a reduction kind.
///
/// `indent` prefixes continuation lines of the multi-line argmax/argmin
/// forms so the rendered block lines up inside its unroll loop.
fn shuffle_stmt(kind: OpKind, out: &str, y: &str, indent: &str) -> String {
    match kind {
        OpKind::Sum => format!("{out} = {out} + __shfl_xor_sync(0xffffffff, {out}, i);"),
        OpKind::Max => format!("{out} = fmaxf({out}, __shfl_xor_sync(0xffffffff, {out}, i));"),
        OpKind::Min => format!("{out} = fminf({out}, __shfl_xor_sync(0xffffffff, {out}, i));"),
        OpKind::Argmax => format!(
            "temp_idx = __shfl_xor_sync(0xffffffff, {out}, i);\n\
             {indent}temp_val = __shfl_xor_sync(0xffffffff, {y}, i);\n\
             {indent}if(temp_val > {y}) {{{out} = temp_idx; {y} = temp_val;}}"
        ),
        OpKind::Argmin => format!(
            "temp_idx = __shfl_xor_sync(0xffffffff, {out}, i);\n\
             {indent}temp_val = __shfl_xor_sync(0xffffffff, {y}, i);\n\
             {indent}if(temp_val < {y}) {{{out} = temp_idx; {y} = temp_val;}}"
        ),
        other => unreachable!("shuffle statement for non-reduction kind {other:?}"),
    }
}
