//! Dependency-aware staging
//!
//! The linear op sequence is partitioned into ordered stages. Reductions
//! delimit stages: a reduction op opens a fresh stage and closes it, so
//! intermediate values never need to survive a reduction boundary in a
//! register. Inside a stage, producer dependencies are satisfied before
//! the depending op:
//!
//! - register-only (buffer-less) intermediates produced in an earlier
//!   stage are *recomputed* in the consuming stage - element-wise ops are
//!   pure, so duplication is correctness-preserving and cheaper than a
//!   memory round-trip;
//! - buffer-backed intermediates are *reloaded* from memory instead;
//! - reduction results are emitted exactly once and carry across stage
//!   boundaries (every thread holds the finalized value in a register).
//!
//! Dependency insertion is iterative with an explicit work stack and an
//! on-stack set; a cyclic sequence fails fast with `CyclicDependency`
//! instead of overflowing the call stack. Sequences built by a linear
//! scan can only point backwards, so the check is a guarded precondition.
//!
//! Recomputation can leave an op instance whose result is neither stored
//! nor consumed within its stage; a final sweep removes such dead
//! instances so they never reach the emitted kernel.

use crate::error::{Error, Result};
use crate::generator::arena::{ArenaOp, OperandArena, OperandId};
use std::collections::{HashMap, HashSet};

/// Stages of op indices, in emission order. The same index may appear in
/// several stages when a register-only intermediate is recomputed.
pub(crate) type Stages = Vec<Vec<usize>>;

enum Frame {
    Enter(usize),
    Exit(usize),
}

/// Partition `ops` into reduction-delimited stages.
pub(crate) fn build_stages(ops: &[ArenaOp], arena: &OperandArena) -> Result<Stages> {
    // Last writer per operand identity, then dependencies per op. Both are
    // built in one pass, so an op only ever depends on earlier indices.
    let mut updaters: HashMap<OperandId, usize> = HashMap::new();
    let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(ops.len());
    for (index, op) in ops.iter().enumerate() {
        let deps = op
            .inputs()
            .filter_map(|input| updaters.get(&input).copied())
            .collect();
        dependencies.push(deps);
        updaters.insert(op.dst, index);
    }

    let mut stages: Stages = vec![Vec::new()];
    let mut last_emitted: HashMap<usize, usize> = HashMap::new();

    for index in 0..ops.len() {
        let stage_done = {
            let current = stages.last().expect("at least one stage");
            !current.is_empty()
                && (ops[index].kind.is_reduction()
                    || ops[*current.last().expect("non-empty")].kind.is_reduction())
        };
        if stage_done {
            stages.push(Vec::new());
        }
        emit_with_deps(index, ops, arena, &dependencies, &mut stages, &mut last_emitted)?;
    }

    Ok(prune_dead_instances(ops, arena, stages))
}

/// Whether `dep`'s value must be recomputed in the current stage.
fn needs_recompute(
    dep: usize,
    current: usize,
    ops: &[ArenaOp],
    arena: &OperandArena,
    last_emitted: &HashMap<usize, usize>,
) -> bool {
    if last_emitted.get(&dep) == Some(&current) {
        return false; // already valid in this stage
    }
    if ops[dep].kind.is_reduction() {
        return false; // carried in registers across stages
    }
    if arena.get(ops[dep].dst).is_buffer() {
        return false; // reloaded from memory instead
    }
    true
}

/// Append `root` to the current stage, recomputing any of its
/// register-only dependencies that are not valid there.
fn emit_with_deps(
    root: usize,
    ops: &[ArenaOp],
    arena: &OperandArena,
    dependencies: &[Vec<usize>],
    stages: &mut Stages,
    last_emitted: &mut HashMap<usize, usize>,
) -> Result<()> {
    let current = stages.len() - 1;
    let mut on_stack: HashSet<usize> = HashSet::from([root]);
    let mut work: Vec<Frame> = dependencies[root]
        .iter()
        .rev()
        .map(|&dep| Frame::Enter(dep))
        .collect();

    while let Some(frame) = work.pop() {
        match frame {
            Frame::Enter(dep) => {
                if on_stack.contains(&dep) {
                    return Err(Error::CyclicDependency { index: dep });
                }
                if !needs_recompute(dep, current, ops, arena, last_emitted) {
                    continue;
                }
                on_stack.insert(dep);
                work.push(Frame::Exit(dep));
                for &transitive in dependencies[dep].iter().rev() {
                    work.push(Frame::Enter(transitive));
                }
            }
            Frame::Exit(dep) => {
                on_stack.remove(&dep);
                stages[current].push(dep);
                last_emitted.insert(dep, current);
            }
        }
    }

    stages[current].push(root);
    last_emitted.insert(root, current);
    Ok(())
}

/// Remove instances whose result is neither stored nor consumed in their
/// stage, then drop stages left empty.
///
/// Stores only happen at the overall last write of a buffer, and
/// register-only values never cross stages (readers recompute), so an
/// instance is live iff it is a reduction, the last write of a buffer, or
/// read later within its own stage.
fn prune_dead_instances(ops: &[ArenaOp], arena: &OperandArena, mut stages: Stages) -> Stages {
    loop {
        // Overall last write position per buffer-backed destination
        let mut last_write: HashMap<OperandId, (usize, usize)> = HashMap::new();
        for (stage_index, stage) in stages.iter().enumerate() {
            for (pos, &op_index) in stage.iter().enumerate() {
                let dst = ops[op_index].dst;
                if arena.get(dst).is_buffer() {
                    last_write.insert(dst, (stage_index, pos));
                }
            }
        }

        let mut changed = false;
        for stage_index in 0..stages.len() {
            let stage = &stages[stage_index];
            let keep: Vec<bool> = stage
                .iter()
                .enumerate()
                .map(|(pos, &op_index)| {
                    let op = &ops[op_index];
                    if op.kind.is_reduction() {
                        return true;
                    }
                    if last_write.get(&op.dst) == Some(&(stage_index, pos)) {
                        return true;
                    }
                    stage[pos + 1..]
                        .iter()
                        .any(|&later| ops[later].inputs().any(|input| input == op.dst))
                })
                .collect();
            if keep.iter().any(|&live| !live) {
                let mut iter = keep.iter();
                stages[stage_index].retain(|_| *iter.next().expect("keep mask length"));
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    stages.retain(|stage| !stage.is_empty());
    stages
}
