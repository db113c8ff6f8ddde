//! Structural verification of an `IrGraph`.

use std::collections::HashSet;

use crate::ir::{IrGraph, OpId, ValueDef, ValueId};
use crate::{Error, Result};

/// Check the use/def invariants of a graph.
///
/// Verifies that:
/// - every operand slot is registered in its value's use list and every use
///   points back at a live operand slot holding that value
/// - no operation refers to an erased value
/// - every operand is defined before its user (earlier in the defining block,
///   or a block argument of an enclosing block)
/// - terminators only appear last in their block
/// - every live operation is reachable from the function body
pub fn verify(graph: &IrGraph) -> Result<()> {
    let order = graph.walk();
    if order.len() != graph.op_count() {
        return Err(Error::Verification(format!(
            "{} operations are not reachable from the function body",
            graph.op_count() - order.len()
        )));
    }

    for &op_id in &order {
        let op = graph.op(op_id)?;
        let block = graph.op_block(op_id)?;
        if !graph.block_ops(block)?.contains(&op_id) {
            return Err(Error::Verification(format!(
                "{} ({:?}) is not listed in its block {:?}",
                op.kind, op_id, block
            )));
        }
        if op.kind.is_terminator() && graph.terminator(block) != Some(op_id) {
            return Err(Error::Verification(format!(
                "Terminator {} ({:?}) is not last in its block",
                op.kind, op_id
            )));
        }
        for (index, &operand) in op.operands().iter().enumerate() {
            let value = graph.value(operand)?;
            if value.is_erased() {
                return Err(Error::Verification(format!(
                    "{} ({:?}) operand {} refers to erased value {:?}",
                    op.kind, op_id, index, operand
                )));
            }
            if !value.uses().iter().any(|u| u.op == op_id && u.operand == index) {
                return Err(Error::Verification(format!(
                    "{} ({:?}) operand {} is missing from the use list of {:?}",
                    op.kind, op_id, index, operand
                )));
            }
            check_dominance(graph, op_id, operand)?;
        }
    }

    let live: HashSet<OpId> = order.into_iter().collect();
    for index in 0..graph.value_count() {
        let id = ValueId::new(index);
        for u in graph.uses(id) {
            let holds = live.contains(&u.op)
                && graph.op(u.op)?.operand(u.operand) == Some(id);
            if !holds {
                return Err(Error::Verification(format!(
                    "Stale use of {:?} by {:?} operand {}",
                    id, u.op, u.operand
                )));
            }
        }
    }

    Ok(())
}

fn check_dominance(graph: &IrGraph, user: OpId, operand: ValueId) -> Result<()> {
    let user_block = graph.op_block(user)?;
    let dominated = match graph.value(operand)?.def() {
        ValueDef::BlockArgument { block, .. } => graph.is_block_within(user_block, block),
        ValueDef::OpResult { op: def, .. } => {
            let def_block = graph.op_block(def)?;
            match graph.ancestor_in_block(user, def_block) {
                Some(ancestor) => graph.is_before_in_block(def, ancestor),
                None => false,
            }
        }
    };
    if dominated {
        Ok(())
    } else {
        Err(Error::Verification(format!(
            "{} ({:?}) uses {:?} before its definition",
            graph.op(user)?.kind,
            user,
            operand
        )))
    }
}
