//! Tightening of `onnx.Loop` maximum trip counts.
//!
//! Loops converted from `for (i = lb; i < ub; i += step)` carry a huge
//! constant trip count and exit through the body condition:
//!
//! ```text
//! onnx.Loop(M, true, ..., ub, ..., lb, ...)
//!   ^bb(iter, cond, ..., %ub, ..., %i, ...):
//!     %next = onnx.Add(%i, %step)
//!     %cond = onnx.Less(%next, %ub)
//!     onnx.Return(%cond, ..., %ub, ..., %next, ...)
//! ```
//!
//! The pattern derives `ceil((ub - lb) / step)`, makes it the trip count and
//! passes the incoming condition through unchanged.

use std::collections::HashMap;

use stickle_core::{
    DataType, InsertPoint, IrGraph, OpBuilder, OpId, OpKind, Result, TensorValue, ValueId,
};

use crate::pattern::{RewriteCtx, RewritePattern, RewriteResult, no_match};
use crate::query::{defining_op_of_kind, has_integer_element_type, integer_constant_value};

/// Replace the maximum trip count of a counted `onnx.Loop` by the number of
/// iterations its exit condition allows.
pub struct LoopTripCountNarrowing;

impl RewritePattern for LoopTripCountNarrowing {
    fn name(&self) -> &str {
        "loop_trip_count_narrowing"
    }

    fn root(&self) -> OpKind {
        OpKind::Loop
    }

    fn match_and_rewrite(
        &self,
        graph: &mut IrGraph,
        op: OpId,
        _ctx: &mut RewriteCtx,
    ) -> Result<RewriteResult> {
        let counted = match match_counted_loop(graph, op) {
            Ok(counted) => counted,
            Err(reason) => return no_match(self.name(), op, reason),
        };
        let trip_count = match static_trip_count(graph, &counted) {
            Some(Ok(derived)) => {
                tracing::debug!(
                    loop_op = ?op,
                    old = counted.max_trip_count,
                    new = derived,
                    "static trip count"
                );
                let dtype = element_type(graph, counted.max_value)?;
                OpBuilder::new(graph, InsertPoint::Before(op))
                    .constant(TensorValue::scalar_int(derived, dtype)?)?
            }
            Some(Err(reason)) => return no_match(self.name(), op, reason),
            None => emit_dynamic_trip_count(graph, &counted)?,
        };

        graph.set_operand(op, 0, trip_count)?;
        let cond_arg = graph.block_args(counted.body)?[1];
        graph.set_operand(counted.terminator, 0, cond_arg)?;
        Ok(RewriteResult::Applied)
    }
}

type Matched<T> = std::result::Result<T, &'static str>;

/// Where a loop-invariant bound comes from.
#[derive(Debug, Clone, Copy)]
enum Bound {
    /// An integer `onnx.Constant`, possibly defined inside the body.
    Constant(ValueId),
    /// An invariant block argument, resolved to the loop operand feeding it.
    Operand(ValueId),
}

struct CountedLoop {
    op: OpId,
    body: stickle_core::BlockId,
    terminator: OpId,
    max_value: ValueId,
    max_trip_count: i64,
    lower: ValueId,
    upper: Bound,
    step: Bound,
}

fn match_counted_loop(graph: &IrGraph, op: OpId) -> Matched<CountedLoop> {
    let loop_op = graph.op(op).map_err(|_| "unknown loop")?;
    let max_value = loop_op.operand(0).ok_or("loop without trip count")?;
    let max_trip_count =
        integer_constant_value(graph, max_value).ok_or("trip count is not an integer constant")?;

    let [region] = loop_op.regions() else {
        return Err("loop without a single body region");
    };
    let [body] = graph.region(*region).map_err(|_| "unknown region")?.blocks() else {
        return Err("loop body has more than one block");
    };
    let body = *body;
    let terminator = graph.terminator(body).ok_or("loop body without terminator")?;
    if graph.kind(terminator) != Some(&OpKind::OnnxReturn) {
        return Err("loop body does not end in onnx.Return");
    }
    let returned = graph.op(terminator).map_err(|_| "unknown terminator")?.operands();

    // Argument k >= 1 is carried to terminator operand k - 1.
    let carried = |value: ValueId| -> Option<(usize, ValueId)> {
        let (block, index) = graph.block_argument(value)?;
        if block != body || index == 0 {
            return None;
        }
        Some((index, *returned.get(index - 1)?))
    };
    let fed = |index: usize| loop_op.operand(index);
    let bound = |value: ValueId| -> Option<Bound> {
        if graph.is_block_argument(value) {
            let (index, next) = carried(value)?;
            if next != value {
                return None;
            }
            fed(index).map(Bound::Operand)
        } else {
            integer_constant_value(graph, value).map(|_| Bound::Constant(value))
        }
    };

    let cond = *returned.first().ok_or("onnx.Return without condition")?;
    let less =
        defining_op_of_kind(graph, cond, &OpKind::Less).ok_or("exit condition is not onnx.Less")?;
    let (next, upper) = two_operands(graph, less).ok_or("malformed onnx.Less")?;
    if !has_integer_element_type(graph, next) || !has_integer_element_type(graph, upper) {
        return Err("exit condition compares non-integers");
    }

    let add = defining_op_of_kind(graph, next, &OpKind::Add).ok_or("counter is not onnx.Add")?;
    let (counter, step) = two_operands(graph, add).ok_or("malformed onnx.Add")?;
    let (counter_index, counter_next) =
        carried(counter).ok_or("counter is not a carried argument")?;
    if counter_index < 2 || counter_next != next {
        return Err("counter is not updated by the increment");
    }
    let lower = fed(counter_index).ok_or("counter has no initial value")?;
    let step = bound(step).ok_or("step is neither a constant nor loop invariant")?;
    let upper = bound(upper).ok_or("upper bound is neither a constant nor loop invariant")?;

    Ok(CountedLoop {
        op,
        body,
        terminator,
        max_value,
        max_trip_count,
        lower,
        upper,
        step,
    })
}

fn two_operands(graph: &IrGraph, op: OpId) -> Option<(ValueId, ValueId)> {
    let op = graph.op(op).ok()?;
    Some((op.operand(0)?, op.operand(1)?))
}

fn bound_value(bound: Bound) -> ValueId {
    match bound {
        Bound::Constant(v) | Bound::Operand(v) => v,
    }
}

/// The derived trip count when the bounds are all constants: `None` if some
/// bound is dynamic, `Some(Err)` if the constants do not allow narrowing.
fn static_trip_count(graph: &IrGraph, counted: &CountedLoop) -> Option<Matched<i64>> {
    let lower = integer_constant_value(graph, counted.lower)?;
    let upper = integer_constant_value(graph, bound_value(counted.upper))?;
    let step = integer_constant_value(graph, bound_value(counted.step))?;

    if step <= 0 || upper <= lower {
        return Some(Err("empty or non-increasing range"));
    }
    let Some(range) = upper.checked_sub(lower) else {
        return Some(Err("range overflows"));
    };
    let derived = (range as f64 / step as f64).ceil() as i64;
    if derived >= counted.max_trip_count {
        return Some(Err("derived trip count is not smaller"));
    }
    Some(Ok(derived))
}

/// Emit `min(M, ceil(f32(ub - lb) / f32(step)))` right before the loop.
fn emit_dynamic_trip_count(graph: &mut IrGraph, counted: &CountedLoop) -> Result<ValueId> {
    let dtype = element_type(graph, counted.max_value)?;
    let upper = materialize(graph, counted, counted.upper)?;
    let step = materialize(graph, counted, counted.step)?;

    let mut b = OpBuilder::new(graph, InsertPoint::Before(counted.op));
    let upper = b.cast(upper, dtype)?;
    let lower = b.cast(counted.lower, dtype)?;
    let range = b.sub(upper, lower)?;
    let range = b.cast(range, DataType::F32)?;
    let step = b.cast(step, DataType::F32)?;
    let quotient = b.div(range, step)?;
    let derived = b.ceil(quotient)?;
    let derived = b.cast(derived, dtype)?;
    let narrowed = b.min(counted.max_value, derived)?;
    tracing::debug!(loop_op = ?counted.op, "dynamic trip count");
    Ok(narrowed)
}

/// A value usable right before the loop for `bound`.
fn materialize(graph: &mut IrGraph, counted: &CountedLoop, bound: Bound) -> Result<ValueId> {
    match bound {
        Bound::Operand(value) => Ok(value),
        Bound::Constant(value) => {
            let Some(def) = graph.defining_op(value) else {
                return Ok(value);
            };
            if !graph.is_proper_ancestor(counted.op, def) {
                return Ok(value);
            }
            let cloned = graph.clone_op(def, InsertPoint::Before(counted.op), &HashMap::new())?;
            graph.op(cloned)?.result(0).ok_or_else(|| {
                stickle_core::Error::InvalidGraph(format!("Constant {:?} without result", def))
            })
        }
    }
}

fn element_type(graph: &IrGraph, value: ValueId) -> Result<DataType> {
    let ty = graph.value_type(value)?;
    ty.element_type().ok_or_else(|| {
        stickle_core::Error::InvalidGraph(format!("Trip count of type {} has no element type", ty))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stickle_core::{TensorData, Type};

    struct CountedLoopGraph {
        graph: IrGraph,
        loop_op: OpId,
        body: stickle_core::BlockId,
    }

    fn true_constant(b: &mut OpBuilder<'_>) -> ValueId {
        b.constant(TensorValue::new(TensorData::Bool(vec![true]), vec![], DataType::Bool))
            .unwrap()
    }

    /// `for (i = lb; i < ub; i += step)` with the step defined in the body.
    fn counted_loop(lb: i64, ub: i64, step: i64, max: i64) -> CountedLoopGraph {
        let mut graph = IrGraph::new();
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let max = b.constant_int(max, DataType::I64).unwrap();
        let cond = true_constant(&mut b);
        let ub = b.constant_int(ub, DataType::I64).unwrap();
        let lb = b.constant_int(lb, DataType::I64).unwrap();
        let i64_scalar = Type::scalar_tensor(DataType::I64);
        let (loop_op, body) = b
            .onnx_loop(max, cond, vec![ub, lb], vec![i64_scalar.clone(), i64_scalar])
            .unwrap();
        let out = b.graph().op(loop_op).unwrap().results()[1];
        b.func_return(vec![out]).unwrap();

        let args = graph.block_args(body).unwrap().to_vec();
        let mut b = OpBuilder::new(&mut graph, InsertPoint::BlockEnd(body));
        let step = b.constant_int(step, DataType::I64).unwrap();
        let next = b.add(args[3], step).unwrap();
        let keep_going = b.less(next, args[2]).unwrap();
        b.onnx_return(vec![keep_going, args[2], next]).unwrap();

        CountedLoopGraph {
            graph,
            loop_op,
            body,
        }
    }

    fn trip_count(graph: &IrGraph, loop_op: OpId) -> Option<i64> {
        let max = graph.op(loop_op).unwrap().operand(0).unwrap();
        integer_constant_value(graph, max)
    }

    #[test]
    fn test_static_trip_count() {
        let CountedLoopGraph {
            mut graph,
            loop_op,
            body,
        } = counted_loop(-100, 100, 1, i64::MAX);

        let result = LoopTripCountNarrowing
            .match_and_rewrite(&mut graph, loop_op, &mut RewriteCtx::new())
            .unwrap();
        assert_eq!(result, RewriteResult::Applied);
        assert_eq!(trip_count(&graph, loop_op), Some(200));

        let terminator = graph.terminator(body).unwrap();
        let cond_arg = graph.block_args(body).unwrap()[1];
        assert_eq!(graph.op(terminator).unwrap().operand(0), Some(cond_arg));
    }

    #[test]
    fn test_ceiling_division() {
        let CountedLoopGraph {
            mut graph, loop_op, ..
        } = counted_loop(0, 10, 3, i64::MAX);
        LoopTripCountNarrowing
            .match_and_rewrite(&mut graph, loop_op, &mut RewriteCtx::new())
            .unwrap();
        assert_eq!(trip_count(&graph, loop_op), Some(4));
    }

    #[test]
    fn test_no_tightening_declines() {
        let CountedLoopGraph {
            mut graph, loop_op, ..
        } = counted_loop(0, 10, 1, 5);
        let result = LoopTripCountNarrowing
            .match_and_rewrite(&mut graph, loop_op, &mut RewriteCtx::new())
            .unwrap();
        assert_eq!(result, RewriteResult::NoMatch);
        assert_eq!(trip_count(&graph, loop_op), Some(5));
    }

    #[test]
    fn test_bad_ranges_decline() {
        for (lb, ub, step) in [(10, 0, 1), (0, 10, 0), (0, 10, -2), (5, 5, 1)] {
            let CountedLoopGraph {
                mut graph, loop_op, ..
            } = counted_loop(lb, ub, step, i64::MAX);
            let result = LoopTripCountNarrowing
                .match_and_rewrite(&mut graph, loop_op, &mut RewriteCtx::new())
                .unwrap();
            assert_eq!(result, RewriteResult::NoMatch, "({}, {}, {})", lb, ub, step);
        }
    }

    #[test]
    fn test_second_application_declines() {
        let CountedLoopGraph {
            mut graph, loop_op, ..
        } = counted_loop(0, 10, 3, i64::MAX);
        let mut ctx = RewriteCtx::new();
        LoopTripCountNarrowing
            .match_and_rewrite(&mut graph, loop_op, &mut ctx)
            .unwrap();
        let again = LoopTripCountNarrowing
            .match_and_rewrite(&mut graph, loop_op, &mut ctx)
            .unwrap();
        assert_eq!(again, RewriteResult::NoMatch);
    }

    #[test]
    fn test_dynamic_upper_bound_emits_min() {
        let mut graph = IrGraph::new();
        let n = graph.add_argument(Type::scalar_tensor(DataType::I32));
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let max = b.constant_int(i64::MAX, DataType::I64).unwrap();
        let cond = true_constant(&mut b);
        let lb = b.constant_int(0, DataType::I32).unwrap();
        let i32_scalar = Type::scalar_tensor(DataType::I32);
        let (loop_op, body) = b
            .onnx_loop(max, cond, vec![n, lb], vec![i32_scalar.clone(), i32_scalar])
            .unwrap();
        b.func_return(vec![]).unwrap();

        let args = graph.block_args(body).unwrap().to_vec();
        let mut b = OpBuilder::new(&mut graph, InsertPoint::BlockEnd(body));
        let step = b.constant_int(2, DataType::I32).unwrap();
        let next = b.add(args[3], step).unwrap();
        let keep_going = b.less(next, args[2]).unwrap();
        b.onnx_return(vec![keep_going, args[2], next]).unwrap();

        let result = LoopTripCountNarrowing
            .match_and_rewrite(&mut graph, loop_op, &mut RewriteCtx::new())
            .unwrap();
        assert_eq!(result, RewriteResult::Applied);

        let new_max = graph.op(loop_op).unwrap().operand(0).unwrap();
        let min = graph.defining_op(new_max).unwrap();
        assert_eq!(graph.kind(min), Some(&OpKind::Min));
        assert_eq!(graph.op(min).unwrap().operand(0), Some(max));
        // The in-body step constant was cloned in front of the loop.
        let entry = graph.block_ops(graph.entry_block()).unwrap();
        let kinds: Vec<&OpKind> = entry.iter().filter_map(|&o| graph.kind(o)).collect();
        assert!(kinds.contains(&&OpKind::Ceil));
        assert_eq!(kinds.iter().filter(|k| ***k == OpKind::Constant).count(), 4);
        stickle_core::verify(&graph).unwrap();
    }

    #[test]
    fn test_variant_upper_bound_declines() {
        let mut graph = IrGraph::new();
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let max = b.constant_int(100, DataType::I64).unwrap();
        let cond = true_constant(&mut b);
        let ub = b.constant_int(10, DataType::I64).unwrap();
        let lb = b.constant_int(0, DataType::I64).unwrap();
        let i64_scalar = Type::scalar_tensor(DataType::I64);
        let (loop_op, body) = b
            .onnx_loop(max, cond, vec![ub, lb], vec![i64_scalar.clone(), i64_scalar])
            .unwrap();
        b.func_return(vec![]).unwrap();

        let args = graph.block_args(body).unwrap().to_vec();
        let mut b = OpBuilder::new(&mut graph, InsertPoint::BlockEnd(body));
        let one = b.constant_int(1, DataType::I64).unwrap();
        let next = b.add(args[3], one).unwrap();
        let shrinking = b.sub(args[2], one).unwrap();
        let keep_going = b.less(next, args[2]).unwrap();
        b.onnx_return(vec![keep_going, shrinking, next]).unwrap();

        let result = LoopTripCountNarrowing
            .match_and_rewrite(&mut graph, loop_op, &mut RewriteCtx::new())
            .unwrap();
        assert_eq!(result, RewriteResult::NoMatch);
    }
}
