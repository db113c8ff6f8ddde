//! Buffer lifetimes around `async.execute` regions.
//!
//! A region allocating the buffer it yields leaves nobody responsible for
//! freeing it, and buffers the region reads must outlive the region. The
//! pattern hoists the yielded allocation in front of the launch, frees it
//! after its last consumer, and frees the region's inputs once both the
//! region has joined and their own last use has run.

use stickle_core::{InsertPoint, IrGraph, OpBuilder, OpId, OpKind, Result, ValueId};

use crate::pattern::{RewriteCtx, RewritePattern, RewriteResult, no_match};
use crate::query::defining_op_of_kind;

/// Insert the deallocations an `async.execute` with a single yielded
/// buffer needs.
pub struct AsyncRegionDealloc;

impl RewritePattern for AsyncRegionDealloc {
    fn name(&self) -> &str {
        "async_region_dealloc"
    }

    fn root(&self) -> OpKind {
        OpKind::Execute
    }

    fn match_and_rewrite(
        &self,
        graph: &mut IrGraph,
        op: OpId,
        _ctx: &mut RewriteCtx,
    ) -> Result<RewriteResult> {
        let region = match match_region(graph, op) {
            Ok(region) => region,
            Err(reason) => return no_match(self.name(), op, reason),
        };

        graph.move_before(region.result_alloc, op)?;
        let result_dealloc = OpBuilder::new(graph, InsertPoint::After(region.result_release))
            .dealloc(region.result)?;
        tracing::debug!(execute = ?op, buffer = ?region.result, "hoisted region result");

        for (input, last_use) in region.inputs {
            let after = match last_use {
                Some(last) if graph.is_before_in_block(result_dealloc, last) => last,
                _ => result_dealloc,
            };
            OpBuilder::new(graph, InsertPoint::After(after)).dealloc(input)?;
            tracing::debug!(execute = ?op, buffer = ?input, "freed region input");
        }
        Ok(RewriteResult::Applied)
    }
}

type Matched<T> = std::result::Result<T, &'static str>;

struct AsyncRegion {
    /// Allocation of the yielded buffer, inside the region.
    result_alloc: OpId,
    result: ValueId,
    /// Op in the launch block after which the result can be freed.
    result_release: OpId,
    /// Inputs to free, with their last use in the launch block.
    inputs: Vec<(ValueId, Option<OpId>)>,
}

fn match_region(graph: &IrGraph, execute: OpId) -> Matched<AsyncRegion> {
    let launch_block = graph.op_block(execute).map_err(|_| "detached execute")?;
    let execute_op = graph.op(execute).map_err(|_| "unknown execute")?;
    let [_token, async_value] = execute_op.results() else {
        return Err("region does not produce exactly one value");
    };
    let [region] = execute_op.regions() else {
        return Err("execute without a single region");
    };
    let [body] = graph.region(*region).map_err(|_| "unknown region")?.blocks() else {
        return Err("region body has more than one block");
    };
    let terminator = graph.terminator(*body).ok_or("region without terminator")?;
    if graph.kind(terminator) != Some(&OpKind::Yield) {
        return Err("region does not end in async.yield");
    }
    let [yielded] = graph.op(terminator).map_err(|_| "unknown yield")?.operands() else {
        return Err("region does not yield exactly one value");
    };

    let result_alloc = defining_op_of_kind(graph, *yielded, &OpKind::Alloc)
        .ok_or("yielded value is not allocated")?;
    if graph.op_block(result_alloc).ok() != Some(*body) {
        return Err("yielded buffer is not allocated at the top level of the region");
    }
    let sizes = graph.op(result_alloc).map_err(|_| "unknown allocation")?.operands();
    if sizes.iter().any(|&v| defined_inside(graph, v, execute)) {
        return Err("yielded buffer size is computed inside the region");
    }
    if graph
        .users(*yielded)
        .iter()
        .any(|&u| graph.kind(u) == Some(&OpKind::Dealloc))
    {
        return Err("yielded buffer is already freed");
    }

    let awaits = graph.users(*async_value);
    let [await_op] = awaits[..] else {
        return Err("result is not awaited exactly once");
    };
    if graph.kind(await_op) != Some(&OpKind::Await) {
        return Err("result is consumed by something other than async.await");
    }
    let awaited = graph
        .op(await_op)
        .ok()
        .and_then(|op| op.result(0))
        .ok_or("await without result")?;
    let is_terminator = |op: OpId| graph.kind(op).is_some_and(OpKind::is_terminator);
    let mut result_release = graph
        .ancestor_in_block(await_op, launch_block)
        .ok_or("await is not nested in the launch block")?;
    for consumer in graph.users(awaited) {
        if graph.kind(consumer) == Some(&OpKind::Dealloc) {
            return Err("awaited buffer is already freed");
        }
        let anchor = graph
            .ancestor_in_block(consumer, launch_block)
            .ok_or("consumer is not nested in the launch block")?;
        if is_terminator(anchor) {
            return Err("awaited buffer escapes the launch block");
        }
        if graph.is_before_in_block(result_release, anchor) {
            result_release = anchor;
        }
    }

    let mut inputs: Vec<(ValueId, Option<OpId>)> = Vec::new();
    for op in graph.walk_nested(execute) {
        let operands = graph.op(op).map_err(|_| "unknown op")?.operands();
        for &operand in operands {
            if inputs.iter().any(|(v, _)| *v == operand)
                || defining_op_of_kind(graph, operand, &OpKind::Alloc).is_none()
                || defined_inside(graph, operand, execute)
            {
                continue;
            }
            let users = graph.users(operand);
            if users.iter().any(|&u| graph.kind(u) == Some(&OpKind::Dealloc)) {
                continue;
            }
            let mut last_use: Option<OpId> = None;
            let mut escapes = false;
            for user in users {
                match graph.ancestor_in_block(user, launch_block) {
                    Some(anchor) if anchor == execute => {}
                    Some(anchor) if is_terminator(anchor) => escapes = true,
                    Some(anchor) => {
                        if last_use.is_none_or(|last| graph.is_before_in_block(last, anchor)) {
                            last_use = Some(anchor);
                        }
                    }
                    None => escapes = true,
                }
            }
            if escapes {
                tracing::trace!(
                    execute = ?execute,
                    input = ?operand,
                    "input escapes the launch block"
                );
                continue;
            }
            inputs.push((operand, last_use));
        }
    }

    Ok(AsyncRegion {
        result_alloc,
        result: *yielded,
        result_release,
        inputs,
    })
}

/// Check if `value` is defined by an op or block nested inside `op`.
fn defined_inside(graph: &IrGraph, value: ValueId, op: OpId) -> bool {
    match graph.defining_op(value) {
        Some(def) => graph.is_proper_ancestor(op, def),
        None => graph
            .block_argument(value)
            .and_then(|(block, _)| graph.block_parent_op(block))
            .is_some_and(|parent| parent == op || graph.is_proper_ancestor(op, parent)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stickle_core::{AffineMap, DataType, Type};

    struct Launch {
        graph: IrGraph,
        execute: OpId,
        input: ValueId,
        reader: OpId,
    }

    /// `%in` is copied by a region into a yielded buffer, which is then read
    /// after the await.
    fn launch() -> Launch {
        launch_returning(false, false)
    }

    /// `launch`, with the function also returning the input and/or the
    /// awaited buffer.
    fn launch_returning(return_input: bool, return_awaited: bool) -> Launch {
        let mut graph = IrGraph::new();
        let ty = Type::memref(DataType::F32, &[4]);
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let input = b.alloc(ty.clone(), vec![]).unwrap();
        let (execute, values, body) = b.execute(vec![ty.clone()]).unwrap();
        let awaited = b.await_value(values[0]).unwrap();
        let (reader, i, read_body) = b.affine_for(0, 4, 1).unwrap();
        let returned = [(return_input, input), (return_awaited, awaited)]
            .into_iter()
            .filter_map(|(keep, v)| keep.then_some(v))
            .collect();
        b.func_return(returned).unwrap();

        let mut b = OpBuilder::new(&mut graph, InsertPoint::BlockEnd(body));
        let out = b.alloc(ty, vec![]).unwrap();
        let (_, j, copy_body) = b.affine_for(0, 4, 1).unwrap();
        b.async_yield(vec![out]).unwrap();
        let mut b = OpBuilder::before_terminator(&mut graph, copy_body);
        let v = b.affine_load(input, vec![j], AffineMap::identity(1)).unwrap();
        b.affine_store(v, out, vec![j], AffineMap::identity(1)).unwrap();

        let mut b = OpBuilder::before_terminator(&mut graph, read_body);
        b.affine_load(awaited, vec![i], AffineMap::identity(1)).unwrap();

        Launch {
            graph,
            execute,
            input,
            reader,
        }
    }

    #[test]
    fn test_deallocs_are_inserted() {
        let Launch {
            mut graph,
            execute,
            input,
            reader,
        } = launch();

        let result = AsyncRegionDealloc
            .match_and_rewrite(&mut graph, execute, &mut RewriteCtx::new())
            .unwrap();
        assert_eq!(result, RewriteResult::Applied);

        let entry = graph.block_ops(graph.entry_block()).unwrap().to_vec();
        let kinds: Vec<&OpKind> = entry.iter().filter_map(|&o| graph.kind(o)).collect();
        assert_eq!(
            kinds,
            vec![
                &OpKind::Alloc,
                &OpKind::Alloc,
                &OpKind::Execute,
                &OpKind::Await,
                &OpKind::AffineFor,
                &OpKind::Dealloc,
                &OpKind::Dealloc,
                &OpKind::Return,
            ]
        );
        let at = entry.iter().position(|&o| o == reader).unwrap();
        assert_eq!(graph.op(entry[at + 2]).unwrap().operand(0), Some(input));
        stickle_core::verify(&graph).unwrap();
    }

    #[test]
    fn test_rewrite_is_not_repeated() {
        let Launch {
            mut graph, execute, ..
        } = launch();
        let mut ctx = RewriteCtx::new();
        AsyncRegionDealloc
            .match_and_rewrite(&mut graph, execute, &mut ctx)
            .unwrap();
        let again = AsyncRegionDealloc
            .match_and_rewrite(&mut graph, execute, &mut ctx)
            .unwrap();
        assert_eq!(again, RewriteResult::NoMatch);
    }

    #[test]
    fn test_freed_input_is_left_alone() {
        let Launch {
            mut graph,
            execute,
            input,
            ..
        } = launch();
        let ret = graph.terminator(graph.entry_block()).unwrap();
        OpBuilder::new(&mut graph, InsertPoint::Before(ret))
            .dealloc(input)
            .unwrap();

        AsyncRegionDealloc
            .match_and_rewrite(&mut graph, execute, &mut RewriteCtx::new())
            .unwrap();
        assert_eq!(frees_of(&graph, input), 1);
    }

    #[test]
    fn test_two_awaits_decline() {
        let Launch {
            mut graph, execute, ..
        } = launch();
        let value = graph.op(execute).unwrap().results()[1];
        let ret = graph.terminator(graph.entry_block()).unwrap();
        OpBuilder::new(&mut graph, InsertPoint::Before(ret))
            .await_value(value)
            .unwrap();

        let result = AsyncRegionDealloc
            .match_and_rewrite(&mut graph, execute, &mut RewriteCtx::new())
            .unwrap();
        assert_eq!(result, RewriteResult::NoMatch);
    }

    fn frees_of(graph: &IrGraph, buffer: ValueId) -> usize {
        graph
            .users(buffer)
            .into_iter()
            .filter(|&u| graph.kind(u) == Some(&OpKind::Dealloc))
            .count()
    }

    #[test]
    fn test_returned_result_declines() {
        let Launch {
            mut graph, execute, ..
        } = launch_returning(false, true);
        let before = stickle_core::print::to_text(&graph);

        let result = AsyncRegionDealloc
            .match_and_rewrite(&mut graph, execute, &mut RewriteCtx::new())
            .unwrap();
        assert_eq!(result, RewriteResult::NoMatch);
        assert_eq!(stickle_core::print::to_text(&graph), before);
    }

    #[test]
    fn test_returned_input_is_not_freed() {
        let Launch {
            mut graph,
            execute,
            input,
            ..
        } = launch_returning(true, false);

        let result = AsyncRegionDealloc
            .match_and_rewrite(&mut graph, execute, &mut RewriteCtx::new())
            .unwrap();
        assert_eq!(result, RewriteResult::Applied);
        assert_eq!(frees_of(&graph, input), 0);

        let entry = graph.block_ops(graph.entry_block()).unwrap().to_vec();
        let last = *entry.last().unwrap();
        assert_eq!(graph.kind(last), Some(&OpKind::Return));
        assert_eq!(
            entry.iter().filter(|&&o| graph.kind(o) == Some(&OpKind::Dealloc)).count(),
            1
        );
        stickle_core::verify(&graph).unwrap();
    }
}
