//! Folding of the `zlow.dummy` element-type adapter.

use stickle_core::{IrGraph, OpId, OpKind, Result};

use crate::pattern::{RewriteCtx, RewritePattern, RewriteResult};
use crate::query::defining_op_of_kind;

/// Fold `dummy(x): T` to `x` when `x` already has type `T`, and
/// `dummy(dummy(x))` to `x` when the outer result has the type of `x`.
pub struct ConvertFold;

impl RewritePattern for ConvertFold {
    fn name(&self) -> &str {
        "convert_fold"
    }

    fn root(&self) -> OpKind {
        OpKind::Convert
    }

    fn match_and_rewrite(
        &self,
        graph: &mut IrGraph,
        op: OpId,
        _ctx: &mut RewriteCtx,
    ) -> Result<RewriteResult> {
        let convert = graph.op(op)?;
        let (Some(input), Some(output)) = (convert.operand(0), convert.result(0)) else {
            return Ok(RewriteResult::NoMatch);
        };
        let output_type = graph.value_type(output)?;

        let replacement = if graph.value_type(input)? == output_type {
            input
        } else {
            let Some(inner) = defining_op_of_kind(graph, input, &OpKind::Convert) else {
                return Ok(RewriteResult::NoMatch);
            };
            match graph.op(inner)?.operand(0) {
                Some(original) if graph.value_type(original)? == output_type => original,
                _ => return Ok(RewriteResult::NoMatch),
            }
        };

        graph.replace_all_uses_with(output, replacement)?;
        graph.erase_op(op)?;
        Ok(RewriteResult::Applied)
    }
}
