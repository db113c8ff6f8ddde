//! Local stick/unstick cleanups.
//!
//! These patterns look at one conversion and its immediate neighbours:
//! conversions whose destination is never read, and decode/encode pairs that
//! undo each other (directly or through a view).

use stickle_core::{IrGraph, OpId, OpKind, Result, StickLayout, ValueId};

use crate::pattern::{RewriteCtx, RewritePattern, RewriteResult, no_match};
use crate::query::{self, conversion_operands, layout_of};

/// Erase a stick or unstick whose destination buffer has no other use.
///
/// A destination passed in as a function argument is observable by the
/// caller and is never treated as dead.
pub struct DeadConversionRemoval {
    kind: OpKind,
}

impl DeadConversionRemoval {
    pub fn stick() -> Self {
        Self {
            kind: OpKind::Stick,
        }
    }

    pub fn unstick() -> Self {
        Self {
            kind: OpKind::Unstick,
        }
    }
}

impl RewritePattern for DeadConversionRemoval {
    fn name(&self) -> &str {
        match self.kind {
            OpKind::Stick => "stick_removal",
            _ => "unstick_removal",
        }
    }

    fn root(&self) -> OpKind {
        self.kind.clone()
    }

    fn match_and_rewrite(
        &self,
        graph: &mut IrGraph,
        op: OpId,
        _ctx: &mut RewriteCtx,
    ) -> Result<RewriteResult> {
        let Some((_, out)) = conversion_operands(graph, op) else {
            return Ok(RewriteResult::NoMatch);
        };
        if !graph.has_one_use(out) {
            return Ok(RewriteResult::NoMatch);
        }
        if is_function_argument(graph, out) {
            return no_match(self.name(), op, "destination is a function argument");
        }
        graph.erase_op(op)?;
        Ok(RewriteResult::Applied)
    }
}

fn is_function_argument(graph: &IrGraph, value: ValueId) -> bool {
    graph
        .block_argument(value)
        .is_some_and(|(block, _)| block == graph.entry_block())
}

/// The first unstick that decodes into `buffer` and runs before `anchor`.
fn decode_into_before(graph: &IrGraph, buffer: ValueId, anchor: OpId) -> Option<OpId> {
    graph.users(buffer).into_iter().find(|&user| {
        conversion_operands(graph, user)
            .is_some_and(|(_, out)| out == buffer && graph.kind(user) == Some(&OpKind::Unstick))
            && graph.is_before_in_block(user, anchor)
    })
}

/// Cancel `unstick(S1, A); stick(A, S2)` when both use the same layout.
///
/// Every other reader of `S2` is redirected to `S1` and the stick is erased;
/// the unstick is left for the dead-conversion patterns.
pub struct UnstickStickRemoval;

impl RewritePattern for UnstickStickRemoval {
    fn name(&self) -> &str {
        "unstick_stick_removal"
    }

    fn root(&self) -> OpKind {
        OpKind::Stick
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn match_and_rewrite(
        &self,
        graph: &mut IrGraph,
        op: OpId,
        _ctx: &mut RewriteCtx,
    ) -> Result<RewriteResult> {
        let Some((x, out)) = conversion_operands(graph, op) else {
            return Ok(RewriteResult::NoMatch);
        };
        if graph.is_block_argument(x) {
            return no_match(self.name(), op, "input is a block argument");
        }
        let Some(unstick) = decode_into_before(graph, x, op) else {
            return Ok(RewriteResult::NoMatch);
        };
        let (Some(stick_layout), Some(unstick_layout)) =
            (layout_of(graph, op), layout_of(graph, unstick))
        else {
            return no_match(self.name(), op, "missing layout tag");
        };
        if stick_layout != unstick_layout {
            return no_match(
                self.name(),
                op,
                format!("layouts differ: {} vs {}", unstick_layout, stick_layout),
            );
        }
        let Some((source, _)) = conversion_operands(graph, unstick) else {
            return Ok(RewriteResult::NoMatch);
        };

        graph.replace_all_uses_except(out, source, op)?;
        graph.erase_op(op)?;
        Ok(RewriteResult::Applied)
    }
}

/// Cancel `unstick(S1, A); V = view(A); stick(V, S2)` when `S2` and `S1`
/// have the same static shape. The view is erased once unused.
///
/// NCHW conversions transpose internally and are left alone.
pub struct StickViewUnstickRemoval;

impl RewritePattern for StickViewUnstickRemoval {
    fn name(&self) -> &str {
        "stick_view_unstick_removal"
    }

    fn root(&self) -> OpKind {
        OpKind::Stick
    }

    fn benefit(&self) -> u16 {
        2
    }

    fn match_and_rewrite(
        &self,
        graph: &mut IrGraph,
        op: OpId,
        _ctx: &mut RewriteCtx,
    ) -> Result<RewriteResult> {
        let Some((x, out)) = conversion_operands(graph, op) else {
            return Ok(RewriteResult::NoMatch);
        };
        if layout_of(graph, op) == Some(StickLayout::Nchw) {
            return no_match(self.name(), op, "NCHW stick");
        }
        if graph.is_block_argument(x) {
            return no_match(self.name(), op, "input is a block argument");
        }
        if query::has_non_identity_layout(graph, x) {
            return no_match(self.name(), op, "input is not normalized");
        }
        let Some((source, view)) = query::view_source(graph, x) else {
            return Ok(RewriteResult::NoMatch);
        };

        let unstick = graph.users(source).into_iter().find(|&user| {
            graph.kind(user) == Some(&OpKind::Unstick)
                && layout_of(graph, user) != Some(StickLayout::Nchw)
                && conversion_operands(graph, user).is_some_and(|(_, o)| o == source)
                && graph.is_before_in_block(user, view)
        });
        let Some(unstick) = unstick else {
            return no_match(self.name(), op, "view source is not decoded before the view");
        };
        let Some((unstick_input, _)) = conversion_operands(graph, unstick) else {
            return Ok(RewriteResult::NoMatch);
        };

        let out_shape = graph.value_type(out)?.shape();
        let input_shape = graph.value_type(unstick_input)?.shape();
        match (out_shape.and_then(|s| s.as_static()), input_shape.and_then(|s| s.as_static())) {
            (Some(a), Some(b)) if a == b => {}
            _ => return no_match(self.name(), op, "shape mismatch"),
        }

        graph.replace_all_uses_except(out, unstick_input, op)?;
        graph.erase_op(op)?;
        let view_result = graph.op(view)?.result(0);
        if view_result.is_some_and(|v| graph.use_empty(v)) {
            graph.erase_op(view)?;
        }
        Ok(RewriteResult::Applied)
    }
}
