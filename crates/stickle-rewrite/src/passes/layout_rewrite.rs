//! Layout-conversion cleanup pass.
//!
//! Runs the stick/unstick patterns and placeholder folding to a fixpoint,
//! then erases the encodes the chain eliminator left behind.

use stickle_core::{Error, IrGraph, OpKind, Pass, Result, Stage};

use crate::pattern::{PatternSet, RewriteCtx, apply_patterns_greedily};
use crate::patterns::{
    ConvertFold, DeadConversionRemoval, StickViewUnstickRemoval, UnstickLoadStoreStickRemoval,
    UnstickStickRemoval,
};
use crate::query::conversion_operands;

use super::sweep_dead_ops;

/// Pass that removes redundant conversions between accelerator and default
/// buffer layouts.
pub struct LayoutRewritePass {
    patterns: PatternSet,
    max_iterations: usize,
}

impl LayoutRewritePass {
    /// Create the pass with its built-in pattern set.
    pub fn new(max_iterations: usize) -> Self {
        let mut patterns = PatternSet::new();
        patterns
            .add(DeadConversionRemoval::stick())
            .add(DeadConversionRemoval::unstick())
            .add(UnstickStickRemoval)
            .add(StickViewUnstickRemoval)
            .add(UnstickLoadStoreStickRemoval)
            .add(ConvertFold);
        Self {
            patterns,
            max_iterations,
        }
    }

    /// Erase the deferred encodes.
    ///
    /// Every deferred encode reads a buffer the chain rewrite stopped
    /// writing; any other user left on it means the bookkeeping is wrong.
    fn drain_removable(&self, graph: &mut IrGraph, ctx: &mut RewriteCtx) -> Result<usize> {
        let mut erased = 0;
        for stick in ctx.take_removable() {
            if !graph.contains_op(stick) {
                continue;
            }
            if graph.kind(stick) != Some(&OpKind::Stick) {
                return Err(Error::InvariantViolation(format!(
                    "Deferred op {:?} is not a zlow.stick",
                    stick
                )));
            }
            let (x, _) = conversion_operands(graph, stick).ok_or_else(|| {
                Error::InvariantViolation(format!("zlow.stick {:?} has no operands", stick))
            })?;
            if graph.users(x).iter().any(|&u| u != stick) {
                return Err(Error::InvariantViolation(format!(
                    "Input of deferred zlow.stick {:?} is still in use",
                    stick
                )));
            }
            graph.erase_op(stick)?;
            erased += 1;
        }
        Ok(erased)
    }
}

impl Pass for LayoutRewritePass {
    fn name(&self) -> &str {
        "layout_rewrite"
    }

    fn stage(&self) -> Stage {
        Stage::Layout
    }

    fn run(&self, graph: &mut IrGraph) -> Result<bool> {
        let mut ctx = RewriteCtx::new();
        let outcome =
            apply_patterns_greedily(graph, &self.patterns, &mut ctx, self.max_iterations)?;
        let drained = self.drain_removable(graph, &mut ctx)?;
        let swept = if drained > 0 { sweep_dead_ops(graph)? } else { 0 };

        tracing::debug!(
            sweeps = outcome.sweeps,
            applied = ctx.total_applied(),
            drained,
            swept,
            "layout rewrite finished"
        );
        Ok(outcome.changed || drained > 0)
    }
}
