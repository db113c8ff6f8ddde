//! One-shot deallocation insertion around `async.execute` regions.

use stickle_core::{IrGraph, Pass, Result, Stage};

use crate::pattern::{PatternSet, RewriteCtx, apply_patterns_once};
use crate::patterns::AsyncRegionDealloc;

/// Pass that frees the buffers produced and consumed by concurrently
/// executing regions.
pub struct AsyncDeallocPass {
    patterns: PatternSet,
}

impl AsyncDeallocPass {
    pub fn new() -> Self {
        let mut patterns = PatternSet::new();
        patterns.add(AsyncRegionDealloc);
        Self { patterns }
    }
}

impl Default for AsyncDeallocPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for AsyncDeallocPass {
    fn name(&self) -> &str {
        "async_dealloc"
    }

    fn stage(&self) -> Stage {
        Stage::Async
    }

    fn run(&self, graph: &mut IrGraph) -> Result<bool> {
        let regions = apply_patterns_once(graph, &self.patterns, &mut RewriteCtx::new())?;
        Ok(regions > 0)
    }
}
