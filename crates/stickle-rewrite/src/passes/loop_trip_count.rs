//! One-shot loop trip-count narrowing.

use stickle_core::{IrGraph, Pass, Result, Stage};

use crate::pattern::{PatternSet, RewriteCtx, apply_patterns_once};
use crate::patterns::LoopTripCountNarrowing;

/// Pass that replaces the maximum trip count of counted `onnx.Loop`s with
/// the count derived from their bounds.
pub struct LoopTripCountPass {
    patterns: PatternSet,
}

impl LoopTripCountPass {
    pub fn new() -> Self {
        let mut patterns = PatternSet::new();
        patterns.add(LoopTripCountNarrowing);
        Self { patterns }
    }
}

impl Default for LoopTripCountPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for LoopTripCountPass {
    fn name(&self) -> &str {
        "loop_trip_count"
    }

    fn stage(&self) -> Stage {
        Stage::Loop
    }

    fn run(&self, graph: &mut IrGraph) -> Result<bool> {
        let narrowed = apply_patterns_once(graph, &self.patterns, &mut RewriteCtx::new())?;
        Ok(narrowed > 0)
    }
}
