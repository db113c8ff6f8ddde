//! Tensor-level canonicalization of recurrent layers.

use stickle_core::{IrGraph, Pass, Result, Stage};

use crate::pattern::{PatternSet, RewriteCtx, apply_patterns_once};
use crate::patterns::RnnLayoutCanonicalization;

/// Pass that rewrites batch-major `RNN`, `GRU` and `LSTM` layers to the
/// sequence-major layout.
pub struct RnnLayoutPass {
    patterns: PatternSet,
}

impl RnnLayoutPass {
    pub fn new() -> Self {
        let mut patterns = PatternSet::new();
        for pattern in RnnLayoutCanonicalization::all() {
            patterns.add(pattern);
        }
        Self { patterns }
    }
}

impl Default for RnnLayoutPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for RnnLayoutPass {
    fn name(&self) -> &str {
        "rnn_layout"
    }

    fn stage(&self) -> Stage {
        Stage::Canonicalize
    }

    fn run(&self, graph: &mut IrGraph) -> Result<bool> {
        let layers = apply_patterns_once(graph, &self.patterns, &mut RewriteCtx::new())?;
        Ok(layers > 0)
    }
}
