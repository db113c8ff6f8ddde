//! Rewrite layer for accelerator-bound programs.
//!
//! This crate takes an `IrGraph` from `stickle-core` and simplifies it with a
//! pipeline of passes that run in stages:
//! 1. **Canonicalize** - Switch batch-major recurrent layers to `layout = 0`
//! 2. **Layout** - Remove redundant stick/unstick conversions to a fixpoint
//! 3. **Loop** - Narrow the maximum trip count of counted `onnx.Loop`s
//! 4. **Async** - Free buffers around `async.execute` regions (off by default)
//! 5. **Cleanup** - Erase operations nothing observes
//!
//! # Example
//!
//! ```no_run
//! use stickle_core::IrGraph;
//! use stickle_rewrite::{RewriteConfig, rewrite};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = IrGraph::new();
//! // ... build the function body
//!
//! let changed = rewrite(&mut graph, &RewriteConfig::default())?;
//! println!("changed: {}", changed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod pattern;
pub mod patterns;
pub mod passes;
pub mod query;

pub use config::RewriteConfig;
pub use pattern::{
    GreedyOutcome, PatternSet, RewriteCtx, RewritePattern, RewriteResult,
    apply_patterns_greedily, apply_patterns_once,
};
pub use passes::{
    AsyncDeallocPass, DeadCodePass, LayoutRewritePass, LoopTripCountPass, RnnLayoutPass,
};

// Re-export commonly used types from stickle-core
pub use stickle_core::{IrGraph, Pass, Stage};

/// Rewrite pipeline with pluggable passes.
///
/// The pipeline runs in fixed stages: Canonicalize → Layout → Loop → Async →
/// Cleanup. Built-in passes are registered according to the `RewriteConfig`,
/// and custom passes can be added via `add_pass()`.
pub struct RewritePipeline {
    /// All passes to run, ordered by (stage, registration order).
    passes: Vec<Box<dyn Pass>>,

    config: RewriteConfig,
}

impl RewritePipeline {
    /// Create a pipeline with the built-in passes `config` enables.
    ///
    /// The built-in passes are:
    /// - `RnnLayoutPass` (Canonicalize stage, if `rnn_layout`)
    /// - `LayoutRewritePass` (Layout stage)
    /// - `LoopTripCountPass` (Loop stage, if `trip_count`)
    /// - `AsyncDeallocPass` (Async stage, if `async_dealloc`)
    /// - `DeadCodePass` (Cleanup stage)
    pub fn new(config: RewriteConfig) -> Self {
        let mut pipeline = Self {
            passes: Vec::new(),
            config: config.clone(),
        };

        if config.rnn_layout {
            pipeline.add_pass(RnnLayoutPass::new());
        }
        pipeline.add_pass(LayoutRewritePass::new(config.max_iterations));
        if config.trip_count {
            pipeline.add_pass(LoopTripCountPass::new());
        }
        if config.async_dealloc {
            pipeline.add_pass(AsyncDeallocPass::new());
        }
        pipeline.add_pass(DeadCodePass::new());

        pipeline
    }

    /// Add a custom pass to the pipeline.
    ///
    /// The pass will be inserted into the appropriate stage (determined by
    /// `pass.stage()`). Within a stage, passes run in the order they were
    /// registered.
    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Names of the registered passes in execution order.
    pub fn pass_names(&mut self) -> Vec<String> {
        self.passes.sort_by_key(|p| p.stage());
        self.passes.iter().map(|p| p.name().to_string()).collect()
    }

    /// Run all passes in stage order.
    ///
    /// Returns `true` if any pass changed the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if a pass breaks a graph invariant, or if
    /// `verify_each_pass` is set and the graph fails verification after a
    /// pass.
    #[tracing::instrument(skip_all, fields(num_ops = graph.op_count()))]
    pub fn run(&mut self, graph: &mut IrGraph) -> stickle_core::Result<bool> {
        self.passes.sort_by_key(|p| p.stage());

        let mut changed = false;
        for pass in &self.passes {
            let _span =
                tracing::debug_span!("pass", name = pass.name(), stage = ?pass.stage()).entered();
            let pass_changed = pass.run(graph)?;
            if pass_changed && self.config.verify_each_pass {
                stickle_core::verify(graph)?;
            }
            if pass_changed {
                tracing::trace!(graph = %stickle_core::print::to_text(graph), "after pass");
            }
            changed |= pass_changed;
        }
        Ok(changed)
    }
}

/// Run the default pipeline for `config` on `graph`.
///
/// This is a convenience wrapper around `RewritePipeline`.
#[tracing::instrument(skip_all)]
pub fn rewrite(graph: &mut IrGraph, config: &RewriteConfig) -> stickle_core::Result<bool> {
    RewritePipeline::new(config.clone()).run(graph)
}
