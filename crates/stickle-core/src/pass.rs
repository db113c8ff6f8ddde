//! Rewrite pass trait and stage definitions.

use crate::Result;
use crate::ir::IrGraph;

/// Pipeline stage for organizing passes.
///
/// Passes are grouped into stages and run in a fixed order. Within each stage,
/// passes run in the order they were registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Tensor-level canonicalization (earliest stage).
    ///
    /// Normalizes operator attributes that later stages do not handle, e.g.
    /// batch-major recurrent layers.
    Canonicalize,

    /// Layout-conversion cleanup.
    ///
    /// Runs the stick/unstick rewrites to a fixpoint, then erases the encodes
    /// the chain eliminator marked as removable.
    Layout,

    /// One-shot loop bound tightening.
    Loop,

    /// One-shot buffer lifetime repair around concurrently executing regions.
    Async,

    /// Dead operation sweep (latest stage).
    Cleanup,
}

/// Trait for implementing rewrite passes.
///
/// A pass is a graph transformation that runs during a specific stage.
///
/// # Return Value
///
/// The `run()` method returns `Ok(true)` if the pass made changes to the
/// graph, or `Ok(false)` if no changes were made. An `Err` means a graph
/// invariant was broken and the pipeline must stop.
///
/// # Example
///
/// ```ignore
/// struct DropDeadDeallocs;
///
/// impl Pass for DropDeadDeallocs {
///     fn name(&self) -> &str {
///         "drop_dead_deallocs"
///     }
///
///     fn stage(&self) -> Stage {
///         Stage::Cleanup
///     }
///
///     fn run(&self, graph: &mut IrGraph) -> Result<bool> {
///         let mut changed = false;
///         // Erase deallocs of buffers nobody else uses...
///         Ok(changed)
///     }
/// }
/// ```
pub trait Pass: Send + Sync {
    /// Get the pass name (used for logging and debugging).
    fn name(&self) -> &str;

    /// Get the stage this pass belongs to.
    fn stage(&self) -> Stage;

    /// Run the pass on the given graph.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if the pass made changes to the graph.
    /// * `Ok(false)` if no changes were made.
    /// * `Err(_)` if the pass broke an invariant.
    fn run(&self, graph: &mut IrGraph) -> Result<bool>;
}
