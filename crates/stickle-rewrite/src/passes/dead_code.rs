//! Dead operation sweep.

use stickle_core::{IrGraph, Pass, Result, Stage};

use crate::pattern::is_trivially_dead;

/// Pass that erases side-effect-free operations whose results are unused.
pub struct DeadCodePass;

impl DeadCodePass {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DeadCodePass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for DeadCodePass {
    fn name(&self) -> &str {
        "dead_code"
    }

    fn stage(&self) -> Stage {
        Stage::Cleanup
    }

    fn run(&self, graph: &mut IrGraph) -> Result<bool> {
        Ok(sweep_dead_ops(graph)? > 0)
    }
}

/// Erase trivially dead operations until none are left.
///
/// Visits operations in reverse pre-order so users die before the values
/// they read. Returns the number of erased operations.
pub fn sweep_dead_ops(graph: &mut IrGraph) -> Result<usize> {
    let mut erased = 0;
    loop {
        let mut changed = false;
        for op in graph.walk().into_iter().rev() {
            if graph.contains_op(op) && is_trivially_dead(graph, op) {
                graph.erase_op(op)?;
                erased += 1;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    if erased > 0 {
        tracing::debug!(erased, "swept dead operations");
    }
    Ok(erased)
}
