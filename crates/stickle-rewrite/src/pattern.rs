//! Rewrite pattern trait and the greedy fixpoint driver.
//!
//! A pattern targets one operation kind. The driver sweeps the function body
//! in pre-order, erases trivially dead operations, and offers every remaining
//! operation to the patterns registered for its kind, highest benefit first.
//! Sweeps repeat until one of them changes nothing.
//!
//! # Pattern Context
//!
//! State that outlives a single match (the set of encodes the chain
//! eliminator could not erase yet) lives in a `RewriteCtx` owned by the pass
//! and handed to every invocation, never in the pattern itself.
//!
//! ```ignore
//! let mut patterns = PatternSet::new();
//! patterns.add(StickRemoval).add(UnstickLoadStoreStickRemoval);
//!
//! let mut ctx = RewriteCtx::new();
//! apply_patterns_greedily(&mut graph, &patterns, &mut ctx, 10)?;
//! for stick in ctx.take_removable() {
//!     // erase
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use stickle_core::{IrGraph, OpId, OpKind, Result};

/// Outcome of one pattern invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteResult {
    /// The pattern declined; the graph is untouched.
    NoMatch,
    /// The pattern rewrote the graph.
    Applied,
}

/// Batch-scoped state shared by all patterns of one pass run.
#[derive(Debug, Default)]
pub struct RewriteCtx {
    /// Operations to erase once the fixpoint is reached.
    removable: BTreeSet<OpId>,

    /// Number of successful rewrites per pattern name.
    applied: BTreeMap<String, usize>,
}

impl RewriteCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer erasure of `op` until the driver has converged.
    pub fn mark_removable(&mut self, op: OpId) {
        self.removable.insert(op);
    }

    pub fn is_removable(&self, op: OpId) -> bool {
        self.removable.contains(&op)
    }

    /// Drain the deferred erasures in a deterministic order.
    pub fn take_removable(&mut self) -> Vec<OpId> {
        std::mem::take(&mut self.removable).into_iter().collect()
    }

    fn record(&mut self, pattern: &str) {
        *self.applied.entry(pattern.to_string()).or_default() += 1;
    }

    /// Number of times a pattern fired.
    pub fn applied_count(&self, pattern: &str) -> usize {
        self.applied.get(pattern).copied().unwrap_or(0)
    }

    /// Total number of successful rewrites.
    pub fn total_applied(&self) -> usize {
        self.applied.values().sum()
    }
}

/// A hand-written match-and-rewrite rule.
///
/// `match_and_rewrite` must either leave the graph untouched and return
/// `NoMatch`, or rewrite it completely and return `Applied`. An `Err` means a
/// graph invariant broke and aborts the pass.
pub trait RewritePattern: Send + Sync {
    /// Get the pattern name (used for logging and statistics).
    fn name(&self) -> &str;

    /// The operation kind this pattern is rooted at.
    fn root(&self) -> OpKind;

    /// Priority among patterns with the same root; higher runs first.
    fn benefit(&self) -> u16 {
        1
    }

    fn match_and_rewrite(
        &self,
        graph: &mut IrGraph,
        op: OpId,
        ctx: &mut RewriteCtx,
    ) -> Result<RewriteResult>;
}

/// Log why a pattern declined and report `NoMatch`.
pub fn no_match(pattern: &str, op: OpId, reason: impl fmt::Display) -> Result<RewriteResult> {
    tracing::trace!(pattern, op = ?op, %reason, "no match");
    Ok(RewriteResult::NoMatch)
}

/// Patterns keyed by root kind, each list ordered by descending benefit.
#[derive(Default)]
pub struct PatternSet {
    patterns: HashMap<OpKind, Vec<Box<dyn RewritePattern>>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern. Ties in benefit keep registration order.
    pub fn add(&mut self, pattern: impl RewritePattern + 'static) -> &mut Self {
        let list = self.patterns.entry(pattern.root()).or_default();
        list.push(Box::new(pattern));
        list.sort_by_key(|p| std::cmp::Reverse(p.benefit()));
        self
    }

    /// Patterns rooted at `kind`.
    pub fn for_kind(&self, kind: &OpKind) -> &[Box<dyn RewritePattern>] {
        self.patterns.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.patterns.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a greedy driver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreedyOutcome {
    /// Whether any sweep changed the graph.
    pub changed: bool,
    /// Whether the last sweep changed nothing.
    pub converged: bool,
    /// Number of sweeps performed.
    pub sweeps: usize,
}

/// Check if `op` can be erased because nothing observes it.
pub fn is_trivially_dead(graph: &IrGraph, op: OpId) -> bool {
    let Ok(operation) = graph.op(op) else {
        return false;
    };
    operation.kind.is_removable_when_dead()
        && operation.regions().is_empty()
        && operation.results().iter().all(|&r| graph.use_empty(r))
}

/// Apply `patterns` until a full sweep changes nothing or `max_iterations`
/// sweeps have run.
///
/// Failing to converge is not an error: the graph is valid after every
/// rewrite, just not fully simplified. It is logged at `warn`.
pub fn apply_patterns_greedily(
    graph: &mut IrGraph,
    patterns: &PatternSet,
    ctx: &mut RewriteCtx,
    max_iterations: usize,
) -> Result<GreedyOutcome> {
    let mut outcome = GreedyOutcome {
        changed: false,
        converged: false,
        sweeps: 0,
    };

    while outcome.sweeps < max_iterations {
        outcome.sweeps += 1;
        let mut changed = false;

        for op in graph.walk() {
            // Erased by an earlier rewrite in this sweep, or parked for the
            // post-fixpoint drain.
            if !graph.contains_op(op) || ctx.is_removable(op) {
                continue;
            }

            if is_trivially_dead(graph, op) {
                graph.erase_op(op)?;
                changed = true;
                continue;
            }

            let Some(kind) = graph.kind(op).cloned() else {
                continue;
            };
            for pattern in patterns.for_kind(&kind) {
                if pattern.match_and_rewrite(graph, op, ctx)? == RewriteResult::Applied {
                    tracing::debug!(pattern = pattern.name(), op = ?op, "applied");
                    ctx.record(pattern.name());
                    changed = true;
                    break;
                }
            }
        }

        if !changed {
            outcome.converged = true;
            return Ok(outcome);
        }
        outcome.changed = true;
    }

    tracing::warn!(
        max_iterations,
        applied = ctx.total_applied(),
        "pattern application did not converge"
    );
    Ok(outcome)
}

/// Offer every op to `patterns` exactly once, in pre-order.
///
/// Ops created by a rewrite are not revisited. Returns the number of
/// rewrites applied.
pub fn apply_patterns_once(
    graph: &mut IrGraph,
    patterns: &PatternSet,
    ctx: &mut RewriteCtx,
) -> Result<usize> {
    let mut applied = 0;
    for op in graph.walk() {
        let Some(kind) = graph.kind(op).cloned() else {
            continue;
        };
        for pattern in patterns.for_kind(&kind) {
            if pattern.match_and_rewrite(graph, op, ctx)? == RewriteResult::Applied {
                tracing::debug!(pattern = pattern.name(), op = ?op, "applied");
                ctx.record(pattern.name());
                applied += 1;
                break;
            }
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stickle_core::{DataType, OpBuilder, Type};

    /// Erases every `test.marker` op it sees.
    struct CountingPattern {
        benefit: u16,
        name: &'static str,
    }

    impl RewritePattern for CountingPattern {
        fn name(&self) -> &str {
            self.name
        }

        fn root(&self) -> OpKind {
            OpKind::Custom("test.marker".into())
        }

        fn benefit(&self) -> u16 {
            self.benefit
        }

        fn match_and_rewrite(
            &self,
            graph: &mut IrGraph,
            op: OpId,
            _ctx: &mut RewriteCtx,
        ) -> Result<RewriteResult> {
            graph.erase_op(op)?;
            Ok(RewriteResult::Applied)
        }
    }

    #[test]
    fn test_pattern_set_orders_by_benefit() {
        let mut set = PatternSet::new();
        set.add(CountingPattern {
            benefit: 1,
            name: "low",
        })
        .add(CountingPattern {
            benefit: 5,
            name: "high",
        });
        let names: Vec<&str> = set
            .for_kind(&OpKind::Custom("test.marker".into()))
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(names, vec!["high", "low"]);
        assert_eq!(set.len(), 2);
        assert!(set.for_kind(&OpKind::Stick).is_empty());
    }

    #[test]
    fn test_driver_erases_dead_ops_and_converges() {
        let mut graph = IrGraph::new();
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let a = b.constant_int(1, DataType::I64).unwrap();
        let unused = b.constant_int(2, DataType::I64).unwrap();
        b.add(unused, unused).unwrap();
        b.create(OpKind::Custom("test.marker".into()), vec![], vec![], Default::default())
            .unwrap();
        b.func_return(vec![a]).unwrap();

        let mut set = PatternSet::new();
        set.add(CountingPattern {
            benefit: 1,
            name: "marker",
        });
        let mut ctx = RewriteCtx::new();
        let outcome = apply_patterns_greedily(&mut graph, &set, &mut ctx, 10).unwrap();

        assert!(outcome.changed);
        assert!(outcome.converged);
        assert_eq!(ctx.applied_count("marker"), 1);
        // Only the returned constant and the return remain.
        assert_eq!(graph.op_count(), 2);
    }

    #[test]
    fn test_driver_reports_non_convergence() {
        let mut graph = IrGraph::new();
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let buf = b.alloc(Type::memref(DataType::F32, &[4]), vec![]).unwrap();
        b.func_return(vec![buf]).unwrap();

        /// Flips an attribute forever.
        struct Flip;
        impl RewritePattern for Flip {
            fn name(&self) -> &str {
                "flip"
            }
            fn root(&self) -> OpKind {
                OpKind::Alloc
            }
            fn match_and_rewrite(
                &self,
                graph: &mut IrGraph,
                op: OpId,
                _ctx: &mut RewriteCtx,
            ) -> Result<RewriteResult> {
                let next = graph.op(op)?.int_attr("flip").unwrap_or(0) ^ 1;
                graph.set_attribute(op, "flip", stickle_core::Attribute::Int(next))?;
                Ok(RewriteResult::Applied)
            }
        }

        let mut set = PatternSet::new();
        set.add(Flip);
        let mut ctx = RewriteCtx::new();
        let outcome = apply_patterns_greedily(&mut graph, &set, &mut ctx, 3).unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.sweeps, 3);
        assert_eq!(ctx.applied_count("flip"), 3);
    }

    #[test]
    fn test_removable_ops_are_skipped() {
        let mut graph = IrGraph::new();
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let unused = b.constant_int(2, DataType::I64).unwrap();
        let op = graph.defining_op(unused).unwrap();

        let mut ctx = RewriteCtx::new();
        ctx.mark_removable(op);
        let outcome =
            apply_patterns_greedily(&mut graph, &PatternSet::new(), &mut ctx, 10).unwrap();
        assert!(!outcome.changed);
        assert!(graph.contains_op(op));
        assert_eq!(ctx.take_removable(), vec![op]);
        assert!(!ctx.is_removable(op));
    }

    #[test]
    fn test_single_sweep_leaves_dead_ops() {
        let mut graph = IrGraph::new();
        let mut b = OpBuilder::at_entry_end(&mut graph);
        b.constant_int(2, DataType::I64).unwrap();
        let marker = OpKind::Custom("test.marker".into());
        b.create(marker.clone(), vec![], vec![], Default::default()).unwrap();
        b.create(marker, vec![], vec![], Default::default()).unwrap();

        let mut set = PatternSet::new();
        set.add(CountingPattern {
            benefit: 1,
            name: "marker",
        });
        let applied = apply_patterns_once(&mut graph, &set, &mut RewriteCtx::new()).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(graph.op_count(), 1);
    }
}
