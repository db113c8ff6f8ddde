//! Textual dump of an operation graph.
//!
//! The format is MLIR-like and meant for debug logs and test failure
//! messages, not for parsing.

use std::fmt::Write;

use crate::ir::{BlockId, IrGraph, OpId, RegionId, ValueId};

/// Render a graph as text.
///
/// # Example
///
/// ```ignore
/// tracing::debug!("after layout rewrite:\n{}", to_text(&graph));
/// ```
pub fn to_text(graph: &IrGraph) -> String {
    let mut out = String::new();
    let args = graph
        .arguments()
        .iter()
        .map(|&a| typed(graph, a))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(out, "func({}) {{", args);
    let entry = graph.entry_block();
    for &op in graph.block_ops(entry).unwrap_or(&[]) {
        print_op(graph, op, 1, &mut out);
    }
    out.push_str("}\n");
    out
}

fn print_op(graph: &IrGraph, id: OpId, depth: usize, out: &mut String) {
    let Ok(op) = graph.op(id) else {
        return;
    };
    let indent = "  ".repeat(depth);
    out.push_str(&indent);

    if !op.results().is_empty() {
        let results = op
            .results()
            .iter()
            .map(|r| name(*r))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(out, "{} = ", results);
    }
    let operands = op
        .operands()
        .iter()
        .map(|v| name(*v))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = write!(out, "{}({})", op.kind, operands);

    if !op.attributes.is_empty() {
        let mut keys: Vec<&String> = op.attributes.keys().collect();
        keys.sort();
        let attrs = keys
            .into_iter()
            .map(|k| format!("{} = {}", k, op.attributes[k]))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(out, " {{{}}}", attrs);
    }

    if !op.results().is_empty() {
        let types = op
            .results()
            .iter()
            .map(|&r| {
                graph
                    .value_type(r)
                    .map(|t| t.to_string())
                    .unwrap_or_else(|_| "?".to_string())
            })
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(out, " : {}", types);
    }

    if op.regions().is_empty() {
        out.push('\n');
        return;
    }
    out.push_str(" {\n");
    for &region in op.regions() {
        print_region(graph, region, depth, out);
    }
    out.push_str(&indent);
    out.push_str("}\n");
}

fn print_region(graph: &IrGraph, region: RegionId, depth: usize, out: &mut String) {
    let Ok(region) = graph.region(region) else {
        return;
    };
    for &block in region.blocks() {
        print_block(graph, block, depth, out);
    }
}

fn print_block(graph: &IrGraph, block: BlockId, depth: usize, out: &mut String) {
    let Ok(args) = graph.block_args(block) else {
        return;
    };
    let args = args
        .iter()
        .map(|&a| typed(graph, a))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(out, "{}^bb{}({}):", "  ".repeat(depth), block.index(), args);
    for &op in graph.block_ops(block).unwrap_or(&[]) {
        print_op(graph, op, depth + 1, out);
    }
}

fn name(value: ValueId) -> String {
    format!("%{}", value.index())
}

fn typed(graph: &IrGraph, value: ValueId) -> String {
    match graph.value_type(value) {
        Ok(ty) => format!("{}: {}", name(value), ty),
        Err(_) => name(value),
    }
}
