//! Read-only graph queries shared by the rewrite patterns.
//!
//! Use-list and ordering primitives (`has_one_use`, `users`, `defining_op`,
//! `is_block_argument`, `is_before_in_block`) live on `IrGraph`; the helpers
//! here add op-kind and type knowledge on top of them. None of them mutate.

use stickle_core::{IrGraph, OpId, OpKind, StickLayout, Type, ValueId};

/// Operand slots of stick and unstick ops.
pub const CONVERSION_INPUT: usize = 0;
pub const CONVERSION_OUTPUT: usize = 1;

/// Operand slots of affine loads and stores.
pub const LOAD_MEMREF: usize = 0;
pub const STORE_VALUE: usize = 0;
pub const STORE_MEMREF: usize = 1;

/// The op defining `value`, if it has the given kind.
pub fn defining_op_of_kind(graph: &IrGraph, value: ValueId, kind: &OpKind) -> Option<OpId> {
    graph
        .defining_op(value)
        .filter(|&op| graph.kind(op) == Some(kind))
}

/// Check if `value` is a buffer with a non-default layout.
pub fn has_non_identity_layout(graph: &IrGraph, value: ValueId) -> bool {
    graph
        .value_type(value)
        .is_ok_and(Type::has_non_identity_layout)
}

/// The buffer `value` is a view of, with the view op.
pub fn view_source(graph: &IrGraph, value: ValueId) -> Option<(ValueId, OpId)> {
    let view = defining_op_of_kind(graph, value, &OpKind::View)?;
    Some((graph.op(view).ok()?.operand(0)?, view))
}

/// Layout tag of a stick or unstick op.
pub fn layout_of(graph: &IrGraph, op: OpId) -> Option<StickLayout> {
    graph.op(op).ok()?.layout()
}

/// `(X, Out)` operands of a stick or unstick op.
pub fn conversion_operands(graph: &IrGraph, op: OpId) -> Option<(ValueId, ValueId)> {
    let op = graph.op(op).ok()?;
    if !matches!(op.kind, OpKind::Stick | OpKind::Unstick) {
        return None;
    }
    Some((op.operand(CONVERSION_INPUT)?, op.operand(CONVERSION_OUTPUT)?))
}

/// Value of a rank-0 integer `onnx.Constant`, wherever it is defined.
pub fn integer_constant_value(graph: &IrGraph, value: ValueId) -> Option<i64> {
    let op = defining_op_of_kind(graph, value, &OpKind::Constant)?;
    let payload = graph.op(op).ok()?.constant_value()?;
    if payload.len() != 1 || !payload.dtype.is_integer() {
        return None;
    }
    payload.first_int()
}

pub fn is_integer_constant(graph: &IrGraph, value: ValueId) -> bool {
    integer_constant_value(graph, value).is_some()
}

/// Check if the element type of `value` is an integer type.
pub fn has_integer_element_type(graph: &IrGraph, value: ValueId) -> bool {
    graph
        .value_type(value)
        .ok()
        .and_then(Type::element_type)
        .is_some_and(|dtype| dtype.is_integer())
}

/// Check if `value` is the result of a plain `memref.alloc`.
pub fn is_alloc_defined(graph: &IrGraph, value: ValueId) -> bool {
    defining_op_of_kind(graph, value, &OpKind::Alloc).is_some()
}

/// Check if every user of `value` other than `except` has one of `kinds`.
pub fn only_users_of_kind(
    graph: &IrGraph,
    value: ValueId,
    kinds: &[OpKind],
    except: Option<OpId>,
) -> bool {
    graph
        .users(value)
        .into_iter()
        .filter(|&user| Some(user) != except)
        .all(|user| graph.kind(user).is_some_and(|k| kinds.contains(k)))
}

/// Check if `op` uses `value` in operand slot `slot` and nowhere else.
pub fn uses_only_at(graph: &IrGraph, op: OpId, value: ValueId, slot: usize) -> bool {
    graph.op(op).is_ok_and(|o| {
        o.operands()
            .iter()
            .enumerate()
            .all(|(i, &v)| (v == value) == (i == slot))
    })
}

/// Check if `value` is visible at `op`: defined earlier in an enclosing block
/// or an argument of one.
pub fn dominates(graph: &IrGraph, value: ValueId, op: OpId) -> bool {
    let Ok(user_block) = graph.op_block(op) else {
        return false;
    };
    if let Some((block, _)) = graph.block_argument(value) {
        return graph.is_block_within(user_block, block);
    }
    let Some(def) = graph.defining_op(value) else {
        return false;
    };
    let Ok(def_block) = graph.op_block(def) else {
        return false;
    };
    graph
        .ancestor_in_block(op, def_block)
        .is_some_and(|ancestor| graph.is_before_in_block(def, ancestor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stickle_core::{DataType, OpBuilder};

    #[test]
    fn test_view_source_and_layout() {
        let mut graph = IrGraph::new();
        let x = graph.add_argument(Type::memref(DataType::F16, &[2, 3]));
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let out = b.alloc(Type::memref(DataType::F32, &[2, 3]), vec![]).unwrap();
        let unstick = b.unstick(x, out, StickLayout::D2).unwrap();
        let view = b.view(out, Type::memref(DataType::F32, &[6])).unwrap();

        assert_eq!(view_source(&graph, view).map(|(s, _)| s), Some(out));
        assert_eq!(view_source(&graph, out), None);
        assert_eq!(layout_of(&graph, unstick), Some(StickLayout::D2));
        assert_eq!(conversion_operands(&graph, unstick), Some((x, out)));
        assert!(is_alloc_defined(&graph, out));
        assert!(!is_alloc_defined(&graph, x));
        assert!(only_users_of_kind(&graph, out, &[OpKind::View], Some(unstick)));
        assert!(!only_users_of_kind(&graph, out, &[OpKind::View], None));
        assert!(uses_only_at(&graph, unstick, out, CONVERSION_OUTPUT));
        assert!(dominates(&graph, out, graph.defining_op(view).unwrap()));
        assert!(!dominates(&graph, view, unstick));
    }

    #[test]
    fn test_integer_constants() {
        let mut graph = IrGraph::new();
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let c = b.constant_int(42, DataType::I32).unwrap();
        let f = b.constant(stickle_core::TensorValue::scalar_f32(1.5)).unwrap();

        assert_eq!(integer_constant_value(&graph, c), Some(42));
        assert!(is_integer_constant(&graph, c));
        assert!(!is_integer_constant(&graph, f));
        assert!(has_integer_element_type(&graph, c));
        assert!(!has_integer_element_type(&graph, f));
    }
}
