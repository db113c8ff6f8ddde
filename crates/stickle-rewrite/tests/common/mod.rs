//! Common test utilities for rewrite tests.
//!
//! This module provides tracing setup, graph builders for the program shapes
//! the passes target, and helpers for running graphs in the reference
//! interpreter.

#![allow(dead_code)]

use std::collections::HashMap;

use stickle_core::{
    AffineExpr, AffineMap, BlockId, DataType, Dim, InsertPoint, Interpreter, IrGraph, MemRefType,
    OpBuilder, OpId, OpKind, RuntimeValue, StickLayout, TensorData, TensorShape, TensorValue, Type,
    ValueId,
};

/// Install a test subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .try_init();
}

/// An f16 accelerator buffer of `shape` with the layout map of `layout`.
pub fn stickified(shape: &[usize], layout: StickLayout) -> Type {
    Type::MemRef(
        MemRefType::new(DataType::F16, TensorShape::Static(shape.to_vec()))
            .with_layout(layout.stick_map()),
    )
}

/// Count operations of `kind` anywhere in the function body.
pub fn count_kind(graph: &IrGraph, kind: &OpKind) -> usize {
    graph
        .walk()
        .into_iter()
        .filter(|&op| graph.kind(op) == Some(kind))
        .count()
}

/// Emit a loop nest over `shape` and return the induction variables and the
/// innermost body.
pub fn loop_nest(
    graph: &mut IrGraph,
    at: InsertPoint,
    shape: &[usize],
) -> (Vec<ValueId>, BlockId) {
    let mut ivs = Vec::with_capacity(shape.len());
    let mut b = OpBuilder::new(graph, at);
    let (_, iv, mut body) = b.affine_for(0, shape[0] as i64, 1).unwrap();
    ivs.push(iv);
    for &extent in &shape[1..] {
        let mut b = OpBuilder::before_terminator(graph, body);
        let (_, iv, inner) = b.affine_for(0, extent as i64, 1).unwrap();
        ivs.push(iv);
        body = inner;
    }
    (ivs, body)
}

/// Copy of a decoded buffer into an encoded one through a plain buffer:
/// `S = stick(copy(unstick(X)))`.
pub struct LayoutChain {
    pub graph: IrGraph,
    /// Accelerator-side parameter.
    pub input: ValueId,
    pub unstick: OpId,
}

/// `S[j, i] = unstick(X)[i, j]` for a 2x3 `2D` input.
pub fn transpose_chain() -> LayoutChain {
    let mut graph = IrGraph::new();
    let input = graph.add_argument(stickified(&[2, 3], StickLayout::D2));
    let mut b = OpBuilder::at_entry_end(&mut graph);
    let a = b.alloc(Type::memref(DataType::F32, &[2, 3]), vec![]).unwrap();
    let unstick = b.unstick(input, a, StickLayout::D2).unwrap();
    let dest = b.alloc(Type::memref(DataType::F32, &[3, 2]), vec![]).unwrap();

    let entry = graph.entry_block();
    let (ivs, body) = loop_nest(&mut graph, InsertPoint::BlockEnd(entry), &[2, 3]);
    let mut b = OpBuilder::at_entry_end(&mut graph);
    let s = b.alloc(stickified(&[3, 2], StickLayout::D2), vec![]).unwrap();
    b.stick(dest, s, StickLayout::D2).unwrap();
    b.func_return(vec![s]).unwrap();

    let mut b = OpBuilder::before_terminator(&mut graph, body);
    let v = b.affine_load(a, ivs.clone(), AffineMap::identity(2)).unwrap();
    let swap = AffineMap::permutation(&[1, 0]);
    b.affine_store(v, dest, ivs, swap).unwrap();

    LayoutChain {
        graph,
        input,
        unstick,
    }
}

/// Element-wise copy of an `NCHW` tensor of logical shape `shape`.
pub fn nchw_copy_chain(shape: [usize; 4]) -> LayoutChain {
    let [n, c, h, w] = shape;
    let nhwc = [n, h, w, c];
    let mut graph = IrGraph::new();
    let input = graph.add_argument(stickified(&nhwc, StickLayout::Nchw));
    let mut b = OpBuilder::at_entry_end(&mut graph);
    let a = b.alloc(Type::memref(DataType::F32, &shape), vec![]).unwrap();
    let unstick = b.unstick(input, a, StickLayout::Nchw).unwrap();
    let dest = b.alloc(Type::memref(DataType::F32, &shape), vec![]).unwrap();

    let entry = graph.entry_block();
    let (ivs, body) = loop_nest(&mut graph, InsertPoint::BlockEnd(entry), &shape);
    let mut b = OpBuilder::at_entry_end(&mut graph);
    let s = b.alloc(stickified(&nhwc, StickLayout::Nchw), vec![]).unwrap();
    b.stick(dest, s, StickLayout::Nchw).unwrap();
    b.func_return(vec![s]).unwrap();

    let mut b = OpBuilder::before_terminator(&mut graph, body);
    let v = b.affine_load(a, ivs.clone(), AffineMap::identity(4)).unwrap();
    b.affine_store(v, dest, ivs, AffineMap::identity(4)).unwrap();

    LayoutChain {
        graph,
        input,
        unstick,
    }
}

/// `transpose_chain` whose encoded buffer has a runtime row count, computed
/// after the copy loops.
pub fn dynamic_transpose_chain() -> LayoutChain {
    let mut graph = IrGraph::new();
    let input = graph.add_argument(stickified(&[2, 3], StickLayout::D2));
    let mut b = OpBuilder::at_entry_end(&mut graph);
    let a = b.alloc(Type::memref(DataType::F32, &[2, 3]), vec![]).unwrap();
    let unstick = b.unstick(input, a, StickLayout::D2).unwrap();
    let dest = b.alloc(Type::memref(DataType::F32, &[3, 2]), vec![]).unwrap();

    let entry = graph.entry_block();
    let (ivs, body) = loop_nest(&mut graph, InsertPoint::BlockEnd(entry), &[2, 3]);
    let mut b = OpBuilder::at_entry_end(&mut graph);
    let rows = b.constant_int(3, DataType::I64).unwrap();
    let encoded_ty = Type::MemRef(
        MemRefType::new(
            DataType::F16,
            TensorShape::Dynamic(vec![Dim::Unknown, Dim::Known(2)]),
        )
        .with_layout(StickLayout::D2.stick_map()),
    );
    let s = b.alloc(encoded_ty, vec![rows]).unwrap();
    b.stick(dest, s, StickLayout::D2).unwrap();
    b.func_return(vec![s]).unwrap();

    let mut b = OpBuilder::before_terminator(&mut graph, body);
    let v = b.affine_load(a, ivs.clone(), AffineMap::identity(2)).unwrap();
    b.affine_store(v, dest, ivs, AffineMap::permutation(&[1, 0])).unwrap();

    LayoutChain {
        graph,
        input,
        unstick,
    }
}

/// Two decoded `1x3` rows copied into one `2x3` buffer that a single stick
/// encodes.
pub struct FanIn {
    pub graph: IrGraph,
    pub inputs: [ValueId; 2],
}

/// Row `r` of the encoded result is `unstick(inputs[r])`.
///
/// With `observed`, the second row's loaded value also feeds an opaque
/// `test.observe` op.
pub fn fan_in_chain(observed: bool) -> FanIn {
    let mut graph = IrGraph::new();
    let inputs = [(); 2].map(|_| graph.add_argument(stickified(&[1, 3], StickLayout::D2)));
    let mut b = OpBuilder::at_entry_end(&mut graph);
    let mut decoded = Vec::new();
    for input in inputs {
        let a = b.alloc(Type::memref(DataType::F32, &[1, 3]), vec![]).unwrap();
        b.unstick(input, a, StickLayout::D2).unwrap();
        decoded.push(a);
    }
    let dest = b.alloc(Type::memref(DataType::F32, &[2, 3]), vec![]).unwrap();

    let entry = graph.entry_block();
    let mut loaded = Vec::new();
    for (row, &a) in decoded.iter().enumerate() {
        let (ivs, body) = loop_nest(&mut graph, InsertPoint::BlockEnd(entry), &[3]);
        let mut b = OpBuilder::before_terminator(&mut graph, body);
        let first_row = AffineMap::new(1, 0, vec![AffineExpr::constant(0), AffineExpr::dim(0)]);
        let v = b.affine_load(a, ivs.clone(), first_row).unwrap();
        let into_row =
            AffineMap::new(1, 0, vec![AffineExpr::constant(row as i64), AffineExpr::dim(0)]);
        b.affine_store(v, dest, ivs, into_row).unwrap();
        loaded.push((v, body));
    }
    if observed {
        let (v, body) = loaded[1];
        OpBuilder::before_terminator(&mut graph, body)
            .create(
                OpKind::Custom("test.observe".to_string()),
                vec![v],
                vec![],
                HashMap::new(),
            )
            .unwrap();
    }

    let mut b = OpBuilder::at_entry_end(&mut graph);
    let s = b.alloc(stickified(&[2, 3], StickLayout::D2), vec![]).unwrap();
    b.stick(dest, s, StickLayout::D2).unwrap();
    b.func_return(vec![s]).unwrap();

    FanIn { graph, inputs }
}

/// Run `graph` with `input` bound to `data` and read back the single
/// returned buffer.
pub fn run_with_buffer(graph: &IrGraph, input: ValueId, data: &[f64]) -> Vec<f64> {
    run_with_buffers(graph, &[(input, data)])
}

/// Run `graph` with each parameter bound to its data and read back the
/// single returned buffer.
pub fn run_with_buffers(graph: &IrGraph, bindings: &[(ValueId, &[f64])]) -> Vec<f64> {
    let mut interp = Interpreter::new(graph);
    for &(input, data) in bindings {
        interp.bind_buffer(input, data).unwrap();
    }
    let results = interp.run().unwrap();
    let [RuntimeValue::Buffer(out)] = &results[..] else {
        panic!("expected a single buffer result, got {:?}", results);
    };
    interp.read_buffer(out).unwrap()
}

/// Handles into a counted `onnx.Loop`.
pub struct CountedLoop {
    pub graph: IrGraph,
    pub loop_op: OpId,
    pub body: BlockId,
}

/// `for (i = lb; i < ub; i += step)` returning the final counter.
///
/// With `dynamic_upper`, the upper bound is a function parameter instead of a
/// constant.
pub fn counted_loop(
    lb: i64,
    ub: i64,
    step: i64,
    max: i64,
    dynamic_upper: bool,
) -> (CountedLoop, Option<ValueId>) {
    let mut graph = IrGraph::new();
    let param = dynamic_upper.then(|| graph.add_argument(Type::scalar_tensor(DataType::I64)));
    let mut b = OpBuilder::at_entry_end(&mut graph);
    let max = b.constant_int(max, DataType::I64).unwrap();
    let cond = b
        .constant(TensorValue::new(TensorData::Bool(vec![true]), vec![], DataType::Bool))
        .unwrap();
    let ub = match param {
        Some(p) => p,
        None => b.constant_int(ub, DataType::I64).unwrap(),
    };
    let lb = b.constant_int(lb, DataType::I64).unwrap();
    let i64_scalar = Type::scalar_tensor(DataType::I64);
    let (loop_op, body) = b
        .onnx_loop(max, cond, vec![ub, lb], vec![i64_scalar.clone(), i64_scalar])
        .unwrap();
    let out = b.graph().op(loop_op).unwrap().results()[1];
    b.func_return(vec![out]).unwrap();

    let args = graph.block_args(body).unwrap().to_vec();
    let mut b = OpBuilder::new(&mut graph, InsertPoint::BlockEnd(body));
    let step = b.constant_int(step, DataType::I64).unwrap();
    let next = b.add(args[3], step).unwrap();
    let keep_going = b.less(next, args[2]).unwrap();
    b.onnx_return(vec![keep_going, args[2], next]).unwrap();

    (
        CountedLoop {
            graph,
            loop_op,
            body,
        },
        param,
    )
}

/// Run a graph returning one integer.
pub fn run_int(graph: &IrGraph, bindings: &[(ValueId, i64)]) -> i64 {
    let mut interp = Interpreter::new(graph);
    for &(arg, value) in bindings {
        interp.bind(arg, RuntimeValue::Int(value));
    }
    match &interp.run().unwrap()[..] {
        [RuntimeValue::Int(v)] => *v,
        other => panic!("expected a single integer, got {:?}", other),
    }
}
