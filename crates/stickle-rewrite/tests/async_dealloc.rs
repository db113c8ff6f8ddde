//! Randomized deallocation-safety tests around `async.execute` regions.

mod common;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stickle_core::{
    AffineMap, DataType, InsertPoint, Interpreter, IrGraph, OpBuilder, OpKind, TensorValue, Type,
    ValueId, verify,
};
use stickle_rewrite::{RewriteConfig, RewritePipeline};

const LEN: usize = 4;

/// Region copying random inputs into a yielded buffer, followed by random
/// readers of the result and of the inputs. Returns the graph and the
/// buffers that must end up freed.
fn random_launch(rng: &mut StdRng) -> (IrGraph, Vec<ValueId>) {
    let mut graph = IrGraph::new();
    let ty = Type::memref(DataType::F32, &[LEN]);
    let num_inputs = rng.gen_range(1..=3);

    let mut b = OpBuilder::at_entry_end(&mut graph);
    let inputs: Vec<ValueId> = (0..num_inputs)
        .map(|_| b.alloc(ty.clone(), vec![]).unwrap())
        .collect();
    let fill = b.constant(TensorValue::scalar_f32(1.5)).unwrap();
    for &input in &inputs {
        let (_, i, body) = b.affine_for(0, LEN as i64, 1).unwrap();
        let mut inner = OpBuilder::before_terminator(b.graph(), body);
        inner
            .affine_store(fill, input, vec![i], AffineMap::identity(1))
            .unwrap();
    }
    let (_, values, region) = b.execute(vec![ty.clone()]).unwrap();
    let awaited = b.await_value(values[0]).unwrap();

    let mut readers = Vec::new();
    for _ in 0..rng.gen_range(0..=2) {
        readers.push(awaited);
    }
    for &input in &inputs {
        if rng.gen_bool(0.5) {
            readers.push(input);
        }
    }
    // Readers copy into a returned sink so that their loads stay alive.
    let sink = b.alloc(ty.clone(), vec![]).unwrap();
    for buffer in readers {
        let (_, i, body) = b.affine_for(0, LEN as i64, 1).unwrap();
        let mut inner = OpBuilder::before_terminator(b.graph(), body);
        let v = inner
            .affine_load(buffer, vec![i], AffineMap::identity(1))
            .unwrap();
        inner
            .affine_store(v, sink, vec![i], AffineMap::identity(1))
            .unwrap();
    }
    b.func_return(vec![sink]).unwrap();

    let mut b = OpBuilder::new(&mut graph, InsertPoint::BlockEnd(region));
    let out = b.alloc(ty, vec![]).unwrap();
    for &input in &inputs {
        let (_, j, body) = b.affine_for(0, LEN as i64, 1).unwrap();
        let mut inner = OpBuilder::before_terminator(b.graph(), body);
        let v = inner
            .affine_load(input, vec![j], AffineMap::identity(1))
            .unwrap();
        inner
            .affine_store(v, out, vec![j], AffineMap::identity(1))
            .unwrap();
    }
    b.async_yield(vec![out]).unwrap();

    let mut buffers = inputs;
    buffers.push(out);
    (graph, buffers)
}

fn dealloc_count(graph: &IrGraph, buffer: ValueId) -> usize {
    graph
        .users(buffer)
        .into_iter()
        .filter(|&u| graph.kind(u) == Some(&OpKind::Dealloc))
        .count()
}

#[test]
fn test_inserted_deallocs_are_safe() {
    init_tracing();
    let config = RewriteConfig {
        async_dealloc: true,
        ..RewriteConfig::default()
    };

    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (mut graph, buffers) = random_launch(&mut rng);
        Interpreter::new(&graph).run().unwrap();

        RewritePipeline::new(config.clone()).run(&mut graph).unwrap();
        verify(&graph).unwrap();

        for &buffer in &buffers {
            assert_eq!(dealloc_count(&graph, buffer), 1, "seed {}", seed);
        }
        // Every access happens before the matching dealloc.
        if let Err(e) = Interpreter::new(&graph).run() {
            panic!("seed {}: {}", seed, e);
        }
    }
}

#[test]
fn test_disabled_by_default() {
    init_tracing();
    let mut rng = StdRng::seed_from_u64(7);
    let (mut graph, _) = random_launch(&mut rng);
    RewritePipeline::new(RewriteConfig::default())
        .run(&mut graph)
        .unwrap();
    assert_eq!(count_kind(&graph, &OpKind::Dealloc), 0);
}
