//! End-to-end tests of loop trip-count narrowing.

mod common;

use common::*;
use stickle_core::{OpKind, Pass, verify};
use stickle_rewrite::LoopTripCountPass;
use stickle_rewrite::query::integer_constant_value;

fn max_trip_count(loop_: &CountedLoop) -> Option<i64> {
    let max = loop_.graph.op(loop_.loop_op).unwrap().operand(0).unwrap();
    integer_constant_value(&loop_.graph, max)
}

#[test]
fn test_static_bounds_narrow_and_preserve_results() {
    init_tracing();
    for (lb, ub, step, expected) in [(-100, 100, 1, 200), (0, 10, 3, 4), (5, 6, 4, 1)] {
        let (mut loop_, _) = counted_loop(lb, ub, step, i64::MAX, false);
        let before = run_int(&loop_.graph, &[]);

        assert!(LoopTripCountPass::new().run(&mut loop_.graph).unwrap());
        verify(&loop_.graph).unwrap();
        assert_eq!(max_trip_count(&loop_), Some(expected));
        assert_eq!(run_int(&loop_.graph, &[]), before);
    }
}

#[test]
fn test_dynamic_upper_bound_is_computed_at_runtime() {
    init_tracing();
    let (mut loop_, param) = counted_loop(0, 0, 3, 1_000, true);
    let param = param.unwrap();
    let before = run_int(&loop_.graph, &[(param, 10)]);
    assert_eq!(before, 12);

    assert!(LoopTripCountPass::new().run(&mut loop_.graph).unwrap());
    verify(&loop_.graph).unwrap();

    let max = loop_.graph.op(loop_.loop_op).unwrap().operand(0).unwrap();
    let min = loop_.graph.defining_op(max).unwrap();
    assert_eq!(loop_.graph.kind(min), Some(&OpKind::Min));
    assert_eq!(run_int(&loop_.graph, &[(param, 10)]), before);
    assert_eq!(run_int(&loop_.graph, &[(param, 11)]), 12);
}

#[test]
fn test_second_run_changes_nothing() {
    init_tracing();
    let (mut loop_, _) = counted_loop(0, 10, 3, i64::MAX, false);
    let pass = LoopTripCountPass::new();
    assert!(pass.run(&mut loop_.graph).unwrap());
    assert!(!pass.run(&mut loop_.graph).unwrap());
    assert_eq!(max_trip_count(&loop_), Some(4));
}
