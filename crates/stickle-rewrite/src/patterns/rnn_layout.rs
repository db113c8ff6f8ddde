//! Canonicalization of batch-major recurrent layers.
//!
//! `onnx.RNN`, `onnx.GRU` and `onnx.LSTM` accept `layout = 1`, where the batch
//! axis comes first. Later lowering only handles `layout = 0`, so the layer is
//! switched to sequence-major and wrapped in transposes.

use stickle_core::{Attribute, InsertPoint, IrGraph, OpBuilder, OpId, OpKind, Result, ValueId, attr};

use crate::pattern::{RewriteCtx, RewritePattern, RewriteResult, no_match};

/// `[batch, seq, input]` to `[seq, batch, input]` and back; also swaps the
/// batch and direction axes of hidden states.
const SWAP_LEADING: [usize; 3] = [1, 0, 2];
/// Layout-1 `Y` `[batch, seq, dirs, hidden]` to layout-0 `[seq, dirs, batch, hidden]`.
const Y_TO_SEQUENCE_MAJOR: [usize; 4] = [1, 2, 0, 3];
/// Layout-0 `Y` back to layout 1.
const Y_TO_BATCH_MAJOR: [usize; 4] = [2, 0, 1, 3];

const INPUT_X: usize = 0;
const INITIAL_H: usize = 5;
const INITIAL_C: usize = 6;

/// Rewrite one recurrent layer kind from `layout = 1` to `layout = 0`.
pub struct RnnLayoutCanonicalization {
    kind: OpKind,
}

impl RnnLayoutCanonicalization {
    pub fn new(kind: OpKind) -> Self {
        Self { kind }
    }

    /// One pattern per recurrent layer kind.
    pub fn all() -> [Self; 3] {
        [OpKind::Rnn, OpKind::Gru, OpKind::Lstm].map(Self::new)
    }

    /// Operand slots holding batch-major inputs.
    fn input_slots(&self) -> &'static [usize] {
        match self.kind {
            OpKind::Lstm => &[INPUT_X, INITIAL_H, INITIAL_C],
            _ => &[INPUT_X, INITIAL_H],
        }
    }

    fn num_states(&self) -> usize {
        match self.kind {
            OpKind::Lstm => 2,
            _ => 1,
        }
    }
}

impl RewritePattern for RnnLayoutCanonicalization {
    fn name(&self) -> &str {
        match self.kind {
            OpKind::Rnn => "rnn_layout",
            OpKind::Gru => "gru_layout",
            _ => "lstm_layout",
        }
    }

    fn root(&self) -> OpKind {
        self.kind.clone()
    }

    fn match_and_rewrite(
        &self,
        graph: &mut IrGraph,
        op: OpId,
        _ctx: &mut RewriteCtx,
    ) -> Result<RewriteResult> {
        let layer = graph.op(op)?;
        if layer.int_attr(attr::LAYOUT) != Some(1) {
            return Ok(RewriteResult::NoMatch);
        }

        let inputs: Vec<(usize, ValueId)> = self
            .input_slots()
            .iter()
            .filter_map(|&slot| Some((slot, layer.operand(slot)?)))
            .filter(|&(_, v)| graph.value_type(v).is_ok_and(|t| !t.is_none()))
            .collect();
        let y = layer.result(0).filter(|&v| is_present(graph, v));
        let states: Vec<ValueId> = layer
            .results()
            .iter()
            .skip(1)
            .take(self.num_states())
            .copied()
            .filter(|&v| is_present(graph, v))
            .collect();

        if !inputs.iter().all(|&(_, v)| has_rank(graph, v, 3)) {
            return no_match(self.name(), op, "input is not rank 3");
        }
        let y_rank_ok = y.is_none_or(|v| has_rank(graph, v, 4));
        if !y_rank_ok || !states.iter().all(|&v| has_rank(graph, v, 3)) {
            return no_match(self.name(), op, "result has unexpected rank");
        }

        let mut b = OpBuilder::new(graph, InsertPoint::Before(op));
        let mut transposed = Vec::with_capacity(inputs.len());
        for &(slot, value) in &inputs {
            transposed.push((slot, b.transpose(value, &SWAP_LEADING)?));
        }
        for (slot, value) in transposed {
            graph.set_operand(op, slot, value)?;
        }
        graph.set_attribute(op, attr::LAYOUT, Attribute::Int(0))?;

        if let Some(y) = y {
            permute_type(graph, y, &Y_TO_SEQUENCE_MAJOR)?;
        }
        for &state in &states {
            permute_type(graph, state, &SWAP_LEADING)?;
        }

        let mut restored = Vec::new();
        let mut b = OpBuilder::new(graph, InsertPoint::After(op));
        if let Some(y) = y {
            restored.push((y, b.transpose(y, &Y_TO_BATCH_MAJOR)?));
        }
        for &state in &states {
            restored.push((state, b.transpose(state, &SWAP_LEADING)?));
        }
        for (original, batch_major) in restored {
            let transpose = graph.defining_op(batch_major).ok_or_else(|| {
                stickle_core::Error::InvalidGraph("Transpose without defining op".to_string())
            })?;
            graph.replace_all_uses_except(original, batch_major, transpose)?;
        }

        tracing::debug!(layer = ?op, kind = %self.kind, "switched to sequence-major layout");
        Ok(RewriteResult::Applied)
    }
}

fn is_present(graph: &IrGraph, value: ValueId) -> bool {
    graph.value_type(value).is_ok_and(|t| !t.is_none())
}

/// Unknown ranks are accepted.
fn has_rank(graph: &IrGraph, value: ValueId, rank: usize) -> bool {
    graph
        .value_type(value)
        .ok()
        .and_then(|t| t.shape())
        .and_then(|s| s.ndim())
        .is_none_or(|n| n == rank)
}

fn permute_type(graph: &mut IrGraph, value: ValueId, perm: &[usize]) -> Result<()> {
    let ty = graph.value_type(value)?;
    let Some(shape) = ty.shape() else {
        return Ok(());
    };
    let ty = ty.with_shape(shape.permuted(perm)?);
    graph.set_value_type(value, ty)
}
