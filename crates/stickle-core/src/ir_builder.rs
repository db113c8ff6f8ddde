//! Insertion-point builder for creating operations.

use std::collections::HashMap;

use crate::affine::AffineMap;
use crate::ir::{BlockId, InsertPoint, IrGraph, OpId, ValueId};
use crate::layout::StickLayout;
use crate::op::{Attribute, OpKind, attr};
use crate::types::{DataType, TensorShape, TensorValue, Type};
use crate::{Error, Result};

/// Creates operations at a moving insertion point.
///
/// Consecutive creations keep their program order: inserting after an op
/// advances the point past the new op, inserting before an op or at a block
/// end leaves the point where it is.
pub struct OpBuilder<'g> {
    graph: &'g mut IrGraph,
    at: InsertPoint,
}

impl<'g> OpBuilder<'g> {
    pub fn new(graph: &'g mut IrGraph, at: InsertPoint) -> Self {
        Self { graph, at }
    }

    /// Builder appending to the function body.
    pub fn at_entry_end(graph: &'g mut IrGraph) -> Self {
        let entry = graph.entry_block();
        Self::new(graph, InsertPoint::BlockEnd(entry))
    }

    /// Builder inserting before the terminator of `block`, or at its end if it
    /// has none.
    pub fn before_terminator(graph: &'g mut IrGraph, block: BlockId) -> Self {
        let at = match graph.terminator(block) {
            Some(term) => InsertPoint::Before(term),
            None => InsertPoint::BlockEnd(block),
        };
        Self::new(graph, at)
    }

    pub fn insertion_point(&self) -> InsertPoint {
        self.at
    }

    pub fn set_insertion_point(&mut self, at: InsertPoint) {
        self.at = at;
    }

    pub fn graph(&mut self) -> &mut IrGraph {
        self.graph
    }

    /// Create an operation at the insertion point.
    pub fn create(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
        attributes: HashMap<String, Attribute>,
    ) -> Result<OpId> {
        let id = self
            .graph
            .create_op(self.at, kind, operands, result_types, attributes)?;
        if matches!(self.at, InsertPoint::After(_) | InsertPoint::BlockStart(_)) {
            self.at = InsertPoint::After(id);
        }
        Ok(id)
    }

    /// Create a single-result operation and return its result.
    pub fn create_value(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_type: Type,
        attributes: HashMap<String, Attribute>,
    ) -> Result<ValueId> {
        let id = self.create(kind, operands, vec![result_type], attributes)?;
        self.result(id, 0)
    }

    fn result(&self, op: OpId, index: usize) -> Result<ValueId> {
        self.graph.op(op)?.result(index).ok_or_else(|| {
            Error::InvalidGraph(format!("Op {:?} has no result {}", op, index))
        })
    }

    // ── Memory ──

    /// `memref.alloc`, with one size operand per unknown dimension.
    pub fn alloc(&mut self, ty: Type, dynamic_sizes: Vec<ValueId>) -> Result<ValueId> {
        let memref = ty
            .as_memref()
            .ok_or_else(|| Error::InvalidGraph(format!("Cannot allocate non-buffer type {}", ty)))?;
        if memref.shape.num_dynamic_dims() != dynamic_sizes.len() {
            return Err(Error::Shape(format!(
                "Allocation of {} needs {} sizes, got {}",
                ty,
                memref.shape.num_dynamic_dims(),
                dynamic_sizes.len()
            )));
        }
        self.create_value(OpKind::Alloc, dynamic_sizes, ty, HashMap::new())
    }

    pub fn dealloc(&mut self, buffer: ValueId) -> Result<OpId> {
        self.create(OpKind::Dealloc, vec![buffer], vec![], HashMap::new())
    }

    /// `memref.view` reinterpreting `source` as `ty`.
    pub fn view(&mut self, source: ValueId, ty: Type) -> Result<ValueId> {
        self.create_value(OpKind::View, vec![source], ty, HashMap::new())
    }

    // ── Layout conversion ──

    /// Encode default-layout `x` into the accelerator buffer `out`.
    pub fn stick(&mut self, x: ValueId, out: ValueId, layout: StickLayout) -> Result<OpId> {
        self.create(OpKind::Stick, vec![x, out], vec![], layout_attr(layout))
    }

    /// Decode accelerator buffer `x` into the default-layout buffer `out`.
    pub fn unstick(&mut self, x: ValueId, out: ValueId, layout: StickLayout) -> Result<OpId> {
        self.create(OpKind::Unstick, vec![x, out], vec![], layout_attr(layout))
    }

    /// Placeholder element conversion to `ty`.
    pub fn convert(&mut self, value: ValueId, ty: Type) -> Result<ValueId> {
        self.create_value(OpKind::Convert, vec![value], ty, HashMap::new())
    }

    // ── Affine ──

    /// `affine.for %iv = lb to ub step step`, with an empty body terminated by
    /// `affine.yield`. Returns the loop op, induction variable and body block.
    pub fn affine_for(&mut self, lb: i64, ub: i64, step: i64) -> Result<(OpId, ValueId, BlockId)> {
        if step <= 0 {
            return Err(Error::Attribute(format!("affine.for step must be positive, got {}", step)));
        }
        let attributes = HashMap::from([
            (attr::LOWER_BOUND.to_string(), Attribute::Int(lb)),
            (attr::UPPER_BOUND.to_string(), Attribute::Int(ub)),
            (attr::STEP.to_string(), Attribute::Int(step)),
        ]);
        let op = self.create(OpKind::AffineFor, vec![], vec![], attributes)?;
        let region = self.graph.add_region(op)?;
        let body = self.graph.add_block(region, vec![Type::Index])?;
        self.graph.create_op(
            InsertPoint::BlockEnd(body),
            OpKind::AffineYield,
            vec![],
            vec![],
            HashMap::new(),
        )?;
        let iv = self.graph.block_args(body)?[0];
        Ok((op, iv, body))
    }

    /// `affine.load memref[map(indices)]`.
    pub fn affine_load(
        &mut self,
        memref: ValueId,
        indices: Vec<ValueId>,
        map: AffineMap,
    ) -> Result<ValueId> {
        let dtype = self
            .graph
            .value_type(memref)?
            .element_type()
            .ok_or_else(|| {
                Error::InvalidGraph(format!("affine.load from non-buffer {:?}", memref))
            })?;
        check_map_arity(&map, indices.len())?;
        let mut operands = vec![memref];
        operands.extend(indices);
        self.create_value(
            OpKind::AffineLoad,
            operands,
            Type::Scalar(dtype),
            HashMap::from([(attr::MAP.to_string(), Attribute::Map(map))]),
        )
    }

    /// `affine.store value, memref[map(indices)]`.
    pub fn affine_store(
        &mut self,
        value: ValueId,
        memref: ValueId,
        indices: Vec<ValueId>,
        map: AffineMap,
    ) -> Result<OpId> {
        check_map_arity(&map, indices.len())?;
        let mut operands = vec![value, memref];
        operands.extend(indices);
        self.create(
            OpKind::AffineStore,
            operands,
            vec![],
            HashMap::from([(attr::MAP.to_string(), Attribute::Map(map))]),
        )
    }

    // ── Tensor ops ──

    pub fn constant(&mut self, value: TensorValue) -> Result<ValueId> {
        let ty = Type::tensor(value.dtype, TensorShape::Static(value.shape.clone()));
        self.create_value(
            OpKind::Constant,
            vec![],
            ty,
            HashMap::from([(attr::VALUE.to_string(), Attribute::Dense(value))]),
        )
    }

    /// Rank-0 integer constant.
    pub fn constant_int(&mut self, value: i64, dtype: DataType) -> Result<ValueId> {
        self.constant(TensorValue::scalar_int(value, dtype)?)
    }

    /// Elementwise binary op whose result has the type of `lhs`.
    pub fn binary(&mut self, kind: OpKind, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let ty = self.graph.value_type(lhs)?.clone();
        self.create_value(kind, vec![lhs, rhs], ty, HashMap::new())
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.binary(OpKind::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.binary(OpKind::Sub, lhs, rhs)
    }

    pub fn div(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.binary(OpKind::Div, lhs, rhs)
    }

    pub fn min(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        self.binary(OpKind::Min, lhs, rhs)
    }

    /// `lhs < rhs`, producing a boolean of the same shape.
    pub fn less(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let ty = self.graph.value_type(lhs)?.with_element_type(DataType::Bool);
        self.create_value(OpKind::Less, vec![lhs, rhs], ty, HashMap::new())
    }

    pub fn ceil(&mut self, value: ValueId) -> Result<ValueId> {
        let ty = self.graph.value_type(value)?.clone();
        self.create_value(OpKind::Ceil, vec![value], ty, HashMap::new())
    }

    /// Element type cast; returns `value` unchanged if it already has `dtype`.
    pub fn cast(&mut self, value: ValueId, dtype: DataType) -> Result<ValueId> {
        let ty = self.graph.value_type(value)?;
        if ty.element_type() == Some(dtype) {
            return Ok(value);
        }
        let ty = ty.with_element_type(dtype);
        self.create_value(OpKind::Cast, vec![value], ty, HashMap::new())
    }

    /// Transpose with `out[i] = in[perm[i]]` dimensions.
    pub fn transpose(&mut self, value: ValueId, perm: &[usize]) -> Result<ValueId> {
        let ty = self.graph.value_type(value)?;
        let shape = ty
            .shape()
            .ok_or_else(|| Error::Shape(format!("Cannot transpose unshaped type {}", ty)))?
            .permuted(perm)?;
        let ty = ty.with_shape(shape);
        let perm = perm.iter().map(|&p| p as i64).collect();
        self.create_value(
            OpKind::Transpose,
            vec![value],
            ty,
            HashMap::from([(attr::PERM.to_string(), Attribute::Ints(perm))]),
        )
    }

    // ── Control flow ──

    /// `onnx.Loop(max_trip_count, cond, initial...)` with an empty body whose
    /// arguments are `(iter, cond, v...)`. Results take `result_types`.
    pub fn onnx_loop(
        &mut self,
        max_trip_count: ValueId,
        cond: ValueId,
        initial: Vec<ValueId>,
        result_types: Vec<Type>,
    ) -> Result<(OpId, BlockId)> {
        let mut arg_types = vec![
            Type::scalar_tensor(DataType::I64),
            Type::scalar_tensor(DataType::Bool),
        ];
        for &v in &initial {
            arg_types.push(self.graph.value_type(v)?.clone());
        }
        let mut operands = vec![max_trip_count, cond];
        operands.extend(initial);
        let op = self.create(OpKind::Loop, operands, result_types, HashMap::new())?;
        let region = self.graph.add_region(op)?;
        let body = self.graph.add_block(region, arg_types)?;
        Ok((op, body))
    }

    /// Terminator of a generic loop body: `(cond, v_next..., scans...)`.
    pub fn onnx_return(&mut self, operands: Vec<ValueId>) -> Result<OpId> {
        self.create(OpKind::OnnxReturn, operands, vec![], HashMap::new())
    }

    /// `async.execute` producing a token plus one async value per type.
    /// Returns the op, the async values and the (empty) body block.
    pub fn execute(&mut self, result_types: Vec<Type>) -> Result<(OpId, Vec<ValueId>, BlockId)> {
        let mut types = vec![Type::Token];
        types.extend(result_types.into_iter().map(|t| Type::Async(Box::new(t))));
        let op = self.create(OpKind::Execute, vec![], types, HashMap::new())?;
        let region = self.graph.add_region(op)?;
        let body = self.graph.add_block(region, vec![])?;
        let values = self.graph.op(op)?.results()[1..].to_vec();
        Ok((op, values, body))
    }

    pub fn async_yield(&mut self, values: Vec<ValueId>) -> Result<OpId> {
        self.create(OpKind::Yield, values, vec![], HashMap::new())
    }

    /// `async.await` unwrapping an async value.
    pub fn await_value(&mut self, value: ValueId) -> Result<ValueId> {
        let ty = match self.graph.value_type(value)? {
            Type::Async(inner) => (**inner).clone(),
            other => {
                return Err(Error::InvalidGraph(format!("Cannot await value of type {}", other)));
            }
        };
        self.create_value(OpKind::Await, vec![value], ty, HashMap::new())
    }

    pub fn func_return(&mut self, values: Vec<ValueId>) -> Result<OpId> {
        self.create(OpKind::Return, values, vec![], HashMap::new())
    }
}

fn layout_attr(layout: StickLayout) -> HashMap<String, Attribute> {
    HashMap::from([(attr::LAYOUT.to_string(), Attribute::Layout(layout))])
}

fn check_map_arity(map: &AffineMap, num_indices: usize) -> Result<()> {
    if map.num_dims() + map.num_symbols() != num_indices {
        return Err(Error::Attribute(format!(
            "Map {} expects {} operands, got {}",
            map,
            map.num_dims() + map.num_symbols(),
            num_indices
        )));
    }
    Ok(())
}
