//! Reference interpreter for operation graphs.
//!
//! Executes a function body on concrete data so that a graph can be compared
//! against its rewritten form. Execution is sequential: `async.execute`
//! bodies run to completion at their launch point.
//!
//! # Memory model
//!
//! Every allocation gets a storage cell keyed by *physical* index: the result
//! of the buffer's layout map, or the row-major linear index for the default
//! layout. Views share the storage of their source. Deallocated storage stays
//! around so that later accesses are reported as use-after-free.

use std::collections::HashMap;

use crate::affine::AffineMap;
use crate::ir::{BlockId, IrGraph, OpId, RegionId, ValueId};
use crate::layout::{NCHW_TO_NHWC, StickLayout};
use crate::op::{OpKind, Operation, attr};
use crate::types::{DataType, MemRefType, TensorData, Type};
use crate::{Error, Result};

/// Handle to (a view of) an allocated storage cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    storage: usize,
    shape: Vec<usize>,
    layout: Option<AffineMap>,
}

impl Buffer {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    Buffer(Buffer),
    Int(i64),
    Float(f64),
    Bool(bool),
    Token,
    Async(Vec<RuntimeValue>),
    None,
}

impl RuntimeValue {
    fn as_int(&self) -> Result<i64> {
        match self {
            RuntimeValue::Int(v) => Ok(*v),
            RuntimeValue::Bool(b) => Ok(i64::from(*b)),
            other => Err(Error::Evaluation(format!("Expected integer, got {:?}", other))),
        }
    }

    fn as_float(&self) -> Result<f64> {
        match self {
            RuntimeValue::Float(v) => Ok(*v),
            other => Err(Error::Evaluation(format!("Expected float, got {:?}", other))),
        }
    }

    fn as_bool(&self) -> Result<bool> {
        match self {
            RuntimeValue::Bool(b) => Ok(*b),
            RuntimeValue::Int(v) => Ok(*v != 0),
            other => Err(Error::Evaluation(format!("Expected boolean, got {:?}", other))),
        }
    }

    fn as_buffer(&self) -> Result<&Buffer> {
        match self {
            RuntimeValue::Buffer(b) => Ok(b),
            other => Err(Error::Evaluation(format!("Expected buffer, got {:?}", other))),
        }
    }
}

#[derive(Debug, Default)]
struct Storage {
    cells: HashMap<Vec<i64>, f64>,
    freed: bool,
}

/// Interpreter state for one execution of a graph.
pub struct Interpreter<'g> {
    graph: &'g IrGraph,
    memory: Vec<Storage>,
    env: HashMap<ValueId, RuntimeValue>,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g IrGraph) -> Self {
        Self {
            graph,
            memory: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Bind a function parameter to a value.
    pub fn bind(&mut self, arg: ValueId, value: RuntimeValue) {
        self.env.insert(arg, value);
    }

    /// Bind a buffer parameter to row-major logical data.
    ///
    /// The data is written through the parameter's layout, so a stickified
    /// parameter can be fed with plain logical values.
    pub fn bind_buffer(&mut self, arg: ValueId, data: &[f64]) -> Result<Buffer> {
        let ty = memref_type(self.graph.value_type(arg)?)?;
        let buffer = self.allocate(ty, &[])?;
        if data.len() != buffer.num_elements() {
            return Err(Error::Shape(format!(
                "Binding {} elements to a buffer of shape {:?}",
                data.len(),
                buffer.shape
            )));
        }
        for (linear, index) in logical_indices(&buffer.shape).enumerate() {
            self.write(&buffer, &index, data[linear])?;
        }
        self.bind(arg, RuntimeValue::Buffer(buffer.clone()));
        Ok(buffer)
    }

    /// Read a buffer as row-major logical data.
    pub fn read_buffer(&self, buffer: &Buffer) -> Result<Vec<f64>> {
        logical_indices(&buffer.shape)
            .map(|index| self.read(buffer, &index))
            .collect()
    }

    /// Check if the storage behind a buffer has been deallocated.
    pub fn is_freed(&self, buffer: &Buffer) -> bool {
        self.memory
            .get(buffer.storage)
            .is_some_and(|s| s.freed)
    }

    /// Run the function body and return the operands of `func.return`.
    ///
    /// # Errors
    ///
    /// Fails on unbound parameters, unsupported operations, out-of-bounds or
    /// uninitialized reads, and any access to deallocated storage.
    pub fn run(&mut self) -> Result<Vec<RuntimeValue>> {
        for &arg in self.graph.arguments() {
            if !self.env.contains_key(&arg) {
                return Err(Error::Evaluation(format!("Parameter {:?} is not bound", arg)));
            }
        }
        let entry = self.graph.entry_block();
        Ok(self.run_block(entry)?.unwrap_or_default())
    }

    fn run_block(&mut self, block: BlockId) -> Result<Option<Vec<RuntimeValue>>> {
        let graph = self.graph;
        for &id in graph.block_ops(block)? {
            let op = graph.op(id)?;
            if op.kind.is_terminator() {
                let values = self.operands(op)?;
                return Ok(Some(values));
            }
            self.step(id, op)?;
        }
        Ok(None)
    }

    fn step(&mut self, id: OpId, op: &Operation) -> Result<()> {
        let results = match &op.kind {
            OpKind::Alloc => {
                let ty = memref_type(self.result_type(op, 0)?)?;
                let sizes = self
                    .operands(op)?
                    .iter()
                    .map(|v| v.as_int())
                    .collect::<Result<Vec<_>>>()?;
                vec![RuntimeValue::Buffer(self.allocate(ty, &sizes)?)]
            }
            OpKind::Dealloc => {
                let buffer = self.operand(op, 0)?.as_buffer()?.clone();
                tracing::trace!(storage = buffer.storage, "dealloc");
                let storage = self.storage_mut(&buffer)?;
                storage.freed = true;
                vec![]
            }
            OpKind::View => {
                let source = self.operand(op, 0)?.as_buffer()?.clone();
                self.storage(&source)?;
                let ty = memref_type(self.result_type(op, 0)?)?;
                let shape = static_shape(ty)?;
                if shape.iter().product::<usize>() != source.num_elements() {
                    return Err(Error::Shape(format!(
                        "View of {:?} as {:?} changes the element count",
                        source.shape, shape
                    )));
                }
                vec![RuntimeValue::Buffer(Buffer {
                    storage: source.storage,
                    shape,
                    layout: ty.layout.clone(),
                })]
            }
            OpKind::Stick | OpKind::Unstick => {
                self.convert_layout(op)?;
                vec![]
            }
            OpKind::Convert => vec![self.operand(op, 0)?],
            OpKind::AffineFor => {
                self.run_affine_for(op)?;
                vec![]
            }
            OpKind::AffineLoad => {
                let buffer = self.operand(op, 0)?.as_buffer()?.clone();
                let index = self.access_index(op, 1)?;
                vec![RuntimeValue::Float(self.read(&buffer, &index)?)]
            }
            OpKind::AffineStore => {
                let value = self.operand(op, 0)?.as_float()?;
                let buffer = self.operand(op, 1)?.as_buffer()?.clone();
                let index = self.access_index(op, 2)?;
                self.write(&buffer, &index, value)?;
                vec![]
            }
            OpKind::Constant => vec![eval_constant(op)?],
            OpKind::Add | OpKind::Sub | OpKind::Div | OpKind::Min | OpKind::Less => {
                let lhs = self.operand(op, 0)?;
                let rhs = self.operand(op, 1)?;
                vec![eval_binary(&op.kind, lhs, rhs)?]
            }
            OpKind::Ceil => vec![RuntimeValue::Float(self.operand(op, 0)?.as_float()?.ceil())],
            OpKind::Cast => {
                let target = self
                    .result_type(op, 0)?
                    .element_type()
                    .ok_or_else(|| Error::Evaluation("Cast to an untyped result".to_string()))?;
                vec![eval_cast(self.operand(op, 0)?, target)?]
            }
            OpKind::Loop => self.run_onnx_loop(op)?,
            OpKind::Execute => {
                let region = single_region(op)?;
                let body = first_block(self.graph, region)?;
                let yielded = self.run_block(body)?.unwrap_or_default();
                let mut results = vec![RuntimeValue::Token];
                results.extend(yielded.into_iter().map(|v| RuntimeValue::Async(vec![v])));
                results
            }
            OpKind::Await => match self.operand(op, 0)? {
                RuntimeValue::Async(mut values) if values.len() == 1 => {
                    values.pop().into_iter().collect()
                }
                RuntimeValue::Token => vec![],
                other => {
                    return Err(Error::Evaluation(format!("Cannot await {:?}", other)));
                }
            },
            other => {
                return Err(Error::Unsupported(format!(
                    "Interpreting {} ({:?})",
                    other, id
                )));
            }
        };

        if results.len() != op.results().len() {
            return Err(Error::Evaluation(format!(
                "{} produced {} values for {} results",
                op.kind,
                results.len(),
                op.results().len()
            )));
        }
        for (&result, value) in op.results().iter().zip(results) {
            self.env.insert(result, value);
        }
        Ok(())
    }

    // ── Layout conversion ──

    fn convert_layout(&mut self, op: &Operation) -> Result<()> {
        let layout = op
            .layout()
            .ok_or_else(|| Error::Attribute(format!("{} without layout", op.kind)))?;
        let x = self.operand(op, 0)?.as_buffer()?.clone();
        let out = self.operand(op, 1)?.as_buffer()?.clone();
        let encode = op.kind == OpKind::Stick;
        // Walk the default-layout side; the accelerator side is NHWC for NCHW.
        let plain = if encode { &x } else { &out };
        for index in logical_indices(&plain.shape) {
            let accel_index = accelerator_index(layout, &index);
            let (src_index, dst_index) = if encode {
                (&index, &accel_index)
            } else {
                (&accel_index, &index)
            };
            if let Some(value) = self.try_read(&x, src_index)? {
                self.write(&out, dst_index, value)?;
            }
        }
        Ok(())
    }

    // ── Loops ──

    fn run_affine_for(&mut self, op: &Operation) -> Result<()> {
        let lb = required_int(op, attr::LOWER_BOUND)?;
        let ub = required_int(op, attr::UPPER_BOUND)?;
        let step = required_int(op, attr::STEP)?;
        if step <= 0 {
            return Err(Error::Evaluation(format!("affine.for with step {}", step)));
        }
        let body = first_block(self.graph, single_region(op)?)?;
        let iv = *self
            .graph
            .block_args(body)?
            .first()
            .ok_or_else(|| {
                Error::InvalidGraph("affine.for body without induction variable".to_string())
            })?;
        let mut i = lb;
        while i < ub {
            self.env.insert(iv, RuntimeValue::Int(i));
            self.run_block(body)?;
            i += step;
        }
        Ok(())
    }

    /// `for i in 0..M while cond`, carrying `v...` through the body.
    fn run_onnx_loop(&mut self, op: &Operation) -> Result<Vec<RuntimeValue>> {
        let operands = self.operands(op)?;
        if operands.len() < 2 {
            return Err(Error::InvalidGraph(format!(
                "onnx.Loop with {} operands",
                operands.len()
            )));
        }
        let max_trip = match &operands[0] {
            RuntimeValue::None => i64::MAX,
            other => other.as_int()?,
        };
        let mut cond = match &operands[1] {
            RuntimeValue::None => true,
            other => other.as_bool()?,
        };
        let mut carried = operands[2..].to_vec();
        if op.results().len() != carried.len() {
            return Err(Error::Unsupported("onnx.Loop with scan outputs".to_string()));
        }

        let body = first_block(self.graph, single_region(op)?)?;
        let args = self.graph.block_args(body)?.to_vec();
        if args.len() != operands.len() {
            return Err(Error::InvalidGraph(format!(
                "onnx.Loop body takes {} arguments for {} operands",
                args.len(),
                operands.len()
            )));
        }
        let mut i = 0;
        while i < max_trip && cond {
            self.env.insert(args[0], RuntimeValue::Int(i));
            self.env.insert(args[1], RuntimeValue::Bool(cond));
            for (&arg, value) in args[2..].iter().zip(&carried) {
                self.env.insert(arg, value.clone());
            }
            let next = self
                .run_block(body)?
                .ok_or_else(|| Error::Evaluation("onnx.Loop body without terminator".to_string()))?;
            if next.len() < 1 + carried.len() {
                return Err(Error::Evaluation(format!(
                    "onnx.Return yields {} values for {} carried",
                    next.len(),
                    carried.len()
                )));
            }
            cond = next[0].as_bool()?;
            carried = next[1..1 + carried.len()].to_vec();
            i += 1;
        }
        Ok(carried)
    }

    // ── Memory ──

    fn allocate(&mut self, ty: &MemRefType, dynamic_sizes: &[i64]) -> Result<Buffer> {
        let dims = ty
            .shape
            .dims()
            .ok_or_else(|| Error::Shape("Allocation of unranked buffer".to_string()))?;
        let mut sizes = dynamic_sizes.iter();
        let shape = dims
            .iter()
            .map(|d| match d.as_known() {
                Some(n) => Ok(n),
                None => sizes
                    .next()
                    .and_then(|&s| usize::try_from(s).ok())
                    .ok_or_else(|| Error::Shape("Missing or negative dynamic size".to_string())),
            })
            .collect::<Result<Vec<_>>>()?;
        self.memory.push(Storage::default());
        Ok(Buffer {
            storage: self.memory.len() - 1,
            shape,
            layout: ty.layout.clone(),
        })
    }

    fn storage(&self, buffer: &Buffer) -> Result<&Storage> {
        let storage = self
            .memory
            .get(buffer.storage)
            .ok_or_else(|| Error::Evaluation(format!("Unknown storage {}", buffer.storage)))?;
        if storage.freed {
            return Err(Error::Evaluation(format!(
                "Use after free of storage {}",
                buffer.storage
            )));
        }
        Ok(storage)
    }

    fn storage_mut(&mut self, buffer: &Buffer) -> Result<&mut Storage> {
        self.storage(buffer)?;
        self.memory
            .get_mut(buffer.storage)
            .ok_or_else(|| Error::Evaluation(format!("Unknown storage {}", buffer.storage)))
    }

    fn try_read(&self, buffer: &Buffer, index: &[i64]) -> Result<Option<f64>> {
        let address = physical_address(buffer, index)?;
        Ok(self.storage(buffer)?.cells.get(&address).copied())
    }

    fn read(&self, buffer: &Buffer, index: &[i64]) -> Result<f64> {
        self.try_read(buffer, index)?.ok_or_else(|| {
            Error::Evaluation(format!(
                "Read of uninitialized element {:?} of storage {}",
                index, buffer.storage
            ))
        })
    }

    fn write(&mut self, buffer: &Buffer, index: &[i64], value: f64) -> Result<()> {
        let address = physical_address(buffer, index)?;
        self.storage_mut(buffer)?.cells.insert(address, value);
        Ok(())
    }

    // ── Operand access ──

    fn operand(&self, op: &Operation, index: usize) -> Result<RuntimeValue> {
        let value = op
            .operand(index)
            .ok_or_else(|| Error::Evaluation(format!("{} has no operand {}", op.kind, index)))?;
        self.lookup(value)
    }

    fn operands(&self, op: &Operation) -> Result<Vec<RuntimeValue>> {
        op.operands().iter().map(|&v| self.lookup(v)).collect()
    }

    fn lookup(&self, value: ValueId) -> Result<RuntimeValue> {
        if matches!(self.graph.value_type(value)?, Type::None) {
            return Ok(RuntimeValue::None);
        }
        self.env
            .get(&value)
            .cloned()
            .ok_or_else(|| Error::Evaluation(format!("Value {:?} has not been computed", value)))
    }

    fn result_type(&self, op: &Operation, index: usize) -> Result<&'g Type> {
        let value = op
            .result(index)
            .ok_or_else(|| Error::Evaluation(format!("{} has no result {}", op.kind, index)))?;
        self.graph.value_type(value)
    }

    /// Evaluate the map of a load/store on the index operands from `first`.
    fn access_index(&self, op: &Operation, first: usize) -> Result<Vec<i64>> {
        let map = op
            .affine_map()
            .ok_or_else(|| Error::Attribute(format!("{} without map", op.kind)))?;
        let operands = op.operands().get(first..).unwrap_or(&[]);
        let values = operands
            .iter()
            .map(|&v| self.lookup(v)?.as_int())
            .collect::<Result<Vec<_>>>()?;
        let (dims, symbols) = values.split_at(map.num_dims().min(values.len()));
        map.eval(dims, symbols)
    }
}

/// Index of the accelerator-side element holding logical `index`.
fn accelerator_index(layout: StickLayout, index: &[i64]) -> Vec<i64> {
    if layout.is_permuting() && index.len() == NCHW_TO_NHWC.len() {
        NCHW_TO_NHWC.iter().map(|&p| index[p]).collect()
    } else {
        index.to_vec()
    }
}

fn physical_address(buffer: &Buffer, index: &[i64]) -> Result<Vec<i64>> {
    if index.len() != buffer.shape.len() {
        return Err(Error::Evaluation(format!(
            "Index {:?} has wrong rank for shape {:?}",
            index, buffer.shape
        )));
    }
    for (&i, &d) in index.iter().zip(&buffer.shape) {
        if i < 0 || i as usize >= d {
            return Err(Error::Evaluation(format!(
                "Index {:?} out of bounds for shape {:?}",
                index, buffer.shape
            )));
        }
    }
    match &buffer.layout {
        Some(map) => map.eval(index, &[]),
        None => {
            let linear = index
                .iter()
                .zip(&buffer.shape)
                .fold(0i64, |acc, (&i, &d)| acc * d as i64 + i);
            Ok(vec![linear])
        }
    }
}

/// Row-major iteration over all indices of a shape.
fn logical_indices(shape: &[usize]) -> impl Iterator<Item = Vec<i64>> + '_ {
    let total: usize = shape.iter().product();
    (0..total).map(move |mut linear| {
        let mut index = vec![0i64; shape.len()];
        for (slot, &d) in index.iter_mut().zip(shape).rev() {
            *slot = (linear % d) as i64;
            linear /= d;
        }
        index
    })
}

fn memref_type(ty: &Type) -> Result<&MemRefType> {
    ty.as_memref()
        .ok_or_else(|| Error::Evaluation(format!("Expected buffer type, got {}", ty)))
}

fn static_shape(ty: &MemRefType) -> Result<Vec<usize>> {
    ty.shape
        .as_static()
        .map(<[usize]>::to_vec)
        .ok_or_else(|| Error::Unsupported(format!("Dynamic view shape {}", ty.shape)))
}

fn single_region(op: &Operation) -> Result<RegionId> {
    op.regions()
        .first()
        .copied()
        .ok_or_else(|| Error::InvalidGraph(format!("{} has no region", op.kind)))
}

fn first_block(graph: &IrGraph, region: RegionId) -> Result<BlockId> {
    graph
        .region(region)?
        .blocks()
        .first()
        .copied()
        .ok_or_else(|| Error::InvalidGraph(format!("Region {:?} has no block", region)))
}

fn required_int(op: &Operation, key: &str) -> Result<i64> {
    op.int_attr(key)
        .ok_or_else(|| Error::Attribute(format!("{} is missing '{}'", op.kind, key)))
}

fn eval_constant(op: &Operation) -> Result<RuntimeValue> {
    let value = op
        .constant_value()
        .ok_or_else(|| Error::Attribute("onnx.Constant without value".to_string()))?;
    if value.len() != 1 {
        return Err(Error::Unsupported(format!(
            "Non-scalar constant of shape {:?}",
            value.shape
        )));
    }
    Ok(match &value.data {
        TensorData::I64(v) => RuntimeValue::Int(v[0]),
        TensorData::I32(v) => RuntimeValue::Int(i64::from(v[0])),
        TensorData::F32(v) => RuntimeValue::Float(f64::from(v[0])),
        TensorData::Bool(v) => RuntimeValue::Bool(v[0]),
    })
}

fn eval_binary(kind: &OpKind, lhs: RuntimeValue, rhs: RuntimeValue) -> Result<RuntimeValue> {
    use RuntimeValue::{Bool, Float, Int};
    let overflow = || Error::Evaluation(format!("{} overflowed", kind));
    Ok(match (kind, lhs, rhs) {
        (OpKind::Add, Int(a), Int(b)) => Int(a.checked_add(b).ok_or_else(overflow)?),
        (OpKind::Sub, Int(a), Int(b)) => Int(a.checked_sub(b).ok_or_else(overflow)?),
        (OpKind::Div, Int(a), Int(b)) => Int(a.checked_div(b).ok_or_else(overflow)?),
        (OpKind::Min, Int(a), Int(b)) => Int(a.min(b)),
        (OpKind::Less, Int(a), Int(b)) => Bool(a < b),
        (OpKind::Add, Float(a), Float(b)) => Float(a + b),
        (OpKind::Sub, Float(a), Float(b)) => Float(a - b),
        (OpKind::Div, Float(a), Float(b)) => Float(a / b),
        (OpKind::Min, Float(a), Float(b)) => Float(a.min(b)),
        (OpKind::Less, Float(a), Float(b)) => Bool(a < b),
        (kind, a, b) => {
            return Err(Error::Evaluation(format!(
                "{} on mismatched operands {:?} and {:?}",
                kind, a, b
            )));
        }
    })
}

fn eval_cast(value: RuntimeValue, target: DataType) -> Result<RuntimeValue> {
    Ok(match (value, target) {
        (RuntimeValue::Float(v), t) if t.is_float() => RuntimeValue::Float(v),
        (RuntimeValue::Float(v), t) if t.is_integer() => RuntimeValue::Int(v as i64),
        (RuntimeValue::Int(v), t) if t.is_float() => RuntimeValue::Float(v as f64),
        (RuntimeValue::Int(v), t) if t.is_integer() => RuntimeValue::Int(v),
        (RuntimeValue::Int(v), DataType::Bool) => RuntimeValue::Bool(v != 0),
        (RuntimeValue::Bool(b), t) if t.is_integer() => RuntimeValue::Int(i64::from(b)),
        (RuntimeValue::Bool(b), DataType::Bool) => RuntimeValue::Bool(b),
        (other, t) => {
            return Err(Error::Evaluation(format!("Cannot cast {:?} to {}", other, t)));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InsertPoint;
    use crate::ir_builder::OpBuilder;
    use crate::types::{TensorShape, TensorValue};

    fn stickified(shape: &[usize], layout: StickLayout) -> Type {
        Type::MemRef(
            MemRefType::new(DataType::F16, TensorShape::Static(shape.to_vec()))
                .with_layout(layout.stick_map()),
        )
    }

    #[test]
    fn test_stick_unstick_round_trip() {
        let mut graph = IrGraph::new();
        let x = graph.add_argument(Type::memref(DataType::F32, &[2, 3]));
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let s = b.alloc(stickified(&[2, 3], StickLayout::D2), vec![]).unwrap();
        b.stick(x, s, StickLayout::D2).unwrap();
        let y = b.alloc(Type::memref(DataType::F32, &[2, 3]), vec![]).unwrap();
        b.unstick(s, y, StickLayout::D2).unwrap();
        b.func_return(vec![y]).unwrap();

        let data: Vec<f64> = (0..6).map(f64::from).collect();
        let mut interp = Interpreter::new(&graph);
        interp.bind_buffer(x, &data).unwrap();
        let out = interp.run().unwrap();
        let RuntimeValue::Buffer(out) = &out[0] else {
            panic!("expected buffer");
        };
        assert_eq!(interp.read_buffer(out).unwrap(), data);
    }

    #[test]
    fn test_nchw_stick_permutes() {
        let mut graph = IrGraph::new();
        let x = graph.add_argument(Type::memref(DataType::F32, &[1, 2, 1, 3]));
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let s = b.alloc(stickified(&[1, 1, 3, 2], StickLayout::Nchw), vec![]).unwrap();
        b.stick(x, s, StickLayout::Nchw).unwrap();
        b.func_return(vec![s]).unwrap();

        // x[0, c, 0, w] = 10 * c + w
        let data = vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0];
        let mut interp = Interpreter::new(&graph);
        interp.bind_buffer(x, &data).unwrap();
        let out = interp.run().unwrap();
        let RuntimeValue::Buffer(out) = &out[0] else {
            panic!("expected buffer");
        };
        // NHWC order: s[0, 0, w, c]
        assert_eq!(
            interp.read_buffer(out).unwrap(),
            vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0]
        );
    }

    #[test]
    fn test_use_after_free_is_reported() {
        let mut graph = IrGraph::new();
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let buf = b.alloc(Type::memref(DataType::F32, &[2]), vec![]).unwrap();
        let c = b.constant_int(0, DataType::I64).unwrap();
        b.dealloc(buf).unwrap();
        let (_, iv, body) = b.affine_for(0, 2, 1).unwrap();
        b.func_return(vec![c]).unwrap();
        let mut inner = OpBuilder::before_terminator(&mut graph, body);
        inner.affine_load(buf, vec![iv], AffineMap::identity(1)).unwrap();

        let err = Interpreter::new(&graph).run().unwrap_err();
        assert!(err.to_string().contains("Use after free"));
    }

    #[test]
    fn test_onnx_loop_counts_iterations() {
        let mut graph = IrGraph::new();
        let mut b = OpBuilder::at_entry_end(&mut graph);
        let max = b.constant_int(5, DataType::I64).unwrap();
        let cond = b
            .constant(TensorValue::new(TensorData::Bool(vec![true]), vec![], DataType::Bool))
            .unwrap();
        let zero = b.constant_int(0, DataType::I64).unwrap();
        let (loop_op, body) = b
            .onnx_loop(max, cond, vec![zero], vec![Type::scalar_tensor(DataType::I64)])
            .unwrap();
        let out = b.graph().op(loop_op).unwrap().results()[0];
        b.func_return(vec![out]).unwrap();

        let args = graph.block_args(body).unwrap().to_vec();
        let mut b = OpBuilder::new(&mut graph, InsertPoint::BlockEnd(body));
        let one = b.constant_int(1, DataType::I64).unwrap();
        let next = b.add(args[2], one).unwrap();
        b.onnx_return(vec![args[1], next]).unwrap();

        let out = Interpreter::new(&graph).run().unwrap();
        assert_eq!(out, vec![RuntimeValue::Int(5)]);
    }
}
