//! Operation kinds, attributes and the operation node stored in the graph.

use std::collections::HashMap;
use std::fmt;

use crate::affine::AffineMap;
use crate::ir::{BlockId, RegionId, ValueId};
use crate::layout::StickLayout;
use crate::types::TensorValue;

/// Well-known attribute keys.
pub mod attr {
    /// Layout tag of stick/unstick ops; layout flag (0 or 1) of RNN ops.
    pub const LAYOUT: &str = "layout";
    /// Index map of affine loads and stores.
    pub const MAP: &str = "map";
    /// Dense payload of constants.
    pub const VALUE: &str = "value";
    /// Permutation of transposes.
    pub const PERM: &str = "perm";
    /// Constant bounds of `affine.for`.
    pub const LOWER_BOUND: &str = "lower_bound";
    pub const UPPER_BOUND: &str = "upper_bound";
    pub const STEP: &str = "step";
}

/// The closed set of operation kinds the rewrite layer understands.
///
/// Anything else is carried as `Custom` and treated as an opaque op with
/// unknown side effects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Function terminator.
    Return,

    Alloc,
    Dealloc,
    /// Reinterpretation of operand 0 with the result type; no copy.
    View,

    /// Loop with constant bounds and a single-block body taking the induction
    /// variable.
    AffineFor,
    /// `result = memref[map(indices)]`, operands `(memref, indices...)`.
    AffineLoad,
    /// `memref[map(indices)] = value`, operands `(value, memref, indices...)`.
    AffineStore,
    AffineYield,

    /// Encode: operands `(X, Out)`, writes default-layout `X` into the
    /// accelerator buffer `Out`.
    Stick,
    /// Decode: operands `(X, Out)`, writes accelerator buffer `X` into the
    /// default-layout buffer `Out`.
    Unstick,
    /// Placeholder element conversion between the accelerator and host
    /// element types. Value preserving.
    Convert,

    Constant,
    Add,
    Sub,
    Div,
    Ceil,
    Min,
    Less,
    Cast,
    Transpose,
    /// Generic loop: operands `(maxTripCount, cond, v_initial...)`.
    Loop,
    /// Terminator of a generic loop body: `(cond, v_next..., scans...)`.
    OnnxReturn,
    Rnn,
    Gru,
    Lstm,

    /// Concurrently scheduled region; results `(token, values...)`.
    Execute,
    /// Terminator of an execute body.
    Yield,
    /// Join point: unwraps an async value produced by an execute.
    Await,

    Custom(String),
}

impl OpKind {
    /// Dialect-qualified name used by the printer and in log messages.
    pub fn name(&self) -> &str {
        match self {
            OpKind::Return => "func.return",
            OpKind::Alloc => "memref.alloc",
            OpKind::Dealloc => "memref.dealloc",
            OpKind::View => "memref.view",
            OpKind::AffineFor => "affine.for",
            OpKind::AffineLoad => "affine.load",
            OpKind::AffineStore => "affine.store",
            OpKind::AffineYield => "affine.yield",
            OpKind::Stick => "zlow.stick",
            OpKind::Unstick => "zlow.unstick",
            OpKind::Convert => "zlow.dummy",
            OpKind::Constant => "onnx.Constant",
            OpKind::Add => "onnx.Add",
            OpKind::Sub => "onnx.Sub",
            OpKind::Div => "onnx.Div",
            OpKind::Ceil => "onnx.Ceil",
            OpKind::Min => "onnx.Min",
            OpKind::Less => "onnx.Less",
            OpKind::Cast => "onnx.Cast",
            OpKind::Transpose => "onnx.Transpose",
            OpKind::Loop => "onnx.Loop",
            OpKind::OnnxReturn => "onnx.Return",
            OpKind::Rnn => "onnx.RNN",
            OpKind::Gru => "onnx.GRU",
            OpKind::Lstm => "onnx.LSTM",
            OpKind::Execute => "async.execute",
            OpKind::Yield => "async.yield",
            OpKind::Await => "async.await",
            OpKind::Custom(name) => name,
        }
    }

    /// Check if this kind ends a block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            OpKind::Return | OpKind::AffineYield | OpKind::OnnxReturn | OpKind::Yield
        )
    }

    /// Check if an op of this kind can be dropped once its results are unused.
    ///
    /// Covers value-semantic ops, read-only accesses and allocations.
    pub fn is_removable_when_dead(&self) -> bool {
        matches!(
            self,
            OpKind::Alloc
                | OpKind::View
                | OpKind::AffineLoad
                | OpKind::Convert
                | OpKind::Constant
                | OpKind::Add
                | OpKind::Sub
                | OpKind::Div
                | OpKind::Ceil
                | OpKind::Min
                | OpKind::Less
                | OpKind::Cast
                | OpKind::Transpose
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attribute value attached to an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Int(i64),
    Ints(Vec<i64>),
    Float(f64),
    String(String),
    Layout(StickLayout),
    Map(AffineMap),
    Dense(TensorValue),
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Int(v) => write!(f, "{}", v),
            Attribute::Ints(v) => write!(f, "{:?}", v),
            Attribute::Float(v) => write!(f, "{}", v),
            Attribute::String(s) => write!(f, "\"{}\"", s),
            Attribute::Layout(l) => write!(f, "\"{}\"", l),
            Attribute::Map(m) => write!(f, "affine_map<{}>", m),
            Attribute::Dense(v) => write!(f, "dense<{:?}>", v.data),
        }
    }
}

/// An operation node.
///
/// Operand, result and placement fields are maintained by `IrGraph` so that
/// use lists stay consistent; they are read-only from outside the crate.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Operation kind.
    pub kind: OpKind,

    /// Operation attributes (layout tag, index map, constant payload, ...).
    pub attributes: HashMap<String, Attribute>,

    pub(crate) operands: Vec<ValueId>,
    pub(crate) results: Vec<ValueId>,
    pub(crate) regions: Vec<RegionId>,
    pub(crate) block: Option<BlockId>,
}

impl Operation {
    pub(crate) fn new(kind: OpKind, attributes: HashMap<String, Attribute>) -> Self {
        Self {
            kind,
            attributes,
            operands: Vec::new(),
            results: Vec::new(),
            regions: Vec::new(),
            block: None,
        }
    }

    pub fn operands(&self) -> &[ValueId] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> Option<ValueId> {
        self.operands.get(index).copied()
    }

    pub fn results(&self) -> &[ValueId] {
        &self.results
    }

    pub fn result(&self, index: usize) -> Option<ValueId> {
        self.results.get(index).copied()
    }

    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }

    /// Block containing this operation.
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    pub fn is(&self, kind: &OpKind) -> bool {
        self.kind == *kind
    }

    /// Get an attribute.
    pub fn attribute(&self, key: &str) -> Option<&Attribute> {
        self.attributes.get(key)
    }

    /// Layout tag of a stick/unstick.
    pub fn layout(&self) -> Option<StickLayout> {
        match self.attributes.get(attr::LAYOUT) {
            Some(Attribute::Layout(layout)) => Some(*layout),
            _ => None,
        }
    }

    /// Index map of an affine load/store.
    pub fn affine_map(&self) -> Option<&AffineMap> {
        match self.attributes.get(attr::MAP) {
            Some(Attribute::Map(map)) => Some(map),
            _ => None,
        }
    }

    pub fn int_attr(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(Attribute::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn ints_attr(&self, key: &str) -> Option<&[i64]> {
        match self.attributes.get(key) {
            Some(Attribute::Ints(v)) => Some(v),
            _ => None,
        }
    }

    /// Dense payload of a constant.
    pub fn constant_value(&self) -> Option<&TensorValue> {
        match self.attributes.get(attr::VALUE) {
            Some(Attribute::Dense(v)) => Some(v),
            _ => None,
        }
    }
}
