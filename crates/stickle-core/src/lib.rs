//! Core operation graph, types and pass traits for Stickle.
//!
//! This crate provides the host representation that the rewrite layer works on:
//! - Arena IR with use/def links (`IrGraph`, `Operation`, `ValueId`)
//! - Value types with optional memory layouts (`Type`, `MemRefType`)
//! - Affine index maps and accelerator layout tags (`AffineMap`, `StickLayout`)
//! - An insertion-point builder (`OpBuilder`)
//! - A structural verifier, a textual printer and a reference interpreter
//! - The `Pass` trait and its stages

pub mod affine;
pub mod interp;
pub mod ir;
pub mod ir_builder;
pub mod layout;
pub mod op;
pub mod pass;
pub mod print;
pub mod types;
pub mod verify;

// Re-export commonly used types
pub use affine::{AffineExpr, AffineMap};
pub use interp::{Buffer, Interpreter, RuntimeValue};
pub use ir::{BlockId, InsertPoint, IrGraph, OpId, RegionId, Use, ValueDef, ValueId};
pub use ir_builder::OpBuilder;
pub use layout::{NCHW_TO_NHWC, StickLayout};
pub use op::{Attribute, OpKind, Operation, attr};
pub use pass::{Pass, Stage};
pub use types::{DataType, Dim, MemRefType, TensorData, TensorShape, TensorValue, Type};
pub use verify::verify;

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for stickle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    /// A rewrite broke a graph invariant; fatal to the running pass.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Attribute error: {0}")]
    Attribute(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Verification failed: {0}")]
    Verification(String),
}
