//! Value types: element types, shapes, memref layouts and constant payloads.

use std::fmt;

use crate::affine::AffineMap;
use crate::{Error, Result};

/// Element type of a tensor, memref or scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    /// Accelerator element type of stickified buffers.
    F16,
    I32,
    I64,
    Bool,
}

impl DataType {
    /// Check if this is a signless integer type (booleans excluded).
    pub fn is_integer(&self) -> bool {
        matches!(self, DataType::I32 | DataType::I64)
    }

    /// Check if this is a floating point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F16)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::Bool => "i1",
        };
        f.write_str(name)
    }
}

/// A single dimension of a partially known shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    /// Compile-time constant dimension.
    Known(usize),

    /// Dimension only known at runtime.
    Unknown,
}

impl Dim {
    /// Get the fixed value if available.
    pub fn as_known(&self) -> Option<usize> {
        match self {
            Dim::Known(n) => Some(*n),
            Dim::Unknown => None,
        }
    }
}

/// Tensor or buffer shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TensorShape {
    /// All dimensions are known at compile time.
    Static(Vec<usize>),

    /// Ranked, with at least one runtime dimension.
    Dynamic(Vec<Dim>),

    /// Rank not known.
    Unknown,
}

impl TensorShape {
    /// Build a shape from dimensions, collapsing to `Static` when all are known.
    pub fn from_dims(dims: Vec<Dim>) -> Self {
        let known: Option<Vec<usize>> = dims.iter().map(Dim::as_known).collect();
        match known {
            Some(dims) => TensorShape::Static(dims),
            None => TensorShape::Dynamic(dims),
        }
    }

    /// Check if the shape is fully static.
    pub fn is_static(&self) -> bool {
        matches!(self, TensorShape::Static(_))
    }

    /// Get static dimensions if available.
    pub fn as_static(&self) -> Option<&[usize]> {
        match self {
            TensorShape::Static(dims) => Some(dims),
            _ => None,
        }
    }

    /// Dimensions of a ranked shape.
    pub fn dims(&self) -> Option<Vec<Dim>> {
        match self {
            TensorShape::Static(dims) => Some(dims.iter().map(|&d| Dim::Known(d)).collect()),
            TensorShape::Dynamic(dims) => Some(dims.clone()),
            TensorShape::Unknown => None,
        }
    }

    /// Number of dimensions, if known.
    pub fn ndim(&self) -> Option<usize> {
        match self {
            TensorShape::Static(dims) => Some(dims.len()),
            TensorShape::Dynamic(dims) => Some(dims.len()),
            TensorShape::Unknown => None,
        }
    }

    /// Number of runtime dimensions (the operand count of an allocation).
    pub fn num_dynamic_dims(&self) -> usize {
        match self {
            TensorShape::Dynamic(dims) => dims.iter().filter(|d| **d == Dim::Unknown).count(),
            _ => 0,
        }
    }

    /// Reorder dimensions so that `out[i] = in[perm[i]]`.
    pub fn permuted(&self, perm: &[usize]) -> Result<TensorShape> {
        let Some(dims) = self.dims() else {
            return Ok(TensorShape::Unknown);
        };
        if dims.len() != perm.len() {
            return Err(Error::Shape(format!(
                "Permutation {:?} does not match rank {}",
                perm,
                dims.len()
            )));
        }
        let permuted = perm
            .iter()
            .map(|&p| {
                dims.get(p)
                    .copied()
                    .ok_or_else(|| Error::Shape(format!("Permutation index {} out of range", p)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(TensorShape::from_dims(permuted))
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dims() {
            None => f.write_str("*"),
            Some(dims) => {
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        f.write_str("x")?;
                    }
                    match d {
                        Dim::Known(n) => write!(f, "{}", n)?,
                        Dim::Unknown => f.write_str("?")?,
                    }
                }
                Ok(())
            }
        }
    }
}

/// A buffer type: element type, shape and optional layout descriptor.
///
/// The layout is an affine remapping from logical indices to the physical
/// addressing scheme. An identity map is normalized to `None` so that
/// "has a non-default layout" is a plain `is_some()` test.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemRefType {
    pub dtype: DataType,
    pub shape: TensorShape,
    pub layout: Option<AffineMap>,
}

impl MemRefType {
    /// Create a buffer type with the default (packed) layout.
    pub fn new(dtype: DataType, shape: TensorShape) -> Self {
        Self {
            dtype,
            shape,
            layout: None,
        }
    }

    /// Attach a layout map, dropping it again if it is the identity.
    pub fn with_layout(mut self, layout: AffineMap) -> Self {
        self.layout = if layout.is_identity() {
            None
        } else {
            Some(layout)
        };
        self
    }

    /// Check if the buffer uses a non-default layout.
    pub fn has_non_identity_layout(&self) -> bool {
        self.layout.is_some()
    }
}

/// Type of an IR value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// Value-semantic tensor (tensor-level ops, loop bounds, constants).
    Tensor { dtype: DataType, shape: TensorShape },

    /// Buffer in memory.
    MemRef(MemRefType),

    /// A single element loaded from or stored to a buffer.
    Scalar(DataType),

    /// Loop induction variable or buffer index.
    Index,

    /// Completion token of a concurrently executing region.
    Token,

    /// Future value produced by a concurrently executing region.
    Async(Box<Type>),

    /// Absent optional value.
    None,
}

impl Type {
    /// Shorthand for a tensor type.
    pub fn tensor(dtype: DataType, shape: TensorShape) -> Self {
        Type::Tensor { dtype, shape }
    }

    /// Shorthand for a rank-0 tensor type.
    pub fn scalar_tensor(dtype: DataType) -> Self {
        Type::Tensor {
            dtype,
            shape: TensorShape::Static(vec![]),
        }
    }

    /// Shorthand for a static buffer type with the default layout.
    pub fn memref(dtype: DataType, shape: &[usize]) -> Self {
        Type::MemRef(MemRefType::new(dtype, TensorShape::Static(shape.to_vec())))
    }

    /// Get the buffer type if this is a memref.
    pub fn as_memref(&self) -> Option<&MemRefType> {
        match self {
            Type::MemRef(ty) => Some(ty),
            _ => None,
        }
    }

    /// Element type of shaped and scalar types.
    pub fn element_type(&self) -> Option<DataType> {
        match self {
            Type::Tensor { dtype, .. } | Type::Scalar(dtype) => Some(*dtype),
            Type::MemRef(ty) => Some(ty.dtype),
            _ => None,
        }
    }

    /// Shape of shaped types.
    pub fn shape(&self) -> Option<&TensorShape> {
        match self {
            Type::Tensor { shape, .. } => Some(shape),
            Type::MemRef(ty) => Some(&ty.shape),
            _ => None,
        }
    }

    /// Same type with the element type replaced.
    pub fn with_element_type(&self, new_dtype: DataType) -> Type {
        match self {
            Type::Tensor { shape, .. } => Type::Tensor {
                dtype: new_dtype,
                shape: shape.clone(),
            },
            Type::MemRef(ty) => Type::MemRef(MemRefType {
                dtype: new_dtype,
                ..ty.clone()
            }),
            Type::Scalar(_) => Type::Scalar(new_dtype),
            other => other.clone(),
        }
    }

    /// Same type with the shape replaced.
    pub fn with_shape(&self, new_shape: TensorShape) -> Type {
        match self {
            Type::Tensor { dtype, .. } => Type::Tensor {
                dtype: *dtype,
                shape: new_shape,
            },
            Type::MemRef(ty) => Type::MemRef(MemRefType {
                shape: new_shape,
                ..ty.clone()
            }),
            other => other.clone(),
        }
    }

    /// Check if this is the absent-value type.
    pub fn is_none(&self) -> bool {
        matches!(self, Type::None)
    }

    /// Check if this type carries a non-default memory layout.
    pub fn has_non_identity_layout(&self) -> bool {
        self.as_memref()
            .is_some_and(MemRefType::has_non_identity_layout)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Tensor { dtype, shape } => match shape {
                TensorShape::Static(dims) if dims.is_empty() => write!(f, "tensor<{}>", dtype),
                _ => write!(f, "tensor<{}x{}>", shape, dtype),
            },
            Type::MemRef(ty) => {
                write!(f, "memref<")?;
                if ty.shape.ndim() != Some(0) {
                    write!(f, "{}x", ty.shape)?;
                }
                write!(f, "{}", ty.dtype)?;
                if let Some(layout) = &ty.layout {
                    write!(f, ", {}", layout)?;
                }
                write!(f, ">")
            }
            Type::Scalar(dtype) => write!(f, "{}", dtype),
            Type::Index => f.write_str("index"),
            Type::Token => f.write_str("!async.token"),
            Type::Async(inner) => write!(f, "!async.value<{}>", inner),
            Type::None => f.write_str("none"),
        }
    }
}

/// Raw constant payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    I64(Vec<i64>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    Bool(Vec<bool>),
}

impl TensorData {
    /// Get the number of elements in this tensor data.
    pub fn len(&self) -> usize {
        match self {
            TensorData::I64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    /// Check if this tensor data is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the inferred data type from this tensor data.
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::I64(_) => DataType::I64,
            TensorData::I32(_) => DataType::I32,
            TensorData::F32(_) => DataType::F32,
            TensorData::Bool(_) => DataType::Bool,
        }
    }
}

/// A tensor value known at compile time, carried by constant ops.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    /// The raw tensor data.
    pub data: TensorData,

    /// The shape of the tensor (dimensions).
    pub shape: Vec<usize>,

    /// The data type of the tensor.
    pub dtype: DataType,
}

impl TensorValue {
    /// Create a new TensorValue with data, shape, and dtype.
    ///
    /// # Panics
    ///
    /// Panics if the data length doesn't match the shape product.
    pub fn new(data: TensorData, shape: Vec<usize>, dtype: DataType) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape {:?} (product = {})",
            data.len(),
            shape,
            expected_len
        );
        assert_eq!(
            data.dtype(),
            dtype,
            "Data type {:?} doesn't match declared dtype {:?}",
            data.dtype(),
            dtype
        );
        Self { data, shape, dtype }
    }

    /// Create a rank-0 integer constant of the given integer type.
    pub fn scalar_int(value: i64, dtype: DataType) -> Result<Self> {
        let data = match dtype {
            DataType::I64 => TensorData::I64(vec![value]),
            DataType::I32 => {
                let narrowed = i32::try_from(value).map_err(|_| {
                    Error::Attribute(format!("Constant {} does not fit in i32", value))
                })?;
                TensorData::I32(vec![narrowed])
            }
            other => {
                return Err(Error::Attribute(format!(
                    "Integer constant requested with non-integer type {}",
                    other
                )));
            }
        };
        Ok(Self::new(data, vec![], dtype))
    }

    /// Create a rank-0 f32 constant.
    pub fn scalar_f32(value: f32) -> Self {
        Self::new(TensorData::F32(vec![value]), vec![], DataType::F32)
    }

    /// Get the number of elements in this tensor value.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if this tensor value is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The first element as an `i64`, for integer payloads.
    pub fn first_int(&self) -> Option<i64> {
        match &self.data {
            TensorData::I64(v) => v.first().copied(),
            TensorData::I32(v) => v.first().map(|&x| x as i64),
            _ => None,
        }
    }

    /// Cast this value to a different type.
    pub fn cast(&self, target_dtype: DataType) -> Result<TensorValue> {
        if self.dtype == target_dtype {
            return Ok(self.clone());
        }

        let new_data = match (&self.data, target_dtype) {
            (TensorData::I64(v), DataType::I32) => {
                TensorData::I32(v.iter().map(|&x| x as i32).collect())
            }
            (TensorData::I64(v), DataType::F32) => {
                TensorData::F32(v.iter().map(|&x| x as f32).collect())
            }
            (TensorData::I32(v), DataType::I64) => {
                TensorData::I64(v.iter().map(|&x| x as i64).collect())
            }
            (TensorData::I32(v), DataType::F32) => {
                TensorData::F32(v.iter().map(|&x| x as f32).collect())
            }
            (TensorData::F32(v), DataType::I32) => {
                TensorData::I32(v.iter().map(|&x| x as i32).collect())
            }
            (TensorData::F32(v), DataType::I64) => {
                TensorData::I64(v.iter().map(|&x| x as i64).collect())
            }
            _ => {
                return Err(Error::Unsupported(format!(
                    "Cast from {:?} to {:?} not supported for constants",
                    self.dtype, target_dtype
                )));
            }
        };

        Ok(TensorValue::new(new_data, self.shape.clone(), target_dtype))
    }
}
