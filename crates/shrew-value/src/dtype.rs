use std::fmt;

use crate::error::{Error, Result};

// DType — Element types a tensor value can carry
//
// A DType is standalone metadata: it appears inside every HostTensor and
// DeviceTensor aggregate, and on its own as the payload of a DTypeValue.
// It is Copy, so tensor descriptors copy it by value.
//
//   F16  — 16-bit IEEE half float
//   BF16 — 16-bit brain float
//   F32  — 32-bit float, the only dtype the reference kernels compute in
//   F64  — 64-bit float
//   U8   — unsigned byte, images and boolean masks
//   I32  — signed 32-bit int, indices and shapes-as-tensors
//   U32  — unsigned 32-bit int
//   I64  — signed 64-bit int

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    U8,
    I32,
    U32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Lowercase name, also accepted by `FromStr`.
    pub fn name(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::U32 => "u32",
            DType::I64 => "i64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "f16" | "float16" => DType::F16,
            "bf16" | "bfloat16" => DType::BF16,
            "f32" | "float32" => DType::F32,
            "f64" | "float64" => DType::F64,
            "u8" | "uint8" => DType::U8,
            "i32" | "int32" => DType::I32,
            "u32" | "uint32" => DType::U32,
            "i64" | "int64" => DType::I64,
            other => return Err(Error::msg(format!("unknown dtype '{}'", other))),
        })
    }
}

// WithDType — Bridge between Rust element types and DType
//
// Pod lets storage hand out zero-copy typed slices over its bytes;
// to_f64/from_f64 keep generic numeric code simple.

/// Trait implemented by Rust types that can be stored in a tensor.
pub trait WithDType:
    Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug + bytemuck::Pod
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

macro_rules! with_dtype_cast {
    ($ty:ty, $dtype:ident) => {
        impl WithDType for $ty {
            const DTYPE: DType = DType::$dtype;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $ty
            }
        }
    };
}

with_dtype_cast!(f32, F32);
with_dtype_cast!(f64, F64);
with_dtype_cast!(u8, U8);
with_dtype_cast!(i32, I32);
with_dtype_cast!(u32, U32);
with_dtype_cast!(i64, I64);

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}

/// A single element tagged with its dtype, produced by scalar extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DTypeScalar {
    F16(half::f16),
    BF16(half::bf16),
    F32(f32),
    F64(f64),
    U8(u8),
    I32(i32),
    U32(u32),
    I64(i64),
}

impl DTypeScalar {
    /// Decode one element of `dtype` from the head of `bytes` (little-endian, unaligned).
    pub fn from_raw(dtype: DType, bytes: &[u8]) -> Result<Self> {
        let size = dtype.size_in_bytes();
        if bytes.len() < size {
            return Err(Error::StorageTooSmall {
                required: size,
                available: bytes.len(),
            });
        }
        let raw = &bytes[..size];
        Ok(match dtype {
            DType::F16 => DTypeScalar::F16(bytemuck::pod_read_unaligned(raw)),
            DType::BF16 => DTypeScalar::BF16(bytemuck::pod_read_unaligned(raw)),
            DType::F32 => DTypeScalar::F32(bytemuck::pod_read_unaligned(raw)),
            DType::F64 => DTypeScalar::F64(bytemuck::pod_read_unaligned(raw)),
            DType::U8 => DTypeScalar::U8(raw[0]),
            DType::I32 => DTypeScalar::I32(bytemuck::pod_read_unaligned(raw)),
            DType::U32 => DTypeScalar::U32(bytemuck::pod_read_unaligned(raw)),
            DType::I64 => DTypeScalar::I64(bytemuck::pod_read_unaligned(raw)),
        })
    }

    pub fn dtype(&self) -> DType {
        match self {
            DTypeScalar::F16(_) => DType::F16,
            DTypeScalar::BF16(_) => DType::BF16,
            DTypeScalar::F32(_) => DType::F32,
            DTypeScalar::F64(_) => DType::F64,
            DTypeScalar::U8(_) => DType::U8,
            DTypeScalar::I32(_) => DType::I32,
            DTypeScalar::U32(_) => DType::U32,
            DTypeScalar::I64(_) => DType::I64,
        }
    }

    /// Lossy widening to f64.
    pub fn to_f64(&self) -> f64 {
        match *self {
            DTypeScalar::F16(v) => v.to_f64(),
            DTypeScalar::BF16(v) => v.to_f64(),
            DTypeScalar::F32(v) => v as f64,
            DTypeScalar::F64(v) => v,
            DTypeScalar::U8(v) => v as f64,
            DTypeScalar::I32(v) => v as f64,
            DTypeScalar::U32(v) => v as f64,
            DTypeScalar::I64(v) => v as f64,
        }
    }

    /// Exact typed access; the requested type must match the stored dtype.
    pub fn get<T: WithDType>(&self) -> Result<T> {
        if T::DTYPE != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: T::DTYPE,
                got: self.dtype(),
            });
        }
        Ok(match *self {
            DTypeScalar::F16(v) => bytemuck::cast(v),
            DTypeScalar::BF16(v) => bytemuck::cast(v),
            DTypeScalar::F32(v) => bytemuck::cast(v),
            DTypeScalar::F64(v) => bytemuck::cast(v),
            DTypeScalar::U8(v) => bytemuck::cast(v),
            DTypeScalar::I32(v) => bytemuck::cast(v),
            DTypeScalar::U32(v) => bytemuck::cast(v),
            DTypeScalar::I64(v) => bytemuck::cast(v),
        })
    }
}

impl fmt::Display for DTypeScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DTypeScalar::F16(v) => write!(f, "{}", v),
            DTypeScalar::BF16(v) => write!(f, "{}", v),
            DTypeScalar::F32(v) => write!(f, "{}", v),
            DTypeScalar::F64(v) => write!(f, "{}", v),
            DTypeScalar::U8(v) => write!(f, "{}", v),
            DTypeScalar::I32(v) => write!(f, "{}", v),
            DTypeScalar::U32(v) => write!(f, "{}", v),
            DTypeScalar::I64(v) => write!(f, "{}", v),
        }
    }
}
