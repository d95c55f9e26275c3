use std::fmt;

use crate::error::{Error, Result};

// ValueShape — Logical tensor shape carried by values
//
// A ValueShape is the payload of a ShapeValue and the shape half of every
// tensor aggregate. Unlike a heap-allocated Vec<usize> it keeps its dims
// inline (at most MAX_NDIM of them) so it is Copy: tensor descriptors copy
// their shape by value and never share it.
//
//   Scalar: ValueShape{}        — 0 dimensions, 1 element
//   Vector: ValueShape{5}       — 1 dimension, 5 elements
//   Empty:  ValueShape{0, 3}    — 2 dimensions, 0 elements
//   Matrix: ValueShape{3, 4}    — 2 dimensions, 12 elements

/// N-dimensional shape of a tensor value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ValueShape {
    dims: [usize; ValueShape::MAX_NDIM],
    ndim: usize,
}

impl ValueShape {
    /// Maximum rank a value shape can describe.
    pub const MAX_NDIM: usize = 7;

    /// Build a shape from dimension sizes.
    pub fn new(dims: &[usize]) -> Result<Self> {
        if dims.len() > Self::MAX_NDIM {
            return Err(Error::TooManyDims {
                ndim: dims.len(),
                max: Self::MAX_NDIM,
            });
        }
        let mut shape = ValueShape::scalar();
        shape.dims[..dims.len()].copy_from_slice(dims);
        shape.ndim = dims.len();
        Ok(shape)
    }

    /// The rank-0 shape.
    pub fn scalar() -> Self {
        ValueShape {
            dims: [0; Self::MAX_NDIM],
            ndim: 0,
        }
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.ndim]
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn is_scalar(&self) -> bool {
        self.ndim == 0
    }

    /// Total number of elements. A scalar has one; any zero dimension gives zero.
    ///
    /// Saturates at `usize::MAX` when the product overflows; consumers that
    /// address memory go through [`checked_nr_elems`](Self::checked_nr_elems).
    pub fn total_nr_elems(&self) -> usize {
        self.checked_nr_elems().unwrap_or(usize::MAX)
    }

    /// Total number of elements, or `None` if it does not fit in `usize`.
    pub fn checked_nr_elems(&self) -> Option<usize> {
        checked_product(self.dims())
    }

    /// Like [`checked_nr_elems`](Self::checked_nr_elems), as an `Error::Overflow`.
    pub fn try_nr_elems(&self) -> Result<usize> {
        self.checked_nr_elems()
            .ok_or_else(|| Error::Overflow(format!("shape {} has too many elements", self)))
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.dims()
            .get(d)
            .copied()
            .ok_or_else(|| Error::msg(format!("dim {} out of range for rank {}", d, self.ndim)))
    }

    /// Contiguous row-major strides, in elements.
    ///
    /// Strides saturate at `usize::MAX`; they are exact whenever
    /// `checked_nr_elems` is `Some` and no dimension is zero.
    pub fn contiguous_strides(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.ndim];
        let mut acc = 1usize;
        for i in (0..self.ndim).rev() {
            strides[i] = acc;
            acc = acc.saturating_mul(self.dims[i]);
        }
        strides
    }
}

/// Product of `dims`, or `None` on overflow. Any zero dimension gives `Some(0)`,
/// however large the others are.
pub fn checked_product(dims: &[usize]) -> Option<usize> {
    if dims.contains(&0) {
        return Some(0);
    }
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

impl std::ops::Index<usize> for ValueShape {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.dims()[index]
    }
}

impl fmt::Display for ValueShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for ValueShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueShape{}", self)
    }
}

// Fixed-arity conversions; these cannot exceed MAX_NDIM so they are infallible.

impl From<()> for ValueShape {
    fn from(_: ()) -> Self {
        ValueShape::scalar()
    }
}

impl From<usize> for ValueShape {
    fn from(d: usize) -> Self {
        ValueShape::from([d])
    }
}

impl From<(usize, usize)> for ValueShape {
    fn from((d0, d1): (usize, usize)) -> Self {
        ValueShape::from([d0, d1])
    }
}

impl From<(usize, usize, usize)> for ValueShape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        ValueShape::from([d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for ValueShape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        ValueShape::from([d0, d1, d2, d3])
    }
}

macro_rules! shape_from_array {
    ($($n:literal),*) => {
        $(
            impl From<[usize; $n]> for ValueShape {
                fn from(dims: [usize; $n]) -> Self {
                    let mut shape = ValueShape::scalar();
                    shape.dims[..$n].copy_from_slice(&dims);
                    shape.ndim = $n;
                    shape
                }
            }
        )*
    };
}

shape_from_array!(0, 1, 2, 3, 4, 5, 6, 7);

impl TryFrom<&[usize]> for ValueShape {
    type Error = Error;

    fn try_from(dims: &[usize]) -> Result<Self> {
        ValueShape::new(dims)
    }
}

impl TryFrom<Vec<usize>> for ValueShape {
    type Error = Error;

    fn try_from(dims: Vec<usize>) -> Result<Self> {
        ValueShape::new(&dims)
    }
}
