use std::fmt;
use std::sync::Arc;

use crate::device::CompNode;
use crate::dtype::{DType, DTypeScalar, WithDType};
use crate::error::{Error, Result};
use crate::shape::ValueShape;
use crate::storage::{
    Allocator, DeviceTensorStorage, HostTensorStorage, RawBuffer, TensorStorage,
};

// Tensor aggregates — (dtype, shape, storage) descriptors
//
// HostTensor and DeviceTensor are small descriptors: a Copy dtype, a Copy
// shape, and a shared storage view. They never own the allocator; cloning
// one bumps the storage reference count and copies the metadata.
//
// VALIDATION POLICY (two-phase construction):
//
//   new()    — accepts any (dtype, shape, storage) combination. Interpreters
//              commonly build the metadata before the storage is final.
//   try_new()— validates eagerly, for callers that want it.
//   as_nd()  — the consumption boundary. Kernels only ever see a TensorND,
//   item()     and these are where shape/storage consistency is enforced.

/// Shape and dtype of a tensor, without storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorLayout {
    pub shape: ValueShape,
    pub dtype: DType,
}

impl TensorLayout {
    pub fn new(shape: impl Into<ValueShape>, dtype: DType) -> Self {
        TensorLayout {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn total_nr_elems(&self) -> usize {
        self.shape.total_nr_elems()
    }

    /// Bytes a contiguous tensor with this layout occupies, saturating at `usize::MAX`.
    pub fn span_in_bytes(&self) -> usize {
        self.checked_span_in_bytes().unwrap_or(usize::MAX)
    }

    pub fn checked_span_in_bytes(&self) -> Option<usize> {
        self.shape
            .checked_nr_elems()?
            .checked_mul(self.dtype.size_in_bytes())
    }

    /// Span in bytes, or `Error::Overflow` when it does not fit in `usize`.
    pub fn try_span_in_bytes(&self) -> Result<usize> {
        self.checked_span_in_bytes()
            .ok_or_else(|| Error::Overflow(format!("layout {} spans too many bytes", self)))
    }

    /// Contiguous row-major strides, in elements.
    pub fn strides(&self) -> Vec<usize> {
        self.shape.contiguous_strides()
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} {}}}", self.dtype, self.shape)
    }
}

fn check_extent(layout: &TensorLayout, available: usize) -> Result<()> {
    let required = layout.try_span_in_bytes()?;
    if required > available {
        return Err(Error::StorageTooSmall {
            required,
            available,
        });
    }
    Ok(())
}

/// A tensor descriptor over either host or device storage.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorAggregate<S> {
    dtype: DType,
    shape: ValueShape,
    storage: S,
}

/// Host-resident tensor (payload of a `HostValue`).
pub type HostTensor = TensorAggregate<HostTensorStorage>;
/// Device-resident tensor (payload of a `DeviceValue`).
pub type DeviceTensor = TensorAggregate<DeviceTensorStorage>;

impl<S: TensorStorage> TensorAggregate<S> {
    /// Build a descriptor without checking the storage extent.
    pub fn new(dtype: DType, shape: impl Into<ValueShape>, storage: S) -> Self {
        TensorAggregate {
            dtype,
            shape: shape.into(),
            storage,
        }
    }

    /// Build a descriptor, checking that the storage can hold the shape.
    pub fn try_new(dtype: DType, shape: impl Into<ValueShape>, storage: S) -> Result<Self> {
        let tensor = TensorAggregate::new(dtype, shape, storage);
        tensor.validate()?;
        Ok(tensor)
    }

    /// Allocate storage on `comp_node` and copy `data` in.
    pub fn from_slice<T: WithDType>(
        allocator: &Arc<dyn Allocator>,
        comp_node: CompNode,
        shape: impl Into<ValueShape>,
        data: &[T],
    ) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.try_nr_elems()?;
        if data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape,
                expected,
                got: data.len(),
            });
        }
        let raw = RawBuffer::from_slice(allocator, comp_node, data)?;
        Ok(TensorAggregate::new(T::DTYPE, shape, S::from_raw(raw)))
    }

    /// A rank-0 tensor holding one element.
    pub fn scalar<T: WithDType>(
        allocator: &Arc<dyn Allocator>,
        comp_node: CompNode,
        value: T,
    ) -> Result<Self> {
        TensorAggregate::from_slice(allocator, comp_node, ValueShape::scalar(), &[value])
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &ValueShape {
        &self.shape
    }

    pub fn layout(&self) -> TensorLayout {
        TensorLayout {
            shape: self.shape,
            dtype: self.dtype,
        }
    }

    /// The comp node the storage lives on.
    pub fn device(&self) -> CompNode {
        self.storage.comp_node()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Check that the storage extent covers the declared shape.
    pub fn validate(&self) -> Result<()> {
        check_extent(&self.layout(), self.storage.size())
    }

    /// Read the single element of a one-element tensor.
    pub fn item(&self) -> Result<DTypeScalar> {
        if self.shape.try_nr_elems()? != 1 {
            return Err(Error::NotAScalar { shape: self.shape });
        }
        DTypeScalar::from_raw(self.dtype, self.storage.bytes())
    }

    /// Rehydrate into the representation kernels consume.
    ///
    /// A rank-0 tensor becomes shape `[1]`, and only when `allow_scalar` is set.
    pub fn as_nd(&self, allow_scalar: bool) -> Result<TensorND<S>> {
        let shape = if self.shape.is_scalar() {
            if !allow_scalar {
                return Err(Error::ScalarNotAllowed);
            }
            ValueShape::from(1)
        } else {
            self.shape
        };
        let layout = TensorLayout {
            shape,
            dtype: self.dtype,
        };
        check_extent(&layout, self.storage.size())?;
        Ok(TensorND {
            layout,
            storage: self.storage.clone(),
        })
    }

    fn copy_to<D: TensorStorage>(
        &self,
        allocator: &Arc<dyn Allocator>,
        comp_node: CompNode,
    ) -> Result<TensorAggregate<D>> {
        let layout = self.layout();
        let span = layout.try_span_in_bytes()?;
        check_extent(&layout, self.storage.size())?;
        let bytes = &self.storage.bytes()[..span];
        let raw = RawBuffer::from_bytes(allocator, comp_node, bytes)?;
        Ok(TensorAggregate::new(self.dtype, self.shape, D::from_raw(raw)))
    }
}

impl HostTensor {
    /// Copy to device memory on `comp_node`.
    pub fn to_device(
        &self,
        allocator: &Arc<dyn Allocator>,
        comp_node: CompNode,
    ) -> Result<DeviceTensor> {
        self.copy_to(allocator, comp_node)
    }
}

impl DeviceTensor {
    /// Copy back to host memory (on `cpu0`).
    pub fn to_host(&self, allocator: &Arc<dyn Allocator>) -> Result<HostTensor> {
        self.copy_to(allocator, CompNode::cpu(0))
    }
}

impl<S: TensorStorage> fmt::Display for TensorAggregate<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{dtype={}, shape={}, device={}}}",
            self.dtype,
            self.shape,
            self.storage.comp_node()
        )
    }
}

impl<S: TensorStorage> From<TensorND<S>> for TensorAggregate<S> {
    fn from(nd: TensorND<S>) -> Self {
        TensorAggregate::new(nd.layout.dtype, nd.layout.shape, nd.storage)
    }
}

// TensorND — validated, kernel-facing tensor

/// A tensor whose storage is known to cover its layout.
#[derive(Debug, Clone)]
pub struct TensorND<S> {
    layout: TensorLayout,
    storage: S,
}

pub type HostTensorND = TensorND<HostTensorStorage>;
pub type DeviceTensorND = TensorND<DeviceTensorStorage>;

impl<S: TensorStorage> TensorND<S> {
    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    pub fn shape(&self) -> &ValueShape {
        &self.layout.shape
    }

    pub fn dtype(&self) -> DType {
        self.layout.dtype
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Exactly the bytes the layout covers.
    pub fn raw(&self) -> &[u8] {
        &self.storage.bytes()[..self.layout.span_in_bytes()]
    }

    /// Zero-copy typed view of the elements.
    pub fn as_slice<T: WithDType>(&self) -> Result<&[T]> {
        if T::DTYPE != self.layout.dtype {
            return Err(Error::DTypeMismatch {
                expected: T::DTYPE,
                got: self.layout.dtype,
            });
        }
        bytemuck::try_cast_slice(self.raw()).map_err(|e| Error::Misaligned(format!("{:?}", e)))
    }

    /// Copy the elements out as f64 (for inspection and tests).
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        fn widen<T: WithDType>(raw: &[u8]) -> Vec<f64> {
            raw.chunks_exact(std::mem::size_of::<T>())
                .map(|c| bytemuck::pod_read_unaligned::<T>(c).to_f64())
                .collect()
        }
        let raw = self.raw();
        Ok(match self.layout.dtype {
            DType::F16 => widen::<half::f16>(raw),
            DType::BF16 => widen::<half::bf16>(raw),
            DType::F32 => widen::<f32>(raw),
            DType::F64 => widen::<f64>(raw),
            DType::U8 => widen::<u8>(raw),
            DType::I32 => widen::<i32>(raw),
            DType::U32 => widen::<u32>(raw),
            DType::I64 => widen::<i64>(raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::default_allocator;

    fn host_f32(shape: impl Into<ValueShape>, data: &[f32]) -> HostTensor {
        HostTensor::from_slice(&default_allocator(), CompNode::cpu(0), shape, data).unwrap()
    }

    #[test]
    fn test_item_single_element() {
        let t = host_f32((1, 1), &[4.5]);
        assert_eq!(t.item().unwrap(), DTypeScalar::F32(4.5));
        let s = HostTensor::scalar(&default_allocator(), CompNode::cpu(0), 7i32).unwrap();
        assert_eq!(s.item().unwrap().get::<i32>().unwrap(), 7);
    }

    #[test]
    fn test_item_rejects_many_and_zero() {
        let many = host_f32((2, 3), &[0.0; 6]);
        assert!(matches!(many.item(), Err(Error::NotAScalar { .. })));
        let empty = host_f32((0, 3), &[]);
        assert!(matches!(empty.item(), Err(Error::NotAScalar { .. })));
    }

    #[test]
    fn test_lazy_construction_checked_at_as_nd() {
        let storage = host_f32(2, &[1.0, 2.0]).storage().clone();
        // Metadata first, storage grows later: construction itself is fine.
        let t = HostTensor::new(DType::F32, (2, 3), storage.clone());
        assert!(matches!(
            t.as_nd(false),
            Err(Error::StorageTooSmall {
                required: 24,
                available: 8
            })
        ));
        assert!(HostTensor::try_new(DType::F32, (2, 3), storage.clone()).is_err());
        assert!(HostTensor::try_new(DType::F32, 2, storage).is_ok());
    }

    #[test]
    fn test_overflowing_shape_is_an_error() {
        let storage = host_f32(2, &[1.0, 2.0]).storage().clone();
        let huge = HostTensor::new(DType::F32, (usize::MAX / 2, 4), storage.clone());
        assert!(matches!(huge.as_nd(false), Err(Error::Overflow(_))));
        assert!(matches!(huge.item(), Err(Error::Overflow(_))));
        assert!(matches!(huge.validate(), Err(Error::Overflow(_))));
        let dev = huge.to_device(&default_allocator(), CompNode::gpu(0));
        assert!(matches!(dev, Err(Error::Overflow(_))));
        assert!(HostTensor::try_new(DType::F32, (usize::MAX / 2, 4), storage.clone()).is_err());

        // element count fits, byte span does not
        let wide = HostTensor::new(DType::F32, usize::MAX / 2, storage);
        assert_eq!(wide.layout().checked_span_in_bytes(), None);
        assert!(matches!(wide.as_nd(false), Err(Error::Overflow(_))));
    }

    #[test]
    fn test_as_nd_scalar_policy() {
        let s = HostTensor::scalar(&default_allocator(), CompNode::cpu(0), 1.0f32).unwrap();
        assert!(matches!(s.as_nd(false), Err(Error::ScalarNotAllowed)));
        let nd = s.as_nd(true).unwrap();
        assert_eq!(nd.shape().dims(), &[1]);
        assert_eq!(nd.as_slice::<f32>().unwrap(), &[1.0]);
    }

    #[test]
    fn test_nd_typed_views() {
        let t = host_f32((2, 2), &[1.0, 2.0, 3.0, 4.0]);
        let nd = t.as_nd(false).unwrap();
        assert_eq!(nd.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(matches!(nd.as_slice::<i32>(), Err(Error::DTypeMismatch { .. })));
        let back = HostTensor::from(nd);
        assert_eq!(back, t);
    }

    #[test]
    fn test_host_device_copy() {
        let alloc = default_allocator();
        let host = host_f32(3, &[1.0, 2.0, 3.0]);
        let dev = host.to_device(&alloc, CompNode::gpu(0)).unwrap();
        assert_eq!(dev.device(), CompNode::gpu(0));
        assert_eq!(dev.shape(), host.shape());
        let again = dev.to_host(&alloc).unwrap();
        assert!(!again.storage().same_block(host.storage()));
        assert_eq!(again.as_nd(false).unwrap().as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_from_slice_count_mismatch() {
        let err = HostTensor::from_slice(&default_allocator(), CompNode::cpu(0), (2, 2), &[1.0f32])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ElementCountMismatch {
                expected: 4,
                got: 1,
                ..
            }
        ));
    }
}
