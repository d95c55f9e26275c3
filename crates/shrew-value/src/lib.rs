//! # shrew-value
//!
//! The value algebra of Shrew's eager interpreter: the immutable,
//! reference-counted values that operators consume and produce.
//!
//! This crate provides:
//! - [`Value`] / [`ValueRef`] — the closed family of value kinds behind a shared handle
//! - [`PrimitiveValue`] — marker types (`ShapeValue`, `DeviceValue`, ...) binding a kind
//!   to its payload, with checked downcasts through [`cast`]
//! - [`HostTensor`] / [`DeviceTensor`] — scalar-aware tensor descriptors
//! - [`HostTensorStorage`] / [`DeviceTensorStorage`] — shared, allocator-owned memory
//! - [`ValueRefList`] — argument and result lists, with failures carried as `ErrorValue`s
//! - [`GenericFunction`] — first-class callables over value lists
// - error: Error enum, ErrorRecord (the ErrorValue payload), bail!
// - dtype/shape/device: the small Copy payloads
// - storage: Allocator trait, RawBuffer, the two storage views
// - tensor: TensorAggregate (HostTensor/DeviceTensor), TensorND for kernels
// - value/list/function: the algebra proper

pub mod device;
pub mod dtype;
pub mod error;
pub mod function;
pub mod list;
pub mod shape;
pub mod storage;
pub mod tensor;
pub mod value;

pub use device::{CompNode, DeviceKind};
pub use dtype::{DType, DTypeScalar, WithDType};
pub use error::{Error, ErrorRecord, Result};
pub use function::{check_arity, forward_errors, GenericFunction};
pub use list::{ValueRefList, ValueResult};
pub use shape::{checked_product, ValueShape};
pub use storage::{
    default_allocator, AllocStats, Allocator, CountingAllocator, DeviceTensorStorage,
    HostTensorStorage, RawBuffer, SystemAllocator, TensorStorage,
};
pub use tensor::{
    DeviceTensor, DeviceTensorND, HostTensor, HostTensorND, TensorAggregate, TensorLayout,
    TensorND,
};
pub use value::{
    cast, BoolValue, Boolean, CompNodeValue, DTypeValue, DeviceStorage, DeviceValue,
    ErrorValue, FunctionValue, HostStorage, HostValue, PrimitiveValue, ShapeValue, StringValue,
    TypedValueRef, Value, ValueKind, ValueRef,
};
