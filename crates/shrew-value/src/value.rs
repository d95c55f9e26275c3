use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::device::CompNode;
use crate::dtype::DType;
use crate::error::{Error, ErrorRecord, Result};
use crate::function::GenericFunction;
use crate::shape::ValueShape;
use crate::storage::{DeviceTensorStorage, HostTensorStorage};
use crate::tensor::{DeviceTensor, HostTensor};

// Value — The closed family of things an operator can receive or return
//
// Every argument and result of an operator invocation is a Value behind a
// ValueRef handle. The set of kinds is closed (one enum variant each), so
// dispatch over kinds is an exhaustive match the compiler checks.
//
//   ShapeValue     ValueShape            logical tensor shape
//   CompNodeValue  CompNode              execution locality
//   BoolValue      Boolean               dispatch-time flags
//   HostStorage    HostTensorStorage     raw host memory
//   DeviceStorage  DeviceTensorStorage   raw device memory
//   HostValue      HostTensor            host tensor, scalar-aware
//   DeviceValue    DeviceTensor          device tensor, scalar-aware
//   FunctionValue  GenericFunction       first-class callables
//   DTypeValue     DType                 standalone dtype
//   StringValue    String                diagnostics, identifiers
//   ErrorValue     ErrorRecord           failure carried as data
//
// IMMUTABILITY: a Value is never mutated after construction. ValueRef hands
// out only shared references, so "modifying" a value means building a new
// one. Handles can therefore be shared freely across threads.

/// Runtime tag identifying the kind of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Shape,
    CompNode,
    Bool,
    HostStorage,
    DeviceStorage,
    Host,
    Device,
    Function,
    DType,
    String,
    Error,
}

impl ValueKind {
    /// Name of the kind as shown in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Shape => "ShapeValue",
            ValueKind::CompNode => "CompNodeValue",
            ValueKind::Bool => "BoolValue",
            ValueKind::HostStorage => "HostStorage",
            ValueKind::DeviceStorage => "DeviceStorage",
            ValueKind::Host => "HostValue",
            ValueKind::Device => "DeviceValue",
            ValueKind::Function => "FunctionValue",
            ValueKind::DType => "DTypeValue",
            ValueKind::String => "StringValue",
            ValueKind::Error => "ErrorValue",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A boolean payload. Wrapped so `BoolValue` has a payload type of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Boolean(bool);

impl Boolean {
    pub fn new(value: bool) -> Self {
        Boolean(value)
    }

    pub fn get(&self) -> bool {
        self.0
    }
}

impl From<bool> for Boolean {
    fn from(value: bool) -> Self {
        Boolean(value)
    }
}

impl From<Boolean> for bool {
    fn from(value: Boolean) -> Self {
        value.0
    }
}

impl fmt::Display for Boolean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable value node.
#[derive(Debug, Clone)]
pub enum Value {
    Shape(ValueShape),
    CompNode(CompNode),
    Bool(Boolean),
    HostStorage(HostTensorStorage),
    DeviceStorage(DeviceTensorStorage),
    Host(HostTensor),
    Device(DeviceTensor),
    Function(GenericFunction),
    DType(DType),
    String(String),
    Error(ErrorRecord),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Shape(_) => ValueKind::Shape,
            Value::CompNode(_) => ValueKind::CompNode,
            Value::Bool(_) => ValueKind::Bool,
            Value::HostStorage(_) => ValueKind::HostStorage,
            Value::DeviceStorage(_) => ValueKind::DeviceStorage,
            Value::Host(_) => ValueKind::Host,
            Value::Device(_) => ValueKind::Device,
            Value::Function(_) => ValueKind::Function,
            Value::DType(_) => ValueKind::DType,
            Value::String(_) => ValueKind::String,
            Value::Error(_) => ValueKind::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// The error record, if this is an `ErrorValue`.
    pub fn as_error(&self) -> Option<&ErrorRecord> {
        match self {
            Value::Error(record) => Some(record),
            _ => None,
        }
    }

    /// Payload equality where the payload type defines it.
    ///
    /// Values of different kinds are unequal. Function values have no
    /// equality and yield `None`. Storage (and tensors, through their storage)
    /// compare by identity of the viewed memory, not by content.
    pub fn try_eq(&self, other: &Value) -> Option<bool> {
        Some(match (self, other) {
            (Value::Shape(a), Value::Shape(b)) => a == b,
            (Value::CompNode(a), Value::CompNode(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::HostStorage(a), Value::HostStorage(b)) => a == b,
            (Value::DeviceStorage(a), Value::DeviceStorage(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => a == b,
            (Value::Device(a), Value::Device(b)) => a == b,
            (Value::Function(_), Value::Function(_)) => return None,
            (Value::DType(a), Value::DType(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        match self {
            Value::Shape(shape) => write!(f, "{}{}", kind, shape),
            Value::CompNode(cn) => write!(f, "{}({})", kind, cn),
            Value::Bool(b) => write!(f, "{}({})", kind, b),
            Value::HostStorage(s) => write!(f, "{}{}", kind, s),
            Value::DeviceStorage(s) => write!(f, "{}{}", kind, s),
            Value::Host(t) => write!(f, "{}{}", kind, t),
            Value::Device(t) => write!(f, "{}{}", kind, t),
            Value::Function(func) => write!(f, "{}({})", kind, func.name()),
            Value::DType(dtype) => write!(f, "{}({})", kind, dtype),
            Value::String(s) => write!(f, "{}({:?})", kind, s),
            Value::Error(record) => write!(f, "{}({:?})", kind, record.message()),
        }
    }
}

// ValueRef — shared, immutable handle

/// Shared-ownership handle to one [`Value`]. Cloning is a reference increment.
#[derive(Clone)]
pub struct ValueRef(Arc<Value>);

impl ValueRef {
    pub fn new(value: Value) -> Self {
        ValueRef(Arc::new(value))
    }

    /// Shorthand for an `ErrorValue` handle.
    pub fn error(record: impl Into<ErrorRecord>) -> Self {
        ValueRef::new(Value::Error(record.into()))
    }

    pub fn kind(&self) -> ValueKind {
        self.0.kind()
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Whether the value is of kind `K`.
    pub fn is<K: PrimitiveValue>(&self) -> bool {
        self.kind() == K::KIND
    }

    /// The payload, if the value is of kind `K`.
    pub fn as_kind<K: PrimitiveValue>(&self) -> Option<&K::Payload> {
        K::payload(&self.0)
    }

    /// Checked downcast to kind `K`.
    pub fn cast<K: PrimitiveValue>(&self) -> Result<TypedValueRef<K>> {
        if !self.is::<K>() {
            return Err(Error::TypeMismatch {
                expected: K::KIND,
                got: self.kind(),
            });
        }
        Ok(TypedValueRef {
            handle: self.clone(),
            _kind: PhantomData,
        })
    }

    /// Whether both handles refer to the same value node.
    pub fn ptr_eq(a: &ValueRef, b: &ValueRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Number of live handles to this value.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for ValueRef {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.0
    }
}

impl fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl From<Value> for ValueRef {
    fn from(value: Value) -> Self {
        ValueRef::new(value)
    }
}

/// Checked downcast of a possibly missing handle.
///
/// Fails with [`Error::NullHandle`] for `None` and [`Error::TypeMismatch`] for a
/// value of another kind. Pairs naturally with `ValueRefList::get`.
pub fn cast<K: PrimitiveValue>(handle: Option<&ValueRef>) -> Result<TypedValueRef<K>> {
    handle.ok_or(Error::NullHandle)?.cast::<K>()
}

// PrimitiveValue — lifting a payload type into the family
//
// Each kind is a zero-sized marker type bound to exactly one payload type
// and one enum variant. Adding a kind means adding a variant, a payload
// type and one primitive_value! line; casting and construction come for free.

/// Binds a payload type to a value kind.
pub trait PrimitiveValue: Sized + 'static {
    type Payload: fmt::Debug + Send + Sync + 'static;

    const KIND: ValueKind;

    /// Lift a payload into a value.
    fn wrap(payload: Self::Payload) -> Value;

    /// The payload of `value`, if it is of this kind.
    fn payload(value: &Value) -> Option<&Self::Payload>;

    /// Construct a new handle of this kind.
    fn make(payload: impl Into<Self::Payload>) -> ValueRef {
        ValueRef::new(Self::wrap(payload.into()))
    }
}

macro_rules! primitive_value {
    ($(#[$meta:meta])* $kind:ident => $variant:ident($payload:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $kind;

        impl PrimitiveValue for $kind {
            type Payload = $payload;

            const KIND: ValueKind = ValueKind::$variant;

            fn wrap(payload: $payload) -> Value {
                Value::$variant(payload)
            }

            fn payload(value: &Value) -> Option<&$payload> {
                match value {
                    Value::$variant(payload) => Some(payload),
                    _ => None,
                }
            }
        }
    };
}

primitive_value!(
    /// Logical tensor shape.
    ShapeValue => Shape(ValueShape)
);
primitive_value!(
    /// Device/stream identity.
    CompNodeValue => CompNode(CompNode)
);
primitive_value!(BoolValue => Bool(Boolean));
primitive_value!(
    /// Raw host memory.
    HostStorage => HostStorage(HostTensorStorage)
);
primitive_value!(
    /// Raw device memory.
    DeviceStorage => DeviceStorage(DeviceTensorStorage)
);
primitive_value!(
    /// Host tensor; permits rank-0 (scalar) tensors.
    HostValue => Host(HostTensor)
);
primitive_value!(
    /// Device tensor; permits rank-0 (scalar) tensors.
    DeviceValue => Device(DeviceTensor)
);
primitive_value!(
    /// A first-class callable.
    FunctionValue => Function(GenericFunction)
);
primitive_value!(DTypeValue => DType(DType));
primitive_value!(StringValue => String(String));
primitive_value!(
    /// A failure carried as data.
    ErrorValue => Error(ErrorRecord)
);

/// A handle statically known to hold a value of kind `K`.
///
/// Obtained only through a successful cast, so it derefs straight to the payload.
pub struct TypedValueRef<K: PrimitiveValue> {
    handle: ValueRef,
    _kind: PhantomData<K>,
}

impl<K: PrimitiveValue> TypedValueRef<K> {
    pub fn payload(&self) -> &K::Payload {
        match K::payload(&self.handle) {
            Some(payload) => payload,
            None => unreachable!("TypedValueRef<{}> holds a {}", K::KIND, self.handle.kind()),
        }
    }

    pub fn handle(&self) -> &ValueRef {
        &self.handle
    }

    pub fn into_handle(self) -> ValueRef {
        self.handle
    }
}

impl<K: PrimitiveValue> Clone for TypedValueRef<K> {
    fn clone(&self) -> Self {
        TypedValueRef {
            handle: self.handle.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: PrimitiveValue> Deref for TypedValueRef<K> {
    type Target = K::Payload;

    fn deref(&self) -> &K::Payload {
        self.payload()
    }
}

impl<K: PrimitiveValue> PartialEq for TypedValueRef<K>
where
    K::Payload: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.payload() == other.payload()
    }
}

impl<K: PrimitiveValue> fmt::Debug for TypedValueRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.handle, f)
    }
}

impl<K: PrimitiveValue> fmt::Display for TypedValueRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.handle, f)
    }
}

impl<K: PrimitiveValue> From<TypedValueRef<K>> for ValueRef {
    fn from(typed: TypedValueRef<K>) -> Self {
        typed.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(ShapeValue::KIND.name(), "ShapeValue");
        assert_eq!(HostValue::KIND.name(), "HostValue");
        assert_eq!(ErrorValue::KIND.to_string(), "ErrorValue");
    }

    #[test]
    fn test_cast_success_and_mismatch() {
        let v = BoolValue::make(true);
        assert!(v.cast::<BoolValue>().unwrap().get());
        let err = v.cast::<StringValue>().unwrap_err();
        assert!(matches!(
            err,
            Error::TypeMismatch {
                expected: ValueKind::String,
                got: ValueKind::Bool
            }
        ));
    }

    #[test]
    fn test_cast_null_is_distinct() {
        assert!(matches!(cast::<BoolValue>(None), Err(Error::NullHandle)));
        let v = DTypeValue::make(DType::F16);
        assert_eq!(*cast::<DTypeValue>(Some(&v)).unwrap(), DType::F16);
    }

    #[test]
    fn test_rendering() {
        assert_eq!(ShapeValue::make((2, 3)).to_string(), "ShapeValue[2, 3]");
        assert_eq!(BoolValue::make(false).to_string(), "BoolValue(false)");
        assert_eq!(StringValue::make("x").to_string(), "StringValue(\"x\")");
        assert_eq!(ValueRef::error("boom").to_string(), "ErrorValue(\"boom\")");
        assert_eq!(CompNodeValue::make(CompNode::gpu(1)).to_string(), "CompNodeValue(gpu1)");
        assert_eq!(DTypeValue::make(DType::F32).to_string(), "DTypeValue(f32)");
    }

    #[test]
    fn test_try_eq() {
        let a = ShapeValue::make((2, 3));
        let b = ShapeValue::make((2, 3));
        assert_eq!(a.try_eq(&b), Some(true));
        assert_eq!(a.try_eq(&StringValue::make("x")), Some(false));
        let f = FunctionValue::make(GenericFunction::identity());
        assert_eq!(f.try_eq(&f), None);
    }

    #[test]
    fn test_typed_ref_equality() {
        let a = StringValue::make("x").cast::<StringValue>().unwrap();
        let b = StringValue::make("x").cast::<StringValue>().unwrap();
        assert_eq!(a, b);
        assert!(!ValueRef::ptr_eq(a.handle(), b.handle()));
    }

    #[test]
    fn test_values_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Value>();
        assert_send_sync::<ValueRef>();
        assert_send_sync::<TypedValueRef<DeviceValue>>();
    }
}
