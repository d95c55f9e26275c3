use std::fmt;

use crate::dtype::DType;
use crate::shape::ValueShape;
use crate::value::ValueKind;

/// All errors that can occur while building, casting or consuming values.
///
/// These are the *Rust-side* failures of the algebra. A failure of a computation that
/// has to travel through a value list is represented by an [`ErrorRecord`] wrapped in an
/// `ErrorValue` instead; the two convert into each other.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A checked downcast met a value of another kind.
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: ValueKind, got: ValueKind },

    /// A handle that had to reference a value did not.
    #[error("null value handle")]
    NullHandle,

    /// Scalar interpretation requested on a tensor with element count != 1.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: ValueShape },

    /// `as_nd` was asked to rehydrate a rank-0 tensor without `allow_scalar`.
    #[error("scalar tensor requires allow_scalar")]
    ScalarNotAllowed,

    /// The storage extent cannot hold the elements the shape declares.
    #[error("storage too small: shape needs {required} bytes, storage has {available}")]
    StorageTooSmall { required: usize, available: usize },

    /// Element count mismatch when building a tensor from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: ValueShape,
        expected: usize,
        got: usize,
    },

    /// An operation received the wrong number of inputs.
    #[error("{op}: expected {expected} inputs, got {got}")]
    ArityMismatch {
        op: String,
        expected: usize,
        got: usize,
    },

    /// DType mismatch between a request and a tensor.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        expected: ValueShape,
        got: ValueShape,
    },

    /// A size computed from a shape does not fit in `usize`.
    #[error("size overflow: {0}")]
    Overflow(String),

    /// Shapes with more dimensions than [`ValueShape::MAX_NDIM`].
    #[error("too many dimensions: {ndim} > {max}")]
    TooManyDims { ndim: usize, max: usize },

    /// An operation does not support this input (dtype, layout, parameter).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A byte view did not line up with the element type.
    #[error("misaligned view: {0}")]
    Misaligned(String),

    /// An allocator could not satisfy a request.
    #[error("allocation of {bytes} bytes on {comp_node} failed: {reason}")]
    Alloc {
        comp_node: String,
        bytes: usize,
        reason: String,
    },

    /// A domain error that travelled as an `ErrorValue` and was collapsed here.
    #[error("{0}")]
    Value(ErrorRecord),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout the value crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

/// Payload of an `ErrorValue`: failure information carried as data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ErrorRecord {
    message: String,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorRecord {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<Error> for ErrorRecord {
    fn from(err: Error) -> Self {
        match err {
            // Unwrap instead of nesting so the message survives verbatim.
            Error::Value(record) => record,
            other => ErrorRecord::new(other.to_string()),
        }
    }
}

impl From<ErrorRecord> for Error {
    fn from(record: ErrorRecord) -> Self {
        Error::Value(record)
    }
}

impl From<&str> for ErrorRecord {
    fn from(s: &str) -> Self {
        ErrorRecord::new(s)
    }
}

impl From<String> for ErrorRecord {
    fn from(s: String) -> Self {
        ErrorRecord::new(s)
    }
}
