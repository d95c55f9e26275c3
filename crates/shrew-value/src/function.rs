use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::list::ValueRefList;
use crate::value::{FunctionValue, ValueKind, ValueRef};

// GenericFunction — first-class callables
//
// A GenericFunction maps a slice of handles to a ValueRefList. It is the
// payload of a FunctionValue, so operators, closures built by autodiff and
// user callbacks all travel through the same value lists as tensors do.
//
// FAILURE CONVENTION:
//
//   A function never panics or returns a Rust error to signal a domain
//   failure. It returns a list whose only entry is an ErrorValue. Functions
//   built with fallible() get this for free: the Err of the closure is
//   converted on the way out, preserving the message verbatim.
//
//   Error inputs are forwarded, not consumed: forwarding() checks its
//   arguments for ErrorValues first and returns them unchanged.

type Callable = dyn Fn(&[ValueRef]) -> ValueRefList + Send + Sync;

/// A named, shareable callable over value lists.
#[derive(Clone)]
pub struct GenericFunction {
    name: Arc<str>,
    func: Arc<Callable>,
}

impl GenericFunction {
    pub fn new<F>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(&[ValueRef]) -> ValueRefList + Send + Sync + 'static,
    {
        GenericFunction {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Wrap a closure that reports failure through `Result`.
    ///
    /// An `Err` becomes a single-`ErrorValue` result list.
    pub fn fallible<F>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(&[ValueRef]) -> Result<ValueRefList> + Send + Sync + 'static,
    {
        let name: Arc<str> = name.into();
        let label = name.clone();
        GenericFunction::new(name, move |inputs| match func(inputs) {
            Ok(outputs) => outputs,
            Err(err) => {
                debug!("{} failed: {}", label, err);
                ValueRefList::error(err)
            }
        })
    }

    /// Like [`fallible`](Self::fallible), but returns `ErrorValue` inputs untouched
    /// before `func` ever runs.
    pub fn forwarding<F>(name: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(&[ValueRef]) -> Result<ValueRefList> + Send + Sync + 'static,
    {
        let name: Arc<str> = name.into();
        let label = name.clone();
        GenericFunction::fallible(name, move |inputs| {
            if let Some(errors) = forward_errors(inputs) {
                debug!("{}: forwarding {} error input(s)", label, errors.len());
                return Ok(errors);
            }
            func(inputs)
        })
    }

    /// Returns its inputs unchanged.
    pub fn identity() -> Self {
        GenericFunction::new("identity", |inputs: &[ValueRef]| ValueRefList::from(inputs))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, inputs: &[ValueRef]) -> ValueRefList {
        (self.func)(inputs)
    }

    /// `next` applied to the results of `self`.
    ///
    /// A failed first stage short-circuits: its error list is returned as is.
    pub fn then(&self, next: &GenericFunction) -> GenericFunction {
        let first = self.clone();
        let second = next.clone();
        let name = format!("{}>{}", first.name, second.name);
        GenericFunction::new(name, move |inputs| {
            let mid = first.call(inputs);
            if mid.is_failure() {
                return mid;
            }
            second.call(&mid)
        })
    }

    /// Whether both functions share the same underlying callable.
    pub fn ptr_eq(a: &GenericFunction, b: &GenericFunction) -> bool {
        Arc::ptr_eq(&a.func, &b.func)
    }
}

impl fmt::Debug for GenericFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Reject a call whose input count differs from `expected`.
pub fn check_arity(op: &str, inputs: &[ValueRef], expected: usize) -> Result<()> {
    if inputs.len() != expected {
        warn!("{}: called with {} inputs, expected {}", op, inputs.len(), expected);
        return Err(Error::ArityMismatch {
            op: op.to_string(),
            expected,
            got: inputs.len(),
        });
    }
    Ok(())
}

/// The `ErrorValue` inputs, in order, if there are any.
pub fn forward_errors(inputs: &[ValueRef]) -> Option<ValueRefList> {
    let errors: ValueRefList = inputs.iter().filter(|v| v.is_error()).cloned().collect();
    if errors.is_empty() {
        None
    } else {
        Some(errors)
    }
}

impl ValueRef {
    /// Invoke a `FunctionValue`.
    ///
    /// Calling anything else yields a single-`ErrorValue` list.
    pub fn call(&self, inputs: &[ValueRef]) -> ValueRefList {
        match self.as_kind::<FunctionValue>() {
            Some(func) => func.call(inputs),
            None => ValueRefList::error(Error::TypeMismatch {
                expected: ValueKind::Function,
                got: self.kind(),
            }),
        }
    }
}
