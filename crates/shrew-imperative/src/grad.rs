// Grad — Backward closures as first-class values
//
// Every differentiable forward call made through a GradContext records one
// backward closure, stored as a FunctionValue:
//
//   forward   (src, filter)     -> [dst]
//   backward  (grad_dst)        -> [grad_src, grad_filter]
//
// The closure captures the ValueRefs of the tensors it needs. Holding a
// handle keeps the storage block alive, so saved tensors live exactly as
// long as the closure that saved them; dropping the context (or taking its
// entries and dropping those) releases them. The context is passed around
// explicitly, there is no ambient "current tape".

use log::debug;

use shrew_dnn::{GroupLocalForward, Operator};
use shrew_value::{
    check_arity, DeviceValue, FunctionValue, GenericFunction, PrimitiveValue, Result, ValueRef,
    ValueRefList,
};

use crate::dispatcher::Dispatcher;

/// One recorded backward closure.
#[derive(Debug, Clone)]
pub struct BackwardEntry {
    /// Name of the forward operator that produced it.
    pub name: String,
    /// A `FunctionValue` mapping output gradients to input gradients.
    pub backward: ValueRef,
}

/// Records backward closures for the forward calls made through it.
#[derive(Debug, Clone, Default)]
pub struct GradContext {
    dispatcher: Dispatcher,
    entries: Vec<BackwardEntry>,
}

impl GradContext {
    pub fn new(dispatcher: Dispatcher) -> Self {
        GradContext {
            dispatcher,
            entries: Vec::new(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Store `backward` for the forward call `name`; returns the stored `FunctionValue`.
    pub fn record(&mut self, name: impl Into<String>, backward: GenericFunction) -> ValueRef {
        let backward = FunctionValue::make(backward);
        let name = name.into();
        debug!("grad: recorded backward for {} (#{})", name, self.entries.len());
        self.entries.push(BackwardEntry {
            name,
            backward: backward.clone(),
        });
        backward
    }

    /// Recorded closures, oldest first.
    pub fn entries(&self) -> &[BackwardEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move every recorded closure out, newest first (the order backward runs in).
    pub fn take(&mut self) -> Vec<BackwardEntry> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        entries
    }

    /// Run `op` forward and record its backward closure.
    ///
    /// A failed forward records nothing and returns its error list.
    pub fn group_local_forward(
        &mut self,
        op: &GroupLocalForward,
        inputs: &[ValueRef],
    ) -> ValueRefList {
        let outputs = self.dispatcher.apply(op, inputs);
        if outputs.has_error() {
            return outputs;
        }
        let (src, filter) = match inputs {
            [src, filter] => (src, filter),
            _ => return outputs,
        };
        match group_local_backward(&self.dispatcher, op, src, filter) {
            Ok(backward) => {
                self.record(op.name(), backward);
                outputs
            }
            Err(err) => ValueRefList::error(err),
        }
    }
}

/// Build the backward closure of `forward` applied to `(src, filter)`.
///
/// The closure takes `[grad_dst]` and returns `[grad_src, grad_filter]`. It
/// owns clones of `src` and `filter`, which keeps their storage alive.
pub fn group_local_backward(
    dispatcher: &Dispatcher,
    forward: &GroupLocalForward,
    src: &ValueRef,
    filter: &ValueRef,
) -> Result<GenericFunction> {
    let shape = {
        let src_t = src.cast::<DeviceValue>()?;
        let filter_t = filter.cast::<DeviceValue>()?;
        forward.shape(&src_t.layout(), &filter_t.layout())?
    };
    let (bwd_data, bwd_filter) = forward.backward_ops(&shape);
    let name = format!("{}Backward", forward.name());
    let label = name.clone();
    let dispatcher = dispatcher.clone();
    let src = src.clone();
    let filter = filter.clone();

    Ok(GenericFunction::forwarding(name, move |grads: &[ValueRef]| {
        check_arity(&label, grads, 1)?;
        let diff = grads[0].clone();
        let mut out = dispatcher.try_apply(&bwd_data, &[filter.clone(), diff.clone()])?;
        out.extend(dispatcher.try_apply(&bwd_filter, &[src.clone(), diff])?);
        Ok(out)
    }))
}
