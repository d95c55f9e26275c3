// Dispatcher — Applying operators to value lists
//
// The dispatcher is the glue between the value algebra and the operator
// boundary. For one call it:
//
//   1. forwards ErrorValue inputs untouched (the operator never runs)
//   2. checks arity and casts every input to a DeviceValue
//   3. rehydrates each tensor with as_nd, which enforces shape/storage consistency
//   4. deduces output layouts, allocates outputs and workspace, runs exec
//   5. freezes the outputs and wraps them as DeviceValues
//
// Any failure in 2-5 comes back as a single-ErrorValue list; apply() never
// panics and never returns a Rust error. try_apply() is the same pipeline
// with the Result left in place, for callers composing dispatches.

use std::sync::Arc;

use log::{debug, warn};

use shrew_dnn::{execute, Operator};
use shrew_value::{
    check_arity, default_allocator, forward_errors, Allocator, CompNode, DeviceValue,
    GenericFunction, PrimitiveValue, Result, ValueRef, ValueRefList,
};

// Configuration

/// Where and with what a [`Dispatcher`] allocates.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Allocator for outputs and workspaces (default: the process-wide system allocator).
    pub allocator: Arc<dyn Allocator>,
    /// Placement of outputs. `None` follows the first input's comp node.
    pub comp_node: Option<CompNode>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            allocator: default_allocator(),
            comp_node: None,
        }
    }
}

impl DispatcherConfig {
    /// Set the allocator.
    pub fn with_allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Pin outputs to one comp node.
    pub fn with_comp_node(mut self, comp_node: CompNode) -> Self {
        self.comp_node = Some(comp_node);
        self
    }
}

// Dispatcher

/// Runs [`Operator`]s over value lists.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Apply `op`, reporting every failure as a single `ErrorValue`.
    pub fn apply(&self, op: &dyn Operator, inputs: &[ValueRef]) -> ValueRefList {
        if let Some(errors) = forward_errors(inputs) {
            debug!("{}: forwarding {} error input(s)", op.name(), errors.len());
            return errors;
        }
        match self.try_apply(op, inputs) {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!("{} failed: {}", op.name(), err);
                ValueRefList::error(err)
            }
        }
    }

    /// Apply `op`, returning the first failure as an `Err`.
    pub fn try_apply(&self, op: &dyn Operator, inputs: &[ValueRef]) -> Result<ValueRefList> {
        check_arity(op.name(), inputs, op.arity())?;
        let tensors = inputs
            .iter()
            .map(|v| v.cast::<DeviceValue>().and_then(|t| t.as_nd(false)))
            .collect::<Result<Vec<_>>>()?;
        let comp_node = match self.config.comp_node {
            Some(cn) => cn,
            None => tensors
                .first()
                .map_or_else(CompNode::default, |t| t.storage().comp_node()),
        };
        let outputs = execute(op, &self.config.allocator, comp_node, &tensors)?;
        Ok(outputs.into_iter().map(|t| DeviceValue::make(t)).collect())
    }

    /// Expose `op` as a first-class function bound to this dispatcher.
    pub fn as_function(&self, op: Arc<dyn Operator>) -> GenericFunction {
        let dispatcher = self.clone();
        let name = op.name().to_string();
        GenericFunction::new(name, move |inputs: &[ValueRef]| {
            dispatcher.apply(op.as_ref(), inputs)
        })
    }
}
