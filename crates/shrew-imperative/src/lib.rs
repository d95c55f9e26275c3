//! # shrew-imperative
//!
//! Eager execution over the Shrew value algebra.
//!
//! - [`Dispatcher`]: apply an [`Operator`](shrew_dnn::Operator) to a value list;
//!   every failure comes back as an `ErrorValue`
//! - [`run_batch`] / [`par_run_batch`]: call a function over many inputs and
//!   collect every failure instead of stopping at the first
//! - [`Trace`]: record a straight-line program once, replay it over fresh
//!   inputs, inspect failures afterwards
//! - [`GradContext`]: backward closures as `FunctionValue`s that own their
//!   saved tensors

pub mod batch;
pub mod dispatcher;
pub mod grad;
pub mod trace;

pub use batch::{par_run_batch, run_batch, BatchFailure, BatchReport};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use grad::{group_local_backward, BackwardEntry, GradContext};
pub use trace::{Replay, Slot, StepFailure, Trace};
